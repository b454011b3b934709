use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;

/// Types that can be requested as a tool-forced structured response.
///
/// Implemented automatically for anything that is `JsonSchema +
/// DeserializeOwned`. The derived schema is post-processed into the strict
/// form the tool-use API validates reliably: every object closed with
/// `additionalProperties: false`, every property required, and all
/// `$ref`s inlined.
pub trait StructuredOutput: JsonSchema + DeserializeOwned {
    fn tool_schema() -> serde_json::Value {
        let schema = schema_for!(Self);
        let mut value = serde_json::to_value(schema).unwrap_or_default();

        let definitions = value
            .as_object()
            .and_then(|map| map.get("definitions").cloned());
        if let Some(defs) = definitions {
            inline_definitions(&mut value, &defs);
        }
        close_objects(&mut value);

        if let serde_json::Value::Object(map) = &mut value {
            map.remove("definitions");
            map.remove("$schema");
        }

        value
    }
}

impl<T: JsonSchema + DeserializeOwned> StructuredOutput for T {}

/// Mark every object schema closed and list all of its properties as
/// required (nullable fields stay nullable through their type).
fn close_objects(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            if map.get("type") == Some(&serde_json::Value::String("object".into())) {
                map.insert("additionalProperties".into(), serde_json::Value::Bool(false));
                if let Some(serde_json::Value::Object(props)) = map.get("properties") {
                    let keys: Vec<serde_json::Value> = props
                        .keys()
                        .map(|k| serde_json::Value::String(k.clone()))
                        .collect();
                    map.insert("required".into(), serde_json::Value::Array(keys));
                }
            }
            for (_, v) in map.iter_mut() {
                close_objects(v);
            }
        }
        serde_json::Value::Array(arr) => {
            for item in arr.iter_mut() {
                close_objects(item);
            }
        }
        _ => {}
    }
}

/// Replace `#/definitions/...` references with the referenced schema and
/// collapse single-element `allOf` wrappers schemars emits around them.
fn inline_definitions(value: &mut serde_json::Value, definitions: &serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::String(ref_path)) = map.get("$ref").cloned() {
                if let Some(name) = ref_path.strip_prefix("#/definitions/") {
                    if let Some(def) = definitions.get(name) {
                        *value = def.clone();
                        inline_definitions(value, definitions);
                        return;
                    }
                }
            }

            if let Some(serde_json::Value::Array(all_of)) = map.get("allOf").cloned() {
                if all_of.len() == 1 {
                    *value = all_of.into_iter().next().unwrap();
                    inline_definitions(value, definitions);
                    return;
                }
            }

            for (_, v) in map.iter_mut() {
                inline_definitions(v, definitions);
            }
        }
        serde_json::Value::Array(arr) => {
            for item in arr.iter_mut() {
                inline_definitions(item, definitions);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemars::JsonSchema;
    use serde::Deserialize;

    #[derive(Deserialize, JsonSchema)]
    struct Verdict {
        score: i32,
        rationale: Option<String>,
    }

    #[derive(Deserialize, JsonSchema)]
    struct Report {
        verdicts: Vec<Verdict>,
        summary: String,
    }

    #[test]
    fn objects_are_closed_and_fully_required() {
        let schema = Verdict::tool_schema();
        let obj = schema.as_object().unwrap();

        assert_eq!(
            obj.get("additionalProperties"),
            Some(&serde_json::Value::Bool(false))
        );

        let required: Vec<&str> = obj
            .get("required")
            .and_then(|r| r.as_array())
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert!(required.contains(&"score"));
        assert!(required.contains(&"rationale"));
    }

    #[test]
    fn nested_definitions_are_inlined() {
        let schema = Report::tool_schema();
        let obj = schema.as_object().unwrap();

        assert!(!obj.contains_key("definitions"));
        assert!(!obj.contains_key("$schema"));

        let rendered = serde_json::to_string(&schema).unwrap();
        assert!(!rendered.contains("$ref"));
    }
}
