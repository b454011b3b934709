//! Filter predicate construction: the single code path shared by candidate
//! search and the count preview, so the two can never disagree about what
//! matches.

use dealscout_common::{DealScoutError, FilterCriteria};
use sqlx::{Postgres, QueryBuilder};

/// Reject free-form fragments carrying statement terminators or comment
/// tokens. Callers are expected to supply pre-vetted fragments only.
pub fn validate_clause(clause: &str) -> Result<(), DealScoutError> {
    if clause.contains(';') || clause.contains("--") {
        return Err(DealScoutError::InvalidClause(clause.to_string()));
    }
    Ok(())
}

/// Append the WHERE clause for `criteria` to a query against `companies`.
///
/// Threshold skip rules: revenue applies only when positive, margin and
/// growth only when set, industry membership only when the code list is
/// non-empty. Free-form fragments are validated and ANDed in parentheses.
pub fn push_criteria<'a>(
    qb: &mut QueryBuilder<'a, Postgres>,
    criteria: &'a FilterCriteria,
) -> Result<(), DealScoutError> {
    qb.push(" WHERE 1 = 1");

    if criteria.min_revenue > 0 {
        qb.push(" AND revenue >= ").push_bind(criteria.min_revenue);
    }
    if let Some(margin) = criteria.min_margin {
        qb.push(" AND operating_margin >= ").push_bind(margin);
    }
    if let Some(growth) = criteria.min_growth {
        qb.push(" AND revenue_growth >= ").push_bind(growth);
    }
    if !criteria.industry_codes.is_empty() {
        qb.push(" AND industry_code = ANY(")
            .push_bind(&criteria.industry_codes)
            .push(")");
    }
    for clause in &criteria.extra_clauses {
        validate_clause(clause)?;
        qb.push(" AND (").push(clause.as_str()).push(")");
    }

    Ok(())
}

/// Deterministic ranking and the hard result cap. The trailing key makes the
/// ordering total: identical criteria against an unchanged snapshot always
/// return the identical sequence.
pub fn push_order_and_limit(qb: &mut QueryBuilder<'_, Postgres>, max_results: i64) {
    qb.push(" ORDER BY revenue_growth DESC NULLS LAST, revenue DESC, org_number ASC");
    qb.push(" LIMIT ").push_bind(max_results);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sql_for(criteria: &FilterCriteria) -> String {
        let mut qb = QueryBuilder::new("SELECT org_number FROM companies");
        push_criteria(&mut qb, criteria).unwrap();
        push_order_and_limit(&mut qb, criteria.max_results);
        qb.sql().to_string()
    }

    #[test]
    fn all_thresholds_produce_clauses() {
        let criteria = FilterCriteria {
            min_revenue: 10_000_000,
            min_margin: Some(0.05),
            min_growth: Some(0.10),
            industry_codes: vec!["62.010".to_string()],
            extra_clauses: vec!["employees >= 10".to_string()],
            max_results: 50,
        };
        let sql = sql_for(&criteria);

        assert!(sql.contains("revenue >="));
        assert!(sql.contains("operating_margin >="));
        assert!(sql.contains("revenue_growth >="));
        assert!(sql.contains("industry_code = ANY("));
        assert!(sql.contains("(employees >= 10)"));
        assert!(sql.contains("LIMIT"));
    }

    #[test]
    fn unset_thresholds_are_skipped() {
        let criteria = FilterCriteria {
            min_revenue: 0,
            min_margin: None,
            min_growth: None,
            industry_codes: Vec::new(),
            extra_clauses: Vec::new(),
            max_results: 100,
        };
        let sql = sql_for(&criteria);

        assert!(!sql.contains("revenue >="));
        assert!(!sql.contains("operating_margin"));
        assert!(!sql.contains("revenue_growth >="));
        assert!(!sql.contains("industry_code"));
        // Ranking still applies even with no predicate
        assert!(sql.contains("ORDER BY revenue_growth DESC NULLS LAST, revenue DESC"));
    }

    #[test]
    fn negative_revenue_threshold_is_skipped() {
        let criteria = FilterCriteria {
            min_revenue: -1,
            ..FilterCriteria::default()
        };
        assert!(!sql_for(&criteria).contains("revenue >="));
    }

    #[test]
    fn statement_terminator_fragment_is_rejected() {
        let criteria = FilterCriteria {
            extra_clauses: vec!["employees >= 10; DROP TABLE companies".to_string()],
            ..FilterCriteria::default()
        };
        let mut qb = QueryBuilder::new("SELECT org_number FROM companies");
        let err = push_criteria(&mut qb, &criteria).unwrap_err();
        assert!(matches!(err, DealScoutError::InvalidClause(_)));
    }

    #[test]
    fn comment_token_fragment_is_rejected() {
        assert!(validate_clause("revenue > 0 -- sneaky").is_err());
        assert!(validate_clause("employees >= 10").is_ok());
    }

    #[test]
    fn search_and_count_share_the_predicate() {
        let criteria = FilterCriteria {
            min_revenue: 5_000_000,
            min_growth: Some(0.2),
            ..FilterCriteria::default()
        };

        let mut search = QueryBuilder::new("SELECT org_number FROM companies");
        push_criteria(&mut search, &criteria).unwrap();
        let mut count = QueryBuilder::new("SELECT COUNT(*) FROM companies");
        push_criteria(&mut count, &criteria).unwrap();

        let search_where = search.sql().split_once(" WHERE ").unwrap().1.to_string();
        let count_where = count.sql().split_once(" WHERE ").unwrap().1.to_string();
        assert_eq!(search_where, count_where);
    }
}
