//! Assembles one parameterized SELECT from guarded clause fragments.

use crate::sql::guard::{contains_keywords, strip_comments, GuardError};
use serde::Serialize;

/// Clause fragments of a method's query, after token interpolation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Clauses {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub with_cte_identifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub with_cte_expression: Option<String>,
    pub select: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    pub where_: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub having: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
    /// `(prefix, uri)` in document order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub xml_namespaces: Vec<(String, String)>,
}

/// Keyword sets each clause must not contain at depth 0, with the message reported.
const CLAUSE_GUARDS: [(&[&str], &str); 6] = [
    (
        &["from", "into", "where", "group", "having", "order", "for"],
        "SELECT clause cannot contain FROM, INTO, WHERE, GROUP BY, HAVING, ORDER BY, or FOR",
    ),
    (
        &["where", "group", "having", "order", "for"],
        "FROM clause cannot contain WHERE, GROUP BY, HAVING, ORDER BY, or FOR",
    ),
    (
        &["group", "having", "order", "for"],
        "WHERE clause cannot contain GROUP BY, HAVING, ORDER BY, or FOR",
    ),
    (&["having", "order", "for"], "GROUP BY clause cannot contain HAVING, ORDER BY, or FOR"),
    (&["order", "for"], "HAVING clause cannot contain ORDER BY or FOR"),
    (&["for"], "ORDER BY clause cannot contain FOR"),
];

fn strip(clause: &Option<String>) -> Result<Option<String>, GuardError> {
    clause.as_deref().map(strip_comments).transpose()
}

fn non_empty(clause: &Option<String>) -> Option<&str> {
    clause.as_deref().filter(|s| !s.is_empty())
}

/// Guard and assemble the clauses. Returns the SQL text, or every error found.
pub fn compile(clauses: &Clauses) -> Result<String, Vec<String>> {
    if non_empty(&clauses.select).is_none() {
        return Err(vec!["A `select` clause is required".to_string()]);
    }

    let stripped = (|| -> Result<_, GuardError> {
        Ok((
            strip(&clauses.with_cte_identifier)?,
            strip(&clauses.with_cte_expression)?,
            strip(&clauses.select)?,
            strip(&clauses.from)?,
            strip(&clauses.where_)?,
            strip(&clauses.group_by)?,
            strip(&clauses.having)?,
            strip(&clauses.order_by)?,
        ))
    })();
    let (cte_id, cte_expr, select, from, where_, group_by, having, order_by) =
        stripped.map_err(|e| vec![e.to_string()])?;

    let mut errors = Vec::new();
    let guarded = [&select, &from, &where_, &group_by, &having, &order_by];
    for (clause, (keywords, message)) in guarded.iter().zip(CLAUSE_GUARDS.iter()) {
        let Some(text) = clause.as_deref() else { continue };
        match contains_keywords(text, keywords) {
            Ok(true) => errors.push(message.to_string()),
            Ok(false) => {}
            Err(e) => {
                errors.push(e.to_string());
                break;
            }
        }
    }
    if !errors.is_empty() {
        return Err(errors);
    }

    let mut sql = String::with_capacity(
        [&cte_id, &cte_expr, &select, &from, &where_, &group_by, &having, &order_by]
            .iter()
            .map(|c| c.as_ref().map_or(0, |s| s.len()))
            .sum::<usize>()
            + 64,
    );

    let mut did_semi = false;
    if !clauses.xml_namespaces.is_empty() {
        did_semi = true;
        sql.push_str(";WITH XMLNAMESPACES (\r\n");
        let entries: Vec<String> = clauses
            .xml_namespaces
            .iter()
            .map(|(prefix, uri)| format!("  '{}' AS {}", uri.replace('\'', "''"), prefix))
            .collect();
        sql.push_str(&entries.join(",\r\n"));
        sql.push_str("\r\n)\r\n");
    }
    if let (Some(id), Some(expr)) = (non_empty(&cte_id), non_empty(&cte_expr)) {
        if !did_semi {
            sql.push(';');
        }
        sql.push_str(&format!("WITH {} AS (\r\n{}\r\n)\r\n", id, expr));
    }
    sql.push_str("SELECT ");
    sql.push_str(select.as_deref().unwrap_or_default());
    for (keyword, clause) in [
        ("FROM", &from),
        ("WHERE", &where_),
        ("GROUP BY", &group_by),
        ("HAVING", &having),
        ("ORDER BY", &order_by),
    ] {
        if let Some(text) = non_empty(clause) {
            sql.push_str("\r\n");
            sql.push_str(keyword);
            sql.push(' ');
            sql.push_str(text);
        }
    }
    Ok(sql)
}

/// The batch sent to the server: one `DECLARE` per parameter bound from the positional
/// driver parameter `@P{n}` (1-based, in `declarations` order), the isolation level, then
/// the compiled query.
pub fn execution_batch(declarations: &[(&str, String)], sql: &str) -> String {
    let mut batch = String::with_capacity(sql.len() + 64 + declarations.len() * 48);
    for (i, (sql_name, declared_type)) in declarations.iter().enumerate() {
        batch.push_str(&format!("DECLARE {} {} = @P{};\r\n", sql_name, declared_type, i + 1));
    }
    batch.push_str("SET TRANSACTION ISOLATION LEVEL READ UNCOMMITTED;\r\n");
    batch.push_str(sql);
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn clauses(select: &str) -> Clauses {
        Clauses {
            select: Some(select.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn assembles_clauses_in_order() {
        let c = Clauses {
            from: Some("dbo.Sales s".into()),
            where_: Some("s.Year = @year -- filter".into()),
            group_by: Some("s.Region".into()),
            having: Some("COUNT(s.Id) > 1".into()),
            order_by: Some("s.Region".into()),
            ..clauses("s.Region, COUNT(s.Id) AS n")
        };
        assert_eq!(
            compile(&c).unwrap(),
            "SELECT s.Region, COUNT(s.Id) AS n\r\nFROM dbo.Sales s\r\nWHERE s.Year = @year \r\nGROUP BY s.Region\r\nHAVING COUNT(s.Id) > 1\r\nORDER BY s.Region"
        );
    }

    #[test]
    fn xml_namespaces_and_cte_share_one_semicolon() {
        let c = Clauses {
            with_cte_identifier: Some("recent".into()),
            with_cte_expression: Some("SELECT Id FROM dbo.T WHERE Id > 10".into()),
            xml_namespaces: vec![
                ("a".into(), "urn:a".into()),
                ("b".into(), "urn:it's".into()),
            ],
            from: Some("recent".into()),
            ..clauses("Id")
        };
        assert_eq!(
            compile(&c).unwrap(),
            ";WITH XMLNAMESPACES (\r\n  'urn:a' AS a,\r\n  'urn:it''s' AS b\r\n)\r\nWITH recent AS (\r\nSELECT Id FROM dbo.T WHERE Id > 10\r\n)\r\nSELECT Id\r\nFROM recent"
        );

        let c = Clauses {
            with_cte_identifier: Some("r".into()),
            with_cte_expression: Some("SELECT 1 AS x".into()),
            ..clauses("x")
        };
        assert_eq!(compile(&c).unwrap(), ";WITH r AS (\r\nSELECT 1 AS x\r\n)\r\nSELECT x");
    }

    #[test]
    fn select_is_required() {
        assert_eq!(compile(&Clauses::default()), Err(vec!["A `select` clause is required".to_string()]));
        assert!(compile(&clauses("")).is_err());
    }

    #[test]
    fn semicolon_in_where_fails_compilation() {
        let c = Clauses {
            where_: Some("1=1; DROP TABLE x".into()),
            ..clauses("a")
        };
        assert_eq!(
            compile(&c),
            Err(vec!["No semicolons are allowed in any query clause".to_string()])
        );
    }

    #[test]
    fn keyword_leaks_are_reported_per_clause() {
        let c = Clauses {
            from: Some("t WHERE 1=1".into()),
            where_: Some("x = 1 ORDER BY y".into()),
            ..clauses("a FROM t")
        };
        assert_eq!(
            compile(&c).unwrap_err(),
            vec![
                "SELECT clause cannot contain FROM, INTO, WHERE, GROUP BY, HAVING, ORDER BY, or FOR".to_string(),
                "FROM clause cannot contain WHERE, GROUP BY, HAVING, ORDER BY, or FOR".to_string(),
                "WHERE clause cannot contain GROUP BY, HAVING, ORDER BY, or FOR".to_string(),
            ]
        );
    }

    #[test]
    fn subqueries_pass_the_guard() {
        let c = Clauses {
            where_: Some("EXISTS (SELECT 1 FROM u WHERE u.Id = t.Id ORDER BY u.Id)".into()),
            from: Some("t".into()),
            ..clauses("(SELECT 1 WHERE 1 = 1) AS one")
        };
        assert!(compile(&c).is_ok());
    }

    #[test]
    fn unbalanced_parentheses_fail() {
        assert_eq!(compile(&clauses("COUNT(a")).unwrap_err(), vec!["1 parenthesis left unclosed".to_string()]);
    }

    #[test]
    fn batch_declares_parameters_before_isolation_level() {
        let batch = execution_batch(&[("@year", "int".to_string()), ("@name", "nvarchar(max)".to_string())], "SELECT 1");
        assert_eq!(
            batch,
            "DECLARE @year int = @P1;\r\nDECLARE @name nvarchar(max) = @P2;\r\nSET TRANSACTION ISOLATION LEVEL READ UNCOMMITTED;\r\nSELECT 1"
        );
    }
}
