//! Dialect-aware SQL emission.
//!
//! A [`Visitor`] turns an [`crate::ast`] statement into `(sql, args)`.
//! Nearly all emission logic is dialect-independent — identifiers are
//! never quoted and the `WHERE 1=1` anchor/argument-ordering rules are
//! identical everywhere — so the trait carries default method bodies
//! and each dialect only overrides the one or two points where it
//! actually differs
//! (`DISTINCT ON`, and placeholder rebinding via [`crate::identifier::
//! rebind`]).

mod mysql;
mod postgres;
mod sqlite;

pub use mysql::Mysql;
pub use postgres::Postgres;
pub use sqlite::Sqlite;

use crate::ast::{Delete, GroupBy, Insert, Select, Update, Value};
use crate::identifier::{rebind, Dialect};

pub trait Visitor: Send + Sync {
    fn dialect(&self) -> Dialect;

    fn supports_distinct_on(&self) -> bool {
        matches!(self.dialect(), Dialect::Postgres)
    }

    fn rebind(&self, sql: &str) -> String {
        rebind(sql, self.dialect())
    }

    fn render_select(&self, select: &Select) -> (String, Vec<Value>) {
        let mut sql = String::new();
        let mut args: Vec<Value> = Vec::new();

        if !select.ctes.is_empty() {
            sql.push_str("WITH ");
            for (i, cte) in select.ctes.iter().enumerate() {
                if i > 0 {
                    sql.push_str(", ");
                }
                sql.push_str(&cte.name);
                sql.push_str(" AS (");
                sql.push_str(&cte.body);
                sql.push(')');
                args.extend(cte.body_args.iter().cloned());
            }
            sql.push(' ');
        }

        let (body, body_args) = render_select_body(select, self.supports_distinct_on());
        sql.push_str(&body);
        args.extend(body_args);

        (self.rebind(&sql), args)
    }

    fn render_insert(&self, insert: &Insert) -> (String, Vec<Value>) {
        let mut sql = String::new();
        let mut args = Vec::new();

        sql.push_str("INSERT INTO ");
        sql.push_str(&insert.table);
        sql.push_str(" (");
        sql.push_str(&insert.columns.join(", "));
        sql.push_str(") VALUES ");

        let placeholders_per_row = format!("({})", vec!["?"; insert.columns.len()].join(", "));
        let rows: Vec<&str> = insert.rows.iter().map(|_| placeholders_per_row.as_str()).collect();
        sql.push_str(&rows.join(", "));

        for row in &insert.rows {
            args.extend(row.iter().cloned());
        }

        if let Some(returning) = &insert.returning {
            sql.push_str(" RETURNING ");
            sql.push_str(returning);
        }

        (self.rebind(&sql), args)
    }

    fn render_update(&self, update: &Update) -> (String, Vec<Value>) {
        let mut sql = String::new();
        let mut args = Vec::new();

        sql.push_str("UPDATE ");
        sql.push_str(&update.table);
        sql.push_str(" SET ");

        if let Some((raw, raw_args)) = &update.raw_assignment {
            sql.push_str(raw);
            args.extend(raw_args.iter().cloned());
        } else {
            let parts: Vec<String> = update.assignments.iter().map(|(c, _)| format!("{c} = ?")).collect();
            sql.push_str(&parts.join(", "));
            args.extend(update.assignments.iter().map(|(_, v)| v.clone()));
        }

        render_wheres(&mut sql, &update.wheres);
        args.extend(update.args.iter().cloned());

        (self.rebind(&sql), args)
    }

    fn render_delete(&self, delete: &Delete) -> (String, Vec<Value>) {
        let mut sql = String::new();
        let mut args = Vec::new();

        sql.push_str("DELETE FROM ");
        sql.push_str(&delete.table);

        render_wheres(&mut sql, &delete.wheres);
        args.extend(delete.args.iter().cloned());

        (self.rebind(&sql), args)
    }
}

/// The `SELECT ... FROM ... WHERE ...` core shared by the top-level
/// statement and by a CTE sub-builder's body (which never carries its
/// own CTE prefix or gets placeholder-rebound independently — the
/// enclosing statement rebinds once over the whole composed string).
fn render_select_body(select: &Select, distinct_on_supported: bool) -> (String, Vec<Value>) {
    let mut sql = String::new();
    let mut args: Vec<Value> = Vec::new();

    sql.push_str("SELECT ");
    if select.distinct && !select.distinct_on.is_empty() && distinct_on_supported {
        sql.push_str("DISTINCT ON (");
        sql.push_str(&select.distinct_on.join(", "));
        sql.push_str(") ");
    } else if select.distinct {
        sql.push_str("DISTINCT ");
    }

    if select.columns.is_empty() {
        sql.push('*');
    } else {
        sql.push_str(&select.columns.join(", "));
    }

    sql.push_str(" FROM ");
    sql.push_str(&select.table);

    render_wheres(&mut sql, &select.wheres);
    args.extend(select.args.iter().cloned());

    if !select.group_bys.is_empty() {
        sql.push_str(" GROUP BY ");
        sql.push_str(&render_group_bys(&select.group_bys));
    }

    if !select.havings.is_empty() {
        sql.push_str(" HAVING ");
        let parts: Vec<&str> = select.havings.iter().map(|f| f.text.as_str()).collect();
        sql.push_str(&parts.join(" AND "));
        args.extend(select.having_args.iter().cloned());
    }

    if !select.order_bys.is_empty() {
        sql.push_str(" ORDER BY ");
        let parts: Vec<String> = select
            .order_bys
            .iter()
            .map(|o| format!("{} {}", o.column, o.direction.as_sql()))
            .collect();
        sql.push_str(&parts.join(", "));
    }

    if let Some(mode) = select.lock_mode {
        sql.push_str(" FOR ");
        sql.push_str(mode.as_sql());
    }

    if let Some(limit) = select.limit {
        sql.push_str(" LIMIT ");
        sql.push_str(&limit.to_string());
    }

    if let Some(offset) = select.offset {
        sql.push_str(" OFFSET ");
        sql.push_str(&offset.to_string());
    }

    (sql, args)
}

/// Render a sub-builder's `Select` as a bare CTE body: `?`
/// placeholders, no dialect-specific `DISTINCT ON`, no prefix — the
/// caller embeds this text inside its own `WITH name AS (...)` and
/// rebinds the whole statement once.
pub fn render_cte_body(select: &Select) -> (String, Vec<Value>) {
    render_select_body(select, false)
}

/// Emit the `WHERE 1=1 <fragments>` anchor shape. The double space
/// after `1=1` when a fragment follows is a deliberately stable shape
/// callers can assert against verbatim in tests.
fn render_wheres(sql: &mut String, wheres: &[crate::ast::Fragment]) {
    if wheres.is_empty() {
        return;
    }
    sql.push_str(" WHERE 1=1 ");
    for fragment in wheres {
        if let Some(joiner) = fragment.joiner {
            sql.push_str(joiner.as_sql());
            sql.push(' ');
        } else {
            sql.push_str("AND ");
        }
        sql.push_str(&fragment.text);
        sql.push(' ');
    }
    // Trim the single trailing space added by the loop above so callers
    // get a clean concatenation point for the next clause.
    if sql.ends_with(' ') {
        sql.pop();
    }
}

fn render_group_bys(group_bys: &[GroupBy]) -> String {
    let parts: Vec<String> = group_bys
        .iter()
        .map(|g| match g {
            GroupBy::Plain(cols) => cols.join(", "),
            GroupBy::Rollup(cols) => format!("ROLLUP ({})", cols.join(", ")),
            GroupBy::Cube(cols) => format!("CUBE ({})", cols.join(", ")),
            GroupBy::GroupingSets(sets) => {
                let rendered: Vec<String> = sets
                    .iter()
                    .map(|set| format!("({})", set.join(", ")))
                    .collect();
                format!("GROUPING SETS ({})", rendered.join(", "))
            }
        })
        .collect();
    parts.join(", ")
}

/// Build the visitor for a dialect.
pub fn for_dialect(dialect: Dialect) -> Box<dyn Visitor> {
    match dialect {
        Dialect::Postgres => Box::new(Postgres),
        Dialect::Mysql => Box::new(Mysql),
        Dialect::Sqlite => Box::new(Sqlite),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Fragment, Joiner};

    #[test]
    fn basic_select_binds_one_where_fragment() {
        let mut select = Select::from_table("test_models");
        select.wheres.push(Fragment { joiner: None, text: "(id = ?)".into() });
        select.args.push(Value::int32(1));

        let (sql, args) = Postgres.render_select(&select);
        assert_eq!(sql, "SELECT * FROM test_models WHERE 1=1  AND (id = $1)");
        assert_eq!(args, vec![Value::int32(1)]);
    }

    #[test]
    fn lock_for_update_appends_for_update() {
        let mut select = Select::from_table("test_models");
        select.wheres.push(Fragment { joiner: None, text: "(id = ?)".into() });
        select.args.push(Value::int32(1));
        select.lock_mode = Some(crate::ast::LockMode::Update);

        let (sql, _) = Postgres.render_select(&select);
        assert_eq!(sql, "SELECT * FROM test_models WHERE 1=1  AND (id = $1) FOR UPDATE");
    }

    #[test]
    fn grouping_sets_render_parenthesized_tuples() {
        let mut select = Select::from_table("test_models");
        select.columns = vec!["brand".into(), "size".into(), "SUM(sales)".into()];
        select.group_bys.push(GroupBy::GroupingSets(vec![
            vec!["brand".into()],
            vec!["size".into()],
            vec![],
        ]));

        let (sql, _) = Postgres.render_select(&select);
        assert_eq!(
            sql,
            "SELECT brand, size, SUM(sales) FROM test_models GROUP BY GROUPING SETS ((brand), (size), ())"
        );
    }

    #[test]
    fn second_or_fragment_uses_or_joiner() {
        let mut select = Select::from_table("t");
        select.wheres.push(Fragment { joiner: None, text: "(a = ?)".into() });
        select.wheres.push(Fragment { joiner: Some(Joiner::Or), text: "(b = ?)".into() });
        select.args = vec![Value::int32(1), Value::int32(2)];

        let (sql, _) = Postgres.render_select(&select);
        assert_eq!(sql, "SELECT * FROM t WHERE 1=1  AND (a = $1) OR (b = $2)");
    }

    #[test]
    fn mysql_and_sqlite_leave_placeholders_untouched() {
        let mut select = Select::from_table("t");
        select.wheres.push(Fragment { joiner: None, text: "(id = ?)".into() });
        select.args.push(Value::int32(1));

        assert_eq!(Mysql.render_select(&select).0, "SELECT * FROM t WHERE 1=1  AND (id = ?)");
        assert_eq!(Sqlite.render_select(&select).0, "SELECT * FROM t WHERE 1=1  AND (id = ?)");
    }

    #[test]
    fn distinct_on_is_postgres_only() {
        let mut select = Select::from_table("t");
        select.distinct = true;
        select.distinct_on = vec!["a".into()];

        assert!(Postgres.render_select(&select).0.starts_with("SELECT DISTINCT ON (a)"));
        assert!(Mysql.render_select(&select).0.starts_with("SELECT DISTINCT "));
    }

    #[test]
    fn cte_renders_as_a_leading_with_clause() {
        let mut select = Select::from_table("test_models");
        select.ctes.push(crate::ast::Cte {
            name: "adults".into(),
            body: "SELECT id FROM test_models WHERE user_age >= ?".into(),
            body_args: vec![Value::int32(18)],
        });
        select.wheres.push(Fragment { joiner: None, text: "(id IN (SELECT id FROM adults))".into() });

        let (sql, args) = Postgres.render_select(&select);
        assert_eq!(
            sql,
            "WITH adults AS (SELECT id FROM test_models WHERE user_age >= $1) SELECT * FROM test_models WHERE 1=1  AND (id IN (SELECT id FROM adults))"
        );
        assert_eq!(args, vec![Value::int32(18)]);
    }

    #[test]
    fn render_cte_body_skips_dialect_specific_distinct_on() {
        let mut select = Select::from_table("test_models");
        select.distinct = true;
        select.distinct_on = vec!["id".into()];

        let (body, _) = render_cte_body(&select);
        assert_eq!(body, "SELECT DISTINCT * FROM test_models");
    }

    #[test]
    fn insert_renders_returning_and_skips_autoincrement_column() {
        let insert = Insert::single_into("test_models").value("name", "hi");
        let (sql, args) = Postgres.render_insert(&insert);
        assert_eq!(sql, "INSERT INTO test_models (name) VALUES ($1)");
        assert_eq!(args, vec![Value::text("hi")]);
    }
}
