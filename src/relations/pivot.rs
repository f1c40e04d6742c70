//! Pivot mutation helpers for `BelongsToMany` relations, in the
//! Eloquent-alike `attach`/`detach`/`sync` idiom rather than left as
//! relation-planner stubs.

use crate::ast::{in_clause, Value};
use crate::connector::Queryable;
use crate::error::{Error, ErrorKind};
use crate::identifier::validate_identifier;
use crate::schema::RelationDescriptor;
use crate::visitor;
use indexmap::IndexMap;
use itertools::Itertools;

fn pivot_parts(descriptor: &RelationDescriptor) -> crate::Result<(&str, &str, &str)> {
    match descriptor {
        RelationDescriptor::BelongsToMany { pivot_table, foreign_key, related_key, .. } => {
            Ok((pivot_table.as_str(), foreign_key.as_str(), related_key.as_str()))
        }
        _ => Err(Error::new(ErrorKind::InvalidRelationConfig("pivot mutations require a BelongsToMany relation".into()))),
    }
}

/// `attach(parent, relation, ids, pivot_data)`: INSERT one row per id.
/// Additional pivot columns are the union of keys across `pivot_data`
/// (missing keys for a given id bind `NULL`); each pivot column name
/// is identifier-validated before use.
pub async fn attach(
    conn: &dyn Queryable,
    descriptor: &RelationDescriptor,
    parent_id: &Value,
    related_ids: &[Value],
    pivot_data: &[IndexMap<String, Value>],
) -> crate::Result<()> {
    let (pivot_table, foreign_key, related_key) = pivot_parts(descriptor)?;
    if related_ids.is_empty() {
        return Ok(());
    }

    let mut extra_columns: Vec<String> = pivot_data.iter().flat_map(|m| m.keys().cloned()).unique().collect();
    for col in &extra_columns {
        validate_identifier(col)?;
    }
    extra_columns.sort();

    let mut columns = vec![foreign_key.to_string(), related_key.to_string()];
    columns.extend(extra_columns.iter().cloned());

    let mut rows: Vec<Vec<Value>> = Vec::with_capacity(related_ids.len());
    for (i, related_id) in related_ids.iter().enumerate() {
        let mut row = vec![parent_id.clone(), related_id.clone()];
        let data = pivot_data.get(i);
        for col in &extra_columns {
            row.push(data.and_then(|d| d.get(col)).cloned().unwrap_or(Value::null_text()));
        }
        rows.push(row);
    }

    let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));
    let sql = format!(
        "INSERT INTO {pivot_table} ({}) VALUES {}",
        columns.join(", "),
        vec![placeholders.as_str(); rows.len()].join(", ")
    );
    let args: Vec<Value> = rows.into_iter().flatten().collect();

    let visitor = visitor::for_dialect(conn.dialect());
    let sql = visitor.rebind(&sql);
    tracing::trace!(target: "entity_query::relations::pivot", sql = %sql, "attach");
    conn.execute(&sql, &args).await?;
    Ok(())
}

/// `detach(parent, relation, ids)`: delete pivot rows for `parent_id`,
/// optionally restricted to `related_ids`. An empty `related_ids`
/// detaches every row for that parent.
pub async fn detach(conn: &dyn Queryable, descriptor: &RelationDescriptor, parent_id: &Value, related_ids: &[Value]) -> crate::Result<()> {
    let (pivot_table, foreign_key, related_key) = pivot_parts(descriptor)?;

    let mut sql = format!("DELETE FROM {pivot_table} WHERE {foreign_key} = ?");
    let mut args = vec![parent_id.clone()];

    if !related_ids.is_empty() {
        let (in_text, in_args) = in_clause(related_key, related_ids);
        sql.push_str(&format!(" AND {in_text}"));
        args.extend(in_args);
    }

    let visitor = visitor::for_dialect(conn.dialect());
    let sql = visitor.rebind(&sql);
    tracing::trace!(target: "entity_query::relations::pivot", sql = %sql, "detach");
    conn.execute(&sql, &args).await?;
    Ok(())
}

/// `sync(parent, relation, target_ids, pivot_data)`: reconcile the
/// pivot table to exactly `target_ids`, computing `added = target -
/// current` and `removed = current - target` and issuing `detach`/
/// `attach` for each.
pub async fn sync(
    conn: &dyn Queryable,
    descriptor: &RelationDescriptor,
    parent_id: &Value,
    target_ids: &[Value],
    pivot_data: &[IndexMap<String, Value>],
) -> crate::Result<()> {
    let (pivot_table, foreign_key, related_key) = pivot_parts(descriptor)?;

    let sql = format!("SELECT {related_key} FROM {pivot_table} WHERE {foreign_key} = ?");
    let visitor = visitor::for_dialect(conn.dialect());
    let sql = visitor.rebind(&sql);
    let rows = conn.query(&sql, &[parent_id.clone()]).await?;

    let current: std::collections::HashSet<String> = rows.iter().filter_map(|r| r.get(related_key)).map(|v| v.to_string()).collect();
    let target: std::collections::HashSet<String> = target_ids.iter().map(|v| v.to_string()).collect();

    let removed_ids: Vec<Value> = rows
        .iter()
        .filter_map(|r| r.get(related_key))
        .filter(|v| !target.contains(&v.to_string()))
        .cloned()
        .collect();
    let added_ids: Vec<Value> = target_ids.iter().filter(|v| !current.contains(&v.to_string())).cloned().collect();

    if !removed_ids.is_empty() {
        detach(conn, descriptor, parent_id, &removed_ids).await?;
    }
    if !added_ids.is_empty() {
        attach(conn, descriptor, parent_id, &added_ids, pivot_data).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::Row;
    use crate::connector::ResultSet;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct Recorder {
        executed: Mutex<Vec<(String, Vec<Value>)>>,
        queried_rows: Vec<Row>,
    }

    #[async_trait]
    impl Queryable for Recorder {
        async fn query(&self, sql: &str, args: &[Value]) -> crate::Result<Vec<Row>> {
            self.executed.lock().push((sql.to_string(), args.to_vec()));
            Ok(self.queried_rows.clone())
        }
        async fn execute(&self, sql: &str, args: &[Value]) -> crate::Result<ResultSet> {
            self.executed.lock().push((sql.to_string(), args.to_vec()));
            Ok(ResultSet::default())
        }
        async fn begin(&self) -> crate::Result<Box<dyn crate::connector::Transaction>> {
            unimplemented!()
        }
        fn dialect(&self) -> crate::identifier::Dialect {
            crate::identifier::Dialect::Postgres
        }
    }

    fn belongs_to_many() -> RelationDescriptor {
        RelationDescriptor::BelongsToMany {
            pivot_table: "post_tag".into(),
            foreign_key: "post_id".into(),
            related_key: "tag_id".into(),
            local_key: "id".into(),
            related_pk: "id".into(),
            override_table: None,
        }
    }

    #[tokio::test]
    async fn attach_inserts_one_row_per_id() {
        let conn = Recorder { executed: Mutex::new(Vec::new()), queried_rows: Vec::new() };
        attach(&conn, &belongs_to_many(), &Value::int64(1), &[Value::int64(10), Value::int64(20)], &[]).await.unwrap();

        let executed = conn.executed.lock();
        assert_eq!(executed.len(), 1);
        assert!(executed[0].0.contains("INSERT INTO post_tag (post_id, tag_id) VALUES"));
        assert_eq!(executed[0].1.len(), 4);
    }

    #[tokio::test]
    async fn attach_with_empty_ids_is_a_noop() {
        let conn = Recorder { executed: Mutex::new(Vec::new()), queried_rows: Vec::new() };
        attach(&conn, &belongs_to_many(), &Value::int64(1), &[], &[]).await.unwrap();
        assert!(conn.executed.lock().is_empty());
    }

    #[tokio::test]
    async fn detach_without_ids_removes_all_for_parent() {
        let conn = Recorder { executed: Mutex::new(Vec::new()), queried_rows: Vec::new() };
        detach(&conn, &belongs_to_many(), &Value::int64(1), &[]).await.unwrap();
        let executed = conn.executed.lock();
        assert_eq!(executed[0].0, "DELETE FROM post_tag WHERE post_id = $1");
    }

    #[tokio::test]
    async fn sync_computes_added_and_removed() {
        let rows = vec![
            Row { columns: vec!["tag_id".into()], values: vec![Value::int64(10)] },
            Row { columns: vec!["tag_id".into()], values: vec![Value::int64(20)] },
        ];
        let conn = Recorder { executed: Mutex::new(Vec::new()), queried_rows: rows };
        sync(&conn, &belongs_to_many(), &Value::int64(1), &[Value::int64(20), Value::int64(30)], &[]).await.unwrap();

        let executed = conn.executed.lock();
        // select, then detach(10), then attach(30)
        assert_eq!(executed.len(), 3);
        assert!(executed[1].0.starts_with("DELETE"));
        assert!(executed[2].0.starts_with("INSERT"));
    }
}
