//! Relation Planner & Eager Loader.
//!
//! Rust has no runtime reflection to discover a struct's nested
//! `root.sub1.sub2` slots the way a reflect-driven implementation
//! would, so slot assignment is the one piece this module hands back
//! as bucketed data rather than writing through struct pointers itself
//! — grouping, resolving, and the one-query-per-edge batch functions
//! are implemented here. [`crate::executor::Query::get_on`] groups a
//! query's requested relation names by root
//! ([`group_by_root`]) and calls
//! [`crate::schema::RelationsOf::eager_load`] once per root; a concrete
//! entity's override is the one place that knows both which `batch_*`
//! function its descriptor needs and which struct field the result
//! belongs in. Only single-level (`root`, no `root.sub`) eager loading
//! is wired end to end; `RelationSpec::subpath` is parsed and carried
//! for a nested `with()` a future planner pass could recurse into, but
//! nothing here currently reads it.

pub mod pivot;

use crate::ast::{in_clause, Fragment, Select, Value};
use crate::binder::Binder;
use crate::connector::Queryable;
use crate::error::{Error, ErrorKind};
use crate::schema::{RelationDescriptor, Schema};
use crate::visitor;
use std::collections::HashMap;

/// One parsed relation request: `root[.sub1[.sub2…]][:col1,col2,…]`
///. Column projection applies to the leaf of the dot path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationSpec {
    pub root: String,
    pub subpath: Option<String>,
    pub columns: Vec<String>,
}

impl RelationSpec {
    pub fn parse(raw: &str) -> Self {
        let (path, columns) = match raw.split_once(':') {
            Some((p, cols)) => (p, cols.split(',').map(str::to_string).collect()),
            None => (raw, Vec::new()),
        };
        let (root, subpath) = match path.split_once('.') {
            Some((r, s)) => (r.to_string(), Some(s.to_string())),
            None => (path.to_string(), None),
        };
        RelationSpec { root, subpath, columns }
    }
}

/// Step 1: group a flat relation-spec list by root name.
pub fn group_by_root(specs: &[RelationSpec]) -> HashMap<String, Vec<&RelationSpec>> {
    let mut grouped: HashMap<String, Vec<&RelationSpec>> = HashMap::new();
    for spec in specs {
        grouped.entry(spec.root.clone()).or_default().push(spec);
    }
    grouped
}

/// Step 2: resolve a relation by name, preferring an exact match and
/// falling back to `{name}Relation` as a naming-convention tie-break.
pub fn resolve_relation<'a>(
    relations: &'a [(&'static str, RelationDescriptor)],
    name: &str,
    parent_type: &str,
) -> crate::Result<&'a RelationDescriptor> {
    relations
        .iter()
        .find(|(n, _)| *n == name)
        .or_else(|| {
            let suffixed = format!("{name}Relation");
            relations.iter().find(|(n, _)| n == &suffixed)
        })
        .map(|(_, d)| d)
        .ok_or_else(|| Error::new(ErrorKind::RelationNotFound { entity: parent_type.to_string(), relation: name.to_string() }))
}

fn projection(columns: &[String]) -> Vec<String> {
    if columns.is_empty() {
        vec!["*".to_string()]
    } else {
        columns.to_vec()
    }
}

async fn fetch<T: crate::schema::Entity + Default>(
    conn: &dyn Queryable,
    binder: &Binder,
    schema: &Schema,
    table: &str,
    key_column: &str,
    keys: &[Value],
    columns: &[String],
    extra: Option<Fragment>,
) -> crate::Result<Vec<T>> {
    let (in_text, in_args) = in_clause(key_column, keys);

    let mut select = Select::from_table(table);
    select.columns = projection(columns);
    select.wheres.push(Fragment { joiner: None, text: format!("({in_text})") });
    select.args.extend_from(in_args);
    if let Some(fragment) = extra {
        select.wheres.push(fragment);
    }

    let visitor = visitor::for_dialect(conn.dialect());
    let (sql, args) = visitor.render_select(&select);
    tracing::trace!(target: "entity_query::relations", sql = %sql, args = args.len(), "eager-load fetch");
    let rows = conn.query(&sql, &args).await?;
    binder.scan_rows(schema, &rows, None)
}

fn dedup_values(values: impl IntoIterator<Item = Value>) -> Vec<Value> {
    let mut seen = std::collections::HashSet::new();
    values
        .into_iter()
        .filter(|v| !v.is_null())
        .filter(|v| seen.insert(v.to_string()))
        .collect()
}

/// *HasOne/HasMany*: one related row (HasOne) or bucket of rows
/// (HasMany) per parent local key.
pub async fn batch_has<R: crate::schema::Entity + Default>(
    conn: &dyn Queryable,
    binder: &Binder,
    related_schema: &Schema,
    descriptor: &RelationDescriptor,
    parent_keys: impl IntoIterator<Item = Value>,
    columns: &[String],
) -> crate::Result<HashMap<String, Vec<R>>> {
    let (foreign_key, table) = match descriptor {
        RelationDescriptor::HasOne { foreign_key, override_table, .. }
        | RelationDescriptor::HasMany { foreign_key, override_table, .. } => {
            (foreign_key.clone(), override_table.clone().unwrap_or_else(|| related_schema.table_name.clone()))
        }
        _ => return Err(Error::new(ErrorKind::InvalidRelationConfig("expected HasOne/HasMany".into()))),
    };

    let keys = dedup_values(parent_keys);
    let rows: Vec<R> = fetch(conn, binder, related_schema, &table, &foreign_key, &keys, columns, None).await?;

    let mut buckets: HashMap<String, Vec<R>> = HashMap::new();
    for row in rows {
        let Some(fk) = row.get_field(&foreign_key) else { continue };
        buckets.entry(fk.to_string()).or_default().push(row);
    }
    Ok(buckets)
}

/// *BelongsTo*: one related row per distinct, non-null FK value on the
/// parent side; parents whose FK is null receive no assignment.
pub async fn batch_belongs_to<R: crate::schema::Entity + Default>(
    conn: &dyn Queryable,
    binder: &Binder,
    related_schema: &Schema,
    descriptor: &RelationDescriptor,
    parent_fks: impl IntoIterator<Item = Value>,
    columns: &[String],
) -> crate::Result<HashMap<String, R>> {
    let (owner_key, table) = match descriptor {
        RelationDescriptor::BelongsTo { owner_key, override_table, .. } => {
            (owner_key.clone(), override_table.clone().unwrap_or_else(|| related_schema.table_name.clone()))
        }
        _ => return Err(Error::new(ErrorKind::InvalidRelationConfig("expected BelongsTo".into()))),
    };

    let keys = dedup_values(parent_fks);
    let rows: Vec<R> = fetch(conn, binder, related_schema, &table, &owner_key, &keys, columns, None).await?;

    let mut by_owner_key = HashMap::new();
    for row in rows {
        if let Some(owner_value) = row.get_field(&owner_key) {
            by_owner_key.insert(owner_value.to_string(), row);
        }
    }
    Ok(by_owner_key)
}

/// *BelongsToMany*: pivot rows first, then the related rows they name.
/// Returns parent-key → related-row buckets, stitched through the
/// pivot table in two batched queries.
pub async fn batch_belongs_to_many<R: crate::schema::Entity + Default>(
    conn: &dyn Queryable,
    binder: &Binder,
    related_schema: &Schema,
    descriptor: &RelationDescriptor,
    parent_keys: impl IntoIterator<Item = Value>,
    columns: &[String],
) -> crate::Result<HashMap<String, Vec<R>>> {
    let (pivot_table, foreign_key, related_key, related_pk, related_table) = match descriptor {
        RelationDescriptor::BelongsToMany { pivot_table, foreign_key, related_key, related_pk, override_table, .. } => (
            pivot_table.clone(),
            foreign_key.clone(),
            related_key.clone(),
            related_pk.clone(),
            override_table.clone().unwrap_or_else(|| related_schema.table_name.clone()),
        ),
        _ => return Err(Error::new(ErrorKind::InvalidRelationConfig("expected BelongsToMany".into()))),
    };

    let keys = dedup_values(parent_keys);
    let (in_text, in_args) = in_clause(&foreign_key, &keys);
    let pivot_sql = format!("SELECT {foreign_key}, {related_key} FROM {pivot_table} WHERE ({in_text})");
    let visitor = visitor::for_dialect(conn.dialect());
    let (pivot_sql, pivot_args) = (visitor.rebind(&pivot_sql), in_args);
    tracing::trace!(target: "entity_query::relations", sql = %pivot_sql, "belongs-to-many pivot fetch");
    let pivot_rows = conn.query(&pivot_sql, &pivot_args).await?;

    let mut related_ids: Vec<Value> = Vec::new();
    let mut pairs: Vec<(String, Value)> = Vec::new();
    for row in &pivot_rows {
        if let (Some(parent_fk), Some(related_id)) = (row.get(&foreign_key), row.get(&related_key)) {
            pairs.push((parent_fk.to_string(), related_id.clone()));
            related_ids.push(related_id.clone());
        }
    }
    let related_ids = dedup_values(related_ids);

    let related_rows: Vec<R> = fetch(conn, binder, related_schema, &related_table, &related_pk, &related_ids, columns, None).await?;
    let mut by_related_pk: HashMap<String, R> = HashMap::new();
    for row in related_rows {
        if let Some(pk) = row.get_field(&related_pk) {
            by_related_pk.insert(pk.to_string(), row);
        }
    }

    let mut buckets: HashMap<String, Vec<R>> = HashMap::new();
    for (parent_key, related_id) in pairs {
        if let Some(related) = by_related_pk.remove(&related_id.to_string()) {
            buckets.entry(parent_key).or_default().push(related);
        }
    }
    Ok(buckets)
}

/// *MorphOne/MorphMany*: like `batch_has`, with an added
/// `type_column = parent_type_literal` predicate.
pub async fn batch_morph<R: crate::schema::Entity + Default>(
    conn: &dyn Queryable,
    binder: &Binder,
    related_schema: &Schema,
    descriptor: &RelationDescriptor,
    parent_keys: impl IntoIterator<Item = Value>,
    parent_type_literal: &str,
    columns: &[String],
) -> crate::Result<HashMap<String, Vec<R>>> {
    let (type_column, id_column, table) = match descriptor {
        RelationDescriptor::MorphOne { type_column, id_column, override_table }
        | RelationDescriptor::MorphMany { type_column, id_column, override_table } => {
            (type_column.clone(), id_column.clone(), override_table.clone().unwrap_or_else(|| related_schema.table_name.clone()))
        }
        _ => return Err(Error::new(ErrorKind::InvalidRelationConfig("expected MorphOne/MorphMany".into()))),
    };

    let keys = dedup_values(parent_keys);
    let extra = Fragment { joiner: Some(crate::ast::Joiner::And), text: format!("({type_column} = ?)") };
    let rows: Vec<R> =
        fetch_with_literal(conn, binder, related_schema, &table, &id_column, &keys, columns, extra, Value::text(parent_type_literal)).await?;

    let mut buckets: HashMap<String, Vec<R>> = HashMap::new();
    for row in rows {
        if let Some(id) = row.get_field(&id_column) {
            buckets.entry(id.to_string()).or_default().push(row);
        }
    }
    Ok(buckets)
}

async fn fetch_with_literal<T: crate::schema::Entity + Default>(
    conn: &dyn Queryable,
    binder: &Binder,
    schema: &Schema,
    table: &str,
    key_column: &str,
    keys: &[Value],
    columns: &[String],
    extra: Fragment,
    literal: Value,
) -> crate::Result<Vec<T>> {
    let (in_text, in_args) = in_clause(key_column, keys);
    let mut select = Select::from_table(table);
    select.columns = projection(columns);
    select.wheres.push(Fragment { joiner: None, text: format!("({in_text})") });
    select.args.extend_from(in_args);
    select.wheres.push(extra);
    select.args.extend_from([literal]);

    let visitor = visitor::for_dialect(conn.dialect());
    let (sql, args) = visitor.render_select(&select);
    let rows = conn.query(&sql, &args).await?;
    binder.scan_rows(schema, &rows, None)
}

/// *MorphTo*: parent rows are partitioned by their discriminator
/// (`type_column`) value; each partition's IDs are fetched from the
/// table named by the descriptor's `type_registry`. Because each
/// partition may target a structurally different Rust type, this
/// returns raw rows grouped by discriminator rather than a typed
/// `Vec<R>` — the caller (which alone knows each possible concrete
/// target type) scans each partition with its own `Binder::scan_rows`.
pub async fn batch_morph_to(
    conn: &dyn Queryable,
    descriptor: &RelationDescriptor,
    parent_rows: impl IntoIterator<Item = (Value, String)>,
) -> crate::Result<HashMap<String, (String, Vec<crate::binder::Row>)>> {
    let (id_column, type_registry) = match descriptor {
        RelationDescriptor::MorphTo { id_column, type_registry, .. } => (id_column.clone(), type_registry.clone()),
        _ => return Err(Error::new(ErrorKind::InvalidRelationConfig("expected MorphTo".into()))),
    };

    let mut ids_by_type: HashMap<String, Vec<Value>> = HashMap::new();
    for (id, discriminator) in parent_rows {
        ids_by_type.entry(discriminator).or_default().push(id);
    }

    let mut out = HashMap::new();
    let visitor = visitor::for_dialect(conn.dialect());
    for (discriminator, ids) in ids_by_type {
        let Some(table) = type_registry.get(&discriminator) else {
            return Err(Error::new(ErrorKind::InvalidRelation(format!(
                "morph-to discriminator {discriminator:?} is not present in the type registry"
            ))));
        };
        let keys = dedup_values(ids);
        let (in_text, in_args) = in_clause(&id_column, &keys);
        let mut select = Select::from_table(table);
        select.columns = vec!["*".to_string()];
        select.wheres.push(Fragment { joiner: None, text: format!("({in_text})") });
        select.args.extend_from(in_args);

        let (sql, args) = visitor.render_select(&select);
        let rows = conn.query(&sql, &args).await?;
        out.insert(discriminator, (table.clone(), rows));
    }
    Ok(out)
}
