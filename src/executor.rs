//! Executor: terminal operations bound to a [`crate::query::Query`].
//!
//! Every operation here takes an explicit connection (`_on` methods) so
//! a transaction-bound query can run against the transaction's own
//! connection exclusively, plus a convenience wrapper that
//! resolves the connection through the [`crate::router::Router`] for
//! the common, non-transactional case.
//!
//! `get_on`/`get` resolve `Query::with_relations` eager loads by
//! grouping the requested relation names by root
//! ([`crate::relations::group_by_root`]) and dispatching each root to
//! `T`'s own [`crate::schema::RelationsOf::eager_load`] override, which
//! is the one place that knows both the related Rust type and the
//! struct field it belongs in.

use crate::ast::{Select, Value};
use crate::binder::Binder;
use crate::connector::{Queryable, Transaction};
use crate::dirty::{DirtyTracker, Identity};
use crate::error::{Error, ErrorKind, Name};
use crate::hooks::Hooks;
use crate::identifier::validate_identifier_or_aggregate;
use crate::query::{insert_for, Query};
use crate::relations;
use crate::router::{OperationKind, Router};
use crate::schema::{Entity, RelationsOf, Schema};
use crate::visitor;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// `UPDATE ... SET target = CASE lookup WHEN v1 THEN r1 ... END` chunk
/// size for `update_many_by_key`.
pub const MAX_CASE_WHEN_BATCH: usize = 500;
/// `create_many`/`bulk_insert` batch bound: `columns * rows <= 65535`,
/// capped at this many rows per batch.
pub const MAX_BULK_BATCH_ROWS: usize = 500;
const MAX_BULK_CELLS: usize = 65_535;

/// Shared infrastructure an [`Entity`]'s queries run against.
#[derive(Clone)]
pub struct ExecutorContext {
    pub router: Arc<Router>,
    pub binder: Arc<Binder>,
    pub dirty: Arc<DirtyTracker>,
}

/// Derive a stable tracking identity from an entity's primary key,
/// for use as the key into the dirty-tracking store when the entity
/// is loaded.
pub fn identity_of<T: Entity>(entity: &T, schema: &Schema) -> Identity {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    schema.type_name.hash(&mut hasher);
    if let Some(pk) = entity.get_field(&schema.primary_key) {
        pk.to_string().hash(&mut hasher);
    }
    hasher.finish()
}

impl<T: Entity + Default + Hooks + RelationsOf> Query<T> {
    async fn render_select<Q: Queryable + ?Sized>(&self, conn: &Q) -> crate::Result<(String, Vec<Value>)> {
        if let Some((sql, args)) = &self.state.raw_override {
            let visitor = visitor::for_dialect(conn.dialect());
            return Ok((visitor.rebind(sql), args.clone()));
        }
        if let Some(err) = &self.state.build_error {
            return Err(clone_error(err));
        }
        let visitor = visitor::for_dialect(conn.dialect());
        Ok(visitor.render_select(&self.state.select))
    }

    /// `get() -> sequence<T>`. Honors `with_relations` by dispatching
    /// one eager-load call per distinct relation root named, each of
    /// which issues exactly one additional batched query.
    pub async fn get_on<Q: Queryable + ?Sized>(self, conn: &Q, ctx: &ExecutorContext) -> crate::Result<Vec<T>> {
        let limit_hint = self.state.select.limit.map(|n| n as usize);
        let relation_specs = self.state.relations.clone();
        let (sql, args) = self.render_select(conn).await?;
        let rows = conn.query(&sql, &args).await.map_err(|e| with_query_context(e, "get", &sql, args.len()))?;
        let mut entities = ctx.binder.scan_rows::<T>(&self.schema, &rows, limit_hint)?;
        for entity in &mut entities {
            entity.after_find()?;
        }
        if !entities.is_empty() && !relation_specs.is_empty() {
            let parsed: Vec<relations::RelationSpec> = relation_specs.iter().map(|s| relations::RelationSpec::parse(s)).collect();
            for root in relations::group_by_root(&parsed).keys() {
                T::eager_load(root, conn, &ctx.binder, &mut entities).await?;
            }
        }
        Ok(entities)
    }

    pub async fn get(self, ctx: &ExecutorContext) -> crate::Result<Vec<T>> {
        let (conn, _) = ctx.router.route(OperationKind::Read, self.state.route_override);
        self.get_on(conn.as_ref(), ctx).await
    }

    /// `first() -> optional<T>`, but surfaced as `Result` with
    /// `record_not_found` so callers distinguish "no rows" from driver
    /// failure.
    pub async fn first_on<Q: Queryable + ?Sized>(mut self, conn: &Q, ctx: &ExecutorContext) -> crate::Result<T> {
        self.state.select.limit = Some(1);
        let mut rows = self.get_on(conn, ctx).await?;
        if rows.is_empty() {
            return Err(Error::new(ErrorKind::RecordNotFound).with_operation("first"));
        }
        Ok(rows.remove(0))
    }

    pub async fn first(self, ctx: &ExecutorContext) -> crate::Result<T> {
        let (conn, _) = ctx.router.route(OperationKind::Read, self.state.route_override);
        self.first_on(conn.as_ref(), ctx).await
    }

    /// `find(id)`: shorthand for `where(pk, id).first()`.
    pub async fn find_on<Q: Queryable + ?Sized>(self, id: impl Into<Value>, conn: &Q, ctx: &ExecutorContext) -> crate::Result<T> {
        let pk = self.schema.primary_key.clone();
        self.where_eq(&pk, id).first_on(conn, ctx).await
    }

    pub async fn find(self, id: impl Into<Value>, ctx: &ExecutorContext) -> crate::Result<T> {
        let pk = self.schema.primary_key.clone();
        self.where_eq(&pk, id).first(ctx).await
    }

    /// `pluck(col) -> sequence<scalar>`.
    pub async fn pluck_on<Q: Queryable + ?Sized>(mut self, column: &str, conn: &Q, ctx: &ExecutorContext) -> crate::Result<Vec<Option<Value>>> {
        validate_identifier_or_aggregate(column)?;
        self.state.select.columns = vec![column.to_string()];
        let (sql, args) = self.render_select(conn).await?;
        let rows = conn.query(&sql, &args).await.map_err(|e| with_query_context(e, "pluck", &sql, args.len()))?;
        ctx.binder.pluck_column(column, &rows)
    }

    pub async fn pluck(self, column: &str, ctx: &ExecutorContext) -> crate::Result<Vec<Option<Value>>> {
        let (conn, _) = ctx.router.route(OperationKind::Read, self.state.route_override);
        self.pluck_on(column, conn.as_ref(), ctx).await
    }

    fn stripped_for_aggregate(&self, projection: &str) -> Select {
        let mut select = self.state.select.clone();
        select.columns = vec![projection.to_string()];
        select.order_bys.clear();
        select.limit = None;
        select.offset = None;
        select
    }

    async fn aggregate_scalar<Q: Queryable + ?Sized>(&self, projection: &str, conn: &Q) -> crate::Result<Value> {
        let select = self.stripped_for_aggregate(projection);
        let visitor = visitor::for_dialect(conn.dialect());
        let (sql, args) = visitor.render_select(&select);
        let rows = conn.query(&sql, &args).await.map_err(|e| with_query_context(e, "aggregate", &sql, args.len()))?;
        Ok(rows.first().and_then(|r| r.values.first().cloned()).unwrap_or(Value::null_int64()))
    }

    pub async fn count_on<Q: Queryable + ?Sized>(&self, conn: &Q) -> crate::Result<i64> {
        Ok(self.aggregate_scalar("COUNT(*)", conn).await?.as_i64().unwrap_or(0))
    }

    pub async fn count(&self, ctx: &ExecutorContext) -> crate::Result<i64> {
        let (conn, _) = ctx.router.route(OperationKind::Read, self.state.route_override);
        self.count_on(conn.as_ref()).await
    }

    pub async fn exists_on<Q: Queryable + ?Sized>(&self, conn: &Q) -> crate::Result<bool> {
        Ok(self.count_on(conn).await? > 0)
    }

    pub async fn exists(&self, ctx: &ExecutorContext) -> crate::Result<bool> {
        let (conn, _) = ctx.router.route(OperationKind::Read, self.state.route_override);
        self.exists_on(conn.as_ref()).await
    }

    /// `sum(col)`; returns `0` for an all-`NULL`/empty aggregate.
    pub async fn sum_on<Q: Queryable + ?Sized>(&self, column: &str, conn: &Q) -> crate::Result<f64> {
        validate_identifier_or_aggregate(column)?;
        let value = self.aggregate_scalar(&format!("SUM({column})"), conn).await?;
        Ok(value.as_f64().unwrap_or(0.0))
    }

    pub async fn sum(&self, column: &str, ctx: &ExecutorContext) -> crate::Result<f64> {
        let (conn, _) = ctx.router.route(OperationKind::Read, self.state.route_override);
        self.sum_on(column, conn.as_ref()).await
    }

    pub async fn avg_on<Q: Queryable + ?Sized>(&self, column: &str, conn: &Q) -> crate::Result<f64> {
        validate_identifier_or_aggregate(column)?;
        let value = self.aggregate_scalar(&format!("AVG({column})"), conn).await?;
        Ok(value.as_f64().unwrap_or(0.0))
    }

    pub async fn avg(&self, column: &str, ctx: &ExecutorContext) -> crate::Result<f64> {
        let (conn, _) = ctx.router.route(OperationKind::Read, self.state.route_override);
        self.avg_on(column, conn.as_ref()).await
    }

    /// `count_over(col) -> map<value, i64>`; `Value` is not `Hash`
    /// since it carries float variants, so the map is keyed by each
    /// value's rendered text, the same workaround [`crate::relations`]
    /// uses for batching by key.
    pub async fn count_over_on<Q: Queryable + ?Sized>(&self, column: &str, conn: &Q) -> crate::Result<HashMap<String, i64>> {
        validate_identifier_or_aggregate(column)?;
        let mut select = self.stripped_for_aggregate(column);
        select.columns = vec![column.to_string(), "COUNT(*)".to_string()];
        select.group_bys = vec![crate::ast::GroupBy::Plain(vec![column.to_string()])];
        let visitor = visitor::for_dialect(conn.dialect());
        let (sql, args) = visitor.render_select(&select);
        let rows = conn.query(&sql, &args).await.map_err(|e| with_query_context(e, "count_over", &sql, args.len()))?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            let key = row.values.first().map(|v| v.to_string()).unwrap_or_default();
            let count = row.values.get(1).and_then(|v| v.as_i64()).unwrap_or(0);
            out.insert(key, count);
        }
        Ok(out)
    }

    pub async fn count_over(&self, column: &str, ctx: &ExecutorContext) -> crate::Result<HashMap<String, i64>> {
        let (conn, _) = ctx.router.route(OperationKind::Read, self.state.route_override);
        self.count_over_on(column, conn.as_ref()).await
    }

    /// `cursor() -> Cursor<T>`: a `futures::Stream` so callers can
    /// `while let Some(row) = cursor.try_next().await?` without
    /// collecting the result into a `Vec` themselves. [`Queryable::query`]
    /// hands back a complete row set rather than a cursor the driver
    /// streams row-at-a-time, so the stream is fed from an
    /// already-materialized buffer; the `Stream` boundary still lets
    /// callers process rows one at a time and stop early.
    pub async fn cursor_on<Q: Queryable + ?Sized>(self, conn: &Q, ctx: &ExecutorContext) -> crate::Result<Cursor<T>> {
        let rows = self.get_on(conn, ctx).await?;
        Ok(Cursor::from_rows(rows))
    }

    pub async fn cursor(self, ctx: &ExecutorContext) -> crate::Result<Cursor<T>> {
        let (conn, _) = ctx.router.route(OperationKind::Read, self.state.route_override);
        self.cursor_on(conn.as_ref(), ctx).await
    }

    /// `first_or_create(match_attrs, extra_attrs)`.
    pub async fn first_or_create_on<Q: Queryable + ?Sized>(
        self,
        match_attrs: &indexmap::IndexMap<String, Value>,
        extra_attrs: &indexmap::IndexMap<String, Value>,
        conn: &Q,
        ctx: &ExecutorContext,
    ) -> crate::Result<T> {
        let schema = self.schema.clone();
        let lookup = self.where_map(match_attrs);
        match lookup.first_on(conn, ctx).await {
            Ok(found) => Ok(found),
            Err(e) if e.is_record_not_found() => {
                let mut entity = T::default();
                for (col, val) in match_attrs.iter().chain(extra_attrs.iter()) {
                    entity.set_field(col, val.clone())?;
                }
                create_on(conn, ctx, &schema, entity).await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn first_or_create(
        self,
        match_attrs: &indexmap::IndexMap<String, Value>,
        extra_attrs: &indexmap::IndexMap<String, Value>,
        ctx: &ExecutorContext,
    ) -> crate::Result<T> {
        let (conn, _) = ctx.router.route(OperationKind::Write, self.state.route_override);
        self.first_or_create_on(match_attrs, extra_attrs, conn.as_ref(), ctx).await
    }

    /// `update_or_create(match_attrs, value_attrs)`.
    pub async fn update_or_create_on<Q: Queryable + ?Sized>(
        self,
        match_attrs: &indexmap::IndexMap<String, Value>,
        value_attrs: &indexmap::IndexMap<String, Value>,
        conn: &Q,
        ctx: &ExecutorContext,
    ) -> crate::Result<T> {
        let schema = self.schema.clone();
        let lookup = self.where_map(match_attrs);
        match lookup.first_on(conn, ctx).await {
            Ok(mut found) => {
                for (col, val) in value_attrs {
                    found.set_field(col, val.clone())?;
                }
                update_on(conn, ctx, &schema, found).await
            }
            Err(e) if e.is_record_not_found() => {
                let mut entity = T::default();
                for (col, val) in match_attrs.iter().chain(value_attrs.iter()) {
                    entity.set_field(col, val.clone())?;
                }
                create_on(conn, ctx, &schema, entity).await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn update_or_create(
        self,
        match_attrs: &indexmap::IndexMap<String, Value>,
        value_attrs: &indexmap::IndexMap<String, Value>,
        ctx: &ExecutorContext,
    ) -> crate::Result<T> {
        let (conn, _) = ctx.router.route(OperationKind::Write, self.state.route_override);
        self.update_or_create_on(match_attrs, value_attrs, conn.as_ref(), ctx).await
    }

    /// `update_many(value_map)`: updates every row matched by this
    /// query's current WHERE clause.
    pub async fn update_many_on<Q: Queryable + ?Sized>(
        &self,
        values: &indexmap::IndexMap<String, Value>,
        conn: &Q,
    ) -> crate::Result<u64> {
        let mut update = self.into_update_base();
        for (col, val) in values {
            crate::identifier::validate_identifier(col)?;
            update.assignments.push((col.clone(), val.clone()));
        }
        add_updated_at(&mut update, &self.schema);

        let visitor = visitor::for_dialect(conn.dialect());
        let (sql, args) = visitor.render_update(&update);
        let result = conn.execute(&sql, &args).await.map_err(|e| with_query_context(e, "update_many", &sql, args.len()))?;
        Ok(result.rows_affected)
    }

    pub async fn update_many(&self, values: &indexmap::IndexMap<String, Value>, ctx: &ExecutorContext) -> crate::Result<u64> {
        let (conn, _) = ctx.router.route(OperationKind::Write, self.state.route_override);
        self.update_many_on(values, conn.as_ref()).await
    }

    /// `update_many_by_key(lookup_col, target_col, map)`: a single
    /// `CASE lookup WHEN v1 THEN r1 ... END`, chunked at
    /// [`MAX_CASE_WHEN_BATCH`] inputs inside one surrounding
    /// transaction when more than one chunk is needed.
    pub async fn update_many_by_key_on<Q: Queryable + ?Sized>(
        &self,
        lookup_col: &str,
        target_col: &str,
        map: &indexmap::IndexMap<Value, Value>,
        conn: &Q,
    ) -> crate::Result<u64> {
        crate::identifier::validate_identifier(lookup_col)?;
        crate::identifier::validate_identifier(target_col)?;
        if map.is_empty() {
            return Ok(0);
        }

        let pairs: Vec<(Value, Value)> = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let mut total = 0u64;
        let visitor = visitor::for_dialect(conn.dialect());

        for chunk in pairs.chunks(MAX_CASE_WHEN_BATCH) {
            let mut case_sql = format!("CASE {lookup_col} ");
            let mut args = Vec::with_capacity(chunk.len() * 2);
            for (lookup, target) in chunk {
                case_sql.push_str("WHEN ? THEN ? ");
                args.push(lookup.clone());
                args.push(target.clone());
            }
            case_sql.push_str("END");

            let mut update = crate::ast::Update::table(self.state.select.table.clone());
            update.raw_assignment = Some((format!("{target_col} = {case_sql}"), args));

            let (in_text, in_args) = crate::ast::in_clause(lookup_col, &chunk.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>());
            update.wheres.push(crate::ast::Fragment { joiner: None, text: format!("({in_text})") });
            update.args = in_args;

            let (sql, args) = visitor.render_update(&update);
            let result = conn.execute(&sql, &args).await.map_err(|e| with_query_context(e, "update_many_by_key", &sql, args.len()))?;
            total += result.rows_affected;
        }
        Ok(total)
    }

    /// Routed entry point: opens an internal transaction around the
    /// chunked updates when the input spans more than one
    /// [`MAX_CASE_WHEN_BATCH`]-sized chunk. Call
    /// [`Self::update_many_by_key_on`] directly when already inside a
    /// caller-managed transaction to avoid nesting one.
    pub async fn update_many_by_key(
        &self,
        lookup_col: &str,
        target_col: &str,
        map: &indexmap::IndexMap<Value, Value>,
        ctx: &ExecutorContext,
    ) -> crate::Result<u64> {
        let (conn, _) = ctx.router.route(OperationKind::Write, self.state.route_override);
        if map.len() <= MAX_CASE_WHEN_BATCH {
            return self.update_many_by_key_on(lookup_col, target_col, map, conn.as_ref()).await;
        }

        let tx = conn.begin().await?;
        match self.update_many_by_key_on(lookup_col, target_col, map, tx.as_ref()).await {
            Ok(n) => {
                tx.commit().await?;
                Ok(n)
            }
            Err(e) => {
                tx.rollback().await?;
                Err(e)
            }
        }
    }

    /// `delete()`.
    pub async fn delete_on<Q: Queryable + ?Sized>(&self, conn: &Q) -> crate::Result<u64> {
        let delete = self.into_delete();
        let visitor = visitor::for_dialect(conn.dialect());
        let (sql, args) = visitor.render_delete(&delete);
        let result = conn.execute(&sql, &args).await.map_err(|e| with_query_context(e, "delete", &sql, args.len()))?;
        Ok(result.rows_affected)
    }

    pub async fn delete(&self, ctx: &ExecutorContext) -> crate::Result<u64> {
        let (conn, _) = ctx.router.route(OperationKind::Write, self.state.route_override);
        self.delete_on(conn.as_ref()).await
    }

    /// Raw mode: `exec()` runs the overriding raw query as a write.
    pub async fn exec_on<Q: Queryable + ?Sized>(&self, conn: &Q) -> crate::Result<u64> {
        let Some((sql, args)) = &self.state.raw_override else {
            return Err(Error::new(ErrorKind::RequiresRawQuery).with_operation("exec"));
        };
        let visitor = visitor::for_dialect(conn.dialect());
        let sql = visitor.rebind(sql);
        let result = conn.execute(&sql, args).await.map_err(|e| with_query_context(e, "exec", &sql, args.len()))?;
        Ok(result.rows_affected)
    }

    pub async fn exec(&self, ctx: &ExecutorContext) -> crate::Result<u64> {
        let (conn, _) = ctx.router.route(OperationKind::Write, self.state.route_override);
        self.exec_on(conn.as_ref()).await
    }
}

fn clone_error(e: &Error) -> Error {
    Error::new(e.kind().clone())
}

fn with_query_context(e: Error, operation: &'static str, sql: &str, args_len: usize) -> Error {
    Error::new(e.kind().clone())
        .with_operation(operation)
        .with_query(sql.to_string(), args_len)
        .with_source(e)
}

fn add_updated_at(update: &mut crate::ast::Update, schema: &Schema) {
    if !schema.has_column("updated_at") {
        return;
    }
    let already_present = update.assignments.iter().any(|(c, _)| c == "updated_at")
        || update.raw_assignment.as_ref().is_some_and(|(sql, _)| sql.contains("updated_at"));
    if !already_present {
        update.assignments.push(("updated_at".to_string(), Value::DateTime(Some(chrono::Utc::now()))));
    }
}

/// `create(entity)`: emits `INSERT ... RETURNING pk`,
/// scans the returned key back into the entity, and fires
/// `before_create`/`after_create` at the prescribed points.
pub async fn create_on<T: Entity + Hooks, Q: Queryable + ?Sized>(conn: &Q, ctx: &ExecutorContext, schema: &Schema, mut entity: T) -> crate::Result<T> {
    entity.before_create()?;

    let insert = insert_for(&entity, schema);
    let visitor = visitor::for_dialect(conn.dialect());
    let (sql, args) = visitor.render_insert(&insert);
    let result = conn.execute(&sql, &args).await.map_err(|e| with_query_context(e, "create", &sql, args.len()))?;

    if let Some(id) = result.last_insert_id {
        entity.set_field(&schema.primary_key, id)?;
    }

    entity.after_create()?;
    let identity = identity_of(&entity, schema);
    ctx.dirty.track(identity, &entity, schema, None);
    Ok(entity)
}

pub async fn create<T: Entity + Hooks>(ctx: &ExecutorContext, schema: &Schema, entity: T) -> crate::Result<T> {
    let (conn, _) = ctx.router.route(OperationKind::Write, crate::router::RouteOverride::None);
    create_on(conn.as_ref(), ctx, schema, entity).await
}

/// `update(entity)`: emits a partial `UPDATE` covering
/// every non-primary column, auto-sets `updated_at` when the schema
/// has one, and syncs the dirty-tracking snapshot on success.
pub async fn update_on<T: Entity + Hooks, Q: Queryable + ?Sized>(conn: &Q, ctx: &ExecutorContext, schema: &Schema, mut entity: T) -> crate::Result<T> {
    update_columns_on(conn, ctx, schema, &mut entity, &[]).await?;
    Ok(entity)
}

pub async fn update<T: Entity + Hooks>(ctx: &ExecutorContext, schema: &Schema, entity: T) -> crate::Result<T> {
    let (conn, _) = ctx.router.route(OperationKind::Write, crate::router::RouteOverride::None);
    update_on(conn.as_ref(), ctx, schema, entity).await
}

/// `update_columns(entity, cols...)`: like `update` but restricted to
/// the named columns (empty `columns` means "every non-primary
/// column", matching `update`'s own contract). `updated_at` is added
/// unless explicitly listed.
pub async fn update_columns_on<T: Entity + Hooks, Q: Queryable + ?Sized>(
    conn: &Q,
    ctx: &ExecutorContext,
    schema: &Schema,
    entity: &mut T,
    columns: &[&str],
) -> crate::Result<()> {
    entity.before_update()?;

    let wanted: Vec<&str> = if columns.is_empty() {
        schema.fields.iter().filter(|f| !f.is_primary).map(|f| f.column_name.as_str()).collect()
    } else {
        columns.to_vec()
    };

    let mut update = crate::ast::Update::table(schema.table_name.clone());
    for &col in &wanted {
        crate::identifier::validate_identifier(col)?;
        let value = entity.get_field(col).ok_or_else(|| Error::new(ErrorKind::ColumnNotFound { column: Name::available(col) }))?;
        update.assignments.push((col.to_string(), value));
    }
    if !wanted.contains(&"updated_at") {
        add_updated_at(&mut update, schema);
    }

    let pk_value = entity.get_field(&schema.primary_key).ok_or_else(|| Error::new(ErrorKind::NilPointer))?;
    update.wheres.push(crate::ast::Fragment { joiner: None, text: format!("({} = ?)", schema.primary_key) });
    update.args.push(pk_value);

    let visitor = visitor::for_dialect(conn.dialect());
    let (sql, args) = visitor.render_update(&update);
    conn.execute(&sql, &args).await.map_err(|e| with_query_context(e, "update", &sql, args.len()))?;

    entity.after_update()?;
    let identity = identity_of(entity, schema);
    ctx.dirty.sync(identity, entity, schema);
    Ok(())
}

pub async fn update_columns<T: Entity + Hooks>(ctx: &ExecutorContext, schema: &Schema, entity: &mut T, columns: &[&str]) -> crate::Result<()> {
    let (conn, _) = ctx.router.route(OperationKind::Write, crate::router::RouteOverride::None);
    update_columns_on(conn.as_ref(), ctx, schema, entity, columns).await
}

fn batch_rows_for(schema: &Schema) -> usize {
    let columns = schema.fields.iter().filter(|f| !f.is_auto_increment).count().max(1);
    (MAX_BULK_CELLS / columns).clamp(1, MAX_BULK_BATCH_ROWS)
}

/// `create_many(entities)`: batches rows so `columns * rows <=
/// 65535`, capped at [`MAX_BULK_BATCH_ROWS`]. Auto-increment columns
/// are left for the database to assign, same as a single `create()`.
pub async fn create_many_on<T: Entity + Hooks, Q: Queryable + ?Sized>(conn: &Q, schema: &Schema, entities: &[T]) -> crate::Result<u64> {
    if entities.is_empty() {
        return Ok(0);
    }
    let columns: Vec<&str> = schema.fields.iter().filter(|f| !f.is_auto_increment).map(|f| f.column_name.as_str()).collect();
    let batch_rows = batch_rows_for(schema);

    let visitor = visitor::for_dialect(conn.dialect());
    let mut affected = 0u64;

    for chunk in entities.chunks(batch_rows) {
        let mut insert = crate::ast::Insert::single_into(schema.table_name.clone());
        insert.columns = columns.iter().map(|c| c.to_string()).collect();
        for entity in chunk {
            let row: Vec<Value> = columns.iter().map(|c| entity.get_field(c).unwrap_or(Value::null_text())).collect();
            insert.rows.push(row);
        }
        let (sql, args) = visitor.render_insert(&insert);
        let result = conn.execute(&sql, &args).await.map_err(|e| with_query_context(e, "create_many", &sql, args.len()))?;
        affected += result.rows_affected;
    }
    Ok(affected)
}

/// Routed entry point: opens an internal transaction around the
/// batched inserts when more than one [`MAX_BULK_BATCH_ROWS`]-sized
/// batch is required. Call [`create_many_on`] directly
/// when already inside a caller-managed transaction to avoid nesting
/// one.
pub async fn create_many<T: Entity + Hooks>(ctx: &ExecutorContext, schema: &Schema, entities: &[T]) -> crate::Result<u64> {
    let (conn, _) = ctx.router.route(OperationKind::Write, crate::router::RouteOverride::None);
    if entities.len() <= batch_rows_for(schema) {
        return create_many_on(conn.as_ref(), schema, entities).await;
    }

    let tx = conn.begin().await?;
    match create_many_on(tx.as_ref(), schema, entities).await {
        Ok(n) => {
            tx.commit().await?;
            Ok(n)
        }
        Err(e) => {
            tx.rollback().await?;
            Err(e)
        }
    }
}

/// `bulk_insert(entities)`: executes one `INSERT ... RETURNING pk` per
/// entity, scanning the returned key back in and firing `after_create`
/// after each successful row.
pub async fn bulk_insert_on<T: Entity + Hooks, Q: Queryable + ?Sized>(conn: &Q, ctx: &ExecutorContext, schema: &Schema, entities: Vec<T>) -> crate::Result<Vec<T>> {
    let mut out = Vec::with_capacity(entities.len());
    for entity in entities {
        out.push(create_on(conn, ctx, schema, entity).await?);
    }
    Ok(out)
}

/// Streaming terminal result from `cursor()`; see the note on
/// [`Query::cursor_on`] about the buffer it's fed from.
pub struct Cursor<T> {
    inner: std::pin::Pin<Box<dyn futures::Stream<Item = crate::Result<T>> + Send>>,
}

impl<T: Send + 'static> Cursor<T> {
    fn from_rows(rows: Vec<T>) -> Self {
        Cursor { inner: Box::pin(futures::stream::iter(rows.into_iter().map(Ok))) }
    }
}

impl<T> futures::Stream for Cursor<T> {
    type Item = crate::Result<T>;
    fn poll_next(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::{ColumnMapCache, Row};
    use crate::connector::ResultSet;
    use crate::identifier::Dialect;
    use crate::schema::{FieldDef, RelationDescriptor, SchemaBuilder};
    use async_trait::async_trait;
    use indexmap::IndexMap;
    use parking_lot::Mutex;

    #[derive(Default, Clone)]
    struct TestModel {
        id: i32,
        name: String,
        updated_at: Option<chrono::DateTime<chrono::Utc>>,
    }

    impl Entity for TestModel {
        fn describe() -> SchemaBuilder {
            SchemaBuilder::new()
                .table_name("test_models")
                .field(FieldDef::new("id").primary().auto_increment())
                .field(FieldDef::new("name").kind(crate::schema::FieldKind::String))
                .field(FieldDef::new("updated_at").kind(crate::schema::FieldKind::Time).nullable())
        }
        fn get_field(&self, column: &str) -> Option<Value> {
            match column {
                "id" => Some(Value::int32(self.id)),
                "name" => Some(Value::text(self.name.clone())),
                "updated_at" => Some(Value::from(self.updated_at)),
                _ => None,
            }
        }
        fn set_field(&mut self, column: &str, value: Value) -> crate::Result<()> {
            match column {
                "id" => self.id = value.as_i64().unwrap_or_default() as i32,
                "name" => self.name = value.as_str().unwrap_or_default().to_string(),
                "updated_at" => {
                    self.updated_at = match value {
                        Value::DateTime(dt) => dt,
                        _ => None,
                    }
                }
                _ => {}
            }
            Ok(())
        }
    }
    impl Hooks for TestModel {}
    impl RelationsOf for TestModel {}

    struct Stub {
        rows: Vec<Row>,
        executed: Mutex<Vec<(String, Vec<Value>)>>,
        last_insert_id: Option<Value>,
    }

    #[async_trait]
    impl Queryable for Stub {
        async fn query(&self, sql: &str, args: &[Value]) -> crate::Result<Vec<Row>> {
            self.executed.lock().push((sql.to_string(), args.to_vec()));
            Ok(self.rows.clone())
        }
        async fn execute(&self, sql: &str, args: &[Value]) -> crate::Result<ResultSet> {
            self.executed.lock().push((sql.to_string(), args.to_vec()));
            Ok(ResultSet { rows_affected: 1, last_insert_id: self.last_insert_id.clone() })
        }
        async fn begin(&self) -> crate::Result<Box<dyn crate::connector::Transaction>> {
            unimplemented!()
        }
        fn dialect(&self) -> Dialect {
            Dialect::Postgres
        }
    }

    fn ctx() -> ExecutorContext {
        ExecutorContext {
            router: Arc::new(Router::new(Arc::new(Stub { rows: Vec::new(), executed: Mutex::new(Vec::new()), last_insert_id: None }), Vec::new(), crate::connector::config::Balancer::RoundRobin)),
            binder: Arc::new(Binder::new(Arc::new(ColumnMapCache::default()))),
            dirty: Arc::new(DirtyTracker::default()),
        }
    }

    #[tokio::test]
    async fn get_on_scans_rows_and_runs_after_find() {
        let stub = Stub {
            rows: vec![Row { columns: vec!["id".into(), "name".into()], values: vec![Value::int32(1), Value::text("a")] }],
            executed: Mutex::new(Vec::new()),
            last_insert_id: None,
        };
        let c = ctx();
        let query = Query::<TestModel>::new().unwrap();
        let entities = query.get_on(&stub, &c).await.unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].name, "a");
    }

    #[tokio::test]
    async fn first_on_empty_rows_returns_record_not_found() {
        let stub = Stub { rows: Vec::new(), executed: Mutex::new(Vec::new()), last_insert_id: None };
        let c = ctx();
        let err = Query::<TestModel>::new().unwrap().first_on(&stub, &c).await.unwrap_err();
        assert!(err.is_record_not_found());
    }

    #[tokio::test]
    async fn create_on_scans_returned_primary_key() {
        let stub = Stub { rows: Vec::new(), executed: Mutex::new(Vec::new()), last_insert_id: Some(Value::int32(42)) };
        let c = ctx();
        let schema = Schema::of::<TestModel>().unwrap();
        let entity = TestModel { id: 0, name: "new".into(), updated_at: None };
        let created = create_on(&stub, &c, &schema, entity).await.unwrap();
        assert_eq!(created.id, 42);
    }

    #[tokio::test]
    async fn update_columns_on_adds_updated_at_and_syncs_dirty_tracking() {
        let stub = Stub { rows: Vec::new(), executed: Mutex::new(Vec::new()), last_insert_id: None };
        let c = ctx();
        let schema = Schema::of::<TestModel>().unwrap();
        let mut entity = TestModel { id: 7, name: "x".into(), updated_at: None };
        update_columns_on(&stub, &c, &schema, &mut entity, &["name"]).await.unwrap();

        let executed = stub.executed.lock();
        assert!(executed[0].0.contains("updated_at = ?"));
        let identity = identity_of(&entity, &schema);
        assert!(c.dirty.is_tracked(identity));
    }

    #[tokio::test]
    async fn update_many_by_key_chunks_at_max_case_when_batch() {
        let stub = Stub { rows: Vec::new(), executed: Mutex::new(Vec::new()), last_insert_id: None };
        let query = Query::<TestModel>::new().unwrap();

        let mut map = IndexMap::new();
        for i in 0..1200i64 {
            map.insert(Value::int64(i), Value::int64(i * 2));
        }
        let total = query.update_many_by_key_on("id", "name_rank", &map, &stub).await.unwrap();
        assert_eq!(total, 3); // one execute() call per chunk, each Stub reply reports 1 row affected
        assert_eq!(stub.executed.lock().len(), 3);
    }

    #[tokio::test]
    async fn create_many_on_batches_by_cell_budget() {
        let stub = Stub { rows: Vec::new(), executed: Mutex::new(Vec::new()), last_insert_id: None };
        let schema = Schema::of::<TestModel>().unwrap();
        let entities: Vec<TestModel> = (0..20).map(|i| TestModel { id: i, name: "x".into(), updated_at: None }).collect();
        create_many_on(&stub, &schema, &entities).await.unwrap();
        assert_eq!(stub.executed.lock().len(), 1); // 20 rows * 2 insertable cols (id is auto-increment) is well under the cap, one batch
    }

    #[tokio::test]
    async fn cursor_on_streams_prefetched_rows() {
        use futures::TryStreamExt;

        let stub = Stub {
            rows: vec![
                Row { columns: vec!["id".into(), "name".into()], values: vec![Value::int32(1), Value::text("a")] },
                Row { columns: vec!["id".into(), "name".into()], values: vec![Value::int32(2), Value::text("b")] },
            ],
            executed: Mutex::new(Vec::new()),
            last_insert_id: None,
        };
        let c = ctx();
        let mut cursor = Query::<TestModel>::new().unwrap().cursor_on(&stub, &c).await.unwrap();

        let mut names = Vec::new();
        while let Some(entity) = cursor.try_next().await.unwrap() {
            names.push(entity.name);
        }
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn delete_on_emits_delete_with_where_clause() {
        let stub = Stub { rows: Vec::new(), executed: Mutex::new(Vec::new()), last_insert_id: None };
        let query = Query::<TestModel>::new().unwrap().where_eq("id", 3i32);
        query.delete_on(&stub).await.unwrap();
        assert_eq!(stub.executed.lock()[0].0, "DELETE FROM test_models WHERE 1=1  AND (id = $1)");
    }

    struct SequencedStub {
        responses: Mutex<Vec<Vec<Row>>>,
        executed: Mutex<Vec<(String, Vec<Value>)>>,
    }

    #[async_trait]
    impl Queryable for SequencedStub {
        async fn query(&self, sql: &str, args: &[Value]) -> crate::Result<Vec<Row>> {
            self.executed.lock().push((sql.to_string(), args.to_vec()));
            Ok(self.responses.lock().remove(0))
        }
        async fn execute(&self, sql: &str, args: &[Value]) -> crate::Result<ResultSet> {
            self.executed.lock().push((sql.to_string(), args.to_vec()));
            Ok(ResultSet::default())
        }
        async fn begin(&self) -> crate::Result<Box<dyn crate::connector::Transaction>> {
            unimplemented!()
        }
        fn dialect(&self) -> Dialect {
            Dialect::Postgres
        }
    }

    #[derive(Default, Clone)]
    struct Child {
        id: i32,
        parent_id: i32,
        title: String,
        owner_name: String,
    }

    impl Entity for Child {
        fn describe() -> SchemaBuilder {
            SchemaBuilder::new()
                .table_name("children")
                .field(FieldDef::new("id").primary().auto_increment())
                .field(FieldDef::new("parent_id"))
                .field(FieldDef::new("title").kind(crate::schema::FieldKind::String))
        }
        fn get_field(&self, column: &str) -> Option<Value> {
            match column {
                "id" => Some(Value::int32(self.id)),
                "parent_id" => Some(Value::int32(self.parent_id)),
                "title" => Some(Value::text(self.title.clone())),
                _ => None,
            }
        }
        fn set_field(&mut self, column: &str, value: Value) -> crate::Result<()> {
            match column {
                "id" => self.id = value.as_i64().unwrap_or_default() as i32,
                "parent_id" => self.parent_id = value.as_i64().unwrap_or_default() as i32,
                "title" => self.title = value.as_str().unwrap_or_default().to_string(),
                _ => {}
            }
            Ok(())
        }
    }
    impl Hooks for Child {}

    impl RelationsOf for Child {
        fn relations() -> Vec<(&'static str, RelationDescriptor)> {
            vec![("owner", RelationDescriptor::belongs_to("Parent", "id"))]
        }

        fn eager_load<'a>(
            name: &'a str,
            conn: &'a dyn Queryable,
            binder: &'a Binder,
            children: &'a mut [Self],
        ) -> futures::future::BoxFuture<'a, crate::Result<()>> {
            Box::pin(async move {
                let relations = Self::relations();
                let descriptor = relations::resolve_relation(&relations, name, "Child")?;
                let related_schema = Schema::of::<Parent>()?;
                let keys: Vec<Value> = children.iter().map(|c| Value::int32(c.parent_id)).collect();
                let mut owners = relations::batch_belongs_to::<Parent>(conn, binder, &related_schema, descriptor, keys, &[]).await?;
                for child in children.iter_mut() {
                    if let Some(owner) = owners.remove(&Value::int32(child.parent_id).to_string()) {
                        child.owner_name = owner.name;
                    }
                }
                Ok(())
            })
        }
    }

    #[derive(Default, Clone)]
    struct Parent {
        id: i32,
        name: String,
        children: Vec<Child>,
    }

    impl Entity for Parent {
        fn describe() -> SchemaBuilder {
            SchemaBuilder::new()
                .table_name("parents")
                .field(FieldDef::new("id").primary().auto_increment())
                .field(FieldDef::new("name").kind(crate::schema::FieldKind::String))
        }
        fn get_field(&self, column: &str) -> Option<Value> {
            match column {
                "id" => Some(Value::int32(self.id)),
                "name" => Some(Value::text(self.name.clone())),
                _ => None,
            }
        }
        fn set_field(&mut self, column: &str, value: Value) -> crate::Result<()> {
            match column {
                "id" => self.id = value.as_i64().unwrap_or_default() as i32,
                "name" => self.name = value.as_str().unwrap_or_default().to_string(),
                _ => {}
            }
            Ok(())
        }
    }
    impl Hooks for Parent {}

    impl RelationsOf for Parent {
        fn relations() -> Vec<(&'static str, RelationDescriptor)> {
            vec![("children", RelationDescriptor::has_many("Parent", "id"))]
        }

        fn eager_load<'a>(
            name: &'a str,
            conn: &'a dyn Queryable,
            binder: &'a Binder,
            parents: &'a mut [Self],
        ) -> futures::future::BoxFuture<'a, crate::Result<()>> {
            Box::pin(async move {
                let relations = Self::relations();
                let descriptor = relations::resolve_relation(&relations, name, "Parent")?;
                let related_schema = Schema::of::<Child>()?;
                let keys: Vec<Value> = parents.iter().map(|p| Value::int32(p.id)).collect();
                let mut buckets = relations::batch_has::<Child>(conn, binder, &related_schema, descriptor, keys, &[]).await?;
                for parent in parents.iter_mut() {
                    parent.children = buckets.remove(&Value::int32(parent.id).to_string()).unwrap_or_default();
                }
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn get_on_resolves_with_relations_in_one_additional_batched_query() {
        use pretty_assertions::assert_eq;

        let stub = SequencedStub {
            responses: Mutex::new(vec![
                vec![
                    Row { columns: vec!["id".into(), "name".into()], values: vec![Value::int32(1), Value::text("p1")] },
                    Row { columns: vec!["id".into(), "name".into()], values: vec![Value::int32(2), Value::text("p2")] },
                ],
                vec![
                    Row {
                        columns: vec!["id".into(), "parent_id".into(), "title".into()],
                        values: vec![Value::int32(10), Value::int32(1), Value::text("c1")],
                    },
                    Row {
                        columns: vec!["id".into(), "parent_id".into(), "title".into()],
                        values: vec![Value::int32(11), Value::int32(2), Value::text("c2")],
                    },
                    Row {
                        columns: vec!["id".into(), "parent_id".into(), "title".into()],
                        values: vec![Value::int32(12), Value::int32(2), Value::text("c3")],
                    },
                ],
            ]),
            executed: Mutex::new(Vec::new()),
        };
        let c = ctx();
        let entities = Query::<Parent>::new().unwrap().with_relations(&["children"]).get_on(&stub, &c).await.unwrap();

        // one SELECT for parents, one batched SELECT for all their children - no N+1.
        assert_eq!(stub.executed.lock().len(), 2);

        let p1 = entities.iter().find(|p| p.id == 1).unwrap();
        let p2 = entities.iter().find(|p| p.id == 2).unwrap();
        assert_eq!(p1.children.iter().map(|c| c.title.clone()).collect::<Vec<_>>(), vec!["c1".to_string()]);
        assert_eq!(p2.children.iter().map(|c| c.title.clone()).collect::<Vec<_>>(), vec!["c2".to_string(), "c3".to_string()]);
    }

    #[tokio::test]
    async fn get_on_without_with_relations_leaves_children_empty() {
        let stub = SequencedStub {
            responses: Mutex::new(vec![vec![Row {
                columns: vec!["id".into(), "name".into()],
                values: vec![Value::int32(1), Value::text("p1")],
            }]]),
            executed: Mutex::new(Vec::new()),
        };
        let c = ctx();
        let entities = Query::<Parent>::new().unwrap().get_on(&stub, &c).await.unwrap();
        assert_eq!(stub.executed.lock().len(), 1);
        assert!(entities[0].children.is_empty());
    }

    #[tokio::test]
    async fn get_on_resolves_belongs_to_relation_in_one_additional_batched_query() {
        let stub = SequencedStub {
            responses: Mutex::new(vec![
                vec![
                    Row {
                        columns: vec!["id".into(), "parent_id".into(), "title".into()],
                        values: vec![Value::int32(10), Value::int32(1), Value::text("c1")],
                    },
                    Row {
                        columns: vec!["id".into(), "parent_id".into(), "title".into()],
                        values: vec![Value::int32(11), Value::int32(2), Value::text("c2")],
                    },
                ],
                vec![
                    Row { columns: vec!["id".into(), "name".into()], values: vec![Value::int32(1), Value::text("p1")] },
                    Row { columns: vec!["id".into(), "name".into()], values: vec![Value::int32(2), Value::text("p2")] },
                ],
            ]),
            executed: Mutex::new(Vec::new()),
        };
        let c = ctx();
        let entities = Query::<Child>::new().unwrap().with_relations(&["owner"]).get_on(&stub, &c).await.unwrap();

        assert_eq!(stub.executed.lock().len(), 2);
        let c1 = entities.iter().find(|c| c.id == 10).unwrap();
        let c2 = entities.iter().find(|c| c.id == 11).unwrap();
        assert_eq!(c1.owner_name, "p1");
        assert_eq!(c2.owner_name, "p2");
    }

    #[tokio::test]
    async fn get_on_reports_unrecognized_relation_names() {
        let stub = SequencedStub {
            responses: Mutex::new(vec![vec![Row {
                columns: vec!["id".into(), "name".into()],
                values: vec![Value::int32(1), Value::text("p1")],
            }]]),
            executed: Mutex::new(Vec::new()),
        };
        let c = ctx();
        let err = Query::<Parent>::new().unwrap().with_relations(&["nope"]).get_on(&stub, &c).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::RelationNotFound { .. }));
    }
}
