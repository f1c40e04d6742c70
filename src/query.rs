//! Query State & Emitter: the fluent builder bound to one
//! entity type.
//!
//! Rust has no argument-shape polymorphism: a single overloaded
//! `where(arg)` that dispatches on a column/value pair, a
//! three-argument operator form, a raw fragment, a map, and a
//! sub-builder callback isn't expressible as one method. Each shape
//! gets its own concretely-named method here instead — `where_eq`/
//! `where_op`/`where_raw`/`where_map`/`where_group` rather than one
//! overloaded `where`.

use crate::ast::{in_clause, Cte, Fragment, GroupBy, Insert, Joiner, LockMode, Select, Update, Value};
use crate::error::Error;
use crate::identifier::validate_identifier;
use crate::relations;
use crate::router::RouteOverride;
use crate::schema::{Entity, RelationsOf, Schema};
use indexmap::IndexMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// The composable, caller-owned state of one pending query.
/// `Clone` is a deep copy: diverging two queries from a shared prefix
/// never aliases state.
#[derive(Clone, Default)]
pub struct QueryState {
    pub select: Select,
    pub relations: Vec<String>,
    pub omit_columns: std::collections::HashSet<String>,
    pub raw_override: Option<(String, Vec<Value>)>,
    pub table_override: Option<String>,
    pub route_override: RouteOverride,
    pub tx_bound: bool,
    pub build_error: Option<Error>,
}

/// A query bound to entity type `T`.
///
/// `Clone` is implemented by hand: a derived impl would require `T:
/// Clone` even though `T` only ever appears behind `PhantomData`, which
/// would needlessly constrain every caller — diverging two queries
/// from a shared prefix only needs the state itself to be cloned.
pub struct Query<T: Entity> {
    pub(crate) state: QueryState,
    pub(crate) schema: Arc<Schema>,
    _marker: PhantomData<T>,
}

impl<T: Entity> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self { state: self.state.clone(), schema: self.schema.clone(), _marker: PhantomData }
    }
}

impl<T: Entity> Query<T> {
    pub fn new() -> crate::Result<Self> {
        let schema = Schema::of::<T>()?;
        let select = Select::from_table(schema.table_name.clone());
        Ok(Self { state: QueryState { select, ..Default::default() }, schema, _marker: PhantomData })
    }

    fn record_error(&mut self, err: Error) {
        if self.state.build_error.is_none() {
            self.state.build_error = Some(err);
        }
    }

    /// Validate `col`, recording (not raising) a build error on
    /// failure so a long fluent chain always type-checks.
    fn validated(&mut self, col: &str) -> bool {
        if let Err(e) = validate_identifier(col) {
            self.record_error(e);
            false
        } else {
            true
        }
    }

    #[must_use]
    pub fn select(mut self, columns: &[&str]) -> Self {
        for col in columns {
            if self.validated(col) {
                self.state.select.columns.push(col.to_string());
            }
        }
        self
    }

    #[must_use]
    pub fn distinct(mut self) -> Self {
        self.state.select.distinct = true;
        self
    }

    #[must_use]
    pub fn distinct_on(mut self, columns: &[&str]) -> Self {
        self.state.select.distinct = true;
        for col in columns {
            if self.validated(col) {
                self.state.select.distinct_on.push(col.to_string());
            }
        }
        self
    }

    fn push_where(&mut self, joiner_for_or: Joiner, text: String, args: Vec<Value>) {
        let joiner = if self.state.select.wheres.is_empty() { None } else { Some(joiner_for_or) };
        self.state.select.wheres.push(Fragment { joiner, text });
        self.state.select.args.extend(args);
    }

    /// `column = ?`.
    #[must_use]
    pub fn where_eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        if self.validated(column) {
            self.push_where(Joiner::And, format!("({column} = ?)"), vec![value.into()]);
        }
        self
    }

    #[must_use]
    pub fn or_where_eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        if self.validated(column) {
            self.push_where(Joiner::Or, format!("({column} = ?)"), vec![value.into()]);
        }
        self
    }

    /// `column <op> ?` for a caller-chosen comparison operator
    /// (`>`, `<=`, `!=`, `LIKE`, …).
    #[must_use]
    pub fn where_op(mut self, column: &str, op: &str, value: impl Into<Value>) -> Self {
        if self.validated(column) {
            self.push_where(Joiner::And, format!("({column} {op} ?)"), vec![value.into()]);
        }
        self
    }

    #[must_use]
    pub fn or_where_op(mut self, column: &str, op: &str, value: impl Into<Value>) -> Self {
        if self.validated(column) {
            self.push_where(Joiner::Or, format!("({column} {op} ?)"), vec![value.into()]);
        }
        self
    }

    /// Append a verbatim fragment (already containing its own `?`s).
    #[must_use]
    pub fn where_raw(mut self, fragment: &str, args: Vec<Value>) -> Self {
        self.push_where(Joiner::And, format!("({fragment})"), args);
        self
    }

    #[must_use]
    pub fn or_where_raw(mut self, fragment: &str, args: Vec<Value>) -> Self {
        self.push_where(Joiner::Or, format!("({fragment})"), args);
        self
    }

    /// Every key becomes `column = ?`, joined with `AND` and wrapped in
    /// one group; iteration order doesn't affect correctness.
    #[must_use]
    pub fn where_map(mut self, map: &IndexMap<String, Value>) -> Self {
        if map.is_empty() {
            return self;
        }
        let mut parts = Vec::with_capacity(map.len());
        let mut args = Vec::with_capacity(map.len());
        for (col, val) in map {
            if !self.validated(col) {
                continue;
            }
            parts.push(format!("{col} = ?"));
            args.push(val.clone());
        }
        let text = format!("({})", parts.join(" AND "));
        self.push_where(Joiner::And, text, args);
        self
    }

    /// Every non-zero field on `entity` becomes `column = ?`;
    /// zero-valued fields are treated as absent. An explicit
    /// `where_map` is available when a zero value should still
    /// constrain the query.
    #[must_use]
    pub fn where_struct(mut self, entity: &T) -> Self {
        let mut map = IndexMap::new();
        for field in &self.schema.fields {
            if let Some(value) = entity.get_field(&field.column_name) {
                if !value.is_zero() {
                    map.insert(field.column_name.clone(), value);
                }
            }
        }
        self.where_map(&map)
    }

    /// Builds a detached sub-query, invokes `build`, and appends its
    /// clauses inside one `( … )` group.
    #[must_use]
    pub fn where_group(mut self, build: impl FnOnce(Query<T>) -> Query<T>) -> Self {
        let sub = Query { state: QueryState::default(), schema: self.schema.clone(), _marker: PhantomData };
        let sub = build(sub);
        if let Some(err) = sub.state.build_error {
            self.record_error(err);
            return self;
        }
        if sub.state.select.wheres.is_empty() {
            return self;
        }
        let mut text = String::from("(");
        for (i, fragment) in sub.state.select.wheres.iter().enumerate() {
            if i > 0 {
                text.push(' ');
                text.push_str(fragment.joiner.map(Joiner::as_sql).unwrap_or("AND"));
                text.push(' ');
            }
            text.push_str(&fragment.text);
        }
        text.push(')');
        self.push_where(Joiner::And, text, sub.state.select.args);
        self
    }

    #[must_use]
    pub fn where_in(mut self, column: &str, values: &[Value]) -> Self {
        if self.validated(column) {
            let (text, args) = in_clause(column, values);
            self.push_where(Joiner::And, format!("({text})"), args);
        }
        self
    }

    /// `to_tsvector('english', col) @@ plainto_tsquery('english', ?)`
    ///. PostgreSQL-only; other dialects still emit the same
    /// text, since the crate performs no dialect-specific rewriting
    /// beyond placeholder rebinding.
    #[must_use]
    pub fn where_fts(mut self, column: &str, query: &str) -> Self {
        self.where_fts_with_config(column, query, "english")
    }

    #[must_use]
    pub fn where_fts_with_config(mut self, column: &str, query: &str, config: &str) -> Self {
        if self.validated(column) {
            let text = format!("(to_tsvector('{config}', {column}) @@ plainto_tsquery('{config}', ?))");
            self.push_where(Joiner::And, text, vec![Value::text(query)]);
        }
        self
    }

    /// `phraseto_tsquery` phrase-search variant of [`Self::where_fts`].
    #[must_use]
    pub fn where_fts_phrase(mut self, column: &str, query: &str) -> Self {
        self.where_fts_phrase_with_config(column, query, "english")
    }

    #[must_use]
    pub fn where_fts_phrase_with_config(mut self, column: &str, query: &str, config: &str) -> Self {
        if self.validated(column) {
            let text = format!("(to_tsvector('{config}', {column}) @@ phraseto_tsquery('{config}', ?))");
            self.push_where(Joiner::And, text, vec![Value::text(query)]);
        }
        self
    }

    /// `tsvector_column @@ to_tsquery('english', ?)` for a precomputed
    /// tsvector column — no `to_tsvector(...)` wrapping, since
    /// the column already holds a tsvector.
    #[must_use]
    pub fn where_fts_precomputed(mut self, tsvector_column: &str, query: &str) -> Self {
        self.where_fts_precomputed_with_config(tsvector_column, query, "english")
    }

    #[must_use]
    pub fn where_fts_precomputed_with_config(mut self, tsvector_column: &str, query: &str, config: &str) -> Self {
        if self.validated(tsvector_column) {
            let text = format!("({tsvector_column} @@ to_tsquery('{config}', ?))");
            self.push_where(Joiner::And, text, vec![Value::text(query)]);
        }
        self
    }

    #[must_use]
    pub fn where_null(mut self, column: &str) -> Self {
        if self.validated(column) {
            self.push_where(Joiner::And, format!("({column} IS NULL)"), vec![]);
        }
        self
    }

    #[must_use]
    pub fn where_not_null(mut self, column: &str) -> Self {
        if self.validated(column) {
            self.push_where(Joiner::And, format!("({column} IS NOT NULL)"), vec![]);
        }
        self
    }

    #[must_use]
    pub fn order_by(mut self, column: &str, direction: &str) -> Self {
        if self.validated(column) {
            self.state.select.order_bys.push(crate::ast::OrderBy {
                column: column.to_string(),
                direction: crate::ast::Direction::parse_or_asc(direction),
            });
        }
        self
    }

    #[must_use]
    pub fn latest(self, column: Option<&str>) -> Self {
        self.order_by(column.unwrap_or("created_at"), "DESC")
    }

    #[must_use]
    pub fn oldest(self, column: Option<&str>) -> Self {
        self.order_by(column.unwrap_or("created_at"), "ASC")
    }

    #[must_use]
    pub fn group_by(mut self, columns: &[&str]) -> Self {
        self.state.select.group_bys.push(GroupBy::Plain(columns.iter().map(|c| c.to_string()).collect()));
        self
    }

    #[must_use]
    pub fn group_by_rollup(mut self, columns: &[&str]) -> Self {
        self.state.select.group_bys.push(GroupBy::Rollup(columns.iter().map(|c| c.to_string()).collect()));
        self
    }

    #[must_use]
    pub fn group_by_cube(mut self, columns: &[&str]) -> Self {
        self.state.select.group_bys.push(GroupBy::Cube(columns.iter().map(|c| c.to_string()).collect()));
        self
    }

    #[must_use]
    pub fn group_by_grouping_sets(mut self, groups: &[&[&str]]) -> Self {
        let sets = groups.iter().map(|g| g.iter().map(|c| c.to_string()).collect()).collect();
        self.state.select.group_bys.push(GroupBy::GroupingSets(sets));
        self
    }

    #[must_use]
    pub fn having(mut self, fragment: &str, args: Vec<Value>) -> Self {
        self.state.select.havings.push(Fragment { joiner: None, text: fragment.to_string() });
        self.state.select.having_args.extend(args);
        self
    }

    /// Values `<= 0` are treated as unset.
    #[must_use]
    pub fn limit(mut self, n: i64) -> Self {
        self.state.select.limit = if n > 0 { Some(n) } else { None };
        self
    }

    #[must_use]
    pub fn offset(mut self, n: i64) -> Self {
        self.state.select.offset = if n > 0 { Some(n) } else { None };
        self
    }

    #[must_use]
    pub fn lock(mut self, mode: &str) -> Self {
        match LockMode::parse(mode) {
            Some(mode) => self.state.select.lock_mode = Some(mode),
            None => self.record_error(
                Error::new(crate::error::ErrorKind::InvalidSyntax).with_query(format!("unknown lock mode {mode:?}"), 0),
            ),
        }
        self
    }

    #[must_use]
    pub fn with_cte(mut self, name: &str, body: &str, body_args: Vec<Value>) -> Self {
        if self.validated(name) {
            self.state.select.ctes.push(Cte { name: name.to_string(), body: body.to_string(), body_args });
        }
        self
    }

    /// Builds a detached sub-query, invokes `build`, and installs the
    /// resulting SELECT as the CTE body, contributing its own args —
    /// the same sub-builder pattern [`Self::where_group`] uses, so a
    /// CTE body never needs its args threaded through by hand.
    #[must_use]
    pub fn with_cte_query(mut self, name: &str, build: impl FnOnce(Query<T>) -> Query<T>) -> Self {
        if !self.validated(name) {
            return self;
        }
        let select = Select::from_table(self.schema.table_name.clone());
        let sub = Query { state: QueryState { select, ..Default::default() }, schema: self.schema.clone(), _marker: PhantomData };
        let sub = build(sub);
        if let Some(err) = sub.state.build_error {
            self.record_error(err);
            return self;
        }
        let (body, body_args) = crate::visitor::render_cte_body(&sub.state.select);
        self.state.select.ctes.push(Cte { name: name.to_string(), body, body_args });
        self
    }

    #[must_use]
    pub fn table(mut self, name: &str) -> Self {
        if self.validated(name) {
            self.state.table_override = Some(name.to_string());
            self.state.select.table = name.to_string();
        }
        self
    }

    #[must_use]
    pub fn omit_columns(mut self, columns: &[&str]) -> Self {
        self.state.omit_columns.extend(columns.iter().map(|c| c.to_string()));
        self
    }

    #[must_use]
    pub fn use_primary(mut self) -> Self {
        self.state.route_override = RouteOverride::Primary;
        self
    }

    #[must_use]
    pub fn use_replica(mut self, index: usize) -> Self {
        self.state.route_override = RouteOverride::Replica(index);
        self
    }

    /// Apply a user function to the current state, returning the
    /// result — a `Clone`-based composition helper for building up
    /// conditional query chains inline.
    #[must_use]
    pub fn scope(self, f: impl FnOnce(Self) -> Self) -> Self {
        f(self)
    }

    #[must_use]
    pub fn raw(mut self, sql: &str, args: Vec<Value>) -> Self {
        self.state.raw_override = Some((sql.to_string(), args));
        self
    }

    /// Sticky build error recorded by a prior builder call, if any.
    pub fn build_error(&self) -> Option<&Error> {
        self.state.build_error.as_ref()
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn into_select(self) -> crate::Result<Select> {
        if let Some(err) = self.state.build_error {
            return Err(err);
        }
        Ok(self.state.select)
    }

    /// Build the base `UPDATE` AST for this query's table/WHERE clause
    /// (used by `update_many`/`update_many_by_key`; see [`crate::executor`]).
    pub fn into_update_base(&self) -> Update {
        let mut update = Update::table(self.state.select.table.clone());
        update.wheres = self.state.select.wheres.clone();
        update.args = self.state.select.args.clone();
        update
    }

    pub fn into_delete(&self) -> crate::ast::Delete {
        let mut delete = crate::ast::Delete::from_table(self.state.select.table.clone());
        delete.wheres = self.state.select.wheres.clone();
        delete.args = self.state.select.args.clone();
        delete
    }
}

impl<T: Entity + RelationsOf> Query<T> {
    /// Queue `name` for eager loading: the executor's `get`/`get_on`
    /// groups these by root relation and resolves each through `T`'s
    /// own [`crate::schema::RelationsOf::eager_load`] override.
    #[must_use]
    pub fn with_relations(mut self, specs: &[&str]) -> Self {
        self.state.relations.extend(specs.iter().map(|s| s.to_string()));
        self
    }

    /// `EXISTS (SELECT 1 FROM related_table WHERE related_table.FK =
    /// parent_table.PK [AND sub_builder_clauses])`. Only
    /// `HasOne`/`HasMany` edges describe a foreign key pointing back at
    /// this table, so those are the only descriptors `where_has`
    /// accepts.
    #[must_use]
    pub fn where_has(mut self, relation_name: &str, sub: Option<impl FnOnce(Query<T>) -> Query<T>>) -> Self {
        let relations = T::relations();
        let descriptor = match relations::resolve_relation(&relations, relation_name, self.schema.type_name) {
            Ok(d) => d.clone(),
            Err(e) => {
                self.record_error(e);
                return self;
            }
        };

        let (related_table, fk, pk) = match &descriptor {
            crate::schema::RelationDescriptor::HasOne { foreign_key, local_key, override_table }
            | crate::schema::RelationDescriptor::HasMany { foreign_key, local_key, override_table } => {
                (override_table.clone().unwrap_or_else(|| relation_name.to_string()), foreign_key.clone(), local_key.clone())
            }
            _ => {
                self.record_error(Error::new(crate::error::ErrorKind::InvalidRelationConfig(
                    "where_has only supports HasOne/HasMany relations".into(),
                )));
                return self;
            }
        };

        let mut text = format!(
            "EXISTS (SELECT 1 FROM {related_table} WHERE {related_table}.{fk} = {}.{pk}",
            self.state.table_override.clone().unwrap_or_else(|| self.schema.table_name.clone())
        );
        let mut args = Vec::new();

        if let Some(build) = sub {
            let inner = Query { state: QueryState::default(), schema: self.schema.clone(), _marker: PhantomData };
            let inner = build(inner);
            for fragment in &inner.state.select.wheres {
                text.push_str(" AND ");
                text.push_str(&fragment.text);
            }
            args.extend(inner.state.select.args);
        }
        text.push(')');

        self.push_where(Joiner::And, text, args);
        self
    }
}

/// Build an `INSERT` statement from an entity's mapped, non-auto-
/// increment-zero columns.
pub fn insert_for<T: Entity>(entity: &T, schema: &Schema) -> Insert {
    let mut insert = Insert::single_into(schema.table_name.clone());
    for field in &schema.fields {
        if field.is_auto_increment {
            if let Some(value) = entity.get_field(&field.column_name) {
                if value.is_zero() {
                    continue;
                }
            }
        }
        if let Some(value) = entity.get_field(&field.column_name) {
            insert = insert.value(field.column_name.clone(), value);
        }
    }
    insert.returning = Some(schema.primary_key.clone());
    insert
}
