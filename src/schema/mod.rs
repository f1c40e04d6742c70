//! Entity Schema Registry.
//!
//! Rust has no runtime reflection, so the "walk declared fields"
//! introspection pass is expressed as a trait each entity type
//! implements once (`Entity::describe`), run a single time per type
//! and memoized in a type-keyed map. A real downstream application
//! would normally generate `describe()` with a derive macro; this
//! crate defines the stable target shape that macro (or a
//! hand-written impl) must produce.

pub mod naming;
pub mod relation;

pub use relation::RelationDescriptor;

use crate::ast::Value;
use crate::error::{Error, ErrorKind};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// The coercion family a mapped column belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldKind {
    #[default]
    SignedInt,
    UnsignedInt,
    Float,
    Boolean,
    String,
    Time,
    Json,
    Bytes,
    /// Delegated to the field's own scan capability; the binder passes
    /// the raw driven value through unconverted.
    Scanner,
}

/// One mapped column.
#[derive(Debug, Clone)]
pub struct FieldSchema {
    pub struct_name: &'static str,
    pub column_name: String,
    pub index_path: Vec<usize>,
    pub is_primary: bool,
    pub is_auto_increment: bool,
    pub kind: FieldKind,
    pub nullable: bool,
}

/// An entity's introspected, immutable description.
#[derive(Debug)]
pub struct Schema {
    pub type_name: &'static str,
    pub table_name: String,
    pub primary_key: String,
    pub fields: Vec<FieldSchema>,
    pub column_index: IndexMap<String, usize>,
    pub relation_methods: IndexMap<String, usize>,
    pub accessor_methods: IndexMap<String, usize>,
}

impl Schema {
    pub fn field_by_column(&self, column: &str) -> Option<&FieldSchema> {
        self.column_index.get(column).map(|&i| &self.fields[i])
    }

    pub fn primary_key_field(&self) -> &FieldSchema {
        self.field_by_column(&self.primary_key)
            .expect("invariant: primary_key is always reachable through column_index")
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.column_name.as_str())
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.column_index.contains_key(column)
    }

    pub fn has_relation(&self, name: &str) -> bool {
        self.relation_methods.contains_key(name) || self.relation_methods.contains_key(&format!("{name}Relation"))
    }
}

/// A single field declaration, as produced by `Entity::describe()`.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub struct_name: &'static str,
    pub column_override: Option<String>,
    pub index_path: Vec<usize>,
    pub is_primary: bool,
    pub is_auto_increment: bool,
    pub kind: FieldKind,
    pub nullable: bool,
}

impl FieldDef {
    pub fn new(struct_name: &'static str) -> Self {
        Self {
            struct_name,
            column_override: None,
            index_path: vec![0],
            is_primary: false,
            is_auto_increment: false,
            kind: FieldKind::default(),
            nullable: false,
        }
    }

    #[must_use]
    pub fn column(mut self, name: impl Into<String>) -> Self {
        self.column_override = Some(name.into());
        self
    }

    #[must_use]
    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }

    #[must_use]
    pub fn auto_increment(mut self) -> Self {
        self.is_auto_increment = true;
        self
    }

    #[must_use]
    pub fn index_path(mut self, path: Vec<usize>) -> Self {
        self.index_path = path;
        self
    }

    #[must_use]
    pub fn kind(mut self, kind: FieldKind) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// Declarative schema construction, consumed once by [`Schema::of`].
#[derive(Debug, Clone, Default)]
pub struct SchemaBuilder {
    table_name: Option<String>,
    primary_key: Option<String>,
    fields: Vec<FieldDef>,
    relation_methods: Vec<&'static str>,
    accessor_methods: Vec<&'static str>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn table_name(mut self, name: impl Into<String>) -> Self {
        self.table_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn primary_key(mut self, name: impl Into<String>) -> Self {
        self.primary_key = Some(name.into());
        self
    }

    #[must_use]
    pub fn field(mut self, def: FieldDef) -> Self {
        self.fields.push(def);
        self
    }

    #[must_use]
    pub fn relation_method(mut self, name: &'static str) -> Self {
        self.relation_methods.push(name);
        self
    }

    #[must_use]
    pub fn accessor_method(mut self, name: &'static str) -> Self {
        self.accessor_methods.push(name);
        self
    }

    fn build(self, type_name: &'static str, bare_type_name: &str) -> crate::Result<Schema> {
        let table_name = self
            .table_name
            .unwrap_or_else(|| naming::default_table_name(bare_type_name));

        let mut fields = Vec::with_capacity(self.fields.len());
        let mut column_index = IndexMap::new();

        for def in &self.fields {
            let column_name = match &def.column_override {
                Some(name) if name.is_empty() => {
                    return Err(Error::new(ErrorKind::SchemaBuild(format!(
                        "field {} has an empty column override",
                        def.struct_name
                    ))));
                }
                Some(name) => name.clone(),
                None => naming::snake_case(def.struct_name),
            };

            if column_index.contains_key(&column_name) {
                return Err(Error::new(ErrorKind::SchemaBuild(format!(
                    "duplicate column name {column_name:?} in schema for {type_name}"
                ))));
            }

            let idx = fields.len();
            column_index.insert(column_name.clone(), idx);
            fields.push(FieldSchema {
                struct_name: def.struct_name,
                column_name,
                index_path: def.index_path.clone(),
                is_primary: def.is_primary,
                is_auto_increment: def.is_auto_increment,
                kind: def.kind,
                nullable: def.nullable,
            });
        }

        let primary_key = match self.primary_key {
            Some(name) => {
                if !column_index.contains_key(&name) {
                    return Err(Error::new(ErrorKind::SchemaBuild(format!(
                        "primary key override {name:?} does not name a mapped column on {type_name}"
                    ))));
                }
                fields[column_index[&name]].is_primary = true;
                name
            }
            None => {
                if let Some(field) = fields.iter().find(|f| f.is_primary) {
                    field.column_name.clone()
                } else if column_index.contains_key("id") {
                    fields[column_index["id"]].is_primary = true;
                    "id".to_string()
                } else {
                    return Err(Error::new(ErrorKind::SchemaBuild(format!(
                        "no primary key could be found for {type_name}: mark a field primary() or add an `id` column"
                    ))));
                }
            }
        };

        let relation_methods = self
            .relation_methods
            .iter()
            .enumerate()
            .map(|(i, name)| (name.to_string(), i))
            .collect();
        let accessor_methods = self
            .accessor_methods
            .iter()
            .enumerate()
            .map(|(i, name)| (name.to_string(), i))
            .collect();

        Ok(Schema {
            type_name,
            table_name,
            primary_key,
            fields,
            column_index,
            relation_methods,
            accessor_methods,
        })
    }
}

/// Implemented once per entity type. `describe()` is called exactly
/// once per process, the first time [`Schema::of`] is invoked for
/// `Self`; its result is memoized for the rest of the process
/// lifetime, idempotently and concurrent-safely by type identity.
pub trait Entity: Sized + Send + Sync + 'static {
    fn describe() -> SchemaBuilder;

    /// Read a mapped column's current value off `self`.
    fn get_field(&self, column: &str) -> Option<Value>;

    /// Write a mapped column's value onto `self`.
    fn set_field(&mut self, column: &str, value: Value) -> crate::Result<()>;
}

/// A type's declared relations: a list of `(name, descriptor)` pairs
/// rather than runtime method lookup by name.
pub trait RelationsOf: Entity {
    fn relations() -> Vec<(&'static str, RelationDescriptor)> {
        Vec::new()
    }

    /// Eager-load the relation named `name` into every entity in
    /// `parents`, in one batched query. A [`RelationDescriptor`] alone
    /// never carries the related Rust type, so there's no generic way
    /// to fetch or assign it here; entities that want
    /// `Query::with_relations` support override this, typically
    /// resolving their own descriptor through
    /// [`crate::relations::resolve_relation`] against `Self::relations()`,
    /// fetching through the matching `crate::relations::batch_*`
    /// function, and assigning the bucketed results directly onto the
    /// matching struct field (`set_field` only threads scalar mapped
    /// columns, not nested relation slots). The default reports the
    /// relation as unknown, the same outcome an un-found descriptor
    /// name produces during `where_has`.
    fn eager_load<'a>(
        name: &'a str,
        _conn: &'a dyn crate::connector::Queryable,
        _binder: &'a crate::binder::Binder,
        _parents: &'a mut [Self],
    ) -> futures::future::BoxFuture<'a, crate::Result<()>> {
        let entity = short_type_name(std::any::type_name::<Self>()).to_string();
        let relation = name.to_string();
        Box::pin(async move { Err(Error::new(ErrorKind::RelationNotFound { entity, relation })) })
    }
}

/// Computed, read-only attributes exposed per-instance.
pub trait Accessors: Entity {
    fn accessors(&self) -> Vec<(&'static str, Value)> {
        Vec::new()
    }
}

static REGISTRY: Lazy<RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// `std::any::type_name` returns the fully module-qualified path
/// (`my_crate::models::User`); the default table-name rule operates on
/// the bare type name, so strip everything up to the last `::`.
fn short_type_name(type_name: &str) -> &str {
    type_name.rsplit("::").next().unwrap_or(type_name)
}

impl Schema {
    /// Introspect (on first call) or fetch the memoized schema for `T`.
    pub fn of<T: Entity>() -> crate::Result<Arc<Schema>> {
        let type_id = TypeId::of::<T>();

        if let Some(existing) = REGISTRY.read().get(&type_id) {
            return Ok(existing
                .clone()
                .downcast::<Schema>()
                .expect("registry entry type matches TypeId key"));
        }

        let type_name = std::any::type_name::<T>();
        let schema = Arc::new(T::describe().build(type_name, short_type_name(type_name))?);

        let mut guard = REGISTRY.write();
        let entry = guard
            .entry(type_id)
            .or_insert_with(|| schema.clone() as Arc<dyn Any + Send + Sync>);
        Ok(entry.clone().downcast::<Schema>().expect("registry entry type matches TypeId key"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestModel {
        id: i32,
        name: String,
        user_age: i32,
    }

    impl Entity for TestModel {
        fn describe() -> SchemaBuilder {
            SchemaBuilder::new()
                .table_name("test_models")
                .field(FieldDef::new("id").primary().auto_increment())
                .field(FieldDef::new("name"))
                .field(FieldDef::new("user_age").column("user_age"))
        }

        fn get_field(&self, column: &str) -> Option<Value> {
            match column {
                "id" => Some(Value::int32(self.id)),
                "name" => Some(Value::text(self.name.clone())),
                "user_age" => Some(Value::int32(self.user_age)),
                _ => None,
            }
        }

        fn set_field(&mut self, column: &str, value: Value) -> crate::Result<()> {
            match column {
                "id" => self.id = value.as_i64().unwrap_or_default() as i32,
                "name" => self.name = value.as_str().unwrap_or_default().to_string(),
                "user_age" => self.user_age = value.as_i64().unwrap_or_default() as i32,
                _ => {}
            }
            Ok(())
        }
    }

    #[test]
    fn schema_derives_table_name_and_primary_key() {
        let schema = Schema::of::<TestModel>().unwrap();
        assert_eq!(schema.table_name, "test_models");
        assert_eq!(schema.primary_key, "id");
        assert!(schema.has_column("user_age"));
    }

    #[test]
    fn schema_of_is_idempotent() {
        let a = Schema::of::<TestModel>().unwrap();
        let b = Schema::of::<TestModel>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn schema_of_is_concurrent_safe() {
        use std::thread;
        let handles: Vec<_> = (0..8).map(|_| thread::spawn(Schema::of::<TestModel>)).collect();
        let schemas: Vec<_> = handles.into_iter().map(|h| h.join().unwrap().unwrap()).collect();
        for s in &schemas[1..] {
            assert!(Arc::ptr_eq(&schemas[0], s));
        }
    }

    struct Dup {
        a: i32,
    }

    impl Entity for Dup {
        fn describe() -> SchemaBuilder {
            SchemaBuilder::new()
                .field(FieldDef::new("a").column("x"))
                .field(FieldDef::new("b").column("x"))
        }
        fn get_field(&self, _: &str) -> Option<Value> {
            None
        }
        fn set_field(&mut self, _: &str, _: Value) -> crate::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn duplicate_columns_are_rejected() {
        let err = Schema::of::<Dup>().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::SchemaBuild(_)));
    }

    mod nested {
        use super::*;

        pub struct WidgetRecord {
            pub id: i32,
        }

        impl Entity for WidgetRecord {
            fn describe() -> SchemaBuilder {
                SchemaBuilder::new().field(FieldDef::new("id").primary().auto_increment())
            }
            fn get_field(&self, column: &str) -> Option<Value> {
                match column {
                    "id" => Some(Value::int32(self.id)),
                    _ => None,
                }
            }
            fn set_field(&mut self, column: &str, value: Value) -> crate::Result<()> {
                if column == "id" {
                    self.id = value.as_i64().unwrap_or_default() as i32;
                }
                Ok(())
            }
        }
    }

    #[test]
    fn default_table_name_ignores_module_path() {
        // WidgetRecord never calls .table_name(...), so this exercises
        // naming::default_table_name against a fully-qualified type_name.
        let schema = Schema::of::<nested::WidgetRecord>().unwrap();
        assert_eq!(schema.table_name, "widget_records");
        assert!(!schema.table_name.contains("::"));
    }
}
