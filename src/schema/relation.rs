//! The relation descriptor sum type.

use std::collections::HashMap;

/// A relation edge from one entity to another (or, for `MorphTo`, to
/// one of several possible entities).
#[derive(Debug, Clone)]
pub enum RelationDescriptor {
    HasOne {
        foreign_key: String,
        local_key: String,
        override_table: Option<String>,
    },
    HasMany {
        foreign_key: String,
        local_key: String,
        override_table: Option<String>,
    },
    BelongsTo {
        foreign_key: String,
        owner_key: String,
        override_table: Option<String>,
    },
    BelongsToMany {
        pivot_table: String,
        foreign_key: String,
        related_key: String,
        local_key: String,
        related_pk: String,
        override_table: Option<String>,
    },
    MorphTo {
        type_column: String,
        id_column: String,
        /// Discriminator value → target table name.
        type_registry: HashMap<String, String>,
    },
    MorphOne {
        type_column: String,
        id_column: String,
        override_table: Option<String>,
    },
    MorphMany {
        type_column: String,
        id_column: String,
        override_table: Option<String>,
    },
}

impl RelationDescriptor {
    /// Default `foreign_key`: `snake_case(parent_type_name) + "_id"`.
    pub fn default_foreign_key(parent_type_name: &str) -> String {
        format!("{}_id", crate::schema::naming::snake_case(parent_type_name))
    }

    /// Default `related_key`: `snake_case(related_type_name) + "_id"`.
    pub fn default_related_key(related_type_name: &str) -> String {
        format!("{}_id", crate::schema::naming::snake_case(related_type_name))
    }

    pub fn has_one(parent_type_name: &str, parent_pk: &str) -> Self {
        RelationDescriptor::HasOne {
            foreign_key: Self::default_foreign_key(parent_type_name),
            local_key: parent_pk.to_string(),
            override_table: None,
        }
    }

    pub fn has_many(parent_type_name: &str, parent_pk: &str) -> Self {
        RelationDescriptor::HasMany {
            foreign_key: Self::default_foreign_key(parent_type_name),
            local_key: parent_pk.to_string(),
            override_table: None,
        }
    }

    pub fn belongs_to(related_type_name: &str, related_pk: &str) -> Self {
        RelationDescriptor::BelongsTo {
            foreign_key: Self::default_related_key(related_type_name),
            owner_key: related_pk.to_string(),
            override_table: None,
        }
    }

    pub fn belongs_to_many(
        pivot_table: impl Into<String>,
        parent_type_name: &str,
        related_type_name: &str,
        parent_pk: &str,
        related_pk: &str,
    ) -> Self {
        RelationDescriptor::BelongsToMany {
            pivot_table: pivot_table.into(),
            foreign_key: Self::default_foreign_key(parent_type_name),
            related_key: Self::default_related_key(related_type_name),
            local_key: parent_pk.to_string(),
            related_pk: related_pk.to_string(),
            override_table: None,
        }
    }

    /// `true` when this edge targets exactly one related row
    /// (`HasOne`, `BelongsTo`, `MorphOne`).
    pub fn is_single(&self) -> bool {
        matches!(
            self,
            RelationDescriptor::HasOne { .. } | RelationDescriptor::BelongsTo { .. } | RelationDescriptor::MorphOne { .. }
        )
    }
}
