//! Structured error taxonomy.
//!
//! Every fallible path in the crate — build errors, driver errors, and
//! logic errors — surfaces through this one [`Error`] type so callers
//! write a single `match err.kind() { .. }` arm set regardless of which
//! layer failed.

use std::fmt;

/// The crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// A classified, context-carrying error.
///
/// `Display` prints a short, human-readable summary; the full SQL text
/// and argument list that were being executed when the error occurred
/// are available through [`Error::sql`] and [`Error::args_len`] rather
/// than being folded into `Display`, so logs stay short by default.
#[derive(Debug, thiserror::Error)]
pub struct Error {
    kind: ErrorKind,
    operation: Option<&'static str>,
    sql: Option<String>,
    args_len: usize,
    table: Option<Name>,
    constraint: Option<Name>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    /// Build an error from a classified kind with no further context.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            operation: None,
            sql: None,
            args_len: 0,
            table: None,
            constraint: None,
            source: None,
        }
    }

    /// Attach the operation name that was being performed.
    #[must_use]
    pub fn with_operation(mut self, operation: &'static str) -> Self {
        self.operation = Some(operation);
        self
    }

    /// Attach the SQL text and argument count that were executed.
    #[must_use]
    pub fn with_query(mut self, sql: impl Into<String>, args_len: usize) -> Self {
        self.sql = Some(sql.into());
        self.args_len = args_len;
        self
    }

    /// Attach the table this error pertains to, if known.
    #[must_use]
    pub fn with_table(mut self, table: impl Into<Name>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Attach the constraint name this error pertains to, if known.
    #[must_use]
    pub fn with_constraint(mut self, constraint: impl Into<Name>) -> Self {
        self.constraint = Some(constraint.into());
        self
    }

    /// Attach the underlying driver/source error.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// The classified error kind, for `match`-based handling.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// The operation that was being performed, if recorded.
    pub fn operation(&self) -> Option<&'static str> {
        self.operation
    }

    /// The SQL text that was being executed, if recorded.
    pub fn sql(&self) -> Option<&str> {
        self.sql.as_deref()
    }

    /// The number of positional arguments bound to the query.
    pub fn args_len(&self) -> usize {
        self.args_len
    }

    /// The table this error pertains to, if known.
    pub fn table(&self) -> Option<&Name> {
        self.table.as_ref()
    }

    /// The constraint this error pertains to, if known.
    pub fn constraint(&self) -> Option<&Name> {
        self.constraint.as_ref()
    }

    /// `true` when this error means "query ran fine, zero rows came back".
    pub fn is_record_not_found(&self) -> bool {
        matches!(self.kind, ErrorKind::RecordNotFound)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operation {
            Some(op) => write!(f, "{op}: {}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// A table, column, or constraint identifier mentioned by an error.
///
/// Used in `ErrorKind::TableDoesNotExist { table }`-style variants: a
/// name is either known precisely or only known to be
/// unavailable/obfuscated by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Name {
    Available(String),
    Unavailable,
}

impl Name {
    pub fn available(name: impl Into<String>) -> Self {
        Name::Available(name.into())
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Name::Available(n) => write!(f, "{n}"),
            Name::Unavailable => write!(f, "<unavailable>"),
        }
    }
}

impl From<&str> for Name {
    fn from(value: &str) -> Self {
        Name::Available(value.to_string())
    }
}

impl From<String> for Name {
    fn from(value: String) -> Self {
        Name::Available(value)
    }
}

/// The error classification taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    #[error("record not found")]
    RecordNotFound,
    #[error("unique constraint failed")]
    UniqueConstraintViolation { constraint: Name },
    #[error("foreign key constraint failed")]
    ForeignKeyConstraintViolation { constraint: Name },
    #[error("null constraint failed on column {column}")]
    NullConstraintViolation { column: Name },
    #[error("check constraint failed")]
    CheckConstraintViolation { constraint: Name },
    #[error("deadlock detected")]
    Deadlock,
    #[error("could not serialize transaction")]
    SerializationFailure,
    #[error("connection failed")]
    ConnectionFailed,
    #[error("connection lost")]
    ConnectionLost,
    #[error("operation timed out")]
    Timeout,
    #[error("column {column} does not exist")]
    ColumnNotFound { column: Name },
    #[error("table {table} does not exist")]
    TableDoesNotExist { table: Name },
    #[error("database {db_name} already exists")]
    DatabaseAlreadyExists { db_name: Name },
    #[error("invalid SQL syntax")]
    InvalidSyntax,
    #[error("entity value was nil where a value was required")]
    NilPointer,
    #[error("invalid model: {0}")]
    InvalidModel(String),
    #[error("invalid relation: {0}")]
    InvalidRelation(String),
    #[error("relation {relation} not found on {entity}")]
    RelationNotFound { entity: String, relation: String },
    #[error("invalid relation configuration: {0}")]
    InvalidRelationConfig(String),
    #[error("this operation requires a raw query")]
    RequiresRawQuery,
    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("{0}")]
    SchemaBuild(String),
    #[error("unknown database error")]
    Unknown,
}

impl Error {
    /// Classify a raw, lowercased driver error message by matching
    /// known substring patterns against common driver phrasing.
    pub fn classify_driver_message(message: &str) -> ErrorKind {
        let m = message.to_lowercase();

        if m.contains("duplicate key") || m.contains("unique constraint") {
            ErrorKind::UniqueConstraintViolation { constraint: Name::Unavailable }
        } else if m.contains("foreign key") {
            ErrorKind::ForeignKeyConstraintViolation { constraint: Name::Unavailable }
        } else if m.contains("not null") {
            ErrorKind::NullConstraintViolation { column: Name::Unavailable }
        } else if m.contains("check constraint") {
            ErrorKind::CheckConstraintViolation { constraint: Name::Unavailable }
        } else if m.contains("deadlock") {
            ErrorKind::Deadlock
        } else if m.contains("could not serialize") {
            ErrorKind::SerializationFailure
        } else if m.contains("connection refused") {
            ErrorKind::ConnectionFailed
        } else if m.contains("timed out") || m.contains("deadline exceeded") {
            ErrorKind::Timeout
        } else if m.contains("does not exist") && (m.contains("relation") || m.contains("table")) {
            ErrorKind::TableDoesNotExist { table: Name::Unavailable }
        } else if m.contains("no such table") {
            ErrorKind::TableDoesNotExist { table: Name::Unavailable }
        } else if m.contains("does not exist") && m.contains("column") {
            ErrorKind::ColumnNotFound { column: Name::Unavailable }
        } else if m.contains("syntax error") {
            ErrorKind::InvalidSyntax
        } else {
            ErrorKind::Unknown
        }
    }
}
