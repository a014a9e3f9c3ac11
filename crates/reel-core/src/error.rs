//! Error types for reel operations.

use std::fmt;

/// The primary error type for all reel operations.
///
/// Every variant aborts only the current unit of work; the session that
/// reported it stays usable for a corrected retry.
#[derive(Debug)]
pub enum Error {
    /// Invalid metadata detected while building the registry (fatal).
    Config(ConfigError),
    /// A field-level check failed before any store access.
    Validation(ValidationError),
    /// A store constraint rejected a write scheduled by a flush.
    Constraint(ConstraintViolation),
    /// An owning association points at an entity nobody registered.
    UnpersistedReference(UnpersistedReference),
    /// A lazy association was read after its session was cleared or closed.
    DetachedLazyAccess(DetachedLazyAccess),
    /// An update or delete found no row to act on.
    StaleState(StaleState),
    /// A lifecycle operation received an entity this session does not manage.
    NotManaged(NotManaged),
    /// A merge or refresh named an identity the store does not hold.
    NotFound { entity: &'static str, identity: i64 },
    /// The executor rejected or failed a statement.
    Query(QueryError),
    /// A stored value did not convert to the requested type.
    Type(TypeError),
    /// The executor cannot be used anymore (fatal for the session)
    Connection(ConnectionError),
    /// The surrounding `Cx` was cancelled.
    Cancelled,
    /// Fixture or projection (de)serialization failed.
    Serde(String),
    /// Anything else, with a message.
    Custom(String),
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }
}

#[derive(Debug)]
pub struct ConnectionError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    /// Table the failing statement targeted, when known.
    pub table: Option<String>,
    /// Column involved in the failure, when known.
    pub column: Option<String>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Malformed statement
    Syntax,
    /// Constraint violation (not null, length, unique, foreign key)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Transaction/savepoint misuse
    Transaction,
    /// Cancelled
    Cancelled,
    /// Other store error
    Database,
}

/// Which store constraint rejected a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    NotNull,
    Length,
    Unique,
    ForeignKey,
    Other,
}

impl ConstraintKind {
    /// Classify a SQLSTATE code.
    pub fn from_sqlstate(sqlstate: Option<&str>) -> Self {
        match sqlstate {
            Some("23502") => ConstraintKind::NotNull,
            Some("22001") => ConstraintKind::Length,
            Some("23505") => ConstraintKind::Unique,
            Some("23503") => ConstraintKind::ForeignKey,
            _ => ConstraintKind::Other,
        }
    }

    pub const fn sqlstate(self) -> &'static str {
        match self {
            ConstraintKind::NotNull => "23502",
            ConstraintKind::Length => "22001",
            ConstraintKind::Unique => "23505",
            ConstraintKind::ForeignKey => "23503",
            ConstraintKind::Other => "23000",
        }
    }
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConstraintKind::NotNull => "not-null",
            ConstraintKind::Length => "length",
            ConstraintKind::Unique => "unique",
            ConstraintKind::ForeignKey => "foreign-key",
            ConstraintKind::Other => "integrity",
        };
        f.write_str(name)
    }
}

/// The kind of write a flush was performing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
    Link,
    Unlink,
}

impl fmt::Display for WriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriteKind::Insert => "insert",
            WriteKind::Update => "update",
            WriteKind::Delete => "delete",
            WriteKind::Link => "link",
            WriteKind::Unlink => "unlink",
        };
        f.write_str(name)
    }
}

/// A store constraint failure attributed to the entity whose write caused it.
#[derive(Debug)]
pub struct ConstraintViolation {
    pub entity: &'static str,
    pub identity: Option<i64>,
    pub operation: WriteKind,
    pub kind: ConstraintKind,
    pub source: QueryError,
}

#[derive(Debug, Clone)]
pub struct UnpersistedReference {
    pub entity: &'static str,
    pub edge: &'static str,
    pub target: &'static str,
}

#[derive(Debug, Clone)]
pub struct DetachedLazyAccess {
    pub entity: &'static str,
    pub edge: String,
    pub reason: &'static str,
}

#[derive(Debug, Clone)]
pub struct StaleState {
    pub entity: &'static str,
    pub identity: i64,
    pub operation: WriteKind,
}

#[derive(Debug, Clone)]
pub struct NotManaged {
    pub entity: &'static str,
    pub identity: Option<i64>,
    pub operation: &'static str,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

/// Every failed field check of one entity.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Entity the failing fields belong to
    pub entity: &'static str,
    pub errors: Vec<FieldValidationError>,
}

/// One failed field check.
#[derive(Debug, Clone)]
pub struct FieldValidationError {
    /// Field name as declared in the schema.
    pub field: String,
    /// Which check failed.
    pub kind: ValidationErrorKind,
    /// Message shown to callers.
    pub message: String,
}

/// Kinds of field checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// A required field is NULL.
    Required,
    /// Entity is in the wrong lifecycle state for the operation
    Lifecycle,
    /// Any other check.
    Custom,
}

impl ValidationError {
    /// No failures yet.
    pub fn new(entity: &'static str) -> Self {
        Self {
            entity,
            errors: Vec::new(),
        }
    }

    /// Whether no check failed.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Record a failure.
    pub fn add(
        &mut self,
        field: impl Into<String>,
        kind: ValidationErrorKind,
        message: impl Into<String>,
    ) {
        self.errors.push(FieldValidationError {
            field: field.into(),
            kind,
            message: message.into(),
        });
    }

    /// Record a required field holding NULL.
    pub fn add_required(&mut self, field: impl Into<String>) {
        self.add(field, ValidationErrorKind::Required, "is required");
    }

    /// Add a lifecycle error (e.g. registering a detached instance).
    pub fn add_lifecycle(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.add(field, ValidationErrorKind::Lifecycle, message);
    }

    /// Record a failure of another kind.
    pub fn add_custom(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.add(field, ValidationErrorKind::Custom, message);
    }

    /// Names of the failing fields, in insertion order.
    pub fn fields(&self) -> Vec<&str> {
        self.errors.iter().map(|e| e.field.as_str()).collect()
    }

    /// `Err(self)` when any check failed.
    pub fn into_result(self) -> std::result::Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl Error {
    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError::new(message))
    }

    /// Is this a store-reported constraint failure?
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            Error::Constraint(_) => true,
            Error::Query(q) => q.kind == QueryErrorKind::Constraint,
            _ => false,
        }
    }

    /// Constraint kind, for constraint failures.
    pub fn constraint_kind(&self) -> Option<ConstraintKind> {
        match self {
            Error::Constraint(c) => Some(c.kind),
            Error::Query(q) if q.kind == QueryErrorKind::Constraint => {
                Some(ConstraintKind::from_sqlstate(q.sqlstate.as_deref()))
            }
            _ => None,
        }
    }

    /// Is the session unusable after this error?
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Config(_))
    }

    /// SQLSTATE reported by the store, if any.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            Error::Constraint(c) => c.source.sqlstate.as_deref(),
            _ => None,
        }
    }
}

impl QueryError {
    /// Build a constraint failure with the SQLSTATE of its kind.
    pub fn constraint(
        kind: ConstraintKind,
        table: impl Into<String>,
        column: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind: QueryErrorKind::Constraint,
            sql: None,
            sqlstate: Some(kind.sqlstate().to_string()),
            message: message.into(),
            table: Some(table.into()),
            column,
            source: None,
        }
    }

    /// Build a non-constraint store error.
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            sql: None,
            sqlstate: None,
            message: message.into(),
            table: None,
            column: None,
            source: None,
        }
    }

    /// Attach the SQL text that failed.
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    /// SQLSTATE 23505.
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
    }

    /// SQLSTATE 23503.
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23503")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Validation(e) => write!(f, "Validation error: {}", e),
            Error::Constraint(e) => write!(f, "Constraint violation: {}", e),
            Error::UnpersistedReference(e) => write!(
                f,
                "Unpersisted reference: {}.{} points at a transient {}",
                e.entity, e.edge, e.target
            ),
            Error::DetachedLazyAccess(e) => write!(
                f,
                "Detached lazy access: {}.{} ({})",
                e.entity, e.edge, e.reason
            ),
            Error::StaleState(e) => write!(
                f,
                "Stale state: {} of {}#{} affected no rows",
                e.operation, e.entity, e.identity
            ),
            Error::NotManaged(e) => match e.identity {
                Some(id) => write!(
                    f,
                    "Cannot {} {}#{}: not managed by this session",
                    e.operation, e.entity, id
                ),
                None => write!(
                    f,
                    "Cannot {} transient {}: not managed by this session",
                    e.operation, e.entity
                ),
            },
            Error::NotFound { entity, identity } => {
                write!(f, "{}#{} does not exist", entity, identity)
            }
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Constraint(e) => Some(&e.source),
            Error::Validation(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for QueryError {}

impl fmt::Display for ConstraintViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.identity {
            Some(id) => write!(
                f,
                "{} of {}#{} violated a {} constraint: {}",
                self.operation, self.entity, id, self.kind, self.source.message
            ),
            None => write!(
                f,
                "{} of new {} violated a {} constraint: {}",
                self.operation, self.entity, self.kind, self.source.message
            ),
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            write!(f, "validation passed")
        } else if self.errors.len() == 1 {
            let err = &self.errors[0];
            write!(
                f,
                "validation error on '{}.{}': {}",
                self.entity, err.field, err.message
            )
        } else {
            writeln!(f, "validation errors on {}:", self.entity)?;
            for err in &self.errors {
                writeln!(f, "  - {}: {}", err.field, err.message)?;
            }
            Ok(())
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for reel operations.
pub type Result<T> = std::result::Result<T, Error>;
