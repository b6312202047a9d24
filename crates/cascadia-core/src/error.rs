//! Error types for Cascadia operations.

use std::fmt;

/// The primary error type for all Cascadia operations.
#[derive(Debug)]
pub enum Error {
    /// A primitive driver operation failed
    Query(QueryError),
    /// Transaction state errors
    Transaction(TransactionError),
    /// Metadata / registry configuration errors
    Config(ConfigError),
    /// Runtime binding of an entity against its schema failed
    Validation(ValidationError),
    /// A related entity needed persisting but no cascade rule permits it
    CascadeNotAllowed(CascadeError),
    /// A version-guarded write affected zero rows
    OptimisticLock(OptimisticLockError),
    /// Mandatory relations form a cycle
    CyclicDependency(CycleError),
    /// A primitive write failed for a specific subject
    SubjectExecution(SubjectError),
    /// A dependent write needed an identifier that never resolved
    IdentifierResolution(ResolutionError),
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    /// Short description of the statement (e.g. `INSERT posts (2 rows)`).
    pub statement: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Constraint violation (unique, foreign key, not null)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Statement timeout
    Timeout,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// A transaction is already open on this driver
    AlreadyActive,
    /// Commit or rollback without an open transaction
    NotActive,
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

/// Validation error produced while binding an entity to its schema.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The errors grouped by property path
    pub errors: Vec<FieldValidationError>,
}

/// A single validation error for a property.
#[derive(Debug, Clone)]
pub struct FieldValidationError {
    /// The property path that failed validation
    pub field: String,
    /// The kind of validation that failed
    pub kind: ValidationErrorKind,
    /// Human-readable error message
    pub message: String,
}

/// The type of binding constraint that was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// The property is not declared on the entity type
    UnknownProperty,
    /// A column got a relation or a relation got a scalar
    Shape,
    /// A related object has the wrong entity type
    TargetType,
    /// Custom validation failed
    Custom,
}

impl ValidationError {
    /// Create a new empty validation error container.
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    /// Check if there are any validation errors.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Add a field validation error.
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

    /// Convert to Result, returning Ok(()) if no errors, Err(self) otherwise.
    pub fn into_result(self) -> std::result::Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl Default for ValidationError {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct CascadeError {
    /// Entity type holding the relation
    pub entity: String,
    /// Relation property name
    pub relation: String,
    /// Entity type of the unsaved related object
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct OptimisticLockError {
    pub entity: String,
    pub identifier: String,
    /// Version value the write was guarded by
    pub expected_version: String,
}

#[derive(Debug, Clone)]
pub struct CycleError {
    /// Participating subjects, rendered as `Type(id)` / `Type(new)`
    pub entities: Vec<String>,
}

/// The kind of write a subject was performing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
    SoftDelete,
    Recover,
    JunctionInsert,
    JunctionRemove,
    RelationUpdate,
}

impl WriteKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            WriteKind::Insert => "insert",
            WriteKind::Update => "update",
            WriteKind::Delete => "delete",
            WriteKind::SoftDelete => "soft delete",
            WriteKind::Recover => "recover",
            WriteKind::JunctionInsert => "junction insert",
            WriteKind::JunctionRemove => "junction remove",
            WriteKind::RelationUpdate => "relation update",
        }
    }
}

#[derive(Debug)]
pub struct SubjectError {
    pub entity: String,
    /// Identifier of the subject, or of the first row of a batch
    pub identifier: String,
    pub operation: WriteKind,
    /// Rows carried by the failed statement; more than one for a batch
    pub rows: usize,
    pub source: Box<Error>,
}

#[derive(Debug, Clone)]
pub struct ResolutionError {
    /// Entity type whose write needed the identifier
    pub entity: String,
    /// Relation (or junction table) that needed it
    pub relation: String,
    /// Entity type whose identifier never resolved
    pub target: String,
}

impl Error {
    /// Is this a retryable error (optimistic lock, deadlock, serialization, timeouts)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::OptimisticLock(_) => true,
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization | QueryErrorKind::Timeout
            ),
            Error::SubjectExecution(e) => e.source.is_retryable(),
            _ => false,
        }
    }

    /// Entity type named by this error, if any.
    pub fn entity(&self) -> Option<&str> {
        match self {
            Error::CascadeNotAllowed(e) => Some(&e.entity),
            Error::OptimisticLock(e) => Some(&e.entity),
            Error::SubjectExecution(e) => Some(&e.entity),
            Error::IdentifierResolution(e) => Some(&e.entity),
            _ => None,
        }
    }

    /// Strip `SubjectExecution` wrappers and return the underlying error.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::SubjectExecution(e) => e.source.root_cause(),
            other => other,
        }
    }

    /// Build a constraint-violation query error.
    pub fn constraint(statement: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Query(QueryError {
            kind: QueryErrorKind::Constraint,
            statement: Some(statement.into()),
            message: message.into(),
            source: None,
        })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Query(e) => write!(f, "Query error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Validation(e) => write!(f, "Validation error: {}", e),
            Error::CascadeNotAllowed(e) => write!(
                f,
                "Cannot persist {}.{}: related {} is not saved and the relation does not cascade inserts",
                e.entity, e.relation, e.target
            ),
            Error::OptimisticLock(e) => write!(
                f,
                "Optimistic lock failed for {}({}): version {} is no longer current",
                e.entity, e.identifier, e.expected_version
            ),
            Error::CyclicDependency(e) => write!(
                f,
                "Cyclic dependency between mandatory relations: {}",
                e.entities.join(" -> ")
            ),
            Error::SubjectExecution(e) if e.rows > 1 => write!(
                f,
                "{} of a batch of {} {} rows (first {}({})) failed: {}",
                e.operation.as_str(),
                e.rows,
                e.entity,
                e.entity,
                e.identifier,
                e.source
            ),
            Error::SubjectExecution(e) => write!(
                f,
                "{} of {}({}) failed: {}",
                e.operation.as_str(),
                e.entity,
                e.identifier,
                e.source
            ),
            Error::IdentifierResolution(e) => write!(
                f,
                "Identifier of {} needed by {}.{} was never resolved",
                e.target, e.entity, e.relation
            ),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::SubjectExecution(e) => Some(e.source.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(statement) = &self.statement {
            write!(f, "{} ({})", self.message, statement)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            write!(f, "validation passed")
        } else if self.errors.len() == 1 {
            let err = &self.errors[0];
            write!(f, "validation error on '{}': {}", err.field, err.message)
        } else {
            writeln!(f, "validation errors:")?;
            for err in &self.errors {
                writeln!(f, "  - {}: {}", err.field, err.message)?;
            }
            Ok(())
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
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

/// Result type alias for Cascadia operations.
pub type Result<T> = std::result::Result<T, Error>;
