//! Error types for persistkit operations.

use crate::entity::EntityState;
use crate::metadata::EntityType;
use crate::value::Value;
use std::fmt;

/// The primary error type for all persistkit operations.
#[derive(Debug)]
pub enum Error {
    /// The operation requires a managed entity
    NotManaged(NotManagedError),
    /// The entity is in a state the operation cannot accept
    IllegalState(IllegalStateError),
    /// An unresolved relationship was accessed outside a live unit of work
    LazyInitialization(LazyInitializationError),
    /// The store rejected a write because the row is missing or changed
    StaleWrite(StaleWriteError),
    /// A window was combined with a collection fetch-join under the refusing policy
    PaginatedCollectionFetch(PaginatedCollectionFetchWarning),
    /// A managed entity references an unsaved transient entity
    TransientReference(TransientReferenceError),
    /// Unknown entity or relationship, or an invalid metadata registry
    Metadata(MetadataError),
    /// Store query or write execution errors
    Query(QueryError),
    /// Row value conversion errors
    Type(TypeError),
    /// The write set contains a reference cycle that cannot be ordered
    Cycle(CycleError),
    /// The session failed, was poisoned by cancellation, or was closed
    SessionUnusable(SessionUnusableError),
    /// A managed entity's row no longer exists in the store
    NotFound(NotFoundError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug, Clone)]
pub struct NotManagedError {
    pub operation: &'static str,
    pub entity: EntityType,
    pub id: Option<Value>,
    pub state: EntityState,
}

#[derive(Debug, Clone)]
pub struct IllegalStateError {
    pub operation: &'static str,
    pub entity: EntityType,
    pub id: Option<Value>,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct LazyInitializationError {
    pub entity: EntityType,
    pub id: Option<Value>,
    pub relationship: String,
    pub state: EntityState,
}

#[derive(Debug, Clone)]
pub struct StaleWriteError {
    pub entity: EntityType,
    pub id: Value,
    pub message: String,
}

/// Signal that a window was requested together with a collection fetch-join.
///
/// Rows of a collection join multiply per child, so a store-side window would
/// cut parents short. Under the in-memory policy this travels as a warning on
/// the query result; under the refusing policy it is raised as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginatedCollectionFetchWarning {
    pub entity: EntityType,
    pub path: String,
    pub offset: usize,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct TransientReferenceError {
    pub entity: EntityType,
    pub id: Option<Value>,
    pub relationship: String,
    pub target: EntityType,
}

#[derive(Debug, Clone)]
pub struct MetadataError {
    pub kind: MetadataErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataErrorKind {
    /// Entity type is not registered
    UnknownEntity,
    /// Relationship is not declared on the entity
    UnknownRelationship,
    /// Fetch path does not resolve to a chain of relationships
    InvalidPath,
    /// Registry violates a structural rule (owning side, foreign key, mapped_by)
    Invalid,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub entity: Option<EntityType>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Constraint violation (unique, foreign key)
    Constraint,
    /// Plan references something the store does not know
    Unsupported,
    /// Other store error
    Store,
}

#[derive(Debug, Clone)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CycleError {
    pub entities: Vec<EntityType>,
}

#[derive(Debug, Clone)]
pub struct SessionUnusableError {
    pub status: &'static str,
    pub operation: &'static str,
}

#[derive(Debug, Clone)]
pub struct NotFoundError {
    pub entity: EntityType,
    pub id: Value,
}

impl Error {
    /// Is this a stale-write rejection from the store?
    pub fn is_stale_write(&self) -> bool {
        matches!(self, Error::StaleWrite(_))
    }

    /// Is this a lazy-initialization failure?
    pub fn is_lazy_initialization(&self) -> bool {
        matches!(self, Error::LazyInitialization(_))
    }

    /// Is this a not-managed precondition failure?
    pub fn is_not_managed(&self) -> bool {
        matches!(self, Error::NotManaged(_))
    }

    /// Is this a constraint violation reported by the store?
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Error::Query(q) if q.kind == QueryErrorKind::Constraint)
    }

    /// Does this error leave the unit of work unusable (rollback or discard only)?
    pub fn poisons_session(&self) -> bool {
        matches!(
            self,
            Error::StaleWrite(_) | Error::Query(_) | Error::Cycle(_) | Error::Cancelled
        )
    }

    /// Create a metadata error.
    pub fn metadata(kind: MetadataErrorKind, message: impl Into<String>) -> Self {
        Error::Metadata(MetadataError {
            kind,
            message: message.into(),
        })
    }
}

impl QueryError {
    /// Create a constraint violation error.
    pub fn constraint(entity: EntityType, message: impl Into<String>) -> Self {
        Self {
            kind: QueryErrorKind::Constraint,
            entity: Some(entity),
            message: message.into(),
            source: None,
        }
    }

    /// Create an unsupported-plan error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self {
            kind: QueryErrorKind::Unsupported,
            entity: None,
            message: message.into(),
            source: None,
        }
    }
}

fn fmt_id(id: Option<&Value>) -> String {
    id.map_or_else(|| "<unassigned>".to_string(), ToString::to_string)
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotManaged(e) => write!(f, "Not managed: {}", e),
            Error::IllegalState(e) => write!(f, "Illegal state: {}", e),
            Error::LazyInitialization(e) => write!(f, "Lazy initialization error: {}", e),
            Error::StaleWrite(e) => write!(f, "Stale write: {}", e),
            Error::PaginatedCollectionFetch(e) => {
                write!(f, "Paginated collection fetch refused: {}", e)
            }
            Error::TransientReference(e) => write!(f, "Transient reference: {}", e),
            Error::Metadata(e) => write!(f, "Metadata error: {}", e.message),
            Error::Query(e) => write!(f, "Query error: {}", e.message),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Cycle(e) => write!(
                f,
                "Cannot order writes: reference cycle among {}",
                e.entities.join(", ")
            ),
            Error::SessionUnusable(e) => write!(
                f,
                "Session is {}; '{}' is not allowed (rollback or discard the session)",
                e.status, e.operation
            ),
            Error::NotFound(e) => write!(f, "Row {}#{} no longer exists", e.entity, e.id),
            Error::Cancelled => write!(f, "Operation cancelled"),
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
            _ => None,
        }
    }
}

impl fmt::Display for NotManagedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} requires a managed entity, but {}#{} is {}",
            self.operation,
            self.entity,
            fmt_id(self.id.as_ref()),
            self.state
        )
    }
}

impl fmt::Display for IllegalStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {}#{}: {}",
            self.operation,
            self.entity,
            fmt_id(self.id.as_ref()),
            self.message
        )
    }
}

impl fmt::Display for LazyInitializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot initialize '{}' of {}#{}: owner is {}",
            self.relationship,
            self.entity,
            fmt_id(self.id.as_ref()),
            self.state
        )
    }
}

impl fmt::Display for StaleWriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}: {}", self.entity, self.id, self.message)
    }
}

impl fmt::Display for PaginatedCollectionFetchWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "window (offset {}, limit {}) combined with collection fetch '{}' on {}",
            self.offset,
            self.limit
                .map_or_else(|| "none".to_string(), |l| l.to_string()),
            self.path,
            self.entity
        )
    }
}

impl fmt::Display for TransientReferenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{} references an unsaved {} through '{}'",
            self.entity,
            fmt_id(self.id.as_ref()),
            self.target,
            self.relationship
        )
    }
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
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

impl From<NotManagedError> for Error {
    fn from(err: NotManagedError) -> Self {
        Error::NotManaged(err)
    }
}

impl From<IllegalStateError> for Error {
    fn from(err: IllegalStateError) -> Self {
        Error::IllegalState(err)
    }
}

impl From<LazyInitializationError> for Error {
    fn from(err: LazyInitializationError) -> Self {
        Error::LazyInitialization(err)
    }
}

impl From<StaleWriteError> for Error {
    fn from(err: StaleWriteError) -> Self {
        Error::StaleWrite(err)
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

impl From<MetadataError> for Error {
    fn from(err: MetadataError) -> Self {
        Error::Metadata(err)
    }
}

/// Result type alias for persistkit operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_helpers() {
        let stale = Error::StaleWrite(StaleWriteError {
            entity: "person",
            id: Value::BigInt(3),
            message: "update matched no row".to_string(),
        });
        assert!(stale.is_stale_write());
        assert!(stale.poisons_session());

        let lazy = Error::LazyInitialization(LazyInitializationError {
            entity: "school_class",
            id: Some(Value::BigInt(1)),
            relationship: "persons".to_string(),
            state: EntityState::Detached,
        });
        assert!(lazy.is_lazy_initialization());
        assert!(!lazy.poisons_session());

        let fk = Error::Query(QueryError::constraint("person", "foreign key violation"));
        assert!(fk.is_constraint_violation());
    }

    #[test]
    fn test_display_messages() {
        let err = Error::NotManaged(NotManagedError {
            operation: "remove",
            entity: "person",
            id: None,
            state: EntityState::Transient,
        });
        assert_eq!(
            err.to_string(),
            "Not managed: remove requires a managed entity, but person#<unassigned> is transient"
        );

        let warning = PaginatedCollectionFetchWarning {
            entity: "school_class",
            path: "persons".to_string(),
            offset: 0,
            limit: Some(2),
        };
        assert!(warning.to_string().contains("collection fetch 'persons'"));
    }
}
