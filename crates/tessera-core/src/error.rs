//! Error types for Tessera operations.

use std::fmt;

/// The primary error type for all engine operations.
#[derive(Debug)]
pub enum Error {
    /// Driver or SQL failure while executing a statement
    Statement(StatementError),
    /// Update/delete affected an unexpected number of rows
    OptimisticLock(OptimisticLockError),
    /// Insert succeeded but no generated key came back
    KeyGeneration(KeyGenerationError),
    /// Deploy metadata or id shape mismatch (programmer error)
    Mapping(MappingError),
    /// Join tree exceeded the configured maximum depth
    MaxJoinDepth(MaxJoinDepthError),
    /// A lazily referenced row no longer exists
    EntityNotFound(EntityNotFoundError),
    /// Type conversion errors
    Type(TypeError),
    /// Configuration errors
    Config(ConfigError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct StatementError {
    pub kind: StatementErrorKind,
    pub sql: Option<String>,
    pub bind_log: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Connection lost or unusable
    Connection,
    /// Statement timeout
    Timeout,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct OptimisticLockError {
    pub table: String,
    pub sql: String,
    pub bind_log: String,
    pub expected_rows: u64,
    pub actual_rows: u64,
}

#[derive(Debug)]
pub struct KeyGenerationError {
    pub table: String,
    pub message: String,
}

#[derive(Debug)]
pub struct MappingError {
    pub entity: String,
    pub property: Option<String>,
    pub message: String,
}

#[derive(Debug)]
pub struct MaxJoinDepthError {
    pub root: String,
    pub path: String,
    pub max_depth: usize,
    pub tree_dump: String,
}

#[derive(Debug)]
pub struct EntityNotFoundError {
    pub entity: String,
    pub id: String,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
    pub rust_type: Option<&'static str>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Create a mapping error for an entity type.
    pub fn mapping(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Mapping(MappingError {
            entity: entity.into(),
            property: None,
            message: message.into(),
        })
    }

    /// Create a mapping error naming the offending property.
    pub fn mapping_property(
        entity: impl Into<String>,
        property: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Mapping(MappingError {
            entity: entity.into(),
            property: Some(property.into()),
            message: message.into(),
        })
    }

    /// Is this a concurrency conflict the caller may resolve by reloading?
    pub fn is_optimistic_lock(&self) -> bool {
        matches!(self, Error::OptimisticLock(_))
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Statement(e) => e.sql.as_deref(),
            Error::OptimisticLock(e) => Some(&e.sql),
            _ => None,
        }
    }

    /// Attach the statement text and bind log to a statement failure.
    ///
    /// Other variants are returned unchanged.
    #[must_use]
    pub fn with_statement(self, sql: &str, bind_log: &str) -> Self {
        match self {
            Error::Statement(mut e) => {
                if e.sql.is_none() {
                    e.sql = Some(sql.to_string());
                }
                if e.bind_log.is_none() {
                    e.bind_log = Some(bind_log.to_string());
                }
                Error::Statement(e)
            }
            other => other,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Statement(e) => write!(f, "Statement error: {}", e),
            Error::OptimisticLock(e) => write!(f, "Optimistic lock error: {}", e),
            Error::KeyGeneration(e) => write!(
                f,
                "Key generation error on table '{}': {}",
                e.table, e.message
            ),
            Error::Mapping(e) => write!(f, "Mapping error: {}", e),
            Error::MaxJoinDepth(e) => write!(
                f,
                "Max join depth {} exceeded at '{}' under {}",
                e.max_depth, e.path, e.root
            ),
            Error::EntityNotFound(e) => {
                write!(f, "Entity {} with id {} not found", e.entity, e.id)
            }
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Statement(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for StatementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(sql) = &self.sql {
            write!(f, " [sql: {}]", sql)?;
        }
        if let Some(binds) = &self.bind_log {
            write!(f, " [bind: {}]", binds)?;
        }
        Ok(())
    }
}

impl fmt::Display for OptimisticLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} row(s) affected on '{}' where {} expected [sql: {}] [bind: {}]",
            self.actual_rows, self.table, self.expected_rows, self.sql, self.bind_log
        )
    }
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(prop) = &self.property {
            write!(f, "{}.{}: {}", self.entity, prop, self.message)
        } else {
            write!(f, "{}: {}", self.entity, self.message)
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

impl From<StatementError> for Error {
    fn from(err: StatementError) -> Self {
        Error::Statement(err)
    }
}

impl From<OptimisticLockError> for Error {
    fn from(err: OptimisticLockError) -> Self {
        Error::OptimisticLock(err)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statement_context_is_attached_once() {
        let err = Error::Statement(StatementError {
            kind: StatementErrorKind::Constraint,
            sql: None,
            bind_log: None,
            message: "duplicate key".to_string(),
            source: None,
        });
        let err = err.with_statement("insert into c (id) values (?)", "1");
        assert_eq!(err.sql(), Some("insert into c (id) values (?)"));

        let err = err.with_statement("other", "2");
        assert_eq!(err.sql(), Some("insert into c (id) values (?)"));
        assert!(err.to_string().contains("[bind: 1]"));
    }

    #[test]
    fn optimistic_lock_is_distinguishable() {
        let err = Error::OptimisticLock(OptimisticLockError {
            table: "o_order".to_string(),
            sql: "update o_order set status=? where id=? and version=?".to_string(),
            bind_log: "'NEW',1,3".to_string(),
            expected_rows: 1,
            actual_rows: 0,
        });
        assert!(err.is_optimistic_lock());
        assert!(!Error::Cancelled.is_optimistic_lock());
        assert!(err.sql().unwrap().starts_with("update o_order"));
    }

    #[test]
    fn mapping_display_names_property() {
        let err = Error::mapping_property("Order", "customer", "unknown property");
        assert_eq!(
            err.to_string(),
            "Mapping error: Order.customer: unknown property"
        );
    }
}
