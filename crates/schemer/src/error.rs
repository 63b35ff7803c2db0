use thiserror::Error;

/// Boxed error coming from the database boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to introspect {what}: {source}")]
    Introspection {
        what: String,
        #[source]
        source: BoxError,
    },

    #[error("invalid identifier {name:?}: {reason}")]
    InvalidIdentifier { name: String, reason: &'static str },

    #[error("invalid column type {ty:?}: {reason}")]
    InvalidType { ty: String, reason: &'static str },

    #[error("invalid index {table}.{index}: {reason}")]
    InvalidIndex {
        table: String,
        index: String,
        reason: String,
    },

    #[error("failed to execute `{sql}`: {source}")]
    Execution {
        sql: String,
        #[source]
        source: BoxError,
    },
}

impl Error {
    pub(crate) fn introspection(what: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Error::Introspection {
            what: what.into(),
            source: source.into(),
        }
    }

    pub(crate) fn execution(sql: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Error::Execution {
            sql: sql.into(),
            source: source.into(),
        }
    }

    /// Whether this error was raised while validating the declaration,
    /// i.e. before anything was sent to the database.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidIdentifier { .. } | Error::InvalidType { .. } | Error::InvalidIndex { .. }
        )
    }
}
