use std::error::Error as StdError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    UserError(#[from] UserError),
    #[error(transparent)]
    InternalError(#[from] InternalError),
}

/// Errors caused by the shape or the parameters of the query itself.
#[derive(Debug, thiserror::Error)]
pub enum UserError {
    #[error("query validate failed: {node} node expects {expected} children but got {actual}")]
    InvalidChildCount { node: &'static str, expected: &'static str, actual: usize },
    #[error("query validate failed: {0}")]
    QueryValidate(String),
    #[error("an average document length must not be given to a boolean query")]
    AverageLengthInBooleanQuery,
    #[error("invalid regular expression: {0}")]
    InvalidRegex(#[from] regex::Error),
}

/// Errors that are not the caller's fault: storage faults and broken
/// invariants. A query that returned one of these is unusable.
#[derive(Debug, thiserror::Error)]
pub enum InternalError {
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn StdError + Send + Sync + 'static>),
    #[error("posting iterator used on a node that validate never bound")]
    IteratorNotBound,
    #[error("lower bound memo violated on node {node}: upper {upper} < lower {lower}")]
    MemoInvariant { node: u32, lower: u32, upper: u32 },
    #[error("a term leaf survived validation")]
    DanglingTermLeaf,
    #[error("retrieval ran on a query that was never validated")]
    NotValidated,
}

impl Error {
    /// Wrap an arbitrary provider error as a storage fault.
    pub fn storage<E>(error: E) -> Error
    where
        E: StdError + Send + Sync + 'static,
    {
        Error::InternalError(InternalError::Storage(Box::new(error)))
    }
}
