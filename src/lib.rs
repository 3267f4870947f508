mod error;
pub mod index;
pub mod location;
pub mod query;
pub mod score;

pub use self::error::{Error, InternalError, Result, UserError};
pub use self::index::{
    DocumentCursor, DocumentLengthStore, InvertedIndex, InvertedList, MemoryIndex,
    PostingIterator,
};
pub use self::location::LocationIterator;
pub use self::query::{
    DescriptionOptions, EvaluateMode, NodeId, Query, QueryBuilder, SearchTerm,
    TermMatchMode, ValidateMode,
};
pub use self::score::{ScoreCalculator, ScoreCombiner, ScoreNegator};

pub type DocumentId = u32;
pub type Position = u32;
pub type DocumentScore = f64;
pub type TermFrequency = u32;

/// One past the biggest addressable document id. Posting iterators return it
/// once exhausted and the lower-bound memo stores it to mean "scanned past
/// the end of the list".
pub const UPPER_BOUND_DOC_ID: DocumentId = DocumentId::MAX;

/// Document id 0 is reserved and never matches anything.
pub const UNDEFINED_DOC_ID: DocumentId = 0;
