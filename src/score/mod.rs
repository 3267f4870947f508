use std::fmt;
use std::sync::Arc;

use crate::index::DocumentLengthStore;
use crate::{DocumentId, DocumentScore, TermFrequency};

mod calculator;
mod combiner;
mod negator;

pub use self::calculator::{OkapiTfIdfScoreCalculator, OkapiTfScoreCalculator};
pub use self::combiner::{
    MaxScoreCombiner, MinScoreCombiner, ProdScoreCombiner, SumScoreCombiner,
};
pub use self::negator::ComplementScoreNegator;

/// Per-posting score formula, split in two steps so that a ranked retrieval
/// can stream the per-hit factor first and apply the query-global factor
/// once the candidate set is complete.
///
/// `first_step` is the per-hit part (a `tf / (k + tf)` shape for the default
/// calculators) and `get_prepare_result` the query-global part computed by
/// `prepare` from the document frequencies. The full score of a hit is
/// `first_step(tf, doc) * get_prepare_result()`.
pub trait ScoreCalculator: Send {
    /// Compute the query-global factor from the collection size and the
    /// document frequency of the scored node.
    fn prepare(&mut self, total_df: u64, document_frequency: u64);

    /// The per-hit factor. `None` means the document does not really exist
    /// for this calculator (e.g. its length is unknown to a
    /// length-normalising formula) and must not be reported as a hit.
    fn first_step(&self, tf: TermFrequency, doc: DocumentId) -> Option<DocumentScore>;

    /// The factor computed by the last call to `prepare`.
    fn get_prepare_result(&self) -> DocumentScore;

    fn set_average_document_length(&mut self, _length: u32) {}

    fn set_document_length_store(&mut self, _store: Arc<dyn DocumentLengthStore>) {}

    fn search_document_length(&self, _doc: DocumentId) -> Option<u32> {
        None
    }

    /// Calculators that need the whole first-step buffer to finish a score
    /// return true and implement `first_step_ex`.
    fn is_extended_first_step(&self) -> bool {
        false
    }

    /// Extended second-step hook: recompute the per-hit factor of the
    /// `index`-th first-step hit.
    fn first_step_ex(&self, _index: usize, _doc: DocumentId) -> DocumentScore {
        0.0
    }

    /// Serialised form, used in canonical query strings. With
    /// `with_params` the parameters are appended (`OkapiTf:1`).
    fn description(&self, with_params: bool) -> String;

    fn boxed_clone(&self) -> Box<dyn ScoreCalculator>;

    /// The complete score of one hit.
    fn score(&self, tf: TermFrequency, doc: DocumentId) -> Option<DocumentScore> {
        self.first_step(tf, doc).map(|s| s * self.get_prepare_result())
    }
}

impl fmt::Debug for dyn ScoreCalculator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScoreCalculator({})", self.description(true))
    }
}

/// Combines the scores of the children of an internal node.
pub trait ScoreCombiner: Send {
    fn combine(&self, left: DocumentScore, right: DocumentScore) -> DocumentScore;

    /// OR-normal-form conversion is only legal for combiners that are both
    /// associative and commutative.
    fn is_associative(&self) -> bool;
    fn is_commutative(&self) -> bool;

    fn description(&self, _with_params: bool) -> String {
        self.name().to_string()
    }
    fn name(&self) -> &'static str;

    fn boxed_clone(&self) -> Box<dyn ScoreCombiner>;
}

impl fmt::Debug for dyn ScoreCombiner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScoreCombiner({})", self.name())
    }
}

/// Maps the second operand score of an and-not before it is combined.
pub trait ScoreNegator: Send {
    fn apply(&self, score: DocumentScore) -> DocumentScore;

    fn name(&self) -> &'static str;

    fn boxed_clone(&self) -> Box<dyn ScoreNegator>;
}

impl fmt::Debug for dyn ScoreNegator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScoreNegator({})", self.name())
    }
}
