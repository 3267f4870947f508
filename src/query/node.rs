use std::fmt;

use crate::index::{DocumentCursor, InvertedList, PostingIterator};
use crate::location::LocationIteratorPool;
use crate::score::{ScoreCalculator, ScoreCombiner, ScoreNegator};
use crate::{DocumentId, DocumentScore, Position, TermFrequency};

/// Sort factor of nodes whose evaluation cost cannot be bounded by a
/// posting length (regex leaves); pushes them last everywhere and disables
/// OR-normal-form conversion.
pub(crate) const MAX_SORT_FACTOR: u64 = u64::MAX;

/// Stable index of a node inside its query's arena. Rough pointers, shared
/// sub-expressions and end-node references are plain copies of these ids;
/// the arena frees every node exactly once when the query drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// How a term string must match the indexed text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TermMatchMode {
    /// Plain string match.
    Simple,
    /// Word-boundary aware match.
    Word,
    /// Both ends on a word boundary.
    ExactWord,
    /// Head on a word boundary.
    WordHead,
    /// Tail on a word boundary.
    WordTail,
    /// Multi-language tokenisation.
    MultiLanguage,
    /// Normalised string match.
    Normalized,
    /// Boundary-weighted term frequencies, integer TF preserved.
    Approximate,
}

impl TermMatchMode {
    pub(crate) fn letter(self) -> char {
        match self {
            TermMatchMode::Word => 'w',
            TermMatchMode::Simple => 's',
            TermMatchMode::ExactWord => 'e',
            TermMatchMode::WordHead => 'h',
            TermMatchMode::WordTail => 't',
            TermMatchMode::MultiLanguage => 'm',
            TermMatchMode::Normalized => 'n',
            TermMatchMode::Approximate => 'a',
        }
    }
}

/// Progress of the two-step scorer on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FirstStepStatus {
    Initial,
    FirstDone,
    SecondDone,
}

/// One hit of the first scoring step: the document, the per-hit partial
/// score and the term frequency that produced it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FirstStepHit {
    pub doc: DocumentId,
    pub score: DocumentScore,
    pub tf: TermFrequency,
}

/// The term string a rewritten node originated from, kept for display and
/// keyword-in-context extraction.
#[derive(Debug, Clone)]
pub(crate) struct OriginalTerm {
    pub term: String,
    pub language: Option<String>,
    pub match_mode: TermMatchMode,
}

/// State shared by every node variant.
pub(crate) struct NodeCommon {
    pub children: Vec<NodeId>,
    /// Approximate document frequency; exact once `retrieved` is set.
    pub estimated_df: Option<u64>,
    /// Memoised cost estimate, `MAX_SORT_FACTOR` for regex-bearing trees.
    pub sort_factor: Option<u64>,
    /// Lower-bound memo: `lower` is the last input, `upper` the last
    /// answer; `UPPER_BOUND_DOC_ID` in `upper` means "scanned past end".
    pub lower: DocumentId,
    pub upper: DocumentId,
    pub retrieved: bool,
    /// Over-approximating node used to skip non-candidates cheaply.
    pub rough: Option<NodeId>,
    /// Trailing token of a phrase synthesised from a term leaf.
    pub end_node: Option<NodeId>,
    pub first_step: FirstStepStatus,
    /// Set on descendants of an And and on the second operand of an
    /// AndNot: their document frequency must be probed cross-index.
    pub need_df: bool,
    pub original_term: Option<OriginalTerm>,
    /// First-step result buffer.
    pub hits: Vec<FirstStepHit>,
    /// Cursor over `hits` used by the second-step lower bound.
    pub cursor: usize,
    pub cursor_given: DocumentId,
    pub calculator: Option<Box<dyn ScoreCalculator>>,
    pub combiner: Option<Box<dyn ScoreCombiner>>,
}

impl Default for NodeCommon {
    fn default() -> NodeCommon {
        NodeCommon {
            children: Vec::new(),
            estimated_df: None,
            sort_factor: None,
            lower: 0,
            upper: 0,
            retrieved: false,
            rough: None,
            end_node: None,
            first_step: FirstStepStatus::Initial,
            need_df: false,
            original_term: None,
            hits: Vec::new(),
            cursor: 0,
            cursor_given: 0,
            calculator: None,
            combiner: None,
        }
    }
}

impl NodeCommon {
    pub fn reset_memo(&mut self) {
        self.lower = 0;
        self.upper = 0;
    }
}

pub(crate) struct TokenLeaf {
    pub token: String,
    pub token_length: Position,
    pub list: Option<Box<dyn InvertedList>>,
    pub iterator: Option<Box<dyn PostingIterator>>,
}

pub(crate) struct RegexLeaf {
    pub pattern: String,
    pub regex: Option<regex::Regex>,
    pub cursor: Option<Box<dyn DocumentCursor>>,
}

/// A constant hit set, sorted by ascending document id.
pub(crate) struct BooleanResultLeaf {
    pub docs: Vec<DocumentId>,
}

pub(crate) struct RankingResultLeaf {
    pub docs: Vec<(DocumentId, DocumentScore)>,
}

/// The parsed form of a query term; erased by validation.
pub(crate) struct TermLeaf {
    pub term: String,
    pub match_mode: TermMatchMode,
    pub language: Option<String>,
}

pub(crate) struct OrNode {
    /// Length of the user input this Or expands, when it was synthesised
    /// from a short word. Non-zero marks the node as uncollapsible.
    pub short_word_length: Position,
}

pub(crate) struct AtomicOrNode {
    pub synonym_id: u32,
    pub short_word_length: Position,
}

pub(crate) struct AndNotNode {
    pub negator: Option<Box<dyn ScoreNegator>>,
    /// Side memos of the operands' rough lower bounds, mirrored here
    /// because the interleaved walk queries them with unrelated inputs.
    pub child0_memo: (DocumentId, DocumentId),
    pub child1_memo: (DocumentId, DocumentId),
}

pub(crate) struct OrderedDistanceNode {
    /// Path offset of each child inside the original term, parallel to
    /// `common.children`.
    pub path_positions: Vec<Position>,
    pub pool: LocationIteratorPool,
}

pub(crate) struct WindowNode {
    pub min: Position,
    pub max: Position,
    pub ordered: bool,
    /// Simple windows bound the first-start to last-end span; operator
    /// windows bound the distance between start positions.
    pub simple: bool,
    pub pool: LocationIteratorPool,
}

pub(crate) struct ScaleNode {
    pub factor: f64,
}

pub(crate) struct LocationNode {
    pub position: Position,
}

pub(crate) struct EndNode {
    pub distance: Position,
}

pub(crate) struct WordNode {
    pub match_mode: TermMatchMode,
    /// Token leaf of the word-boundary sentinel posting, when the index
    /// carries one.
    pub boundary: Option<NodeId>,
}

pub(crate) enum NodeKind {
    Empty,
    Token(TokenLeaf),
    Regex(RegexLeaf),
    BooleanResult(BooleanResultLeaf),
    RankingResult(RankingResultLeaf),
    Term(TermLeaf),
    And,
    Or(OrNode),
    AtomicOr(AtomicOrNode),
    AndNot(AndNotNode),
    OrderedDistance(OrderedDistanceNode),
    Window(WindowNode),
    Scale(ScaleNode),
    Location(LocationNode),
    End(EndNode),
    Word(WordNode),
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Empty => "empty",
            NodeKind::Token(_) => "token",
            NodeKind::Regex(_) => "regex",
            NodeKind::BooleanResult(_) => "boolean-result",
            NodeKind::RankingResult(_) => "ranking-result",
            NodeKind::Term(_) => "term",
            NodeKind::And => "and",
            NodeKind::Or(_) => "or",
            NodeKind::AtomicOr(_) => "atomic-or",
            NodeKind::AndNot(_) => "and-not",
            NodeKind::OrderedDistance(_) => "ordered-distance",
            NodeKind::Window(_) => "window",
            NodeKind::Scale(_) => "scale",
            NodeKind::Location(_) => "location",
            NodeKind::End(_) => "end",
            NodeKind::Word(_) => "word",
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            NodeKind::And
                | NodeKind::Or(_)
                | NodeKind::AtomicOr(_)
                | NodeKind::AndNot(_)
                | NodeKind::OrderedDistance(_)
                | NodeKind::Window(_)
                | NodeKind::Scale(_)
                | NodeKind::Location(_)
                | NodeKind::End(_)
                | NodeKind::Word(_)
        )
    }

    /// Nodes scored as a single unit through a calculator, as opposed to
    /// combining their children's scores.
    pub fn is_atomic_scored(&self) -> bool {
        matches!(
            self,
            NodeKind::Token(_)
                | NodeKind::Regex(_)
                | NodeKind::AtomicOr(_)
                | NodeKind::OrderedDistance(_)
                | NodeKind::Window(_)
                | NodeKind::Location(_)
                | NodeKind::End(_)
                | NodeKind::Word(_)
        )
    }

    pub fn is_short_word_or(&self) -> bool {
        match self {
            NodeKind::Or(or) => or.short_word_length != 0,
            NodeKind::AtomicOr(or) => or.short_word_length != 0,
            _ => false,
        }
    }
}

pub(crate) struct QueryNode {
    pub common: NodeCommon,
    pub kind: NodeKind,
}

impl QueryNode {
    pub fn new(kind: NodeKind) -> QueryNode {
        QueryNode { common: NodeCommon::default(), kind }
    }
}
