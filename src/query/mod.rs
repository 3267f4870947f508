use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use once_cell::sync::Lazy;
use roaring::RoaringBitmap;

use crate::index::DocumentLengthStore;
use crate::score::{ScoreCalculator, ScoreCombiner, ScoreNegator};
use crate::{DocumentId, DocumentScore, InternalError, Result};

mod build;
mod canonical;
mod eval;
mod node;
mod ranking;
mod score_eval;
mod validate;

pub use self::build::QueryBuilder;
pub use self::canonical::DescriptionOptions;
pub use self::node::{NodeId, TermMatchMode};

pub(crate) use self::node::{
    FirstStepStatus, NodeCommon, NodeKind, QueryNode, MAX_SORT_FACTOR,
};

fn env_parameter<T: FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Above this product of OR-children counts under one AND, OR-normal-form
/// conversion is abandoned: the rewritten tree would grow too large to help.
static OR_STANDARD_THRESHOLD: Lazy<u64> =
    Lazy::new(|| env_parameter("InvertedQueryOrStandardThreshold", 100));

/// ORs with more children than this are not flattened into their parent.
static OR_FLATTEN_THRESHOLD: Lazy<usize> =
    Lazy::new(|| env_parameter("InvertedQueryOrFlattenThreshold", 100));

/// Caps the number of locations walked when a node must count them to learn
/// a term frequency.
static TF_COUNT_UPPER_LIMIT: Lazy<u32> =
    Lazy::new(|| env_parameter("Inverted_TfCountUpperLimit", 100));

/// Which rewrites `validate` performs, and whether the query ranks.
#[derive(Debug, Clone, Copy)]
pub struct ValidateMode {
    pub ranking: bool,
    pub flatten: bool,
    pub sort_children: bool,
    pub or_standard: bool,
    pub shared_node: bool,
    pub make_rough: bool,
    pub to_simple_window: bool,
}

impl ValidateMode {
    pub fn boolean() -> ValidateMode {
        ValidateMode {
            ranking: false,
            flatten: true,
            sort_children: true,
            or_standard: true,
            shared_node: true,
            make_rough: true,
            to_simple_window: true,
        }
    }

    pub fn ranking() -> ValidateMode {
        ValidateMode { ranking: true, ..ValidateMode::boolean() }
    }
}

/// Physical evaluation strategy switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvaluateMode {
    /// Skip position checks: answer from the rough superset predicate.
    pub rough: bool,
    /// Evaluate conjunctions term-at-a-time instead of
    /// document-at-a-time during bulk retrieval.
    pub and_term_at_a_time: bool,
}

impl EvaluateMode {
    pub(crate) const PRECISE: EvaluateMode =
        EvaluateMode { rough: false, and_term_at_a_time: false };

    pub(crate) fn rough(self) -> EvaluateMode {
        EvaluateMode { rough: true, ..self }
    }

    pub(crate) fn precise(self) -> EvaluateMode {
        EvaluateMode { rough: false, ..self }
    }
}

/// A term recorded for keyword-in-context extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchTerm {
    pub term: String,
    pub language: Option<String>,
    pub match_mode: TermMatchMode,
    pub synonym_id: u32,
}

/// The query evaluation entry point: owns the node arena, validates the
/// tree against an inverted file and runs boolean or ranked retrieval.
///
/// A query is single-threaded; concurrent use must be serialised by the
/// caller. Retrieval methods emit document ids in strictly ascending order.
pub struct Query {
    pub(crate) nodes: Vec<QueryNode>,
    pub(crate) root: Option<NodeId>,
    /// Canonical-string keyed registry of shared internal nodes.
    pub(crate) node_map: HashMap<String, NodeId>,
    /// One shared leaf per (token, match mode) pair.
    pub(crate) token_map: HashMap<String, NodeId>,
    /// `#term[…](…)` string of every node synthesised from a term leaf.
    pub(crate) term_nodes: Vec<(String, NodeId)>,
    pub(crate) total_document_frequency: u64,
    pub(crate) average_document_length: u32,
    pub(crate) or_standard_threshold: u64,
    pub(crate) or_flatten_threshold: usize,
    pub(crate) tf_count_upper_limit: u32,
    pub(crate) default_and_combiner: Option<Box<dyn ScoreCombiner>>,
    pub(crate) default_and_not_combiner: Option<Box<dyn ScoreCombiner>>,
    pub(crate) default_or_combiner: Option<Box<dyn ScoreCombiner>>,
    pub(crate) default_calculator: Option<Box<dyn ScoreCalculator>>,
    pub(crate) default_negator: Option<Box<dyn ScoreNegator>>,
    pub(crate) length_store: Option<Arc<dyn DocumentLengthStore>>,
    pub(crate) short_word: bool,
    pub(crate) ranking: bool,
    pub(crate) validated: bool,
}

impl Query {
    pub fn builder() -> QueryBuilder {
        QueryBuilder::new()
    }

    pub(crate) fn from_nodes(nodes: Vec<QueryNode>, root: NodeId) -> Query {
        Query {
            nodes,
            root: Some(root),
            node_map: HashMap::new(),
            token_map: HashMap::new(),
            term_nodes: Vec::new(),
            total_document_frequency: 0,
            average_document_length: 0,
            or_standard_threshold: *OR_STANDARD_THRESHOLD,
            or_flatten_threshold: *OR_FLATTEN_THRESHOLD,
            tf_count_upper_limit: *TF_COUNT_UPPER_LIMIT,
            default_and_combiner: None,
            default_and_not_combiner: None,
            default_or_combiner: None,
            default_calculator: None,
            default_negator: None,
            length_store: None,
            short_word: false,
            ranking: false,
            validated: false,
        }
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn set_root(&mut self, root: NodeId) {
        self.root = Some(root);
        self.validated = false;
    }

    pub(crate) fn node(&self, id: NodeId) -> &QueryNode {
        &self.nodes[id.index()]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut QueryNode {
        &mut self.nodes[id.index()]
    }

    pub(crate) fn children_of(&self, id: NodeId) -> Vec<NodeId> {
        self.node(id).common.children.clone()
    }

    pub(crate) fn push_node(&mut self, node: QueryNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub(crate) fn require_root(&self) -> Result<NodeId> {
        match self.root {
            Some(root) if self.validated => Ok(root),
            _ => Err(InternalError::NotValidated.into()),
        }
    }

    pub fn set_default_and_score_combiner(&mut self, combiner: Box<dyn ScoreCombiner>) {
        self.default_and_combiner = Some(combiner);
    }

    pub fn set_default_and_not_score_combiner(&mut self, combiner: Box<dyn ScoreCombiner>) {
        self.default_and_not_combiner = Some(combiner);
    }

    pub fn set_default_or_score_combiner(&mut self, combiner: Box<dyn ScoreCombiner>) {
        self.default_or_combiner = Some(combiner);
    }

    pub fn set_default_score_calculator(&mut self, calculator: Box<dyn ScoreCalculator>) {
        self.default_calculator = Some(calculator);
    }

    pub fn set_default_score_negator(&mut self, negator: Box<dyn ScoreNegator>) {
        self.default_negator = Some(negator);
    }

    pub fn set_document_length_store(&mut self, store: Arc<dyn DocumentLengthStore>) {
        self.length_store = Some(store);
    }

    pub fn set_or_standard_threshold(&mut self, threshold: u64) {
        self.or_standard_threshold = threshold;
    }

    pub fn set_or_flatten_threshold(&mut self, threshold: usize) {
        self.or_flatten_threshold = threshold;
    }

    pub fn set_tf_count_upper_limit(&mut self, limit: u32) {
        self.tf_count_upper_limit = limit;
    }

    pub fn total_document_frequency(&self) -> u64 {
        self.total_document_frequency
    }

    pub fn average_document_length(&self) -> u32 {
        self.average_document_length
    }

    /// True when validation expanded a term shorter than an index term.
    pub fn has_short_word(&self) -> bool {
        self.short_word
    }

    /// The `#term[…](…)` strings of the nodes synthesised from term
    /// leaves, with the node they resolve to.
    pub fn term_nodes(&self) -> &[(String, NodeId)] {
        &self.term_nodes
    }

    /// True when the node descends from a conjunction (or is the negative
    /// operand of an and-not): a term that vanished from this index may
    /// still hit another one, so its document frequency must be probed
    /// cross-index.
    pub fn needs_document_frequency(&self, id: NodeId) -> bool {
        self.node(id).common.need_df
    }

    /// The search terms of the validated tree, for keyword-in-context.
    pub fn search_terms(&self) -> Vec<SearchTerm> {
        let mut terms = Vec::new();
        for node in &self.nodes {
            if let Some(original) = &node.common.original_term {
                let synonym_id = match &node.kind {
                    NodeKind::AtomicOr(or) => or.synonym_id,
                    _ => 0,
                };
                let term = SearchTerm {
                    term: original.term.clone(),
                    language: original.language.clone(),
                    match_mode: original.match_mode,
                    synonym_id,
                };
                if !terms.contains(&term) {
                    terms.push(term);
                }
            }
        }
        terms
    }

    /// Canonical description of the validated tree.
    pub fn description(&self, options: DescriptionOptions) -> String {
        match self.root {
            Some(root) => self.canonical_string(root, options),
            None => String::new(),
        }
    }

    /// Boolean retrieval: every document that satisfies the tree, minus
    /// the excluded ids, capped at `max_id`.
    pub fn retrieve(
        &mut self,
        excluded: &RoaringBitmap,
        max_id: DocumentId,
    ) -> Result<RoaringBitmap> {
        self.retrieve_with(excluded, max_id, EvaluateMode::default())
    }

    /// Boolean retrieval with an explicit strategy selection, e.g.
    /// term-at-a-time conjunctions.
    pub fn retrieve_with(
        &mut self,
        excluded: &RoaringBitmap,
        max_id: DocumentId,
        mode: EvaluateMode,
    ) -> Result<RoaringBitmap> {
        let root = self.require_root()?;
        let mut result = RoaringBitmap::new();
        self.retrieve_into(root, mode.precise(), &mut result)?;
        result -= excluded;
        if max_id < DocumentId::MAX {
            result.remove_range(max_id + 1..);
        }
        Ok(result)
    }

    /// Ranked retrieval: the two scoring steps back to back, returning
    /// `(document, score)` pairs by ascending document id.
    pub fn retrieve_ranked(
        &mut self,
        excluded: &RoaringBitmap,
        max_id: DocumentId,
    ) -> Result<Vec<(DocumentId, DocumentScore)>> {
        let root = self.require_root()?;
        self.do_first_step(root, excluded, max_id)?;
        self.do_second_step_result(root)
    }

    /// Check a single document against the validated tree.
    pub fn evaluate(&mut self, doc: DocumentId) -> Result<bool> {
        let root = self.require_root()?;
        let matched = self.evaluate_node(root, doc, EvaluateMode::PRECISE)?;
        self.check_memo(root)?;
        Ok(matched)
    }

    /// Score a single document, `None` when it does not match.
    pub fn evaluate_score(&mut self, doc: DocumentId) -> Result<Option<DocumentScore>> {
        let root = self.require_root()?;
        self.evaluate_score_node(root, doc)
    }

    /// The first matching document at or after `given`. Monotone inputs
    /// reuse the per-node memos; a regressing input forces a reset and is
    /// supported but more expensive.
    pub fn lower_bound(&mut self, given: DocumentId) -> Result<Option<DocumentId>> {
        let root = self.require_root()?;
        self.lower_bound_node(root, given, EvaluateMode::PRECISE)
    }

    /// The first matching document at or after `given` with its score.
    pub fn lower_bound_score(
        &mut self,
        given: DocumentId,
    ) -> Result<Option<(DocumentId, DocumentScore)>> {
        let root = self.require_root()?;
        self.lower_bound_score_node(root, given)
    }

    /// Document frequency of the whole query. The estimate path answers
    /// from per-node approximations; the exact path runs a boolean
    /// retrieve, trims everything above `max_id` and subtracts the
    /// excluded ids.
    pub fn document_frequency(
        &mut self,
        estimate: bool,
        excluded: Option<&RoaringBitmap>,
        max_id: DocumentId,
    ) -> Result<u64> {
        let root = self.require_root()?;
        if matches!(self.node(root).kind, NodeKind::Empty) {
            return Ok(0);
        }
        if estimate {
            let estimated = self.estimate_document_frequency(root);
            return Ok(estimated.min(self.total_document_frequency));
        }
        if excluded.map_or(true, |e| e.is_empty()) {
            if let NodeKind::Token(leaf) = &self.node(root).kind {
                if let Some(list) = &leaf.list {
                    if list.last_document_id() <= max_id {
                        return Ok(list.document_frequency());
                    }
                }
            }
        }
        let empty = RoaringBitmap::new();
        let result = self.retrieve(excluded.unwrap_or(&empty), max_id)?;
        Ok(result.len())
    }
}
