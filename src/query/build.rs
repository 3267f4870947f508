use crate::location::LocationIteratorPool;
use crate::query::node::{
    AndNotNode, AtomicOrNode, BooleanResultLeaf, EndNode, LocationNode, NodeId, NodeKind,
    OrNode, OrderedDistanceNode, QueryNode, RankingResultLeaf, RegexLeaf, ScaleNode,
    TermLeaf, TokenLeaf, WindowNode,
};
use crate::query::{Query, TermMatchMode};
use crate::score::{ScoreCalculator, ScoreCombiner, ScoreNegator};
use crate::{DocumentId, DocumentScore, Position};

/// Assembles the query tree the parser would otherwise produce. Nodes are
/// created bottom-up; `build` hands the arena to a `Query` whose root still
/// has to be validated before retrieval.
///
/// Single-child conjunctions and disjunctions collapse to the child right
/// away; the validator takes care of every deeper simplification.
pub struct QueryBuilder {
    nodes: Vec<QueryNode>,
}

impl QueryBuilder {
    pub fn new() -> QueryBuilder {
        QueryBuilder { nodes: Vec::new() }
    }

    fn push(&mut self, node: QueryNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    fn push_internal(&mut self, kind: NodeKind, children: Vec<NodeId>) -> NodeId {
        let mut node = QueryNode::new(kind);
        node.common.children = children;
        self.push(node)
    }

    /// A query term: rewritten by validation into tokens, a phrase, or a
    /// short-word expansion.
    pub fn term(&mut self, term: impl Into<String>, match_mode: TermMatchMode) -> NodeId {
        self.push(QueryNode::new(NodeKind::Term(TermLeaf {
            term: term.into(),
            match_mode,
            language: None,
        })))
    }

    pub fn term_with_language(
        &mut self,
        term: impl Into<String>,
        match_mode: TermMatchMode,
        language: impl Into<String>,
    ) -> NodeId {
        self.push(QueryNode::new(NodeKind::Term(TermLeaf {
            term: term.into(),
            match_mode,
            language: Some(language.into()),
        })))
    }

    /// A raw index term, bound directly to its inverted list.
    pub fn token(&mut self, token: impl Into<String>) -> NodeId {
        let token = token.into();
        let token_length = token.chars().count() as Position;
        self.push(QueryNode::new(NodeKind::Token(TokenLeaf {
            token,
            token_length,
            list: None,
            iterator: None,
        })))
    }

    pub fn regex(&mut self, pattern: impl Into<String>) -> NodeId {
        self.push(QueryNode::new(NodeKind::Regex(RegexLeaf {
            pattern: pattern.into(),
            regex: None,
            cursor: None,
        })))
    }

    /// A constant boolean hit set.
    pub fn boolean_result(&mut self, docs: impl IntoIterator<Item = DocumentId>) -> NodeId {
        let mut docs: Vec<DocumentId> = docs.into_iter().collect();
        docs.sort_unstable();
        docs.dedup();
        self.push(QueryNode::new(NodeKind::BooleanResult(BooleanResultLeaf { docs })))
    }

    /// A constant ranked hit set, sorted by ascending document id.
    pub fn ranking_result(&mut self, docs: Vec<(DocumentId, DocumentScore)>) -> NodeId {
        self.push(QueryNode::new(NodeKind::RankingResult(RankingResultLeaf { docs })))
    }

    pub fn and(&mut self, mut children: Vec<NodeId>) -> NodeId {
        if children.len() == 1 {
            return children.pop().unwrap();
        }
        self.push_internal(NodeKind::And, children)
    }

    pub fn and_with_combiner(
        &mut self,
        children: Vec<NodeId>,
        combiner: Box<dyn ScoreCombiner>,
    ) -> NodeId {
        let id = self.and(children);
        self.nodes[id.index()].common.combiner = Some(combiner);
        id
    }

    pub fn or(&mut self, mut children: Vec<NodeId>) -> NodeId {
        if children.len() == 1 {
            return children.pop().unwrap();
        }
        self.push_internal(NodeKind::Or(OrNode { short_word_length: 0 }), children)
    }

    pub fn or_with_combiner(
        &mut self,
        children: Vec<NodeId>,
        combiner: Box<dyn ScoreCombiner>,
    ) -> NodeId {
        let id = self.or(children);
        self.nodes[id.index()].common.combiner = Some(combiner);
        id
    }

    /// `#syn`: a disjunction scored as a single unit.
    pub fn synonym(&mut self, children: Vec<NodeId>) -> NodeId {
        self.push_internal(
            NodeKind::AtomicOr(AtomicOrNode { synonym_id: 0, short_word_length: 0 }),
            children,
        )
    }

    pub fn and_not(&mut self, left: NodeId, right: NodeId) -> NodeId {
        self.push_internal(
            NodeKind::AndNot(AndNotNode {
                negator: None,
                child0_memo: (0, 0),
                child1_memo: (0, 0),
            }),
            vec![left, right],
        )
    }

    pub fn and_not_with_negator(
        &mut self,
        left: NodeId,
        right: NodeId,
        negator: Box<dyn ScoreNegator>,
    ) -> NodeId {
        let id = self.and_not(left, right);
        match &mut self.nodes[id.index()].kind {
            NodeKind::AndNot(node) => node.negator = Some(negator),
            _ => unreachable!(),
        }
        id
    }

    /// A phrase: child `i` occurs at `positions[i]` relative to the match.
    pub fn ordered_distance(
        &mut self,
        positions: Vec<Position>,
        children: Vec<NodeId>,
    ) -> NodeId {
        assert_eq!(positions.len(), children.len());
        self.push_internal(
            NodeKind::OrderedDistance(OrderedDistanceNode {
                path_positions: positions,
                pool: LocationIteratorPool::new(),
            }),
            children,
        )
    }

    /// `#window` / `#owindow`: distance between child start positions.
    pub fn window(
        &mut self,
        min: Position,
        max: Position,
        ordered: bool,
        children: Vec<NodeId>,
    ) -> NodeId {
        self.push_internal(
            NodeKind::Window(WindowNode {
                min,
                max,
                ordered,
                simple: false,
                pool: LocationIteratorPool::new(),
            }),
            children,
        )
    }

    /// `#swindow`: first-start to last-end span.
    pub fn simple_window(
        &mut self,
        min: Position,
        max: Position,
        ordered: bool,
        children: Vec<NodeId>,
    ) -> NodeId {
        self.push_internal(
            NodeKind::Window(WindowNode {
                min,
                max,
                ordered,
                simple: true,
                pool: LocationIteratorPool::new(),
            }),
            children,
        )
    }

    pub fn scale(&mut self, factor: f64, child: NodeId) -> NodeId {
        self.push_internal(NodeKind::Scale(ScaleNode { factor }), vec![child])
    }

    /// `#location[p]`: the child must occur starting at position `p`.
    pub fn location(&mut self, position: Position, child: NodeId) -> NodeId {
        self.push_internal(NodeKind::Location(LocationNode { position }), vec![child])
    }

    /// `#end[d]`: the child must occur ending at position `d`.
    pub fn end(&mut self, distance: Position, child: NodeId) -> NodeId {
        self.push_internal(NodeKind::End(EndNode { distance }), vec![child])
    }

    pub fn set_calculator(&mut self, id: NodeId, calculator: Box<dyn ScoreCalculator>) {
        self.nodes[id.index()].common.calculator = Some(calculator);
    }

    pub fn set_combiner(&mut self, id: NodeId, combiner: Box<dyn ScoreCombiner>) {
        self.nodes[id.index()].common.combiner = Some(combiner);
    }

    pub fn build(self, root: NodeId) -> Query {
        Query::from_nodes(self.nodes, root)
    }
}

impl Default for QueryBuilder {
    fn default() -> QueryBuilder {
        QueryBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_child_and_collapses() {
        let mut builder = QueryBuilder::new();
        let token = builder.token("ab");
        let and = builder.and(vec![token]);
        assert_eq!(and, token);
    }

    #[test]
    fn and_not_keeps_its_two_operands_in_order() {
        let mut builder = QueryBuilder::new();
        let a = builder.token("ab");
        let b = builder.token("cd");
        let node = builder.and_not(a, b);
        let query = builder.build(node);
        assert_eq!(query.node(node).common.children, vec![a, b]);
    }
}
