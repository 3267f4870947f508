use smallvec::SmallVec;

use crate::query::node::{NodeId, NodeKind};
use crate::query::{EvaluateMode, Query};
use crate::{DocumentId, DocumentScore, InternalError, Result, UPPER_BOUND_DOC_ID};

impl Query {
    /// Score one document against a node, `None` when it does not match.
    pub(crate) fn evaluate_score_node(
        &mut self,
        id: NodeId,
        doc: DocumentId,
    ) -> Result<Option<DocumentScore>> {
        match &self.node(id).kind {
            NodeKind::Empty => Ok(None),
            NodeKind::Term(_) => Err(InternalError::DanglingTermLeaf.into()),
            NodeKind::RankingResult(leaf) => {
                match leaf.docs.binary_search_by_key(&doc, |&(d, _)| d) {
                    Ok(at) => Ok(Some(leaf.docs[at].1)),
                    Err(_) => Ok(None),
                }
            }
            NodeKind::BooleanResult(leaf) => {
                // membership only, no scoring information
                if leaf.docs.binary_search(&doc).is_ok() {
                    Ok(Some(0.0))
                } else {
                    Ok(None)
                }
            }
            NodeKind::And => self.combined_score(id, doc, true),
            NodeKind::Or(_) => self.combined_score(id, doc, false),
            NodeKind::AndNot(_) => self.and_not_score(id, doc),
            NodeKind::Scale(_) => {
                let (child, factor) = self.scale_parts(id);
                match self.evaluate_score_node(child, doc)? {
                    Some(score) => Ok(Some(score * factor)),
                    None => Ok(None),
                }
            }
            _ => self.atomic_score(id, doc),
        }
    }

    pub(crate) fn scale_parts(&self, id: NodeId) -> (NodeId, f64) {
        let child = self.node(id).common.children[0];
        let factor = match &self.node(id).kind {
            NodeKind::Scale(scale) => scale.factor,
            _ => unreachable!(),
        };
        (child, factor)
    }

    /// Token, regex, synonym, phrase, window and the positional wrappers:
    /// one term frequency, one calculator.
    fn atomic_score(&mut self, id: NodeId, doc: DocumentId) -> Result<Option<DocumentScore>> {
        if !self.evaluate_node(id, doc, EvaluateMode::PRECISE)? {
            return Ok(None);
        }
        let tf = self.term_frequency(id, doc)?;
        if tf == 0 {
            return Ok(None);
        }
        match &self.node(id).common.calculator {
            Some(calculator) => Ok(calculator.score(tf, doc)),
            None => Ok(Some(0.0)),
        }
    }

    fn combined_score(
        &mut self,
        id: NodeId,
        doc: DocumentId,
        conjunctive: bool,
    ) -> Result<Option<DocumentScore>> {
        let mut scores: SmallVec<[DocumentScore; 8]> = SmallVec::new();
        for child in self.children_of(id) {
            match self.evaluate_score_node(child, doc)? {
                Some(score) => scores.push(score),
                None if conjunctive => return Ok(None),
                None => (),
            }
        }
        if scores.is_empty() {
            return Ok(None);
        }
        if conjunctive {
            // positions still have to agree for phrase-bearing children
            if !self.reevaluate(id, doc)? {
                return Ok(None);
            }
        }
        Ok(Some(self.fold_scores(id, &scores)))
    }

    pub(crate) fn fold_scores(&self, id: NodeId, scores: &[DocumentScore]) -> DocumentScore {
        match &self.node(id).common.combiner {
            Some(combiner) => {
                let mut iter = scores.iter();
                let first = *iter.next().unwrap();
                iter.fold(first, |acc, &s| combiner.combine(acc, s))
            }
            None => scores.iter().cloned().fold(0.0, f64::max),
        }
    }

    /// Without a negator this is set difference. With one, a document that
    /// satisfies the first operand always scores: the second operand's
    /// score, or 0.0 when it misses, goes through the negator and then the
    /// combiner.
    fn and_not_score(&mut self, id: NodeId, doc: DocumentId) -> Result<Option<DocumentScore>> {
        {
            let common = &self.node(id).common;
            if doc >= common.lower
                && (doc < common.upper || common.upper == UPPER_BOUND_DOC_ID)
            {
                return Ok(None);
            }
        }
        let children = self.children_of(id);
        let (first, second) = (children[0], children[1]);
        let has_negator = match &self.node(id).kind {
            NodeKind::AndNot(node) => node.negator.is_some(),
            _ => unreachable!(),
        };

        let score0 = match self.evaluate_score_node(first, doc)? {
            Some(score) => score,
            None => return Ok(None),
        };

        let score = if !has_negator {
            if self.evaluate_node(second, doc, EvaluateMode::PRECISE)? {
                return Ok(None);
            }
            score0
        } else {
            let score1 = self.evaluate_score_node(second, doc)?.unwrap_or(0.0);
            let node = self.node(id);
            let negated = match &node.kind {
                NodeKind::AndNot(and_not) => {
                    and_not.negator.as_ref().unwrap().apply(score1)
                }
                _ => unreachable!(),
            };
            match &node.common.combiner {
                Some(combiner) => combiner.combine(score0, negated),
                None => score0,
            }
        };

        self.set_memo(id, doc, doc);
        Ok(Some(score))
    }

    /// Scored lower bound: the first matching document at or after `given`
    /// together with its score.
    pub(crate) fn lower_bound_score_node(
        &mut self,
        id: NodeId,
        given: DocumentId,
    ) -> Result<Option<(DocumentId, DocumentScore)>> {
        let mut current = given;
        while let Some(doc) = self.lower_bound_node(id, current, EvaluateMode::PRECISE)? {
            if let Some(score) = self.evaluate_score_node(id, doc)? {
                return Ok(Some((doc, score)));
            }
            current = match doc.checked_add(1) {
                Some(next) => next,
                None => break,
            };
        }
        Ok(None)
    }
}
