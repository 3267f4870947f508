use log::warn;
use roaring::RoaringBitmap;

use crate::location::{LocationIterator, OrLocationIterator, SpanLocationIterator};
use crate::query::node::{NodeId, NodeKind, QueryNode, MAX_SORT_FACTOR};
use crate::query::{EvaluateMode, Query};
use crate::{
    DocumentId, InternalError, Position, Result, TermFrequency, UPPER_BOUND_DOC_ID,
};

/// What a precise re-evaluation learned about a matching document: the
/// occurrence positions, or only a term-frequency upper bound when some
/// inverted list stores no positions.
pub(crate) enum Evidence {
    Locations(Box<dyn LocationIterator>),
    Frequency(TermFrequency),
}

fn token_parts(node: &mut QueryNode) -> Result<(&mut crate::query::node::NodeCommon, &mut crate::query::node::TokenLeaf)> {
    let QueryNode { common, kind } = node;
    match kind {
        NodeKind::Token(leaf) => Ok((common, leaf)),
        _ => unreachable!("token_parts on a non-token node"),
    }
}

impl Query {
    pub(crate) fn memo_evaluate_fast(&self, id: NodeId, doc: DocumentId) -> Option<bool> {
        let common = &self.node(id).common;
        if doc >= common.lower {
            if doc == common.upper {
                return Some(true);
            }
            if doc < common.upper || common.upper == UPPER_BOUND_DOC_ID {
                return Some(false);
            }
        }
        None
    }

    pub(crate) fn memo_lower_bound_fast(
        &self,
        id: NodeId,
        given: DocumentId,
    ) -> Option<Option<DocumentId>> {
        let common = &self.node(id).common;
        if given >= common.lower {
            if common.upper == UPPER_BOUND_DOC_ID {
                return Some(None);
            }
            if given <= common.upper {
                return Some(Some(common.upper));
            }
        }
        None
    }

    pub(crate) fn set_memo(&mut self, id: NodeId, lower: DocumentId, upper: DocumentId) {
        let common = &mut self.node_mut(id).common;
        common.lower = lower;
        common.upper = upper;
    }

    pub(crate) fn check_memo(&self, id: NodeId) -> Result<()> {
        let common = &self.node(id).common;
        if common.upper != UPPER_BOUND_DOC_ID && common.upper < common.lower && common.upper != 0 {
            return Err(InternalError::MemoInvariant {
                node: id.0,
                lower: common.lower,
                upper: common.upper,
            }
            .into());
        }
        Ok(())
    }

    /// The rough pointer of a node, when it is usable for delegation.
    fn rough_of(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).common.rough.filter(|rough| *rough != id)
    }

    // ------------------------------------------------------------------
    // evaluate
    // ------------------------------------------------------------------

    pub(crate) fn evaluate_node(
        &mut self,
        id: NodeId,
        doc: DocumentId,
        mode: EvaluateMode,
    ) -> Result<bool> {
        match &self.node(id).kind {
            NodeKind::Empty => Ok(false),
            NodeKind::Token(_) => self.token_evaluate(id, doc),
            NodeKind::Regex(_) => Ok(self.regex_lower_bound(id, doc)? == Some(doc)),
            NodeKind::BooleanResult(leaf) => Ok(leaf.docs.binary_search(&doc).is_ok()),
            NodeKind::RankingResult(leaf) => {
                Ok(leaf.docs.binary_search_by_key(&doc, |&(d, _)| d).is_ok())
            }
            NodeKind::Term(_) => Err(InternalError::DanglingTermLeaf.into()),
            NodeKind::Or(_) | NodeKind::AtomicOr(_) => self.or_evaluate(id, doc, mode),
            NodeKind::AndNot(_) => self.and_not_evaluate(id, doc, mode),
            NodeKind::Scale(_) => {
                let child = self.node(id).common.children[0];
                self.evaluate_node(child, doc, mode)
            }
            _ => self.conjunction_evaluate(id, doc, mode),
        }
    }

    fn token_evaluate(&mut self, id: NodeId, doc: DocumentId) -> Result<bool> {
        let (common, leaf) = token_parts(self.node_mut(id))?;
        let iterator = leaf.iterator.as_mut().ok_or(InternalError::IteratorNotBound)?;

        if doc >= common.lower {
            if doc == common.upper {
                return Ok(true);
            }
            if doc < common.upper || common.upper == UPPER_BOUND_DOC_ID {
                return Ok(false);
            }
        }

        if iterator.is_end() || common.lower > doc {
            iterator.reset();
            common.upper = 0;
            common.lower = 1;
        }

        iterator.lower_bound(doc);
        if doc > common.upper {
            common.lower = doc;
        }
        common.upper = iterator.document_id();
        if doc == common.upper {
            return Ok(true);
        }
        if iterator.is_end() {
            common.upper = UPPER_BOUND_DOC_ID;
        }
        Ok(false)
    }

    fn or_evaluate(&mut self, id: NodeId, doc: DocumentId, mode: EvaluateMode) -> Result<bool> {
        if let Some(answer) = self.memo_evaluate_fast(id, doc) {
            return Ok(answer);
        }
        for child in self.children_of(id) {
            if self.evaluate_node(child, doc, mode)? {
                if !mode.rough {
                    self.set_memo(id, doc, doc);
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn and_not_evaluate(
        &mut self,
        id: NodeId,
        doc: DocumentId,
        mode: EvaluateMode,
    ) -> Result<bool> {
        if let Some(answer) = self.memo_evaluate_fast(id, doc) {
            return Ok(answer);
        }
        if mode.rough {
            if let Some(rough) = self.rough_of(id) {
                return self.evaluate_node(rough, doc, mode.precise());
            }
        }
        let children = self.children_of(id);
        let (first, second) = (children[0], children[1]);
        if !self.evaluate_node(first, doc, mode.rough())? {
            return Ok(false);
        }
        if mode.rough {
            // the second operand is never consulted roughly
            return Ok(true);
        }
        if self.reevaluate(first, doc)? {
            if self.evaluate_node(second, doc, mode.precise())? {
                Ok(false)
            } else {
                self.set_memo(id, doc, doc);
                Ok(true)
            }
        } else {
            Ok(false)
        }
    }

    /// And, ordered-distance, window and the unary positional wrappers:
    /// every child must admit the document, then the node's own precise
    /// check runs unless the caller only wants the rough answer.
    fn conjunction_evaluate(
        &mut self,
        id: NodeId,
        doc: DocumentId,
        mode: EvaluateMode,
    ) -> Result<bool> {
        if let Some(answer) = self.memo_evaluate_fast(id, doc) {
            return Ok(answer);
        }
        let rough = self.rough_of(id);
        if mode.rough {
            if let Some(rough) = rough {
                return self.evaluate_node(rough, doc, mode.precise());
            }
        }
        if let Some(rough) = rough {
            if !self.evaluate_node(rough, doc, mode.precise())? {
                return Ok(false);
            }
        } else {
            for child in self.children_of(id) {
                if !self.evaluate_node(child, doc, mode.rough())? {
                    return Ok(false);
                }
            }
        }
        if mode.rough {
            return Ok(true);
        }
        if self.reevaluate(id, doc)? {
            self.set_memo(id, doc, doc);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    // ------------------------------------------------------------------
    // lower_bound
    // ------------------------------------------------------------------

    pub(crate) fn lower_bound_node(
        &mut self,
        id: NodeId,
        given: DocumentId,
        mode: EvaluateMode,
    ) -> Result<Option<DocumentId>> {
        match &self.node(id).kind {
            NodeKind::Empty => Ok(None),
            NodeKind::Token(_) => self.token_lower_bound(id, given),
            NodeKind::Regex(_) => self.regex_lower_bound(id, given),
            NodeKind::BooleanResult(_) | NodeKind::RankingResult(_) => {
                self.result_lower_bound(id, given)
            }
            NodeKind::Term(_) => Err(InternalError::DanglingTermLeaf.into()),
            NodeKind::Or(_) | NodeKind::AtomicOr(_) => self.or_lower_bound(id, given, mode),
            NodeKind::AndNot(_) => self.and_not_lower_bound(id, given, mode),
            NodeKind::Scale(_) => {
                let child = self.node(id).common.children[0];
                self.lower_bound_node(child, given, mode)
            }
            _ => self.conjunction_lower_bound(id, given, mode),
        }
    }

    fn token_lower_bound(
        &mut self,
        id: NodeId,
        given: DocumentId,
    ) -> Result<Option<DocumentId>> {
        let (common, leaf) = token_parts(self.node_mut(id))?;
        let iterator = leaf.iterator.as_mut().ok_or(InternalError::IteratorNotBound)?;

        if given >= common.lower {
            if common.upper == UPPER_BOUND_DOC_ID {
                return Ok(None);
            }
            if given <= common.upper {
                return Ok(Some(common.upper));
            }
        }

        if common.lower > given || iterator.is_end() {
            iterator.reset();
            common.upper = 0;
            common.lower = 1;
        }

        iterator.lower_bound(given);
        if given > common.upper {
            common.lower = given;
        }
        if !iterator.is_end() {
            common.upper = iterator.document_id();
            Ok(Some(common.upper))
        } else {
            common.upper = UPPER_BOUND_DOC_ID;
            Ok(None)
        }
    }

    fn result_lower_bound(
        &mut self,
        id: NodeId,
        given: DocumentId,
    ) -> Result<Option<DocumentId>> {
        if let Some(answer) = self.memo_lower_bound_fast(id, given) {
            return Ok(answer);
        }
        let found = match &self.node(id).kind {
            NodeKind::BooleanResult(leaf) => {
                let at = leaf.docs.partition_point(|&d| d < given);
                leaf.docs.get(at).copied()
            }
            NodeKind::RankingResult(leaf) => {
                let at = leaf.docs.partition_point(|&(d, _)| d < given);
                leaf.docs.get(at).map(|&(d, _)| d)
            }
            _ => unreachable!(),
        };
        match found {
            Some(doc) => {
                self.set_memo(id, given, doc);
                Ok(Some(doc))
            }
            None => {
                self.set_memo(id, given, UPPER_BOUND_DOC_ID);
                Ok(None)
            }
        }
    }

    fn regex_lower_bound(
        &mut self,
        id: NodeId,
        given: DocumentId,
    ) -> Result<Option<DocumentId>> {
        if let Some(answer) = self.memo_lower_bound_fast(id, given) {
            return Ok(answer);
        }
        let QueryNode { common, kind } = self.node_mut(id);
        let leaf = match kind {
            NodeKind::Regex(leaf) => leaf,
            _ => unreachable!(),
        };
        let cursor = leaf.cursor.as_mut().ok_or(InternalError::IteratorNotBound)?;
        let regex = leaf.regex.as_ref().ok_or(InternalError::IteratorNotBound)?;

        if common.lower > given || cursor.is_end() {
            cursor.reset();
            common.upper = 0;
            common.lower = 1;
        }
        if given > common.upper {
            common.lower = given;
        }
        cursor.lower_bound(given);
        while !cursor.is_end() {
            if regex.is_match(cursor.body()) {
                common.upper = cursor.document_id();
                return Ok(Some(common.upper));
            }
            cursor.next();
        }
        common.upper = UPPER_BOUND_DOC_ID;
        Ok(None)
    }

    fn or_lower_bound(
        &mut self,
        id: NodeId,
        given: DocumentId,
        mode: EvaluateMode,
    ) -> Result<Option<DocumentId>> {
        if let Some(answer) = self.memo_lower_bound_fast(id, given) {
            return Ok(answer);
        }
        let mut best: Option<DocumentId> = None;
        for child in self.children_of(id) {
            if let Some(found) = self.lower_bound_node(child, given, mode)? {
                best = Some(best.map_or(found, |b: DocumentId| b.min(found)));
            }
        }
        if !mode.rough {
            match best {
                Some(found) => self.set_memo(id, given, found),
                None => self.set_memo(id, given, UPPER_BOUND_DOC_ID),
            }
        }
        Ok(best)
    }

    /// Document-at-a-time intersection: children agree on a candidate,
    /// then the precise check either confirms it or moves on.
    fn conjunction_lower_bound(
        &mut self,
        id: NodeId,
        given: DocumentId,
        mode: EvaluateMode,
    ) -> Result<Option<DocumentId>> {
        if let Some(answer) = self.memo_lower_bound_fast(id, given) {
            return Ok(answer);
        }
        let rough = self.rough_of(id);
        if mode.rough {
            if let Some(rough) = rough {
                return self.lower_bound_node(rough, given, mode.precise());
            }
        }
        if let Some(rough) = rough {
            let mut current = given;
            loop {
                match self.lower_bound_node(rough, current, mode.precise())? {
                    None => {
                        self.set_memo(id, given, UPPER_BOUND_DOC_ID);
                        return Ok(None);
                    }
                    Some(found) => {
                        current = found;
                        if mode.rough || self.reevaluate(id, current)? {
                            if !mode.rough {
                                self.set_memo(id, given, current);
                            }
                            return Ok(Some(current));
                        }
                        current += 1;
                    }
                }
            }
        }

        let children = self.children_of(id);
        if children.is_empty() {
            return Ok(None);
        }
        let mut current = given;
        let mut index = 0;
        loop {
            if index == children.len() {
                // every child admits `current`
                if mode.rough {
                    return Ok(Some(current));
                }
                if self.reevaluate(id, current)? {
                    self.set_memo(id, given, current);
                    return Ok(Some(current));
                }
                current += 1;
                index = 0;
                continue;
            }
            match self.lower_bound_node(children[index], current, mode.rough())? {
                None => {
                    self.set_memo(id, given, UPPER_BOUND_DOC_ID);
                    return Ok(None);
                }
                Some(smallest) => {
                    if smallest > current {
                        current = smallest;
                        index = if index == 0 { 1 } else { 0 };
                    } else {
                        index += 1;
                    }
                }
            }
        }
    }

    fn and_not_lower_bound(
        &mut self,
        id: NodeId,
        given: DocumentId,
        mode: EvaluateMode,
    ) -> Result<Option<DocumentId>> {
        if let Some(answer) = self.memo_lower_bound_fast(id, given) {
            return Ok(answer);
        }
        if mode.rough {
            if let Some(rough) = self.rough_of(id) {
                return self.lower_bound_node(rough, given, mode.precise());
            }
        }
        let children = self.children_of(id);
        let (first, second) = (children[0], children[1]);

        if mode.rough {
            // only the first operand matters roughly; its results are
            // mirrored in a side memo with this node's own inputs
            let (lower0, upper0) = self.and_not_side_memo(id, 0);
            if given >= lower0 {
                if upper0 == UPPER_BOUND_DOC_ID {
                    return Ok(None);
                }
                if given <= upper0 && upper0 != 0 {
                    return Ok(Some(upper0));
                }
            }
            let found = self.lower_bound_node(first, given, mode)?;
            self.set_and_not_side_memo(id, 0, given, found.unwrap_or(UPPER_BOUND_DOC_ID));
            return Ok(found);
        }

        let which_second = self.sort_factor(first) > self.sort_factor(second);
        let second_unbounded = self.sort_factor(second) == MAX_SORT_FACTOR;

        let mut current;
        let mut skip_first_probe = false;
        let (lower0, upper0) = self.and_not_side_memo(id, 0);
        if given >= lower0 && upper0 == UPPER_BOUND_DOC_ID {
            self.set_memo(id, given, UPPER_BOUND_DOC_ID);
            return Ok(None);
        }
        if given >= lower0 && given <= upper0 && upper0 != 0 {
            current = upper0;
            skip_first_probe = true;
        } else {
            current = given;
            self.set_and_not_side_memo(id, 0, given, upper0);
        }

        let mut second_current: DocumentId = 0;
        let mut found = None;
        'outer: loop {
            if !skip_first_probe {
                match self.lower_bound_node(first, current, mode.rough())? {
                    None => {
                        self.set_and_not_side_memo(id, 0, given, UPPER_BOUND_DOC_ID);
                        break 'outer;
                    }
                    Some(doc) => {
                        current = doc;
                        self.set_and_not_side_memo(id, 0, given, doc);
                    }
                }
            }
            skip_first_probe = false;

            loop {
                if second_unbounded {
                    // an expensive second operand is only ever re-checked
                    // on confirmed first-operand hits
                    if self.reevaluate(first, current)?
                        && !self.evaluate_node(second, current, mode.precise())?
                    {
                        found = Some(current);
                    }
                    break;
                }
                if current < second_current {
                    if self.reevaluate(first, current)? {
                        found = Some(current);
                    }
                    break;
                } else if current == second_current {
                    let hit = if which_second {
                        !self.reevaluate(second, current)? && self.reevaluate(first, current)?
                    } else {
                        self.reevaluate(first, current)? && !self.reevaluate(second, current)?
                    };
                    if hit {
                        found = Some(current);
                    }
                    break;
                } else {
                    let (lower1, upper1) = self.and_not_side_memo(id, 1);
                    if lower1 <= current && current <= upper1 && upper1 != 0 {
                        second_current = upper1;
                    } else {
                        match self.lower_bound_node(second, current, mode.rough())? {
                            Some(doc) => {
                                second_current = doc;
                                self.set_and_not_side_memo(id, 1, current, doc);
                            }
                            None => {
                                second_current = UPPER_BOUND_DOC_ID;
                                self.set_and_not_side_memo(
                                    id,
                                    1,
                                    current,
                                    UPPER_BOUND_DOC_ID,
                                );
                            }
                        }
                    }
                }
            }

            if found.is_some() {
                break 'outer;
            }
            current = match current.checked_add(1) {
                Some(next) => next,
                None => break 'outer,
            };
        }

        match found {
            Some(doc) => {
                self.set_memo(id, given, doc);
                Ok(Some(doc))
            }
            None => {
                self.set_memo(id, given, UPPER_BOUND_DOC_ID);
                Ok(None)
            }
        }
    }

    fn and_not_side_memo(&self, id: NodeId, operand: usize) -> (DocumentId, DocumentId) {
        match &self.node(id).kind {
            NodeKind::AndNot(node) => {
                if operand == 0 {
                    node.child0_memo
                } else {
                    node.child1_memo
                }
            }
            _ => unreachable!(),
        }
    }

    fn set_and_not_side_memo(
        &mut self,
        id: NodeId,
        operand: usize,
        lower: DocumentId,
        upper: DocumentId,
    ) {
        match &mut self.node_mut(id).kind {
            NodeKind::AndNot(node) => {
                if operand == 0 {
                    node.child0_memo = (lower, upper);
                } else {
                    node.child1_memo = (lower, upper);
                }
            }
            _ => unreachable!(),
        }
    }

    // ------------------------------------------------------------------
    // precise re-evaluation
    // ------------------------------------------------------------------

    pub(crate) fn reevaluate(&mut self, id: NodeId, doc: DocumentId) -> Result<bool> {
        match &self.node(id).kind {
            NodeKind::Empty => Ok(false),
            NodeKind::Token(_) => {
                if let NodeKind::Token(leaf) = &self.node(id).kind {
                    if let Some(iterator) = &leaf.iterator {
                        if iterator.document_id() == doc {
                            return Ok(true);
                        }
                    }
                }
                self.token_evaluate(id, doc)
            }
            NodeKind::Regex(_) => Ok(self.regex_lower_bound(id, doc)? == Some(doc)),
            NodeKind::BooleanResult(leaf) => Ok(leaf.docs.binary_search(&doc).is_ok()),
            NodeKind::RankingResult(leaf) => {
                Ok(leaf.docs.binary_search_by_key(&doc, |&(d, _)| d).is_ok())
            }
            NodeKind::Term(_) => Err(InternalError::DanglingTermLeaf.into()),
            NodeKind::And => {
                for child in self.children_of(id) {
                    if !self.reevaluate(child, doc)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            NodeKind::Or(_) | NodeKind::AtomicOr(_) => {
                for child in self.children_of(id) {
                    if self.reevaluate(child, doc)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            NodeKind::AndNot(_) => {
                let children = self.children_of(id);
                Ok(self.reevaluate(children[0], doc)?
                    && !self.evaluate_node(children[1], doc, EvaluateMode::PRECISE)?)
            }
            NodeKind::Scale(_) => {
                let child = self.node(id).common.children[0];
                self.reevaluate(child, doc)
            }
            _ => Ok(self.reevaluate_evidence(id, doc)?.is_some()),
        }
    }

    /// Precise check returning the match evidence. Absent positions fail a
    /// positional node unless *every* member lacks them, in which case the
    /// smallest member frequency is accepted as a conservative TF bound.
    pub(crate) fn reevaluate_evidence(
        &mut self,
        id: NodeId,
        doc: DocumentId,
    ) -> Result<Option<Evidence>> {
        match &self.node(id).kind {
            NodeKind::Empty => Ok(None),
            NodeKind::Token(_) => self.token_evidence(id, doc),
            NodeKind::Regex(_) => self.regex_evidence(id, doc),
            NodeKind::BooleanResult(leaf) => {
                if leaf.docs.binary_search(&doc).is_ok() {
                    Ok(Some(Evidence::Frequency(1)))
                } else {
                    Ok(None)
                }
            }
            NodeKind::RankingResult(leaf) => {
                if leaf.docs.binary_search_by_key(&doc, |&(d, _)| d).is_ok() {
                    Ok(Some(Evidence::Frequency(1)))
                } else {
                    Ok(None)
                }
            }
            NodeKind::Term(_) => Err(InternalError::DanglingTermLeaf.into()),
            NodeKind::And => {
                let mut tf = TermFrequency::MAX;
                for child in self.children_of(id) {
                    match self.reevaluate_evidence(child, doc)? {
                        None => return Ok(None),
                        Some(evidence) => {
                            tf = tf.min(self.evidence_frequency(evidence, doc).max(1))
                        }
                    }
                }
                Ok(Some(Evidence::Frequency(tf)))
            }
            NodeKind::Or(_) | NodeKind::AtomicOr(_) => self.or_evidence(id, doc),
            NodeKind::AndNot(_) => {
                let children = self.children_of(id);
                if self.evaluate_node(children[1], doc, EvaluateMode::PRECISE)? {
                    return Ok(None);
                }
                self.reevaluate_evidence(children[0], doc)
            }
            NodeKind::Scale(_) => {
                let child = self.node(id).common.children[0];
                self.reevaluate_evidence(child, doc)
            }
            NodeKind::OrderedDistance(_) => self.ordered_distance_evidence(id, doc),
            NodeKind::Window(_) => self.window_evidence(id, doc),
            NodeKind::Location(_) => {
                let position = match &self.node(id).kind {
                    NodeKind::Location(node) => node.position,
                    _ => unreachable!(),
                };
                self.filtered_evidence(id, doc, move |start, _len| start == position)
            }
            NodeKind::End(_) => {
                let distance = match &self.node(id).kind {
                    NodeKind::End(node) => node.distance,
                    _ => unreachable!(),
                };
                self.filtered_evidence(id, doc, move |start, len| start + len - 1 == distance)
            }
            NodeKind::Word(_) => self.word_evidence(id, doc),
        }
    }

    fn token_evidence(&mut self, id: NodeId, doc: DocumentId) -> Result<Option<Evidence>> {
        if !self.reevaluate(id, doc)? {
            return Ok(None);
        }
        let leaf = match &self.node(id).kind {
            NodeKind::Token(leaf) => leaf,
            _ => unreachable!(),
        };
        let iterator = leaf.iterator.as_ref().ok_or(InternalError::IteratorNotBound)?;
        let no_location = leaf.list.as_ref().map_or(true, |l| l.is_no_location());
        if no_location {
            let tf = iterator.term_frequency().max(1);
            Ok(Some(Evidence::Frequency(tf)))
        } else {
            Ok(Some(Evidence::Locations(iterator.locations(leaf.token_length))))
        }
    }

    fn regex_evidence(&mut self, id: NodeId, doc: DocumentId) -> Result<Option<Evidence>> {
        if self.regex_lower_bound(id, doc)? != Some(doc) {
            return Ok(None);
        }
        let leaf = match &self.node(id).kind {
            NodeKind::Regex(leaf) => leaf,
            _ => unreachable!(),
        };
        let cursor = leaf.cursor.as_ref().ok_or(InternalError::IteratorNotBound)?;
        let regex = leaf.regex.as_ref().ok_or(InternalError::IteratorNotBound)?;
        let body = cursor.body();
        let mut spans = Vec::new();
        for found in regex.find_iter(body) {
            let start = body[..found.start()].chars().count() as Position + 1;
            let length = found.as_str().chars().count() as Position;
            spans.push((start, length.max(1)));
        }
        Ok(Some(Evidence::Locations(Box::new(SpanLocationIterator::new(spans)))))
    }

    fn or_evidence(&mut self, id: NodeId, doc: DocumentId) -> Result<Option<Evidence>> {
        let mut locations: Vec<Box<dyn LocationIterator>> = Vec::new();
        let mut frequency: TermFrequency = 0;
        let mut matched = false;
        for child in self.children_of(id) {
            match self.reevaluate_evidence(child, doc)? {
                None => (),
                Some(Evidence::Locations(iterator)) => {
                    matched = true;
                    locations.push(iterator);
                }
                Some(Evidence::Frequency(tf)) => {
                    matched = true;
                    frequency = frequency.max(tf);
                }
            }
        }
        if !matched {
            Ok(None)
        } else if !locations.is_empty() {
            Ok(Some(Evidence::Locations(Box::new(OrLocationIterator::new(locations)))))
        } else {
            Ok(Some(Evidence::Frequency(frequency.max(1))))
        }
    }

    fn ordered_distance_evidence(
        &mut self,
        id: NodeId,
        doc: DocumentId,
    ) -> Result<Option<Evidence>> {
        let children = self.children_of(id);
        let positions = match &self.node(id).kind {
            NodeKind::OrderedDistance(node) => node.path_positions.clone(),
            _ => unreachable!(),
        };
        let mut iterator = match &mut self.node_mut(id).kind {
            NodeKind::OrderedDistance(node) => node.pool.acquire_ordered(),
            _ => unreachable!(),
        };

        let mut min_tf = TermFrequency::MAX;
        let mut frequencies = 0usize;
        for (child, position) in children.iter().zip(positions) {
            match self.reevaluate_evidence(*child, doc)? {
                None => {
                    self.release_ordered(id, iterator);
                    return Ok(None);
                }
                Some(Evidence::Locations(locations)) => iterator.push(position, locations),
                Some(Evidence::Frequency(tf)) => {
                    frequencies += 1;
                    min_tf = min_tf.min(tf.max(1));
                }
            }
        }

        if iterator.len() == children.len() {
            iterator.initialize();
            if iterator.is_end() {
                self.release_ordered(id, iterator);
                Ok(None)
            } else {
                Ok(Some(Evidence::Locations(Box::new(iterator))))
            }
        } else if !children.is_empty() && frequencies == children.len() {
            // no member brought positions at all; the smallest TF bounds
            // the phrase frequency from above
            self.release_ordered(id, iterator);
            Ok(Some(Evidence::Frequency(min_tf)))
        } else {
            self.release_ordered(id, iterator);
            Ok(None)
        }
    }

    fn release_ordered(
        &mut self,
        id: NodeId,
        iterator: crate::location::OrderedDistanceLocationIterator,
    ) {
        if let NodeKind::OrderedDistance(node) = &mut self.node_mut(id).kind {
            node.pool.release_ordered(iterator);
        }
    }

    fn window_evidence(&mut self, id: NodeId, doc: DocumentId) -> Result<Option<Evidence>> {
        let children = self.children_of(id);
        let (min, max, ordered, simple) = match &self.node(id).kind {
            NodeKind::Window(node) => (node.min, node.max, node.ordered, node.simple),
            _ => unreachable!(),
        };

        let mut locations: Vec<Box<dyn LocationIterator>> = Vec::new();
        let mut min_tf = TermFrequency::MAX;
        let mut frequencies = 0usize;
        for child in &children {
            match self.reevaluate_evidence(*child, doc)? {
                None => return Ok(None),
                Some(Evidence::Locations(iterator)) => locations.push(iterator),
                Some(Evidence::Frequency(tf)) => {
                    frequencies += 1;
                    min_tf = min_tf.min(tf.max(1));
                }
            }
        }
        if frequencies == children.len() && !children.is_empty() {
            return Ok(Some(Evidence::Frequency(min_tf)));
        }
        if locations.len() != children.len() {
            return Ok(None);
        }

        let mut iterator = match &mut self.node_mut(id).kind {
            NodeKind::Window(node) => node.pool.acquire_window(),
            _ => unreachable!(),
        };
        iterator.build(min, max, ordered, simple, locations);
        if iterator.is_end() {
            if let NodeKind::Window(node) = &mut self.node_mut(id).kind {
                node.pool.release_window(iterator);
            }
            Ok(None)
        } else {
            Ok(Some(Evidence::Locations(Box::new(iterator))))
        }
    }

    fn filtered_evidence(
        &mut self,
        id: NodeId,
        doc: DocumentId,
        keep: impl Fn(Position, Position) -> bool,
    ) -> Result<Option<Evidence>> {
        let child = self.node(id).common.children[0];
        match self.reevaluate_evidence(child, doc)? {
            None => Ok(None),
            Some(Evidence::Frequency(tf)) => {
                // cannot verify the position constraint, accept with the
                // child's frequency as an upper bound
                Ok(Some(Evidence::Frequency(tf)))
            }
            Some(Evidence::Locations(mut iterator)) => {
                let mut spans = Vec::new();
                while !iterator.is_end() {
                    let (start, length) = (iterator.location(), iterator.length());
                    if keep(start, length) {
                        spans.push((start, length));
                    }
                    iterator.next();
                }
                if spans.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(Evidence::Locations(Box::new(SpanLocationIterator::new(spans)))))
                }
            }
        }
    }

    fn word_evidence(&mut self, id: NodeId, doc: DocumentId) -> Result<Option<Evidence>> {
        let child = self.node(id).common.children[0];
        let (mode, boundary) = match &self.node(id).kind {
            NodeKind::Word(node) => (node.match_mode, node.boundary),
            _ => unreachable!(),
        };
        let evidence = match self.reevaluate_evidence(child, doc)? {
            None => return Ok(None),
            Some(evidence) => evidence,
        };
        let boundaries = match boundary {
            Some(boundary) => self.boundary_positions(boundary, doc)?,
            None => None,
        };
        let (iterator, boundaries) = match (evidence, boundaries) {
            (evidence, None) => return Ok(Some(evidence)),
            (Evidence::Frequency(tf), _) => return Ok(Some(Evidence::Frequency(tf))),
            (Evidence::Locations(iterator), Some(boundaries)) => (iterator, boundaries),
        };

        let mut iterator = iterator;
        let mut spans = Vec::new();
        while !iterator.is_end() {
            let (start, length) = (iterator.location(), iterator.length());
            let head = boundaries.binary_search(&start).is_ok();
            let tail = boundaries.binary_search(&(start + length)).is_ok();
            let keep = match mode {
                crate::query::TermMatchMode::ExactWord => head && tail,
                crate::query::TermMatchMode::WordHead => head,
                crate::query::TermMatchMode::WordTail => tail,
                _ => true,
            };
            if keep {
                spans.push((start, length));
            }
            iterator.next();
        }
        if spans.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Evidence::Locations(Box::new(SpanLocationIterator::new(spans)))))
        }
    }

    /// The word-boundary positions of one document, None when the sentinel
    /// posting does not cover it.
    fn boundary_positions(
        &mut self,
        boundary: NodeId,
        doc: DocumentId,
    ) -> Result<Option<Vec<Position>>> {
        match self.reevaluate_evidence(boundary, doc)? {
            Some(Evidence::Locations(mut iterator)) => {
                let mut positions = Vec::new();
                while !iterator.is_end() {
                    positions.push(iterator.location());
                    iterator.next();
                }
                Ok(Some(positions))
            }
            _ => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // term frequency
    // ------------------------------------------------------------------

    pub(crate) fn evidence_frequency(
        &self,
        evidence: Evidence,
        doc: DocumentId,
    ) -> TermFrequency {
        match evidence {
            Evidence::Frequency(tf) => tf,
            Evidence::Locations(iterator) => self.count_locations(iterator, doc),
        }
    }

    /// Count occurrences by iteration, stopping at the configured cap and
    /// extrapolating from the document length when the store knows it.
    fn count_locations(
        &self,
        mut iterator: Box<dyn LocationIterator>,
        doc: DocumentId,
    ) -> TermFrequency {
        let known = iterator.frequency();
        if known > 0 {
            return known;
        }
        let limit = self.tf_count_upper_limit;
        let mut count = 0;
        let mut last_position = 0;
        while !iterator.is_end() {
            count += 1;
            last_position = iterator.location();
            if count >= limit {
                let length = self
                    .length_store
                    .as_ref()
                    .and_then(|store| store.document_length(doc));
                let estimated = match length {
                    Some(length) if last_position > 0 => {
                        let scaled = (count as u64 * length as u64) / last_position as u64;
                        scaled.min(TermFrequency::MAX as u64) as TermFrequency
                    }
                    _ => count,
                };
                warn!(
                    "location count of document {} capped at {}, extrapolated to {}",
                    doc, limit, estimated
                );
                return estimated.max(count);
            }
            iterator.next();
        }
        count
    }

    pub(crate) fn term_frequency(&mut self, id: NodeId, doc: DocumentId) -> Result<TermFrequency> {
        match &self.node(id).kind {
            NodeKind::Empty => Ok(0),
            NodeKind::Token(_) => {
                if !self.token_evaluate(id, doc)? {
                    return Ok(0);
                }
                let leaf = match &self.node(id).kind {
                    NodeKind::Token(leaf) => leaf,
                    _ => unreachable!(),
                };
                let iterator =
                    leaf.iterator.as_ref().ok_or(InternalError::IteratorNotBound)?;
                Ok(iterator.term_frequency())
            }
            NodeKind::BooleanResult(leaf) => {
                Ok(if leaf.docs.binary_search(&doc).is_ok() { 1 } else { 0 })
            }
            NodeKind::RankingResult(leaf) => {
                Ok(if leaf.docs.binary_search_by_key(&doc, |&(d, _)| d).is_ok() {
                    1
                } else {
                    0
                })
            }
            NodeKind::Term(_) => Err(InternalError::DanglingTermLeaf.into()),
            NodeKind::And => {
                let mut tf = TermFrequency::MAX;
                for child in self.children_of(id) {
                    let child_tf = self.term_frequency(child, doc)?;
                    if child_tf == 0 {
                        return Ok(0);
                    }
                    tf = tf.min(child_tf);
                }
                Ok(tf)
            }
            NodeKind::Or(_) | NodeKind::AtomicOr(_) => {
                // short-word and synonym expansions add their members up
                let mut tf = 0;
                for child in self.children_of(id) {
                    tf += self.term_frequency(child, doc)?;
                }
                Ok(tf)
            }
            NodeKind::AndNot(_) => {
                if !self.evaluate_node(id, doc, EvaluateMode::PRECISE)? {
                    return Ok(0);
                }
                let first = self.node(id).common.children[0];
                self.term_frequency(first, doc)
            }
            NodeKind::Scale(_) => {
                let child = self.node(id).common.children[0];
                self.term_frequency(child, doc)
            }
            NodeKind::Word(_) => {
                let mode = match &self.node(id).kind {
                    NodeKind::Word(node) => node.match_mode,
                    _ => unreachable!(),
                };
                if mode == crate::query::TermMatchMode::Approximate {
                    self.approximate_word_frequency(id, doc)
                } else {
                    match self.reevaluate_evidence(id, doc)? {
                        None => Ok(0),
                        Some(evidence) => Ok(self.evidence_frequency(evidence, doc)),
                    }
                }
            }
            _ => match self.reevaluate_evidence(id, doc)? {
                None => Ok(0),
                Some(evidence) => Ok(self.evidence_frequency(evidence, doc)),
            },
        }
    }

    /// Approximate word matching weighs each occurrence by how well it
    /// aligns with word boundaries: both ends 10, one end 5, none 1. The
    /// TF stays an integer.
    fn approximate_word_frequency(&mut self, id: NodeId, doc: DocumentId) -> Result<TermFrequency> {
        let child = self.node(id).common.children[0];
        let boundary = match &self.node(id).kind {
            NodeKind::Word(node) => node.boundary,
            _ => unreachable!(),
        };
        let evidence = match self.reevaluate_evidence(child, doc)? {
            None => return Ok(0),
            Some(evidence) => evidence,
        };
        let mut iterator = match evidence {
            Evidence::Frequency(tf) => return Ok(tf),
            Evidence::Locations(iterator) => iterator,
        };
        let boundaries = match boundary {
            Some(boundary) => self.boundary_positions(boundary, doc)?,
            None => None,
        };
        let mut weighted: TermFrequency = 0;
        while !iterator.is_end() {
            let (start, length) = (iterator.location(), iterator.length());
            let (head, tail) = match &boundaries {
                Some(bounds) => (
                    bounds.binary_search(&start).is_ok(),
                    bounds.binary_search(&(start + length)).is_ok(),
                ),
                None => (false, false),
            };
            weighted += match (head, tail) {
                (true, true) => 10,
                (true, false) | (false, true) => 5,
                (false, false) => 1,
            };
            iterator.next();
        }
        Ok(weighted)
    }

    // ------------------------------------------------------------------
    // bulk retrieval
    // ------------------------------------------------------------------

    pub(crate) fn retrieve_into(
        &mut self,
        id: NodeId,
        mode: EvaluateMode,
        out: &mut RoaringBitmap,
    ) -> Result<()> {
        let result = self.retrieve_node(id, mode)?;
        *out |= result;
        Ok(())
    }

    fn retrieve_node(&mut self, id: NodeId, mode: EvaluateMode) -> Result<RoaringBitmap> {
        let mut result = RoaringBitmap::new();
        match &self.node(id).kind {
            NodeKind::Empty => (),
            NodeKind::Token(_) => {
                self.token_retrieve(id, &mut result)?;
            }
            NodeKind::BooleanResult(leaf) => {
                for &doc in &leaf.docs {
                    result.insert(doc);
                }
            }
            NodeKind::RankingResult(leaf) => {
                for &(doc, _) in &leaf.docs {
                    result.insert(doc);
                }
            }
            NodeKind::Term(_) => return Err(InternalError::DanglingTermLeaf.into()),
            NodeKind::Or(_) | NodeKind::AtomicOr(_) => {
                // term-at-a-time union over the children
                for child in self.children_of(id) {
                    self.retrieve_into(child, mode, &mut result)?;
                }
            }
            NodeKind::And if mode.and_term_at_a_time => {
                self.and_retrieve_term_at_a_time(id, mode, &mut result)?;
            }
            _ => {
                // document-at-a-time walk over the node itself
                let mut current: DocumentId = 1;
                while let Some(doc) = self.lower_bound_node(id, current, mode)? {
                    result.insert(doc);
                    current = match doc.checked_add(1) {
                        Some(next) => next,
                        None => break,
                    };
                }
            }
        }
        let common = &mut self.node_mut(id).common;
        common.estimated_df = Some(result.len());
        common.retrieved = true;
        Ok(result)
    }

    /// Retrieve the cheapest child fully, filter the buffer with the other
    /// children's rough checks, then confirm survivors precisely.
    fn and_retrieve_term_at_a_time(
        &mut self,
        id: NodeId,
        mode: EvaluateMode,
        out: &mut RoaringBitmap,
    ) -> Result<()> {
        let children = self.children_of(id);
        let mut buffer = RoaringBitmap::new();
        self.retrieve_into(children[0], mode, &mut buffer)?;
        for &child in &children[1..] {
            let mut filtered = RoaringBitmap::new();
            for doc in buffer.iter() {
                if self.evaluate_node(child, doc, mode.rough())? {
                    filtered.insert(doc);
                }
            }
            buffer = filtered;
        }
        for doc in buffer.iter() {
            if self.reevaluate(id, doc)? {
                out.insert(doc);
            }
        }
        // leave the rough node unprimed, the children's cursors moved
        if let Some(rough) = self.rough_of(id) {
            self.node_mut(rough).common.reset_memo();
        }
        Ok(())
    }

    fn token_retrieve(&mut self, id: NodeId, out: &mut RoaringBitmap) -> Result<()> {
        let (common, leaf) = token_parts(self.node_mut(id))?;
        let iterator = leaf.iterator.as_mut().ok_or(InternalError::IteratorNotBound)?;
        if common.upper != 0 {
            iterator.reset();
            common.upper = 0;
            common.lower = 1;
        }
        while !iterator.is_end() {
            out.insert(iterator.document_id());
            iterator.next();
        }
        common.upper = UPPER_BOUND_DOC_ID;
        common.lower = UPPER_BOUND_DOC_ID;
        Ok(())
    }

    // ------------------------------------------------------------------
    // estimates
    // ------------------------------------------------------------------

    pub(crate) fn estimate_document_frequency(&mut self, id: NodeId) -> u64 {
        if self.node(id).common.retrieved {
            // a full retrieve already replaced the estimate with the
            // exact count
            return self.node(id).common.estimated_df.unwrap_or(0);
        }
        if let Some(estimated) = self.node(id).common.estimated_df {
            return estimated;
        }
        let estimated = match &self.node(id).kind {
            NodeKind::Empty => 0,
            NodeKind::Token(leaf) => {
                leaf.list.as_ref().map_or(0, |list| list.document_frequency())
            }
            NodeKind::Regex(_) => self.total_document_frequency,
            NodeKind::BooleanResult(leaf) => leaf.docs.len() as u64,
            NodeKind::RankingResult(leaf) => leaf.docs.len() as u64,
            NodeKind::Term(_) => 0,
            NodeKind::Or(_) | NodeKind::AtomicOr(_) => {
                let mut total = 0u64;
                for child in self.children_of(id) {
                    total = total.saturating_add(self.estimate_document_frequency(child));
                }
                total.min(self.total_document_frequency)
            }
            NodeKind::AndNot(_) => {
                let first = self.node(id).common.children[0];
                self.estimate_document_frequency(first)
            }
            NodeKind::Scale(_) | NodeKind::Location(_) | NodeKind::End(_) | NodeKind::Word(_) => {
                let child = self.node(id).common.children[0];
                self.estimate_document_frequency(child)
            }
            _ => {
                // conjunctions cannot match more than their rarest member
                let mut smallest = u64::MAX;
                for child in self.children_of(id) {
                    smallest = smallest.min(self.estimate_document_frequency(child));
                }
                if smallest == u64::MAX {
                    0
                } else {
                    smallest
                }
            }
        };
        self.node_mut(id).common.estimated_df = Some(estimated);
        estimated
    }

    pub(crate) fn sort_factor(&mut self, id: NodeId) -> u64 {
        if let Some(factor) = self.node(id).common.sort_factor {
            return factor;
        }
        let factor = match &self.node(id).kind {
            NodeKind::Empty => 0,
            NodeKind::Token(leaf) => {
                leaf.list.as_ref().map_or(0, |list| list.document_frequency())
            }
            NodeKind::Regex(_) => MAX_SORT_FACTOR,
            NodeKind::BooleanResult(leaf) => leaf.docs.len() as u64,
            NodeKind::RankingResult(leaf) => leaf.docs.len() as u64,
            NodeKind::Term(_) => 0,
            NodeKind::OrderedDistance(_) => {
                let summed = self.sum_child_sort_factors(id);
                if summed == MAX_SORT_FACTOR {
                    summed
                } else {
                    // position joins cost a little more than the raw scan
                    (summed as f64 * 1.1) as u64
                }
            }
            _ => self.sum_child_sort_factors(id),
        };
        self.node_mut(id).common.sort_factor = Some(factor);
        factor
    }

    fn sum_child_sort_factors(&mut self, id: NodeId) -> u64 {
        let mut total = 0u64;
        for child in self.children_of(id) {
            let factor = self.sort_factor(child);
            if factor == MAX_SORT_FACTOR {
                return MAX_SORT_FACTOR;
            }
            total = total.saturating_add(factor);
        }
        total
    }
}
