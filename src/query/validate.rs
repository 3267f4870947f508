use log::debug;

use crate::index::InvertedIndex;
use crate::location::LocationIteratorPool;
use crate::query::canonical::DescriptionOptions;
use crate::query::node::{
    AtomicOrNode, NodeId, NodeKind, OrNode, OrderedDistanceNode, OriginalTerm, QueryNode,
    TokenLeaf, WordNode, MAX_SORT_FACTOR,
};
use crate::query::{Query, TermMatchMode, ValidateMode};
use crate::score::{
    OkapiTfScoreCalculator, ProdScoreCombiner, ScoreCalculator, SumScoreCombiner,
};
use crate::{InternalError, Position, Result, UserError};

enum ShareOutcome {
    Leaf,
    Count(usize),
    Replace(NodeId),
}

impl Query {
    /// Bind the tree to an inverted file and optimise it. Runs once
    /// between construction and retrieval; afterwards no term leaf
    /// remains, children are sorted cheapest-first, shared
    /// sub-expressions are merged and rough pointers are in place.
    pub fn validate(
        &mut self,
        index: &dyn InvertedIndex,
        mode: ValidateMode,
        average_document_length: u32,
    ) -> Result<()> {
        let mut root = match self.root {
            Some(root) => root,
            None => {
                return Err(UserError::QueryValidate("the query has no root node".into()).into())
            }
        };
        self.ranking = mode.ranking;

        if mode.ranking {
            if self.default_and_combiner.is_none() {
                self.default_and_combiner = Some(Box::new(ProdScoreCombiner));
            }
            if self.default_and_not_combiner.is_none() {
                self.default_and_not_combiner = Some(Box::new(ProdScoreCombiner));
            }
            if self.default_or_combiner.is_none() {
                self.default_or_combiner = Some(Box::new(SumScoreCombiner));
            }
            if self.default_calculator.is_none() {
                self.default_calculator = Some(Box::new(OkapiTfScoreCalculator::default()));
            }
        } else if average_document_length != 0 {
            return Err(UserError::AverageLengthInBooleanQuery.into());
        }

        self.total_document_frequency = index.document_frequency();
        self.average_document_length = average_document_length;

        root = self.bind_tree(root, index)?;

        if mode.to_simple_window {
            root = self.to_simple_window(root, index)?;
        }

        root = self.erase_terms(root, index)?;
        self.root = Some(root);
        debug!("after term erasure: {}", self.canonical_key(root));

        if mode.ranking {
            self.prepare_scorers(root)?;
        }

        if mode.flatten {
            self.flatten_children(root, false);
        }
        if mode.or_standard && self.sort_factor(root) != MAX_SORT_FACTOR {
            root = self.convert_or_standard(root)?;
            if mode.flatten {
                self.flatten_children(root, false);
            }
            self.root = Some(root);
            debug!("after or-normal form: {}", self.canonical_key(root));
        }
        if mode.sort_children {
            self.sort_children_rec(root);
        }
        if mode.shared_node {
            root = self.share_nodes(root)?;
            self.root = Some(root);
            debug!("after shared nodes: {}", self.canonical_key(root));
        }
        if mode.make_rough {
            let mut top = Vec::new();
            self.make_rough(root, &mut top)?;
        }
        if mode.shared_node {
            self.share_rough(root);
        }

        self.root = Some(root);
        self.check_tree(root, true, false)?;
        self.validated = true;
        Ok(())
    }

    pub(crate) fn make_empty(&mut self) -> NodeId {
        self.push_node(QueryNode::new(NodeKind::Empty))
    }

    fn is_empty_node(&self, id: NodeId) -> bool {
        matches!(self.node(id).kind, NodeKind::Empty)
    }

    // ------------------------------------------------------------------
    // binding
    // ------------------------------------------------------------------

    fn bind_tree(&mut self, id: NodeId, index: &dyn InvertedIndex) -> Result<NodeId> {
        match &self.node(id).kind {
            NodeKind::Token(_) => self.bind_token(id, index),
            NodeKind::Regex(_) => {
                self.bind_regex(id, index)?;
                Ok(id)
            }
            _ => {
                if self.node(id).kind.is_internal() {
                    let children = self.children_of(id);
                    let mut rebound = Vec::with_capacity(children.len());
                    for child in children {
                        rebound.push(self.bind_tree(child, index)?);
                    }
                    self.node_mut(id).common.children = rebound;
                }
                Ok(id)
            }
        }
    }

    fn token_key(&self, token: &str, calculator: Option<&dyn ScoreCalculator>) -> String {
        let description = match calculator {
            Some(calculator) if self.ranking => calculator.description(true),
            _ => String::new(),
        };
        format!("{}\u{1}{}", token, description)
    }

    fn bind_token(&mut self, id: NodeId, index: &dyn InvertedIndex) -> Result<NodeId> {
        let token = match &self.node(id).kind {
            NodeKind::Token(leaf) => leaf.token.clone(),
            _ => unreachable!(),
        };
        if self.ranking && self.node(id).common.calculator.is_none() {
            let default = self.default_calculator.as_ref().map(|c| c.boxed_clone());
            self.node_mut(id).common.calculator = default;
        }
        let key = {
            let calculator = self.node(id).common.calculator.as_deref();
            self.token_key(&token, calculator)
        };
        if let Some(&shared) = self.token_map.get(&key) {
            return Ok(shared);
        }
        match index.inverted_list(&token)? {
            None => Ok(self.make_empty()),
            Some(list) => {
                let iterator = list.begin();
                if let NodeKind::Token(leaf) = &mut self.node_mut(id).kind {
                    leaf.list = Some(list);
                    leaf.iterator = Some(iterator);
                }
                self.token_map.insert(key, id);
                Ok(id)
            }
        }
    }

    fn bind_regex(&mut self, id: NodeId, index: &dyn InvertedIndex) -> Result<()> {
        let pattern = match &self.node(id).kind {
            NodeKind::Regex(leaf) => leaf.pattern.clone(),
            _ => unreachable!(),
        };
        let compiled = regex::Regex::new(&pattern).map_err(UserError::InvalidRegex)?;
        let cursor = index.document_cursor()?;
        if let NodeKind::Regex(leaf) = &mut self.node_mut(id).kind {
            leaf.regex = Some(compiled);
            leaf.cursor = Some(cursor);
        }
        if self.ranking && self.node(id).common.calculator.is_none() {
            let default = self.default_calculator.as_ref().map(|c| c.boxed_clone());
            self.node_mut(id).common.calculator = default;
        }
        Ok(())
    }

    /// Look up or create the shared leaf of one index term. `None` when
    /// the term occurs nowhere.
    fn shared_token(
        &mut self,
        token: &str,
        index: &dyn InvertedIndex,
        template: Option<&dyn ScoreCalculator>,
    ) -> Result<Option<NodeId>> {
        let calculator = if self.ranking {
            match template {
                Some(template) => Some(template.boxed_clone()),
                None => self.default_calculator.as_ref().map(|c| c.boxed_clone()),
            }
        } else {
            None
        };
        let key = self.token_key(token, calculator.as_deref());
        if let Some(&shared) = self.token_map.get(&key) {
            return Ok(Some(shared));
        }
        let list = match index.inverted_list(token)? {
            None => return Ok(None),
            Some(list) => list,
        };
        let iterator = list.begin();
        let mut node = QueryNode::new(NodeKind::Token(TokenLeaf {
            token: token.to_string(),
            token_length: token.chars().count() as Position,
            list: Some(list),
            iterator: Some(iterator),
        }));
        node.common.calculator = calculator;
        let id = self.push_node(node);
        self.token_map.insert(key, id);
        Ok(Some(id))
    }

    // ------------------------------------------------------------------
    // operator window -> simple window
    // ------------------------------------------------------------------

    fn to_simple_window(&mut self, id: NodeId, index: &dyn InvertedIndex) -> Result<NodeId> {
        let is_operator_window =
            matches!(&self.node(id).kind, NodeKind::Window(window) if !window.simple);
        if is_operator_window {
            let children = self.children_of(id);
            if children.len() == 1 {
                // a single-member window is no constraint at all
                return self.to_simple_window(children[0], index);
            }
            let ordered = match &self.node(id).kind {
                NodeKind::Window(window) => window.ordered,
                _ => unreachable!(),
            };
            let mut convertible = true;
            let mut term_length: Option<Position> = None;
            for &child in &children {
                match &self.node(child).kind {
                    NodeKind::Term(leaf) => {
                        if index.split_term(&leaf.term).is_empty() {
                            // short words have no fixed indexed length
                            convertible = false;
                            break;
                        }
                        let length = leaf.term.chars().count() as Position;
                        match term_length {
                            None => term_length = Some(length),
                            Some(first) if !ordered && first != length => {
                                convertible = false;
                                break;
                            }
                            Some(_) => (),
                        }
                    }
                    _ => {
                        convertible = false;
                        break;
                    }
                }
            }
            if let (true, Some(length)) = (convertible, term_length) {
                if let NodeKind::Window(window) = &mut self.node_mut(id).kind {
                    window.simple = true;
                    window.min = window.min.saturating_add(length - 1);
                    window.max = window.max.saturating_add(length - 1);
                }
                return Ok(id);
            }
            for &child in &children {
                self.to_simple_window(child, index)?;
            }
            return Ok(id);
        }
        if self.node(id).kind.is_internal() {
            let children = self.children_of(id);
            let mut rebuilt = Vec::with_capacity(children.len());
            for child in children {
                rebuilt.push(self.to_simple_window(child, index)?);
            }
            self.node_mut(id).common.children = rebuilt;
        }
        Ok(id)
    }

    // ------------------------------------------------------------------
    // term erasure
    // ------------------------------------------------------------------

    fn erase_terms(&mut self, id: NodeId, index: &dyn InvertedIndex) -> Result<NodeId> {
        match &self.node(id).kind {
            NodeKind::Term(_) => return self.rewrite_term(id, index),
            NodeKind::BooleanResult(leaf) if leaf.docs.is_empty() => {
                return Ok(self.make_empty())
            }
            NodeKind::RankingResult(leaf) if leaf.docs.is_empty() => {
                return Ok(self.make_empty())
            }
            _ => (),
        }
        if !self.node(id).kind.is_internal() {
            return Ok(id);
        }
        let children = self.children_of(id);
        let mut rebuilt = Vec::with_capacity(children.len());
        for child in children {
            rebuilt.push(self.erase_terms(child, index)?);
        }
        match &self.node(id).kind {
            NodeKind::Or(_) | NodeKind::AtomicOr(_) => {
                rebuilt.retain(|&child| !self.is_empty_node(child));
                if rebuilt.is_empty() {
                    return Ok(self.make_empty());
                }
                self.node_mut(id).common.children = rebuilt;
                Ok(id)
            }
            NodeKind::AndNot(_) => {
                if self.is_empty_node(rebuilt[0]) {
                    return Ok(self.make_empty());
                }
                if self.is_empty_node(rebuilt[1]) {
                    return Ok(rebuilt[0]);
                }
                self.node_mut(id).common.children = rebuilt;
                Ok(id)
            }
            _ => {
                if rebuilt.iter().any(|&child| self.is_empty_node(child)) {
                    return Ok(self.make_empty());
                }
                self.node_mut(id).common.children = rebuilt;
                Ok(id)
            }
        }
    }

    /// Replace one term leaf with its precise sub-tree (token, phrase or
    /// short-word expansion) and attach the rough sub-tree.
    fn rewrite_term(&mut self, id: NodeId, index: &dyn InvertedIndex) -> Result<NodeId> {
        let (term, match_mode, language) = match &self.node(id).kind {
            NodeKind::Term(leaf) => {
                (leaf.term.clone(), leaf.match_mode, leaf.language.clone())
            }
            _ => unreachable!(),
        };
        let template = match self.node_mut(id).common.calculator.take() {
            Some(calculator) => Some(calculator),
            None if self.ranking => {
                self.default_calculator.as_ref().map(|c| c.boxed_clone())
            }
            None => None,
        };
        let original = OriginalTerm { term: term.clone(), language, match_mode };

        let tokens = index.split_term(&term);
        if tokens.is_empty() {
            return self.rewrite_short_term(&term, index, template, original);
        }

        let precise = if tokens.len() == 1 {
            // a single-member phrase is the token itself, scored with the
            // term's own calculator
            match self.shared_token(&tokens[0].1, index, template.as_deref())? {
                None => return Ok(self.make_empty()),
                Some(token_id) => token_id,
            }
        } else {
            let mut token_ids = Vec::with_capacity(tokens.len());
            let mut positions = Vec::with_capacity(tokens.len());
            for (position, token) in &tokens {
                // phrase members share the plain per-token calculator
                match self.shared_token(token, index, None)? {
                    None => return Ok(self.make_empty()),
                    Some(token_id) => {
                        token_ids.push(token_id);
                        positions.push(*position);
                    }
                }
            }
            let mut node = QueryNode::new(NodeKind::OrderedDistance(OrderedDistanceNode {
                path_positions: positions.clone(),
                pool: LocationIteratorPool::new(),
            }));
            node.common.children = token_ids.clone();
            node.common.calculator = template.as_ref().map(|c| c.boxed_clone());
            let distance = self.push_node(node);

            // the trailing member bounds the phrase
            let trailing_at = positions
                .iter()
                .enumerate()
                .max_by_key(|(_, &p)| p)
                .map(|(i, _)| i)
                .unwrap_or(0);
            self.node_mut(distance).common.end_node = Some(token_ids[trailing_at]);

            // rough view: the conjunction of the distinct members
            let mut distinct: Vec<NodeId> = Vec::new();
            for &token_id in &token_ids {
                if !distinct.contains(&token_id) {
                    distinct.push(token_id);
                }
            }
            let rough = if distinct.len() >= 2 {
                distinct.sort_by_key(|&token_id| self.sort_factor(token_id));
                let mut rough = QueryNode::new(NodeKind::And);
                rough.common.children = distinct;
                let rough = self.push_node(rough);
                self.node_mut(rough).common.rough = Some(rough);
                rough
            } else {
                distinct[0]
            };
            self.node_mut(distance).common.rough = Some(rough);
            distance
        };

        let result = match match_mode {
            TermMatchMode::Simple | TermMatchMode::Normalized | TermMatchMode::MultiLanguage => {
                precise
            }
            _ => match self.shared_token("", index, None)? {
                // without a boundary sentinel posting, word modes fall
                // back to plain string matching
                None => precise,
                Some(boundary) => {
                    let mut node = QueryNode::new(NodeKind::Word(WordNode {
                        match_mode,
                        boundary: Some(boundary),
                    }));
                    node.common.children = vec![precise];
                    node.common.calculator = template.as_ref().map(|c| c.boxed_clone());
                    let word = self.push_node(node);
                    let rough = self.node(precise).common.rough;
                    self.node_mut(word).common.rough = rough;
                    word
                }
            },
        };
        self.node_mut(result).common.original_term = Some(original);
        Ok(result)
    }

    /// A term shorter than an index term expands to every token carrying
    /// it as a prefix: a marked Or in boolean mode, an atomic Or (scored
    /// as one unit) in ranking mode.
    fn rewrite_short_term(
        &mut self,
        term: &str,
        index: &dyn InvertedIndex,
        template: Option<Box<dyn ScoreCalculator>>,
        original: OriginalTerm,
    ) -> Result<NodeId> {
        let expansions = index.expand_short_term(term)?;
        let mut children = Vec::with_capacity(expansions.len());
        for token in &expansions {
            if let Some(token_id) = self.shared_token(token, index, None)? {
                children.push(token_id);
            }
        }
        if children.is_empty() {
            return Ok(self.make_empty());
        }
        self.short_word = true;
        let length = term.chars().count() as Position;
        let mut node = if self.ranking {
            let mut node = QueryNode::new(NodeKind::AtomicOr(AtomicOrNode {
                synonym_id: 0,
                short_word_length: length,
            }));
            node.common.calculator = template;
            node
        } else {
            QueryNode::new(NodeKind::Or(OrNode { short_word_length: length }))
        };
        node.common.children = children;
        node.common.original_term = Some(original);
        Ok(self.push_node(node))
    }

    // ------------------------------------------------------------------
    // scorer preparation
    // ------------------------------------------------------------------

    fn prepare_scorers(&mut self, id: NodeId) -> Result<()> {
        for child in self.children_of(id) {
            self.prepare_scorers(child)?;
        }
        if let NodeKind::Word(word) = &self.node(id).kind {
            if let Some(boundary) = word.boundary {
                self.prepare_scorers(boundary)?;
            }
        }

        if self.node(id).common.combiner.is_none() {
            let default = match &self.node(id).kind {
                NodeKind::And => self.default_and_combiner.as_ref(),
                NodeKind::Or(_) => self.default_or_combiner.as_ref(),
                NodeKind::AndNot(_) => self.default_and_not_combiner.as_ref(),
                _ => None,
            };
            let default = default.map(|c| c.boxed_clone());
            if default.is_some() {
                self.node_mut(id).common.combiner = default;
            }
        }
        if self.node(id).kind.is_atomic_scored() && self.node(id).common.calculator.is_none() {
            let default = self.default_calculator.as_ref().map(|c| c.boxed_clone());
            self.node_mut(id).common.calculator = default;
        }
        if matches!(self.node(id).kind, NodeKind::AndNot(_)) {
            let default = self.default_negator.as_ref().map(|n| n.boxed_clone());
            if let (Some(default), NodeKind::AndNot(and_not)) =
                (default, &mut self.node_mut(id).kind)
            {
                if and_not.negator.is_none() {
                    and_not.negator = Some(default);
                }
            }
        }

        if self.node(id).common.calculator.is_some() {
            let document_frequency = self.estimate_document_frequency(id);
            let total = self.total_document_frequency;
            let average = self.average_document_length;
            let store = self.length_store.clone();
            let calculator = self.node_mut(id).common.calculator.as_mut().unwrap();
            if let Some(store) = store {
                calculator.set_document_length_store(store);
            }
            if average != 0 {
                calculator.set_average_document_length(average);
            }
            calculator.prepare(total, document_frequency);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // flattening
    // ------------------------------------------------------------------

    fn combiners_allow_merge(&self, parent: NodeId, child: NodeId) -> bool {
        match (&self.node(parent).common.combiner, &self.node(child).common.combiner) {
            (None, None) => true,
            (Some(p), Some(c)) => {
                p.name() == c.name() && p.is_associative() && p.is_commutative()
            }
            _ => false,
        }
    }

    fn flatten_children(&mut self, id: NodeId, inside_positional: bool) {
        let children = self.children_of(id);
        let positional = matches!(
            self.node(id).kind,
            NodeKind::Window(_) | NodeKind::OrderedDistance(_) | NodeKind::Word(_)
        );
        for &child in &children {
            self.flatten_children(child, positional);
        }
        if inside_positional {
            return;
        }
        let target_and = matches!(self.node(id).kind, NodeKind::And);
        let target_or = matches!(self.node(id).kind, NodeKind::Or(_));
        if !target_and && !target_or {
            return;
        }
        let mut flattened = Vec::with_capacity(children.len());
        let mut changed = false;
        for &child in &children {
            let mergeable = match &self.node(child).kind {
                NodeKind::And if target_and => self.combiners_allow_merge(id, child),
                NodeKind::Or(or) if target_or => {
                    or.short_word_length == 0
                        && self.node(child).common.children.len() <= self.or_flatten_threshold
                        && self.combiners_allow_merge(id, child)
                }
                _ => false,
            };
            if mergeable {
                flattened.extend(self.children_of(child));
                changed = true;
            } else {
                flattened.push(child);
            }
        }
        if changed {
            self.node_mut(id).common.children = flattened;
        }
    }

    // ------------------------------------------------------------------
    // OR-normal form
    // ------------------------------------------------------------------

    /// Push conjunctions inside disjunctions so that every inner And can
    /// short-circuit on its own. Boolean queries always rewrite; ranking
    /// queries never do, and marked short-word ORs are left alone.
    fn convert_or_standard(&mut self, id: NodeId) -> Result<NodeId> {
        match &self.node(id).kind {
            NodeKind::And => (),
            NodeKind::OrderedDistance(_) | NodeKind::Word(_) => return Ok(id),
            _ => {
                if self.node(id).kind.is_internal() {
                    let children = self.children_of(id);
                    let mut rebuilt = Vec::with_capacity(children.len());
                    for child in children {
                        rebuilt.push(self.convert_or_standard(child)?);
                    }
                    self.node_mut(id).common.children = rebuilt;
                }
                return Ok(id);
            }
        }

        let children = self.children_of(id);
        let mut rebuilt = Vec::with_capacity(children.len());
        for child in children {
            rebuilt.push(self.convert_or_standard(child)?);
        }
        self.node_mut(id).common.children = rebuilt.clone();

        if self.ranking {
            // rewriting a scored Or redistributes its combiner; never done
            return Ok(id);
        }

        let convertible: Vec<usize> = rebuilt
            .iter()
            .enumerate()
            .filter(|(_, &child)| {
                matches!(&self.node(child).kind, NodeKind::Or(or) if or.short_word_length == 0)
            })
            .map(|(at, _)| at)
            .collect();
        if convertible.is_empty() {
            return Ok(id);
        }

        let mut product: u64 = 1;
        for &at in &convertible {
            let count = self.node(rebuilt[at]).common.children.len() as u64;
            product = product.saturating_mul(count);
        }
        if product > self.or_standard_threshold {
            debug!(
                "or-normal form abandoned, {} combinations exceed the threshold {}",
                product, self.or_standard_threshold
            );
            return Ok(id);
        }

        let or_at = convertible[0];
        let or_id = rebuilt[or_at];
        let rest: Vec<NodeId> = rebuilt
            .iter()
            .enumerate()
            .filter(|&(at, _)| at != or_at)
            .map(|(_, &child)| child)
            .collect();

        let mut new_or_children = Vec::new();
        for branch in self.children_of(or_id) {
            let mut and_node = QueryNode::new(NodeKind::And);
            and_node.common.children =
                rest.iter().copied().chain(std::iter::once(branch)).collect();
            new_or_children.push(self.push_node(and_node));
        }
        let mut or_node = QueryNode::new(NodeKind::Or(OrNode { short_word_length: 0 }));
        or_node.common.children = new_or_children;
        let new_or = self.push_node(or_node);

        // the remaining Or children sit inside the fresh Ands now
        self.convert_or_standard(new_or)
    }

    // ------------------------------------------------------------------
    // child ordering
    // ------------------------------------------------------------------

    fn sort_children_rec(&mut self, id: NodeId) {
        let children = self.children_of(id);
        for &child in &children {
            self.sort_children_rec(child);
        }
        let sortable = match &self.node(id).kind {
            NodeKind::And | NodeKind::Or(_) | NodeKind::AtomicOr(_) => true,
            NodeKind::Window(window) => !window.ordered,
            _ => false,
        };
        if !sortable || children.len() < 2 {
            return;
        }
        let mut keyed: Vec<(u64, NodeId)> =
            children.iter().map(|&child| (self.sort_factor(child), child)).collect();
        keyed.sort_by_key(|&(factor, _)| factor);
        self.node_mut(id).common.children = keyed.into_iter().map(|(_, child)| child).collect();
    }

    // ------------------------------------------------------------------
    // shared-node elimination
    // ------------------------------------------------------------------

    fn share_nodes(&mut self, root: NodeId) -> Result<NodeId> {
        let mut root = root;
        match self.share_children(root)? {
            ShareOutcome::Leaf => return Ok(root),
            ShareOutcome::Replace(replacement) => root = replacement,
            ShareOutcome::Count(0) => root = self.make_empty(),
            ShareOutcome::Count(1) => root = self.collapse_single(root),
            ShareOutcome::Count(_) => (),
        }
        if self.node(root).kind.is_internal() {
            let key = self.canonical_key(root);
            self.node_map.entry(key).or_insert(root);
        }
        Ok(root)
    }

    fn share_children(&mut self, id: NodeId) -> Result<ShareOutcome> {
        if !self.node(id).kind.is_internal() {
            return Ok(ShareOutcome::Leaf);
        }
        // dropping a duplicated operand is only sound when scores cannot
        // change: boolean conjunctions and disjunctions
        let allow_local_dedup = self.node(id).common.combiner.is_none()
            && matches!(self.node(id).kind, NodeKind::And | NodeKind::Or(_));
        let mut local: Vec<String> = Vec::new();

        let children = self.children_of(id);
        let mut rebuilt: Vec<NodeId> = Vec::with_capacity(children.len());
        for child in children {
            let mut child = child;
            match self.share_children(child)? {
                ShareOutcome::Leaf => (),
                ShareOutcome::Replace(replacement) => child = replacement,
                ShareOutcome::Count(0) => child = self.make_empty(),
                ShareOutcome::Count(1) => child = self.collapse_single(child),
                ShareOutcome::Count(_) => (),
            }
            if self.node(child).kind.is_internal() {
                let key = self.canonical_key(child);
                if allow_local_dedup {
                    if local.contains(&key) {
                        continue;
                    }
                    local.push(key.clone());
                }
                match self.node_map.get(&key) {
                    Some(&existing) if existing != child => {
                        // a phrase keeps its trailing-token and original
                        // term information when merged away
                        if let Some(end_node) = self.node(child).common.end_node {
                            self.node_mut(existing).common.end_node = Some(end_node);
                        }
                        if self.node(existing).common.original_term.is_none() {
                            let original = self.node(child).common.original_term.clone();
                            self.node_mut(existing).common.original_term = original;
                        }
                        child = existing;
                    }
                    Some(_) => (),
                    None => {
                        self.node_map.insert(key, child);
                    }
                }
            }
            rebuilt.push(child);
        }

        match &self.node(id).kind {
            NodeKind::Or(_) | NodeKind::AtomicOr(_) => {
                rebuilt.retain(|&child| !self.is_empty_node(child));
                let count = rebuilt.len();
                self.node_mut(id).common.children = rebuilt;
                Ok(ShareOutcome::Count(count))
            }
            NodeKind::AndNot(_) => {
                if self.is_empty_node(rebuilt[0]) {
                    self.node_mut(id).common.children = rebuilt;
                    Ok(ShareOutcome::Count(0))
                } else if rebuilt.len() > 1 && self.is_empty_node(rebuilt[1]) {
                    Ok(ShareOutcome::Replace(rebuilt[0]))
                } else {
                    let count = rebuilt.len();
                    self.node_mut(id).common.children = rebuilt;
                    Ok(ShareOutcome::Count(count))
                }
            }
            _ => {
                let any_empty = rebuilt.iter().any(|&child| self.is_empty_node(child));
                let count = if any_empty { 0 } else { rebuilt.len() };
                self.node_mut(id).common.children = rebuilt;
                Ok(ShareOutcome::Count(count))
            }
        }
    }

    /// Promote the only child of a collapsible node. Unary operators, the
    /// marked short-word ORs and atomic parents over differently scored
    /// children keep their wrapper.
    fn collapse_single(&mut self, id: NodeId) -> NodeId {
        let child = match self.node(id).common.children.first() {
            Some(&child) => child,
            None => return id,
        };
        match &self.node(id).kind {
            NodeKind::Scale(_)
            | NodeKind::Location(_)
            | NodeKind::End(_)
            | NodeKind::Word(_)
            | NodeKind::OrderedDistance(_)
            | NodeKind::Window(_)
            | NodeKind::AndNot(_) => id,
            NodeKind::Or(or) if or.short_word_length != 0 => id,
            NodeKind::AtomicOr(or) if or.short_word_length != 0 => id,
            NodeKind::And | NodeKind::Or(_) | NodeKind::AtomicOr(_) => {
                let parent_calculator = self
                    .node(id)
                    .common
                    .calculator
                    .as_ref()
                    .map(|c| c.description(true));
                match parent_calculator {
                    None => child,
                    Some(parent_description) => {
                        let child_calculator = self
                            .node(child)
                            .common
                            .calculator
                            .as_ref()
                            .map(|c| c.description(true));
                        let child_atomic = matches!(self.node(child).kind, NodeKind::Token(_))
                            || self.node(child).kind.is_atomic_scored();
                        if child_atomic && child_calculator.as_deref() == Some(&*parent_description)
                        {
                            child
                        } else {
                            id
                        }
                    }
                }
            }
            _ => id,
        }
    }

    // ------------------------------------------------------------------
    // rough pointers
    // ------------------------------------------------------------------

    /// Build the rough pointer of every conjunctive internal node and
    /// report this node's contribution to the parent's rough set.
    /// Returns false when an empty set poisoned the collection.
    fn make_rough(&mut self, id: NodeId, parent: &mut Vec<NodeId>) -> Result<bool> {
        match &self.node(id).kind {
            NodeKind::Empty => {
                parent.clear();
                return Ok(false);
            }
            NodeKind::Term(_) => return Err(InternalError::DanglingTermLeaf.into()),
            NodeKind::Token(_) => {
                if !parent.contains(&id) {
                    parent.push(id);
                }
                return Ok(true);
            }
            NodeKind::BooleanResult(_) | NodeKind::RankingResult(_) => {
                if !parent.contains(&id) {
                    parent.push(id);
                }
                return Ok(true);
            }
            NodeKind::Regex(_) => return Ok(true),
            NodeKind::Or(_) | NodeKind::AtomicOr(_) => {
                // a union cannot tighten a conjunctive rough set, but its
                // own children still get their pointers
                for child in self.children_of(id) {
                    let mut throwaway = Vec::new();
                    self.make_rough(child, &mut throwaway)?;
                }
                return Ok(true);
            }
            NodeKind::OrderedDistance(_) => {
                // built during term erasure; only contribute its members
                if let Some(rough) = self.node(id).common.rough {
                    if rough != id && matches!(self.node(rough).kind, NodeKind::And) {
                        for member in self.children_of(rough) {
                            if !parent.contains(&member) {
                                parent.push(member);
                            }
                        }
                    } else if !parent.contains(&rough) {
                        parent.push(rough);
                    }
                }
                return Ok(true);
            }
            _ => (),
        }

        // And, AndNot, Window, Scale, Location, End, Word
        let contributing: Vec<NodeId> = match &self.node(id).kind {
            NodeKind::AndNot(_) => vec![self.node(id).common.children[0]],
            _ => self.children_of(id),
        };
        let mut collected = Vec::new();
        let mut usable = true;
        for child in contributing {
            if !self.make_rough(child, &mut collected)? {
                usable = false;
                break;
            }
        }
        if let NodeKind::AndNot(_) = &self.node(id).kind {
            // the negative operand builds its own pointers only
            let second = self.node(id).common.children[1];
            let mut throwaway = Vec::new();
            self.make_rough(second, &mut throwaway)?;
        }
        if usable {
            self.attach_rough_node(id, &collected);
            for member in collected {
                if !parent.contains(&member) {
                    parent.push(member);
                }
            }
        }
        Ok(true)
    }

    fn attach_rough_node(&mut self, id: NodeId, members: &[NodeId]) {
        if self.node(id).common.rough.is_some() {
            // shared nodes got theirs on the first visit
            return;
        }
        match members.len() {
            0 => (),
            1 => {
                let member = members[0];
                self.node_mut(id).common.rough = Some(member);
                self.node_mut(member).common.rough = Some(member);
            }
            _ => {
                if matches!(self.node(id).kind, NodeKind::And) {
                    let all_tokens = self
                        .children_of(id)
                        .iter()
                        .all(|&child| matches!(self.node(child).kind, NodeKind::Token(_)));
                    if all_tokens {
                        self.node_mut(id).common.rough = Some(id);
                        return;
                    }
                }
                let mut sorted: Vec<NodeId> = members.to_vec();
                sorted.sort_by_key(|&member| self.sort_factor(member));
                let mut rough = QueryNode::new(NodeKind::And);
                rough.common.children = sorted;
                let rough = self.push_node(rough);
                self.node_mut(rough).common.rough = Some(rough);
                self.node_mut(id).common.rough = Some(rough);
            }
        }
    }

    fn share_rough(&mut self, id: NodeId) {
        for child in self.children_of(id) {
            if self.node(child).kind.is_internal() {
                self.share_rough(child);
            }
        }
        let rough = match self.node(id).common.rough {
            Some(rough) if rough != id && self.node(rough).kind.is_internal() => rough,
            _ => return,
        };
        let key = self.canonical_key(rough);
        match self.node_map.get(&key) {
            Some(&existing) if existing != rough => {
                self.node_mut(id).common.rough = Some(existing);
            }
            Some(_) => (),
            None => {
                self.node_map.insert(key, rough);
            }
        }
    }

    // ------------------------------------------------------------------
    // final structural checks
    // ------------------------------------------------------------------

    fn check_tree(&mut self, id: NodeId, set_strings: bool, need_df: bool) -> Result<()> {
        if need_df {
            self.node_mut(id).common.need_df = true;
        }
        let count = self.node(id).common.children.len();
        let violation: Option<&'static str> = match &self.node(id).kind {
            NodeKind::Term(_) => return Err(InternalError::DanglingTermLeaf.into()),
            NodeKind::AndNot(_) if count != 2 => Some("exactly 2"),
            NodeKind::Window(_) if count < 2 => Some("at least 2"),
            NodeKind::Scale(_) | NodeKind::Location(_) | NodeKind::End(_) | NodeKind::Word(_)
                if count != 1 =>
            {
                Some("exactly 1")
            }
            NodeKind::And | NodeKind::Or(_) | NodeKind::AtomicOr(_)
            | NodeKind::OrderedDistance(_)
                if count == 0 =>
            {
                Some("at least 1")
            }
            _ => None,
        };
        if let Some(expected) = violation {
            return Err(UserError::InvalidChildCount {
                node: self.node(id).kind.name(),
                expected,
                actual: count,
            }
            .into());
        }

        if set_strings && self.node(id).common.original_term.is_some() {
            let options = DescriptionOptions { as_term_string: true, ..Default::default() };
            let term_string = self.canonical_string(id, options);
            if !self.term_nodes.iter().any(|(existing, _)| existing == &term_string) {
                self.term_nodes.push((term_string, id));
            }
            let average = self.average_document_length;
            if average != 0 {
                if let Some(calculator) = self.node_mut(id).common.calculator.as_mut() {
                    calculator.set_average_document_length(average);
                }
            }
        }

        let child_set_strings = set_strings && self.node(id).common.original_term.is_none();
        let is_and = matches!(self.node(id).kind, NodeKind::And);
        let is_and_not = matches!(self.node(id).kind, NodeKind::AndNot(_));
        for (at, child) in self.children_of(id).into_iter().enumerate() {
            let child_need = need_df || is_and || (is_and_not && at == 1);
            self.check_tree(child, child_set_strings, child_need)?;
        }
        if let NodeKind::Word(word) = &self.node(id).kind {
            if let Some(boundary) = word.boundary {
                self.check_tree(boundary, false, false)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use roaring::RoaringBitmap;

    use crate::index::MemoryIndex;
    use crate::query::node::NodeKind;
    use crate::query::{EvaluateMode, Query, TermMatchMode, ValidateMode};
    use crate::DocumentId;

    fn phrase_index() -> MemoryIndex {
        let mut index = MemoryIndex::new();
        index.index_document(1, "abcd");
        index.index_document(2, "abxcd");
        index.index_document(3, "dcba");
        index.index_document(4, "xabcx");
        index
    }

    #[test]
    fn rough_pointers_over_approximate_the_hit_set() {
        let index = phrase_index();
        let mut builder = Query::builder();
        let left = builder.term("abc", TermMatchMode::Simple);
        let right = builder.term("bcd", TermMatchMode::Simple);
        let root = builder.and(vec![left, right]);
        let mut query = builder.build(root);
        query.validate(&index, ValidateMode::boolean(), 0).unwrap();

        let root = query.root().unwrap();
        assert!(query.node(root).common.rough.is_some());
        for doc in 1..=5 as DocumentId {
            let rough = query
                .evaluate_node(root, doc, EvaluateMode::default().rough())
                .unwrap();
            let precise = query.evaluate_node(root, doc, EvaluateMode::default()).unwrap();
            assert!(!precise || rough, "doc {} hit without its rough superset", doc);
        }
    }

    #[test]
    fn phrase_rough_nodes_are_token_conjunctions() {
        let index = phrase_index();
        let mut builder = Query::builder();
        let root = builder.term("abc", TermMatchMode::Simple);
        let mut query = builder.build(root);
        query.validate(&index, ValidateMode::boolean(), 0).unwrap();

        let root = query.root().unwrap();
        assert!(matches!(query.node(root).kind, NodeKind::OrderedDistance(_)));
        let rough = query.node(root).common.rough.unwrap();
        assert!(matches!(query.node(rough).kind, NodeKind::And));
        for child in query.children_of(rough) {
            assert!(matches!(query.node(child).kind, NodeKind::Token(_)));
        }
        // the trailing member of "abc" is its last bigram
        assert!(query.node(root).common.end_node.is_some());
    }

    #[test]
    fn missing_terms_empty_conjunctions_but_not_disjunctions() {
        let index = phrase_index();

        let mut builder = Query::builder();
        let gone = builder.term("zq", TermMatchMode::Simple);
        let there = builder.term("ab", TermMatchMode::Simple);
        let root = builder.and(vec![gone, there]);
        let mut query = builder.build(root);
        query.validate(&index, ValidateMode::boolean(), 0).unwrap();
        let hits = query.retrieve(&RoaringBitmap::new(), DocumentId::MAX).unwrap();
        assert!(hits.is_empty());
        assert_eq!(query.document_frequency(false, None, DocumentId::MAX).unwrap(), 0);

        let mut builder = Query::builder();
        let gone = builder.term("zq", TermMatchMode::Simple);
        let there = builder.term("ab", TermMatchMode::Simple);
        let root = builder.or(vec![gone, there]);
        let mut query = builder.build(root);
        query.validate(&index, ValidateMode::boolean(), 0).unwrap();
        let hits = query.retrieve(&RoaringBitmap::new(), DocumentId::MAX).unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn identical_phrases_share_one_node() {
        let index = phrase_index();
        let mut builder = Query::builder();
        let left = builder.term("abc", TermMatchMode::Simple);
        let right = builder.term("abc", TermMatchMode::Simple);
        let extra = builder.term("cd", TermMatchMode::Simple);
        let or = builder.or(vec![right, extra]);
        let root = builder.and(vec![left, or]);
        let mut query = builder.build(root);
        query.validate(&index, ValidateMode::boolean(), 0).unwrap();

        let root = query.root().unwrap();
        let children = query.children_of(root);
        let or_children = query.children_of(children[1]);
        // the phrase under the Or is the same arena node as the left one
        assert!(or_children.contains(&children[0]));
    }
}
