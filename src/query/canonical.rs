use itertools::Itertools;

use crate::query::node::{NodeId, NodeKind};
use crate::query::Query;

/// Characters that carry structure in the canonical grammar; escaped with a
/// backslash inside literals.
const ESCAPEES: &[char] = &['#', '(', ')', '[', ']', ',', '\\'];

pub(crate) fn escape_term(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if ESCAPEES.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Rendering switches of `Query::description`.
#[derive(Debug, Clone, Copy)]
pub struct DescriptionOptions {
    /// Render nodes that originate from a term leaf back as `#term[…](…)`.
    pub as_term_string: bool,
    pub with_calculator_names: bool,
    pub with_calculator_params: bool,
    /// Append each rough node in `<…>` after its owner.
    pub with_rough: bool,
}

impl Default for DescriptionOptions {
    fn default() -> DescriptionOptions {
        DescriptionOptions {
            as_term_string: false,
            with_calculator_names: true,
            with_calculator_params: true,
            with_rough: false,
        }
    }
}

impl Query {
    /// The canonical key of a node: the string form shared-node
    /// elimination uses to detect identical sub-expressions.
    pub(crate) fn canonical_key(&self, id: NodeId) -> String {
        self.canonical_string(id, DescriptionOptions::default())
    }

    pub(crate) fn canonical_string(&self, id: NodeId, options: DescriptionOptions) -> String {
        let mut out = String::new();
        self.write_canonical(id, options, &mut out);
        out
    }

    fn scorer_name(&self, id: NodeId, options: DescriptionOptions) -> Option<String> {
        if !options.with_calculator_names {
            return None;
        }
        let common = &self.node(id).common;
        if let Some(calculator) = &common.calculator {
            return Some(calculator.description(options.with_calculator_params));
        }
        if let Some(combiner) = &common.combiner {
            return Some(combiner.description(options.with_calculator_params));
        }
        None
    }

    fn write_scorer_bracket(&self, id: NodeId, options: DescriptionOptions, out: &mut String) {
        if let Some(name) = self.scorer_name(id, options) {
            out.push('[');
            out.push_str(&name);
            out.push(']');
        }
    }

    fn write_canonical(&self, id: NodeId, options: DescriptionOptions, out: &mut String) {
        let node = self.node(id);

        if options.as_term_string {
            if let Some(original) = &node.common.original_term {
                out.push_str("#term[");
                out.push(original.match_mode.letter());
                out.push(',');
                if let Some(name) = self.scorer_name(id, options) {
                    out.push_str(&name);
                }
                out.push(',');
                if let Some(language) = &original.language {
                    out.push_str(language);
                }
                out.push_str("](");
                out.push_str(&escape_term(&original.term));
                out.push(')');
                self.write_rough(id, options, out);
                return;
            }
        }

        match &node.kind {
            NodeKind::Empty => {
                out.push_str("()");
                return;
            }
            NodeKind::Token(leaf) => {
                out.push_str("#token");
                self.write_scorer_bracket(id, options, out);
                out.push('(');
                if leaf.token.is_empty() {
                    out.push_str("\"EMPTY\"");
                } else {
                    out.push_str(&escape_term(&leaf.token));
                }
                out.push(')');
                self.write_rough(id, options, out);
                return;
            }
            NodeKind::Regex(leaf) => {
                out.push_str("#regex");
                self.write_scorer_bracket(id, options, out);
                out.push('(');
                out.push_str(&escape_term(&leaf.pattern));
                out.push(')');
                return;
            }
            NodeKind::BooleanResult(leaf) => {
                out.push_str("#bresult(");
                out.push_str(&leaf.docs.iter().map(|d| d.to_string()).join(","));
                out.push(')');
                return;
            }
            NodeKind::RankingResult(leaf) => {
                out.push_str("#rresult(");
                let body = leaf
                    .docs
                    .iter()
                    .map(|(d, s)| format!("{{{},{}}}", d, s))
                    .join(",");
                out.push_str(&body);
                out.push(')');
                return;
            }
            NodeKind::Term(leaf) => {
                out.push_str("#term[");
                out.push(leaf.match_mode.letter());
                out.push(',');
                if let Some(name) = self.scorer_name(id, options) {
                    out.push_str(&name);
                }
                out.push(',');
                if let Some(language) = &leaf.language {
                    out.push_str(language);
                }
                out.push_str("](");
                out.push_str(&escape_term(&leaf.term));
                out.push(')');
                return;
            }
            NodeKind::And => {
                out.push_str("#and");
                self.write_scorer_bracket(id, options, out);
            }
            NodeKind::Or(_) => {
                out.push_str("#or");
                self.write_scorer_bracket(id, options, out);
            }
            NodeKind::AtomicOr(_) => {
                out.push_str("#syn");
                self.write_scorer_bracket(id, options, out);
            }
            NodeKind::AndNot(and_not) => {
                out.push_str("#and-not");
                if options.with_calculator_names {
                    let combiner = self.scorer_name(id, options);
                    let negator = and_not.negator.as_ref().map(|n| n.name());
                    if combiner.is_some() || negator.is_some() {
                        out.push('[');
                        if let Some(name) = combiner {
                            out.push_str(&name);
                        }
                        if let Some(negator) = negator {
                            out.push(',');
                            out.push_str(negator);
                        }
                        out.push(']');
                    }
                }
            }
            NodeKind::OrderedDistance(distance) => {
                out.push_str("#distance[");
                out.push_str(&distance.path_positions.iter().map(|p| p.to_string()).join(","));
                out.push(']');
                self.write_scorer_bracket(id, options, out);
            }
            NodeKind::Window(window) => {
                out.push_str(if window.simple { "#swindow[" } else { "#window[" });
                out.push_str(&format!(
                    "{},{},{}",
                    window.min,
                    window.max,
                    if window.ordered { 'o' } else { 'u' }
                ));
                if let Some(name) = self.scorer_name(id, options) {
                    out.push(',');
                    out.push_str(&name);
                }
                out.push(']');
            }
            NodeKind::Scale(scale) => {
                out.push_str(&format!("#scale[{}]", scale.factor));
            }
            NodeKind::Location(location) => {
                out.push_str(&format!("#location[{}", location.position));
                if let Some(name) = self.scorer_name(id, options) {
                    out.push(',');
                    out.push_str(&name);
                }
                out.push(']');
            }
            NodeKind::End(end) => {
                out.push_str(&format!("#end[{}", end.distance));
                if let Some(name) = self.scorer_name(id, options) {
                    out.push(',');
                    out.push_str(&name);
                }
                out.push(']');
            }
            NodeKind::Word(word) => {
                out.push_str("#word[");
                out.push(word.match_mode.letter());
                if let Some(name) = self.scorer_name(id, options) {
                    out.push(',');
                    out.push_str(&name);
                }
                out.push(']');
            }
        }

        out.push('(');
        for (i, child) in node.common.children.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            self.write_canonical(*child, options, out);
        }
        out.push(')');
        self.write_rough(id, options, out);
    }

    fn write_rough(&self, id: NodeId, options: DescriptionOptions, out: &mut String) {
        if !options.with_rough {
            return;
        }
        if let Some(rough) = self.node(id).common.rough {
            if rough != id {
                out.push('<');
                let inner = DescriptionOptions { with_rough: false, ..options };
                self.write_canonical(rough, inner, out);
                out.push('>');
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Query, TermMatchMode};
    use crate::score::SumScoreCombiner;

    #[test]
    fn escaping_protects_grammar_characters() {
        assert_eq!(escape_term("a#b(c)"), "a\\#b\\(c\\)");
        assert_eq!(escape_term("x,y\\z"), "x\\,y\\\\z");
        assert_eq!(escape_term("plain"), "plain");
    }

    #[test]
    fn canonical_strings_nest() {
        let mut builder = Query::builder();
        let a = builder.token("ab");
        let b = builder.token("cd");
        let or = builder.or(vec![a, b]);
        let root = builder.and(vec![or]);
        let query = builder.build(root);
        assert_eq!(query.canonical_key(root), "#or(#token(ab),#token(cd))");
    }

    #[test]
    fn combiner_names_can_be_toggled() {
        let mut builder = Query::builder();
        let a = builder.token("ab");
        let b = builder.token("cd");
        let root = builder.or_with_combiner(vec![a, b], Box::new(SumScoreCombiner));
        let query = builder.build(root);
        assert_eq!(query.canonical_key(root), "#or[Sum](#token(ab),#token(cd))");
        let bare = DescriptionOptions { with_calculator_names: false, ..Default::default() };
        assert_eq!(query.canonical_string(root, bare), "#or(#token(ab),#token(cd))");
    }

    #[test]
    fn term_leaf_renders_mode_and_language() {
        let mut builder = Query::builder();
        let term = builder.term_with_language("hello", TermMatchMode::ExactWord, "en");
        let query = builder.build(term);
        assert_eq!(query.canonical_key(term), "#term[e,,en](hello)");
    }
}
