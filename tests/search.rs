use std::sync::Arc;

use big_s::S;
use roaring::RoaringBitmap;

use inverted_query::score::{
    ComplementScoreNegator, OkapiTfScoreCalculator, SumScoreCombiner,
};
use inverted_query::{DocumentId, MemoryIndex, Query, TermMatchMode, ValidateMode};

fn no_excluded() -> RoaringBitmap {
    RoaringBitmap::new()
}

fn docs(result: &RoaringBitmap) -> Vec<DocumentId> {
    result.iter().collect()
}

/// A {1,2,3}, B {2,3,4}, the posting pair every boolean scenario uses.
fn ab_index() -> MemoryIndex {
    let postings = maplit::btreemap! {
        "aa" => vec![(1, vec![1]), (2, vec![1]), (3, vec![1])],
        "bb" => vec![(2, vec![5]), (3, vec![9]), (4, vec![2])],
    };
    let mut index = MemoryIndex::new();
    for (token, postings) in postings {
        index.insert_list(token, postings);
    }
    index
}

#[test]
fn and_intersects() {
    let index = ab_index();
    let mut builder = Query::builder();
    let a = builder.token("aa");
    let b = builder.token("bb");
    let root = builder.and(vec![a, b]);
    let mut query = builder.build(root);
    query.validate(&index, ValidateMode::boolean(), 0).unwrap();

    let result = query.retrieve(&no_excluded(), DocumentId::MAX).unwrap();
    assert_eq!(docs(&result), vec![2, 3]);
}

#[test]
fn term_at_a_time_and_matches_document_at_a_time() {
    let index = ab_index();
    let mut builder = Query::builder();
    let a = builder.token("aa");
    let b = builder.token("bb");
    let root = builder.and(vec![a, b]);
    let mut query = builder.build(root);
    query.validate(&index, ValidateMode::boolean(), 0).unwrap();

    let mode = inverted_query::EvaluateMode { and_term_at_a_time: true, ..Default::default() };
    let result = query.retrieve_with(&no_excluded(), DocumentId::MAX, mode).unwrap();
    assert_eq!(docs(&result), vec![2, 3]);
}

#[test]
fn or_unions() {
    let index = ab_index();
    let mut builder = Query::builder();
    let a = builder.token("aa");
    let b = builder.token("bb");
    let root = builder.or(vec![a, b]);
    let mut query = builder.build(root);
    query.validate(&index, ValidateMode::boolean(), 0).unwrap();

    let result = query.retrieve(&no_excluded(), DocumentId::MAX).unwrap();
    assert_eq!(docs(&result), vec![1, 2, 3, 4]);
}

#[test]
fn and_not_subtracts() {
    let index = ab_index();
    let mut builder = Query::builder();
    let a = builder.token("aa");
    let b = builder.token("bb");
    let root = builder.and_not(a, b);
    let mut query = builder.build(root);
    query.validate(&index, ValidateMode::boolean(), 0).unwrap();

    let result = query.retrieve(&no_excluded(), DocumentId::MAX).unwrap();
    assert_eq!(docs(&result), vec![1]);
}

#[test]
fn and_not_with_negator_scores_every_first_operand_hit() {
    let index = ab_index();
    let mut builder = Query::builder();
    let a = builder.token("aa");
    let b = builder.token("bb");
    let root = builder.and_not_with_negator(a, b, Box::new(ComplementScoreNegator));
    builder.set_combiner(root, Box::new(SumScoreCombiner));
    let mut query = builder.build(root);
    query.validate(&index, ValidateMode::ranking(), 0).unwrap();

    let result = query.retrieve_ranked(&no_excluded(), DocumentId::MAX).unwrap();
    // tf 1 everywhere: the partial score is 1/(1+1) = 0.5
    // doc 1 misses B entirely and still goes through the negator at 0.0
    let expected = vec![(1, 0.5 + 1.0), (2, 0.5 + 0.5), (3, 0.5 + 0.5)];
    assert_eq!(result, expected);
}

#[test]
fn unordered_window_checks_the_distance() {
    let mut index = MemoryIndex::new();
    index.insert_list("aa", vec![(7, vec![5])]);
    index.insert_list("bb", vec![(7, vec![7])]);
    index.insert_list("cc", vec![(7, vec![9])]);

    let mut builder = Query::builder();
    let a = builder.token("aa");
    let b = builder.token("bb");
    let root = builder.window(1, 3, false, vec![a, b]);
    let mut query = builder.build(root);
    query.validate(&index, ValidateMode::boolean(), 0).unwrap();
    let result = query.retrieve(&no_excluded(), DocumentId::MAX).unwrap();
    assert_eq!(docs(&result), vec![7]);

    // the far occurrence is 4 positions away, outside [1, 3]
    let mut builder = Query::builder();
    let a = builder.token("aa");
    let c = builder.token("cc");
    let root = builder.window(1, 3, false, vec![a, c]);
    let mut query = builder.build(root);
    query.validate(&index, ValidateMode::boolean(), 0).unwrap();
    let result = query.retrieve(&no_excluded(), DocumentId::MAX).unwrap();
    assert!(result.is_empty());
}

#[test]
fn scale_multiplies_the_final_score() {
    let mut index = MemoryIndex::new();
    index.insert_list("xx", vec![(11, vec![1, 5, 9])]);

    let mut builder = Query::builder();
    let x = builder.token("xx");
    let root = builder.scale(2.0, x);
    let mut query = builder.build(root);
    // tf 3 with k = 7 makes the first-step score 3/10 = 0.3
    query.set_default_score_calculator(Box::new(OkapiTfScoreCalculator::new(7.0)));
    query.validate(&index, ValidateMode::ranking(), 0).unwrap();

    let result = query.retrieve_ranked(&no_excluded(), DocumentId::MAX).unwrap();
    assert_eq!(result, vec![(11, 0.6)]);
}

#[test]
fn or_normal_form_preserves_the_hit_set() {
    let mut index = MemoryIndex::new();
    index.insert_list("aa", vec![(1, vec![1]), (5, vec![1])]);
    index.insert_list("bb", vec![(2, vec![1]), (5, vec![2])]);
    index.insert_list("cc", vec![(1, vec![3]), (2, vec![3])]);
    index.insert_list("dd", vec![(5, vec![4]), (9, vec![1])]);

    let build = |or_standard: bool| {
        let mut builder = Query::builder();
        let a = builder.token("aa");
        let b = builder.token("bb");
        let c = builder.token("cc");
        let d = builder.token("dd");
        let left = builder.or(vec![a, b]);
        let right = builder.or(vec![c, d]);
        let root = builder.and(vec![left, right]);
        let mut query = builder.build(root);
        let mut mode = ValidateMode::boolean();
        mode.or_standard = or_standard;
        query.set_or_standard_threshold(4);
        query.validate(&index, mode, 0).unwrap();
        query
    };

    let mut plain = build(false);
    let mut rewritten = build(true);
    let expected = plain.retrieve(&no_excluded(), DocumentId::MAX).unwrap();
    let actual = rewritten.retrieve(&no_excluded(), DocumentId::MAX).unwrap();
    assert_eq!(docs(&expected), docs(&actual));
    assert_eq!(docs(&actual), vec![1, 2, 5]);

    // the rewritten tree is a disjunction of four conjunctions
    let description = rewritten.description(Default::default());
    assert!(description.starts_with("#or("), "{}", description);
    assert_eq!(description.matches("#and(").count(), 4, "{}", description);
}

#[test]
fn or_normal_form_respects_the_threshold() {
    let mut index = MemoryIndex::new();
    index.insert_list("aa", vec![(1, vec![1])]);
    index.insert_list("bb", vec![(2, vec![1])]);
    index.insert_list("cc", vec![(1, vec![3])]);
    index.insert_list("dd", vec![(3, vec![4])]);

    let mut builder = Query::builder();
    let a = builder.token("aa");
    let b = builder.token("bb");
    let c = builder.token("cc");
    let d = builder.token("dd");
    let left = builder.or(vec![a, b]);
    let right = builder.or(vec![c, d]);
    let root = builder.and(vec![left, right]);
    let mut query = builder.build(root);
    query.set_or_standard_threshold(3);
    query.validate(&index, ValidateMode::boolean(), 0).unwrap();

    let description = query.description(Default::default());
    assert!(description.starts_with("#and("), "{}", description);
}

#[test]
fn commutativity_of_and_and_or() {
    let index = ab_index();
    for swap in &[false, true] {
        let mut builder = Query::builder();
        let a = builder.token("aa");
        let b = builder.token("bb");
        let (x, y) = if *swap { (b, a) } else { (a, b) };
        let and = builder.and(vec![x, y]);
        let mut query = builder.build(and);
        query.validate(&index, ValidateMode::boolean(), 0).unwrap();
        for doc in 1..=5 {
            let expected = doc == 2 || doc == 3;
            assert_eq!(query.evaluate(doc).unwrap(), expected, "doc {}", doc);
        }
    }
}

#[test]
fn lower_bound_is_monotone() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(102);
    let mut postings_a: Vec<DocumentId> = (0..300).map(|_| rng.gen_range(1..5_000)).collect();
    let mut postings_b: Vec<DocumentId> = (0..200).map(|_| rng.gen_range(1..5_000)).collect();
    postings_a.sort_unstable();
    postings_a.dedup();
    postings_b.sort_unstable();
    postings_b.dedup();

    let mut index = MemoryIndex::new();
    index.insert_list("aa", postings_a.iter().map(|&d| (d, vec![1])).collect());
    index.insert_list("bb", postings_b.iter().map(|&d| (d, vec![1])).collect());

    let mut builder = Query::builder();
    let a = builder.token("aa");
    let b = builder.token("bb");
    let root = builder.and(vec![a, b]);
    let mut query = builder.build(root);
    query.validate(&index, ValidateMode::boolean(), 0).unwrap();

    let mut rng = StdRng::seed_from_u64(205);
    let mut inputs: Vec<DocumentId> = (0..100).map(|_| rng.gen_range(1..5_000)).collect();
    inputs.sort_unstable();

    let mut last_found = 0;
    for given in inputs {
        if let Some(found) = query.lower_bound(given).unwrap() {
            assert!(found >= given);
            assert!(found >= last_found, "lower_bound went backwards");
            last_found = found;
        }
    }
}

#[test]
fn scored_lower_bound_walks_matches_in_order() {
    let index = ab_index();
    let mut builder = Query::builder();
    let a = builder.token("aa");
    let b = builder.token("bb");
    let root = builder.and(vec![a, b]);
    let mut query = builder.build(root);
    query.validate(&index, ValidateMode::ranking(), 0).unwrap();

    let mut found = Vec::new();
    let mut given = 1;
    while let Some((doc, score)) = query.lower_bound_score(given).unwrap() {
        assert!(score > 0.0);
        found.push(doc);
        given = doc + 1;
    }
    assert_eq!(found, vec![2, 3]);
}

#[test]
fn two_step_scores_match_direct_evaluation() {
    let mut index = MemoryIndex::new();
    index.insert_list("aa", vec![(1, vec![1, 3]), (2, vec![1]), (6, vec![2, 4, 8])]);
    index.insert_list("bb", vec![(2, vec![5]), (6, vec![9]), (7, vec![1])]);

    let mut builder = Query::builder();
    let a = builder.token("aa");
    let b = builder.token("bb");
    let root = builder.or_with_combiner(vec![a, b], Box::new(SumScoreCombiner));
    let mut query = builder.build(root);
    query.validate(&index, ValidateMode::ranking(), 0).unwrap();

    let mut direct = Vec::new();
    for doc in 1..=10 {
        if let Some(score) = query.evaluate_score(doc).unwrap() {
            direct.push((doc, score));
        }
    }
    let two_step = query.retrieve_ranked(&no_excluded(), DocumentId::MAX).unwrap();
    assert_eq!(direct, two_step);
}

#[test]
fn excluded_documents_are_skipped() {
    let index = ab_index();
    let mut builder = Query::builder();
    let a = builder.token("aa");
    let b = builder.token("bb");
    let root = builder.or(vec![a, b]);
    let mut query = builder.build(root);
    query.validate(&index, ValidateMode::boolean(), 0).unwrap();

    let excluded: RoaringBitmap = [2u32, 4].iter().copied().collect();
    let result = query.retrieve(&excluded, DocumentId::MAX).unwrap();
    assert_eq!(docs(&result), vec![1, 3]);

    let result = query.retrieve(&no_excluded(), 2).unwrap();
    assert_eq!(docs(&result), vec![1, 2]);
}

#[test]
fn term_queries_resolve_to_phrases() {
    let mut index = MemoryIndex::new();
    index.index_document(1, "abcd");
    index.index_document(2, "abxbc");
    index.index_document(3, "xxabc");

    let mut builder = Query::builder();
    let root = builder.term("abc", TermMatchMode::Simple);
    let mut query = builder.build(root);
    query.validate(&index, ValidateMode::boolean(), 0).unwrap();

    // document 2 holds "ab" and "bc" but never adjacent: the rough
    // conjunction admits it, the position check rejects it
    let result = query.retrieve(&no_excluded(), DocumentId::MAX).unwrap();
    assert_eq!(docs(&result), vec![1, 3]);
}

#[test]
fn term_erasure_registers_the_original_string() {
    let mut index = MemoryIndex::new();
    index.index_document(1, "abcd");

    let mut builder = Query::builder();
    let root = builder.term("abc", TermMatchMode::Simple);
    let mut query = builder.build(root);
    query.validate(&index, ValidateMode::boolean(), 0).unwrap();

    let terms = query.term_nodes();
    assert_eq!(terms.len(), 1);
    assert!(terms[0].0.contains("(abc)"), "{}", terms[0].0);

    let search_terms = query.search_terms();
    assert_eq!(search_terms.len(), 1);
    assert_eq!(search_terms[0].term, S("abc"));
    assert_eq!(search_terms[0].match_mode, TermMatchMode::Simple);
}

#[test]
fn short_words_expand_to_an_or() {
    let mut index = MemoryIndex::new();
    index.index_document(1, "abcd");
    index.index_document(2, "axyz");
    index.index_document(3, "zzzz");

    let mut builder = Query::builder();
    let root = builder.term("a", TermMatchMode::Simple);
    let mut query = builder.build(root);
    query.validate(&index, ValidateMode::boolean(), 0).unwrap();

    assert!(query.has_short_word());
    let result = query.retrieve(&no_excluded(), DocumentId::MAX).unwrap();
    assert_eq!(docs(&result), vec![1, 2]);
}

#[test]
fn shared_nodes_merge_identical_subtrees() {
    let mut index = MemoryIndex::new();
    index.index_document(1, "abcd");
    index.index_document(2, "bcde");

    let mut builder = Query::builder();
    let left = builder.term("bcd", TermMatchMode::Simple);
    let right = builder.term("bcd", TermMatchMode::Simple);
    let extra = builder.term("ab", TermMatchMode::Simple);
    let or = builder.or(vec![right, extra]);
    let root = builder.and(vec![left, or]);
    let mut query = builder.build(root);
    query.validate(&index, ValidateMode::boolean(), 0).unwrap();

    let result = query.retrieve(&no_excluded(), DocumentId::MAX).unwrap();
    assert_eq!(docs(&result), vec![1, 2]);
}

#[test]
fn validate_is_idempotent() {
    let mut index = MemoryIndex::new();
    index.index_document(1, "abcd");
    index.index_document(2, "bcde");

    let mut builder = Query::builder();
    let left = builder.term("abc", TermMatchMode::Simple);
    let right = builder.term("bcd", TermMatchMode::Simple);
    let root = builder.and(vec![left, right]);
    let mut query = builder.build(root);

    query.validate(&index, ValidateMode::boolean(), 0).unwrap();
    let first = query.description(Default::default());
    query.validate(&index, ValidateMode::boolean(), 0).unwrap();
    let second = query.description(Default::default());
    assert_eq!(first, second);
}

#[test]
fn ranked_phrase_query_end_to_end() {
    let mut index = MemoryIndex::new();
    index.index_document(1, "abcabc");
    index.index_document(2, "abc");
    index.index_document(3, "acbacb");
    let index = Arc::new(index);

    let mut builder = Query::builder();
    let root = builder.term("abc", TermMatchMode::Simple);
    let mut query = builder.build(root);
    query.set_document_length_store(index.clone());
    query
        .validate(index.as_ref(), ValidateMode::ranking(), 4)
        .unwrap();

    let result = query.retrieve_ranked(&no_excluded(), DocumentId::MAX).unwrap();
    let ids: Vec<DocumentId> = result.iter().map(|&(doc, _)| doc).collect();
    assert_eq!(ids, vec![1, 2]);
    // two phrase occurrences outscore one
    assert!(result[0].1 > result[1].1);
}

#[test]
fn boolean_result_leaves_join_the_tree() {
    let index = ab_index();
    let mut builder = Query::builder();
    let a = builder.token("aa");
    let constant = builder.boolean_result(vec![2, 4, 6]);
    let root = builder.and(vec![a, constant]);
    let mut query = builder.build(root);
    query.validate(&index, ValidateMode::boolean(), 0).unwrap();

    let result = query.retrieve(&no_excluded(), DocumentId::MAX).unwrap();
    assert_eq!(docs(&result), vec![2]);
}

#[test]
fn regex_leaves_scan_document_bodies() {
    let mut index = MemoryIndex::new();
    index.index_document(1, "the quick brown fox");
    index.index_document(2, "lazy dogs sleep");
    index.index_document(3, "quicker than light");

    let mut builder = Query::builder();
    let root = builder.regex("quick\\w*");
    let mut query = builder.build(root);
    query.validate(&index, ValidateMode::boolean(), 0).unwrap();

    let result = query.retrieve(&no_excluded(), DocumentId::MAX).unwrap();
    assert_eq!(docs(&result), vec![1, 3]);
}

#[test]
fn document_frequency_estimates_and_exact_counts() {
    let index = ab_index();
    let mut builder = Query::builder();
    let a = builder.token("aa");
    let b = builder.token("bb");
    let root = builder.or(vec![a, b]);
    let mut query = builder.build(root);
    query.validate(&index, ValidateMode::boolean(), 0).unwrap();

    let estimated = query.document_frequency(true, None, DocumentId::MAX).unwrap();
    assert!(estimated >= 4);
    let exact = query.document_frequency(false, None, DocumentId::MAX).unwrap();
    assert_eq!(exact, 4);

    let excluded: RoaringBitmap = [1u32].iter().copied().collect();
    let exact = query
        .document_frequency(false, Some(&excluded), DocumentId::MAX)
        .unwrap();
    assert_eq!(exact, 3);
}

#[test]
fn ordered_window_requires_the_order() {
    let mut index = MemoryIndex::new();
    index.insert_list("aa", vec![(1, vec![5]), (2, vec![7])]);
    index.insert_list("bb", vec![(1, vec![7]), (2, vec![5])]);

    let mut builder = Query::builder();
    let a = builder.token("aa");
    let b = builder.token("bb");
    let root = builder.window(1, 3, true, vec![a, b]);
    let mut query = builder.build(root);
    query.validate(&index, ValidateMode::boolean(), 0).unwrap();

    let result = query.retrieve(&no_excluded(), DocumentId::MAX).unwrap();
    assert_eq!(docs(&result), vec![1]);
}

#[test]
fn operator_windows_over_terms_become_simple_windows() {
    let mut index = MemoryIndex::new();
    index.index_document(1, "abxcd");

    let run = |min, max| {
        let mut builder = Query::builder();
        let left = builder.term("ab", TermMatchMode::Simple);
        let right = builder.term("cd", TermMatchMode::Simple);
        let root = builder.window(min, max, true, vec![left, right]);
        let mut query = builder.build(root);
        query.validate(&index, ValidateMode::boolean(), 0).unwrap();
        let hits = query.retrieve(&no_excluded(), DocumentId::MAX).unwrap();
        (query.description(Default::default()), docs(&hits))
    };

    // "ab" at 1, "cd" at 4: the start distance is 3
    let (description, hits) = run(3, 3);
    assert!(description.starts_with("#swindow[4,4"), "{}", description);
    assert_eq!(hits, vec![1]);

    let (_, hits) = run(1, 2);
    assert!(hits.is_empty());
}

#[test]
fn location_and_end_constrain_occurrence_positions() {
    let mut index = MemoryIndex::new();
    index.insert_list("ab", vec![(1, vec![3]), (2, vec![7])]);

    let mut builder = Query::builder();
    let token = builder.token("ab");
    let root = builder.location(3, token);
    let mut query = builder.build(root);
    query.validate(&index, ValidateMode::boolean(), 0).unwrap();
    let result = query.retrieve(&no_excluded(), DocumentId::MAX).unwrap();
    assert_eq!(docs(&result), vec![1]);

    // "ab" starting at 7 covers positions 7 and 8
    let mut builder = Query::builder();
    let token = builder.token("ab");
    let root = builder.end(8, token);
    let mut query = builder.build(root);
    query.validate(&index, ValidateMode::boolean(), 0).unwrap();
    let result = query.retrieve(&no_excluded(), DocumentId::MAX).unwrap();
    assert_eq!(docs(&result), vec![2]);
}

#[test]
fn conjunction_descendants_need_cross_index_frequencies() {
    let mut index = MemoryIndex::new();
    index.index_document(1, "abcd");

    let mut builder = Query::builder();
    let left = builder.term("abc", TermMatchMode::Simple);
    let right = builder.term("bcd", TermMatchMode::Simple);
    let root = builder.and(vec![left, right]);
    let mut query = builder.build(root);
    query.validate(&index, ValidateMode::boolean(), 0).unwrap();
    for &(_, node) in query.term_nodes() {
        assert!(query.needs_document_frequency(node));
    }

    let mut builder = Query::builder();
    let left = builder.term("abc", TermMatchMode::Simple);
    let right = builder.term("bcd", TermMatchMode::Simple);
    let root = builder.or(vec![left, right]);
    let mut query = builder.build(root);
    query.validate(&index, ValidateMode::boolean(), 0).unwrap();
    for &(_, node) in query.term_nodes() {
        assert!(!query.needs_document_frequency(node));
    }
}

#[test]
fn position_free_lists_fall_back_to_frequency_bounds() {
    let mut index = MemoryIndex::new();
    index.insert_no_location_list("aa", vec![(1, 4), (2, 2)]);
    index.insert_no_location_list("bb", vec![(2, 3)]);
    index.insert_list("cc", vec![(1, vec![9]), (2, vec![1])]);

    // every member frequency-only: the phrase is accepted conservatively
    let mut builder = Query::builder();
    let a = builder.token("aa");
    let b = builder.token("bb");
    let root = builder.ordered_distance(vec![1, 2], vec![a, b]);
    let mut query = builder.build(root);
    query.validate(&index, ValidateMode::boolean(), 0).unwrap();
    let result = query.retrieve(&no_excluded(), DocumentId::MAX).unwrap();
    assert_eq!(docs(&result), vec![2]);

    // mixed evidence cannot be aligned: the position check fails
    let mut builder = Query::builder();
    let a = builder.token("aa");
    let c = builder.token("cc");
    let root = builder.ordered_distance(vec![1, 2], vec![a, c]);
    let mut query = builder.build(root);
    query.validate(&index, ValidateMode::boolean(), 0).unwrap();
    let result = query.retrieve(&no_excluded(), DocumentId::MAX).unwrap();
    assert!(result.is_empty());
}

#[test]
fn synonym_nodes_score_as_one_unit() {
    let mut index = MemoryIndex::new();
    index.insert_list("aa", vec![(1, vec![1]), (2, vec![4])]);
    index.insert_list("bb", vec![(2, vec![9]), (3, vec![2])]);

    let mut builder = Query::builder();
    let a = builder.token("aa");
    let b = builder.token("bb");
    let root = builder.synonym(vec![a, b]);
    let mut query = builder.build(root);
    query.validate(&index, ValidateMode::ranking(), 0).unwrap();

    let result = query.retrieve_ranked(&no_excluded(), DocumentId::MAX).unwrap();
    let ids: Vec<DocumentId> = result.iter().map(|&(doc, _)| doc).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    // document 2 carries both members: tf 2 scores above tf 1
    assert!(result[1].1 > result[0].1);
    assert_eq!(result[0].1, result[2].1);
}
