use std::collections::BTreeMap;
use std::sync::Arc;

use fxhash::FxHashMap;

use crate::location::{LocationIterator, VecLocationIterator};
use crate::{DocumentId, Position, Result, TermFrequency, UPPER_BOUND_DOC_ID};

/// The inverted-file side of the engine, supplied to `Query::validate`.
/// Tokenisation is also reached through this trait: `split_term` and
/// `expand_short_term` are the two hooks term erasure needs from the host's
/// tokenizer.
pub trait InvertedIndex {
    /// The inverted list of one index term, or `None` when the term does
    /// not occur anywhere.
    fn inverted_list(&self, token: &str) -> Result<Option<Box<dyn InvertedList>>>;

    /// Number of documents in the collection.
    fn document_frequency(&self) -> u64;

    /// The biggest document id in use.
    fn last_document_id(&self) -> DocumentId;

    /// Split a query term into `(offset, index term)` pairs, offsets being
    /// 1-based character positions inside the term. An empty result means
    /// the term is shorter than an index term and must be expanded with
    /// `expand_short_term`.
    fn split_term(&self, term: &str) -> Vec<(Position, String)>;

    /// All index terms starting with `prefix`, for short-word expansion.
    fn expand_short_term(&self, prefix: &str) -> Result<Vec<String>>;

    /// A cursor over document bodies, for regex leaves.
    fn document_cursor(&self) -> Result<Box<dyn DocumentCursor>>;
}

/// One inverted list. Owned by the leaf node that looked it up.
pub trait InvertedList: Send {
    fn key(&self) -> &str;
    fn document_frequency(&self) -> u64;
    fn last_document_id(&self) -> DocumentId;
    /// True when the list stores no positions, only frequencies.
    fn is_no_location(&self) -> bool;
    fn begin(&self) -> Box<dyn PostingIterator>;
}

/// A lazy, restartable walk over one inverted list, ordered by ascending
/// document id.
pub trait PostingIterator: Send {
    fn is_end(&self) -> bool;
    fn next(&mut self);
    /// `UPPER_BOUND_DOC_ID` once the iterator is exhausted.
    fn document_id(&self) -> DocumentId;
    fn term_frequency(&self) -> TermFrequency;
    /// The positions of the current posting; every occurrence reports the
    /// given match length.
    fn locations(&self, length: Position) -> Box<dyn LocationIterator>;
    /// Jump forward to the first posting with id >= `id`.
    fn lower_bound(&mut self, id: DocumentId);
    fn reset(&mut self);
}

/// A lazy walk over document bodies, ordered by ascending document id.
pub trait DocumentCursor: Send {
    fn is_end(&self) -> bool;
    fn next(&mut self);
    fn document_id(&self) -> DocumentId;
    fn body(&self) -> &str;
    fn lower_bound(&mut self, id: DocumentId);
    fn reset(&mut self);
}

/// Per-document lengths, pushed into score calculators and consulted when a
/// capped location count has to be extrapolated.
pub trait DocumentLengthStore: Send + Sync {
    fn document_length(&self, doc: DocumentId) -> Option<u32>;
    fn average_document_length(&self) -> Option<u32> {
        None
    }
}

struct MemoryPosting {
    doc: DocumentId,
    tf: TermFrequency,
    positions: Vec<Position>,
}

struct MemoryListData {
    key: String,
    postings: Vec<MemoryPosting>,
    no_location: bool,
}

/// An in-memory `InvertedIndex` over character n-grams. The reference
/// implementation used by the test suites and small embeddings; real
/// deployments implement the traits over their own storage.
pub struct MemoryIndex {
    gram: usize,
    lists: BTreeMap<String, Arc<MemoryListData>>,
    bodies: Vec<(DocumentId, Arc<str>)>,
    lengths: FxHashMap<DocumentId, u32>,
    last_doc: DocumentId,
    documents: u64,
}

impl MemoryIndex {
    /// A bigram index, the common configuration of n-gram inverted files.
    pub fn new() -> MemoryIndex {
        MemoryIndex::with_gram(2)
    }

    pub fn with_gram(gram: usize) -> MemoryIndex {
        assert!(gram >= 1);
        MemoryIndex {
            gram,
            lists: BTreeMap::new(),
            bodies: Vec::new(),
            lengths: FxHashMap::default(),
            last_doc: 0,
            documents: 0,
        }
    }

    /// Index the body of one document: every n-gram of `body` is posted at
    /// its 1-based character position. Ids must arrive in ascending order.
    pub fn index_document(&mut self, doc: DocumentId, body: &str) {
        assert!(doc > self.last_doc, "documents must be indexed in ascending id order");
        let chars: Vec<char> = body.chars().collect();
        let mut grams: BTreeMap<String, Vec<Position>> = BTreeMap::new();
        if chars.len() >= self.gram {
            for start in 0..=chars.len() - self.gram {
                let gram: String = chars[start..start + self.gram].iter().collect();
                grams.entry(gram).or_default().push(start as Position + 1);
            }
        }
        for (gram, positions) in grams {
            self.push_posting(&gram, doc, positions, false);
        }
        self.bodies.push((doc, Arc::from(body)));
        self.lengths.insert(doc, chars.len() as u32);
        self.last_doc = doc;
        self.documents += 1;
    }

    /// Install a raw inverted list, bypassing n-gram extraction. Handy for
    /// tests that pin exact postings, and for boundary sentinel tokens.
    pub fn insert_list(&mut self, token: &str, postings: Vec<(DocumentId, Vec<Position>)>) {
        for (doc, positions) in postings {
            self.push_posting(token, doc, positions, false);
            self.account_document(doc);
        }
    }

    /// Install a list that keeps frequencies but no positions.
    pub fn insert_no_location_list(
        &mut self,
        token: &str,
        postings: Vec<(DocumentId, TermFrequency)>,
    ) {
        for (doc, tf) in postings {
            let data = self.list_entry(token, true);
            data.postings.push(MemoryPosting { doc, tf, positions: Vec::new() });
            self.account_document(doc);
        }
    }

    /// Record a document length without indexing a body.
    pub fn set_document_length(&mut self, doc: DocumentId, length: u32) {
        self.lengths.insert(doc, length);
    }

    fn account_document(&mut self, doc: DocumentId) {
        if doc > self.last_doc {
            self.last_doc = doc;
            self.documents += 1;
        }
    }

    fn push_posting(
        &mut self,
        token: &str,
        doc: DocumentId,
        positions: Vec<Position>,
        no_location: bool,
    ) {
        let tf = positions.len() as TermFrequency;
        let data = self.list_entry(token, no_location);
        data.postings.push(MemoryPosting { doc, tf, positions });
    }

    fn list_entry(&mut self, token: &str, no_location: bool) -> &mut MemoryListData {
        let entry = self.lists.entry(token.to_string()).or_insert_with(|| {
            Arc::new(MemoryListData {
                key: token.to_string(),
                postings: Vec::new(),
                no_location,
            })
        });
        Arc::get_mut(entry).expect("memory index mutated while shared")
    }
}

impl Default for MemoryIndex {
    fn default() -> MemoryIndex {
        MemoryIndex::new()
    }
}

impl InvertedIndex for MemoryIndex {
    fn inverted_list(&self, token: &str) -> Result<Option<Box<dyn InvertedList>>> {
        Ok(self
            .lists
            .get(token)
            .map(|data| Box::new(MemoryList { data: data.clone() }) as Box<dyn InvertedList>))
    }

    fn document_frequency(&self) -> u64 {
        self.documents
    }

    fn last_document_id(&self) -> DocumentId {
        self.last_doc
    }

    fn split_term(&self, term: &str) -> Vec<(Position, String)> {
        let chars: Vec<char> = term.chars().collect();
        if chars.len() < self.gram {
            return Vec::new();
        }
        (0..=chars.len() - self.gram)
            .map(|start| {
                let gram: String = chars[start..start + self.gram].iter().collect();
                (start as Position + 1, gram)
            })
            .collect()
    }

    fn expand_short_term(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .lists
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn document_cursor(&self) -> Result<Box<dyn DocumentCursor>> {
        Ok(Box::new(MemoryDocumentCursor { bodies: self.bodies.clone(), index: 0 }))
    }
}

impl DocumentLengthStore for MemoryIndex {
    fn document_length(&self, doc: DocumentId) -> Option<u32> {
        self.lengths.get(&doc).copied()
    }

    fn average_document_length(&self) -> Option<u32> {
        if self.lengths.is_empty() {
            return None;
        }
        let total: u64 = self.lengths.values().map(|&l| l as u64).sum();
        Some((total / self.lengths.len() as u64) as u32)
    }
}

struct MemoryList {
    data: Arc<MemoryListData>,
}

impl InvertedList for MemoryList {
    fn key(&self) -> &str {
        &self.data.key
    }

    fn document_frequency(&self) -> u64 {
        self.data.postings.len() as u64
    }

    fn last_document_id(&self) -> DocumentId {
        self.data.postings.last().map(|p| p.doc).unwrap_or(0)
    }

    fn is_no_location(&self) -> bool {
        self.data.no_location
    }

    fn begin(&self) -> Box<dyn PostingIterator> {
        Box::new(MemoryPostingIterator { data: self.data.clone(), index: 0 })
    }
}

struct MemoryPostingIterator {
    data: Arc<MemoryListData>,
    index: usize,
}

impl PostingIterator for MemoryPostingIterator {
    fn is_end(&self) -> bool {
        self.index >= self.data.postings.len()
    }

    fn next(&mut self) {
        if self.index < self.data.postings.len() {
            self.index += 1;
        }
    }

    fn document_id(&self) -> DocumentId {
        self.data
            .postings
            .get(self.index)
            .map(|p| p.doc)
            .unwrap_or(UPPER_BOUND_DOC_ID)
    }

    fn term_frequency(&self) -> TermFrequency {
        self.data.postings.get(self.index).map(|p| p.tf).unwrap_or(0)
    }

    fn locations(&self, length: Position) -> Box<dyn LocationIterator> {
        let positions = self
            .data
            .postings
            .get(self.index)
            .map(|p| p.positions.clone())
            .unwrap_or_default();
        Box::new(VecLocationIterator::new(positions, length))
    }

    fn lower_bound(&mut self, id: DocumentId) {
        // postings are sorted by doc id, jump with a partition point
        let postings = &self.data.postings;
        if self.index < postings.len() && postings[self.index].doc >= id {
            return;
        }
        self.index = postings.partition_point(|p| p.doc < id);
    }

    fn reset(&mut self) {
        self.index = 0;
    }
}

struct MemoryDocumentCursor {
    bodies: Vec<(DocumentId, Arc<str>)>,
    index: usize,
}

impl DocumentCursor for MemoryDocumentCursor {
    fn is_end(&self) -> bool {
        self.index >= self.bodies.len()
    }

    fn next(&mut self) {
        if self.index < self.bodies.len() {
            self.index += 1;
        }
    }

    fn document_id(&self) -> DocumentId {
        self.bodies
            .get(self.index)
            .map(|(doc, _)| *doc)
            .unwrap_or(UPPER_BOUND_DOC_ID)
    }

    fn body(&self) -> &str {
        self.bodies.get(self.index).map(|(_, body)| &**body).unwrap_or("")
    }

    fn lower_bound(&mut self, id: DocumentId) {
        if self.index < self.bodies.len() && self.bodies[self.index].0 >= id {
            return;
        }
        self.index = self.bodies.partition_point(|(doc, _)| *doc < id);
    }

    fn reset(&mut self) {
        self.index = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_with(docs: &[(DocumentId, &str)]) -> MemoryIndex {
        let mut index = MemoryIndex::new();
        for (doc, body) in docs {
            index.index_document(*doc, body);
        }
        index
    }

    #[test]
    fn bigrams_are_posted_with_positions() {
        let index = index_with(&[(1, "abcab")]);
        let list = index.inverted_list("ab").unwrap().unwrap();
        assert_eq!(list.document_frequency(), 1);
        let mut it = list.begin();
        assert_eq!(it.document_id(), 1);
        assert_eq!(it.term_frequency(), 2);
        let mut locations = it.locations(2);
        assert_eq!(locations.location(), 1);
        locations.next();
        assert_eq!(locations.location(), 4);
        it.next();
        assert!(it.is_end());
        assert_eq!(it.document_id(), UPPER_BOUND_DOC_ID);
    }

    #[test]
    fn posting_lower_bound_jumps_and_stays() {
        let mut index = MemoryIndex::new();
        index.insert_list("tk", vec![(2, vec![1]), (5, vec![1]), (9, vec![1])]);
        let list = index.inverted_list("tk").unwrap().unwrap();
        let mut it = list.begin();
        it.lower_bound(4);
        assert_eq!(it.document_id(), 5);
        // never moves backwards
        it.lower_bound(1);
        assert_eq!(it.document_id(), 5);
        it.lower_bound(10);
        assert!(it.is_end());
        it.reset();
        assert_eq!(it.document_id(), 2);
    }

    #[test]
    fn split_term_matches_indexing() {
        let index = index_with(&[(1, "abcd")]);
        assert_eq!(
            index.split_term("bcd"),
            vec![(1, "bc".to_string()), (2, "cd".to_string())]
        );
        assert!(index.split_term("b").is_empty());
    }

    #[test]
    fn short_terms_expand_to_matching_grams() {
        let index = index_with(&[(1, "abcd"), (2, "axyz")]);
        let expanded = index.expand_short_term("a").unwrap();
        assert_eq!(expanded, vec!["ab".to_string(), "ax".to_string()]);
    }

    #[test]
    fn document_cursor_walks_bodies() {
        let index = index_with(&[(1, "first"), (4, "fourth")]);
        let mut cursor = index.document_cursor().unwrap();
        cursor.lower_bound(2);
        assert_eq!(cursor.document_id(), 4);
        assert_eq!(cursor.body(), "fourth");
    }

    #[test]
    fn lengths_feed_the_store() {
        let index = index_with(&[(1, "ab"), (2, "abcdef")]);
        assert_eq!(index.document_length(1), Some(2));
        assert_eq!(index.document_length(3), None);
        assert_eq!(index.average_document_length(), Some(4));
    }
}
