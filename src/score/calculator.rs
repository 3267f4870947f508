use std::sync::Arc;

use crate::index::DocumentLengthStore;
use crate::score::ScoreCalculator;
use crate::{DocumentId, DocumentScore, TermFrequency};

/// `tf / (k + tf)` with a neutral query-global factor. The simplest member
/// of the Okapi family: document frequencies do not influence the score.
pub struct OkapiTfScoreCalculator {
    k: f64,
    prepared: DocumentScore,
    average_document_length: u32,
    length_store: Option<Arc<dyn DocumentLengthStore>>,
}

impl OkapiTfScoreCalculator {
    pub fn new(k: f64) -> OkapiTfScoreCalculator {
        OkapiTfScoreCalculator {
            k,
            prepared: 1.0,
            average_document_length: 0,
            length_store: None,
        }
    }
}

impl Default for OkapiTfScoreCalculator {
    fn default() -> OkapiTfScoreCalculator {
        OkapiTfScoreCalculator::new(1.0)
    }
}

impl ScoreCalculator for OkapiTfScoreCalculator {
    fn prepare(&mut self, _total_df: u64, _document_frequency: u64) {
        self.prepared = 1.0;
    }

    fn first_step(&self, tf: TermFrequency, _doc: DocumentId) -> Option<DocumentScore> {
        if tf == 0 {
            return Some(0.0);
        }
        let tf = tf as f64;
        Some(tf / (self.k + tf))
    }

    fn get_prepare_result(&self) -> DocumentScore {
        self.prepared
    }

    fn set_average_document_length(&mut self, length: u32) {
        self.average_document_length = length;
    }

    fn set_document_length_store(&mut self, store: Arc<dyn DocumentLengthStore>) {
        self.length_store = Some(store);
    }

    fn search_document_length(&self, doc: DocumentId) -> Option<u32> {
        self.length_store.as_ref().and_then(|s| s.document_length(doc))
    }

    fn description(&self, with_params: bool) -> String {
        if with_params {
            format!("OkapiTf:{}", self.k)
        } else {
            "OkapiTf".to_string()
        }
    }

    fn boxed_clone(&self) -> Box<dyn ScoreCalculator> {
        Box::new(OkapiTfScoreCalculator {
            k: self.k,
            prepared: self.prepared,
            average_document_length: self.average_document_length,
            length_store: self.length_store.clone(),
        })
    }
}

/// `tf / (k + tf)` with a smoothed idf as the query-global factor:
/// `log(1 + N / df) / log(1 + N)`, bounded to (0, 1].
pub struct OkapiTfIdfScoreCalculator {
    k: f64,
    prepared: DocumentScore,
    average_document_length: u32,
    length_store: Option<Arc<dyn DocumentLengthStore>>,
}

impl OkapiTfIdfScoreCalculator {
    pub fn new(k: f64) -> OkapiTfIdfScoreCalculator {
        OkapiTfIdfScoreCalculator {
            k,
            prepared: 1.0,
            average_document_length: 0,
            length_store: None,
        }
    }
}

impl Default for OkapiTfIdfScoreCalculator {
    fn default() -> OkapiTfIdfScoreCalculator {
        OkapiTfIdfScoreCalculator::new(1.0)
    }
}

impl ScoreCalculator for OkapiTfIdfScoreCalculator {
    fn prepare(&mut self, total_df: u64, document_frequency: u64) {
        if total_df == 0 || document_frequency == 0 {
            self.prepared = 1.0;
            return;
        }
        let n = total_df as f64;
        let df = document_frequency as f64;
        self.prepared = (1.0 + n / df).ln() / (1.0 + n).ln();
    }

    fn first_step(&self, tf: TermFrequency, _doc: DocumentId) -> Option<DocumentScore> {
        if tf == 0 {
            return Some(0.0);
        }
        let tf = tf as f64;
        Some(tf / (self.k + tf))
    }

    fn get_prepare_result(&self) -> DocumentScore {
        self.prepared
    }

    fn set_average_document_length(&mut self, length: u32) {
        self.average_document_length = length;
    }

    fn set_document_length_store(&mut self, store: Arc<dyn DocumentLengthStore>) {
        self.length_store = Some(store);
    }

    fn search_document_length(&self, doc: DocumentId) -> Option<u32> {
        self.length_store.as_ref().and_then(|s| s.document_length(doc))
    }

    fn description(&self, with_params: bool) -> String {
        if with_params {
            format!("OkapiTfIdf:{}", self.k)
        } else {
            "OkapiTfIdf".to_string()
        }
    }

    fn boxed_clone(&self) -> Box<dyn ScoreCalculator> {
        Box::new(OkapiTfIdfScoreCalculator {
            k: self.k,
            prepared: self.prepared,
            average_document_length: self.average_document_length,
            length_store: self.length_store.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn okapi_tf_saturates() {
        let calc = OkapiTfScoreCalculator::new(1.0);
        assert_eq!(calc.first_step(0, 1), Some(0.0));
        assert_eq!(calc.first_step(1, 1), Some(0.5));
        let a = calc.first_step(10, 1).unwrap();
        let b = calc.first_step(100, 1).unwrap();
        assert!(a < b && b < 1.0);
    }

    #[test]
    fn okapi_tf_idf_prepare_is_bounded() {
        let mut calc = OkapiTfIdfScoreCalculator::new(1.0);
        calc.prepare(1000, 1000);
        let common = calc.get_prepare_result();
        calc.prepare(1000, 1);
        let rare = calc.get_prepare_result();
        assert!(common < rare);
        assert!(rare <= 1.0);
        assert!(common > 0.0);
    }

    #[test]
    fn full_score_is_first_step_times_prepared() {
        let mut calc = OkapiTfIdfScoreCalculator::new(1.0);
        calc.prepare(500, 20);
        let score = calc.score(3, 7).unwrap();
        let expected = calc.first_step(3, 7).unwrap() * calc.get_prepare_result();
        assert!((score - expected).abs() < f64::EPSILON);
    }
}
