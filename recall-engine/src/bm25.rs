//! Okapi BM25 over the tokenized memory corpus.
//!
//! The index mirrors the metadata list positionally: document `i` scores at
//! position `i` of the output, and the engine's `position -> id` table maps
//! positions back to memory ids. The index is cheap to build and is fully
//! rebuilt on any text-mutating write rather than updated incrementally.

const K1: f64 = 1.5;
const B: f64 = 0.75;
const EPSILON: f64 = 0.25;

use std::collections::HashMap;

/// Per-document term frequencies plus corpus statistics.
#[derive(Debug)]
pub struct Bm25Index {
    doc_term_freqs: Vec<HashMap<String, usize>>,
    doc_lengths: Vec<usize>,
    avg_doc_length: f64,
    idf: HashMap<String, f64>,
}

impl Bm25Index {
    /// Build from a tokenized corpus. Empty corpora are representable but the
    /// engine keeps `None` instead, so callers never score an empty index.
    pub fn new(corpus: &[Vec<String>]) -> Self {
        let doc_count = corpus.len();
        let mut doc_term_freqs = Vec::with_capacity(doc_count);
        let mut doc_lengths = Vec::with_capacity(doc_count);
        let mut doc_freqs: HashMap<String, usize> = HashMap::new();

        for document in corpus {
            let mut freqs: HashMap<String, usize> = HashMap::new();
            for token in document {
                *freqs.entry(token.clone()).or_insert(0) += 1;
            }
            for token in freqs.keys() {
                *doc_freqs.entry(token.clone()).or_insert(0) += 1;
            }
            doc_lengths.push(document.len());
            doc_term_freqs.push(freqs);
        }

        let total_len: usize = doc_lengths.iter().sum();
        let avg_doc_length = if doc_count > 0 {
            total_len as f64 / doc_count as f64
        } else {
            0.0
        };

        // Okapi IDF with the rank_bm25-style epsilon floor: terms appearing
        // in most documents get a small positive weight instead of a
        // negative one.
        let n = doc_count as f64;
        let mut idf: HashMap<String, f64> = HashMap::new();
        let mut idf_sum = 0.0;
        let mut negative: Vec<String> = Vec::new();
        for (token, &df) in &doc_freqs {
            let value = ((n - df as f64 + 0.5) / (df as f64 + 0.5)).ln();
            idf_sum += value;
            if value < 0.0 {
                negative.push(token.clone());
            }
            idf.insert(token.clone(), value);
        }
        let avg_idf = if idf.is_empty() {
            0.0
        } else {
            idf_sum / idf.len() as f64
        };
        let floor = EPSILON * avg_idf;
        for token in negative {
            idf.insert(token, floor);
        }

        Self {
            doc_term_freqs,
            doc_lengths,
            avg_doc_length,
            idf,
        }
    }

    pub fn len(&self) -> usize {
        self.doc_term_freqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_term_freqs.is_empty()
    }

    /// Score every corpus position against the query tokens.
    pub fn scores(&self, query_tokens: &[String]) -> Vec<f64> {
        let mut scores = vec![0.0; self.doc_term_freqs.len()];
        if self.avg_doc_length == 0.0 {
            return scores;
        }
        for token in query_tokens {
            let Some(&idf) = self.idf.get(token) else {
                continue;
            };
            for (position, freqs) in self.doc_term_freqs.iter().enumerate() {
                let tf = *freqs.get(token).unwrap_or(&0) as f64;
                if tf == 0.0 {
                    continue;
                }
                let length_norm =
                    1.0 - B + B * (self.doc_lengths[position] as f64 / self.avg_doc_length);
                scores[position] += idf * (tf * (K1 + 1.0)) / (tf + K1 * length_norm);
            }
        }
        scores
    }
}

/// The corpus tokenization used everywhere: lowercase, split on whitespace.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(str::to_owned)
        .collect()
}
