// Feature Extraction
// Hashed unigram/bigram term frequencies over the shared model normalization

use serde::{Deserialize, Serialize};

use crate::services::text_processor::model_ngrams;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(s: &str) -> u64 {
    s.bytes()
        .fold(FNV_OFFSET, |h, b| (h ^ b as u64).wrapping_mul(FNV_PRIME))
}

/// Sparse, L2-normalized feature vector; entries sorted by bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub dim: usize,
    pub entries: Vec<(usize, f64)>,
}

impl FeatureVector {
    /// The only way to build model input from text, for inference and training alike.
    pub fn from_text(text: &str, dim: usize) -> Self {
        let dim = dim.max(1);
        let mut counts: Vec<(usize, f64)> = Vec::new();
        for gram in model_ngrams(text) {
            let bucket = (fnv1a(&gram) % dim as u64) as usize;
            match counts.binary_search_by_key(&bucket, |(b, _)| *b) {
                Ok(i) => counts[i].1 += 1.0,
                Err(i) => counts.insert(i, (bucket, 1.0)),
            }
        }

        let norm = counts.iter().map(|(_, v)| v * v).sum::<f64>().sqrt();
        if norm > 0.0 {
            for (_, v) in counts.iter_mut() {
                *v /= norm;
            }
        }

        Self { dim, entries: counts }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn buckets(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries.iter().map(|(b, _)| *b)
    }

    pub fn dot(&self, weights: &[f64]) -> f64 {
        self.entries
            .iter()
            .filter_map(|(b, v)| weights.get(*b).map(|w| w * v))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_text_same_features() {
        let a = FeatureVector::from_text("What is VENUE?", 512);
        let b = FeatureVector::from_text("what is venue ?", 512);
        assert_eq!(a, b);
    }

    #[test]
    fn test_features_are_normalized() {
        let fv = FeatureVector::from_text("The court has power over the parties", 1024);
        let norm: f64 = fv.entries.iter().map(|(_, v)| v * v).sum();
        assert!((norm - 1.0).abs() < 1e-9);
        assert!(fv.buckets().all(|b| b < 1024));
    }

    #[test]
    fn test_empty_text() {
        let fv = FeatureVector::from_text("  --  ", 64);
        assert!(fv.is_empty());
        assert_eq!(fv.dot(&[1.0; 64]), 0.0);
    }
}
