//! Logit filters applied before every decoding decision.
//!
//! Filters rewrite the current step's logits in registration order and must
//! never change sequence lengths. Suppression writes a large negative
//! sentinel rather than negative infinity so downstream softmax stays
//! finite.

use ndarray::Array2;

use super::tokenizer::Tokenizer;

/// Sentinel score for suppressed vocabulary entries.
pub const SUPPRESS_VALUE: f32 = -1.0e9;

/// A pure rewrite of one step's logits, given the tokens decoded so far.
pub trait LogitFilter {
    fn apply(&self, logits: &mut Array2<f32>, tokens: &Array2<i64>);
}

/// Suppresses the blank continuation (a lone space or an immediate
/// end-of-transcript) at the first sampled position only.
pub struct SuppressBlank {
    suppress: Vec<usize>,
    sample_begin: usize,
}

impl SuppressBlank {
    pub fn new(tokenizer: &Tokenizer, sample_begin: usize) -> Self {
        let mut suppress = Vec::new();
        if let Some(space) = tokenizer.piece_id(" ") {
            suppress.push(space as usize);
        }
        suppress.push(tokenizer.eot as usize);
        Self {
            suppress,
            sample_begin,
        }
    }
}

impl LogitFilter for SuppressBlank {
    fn apply(&self, logits: &mut Array2<f32>, tokens: &Array2<i64>) {
        if tokens.ncols() != self.sample_begin {
            return;
        }
        for mut row in logits.rows_mut() {
            for &id in &self.suppress {
                if id < row.len() {
                    row[id] = SUPPRESS_VALUE;
                }
            }
        }
    }
}

/// Unconditionally suppresses a fixed token set at every step.
pub struct SuppressTokens {
    suppress: Vec<usize>,
}

impl SuppressTokens {
    /// Duplicate IDs are collapsed and the set is kept sorted ascending.
    pub fn new(mut suppress: Vec<usize>) -> Self {
        suppress.sort_unstable();
        suppress.dedup();
        Self { suppress }
    }
}

impl LogitFilter for SuppressTokens {
    fn apply(&self, logits: &mut Array2<f32>, _tokens: &Array2<i64>) {
        for mut row in logits.rows_mut() {
            for &id in &self.suppress {
                if id < row.len() {
                    row[id] = SUPPRESS_VALUE;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppress_tokens_rewrites_every_row() {
        let filter = SuppressTokens::new(vec![3, 1, 3]);
        let mut logits = Array2::from_elem((2, 4), 1.0f32);
        let tokens = Array2::<i64>::zeros((2, 2));

        filter.apply(&mut logits, &tokens);

        for row in logits.rows() {
            assert_eq!(row[0], 1.0);
            assert_eq!(row[1], SUPPRESS_VALUE);
            assert_eq!(row[2], 1.0);
            assert_eq!(row[3], SUPPRESS_VALUE);
        }
    }

    #[test]
    fn suppress_tokens_ignores_out_of_range_ids() {
        let filter = SuppressTokens::new(vec![10]);
        let mut logits = Array2::from_elem((1, 4), 1.0f32);
        let tokens = Array2::<i64>::zeros((1, 1));
        filter.apply(&mut logits, &tokens);
        assert!(logits.iter().all(|&x| x == 1.0));
    }

    #[test]
    fn suppress_blank_only_fires_at_sample_begin() {
        let filter = SuppressBlank {
            suppress: vec![0, 3],
            sample_begin: 2,
        };
        let tokens_at_begin = Array2::<i64>::zeros((1, 2));
        let tokens_later = Array2::<i64>::zeros((1, 3));

        let mut logits = Array2::from_elem((1, 4), 1.0f32);
        filter.apply(&mut logits, &tokens_at_begin);
        assert_eq!(logits[[0, 0]], SUPPRESS_VALUE);
        assert_eq!(logits[[0, 3]], SUPPRESS_VALUE);

        let mut logits = Array2::from_elem((1, 4), 1.0f32);
        filter.apply(&mut logits, &tokens_later);
        assert!(logits.iter().all(|&x| x == 1.0));
    }
}
