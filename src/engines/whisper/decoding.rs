//! Autoregressive token decoding: greedy and beam-search strategies, the
//! decoding controller, and length-penalized candidate ranking.
//!
//! One `DecodingTask` drives one end-to-end decode for a batch of
//! utterances: score the current tokens, filter the logits, let the decoder
//! strategy pick the next token per row, propagate any beam reordering into
//! the KV cache, and finally rank the finished candidates.

use ndarray::{s, Array2, Array3, ArrayD, ArrayView1, Axis};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;

use super::filters::{LogitFilter, SuppressBlank, SuppressTokens};
use super::model::{ModelDims, WhisperError};
use super::tokenizer::{resolve_language, Tokenizer};

/// What the model is asked to do with the audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Task {
    #[default]
    Transcribe,
    Translate,
}

/// Options for one decoding run.
#[derive(Debug, Clone)]
pub struct DecodingOptions {
    /// Transcribe or translate-to-English.
    pub task: Task,
    /// Language code, name, or alias. Multilingual models default to `en`.
    pub language: Option<String>,
    /// 0 selects the argmax deterministically; above 0 samples from the
    /// temperature-scaled distribution.
    pub temperature: f64,
    /// Cap on generated tokens. Defaults to half the text context.
    pub sample_len: Option<usize>,
    /// Number of independent samples per utterance (requires temperature > 0).
    pub best_of: Option<usize>,
    /// Beam width; enables beam search.
    pub beam_size: Option<usize>,
    /// Multiplied by `beam_size` to derive how many finished candidates to
    /// collect before stopping. Requires `beam_size`.
    pub patience: Option<f64>,
    /// Exponent in `[0, 1]` for Google-NMT style length normalization when
    /// ranking candidates. `None` normalizes by plain length.
    pub length_penalty: Option<f64>,
    /// Context tokens placed before the start-of-transcript sequence.
    pub prompt: Option<Vec<i64>>,
    /// Forced decode prefix tokens placed after the sot sequence.
    pub prefix: Option<Vec<i64>>,
    /// Suppress a lone space or immediate end token at the first sampled
    /// position.
    pub suppress_blank: bool,
    /// Token IDs to ban. The sentinel `-1` expands to the tokenizer's
    /// non-speech set. `None` means `[-1]`.
    pub suppress_tokens: Option<Vec<i64>>,
    /// Add the no-timestamps marker to the prefix.
    pub without_timestamps: bool,
    /// RNG seed for the sampling paths.
    pub seed: Option<u64>,
}

impl Default for DecodingOptions {
    fn default() -> Self {
        Self {
            task: Task::Transcribe,
            language: None,
            temperature: 0.0,
            sample_len: None,
            best_of: None,
            beam_size: None,
            patience: None,
            length_penalty: None,
            prompt: None,
            prefix: None,
            suppress_blank: true,
            suppress_tokens: None,
            without_timestamps: false,
            seed: None,
        }
    }
}

/// Outcome of one decode for one utterance.
#[derive(Debug, Clone)]
pub struct DecodingResult {
    pub language: String,
    pub tokens: Vec<i64>,
    pub text: String,
    pub avg_logprob: f64,
    pub no_speech_prob: f64,
    pub temperature: f64,
}

/// The scoring function behind the decoding loop.
///
/// `logits` is a full forward pass over the batch; implementations are
/// expected to cache attention keys/values so repeated calls only score the
/// newest position. `rearrange_kv_cache` propagates a beam reordering into
/// that cache.
pub trait Inference {
    fn logits(
        &mut self,
        tokens: &Array2<i64>,
        audio_features: &ArrayD<f32>,
    ) -> Result<Array3<f32>, WhisperError>;

    fn rearrange_kv_cache(&mut self, source_indices: &[usize]) -> Result<(), WhisperError>;

    fn cleanup_caching(&mut self);
}

/// Log-softmax of one logit row, computed in f64 for stable score sums.
fn log_softmax(row: ArrayView1<f32>) -> Vec<f64> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
    let log_sum = row
        .iter()
        .map(|&x| (x as f64 - max).exp())
        .sum::<f64>()
        .ln();
    row.iter().map(|&x| x as f64 - max - log_sum).collect()
}

fn softmax(row: ArrayView1<f32>) -> Vec<f64> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
    let exps: Vec<f64> = row.iter().map(|&x| (x as f64 - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

fn argmax(row: ArrayView1<f32>) -> usize {
    let mut best = 0;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in row.iter().enumerate() {
        if v > best_val {
            best = i;
            best_val = v;
        }
    }
    best
}

/// One step's output from a decoder strategy.
///
/// Cumulative scores are threaded by value through `update` and handed back
/// here rather than hidden in decoder state. `source_indices`, when present,
/// is the row permutation the session must forward to the cache before the
/// next scoring call.
pub struct StepOutcome {
    pub tokens: Array2<i64>,
    pub sum_logprobs: Vec<f64>,
    pub source_indices: Option<Vec<usize>>,
    pub completed: bool,
}

/// Greedy (or temperature-sampled) next-token selection.
pub struct GreedyDecoder {
    temperature: f64,
    eot: i64,
    rng: StdRng,
}

impl GreedyDecoder {
    pub fn new(temperature: f64, eot: i64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            temperature,
            eot,
            rng,
        }
    }

    pub fn update(
        &mut self,
        tokens: &Array2<i64>,
        logits: &Array2<f32>,
        mut sum_logprobs: Vec<f64>,
    ) -> Result<StepOutcome, WhisperError> {
        let n_batch = tokens.nrows();
        let last_col = tokens.ncols() - 1;
        let mut next_tokens = Vec::with_capacity(n_batch);

        for (i, row) in logits.rows().into_iter().enumerate() {
            let sampled = if self.temperature == 0.0 {
                argmax(row)
            } else {
                let scaled: Vec<f64> = softmax(row)
                    .into_iter()
                    .map(|p| p.powf(1.0 / self.temperature))
                    .collect();
                let dist = WeightedIndex::new(&scaled)
                    .map_err(|e| WhisperError::Sampling(e.to_string()))?;
                dist.sample(&mut self.rng)
            };

            // A finished row's score is frozen and its token stays at eot.
            let previous = tokens[[i, last_col]];
            if previous == self.eot {
                next_tokens.push(self.eot);
            } else {
                sum_logprobs[i] += log_softmax(row)[sampled];
                next_tokens.push(sampled as i64);
            }
        }

        let mut new_tokens = Array2::zeros((n_batch, tokens.ncols() + 1));
        new_tokens.slice_mut(s![.., ..tokens.ncols()]).assign(tokens);
        for (i, &t) in next_tokens.iter().enumerate() {
            new_tokens[[i, tokens.ncols()]] = t;
        }

        let completed = next_tokens.iter().all(|&t| t == self.eot);
        Ok(StepOutcome {
            tokens: new_tokens,
            sum_logprobs,
            source_indices: None,
            completed,
        })
    }

    /// Appends one end token to every sequence unconditionally; padding an
    /// already-terminated sequence is harmless.
    pub fn finalize(
        &self,
        tokens: &Array3<i64>,
        sum_logprobs: &Array2<f64>,
    ) -> (Vec<Vec<Vec<i64>>>, Vec<Vec<f64>>) {
        let mut all_tokens = Vec::with_capacity(tokens.len_of(Axis(0)));
        let mut all_scores = Vec::with_capacity(tokens.len_of(Axis(0)));
        for (group, scores) in tokens.outer_iter().zip(sum_logprobs.outer_iter()) {
            let mut candidates = Vec::with_capacity(group.len_of(Axis(0)));
            for seq in group.outer_iter() {
                let mut seq = seq.to_vec();
                seq.push(self.eot);
                candidates.push(seq);
            }
            all_tokens.push(candidates);
            all_scores.push(scores.to_vec());
        }
        (all_tokens, all_scores)
    }
}

/// Bounded per-utterance collection of finished candidate sequences.
///
/// Insertion beyond capacity is rejected, never silently absorbed.
#[derive(Debug, Clone)]
pub struct FinishedSet {
    capacity: usize,
    entries: Vec<(Vec<i64>, f64)>,
}

impl FinishedSet {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    fn try_insert(&mut self, sequence: Vec<i64>, score: f64) -> bool {
        if self.is_full() {
            return false;
        }
        self.entries.push((sequence, score));
        true
    }
}

/// Beam search over `beam_size` parallel hypotheses per utterance.
pub struct BeamSearchDecoder {
    beam_size: usize,
    eot: i64,
    max_candidates: usize,
    finished_sequences: Option<Vec<FinishedSet>>,
}

impl BeamSearchDecoder {
    pub fn new(beam_size: usize, eot: i64, patience: Option<f64>) -> Result<Self, WhisperError> {
        let patience = patience.unwrap_or(1.0);
        let max_candidates = (beam_size as f64 * patience).round() as usize;
        if max_candidates < 1 {
            return Err(WhisperError::InvalidOptions(format!(
                "invalid beam size ({beam_size}) or patience ({patience})"
            )));
        }
        Ok(Self {
            beam_size,
            eot,
            max_candidates,
            finished_sequences: None,
        })
    }

    pub fn reset(&mut self) {
        self.finished_sequences = None;
    }

    pub fn update(
        &mut self,
        tokens: &Array2<i64>,
        logits: &Array2<f32>,
        sum_logprobs: Vec<f64>,
    ) -> Result<StepOutcome, WhisperError> {
        let n_batch = tokens.nrows();
        if n_batch % self.beam_size != 0 {
            return Err(WhisperError::BatchMismatch {
                expected: self.beam_size,
                actual: n_batch,
            });
        }
        let n_audio = n_batch / self.beam_size;

        if self.finished_sequences.is_none() {
            self.finished_sequences =
                Some(vec![FinishedSet::new(self.max_candidates); n_audio]);
        }

        let logprobs: Vec<Vec<f64>> = logits.rows().into_iter().map(log_softmax).collect();

        let mut next_tokens: Vec<Vec<i64>> = Vec::with_capacity(n_batch);
        let mut source_indices: Vec<usize> = Vec::with_capacity(n_batch);
        let mut new_sum_logprobs: Vec<f64> = Vec::with_capacity(n_batch);
        let mut newly_finished: Vec<Vec<(Vec<i64>, f64)>> = Vec::with_capacity(n_audio);

        for i in 0..n_audio {
            // Candidate pool with dict semantics: an identical extended
            // sequence overwrites its score and source but keeps its first
            // insertion position (all beams share a prefix on the first
            // step, so duplicates do occur).
            let mut order: Vec<Vec<i64>> = Vec::new();
            let mut info: HashMap<Vec<i64>, (f64, usize)> = HashMap::new();

            for j in 0..self.beam_size {
                let idx = i * self.beam_size + j;
                let prefix = tokens.row(idx).to_vec();

                let mut ranked: Vec<(usize, f64)> = logprobs[idx]
                    .iter()
                    .copied()
                    .enumerate()
                    .collect();
                ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                for &(token, logprob) in ranked.iter().take(self.beam_size + 1) {
                    let mut sequence = prefix.clone();
                    sequence.push(token as i64);
                    let score = sum_logprobs[idx] + logprob;
                    if !info.contains_key(&sequence) {
                        order.push(sequence.clone());
                    }
                    info.insert(sequence, (score, idx));
                }
            }

            // Stable sort by score descending; ties keep insertion order.
            order.sort_by(|a, b| {
                info[b].0.partial_cmp(&info[a].0).unwrap_or(std::cmp::Ordering::Equal)
            });

            let mut finished_here: Vec<(Vec<i64>, f64)> = Vec::new();
            let mut saved = 0;
            for sequence in &order {
                let (score, source) = info[sequence];
                if *sequence.last().unwrap_or(&-1) == self.eot {
                    // Finished candidates do not consume a beam slot.
                    finished_here.push((sequence.clone(), score));
                } else {
                    new_sum_logprobs.push(score);
                    source_indices.push(source);
                    next_tokens.push(sequence.clone());
                    saved += 1;
                    if saved == self.beam_size {
                        break;
                    }
                }
            }
            newly_finished.push(finished_here);
        }

        if next_tokens.len() != n_batch {
            return Err(WhisperError::BatchMismatch {
                expected: n_batch,
                actual: next_tokens.len(),
            });
        }

        let ncols = tokens.ncols() + 1;
        let new_tokens = Array2::from_shape_vec((n_batch, ncols), next_tokens.concat())?;

        // Merge newly finished candidates, highest score first, capped at
        // max_candidates.
        let finished_sets = self
            .finished_sequences
            .as_mut()
            .unwrap_or_else(|| unreachable!());
        for (set, newly) in finished_sets.iter_mut().zip(newly_finished) {
            for (sequence, score) in newly {
                if !set.try_insert(sequence, score) {
                    break;
                }
            }
        }

        // Search-budget heuristic: a full finished set does not prove the
        // remaining open beams score worse.
        let completed = finished_sets.iter().all(|set| set.is_full());

        Ok(StepOutcome {
            tokens: new_tokens,
            sum_logprobs: new_sum_logprobs,
            source_indices: Some(source_indices),
            completed,
        })
    }

    /// Pads any utterance whose finished set is short of `beam_size` with
    /// its best still-active hypotheses, force-terminated with `eot`.
    pub fn finalize(
        &self,
        preceding_tokens: &Array3<i64>,
        sum_logprobs: &Array2<f64>,
    ) -> (Vec<Vec<Vec<i64>>>, Vec<Vec<f64>>) {
        let n_audio = preceding_tokens.len_of(Axis(0));
        let mut sets = self
            .finished_sequences
            .clone()
            .unwrap_or_else(|| vec![FinishedSet::new(self.max_candidates); n_audio]);

        for (i, set) in sets.iter_mut().enumerate() {
            if set.len() >= self.beam_size {
                continue;
            }
            let scores = sum_logprobs.row(i);
            let mut by_score: Vec<usize> = (0..scores.len()).collect();
            by_score.sort_by(|&a, &b| {
                scores[b].partial_cmp(&scores[a]).unwrap_or(std::cmp::Ordering::Equal)
            });
            for j in by_score {
                let mut sequence = preceding_tokens.slice(s![i, j, ..]).to_vec();
                sequence.push(self.eot);
                set.entries.push((sequence, scores[j]));
                if set.len() >= self.beam_size {
                    break;
                }
            }
        }

        let mut all_tokens = Vec::with_capacity(n_audio);
        let mut all_scores = Vec::with_capacity(n_audio);
        for set in sets {
            let (tokens, scores): (Vec<Vec<i64>>, Vec<f64>) = set.entries.into_iter().unzip();
            all_tokens.push(tokens);
            all_scores.push(scores);
        }
        (all_tokens, all_scores)
    }
}

/// Decoder strategy, chosen once at construction and never re-checked
/// per step.
pub enum TokenDecoder {
    Greedy(GreedyDecoder),
    BeamSearch(BeamSearchDecoder),
}

impl TokenDecoder {
    pub fn reset(&mut self) {
        match self {
            TokenDecoder::Greedy(_) => {}
            TokenDecoder::BeamSearch(beam) => beam.reset(),
        }
    }

    pub fn update(
        &mut self,
        tokens: &Array2<i64>,
        logits: &Array2<f32>,
        sum_logprobs: Vec<f64>,
    ) -> Result<StepOutcome, WhisperError> {
        match self {
            TokenDecoder::Greedy(greedy) => greedy.update(tokens, logits, sum_logprobs),
            TokenDecoder::BeamSearch(beam) => beam.update(tokens, logits, sum_logprobs),
        }
    }

    pub fn finalize(
        &self,
        tokens: &Array3<i64>,
        sum_logprobs: &Array2<f64>,
    ) -> (Vec<Vec<Vec<i64>>>, Vec<Vec<f64>>) {
        match self {
            TokenDecoder::Greedy(greedy) => greedy.finalize(tokens, sum_logprobs),
            TokenDecoder::BeamSearch(beam) => beam.finalize(tokens, sum_logprobs),
        }
    }
}

/// Selects the best finished candidate per utterance by length-normalized
/// cumulative log-probability.
pub struct MaximumLikelihoodRanker {
    length_penalty: Option<f64>,
}

impl MaximumLikelihoodRanker {
    pub fn new(length_penalty: Option<f64>) -> Self {
        Self { length_penalty }
    }

    /// Google NMT penalty `((5 + length) / 6) ^ length_penalty` when
    /// configured, plain length otherwise.
    fn scores(&self, lengths: &[usize], sum_logprobs: &[f64]) -> Vec<f64> {
        lengths
            .iter()
            .zip(sum_logprobs)
            .map(|(&length, &logprob)| {
                let penalty = match self.length_penalty {
                    Some(p) => ((5.0 + length as f64) / 6.0).powf(p),
                    None => length as f64,
                };
                logprob / penalty
            })
            .collect()
    }

    /// Index of the best candidate per utterance; ties break to the first
    /// occurrence.
    pub fn rank(&self, tokens: &[Vec<Vec<i64>>], sum_logprobs: &[Vec<f64>]) -> Vec<usize> {
        tokens
            .iter()
            .zip(sum_logprobs)
            .map(|(candidates, logprobs)| {
                let lengths: Vec<usize> = candidates.iter().map(|c| c.len()).collect();
                let scores = self.scores(&lengths, logprobs);
                let mut best = 0;
                let mut best_score = f64::NEG_INFINITY;
                for (i, &score) in scores.iter().enumerate() {
                    if score > best_score {
                        best = i;
                        best_score = score;
                    }
                }
                best
            })
            .collect()
    }
}

/// One end-to-end decode over a batch of utterances.
pub struct DecodingTask<'a> {
    tokenizer: &'a Tokenizer,
    options: DecodingOptions,
    language: Option<String>,
    n_ctx: usize,
    sample_len: usize,
    n_group: usize,
    initial_tokens: Vec<i64>,
    sample_begin: usize,
    sot_index: usize,
    decoder: TokenDecoder,
    filters: Vec<Box<dyn LogitFilter>>,
    ranker: MaximumLikelihoodRanker,
}

impl<'a> DecodingTask<'a> {
    pub fn new(
        dims: &ModelDims,
        tokenizer: &'a Tokenizer,
        options: DecodingOptions,
    ) -> Result<Self, WhisperError> {
        Self::verify_options(&options)?;

        let language = if tokenizer.is_multilingual() {
            let code = match &options.language {
                Some(language) => resolve_language(language)?,
                None => "en",
            };
            Some(code.to_string())
        } else {
            None
        };

        let n_group = options.beam_size.or(options.best_of).unwrap_or(1);
        let n_ctx = dims.n_text_ctx;
        let sample_len = options.sample_len.unwrap_or(n_ctx / 2);

        let mut sot_sequence = tokenizer.sot_sequence(language.as_deref(), options.task)?;
        if options.without_timestamps {
            sot_sequence.push(tokenizer.no_timestamps);
        }

        let mut initial_tokens = sot_sequence;
        if let Some(prefix) = &options.prefix {
            // The prefix only competes with the token budget when a sample
            // length was given explicitly.
            let tail_start = match options.sample_len {
                Some(requested) => {
                    let max_prefix_len = (n_ctx / 2).saturating_sub(requested);
                    prefix.len().saturating_sub(max_prefix_len)
                }
                None => 0,
            };
            initial_tokens.extend_from_slice(&prefix[tail_start..]);
        }
        if let Some(prompt) = &options.prompt {
            let max_prompt_len = n_ctx / 2 - 1;
            let tail_start = prompt.len().saturating_sub(max_prompt_len);
            let mut with_prompt = vec![tokenizer.sot_prev];
            with_prompt.extend_from_slice(&prompt[tail_start..]);
            with_prompt.extend_from_slice(&initial_tokens);
            initial_tokens = with_prompt;
        }

        let sample_begin = initial_tokens.len();
        let sot_index = initial_tokens
            .iter()
            .position(|&t| t == tokenizer.sot)
            .unwrap_or(0);

        let decoder = match options.beam_size {
            Some(beam_size) => TokenDecoder::BeamSearch(BeamSearchDecoder::new(
                beam_size,
                tokenizer.eot,
                options.patience,
            )?),
            None => TokenDecoder::Greedy(GreedyDecoder::new(
                options.temperature,
                tokenizer.eot,
                options.seed,
            )),
        };

        let mut filters: Vec<Box<dyn LogitFilter>> = Vec::new();
        if options.suppress_blank {
            filters.push(Box::new(SuppressBlank::new(tokenizer, sample_begin)));
        }
        let suppress = Self::suppress_token_set(tokenizer, &options)?;
        if !suppress.is_empty() {
            filters.push(Box::new(SuppressTokens::new(suppress)));
        }

        let ranker = MaximumLikelihoodRanker::new(options.length_penalty);

        Ok(Self {
            tokenizer,
            options,
            language,
            n_ctx,
            sample_len,
            n_group,
            initial_tokens,
            sample_begin,
            sot_index,
            decoder,
            filters,
            ranker,
        })
    }

    /// Length of the fixed prefix (prompt, sot sequence, forced prefix)
    /// every hypothesis starts from.
    pub fn initial_token_length(&self) -> usize {
        self.sample_begin
    }

    fn verify_options(options: &DecodingOptions) -> Result<(), WhisperError> {
        if options.beam_size.is_some() && options.best_of.is_some() {
            return Err(WhisperError::InvalidOptions(
                "beam_size and best_of can't be given together".to_string(),
            ));
        }
        if options.temperature == 0.0 && options.best_of.is_some() {
            return Err(WhisperError::InvalidOptions(
                "best_of with greedy sampling (temperature 0) is not compatible".to_string(),
            ));
        }
        if options.patience.is_some() && options.beam_size.is_none() {
            return Err(WhisperError::InvalidOptions(
                "patience requires beam_size to be given".to_string(),
            ));
        }
        if let Some(penalty) = options.length_penalty {
            if !(0.0..=1.0).contains(&penalty) {
                return Err(WhisperError::InvalidOptions(
                    "length_penalty (alpha) should be a value between 0 and 1".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// The configured ban list plus the markers that must never be
    /// generated, deduplicated and sorted ascending.
    fn suppress_token_set(
        tokenizer: &Tokenizer,
        options: &DecodingOptions,
    ) -> Result<Vec<usize>, WhisperError> {
        let configured = options.suppress_tokens.clone().unwrap_or_else(|| vec![-1]);
        if configured.iter().any(|&t| t < -1) {
            return Err(WhisperError::InvalidOptions(
                "suppress_tokens must be token IDs or the sentinel -1".to_string(),
            ));
        }

        let mut suppress: Vec<i64> = Vec::new();
        if configured.contains(&-1) {
            suppress.extend(configured.iter().filter(|&&t| t >= 0));
            suppress.extend(tokenizer.non_speech_tokens());
        } else {
            suppress.extend(&configured);
        }

        suppress.extend([
            tokenizer.transcribe,
            tokenizer.translate,
            tokenizer.sot,
            tokenizer.sot_prev,
            tokenizer.sot_lm,
        ]);
        suppress.extend(tokenizer.no_speech);

        let mut suppress: Vec<usize> = suppress.into_iter().map(|t| t as usize).collect();
        suppress.sort_unstable();
        suppress.dedup();
        Ok(suppress)
    }

    /// Decode one batch of encoded audio features.
    ///
    /// `audio_features` is `[n_audio, ...]`; one result is returned per
    /// utterance. The inference cache is torn down at the end of the call,
    /// including on error.
    pub fn run<I: Inference>(
        &mut self,
        inference: &mut I,
        audio_features: &ArrayD<f32>,
    ) -> Result<Vec<DecodingResult>, WhisperError> {
        let n_audio = audio_features.shape()[0];
        self.decoder.reset();

        let loop_result = self.main_loop(inference, audio_features, n_audio);
        inference.cleanup_caching();
        let (tokens, sum_logprobs, no_speech_probs) = loop_result?;

        let seq_len = tokens.ncols();
        let tokens = tokens.into_shape_with_order((n_audio, self.n_group, seq_len))?;
        let sum_logprobs = Array2::from_shape_vec((n_audio, self.n_group), sum_logprobs)?;

        let (candidates, scores) = self.decoder.finalize(&tokens, &sum_logprobs);

        // Strip the prompt prefix and cut each candidate at its first eot.
        let eot = self.tokenizer.eot;
        let candidates: Vec<Vec<Vec<i64>>> = candidates
            .into_iter()
            .map(|group| {
                group
                    .into_iter()
                    .map(|seq| {
                        let body = &seq[self.sample_begin.min(seq.len())..];
                        let cut = body.iter().position(|&t| t == eot).unwrap_or(body.len());
                        body[..cut].to_vec()
                    })
                    .collect()
            })
            .collect();

        if candidates.len() != n_audio || scores.len() != n_audio {
            return Err(WhisperError::BatchMismatch {
                expected: n_audio,
                actual: candidates.len().min(scores.len()),
            });
        }

        let selected = self.ranker.rank(&candidates, &scores);

        let mut results = Vec::with_capacity(n_audio);
        for (i, best) in selected.into_iter().enumerate() {
            let tokens = candidates[i][best].clone();
            let sum_logprob = scores[i][best];
            let text = self.tokenizer.decode(&tokens).trim().to_string();
            results.push(DecodingResult {
                // English-only checkpoints decode English; say so.
                language: self.language.clone().unwrap_or_else(|| "en".to_string()),
                avg_logprob: sum_logprob / (tokens.len() as f64 + 1.0),
                tokens,
                text,
                no_speech_prob: no_speech_probs[i],
                temperature: self.options.temperature,
            });
        }
        Ok(results)
    }

    fn main_loop<I: Inference>(
        &mut self,
        inference: &mut I,
        audio_features: &ArrayD<f32>,
        n_audio: usize,
    ) -> Result<(Array2<i64>, Vec<f64>, Vec<f64>), WhisperError> {
        let n_batch = n_audio * self.n_group;

        // Replicate features and the initial prefix across the sample group.
        let audio_features = if self.n_group > 1 {
            let replicated: Vec<usize> = (0..n_audio)
                .flat_map(|i| std::iter::repeat(i).take(self.n_group))
                .collect();
            audio_features.select(Axis(0), &replicated)
        } else {
            audio_features.to_owned()
        };

        let mut tokens =
            Array2::from_shape_fn((n_batch, self.initial_tokens.len()), |(_, j)| {
                self.initial_tokens[j]
            });
        let mut sum_logprobs = vec![0.0f64; n_batch];
        let mut no_speech_probs = vec![f64::NAN; n_audio];

        log::debug!(
            "Decoding: n_audio={}, n_group={}, sample_len={}, prefix_len={}",
            n_audio,
            self.n_group,
            self.sample_len,
            self.sample_begin
        );

        for step in 0..self.sample_len {
            if tokens.nrows() != audio_features.shape()[0] {
                return Err(WhisperError::BatchMismatch {
                    expected: audio_features.shape()[0],
                    actual: tokens.nrows(),
                });
            }

            let logits = inference.logits(&tokens, &audio_features)?;

            if step == 0 {
                if let Some(no_speech) = self.tokenizer.no_speech {
                    // Diagnostic only; decoding decisions never read this.
                    let at_sot = logits.slice(s![.., self.sot_index, ..]);
                    for i in 0..n_audio {
                        let probs = softmax(at_sot.row(i * self.n_group));
                        no_speech_probs[i] =
                            probs.get(no_speech as usize).copied().unwrap_or(f64::NAN);
                    }
                }
            }

            let mut last_logits = logits
                .slice(s![.., logits.len_of(Axis(1)) - 1, ..])
                .to_owned();
            for filter in &self.filters {
                filter.apply(&mut last_logits, &tokens);
            }

            let outcome = self.decoder.update(&tokens, &last_logits, sum_logprobs)?;
            tokens = outcome.tokens;
            sum_logprobs = outcome.sum_logprobs;

            // A step that changed row order must realign the cache exactly
            // once, with one source index per batch row, before the next
            // scoring call.
            if let Some(source_indices) = &outcome.source_indices {
                if source_indices.len() != n_batch {
                    return Err(WhisperError::BatchMismatch {
                        expected: n_batch,
                        actual: source_indices.len(),
                    });
                }
                inference.rearrange_kv_cache(source_indices)?;
            }

            log::trace!(
                "step {}: seq_len={}, completed={}",
                step,
                tokens.ncols(),
                outcome.completed
            );
            if outcome.completed || tokens.ncols() > self.n_ctx {
                break;
            }
        }

        Ok((tokens, sum_logprobs, no_speech_probs))
    }
}
