//! Decoding-loop integration tests against a scripted inference stub.
//!
//! No model files are involved: the stub returns logits from a fixed
//! per-step preference script, which makes the whole controller path
//! (filters, decoder strategy, cache bookkeeping calls, ranking, text
//! decoding) checkable deterministically.

use ndarray::{Array2, Array3, ArrayD, IxDyn};
use std::collections::{HashMap, HashSet};

use whisper_ort::engines::whisper::{
    DecodingOptions, DecodingTask, Inference, ModelDims, Tokenizer, WhisperError,
};

const N_VOCAB: usize = 20;
const EOT: i64 = 10;

fn test_tokenizer() -> Tokenizer {
    build_tokenizer(true)
}

fn build_tokenizer(multilingual: bool) -> Tokenizer {
    let mut vocab = HashMap::new();
    vocab.insert("a".to_string(), 0);
    vocab.insert("b".to_string(), 1);
    vocab.insert("c".to_string(), 2);
    for (i, piece) in [
        "<|endoftext|>",
        "<|startoftranscript|>",
        "<|en|>",
        "<|translate|>",
        "<|transcribe|>",
        "<|startoflm|>",
        "<|startofprev|>",
        "<|nospeech|>",
        "<|notimestamps|>",
    ]
    .iter()
    .enumerate()
    {
        vocab.insert(piece.to_string(), 10 + i as i64);
    }
    let specials: HashSet<i64> = (10..19).collect();
    Tokenizer::from_vocab(vocab, specials, multilingual).unwrap()
}

fn test_dims() -> ModelDims {
    ModelDims {
        n_mels: 80,
        n_audio_ctx: 1500,
        n_audio_state: 384,
        n_audio_head: 6,
        n_audio_layer: 4,
        n_vocab: 51865,
        n_text_ctx: 448,
        n_text_state: 384,
        n_text_head: 6,
        n_text_layer: 4,
    }
}

fn audio_features(n_audio: usize) -> ArrayD<f32> {
    ArrayD::zeros(IxDyn(&[n_audio, 4, 8]))
}

/// Returns the same preference-ranked logits for every batch row and
/// position at each step, and records the cache bookkeeping calls.
struct ScriptedInference {
    script: Vec<Vec<usize>>,
    step: usize,
    rearrange_calls: Vec<Vec<usize>>,
    cleaned_up: bool,
}

impl ScriptedInference {
    fn new(script: Vec<Vec<usize>>) -> Self {
        Self {
            script,
            step: 0,
            rearrange_calls: Vec::new(),
            cleaned_up: false,
        }
    }
}

impl Inference for ScriptedInference {
    fn logits(
        &mut self,
        tokens: &Array2<i64>,
        _audio_features: &ArrayD<f32>,
    ) -> Result<Array3<f32>, WhisperError> {
        let order = &self.script[self.step.min(self.script.len() - 1)];
        self.step += 1;

        let mut row = vec![-10.0f32; N_VOCAB];
        for (rank, &token) in order.iter().enumerate() {
            row[token] = 5.0 - rank as f32;
        }
        Ok(Array3::from_shape_fn(
            (tokens.nrows(), tokens.ncols(), N_VOCAB),
            |(_, _, v)| row[v],
        ))
    }

    fn rearrange_kv_cache(&mut self, source_indices: &[usize]) -> Result<(), WhisperError> {
        self.rearrange_calls.push(source_indices.to_vec());
        Ok(())
    }

    fn cleanup_caching(&mut self) {
        self.cleaned_up = true;
    }
}

#[test]
fn greedy_decodes_scripted_tokens() {
    let tokenizer = test_tokenizer();
    let mut task =
        DecodingTask::new(&test_dims(), &tokenizer, DecodingOptions::default()).unwrap();

    let script = vec![vec![0], vec![1], vec![2], vec![EOT as usize]];
    let mut inference = ScriptedInference::new(script);
    let results = task.run(&mut inference, &audio_features(1)).unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].tokens, vec![0, 1, 2]);
    assert_eq!(results[0].text, "abc");
    assert_eq!(results[0].language, "en");
    assert!(results[0].avg_logprob <= 0.0);
    // Greedy never reorders rows.
    assert!(inference.rearrange_calls.is_empty());
    assert!(inference.cleaned_up);
}

#[test]
fn greedy_runs_are_deterministic_at_zero_temperature() {
    let tokenizer = test_tokenizer();
    let script = vec![vec![2], vec![2], vec![0], vec![EOT as usize]];

    let run = || {
        let mut task =
            DecodingTask::new(&test_dims(), &tokenizer, DecodingOptions::default()).unwrap();
        let mut inference = ScriptedInference::new(script.clone());
        task.run(&mut inference, &audio_features(1)).unwrap()
    };

    let first = run();
    let second = run();
    assert_eq!(first[0].tokens, second[0].tokens);
    assert_eq!(first[0].text, second[0].text);
    assert_eq!(first[0].avg_logprob, second[0].avg_logprob);
}

#[test]
fn sampling_runs_are_deterministic_with_a_seed() {
    let tokenizer = test_tokenizer();
    let script = vec![vec![0, 1, 2], vec![1, 2, 0], vec![EOT as usize, 0, 1]];

    let run = || {
        let options = DecodingOptions {
            temperature: 0.8,
            seed: Some(7),
            ..Default::default()
        };
        let mut task = DecodingTask::new(&test_dims(), &tokenizer, options).unwrap();
        let mut inference = ScriptedInference::new(script.clone());
        task.run(&mut inference, &audio_features(1)).unwrap()
    };

    assert_eq!(run()[0].tokens, run()[0].tokens);
}

#[test]
fn beam_width_one_matches_greedy_end_to_end() {
    let tokenizer = test_tokenizer();
    let script = vec![vec![1], vec![0], vec![2], vec![EOT as usize]];

    let mut greedy_task =
        DecodingTask::new(&test_dims(), &tokenizer, DecodingOptions::default()).unwrap();
    let mut greedy_inference = ScriptedInference::new(script.clone());
    let greedy = greedy_task
        .run(&mut greedy_inference, &audio_features(1))
        .unwrap();

    let beam_options = DecodingOptions {
        beam_size: Some(1),
        ..Default::default()
    };
    let mut beam_task = DecodingTask::new(&test_dims(), &tokenizer, beam_options).unwrap();
    let mut beam_inference = ScriptedInference::new(script);
    let beam = beam_task
        .run(&mut beam_inference, &audio_features(1))
        .unwrap();

    assert_eq!(greedy[0].tokens, beam[0].tokens);
    assert_eq!(greedy[0].text, beam[0].text);
}

#[test]
fn beam_search_selects_the_top_scoring_candidate() {
    let tokenizer = test_tokenizer();
    // Step 1 prefers token 1 over 2; step 2 ends every hypothesis. The
    // winner must be the higher-probability single-token transcript.
    let script = vec![vec![1, 2, 0], vec![EOT as usize, 0, 2]];

    let options = DecodingOptions {
        beam_size: Some(2),
        ..Default::default()
    };
    let mut task = DecodingTask::new(&test_dims(), &tokenizer, options).unwrap();
    let mut inference = ScriptedInference::new(script);
    let results = task.run(&mut inference, &audio_features(1)).unwrap();

    assert_eq!(results[0].tokens, vec![1]);
    assert_eq!(results[0].text, "b");
}

#[test]
fn beam_search_rearranges_the_cache_once_per_step() {
    let tokenizer = test_tokenizer();
    let script = vec![vec![1, 2, 0], vec![0, 2, 1], vec![EOT as usize, 1, 2]];

    let options = DecodingOptions {
        beam_size: Some(2),
        ..Default::default()
    };
    let mut task = DecodingTask::new(&test_dims(), &tokenizer, options).unwrap();
    let mut inference = ScriptedInference::new(script);
    task.run(&mut inference, &audio_features(1)).unwrap();

    // One rearrange per decoding step, one source index per batch row, and
    // every index addresses a row that existed before the step.
    assert_eq!(inference.rearrange_calls.len(), 3);
    for call in &inference.rearrange_calls {
        assert_eq!(call.len(), 2);
        assert!(call.iter().all(|&i| i < 2));
    }
    assert!(inference.cleaned_up);
}

#[test]
fn english_only_models_report_english() {
    let tokenizer = build_tokenizer(false);
    let mut task =
        DecodingTask::new(&test_dims(), &tokenizer, DecodingOptions::default()).unwrap();

    let script = vec![vec![2], vec![EOT as usize]];
    let mut inference = ScriptedInference::new(script);
    let results = task.run(&mut inference, &audio_features(1)).unwrap();

    assert_eq!(results[0].language, "en");
    assert_eq!(results[0].text, "c");
}

#[test]
fn no_speech_probability_is_captured_on_the_first_step() {
    let tokenizer = test_tokenizer();
    let mut task =
        DecodingTask::new(&test_dims(), &tokenizer, DecodingOptions::default()).unwrap();

    let script = vec![vec![0], vec![EOT as usize]];
    let mut inference = ScriptedInference::new(script);
    let results = task.run(&mut inference, &audio_features(1)).unwrap();

    let p = results[0].no_speech_prob;
    assert!((0.0..=1.0).contains(&p), "no_speech_prob {p}");
}

#[test]
fn batched_audio_yields_one_result_per_utterance() {
    let tokenizer = test_tokenizer();
    let mut task =
        DecodingTask::new(&test_dims(), &tokenizer, DecodingOptions::default()).unwrap();

    let script = vec![vec![2], vec![1], vec![EOT as usize]];
    let mut inference = ScriptedInference::new(script);
    let results = task.run(&mut inference, &audio_features(3)).unwrap();

    assert_eq!(results.len(), 3);
    // Identical logits per row give identical transcripts.
    assert!(results.iter().all(|r| r.text == results[0].text));
    assert!(results.iter().all(|r| r.tokens == vec![2, 1]));
}

#[test]
fn prompt_tokens_are_stripped_from_the_transcript() {
    let tokenizer = test_tokenizer();
    let options = DecodingOptions {
        prompt: Some(vec![0, 0, 1]),
        ..Default::default()
    };
    let mut task = DecodingTask::new(&test_dims(), &tokenizer, options).unwrap();

    let script = vec![vec![2], vec![EOT as usize]];
    let mut inference = ScriptedInference::new(script);
    let results = task.run(&mut inference, &audio_features(1)).unwrap();

    assert_eq!(results[0].tokens, vec![2]);
    assert_eq!(results[0].text, "c");
}
