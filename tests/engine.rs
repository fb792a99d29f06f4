//! End-to-end engine tests against real model files.
//!
//! These exercise the full pipeline (WAV ingestion, mel front-end, ONNX
//! encode, token decoding) and need a model directory plus sample audio on
//! disk. Each test returns early when the files are not present, so the
//! suite stays green on machines without the downloads.

use once_cell::sync::Lazy;
use std::path::PathBuf;
use std::sync::Mutex;
use whisper_ort::engines::whisper::{WhisperEngine, WhisperInferenceParams, WhisperModelParams};
use whisper_ort::TranscriptionEngine;

const MODEL_DIR: &str = "models/whisper-tiny";
const JFK_WAV: &str = "samples/jfk.wav";

fn files_available() -> bool {
    let model = PathBuf::from(MODEL_DIR);
    model.join("encoder.onnx").exists()
        && model.join("decoder.onnx").exists()
        && model.join("dims.json").exists()
        && model.join("tokenizer.json").exists()
        && PathBuf::from(JFK_WAV).exists()
}

// Shared model loaded once for all tests
static MODEL_ENGINE: Lazy<Mutex<WhisperEngine>> = Lazy::new(|| {
    let mut engine = WhisperEngine::new();
    let model_path = PathBuf::from(MODEL_DIR);
    engine
        .load_model_with_params(&model_path, WhisperModelParams::default())
        .expect("Failed to load model");
    Mutex::new(engine)
});

fn get_engine() -> std::sync::MutexGuard<'static, WhisperEngine> {
    MODEL_ENGINE.lock().expect("Failed to lock engine")
}

#[test]
fn test_jfk_transcription() {
    if !files_available() {
        return;
    }
    let mut engine = get_engine();

    let audio_path = PathBuf::from(JFK_WAV);
    let result = engine
        .transcribe_file(&audio_path, None)
        .expect("Failed to transcribe");

    let text = result.text.to_lowercase();
    assert!(
        text.contains("ask not what your country can do for you"),
        "Unexpected transcription: '{}'",
        result.text
    );
}

#[test]
fn test_beam_search_matches_greedy_on_clear_speech() {
    if !files_available() {
        return;
    }
    let mut engine = get_engine();
    let audio_path = PathBuf::from(JFK_WAV);

    let greedy = engine
        .transcribe_file(&audio_path, None)
        .expect("Failed to transcribe greedily");

    let params = WhisperInferenceParams {
        beam_size: Some(5),
        ..Default::default()
    };
    let beam = engine
        .transcribe_file(&audio_path, Some(params))
        .expect("Failed to transcribe with beam search");

    assert!(!beam.text.trim().is_empty());
    // Clean audio should decode to the same words either way.
    assert_eq!(greedy.text.trim(), beam.text.trim());
}

#[test]
fn test_segments_cover_the_audio() {
    if !files_available() {
        return;
    }
    let mut engine = get_engine();

    let result = engine
        .transcribe_file(&PathBuf::from(JFK_WAV), None)
        .expect("Failed to transcribe");

    let segments = result.segments.expect("Transcription should return segments");
    assert!(!segments.is_empty(), "Segments should not be empty");

    for (i, segment) in segments.iter().enumerate() {
        assert!(
            segment.start >= 0.0,
            "Segment {} start time should be non-negative, got {}",
            i,
            segment.start
        );
        assert!(
            segment.end > segment.start,
            "Segment {} end time ({}) should be greater than start time ({})",
            i,
            segment.end,
            segment.start
        );
        assert!(
            !segment.text.trim().is_empty(),
            "Segment {} should have non-empty text",
            i
        );
    }

    for i in 1..segments.len() {
        assert!(
            segments[i].start >= segments[i - 1].start,
            "Segments should be in chronological order"
        );
    }
}
