//! Whisper ONNX transcription engine with native token decoding.
//!
//! This module provides a Whisper-based transcription engine built on ONNX
//! Runtime. Unlike wrapper-based engines, the autoregressive decoding loop
//! runs in Rust: greedy or beam-search token selection, logit filtering,
//! key/value caching across steps (with beam reordering), and
//! length-penalized candidate ranking.
//!
//! # Model Architecture
//!
//! Whisper is an encoder-decoder transformer:
//! - The encoder consumes a 30-second log-mel spectrogram and produces
//!   audio features once per chunk
//! - The merged decoder is called once per generated token, reusing cached
//!   attention keys/values for all previously scored positions
//!
//! # Model Format
//!
//! Expects a directory containing:
//! - `encoder.onnx` - Audio encoder (optional `encoder.int8.onnx` variant)
//! - `decoder.onnx` - Merged text decoder with `use_cache_branch` input
//!   (optional `decoder.int8.onnx` variant)
//! - `dims.json` - Model dimensions (vocabulary size, context length, ...)
//! - `tokenizer.json` - HuggingFace-layout byte-level BPE vocabulary
//!
//! # Audio Requirements
//!
//! - Sample rate: 16 kHz
//! - Format: Mono, 16-bit PCM
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::PathBuf;
//! use whisper_ort::{TranscriptionEngine, engines::whisper::{WhisperEngine, WhisperInferenceParams}};
//!
//! let mut engine = WhisperEngine::new();
//! engine.load_model(&PathBuf::from("models/whisper-tiny"))?;
//!
//! let params = WhisperInferenceParams {
//!     language: Some("en".to_string()),
//!     beam_size: Some(5),
//!     ..Default::default()
//! };
//!
//! let result = engine.transcribe_file(&PathBuf::from("audio.wav"), Some(params))?;
//! println!("Transcription: {}", result.text);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod cache;
pub mod decoding;
pub mod engine;
pub mod features;
pub mod filters;
pub mod model;
pub mod tokenizer;

pub use cache::{CachedInference, KVCache};
pub use decoding::{DecodingOptions, DecodingResult, DecodingTask, Inference, Task};
pub use engine::{QuantizationType, WhisperEngine, WhisperInferenceParams, WhisperModelParams};
pub use model::{ModelDims, WhisperError, WhisperModel};
pub use tokenizer::Tokenizer;
