//! Speech recognition engines for transcription.
//!
//! This module contains implementations of speech recognition engines that
//! can be used for audio transcription. Each engine has its own requirements
//! for model formats and provides different capabilities.
//!
//! # Available Engines
//!
//! - `whisper` - OpenAI's Whisper (ONNX format) with native greedy and
//!   beam-search decoding

pub mod whisper;
