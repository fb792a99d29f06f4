use std::path::{Path, PathBuf};

use crate::{TranscriptionEngine, TranscriptionResult, TranscriptionSegment};

use super::cache::CachedInference;
use super::decoding::{DecodingOptions, DecodingTask, Task};
use super::features;
use super::model::{WhisperError, WhisperModel};
use super::tokenizer::Tokenizer;

/// Quantization type for Whisper model loading.
///
/// Controls the precision/performance trade-off for the loaded model.
/// Int8 quantization provides faster inference at the cost of some accuracy.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum QuantizationType {
    /// Full precision ONNX models (`encoder.onnx`, `decoder.onnx`)
    #[default]
    FP32,
    /// 8-bit integer quantized models (`*.int8.onnx`)
    Int8,
}

/// Parameters for loading a Whisper model.
#[derive(Debug, Clone, Default)]
pub struct WhisperModelParams {
    /// The quantization type to use for the model.
    pub quantization: QuantizationType,
}

impl WhisperModelParams {
    /// Create parameters for full precision (FP32) model loading.
    pub fn fp32() -> Self {
        Self {
            quantization: QuantizationType::FP32,
        }
    }

    /// Create parameters for Int8 quantized model loading.
    pub fn int8() -> Self {
        Self {
            quantization: QuantizationType::Int8,
        }
    }
}

/// Parameters for Whisper inference.
#[derive(Debug, Clone)]
pub struct WhisperInferenceParams {
    /// Language code, name, or alias (`"en"`, `"english"`, ...). `None`
    /// falls back to English on multilingual models.
    pub language: Option<String>,
    /// Transcribe in the source language or translate to English.
    pub task: Task,
    /// Sampling temperature. 0 decodes deterministically.
    pub temperature: f64,
    /// Beam width; `None` uses greedy decoding.
    pub beam_size: Option<usize>,
    /// Finished-candidate budget multiplier for beam search.
    pub patience: Option<f64>,
    /// Length-normalization exponent in `[0, 1]` for candidate ranking.
    pub length_penalty: Option<f64>,
    /// Number of independent samples when temperature > 0.
    pub best_of: Option<usize>,
    /// Cap on generated tokens per 30 s chunk.
    pub sample_len: Option<usize>,
    /// RNG seed for the sampling paths.
    pub seed: Option<u64>,
}

impl Default for WhisperInferenceParams {
    fn default() -> Self {
        Self {
            language: None,
            task: Task::Transcribe,
            temperature: 0.0,
            beam_size: None,
            patience: None,
            length_penalty: None,
            best_of: None,
            sample_len: None,
            seed: None,
        }
    }
}

impl WhisperInferenceParams {
    fn to_options(&self) -> DecodingOptions {
        DecodingOptions {
            task: self.task,
            language: self.language.clone(),
            temperature: self.temperature,
            sample_len: self.sample_len,
            best_of: self.best_of,
            beam_size: self.beam_size,
            patience: self.patience,
            length_penalty: self.length_penalty,
            without_timestamps: true,
            seed: self.seed,
            ..Default::default()
        }
    }
}

/// Whisper ONNX transcription engine with a native decoding loop.
///
/// Implements the `TranscriptionEngine` trait. Audio is processed in 30 s
/// chunks; each chunk is encoded once and decoded autoregressively.
pub struct WhisperEngine {
    loaded_model_path: Option<PathBuf>,
    model: Option<WhisperModel>,
    tokenizer: Option<Tokenizer>,
}

impl WhisperEngine {
    /// Create a new Whisper engine (model not loaded).
    pub fn new() -> Self {
        Self {
            loaded_model_path: None,
            model: None,
            tokenizer: None,
        }
    }
}

impl Default for WhisperEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WhisperEngine {
    fn drop(&mut self) {
        self.unload_model();
    }
}

impl TranscriptionEngine for WhisperEngine {
    type InferenceParams = WhisperInferenceParams;
    type ModelParams = WhisperModelParams;

    fn load_model_with_params(
        &mut self,
        model_path: &Path,
        params: Self::ModelParams,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.unload_model();

        let quantized = matches!(params.quantization, QuantizationType::Int8);
        let model = WhisperModel::new(model_path, quantized)?;

        let tokenizer_path = model_path.join("tokenizer.json");
        if !tokenizer_path.exists() {
            return Err(Box::new(WhisperError::TokenizerNotFound(
                tokenizer_path.display().to_string(),
            )));
        }
        let tokenizer = Tokenizer::from_file(&tokenizer_path, model.dims().is_multilingual())?;

        self.model = Some(model);
        self.tokenizer = Some(tokenizer);
        self.loaded_model_path = Some(model_path.to_path_buf());

        log::info!("Loaded Whisper model from {:?}", model_path);
        Ok(())
    }

    fn unload_model(&mut self) {
        if self.model.is_some() {
            log::debug!("Unloading Whisper model");
            self.model = None;
            self.tokenizer = None;
            self.loaded_model_path = None;
        }
    }

    fn transcribe_samples(
        &mut self,
        samples: Vec<f32>,
        params: Option<Self::InferenceParams>,
    ) -> Result<TranscriptionResult, Box<dyn std::error::Error>> {
        let model = self.model.as_mut().ok_or(WhisperError::ModelNotLoaded)?;
        let tokenizer = self
            .tokenizer
            .as_ref()
            .ok_or(WhisperError::ModelNotLoaded)?;

        let params = params.unwrap_or_default();
        let options = params.to_options();
        let dims = model.dims().clone();

        let total_seconds = samples.len() as f32 / features::SAMPLE_RATE as f32;
        log::debug!(
            "Transcribing {} samples ({:.2}s), language={:?}, beam_size={:?}, temperature={}",
            samples.len(),
            total_seconds,
            params.language,
            params.beam_size,
            params.temperature,
        );

        let mut segments = Vec::new();
        let mut texts = Vec::new();

        for (chunk_index, chunk) in samples.chunks(features::N_SAMPLES).enumerate() {
            let padded = features::pad_or_trim(chunk);
            let mel = features::log_mel_spectrogram(&padded, dims.n_mels);
            let (n_mels, n_frames) = mel.dim();
            let mel = mel.into_shape_with_order((1, n_mels, n_frames))?;

            let audio_features = model.encode(&mel)?;

            let mut task = DecodingTask::new(&dims, tokenizer, options.clone())?;
            let mut inference = CachedInference::new(model, task.initial_token_length());
            let results = task.run(&mut inference, &audio_features)?;
            let result = results
                .into_iter()
                .next()
                .ok_or(WhisperError::BatchMismatch {
                    expected: 1,
                    actual: 0,
                })?;

            let start = chunk_index as f32 * features::CHUNK_LENGTH as f32;
            let end = start + chunk.len() as f32 / features::SAMPLE_RATE as f32;
            log::debug!(
                "Chunk {} [{:.2}s - {:.2}s]: avg_logprob={:.3}, no_speech_prob={:.3}",
                chunk_index,
                start,
                end,
                result.avg_logprob,
                result.no_speech_prob,
            );

            if !result.text.is_empty() {
                segments.push(TranscriptionSegment {
                    start,
                    end,
                    text: result.text.clone(),
                });
                texts.push(result.text);
            }
        }

        Ok(TranscriptionResult {
            text: texts.join(" "),
            segments: Some(segments),
        })
    }
}
