use ndarray::{Array3, ArrayD};
use ort::execution_providers::CPUExecutionProvider;
use ort::inputs;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Errors raised by the Whisper engine.
#[derive(thiserror::Error, Debug)]
pub enum WhisperError {
    #[error("ORT error: {0}")]
    Ort(#[from] ort::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ndarray shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Model file not found: {0}")]
    ModelNotFound(String),
    #[error("Tokenizer file not found: {0}")]
    TokenizerNotFound(String),
    #[error("Model output not found: {0}")]
    OutputNotFound(String),
    #[error("Tokenization error: {0}")]
    Tokenization(String),
    #[error("Invalid decoding options: {0}")]
    InvalidOptions(String),
    #[error("Unknown language: {0}")]
    UnknownLanguage(String),
    #[error("Batch mismatch: expected {expected}, got {actual}")]
    BatchMismatch { expected: usize, actual: usize },
    #[error("Sampling error: {0}")]
    Sampling(String),
    #[error("Model not loaded")]
    ModelNotLoaded,
}

/// Model dimensions, parsed from the `dims.json` shipped next to the ONNX
/// exports.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ModelDims {
    pub n_mels: usize,
    pub n_audio_ctx: usize,
    pub n_audio_state: usize,
    pub n_audio_head: usize,
    pub n_audio_layer: usize,
    pub n_vocab: usize,
    pub n_text_ctx: usize,
    pub n_text_state: usize,
    pub n_text_head: usize,
    pub n_text_layer: usize,
}

impl ModelDims {
    /// Multilingual checkpoints carry the language-token vocabulary;
    /// English-only exports stop at 51864 entries.
    pub fn is_multilingual(&self) -> bool {
        self.n_vocab >= 51865
    }

    /// Per-head dimension of the text decoder.
    pub fn head_dim(&self) -> usize {
        self.n_text_state / self.n_text_head
    }

    pub fn from_file(path: &Path) -> Result<Self, WhisperError> {
        let file = File::open(path)?;
        let json: serde_json::Value = serde_json::from_reader(BufReader::new(file))?;
        // Accept either the bare dims block or a wrapping {"dims": {...}} object.
        let dims_value = match json.get("dims") {
            Some(inner) => inner.clone(),
            None => json,
        };
        Ok(serde_json::from_value(dims_value)?)
    }
}

/// Whisper encoder + merged decoder as ONNX Runtime sessions.
pub struct WhisperModel {
    encoder: Session,
    decoder: Session,
    dims: ModelDims,
}

impl Drop for WhisperModel {
    fn drop(&mut self) {
        log::debug!("Dropping WhisperModel");
    }
}

impl WhisperModel {
    /// Load encoder, decoder, and dimensions from a model directory.
    ///
    /// When `quantized` is set, `*.int8.onnx` variants are preferred.
    pub fn new(model_dir: &Path, quantized: bool) -> Result<Self, WhisperError> {
        let encoder_path = Self::find_model_file(model_dir, "encoder", quantized)?;
        let decoder_path = Self::find_model_file(model_dir, "decoder", quantized)?;

        let dims_path = model_dir.join("dims.json");
        if !dims_path.exists() {
            return Err(WhisperError::ModelNotFound(dims_path.display().to_string()));
        }
        let dims = ModelDims::from_file(&dims_path)?;
        log::info!(
            "Whisper dims: n_vocab={}, n_text_ctx={}, n_text_layer={}, multilingual={}",
            dims.n_vocab,
            dims.n_text_ctx,
            dims.n_text_layer,
            dims.is_multilingual()
        );

        log::info!("Loading Whisper encoder from {:?}...", encoder_path);
        let encoder = Self::init_session(&encoder_path)?;

        log::info!("Loading Whisper decoder from {:?}...", decoder_path);
        let decoder = Self::init_session(&decoder_path)?;

        Ok(Self {
            encoder,
            decoder,
            dims,
        })
    }

    fn find_model_file(dir: &Path, stem: &str, quantized: bool) -> Result<PathBuf, WhisperError> {
        let candidates = if quantized {
            [format!("{stem}.int8.onnx"), format!("{stem}.onnx")]
        } else {
            [format!("{stem}.onnx"), format!("{stem}.int8.onnx")]
        };
        for candidate in &candidates {
            let path = dir.join(candidate);
            if path.exists() {
                return Ok(path);
            }
        }
        Err(WhisperError::ModelNotFound(
            dir.join(format!("{stem}.onnx")).display().to_string(),
        ))
    }

    fn init_session(path: &Path) -> Result<Session, WhisperError> {
        let providers = vec![CPUExecutionProvider::default().build()];

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_execution_providers(providers)?
            .with_parallel_execution(true)?
            .commit_from_file(path)?;

        for input in &session.inputs {
            log::debug!(
                "Model input: name={}, type={:?}",
                input.name,
                input.input_type
            );
        }

        Ok(session)
    }

    pub fn dims(&self) -> &ModelDims {
        &self.dims
    }

    /// Run the audio encoder on a `[batch, n_mels, 3000]` log-mel
    /// spectrogram, producing `[batch, n_audio_ctx, n_audio_state]` features.
    pub fn encode(&mut self, mel: &Array3<f32>) -> Result<ArrayD<f32>, WhisperError> {
        let mel_dyn = mel.clone().into_dyn();
        let inputs = inputs![
            "input_features" => TensorRef::from_array_view(mel_dyn.view())?,
        ];
        let outputs = self.encoder.run(inputs)?;

        let hidden_state = outputs
            .get("last_hidden_state")
            .ok_or_else(|| WhisperError::OutputNotFound("last_hidden_state".to_string()))?
            .try_extract_array::<f32>()?;

        Ok(hidden_state.to_owned())
    }

    /// Mutable access to the merged decoder session for the cached
    /// inference pass.
    pub(crate) fn decoder_session(&mut self) -> &mut Session {
        &mut self.decoder
    }
}
