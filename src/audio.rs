//! WAV file ingestion with format validation.
//!
//! All engines consume mono 16 kHz 16-bit PCM audio as normalized `f32`
//! samples; this module reads and validates WAV files into that form.

use std::path::Path;

/// Errors raised while reading or validating a WAV file.
#[derive(thiserror::Error, Debug)]
pub enum AudioError {
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
    #[error("Unsupported sample rate: {0} Hz (expected 16000 Hz)")]
    SampleRate(u32),
    #[error("Unsupported channel count: {0} (expected mono)")]
    Channels(u16),
    #[error("Unsupported bit depth: {0} (expected 16-bit PCM)")]
    BitDepth(u16),
}

/// Read a WAV file into normalized f32 samples in `[-1.0, 1.0]`.
///
/// The file must be 16 kHz, mono, 16-bit PCM.
pub fn read_wav_samples(path: &Path) -> Result<Vec<f32>, AudioError> {
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();

    if spec.sample_rate != 16000 {
        return Err(AudioError::SampleRate(spec.sample_rate));
    }
    if spec.channels != 1 {
        return Err(AudioError::Channels(spec.channels));
    }
    if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        return Err(AudioError::BitDepth(spec.bits_per_sample));
    }

    let samples: Result<Vec<f32>, _> = reader
        .into_samples::<i16>()
        .map(|s| s.map(|v| v as f32 / 32768.0))
        .collect();

    let samples = samples?;
    log::debug!(
        "Read {} samples ({:.2}s) from {:?}",
        samples.len(),
        samples.len() as f32 / 16000.0,
        path
    );

    Ok(samples)
}
