//! Log-mel spectrogram front-end for the Whisper encoder.

use ndarray::Array2;
use rustfft::{num_complex::Complex, FftPlanner};
use std::f32::consts::PI;

pub const SAMPLE_RATE: u32 = 16000;
pub const N_FFT: usize = 400;
pub const HOP_LENGTH: usize = 160;
pub const CHUNK_LENGTH: usize = 30;
/// Samples per 30 s chunk.
pub const N_SAMPLES: usize = CHUNK_LENGTH * SAMPLE_RATE as usize;
/// Mel frames per 30 s chunk.
pub const N_FRAMES: usize = N_SAMPLES / HOP_LENGTH;

/// Compute the `[n_mels, N_FRAMES]` log-mel spectrogram the encoder expects.
///
/// Samples are 16 kHz mono in [-1.0, 1.0]. The time axis is always padded
/// (with the log floor) or trimmed to exactly `N_FRAMES` columns, so shorter
/// audio still produces a full 30 s input.
pub fn log_mel_spectrogram(samples: &[f32], n_mels: usize) -> Array2<f32> {
    let num_frames = if samples.len() < N_FFT {
        0
    } else {
        1 + (samples.len() - N_FFT) / HOP_LENGTH
    };

    let window = hann_window(N_FFT);
    let mel_banks = mel_filterbank(n_mels, N_FFT, SAMPLE_RATE as f32);

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(N_FFT);
    let num_fft_bins = N_FFT / 2 + 1;

    let mut mel_spec = Array2::zeros((n_mels, num_frames.min(N_FRAMES)));

    for i in 0..num_frames.min(N_FRAMES) {
        let start = i * HOP_LENGTH;

        let mut fft_input: Vec<Complex<f32>> = (0..N_FFT)
            .map(|j| Complex::new(samples[start + j] * window[j], 0.0))
            .collect();
        fft.process(&mut fft_input);

        let power_spectrum: Vec<f32> = fft_input[..num_fft_bins]
            .iter()
            .map(|c| c.norm_sqr())
            .collect();

        for m in 0..n_mels {
            mel_spec[[m, i]] = mel_banks
                .row(m)
                .iter()
                .zip(&power_spectrum)
                .map(|(&w, &p)| w * p)
                .sum();
        }
    }

    // log10 with floor, clamp to 8 below the peak, then scale to roughly
    // [-1, 1].
    let mut log_spec = mel_spec.mapv(|x: f32| x.max(1.0e-10).log10());
    let max = log_spec.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let floor = if max.is_finite() { max - 8.0 } else { -8.0 };
    log_spec.mapv_inplace(|x| (x.max(floor) + 4.0) / 4.0);

    let fill = (floor + 4.0) / 4.0;
    let mut out = Array2::from_elem((n_mels, N_FRAMES), fill);
    let cols = log_spec.ncols();
    out.slice_mut(ndarray::s![.., ..cols]).assign(&log_spec);
    out
}

fn hann_window(length: usize) -> Vec<f32> {
    (0..length)
        .map(|i| {
            let x = (2.0 * PI * i as f32 / length as f32).cos();
            0.5 * (1.0 - x)
        })
        .collect()
}

/// Triangular mel filterbank of shape `[n_mels, n_fft/2 + 1]`, spanning
/// 0 Hz to Nyquist.
///
/// Slaney scale with area-normalized triangles, reproducing the standard
/// Whisper mel filters the encoder was trained against.
fn mel_filterbank(n_mels: usize, n_fft: usize, sample_rate: f32) -> Array2<f32> {
    let num_fft_bins = n_fft / 2 + 1;
    let mel_high = hz_to_mel(sample_rate / 2.0);

    let num_points = n_mels + 2;
    let hz_points: Vec<f32> = (0..num_points)
        .map(|i| mel_to_hz(mel_high * i as f32 / (num_points - 1) as f32))
        .collect();

    let mut banks = Array2::zeros((n_mels, num_fft_bins));
    for m in 0..n_mels {
        let left = hz_points[m];
        let center = hz_points[m + 1];
        let right = hz_points[m + 2];
        // Each triangle integrates to the same band energy.
        let enorm = 2.0 / (right - left);

        for k in 0..num_fft_bins {
            let f = k as f32 * sample_rate / n_fft as f32;
            let lower = (f - left) / (center - left);
            let upper = (right - f) / (right - center);
            banks[[m, k]] = lower.min(upper).max(0.0) * enorm;
        }
    }
    banks
}

// Slaney mel scale: linear below 1 kHz, logarithmic above.
const MEL_F_SP: f32 = 200.0 / 3.0;
const MEL_LOG_HZ: f32 = 1000.0;
const MEL_LOG_MEL: f32 = MEL_LOG_HZ / MEL_F_SP;

fn mel_log_step() -> f32 {
    (6.4f32).ln() / 27.0
}

fn hz_to_mel(hz: f32) -> f32 {
    if hz < MEL_LOG_HZ {
        hz / MEL_F_SP
    } else {
        MEL_LOG_MEL + (hz / MEL_LOG_HZ).ln() / mel_log_step()
    }
}

fn mel_to_hz(mel: f32) -> f32 {
    if mel < MEL_LOG_MEL {
        mel * MEL_F_SP
    } else {
        MEL_LOG_HZ * (mel_log_step() * (mel - MEL_LOG_MEL)).exp()
    }
}

/// Pad with zeros or trim so the chunk covers exactly 30 s of samples.
pub fn pad_or_trim(samples: &[f32]) -> Vec<f32> {
    let mut out = samples.to_vec();
    out.resize(N_SAMPLES, 0.0);
    out
}
