use std::path::PathBuf;
use std::time::Instant;

use whisper_ort::{
    engines::whisper::{Task, WhisperEngine, WhisperInferenceParams, WhisperModelParams},
    TranscriptionEngine,
};

fn get_audio_duration(path: &PathBuf) -> Result<f64, Box<dyn std::error::Error>> {
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let duration = reader.duration() as f64 / spec.sample_rate as f64;
    Ok(duration)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut engine = WhisperEngine::new();
    let model_path = PathBuf::from(
        std::env::args()
            .nth(1)
            .unwrap_or_else(|| "models/whisper-tiny".to_string()),
    );
    let wav_path = PathBuf::from(
        std::env::args()
            .nth(2)
            .unwrap_or_else(|| "models/whisper-tiny/test_wavs/en.wav".to_string()),
    );
    let language = std::env::args().nth(3);

    let audio_duration = get_audio_duration(&wav_path)?;
    println!("Audio duration: {:.2}s", audio_duration);

    println!("Using Whisper engine");
    println!("Loading model: {:?}", model_path);

    let load_start = Instant::now();
    engine.load_model_with_params(&model_path, WhisperModelParams::default())?;
    let load_duration = load_start.elapsed();
    println!("Model loaded in {:.2?}", load_duration);

    println!("Transcribing file: {:?}", wav_path);
    let transcribe_start = Instant::now();

    let params = WhisperInferenceParams {
        language,
        task: Task::Transcribe,
        beam_size: Some(5),
        ..Default::default()
    };
    let result = engine.transcribe_file(&wav_path, Some(params))?;
    let transcribe_duration = transcribe_start.elapsed();
    println!("Transcription completed in {:.2?}", transcribe_duration);

    let speedup_factor = audio_duration / transcribe_duration.as_secs_f64();
    println!(
        "Real-time speedup: {:.2}x faster than real-time",
        speedup_factor
    );

    println!("Transcription result:");
    println!("{}", result.text);

    if let Some(segments) = result.segments {
        println!("\nSegments:");
        for segment in segments {
            println!(
                "[{:.2}s - {:.2}s]: {}",
                segment.start, segment.end, segment.text
            );
        }
    }

    engine.unload_model();

    Ok(())
}
