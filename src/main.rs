//! readaloud - speak text with a local Piper voice.
//!
//! While speaking, single-letter commands on stdin control playback.

use clap::{Parser, Subcommand};
use readaloud_ng::backends::espeak::EspeakPhonemizer;
use readaloud_ng::backends::piper::PiperEngine;
use readaloud_ng::config_loader::{self, Settings};
use readaloud_ng::engine::RodioOutput;
use readaloud_ng::voice::VoiceModel;
use readaloud_ng::{segment, EngineConfig, SpeakOptions, Speech, SpeechError, SpeechEvents, Synthesizer};
use std::error::Error;
use std::io::{BufRead, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Read text aloud with a neural TTS voice
#[derive(Parser)]
#[command(name = "readaloud")]
#[command(author = "StarTuz")]
#[command(version)]
#[command(about = "Read text aloud with pause, resume, forward, rewind and seek", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Speak text (argument, file or stdin)
    Speak {
        /// Text to speak
        text: Option<String>,
        /// Voice model (.onnx path, or a name under the voices directory)
        #[arg(short, long)]
        model: String,
        /// Read the text from a file
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Speaker id for multi-speaker voices
        #[arg(short, long)]
        speaker: Option<u32>,
        /// Playback rate (1.0 = normal)
        #[arg(short, long)]
        rate: Option<f32>,
        /// Volume (0.0-1.0)
        #[arg(short, long)]
        volume: Option<f32>,
        /// Pitch (accepted, not applied by the default output)
        #[arg(short, long)]
        pitch: Option<f32>,
    },

    /// Print how text is split into units
    Segment {
        /// Text to split (stdin when omitted)
        text: Option<String>,
    },
}

/// Prints each unit as the cursor reaches it.
struct PrintBoundaries {
    text: Vec<char>,
}

impl SpeechEvents for PrintBoundaries {
    fn on_unit_boundary(&self, start_index: usize, end_index: usize) {
        let end = end_index.min(self.text.len());
        let start = start_index.min(end);
        let unit: String = self.text[start..end].iter().collect();
        println!("[{}..{}) {}", start_index, end_index, unit.trim());
    }

    fn on_error(&self, error: &SpeechError) {
        eprintln!("Error: {}", error);
    }
}

fn read_input(text: Option<String>, file: Option<&Path>) -> std::io::Result<String> {
    if let Some(text) = text {
        return Ok(text);
    }
    if let Some(path) = file {
        return std::fs::read_to_string(path);
    }
    let mut buf = String::new();
    std::io::stdin().read_to_string(&mut buf)?;
    Ok(buf)
}

/// A bare name is looked up in the voices directory.
fn resolve_model(model: &str, settings: &Settings) -> PathBuf {
    let direct = PathBuf::from(model);
    if direct.exists() {
        return direct;
    }
    let mut named = Path::new(&settings.voices_dir).join(model);
    if named.extension().is_none() {
        named.set_extension("onnx");
    }
    named
}

/// Forward stdin lines from a plain thread, which may outlive the runtime
/// without holding up shutdown.
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Apply terminal commands to the session until stdin closes.
async fn control_loop(speech: Speech, mut lines: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = lines.recv().await {
        match line.split_whitespace().collect::<Vec<_>>().as_slice() {
            ["p"] => speech.pause(),
            ["r"] => speech.resume(),
            ["f"] => speech.forward(),
            ["b"] => speech.rewind(),
            ["s", n] => match n.parse::<usize>() {
                Ok(unit) => speech.seek(unit),
                Err(_) => eprintln!("Usage: s <unit>"),
            },
            ["q"] => {
                speech.cancel();
                break;
            }
            [] => {}
            _ => eprintln!("Commands: p (pause), r (resume), f (forward), b (rewind), s N (seek), q (quit)"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,readaloud_ng=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Segment { text } => {
            let text = read_input(text, None)?;
            for (i, unit) in segment(&text).iter().enumerate() {
                println!("{:>4} [{}..{}) {:?}", i, unit.start_index, unit.end_index, unit.text);
            }
        }
        Commands::Speak {
            text,
            model,
            file,
            speaker,
            rate,
            volume,
            pitch,
        } => {
            let settings = config_loader::SETTINGS
                .read()
                .map(|s| s.clone())
                .unwrap_or_default();
            settings.validate()?;

            let text = read_input(text, file.as_deref())?;
            let voice = VoiceModel::load(&resolve_model(&model, &settings))?;
            info!(
                model = %voice.model_path.display(),
                sample_rate = voice.config.sample_rate(),
                "Voice loaded"
            );
            if pitch.is_some() {
                warn!("Pitch is not applied by the audio output");
            }

            let synthesizer = Synthesizer::new(
                Arc::new(EspeakPhonemizer::new(Arc::new(voice.config.clone()))),
                Arc::new(PiperEngine::new(&voice)),
                Arc::new(RodioOutput::new()?),
                EngineConfig::from_settings(&settings),
            );
            let events = Arc::new(PrintBoundaries {
                text: text.chars().collect(),
            });
            let speech = synthesizer.speak(
                &text,
                SpeakOptions {
                    speaker_id: speaker,
                    pitch,
                    rate,
                    volume,
                },
                events,
            );

            let controls = tokio::spawn(control_loop(speech.clone(), stdin_lines()));
            let result = speech.play().await;
            controls.abort();

            match result {
                Ok(()) => info!("Done"),
                Err(e) if e.is_cancellation() => info!("Stopped"),
                Err(e) => return Err(e.into()),
            }
        }
    }

    Ok(())
}
