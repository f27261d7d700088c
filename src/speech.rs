//! Public entry point: a [`Synthesizer`] turns text into [`Speech`] sessions.

use crate::audio::{AudioPlayer, PlaybackParams};
use crate::backends::{InferenceEngine, Phonemizer};
use crate::config_loader::Settings;
use crate::controller::{Command, Controller, ControllerSettings, SpeechEvents};
use crate::error::{Result, SpeechError};
use crate::playlist::{Playlist, PlaylistSettings};
use crate::segmenter::Unit;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::debug;

/// Tuning for every session a synthesizer creates.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub paragraph_silence_seconds: f32,
    pub prefetch_phonemes: usize,
    pub phonemize_batch_chars: usize,
    pub seek_debounce: Duration,
    pub default_volume: f32,
    pub default_rate: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl EngineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            paragraph_silence_seconds: settings.paragraph_silence_seconds,
            prefetch_phonemes: settings.prefetch_phonemes,
            phonemize_batch_chars: settings.phonemize_batch_chars,
            seek_debounce: Duration::from_millis(settings.seek_debounce_ms),
            default_volume: settings.default_volume,
            default_rate: settings.default_rate,
        }
    }
}

/// Per-call overrides; `None` falls back to the engine defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SpeakOptions {
    pub speaker_id: Option<u32>,
    pub pitch: Option<f32>,
    pub rate: Option<f32>,
    pub volume: Option<f32>,
}

pub struct Synthesizer {
    phonemizer: Arc<dyn Phonemizer>,
    engine: Arc<dyn InferenceEngine>,
    player: Arc<dyn AudioPlayer>,
    inference_gate: Arc<AsyncMutex<()>>,
    config: EngineConfig,
}

impl Synthesizer {
    pub fn new(
        phonemizer: Arc<dyn Phonemizer>,
        engine: Arc<dyn InferenceEngine>,
        player: Arc<dyn AudioPlayer>,
        config: EngineConfig,
    ) -> Self {
        Self {
            phonemizer,
            engine,
            player,
            inference_gate: Arc::new(AsyncMutex::new(())),
            config,
        }
    }

    /// Prepare a session for `text`. Nothing is synthesized until
    /// [`Speech::play`] is called. Must be called within a tokio runtime.
    pub fn speak(
        &self,
        text: &str,
        options: SpeakOptions,
        events: Arc<dyn SpeechEvents>,
    ) -> Speech {
        let playlist = Playlist::new(
            text,
            self.phonemizer.clone(),
            self.engine.clone(),
            self.inference_gate.clone(),
            PlaylistSettings {
                paragraph_silence_seconds: self.config.paragraph_silence_seconds,
                phonemize_batch_chars: self.config.phonemize_batch_chars,
                speaker_id: options.speaker_id,
            },
        );
        let units = Arc::new(playlist.units().to_vec());
        debug!(target: "speech", units = units.len(), chars = text.chars().count(), "New speech");

        let settings = ControllerSettings {
            params: PlaybackParams {
                pitch: options.pitch,
                rate: options.rate.unwrap_or(self.config.default_rate),
                volume: options.volume.unwrap_or(self.config.default_volume),
            },
            prefetch_phonemes: self.config.prefetch_phonemes,
            seek_debounce: self.config.seek_debounce,
        };
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let controller = Controller::new(
            playlist,
            self.player.clone(),
            events,
            settings,
            command_rx,
            outcome_tx,
        );
        tokio::spawn(controller.run());

        Speech {
            commands: command_tx,
            outcome: outcome_rx,
            units,
        }
    }
}

/// Handle to one speech session.
///
/// Commands are queued and applied in order. Once the session has finished
/// they are ignored. Dropping every clone of the handle cancels the session.
#[derive(Clone)]
pub struct Speech {
    commands: mpsc::UnboundedSender<Command>,
    outcome: watch::Receiver<Option<Result<()>>>,
    units: Arc<Vec<Unit>>,
}

impl Speech {
    /// Start playback and wait for the session to end.
    ///
    /// Resolves `Ok` on natural completion. A stopped session yields
    /// [`SpeechError::Cancelled`]. Calling it again only waits.
    pub async fn play(&self) -> Result<()> {
        self.send(Command::Play);
        let mut outcome = self.outcome.clone();
        let done = outcome.wait_for(Option::is_some).await.map(|r| r.clone());
        match done {
            Ok(Some(result)) => result,
            _ => Err(SpeechError::Cancelled),
        }
    }

    pub fn pause(&self) {
        self.send(Command::Pause);
    }

    pub fn resume(&self) {
        self.send(Command::Resume);
    }

    pub fn cancel(&self) {
        self.send(Command::Cancel);
    }

    /// Skip to the next unit. No-op on the last one.
    pub fn forward(&self) {
        self.send(Command::Forward);
    }

    /// Go back to the previous unit. No-op on the first one.
    pub fn rewind(&self) {
        self.send(Command::Rewind);
    }

    /// Jump to `unit_index`. Out-of-range indices are ignored.
    pub fn seek(&self, unit_index: usize) {
        self.send(Command::Seek(unit_index));
    }

    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!(target: "speech", ?command, "Speech already finished");
        }
    }
}
