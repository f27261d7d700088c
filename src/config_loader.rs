use config::{Config, File};
use lazy_static::lazy_static;
use serde::Deserialize;
use std::sync::RwLock;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    // Segmentation / silence
    pub sentence_silence_seconds: f32,
    pub paragraph_silence_seconds: f32,
    // Pipeline tuning
    pub prefetch_phonemes: usize,     // Phoneme budget kept synthesized ahead of playback
    pub phonemize_batch_chars: usize, // Input-size budget per phonemize batch
    pub seek_debounce_ms: u64,        // Grace delay after forward/rewind
    // Playback defaults
    pub default_volume: f32,
    pub default_rate: f32,
    // Backends
    pub espeak_binary: String,
    pub piper_binary: String,
    pub backend_timeout_secs: u64,
    pub voices_dir: String,
}

fn default_voices_dir() -> String {
    dirs::home_dir()
        .map(|h| h.join(".local/share/piper/models"))
        .unwrap_or_else(|| std::path::PathBuf::from("/tmp/piper/models"))
        .to_string_lossy()
        .into_owned()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sentence_silence_seconds: 0.2,
            paragraph_silence_seconds: 0.65,
            prefetch_phonemes: 100,
            phonemize_batch_chars: 1000,
            seek_debounce_ms: 750,
            default_volume: 1.0,
            default_rate: 1.0,
            espeak_binary: "espeak-ng".to_string(),
            piper_binary: "piper".to_string(),
            backend_timeout_secs: 30,
            voices_dir: default_voices_dir(),
        }
    }
}

lazy_static! {
    pub static ref SETTINGS: RwLock<Settings> = RwLock::new(Settings::new().unwrap_or_else(|e| {
        tracing::warn!(target: "config", error = %e, "Falling back to default settings");
        Settings::default()
    }));
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let defaults = Settings::default();
        let builder = Config::builder()
            .set_default("sentence_silence_seconds", defaults.sentence_silence_seconds as f64)?
            .set_default("paragraph_silence_seconds", defaults.paragraph_silence_seconds as f64)?
            .set_default("prefetch_phonemes", defaults.prefetch_phonemes as u64)?
            .set_default("phonemize_batch_chars", defaults.phonemize_batch_chars as u64)?
            .set_default("seek_debounce_ms", defaults.seek_debounce_ms)?
            .set_default("default_volume", defaults.default_volume as f64)?
            .set_default("default_rate", defaults.default_rate as f64)?
            .set_default("espeak_binary", defaults.espeak_binary)?
            .set_default("piper_binary", defaults.piper_binary)?
            .set_default("backend_timeout_secs", defaults.backend_timeout_secs)?
            .set_default("voices_dir", defaults.voices_dir)?
            // Merge with local config file (if exists)
            .add_source(File::with_name("Reader").required(false))
            .add_source(
                File::with_name(&format!(
                    "{}/.config/readaloud-ng/Reader",
                    std::env::var("HOME").unwrap_or_default()
                ))
                .required(false),
            )
            // Merge with environment variables (e.g. READALOUD_PREFETCH_PHONEMES)
            .add_source(config::Environment::with_prefix("READALOUD"));

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.default_volume < 0.0 || self.default_volume > 1.0 {
            return Err(config::ConfigError::Message(format!(
                "Invalid default_volume: {}. Must be between 0.0 and 1.0",
                self.default_volume
            )));
        }
        if self.default_rate <= 0.0 {
            return Err(config::ConfigError::Message(format!(
                "Invalid default_rate: {}. Must be positive",
                self.default_rate
            )));
        }
        if self.sentence_silence_seconds < 0.0 || self.paragraph_silence_seconds < 0.0 {
            return Err(config::ConfigError::Message(
                "silence durations must not be negative".to_string(),
            ));
        }
        if self.phonemize_batch_chars == 0 {
            return Err(config::ConfigError::Message(
                "phonemize_batch_chars must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
