pub mod audio;
pub mod backends;
pub mod config_loader;
pub mod controller;
pub mod engine;
pub mod error;
pub mod memo;
pub mod playlist;
pub mod prefetch;
pub mod segmenter;
pub mod speech;
pub mod voice;

pub use audio::{AudioPlayer, Paused, PlaybackParams, Playing};
pub use backends::{InferenceEngine, PcmBuffer, Phonemizer, Phrase};
pub use controller::SpeechEvents;
pub use error::{Result, SpeechError};
pub use segmenter::{segment, Unit};
pub use speech::{EngineConfig, SpeakOptions, Speech, Synthesizer};
