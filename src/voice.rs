//! Piper voice model config (`<voice>.onnx.json`) and phoneme id mapping.

use crate::error::{Result, SpeechError};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::warn;

const PAD: &str = "_";
const BOS: &str = "^";
const EOS: &str = "$";

pub const DEFAULT_SAMPLE_RATE: u32 = 22050;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AudioSection {
    #[serde(default)]
    pub sample_rate: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EspeakSection {
    #[serde(default)]
    pub voice: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InferenceSection {
    #[serde(default)]
    pub noise_scale: Option<f32>,
    #[serde(default)]
    pub length_scale: Option<f32>,
    #[serde(default)]
    pub noise_w: Option<f32>,
}

impl InferenceSection {
    /// `piper` flags for the scales this voice sets.
    pub fn piper_args(&self) -> Vec<String> {
        [
            ("--length_scale", self.length_scale),
            ("--noise_scale", self.noise_scale),
            ("--noise_w", self.noise_w),
        ]
        .into_iter()
        .filter_map(|(flag, value)| value.map(|v| [flag.to_string(), v.to_string()]))
        .flatten()
        .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoiceConfig {
    #[serde(default)]
    pub audio: AudioSection,
    #[serde(default)]
    pub espeak: EspeakSection,
    #[serde(default)]
    pub inference: InferenceSection,
    #[serde(default)]
    pub phoneme_type: Option<String>,
    #[serde(default)]
    pub num_speakers: Option<u32>,
    pub phoneme_id_map: HashMap<String, Vec<i64>>,
}

/// A voice on disk: the model and its config side by side.
#[derive(Debug, Clone)]
pub struct VoiceModel {
    pub model_path: PathBuf,
    pub config: VoiceConfig,
}

impl VoiceModel {
    /// Load `<model>.onnx` together with `<model>.onnx.json`.
    pub fn load(model_path: &Path) -> Result<Self> {
        let config_path = PathBuf::from(format!("{}.json", model_path.display()));
        let content = std::fs::read_to_string(&config_path).map_err(|e| {
            SpeechError::Config(format!("cannot read {}: {}", config_path.display(), e))
        })?;
        let config = VoiceConfig::from_json(&content)?;
        Ok(Self {
            model_path: model_path.to_path_buf(),
            config,
        })
    }
}

impl VoiceConfig {
    pub fn from_json(content: &str) -> Result<Self> {
        let config: VoiceConfig = serde_json::from_str(content)
            .map_err(|e| SpeechError::Config(format!("invalid voice config: {}", e)))?;
        if config.phoneme_type.as_deref().unwrap_or("espeak") != "espeak" {
            return Err(SpeechError::Config(format!(
                "unsupported phoneme_type {:?}",
                config.phoneme_type
            )));
        }
        if config.espeak.voice.is_none() {
            return Err(SpeechError::Config("missing espeak.voice".to_string()));
        }
        for symbol in [PAD, BOS, EOS] {
            if !config.phoneme_id_map.contains_key(symbol) {
                return Err(SpeechError::Config(format!(
                    "phoneme_id_map lacks {:?}",
                    symbol
                )));
            }
        }
        Ok(config)
    }

    pub fn sample_rate(&self) -> u32 {
        self.audio.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE)
    }

    pub fn num_speakers(&self) -> u32 {
        self.num_speakers.unwrap_or(1)
    }

    pub fn espeak_voice(&self) -> &str {
        self.espeak.voice.as_deref().unwrap_or("en-us")
    }

    /// Map phonemes to model ids: BOS, pad, then each phoneme followed by pad,
    /// then EOS. Phonemes missing from the map are dropped.
    pub fn phoneme_ids(&self, phonemes: &[String]) -> Vec<i64> {
        let map = &self.phoneme_id_map;
        let ids_of = |symbol: &str| -> Vec<i64> { map.get(symbol).cloned().unwrap_or_default() };

        let mut ids = Vec::with_capacity(phonemes.len() * 2 + 3);
        ids.extend(ids_of(BOS));
        ids.extend(ids_of(PAD));

        let mut missing = BTreeSet::new();
        for phoneme in phonemes {
            match map.get(phoneme) {
                Some(mapped) => {
                    ids.extend_from_slice(mapped);
                    ids.extend(ids_of(PAD));
                }
                None => {
                    missing.insert(phoneme.as_str());
                }
            }
        }

        ids.extend(ids_of(EOS));

        if !missing.is_empty() {
            warn!(target: "voice", ?missing, "Missing mapping for phonemes");
        }
        ids
    }
}
