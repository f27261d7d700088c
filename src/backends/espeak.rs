use super::{Phonemizer, Phrase};
use crate::error::{Result, SpeechError};
use crate::voice::VoiceConfig;
use async_trait::async_trait;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use wait_timeout::ChildExt;

/// Phonemizes with the local `espeak-ng` binary, one clause per output line.
pub struct EspeakPhonemizer {
    binary: String,
    voice: Arc<VoiceConfig>,
    sentence_silence_seconds: f32,
    timeout: Duration,
}

impl EspeakPhonemizer {
    pub fn new(voice: Arc<VoiceConfig>) -> Self {
        let (binary, timeout, silence) = crate::config_loader::SETTINGS
            .read()
            .map(|s| {
                (
                    s.espeak_binary.clone(),
                    Duration::from_secs(s.backend_timeout_secs),
                    s.sentence_silence_seconds,
                )
            })
            .unwrap_or_else(|_| ("espeak-ng".to_string(), Duration::from_secs(30), 0.2));

        Self {
            binary,
            voice,
            sentence_silence_seconds: silence,
            timeout,
        }
    }

    fn run_espeak(binary: &str, voice: &str, text: &str, timeout: Duration) -> Result<String> {
        let mut child = Command::new(binary)
            .arg("-q")
            .arg("--ipa")
            .arg("-v")
            .arg(voice)
            .arg(text)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SpeechError::Synthesis(format!("failed to run {}: {}", binary, e)))?;

        match child
            .wait_timeout(timeout)
            .map_err(|e| SpeechError::Synthesis(e.to_string()))?
        {
            Some(status) => {
                let output = child
                    .wait_with_output()
                    .map_err(|e| SpeechError::Synthesis(e.to_string()))?;
                if status.success() {
                    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
                } else {
                    let err_msg = String::from_utf8_lossy(&output.stderr);
                    Err(SpeechError::Synthesis(format!("espeak error: {}", err_msg.trim())))
                }
            }
            None => {
                // Timeout occurred, kill the process
                let _ = child.kill();
                let _ = child.wait();
                Err(SpeechError::Synthesis(format!(
                    "espeak timed out after {:?}",
                    timeout
                )))
            }
        }
    }

    /// Turn espeak's IPA output into phrases: one per non-empty line, one
    /// phoneme per char.
    pub fn parse_output(&self, output: &str) -> Vec<Phrase> {
        output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                let phonemes: Vec<String> = line.chars().map(String::from).collect();
                Phrase {
                    phoneme_ids: self.voice.phoneme_ids(&phonemes),
                    phonemes,
                    silence_seconds: self.sentence_silence_seconds,
                }
            })
            .collect()
    }
}

#[async_trait]
impl Phonemizer for EspeakPhonemizer {
    async fn batch_phonemize(&self, texts: &[String]) -> Result<Vec<Vec<Phrase>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            if text.trim().is_empty() {
                results.push(Vec::new());
                continue;
            }
            let binary = self.binary.clone();
            let voice = self.voice.espeak_voice().to_string();
            let owned = text.clone();
            let timeout = self.timeout;
            let output = tokio::task::spawn_blocking(move || {
                Self::run_espeak(&binary, &voice, &owned, timeout)
            })
            .await??;
            let phrases = self.parse_output(&output);
            debug!(target: "espeak", phrases = phrases.len(), "Phonemized {:?}", text);
            results.push(phrases);
        }
        Ok(results)
    }
}
