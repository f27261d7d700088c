//! Test doubles shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use readaloud_ng::{
    AudioPlayer, EngineConfig, InferenceEngine, Paused, PcmBuffer, Phonemizer, PlaybackParams,
    Phrase, Playing, Result, SpeechError, SpeechEvents,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Samples per second of fake audio: one sample per phoneme, so a word of
/// n letters plays for n * 10ms.
pub const RATE: u32 = 100;

pub fn test_config() -> EngineConfig {
    EngineConfig {
        paragraph_silence_seconds: 0.0,
        prefetch_phonemes: 100,
        phonemize_batch_chars: 1000,
        seek_debounce: Duration::from_millis(5),
        default_volume: 1.0,
        default_rate: 1.0,
    }
}

/// Every word becomes one phrase. Phonemes are the word's letters and ids
/// their code points, punctuation stripped.
pub fn echo_phrases(text: &str) -> Vec<Phrase> {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| c.is_ascii_punctuation()))
        .filter(|w| !w.is_empty())
        .map(|w| Phrase {
            phonemes: w.chars().map(String::from).collect(),
            phoneme_ids: w.chars().map(|c| c as i64).collect(),
            silence_seconds: 0.0,
        })
        .collect()
}

pub struct EchoPhonemizer;

#[async_trait]
impl Phonemizer for EchoPhonemizer {
    async fn batch_phonemize(&self, texts: &[String]) -> Result<Vec<Vec<Phrase>>> {
        Ok(texts.iter().map(|t| echo_phrases(t)).collect())
    }
}

/// Never answers.
pub struct HangingPhonemizer;

#[async_trait]
impl Phonemizer for HangingPhonemizer {
    async fn batch_phonemize(&self, _texts: &[String]) -> Result<Vec<Vec<Phrase>>> {
        std::future::pending().await
    }
}

/// PCM whose samples are the phoneme ids, so the player can tell which word
/// it was handed.
pub fn echo_pcm(ids: &[i64]) -> PcmBuffer {
    PcmBuffer {
        samples: ids.iter().map(|&id| id as f32).collect(),
        sample_rate: RATE,
        num_channels: 1,
    }
}

/// Echoes ids into PCM after an optional delay, tracking how many calls
/// overlap.
#[derive(Default)]
pub struct EchoEngine {
    pub delay: Duration,
    pub in_flight: Mutex<usize>,
    pub max_in_flight: Mutex<usize>,
    pub calls: Mutex<usize>,
}

impl EchoEngine {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

#[async_trait]
impl InferenceEngine for EchoEngine {
    async fn infer(&self, ids: &[i64], _speaker_id: Option<u32>) -> Result<PcmBuffer> {
        {
            *self.calls.lock().unwrap() += 1;
            let mut in_flight = self.in_flight.lock().unwrap();
            *in_flight += 1;
            let mut max = self.max_in_flight.lock().unwrap();
            *max = (*max).max(*in_flight);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        *self.in_flight.lock().unwrap() -= 1;
        Ok(echo_pcm(ids))
    }
}

/// Never answers.
pub struct HangingEngine;

#[async_trait]
impl InferenceEngine for HangingEngine {
    async fn infer(&self, _ids: &[i64], _speaker_id: Option<u32>) -> Result<PcmBuffer> {
        std::future::pending().await
    }
}

#[derive(Debug, Default)]
pub struct PlayerLog {
    /// Word and trailing silence of every `play_audio` call.
    pub plays: Vec<(String, f32)>,
    pub pauses: Vec<usize>,
    pub resumes: Vec<usize>,
    pub live: usize,
    pub max_live: usize,
}

impl PlayerLog {
    pub fn words(&self) -> Vec<String> {
        self.plays.iter().map(|(w, _)| w.clone()).collect()
    }

    fn went_live(&mut self) {
        self.live += 1;
        self.max_live = self.max_live.max(self.live);
    }
}

/// Plays in simulated time, recording every call.
#[derive(Clone, Default)]
pub struct FakePlayer {
    pub log: Arc<Mutex<PlayerLog>>,
}

impl FakePlayer {
    pub fn log(&self) -> std::sync::MutexGuard<'_, PlayerLog> {
        self.log.lock().unwrap()
    }
}

impl AudioPlayer for FakePlayer {
    fn play_audio(
        &self,
        pcm: Arc<PcmBuffer>,
        trailing_silence_secs: f32,
        _params: PlaybackParams,
    ) -> Result<Box<dyn Playing>> {
        let word: String = pcm
            .samples
            .iter()
            .filter_map(|&s| char::from_u32(s as u32))
            .collect();
        let frames = pcm.samples.len()
            + (trailing_silence_secs * pcm.sample_rate as f32).round() as usize;
        let mut log = self.log.lock().unwrap();
        log.plays.push((word, trailing_silence_secs));
        log.went_live();
        Ok(Box::new(FakePlaying {
            log: self.log.clone(),
            frames,
            offset: 0,
            started: Instant::now(),
            ended: false,
        }))
    }
}

pub struct FakePlaying {
    log: Arc<Mutex<PlayerLog>>,
    frames: usize,
    offset: usize,
    started: Instant,
    ended: bool,
}

impl FakePlaying {
    fn position(&self) -> usize {
        let played = self.started.elapsed().as_micros() as usize * RATE as usize / 1_000_000;
        (self.offset + played).min(self.frames)
    }

    fn end(&mut self) {
        if !self.ended {
            self.ended = true;
            self.log.lock().unwrap().live -= 1;
        }
    }
}

#[async_trait]
impl Playing for FakePlaying {
    async fn finished(&mut self) -> Result<()> {
        let remaining = (self.frames - self.offset) as u64 * 1_000_000 / RATE as u64;
        tokio::time::sleep_until(self.started + Duration::from_micros(remaining)).await;
        self.end();
        Ok(())
    }

    fn pause(mut self: Box<Self>) -> Box<dyn Paused> {
        let offset = self.position();
        self.end();
        self.log.lock().unwrap().pauses.push(offset);
        Box::new(FakePaused {
            log: self.log.clone(),
            frames: self.frames,
            offset,
        })
    }
}

pub struct FakePaused {
    log: Arc<Mutex<PlayerLog>>,
    frames: usize,
    offset: usize,
}

impl Paused for FakePaused {
    fn resume(self: Box<Self>) -> Result<Box<dyn Playing>> {
        let mut log = self.log.lock().unwrap();
        log.resumes.push(self.offset);
        log.went_live();
        Ok(Box::new(FakePlaying {
            log: self.log.clone(),
            frames: self.frames,
            offset: self.offset,
            started: Instant::now(),
            ended: false,
        }))
    }
}

/// Records every callback.
#[derive(Default)]
pub struct RecordingEvents {
    pub boundaries: Mutex<Vec<(usize, usize)>>,
    pub errors: Mutex<Vec<SpeechError>>,
}

impl RecordingEvents {
    pub fn boundaries(&self) -> Vec<(usize, usize)> {
        self.boundaries.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<SpeechError> {
        self.errors.lock().unwrap().clone()
    }
}

impl SpeechEvents for RecordingEvents {
    fn on_unit_boundary(&self, start_index: usize, end_index: usize) {
        self.boundaries.lock().unwrap().push((start_index, end_index));
    }

    fn on_error(&self, error: &SpeechError) {
        self.errors.lock().unwrap().push(error.clone());
    }
}
