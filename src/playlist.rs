//! Units of one speech session with their lazily computed phrases and audio.
//!
//! Phonemization happens per batch of consecutive units (grouped by text
//! size), inference per phrase. Both are memoized: each collaborator call is
//! made at most once for the lifetime of the session.

use crate::backends::{InferenceEngine, PcmBuffer, Phonemizer, Phrase};
use crate::error::{Result, SpeechError};
use crate::memo::{Memo, TaskTracker};
use crate::segmenter::{segment, Unit};
use futures_util::future::FutureExt;
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

/// Playback position: a phrase within a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub unit: usize,
    pub phrase: usize,
}

impl Cursor {
    pub fn start_of(unit: usize) -> Self {
        Self { unit, phrase: 0 }
    }
}

pub struct PhraseEntry {
    pub phrase: Phrase,
    pcm: Memo<Arc<PcmBuffer>>,
}

pub type PhraseList = Arc<Vec<Arc<PhraseEntry>>>;

struct Batch {
    units: Range<usize>,
    result: Memo<Arc<Vec<Vec<Phrase>>>>,
}

/// Knobs the playlist needs from the engine config.
#[derive(Debug, Clone, Copy)]
pub struct PlaylistSettings {
    pub paragraph_silence_seconds: f32,
    pub phonemize_batch_chars: usize,
    pub speaker_id: Option<u32>,
}

pub struct Playlist {
    units: Vec<Unit>,
    batches: Vec<Batch>,
    unit_batch: Vec<usize>,
    phrases: Vec<Memo<PhraseList>>,
    phonemizer: Arc<dyn Phonemizer>,
    engine: Arc<dyn InferenceEngine>,
    inference_gate: Arc<AsyncMutex<()>>,
    settings: PlaylistSettings,
    tasks: TaskTracker,
}

/// Group consecutive units so each group's text stays within `budget` chars.
/// A unit larger than the budget gets a group of its own.
fn plan_batches(units: &[Unit], budget: usize) -> Vec<Range<usize>> {
    let mut batches = Vec::new();
    let mut start = 0;
    let mut size = 0;
    for (i, unit) in units.iter().enumerate() {
        let len = unit.end_index - unit.start_index;
        if i > start && size + len > budget {
            batches.push(start..i);
            start = i;
            size = 0;
        }
        size += len;
    }
    if start < units.len() {
        batches.push(start..units.len());
    }
    batches
}

impl Playlist {
    pub fn new(
        text: &str,
        phonemizer: Arc<dyn Phonemizer>,
        engine: Arc<dyn InferenceEngine>,
        inference_gate: Arc<AsyncMutex<()>>,
        settings: PlaylistSettings,
    ) -> Arc<Self> {
        let units = segment(text);
        let ranges = plan_batches(&units, settings.phonemize_batch_chars.max(1));
        let mut unit_batch = vec![0; units.len()];
        for (b, range) in ranges.iter().enumerate() {
            for slot in &mut unit_batch[range.clone()] {
                *slot = b;
            }
        }
        let batches = ranges
            .into_iter()
            .map(|units| Batch {
                units,
                result: Memo::new(),
            })
            .collect();
        let phrases = units.iter().map(|_| Memo::new()).collect();

        Arc::new(Self {
            units,
            batches,
            unit_batch,
            phrases,
            phonemizer,
            engine,
            inference_gate,
            settings,
            tasks: TaskTracker::new(),
        })
    }

    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// Stop all outstanding phonemize/inference work.
    pub fn shutdown(&self) {
        self.tasks.abort_all();
    }

    async fn batch(self: &Arc<Self>, index: usize) -> Result<Arc<Vec<Vec<Phrase>>>> {
        let batch = &self.batches[index];
        let texts: Vec<String> = self.units[batch.units.clone()]
            .iter()
            .map(|u| u.text.clone())
            .collect();
        let phonemizer = self.phonemizer.clone();
        batch
            .result
            .get_or_start(&self.tasks, move || {
                async move {
                    debug!(target: "playlist", units = texts.len(), "Phonemizing batch");
                    let results = phonemizer.batch_phonemize(&texts).await?;
                    if results.len() != texts.len() {
                        return Err(SpeechError::Synthesis(format!(
                            "phonemizer returned {} results for {} texts",
                            results.len(),
                            texts.len()
                        )));
                    }
                    Ok(Arc::new(results))
                }
                .boxed()
            })
            .await
    }

    /// Phrases of `unit`, with the trailing silence of the last phrase
    /// adjusted for paragraph ends and the end of input.
    pub async fn phrases(self: &Arc<Self>, unit: usize) -> Result<PhraseList> {
        let memo = self
            .phrases
            .get(unit)
            .ok_or_else(|| SpeechError::Synthesis(format!("no unit {}", unit)))?;
        let this = self.clone();
        memo.get_or_start(&self.tasks, move || {
            async move {
                let batch_index = this.unit_batch[unit];
                let batch = this.batch(batch_index).await?;
                let offset = unit - this.batches[batch_index].units.start;
                let raw = batch.get(offset).cloned().unwrap_or_default();
                let ends_input = !raw.is_empty() && this.silent_after(unit).await;
                Ok(Arc::new(this.finish_phrases(unit, raw, ends_input)))
            }
            .boxed()
        })
        .await
    }

    /// True when no unit after `unit` has anything to say. A failed later
    /// batch counts as speech; its error surfaces when that unit is reached.
    async fn silent_after(self: &Arc<Self>, unit: usize) -> bool {
        for later in unit + 1..self.units.len() {
            let batch_index = self.unit_batch[later];
            let Ok(batch) = self.batch(batch_index).await else {
                return false;
            };
            let offset = later - self.batches[batch_index].units.start;
            if batch.get(offset).is_some_and(|phrases| !phrases.is_empty()) {
                return false;
            }
        }
        true
    }

    fn finish_phrases(
        &self,
        unit: usize,
        mut raw: Vec<Phrase>,
        ends_input: bool,
    ) -> Vec<Arc<PhraseEntry>> {
        if let Some(last) = raw.last_mut() {
            if ends_input {
                last.silence_seconds = 0.0;
            } else if self.units[unit].ends_paragraph() {
                last.silence_seconds = self.settings.paragraph_silence_seconds;
            }
        }
        raw.into_iter()
            .map(|phrase| {
                Arc::new(PhraseEntry {
                    phrase,
                    pcm: Memo::new(),
                })
            })
            .collect()
    }

    /// Audio for a phrase. Inference calls through one synthesizer are
    /// serialized.
    pub async fn pcm(&self, entry: &PhraseEntry) -> Result<Arc<PcmBuffer>> {
        let engine = self.engine.clone();
        let gate = self.inference_gate.clone();
        let ids = entry.phrase.phoneme_ids.clone();
        let speaker_id = self.settings.speaker_id;
        entry
            .pcm
            .get_or_start(&self.tasks, move || {
                async move {
                    let _turn = gate.lock().await;
                    engine.infer(&ids, speaker_id).await.map(Arc::new)
                }
                .boxed()
            })
            .await
    }

    /// Whether inference for a phrase has been requested.
    pub fn pcm_started(entry: &PhraseEntry) -> bool {
        entry.pcm.is_started()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// One phrase per word, each phoneme a char.
    struct WordPhonemizer {
        calls: AtomicUsize,
        texts: std::sync::Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl Phonemizer for WordPhonemizer {
        async fn batch_phonemize(&self, texts: &[String]) -> Result<Vec<Vec<Phrase>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts.lock().unwrap().push(texts.len());
            Ok(texts
                .iter()
                .map(|t| {
                    t.split_whitespace()
                        .filter(|w| w.chars().any(char::is_alphanumeric))
                        .map(|w| Phrase {
                            phonemes: w.chars().map(String::from).collect(),
                            phoneme_ids: vec![w.len() as i64],
                            silence_seconds: 0.2,
                        })
                        .collect()
                })
                .collect())
        }
    }

    struct CountingEngine {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl InferenceEngine for CountingEngine {
        async fn infer(&self, ids: &[i64], _speaker: Option<u32>) -> Result<PcmBuffer> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(PcmBuffer {
                samples: vec![0.1; ids[0] as usize],
                sample_rate: 1000,
                num_channels: 1,
            })
        }
    }

    fn playlist(
        text: &str,
        batch_chars: usize,
    ) -> (Arc<Playlist>, Arc<WordPhonemizer>, Arc<CountingEngine>) {
        let phonemizer = Arc::new(WordPhonemizer {
            calls: AtomicUsize::new(0),
            texts: std::sync::Mutex::new(Vec::new()),
        });
        let engine = Arc::new(CountingEngine {
            calls: AtomicUsize::new(0),
        });
        let list = Playlist::new(
            text,
            phonemizer.clone(),
            engine.clone(),
            Arc::new(AsyncMutex::new(())),
            PlaylistSettings {
                paragraph_silence_seconds: 0.65,
                phonemize_batch_chars: batch_chars,
                speaker_id: None,
            },
        );
        (list, phonemizer, engine)
    }

    #[test]
    fn test_plan_batches_by_size() {
        let units = segment("aaaa. bbbb. cccccccccccc. d.");
        // lengths 6, 6, 14, 2
        assert_eq!(plan_batches(&units, 12), vec![0..2, 2..3, 3..4]);
        assert_eq!(plan_batches(&units, 1000), vec![0..4]);
        assert!(plan_batches(&[], 10).is_empty());
    }

    #[tokio::test]
    async fn test_phonemizer_called_once_per_batch() {
        let (list, phonemizer, _) = playlist("One two. Three four. Five.", 1000);
        let (a, b) = tokio::join!(list.phrases(0), list.phrases(1));
        assert_eq!(a.unwrap().len(), 2);
        assert_eq!(b.unwrap().len(), 2);
        list.phrases(2).await.unwrap();
        list.phrases(0).await.unwrap();
        assert_eq!(phonemizer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*phonemizer.texts.lock().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_small_budget_splits_batches() {
        let (list, phonemizer, _) = playlist("One two. Three four. Five.", 5);
        list.phrases(2).await.unwrap();
        assert_eq!(phonemizer.calls.load(Ordering::SeqCst), 1);
        // Unit 1 also looks at unit 2, whose batch is already done.
        list.phrases(1).await.unwrap();
        assert_eq!(phonemizer.calls.load(Ordering::SeqCst), 2);
        list.phrases(0).await.unwrap();
        assert_eq!(phonemizer.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_inference_memoized_per_phrase() {
        let (list, _, engine) = playlist("Hello there.", 1000);
        let phrases = list.phrases(0).await.unwrap();
        let first = list.pcm(&phrases[0]).await.unwrap();
        let again = list.pcm(&phrases[0]).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
        assert!(Playlist::pcm_started(&phrases[0]));
        assert!(!Playlist::pcm_started(&phrases[1]));
    }

    #[tokio::test]
    async fn test_silence_rules() {
        let (list, _, _) = playlist("One two.\nThree. Four five.", 1000);
        let first = list.phrases(0).await.unwrap();
        assert_eq!(first[0].phrase.silence_seconds, 0.2);
        assert_eq!(first[1].phrase.silence_seconds, 0.65);
        let second = list.phrases(1).await.unwrap();
        assert_eq!(second[0].phrase.silence_seconds, 0.2);
        let last = list.phrases(2).await.unwrap();
        assert_eq!(last[0].phrase.silence_seconds, 0.2);
        assert_eq!(last[1].phrase.silence_seconds, 0.0);
    }

    #[tokio::test]
    async fn test_no_silence_before_trailing_empty_unit() {
        let (list, _, _) = playlist("One two.\n...", 1000);
        assert_eq!(list.len(), 2);
        let first = list.phrases(0).await.unwrap();
        assert_eq!(first[1].phrase.silence_seconds, 0.0);
        assert!(list.phrases(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_work() {
        let (list, _, _) = playlist("Hello.", 1000);
        list.shutdown();
        assert!(matches!(list.phrases(0).await, Err(SpeechError::Cancelled)));
    }
}
