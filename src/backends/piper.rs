use super::{InferenceEngine, PcmBuffer};
use crate::error::{Result, SpeechError};
use crate::voice::VoiceModel;
use async_trait::async_trait;
use rodio::{Decoder, Source};
use serde_json::json;
use std::io::{BufRead, BufReader, Cursor, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, warn};

/// Runs inference through one long-lived `piper` process. Each request is a
/// JSON line of pre-computed phoneme ids; piper answers with the path of the
/// WAV file it wrote.
#[derive(Clone)]
pub struct PiperEngine {
    binary_path: String,
    model_path: PathBuf,
    scale_args: Vec<String>,
    num_speakers: u32,
    timeout: Duration,
    process: Arc<Mutex<Option<PiperProcess>>>,
}

struct PiperProcess {
    child: Child,
    stdin: ChildStdin,
    lines: Receiver<std::io::Result<String>>,
    output_dir: TempDir,
    requests: u64,
}

impl PiperEngine {
    pub fn new(voice: &VoiceModel) -> Self {
        let (binary_path, timeout) = crate::config_loader::SETTINGS
            .read()
            .map(|s| {
                (
                    s.piper_binary.clone(),
                    Duration::from_secs(s.backend_timeout_secs),
                )
            })
            .unwrap_or_else(|_| ("piper".to_string(), Duration::from_secs(30)));
        Self::with_binary(voice, binary_path, timeout)
    }

    pub fn with_binary(voice: &VoiceModel, binary_path: String, timeout: Duration) -> Self {
        Self {
            binary_path,
            model_path: voice.model_path.clone(),
            scale_args: voice.config.inference.piper_args(),
            num_speakers: voice.config.num_speakers(),
            timeout,
            process: Arc::new(Mutex::new(None)),
        }
    }

    fn request_line(phoneme_ids: &[i64], speaker_id: Option<u32>, output: &Path) -> String {
        let mut request = json!({
            "phoneme_ids": phoneme_ids,
            "output_file": output.to_string_lossy(),
        });
        if let Some(id) = speaker_id {
            request["speaker_id"] = json!(id);
        }
        format!("{}\n", request)
    }

    fn speaker_for(&self, speaker_id: Option<u32>) -> Result<Option<u32>> {
        match speaker_id {
            Some(id) if self.num_speakers <= 1 => {
                debug!(target: "piper", speaker_id = id, "Single-speaker voice, ignoring speaker id");
                Ok(None)
            }
            Some(id) if id >= self.num_speakers => Err(SpeechError::Synthesis(format!(
                "speaker {} out of range, voice has {}",
                id, self.num_speakers
            ))),
            other => Ok(other),
        }
    }

    fn spawn_process(&self) -> Result<PiperProcess> {
        let output_dir = tempfile::Builder::new()
            .prefix("readaloud-piper")
            .tempdir()
            .map_err(|e| SpeechError::Synthesis(format!("piper output dir: {}", e)))?;

        let mut child = Command::new(&self.binary_path)
            .arg("-m")
            .arg(&self.model_path)
            .arg("--json-input")
            .arg("--output_dir")
            .arg(output_dir.path())
            .args(&self.scale_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                SpeechError::Synthesis(format!("failed to run {}: {}", self.binary_path, e))
            })?;

        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (stdin, stdout, stderr) = match pipes {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SpeechError::Synthesis("piper pipes unavailable".to_string()));
            }
        };

        let (tx, lines) = mpsc::channel();
        std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        // Keep stderr drained.
        std::thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                debug!(target: "piper", "{}", line);
            }
        });

        debug!(target: "piper", model = %self.model_path.display(), "Started piper");
        Ok(PiperProcess {
            child,
            stdin,
            lines,
            output_dir,
            requests: 0,
        })
    }

    /// Blocking. Starts piper on first use and again after a failure.
    fn synthesize(&self, phoneme_ids: &[i64], speaker_id: Option<u32>) -> Result<PcmBuffer> {
        let mut guard = self.process.lock().unwrap_or_else(|p| p.into_inner());
        if guard.is_none() {
            *guard = Some(self.spawn_process()?);
        }
        let Some(process) = guard.as_mut() else {
            return Err(SpeechError::Synthesis("piper not running".to_string()));
        };

        let result = process.request(phoneme_ids, speaker_id, self.timeout);
        if let Err(e) = &result {
            warn!(target: "piper", error = %e, "Restarting piper on next request");
            *guard = None;
        }
        result
    }
}

impl PiperProcess {
    fn request(
        &mut self,
        phoneme_ids: &[i64],
        speaker_id: Option<u32>,
        timeout: Duration,
    ) -> Result<PcmBuffer> {
        self.requests += 1;
        let output = self
            .output_dir
            .path()
            .join(format!("phrase-{}.wav", self.requests));
        let line = PiperEngine::request_line(phoneme_ids, speaker_id, &output);
        self.stdin
            .write_all(line.as_bytes())
            .and_then(|_| self.stdin.flush())
            .map_err(|e| SpeechError::Synthesis(format!("piper stdin: {}", e)))?;

        match self.lines.recv_timeout(timeout) {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(SpeechError::Synthesis(format!("piper stdout: {}", e))),
            Err(RecvTimeoutError::Timeout) => {
                return Err(SpeechError::Synthesis(format!(
                    "piper timed out after {:?}",
                    timeout
                )))
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(SpeechError::Synthesis("piper exited".to_string()))
            }
        }

        let wav = std::fs::read(&output)
            .map_err(|e| SpeechError::Synthesis(format!("cannot read {}: {}", output.display(), e)))?;
        let _ = std::fs::remove_file(&output);
        decode_wav(wav)
    }
}

impl Drop for PiperProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Decode a 16-bit WAV into interleaved `f32` samples in `[-1.0, 1.0]`.
pub fn decode_wav(wav: Vec<u8>) -> Result<PcmBuffer> {
    let decoder = Decoder::new_wav(Cursor::new(wav))
        .map_err(|e| SpeechError::Synthesis(format!("invalid piper audio: {}", e)))?;
    let sample_rate = decoder.sample_rate();
    let num_channels = decoder.channels();
    let samples = decoder.map(|s| s as f32 / 32768.0).collect();
    Ok(PcmBuffer {
        samples,
        sample_rate,
        num_channels,
    })
}

#[async_trait]
impl InferenceEngine for PiperEngine {
    async fn infer(&self, phoneme_ids: &[i64], speaker_id: Option<u32>) -> Result<PcmBuffer> {
        let speaker_id = self.speaker_for(speaker_id)?;
        let ids = phoneme_ids.to_vec();
        let engine = self.clone();
        let start = Instant::now();
        let pcm =
            tokio::task::spawn_blocking(move || engine.synthesize(&ids, speaker_id)).await??;
        debug!(
            target: "piper",
            ids = phoneme_ids.len(),
            audio_secs = pcm.duration_secs(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Synthesized phrase"
        );
        Ok(pcm)
    }
}
