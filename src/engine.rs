use crate::audio::{
    normalized_gain, peak_amplitude, with_trailing_silence, AudioPlayer, Paused, PlaybackParams,
    Playing,
};
use crate::backends::PcmBuffer;
use crate::error::{Result, SpeechError};
use async_trait::async_trait;
use rodio::buffer::SamplesBuffer;
use rodio::source::EmptyCallback;
use rodio::{OutputStream, OutputStreamHandle, Sink};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Audio output on the default device.
///
/// The `OutputStream` is not `Send`, so it lives on a dedicated thread for as
/// long as this value exists; phrases are played through sinks created from
/// its handle.
pub struct RodioOutput {
    handle: OutputStreamHandle,
    _shutdown: Sender<()>,
}

impl RodioOutput {
    pub fn new() -> Result<Self> {
        let (ready_tx, ready_rx) = channel::<std::result::Result<OutputStreamHandle, String>>();
        let (shutdown_tx, shutdown_rx) = channel::<()>();

        thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                // Audio stream must live on this thread
                match OutputStream::try_default() {
                    Ok((_stream, handle)) => {
                        let _ = ready_tx.send(Ok(handle));
                        // Returns once the owning RodioOutput is dropped
                        let _ = shutdown_rx.recv();
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                    }
                }
            })
            .map_err(|e| SpeechError::Playback(format!("failed to start audio thread: {}", e)))?;

        let handle = ready_rx
            .recv()
            .map_err(|_| SpeechError::Playback("audio thread exited".to_string()))?
            .map_err(|e| SpeechError::Playback(format!("No audio output device found: {}", e)))?;

        info!(target: "audio", "Audio output ready");
        Ok(Self {
            handle,
            _shutdown: shutdown_tx,
        })
    }
}

/// A phrase prepared for output: samples with silence appended, plus the
/// settings every (re)start needs.
struct Track {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
    gain: f32,
    rate: f32,
}

impl Track {
    fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }
}

impl AudioPlayer for RodioOutput {
    fn play_audio(
        &self,
        pcm: Arc<PcmBuffer>,
        trailing_silence_secs: f32,
        params: PlaybackParams,
    ) -> Result<Box<dyn Playing>> {
        let gain = normalized_gain(peak_amplitude(&pcm.samples), params.volume);
        let track = Arc::new(Track {
            samples: with_trailing_silence(&pcm, trailing_silence_secs),
            sample_rate: pcm.sample_rate,
            channels: pcm.num_channels.max(1),
            gain,
            rate: params.rate,
        });
        debug!(
            target: "audio",
            frames = track.frames(),
            gain,
            rate = params.rate,
            "Playing phrase"
        );
        start(self.handle.clone(), track, 0)
    }
}

fn start(handle: OutputStreamHandle, track: Arc<Track>, frame: usize) -> Result<Box<dyn Playing>> {
    let sink = Sink::try_new(&handle)
        .map_err(|e| SpeechError::Playback(format!("Failed to create sink: {}", e)))?;
    sink.set_volume(track.gain);
    sink.set_speed(track.rate);

    let from = (frame * track.channels as usize).min(track.samples.len());
    sink.append(SamplesBuffer::new(
        track.channels,
        track.sample_rate,
        track.samples[from..].to_vec(),
    ));

    let (done_tx, done_rx) = oneshot::channel();
    let done_tx = Mutex::new(Some(done_tx));
    sink.append(EmptyCallback::<f32>::new(Box::new(move || {
        if let Some(tx) = done_tx.lock().ok().and_then(|mut slot| slot.take()) {
            let _ = tx.send(());
        }
    })));

    Ok(Box::new(RodioPlaying {
        handle,
        sink,
        track,
        start_frame: frame,
        started_at: Instant::now(),
        done: done_rx,
    }))
}

struct RodioPlaying {
    handle: OutputStreamHandle,
    sink: Sink,
    track: Arc<Track>,
    start_frame: usize,
    started_at: Instant,
    done: oneshot::Receiver<()>,
}

impl RodioPlaying {
    /// Frame reached so far, from wall time scaled by the playback rate.
    fn position(&self) -> usize {
        let played = self.started_at.elapsed().as_secs_f64()
            * self.track.rate as f64
            * self.track.sample_rate as f64;
        (self.start_frame + played as usize).min(self.track.frames())
    }
}

#[async_trait]
impl Playing for RodioPlaying {
    async fn finished(&mut self) -> Result<()> {
        (&mut self.done)
            .await
            .map_err(|_| SpeechError::Playback("audio sink closed before finishing".to_string()))
    }

    fn pause(self: Box<Self>) -> Box<dyn Paused> {
        let frame = self.position();
        let this = *self;
        this.sink.stop();
        debug!(target: "audio", frame, "Paused phrase");
        Box::new(RodioPaused {
            handle: this.handle,
            track: this.track,
            frame,
        })
    }
}

struct RodioPaused {
    handle: OutputStreamHandle,
    track: Arc<Track>,
    frame: usize,
}

impl Paused for RodioPaused {
    fn resume(self: Box<Self>) -> Result<Box<dyn Playing>> {
        let this = *self;
        debug!(target: "audio", frame = this.frame, "Resuming phrase");
        start(this.handle, this.track, this.frame)
    }
}
