//! Playback state machine for one speech session.
//!
//! A single task owns all session state and consumes commands in arrival
//! order, racing each one against whatever the current state is waiting on
//! (synthesis, a debounce delay or the end of the sounding phrase). Only the
//! `Playing` state holds a live output, so two phrases never sound at once.

use crate::audio::{AudioPlayer, Paused, PlaybackParams, Playing};
use crate::backends::PcmBuffer;
use crate::error::{Result, SpeechError};
use crate::playlist::{Cursor, Playlist};
use crate::prefetch::spawn_prefetch;
use futures_util::future::{BoxFuture, FutureExt};
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time::{sleep, Sleep};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Play,
    Pause,
    Resume,
    Forward,
    Rewind,
    Seek(usize),
    Cancel,
}

/// Lifecycle notifications for the caller of `speak`.
pub trait SpeechEvents: Send + Sync {
    /// The cursor entered the unit spanning `[start_index, end_index)` chars.
    fn on_unit_boundary(&self, start_index: usize, end_index: usize);

    /// The session ended with a genuine failure. Not called for cancellation.
    fn on_error(&self, _error: &SpeechError) {}
}

struct Prepared {
    pcm: Arc<PcmBuffer>,
    silence_seconds: f32,
    phrase_count: usize,
}

enum Loaded {
    Phrase(Prepared),
    /// The cursor points past the unit's phrases (a unit with nothing to say).
    EndOfUnit { phrase_count: usize },
}

enum State {
    Idle,
    Loading {
        cursor: Cursor,
        task: BoxFuture<'static, Result<Loaded>>,
    },
    Debouncing {
        cursor: Cursor,
        until: Pin<Box<Sleep>>,
    },
    Playing {
        cursor: Cursor,
        phrase_count: usize,
        handle: Box<dyn Playing>,
    },
    Paused {
        cursor: Cursor,
        /// Continuation of the phrase that was sounding, if any.
        resume: Option<(Box<dyn Paused>, usize)>,
    },
    Finished,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Idle => "idle",
            State::Loading { .. } => "loading",
            State::Debouncing { .. } => "debouncing",
            State::Playing { .. } => "playing",
            State::Paused { .. } => "paused",
            State::Finished => "finished",
        }
    }

    fn cursor(&self) -> Option<Cursor> {
        match self {
            State::Loading { cursor, .. }
            | State::Debouncing { cursor, .. }
            | State::Playing { cursor, .. }
            | State::Paused { cursor, .. } => Some(*cursor),
            State::Idle | State::Finished => None,
        }
    }
}

enum Event {
    Command(Option<Command>),
    Loaded(Result<Loaded>),
    DebounceElapsed,
    PlaybackEnded(Result<()>),
}

/// Engine knobs the controller needs.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ControllerSettings {
    pub params: PlaybackParams,
    pub prefetch_phonemes: usize,
    pub seek_debounce: Duration,
}

pub(crate) struct Controller {
    playlist: Arc<Playlist>,
    player: Arc<dyn AudioPlayer>,
    events: Arc<dyn SpeechEvents>,
    settings: ControllerSettings,
    commands: mpsc::UnboundedReceiver<Command>,
    outcome: watch::Sender<Option<Result<()>>>,
    state: State,
    prefetch: Option<AbortHandle>,
}

impl Controller {
    pub(crate) fn new(
        playlist: Arc<Playlist>,
        player: Arc<dyn AudioPlayer>,
        events: Arc<dyn SpeechEvents>,
        settings: ControllerSettings,
        commands: mpsc::UnboundedReceiver<Command>,
        outcome: watch::Sender<Option<Result<()>>>,
    ) -> Self {
        Self {
            playlist,
            player,
            events,
            settings,
            commands,
            outcome,
            state: State::Idle,
            prefetch: None,
        }
    }

    /// Drive the session until it finishes, then publish the outcome.
    pub(crate) async fn run(mut self) {
        let result = loop {
            let event = self.next_event().await;
            if let ControlFlow::Break(result) = self.handle(event) {
                break result;
            }
        };
        self.finish(result);
    }

    async fn next_event(&mut self) -> Event {
        let commands = &mut self.commands;
        match &mut self.state {
            State::Loading { task, .. } => tokio::select! {
                biased;
                command = commands.recv() => Event::Command(command),
                loaded = task => Event::Loaded(loaded),
            },
            State::Debouncing { until, .. } => tokio::select! {
                biased;
                command = commands.recv() => Event::Command(command),
                _ = until.as_mut() => Event::DebounceElapsed,
            },
            State::Playing { handle, .. } => tokio::select! {
                biased;
                command = commands.recv() => Event::Command(command),
                done = handle.finished() => Event::PlaybackEnded(done),
            },
            State::Idle | State::Paused { .. } | State::Finished => {
                Event::Command(commands.recv().await)
            }
        }
    }

    fn handle(&mut self, event: Event) -> ControlFlow<Result<()>> {
        match event {
            Event::Command(None) => {
                debug!(target: "controller", "All handles dropped");
                ControlFlow::Break(Err(SpeechError::Cancelled))
            }
            Event::Command(Some(command)) => self.command(command),
            Event::Loaded(Ok(Loaded::Phrase(prepared))) => self.start_phrase(prepared),
            Event::Loaded(Ok(Loaded::EndOfUnit { phrase_count })) => {
                match self.take_state() {
                    State::Loading { cursor, .. } => self.advance(cursor, phrase_count),
                    other => self.restore(other),
                }
            }
            Event::Loaded(Err(e)) => ControlFlow::Break(Err(e)),
            Event::DebounceElapsed => {
                if let State::Debouncing { cursor, .. } = self.take_state() {
                    self.begin(cursor);
                }
                ControlFlow::Continue(())
            }
            Event::PlaybackEnded(Ok(())) => match self.take_state() {
                State::Playing {
                    cursor,
                    phrase_count,
                    ..
                } => self.advance(cursor, phrase_count),
                other => self.restore(other),
            },
            Event::PlaybackEnded(Err(e)) => ControlFlow::Break(Err(e)),
        }
    }

    fn command(&mut self, command: Command) -> ControlFlow<Result<()>> {
        debug!(target: "controller", ?command, state = self.state.name(), "Command");
        match command {
            Command::Play => {
                if !matches!(self.state, State::Idle) {
                    return ControlFlow::Continue(());
                }
                if self.playlist.is_empty() {
                    return ControlFlow::Break(Ok(()));
                }
                self.announce(0);
                self.begin(Cursor::start_of(0));
                ControlFlow::Continue(())
            }
            Command::Pause => self.pause(),
            Command::Resume => self.resume(),
            Command::Forward => {
                if let Some(cursor) = self.state.cursor() {
                    if cursor.unit + 1 < self.playlist.len() {
                        self.jump(cursor.unit + 1, true);
                    }
                }
                ControlFlow::Continue(())
            }
            Command::Rewind => {
                if let Some(cursor) = self.state.cursor() {
                    if cursor.unit > 0 {
                        self.jump(cursor.unit - 1, true);
                    }
                }
                ControlFlow::Continue(())
            }
            Command::Seek(unit) => {
                if self.state.cursor().is_some() && unit < self.playlist.len() {
                    self.jump(unit, false);
                }
                ControlFlow::Continue(())
            }
            Command::Cancel => ControlFlow::Break(Err(SpeechError::Cancelled)),
        }
    }

    fn pause(&mut self) -> ControlFlow<Result<()>> {
        let next = match self.take_state() {
            State::Playing {
                cursor,
                phrase_count,
                handle,
            } => State::Paused {
                cursor,
                resume: Some((handle.pause(), phrase_count)),
            },
            State::Loading { cursor, .. } | State::Debouncing { cursor, .. } => State::Paused {
                cursor,
                resume: None,
            },
            other => return self.restore(other),
        };
        self.enter(next);
        ControlFlow::Continue(())
    }

    fn resume(&mut self) -> ControlFlow<Result<()>> {
        match self.take_state() {
            State::Paused {
                cursor,
                resume: Some((paused, phrase_count)),
            } => match paused.resume() {
                Ok(handle) => {
                    self.enter(State::Playing {
                        cursor,
                        phrase_count,
                        handle,
                    });
                    ControlFlow::Continue(())
                }
                Err(e) => ControlFlow::Break(Err(e)),
            },
            State::Paused {
                cursor,
                resume: None,
            } => {
                self.begin(cursor);
                ControlFlow::Continue(())
            }
            other => self.restore(other),
        }
    }

    /// Move to the first phrase of `unit`, silencing the current position
    /// first. A paused session stays paused.
    fn jump(&mut self, unit: usize, debounce: bool) {
        let paused = matches!(self.state, State::Paused { .. });
        self.halt();
        let cursor = Cursor::start_of(unit);
        self.announce(unit);
        if paused {
            self.enter(State::Paused {
                cursor,
                resume: None,
            });
        } else if debounce {
            self.enter(State::Debouncing {
                cursor,
                until: Box::pin(sleep(self.settings.seek_debounce)),
            });
        } else {
            self.begin(cursor);
        }
    }

    /// Next phrase of the unit, else the next unit, else done.
    fn advance(&mut self, cursor: Cursor, phrase_count: usize) -> ControlFlow<Result<()>> {
        let next = if cursor.phrase + 1 < phrase_count {
            Cursor {
                unit: cursor.unit,
                phrase: cursor.phrase + 1,
            }
        } else if cursor.unit + 1 < self.playlist.len() {
            self.announce(cursor.unit + 1);
            Cursor::start_of(cursor.unit + 1)
        } else {
            return ControlFlow::Break(Ok(()));
        };
        self.begin(next);
        ControlFlow::Continue(())
    }

    /// Start synthesizing the phrase at `cursor` and prefetching past it.
    fn begin(&mut self, cursor: Cursor) {
        self.restart_prefetch(cursor);
        let playlist = self.playlist.clone();
        let task = async move {
            let phrases = playlist.phrases(cursor.unit).await?;
            match phrases.get(cursor.phrase) {
                Some(entry) => {
                    let pcm = playlist.pcm(entry).await?;
                    Ok(Loaded::Phrase(Prepared {
                        pcm,
                        silence_seconds: entry.phrase.silence_seconds,
                        phrase_count: phrases.len(),
                    }))
                }
                None => Ok(Loaded::EndOfUnit {
                    phrase_count: phrases.len(),
                }),
            }
        }
        .boxed();
        self.enter(State::Loading { cursor, task });
    }

    fn start_phrase(&mut self, prepared: Prepared) -> ControlFlow<Result<()>> {
        let cursor = match self.take_state() {
            State::Loading { cursor, .. } => cursor,
            other => return self.restore(other),
        };
        match self.player.play_audio(
            prepared.pcm,
            prepared.silence_seconds,
            self.settings.params,
        ) {
            Ok(handle) => {
                self.enter(State::Playing {
                    cursor,
                    phrase_count: prepared.phrase_count,
                    handle,
                });
                ControlFlow::Continue(())
            }
            Err(e) => ControlFlow::Break(Err(e)),
        }
    }

    fn restart_prefetch(&mut self, cursor: Cursor) {
        if let Some(old) = self.prefetch.take() {
            old.abort();
        }
        self.prefetch = Some(spawn_prefetch(
            &self.playlist,
            cursor,
            self.settings.prefetch_phonemes,
        ));
    }

    /// Silence any output and stop prefetching, leaving the state idle.
    fn halt(&mut self) {
        match self.take_state() {
            State::Playing { handle, .. } => handle.stop(),
            State::Paused {
                resume: Some((paused, _)),
                ..
            } => drop(paused),
            _ => {}
        }
        if let Some(prefetch) = self.prefetch.take() {
            prefetch.abort();
        }
    }

    fn announce(&self, unit: usize) {
        if let Some(u) = self.playlist.units().get(unit) {
            debug!(target: "controller", unit, start = u.start_index, end = u.end_index, "Unit boundary");
            self.events.on_unit_boundary(u.start_index, u.end_index);
        }
    }

    fn take_state(&mut self) -> State {
        std::mem::replace(&mut self.state, State::Idle)
    }

    fn restore(&mut self, state: State) -> ControlFlow<Result<()>> {
        self.state = state;
        ControlFlow::Continue(())
    }

    fn enter(&mut self, state: State) {
        let cursor = state.cursor();
        debug!(
            target: "controller",
            to = state.name(),
            unit = cursor.map(|c| c.unit),
            phrase = cursor.map(|c| c.phrase),
            "Transition"
        );
        self.state = state;
    }

    fn finish(&mut self, result: Result<()>) {
        self.halt();
        self.playlist.shutdown();
        self.enter(State::Finished);
        match &result {
            Ok(()) => info!(target: "controller", "Speech finished"),
            Err(e) if e.is_cancellation() => info!(target: "controller", "Speech cancelled"),
            Err(e) => {
                error!(target: "controller", error = %e, "Speech failed");
                self.events.on_error(e);
            }
        }
        self.outcome.send_replace(Some(result));
    }
}
