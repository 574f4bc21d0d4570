//! Ordered playback queue — reorder buffer → audio sink on its own thread.
//!
//! ```text
//! render tasks ──enqueue(session, audio)──▶ [cmd_tx] ──▶ playback thread
//!                                                     ReorderBuffer → AudioSink
//! ```
//!
//! Renders finish out of order, so the playback thread keeps a
//! [`ReorderBuffer`] and only appends a waveform to the sink once every lower
//! index has been appended or skipped. The sink plays appended audio back to
//! back.
//!
//! Each reply gets a session number from [`PlaybackQueue::begin`]. Commands
//! tagged with any other session are dropped, so a render that finishes after
//! its reply was cancelled can't leak into the next one. The audio device is
//! opened on `begin` and released when the session completes or is cancelled.
//!
//! rodio's `OutputStream` is `!Send`, which is why the sink is created and
//! owned by the playback thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, Sink};
use tokio::sync::watch;
use tracing::{debug, warn};

use parley_core::reorder::ReorderBuffer;
use parley_core::types::{PlaybackState, PlaybackStatus, RenderedAudio, Waveform};

use crate::error::PlaybackError;

/// How often the playback thread checks whether the sink has drained.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Audio output device.
pub trait AudioSink {
    /// Queue audio after whatever is already playing.
    fn append(&mut self, waveform: Waveform);
    /// Nothing left to play.
    fn is_idle(&self) -> bool;
    /// Stop immediately and drop queued audio.
    fn clear(&mut self);
}

/// Opens a sink on the playback thread.
pub type SinkFactory = Box<dyn FnMut() -> Result<Box<dyn AudioSink>, PlaybackError> + Send>;

/// Default output device via rodio.
pub struct RodioSink {
    _stream: OutputStream,
    sink: Sink,
}

impl RodioSink {
    pub fn open() -> Result<Self, PlaybackError> {
        let (stream, handle) =
            OutputStream::try_default().map_err(|e| PlaybackError::NoDevice(e.to_string()))?;
        let sink = Sink::try_new(&handle).map_err(|e| PlaybackError::NoDevice(e.to_string()))?;
        Ok(Self {
            _stream: stream,
            sink,
        })
    }
}

impl AudioSink for RodioSink {
    fn append(&mut self, waveform: Waveform) {
        self.sink.append(SamplesBuffer::new(
            waveform.channels,
            waveform.sample_rate,
            waveform.samples,
        ));
    }

    fn is_idle(&self) -> bool {
        self.sink.empty()
    }

    fn clear(&mut self) {
        self.sink.stop();
    }
}

// ─── Handle ────────────────────────────────────────────────────────────────

enum PlayCmd {
    Begin { session: u64 },
    /// `None` marks a unit that produced no audio.
    Audio { session: u64, index: usize, waveform: Option<Waveform> },
    EndOfInput { session: u64, total: usize },
    Cancel { session: u64 },
}

/// Cloneable handle to the playback thread. All methods are non-blocking.
#[derive(Clone)]
pub struct PlaybackQueue {
    cmd_tx: Sender<PlayCmd>,
    status_rx: watch::Receiver<PlaybackStatus>,
    sessions: Arc<AtomicU64>,
}

impl PlaybackQueue {
    /// Spawn the playback thread. `open_sink` is called on that thread at the
    /// start of every session.
    pub fn spawn(open_sink: SinkFactory) -> Result<Self, PlaybackError> {
        let (cmd_tx, cmd_rx) = std::sync::mpsc::channel();
        let (status_tx, status_rx) = watch::channel(PlaybackStatus {
            session: 0,
            state: PlaybackState::Idle,
            pending: 0,
        });

        std::thread::Builder::new()
            .name("parley-playback".into())
            .spawn(move || Player::new(open_sink, status_tx).run(cmd_rx))?;

        Ok(Self {
            cmd_tx,
            status_rx,
            sessions: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Playback queue on the default output device.
    pub fn with_default_output() -> Result<Self, PlaybackError> {
        Self::spawn(Box::new(|| {
            RodioSink::open().map(|sink| Box::new(sink) as Box<dyn AudioSink>)
        }))
    }

    /// Start a new session, stopping whatever the previous one was playing.
    pub fn begin(&self) -> u64 {
        let session = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.send(PlayCmd::Begin { session });
        session
    }

    /// Hand over the audio rendered for one unit.
    pub fn enqueue(&self, session: u64, audio: RenderedAudio) {
        self.send(PlayCmd::Audio {
            session,
            index: audio.index,
            waveform: Some(audio.waveform),
        });
    }

    /// Mark unit `index` as silent so later units aren't held back by it.
    pub fn skip(&self, session: u64, index: usize) {
        self.send(PlayCmd::Audio {
            session,
            index,
            waveform: None,
        });
    }

    /// No more units beyond `total` will arrive for this session.
    pub fn end_of_input(&self, session: u64, total: usize) {
        self.send(PlayCmd::EndOfInput { session, total });
    }

    /// Stop playback and drop queued audio, if `session` is still current.
    pub fn cancel(&self, session: u64) {
        self.send(PlayCmd::Cancel { session });
    }

    /// Most recently started session.
    pub fn current_session(&self) -> u64 {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Whether audio for `session` would still be played.
    pub fn accepts(&self, session: u64) -> bool {
        if self.current_session() != session {
            return false;
        }
        let status = self.status_rx.borrow();
        !(status.session == session && status.state.is_finished())
    }

    pub fn status(&self) -> PlaybackStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackStatus> {
        self.status_rx.clone()
    }

    /// Wait until `session` completes, is cancelled or superseded, or turns
    /// out to have no audio device.
    pub async fn wait_finished(&self, session: u64) -> PlaybackState {
        let mut rx = self.status_rx.clone();
        let result = rx
            .wait_for(|s| s.session > session || (s.session == session && s.state.is_finished()))
            .await;
        match result {
            Ok(status) if status.session == session => status.state.clone(),
            _ => PlaybackState::Cancelled,
        }
    }

    fn send(&self, cmd: PlayCmd) {
        if self.cmd_tx.send(cmd).is_err() {
            warn!("playback: thread is gone, dropping command");
        }
    }
}

// ─── Playback thread ───────────────────────────────────────────────────────

struct Player {
    open_sink: SinkFactory,
    sink: Option<Box<dyn AudioSink>>,
    reorder: ReorderBuffer<Option<Waveform>>,
    session: u64,
    state: PlaybackState,
    expected: Option<usize>,
    status_tx: watch::Sender<PlaybackStatus>,
}

impl Player {
    fn new(open_sink: SinkFactory, status_tx: watch::Sender<PlaybackStatus>) -> Self {
        Self {
            open_sink,
            sink: None,
            reorder: ReorderBuffer::new(),
            session: 0,
            state: PlaybackState::Idle,
            expected: None,
            status_tx,
        }
    }

    fn run(mut self, cmd_rx: Receiver<PlayCmd>) {
        loop {
            // Poll while audio is out so completion is noticed without a command.
            let cmd = if self.sink.is_some() {
                match cmd_rx.recv_timeout(POLL_INTERVAL) {
                    Ok(cmd) => Some(cmd),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            } else {
                match cmd_rx.recv() {
                    Ok(cmd) => Some(cmd),
                    Err(_) => break,
                }
            };

            if let Some(cmd) = cmd {
                self.handle(cmd);
            }
            self.check_complete();
        }

        self.release();
        debug!("playback: thread exiting");
    }

    fn handle(&mut self, cmd: PlayCmd) {
        match cmd {
            PlayCmd::Begin { session } => {
                self.release();
                self.reorder.reset();
                self.expected = None;
                self.session = session;

                match (self.open_sink)() {
                    Ok(sink) => {
                        debug!("playback: session {session} started");
                        self.sink = Some(sink);
                        self.set_state(PlaybackState::Playing);
                    }
                    Err(e) => {
                        warn!("playback: session {session} has no audio: {e}");
                        self.set_state(PlaybackState::Unavailable(e.to_string()));
                    }
                }
            }

            PlayCmd::Audio {
                session,
                index,
                waveform,
            } => {
                if session != self.session || self.state.is_finished() {
                    debug!("playback: dropping unit {index} of stale session {session}");
                    return;
                }
                if !self.reorder.insert(index, waveform) {
                    debug!("playback: unit {index} already handled");
                    return;
                }

                while let Some(slot) = self.reorder.pop_ready() {
                    let released = self.reorder.next_index() - 1;
                    match (slot, self.sink.as_mut()) {
                        (Some(waveform), Some(sink)) => {
                            debug!(
                                "playback: unit {released} appended ({:?})",
                                waveform.duration()
                            );
                            sink.append(waveform);
                        }
                        _ => debug!("playback: unit {released} skipped"),
                    }
                }
                self.publish();
            }

            PlayCmd::EndOfInput { session, total } => {
                if session == self.session && !self.state.is_finished() {
                    debug!("playback: session {session} expects {total} units");
                    self.expected = Some(total);
                }
            }

            PlayCmd::Cancel { session } => {
                if session == self.session && !self.state.is_finished() {
                    debug!("playback: session {session} cancelled");
                    self.release();
                    self.reorder.reset();
                    self.expected = None;
                    self.set_state(PlaybackState::Cancelled);
                }
            }
        }
    }

    /// Finish the session once every expected unit has been released and the
    /// sink has drained.
    fn check_complete(&mut self) {
        if self.state != PlaybackState::Playing {
            return;
        }
        let Some(total) = self.expected else {
            return;
        };
        if self.reorder.next_index() < total {
            return;
        }
        if self.sink.as_ref().is_some_and(|s| !s.is_idle()) {
            return;
        }

        debug!("playback: session {} complete", self.session);
        self.release();
        self.expected = None;
        self.set_state(PlaybackState::Complete);
    }

    fn release(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            sink.clear();
        }
    }

    fn set_state(&mut self, state: PlaybackState) {
        self.state = state;
        self.publish();
    }

    fn publish(&self) {
        self.status_tx.send_replace(PlaybackStatus {
            session: self.session,
            state: self.state.clone(),
            pending: self.reorder.pending_len(),
        });
    }
}
