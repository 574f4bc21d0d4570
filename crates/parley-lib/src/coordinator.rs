//! Stream coordinator — model stream → transcript + chunker → renders → playback.
//!
//! ```text
//! stream_chat ──fragment──▶ Transcript (immediately)
//!                  │
//!                  └──▶ TextChunker ──unit──▶ render task (≤2 in flight)
//!                                                 │
//!                                   enqueue(session, audio) ──▶ PlaybackQueue
//! ```
//!
//! One reply is active at a time. Sending a new message cancels the previous
//! reply first: its stream is dropped, its render tasks are aborted and its
//! playback session is cancelled before the new request goes out.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::StreamExt;
use tokio::sync::{Mutex, Semaphore, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_core::chunker::{DEFAULT_MAX_UNIT_LEN, TextChunker};
use parley_core::text_prep::{clean_text_for_tts, is_speakable};
use parley_core::types::{
    ChatMessage, ChatRequest, ChatSettings, PlaybackState, RenderedAudio, ReplyOutcome, Role,
    SpeakableUnit,
};

use crate::completion::CompletionClient;
use crate::context::VoiceContext;
use crate::error::ChatError;
use crate::transcript::{Transcript, TranscriptEvent};

/// Renders allowed in flight per reply: one feeding playback, one prefetching.
const MAX_CONCURRENT_RENDERS: usize = 2;

pub struct StreamCoordinator {
    inner: Arc<Inner>,
    active: Mutex<Option<ActiveReply>>,
}

struct Inner {
    client: Arc<dyn CompletionClient>,
    voice: Option<Arc<VoiceContext>>,
    transcript: Transcript,
    settings: ChatSettings,
    max_unit_len: usize,
    audio_enabled: AtomicBool,
}

struct ActiveReply {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Handle to one reply in progress.
pub struct ReplyHandle {
    cancel: CancellationToken,
    done: oneshot::Receiver<ReplyOutcome>,
}

impl ReplyHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the text has finished streaming and its audio has
    /// finished playing.
    pub async fn finished(self) -> ReplyOutcome {
        self.done.await.unwrap_or(ReplyOutcome::Interrupted)
    }
}

impl StreamCoordinator {
    /// `voice` is `None` when speech could not be set up; replies are then
    /// text-only regardless of the audio toggle.
    pub fn new(
        client: Arc<dyn CompletionClient>,
        voice: Option<Arc<VoiceContext>>,
        settings: ChatSettings,
    ) -> (Self, tokio::sync::mpsc::UnboundedReceiver<TranscriptEvent>) {
        let (transcript, events) = Transcript::new();
        let max_unit_len = voice
            .as_ref()
            .map_or(DEFAULT_MAX_UNIT_LEN, |v| v.config().max_unit_len);
        let audio_enabled = AtomicBool::new(settings.audio_enabled);

        let coordinator = Self {
            inner: Arc::new(Inner {
                client,
                voice,
                transcript,
                settings,
                max_unit_len,
                audio_enabled,
            }),
            active: Mutex::new(None),
        };
        (coordinator, events)
    }

    /// Send a user message, interrupting any reply still in progress.
    pub async fn send(&self, text: &str) -> ReplyHandle {
        let mut active = self.active.lock().await;
        if let Some(prev) = active.take() {
            debug!("stream: interrupting previous reply");
            prev.cancel.cancel();
            let _ = prev.task.await;
        }

        let inner = &self.inner;
        inner
            .transcript
            .push_user(text, inner.settings.user_name.clone());
        let request = inner.build_request();

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();
        let task = tokio::spawn({
            let inner = Arc::clone(inner);
            let cancel = cancel.clone();
            async move {
                let outcome = inner.run_reply(request, cancel).await;
                debug!("stream: reply finished: {outcome:?}");
                let _ = done_tx.send(outcome);
            }
        });

        *active = Some(ActiveReply {
            cancel: cancel.clone(),
            task,
        });
        ReplyHandle {
            cancel,
            done: done_rx,
        }
    }

    /// Interrupt the active reply and wait for it to wind down.
    pub async fn stop(&self) {
        if let Some(prev) = self.active.lock().await.take() {
            prev.cancel.cancel();
            let _ = prev.task.await;
        }
    }

    /// Turn speech on or off for subsequent replies. Turning it off also
    /// silences whatever is playing now.
    pub fn set_audio_enabled(&self, enabled: bool) {
        self.inner.audio_enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            if let Some(voice) = &self.inner.voice {
                let playback = voice.playback();
                playback.cancel(playback.current_session());
            }
        }
        info!("audio {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn audio_enabled(&self) -> bool {
        self.inner.audio_enabled.load(Ordering::SeqCst)
    }

    pub fn transcript(&self) -> &Transcript {
        &self.inner.transcript
    }
}

impl Inner {
    fn build_request(&self) -> ChatRequest {
        let mut messages = Vec::new();
        if !self.settings.system_prompt.is_empty() {
            messages.push(ChatMessage::new(
                Role::System,
                self.settings.system_prompt.as_str(),
            ));
        }
        messages.extend(self.transcript.history());

        ChatRequest {
            model: self.settings.model.clone(),
            messages,
            params: self.settings.params.clone(),
        }
    }

    async fn run_reply(self: Arc<Self>, request: ChatRequest, cancel: CancellationToken) -> ReplyOutcome {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return self.interrupted(None, false),
            opened = self.client.stream_chat(&request) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => return self.failed_before_reply(e),
        };

        let mut chunker = TextChunker::new(self.max_unit_len);
        let mut speech: Option<SpeechSession> = None;
        let mut started = false;
        let mut fragments = 0usize;

        let failure = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.interrupted(speech, started),
                next = stream.next() => next,
            };

            match next {
                None => break None,
                Some(Err(e)) => break Some(e),
                Some(Ok(fragment)) => {
                    if fragment.is_empty() {
                        continue;
                    }
                    if !started {
                        started = true;
                        self.transcript
                            .begin_assistant(self.settings.assistant_name.clone());
                        speech = self.start_speech(&cancel);
                    }

                    fragments += 1;
                    self.transcript.append_fragment(&fragment);
                    if let Some(speech) = speech.as_mut() {
                        for unit in chunker.feed(&fragment) {
                            speech.dispatch(unit);
                        }
                    }
                }
            }
        };
        drop(stream);

        if !started {
            return match failure {
                Some(e) => self.failed_before_reply(e),
                None => {
                    info!("stream: empty reply");
                    self.transcript.retract_last_user();
                    self.transcript.status("No response.");
                    ReplyOutcome::Completed
                }
            };
        }

        debug!("stream: {fragments} fragments received");
        if let Some(speech) = speech.as_mut() {
            if let Some(unit) = chunker.flush() {
                speech.dispatch(unit);
            }
        }
        self.transcript.end_assistant();

        let outcome = match failure {
            None => ReplyOutcome::Completed,
            Some(e) => {
                warn!("stream: failed mid-reply: {e}");
                let message = e.to_string();
                self.transcript.push_notice(error_notice(&e));
                self.transcript.status("Request failed.");
                ReplyOutcome::Failed {
                    message,
                    partial: true,
                }
            }
        };

        if let Some(speech) = speech {
            match speech.finish(&cancel).await {
                PlaybackState::Unavailable(reason) => {
                    self.transcript
                        .push_notice(format!("[Audio Error] {reason}"));
                }
                PlaybackState::Cancelled if cancel.is_cancelled() => {
                    self.transcript.status("Response interrupted.");
                    return ReplyOutcome::Interrupted;
                }
                _ => {}
            }
        }

        outcome
    }

    fn start_speech(&self, cancel: &CancellationToken) -> Option<SpeechSession> {
        if !self.audio_enabled.load(Ordering::SeqCst) {
            return None;
        }
        let voice = self.voice.as_ref()?;
        Some(SpeechSession::start(Arc::clone(voice), cancel.child_token()))
    }

    fn interrupted(&self, speech: Option<SpeechSession>, started: bool) -> ReplyOutcome {
        if let Some(mut speech) = speech {
            speech.abort();
        }
        if started {
            self.transcript.end_assistant();
        } else {
            self.transcript.retract_last_user();
        }
        info!("stream: reply interrupted");
        self.transcript.status("Response interrupted.");
        ReplyOutcome::Interrupted
    }

    fn failed_before_reply(&self, e: ChatError) -> ReplyOutcome {
        warn!("stream: request failed: {e}");
        self.transcript.retract_last_user();
        self.transcript.push_notice(error_notice(&e));
        self.transcript.status("Request failed.");
        ReplyOutcome::Failed {
            message: e.to_string(),
            partial: false,
        }
    }
}

fn error_notice(e: &ChatError) -> String {
    match e {
        ChatError::Malformed(_) => format!("[Client Error] {e}"),
        _ => format!("[Request Error] {e}"),
    }
}

// ─── Speech for one reply ──────────────────────────────────────────────────

/// Render tasks and playback session belonging to one reply. Dropping it
/// aborts any render still running.
struct SpeechSession {
    voice: Arc<VoiceContext>,
    session: u64,
    dispatched: usize,
    renders: JoinSet<()>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl SpeechSession {
    fn start(voice: Arc<VoiceContext>, cancel: CancellationToken) -> Self {
        let session = voice.playback().begin();
        debug!("playback: reply uses session {session}");
        Self {
            voice,
            session,
            dispatched: 0,
            renders: JoinSet::new(),
            permits: Arc::new(Semaphore::new(MAX_CONCURRENT_RENDERS)),
            cancel,
        }
    }

    fn dispatch(&mut self, unit: SpeakableUnit) {
        let SpeakableUnit { index, text } = unit;
        self.dispatched = index + 1;

        let text = clean_text_for_tts(&text);
        if !is_speakable(&text) {
            debug!("render[{index}]: nothing to say, skipping");
            self.voice.playback().skip(self.session, index);
            return;
        }

        let voice = Arc::clone(&self.voice);
        let permits = Arc::clone(&self.permits);
        let cancel = self.cancel.clone();
        let session = self.session;

        self.renders.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if cancel.is_cancelled() || !voice.playback().accepts(session) {
                return;
            }

            let rendered = tokio::select! {
                _ = cancel.cancelled() => return,
                rendered = voice.render(&text) => rendered,
            };
            match rendered {
                Ok(waveform) => {
                    debug!("render[{index}]: {:?} of audio", waveform.duration());
                    voice
                        .playback()
                        .enqueue(session, RenderedAudio { index, waveform });
                }
                Err(e) => {
                    warn!("render[{index}]: {e}, skipping");
                    voice.playback().skip(session, index);
                }
            }
        });
    }

    /// Tell playback how many units to expect and wait for it to finish.
    async fn finish(mut self, cancel: &CancellationToken) -> PlaybackState {
        let playback = self.voice.playback().clone();
        playback.end_of_input(self.session, self.dispatched);

        tokio::select! {
            _ = cancel.cancelled() => {
                self.abort();
                PlaybackState::Cancelled
            }
            state = playback.wait_finished(self.session) => state,
        }
    }

    fn abort(&mut self) {
        self.cancel.cancel();
        self.renders.abort_all();
        self.voice.playback().cancel(self.session);
    }
}
