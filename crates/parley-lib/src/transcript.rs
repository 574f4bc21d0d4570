//! Conversation transcript shared between the coordinator and the front end.
//!
//! The coordinator mutates it from background tasks; the front end reads
//! snapshots or, more usually, follows the [`TranscriptEvent`] channel and
//! renders text as it arrives.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use parley_core::types::{ChatMessage, Role};

/// One line of the visible conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEntry {
    Message(ChatMessage),
    /// System notice shown to the user, never sent to the model.
    Notice(String),
    /// A user message whose request failed before any reply arrived.
    Unanswered(ChatMessage),
}

/// Incremental transcript updates, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEvent {
    User(String),
    AssistantBegin,
    Fragment(String),
    AssistantEnd,
    Notice(String),
    /// Transient status line ("Response interrupted." etc.), not stored.
    Status(String),
}

#[derive(Default)]
struct State {
    entries: Vec<TranscriptEntry>,
    /// Index of the assistant message currently receiving fragments.
    open: Option<usize>,
}

#[derive(Clone)]
pub struct Transcript {
    state: Arc<Mutex<State>>,
    events: mpsc::UnboundedSender<TranscriptEvent>,
}

impl Transcript {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TranscriptEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let transcript = Self {
            state: Arc::new(Mutex::new(State::default())),
            events,
        };
        (transcript, rx)
    }

    pub fn push_user(&self, text: &str, name: Option<String>) {
        let msg = ChatMessage::new(Role::User, text).with_name(name);
        self.lock().entries.push(TranscriptEntry::Message(msg));
        self.emit(TranscriptEvent::User(text.to_string()));
    }

    /// Open an empty assistant message for the reply that is starting.
    pub fn begin_assistant(&self, name: Option<String>) {
        {
            let mut state = self.lock();
            let msg = ChatMessage::new(Role::Assistant, "").with_name(name);
            state.entries.push(TranscriptEntry::Message(msg));
            state.open = Some(state.entries.len() - 1);
        }
        self.emit(TranscriptEvent::AssistantBegin);
    }

    pub fn append_fragment(&self, fragment: &str) {
        {
            let mut state = self.lock();
            let Some(open) = state.open else {
                return;
            };
            if let Some(TranscriptEntry::Message(msg)) = state.entries.get_mut(open) {
                msg.content.push_str(fragment);
            }
        }
        self.emit(TranscriptEvent::Fragment(fragment.to_string()));
    }

    /// Close the open assistant message. A message that never received any
    /// text is removed. Returns the final reply text.
    pub fn end_assistant(&self) -> Option<String> {
        let text = {
            let mut state = self.lock();
            let open = state.open.take()?;
            match state.entries.get(open) {
                Some(TranscriptEntry::Message(msg)) if msg.content.is_empty() => {
                    state.entries.remove(open);
                    None
                }
                Some(TranscriptEntry::Message(msg)) => Some(msg.content.clone()),
                _ => None,
            }
        };
        self.emit(TranscriptEvent::AssistantEnd);
        text
    }

    /// Keep the most recent user message on screen but out of the model's
    /// history.
    pub fn retract_last_user(&self) {
        let mut state = self.lock();
        let last_user = state.entries.iter().rposition(
            |e| matches!(e, TranscriptEntry::Message(m) if m.role == Role::User),
        );
        if let Some(i) = last_user {
            if let TranscriptEntry::Message(msg) = state.entries[i].clone() {
                state.entries[i] = TranscriptEntry::Unanswered(msg);
            }
        }
    }

    pub fn push_notice(&self, text: impl Into<String>) {
        let text = text.into();
        self.lock().entries.push(TranscriptEntry::Notice(text.clone()));
        self.emit(TranscriptEvent::Notice(text));
    }

    pub fn status(&self, text: impl Into<String>) {
        self.emit(TranscriptEvent::Status(text.into()));
    }

    pub fn entries(&self) -> Vec<TranscriptEntry> {
        self.lock().entries.clone()
    }

    /// Messages to send to the model: everything except notices, unanswered
    /// user turns and the reply still streaming.
    pub fn history(&self) -> Vec<ChatMessage> {
        let state = self.lock();
        state
            .entries
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != state.open)
            .filter_map(|(_, e)| match e {
                TranscriptEntry::Message(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: TranscriptEvent) {
        // No front end listening is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<TranscriptEvent>) -> Vec<TranscriptEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn fragments_build_the_open_reply() {
        let (t, mut rx) = Transcript::new();
        t.push_user("hi", None);
        t.begin_assistant(Some("bot".into()));
        t.append_fragment("Hel");
        t.append_fragment("lo.");
        assert_eq!(t.end_assistant().as_deref(), Some("Hello."));

        let history = t.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "Hello.");
        assert_eq!(history[1].name.as_deref(), Some("bot"));

        assert_eq!(
            drain(&mut rx),
            vec![
                TranscriptEvent::User("hi".into()),
                TranscriptEvent::AssistantBegin,
                TranscriptEvent::Fragment("Hel".into()),
                TranscriptEvent::Fragment("lo.".into()),
                TranscriptEvent::AssistantEnd,
            ]
        );
    }

    #[test]
    fn streaming_reply_is_not_history_yet() {
        let (t, _rx) = Transcript::new();
        t.push_user("hi", None);
        t.begin_assistant(None);
        t.append_fragment("partial");
        assert_eq!(t.history().len(), 1);
    }

    #[test]
    fn empty_reply_is_dropped() {
        let (t, _rx) = Transcript::new();
        t.push_user("hi", None);
        t.begin_assistant(None);
        assert_eq!(t.end_assistant(), None);
        assert_eq!(t.entries().len(), 1);
    }

    #[test]
    fn fragments_without_open_reply_are_ignored() {
        let (t, mut rx) = Transcript::new();
        t.append_fragment("stray");
        assert!(t.entries().is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn retracted_user_message_stays_visible_but_leaves_history() {
        let (t, _rx) = Transcript::new();
        t.push_user("first", None);
        t.push_user("second", None);
        t.retract_last_user();
        t.push_notice("[Request Error] connection refused");

        let history = t.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "first");

        let entries = t.entries();
        assert!(matches!(&entries[1], TranscriptEntry::Unanswered(m) if m.content == "second"));
        assert!(matches!(&entries[2], TranscriptEntry::Notice(_)));
    }

    #[test]
    fn status_is_not_stored() {
        let (t, mut rx) = Transcript::new();
        t.status("Response interrupted.");
        assert!(t.entries().is_empty());
        assert_eq!(
            drain(&mut rx),
            vec![TranscriptEvent::Status("Response interrupted.".into())]
        );
    }
}
