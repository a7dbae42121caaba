//! One in-flight generation request.
//!
//! A [`Session`] is created by the request handler, submitted to the
//! [`GenerationQueue`](crate::queue::GenerationQueue), and then pulled token
//! by token. The queue worker holds the other half of the session (a
//! [`SessionShared`]) and reports through a bounded event channel.
//!
//! ```text
//! Created ──submit──▶ Queued ──promote──▶ Active ──▶ Completed
//!    │                  │                    └─────▶ Cancelled
//!    │                  ├──cancel──────────────────▶ Cancelled
//!    └──queue full─────────────────────────────────▶ Rejected
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use alpaca_engine::{GenerationError, Prompt, SamplingConfig, Token, ValidationError};
use futures::stream::{self, Stream};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use crate::queue::QueueSlot;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Validated but not yet submitted.
    Created,
    Queued,
    Active,
    /// Stream ended, normally or with a generation error.
    Completed,
    Cancelled,
    Rejected,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Rejected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("generation queue is full")]
    QueueFull,

    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("session cancelled")]
    Cancelled,

    #[error("session timed out")]
    TimedOut,

    #[error("generation worker is not running")]
    WorkerUnavailable,

    #[error("session was already submitted")]
    AlreadySubmitted,

    #[error("session was never submitted")]
    NotSubmitted,
}

/// Message from the worker to the session that owns a generation.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    Token(Token),
    Done,
    Failed(GenerationError),
    Cancelled,
}

/// How a generation left the `Active` state.
#[derive(Debug)]
pub(crate) enum Outcome {
    Finished,
    Failed(GenerationError),
    Cancelled,
}

impl Outcome {
    pub(crate) fn into_event(self) -> SessionEvent {
        match self {
            Outcome::Finished => SessionEvent::Done,
            Outcome::Failed(e) => SessionEvent::Failed(e),
            Outcome::Cancelled => SessionEvent::Cancelled,
        }
    }
}

struct Lifecycle {
    state: SessionState,
    /// Held from admission until the session reaches a terminal state.
    slot: Option<QueueSlot>,
}

/// State shared between a [`Session`] and the queue worker.
pub(crate) struct SessionShared {
    lifecycle: Mutex<Lifecycle>,
    cancel: CancellationToken,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Created,
                slot: None,
            }),
            cancel: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> SessionState {
        self.lock().state
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the session is cancelled.
    pub(crate) fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// `Created → Queued`, taking ownership of the admission slot.
    pub(crate) fn enqueue(&self, slot: QueueSlot) -> Result<(), SessionError> {
        let mut life = self.lock();
        match life.state {
            SessionState::Created if self.cancel.is_cancelled() => Err(SessionError::Cancelled),
            SessionState::Created => {
                life.state = SessionState::Queued;
                life.slot = Some(slot);
                Ok(())
            }
            _ => Err(SessionError::AlreadySubmitted),
        }
    }

    /// `Queued → Rejected`, for a submission that could not be handed to the worker.
    pub(crate) fn abandon(&self) {
        let mut life = self.lock();
        if let Some(slot) = life.slot.take() {
            slot.counters().unqueued();
        }
        life.state = SessionState::Rejected;
    }

    pub(crate) fn reject(&self) {
        self.lock().state = SessionState::Rejected;
    }

    /// `Queued → Active`. Returns false if the session was cancelled first.
    pub(crate) fn try_activate(&self) -> bool {
        let mut life = self.lock();
        if life.state != SessionState::Queued {
            return false;
        }
        if self.cancel.is_cancelled() {
            Self::cancel_queued(&mut life);
            return false;
        }
        life.state = SessionState::Active;
        if let Some(slot) = &life.slot {
            slot.counters().promoted();
        }
        true
    }

    /// `Active → Completed | Cancelled`, releasing the admission slot.
    pub(crate) fn retire(&self, outcome: &Outcome) {
        let mut life = self.lock();
        if life.state != SessionState::Active {
            return;
        }
        life.state = match outcome {
            Outcome::Cancelled => SessionState::Cancelled,
            _ => SessionState::Completed,
        };
        if let Some(slot) = life.slot.take() {
            slot.counters().retired(outcome);
        }
    }

    /// Raise the cancellation flag. A queued session gives up its slot here.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
        let mut life = self.lock();
        match life.state {
            SessionState::Created => life.state = SessionState::Cancelled,
            SessionState::Queued => Self::cancel_queued(&mut life),
            _ => {}
        }
    }

    fn cancel_queued(life: &mut Lifecycle) {
        life.state = SessionState::Cancelled;
        if let Some(slot) = life.slot.take() {
            slot.counters().cancelled_while_queued();
        }
    }
}

/// A validated generation request and the consumer side of its output.
pub struct Session {
    id: Uuid,
    prompt: Prompt,
    config: SamplingConfig,
    shared: Arc<SessionShared>,
    events: Option<mpsc::Receiver<SessionEvent>>,
    output: String,
    end: Option<Result<(), SessionError>>,
}

impl Session {
    /// Validate the prompt and sampling configuration.
    pub fn create(prompt: &str, config: SamplingConfig) -> Result<Self, ValidationError> {
        let prompt = Prompt::new(prompt)?;
        config.validate()?;
        Ok(Self {
            id: Uuid::new_v4(),
            prompt,
            config,
            shared: Arc::new(SessionShared::new()),
            events: None,
            output: String::new(),
            end: None,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn prompt(&self) -> &Prompt {
        &self.prompt
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Text received so far, in generation order.
    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// Stop the session. No token is yielded after this returns.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    pub(crate) fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    pub(crate) fn is_submitted(&self) -> bool {
        self.events.is_some()
    }

    pub(crate) fn attach(&mut self, events: mpsc::Receiver<SessionEvent>) {
        self.events = Some(events);
    }

    /// Wait for the next token.
    ///
    /// `Ok(None)` marks the end of the stream. Once the session has ended,
    /// every further call repeats the same result.
    pub async fn next_token(&mut self) -> Result<Option<Token>, SessionError> {
        if let Some(end) = &self.end {
            return end.clone().map(|()| None);
        }
        if self.shared.is_cancelled() {
            return self.finish(Err(SessionError::Cancelled));
        }
        let cancel = self.shared.cancel.clone();
        let events = self.events.as_mut().ok_or(SessionError::NotSubmitted)?;

        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => Some(SessionEvent::Cancelled),
            event = events.recv() => event,
        };

        match event {
            Some(SessionEvent::Token(token)) => {
                self.output.push_str(&token.text);
                Ok(Some(token))
            }
            Some(SessionEvent::Done) => self.finish(Ok(())),
            Some(SessionEvent::Failed(e)) => self.finish(Err(SessionError::Generation(e))),
            Some(SessionEvent::Cancelled) => self.finish(Err(SessionError::Cancelled)),
            None => self.finish(Err(SessionError::WorkerUnavailable)),
        }
    }

    fn finish(&mut self, end: Result<(), SessionError>) -> Result<Option<Token>, SessionError> {
        if end.is_err() {
            if let Some(events) = self.events.as_mut() {
                events.close();
            }
        }
        self.end = Some(end.clone());
        end.map(|()| None)
    }

    /// The remaining tokens as a stream. Stops after the first error.
    pub fn tokens(&mut self) -> impl Stream<Item = Result<Token, SessionError>> + '_ {
        stream::unfold((self, false), |(session, done)| async move {
            if done {
                return None;
            }
            match session.next_token().await {
                Ok(Some(token)) => Some((Ok(token), (session, false))),
                Ok(None) => None,
                Err(e) => Some((Err(e), (session, true))),
            }
        })
    }

    /// Drain the stream and return the full output.
    pub async fn collect_text(&mut self) -> Result<String, SessionError> {
        while self.next_token().await?.is_some() {}
        Ok(self.output.clone())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("output_len", &self.output.len())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_rejects_empty_prompt() {
        for prompt in ["", "   ", "\n\t"] {
            let err = Session::create(prompt, SamplingConfig::default()).unwrap_err();
            assert_eq!(err, ValidationError::EmptyPrompt);
        }
    }

    #[test]
    fn create_rejects_bad_config() {
        let config = SamplingConfig::default().with_n_predict(0);
        let err = Session::create("Say hello", config).unwrap_err();
        assert!(matches!(err, ValidationError::OutOfRange { field: "n_predict", .. }));
    }

    #[test]
    fn new_session_is_created_and_empty() {
        let session = Session::create("Say hello", SamplingConfig::default()).unwrap();
        assert_eq!(session.state(), SessionState::Created);
        assert_eq!(session.prompt().as_str(), "Say hello");
        assert_eq!(session.output(), "");
        assert!(!session.is_cancelled());
    }

    #[test]
    fn cancel_before_submit() {
        let session = Session::create("Say hello", SamplingConfig::default()).unwrap();
        session.cancel();
        assert_eq!(session.state(), SessionState::Cancelled);
        assert!(session.is_cancelled());
    }

    #[tokio::test]
    async fn unsubmitted_session_has_no_tokens() {
        let mut session = Session::create("Say hello", SamplingConfig::default()).unwrap();
        assert_eq!(session.next_token().await, Err(SessionError::NotSubmitted));
    }

    #[tokio::test]
    async fn events_accumulate_output() {
        let mut session = Session::create("Say hello", SamplingConfig::default()).unwrap();
        let (tx, rx) = mpsc::channel(8);
        session.attach(rx);
        tx.send(SessionEvent::Token(Token::new(1, "Hel"))).await.unwrap();
        tx.send(SessionEvent::Token(Token::new(2, "lo"))).await.unwrap();
        tx.send(SessionEvent::Done).await.unwrap();

        assert_eq!(session.collect_text().await.unwrap(), "Hello");
        assert_eq!(session.next_token().await, Ok(None));
    }

    #[tokio::test]
    async fn failure_is_sticky() {
        let mut session = Session::create("Say hello", SamplingConfig::default()).unwrap();
        let (tx, rx) = mpsc::channel(8);
        session.attach(rx);
        tx.send(SessionEvent::Token(Token::new(1, "a"))).await.unwrap();
        tx.send(SessionEvent::Failed(GenerationError::Backend("boom".into())))
            .await
            .unwrap();

        let err = session.collect_text().await.unwrap_err();
        assert!(matches!(err, SessionError::Generation(GenerationError::Backend(_))));
        assert_eq!(session.next_token().await, Err(err));
        assert_eq!(session.output(), "a");
    }

    #[tokio::test]
    async fn cancel_wins_over_buffered_tokens() {
        let mut session = Session::create("Say hello", SamplingConfig::default()).unwrap();
        let (tx, rx) = mpsc::channel(8);
        session.attach(rx);
        tx.send(SessionEvent::Token(Token::new(1, "a"))).await.unwrap();
        session.cancel();

        assert_eq!(session.next_token().await, Err(SessionError::Cancelled));
        assert_eq!(session.output(), "");
        assert!(tx.send(SessionEvent::Done).await.is_err());
    }

    #[tokio::test]
    async fn closed_channel_means_worker_gone() {
        let mut session = Session::create("Say hello", SamplingConfig::default()).unwrap();
        let (tx, rx) = mpsc::channel(1);
        session.attach(rx);
        drop(tx);
        assert_eq!(
            session.next_token().await,
            Err(SessionError::WorkerUnavailable)
        );
    }

    #[tokio::test]
    async fn token_stream_stops_after_error() {
        use futures::StreamExt;

        let mut session = Session::create("Say hello", SamplingConfig::default()).unwrap();
        let (tx, rx) = mpsc::channel(8);
        session.attach(rx);
        tx.send(SessionEvent::Token(Token::new(1, "x"))).await.unwrap();
        tx.send(SessionEvent::Failed(GenerationError::OutOfMemory("kv".into())))
            .await
            .unwrap();

        let items: Vec<_> = session.tokens().collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
    }
}
