//! Server-Sent Events relay for `/answer/stream`.
//!
//! Event layout:
//! - `event: token`, one per generated token, data = token text
//! - `event: done`, data = the full answer
//! - `event: error`, data = generic message (`error`, `timeout`, `cancelled`)
//!
//! The stream owns the [`Session`]. When the client disconnects, axum drops
//! the stream, which drops the session and cancels its generation.

use std::convert::Infallible;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use tokio::time::{timeout_at, Instant};

use crate::error::ServerError;
use crate::session::{Session, SessionError};

pub fn stream_answer(
    mut session: Session,
    deadline: Instant,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        loop {
            let next = match timeout_at(deadline, session.next_token()).await {
                Ok(next) => next,
                Err(_) => {
                    session.cancel();
                    tracing::warn!(session = %session.id(), "stream timed out");
                    Err(SessionError::TimedOut)
                }
            };

            match next {
                Ok(Some(token)) => {
                    if !token.text.is_empty() {
                        yield Ok(Event::default().event("token").data(token.text));
                    }
                }
                Ok(None) => {
                    yield Ok(Event::default().event("done").data(session.output()));
                    break;
                }
                Err(e) => {
                    tracing::warn!(session = %session.id(), error = %e, "stream ended early");
                    let (_, message) = ServerError::from(e).status_and_message();
                    yield Ok(Event::default().event("error").data(message));
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
