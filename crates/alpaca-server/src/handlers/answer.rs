//! `/answer` handlers.

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    response::{IntoResponse, Response},
    Json,
};
use tokio::time::{timeout, Instant};

use crate::{
    error::ServerError,
    models::{AnswerQuery, MessageBody},
    session::{Session, SessionError},
    state::AppState,
    streaming,
};

/// Validate the query and admit a new session.
///
/// Nothing reaches the queue unless the prompt is non-empty.
fn open_session(
    state: &AppState,
    query: Result<Query<AnswerQuery>, QueryRejection>,
) -> Result<Session, ServerError> {
    let Query(query) = query.map_err(|e| ServerError::InvalidRequest(e.body_text()))?;
    let info = query
        .info
        .ok_or_else(|| ServerError::InvalidRequest("missing `info` parameter".into()))?;

    let mut session = Session::create(&info, state.config.sampling.clone())?;
    state.queue.submit(&mut session)?;
    tracing::debug!(session = %session.id(), prompt_len = info.len(), "session admitted");
    Ok(session)
}

/// `GET /answer?info=...` → `{"message": <completion>}`.
pub async fn handle_answer(
    State(state): State<AppState>,
    query: Result<Query<AnswerQuery>, QueryRejection>,
) -> Result<Json<MessageBody>, ServerError> {
    let mut session = open_session(&state, query)?;

    match timeout(state.config.request_timeout, session.collect_text()).await {
        Ok(Ok(text)) => Ok(Json(MessageBody::new(text))),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => {
            session.cancel();
            tracing::warn!(
                session = %session.id(),
                partial_len = session.output().len(),
                timeout_ms = state.config.request_timeout.as_millis() as u64,
                "request timed out"
            );
            Err(SessionError::TimedOut.into())
        }
    }
}

/// `GET /answer/stream?info=...` → Server-Sent Events.
///
/// Validation and admission errors are returned as plain JSON before the
/// stream starts.
pub async fn handle_answer_stream(
    State(state): State<AppState>,
    query: Result<Query<AnswerQuery>, QueryRejection>,
) -> Result<Response, ServerError> {
    let session = open_session(&state, query)?;
    let deadline = Instant::now() + state.config.request_timeout;
    Ok(streaming::stream_answer(session, deadline).into_response())
}
