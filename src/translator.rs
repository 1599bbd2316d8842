//! Turns the AnuNeko line stream for one turn into reply text.
//!
//! Each backend line is classified by [`parse_line`] into explicit [`TurnEvent`]s.
//! [`translate`] drives a spawned task that forwards text fragments through a
//! bounded channel, so the HTTP writer pulls one fragment at a time. When the
//! consumer goes away, forwarding stops but the remaining lines are still read
//! for their message ids: only the stream's last id is the assistant message,
//! and that is the one confirmed as branch 0 in a detached task.

use crate::backend::{BackendLine, ChatBackend, LineStream};
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub const DATA_PREFIX: &str = "data: ";
pub const BRANCH_CONFLICT_CODE: &str = "chat_choice_shown";
pub const BRANCH_CONFLICT_WARNING: &str =
    "⚠️ Conversation branch not selected yet, please retry or start a new conversation.";
pub const TRANSPORT_FALLBACK: &str = "Request failed, please try again later.";

const DEFAULT_BRANCH: f64 = 0.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    Blank,
    OutOfBand,
    EmptyPayload,
    Malformed,
    NoContent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    Text(String),
    MessageId(String),
    BranchConflict,
    Ignored(IgnoreReason),
}

/// Classifies one backend line. Never fails: unusable lines become [`TurnEvent::Ignored`].
pub fn parse_line(line: &str) -> Vec<TurnEvent> {
    if line.is_empty() {
        return vec![TurnEvent::Ignored(IgnoreReason::Blank)];
    }

    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        let conflict = serde_json::from_str::<Value>(line)
            .ok()
            .and_then(|v| v.get("code").and_then(|c| c.as_str()).map(str::to_owned))
            .is_some_and(|code| code == BRANCH_CONFLICT_CODE);
        return if conflict {
            vec![TurnEvent::BranchConflict]
        } else {
            vec![TurnEvent::Ignored(IgnoreReason::OutOfBand)]
        };
    };

    if payload.trim().is_empty() {
        return vec![TurnEvent::Ignored(IgnoreReason::EmptyPayload)];
    }
    let Ok(obj) = serde_json::from_str::<Value>(payload) else {
        return vec![TurnEvent::Ignored(IgnoreReason::Malformed)];
    };

    let mut events = Vec::new();
    match obj.get("msg_id") {
        Some(Value::String(id)) => events.push(TurnEvent::MessageId(id.clone())),
        Some(Value::Number(id)) => events.push(TurnEvent::MessageId(id.to_string())),
        _ => {}
    }

    if let Some(candidates) = obj.get("c").and_then(|c| c.as_array()) {
        for candidate in candidates {
            if !is_default_branch(candidate) {
                continue;
            }
            if let Some(text) = candidate.get("v").and_then(|v| v.as_str()) {
                events.push(TurnEvent::Text(text.to_string()));
            }
        }
    } else if let Some(text) = obj.get("v").and_then(|v| v.as_str()) {
        events.push(TurnEvent::Text(text.to_string()));
    }

    if events.is_empty() {
        events.push(TurnEvent::Ignored(IgnoreReason::NoContent));
    }
    events
}

// Non-object candidates are skipped; the rest of the list still counts.
fn is_default_branch(candidate: &Value) -> bool {
    let Some(obj) = candidate.as_object() else {
        return false;
    };
    match obj.get("c") {
        None => true,
        Some(idx) => idx.as_f64().is_some_and(|f| f == DEFAULT_BRANCH),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed { message_id: Option<String> },
    BranchConflict,
    TransportFailed,
    /// The consumer went away; the backend stream was drained for its last message id.
    Cancelled { message_id: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnItem {
    Fragment(String),
    Finished(TurnOutcome),
}

/// Single-pass stream of a turn. Ends with exactly one [`TurnItem::Finished`]
/// unless the producing task died.
pub type TurnStream = ReceiverStream<TurnItem>;

pub fn translate(lines: LineStream, backend: Arc<dyn ChatBackend>) -> TurnStream {
    let (tx, rx) = mpsc::channel::<TurnItem>(1);
    tokio::spawn(async move {
        let outcome = drive_turn(lines, &tx).await;
        match &outcome {
            TurnOutcome::Completed { message_id } | TurnOutcome::Cancelled { message_id } => {
                if let Some(msg_id) = message_id.clone() {
                    spawn_confirm_choice(backend, msg_id);
                }
            }
            TurnOutcome::BranchConflict => {
                metrics::counter!("nekobridge_branch_conflicts_total").increment(1);
            }
            TurnOutcome::TransportFailed => {}
        }
        tracing::debug!(outcome = ?outcome, "turn finished");
        let _ = tx.send(TurnItem::Finished(outcome)).await;
    });
    ReceiverStream::new(rx)
}

async fn drive_turn(mut lines: LineStream, tx: &mpsc::Sender<TurnItem>) -> TurnOutcome {
    let mut message_id: Option<String> = None;
    loop {
        let next = tokio::select! {
            _ = tx.closed() => return drain_message_id(lines, message_id).await,
            line = lines.next() => line,
        };
        let line = match next {
            None => return TurnOutcome::Completed { message_id },
            Some(BackendLine::TransportFailure(err)) => {
                tracing::warn!("turn stream broke: {err}");
                let _ = tx.send(TurnItem::Fragment(TRANSPORT_FALLBACK.to_string())).await;
                return TurnOutcome::TransportFailed;
            }
            Some(BackendLine::Line(line)) => line,
        };
        for event in parse_line(&line) {
            match event {
                TurnEvent::Text(text) => {
                    if text.is_empty() {
                        continue;
                    }
                    if tx.send(TurnItem::Fragment(text)).await.is_err() {
                        return drain_message_id(lines, message_id).await;
                    }
                }
                TurnEvent::MessageId(id) => message_id = Some(id),
                TurnEvent::BranchConflict => {
                    tracing::info!("backend reported an unselected branch");
                    let _ = tx
                        .send(TurnItem::Fragment(BRANCH_CONFLICT_WARNING.to_string()))
                        .await;
                    return TurnOutcome::BranchConflict;
                }
                TurnEvent::Ignored(reason) => {
                    tracing::trace!(reason = ?reason, "skipped backend line");
                }
            }
        }
    }
}

/// Reads what is left of a turn nobody listens to, tracking only message ids.
/// A conflict or broken transport means there is nothing safe to confirm.
async fn drain_message_id(mut lines: LineStream, mut message_id: Option<String>) -> TurnOutcome {
    tracing::debug!("consumer gone, draining turn for its final message id");
    while let Some(line) = lines.next().await {
        let line = match line {
            BackendLine::Line(line) => line,
            BackendLine::TransportFailure(err) => {
                tracing::warn!("turn stream broke after consumer left: {err}");
                return TurnOutcome::TransportFailed;
            }
        };
        for event in parse_line(&line) {
            match event {
                TurnEvent::MessageId(id) => message_id = Some(id),
                TurnEvent::BranchConflict => return TurnOutcome::BranchConflict,
                _ => {}
            }
        }
    }
    TurnOutcome::Cancelled { message_id }
}

fn spawn_confirm_choice(backend: Arc<dyn ChatBackend>, msg_id: String) {
    tokio::spawn(async move {
        if backend.confirm_choice(&msg_id, 0).await {
            tracing::debug!(msg_id = %msg_id, "branch 0 confirmed");
        }
    });
}

/// Drains a turn into one reply. A branch conflict or transport failure
/// replaces any partial text with the corresponding notice.
pub async fn collect_reply(mut turn: TurnStream) -> Option<String> {
    let mut reply = String::new();
    while let Some(item) = turn.next().await {
        match item {
            TurnItem::Fragment(text) => reply.push_str(&text),
            TurnItem::Finished(TurnOutcome::BranchConflict) => {
                return Some(BRANCH_CONFLICT_WARNING.to_string());
            }
            TurnItem::Finished(TurnOutcome::TransportFailed) => {
                return Some(TRANSPORT_FALLBACK.to_string());
            }
            TurnItem::Finished(_) => return Some(reply),
        }
    }
    None
}
