//! Glue between a chat transport and the conversation engine.

use anyhow::Result;
use async_trait::async_trait;

use crate::conversation::{ConversationEngine, Inbound, Reply};

pub const THINKING_PLACEHOLDER: &str = "⏳ Думаю...";

/// Identifies a sent message so it can be removed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHandle(pub i64);

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `text` to the session. Transports that cannot address individual
    /// messages return `None`.
    async fn send(&self, session_id: &str, text: &str) -> Result<Option<MessageHandle>>;

    async fn delete(&self, session_id: &str, handle: MessageHandle) -> Result<()>;
}

/// Run one inbound event through the engine and deliver the reply.
///
/// The session is locked before anything is sent, so events for one session
/// are handled in call order. Events that may call the backend get a thinking
/// placeholder first; it is removed before the reply goes out. Delivery
/// failures are logged, never propagated: the session has already been
/// updated by then.
pub async fn dispatch(
    engine: &ConversationEngine,
    transport: &dyn Transport,
    session_id: &str,
    inbound: Inbound,
) -> Reply {
    let guard = engine.lock_session(session_id).await;

    let placeholder = if inbound.may_generate() {
        match transport.send(session_id, THINKING_PLACEHOLDER).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!("Failed to send placeholder to {}: {:#}", session_id, e);
                None
            }
        }
    } else {
        None
    };

    let reply = engine.handle_locked(&guard, inbound).await;

    if let Some(handle) = placeholder {
        if let Err(e) = transport.delete(session_id, handle).await {
            tracing::warn!("Failed to delete placeholder in {}: {:#}", session_id, e);
        }
    }

    for message in &reply.messages {
        if let Err(e) = transport.send(session_id, message).await {
            tracing::error!("Failed to deliver reply to {}: {:#}", session_id, e);
        }
    }

    reply
}
