//! Manual reply support.
//!
//! Immediately before a Request-kind method is invoked, the dispatcher
//! installs a [`CallContextForReply`] in a task-local slot scoped to that
//! one dispatch. The method body may call [`send_response_manually`] to
//! take the context and send the response itself; whatever remains in
//! the slot after the method returns is used for the automatic send. The
//! scope ends with the dispatch, so a context can never leak into an
//! unrelated call executing later on the same worker.

use crate::channel::{Channel, SessionId};
use crate::error::{Error, Result};
use crate::message::Message;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Everything needed to send the response for one in-flight request.
#[derive(Clone)]
pub struct CallContextForReply {
    pub(crate) channel: Arc<dyn Channel>,
    pub(crate) session: SessionId,
    pub(crate) correlation_id: String,
    pub(crate) return_type: String,
    pub(crate) return_timeout: Option<Duration>,
}

/// Shared slot holding the reply context for one dispatch.
///
/// The dispatcher keeps a clone so it can tell, after the method
/// returns, whether a manual reply already consumed the context.
#[derive(Clone, Default)]
pub(crate) struct ReplyCell {
    slot: Arc<Mutex<Option<CallContextForReply>>>,
}

impl ReplyCell {
    pub(crate) fn new(context: CallContextForReply) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(context))),
        }
    }

    pub(crate) fn take(&self) -> Option<CallContextForReply> {
        self.slot.lock().take()
    }
}

tokio::task_local! {
    pub(crate) static REPLY_CONTEXT: ReplyCell;
}

/// Send the response for the request currently being dispatched on this
/// task, instead of letting the dispatcher send it automatically when
/// the method returns.
///
/// `timeout` overrides the operation's return timeout when given.
///
/// # Errors
///
/// Fails with [`Error::InvalidOperation`] when no request dispatch is in
/// progress on the current task, or when the response for this request
/// was already sent.
pub async fn send_response_manually(value: Bytes, timeout: Option<Duration>) -> Result<()> {
    let context = REPLY_CONTEXT
        .try_with(ReplyCell::take)
        .map_err(|_| {
            Error::InvalidOperation("no request dispatch in progress on this task".into())
        })?
        .ok_or_else(|| {
            Error::InvalidOperation("response for this request was already sent".into())
        })?;

    let timeout = timeout.or(context.return_timeout);
    let response = Message::response(
        context.correlation_id.clone(),
        context.return_type.clone(),
        value,
        None,
    )?;
    debug!(correlation_id = %context.correlation_id, "sending manual response");
    send_with_timeout(&context, response, timeout).await
}

pub(crate) async fn send_with_timeout(
    context: &CallContextForReply,
    response: Message,
    timeout: Option<Duration>,
) -> Result<()> {
    match timeout {
        Some(duration) => tokio::time::timeout(
            duration,
            context.channel.send_one_way(&context.session, response),
        )
        .await
        .map_err(|_| Error::Timeout(duration))?,
        None => context.channel.send_one_way(&context.session, response).await,
    }
}
