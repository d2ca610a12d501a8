use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use wirehome_cloud_protocol::{new_correlation_id, ChannelIdentifier, CloudMessage};

use crate::channel::{ConnectorChannel, ReceiveResult};
use crate::error::{ChannelError, InvokeError};
use crate::statistics::ChannelStatisticsSnapshot;

/// Result of offering an inbound message to an [`InboundHandler`].
#[derive(Debug)]
pub enum Dispatch {
    Handled,
    /// Not for this handler; the message is passed on to the next one.
    Declined(CloudMessage),
}

/// Consumer of messages that do not answer a pending request.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, session: &Arc<OpenChannel>, message: CloudMessage) -> Dispatch;
}

struct PendingInvocation {
    sender: oneshot::Sender<CloudMessage>,
    created_at: Instant,
}

/// One authenticated device session on top of a [`ConnectorChannel`].
///
/// Requests are matched to replies purely by correlation ID, so any number of
/// callers can be in flight at once. [`OpenChannel::run`] is the only reader.
pub struct OpenChannel {
    identifier: ChannelIdentifier,
    channel: ConnectorChannel,
    pending: Mutex<HashMap<String, PendingInvocation>>,
    handlers: RwLock<Vec<Arc<dyn InboundHandler>>>,
    closed: CancellationToken,
}

/// Removes a pending entry when the awaiting future completes or is dropped.
struct PendingGuard<'a> {
    session: &'a OpenChannel,
    correlation_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.session.pending().remove(&self.correlation_id);
    }
}

impl OpenChannel {
    pub fn new(identifier: ChannelIdentifier, channel: ConnectorChannel) -> Self {
        Self {
            identifier,
            channel,
            pending: Mutex::new(HashMap::new()),
            handlers: RwLock::new(Vec::new()),
            closed: CancellationToken::new(),
        }
    }

    pub fn identifier(&self) -> &ChannelIdentifier {
        &self.identifier
    }

    /// Append a handler; handlers are consulted in registration order.
    pub fn add_handler(&self, handler: Arc<dyn InboundHandler>) {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner).push(handler);
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingInvocation>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the session has been torn down.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Send a message without waiting for a reply.
    pub async fn send(&self, message: &CloudMessage) -> Result<(), ChannelError> {
        self.channel.send(message).await
    }

    /// Send `message` under a fresh correlation ID and wait for the reply.
    ///
    /// Cancelling `cancel` (or dropping the returned future) forgets the
    /// request; a reply arriving afterwards is discarded. The connection
    /// itself stays up.
    pub async fn send_request(
        &self,
        message: CloudMessage,
        cancel: &CancellationToken,
    ) -> Result<CloudMessage, InvokeError> {
        if self.is_closed() {
            return Err(InvokeError::Disconnected);
        }

        let correlation_id = new_correlation_id();
        let (sender, receiver) = oneshot::channel();
        self.pending()
            .insert(correlation_id.clone(), PendingInvocation { sender, created_at: Instant::now() });
        let _guard = PendingGuard { session: self, correlation_id: correlation_id.clone() };

        let message = message.with_correlation_id(correlation_id);
        tokio::select! {
            _ = cancel.cancelled() => return Err(InvokeError::Cancelled),
            sent = self.channel.send(&message) => sent?,
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(InvokeError::Cancelled),
            _ = self.closed.cancelled() => Err(InvokeError::Disconnected),
            reply = receiver => reply.map_err(|_| InvokeError::Disconnected),
        }
    }

    /// Receive loop. Returns after the peer closes, the transport fails,
    /// `shutdown` fires or the session is closed; the session is torn down
    /// on the way out.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.closed.cancelled() => break,
                received = self.channel.receive() => received,
            };

            match received {
                Ok(ReceiveResult::Message(message)) => self.dispatch(message).await,
                Ok(ReceiveResult::Close) => {
                    log::debug!("session({}): connection closed", self.identifier);
                    break;
                }
                Err(err) => {
                    log::warn!("session({}): receive failed: {err}", self.identifier);
                    break;
                }
            }
        }

        self.close();
        self.channel.close().await;
    }

    async fn dispatch(self: &Arc<Self>, message: CloudMessage) {
        if let Some(correlation_id) = message.correlation_id.as_deref() {
            let pending = self.pending().remove(correlation_id);
            if let Some(pending) = pending {
                log::trace!(
                    "session({}): reply {correlation_id} after {:?}",
                    self.identifier,
                    pending.created_at.elapsed()
                );
                // The caller may have given up in the meantime.
                let _ = pending.sender.send(message);
                return;
            }
        }

        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner).clone();
        let mut message = message;
        for handler in handlers {
            match handler.handle(self, message).await {
                Dispatch::Handled => return,
                Dispatch::Declined(declined) => message = declined,
            }
        }
        log::debug!(
            "session({}): dropping unclaimed {} message (correlation {:?})",
            self.identifier,
            message.message_type,
            message.correlation_id
        );
    }

    /// Tear down: every pending invocation fails with
    /// [`InvokeError::Disconnected`] and the receive loop stops.
    pub fn close(&self) {
        self.closed.cancel();
        let failed: Vec<_> = self.pending().drain().collect();
        if !failed.is_empty() {
            log::debug!(
                "session({}): failing {} pending invocation(s)",
                self.identifier,
                failed.len()
            );
        }
    }

    pub fn statistics(&self) -> ChannelStatisticsSnapshot {
        self.channel.statistics()
    }

    pub fn reset_statistics(&self) {
        self.channel.reset_statistics();
    }
}

impl std::fmt::Debug for OpenChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenChannel")
            .field("identifier", &self.identifier)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
