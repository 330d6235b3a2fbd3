//! Transaction correlation.
//!
//! Requests are stamped with a fresh random transaction id. A reader task
//! decodes every incoming message and routes it to the queue of the
//! transaction it names, so a caller can read an `ack` and then the
//! `event` that follows it for the same request. Messages without a known
//! transaction, and messages that fail to decode, are logged and dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::distr::Alphanumeric;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::SignalingError;
use crate::link::Link;
use crate::protocol::{GatewayMessage, Outgoing, Request};
use crate::{SignalingResult, TRANSACTION_ID_LEN};

/// Random transaction identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(String);

impl TransactionId {
    /// A new random alphanumeric id.
    pub fn generate() -> Self {
        let id: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(TRANSACTION_ID_LEN)
            .map(char::from)
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Default)]
struct Routes {
    open: bool,
    senders: HashMap<String, mpsc::UnboundedSender<GatewayMessage>>,
}

/// Matches gateway replies to the requests that caused them.
pub struct Correlator {
    outbound: mpsc::Sender<String>,
    routes: Arc<Mutex<Routes>>,
    receivers: Mutex<HashMap<String, mpsc::UnboundedReceiver<GatewayMessage>>>,
    reader: JoinHandle<()>,
}

impl Correlator {
    /// Take ownership of a link and start routing its incoming messages.
    pub fn new(link: Link) -> Self {
        let Link { outbound, inbound } = link;
        let routes = Arc::new(Mutex::new(Routes {
            open: true,
            senders: HashMap::new(),
        }));
        let reader = tokio::spawn(route_incoming(inbound, routes.clone()));

        Self {
            outbound,
            routes,
            receivers: Mutex::new(HashMap::new()),
            reader,
        }
    }

    /// Whether the link is still delivering messages.
    pub fn is_open(&self) -> bool {
        self.routes.lock().open && !self.outbound.is_closed()
    }

    /// Send a request under a new transaction.
    pub async fn send(&self, request: &Request) -> SignalingResult<TransactionId> {
        let id = TransactionId::generate();
        let text = serde_json::to_string(&Outgoing {
            transaction: id.as_str(),
            request,
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut routes = self.routes.lock();
            if !routes.open {
                return Err(SignalingError::ConnectionLost(
                    "gateway link closed".to_string(),
                ));
            }
            routes.senders.insert(id.0.clone(), tx);
        }
        self.receivers.lock().insert(id.0.clone(), rx);

        debug!(transaction = %id, janus = request.kind(), "Sending gateway request");
        if self.outbound.send(text).await.is_err() {
            self.complete(&id);
            return Err(SignalingError::ConnectionLost(
                "gateway link closed".to_string(),
            ));
        }
        Ok(id)
    }

    /// Wait for the next message of a transaction.
    ///
    /// May be called repeatedly for the same transaction. On timeout the
    /// transaction is discarded.
    pub async fn await_response(
        &self,
        id: &TransactionId,
        timeout: Duration,
    ) -> SignalingResult<GatewayMessage> {
        let mut rx = self.receivers.lock().remove(id.as_str()).ok_or_else(|| {
            SignalingError::ProtocolViolation(format!("no open transaction {}", id))
        })?;

        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(message)) => {
                trace!(transaction = %id, janus = message.kind(), "Gateway reply");
                self.receivers.lock().insert(id.0.clone(), rx);
                Ok(message)
            }
            Ok(None) => {
                self.complete(id);
                Err(SignalingError::ConnectionLost(format!(
                    "link closed while waiting for {}",
                    id
                )))
            }
            Err(_) => {
                warn!(transaction = %id, ?timeout, "Gateway reply timed out");
                self.complete(id);
                Err(SignalingError::Timeout {
                    transaction: id.0.clone(),
                    after: timeout,
                })
            }
        }
    }

    /// Send a request and return its first reply.
    pub async fn request(
        &self,
        request: &Request,
        timeout: Duration,
    ) -> SignalingResult<GatewayMessage> {
        let id = self.send(request).await?;
        let reply = self.await_response(&id, timeout).await;
        self.complete(&id);
        reply
    }

    /// Forget a transaction. Later messages for it are dropped.
    pub fn complete(&self, id: &TransactionId) {
        self.routes.lock().senders.remove(id.as_str());
        self.receivers.lock().remove(id.as_str());
    }

    /// Number of transactions still open.
    pub fn pending(&self) -> usize {
        self.routes.lock().senders.len()
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn route_incoming(mut inbound: mpsc::Receiver<String>, routes: Arc<Mutex<Routes>>) {
    while let Some(text) = inbound.recv().await {
        let message: GatewayMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "Dropping malformed gateway message");
                continue;
            }
        };

        let Some(transaction) = message.transaction().map(str::to_string) else {
            debug!(janus = message.kind(), "Dropping gateway message without transaction");
            continue;
        };

        let routes = routes.lock();
        match routes.senders.get(&transaction) {
            Some(tx) => {
                let _ = tx.send(message);
            }
            None => {
                warn!(%transaction, janus = message.kind(), "Dropping reply for unknown transaction");
            }
        }
    }

    debug!("Gateway link closed");
    let mut routes = routes.lock();
    routes.open = false;
    routes.senders.clear();
}
