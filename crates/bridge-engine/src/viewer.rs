//! Direct viewers and the registry of relayed transports.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bridge_webrtc::{Attachment, AttachmentStatistics, Transport};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::EngineError;
use crate::EngineResult;

/// Messages on a viewer WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum ViewerMessage {
    Offer { sdp: String },
    Answer { sdp: String },
}

impl ViewerMessage {
    /// Parse the first message of a viewer connection, which must be an
    /// offer.
    pub fn parse_offer(text: &str) -> EngineResult<String> {
        match serde_json::from_str::<ViewerMessage>(text) {
            Ok(ViewerMessage::Offer { sdp }) => Ok(sdp),
            Ok(ViewerMessage::Answer { .. }) => Err(EngineError::InvalidViewerMessage(
                "expected an offer, got an answer".to_string(),
            )),
            Err(e) => Err(EngineError::InvalidViewerMessage(e.to_string())),
        }
    }

    pub fn to_json(&self) -> String {
        // A struct of strings always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// What a relayed transport serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayRole {
    Viewer,
    Gateway,
}

struct Entry {
    role: RelayRole,
    attachment: Arc<Attachment>,
}

/// Every transport currently attached to the relay, keyed by transport id.
#[derive(Default)]
pub struct RelayRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, role: RelayRole, attachment: Arc<Attachment>) {
        let id = attachment.transport_id().to_string();
        self.entries.lock().insert(id, Entry { role, attachment });
    }

    pub(crate) fn remove(&self, transport_id: &str) -> bool {
        self.entries.lock().remove(transport_id).is_some()
    }

    /// Number of direct viewers.
    pub fn viewer_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|e| e.role == RelayRole::Viewer)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Counters of every attachment.
    pub fn statistics(&self) -> Vec<AttachmentStatistics> {
        self.entries
            .lock()
            .values()
            .map(|e| e.attachment.statistics())
            .collect()
    }
}

/// One direct viewer: a bound transport and its relay attachment.
///
/// Dropping the session detaches it from the relay; [`Self::finish`] also
/// closes the peer connection.
pub struct ViewerSession {
    transport: Transport,
    attachment: Arc<Attachment>,
    answer: String,
    registry: Arc<RelayRegistry>,
}

impl ViewerSession {
    pub(crate) fn new(
        transport: Transport,
        attachment: Attachment,
        answer: String,
        registry: Arc<RelayRegistry>,
    ) -> Self {
        let attachment = Arc::new(attachment);
        registry.insert(RelayRole::Viewer, attachment.clone());
        Self {
            transport,
            attachment,
            answer,
            registry,
        }
    }

    pub fn id(&self) -> &str {
        self.transport.id()
    }

    /// The answer to send back to the viewer.
    pub fn answer(&self) -> ViewerMessage {
        ViewerMessage::Answer {
            sdp: self.answer.clone(),
        }
    }

    pub fn statistics(&self) -> AttachmentStatistics {
        self.attachment.statistics()
    }

    /// Relay until the viewer's connection ends or the transport closes,
    /// then tear down.
    pub async fn run_until<F>(self, connection_closed: F)
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            _ = connection_closed => {
                debug!(viewer = %self.id(), "Viewer connection closed");
            }
            _ = self.attachment.stopped() => {
                debug!(viewer = %self.id(), "Viewer transport closed");
            }
        }
        self.finish().await;
    }

    /// Detach and close the peer connection.
    pub async fn finish(self) {
        let stats = self.attachment.statistics();
        self.registry.remove(self.transport.id());
        self.transport.close().await;
        info!(
            viewer = %self.transport.id(),
            samples = stats.samples_written,
            dropped = stats.audio_delivery.dropped + stats.video_delivery.dropped,
            "Viewer finished"
        );
    }
}

impl Drop for ViewerSession {
    fn drop(&mut self) {
        self.registry.remove(self.transport.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_viewer_wire_format() {
        assert_eq!(
            ViewerMessage::parse_offer(r#"{"cmd":"offer","sdp":"v=0"}"#).unwrap(),
            "v=0"
        );
        assert_eq!(
            ViewerMessage::Answer {
                sdp: "v=0".to_string()
            }
            .to_json(),
            r#"{"cmd":"answer","sdp":"v=0"}"#
        );
    }

    #[test]
    fn test_viewer_rejects_non_offer() {
        assert!(matches!(
            ViewerMessage::parse_offer(r#"{"cmd":"answer","sdp":"v=0"}"#),
            Err(EngineError::InvalidViewerMessage(_))
        ));
        assert!(matches!(
            ViewerMessage::parse_offer("not json"),
            Err(EngineError::InvalidViewerMessage(_))
        ));
        assert!(matches!(
            ViewerMessage::parse_offer(r#"{"cmd":"offer"}"#),
            Err(EngineError::InvalidViewerMessage(_))
        ));
    }

    #[test]
    fn test_empty_registry() {
        let registry = RelayRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.viewer_count(), 0);
        assert!(registry.statistics().is_empty());
    }
}
