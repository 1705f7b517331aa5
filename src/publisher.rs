use std::time::Duration;

use log::{error, info, warn};
use serde::Serialize;
use tokio::time::Instant;

use crate::connectivity::Connectivity;
use crate::messages::{Snapshot, StatusMessage};
use crate::mqtt::{BrokerSession, SessionFailure};
use crate::network::NetworkLink;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    NotDue,
    /// Due, but the broker session was down; the snapshot is dropped.
    Skipped,
    Published,
    /// The status message could not be serialized; nothing was sent.
    Unencodable,
    Failed(SessionFailure),
}

pub struct Publisher {
    device: String,
    topic: String,
    interval: Duration,
    last_publish: Option<Instant>,
}

impl Publisher {
    pub fn new(device: &str, topic: &str, interval: Duration) -> Self {
        Publisher {
            device: device.to_string(),
            topic: topic.to_string(),
            interval,
            last_publish: None,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.last_publish
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval)
    }

    /// Publish `snapshot` as a retained status message if the interval has
    /// elapsed. A due cycle is consumed whatever the outcome.
    pub async fn publish_if_due<N: NetworkLink, B: BrokerSession>(
        &mut self,
        conn: &mut Connectivity<N, B>,
        snapshot: &Snapshot,
        now: Instant,
    ) -> PublishOutcome {
        if !self.is_due(now) {
            return PublishOutcome::NotDue;
        }
        self.last_publish = Some(now);

        if !conn.is_session_connected() {
            warn!("Not connected to MQTT - skipping publish");
            return PublishOutcome::Skipped;
        }

        let message = StatusMessage::from_snapshot(&self.device, snapshot);
        let payload = match encode_payload(&message) {
            Ok(payload) => payload,
            Err(outcome) => return outcome,
        };
        info!(
            "Publishing to {}: {}",
            self.topic,
            String::from_utf8_lossy(&payload)
        );

        match conn.publish(&self.topic, payload, true).await {
            Ok(()) => {
                info!("Published successfully");
                PublishOutcome::Published
            }
            Err(failure) => {
                warn!("Publish failed: {}", failure);
                PublishOutcome::Failed(failure)
            }
        }
    }
}

fn encode_payload<T: Serialize>(message: &T) -> Result<Vec<u8>, PublishOutcome> {
    serde_json::to_vec(message).map_err(|e| {
        error!("Could not encode status message: {}", e);
        PublishOutcome::Unencodable
    })
}
