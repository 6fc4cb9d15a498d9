//! Fire-and-forget notification dispatcher.
//!
//! Engines announce state transitions here; subscribers (map views, future
//! websocket feeds) pick them up from a broadcast channel. Nothing in the
//! consistency contract depends on delivery.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub channel: String,
    pub kind: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Tell listeners on a channel that fresh data exists.
    pub fn on_new_data(&self, channel: &str) {
        self.send(Notification {
            channel: channel.to_string(),
            kind: "new_data".to_string(),
            detail: None,
        });
    }

    /// Announce a newly created dispatch assignment.
    pub fn assignment_created(&self, id_for_incident: i64, team_name: Option<&str>) {
        self.send(Notification {
            channel: "dispatch".to_string(),
            kind: "assignment_created".to_string(),
            detail: Some(match team_name {
                Some(name) => format!("DA#{} ({})", id_for_incident, name),
                None => format!("DA#{} (preplanned)", id_for_incident),
            }),
        });
    }

    fn send(&self, notification: Notification) {
        // No receivers is the normal idle case.
        match self.tx.send(notification) {
            Ok(n) => debug!("Notification delivered to {} subscriber(s)", n),
            Err(_) => debug!("Notification dropped (no subscribers)"),
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
