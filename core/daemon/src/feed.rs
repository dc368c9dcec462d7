//! Notification feed for downstream consumers.
//!
//! Every meaningfully handled event produces one [`Notification`]. It is
//! always logged on the `fraglog::feed` target and, when a receiver was
//! attached, also delivered over a channel.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::mpsc::{self, Receiver, Sender};
use tracing::{debug, info};

pub const FEED_TARGET: &str = "fraglog::feed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub server_id: String,
    pub at: DateTime<Utc>,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct Feed {
    sender: Option<Sender<Notification>>,
}

impl Feed {
    /// Feed that only logs.
    pub fn log_only() -> Self {
        Self::default()
    }

    /// Feed that logs and delivers to the returned receiver.
    pub fn with_channel() -> (Self, Receiver<Notification>) {
        let (sender, receiver) = mpsc::channel();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    pub fn publish(&self, notification: Notification) {
        info!(
            target: FEED_TARGET,
            server_id = %notification.server_id,
            kind = %notification.kind,
            at = %notification.at.to_rfc3339(),
            "{}",
            notification.message
        );

        if let Some(sender) = &self.sender {
            if sender.send(notification).is_err() {
                debug!("Feed receiver dropped; notification only logged");
            }
        }
    }

    pub fn notify(
        &self,
        server_id: &str,
        at: DateTime<Utc>,
        kind: &str,
        message: impl Into<String>,
    ) {
        self.publish(Notification {
            server_id: server_id.to_string(),
            at,
            kind: kind.to_string(),
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_feed_delivers_notifications() {
        let (feed, receiver) = Feed::with_channel();
        feed.notify("coop-1", Utc::now(), "join", "Alice joined");

        let received = receiver.try_recv().expect("notification");
        assert_eq!(received.server_id, "coop-1");
        assert_eq!(received.kind, "join");
        assert_eq!(received.message, "Alice joined");
    }

    #[test]
    fn log_only_feed_survives_without_receiver() {
        Feed::log_only().notify("coop-1", Utc::now(), "game_over", "Match finished");
    }
}
