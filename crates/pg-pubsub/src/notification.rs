//! Notification records flowing through the bus.

use serde::{Deserialize, Serialize};

/// Session id used when the originating or current session is unknown.
pub const UNKNOWN_SESSION_ID: i32 = -1;

/// A request to notify a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    /// Destination channel.
    pub channel: String,
    /// Opaque payload, may be absent.
    pub payload: Option<String>,
}

impl NotificationRequest {
    /// Create a new request.
    pub fn new(channel: impl Into<String>, payload: Option<String>) -> Self {
        Self {
            channel: channel.into(),
            payload,
        }
    }
}

/// A notification as delivered by a backend connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
    /// Channel the notification arrived on.
    pub channel: String,
    /// Payload; backends report an empty payload as `None`.
    pub payload: Option<String>,
    /// Backend process id of the notifying session.
    pub process_id: i32,
}

/// A notification event handed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// Channel the notification arrived on.
    pub channel: String,
    /// Opaque payload.
    pub payload: Option<String>,
    /// True when the notification was published by this bus's own session.
    pub is_local: bool,
    /// Session id of the publishing connection, or [`UNKNOWN_SESSION_ID`].
    pub origin_session_id: i32,
}

impl NotificationEvent {
    /// Tag a raw notification against the session id of the connection that
    /// received it. An unknown session id never matches.
    pub fn from_raw(raw: RawNotification, session_id: i32) -> Self {
        let is_local = session_id != UNKNOWN_SESSION_ID && raw.process_id == session_id;
        Self {
            channel: raw.channel,
            payload: raw.payload,
            is_local,
            origin_session_id: raw.process_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(process_id: i32) -> RawNotification {
        RawNotification {
            channel: "orders".to_string(),
            payload: Some("created".to_string()),
            process_id,
        }
    }

    #[test]
    fn test_local_when_process_ids_match() {
        let event = NotificationEvent::from_raw(raw(4242), 4242);
        assert!(event.is_local);
        assert_eq!(event.origin_session_id, 4242);
        assert_eq!(event.channel, "orders");
        assert_eq!(event.payload.as_deref(), Some("created"));
    }

    #[test]
    fn test_remote_when_process_ids_differ() {
        let event = NotificationEvent::from_raw(raw(4242), 1001);
        assert!(!event.is_local);
    }

    #[test]
    fn test_unknown_session_is_never_local() {
        let event = NotificationEvent::from_raw(raw(UNKNOWN_SESSION_ID), UNKNOWN_SESSION_ID);
        assert!(!event.is_local);
    }

    #[test]
    fn test_event_serializes_as_json() {
        let event = NotificationEvent::from_raw(raw(7), 7);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["channel"], "orders");
        assert_eq!(json["payload"], "created");
        assert_eq!(json["is_local"], true);
        assert_eq!(json["origin_session_id"], 7);
    }
}
