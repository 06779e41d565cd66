//! Control-frame handling for one connection.
//!
//! Every inbound text frame is answered with exactly one reply frame;
//! malformed or unsupported frames get an `error` reply and leave the
//! connection's subscriptions untouched.

use sonar_core::time::iso_now;
use sonar_core::{ClientFrame, ConnectionId, DeviceName, ServerFrame};
use tracing::debug;

use super::registry::Registry;

/// Why a connection task ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent a close frame or the stream ended.
    ClientClosed,
    /// The transport reported an error while reading.
    TransportError,
    /// A reply could not be queued or written.
    SendFailed,
    /// The registry closed the channel after an idle timeout or a failed broadcast.
    Evicted,
    /// The server is stopping; queued frames were flushed before the close.
    ServerShutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::TransportError => "transport_error",
            Self::SendFailed => "send_failed",
            Self::Evicted => "evicted",
            Self::ServerShutdown => "server_shutdown",
        }
    }
}

/// Frame sent right after accept, before any inbound frame is read.
pub fn welcome(id: &ConnectionId) -> ServerFrame {
    ServerFrame::Welcome {
        user_id: id.clone(),
        ts: iso_now(),
    }
}

/// Handle one inbound text frame and produce the reply.
///
/// The caller is responsible for refreshing `last_seen` before calling this.
pub fn handle_text(registry: &Registry, id: &ConnectionId, text: &str) -> ServerFrame {
    let frame = match ClientFrame::parse(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(conn_id = %id, error = %e, "rejected inbound frame");
            return ServerFrame::error(e.to_string());
        }
    };

    let result = match frame {
        ClientFrame::Subscribe { device_names } => {
            let wanted = DeviceName::normalize_all(&device_names);
            debug!(conn_id = %id, devices = wanted.len(), "subscribe");
            registry.set_subscriptions(id, wanted)
        }
        ClientFrame::Unsubscribe { device_names } => {
            let dropped = DeviceName::normalize_all(&device_names);
            debug!(conn_id = %id, devices = dropped.len(), "unsubscribe");
            registry.unsubscribe(id, &dropped)
        }
        ClientFrame::Ping => return ServerFrame::Pong { ts: iso_now() },
    };

    match result {
        Ok(device_names) => ServerFrame::Subscribed { device_names },
        Err(e) => ServerFrame::error(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::ConnectionChannel;

    fn setup() -> (Registry, ConnectionId) {
        let registry = Registry::new();
        let (channel, _rx) = ConnectionChannel::bounded(8);
        let id = registry.register(channel);
        (registry, id)
    }

    fn subscribed(frame: ServerFrame) -> Vec<String> {
        match frame {
            ServerFrame::Subscribed { device_names } => {
                device_names.iter().map(|d| d.as_str().to_owned()).collect()
            }
            other => panic!("expected subscribed, got {other:?}"),
        }
    }

    fn error_message(frame: ServerFrame) -> String {
        match frame {
            ServerFrame::Error { message } => message,
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn welcome_carries_identity() {
        let id = ConnectionId::from_raw("conn_x");
        match welcome(&id) {
            ServerFrame::Welcome { user_id, ts } => {
                assert_eq!(user_id, id);
                assert!(!ts.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn subscribe_normalizes_and_sorts() {
        let (registry, id) = setup();
        let reply = handle_text(
            &registry,
            &id,
            r#"{"action":"subscribe","deviceNames":[" Device_1 ","beta","DEVICE_1",""]}"#,
        );
        assert_eq!(subscribed(reply), vec!["beta", "device_1"]);
        let target = DeviceName::normalize("device_1").unwrap();
        assert_eq!(registry.subscribers_of(&target), vec![id]);
    }

    #[test]
    fn subscribe_is_full_replace() {
        let (registry, id) = setup();
        let _ = handle_text(&registry, &id, r#"{"action":"subscribe","deviceNames":["a"]}"#);
        let reply = handle_text(&registry, &id, r#"{"action":"subscribe","deviceNames":["b"]}"#);
        assert_eq!(subscribed(reply), vec!["b"]);
        assert!(registry
            .subscribers_of(&DeviceName::normalize("a").unwrap())
            .is_empty());
    }

    #[test]
    fn subscribe_with_empty_list_clears() {
        let (registry, id) = setup();
        let _ = handle_text(&registry, &id, r#"{"action":"subscribe","deviceNames":["a"]}"#);
        let reply = handle_text(&registry, &id, r#"{"action":"subscribe","deviceNames":[]}"#);
        assert!(subscribed(reply).is_empty());
        assert_eq!(registry.device_count(), 0);
    }

    #[test]
    fn unsubscribe_echoes_remaining() {
        let (registry, id) = setup();
        let _ = handle_text(
            &registry,
            &id,
            r#"{"action":"subscribe","deviceNames":["sensor-a","sensor-b"]}"#,
        );
        let reply = handle_text(
            &registry,
            &id,
            r#"{"action":"unsubscribe","deviceNames":[" SENSOR-A "]}"#,
        );
        assert_eq!(subscribed(reply), vec!["sensor-b"]);
    }

    #[test]
    fn ping_answers_pong() {
        let (registry, id) = setup();
        assert!(matches!(
            handle_text(&registry, &id, r#"{"action":"ping"}"#),
            ServerFrame::Pong { .. }
        ));
    }

    #[test]
    fn malformed_json_is_reported() {
        let (registry, id) = setup();
        let reply = handle_text(&registry, &id, "{{nope");
        assert_eq!(error_message(reply), "invalid JSON");
        assert!(registry.contains(&id));
    }

    #[test]
    fn unsupported_action_is_reported_without_mutation() {
        let (registry, id) = setup();
        let _ = handle_text(&registry, &id, r#"{"action":"subscribe","deviceNames":["a"]}"#);
        let reply = handle_text(&registry, &id, r#"{"action":"teleport","deviceNames":["b"]}"#);
        assert_eq!(error_message(reply), "unsupported action: teleport");
        assert_eq!(registry.subscriptions(&id).unwrap().len(), 1);
    }

    #[test]
    fn frames_for_evicted_connection_get_error() {
        let (registry, id) = setup();
        let _ = registry.unregister(&id);
        let reply = handle_text(&registry, &id, r#"{"action":"subscribe","deviceNames":["a"]}"#);
        assert!(error_message(reply).starts_with("unknown connection"));
        assert_eq!(registry.device_count(), 0);
    }

    #[test]
    fn close_reason_labels() {
        assert_eq!(CloseReason::Evicted.as_str(), "evicted");
        assert_eq!(CloseReason::ClientClosed.as_str(), "client_closed");
        assert_eq!(CloseReason::ServerShutdown.as_str(), "server_shutdown");
    }
}
