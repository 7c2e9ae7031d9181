//! Health endpoint: plain HTTP JSON report of room and connection counts.

use crate::connection::Channel;
use crate::registry::RoomRegistry;
use serde::Serialize;
use sigrelay_core::envelope::now_iso8601;
use std::collections::BTreeMap;

/// Which health route was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthPath {
    /// `/health`: totals across all channels.
    Combined,
    /// `/call-health`
    Call,
    /// `/chat-health`
    Chat,
    /// `/webrtc-health`: totals plus a per-channel breakdown.
    WebRtc,
}

impl HealthPath {
    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            "/health" => Some(HealthPath::Combined),
            "/call-health" => Some(HealthPath::Call),
            "/chat-health" => Some(HealthPath::Chat),
            "/webrtc-health" => Some(HealthPath::WebRtc),
            _ => None,
        }
    }

    fn service(self) -> &'static str {
        match self {
            HealthPath::Combined => "signaling-relay",
            HealthPath::Call => Channel::Call.service_name(),
            HealthPath::Chat => Channel::Chat.service_name(),
            HealthPath::WebRtc => "webrtc-signaling",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChannelCounts {
    pub room_count: usize,
    pub connection_count: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub service: &'static str,
    pub timestamp: String,
    pub room_count: usize,
    pub connection_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<BTreeMap<&'static str, ChannelCounts>>,
}

/// Build the report for `path` from the registry's current counts.
pub async fn report(registry: &RoomRegistry, path: HealthPath) -> HealthReport {
    let stats = match path {
        HealthPath::Call => registry.stats_for(Channel::Call).await,
        HealthPath::Chat => registry.stats_for(Channel::Chat).await,
        HealthPath::Combined | HealthPath::WebRtc => registry.stats().await,
    };

    let channels = if path == HealthPath::WebRtc {
        let mut by_channel = BTreeMap::new();
        for channel in Channel::ALL {
            let s = registry.stats_for(channel).await;
            by_channel.insert(
                channel.as_str(),
                ChannelCounts {
                    room_count: s.room_count,
                    connection_count: s.connection_count,
                },
            );
        }
        Some(by_channel)
    } else {
        None
    };

    HealthReport {
        status: "healthy",
        service: path.service(),
        timestamp: now_iso8601(),
        room_count: stats.room_count,
        connection_count: stats.connection_count,
        channels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionHandle, RoomKey};
    use serde_json::Value;

    async fn populated() -> RoomRegistry {
        let registry = RoomRegistry::new();
        for (id, channel, room, participant) in [
            (1, Channel::Call, "appt-42", "u1"),
            (2, Channel::Call, "appt-42", "u2"),
            (3, Channel::Chat, "text_session_9", "u1"),
        ] {
            let (handle, _queues) = ConnectionHandle::new(
                id,
                RoomKey::new(channel, room),
                participant,
                "127.0.0.1:1".parse().unwrap(),
                1,
            );
            registry.join(handle).await;
        }
        registry
    }

    #[test]
    fn paths() {
        assert_eq!(HealthPath::from_path("/health"), Some(HealthPath::Combined));
        assert_eq!(HealthPath::from_path("/chat-health"), Some(HealthPath::Chat));
        assert_eq!(HealthPath::from_path("/healthz"), None);
    }

    #[tokio::test]
    async fn combined_report_counts_everything() {
        let registry = populated().await;
        let json = serde_json::to_value(report(&registry, HealthPath::Combined).await).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["room_count"], 2);
        assert_eq!(json["connection_count"], 3);
        assert!(json["timestamp"].as_str().unwrap().ends_with('Z'));
        assert!(json.get("channels").is_none());
    }

    #[tokio::test]
    async fn channel_reports_are_scoped() {
        let registry = populated().await;
        let call = report(&registry, HealthPath::Call).await;
        assert_eq!(call.service, "call-signaling");
        assert_eq!((call.room_count, call.connection_count), (1, 2));

        let chat = report(&registry, HealthPath::Chat).await;
        assert_eq!((chat.room_count, chat.connection_count), (1, 1));
    }

    #[tokio::test]
    async fn webrtc_report_breaks_down_channels() {
        let registry = populated().await;
        let json = serde_json::to_value(report(&registry, HealthPath::WebRtc).await).unwrap();
        assert_eq!(json["connection_count"], 3);
        assert_eq!(json["channels"]["call"]["connection_count"], 2);
        assert_eq!(json["channels"]["chat"]["room_count"], 1);
        assert!(matches!(json["channels"], Value::Object(_)));
    }
}
