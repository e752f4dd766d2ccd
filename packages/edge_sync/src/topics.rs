//! Topic names and fixed sync-request parameters.

/// Topics subscribed on every connection, in subscription order.
pub const SUBSCRIBE_TOPICS: [&str; 17] = [
    "/legacy_web",
    "/webrtc",
    "/rtc_multi",
    "/onevc",
    "/br_sr",
    "/sr_res",
    "/t_ms",
    "/thread_typing",
    "/orca_typing_notifications",
    "/notify_disconnect",
    "/orca_presence",
    "/inbox",
    "/mercury",
    "/messaging_events",
    "/orca_message_notifications",
    "/pp",
    "/webrtc_response",
];

pub const CREATE_QUEUE_TOPIC: &str = "/messenger_sync_create_queue";
pub const GET_DIFFS_TOPIC: &str = "/messenger_sync_get_diffs";
pub const PRESENCE_TOPIC: &str = "/orca_presence";

pub const SYNC_API_VERSION: u32 = 10;
pub const MAX_DELTAS_ABLE_TO_PROCESS: u32 = 1000;
pub const DELTA_BATCH_SIZE: u32 = 500;
pub const SYNC_ENCODING: &str = "JSON";

/// Inbound topics the dispatcher tells apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// `/t_ms`: inbox sync stream, the only topic allowed to move the cursor.
    InboxSync,
    /// `/thread_typing` and `/orca_typing_notifications`.
    Typing,
    /// `/mercury`, `/messaging_events`, `/orca_message_notifications`.
    MessageMirror,
    Presence,
    /// Subscribed for parity with the web client, payloads are dropped.
    Ignored,
    Unknown,
}

impl Topic {
    pub fn parse(name: &str) -> Self {
        match name {
            "/t_ms" => Self::InboxSync,
            "/thread_typing" | "/orca_typing_notifications" => Self::Typing,
            "/mercury" | "/messaging_events" | "/orca_message_notifications" => {
                Self::MessageMirror
            }
            "/orca_presence" => Self::Presence,
            "/legacy_web" | "/webrtc" | "/rtc_multi" | "/onevc" | "/br_sr" | "/sr_res"
            | "/notify_disconnect" | "/inbox" | "/pp" | "/webrtc_response" => Self::Ignored,
            _ => Self::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscribed_topic_is_known() {
        for name in SUBSCRIBE_TOPICS {
            assert_ne!(Topic::parse(name), Topic::Unknown, "{name}");
        }
    }

    #[test]
    fn topic_classification() {
        assert_eq!(Topic::parse("/t_ms"), Topic::InboxSync);
        assert_eq!(Topic::parse("/orca_typing_notifications"), Topic::Typing);
        assert_eq!(Topic::parse("/mercury"), Topic::MessageMirror);
        assert_eq!(Topic::parse("/orca_presence"), Topic::Presence);
        assert_eq!(Topic::parse("/pp"), Topic::Ignored);
        assert_eq!(Topic::parse("/something_new"), Topic::Unknown);
        assert_eq!(Topic::parse("t_ms"), Topic::Unknown);
    }
}
