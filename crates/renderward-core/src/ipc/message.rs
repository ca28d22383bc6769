//! Channel-routed JSON messages

use crate::Result;
use crate::protocol::now_millis;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Role of a message in the request/response pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
    Notification,
}

/// One message on the multi-client pipe
///
/// Serialized as a flat JSON object with the fields in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcMessage {
    pub channel: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub payload: String,
    pub timestamp: u64,
}

impl IpcMessage {
    #[must_use]
    pub fn new(
        channel: impl Into<String>,
        kind: MessageKind,
        message_id: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            kind,
            message_id: message_id.into(),
            payload: payload.into(),
            timestamp: now_millis(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Generates ids unique across processes and manager instances
#[derive(Debug)]
pub(crate) struct MessageIds {
    prefix: String,
    next: AtomicU64,
}

impl MessageIds {
    pub(crate) fn new() -> Self {
        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        Self {
            prefix: format!("msg_{:x}_{instance:x}", std::process::id()),
            next: AtomicU64::new(1),
        }
    }

    pub(crate) fn next(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}_{n:x}", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn json_has_fixed_field_order() {
        let message = IpcMessage {
            channel: "render".into(),
            kind: MessageKind::Request,
            message_id: "msg_1".into(),
            payload: "{}".into(),
            timestamp: 42,
        };
        assert_eq!(
            message.to_json().unwrap(),
            r#"{"channel":"render","type":"request","messageId":"msg_1","payload":"{}","timestamp":42}"#
        );
    }

    #[test]
    fn payload_with_quotes_survives() {
        let message = IpcMessage::new(
            "status",
            MessageKind::Notification,
            "msg_2",
            r#"{"text":"line\nbreak \"quoted\""}"#,
        );
        let decoded = IpcMessage::from_bytes(&message.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn unknown_kind_is_a_decode_error() {
        let data = r#"{"channel":"c","type":"broadcast","messageId":"m","payload":"","timestamp":1}"#;
        assert!(matches!(
            IpcMessage::from_json(data),
            Err(crate::RenderwardError::Decode(_))
        ));
    }

    #[test]
    fn ids_are_distinct_across_instances() {
        let a = MessageIds::new();
        let b = MessageIds::new();
        let first = a.next();
        assert_ne!(first, a.next());
        assert_ne!(first, b.next());
        assert!(first.starts_with("msg_"));
    }

    fn kind() -> impl Strategy<Value = MessageKind> {
        prop_oneof![
            Just(MessageKind::Request),
            Just(MessageKind::Response),
            Just(MessageKind::Notification),
        ]
    }

    proptest! {
        #[test]
        fn every_field_survives_encoding(
            channel in ".*",
            kind in kind(),
            message_id in ".*",
            payload in ".*",
            timestamp in any::<u64>(),
        ) {
            let message = IpcMessage { channel, kind, message_id, payload, timestamp };
            let decoded = IpcMessage::from_json(&message.to_json().unwrap()).unwrap();
            prop_assert_eq!(decoded, message);
        }
    }
}
