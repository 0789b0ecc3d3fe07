use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bytes::Bytes;
use tokio::sync::oneshot;

pub type DeviceId = u32;
pub type ConnectionId = u32;
pub type MessageId = u32;
pub type PackageId = u32;
pub type Priority = u32;

/// Resolves once every package of the message has been acknowledged (immediately after
///  enqueueing for messages sent without an ack requirement). The sender half is dropped
///  unresolved when the message is abandoned, so the receiving side observes cancellation
///  rather than a false success.
pub type DeliveryNotifier = oneshot::Sender<()>;
pub type DeliveryReceiver = oneshot::Receiver<()>;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MessageFormat {
    Json,
    Video,
    Handshake,
    Confirmation,
}

impl MessageFormat {
    pub fn to_byte(self) -> u8 {
        match self {
            MessageFormat::Json => 0,
            MessageFormat::Video => 1,
            MessageFormat::Handshake => 2,
            MessageFormat::Confirmation => 3,
        }
    }

    pub fn try_from_byte(value: u8) -> anyhow::Result<MessageFormat> {
        match value {
            0 => Ok(MessageFormat::Json),
            1 => Ok(MessageFormat::Video),
            2 => Ok(MessageFormat::Handshake),
            3 => Ok(MessageFormat::Confirmation),
            n => bail!("invalid message format discriminator: {}", n),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PackageStatus {
    Queued,
    Sent,
    Acked,
    Failed,
}

/// The application-level unit: submitted by the host through the SDK facade, fragmented
///  into [Package]s by the session layer, and reassembled on the receiving side before
///  being handed to the connection observer.
pub struct Message {
    pub id: MessageId,
    pub conn_id: ConnectionId,
    pub payload: Bytes,
    pub format: MessageFormat,
    pub priority: Priority,
    pub require_ack: bool,
    pub delivered: Option<DeliveryNotifier>,
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("conn_id", &self.conn_id)
            .field("payload_len", &self.payload.len())
            .field("format", &self.format)
            .field("priority", &self.priority)
            .field("require_ack", &self.require_ack)
            .finish()
    }
}

/// The session-level unit: one fragment of a message, and the smallest independently
///  acknowledgeable thing on the wire. Concatenating the payloads of all packages with a
///  common `message_id` in ascending `fragment_id` order reconstitutes the message payload.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Package {
    pub package_id: PackageId,
    pub message_id: MessageId,
    pub conn_id: ConnectionId,
    pub fragment_id: u32,
    pub fragments_count: u32,
    pub payload: Bytes,
    pub format: MessageFormat,
    pub priority: Priority,
    pub require_ack: bool,
    pub status: PackageStatus,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionStatus {
    /// created by the initiator, waiting for the handshake response
    Pending,
    /// created by the responder, waiting for the final confirmation
    Accepted,
    Active,
    /// terminal - a required handshake field failed validation
    Failed,
}

/// Everything that can happen on an established (or establishing) connection, delivered to
///  the single observer the host attached in [crate::sdk::EminentSdk::connect]. This replaces
///  four separate callback slots in the hot connection record.
#[derive(Debug)]
pub enum ConnectionEvent {
    Connected(ConnectionId),
    Disconnected,
    Trouble(String),
    Message(Message),
}

/// Per-connection observer, invoked from the SDK's protocol worker. Implementations should
///  hand non-trivial work off to their own tasks rather than blocking the worker.
pub trait ConnectionObserver: Send + Sync + 'static {
    fn on_event(&self, event: ConnectionEvent);
}

/// Host-level decisions that the SDK cannot make on its own. Both methods are called
///  synchronously inside the protocol worker.
pub trait SdkHost: Send + Sync + 'static {
    /// Whether to accept an inbound handshake from `remote`. The raw payload is passed
    ///  through so the host can correlate the embedded special code with application policy.
    fn decide_incoming(&self, remote: DeviceId, raw_payload: &[u8]) -> bool;

    /// Fires exactly once per connection when the responder side reaches ACTIVE.
    fn on_established(&self, conn_id: ConnectionId, remote: DeviceId);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::json(MessageFormat::Json, 0)]
    #[case::video(MessageFormat::Video, 1)]
    #[case::handshake(MessageFormat::Handshake, 2)]
    #[case::confirmation(MessageFormat::Confirmation, 3)]
    fn test_format_byte_roundtrip(#[case] format: MessageFormat, #[case] byte: u8) {
        assert_eq!(format.to_byte(), byte);
        assert_eq!(MessageFormat::try_from_byte(byte).unwrap(), format);
    }

    #[rstest]
    #[case(4)]
    #[case(255)]
    fn test_format_invalid_byte(#[case] byte: u8) {
        assert!(MessageFormat::try_from_byte(byte).is_err());
    }
}
