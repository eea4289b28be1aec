use crate::error::{NetError, Result};
use crate::primitive::NetWriter;
use crate::sync::SyncMode;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Value of a synchronized type's `Id` member.
pub type StateId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    FullState = 0,
    DeltaState = 1,
    RequestFullState = 2,
    Rpc = 3,
    Manifest = 4,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageType::FullState),
            1 => Ok(MessageType::DeltaState),
            2 => Ok(MessageType::RequestFullState),
            3 => Ok(MessageType::Rpc),
            4 => Ok(MessageType::Manifest),
            other => Err(NetError::InvalidMessage(format!(
                "unknown message type {}",
                other
            ))),
        }
    }

    /// Logical channel a message of this type travels on. Deltas are
    /// relative to the previous delta, so they need the ordered reliable lane.
    /// In delta mode a full snapshot is the base of the next delta and rides
    /// the same lane.
    pub fn channel(self, mode: SyncMode) -> Channel {
        match self {
            MessageType::FullState if mode == SyncMode::Delta => Channel::ReliableSequenced,
            MessageType::FullState => Channel::StateUpdate,
            MessageType::Rpc => Channel::Reliable,
            MessageType::DeltaState | MessageType::RequestFullState | MessageType::Manifest => {
                Channel::ReliableSequenced
            }
        }
    }
}

/// Transport quality-of-service lanes. Ordering is only assumed within a
/// channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Channel {
    ReliableSequenced = 0,
    Reliable = 1,
    StateUpdate = 2,
}

impl Channel {
    pub const ALL: [Channel; 3] = [
        Channel::ReliableSequenced,
        Channel::Reliable,
        Channel::StateUpdate,
    ];
}

/// `[u8 message type][body]`. The transport frames each message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MessageType,
    pub body: Bytes,
}

impl Message {
    pub fn new(msg_type: MessageType, body: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            body: body.into(),
        }
    }

    pub fn full_state(body: Bytes) -> Self {
        Self::new(MessageType::FullState, body)
    }

    pub fn delta_state(body: Bytes) -> Self {
        Self::new(MessageType::DeltaState, body)
    }

    pub fn request_full_state() -> Self {
        Self::new(MessageType::RequestFullState, Bytes::new())
    }

    pub fn rpc(call: Bytes) -> Self {
        Self::new(MessageType::Rpc, call)
    }

    pub fn manifest(body: Vec<u8>) -> Self {
        Self::new(MessageType::Manifest, body)
    }

    pub fn channel(&self, mode: SyncMode) -> Channel {
        self.msg_type.channel(mode)
    }

    pub fn encode(&self) -> Bytes {
        let mut writer = NetWriter::with_capacity(1 + self.body.len());
        writer.write_u8(self.msg_type as u8);
        writer.write_bytes(&self.body);
        writer.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self> {
        if bytes.is_empty() {
            return Err(NetError::InvalidMessage("empty message".to_string()));
        }
        let body = bytes.split_off(1);
        let msg_type = MessageType::from_u8(bytes[0])?;
        if msg_type == MessageType::RequestFullState && !body.is_empty() {
            return Err(NetError::InvalidMessage(
                "full state request carries a body".to_string(),
            ));
        }
        Ok(Self { msg_type, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_layout() {
        let message = Message::rpc(Bytes::from_static(&[2, 0]));
        let bytes = message.encode();
        assert_eq!(&bytes[..], &[3, 2, 0]);
        assert_eq!(Message::decode(bytes).unwrap(), message);
        assert_eq!(message.channel(SyncMode::Delta), Channel::Reliable);
    }

    #[test]
    fn test_channels() {
        assert_eq!(MessageType::FullState.channel(SyncMode::Full), Channel::StateUpdate);
        assert_eq!(MessageType::FullState.channel(SyncMode::Manual), Channel::StateUpdate);
        assert_eq!(
            MessageType::FullState.channel(SyncMode::Delta),
            Channel::ReliableSequenced
        );
        for mode in [SyncMode::Full, SyncMode::Delta] {
            assert_eq!(MessageType::DeltaState.channel(mode), Channel::ReliableSequenced);
            assert_eq!(MessageType::Manifest.channel(mode), Channel::ReliableSequenced);
            assert_eq!(MessageType::Rpc.channel(mode), Channel::Reliable);
            assert_eq!(
                Message::request_full_state().channel(mode),
                Channel::ReliableSequenced
            );
        }
    }

    #[test]
    fn test_malformed_envelopes() {
        assert!(Message::decode(Bytes::new()).is_err());
        assert!(Message::decode(Bytes::from_static(&[9])).is_err());
        assert!(Message::decode(Bytes::from_static(&[2, 1])).is_err());
        assert!(Message::decode(Bytes::from_static(&[2])).is_ok());
    }
}
