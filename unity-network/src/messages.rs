//! The §4.4/§6.1/§6.2 wire protocol: inventory exchange, header/block
//! sync, and unity proposal gossip, framed as a length-prefixed
//! envelope above whatever transport framing libp2p itself supplies
//! (§4.4.1).
//!
//! Message bodies are not consensus-critical (only the block/header/
//! transaction bytes nested inside them are, and those already go
//! through `unity_core::canonical`), so the envelope payload is plain
//! `serde_json`, matching how the teacher's gossipsub payloads were
//! encoded.

use serde::{Deserialize, Serialize};

use unity_consensus::SignedProposal;
use unity_core::{BlockHeader, TrxBlock, U160};

use crate::NetworkError;

/// Stable on-wire type tags (§6.2), in the registry's order. The
/// chain-sync half keeps the original numbering; `Subscribe`/`Blob`/
/// `Proposal` are appended for the unity consensus gossip this core
/// adds on top.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u16)]
pub enum MessageType {
    NameInv = 1,
    BlockInv = 2,
    GetNameInv = 3,
    GetHeaders = 4,
    GetBlock = 5,
    GetBlockIndex = 6,
    GetNameHeader = 7,
    NameHeader = 8,
    BlockIndex = 9,
    Block = 10,
    Headers = 11,
    Subscribe = 12,
    Blob = 13,
    Proposal = 14,
    GetBlob = 15,
}

impl MessageType {
    fn from_u16(v: u16) -> Option<MessageType> {
        use MessageType::*;
        Some(match v {
            1 => NameInv,
            2 => BlockInv,
            3 => GetNameInv,
            4 => GetHeaders,
            5 => GetBlock,
            6 => GetBlockIndex,
            7 => GetNameHeader,
            8 => NameHeader,
            9 => BlockIndex,
            10 => Block,
            11 => Headers,
            12 => Subscribe,
            13 => Blob,
            14 => Proposal,
            15 => GetBlob,
            _ => return None,
        })
    }
}

/// The bodies actually exchanged over the four gossipsub topics
/// (`unity-inv`, `unity-headers`, `unity-blocks`, `unity-proposals`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum GossipMessage {
    /// Announces known block ids, newest caller-chosen subset first.
    Inv { block_ids: Vec<U160> },
    GetHeaders { locator: Vec<U160> },
    Headers { first_block_num: u64, headers: Vec<BlockHeader>, head_block_num: u64, head_block_id: U160 },
    GetBlock { id: U160 },
    Block { block: TrxBlock },
    GetNameHeader { short_id: u64 },
    NameHeader { header: BlockHeader },
    /// Compact block announcement: the recipient reconstructs the
    /// block from its own mempool, requesting only unknown short ids.
    BlockIndex { header: BlockHeader, trx_short_ids: Vec<u64> },
    Proposal { signed_proposal: SignedProposal },
    /// Opaque consensus input accompanying an inventory announcement.
    Blob { bytes: Vec<u8> },
    /// Requests the payload for proposal item ids the sender doesn't
    /// recognize yet (§4.3.4's fetch-enqueue note); answered with `Blob`.
    GetBlob { items: Vec<U160> },
}

impl GossipMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            GossipMessage::Inv { .. } => MessageType::BlockInv,
            GossipMessage::GetHeaders { .. } => MessageType::GetHeaders,
            GossipMessage::Headers { .. } => MessageType::Headers,
            GossipMessage::GetBlock { .. } => MessageType::GetBlock,
            GossipMessage::Block { .. } => MessageType::Block,
            GossipMessage::GetNameHeader { .. } => MessageType::GetNameHeader,
            GossipMessage::NameHeader { .. } => MessageType::NameHeader,
            GossipMessage::BlockIndex { .. } => MessageType::BlockIndex,
            GossipMessage::Proposal { .. } => MessageType::Proposal,
            GossipMessage::Blob { .. } => MessageType::Blob,
            GossipMessage::GetBlob { .. } => MessageType::GetBlob,
        }
    }
}

/// §6.1's envelope: `{ size: u32, type: u16, reserved: u16, payload }`,
/// padded with trailing zero bytes to a 16-byte boundary.
pub struct Envelope {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

const HEADER_LEN: usize = 8;

impl Envelope {
    pub fn wrap(message: &GossipMessage) -> Result<Envelope, NetworkError> {
        let payload = serde_json::to_vec(message)?;
        Ok(Envelope { msg_type: message.message_type(), payload })
    }

    pub fn encode(&self) -> Vec<u8> {
        let size = self.payload.len() as u32;
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&size.to_le_bytes());
        buf.extend_from_slice(&(self.msg_type as u16).to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        while buf.len() % 16 != 0 {
            buf.push(0);
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Envelope, NetworkError> {
        if data.len() < HEADER_LEN {
            return Err(NetworkError::Truncated);
        }
        let size = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
        let type_tag = u16::from_le_bytes(data[4..6].try_into().unwrap());
        let msg_type = MessageType::from_u16(type_tag).ok_or(NetworkError::UnknownMessageType(type_tag))?;
        if data.len() < HEADER_LEN + size {
            return Err(NetworkError::Truncated);
        }
        let payload = data[HEADER_LEN..HEADER_LEN + size].to_vec();
        Ok(Envelope { msg_type, payload })
    }

    pub fn decode_message(data: &[u8]) -> Result<GossipMessage, NetworkError> {
        let envelope = Envelope::decode(data)?;
        Ok(serde_json::from_slice(&envelope.payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_and_pads_to_16_bytes() {
        let message = GossipMessage::Inv { block_ids: vec![[1u8; 20], [2u8; 20]] };
        let envelope = Envelope::wrap(&message).unwrap();
        let bytes = envelope.encode();
        assert_eq!(bytes.len() % 16, 0);
        let decoded = Envelope::decode_message(&bytes).unwrap();
        match decoded {
            GossipMessage::Inv { block_ids } => assert_eq!(block_ids.len(), 2),
            _ => panic!("wrong message type decoded"),
        }
    }

    #[test]
    fn decode_rejects_truncated_buffers() {
        assert!(matches!(Envelope::decode(&[0u8; 4]), Err(NetworkError::Truncated)));
    }
}
