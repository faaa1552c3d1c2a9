//! # Wire Protocol Messages
//!
//! Typed messages exchanged between nodes, and the codec that frames them
//! onto a multi-part transport with an authenticity signature.
//!
//! ## Frame Layout
//!
//! Two shapes, depending on whether the frames came off a router-style
//! socket (`reply = false`, identity prefix present) or a dealer-style
//! socket (`reply = true`):
//!
//! ```text
//! reply=false: [identity(20B)] [type(1B)] [pubkey(33B)] [sig(64B)] [body frames...]
//! reply=true:                  [type(1B)] [pubkey(33B)] [sig(64B)] [body frames...]
//! ```
//!
//! The signature covers the concatenation of the body-frame bytes; the
//! transport preserves frame boundaries, so no length prefixes are inserted
//! between them. Public keys travel in compressed form.
//!
//! ## Type Tags
//!
//! | Tag  | Message        | Tag  | Message   |
//! |------|----------------|------|-----------|
//! | 0x01 | Ping           | 0x07 | GetBlocks |
//! | 0x02 | Pong           | 0x08 | GetTxs    |
//! | 0x03 | PeerSetDelta   | 0x09 | Block     |
//! | 0x04 | GetBlockHashes | 0x10 | Tx        |
//! | 0x05 | BlockHashes    |      |           |
//! | 0x06 | TxIds          |      |           |
//!
//! `Tx` is 0x10 (sixteen), not 0x0A; the gap is part of the wire contract.
//!
//! ## Bounded Deserialization
//!
//! The peer-set delta body is the only bincode-encoded payload. It is
//! decoded through [`deserialize_bounded`], which caps the buffer size so a
//! hostile frame cannot force an oversized allocation.

use std::fmt;

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::identity::{
    verify_signature, Address, BoundPeer, Keypair, Peer, ADDRESS_LEN, PUBLIC_KEY_LEN,
};

/// 32-byte block hash.
pub type BlockHash = [u8; 32];

/// 32-byte transaction id.
pub type TxId = [u8; 32];

const TAG_PING: u8 = 0x01;
const TAG_PONG: u8 = 0x02;
const TAG_PEER_SET_DELTA: u8 = 0x03;
const TAG_GET_BLOCK_HASHES: u8 = 0x04;
const TAG_BLOCK_HASHES: u8 = 0x05;
const TAG_TX_IDS: u8 = 0x06;
const TAG_GET_BLOCKS: u8 = 0x07;
const TAG_GET_TXS: u8 = 0x08;
const TAG_BLOCK: u8 = 0x09;
const TAG_TX: u8 = 0x10;

/// Maximum buffer accepted when decoding a peer-set delta frame.
const MAX_DELTA_BYTES: u64 = 256 * 1024;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DELTA_BYTES)
        .with_fixint_encoding()
}

/// Deserialize with the size bound enforced. Use this instead of raw
/// `bincode::deserialize` for anything that crosses the wire.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

// ============================================================================
// Errors
// ============================================================================

/// Reasons an inbound frame sequence is rejected, or an outbound body fails
/// to serialize. All decode variants are of the invalid-message kind: the
/// receive loop logs and drops, the sender is not penalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageError {
    /// Empty frame sequence.
    Empty,
    /// Header frames missing or with wrong lengths.
    MalformedHeader,
    /// Type tag not in the taxonomy.
    UnknownType(u8),
    /// Signature does not verify over the body bytes.
    InvalidSignature,
    /// Body has fewer frames than the variant requires.
    TruncatedBody,
    /// Body frames present but ill-formed for the variant.
    MalformedBody,
    /// Body failed to serialize while encoding.
    Encode,
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageError::Empty => write!(f, "empty frame sequence"),
            MessageError::MalformedHeader => write!(f, "malformed message header"),
            MessageError::UnknownType(tag) => write!(f, "unknown message type 0x{tag:02x}"),
            MessageError::InvalidSignature => write!(f, "message signature verification failed"),
            MessageError::TruncatedBody => write!(f, "truncated message body"),
            MessageError::MalformedBody => write!(f, "malformed message body"),
            MessageError::Encode => write!(f, "failed to serialize message body"),
        }
    }
}

impl std::error::Error for MessageError {}

// ============================================================================
// Taxonomy
// ============================================================================

/// A peer-set delta: what the sender learned and forgot since the last
/// exchange. Carried peers are full records so the receiver can dial them;
/// removals are bare addresses.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PeerSetDelta {
    pub added: Vec<BoundPeer>,
    pub removed: Vec<Address>,
}

/// The typed message taxonomy. Each variant owns its body-frame encoding;
/// the codec dispatches on the single-byte tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Ping,
    Pong,
    PeerSetDelta(PeerSetDelta),
    /// Locator hashes walking back from the sender's tip, plus a stop hash.
    GetBlockHashes {
        locators: Vec<BlockHash>,
        stop: BlockHash,
    },
    BlockHashes(Vec<BlockHash>),
    TxIds(Vec<TxId>),
    GetBlocks(Vec<BlockHash>),
    GetTxs(Vec<TxId>),
    /// A single serialized block.
    Block(Vec<u8>),
    /// A single serialized transaction.
    Tx(Vec<u8>),
}

impl MessageBody {
    /// Wire tag of this variant.
    pub fn tag(&self) -> u8 {
        match self {
            MessageBody::Ping => TAG_PING,
            MessageBody::Pong => TAG_PONG,
            MessageBody::PeerSetDelta(_) => TAG_PEER_SET_DELTA,
            MessageBody::GetBlockHashes { .. } => TAG_GET_BLOCK_HASHES,
            MessageBody::BlockHashes(_) => TAG_BLOCK_HASHES,
            MessageBody::TxIds(_) => TAG_TX_IDS,
            MessageBody::GetBlocks(_) => TAG_GET_BLOCKS,
            MessageBody::GetTxs(_) => TAG_GET_TXS,
            MessageBody::Block(_) => TAG_BLOCK,
            MessageBody::Tx(_) => TAG_TX,
        }
    }

    /// Variant name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            MessageBody::Ping => "Ping",
            MessageBody::Pong => "Pong",
            MessageBody::PeerSetDelta(_) => "PeerSetDelta",
            MessageBody::GetBlockHashes { .. } => "GetBlockHashes",
            MessageBody::BlockHashes(_) => "BlockHashes",
            MessageBody::TxIds(_) => "TxIds",
            MessageBody::GetBlocks(_) => "GetBlocks",
            MessageBody::GetTxs(_) => "GetTxs",
            MessageBody::Block(_) => "Block",
            MessageBody::Tx(_) => "Tx",
        }
    }

    fn body_frames(&self) -> Result<Vec<Vec<u8>>, MessageError> {
        Ok(match self {
            MessageBody::Ping | MessageBody::Pong => Vec::new(),
            MessageBody::PeerSetDelta(delta) => {
                vec![bincode::serialize(delta).map_err(|_| MessageError::Encode)?]
            }
            MessageBody::GetBlockHashes { locators, stop } => {
                let mut frames: Vec<Vec<u8>> =
                    locators.iter().map(|h| h.to_vec()).collect();
                frames.push(stop.to_vec());
                frames
            }
            MessageBody::BlockHashes(hashes)
            | MessageBody::GetBlocks(hashes)
            | MessageBody::TxIds(hashes)
            | MessageBody::GetTxs(hashes) => counted_frames(hashes),
            MessageBody::Block(bytes) | MessageBody::Tx(bytes) => vec![bytes.clone()],
        })
    }

    fn parse_body(tag: u8, frames: &[Vec<u8>]) -> Result<Self, MessageError> {
        match tag {
            TAG_PING => expect_empty(frames).map(|_| MessageBody::Ping),
            TAG_PONG => expect_empty(frames).map(|_| MessageBody::Pong),
            TAG_PEER_SET_DELTA => {
                let [frame] = frames else {
                    return Err(MessageError::TruncatedBody);
                };
                let delta =
                    deserialize_bounded(frame).map_err(|_| MessageError::MalformedBody)?;
                Ok(MessageBody::PeerSetDelta(delta))
            }
            TAG_GET_BLOCK_HASHES => {
                let Some((stop, locators)) = frames.split_last() else {
                    return Err(MessageError::TruncatedBody);
                };
                Ok(MessageBody::GetBlockHashes {
                    locators: locators
                        .iter()
                        .map(|f| parse_hash(f))
                        .collect::<Result<_, _>>()?,
                    stop: parse_hash(stop)?,
                })
            }
            TAG_BLOCK_HASHES => parse_counted(frames).map(MessageBody::BlockHashes),
            TAG_TX_IDS => parse_counted(frames).map(MessageBody::TxIds),
            TAG_GET_BLOCKS => parse_counted(frames).map(MessageBody::GetBlocks),
            TAG_GET_TXS => parse_counted(frames).map(MessageBody::GetTxs),
            TAG_BLOCK => single_frame(frames).map(MessageBody::Block),
            TAG_TX => single_frame(frames).map(MessageBody::Tx),
            other => Err(MessageError::UnknownType(other)),
        }
    }
}

/// `[count(4B BE)] [hash x count]`.
fn counted_frames(hashes: &[[u8; 32]]) -> Vec<Vec<u8>> {
    let mut frames = Vec::with_capacity(hashes.len() + 1);
    frames.push((hashes.len() as u32).to_be_bytes().to_vec());
    frames.extend(hashes.iter().map(|h| h.to_vec()));
    frames
}

fn parse_counted(frames: &[Vec<u8>]) -> Result<Vec<[u8; 32]>, MessageError> {
    let Some((count_frame, rest)) = frames.split_first() else {
        return Err(MessageError::TruncatedBody);
    };
    let count_bytes: [u8; 4] = count_frame
        .as_slice()
        .try_into()
        .map_err(|_| MessageError::MalformedBody)?;
    let count = u32::from_be_bytes(count_bytes) as usize;
    if rest.len() != count {
        return Err(MessageError::TruncatedBody);
    }
    rest.iter().map(|f| parse_hash(f)).collect()
}

fn parse_hash(frame: &[u8]) -> Result<[u8; 32], MessageError> {
    frame.try_into().map_err(|_| MessageError::MalformedBody)
}

fn single_frame(frames: &[Vec<u8>]) -> Result<Vec<u8>, MessageError> {
    let [frame] = frames else {
        return Err(MessageError::TruncatedBody);
    };
    Ok(frame.clone())
}

fn expect_empty(frames: &[Vec<u8>]) -> Result<(), MessageError> {
    if frames.is_empty() {
        Ok(())
    } else {
        Err(MessageError::MalformedBody)
    }
}

// ============================================================================
// Codec
// ============================================================================

/// A typed message plus the optional identity frame: the 20-byte address of
/// the recipient socket, set only when the frame targets a router-style
/// socket that requires addressing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub body: MessageBody,
    pub identity: Option<Address>,
}

/// Output of a successful parse: the message and the verified sender
/// identity reconstructed from the header public key.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub message: Message,
    pub sender: Peer,
}

impl Message {
    pub fn new(body: MessageBody) -> Self {
        Self {
            body,
            identity: None,
        }
    }

    pub fn with_identity(body: MessageBody, recipient: Address) -> Self {
        Self {
            body,
            identity: Some(recipient),
        }
    }

    /// Encode and sign into transport frames.
    ///
    /// Body frames come first from the variant; the signed payload is their
    /// concatenation. The header is prepended innermost to outermost: type
    /// tag, compressed public key, signature, and finally the identity
    /// address when set.
    pub fn to_frames(&self, keypair: &Keypair) -> Result<Vec<Vec<u8>>, MessageError> {
        let body = self.body.body_frames()?;

        let mut payload = Vec::with_capacity(body.iter().map(|f| f.len()).sum());
        for frame in &body {
            payload.extend_from_slice(frame);
        }
        let signature = keypair.sign(&payload);

        let mut frames = Vec::with_capacity(body.len() + 4);
        if let Some(identity) = &self.identity {
            frames.push(identity.as_bytes().to_vec());
        }
        frames.push(vec![self.body.tag()]);
        frames.push(keypair.public_key().serialize().to_vec());
        frames.push(signature.to_vec());
        frames.extend(body);
        Ok(frames)
    }

    /// Parse and verify transport frames.
    ///
    /// `reply = false` expects the leading 20-byte identity frame of a
    /// router-style socket and attaches it to the result; `reply = true`
    /// expects the header to start immediately.
    pub fn parse(frames: &[Vec<u8>], reply: bool) -> Result<ParsedMessage, MessageError> {
        if frames.is_empty() {
            return Err(MessageError::Empty);
        }

        let header_at = usize::from(!reply);
        if frames.len() < header_at + 3 {
            return Err(MessageError::MalformedHeader);
        }

        let identity = if reply {
            None
        } else {
            let bytes: [u8; ADDRESS_LEN] = frames[0]
                .as_slice()
                .try_into()
                .map_err(|_| MessageError::MalformedHeader)?;
            Some(Address::from_bytes(bytes))
        };

        let tag_frame = &frames[header_at];
        if tag_frame.len() != 1 {
            return Err(MessageError::MalformedHeader);
        }
        let tag = tag_frame[0];
        if !known_tag(tag) {
            return Err(MessageError::UnknownType(tag));
        }

        let key_frame = &frames[header_at + 1];
        if key_frame.len() != PUBLIC_KEY_LEN {
            return Err(MessageError::MalformedHeader);
        }
        let public_key = secp256k1::PublicKey::from_slice(key_frame)
            .map_err(|_| MessageError::MalformedHeader)?;

        let signature = &frames[header_at + 2];
        let body = &frames[header_at + 3..];
        let mut payload = Vec::with_capacity(body.iter().map(|f| f.len()).sum());
        for frame in body {
            payload.extend_from_slice(frame);
        }
        if !verify_signature(&public_key, &payload, signature) {
            return Err(MessageError::InvalidSignature);
        }

        let parsed = MessageBody::parse_body(tag, body)?;
        Ok(ParsedMessage {
            message: Message {
                body: parsed,
                identity,
            },
            sender: Peer::from_public_key(public_key),
        })
    }
}

fn known_tag(tag: u8) -> bool {
    matches!(
        tag,
        TAG_PING
            | TAG_PONG
            | TAG_PEER_SET_DELTA
            | TAG_GET_BLOCK_HASHES
            | TAG_BLOCK_HASHES
            | TAG_TX_IDS
            | TAG_GET_BLOCKS
            | TAG_GET_TXS
            | TAG_BLOCK
            | TAG_TX
    )
}
