//! # Identity and Cryptographic Primitives
//!
//! This module defines the core identity types used throughout Galena:
//!
//! - [`Keypair`]: secp256k1 ECDSA keypair (secret + public key)
//! - [`Address`]: 20-byte node identifier derived from the public key
//! - [`Peer`]: logical identity, an address together with its public key
//! - [`BoundPeer`]: a peer together with a reachable network endpoint
//!
//! ## Identity Model
//!
//! An address is the last 20 bytes of `blake3(compressed_public_key)`.
//! Possession of the matching secret key proves the identity: every wire
//! message carries the compressed public key and a signature over its body,
//! so a verified message binds sender address to sender key.
//!
//! ## XOR Metric
//!
//! Addresses order only relative to one another, by XOR distance treated as
//! a 160-bit big-endian unsigned integer. The free functions
//! [`common_prefix_length`], [`distance_cmp`] and [`sort_by_distance`] are
//! the whole arithmetic surface the routing layer builds on.

use std::cmp::Ordering;
use std::fmt;

use rand::rngs::OsRng;
use secp256k1::ecdsa;
use secp256k1::{Message as Digest, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};

/// Length of a node address in bytes (160 bits).
pub const ADDRESS_LEN: usize = 20;

/// Length of a compressed secp256k1 public key in bytes.
pub const PUBLIC_KEY_LEN: usize = 33;

/// Length of a compact ECDSA signature in bytes.
pub const SIGNATURE_LEN: usize = 64;

// ============================================================================
// Address
// ============================================================================

/// 20-byte node identifier derived from a public key.
///
/// Equality and hashing are byte-wise. There is no total order between
/// addresses in routing terms; closeness is always measured via
/// [`Address::xor_distance`] against some target.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    #[inline]
    pub fn from_bytes(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    /// Derive the address of a public key: the trailing 20 bytes of the
    /// blake3 hash of its compressed serialization.
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let digest = blake3::hash(&public_key.serialize());
        let mut bytes = [0u8; ADDRESS_LEN];
        bytes.copy_from_slice(&digest.as_bytes()[32 - ADDRESS_LEN..]);
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    /// XOR of the two addresses, byte-wise. Interpreted big-endian, this is
    /// the Kademlia distance metric.
    #[inline]
    pub fn xor_distance(&self, other: &Address) -> [u8; ADDRESS_LEN] {
        let mut out = [0u8; ADDRESS_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != ADDRESS_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; ADDRESS_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({}..)", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// ============================================================================
// Kademlia Arithmetic
// ============================================================================

/// Number of leading bits in which `a` and `b` agree. Result in `[0, 160]`;
/// 160 only when the addresses are equal.
pub fn common_prefix_length(a: &Address, b: &Address) -> usize {
    let dist = a.xor_distance(b);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    ADDRESS_LEN * 8
}

/// Compare two XOR distances as 160-bit big-endian unsigned integers.
#[inline]
pub fn distance_cmp(a: &[u8; ADDRESS_LEN], b: &[u8; ADDRESS_LEN]) -> Ordering {
    a.cmp(b)
}

/// Stable ascending sort of peers by XOR distance of their address to
/// `target`. Ties keep input order.
pub fn sort_by_distance(peers: &mut [BoundPeer], target: &Address) {
    peers.sort_by(|a, b| {
        let da = a.address.xor_distance(target);
        let db = b.address.xor_distance(target);
        distance_cmp(&da, &db)
    });
}

// ============================================================================
// Keypair
// ============================================================================

/// secp256k1 ECDSA keypair.
///
/// Signing hashes the payload with blake3 and signs the 32-byte digest,
/// producing a 64-byte compact signature. Verification is the inverse check
/// against a bare [`PublicKey`], see [`verify_signature`].
#[derive(Clone)]
pub struct Keypair {
    secret_key: SecretKey,
    public_key: PublicKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);
        Self {
            secret_key,
            public_key,
        }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Result<Self, secp256k1::Error> {
        let secret_key = SecretKey::from_slice(bytes)?;
        let public_key = PublicKey::from_secret_key(&Secp256k1::new(), &secret_key);
        Ok(Self {
            secret_key,
            public_key,
        })
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.secret_key.secret_bytes()
    }

    #[inline]
    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn address(&self) -> Address {
        Address::from_public_key(&self.public_key)
    }

    /// The logical identity this keypair controls.
    pub fn peer(&self) -> Peer {
        Peer::from_public_key(self.public_key)
    }

    /// Sign the blake3 digest of `payload`, returning a compact signature.
    pub fn sign(&self, payload: &[u8]) -> [u8; SIGNATURE_LEN] {
        let digest = blake3::hash(payload);
        let message = Digest::from_digest(*digest.as_bytes());
        Secp256k1::new()
            .sign_ecdsa(&message, &self.secret_key)
            .serialize_compact()
    }

    pub fn verify(&self, payload: &[u8], signature: &[u8]) -> bool {
        verify_signature(&self.public_key, payload, signature)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("address", &self.address().to_hex())
            .finish_non_exhaustive()
    }
}

/// Verify a compact ECDSA signature over the blake3 digest of `payload`.
///
/// Returns `false` for malformed signatures rather than erroring; the codec
/// treats both identically.
pub fn verify_signature(public_key: &PublicKey, payload: &[u8], signature: &[u8]) -> bool {
    let sig = match ecdsa::Signature::from_compact(signature) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    let digest = blake3::hash(payload);
    let message = Digest::from_digest(*digest.as_bytes());
    Secp256k1::new()
        .verify_ecdsa(&message, &sig, public_key)
        .is_ok()
}

// ============================================================================
// Peer / BoundPeer
// ============================================================================

/// A logical peer identity: address plus the public key it derives from.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub address: Address,
    pub public_key: PublicKey,
}

impl Peer {
    pub fn from_public_key(public_key: PublicKey) -> Self {
        Self {
            address: Address::from_public_key(&public_key),
            public_key,
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peer({}..)", hex::encode(&self.address.as_bytes()[..4]))
    }
}

/// A peer together with a reachable endpoint. The routing layer deals
/// exclusively in bound peers.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundPeer {
    pub address: Address,
    pub public_key: PublicKey,
    pub host: String,
    pub port: u16,
}

impl BoundPeer {
    /// Bind a public key to an endpoint. The address is always re-derived
    /// from the key here, so records received off the wire cannot carry a
    /// mismatched address into the routing table.
    pub fn new(public_key: PublicKey, host: impl Into<String>, port: u16) -> Self {
        Self {
            address: Address::from_public_key(&public_key),
            public_key,
            host: host.into(),
            port,
        }
    }

    pub fn peer(&self) -> Peer {
        Peer {
            address: self.address,
            public_key: self.public_key,
        }
    }

    /// `host:port` rendering of the endpoint.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for BoundPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BoundPeer({}..@{}:{})",
            hex::encode(&self.address.as_bytes()[..4]),
            self.host,
            self.port
        )
    }
}

impl fmt::Display for BoundPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{}",
            hex::encode(&self.address.as_bytes()[..6]),
            self.host,
            self.port
        )
    }
}
