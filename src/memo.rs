//! Request-fingerprint memos.
//!
//! A memo is a 32-byte keccak256 digest binding a payment to the request it
//! pays for: the endpoint identifier, a hash of the request body, the
//! challenge nonce, and the challenge expiry. Clients may embed the memo in
//! the on-chain transfer (`transferWithMemo`); the gateway then has an exact
//! reconciliation handle between an HTTP request and a ledger event.
//!
//! The encoding fed to keccak256 is deterministic: each field is prefixed
//! with a one-byte type tag and a big-endian `u32` length, and the expiry is
//! encoded as a big-endian `u64`. Identical inputs always produce identical
//! memos; changing any single field changes the digest.

use alloy::hex;
use alloy::primitives::keccak256;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::{Debug, Display};
use std::str::FromStr;

use crate::timestamp::UnixTimestamp;

const TAG_ENDPOINT: u8 = 0x01;
const TAG_BODY_HASH: u8 = 0x02;
const TAG_NONCE: u8 = 0x03;
const TAG_EXPIRY: u8 = 0x04;

/// A 32-byte request fingerprint, hex-encoded with `0x` prefix on the wire.
///
/// [`Memo::ZERO`] means "no memo constraint": a requirement carrying the zero
/// memo accepts any transfer regardless of the memo it was tagged with.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Memo(pub [u8; 32]);

impl Memo {
    /// The all-zero memo, meaning no memo constraint.
    pub const ZERO: Memo = Memo([0u8; 32]);

    /// Computes the fingerprint of one priced request.
    ///
    /// `endpoint` is the `"METHOD path"` identifier, `body_hash` is
    /// keccak256 of the raw request body (the zero hash for empty bodies),
    /// `nonce` is the challenge nonce, and `expiry` the challenge expiry.
    pub fn compute(
        endpoint: &str,
        body_hash: &[u8; 32],
        nonce: &str,
        expiry: UnixTimestamp,
    ) -> Self {
        let mut buf = Vec::with_capacity(
            endpoint.len() + nonce.len() + 32 + 8 + 4 * 5,
        );
        push_field(&mut buf, TAG_ENDPOINT, endpoint.as_bytes());
        push_field(&mut buf, TAG_BODY_HASH, body_hash);
        push_field(&mut buf, TAG_NONCE, nonce.as_bytes());
        push_field(&mut buf, TAG_EXPIRY, &expiry.as_secs().to_be_bytes());
        Memo(keccak256(&buf).0)
    }

    /// Hashes a request body for use as the `body_hash` input of
    /// [`Memo::compute`].
    pub fn body_hash(body: &[u8]) -> [u8; 32] {
        keccak256(body).0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

fn push_field(buf: &mut Vec<u8>, tag: u8, bytes: &[u8]) {
    buf.push(tag);
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

impl Debug for Memo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Memo(0x{})", hex::encode(self.0))
    }
}

impl Display for Memo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid memo format: must be 0x-prefixed and 64 hex chars")]
pub struct MemoDecodingError;

static MEMO_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{64}$").expect("Invalid memo regex"));

impl FromStr for Memo {
    type Err = MemoDecodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !MEMO_REGEX.is_match(s) {
            return Err(MemoDecodingError);
        }
        let bytes = hex::decode(&s[2..]).map_err(|_| MemoDecodingError)?;
        let array: [u8; 32] = bytes.try_into().map_err(|_| MemoDecodingError)?;
        Ok(Memo(array))
    }
}

impl Serialize for Memo {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Memo {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Memo::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl From<[u8; 32]> for Memo {
    fn from(bytes: [u8; 32]) -> Self {
        Memo(bytes)
    }
}
