//! Work templates.
//!
//! A [`WorkTemplate`] is everything a worker needs to build candidate
//! headers: the previous block hash, target, timestamp, a coinbase split
//! around an extra-nonce slot, and the merkle branch that links the coinbase
//! to the rest of the transaction set. Templates are immutable once issued;
//! the only per-candidate inputs are the extra-nonce and the header nonce.

use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::miner::hasher::{sha256d, HEADER_SIZE};

/// Bytes reserved in the coinbase script for the extra-nonce.
pub const EXTRA_NONCE_SIZE: usize = 8;

/// Coinbase scripts must stay within consensus limits.
const MAX_COINBASE_SCRIPT: usize = 100;

const COINBASE_TAG: &[u8] = b"/veco-solo/";

/// Decoding or construction errors for templates.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TemplateError {
    #[error("invalid hex in `{field}`: {source}")]
    Hex {
        field: &'static str,
        #[source]
        source: hex::FromHexError,
    },

    #[error("`{field}` must be {expected} bytes, got {actual}")]
    Length {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("compact target {0:#010x} overflows 256 bits")]
    InvalidBits(u32),

    #[error("target does not match compact target {bits:#010x}")]
    TargetMismatch { bits: u32 },

    #[error("`{field}` out of range: {value}")]
    OutOfRange { field: &'static str, value: u64 },

    #[error("coinbase script is {0} bytes, limit is {max}", max = MAX_COINBASE_SCRIPT)]
    CoinbaseScriptTooLong(usize),

    #[error("reward script is empty")]
    EmptyRewardScript,
}

/// A block hash in display (big-endian) byte order, as the node prints it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlockHash([u8; 32]);

impl BlockHash {
    pub const ZERO: Self = Self([0; 32]);

    pub const fn from_display_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_internal_bytes(mut bytes: [u8; 32]) -> Self {
        bytes.reverse();
        Self(bytes)
    }

    pub fn to_internal_bytes(&self) -> [u8; 32] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }
}

impl FromStr for BlockHash {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_hash("blockhash", s).map(Self)
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({self})")
    }
}

/// Identity of a template: the tip it builds on plus a local revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TemplateId {
    pub prev_hash: BlockHash,
    pub revision: u64,
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode(&self.prev_hash.0[..8]);
        write!(f, "{hex}..#{}", self.revision)
    }
}

/// `getblocktemplate` result, restricted to the fields the miner uses.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockTemplateResponse {
    pub version: u32,
    #[serde(rename = "previousblockhash")]
    pub previous_block_hash: String,
    pub height: u64,
    pub bits: String,
    pub target: String,
    pub curtime: u64,
    #[serde(rename = "coinbasevalue")]
    pub coinbase_value: u64,
    #[serde(default)]
    pub transactions: Vec<TemplateTransactionResponse>,
    #[serde(default)]
    pub default_witness_commitment: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateTransactionResponse {
    pub data: String,
    #[serde(default)]
    pub txid: Option<String>,
}

/// Coinbase transaction split around the extra-nonce slot.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CoinbaseParts {
    /// Version through the extra-nonce push opcode
    prefix: Vec<u8>,
    /// Rest of the script, sequence and outputs
    suffix: Vec<u8>,
    /// The template carried a witness commitment output
    witness: bool,
}

impl CoinbaseParts {
    fn build(
        height: u64,
        value: u64,
        reward_script: &[u8],
        witness_commitment: Option<&[u8]>,
    ) -> Result<Self, TemplateError> {
        if reward_script.is_empty() {
            return Err(TemplateError::EmptyRewardScript);
        }

        let mut script_head = Vec::with_capacity(16);
        push_height(&mut script_head, height);
        script_head.push(EXTRA_NONCE_SIZE as u8);

        let mut script_tail = Vec::with_capacity(COINBASE_TAG.len() + 1);
        script_tail.push(COINBASE_TAG.len() as u8);
        script_tail.extend_from_slice(COINBASE_TAG);

        let script_len = script_head.len() + EXTRA_NONCE_SIZE + script_tail.len();
        if script_len > MAX_COINBASE_SCRIPT {
            return Err(TemplateError::CoinbaseScriptTooLong(script_len));
        }

        let mut prefix = Vec::with_capacity(64);
        prefix.extend_from_slice(&1u32.to_le_bytes());
        prefix.push(1);
        prefix.extend_from_slice(&[0u8; 32]);
        prefix.extend_from_slice(&u32::MAX.to_le_bytes());
        write_compact_size(&mut prefix, script_len as u64);
        prefix.extend_from_slice(&script_head);

        let mut suffix = script_tail;
        suffix.extend_from_slice(&u32::MAX.to_le_bytes());
        let outputs = if witness_commitment.is_some() { 2 } else { 1 };
        write_compact_size(&mut suffix, outputs);
        write_output(&mut suffix, value, reward_script);
        if let Some(commitment) = witness_commitment {
            write_output(&mut suffix, 0, commitment);
        }

        Ok(Self {
            prefix,
            suffix,
            witness: witness_commitment.is_some(),
        })
    }

    /// Legacy serialization, the form that is hashed into the txid.
    fn serialize(&self, extra_nonce: u64) -> Vec<u8> {
        let mut tx = Vec::with_capacity(self.prefix.len() + EXTRA_NONCE_SIZE + self.suffix.len() + 4);
        tx.extend_from_slice(&self.prefix);
        tx.extend_from_slice(&extra_nonce.to_le_bytes());
        tx.extend_from_slice(&self.suffix);
        tx.extend_from_slice(&0u32.to_le_bytes());
        tx
    }

    /// Serialization for the block body; carries the witness reserved value when required.
    fn serialize_for_block(&self, extra_nonce: u64) -> Vec<u8> {
        if !self.witness {
            return self.serialize(extra_nonce);
        }
        let mut tx = Vec::with_capacity(self.prefix.len() + self.suffix.len() + 48);
        tx.extend_from_slice(&self.prefix[..4]);
        tx.extend_from_slice(&[0x00, 0x01]);
        tx.extend_from_slice(&self.prefix[4..]);
        tx.extend_from_slice(&extra_nonce.to_le_bytes());
        tx.extend_from_slice(&self.suffix);
        tx.push(1);
        tx.push(32);
        tx.extend_from_slice(&[0u8; 32]);
        tx.extend_from_slice(&0u32.to_le_bytes());
        tx
    }

    fn txid(&self, extra_nonce: u64) -> [u8; 32] {
        sha256d(&self.serialize(extra_nonce))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TemplateTransaction {
    data: Vec<u8>,
    /// Internal byte order
    txid: [u8; 32],
}

/// Immutable snapshot of work issued by the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkTemplate {
    pub id: TemplateId,
    pub height: u64,
    pub version: u32,
    pub bits: u32,
    /// Big-endian 256-bit target
    pub target: [u8; 32],
    pub curtime: u32,
    pub coinbase_value: u64,
    coinbase: CoinbaseParts,
    transactions: Vec<TemplateTransaction>,
    merkle_branch: Vec<[u8; 32]>,
}

impl WorkTemplate {
    /// Build a template from a `getblocktemplate` result.
    ///
    /// The revision is left at zero; the template cache assigns one when the
    /// template is first published.
    pub fn from_response(
        response: &BlockTemplateResponse,
        reward_script: &[u8],
    ) -> Result<Self, TemplateError> {
        let prev_hash: BlockHash = response.previous_block_hash.parse()?;
        let bits = decode_bits(&response.bits)?;
        let target = decode_hash("target", &response.target)?;
        if target != target_from_bits(bits)? {
            return Err(TemplateError::TargetMismatch { bits });
        }
        let curtime = u32::try_from(response.curtime).map_err(|_| TemplateError::OutOfRange {
            field: "curtime",
            value: response.curtime,
        })?;

        let witness_commitment = response
            .default_witness_commitment
            .as_deref()
            .map(|hex| decode_hex("default_witness_commitment", hex))
            .transpose()?;

        let coinbase = CoinbaseParts::build(
            response.height,
            response.coinbase_value,
            reward_script,
            witness_commitment.as_deref(),
        )?;

        let transactions = response
            .transactions
            .iter()
            .map(|tx| {
                let data = decode_hex("transactions.data", &tx.data)?;
                let txid = match &tx.txid {
                    Some(txid) => reversed(decode_hash("transactions.txid", txid)?),
                    None => sha256d(&data),
                };
                Ok(TemplateTransaction { data, txid })
            })
            .collect::<Result<Vec<_>, TemplateError>>()?;

        let txids: Vec<[u8; 32]> = transactions.iter().map(|tx| tx.txid).collect();

        Ok(Self {
            id: TemplateId {
                prev_hash,
                revision: 0,
            },
            height: response.height,
            version: response.version,
            bits,
            target,
            curtime,
            coinbase_value: response.coinbase_value,
            coinbase,
            transactions,
            merkle_branch: merkle_branch(&txids),
        })
    }

    /// Synthetic work for local benchmarking. Its target is zero, so it never yields a block.
    pub fn benchmark() -> Result<Self, TemplateError> {
        let coinbase = CoinbaseParts::build(1, 0, &[0x51], None)?;
        Ok(Self {
            id: TemplateId {
                prev_hash: BlockHash::ZERO,
                revision: 0,
            },
            height: 1,
            version: 0x2000_0000,
            bits: 0x1d00_ffff,
            target: [0; 32],
            curtime: 0,
            coinbase_value: 0,
            coinbase,
            transactions: Vec::new(),
            merkle_branch: Vec::new(),
        })
    }

    /// Same work, published under a new revision.
    pub fn with_revision(mut self, revision: u64) -> Self {
        self.id.revision = revision;
        self
    }

    pub const fn prev_hash(&self) -> BlockHash {
        self.id.prev_hash
    }

    /// Number of transactions, coinbase included.
    pub fn transaction_count(&self) -> usize {
        self.transactions.len() + 1
    }

    pub fn merkle_root(&self, extra_nonce: u64) -> [u8; 32] {
        self.merkle_branch
            .iter()
            .fold(self.coinbase.txid(extra_nonce), |root, sibling| hash_pair(&root, sibling))
    }

    /// Serialize an 80-byte header for the given merkle root and nonce.
    pub fn header(&self, merkle_root: &[u8; 32], nonce: u32) -> [u8; HEADER_SIZE] {
        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&self.version.to_le_bytes());
        header[4..36].copy_from_slice(&self.id.prev_hash.to_internal_bytes());
        header[36..68].copy_from_slice(merkle_root);
        header[68..72].copy_from_slice(&self.curtime.to_le_bytes());
        header[72..76].copy_from_slice(&self.bits.to_le_bytes());
        set_header_nonce(&mut header, nonce);
        header
    }

    /// Serialize the full block for `submitblock`.
    pub fn serialize_block(&self, extra_nonce: u64, nonce: u32) -> Vec<u8> {
        let header = self.header(&self.merkle_root(extra_nonce), nonce);
        let body_len: usize = self.transactions.iter().map(|tx| tx.data.len()).sum();
        let mut block = Vec::with_capacity(HEADER_SIZE + body_len + 256);
        block.extend_from_slice(&header);
        write_compact_size(&mut block, self.transaction_count() as u64);
        block.extend_from_slice(&self.coinbase.serialize_for_block(extra_nonce));
        for tx in &self.transactions {
            block.extend_from_slice(&tx.data);
        }
        block
    }
}

/// Overwrite the nonce field of a serialized header.
pub fn set_header_nonce(header: &mut [u8; HEADER_SIZE], nonce: u32) {
    header[76..80].copy_from_slice(&nonce.to_le_bytes());
}

/// Expand a compact (`nBits`) target into big-endian bytes.
fn target_from_bits(bits: u32) -> Result<[u8; 32], TemplateError> {
    let exponent = (bits >> 24) as usize;
    let mantissa = bits & 0x007f_ffff;
    let mut target = [0u8; 32];

    if exponent <= 3 {
        let value = mantissa >> (8 * (3 - exponent));
        target[29..].copy_from_slice(&value.to_be_bytes()[1..]);
        return Ok(target);
    }
    if exponent > 32 {
        return Err(TemplateError::InvalidBits(bits));
    }
    let start = 32 - exponent;
    target[start..start + 3].copy_from_slice(&mantissa.to_be_bytes()[1..]);
    Ok(target)
}

/// Siblings on the path from the coinbase (leaf 0) to the merkle root.
fn merkle_branch(txids: &[[u8; 32]]) -> Vec<[u8; 32]> {
    let mut branch = Vec::new();
    let mut level = txids.to_vec();
    while let Some(first) = level.first().copied() {
        branch.push(first);
        level = level[1..]
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], pair.get(1).unwrap_or(&pair[0])))
            .collect();
    }
    branch
}

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left);
    buf[32..].copy_from_slice(right);
    sha256d(&buf)
}

/// BIP34 height push, encoded the way the node's script builder does it.
fn push_height(script: &mut Vec<u8>, height: u64) {
    match height {
        0 => script.push(0x00),
        1..=16 => script.push(0x50 + height as u8),
        _ => {
            let mut bytes = Vec::with_capacity(9);
            let mut value = height;
            while value > 0 {
                bytes.push((value & 0xff) as u8);
                value >>= 8;
            }
            if bytes.last().is_some_and(|b| b & 0x80 != 0) {
                bytes.push(0);
            }
            script.push(bytes.len() as u8);
            script.extend_from_slice(&bytes);
        }
    }
}

fn write_output(buf: &mut Vec<u8>, value: u64, script: &[u8]) {
    buf.extend_from_slice(&value.to_le_bytes());
    write_compact_size(buf, script.len() as u64);
    buf.extend_from_slice(script);
}

pub(crate) fn write_compact_size(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => buf.push(n as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&n.to_le_bytes());
        }
    }
}

fn decode_hex(field: &'static str, hex: &str) -> Result<Vec<u8>, TemplateError> {
    hex::decode(hex).map_err(|source| TemplateError::Hex { field, source })
}

fn decode_hash(field: &'static str, hex: &str) -> Result<[u8; 32], TemplateError> {
    let bytes = decode_hex(field, hex)?;
    let actual = bytes.len();
    bytes.try_into().map_err(|_| TemplateError::Length {
        field,
        expected: 32,
        actual,
    })
}

fn decode_bits(hex: &str) -> Result<u32, TemplateError> {
    let bytes = decode_hex("bits", hex)?;
    let actual = bytes.len();
    let bytes: [u8; 4] = bytes.try_into().map_err(|_| TemplateError::Length {
        field: "bits",
        expected: 4,
        actual,
    })?;
    Ok(u32::from_be_bytes(bytes))
}

fn reversed(mut bytes: [u8; 32]) -> [u8; 32] {
    bytes.reverse();
    bytes
}
