//! Hash computation for relay correlation ids
//!
//! The correlation id is the idempotency key handed to the destination
//! contract (`srcTxId` / `correlationId` argument) and the key the
//! deduplicator reserves. It must be derivable from the source event alone so
//! that every relayer instance computes the same value for the same log.

use alloy::primitives::B256;
use tiny_keccak::{Hasher, Keccak};

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Compute the correlation id for a source log.
///
/// keccak256(abi.encode(uint64 chainId, bytes32 txHash, uint64 logIndex))
///
/// All values are encoded as 32-byte words in big-endian format, so the same
/// id can be recomputed on-chain with `keccak256(abi.encode(...))`.
pub fn compute_correlation_id(chain_id: u64, tx_hash: &B256, log_index: u64) -> [u8; 32] {
    // abi.encode layout: 3 words * 32 bytes = 96 bytes
    let mut data = [0u8; 96];

    // Word 0: chainId (uint64, right-aligned)
    data[24..32].copy_from_slice(&chain_id.to_be_bytes());

    // Word 1: txHash (bytes32)
    data[32..64].copy_from_slice(tx_hash.as_slice());

    // Word 2: logIndex (uint64, right-aligned)
    data[64 + 24..96].copy_from_slice(&log_index.to_be_bytes());

    keccak256(&data)
}

/// Convert bytes to a lowercase 0x-prefixed hex string
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}
