//! Block-wise transfer reassembly (RFC 7959).
//!
//! One transfer per (server, path, direction). A transfer only ever accepts
//! the block it expects next; a repeat of the previous block is answered
//! again without being appended, anything else discards the transfer.

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use mote_proto::ResourcePath;

use crate::{config::BlockConfig, error::BlockError};

/// Which block option carries the transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    /// Request body (Block1): a server writing to us.
    Block1,
    /// Response body (Block2): a peer reading a large value.
    Block2,
}

/// Identifies one transfer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockKey {
    /// Short id of the peer server.
    pub server: u16,
    /// Target resource.
    pub path: ResourcePath,
    /// Block option in use.
    pub direction: Direction,
}

impl BlockKey {
    /// Build a key.
    pub fn new(server: u16, path: ResourcePath, direction: Direction) -> Self {
        Self { server, path, direction }
    }
}

/// Result of accepting a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// More blocks expected.
    Continue {
        /// Bytes accumulated so far.
        received: usize,
        /// Block number expected next.
        next_expected: u32,
        /// Negotiated block size.
        size: u16,
    },

    /// Final block received; the transfer has been released.
    Complete(Vec<u8>),
}

#[derive(Debug, Clone)]
struct Transfer {
    buffer: Vec<u8>,
    expected: u32,
    size: u16,
    last_activity: Instant,
}

/// Per-key accumulation of block payloads.
#[derive(Debug, Clone)]
pub struct BlockReassembler {
    config: BlockConfig,
    transfers: BTreeMap<BlockKey, Transfer>,
}

impl BlockReassembler {
    /// Empty reassembler.
    pub fn new(config: BlockConfig) -> Self {
        Self { config, transfers: BTreeMap::new() }
    }

    /// Feed block `seq` of `key`.
    pub fn accept_block(
        &mut self,
        key: &BlockKey,
        seq: u32,
        payload: &[u8],
        is_last: bool,
        size: u16,
        now: Instant,
    ) -> Result<BlockOutcome, BlockError> {
        let result = self.accept_inner(key, seq, payload, is_last, size, now);
        if let Err(err) = &result {
            tracing::debug!(path = %key.path, server = key.server, %err, "block transfer discarded");
            self.transfers.remove(key);
        }
        result
    }

    fn accept_inner(
        &mut self,
        key: &BlockKey,
        seq: u32,
        payload: &[u8],
        is_last: bool,
        size: u16,
        now: Instant,
    ) -> Result<BlockOutcome, BlockError> {
        if !self.config.accepts(size) {
            return Err(BlockError::InvalidSize(size));
        }

        if !self.transfers.contains_key(key) {
            if seq != 0 {
                return Err(BlockError::UnexpectedBlock { expected: 0, actual: seq });
            }
            self.transfers.insert(key.clone(), Transfer {
                buffer: Vec::new(),
                expected: 0,
                size,
                last_activity: now,
            });
        }
        let Some(transfer) = self.transfers.get_mut(key) else {
            return Err(BlockError::UnexpectedBlock { expected: 0, actual: seq });
        };

        if size != transfer.size {
            return Err(BlockError::SizeChanged { from: transfer.size, to: size });
        }

        if transfer.expected > 0 && seq == transfer.expected - 1 {
            tracing::debug!(path = %key.path, seq, "duplicate block, re-acknowledging");
            transfer.last_activity = now;
            return Ok(BlockOutcome::Continue {
                received: transfer.buffer.len(),
                next_expected: transfer.expected,
                size,
            });
        }

        if seq != transfer.expected {
            return Err(BlockError::UnexpectedBlock { expected: transfer.expected, actual: seq });
        }

        if payload.len() > usize::from(size) {
            return Err(BlockError::OversizedBlock { len: payload.len(), size });
        }

        if transfer.buffer.len() + payload.len() > self.config.max_transfer_bytes {
            return Err(BlockError::TooLarge { limit: self.config.max_transfer_bytes });
        }

        transfer.buffer.extend_from_slice(payload);
        transfer.expected += 1;
        transfer.last_activity = now;

        if is_last {
            let buffer = self.transfers.remove(key).map(|t| t.buffer).unwrap_or_default();
            return Ok(BlockOutcome::Complete(buffer));
        }

        Ok(BlockOutcome::Continue {
            received: transfer.buffer.len(),
            next_expected: transfer.expected,
            size,
        })
    }

    /// Discard transfers idle for longer than the configured timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<BlockKey> {
        let timeout = self.config.transfer_timeout;
        let stale: Vec<BlockKey> = self
            .transfers
            .iter()
            .filter(|(_, t)| now.saturating_duration_since(t.last_activity) >= timeout)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            tracing::debug!(path = %key.path, server = key.server, "stale block transfer expired");
            self.transfers.remove(key);
        }
        stale
    }

    /// Drop one transfer.
    pub fn discard(&mut self, key: &BlockKey) -> bool {
        self.transfers.remove(key).is_some()
    }

    /// Drop every transfer owned by `server`.
    pub fn discard_server(&mut self, server: u16) -> usize {
        let before = self.transfers.len();
        self.transfers.retain(|k, _| k.server != server);
        before - self.transfers.len()
    }

    /// When the oldest idle transfer will expire.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.transfers.values().map(|t| t.last_activity + self.config.transfer_timeout).min()
    }

    /// Transfers in progress.
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    /// No transfers in progress.
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Idle time of a transfer, for diagnostics.
    pub fn idle_for(&self, key: &BlockKey, now: Instant) -> Option<Duration> {
        self.transfers.get(key).map(|t| now.saturating_duration_since(t.last_activity))
    }
}
