//! Fuzz target for [`BlockReassembler`]
//!
//! # Strategy
//!
//! Arbitrary sequences of Block1 blocks (any number, size, payload length
//! and last flag) across a few transfers, interleaved with clock advances
//! that trigger expiry.
//!
//! # Invariants
//!
//! - NEVER panic
//! - A completed body never exceeds `max_transfer_bytes`
//! - A transfer completes only on a block flagged last
//! - A transfer that errors is gone afterwards

#![no_main]

use std::time::{Duration, Instant};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use mote_core::{BlockConfig, BlockKey, BlockOutcome, BlockReassembler, Direction};
use mote_proto::ResourcePath;

#[derive(Debug, Clone, Arbitrary)]
enum BlockEvent {
    Block { transfer: u8, seq: u8, szx: u8, len: u8, last: bool },
    Advance { secs: u16 },
}

#[derive(Debug, Clone, Arbitrary)]
struct FuzzInput {
    events: Vec<BlockEvent>,
}

fn key(transfer: u8) -> BlockKey {
    let path = ResourcePath::new(&[5, 0, u16::from(transfer % 4)]).unwrap_or_default();
    BlockKey::new(1, path, Direction::Block1)
}

fuzz_target!(|input: FuzzInput| {
    let config = BlockConfig { max_transfer_bytes: 512, ..BlockConfig::default() };
    let limit = config.max_transfer_bytes;
    let mut reassembler = BlockReassembler::new(config);
    let mut now = Instant::now();

    for event in input.events {
        match event {
            BlockEvent::Block { transfer, seq, szx, len, last } => {
                let key = key(transfer);
                let size = 16u16 << (szx % 8);
                let payload = vec![seq; usize::from(len)];
                match reassembler.accept_block(&key, u32::from(seq), &payload, last, size, now) {
                    Ok(BlockOutcome::Complete(body)) => {
                        assert!(last, "completed on a block without the last flag");
                        assert!(body.len() <= limit, "body of {} exceeds {limit}", body.len());
                    },
                    Ok(BlockOutcome::Continue { received, .. }) => {
                        assert!(received <= limit);
                    },
                    Err(_) => {
                        assert!(reassembler.idle_for(&key, now).is_none(), "failed transfer kept");
                    },
                }
            },
            BlockEvent::Advance { secs } => {
                now += Duration::from_secs(u64::from(secs));
                reassembler.expire(now);
            },
        }
    }
});
