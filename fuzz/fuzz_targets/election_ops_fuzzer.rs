//! Fuzz target for leader election
//!
//! # Strategy
//!
//! - Tabs join, leave and change activity at arbitrary virtual times
//! - Ops index tabs modulo the number opened so far, so most ops hit a tab
//! - After the last op the cluster runs for ten election rounds
//!
//! # Invariants
//!
//! - At most one leader, and exactly one while any tab is open
//! - The leader's bid is the elected record

#![no_main]

use std::{collections::HashSet, time::Duration};

use arbitrary::Arbitrary;
use kiip_core::ActivityRank;
use kiip_harness::{InvariantRegistry, SimTabs};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Clone, Arbitrary)]
enum Rank {
    Focused,
    Visible,
    Hidden,
}

impl From<Rank> for ActivityRank {
    fn from(rank: Rank) -> Self {
        match rank {
            Rank::Focused => Self::Focused,
            Rank::Visible => Self::Visible,
            Rank::Hidden => Self::Hidden,
        }
    }
}

#[derive(Debug, Clone, Arbitrary)]
enum ElectionOp {
    Open(Rank),
    Close(u8),
    SetActivity(u8, Rank),
    Advance(u8),
}

#[derive(Debug, Arbitrary)]
struct Input {
    seed: u64,
    ops: Vec<ElectionOp>,
}

fuzz_target!(|input: Input| {
    let mut tabs = SimTabs::new(input.seed);
    let mut opened = 0usize;

    for op in input.ops.into_iter().take(64) {
        match op {
            ElectionOp::Open(rank) => {
                tabs.open(rank.into());
                opened += 1;
            },
            ElectionOp::Close(index) if opened > 0 => tabs.close(usize::from(index) % opened),
            ElectionOp::SetActivity(index, rank) if opened > 0 => {
                tabs.set_activity(usize::from(index) % opened, rank.into());
            },
            ElectionOp::Advance(ms) => tabs.advance(Duration::from_millis(u64::from(ms))),
            ElectionOp::Close(_) | ElectionOp::SetActivity(..) => {},
        }
    }

    tabs.advance(Duration::from_millis(2000));

    // Equal bids are indistinguishable to the protocol.
    let snapshot = tabs.snapshot();
    let bids: HashSet<_> = snapshot.tabs.iter().map(|t| t.bid.clone()).collect();
    if bids.len() != snapshot.tabs.len() {
        return;
    }
    InvariantRegistry::standard().assert_all(&snapshot, "after settling");
});
