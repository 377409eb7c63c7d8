//! Scenario tests for the AOI engines
//!
//! - Single-channel engine behavior (enter/leave, moves, removal, bounds)
//! - Groups and global markers
//! - Layer isolation
//! - Shard split, merge and relocation
//! - Randomized consistency against a brute-force model

pub mod support;
