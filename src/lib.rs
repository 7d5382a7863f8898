//! zsync-style block reconstruction engine.
//!
//! Matches blocks of a local seed file against per-block checksums of a
//! target file, writes the matched blocks into the under-construction output,
//! and reports the block ranges that still need to be fetched together with
//! their strong checksums.

pub mod error;
pub mod rcksum;
