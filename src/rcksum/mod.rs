pub mod client;
pub mod data_window;
pub mod map;
pub mod ranges;
pub mod types;

pub use client::{run, run_with_cancel, CancelFlag, CoreJob, JobParams, JobResult, RequiredRange};
pub use map::{ZBlock, ZBlockId, ZBlockMap, BITHASH_BITS};
pub use ranges::RangeSet;
pub use types::{MD4Digest, PartialChecksum, Rsum};
