use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use snafu::{ensure, ResultExt};
use tracing::{debug, trace};

use crate::error::{
    AbortedSnafu, Error, HashTableNotAllocatedSnafu, InvalidParametersSnafu, Result,
    SeedNotFoundSnafu, SeedNotReadableSnafu, TargetWriteFailedSnafu,
};
use crate::rcksum::data_window::DataWindow;
use crate::rcksum::map::{ZBlockId, ZBlockMap, BITHASH_BITS};
use crate::rcksum::ranges::RangeSet;
use crate::rcksum::types::{MD4Digest, PartialChecksum, Rsum};

// Parameters of one reconstruction job, fixed for its lifetime.
#[derive(Copy, Clone, Debug)]
pub struct JobParams {
    pub block_size: usize,
    /// Absolute block id of the first block this job owns; jobs over disjoint
    /// partitions of one target can run side by side.
    pub block_id_offset: ZBlockId,
    pub blocks: usize,
    /// How many bytes of the rolling checksum the stream carries (2..=4).
    pub weak_bytes: usize,
    /// How many MD4 prefix bytes the stream carries (1..=16).
    pub strong_bytes: usize,
    /// 2 requires two consecutive blocks to match before accepting a hit.
    pub seq_matches: usize,
}

impl JobParams {
    pub fn weak_mask(&self) -> u16 {
        match self.weak_bytes {
            0..=2 => 0,
            3 => 0xff,
            _ => 0xffff,
        }
    }

    // log2 of the block size, rounded up for the non-power-of-two case.
    pub fn block_shift(&self) -> u32 {
        self.block_size.next_power_of_two().trailing_zeros()
    }

    pub fn context(&self) -> usize {
        self.block_size * self.seq_matches
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.block_size > 0,
            InvalidParametersSnafu { reason: "block_size must be positive" }
        );
        ensure!(
            (2..=4).contains(&self.weak_bytes),
            InvalidParametersSnafu { reason: "weak_bytes must be 2, 3 or 4" }
        );
        ensure!(
            (1..=16).contains(&self.strong_bytes),
            InvalidParametersSnafu { reason: "strong_bytes must be in 1..=16" }
        );
        ensure!(
            (1..=2).contains(&self.seq_matches),
            InvalidParametersSnafu { reason: "seq_matches must be 1 or 2" }
        );
        Ok(())
    }
}

// Cooperative cancellation; checked between buffer refills. Clone the flag
// and hand it to another thread to abort a running scan.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        CancelFlag::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// An inclusive absolute block range still missing from the target, with one
// MD4 prefix per block for verifying the data once fetched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequiredRange {
    pub from: ZBlockId,
    pub to: ZBlockId,
    pub checksums: Vec<Vec<u8>>,
}

#[derive(Debug)]
pub struct JobResult {
    pub error: Option<Error>,
    pub got_blocks: usize,
    /// None when the target was fully assembled (or the job failed before
    /// scanning).
    pub required_ranges: Option<Vec<RequiredRange>>,
}

impl JobResult {
    pub fn error_code(&self) -> i16 {
        self.error.as_ref().map_or(0, Error::code)
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

// One reconstruction job: owns the block hash table, the rsum index, the
// known-range set and the scanner state, and writes matched blocks into the
// target at block-aligned offsets.
pub struct CoreJob<W: Write + Seek> {
    params: JobParams,
    map: ZBlockMap,
    ranges: RangeSet,
    target: W,
    // Rolling sums for the windows at x and x + block_size (the second is
    // live only when seq_matches > 1).
    cur: [Rsum; 2],
    // Bytes to fast-forward at the start of the next buffer, set when a match
    // jump crossed the buffer tail.
    skip: usize,
    // Entry to probe first for the block following a run of matches.
    next_match: Option<ZBlockId>,
    // Known-range lookahead cached by the last full-chain match.
    next_known: ZBlockId,
    // Live chain position during check_chain; advanced past removed entries.
    rover: Option<ZBlockId>,
    got_blocks: usize,
    cancel: CancelFlag,
}

impl<W: Write + Seek> CoreJob<W> {
    pub fn new(params: JobParams, target: W) -> Result<Self> {
        CoreJob::with_cancel(params, target, CancelFlag::new())
    }

    pub fn with_cancel(params: JobParams, target: W, cancel: CancelFlag) -> Result<Self> {
        params.validate()?;
        ensure!(params.blocks > 0, HashTableNotAllocatedSnafu);
        Ok(CoreJob {
            map: ZBlockMap::new(params.blocks, params.seq_matches, params.weak_mask()),
            ranges: RangeSet::new(),
            target,
            cur: [Rsum::default(); 2],
            skip: 0,
            next_match: None,
            next_known: params.blocks,
            rover: None,
            got_blocks: 0,
            cancel,
            params,
        })
    }

    pub fn params(&self) -> &JobParams {
        &self.params
    }

    pub fn got_blocks(&self) -> usize {
        self.got_blocks
    }

    pub fn cancel_handle(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn into_target(self) -> W {
        self.target
    }

    // Parse `blocks` records of weak_bytes + strong_bytes bytes, in block-id
    // order, into the block hash table. New checksums invalidate any index
    // built over the old ones.
    pub fn parse_checksum_stream<R: Read>(&mut self, mut stream: R) -> Result<()> {
        let weak_bytes = self.params.weak_bytes;
        let strong_bytes = self.params.strong_bytes;
        let weak_mask = self.params.weak_mask();
        let blocks = self.map.num_blocks();

        fn read_err(e: std::io::Error, blocks: usize) -> Error {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::InvalidChecksumStream { blocks }
            } else {
                Error::ChecksumStreamReadFailed { source: e }
            }
        }

        for id in 0..blocks {
            // The weak checksum is the top weak_bytes of a 4-byte big-endian
            // (a, b) field; assembled explicitly, never by aliasing.
            let mut field = [0u8; 4];
            stream
                .read_exact(&mut field[4 - weak_bytes..])
                .map_err(|e| read_err(e, blocks))?;

            let mut digest = [0u8; 16];
            stream
                .read_exact(&mut digest[..strong_bytes])
                .map_err(|e| read_err(e, blocks))?;

            let a = u16::from_be_bytes([field[0], field[1]]) & weak_mask;
            let b = u16::from_be_bytes([field[2], field[3]]);

            self.map.insert(
                id,
                Rsum { a, b },
                PartialChecksum { value: MD4Digest(digest), length: strong_bytes },
            );
        }

        self.map.invalidate_index();
        debug!(blocks, weak_bytes, strong_bytes, "parsed checksum stream");
        Ok(())
    }

    // Open the seed, checking existence and read permission, and scan it.
    // The handle is closed on every path out of the scan.
    pub fn submit_seed_file(&mut self, path: &Path) -> Result<usize> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                return match e.kind() {
                    std::io::ErrorKind::NotFound => SeedNotFoundSnafu { path }.fail(),
                    std::io::ErrorKind::PermissionDenied => SeedNotReadableSnafu { path }.fail(),
                    _ => Err(Error::SeedOpenFailed { path: path.to_path_buf(), source: e }),
                };
            }
        };
        self.submit_source(file)
    }

    // Scan a seed stream, writing every block it can supply to the target.
    // Returns how many target blocks this stream provided.
    //
    // A buffer of 16 blocks plus context is refilled preserving the trailing
    // context bytes, so the sliding window crosses refill boundaries without
    // losing continuity; the final refill is zero-padded by context bytes.
    pub fn submit_source<R: Read>(&mut self, mut source: R) -> Result<usize> {
        if !self.map.is_indexed() {
            self.map.build_index();
        }

        let context = self.params.context();
        let bufsize = self.params.block_size * 16;
        let mut buf = vec![0u8; bufsize + context];

        let mut in_bytes: u64 = 0;
        let mut got = 0usize;
        let mut eof = false;

        while !eof {
            ensure!(!self.cancel.is_cancelled(), AbortedSnafu);

            let start = in_bytes;
            let len = if in_bytes == 0 {
                let n = read_fill(&mut source, &mut buf[..bufsize])?;
                eof = n < bufsize;
                in_bytes += n as u64;
                if eof {
                    buf[n..n + context].fill(0);
                    n + context
                } else {
                    n
                }
            } else {
                // Keep the last context bytes, refill the rest.
                buf.copy_within(bufsize - context..bufsize, 0);
                let n = read_fill(&mut source, &mut buf[context..bufsize])?;
                eof = n < bufsize - context;
                in_bytes += (bufsize - context) as u64;
                let mut l = context + n;
                if eof {
                    buf[l..l + context].fill(0);
                    l += context;
                }
                l
            };

            let found = self.submit_source_data(&buf[..len], start)?;
            got += found;
            trace!(offset = start, found, "scanned buffer");
        }

        debug!(got, "seed scan complete");
        Ok(got)
    }

    // Slide the match window over one buffer. `offset` is 0 for the first
    // buffer of a stream; otherwise scanning resumes `skip` bytes in, with
    // the rolling sums carried over from the previous buffer.
    fn submit_source_data(&mut self, data: &[u8], offset: u64) -> Result<usize> {
        let bs = self.params.block_size;
        let seq = self.params.seq_matches;
        let shift = self.params.block_shift();
        let weak_mask = self.params.weak_mask();

        let mut win = DataWindow::new(data, bs, self.params.context());
        let mut got = 0usize;

        if offset != 0 {
            win.advance_bytes(self.skip);
        } else {
            self.next_match = None;
        }

        if win.pos() != 0 || offset == 0 {
            if win.overrun() > 0 {
                self.skip = win.overrun();
                return Ok(0);
            }
            self.cur[0] = Rsum::calculate(win.block(0));
            if seq > 1 {
                self.cur[1] = Rsum::calculate(win.block(1));
            }
        }
        self.skip = 0;

        loop {
            if win.at_limit() {
                return Ok(got);
            }

            let mut thismatch = 0usize;
            let mut blocks_matched = 0usize;

            // After a run of matches, probe the next target block directly
            // before paying for a full hash lookup.
            if seq > 1 {
                if let Some(hint) = self.next_match {
                    thismatch = self.check_chain(hint, win.window(), true)?;
                    if thismatch > 0 {
                        blocks_matched = 1;
                    }
                }
            }

            if thismatch == 0 {
                let mut h = u32::from(self.cur[0].b);
                h ^= (if seq > 1 {
                    u32::from(self.cur[1].b)
                } else {
                    u32::from(self.cur[0].a & weak_mask)
                }) << BITHASH_BITS;

                if self.map.hit_bithash(h) {
                    if let Some(head) = self.map.bucket_head(h) {
                        thismatch = self.check_chain(head, win.window(), false)?;
                        if thismatch > 0 {
                            blocks_matched = seq;
                        }
                    }
                }
            }
            got += thismatch;

            if blocks_matched > 0 {
                // Target blocks are block_size apart, so after a hit the next
                // possible hit is a whole block away.
                win.advance_bytes(bs + if blocks_matched > 1 { bs } else { 0 });

                if win.overrun() > 0 {
                    // The rsum for the next window is not in this buffer;
                    // leave a hint so the next call recalculates.
                    self.skip = win.overrun();
                    return Ok(got);
                }

                if seq > 1 && blocks_matched == 1 {
                    self.cur[0] = self.cur[1];
                } else {
                    self.cur[0] = Rsum::calculate(win.block(0));
                }
                if seq > 1 {
                    self.cur[1] = Rsum::calculate(win.block(1));
                }
                continue;
            }

            // No hit: slide the window one byte.
            let oc = win.byte_at_block(0);
            let nc = win.byte_at_block(1);
            self.cur[0] = self.cur[0].update(oc, nc, shift);
            if seq > 1 {
                let nnc = win.byte_at_block(2);
                self.cur[1] = self.cur[1].update(nc, nnc, shift);
            }
            win.advance_bytes(1);
        }
    }

    // Test the window against every entry on a hash chain (or just `head`
    // when only_one). Entries are unlinked as their blocks are written; the
    // rover is captured before each candidate so removal is safe during the
    // walk. Returns the number of target blocks obtained.
    fn check_chain(&mut self, head: ZBlockId, window: &[u8], only_one: bool) -> Result<usize> {
        let bs = self.params.block_size;
        let seq = self.params.seq_matches;
        let strong_bytes = self.params.strong_bytes;
        let weak_mask = self.params.weak_mask();
        let blocks = self.map.num_blocks();

        let mut md4sums = [MD4Digest::default(); 2];
        let mut done_md4: isize = -1;
        let mut got = 0usize;
        let rs = self.cur[0];

        // Cleared here, set below when a run of matches leaves a hint.
        self.next_match = None;

        self.rover = Some(head);
        while let Some(id) = self.rover {
            self.rover = if only_one { None } else { self.map.next_in_chain(id) };

            let e = *self.map.entry(id);
            if e.rsum.a != rs.a & weak_mask || e.rsum.b != rs.b {
                continue;
            }

            if !only_one && seq > 1 {
                let e2 = *self.map.entry(id + 1);
                if e2.rsum.a != self.cur[1].a & weak_mask || e2.rsum.b != self.cur[1].b {
                    continue;
                }
            }

            // Strong confirmation. Each block's MD4 is computed at most once
            // per chain walk. The multi-block check stops at the table's last
            // real block, so the final block can match alone at seed EOF.
            let mut ok = true;
            let mut check_md4 = 0usize;
            loop {
                if check_md4 as isize > done_md4 {
                    md4sums[check_md4] =
                        MD4Digest::calculate(&window[bs * check_md4..bs * (check_md4 + 1)]);
                    done_md4 = check_md4 as isize;
                }
                let computed = PartialChecksum { value: md4sums[check_md4], length: strong_bytes };
                if self.map.entry(id + check_md4).checksum != computed {
                    ok = false;
                }
                check_md4 += 1;
                if !(ok && !only_one && check_md4 < seq && id + check_md4 < blocks) {
                    break;
                }
            }

            if ok {
                // The next block we already have data for bounds how much of
                // this run still needs writing.
                let next_known = if only_one {
                    self.next_known
                } else {
                    self.ranges.next_known(id).unwrap_or(blocks)
                };

                let num_write;
                if next_known > id + check_md4 {
                    num_write = check_md4;
                    self.next_match = Some(id + check_md4);
                    if !only_one {
                        self.next_known = next_known;
                    }
                } else {
                    // EOF or data we already know: write out what is missing
                    // and end this run of matches.
                    num_write = next_known.saturating_sub(id);
                }

                if num_write > 0 {
                    self.write_blocks(&window[..num_write * bs], id, id + num_write - 1)?;
                    got += num_write;
                }
            }
        }
        Ok(got)
    }

    // Write the inclusive block range from the buffer into the target,
    // preserving the writer's position, then retire the blocks: unlink each
    // entry from the rsum index and record the id as known.
    fn write_blocks(&mut self, data: &[u8], bfrom: ZBlockId, bto: ZBlockId) -> Result<()> {
        let bs = self.params.block_size;
        let len = (bto - bfrom + 1) * bs;
        let offset = ((bfrom + self.params.block_id_offset) as u64) << self.params.block_shift();

        trace!(bfrom, bto, offset, "writing matched blocks");

        let pos = self.target.stream_position().context(TargetWriteFailedSnafu)?;
        self.target.seek(SeekFrom::Start(offset)).context(TargetWriteFailedSnafu)?;
        self.target.write_all(&data[..len]).context(TargetWriteFailedSnafu)?;
        self.target.seek(SeekFrom::Start(pos)).context(TargetWriteFailedSnafu)?;

        for id in bfrom..=bto {
            if self.rover == Some(id) {
                self.rover = self.map.next_in_chain(id);
            }
            self.map.remove(id);
            self.ranges.add(id);
            self.got_blocks += 1;
        }
        Ok(())
    }

    // Verify a downloaded block against its stored MD4 prefix and commit it.
    // Returns false (and writes nothing) for a mismatch or a block we already
    // have. `id` is absolute.
    pub fn submit_remote_block(&mut self, id: ZBlockId, data: &[u8]) -> Result<bool> {
        ensure!(
            data.len() == self.params.block_size,
            InvalidParametersSnafu { reason: "remote block has wrong length" }
        );
        let local = match id
            .checked_sub(self.params.block_id_offset)
            .filter(|l| *l < self.map.num_blocks())
        {
            Some(l) => l,
            None => {
                return InvalidParametersSnafu { reason: "block id outside this job" }.fail();
            }
        };

        if self.ranges.contains(local) {
            return Ok(false);
        }

        let computed = PartialChecksum {
            value: MD4Digest::calculate(data),
            length: self.params.strong_bytes,
        };
        if self.map.entry(local).checksum == computed {
            self.write_blocks(data, local, local)?;
            Ok(true)
        } else {
            debug!(id, "remote block failed verification");
            Ok(false)
        }
    }

    // Verify and commit a contiguous run of downloaded blocks starting at the
    // absolute id `from`. Returns how many blocks were newly obtained.
    pub fn submit_remote_blocks(&mut self, from: ZBlockId, data: &[u8]) -> Result<usize> {
        let bs = self.params.block_size;
        ensure!(
            !data.is_empty() && data.len() % bs == 0,
            InvalidParametersSnafu { reason: "remote data must be a whole number of blocks" }
        );
        let mut verified = 0;
        for (k, chunk) in data.chunks_exact(bs).enumerate() {
            if self.submit_remote_block(from + k, chunk)? {
                verified += 1;
            }
        }
        Ok(verified)
    }

    pub fn already_got_block(&self, id: ZBlockId) -> bool {
        id.checked_sub(self.params.block_id_offset)
            .map_or(false, |local| self.ranges.contains(local))
    }

    // Invert the known ranges into the list of absolute block ranges still to
    // fetch, each annotated with its per-block MD4 prefixes. None means the
    // target is fully assembled from what was submitted.
    pub fn required_ranges(&self) -> Option<Vec<RequiredRange>> {
        let blocks = self.map.num_blocks();
        let off = self.params.block_id_offset;
        let strong_bytes = self.params.strong_bytes;

        let make = |lo: ZBlockId, hi: ZBlockId| RequiredRange {
            from: lo + off,
            to: hi + off,
            checksums: (lo..=hi)
                .map(|id| self.map.entry(id).checksum.value.0[..strong_bytes].to_vec())
                .collect(),
        };

        let mut result = Vec::new();
        let mut cursor = 0usize;
        for (lo, hi) in self.ranges.iter() {
            if lo > cursor {
                result.push(make(cursor, lo - 1));
            }
            cursor = hi + 1;
        }
        if cursor < blocks {
            result.push(make(cursor, blocks - 1));
        }

        if result.is_empty() {
            None
        } else {
            Some(result)
        }
    }
}

fn read_fill<R: Read>(source: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::SeedReadFailed { source: e }),
        }
    }
    Ok(filled)
}

// Run one whole job: parse the checksum stream, open and scan the seed, and
// report what is still missing. Errors before scanning leave the target
// untouched; errors during scanning keep the blocks already written and
// report partial progress so the caller can retry with another seed.
pub fn run<R, W>(params: JobParams, checksum_stream: R, seed_path: &Path, target: W) -> JobResult
where
    R: Read,
    W: Write + Seek,
{
    run_with_cancel(params, checksum_stream, seed_path, target, CancelFlag::new())
}

pub fn run_with_cancel<R, W>(
    params: JobParams,
    checksum_stream: R,
    seed_path: &Path,
    target: W,
    cancel: CancelFlag,
) -> JobResult
where
    R: Read,
    W: Write + Seek,
{
    let fail = |error: Error| JobResult { error: Some(error), got_blocks: 0, required_ranges: None };

    let mut job = match CoreJob::with_cancel(params, target, cancel) {
        Ok(job) => job,
        Err(e) => return fail(e),
    };
    if let Err(e) = job.parse_checksum_stream(checksum_stream) {
        return fail(e);
    }
    match job.submit_seed_file(seed_path) {
        Ok(got) => {
            debug!(got, total = job.got_blocks(), "seed consumed");
        }
        Err(e) => {
            return JobResult {
                error: Some(e),
                got_blocks: job.got_blocks(),
                required_ranges: None,
            };
        }
    }

    JobResult {
        error: None,
        got_blocks: job.got_blocks(),
        required_ranges: job.required_ranges(),
    }
}
