//! Weighted chunk allocation.
//!
//! The planner divides one block-aligned space into contiguous chunks, each
//! constrained by a `[min, max]` byte range and a proportional weight. When
//! every chunk fits at its maximum there is nothing to arbitrate; otherwise
//! the space left after the minima is split proportionally to each chunk's
//! weighted growth span, and the last chunk absorbs the block-alignment
//! residue so the space is consumed exactly.

use serde::Serialize;

use recipe_api::error::AllocError;

/// A bounded, block-aligned space to divide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkSpace {
    pub blocks: u64,
    pub block_size: u64,
}

impl ChunkSpace {
    /// Both dimensions must be at least 1.
    pub fn new(blocks: u64, block_size: u64) -> Self {
        debug_assert!(blocks >= 1 && block_size >= 1);
        Self { blocks, block_size }
    }

    pub fn bytes(&self) -> u64 {
        self.blocks * self.block_size
    }
}

/// Size constraints of one requested chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkBounds {
    pub min_bytes: u64,
    pub max_bytes: u64,
    pub weight: u64,
}

impl ChunkBounds {
    pub fn new(min_bytes: u64, max_bytes: u64, weight: u64) -> Self {
        Self {
            min_bytes,
            max_bytes,
            weight,
        }
    }
}

/// One allocated chunk: the request, its block-aligned bounds, and the size
/// the planner settled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub bounds: ChunkBounds,

    /// Requested minimum rounded up to the block size.
    pub aligned_min: u64,

    /// Requested maximum rounded down to the block size.
    pub aligned_max: u64,

    /// Weight-adjusted growth span used for proportional arbitration;
    /// zero when the space was not contested.
    pub share: u64,

    /// Final size in bytes. Always block-aligned and within
    /// `[aligned_min, aligned_max]`.
    pub size: u64,
}

/// Rounds `size` up to the next multiple of `block_size`.
pub fn align_up(size: u64, block_size: u64) -> u64 {
    if size % block_size == 0 {
        size
    } else {
        (size / block_size + 1) * block_size
    }
}

/// Rounds `size` down to the previous multiple of `block_size`.
pub fn align_down(size: u64, block_size: u64) -> u64 {
    size / block_size * block_size
}

/// Whether `space` can hold every chunk at its block-aligned minimum.
pub fn fits_at_minimum(space: ChunkSpace, bounds: &[ChunkBounds]) -> bool {
    let needed: u128 = bounds
        .iter()
        .map(|b| align_up(b.min_bytes, space.block_size) as u128)
        .sum();
    needed <= space.bytes() as u128
}

/// Divides `space` across `bounds`, in input order.
pub fn allocate(space: ChunkSpace, bounds: &[ChunkBounds]) -> Result<Vec<Chunk>, AllocError> {
    let available = space.bytes();

    let mut chunks = Vec::with_capacity(bounds.len());
    for b in bounds {
        if b.min_bytes == 0 || b.min_bytes > b.max_bytes {
            return Err(AllocError::BadChunkBounds {
                min: b.min_bytes,
                max: b.max_bytes,
            });
        }

        let aligned_min = align_up(b.min_bytes, space.block_size);
        let aligned_max = align_down(b.max_bytes, space.block_size);
        if aligned_max < aligned_min {
            // The range is too narrow to contain a block multiple.
            return Err(AllocError::BadChunkBounds {
                min: b.min_bytes,
                max: b.max_bytes,
            });
        }

        chunks.push(Chunk {
            bounds: *b,
            aligned_min,
            aligned_max,
            share: 0,
            size: 0,
        });
    }

    let needed: u128 = chunks.iter().map(|c| c.aligned_min as u128).sum();
    if needed > available as u128 {
        return Err(AllocError::Insufficient {
            needed: needed.min(u64::MAX as u128) as u64,
            available,
        });
    }

    let sum_max: u128 = chunks.iter().map(|c| c.aligned_max as u128).sum();
    if sum_max <= available as u128 {
        // Uncontested: everybody gets their maximum.
        for chunk in &mut chunks {
            chunk.size = chunk.aligned_max;
        }
        return Ok(chunks);
    }

    // Contested. Each chunk's share of the leftover space is its growth
    // span scaled by its weight.
    let sum_weight: u64 = chunks.iter().map(|c| c.bounds.weight).sum();
    if sum_weight > 0 {
        for chunk in &mut chunks {
            let span = (chunk.aligned_max - chunk.aligned_min) as f64;
            chunk.share =
                (span * chunk.bounds.weight as f64 / sum_weight as f64).round() as u64;
        }
    }

    let sum_share: u64 = chunks.iter().map(|c| c.share).sum();
    let sum_min: u64 = chunks.iter().map(|c| c.aligned_min).sum();
    let remaining = available - sum_min;

    if sum_share == 0 {
        // Nothing to arbitrate with (all weights zero, or every span rounds
        // to nothing): minimums first, leftovers handed out left to right.
        // Contention guarantees the headroom swallows the leftover whole.
        let mut leftover = remaining;
        for chunk in &mut chunks {
            let take = leftover.min(chunk.aligned_max - chunk.aligned_min);
            chunk.size = chunk.aligned_min + take;
            leftover -= take;
        }
        debug_assert_eq!(leftover, 0);
        return Ok(chunks);
    }

    let last = chunks.len() - 1;
    let mut used: u64 = 0;
    for chunk in chunks[..last].iter_mut() {
        let factor = chunk.share as f64 / sum_share as f64;
        let grown = chunk.aligned_min + (remaining as f64 * factor) as u64;
        chunk.size = align_down(grown, space.block_size).min(chunk.aligned_max);
        used += chunk.size;
    }

    // The last chunk absorbs the rounding residue so the space is consumed
    // exactly. When that would push it past its maximum, the overflow is
    // pushed back into earlier chunks with headroom, nearest first.
    let residue = available - used;
    debug_assert!(residue >= chunks[last].aligned_min);

    if residue > chunks[last].aligned_max {
        let mut excess = residue - chunks[last].aligned_max;
        chunks[last].size = chunks[last].aligned_max;

        for chunk in chunks[..last].iter_mut().rev() {
            if excess == 0 {
                break;
            }
            let take = excess.min(chunk.aligned_max - chunk.size);
            chunk.size += take;
            excess -= take;
        }

        if excess > 0 {
            return Err(AllocError::ResidueOverflow { excess });
        }
    } else {
        chunks[last].size = residue;
    }

    Ok(chunks)
}
