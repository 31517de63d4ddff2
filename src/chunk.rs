//! Chunk sizing policy.

/// Shrink each worker's share by this shift so that there are ~4x as many
/// chunks as workers; faster workers then pick up the slack from slower
/// ones.
const LOAD_BAL_SHIFT: u32 = 2;

/// The size of each claim for a job of `total` units split across `nworks`
/// workers.
///
/// A single worker takes the whole job in one claim. Otherwise the chunk is
/// kept a multiple of `min_chunk` (callers that operate in fixed-size
/// batches rely on this) and never below it.
pub(crate) fn chunk_size(total: usize, min_chunk: usize, nworks: usize) -> usize {
    debug_assert!(min_chunk > 0);
    debug_assert!(nworks > 0);

    if nworks == 1 {
        return total;
    }

    let mut chunk = (total / nworks) >> LOAD_BAL_SHIFT;

    if chunk > min_chunk {
        chunk -= chunk % min_chunk;
    }

    chunk.max(min_chunk)
}
