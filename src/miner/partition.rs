//! Splitting a template's search space across workers.
//!
//! Work is addressed by a 64-bit work index: the low 32 bits are the header
//! nonce and the high 32 bits select the coinbase extra-nonce. Walking the
//! index space therefore rolls the extra-nonce (and with it the merkle root)
//! each time the header nonce space is used up.

use crate::chain::{TemplateId, WorkTemplate};
use crate::error::MinerError;

/// Contiguous slice of work indices assigned to one worker for one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceRange {
    pub worker: usize,
    /// First work index, inclusive
    pub start: u64,
    /// Exclusive
    pub end: u64,
}

impl NonceRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn overlaps(&self, other: &NonceRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Split a work index into (extra-nonce, header nonce).
pub fn split_index(index: u64) -> (u64, u32) {
    (index >> 32, index as u32)
}

pub fn work_index(extra_nonce: u64, nonce: u32) -> u64 {
    (extra_nonce << 32) | u64::from(nonce)
}

/// Lay out `thread_count` back-to-back ranges of `iterations` indices starting at `cursor`.
///
/// Returns `None` if the ranges would run past the end of the index space.
pub fn partition_from(cursor: u64, thread_count: usize, iterations: u64) -> Option<Vec<NonceRange>> {
    let total = iterations.checked_mul(thread_count as u64)?;
    cursor.checked_add(total)?;

    Some(
        (0..thread_count)
            .map(|worker| {
                let start = cursor + worker as u64 * iterations;
                NonceRange {
                    worker,
                    start,
                    end: start + iterations,
                }
            })
            .collect(),
    )
}

/// Hands out fresh ranges per round, continuing where the last round on the
/// same template stopped.
#[derive(Debug, Default)]
pub struct NoncePartitioner {
    template: Option<TemplateId>,
    cursor: u64,
}

impl NoncePartitioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next unassigned work index for the current template.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn partition(
        &mut self,
        template: &WorkTemplate,
        thread_count: usize,
        iterations_per_thread: u64,
    ) -> Result<Vec<NonceRange>, MinerError> {
        if self.template != Some(template.id) {
            self.template = Some(template.id);
            self.cursor = 0;
        }

        let ranges = partition_from(self.cursor, thread_count, iterations_per_thread)
            .ok_or(MinerError::SearchSpaceExhausted {
                template: template.id,
            })?;

        if let Some(last) = ranges.last() {
            self.cursor = last.end;
        }
        Ok(ranges)
    }
}
