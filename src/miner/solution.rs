use std::fmt;

use crate::chain::{BlockHash, TemplateId};

use super::partition::work_index;

/// A header whose hash met the template target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub template_id: TemplateId,
    pub worker: usize,
    pub extra_nonce: u64,
    pub nonce: u32,
    pub hash: BlockHash,
    pub hash_attempts: u64,
}

impl Candidate {
    /// Position of this candidate in the template's search space.
    pub fn work_index(&self) -> u64 {
        work_index(self.extra_nonce, self.nonce)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (template {}, extra-nonce {}, nonce {})",
            self.hash, self.template_id, self.extra_nonce, self.nonce
        )
    }
}
