use crate::{BundlioError, PieceLink, Result};
use sha2::{Digest, Sha256};

/// Size of one data segment index entry. Fixed by the downstream deal
/// verification scheme and must not be tuned.
pub const INDEX_ENTRY_SIZE: u64 = 64;

/// Commitment capability used by the aggregate builder.
pub trait CommitmentScheme: Send + Sync {
    /// Structural bytes added to an aggregate for every entry it contains.
    fn entry_overhead(&self) -> u64;

    /// Commitment over the ordered pieces of an aggregate of `aggregate_size`.
    fn aggregate(&self, pieces: &[PieceLink], aggregate_size: u64) -> Result<PieceLink>;
}

/// Binary SHA-256 merkle tree over the piece commitments.
#[derive(Debug, Clone)]
pub struct MerkleCommitment {
    entry_overhead: u64,
}

impl MerkleCommitment {
    pub fn new() -> Self {
        Self {
            entry_overhead: INDEX_ENTRY_SIZE,
        }
    }

    pub fn with_entry_overhead(entry_overhead: u64) -> Self {
        Self { entry_overhead }
    }
}

impl Default for MerkleCommitment {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitmentScheme for MerkleCommitment {
    fn entry_overhead(&self) -> u64 {
        self.entry_overhead
    }

    fn aggregate(&self, pieces: &[PieceLink], aggregate_size: u64) -> Result<PieceLink> {
        if pieces.is_empty() {
            return Err(BundlioError::InvalidRequest(
                "cannot commit to an empty aggregate".to_string(),
            ));
        }

        let leaves: Vec<[u8; 32]> = pieces.iter().map(leaf_hash).collect();
        let root = compute_merkle_root(&leaves);
        Ok(PieceLink::new(hex::encode(root), aggregate_size))
    }
}

fn leaf_hash(piece: &PieceLink) -> [u8; 32] {
    let mut hasher = Sha256::new();
    match hex::decode(&piece.commitment) {
        Ok(raw) => hasher.update(&raw),
        Err(_) => hasher.update(piece.commitment.as_bytes()),
    }
    hasher.update(piece.size.to_be_bytes());
    hasher.finalize().into()
}

/// Odd-length levels duplicate their last node.
pub fn compute_merkle_root(leaves: &[[u8; 32]]) -> [u8; 32] {
    if leaves.is_empty() {
        return [0u8; 32];
    }

    let mut level = leaves.to_vec();
    while level.len() > 1 {
        let mut next: Vec<[u8; 32]> = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            let mut hasher = Sha256::new();
            hasher.update(left);
            hasher.update(right);
            next.push(hasher.finalize().into());
        }
        level = next;
    }

    level[0]
}
