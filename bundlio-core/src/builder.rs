//! Bin-packing of buffered pieces into a size-bounded aggregate.

use crate::{BufferedPiece, BundlioError, CommitmentScheme, PieceLink, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateLimits {
    pub max_aggregate_size: u64,
    pub min_aggregate_size: u64,
}

impl AggregateLimits {
    pub fn new(max_aggregate_size: u64, min_aggregate_size: u64) -> Result<Self> {
        if max_aggregate_size == 0 {
            return Err(BundlioError::Config(
                "max_aggregate_size must be positive".to_string(),
            ));
        }
        if min_aggregate_size >= max_aggregate_size {
            return Err(BundlioError::Config(format!(
                "min_aggregate_size ({}) must be below max_aggregate_size ({})",
                min_aggregate_size, max_aggregate_size
            )));
        }

        Ok(Self {
            max_aggregate_size,
            min_aggregate_size,
        })
    }

    /// Whether a single piece can ever be packed under these limits.
    pub fn admits(&self, piece_size: u64, entry_overhead: u64) -> bool {
        piece_size.saturating_add(entry_overhead) <= self.max_aggregate_size
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateInfo {
    pub added: Vec<BufferedPiece>,
    pub remaining: Vec<BufferedPiece>,
    pub link: PieceLink,
    pub used_space: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateBuild {
    /// Not enough mass yet. The caller keeps its original, unsplit list.
    Insufficient { used_space: u64 },
    Built(AggregateInfo),
}

/// Retry pieces first, then smaller pieces first. The commitment breaks ties
/// so the order does not depend on arrival order.
pub fn sort_pieces(pieces: &mut [BufferedPiece]) {
    pieces.sort_by(|a, b| {
        (a.policy, a.size(), &a.piece.commitment).cmp(&(b.policy, b.size(), &b.piece.commitment))
    });
}

pub fn build_aggregate(
    pieces: &[BufferedPiece],
    limits: &AggregateLimits,
    scheme: &dyn CommitmentScheme,
) -> Result<AggregateBuild> {
    let overhead = scheme.entry_overhead();

    let mut sorted = pieces.to_vec();
    sort_pieces(&mut sorted);

    let mut added = Vec::new();
    let mut remaining = Vec::new();
    let mut offset = 0u64;

    for piece in sorted {
        let needed = piece.size().saturating_add(overhead);
        if offset.saturating_add(needed) > limits.max_aggregate_size {
            if !limits.admits(piece.size(), overhead) {
                tracing::warn!(
                    "piece can never fit an aggregate. piece={} size={} max_aggregate_size={}",
                    piece.piece,
                    piece.size(),
                    limits.max_aggregate_size
                );
            }
            remaining.push(piece);
            continue;
        }

        offset += needed;
        added.push(piece);
    }

    let used_space =
        added.iter().map(BufferedPiece::size).sum::<u64>() + added.len() as u64 * overhead;

    if used_space <= limits.min_aggregate_size {
        tracing::debug!(
            "insufficient mass for aggregate. pieces={} used_space={} min_aggregate_size={}",
            pieces.len(),
            used_space,
            limits.min_aggregate_size
        );
        return Ok(AggregateBuild::Insufficient { used_space });
    }

    let links: Vec<PieceLink> = added.iter().map(|piece| piece.piece.clone()).collect();
    let link = scheme.aggregate(&links, limits.max_aggregate_size)?;

    Ok(AggregateBuild::Built(AggregateInfo {
        added,
        remaining,
        link,
        used_space,
    }))
}
