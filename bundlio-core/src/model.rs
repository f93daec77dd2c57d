//! Records flowing through the aggregation pipeline.
//!
//! Every relationship between records (aggregate → buffer → pieces) is a
//! content identifier looked up in a store, never an in-memory reference.

use crate::state::{AggregateStatus, DealStatus, InclusionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hex encoded SHA-256 of a record's canonical encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ContentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Piece identifier as produced by the commitment scheme. `size` is the padded
/// size used for every packing decision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PieceLink {
    pub commitment: String,
    pub size: u64,
}

impl PieceLink {
    pub fn new(commitment: impl Into<String>, size: u64) -> Self {
        Self {
            commitment: commitment.into(),
            size,
        }
    }
}

impl fmt::Display for PieceLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.commitment)
    }
}

/// Ordering key shared by every stage of the pipeline.
pub fn group_key(storefront: &str, group: &str) -> String {
    format!("{}:{}", storefront, group)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Piece {
    pub piece: PieceLink,
    pub inserted_at: DateTime<Utc>,
    pub storefront: String,
    pub group: String,
}

/// Marks a piece whose buffer made it onto the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PieceReceipt {
    pub piece: String,
    pub buffer: ContentId,
}

/// Declaration order is the packing priority: `Retry` sorts before `Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Policy {
    Retry,
    Normal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferedPiece {
    pub piece: PieceLink,
    pub inserted_at: DateTime<Utc>,
    pub policy: Policy,
}

impl BufferedPiece {
    pub fn size(&self) -> u64 {
        self.piece.size
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Buffer {
    pub pieces: Vec<BufferedPiece>,
    pub storefront: String,
    pub group: String,
}

impl Buffer {
    pub fn group_key(&self) -> String {
        group_key(&self.storefront, &self.group)
    }

    pub fn total_size(&self) -> u64 {
        self.pieces.iter().map(BufferedPiece::size).sum()
    }
}

/// Queue payload for buffer references. Carries only the identifier so the
/// message size does not grow with the buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferMessage {
    pub buffer: ContentId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregate {
    pub piece: PieceLink,
    pub buffer: ContentId,
    #[serde(default)]
    pub invocation: Option<String>,
    #[serde(default)]
    pub task: Option<String>,
    pub inserted_at: DateTime<Utc>,
    pub storefront: String,
    pub group: String,
    pub stat: AggregateStatus,
}

impl Aggregate {
    pub fn group_key(&self) -> String {
        group_key(&self.storefront, &self.group)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inclusion {
    pub aggregate: String,
    pub piece: String,
    pub inserted_at: DateTime<Utc>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    pub stat: InclusionStatus,
    #[serde(default)]
    pub failed_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    pub provider: String,
    pub deal_id: u64,
    pub expiration_epoch: i64,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deal {
    pub aggregate: String,
    pub status: DealStatus,
    #[serde(default)]
    pub contracts: Vec<Contract>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl Deal {
    pub fn pending(aggregate: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            aggregate: aggregate.into(),
            status: DealStatus::Pending,
            contracts: Vec::new(),
            updated_at: now,
            reason: None,
        }
    }
}
