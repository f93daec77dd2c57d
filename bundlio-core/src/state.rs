//! Status lifecycles for aggregates, inclusions and deals.
//!
//! Re-applying the current status is always accepted so that redelivered
//! messages stay harmless. Every other move must be listed in the edge table.
//! A rejected aggregate goes back to offered only when its pieces are offered
//! again from a retry buffer.

use crate::{BundlioError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregateStatus {
    Offered,
    Accepted,
    Rejected,
}

impl AggregateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateStatus::Offered => "OFFERED",
            AggregateStatus::Accepted => "ACCEPTED",
            AggregateStatus::Rejected => "REJECTED",
        }
    }

    pub fn is_decided(&self) -> bool {
        !matches!(self, AggregateStatus::Offered)
    }

    pub fn can_transition_to(&self, next: AggregateStatus) -> bool {
        *self == next
            || matches!(
                (self, next),
                (AggregateStatus::Offered, AggregateStatus::Accepted)
                    | (AggregateStatus::Offered, AggregateStatus::Rejected)
                    | (AggregateStatus::Rejected, AggregateStatus::Offered)
            )
    }

    pub fn transition_to(self, next: AggregateStatus) -> Result<AggregateStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(invalid("aggregate", self, next))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InclusionStatus {
    Pending,
    Success,
    Fail,
}

impl InclusionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InclusionStatus::Pending => "PENDING",
            InclusionStatus::Success => "SUCCESS",
            InclusionStatus::Fail => "FAIL",
        }
    }

    pub fn can_transition_to(&self, next: InclusionStatus) -> bool {
        *self == next || *self == InclusionStatus::Pending
    }

    pub fn transition_to(self, next: InclusionStatus) -> Result<InclusionStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(invalid("inclusion", self, next))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DealStatus {
    Pending,
    Signed,
    Approved,
    Rejected,
}

impl DealStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DealStatus::Pending => "PENDING",
            DealStatus::Signed => "SIGNED",
            DealStatus::Approved => "APPROVED",
            DealStatus::Rejected => "REJECTED",
        }
    }

    /// Deals still waiting on the oracle.
    pub fn is_open(&self) -> bool {
        matches!(self, DealStatus::Pending | DealStatus::Signed)
    }

    pub fn can_transition_to(&self, next: DealStatus) -> bool {
        *self == next
            || matches!(
                (self, next),
                (DealStatus::Pending, DealStatus::Signed)
                    | (DealStatus::Pending, DealStatus::Approved)
                    | (DealStatus::Pending, DealStatus::Rejected)
                    | (DealStatus::Signed, DealStatus::Approved)
            )
    }

    pub fn transition_to(self, next: DealStatus) -> Result<DealStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(invalid("deal", self, next))
        }
    }
}

impl FromStr for DealStatus {
    type Err = BundlioError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "PENDING" => Ok(DealStatus::Pending),
            "SIGNED" => Ok(DealStatus::Signed),
            "APPROVED" => Ok(DealStatus::Approved),
            "REJECTED" => Ok(DealStatus::Rejected),
            other => Err(BundlioError::Parse(format!("unknown deal status: {}", other))),
        }
    }
}

impl fmt::Display for AggregateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for InclusionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for DealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn invalid(entity: &'static str, from: impl fmt::Display, to: impl fmt::Display) -> BundlioError {
    BundlioError::InvalidTransition {
        entity,
        from: from.to_string(),
        to: to.to_string(),
    }
}
