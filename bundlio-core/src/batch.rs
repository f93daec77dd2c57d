use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailure {
    pub item_identifier: String,
    pub reason: String,
}

/// Items of a batch that failed and should be redelivered on their own. The
/// rest of the batch counts as acknowledged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialBatchFailure {
    pub batch_item_failures: Vec<BatchItemFailure>,
}

impl PartialBatchFailure {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item_identifier: impl Into<String>, reason: impl Into<String>) {
        self.batch_item_failures.push(BatchItemFailure {
            item_identifier: item_identifier.into(),
            reason: reason.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.batch_item_failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.batch_item_failures.len()
    }

    pub fn contains(&self, item_identifier: &str) -> bool {
        self.batch_item_failures
            .iter()
            .any(|failure| failure.item_identifier == item_identifier)
    }
}
