//! Oracle snapshots of real-world deal state.

use crate::{BundlioError, Contract, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaContract {
    pub provider: String,
    pub deal_id: u64,
    pub expiration_epoch: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Replica {
    pub piece_commitment: String,
    pub log2_size: u8,
    #[serde(default)]
    pub contracts: Vec<ReplicaContract>,
}

impl Replica {
    pub fn to_contracts(&self, source: &str) -> Vec<Contract> {
        self.contracts
            .iter()
            .map(|contract| Contract {
                provider: contract.provider.clone(),
                deal_id: contract.deal_id,
                expiration_epoch: contract.expiration_epoch,
                source: source.to_string(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub replicas: Vec<Replica>,
}

/// Decodes a snapshot document, zstd compressed or plain JSON.
pub fn decode_snapshot(bytes: &[u8]) -> Result<Snapshot> {
    let json = if bytes.starts_with(&ZSTD_MAGIC) {
        zstd::decode_all(bytes).map_err(|e| {
            BundlioError::Reconciliation(format!("failed to decompress snapshot: {}", e))
        })?
    } else {
        bytes.to_vec()
    };

    serde_json::from_slice(&json)
        .map_err(|e| BundlioError::Reconciliation(format!("failed to decode snapshot: {}", e)))
}

#[async_trait]
pub trait OracleSource: Send + Sync {
    /// Recorded as the `source` of every contract taken from this oracle.
    fn name(&self) -> &str;

    async fn fetch_snapshot(&self) -> Result<Snapshot>;
}

pub struct HttpOracle {
    client: reqwest::Client,
    url: String,
}

impl HttpOracle {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl OracleSource for HttpOracle {
    fn name(&self) -> &str {
        &self.url
    }

    async fn fetch_snapshot(&self) -> Result<Snapshot> {
        let response = self.client.get(&self.url).send().await.map_err(|e| {
            BundlioError::Reconciliation(format!("snapshot fetch failed: {}", e))
        })?;

        if !response.status().is_success() {
            return Err(BundlioError::Reconciliation(format!(
                "snapshot fetch returned status {}",
                response.status()
            )));
        }

        let body = response.bytes().await.map_err(|e| {
            BundlioError::Reconciliation(format!("snapshot read failed: {}", e))
        })?;

        let snapshot = decode_snapshot(&body)?;
        tracing::debug!(
            "fetched oracle snapshot url={} bytes={} replicas={}",
            self.url,
            body.len(),
            snapshot.replicas.len()
        );
        Ok(snapshot)
    }
}
