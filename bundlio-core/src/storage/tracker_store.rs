use crate::{BundlioError, Contract, Deal, DealStatus, Result};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tokio::sync::Mutex;

/// Contracts known for each piece commitment.
#[async_trait]
pub trait ContractStore: Send + Sync {
    /// Applies all entries in one atomic write. Contracts accumulate per piece;
    /// a contract already known by `(provider, deal_id)` is not added twice.
    /// Returns the number of newly stored contracts.
    async fn append_contracts(&self, entries: &[(String, Vec<Contract>)]) -> Result<usize>;

    /// All known contracts for the piece, oldest first. Empty when unknown.
    async fn contracts(&self, piece: &str) -> Result<Vec<Contract>>;
}

/// Deals keyed by aggregate commitment.
#[async_trait]
pub trait DealStore: Send + Sync {
    async fn get_deal(&self, aggregate: &str) -> Result<Option<Deal>>;

    async fn put_deal(&self, deal: &Deal) -> Result<()>;

    async fn deals_with_status(&self, statuses: &[DealStatus]) -> Result<Vec<Deal>>;
}

#[derive(Default)]
pub struct MemoryTrackerStore {
    contracts: Mutex<HashMap<String, Vec<Contract>>>,
    deals: Mutex<BTreeMap<String, Deal>>,
}

impl MemoryTrackerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContractStore for MemoryTrackerStore {
    async fn append_contracts(&self, entries: &[(String, Vec<Contract>)]) -> Result<usize> {
        let mut guard = self.contracts.lock().await;
        let mut added = 0usize;
        for (piece, contracts) in entries {
            let known = guard.entry(piece.clone()).or_default();
            for contract in contracts {
                if known
                    .iter()
                    .any(|c| c.provider == contract.provider && c.deal_id == contract.deal_id)
                {
                    continue;
                }
                known.push(contract.clone());
                added += 1;
            }
        }
        Ok(added)
    }

    async fn contracts(&self, piece: &str) -> Result<Vec<Contract>> {
        Ok(self
            .contracts
            .lock()
            .await
            .get(piece)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl DealStore for MemoryTrackerStore {
    async fn get_deal(&self, aggregate: &str) -> Result<Option<Deal>> {
        Ok(self.deals.lock().await.get(aggregate).cloned())
    }

    async fn put_deal(&self, deal: &Deal) -> Result<()> {
        self.deals
            .lock()
            .await
            .insert(deal.aggregate.clone(), deal.clone());
        Ok(())
    }

    async fn deals_with_status(&self, statuses: &[DealStatus]) -> Result<Vec<Deal>> {
        Ok(self
            .deals
            .lock()
            .await
            .values()
            .filter(|deal| statuses.contains(&deal.status))
            .cloned()
            .collect())
    }
}

/// Both halves of the deal tracker's persistence.
pub trait TrackerStore: ContractStore + DealStore {}

impl<T> TrackerStore for T where T: ContractStore + DealStore {}

/// Tracker persistence in a local SQLite database.
pub struct SqliteTrackerStore {
    db_path: PathBuf,
    write_lock: Mutex<()>,
}

impl SqliteTrackerStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Self {
            db_path,
            write_lock: Mutex::new(()),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn get_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS contracts (
                pk INTEGER PRIMARY KEY AUTOINCREMENT,
                piece TEXT NOT NULL,
                provider TEXT NOT NULL,
                deal_id INTEGER NOT NULL,
                expiration_epoch INTEGER NOT NULL,
                source TEXT NOT NULL,
                UNIQUE (piece, provider, deal_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_contracts_piece ON contracts(piece)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS deals (
                aggregate TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_deals_status ON deals(status)",
            [],
        )?;

        Ok(())
    }
}

#[async_trait]
impl ContractStore for SqliteTrackerStore {
    async fn append_contracts(&self, entries: &[(String, Vec<Contract>)]) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let mut added = 0usize;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO contracts (
                    piece, provider, deal_id, expiration_epoch, source
                ) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (piece, contracts) in entries {
                for contract in contracts {
                    let deal_id = i64::try_from(contract.deal_id).map_err(|_| {
                        BundlioError::InvalidRequest(format!(
                            "deal id out of range: {}",
                            contract.deal_id
                        ))
                    })?;
                    added += stmt.execute(params![
                        piece,
                        contract.provider,
                        deal_id,
                        contract.expiration_epoch,
                        contract.source,
                    ])?;
                }
            }
        }
        tx.commit()?;

        Ok(added)
    }

    async fn contracts(&self, piece: &str) -> Result<Vec<Contract>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT provider, deal_id, expiration_epoch, source
             FROM contracts WHERE piece = ?1 ORDER BY pk",
        )?;

        let rows = stmt.query_map([piece], |row| {
            let deal_id: i64 = row.get(1)?;
            Ok(Contract {
                provider: row.get(0)?,
                deal_id: deal_id as u64,
                expiration_epoch: row.get(2)?,
                source: row.get(3)?,
            })
        })?;

        let mut contracts = Vec::new();
        for row in rows {
            contracts.push(row?);
        }
        Ok(contracts)
    }
}

#[async_trait]
impl DealStore for SqliteTrackerStore {
    async fn get_deal(&self, aggregate: &str) -> Result<Option<Deal>> {
        let conn = self.get_conn()?;
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM deals WHERE aggregate = ?1",
                [aggregate],
                |row| row.get(0),
            )
            .optional()?;

        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn put_deal(&self, deal: &Deal) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let conn = self.get_conn()?;
        let payload = serde_json::to_string(deal)?;

        conn.execute(
            "INSERT OR REPLACE INTO deals (aggregate, status, payload, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                deal.aggregate,
                deal.status.as_str(),
                payload,
                deal.updated_at.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    async fn deals_with_status(&self, statuses: &[DealStatus]) -> Result<Vec<Deal>> {
        let conn = self.get_conn()?;
        let mut stmt =
            conn.prepare("SELECT payload FROM deals WHERE status = ?1 ORDER BY aggregate")?;

        let mut deals = Vec::new();
        for status in statuses {
            let rows = stmt.query_map([status.as_str()], |row| row.get::<_, String>(0))?;
            for row in rows {
                deals.push(serde_json::from_str::<Deal>(&row?)?);
            }
        }
        Ok(deals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn contract(provider: &str, deal_id: u64) -> Contract {
        Contract {
            provider: provider.to_string(),
            deal_id,
            expiration_epoch: 4_000_000,
            source: "oracle".to_string(),
        }
    }

    async fn exercise_contracts(store: &dyn ContractStore) {
        assert!(store.contracts("piece-a").await.unwrap().is_empty());

        let added = store
            .append_contracts(&[("piece-a".to_string(), vec![contract("f01", 1)])])
            .await
            .unwrap();
        assert_eq!(added, 1);

        // A redeal after failure accumulates next to the first contract.
        let added = store
            .append_contracts(&[(
                "piece-a".to_string(),
                vec![contract("f01", 1), contract("f02", 7)],
            )])
            .await
            .unwrap();
        assert_eq!(added, 1);

        let contracts = store.contracts("piece-a").await.unwrap();
        assert_eq!(contracts, vec![contract("f01", 1), contract("f02", 7)]);
    }

    async fn exercise_deals(store: &dyn DealStore) {
        let now = Utc::now();
        store.put_deal(&Deal::pending("agg-1", now)).await.unwrap();
        store.put_deal(&Deal::pending("agg-2", now)).await.unwrap();

        let mut signed = Deal::pending("agg-2", now);
        signed.status = DealStatus::Signed;
        store.put_deal(&signed).await.unwrap();

        assert_eq!(
            store.get_deal("agg-2").await.unwrap().unwrap().status,
            DealStatus::Signed
        );
        assert!(store.get_deal("agg-3").await.unwrap().is_none());

        let open = store
            .deals_with_status(&[DealStatus::Pending, DealStatus::Signed])
            .await
            .unwrap();
        let aggregates: Vec<&str> = open.iter().map(|d| d.aggregate.as_str()).collect();
        assert_eq!(aggregates, vec!["agg-1", "agg-2"]);
        assert!(
            store
                .deals_with_status(&[DealStatus::Approved])
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_memory_tracker_store() {
        let store = MemoryTrackerStore::new();
        exercise_contracts(&store).await;
        exercise_deals(&store).await;
    }

    #[tokio::test]
    async fn test_sqlite_tracker_store() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = SqliteTrackerStore::new(temp_dir.path().join("tracker.db")).unwrap();
        exercise_contracts(&store).await;
        exercise_deals(&store).await;

        // Data survives reopening the database.
        let reopened = SqliteTrackerStore::new(temp_dir.path().join("tracker.db")).unwrap();
        assert_eq!(reopened.contracts("piece-a").await.unwrap().len(), 2);
    }
}
