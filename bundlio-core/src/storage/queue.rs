use crate::{BundlioError, Result, compute_hash};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// How long a taken message may stay unacknowledged before it is handed out
/// again.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

/// Payloads that can travel through a [`Queue`].
pub trait QueueMessage: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> QueueMessage for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub group_key: Option<String>,
}

impl QueueOptions {
    pub fn grouped(group_key: impl Into<String>) -> Self {
        Self {
            group_key: Some(group_key.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery<T> {
    pub payload: T,
    #[serde(default)]
    pub group_key: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    /// Set by the queue that handed the message out; identifies it on ack and nack.
    #[serde(skip)]
    pub handle: Option<String>,
}

/// At-least-once delivery, ordered and deduplicated within a group key.
///
/// A taken message stays in flight until it is acked or nacked. Messages left
/// in flight past the visibility timeout count as failed and are redelivered.
#[async_trait]
pub trait Queue<T: QueueMessage>: Send + Sync {
    async fn add(&self, message: &T, options: QueueOptions) -> Result<()>;

    /// Takes up to `max` pending messages that share the group key of the
    /// oldest pending message, in order.
    async fn take(&self, max: usize) -> Result<Vec<Delivery<T>>>;

    /// Confirms that deliveries were processed.
    async fn ack(&self, deliveries: &[Delivery<T>]) -> Result<()>;

    /// Hands failed deliveries back. They return to the front of their group
    /// unless they have exhausted their attempts, in which case they move to
    /// the dead-letter list. Returns the number of dead-lettered messages.
    async fn nack(&self, deliveries: Vec<Delivery<T>>) -> Result<usize>;
}

fn dedup_id<T: Serialize>(group_key: &Option<String>, message: &T) -> Result<String> {
    let payload = serde_json::to_vec(message)?;
    Ok(format!(
        "{}|{}",
        group_key.as_deref().unwrap_or_default(),
        compute_hash(&payload)
    ))
}

struct PendingMessage<T> {
    dedup_id: String,
    delivery: Delivery<T>,
}

struct InFlight<T> {
    message: PendingMessage<T>,
    taken_at: Instant,
}

struct MemoryQueueState<T> {
    pending: VecDeque<PendingMessage<T>>,
    in_flight: HashMap<u64, InFlight<T>>,
    next_handle: u64,
    dead_letters: Vec<Delivery<T>>,
}

impl<T> MemoryQueueState<T> {
    /// Puts a failed message back in front of its group, or dead-letters it.
    fn requeue(&mut self, mut message: PendingMessage<T>, max_attempts: u32) -> bool {
        message.delivery.attempts += 1;
        message.delivery.handle = None;
        if message.delivery.attempts >= max_attempts {
            tracing::warn!(
                "message exhausted {} delivery attempts, moving to dead letters",
                message.delivery.attempts
            );
            self.dead_letters.push(message.delivery);
            return true;
        }
        self.pending.push_front(message);
        false
    }
}

pub struct MemoryQueue<T> {
    state: Mutex<MemoryQueueState<T>>,
    max_attempts: u32,
    visibility_timeout: Duration,
}

impl<T: QueueMessage + Clone> MemoryQueue<T> {
    pub fn new() -> Self {
        Self::with_max_attempts(DEFAULT_MAX_ATTEMPTS)
    }

    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            state: Mutex::new(MemoryQueueState {
                pending: VecDeque::new(),
                in_flight: HashMap::new(),
                next_handle: 0,
                dead_letters: Vec::new(),
            }),
            max_attempts: max_attempts.max(1),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.pending.is_empty()
    }

    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    /// Pending payloads in delivery order, without taking them.
    pub async fn peek_all(&self) -> Vec<Delivery<T>> {
        self.state
            .lock()
            .await
            .pending
            .iter()
            .map(|message| message.delivery.clone())
            .collect()
    }

    pub async fn dead_letters(&self) -> Vec<Delivery<T>> {
        self.state.lock().await.dead_letters.clone()
    }

    fn reclaim_expired(&self, state: &mut MemoryQueueState<T>) {
        let now = Instant::now();
        let mut expired: Vec<u64> = state
            .in_flight
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.taken_at) >= self.visibility_timeout)
            .map(|(handle, _)| *handle)
            .collect();
        if expired.is_empty() {
            return;
        }
        expired.sort_unstable();

        tracing::warn!(
            "reclaiming {} unacknowledged messages past the visibility timeout",
            expired.len()
        );
        for handle in expired.into_iter().rev() {
            if let Some(entry) = state.in_flight.remove(&handle) {
                state.requeue(entry.message, self.max_attempts);
            }
        }
    }
}

impl<T: QueueMessage + Clone> Default for MemoryQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: QueueMessage + Clone> Queue<T> for MemoryQueue<T> {
    async fn add(&self, message: &T, options: QueueOptions) -> Result<()> {
        let dedup_id = dedup_id(&options.group_key, message)?;
        let mut state = self.state.lock().await;
        if state
            .pending
            .iter()
            .any(|pending| pending.dedup_id == dedup_id)
        {
            tracing::debug!("dropping duplicate pending message dedup_id={}", dedup_id);
            return Ok(());
        }

        state.pending.push_back(PendingMessage {
            dedup_id,
            delivery: Delivery {
                payload: message.clone(),
                group_key: options.group_key,
                attempts: 0,
                handle: None,
            },
        });
        Ok(())
    }

    async fn take(&self, max: usize) -> Result<Vec<Delivery<T>>> {
        let mut state = self.state.lock().await;
        self.reclaim_expired(&mut state);

        let Some(front) = state.pending.front() else {
            return Ok(Vec::new());
        };
        let group_key = front.delivery.group_key.clone();

        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(state.pending.len());
        for message in std::mem::take(&mut state.pending) {
            if taken.len() < max && message.delivery.group_key == group_key {
                taken.push(message);
            } else {
                kept.push_back(message);
            }
        }
        state.pending = kept;

        let taken_at = Instant::now();
        let mut deliveries = Vec::with_capacity(taken.len());
        for mut message in taken {
            let handle = state.next_handle;
            state.next_handle += 1;
            message.delivery.handle = Some(handle.to_string());
            deliveries.push(message.delivery.clone());
            state.in_flight.insert(handle, InFlight { message, taken_at });
        }

        Ok(deliveries)
    }

    async fn ack(&self, deliveries: &[Delivery<T>]) -> Result<()> {
        let mut state = self.state.lock().await;
        for delivery in deliveries {
            if let Some(handle) = memory_handle(delivery)? {
                state.in_flight.remove(&handle);
            }
        }
        Ok(())
    }

    async fn nack(&self, deliveries: Vec<Delivery<T>>) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut dead = 0usize;

        for delivery in deliveries.into_iter().rev() {
            let message = match memory_handle(&delivery)? {
                // Already reclaimed or acked.
                Some(handle) => match state.in_flight.remove(&handle) {
                    Some(entry) => PendingMessage {
                        dedup_id: entry.message.dedup_id,
                        delivery,
                    },
                    None => continue,
                },
                None => PendingMessage {
                    dedup_id: dedup_id(&delivery.group_key, &delivery.payload)?,
                    delivery,
                },
            };
            if state.requeue(message, self.max_attempts) {
                dead += 1;
            }
        }

        Ok(dead)
    }
}

fn memory_handle<T>(delivery: &Delivery<T>) -> Result<Option<u64>> {
    delivery
        .handle
        .as_deref()
        .map(|handle| {
            handle.parse::<u64>().map_err(|_| {
                BundlioError::QueueSend(format!("unknown delivery handle: {}", handle))
            })
        })
        .transpose()
}

/// Moves up to `count` entries from the front of a group list into the
/// in-flight set and releases their pending dedup ids. An empty group is
/// dropped from the group index in the same step, so a concurrent add cannot
/// be orphaned.
const TAKE_SCRIPT: &str = r"
local items = redis.call('LRANGE', KEYS[1], 0, tonumber(ARGV[1]) - 1)
if #items == 0 then
  redis.call('SREM', KEYS[2], ARGV[3])
  return items
end
redis.call('LTRIM', KEYS[1], #items, -1)
for _, item in ipairs(items) do
  redis.call('ZADD', KEYS[3], ARGV[2], item)
  redis.call('SREM', KEYS[4], cjson.decode(item)['id'])
end
return items
";

/// Returns an in-flight entry to the front of its group, or appends it to the
/// dead-letter list. Does nothing when the entry is no longer in flight.
const REQUEUE_SCRIPT: &str = r"
if ARGV[1] ~= '' and redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
if ARGV[5] == '1' then
  redis.call('RPUSH', KEYS[2], ARGV[2])
  return 1
end
redis.call('LPUSH', KEYS[2], ARGV[2])
redis.call('SADD', KEYS[3], ARGV[3])
redis.call('SADD', KEYS[4], ARGV[4])
return 1
";

/// Stored form of a Redis queue entry.
#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    id: String,
    queued_at: DateTime<Utc>,
    delivery: Delivery<T>,
}

/// Queue backed by one Redis list per group key and a sorted set of in-flight
/// entries scored by the time they were taken.
pub struct RedisQueue<T> {
    conn: MultiplexedConnection,
    prefix: String,
    max_attempts: u32,
    visibility_timeout: Duration,
    take_script: redis::Script,
    requeue_script: redis::Script,
    _message: std::marker::PhantomData<fn() -> T>,
}

impl<T> RedisQueue<T> {
    pub async fn new(url: &str, namespace: &str, name: &str, max_attempts: u32) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|error| {
            BundlioError::Config(format!("redis queue connection config error: {}", error))
        })?;

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(queue_error)?;

        Ok(Self {
            conn,
            prefix: format!("{}:queue:{}", namespace, name),
            max_attempts: max_attempts.max(1),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            take_script: redis::Script::new(TAKE_SCRIPT),
            requeue_script: redis::Script::new(REQUEUE_SCRIPT),
            _message: std::marker::PhantomData,
        })
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    fn groups_key(&self) -> String {
        format!("{}:groups", self.prefix)
    }

    fn pending_key(&self) -> String {
        format!("{}:pending", self.prefix)
    }

    fn processing_key(&self) -> String {
        format!("{}:processing", self.prefix)
    }

    fn dead_letter_key(&self) -> String {
        format!("{}:dead", self.prefix)
    }

    fn group_list_key(&self, group_key: &Option<String>) -> String {
        format!("{}:g:{}", self.prefix, group_key.as_deref().unwrap_or_default())
    }
}

impl<T: QueueMessage> RedisQueue<T> {
    /// Runs the requeue script for one entry. Returns whether the entry was
    /// dead-lettered.
    async fn requeue(
        &self,
        conn: &mut MultiplexedConnection,
        member: Option<&str>,
        mut envelope: Envelope<T>,
    ) -> Result<bool> {
        envelope.delivery.attempts += 1;
        let dead = envelope.delivery.attempts >= self.max_attempts;
        let target = if dead {
            self.dead_letter_key()
        } else {
            self.group_list_key(&envelope.delivery.group_key)
        };
        let group = envelope
            .delivery
            .group_key
            .clone()
            .unwrap_or_default();

        let moved: i64 = self
            .requeue_script
            .key(self.processing_key())
            .key(target)
            .key(self.groups_key())
            .key(self.pending_key())
            .arg(member.unwrap_or_default())
            .arg(serde_json::to_string(&envelope)?)
            .arg(group)
            .arg(&envelope.id)
            .arg(if dead { "1" } else { "0" })
            .invoke_async(conn)
            .await
            .map_err(queue_error)?;

        if moved == 1 && dead {
            tracing::warn!(
                "message exhausted {} delivery attempts, moving to dead letters",
                envelope.delivery.attempts
            );
        }
        Ok(moved == 1 && dead)
    }

    async fn reclaim_expired(&self, conn: &mut MultiplexedConnection) -> Result<()> {
        let timeout_ms = i64::try_from(self.visibility_timeout.as_millis()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp_millis().saturating_sub(timeout_ms);
        let stale: Vec<String> = conn
            .zrangebyscore(self.processing_key(), "-inf", cutoff)
            .await
            .map_err(queue_error)?;
        if stale.is_empty() {
            return Ok(());
        }

        tracing::warn!(
            "reclaiming {} unacknowledged messages past the visibility timeout",
            stale.len()
        );
        for member in stale.iter().rev() {
            let envelope: Envelope<T> = serde_json::from_str(member)?;
            self.requeue(conn, Some(member.as_str()), envelope).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<T: QueueMessage> Queue<T> for RedisQueue<T> {
    async fn add(&self, message: &T, options: QueueOptions) -> Result<()> {
        let dedup_id = dedup_id(&options.group_key, message)?;
        let mut conn = self.conn.clone();

        let added: i64 = conn
            .sadd(self.pending_key(), &dedup_id)
            .await
            .map_err(queue_error)?;
        if added == 0 {
            tracing::debug!("dropping duplicate pending message dedup_id={}", dedup_id);
            return Ok(());
        }

        let envelope = serde_json::to_string(&Envelope {
            id: dedup_id,
            queued_at: Utc::now(),
            delivery: Delivery {
                payload: message,
                group_key: options.group_key.clone(),
                attempts: 0,
                handle: None,
            },
        })?;

        redis::pipe()
            .atomic()
            .rpush(self.group_list_key(&options.group_key), envelope)
            .ignore()
            .sadd(
                self.groups_key(),
                options.group_key.as_deref().unwrap_or_default(),
            )
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(queue_error)?;
        Ok(())
    }

    async fn take(&self, max: usize) -> Result<Vec<Delivery<T>>> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        self.reclaim_expired(&mut conn).await?;

        let mut groups: Vec<String> = conn
            .smembers(self.groups_key())
            .await
            .map_err(queue_error)?;
        groups.sort();

        for group in groups {
            let group_key = if group.is_empty() {
                None
            } else {
                Some(group.clone())
            };
            let raw: Vec<String> = self
                .take_script
                .key(self.group_list_key(&group_key))
                .key(self.groups_key())
                .key(self.processing_key())
                .key(self.pending_key())
                .arg(max)
                .arg(Utc::now().timestamp_millis())
                .arg(&group)
                .invoke_async(&mut conn)
                .await
                .map_err(queue_error)?;
            if raw.is_empty() {
                continue;
            }

            return raw
                .into_iter()
                .map(|member| -> Result<Delivery<T>> {
                    let envelope: Envelope<T> = serde_json::from_str(&member)?;
                    let mut delivery = envelope.delivery;
                    delivery.handle = Some(member);
                    Ok(delivery)
                })
                .collect();
        }

        Ok(Vec::new())
    }

    async fn ack(&self, deliveries: &[Delivery<T>]) -> Result<()> {
        let members: Vec<&str> = deliveries
            .iter()
            .filter_map(|delivery| delivery.handle.as_deref())
            .collect();
        if members.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        conn.zrem::<_, _, ()>(self.processing_key(), members)
            .await
            .map_err(queue_error)
    }

    async fn nack(&self, deliveries: Vec<Delivery<T>>) -> Result<usize> {
        let mut conn = self.conn.clone();
        let mut dead = 0usize;

        for delivery in deliveries.into_iter().rev() {
            let (member, envelope) = match delivery.handle.clone() {
                Some(member) => {
                    let mut envelope: Envelope<T> = serde_json::from_str(&member)?;
                    envelope.delivery.attempts = delivery.attempts;
                    (Some(member), envelope)
                }
                None => (
                    None,
                    Envelope {
                        id: dedup_id(&delivery.group_key, &delivery.payload)?,
                        queued_at: Utc::now(),
                        delivery,
                    },
                ),
            };
            if self.requeue(&mut conn, member.as_deref(), envelope).await? {
                dead += 1;
            }
        }

        Ok(dead)
    }
}

fn queue_error(error: redis::RedisError) -> BundlioError {
    BundlioError::QueueSend(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_take_returns_one_group_in_order() {
        let queue: MemoryQueue<String> = MemoryQueue::new();
        queue.add(&"a1".to_string(), QueueOptions::grouped("a")).await.unwrap();
        queue.add(&"b1".to_string(), QueueOptions::grouped("b")).await.unwrap();
        queue.add(&"a2".to_string(), QueueOptions::grouped("a")).await.unwrap();

        let batch = queue.take(10).await.unwrap();
        let payloads: Vec<&str> = batch.iter().map(|d| d.payload.as_str()).collect();
        assert_eq!(payloads, vec!["a1", "a2"]);

        let batch = queue.take(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, "b1");
        assert!(queue.take(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_duplicates_are_dropped_per_group() {
        let queue: MemoryQueue<String> = MemoryQueue::new();
        queue.add(&"m".to_string(), QueueOptions::grouped("a")).await.unwrap();
        queue.add(&"m".to_string(), QueueOptions::grouped("a")).await.unwrap();
        queue.add(&"m".to_string(), QueueOptions::grouped("b")).await.unwrap();
        assert_eq!(queue.len().await, 2);

        // Once delivered, the same payload may be queued again.
        queue.take(1).await.unwrap();
        queue.add(&"m".to_string(), QueueOptions::grouped("a")).await.unwrap();
        assert_eq!(queue.len().await, 2);
    }

    #[tokio::test]
    async fn test_nack_redelivers_then_dead_letters() {
        let queue: MemoryQueue<String> = MemoryQueue::with_max_attempts(2);
        queue.add(&"first".to_string(), QueueOptions::grouped("a")).await.unwrap();
        queue.add(&"second".to_string(), QueueOptions::grouped("a")).await.unwrap();

        let batch = queue.take(10).await.unwrap();
        assert_eq!(queue.nack(batch).await.unwrap(), 0);

        let batch = queue.take(10).await.unwrap();
        let payloads: Vec<&str> = batch.iter().map(|d| d.payload.as_str()).collect();
        assert_eq!(payloads, vec!["first", "second"]);
        assert!(batch.iter().all(|d| d.attempts == 1));

        assert_eq!(queue.nack(batch).await.unwrap(), 2);
        assert!(queue.is_empty().await);
        assert_eq!(queue.dead_letters().await.len(), 2);
    }

    #[tokio::test]
    async fn test_acked_messages_are_not_redelivered() {
        let queue: MemoryQueue<String> =
            MemoryQueue::new().with_visibility_timeout(Duration::ZERO);
        queue.add(&"done".to_string(), QueueOptions::grouped("a")).await.unwrap();

        let batch = queue.take(10).await.unwrap();
        assert_eq!(queue.in_flight().await, 1);
        queue.ack(&batch).await.unwrap();

        assert_eq!(queue.in_flight().await, 0);
        assert!(queue.take(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unacked_messages_are_redelivered_after_timeout() {
        let queue: MemoryQueue<String> = MemoryQueue::with_max_attempts(2)
            .with_visibility_timeout(Duration::ZERO);
        queue.add(&"first".to_string(), QueueOptions::grouped("a")).await.unwrap();
        queue.add(&"second".to_string(), QueueOptions::grouped("a")).await.unwrap();

        // The worker holding these goes away without ack or nack.
        let lost = queue.take(10).await.unwrap();
        assert_eq!(lost.len(), 2);

        let batch = queue.take(10).await.unwrap();
        let payloads: Vec<&str> = batch.iter().map(|d| d.payload.as_str()).collect();
        assert_eq!(payloads, vec!["first", "second"]);
        assert!(batch.iter().all(|d| d.attempts == 1));

        // A late nack from the first worker changes nothing.
        assert_eq!(queue.nack(lost).await.unwrap(), 0);
        assert!(queue.is_empty().await);

        assert!(queue.take(10).await.unwrap().is_empty());
        assert_eq!(queue.dead_letters().await.len(), 2);
    }

    #[tokio::test]
    async fn test_in_flight_messages_wait_for_timeout() {
        let queue: MemoryQueue<String> = MemoryQueue::new();
        queue.add(&"slow".to_string(), QueueOptions::grouped("a")).await.unwrap();

        let batch = queue.take(10).await.unwrap();
        assert!(queue.take(10).await.unwrap().is_empty());
        assert_eq!(queue.in_flight().await, 1);

        assert_eq!(queue.nack(batch).await.unwrap(), 0);
        assert_eq!(queue.in_flight().await, 0);
        assert_eq!(queue.len().await, 1);
    }
}
