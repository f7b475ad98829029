//! Work dispatch queue: Redis Streams in production, in-memory for tests.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::MultiplexedConnection, streams::*, AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use suit_common::{SuitError, SuitResult};

const STREAM_KEY: &str = "analysis:jobs";
const CONSUMER_GROUP: &str = "analysis-workers";

/// Queue entry pointing at a persisted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTicket {
    pub job_id: Uuid,
    /// Attempt number the ticket was issued for
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl JobTicket {
    pub fn new(job_id: Uuid, attempt: u32) -> Self {
        Self {
            job_id,
            attempt,
            enqueued_at: Utc::now(),
        }
    }
}

/// A ticket handed to one consumer, acknowledged once processed.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub ticket: JobTicket,
    /// Broker-specific receipt used for `ack`
    pub receipt: String,
}

/// Enqueue/dequeue/ack interface of the job broker.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, ticket: &JobTicket) -> SuitResult<()>;

    /// Wait up to `wait` for the next ticket.
    async fn dequeue(&self, consumer: &str, wait: Duration) -> SuitResult<Option<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> SuitResult<()>;
}

/// Redis Streams job queue with a consumer group.
pub struct RedisJobQueue {
    conn: MultiplexedConnection,
}

impl RedisJobQueue {
    /// Connect to Redis and initialize the stream.
    pub async fn connect(redis_url: &str) -> SuitResult<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| SuitError::QueueError(format!("Redis connection failed: {}", e)))?;

        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| SuitError::QueueError(format!("Redis connection failed: {}", e)))?;

        // Create consumer group if it doesn't exist
        let created: Result<(), _> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(STREAM_KEY)
            .arg(CONSUMER_GROUP)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        if let Err(e) = created {
            debug!(error = %e, "Consumer group already present");
        }

        Ok(Self { conn })
    }

    /// Number of entries in the stream.
    pub async fn queue_depth(&self) -> SuitResult<u64> {
        let mut conn = self.conn.clone();
        let info: StreamInfoStreamReply = conn
            .xinfo_stream(STREAM_KEY)
            .await
            .map_err(|e| SuitError::QueueError(format!("XINFO failed: {}", e)))?;

        Ok(info.length as u64)
    }
}

#[async_trait]
impl WorkQueue for RedisJobQueue {
    async fn enqueue(&self, ticket: &JobTicket) -> SuitResult<()> {
        let data = serde_json::to_string(ticket)?;
        let mut conn = self.conn.clone();

        let entry_id: String = redis::cmd("XADD")
            .arg(STREAM_KEY)
            .arg("*")
            .arg("job_id")
            .arg(ticket.job_id.to_string())
            .arg("data")
            .arg(&data)
            .query_async(&mut conn)
            .await
            .map_err(|e| SuitError::QueueError(format!("Enqueue failed: {}", e)))?;

        debug!(job_id = %ticket.job_id, entry_id = %entry_id, "Enqueued job");
        Ok(())
    }

    async fn dequeue(&self, consumer: &str, wait: Duration) -> SuitResult<Option<Delivery>> {
        let opts = StreamReadOptions::default()
            .group(CONSUMER_GROUP, consumer)
            .count(1)
            .block(wait.as_millis() as usize);

        let mut conn = self.conn.clone();
        let result: StreamReadReply = conn
            .xread_options(&[STREAM_KEY], &[">"], &opts)
            .await
            .map_err(|e| SuitError::QueueError(format!("Read failed: {}", e)))?;

        for stream_key in result.keys {
            for entry in stream_key.ids {
                match decode_entry(&entry) {
                    Ok(ticket) => {
                        return Ok(Some(Delivery {
                            ticket,
                            receipt: entry.id,
                        }))
                    }
                    Err(reason) => {
                        // Nobody can run it, so take it off the pending list
                        warn!(entry_id = %entry.id, reason = %reason, "Dropping unreadable queue entry");
                        self.ack_entry(&entry.id).await?;
                    }
                }
            }
        }

        Ok(None)
    }

    async fn ack(&self, delivery: &Delivery) -> SuitResult<()> {
        self.ack_entry(&delivery.receipt).await
    }
}

impl RedisJobQueue {
    async fn ack_entry(&self, entry_id: &str) -> SuitResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(STREAM_KEY, CONSUMER_GROUP, &[entry_id])
            .await
            .map_err(|e| SuitError::QueueError(format!("Ack failed: {}", e)))?;
        Ok(())
    }
}

/// Parse the ticket carried by a stream entry.
fn decode_entry(entry: &StreamId) -> Result<JobTicket, String> {
    let data = entry
        .map
        .get("data")
        .ok_or_else(|| "entry has no payload".to_string())?;
    let bytes: Vec<u8> = redis::from_redis_value(data).map_err(|e| e.to_string())?;
    serde_json::from_slice(&bytes).map_err(|e| e.to_string())
}

#[derive(Debug, Default)]
struct MemoryQueueState {
    ready: VecDeque<JobTicket>,
    in_flight: HashMap<String, JobTicket>,
    next_receipt: u64,
}

/// In-memory queue for tests and single-process runs.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryQueueState>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tickets waiting to be dequeued.
    pub async fn len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Tickets delivered but not yet acknowledged.
    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, ticket: &JobTicket) -> SuitResult<()> {
        self.state.lock().await.ready.push_back(ticket.clone());
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, _consumer: &str, wait: Duration) -> SuitResult<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(ticket) = state.ready.pop_front() {
                    state.next_receipt += 1;
                    let receipt = state.next_receipt.to_string();
                    state.in_flight.insert(receipt.clone(), ticket.clone());
                    return Ok(Some(Delivery { ticket, receipt }));
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> SuitResult<()> {
        self.state.lock().await.in_flight.remove(&delivery.receipt);
        Ok(())
    }
}
