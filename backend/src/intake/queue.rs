use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

use crate::config::RedisSettings;
use crate::error::{PipelineError, PipelineResult};

/// One message handed to a worker, to be acked or nacked exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: u64,
    pub payload: String,
}

/// Durable at-least-once work queue.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn publish(&self, payload: &str) -> PipelineResult<()>;

    /// Waits up to `wait` for the next message.
    async fn receive(&self, wait: Duration) -> PipelineResult<Option<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> PipelineResult<()>;

    /// `requeue = false` moves the message to the dead-letter list.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> PipelineResult<()>;

    /// Puts deliveries left unacked by a previous run back on the queue.
    /// Returns how many were moved.
    async fn recover_in_flight(&self) -> PipelineResult<usize>;
}

fn queue_error(e: redis::RedisError) -> PipelineError {
    PipelineError::Queue(e.to_string())
}

/// Reliable list queue: `BRPOPLPUSH` moves each message into a processing
/// list until it is acked.
pub struct RedisWorkQueue {
    queue_key: String,
    processing_key: String,
    dead_letter_key: String,
    commands: MultiplexedConnection,
    // Blocking pops get their own connection so they cannot stall other commands.
    blocking: Mutex<MultiplexedConnection>,
    next_tag: AtomicU64,
}

impl RedisWorkQueue {
    pub async fn connect(settings: &RedisSettings, queue_name: &str) -> PipelineResult<Self> {
        let client = redis::Client::open(settings.url.as_str())
            .map_err(|e| PipelineError::Queue(format!("Failed to create Redis client: {}", e)))?;
        let commands = client.get_multiplexed_async_connection().await.map_err(queue_error)?;
        let blocking = client.get_multiplexed_async_connection().await.map_err(queue_error)?;

        info!("Work queue ready on {}", queue_name);
        Ok(Self {
            queue_key: queue_name.to_string(),
            processing_key: format!("{}:processing", queue_name),
            dead_letter_key: format!("{}:dead", queue_name),
            commands,
            blocking: Mutex::new(blocking),
            next_tag: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn publish(&self, payload: &str) -> PipelineResult<()> {
        let mut conn = self.commands.clone();
        redis::cmd("LPUSH")
            .arg(&self.queue_key)
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(queue_error)
    }

    async fn receive(&self, wait: Duration) -> PipelineResult<Option<Delivery>> {
        let mut conn = self.blocking.lock().await;
        let payload: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.queue_key)
            .arg(&self.processing_key)
            .arg(wait.as_secs().max(1))
            .query_async(&mut *conn)
            .await
            .map_err(queue_error)?;

        Ok(payload.map(|payload| Delivery {
            tag: self.next_tag.fetch_add(1, Ordering::Relaxed),
            payload,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> PipelineResult<()> {
        let mut conn = self.commands.clone();
        redis::cmd("LREM")
            .arg(&self.processing_key)
            .arg(1)
            .arg(&delivery.payload)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(queue_error)
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> PipelineResult<()> {
        let mut conn = self.commands.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LREM")
            .arg(&self.processing_key)
            .arg(1)
            .arg(&delivery.payload)
            .ignore();
        if requeue {
            // Right end is the next one popped.
            pipe.cmd("RPUSH").arg(&self.queue_key).arg(&delivery.payload).ignore();
        } else {
            pipe.cmd("LPUSH").arg(&self.dead_letter_key).arg(&delivery.payload).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await.map_err(queue_error)
    }

    async fn recover_in_flight(&self) -> PipelineResult<usize> {
        let mut conn = self.commands.clone();
        let mut moved = 0;
        loop {
            let payload: Option<String> = redis::cmd("RPOPLPUSH")
                .arg(&self.processing_key)
                .arg(&self.queue_key)
                .query_async(&mut conn)
                .await
                .map_err(queue_error)?;
            if payload.is_none() {
                break;
            }
            moved += 1;
        }
        if moved > 0 {
            warn!(queue = %self.queue_key, moved, "Requeued stranded deliveries");
        }
        Ok(moved)
    }
}

#[derive(Default)]
struct MemoryQueueState {
    ready: VecDeque<String>,
    in_flight: HashMap<u64, String>,
    dead: Vec<String>,
    acked: usize,
}

/// Process-local queue with the same ack semantics.
#[derive(Default)]
pub struct InMemoryWorkQueue {
    state: Mutex<MemoryQueueState>,
    available: Notify,
    next_tag: AtomicU64,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ready_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    pub async fn in_flight_len(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    pub async fn dead_letters(&self) -> Vec<String> {
        self.state.lock().await.dead.clone()
    }

    pub async fn acked(&self) -> usize {
        self.state.lock().await.acked
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn publish(&self, payload: &str) -> PipelineResult<()> {
        self.state.lock().await.ready.push_back(payload.to_string());
        self.available.notify_one();
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> PipelineResult<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(payload) = state.ready.pop_front() {
                    let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
                    state.in_flight.insert(tag, payload.clone());
                    return Ok(Some(Delivery { tag, payload }));
                }
            }
            if tokio::time::timeout_at(deadline, self.available.notified()).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> PipelineResult<()> {
        let mut state = self.state.lock().await;
        if state.in_flight.remove(&delivery.tag).is_some() {
            state.acked += 1;
        } else {
            warn!(tag = delivery.tag, "Ack for unknown delivery");
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> PipelineResult<()> {
        let mut state = self.state.lock().await;
        let Some(payload) = state.in_flight.remove(&delivery.tag) else {
            warn!(tag = delivery.tag, "Nack for unknown delivery");
            return Ok(());
        };
        if requeue {
            state.ready.push_front(payload);
            drop(state);
            self.available.notify_one();
        } else {
            state.dead.push(payload);
        }
        Ok(())
    }

    async fn recover_in_flight(&self) -> PipelineResult<usize> {
        let mut state = self.state.lock().await;
        let mut stranded: Vec<(u64, String)> = state.in_flight.drain().collect();
        stranded.sort_by_key(|(tag, _)| *tag);
        let moved = stranded.len();
        for (_, payload) in stranded.into_iter().rev() {
            state.ready.push_front(payload);
        }
        drop(state);
        if moved > 0 {
            self.available.notify_one();
        }
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ack_and_nack_paths() {
        let queue = InMemoryWorkQueue::new();
        queue.publish("a").await.unwrap();
        queue.publish("b").await.unwrap();

        let first = queue.receive(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.payload, "a");
        queue.nack(&first, true).await.unwrap();

        let again = queue.receive(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(again.payload, "a");
        queue.ack(&again).await.unwrap();

        let second = queue.receive(Duration::from_millis(10)).await.unwrap().unwrap();
        queue.nack(&second, false).await.unwrap();

        assert_eq!(queue.acked().await, 1);
        assert_eq!(queue.dead_letters().await, vec!["b".to_string()]);
        assert_eq!(queue.in_flight_len().await, 0);
        assert!(queue.receive(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stranded_deliveries_are_recovered() {
        let queue = InMemoryWorkQueue::new();
        for payload in ["a", "b", "c"] {
            queue.publish(payload).await.unwrap();
        }
        let a = queue.receive(Duration::from_millis(10)).await.unwrap().unwrap();
        let b = queue.receive(Duration::from_millis(10)).await.unwrap().unwrap();
        queue.ack(&b).await.unwrap();
        let _c = queue.receive(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(queue.in_flight_len().await, 2);

        assert_eq!(queue.recover_in_flight().await.unwrap(), 2);
        assert_eq!(queue.in_flight_len().await, 0);
        assert_eq!(queue.ready_len().await, 2);

        let again = queue.receive(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(again.payload, a.payload);
        assert_eq!(queue.receive(Duration::from_millis(10)).await.unwrap().unwrap().payload, "c");
        assert_eq!(queue.recover_in_flight().await.unwrap(), 2);
        assert_eq!(queue.recover_in_flight().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_receive_wakes_on_publish() {
        let queue = std::sync::Arc::new(InMemoryWorkQueue::new());
        let publisher = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("late").await.unwrap();
        });
        let delivery = queue.receive(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(delivery.payload, "late");
    }
}
