pub mod consumer;
pub mod message;
pub mod queue;

pub use consumer::{ConsumerStats, IntelligenceConsumer};
pub use message::{decode_event, IntelligenceMessage};
pub use queue::{Delivery, InMemoryWorkQueue, RedisWorkQueue, WorkQueue};
