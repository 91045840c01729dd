pub mod message_queue;

pub use message_queue::{RabbitMqWorkQueue, RETRY_COUNT_HEADER};
