pub mod config;
pub mod errors;
pub mod models;
pub mod traits;

pub use config::{AppConfig, MessageQueueConfig, ServicesConfig, WorkerConfig};
pub use errors::{WorkerError, WorkerResult};
pub use models::{CreateProductMessage, GenerateContentMessage, JobType, TaskMessage, TaskType};
pub use traits::{
    DeadLetterInfo, DispatchOutcome, MessageHandler, QueueTransport, TaskHandler,
};
