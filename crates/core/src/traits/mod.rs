pub mod message_handler;
pub mod queue_transport;
pub mod task_handler;

pub use message_handler::{DispatchOutcome, MessageHandler};
pub use queue_transport::{DeadLetterInfo, QueueTransport};
pub use task_handler::TaskHandler;
