pub mod dispatcher;
pub mod handlers;
pub mod service;

pub use dispatcher::TaskDispatcher;
pub use handlers::{CreateProductHandler, GenerateContentHandler};
pub use service::{ConcurrencyGatedHandler, WorkerService, WorkerServiceBuilder};
