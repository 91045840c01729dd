pub mod message;

pub use message::{
    CreateProductMessage, GenerateContentMessage, JobType, TaskMessage, TaskType,
};
