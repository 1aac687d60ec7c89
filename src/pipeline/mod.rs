//! Translation pipeline: segment store, batching, validation, scheduling
//! and checkpointing

pub mod checkpoint;
pub mod context;
pub mod glossary;
pub mod partitioner;
pub mod report;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod validator;
