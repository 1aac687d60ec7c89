//! Document collaborators: ingestion into segments and rendering

pub mod markdown;
