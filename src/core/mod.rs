//! Core types, configuration and provider clients

pub mod client;
pub mod config;
pub mod errors;
pub mod models;
pub mod persona;
pub mod prompt;
pub mod token_tracker;
