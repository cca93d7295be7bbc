//! Data Seeder: batched, resumable, cancellable data generation jobs.

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod jobs;
pub mod orchestrator;
pub mod store;
