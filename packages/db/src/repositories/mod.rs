//! Repository implementations for store operations.

mod job_repo;

pub use job_repo::{JobChange, JobFilter, JobRepository};
