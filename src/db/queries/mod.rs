//! Database queries

pub mod ingest;
pub mod upload;
