//! Ingestion services

pub mod normalizer;
pub mod orchestrator;
pub mod persister;
pub mod spreadsheet;
pub mod store;
pub mod upload_jobs;
pub mod worker;

#[cfg(test)]
pub mod test_support;
