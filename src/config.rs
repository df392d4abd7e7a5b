//! Configuration management

use anyhow::{self, Context, Result};

use crate::defaults::{DEFAULT_BATCH_SIZE, DEFAULT_MAX_UPLOAD_BYTES};

/// Which storage backend holds entities and job records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// PostgreSQL via sqlx (production)
    Postgres,
    /// In-process store (development, tests); nothing survives a restart
    Memory,
}

impl StoreBackend {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
            "memory" | "mock" => Ok(StoreBackend::Memory),
            other => anyhow::bail!("STORE_BACKEND must be 'postgres' or 'memory', got '{}'", other),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Storage backend
    pub store_backend: StoreBackend,

    /// PostgreSQL connection string (required for the postgres backend)
    pub database_url: Option<String>,

    /// NATS server URL
    pub nats_url: String,

    /// Rows per atomic batch
    pub batch_size: usize,

    /// Uploads larger than this are rejected at submit time
    pub max_upload_bytes: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let store_backend = match lookup("STORE_BACKEND") {
            Some(value) => StoreBackend::parse(&value)?,
            None => StoreBackend::Postgres,
        };

        let database_url = lookup("DATABASE_URL").filter(|url| !url.is_empty());
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            anyhow::bail!("DATABASE_URL must be set when STORE_BACKEND is postgres");
        }

        let nats_url = lookup("NATS_URL")
            .unwrap_or_else(|| "nats://localhost:4222".to_string());

        let batch_size = match lookup("INGEST_BATCH_SIZE") {
            Some(value) => value
                .trim()
                .parse::<usize>()
                .with_context(|| format!("INGEST_BATCH_SIZE must be a positive integer, got '{}'", value))?,
            None => DEFAULT_BATCH_SIZE,
        };
        if batch_size == 0 {
            anyhow::bail!("INGEST_BATCH_SIZE must be greater than zero");
        }

        let max_upload_bytes = match lookup("MAX_UPLOAD_BYTES") {
            Some(value) => value
                .trim()
                .parse::<u64>()
                .with_context(|| format!("MAX_UPLOAD_BYTES must be an integer, got '{}'", value))?,
            None => DEFAULT_MAX_UPLOAD_BYTES,
        };

        Ok(Self {
            store_backend,
            database_url,
            nats_url,
            batch_size,
            max_upload_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_config_defaults_with_database_url() {
        let config = Config::from_lookup(lookup(&[("DATABASE_URL", "postgres://test")])).unwrap();
        assert_eq!(config.store_backend, StoreBackend::Postgres);
        assert_eq!(config.nats_url, "nats://localhost:4222");
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.max_upload_bytes, 5 * 1024 * 1024);
    }

    #[test]
    fn test_config_postgres_requires_database_url() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn test_config_memory_backend_without_database() {
        let config = Config::from_lookup(lookup(&[("STORE_BACKEND", "memory")])).unwrap();
        assert_eq!(config.store_backend, StoreBackend::Memory);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_config_rejects_unknown_backend() {
        assert!(Config::from_lookup(lookup(&[("STORE_BACKEND", "mongo")])).is_err());
    }

    #[test]
    fn test_config_batch_size_must_be_positive() {
        let vars = [("STORE_BACKEND", "memory"), ("INGEST_BATCH_SIZE", "0")];
        assert!(Config::from_lookup(lookup(&vars)).is_err());

        let vars = [("STORE_BACKEND", "memory"), ("INGEST_BATCH_SIZE", "abc")];
        let err = Config::from_lookup(lookup(&vars)).unwrap_err();
        assert!(err.to_string().contains("INGEST_BATCH_SIZE"));

        let vars = [("STORE_BACKEND", "memory"), ("INGEST_BATCH_SIZE", "250")];
        assert_eq!(Config::from_lookup(lookup(&vars)).unwrap().batch_size, 250);
    }
}
