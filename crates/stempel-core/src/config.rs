// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Application configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Port for the HTTP surface.
    pub server_port: u16,
    /// Directory holding source documents and deferred outputs.
    pub storage_dir: PathBuf,
    /// Path of the SQLite overflow queue database.
    pub queue_db_path: PathBuf,
    /// Application-level ceiling on concurrently running pipelines.
    pub capacity: usize,
    /// How long an interactive request waits for an admission slot before
    /// it is deferred to the overflow queue.
    pub admission_wait_ms: u64,
    /// Worker poll interval when the overflow queue is empty.
    pub queue_poll_ms: u64,
    /// Lease duration for a received overflow message. An un-acknowledged
    /// message becomes visible again once the lease expires.
    pub queue_lease_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_port: 8431,
            storage_dir: PathBuf::from("storage"),
            queue_db_path: PathBuf::from("stempel-overflow.db"),
            capacity: 8,
            admission_wait_ms: 500,
            queue_poll_ms: 1_000,
            queue_lease_secs: 60,
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file, falling back to defaults if the
    /// file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Write the configuration as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), json)?;
        Ok(())
    }
}
