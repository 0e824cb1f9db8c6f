// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// File resolution capability — how the service finds source documents and
// creates destinations, without knowing the storage backend.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use stempel_core::error::{Result, StempelError};

/// Readable byte stream for a resolved source document.
pub type SourceStream = Box<dyn AsyncRead + Send + Unpin>;

/// Writable byte sink for a destination document.
pub type DestinationSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Resolves named byte streams. The service's only view of storage.
#[async_trait]
pub trait FileResolver: Send + Sync {
    /// Whether a source with this name exists.
    async fn exists(&self, name: &str) -> Result<bool>;

    /// Open a source for reading. `None` means the source does not exist.
    async fn open_source(&self, name: &str) -> Result<Option<SourceStream>>;

    /// Create (or truncate) a destination for writing. Truncation gives
    /// deferred retries their overwrite semantics: every redelivery rewrites
    /// the same destination from scratch.
    async fn create_destination(&self, name: &str) -> Result<DestinationSink>;
}

/// Reject names that could escape the storage root.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.contains('\0')
    {
        return Err(StempelError::InvalidName(name.into()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Local filesystem backend
// ---------------------------------------------------------------------------

/// Resolver over a flat directory of documents.
#[derive(Debug, Clone)]
pub struct LocalFileResolver {
    root: PathBuf,
}

impl LocalFileResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl FileResolver for LocalFileResolver {
    async fn exists(&self, name: &str) -> Result<bool> {
        let path = self.path_for(name)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn open_source(&self, name: &str) -> Result<Option<SourceStream>> {
        let path = self.path_for(name)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => {
                debug!(name, "source opened");
                Ok(Some(Box::new(file)))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn create_destination(&self, name: &str) -> Result<DestinationSink> {
        let path = self.path_for(name)?;
        let file = tokio::fs::File::create(&path).await?;
        info!(name, "destination created");
        Ok(Box::new(file))
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Shared in-memory store, used by tests and demos.
///
/// Writes through a destination sink land in the store immediately, so a
/// reader observes whatever has been flushed so far — the same visibility a
/// client polling a deferred destination gets.
#[derive(Debug, Clone, Default)]
pub struct MemoryFileResolver {
    store: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryFileResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a named document.
    pub fn insert(&self, name: impl Into<String>, bytes: Vec<u8>) {
        if let Ok(mut store) = self.store.lock() {
            store.insert(name.into(), bytes);
        }
    }

    /// Snapshot a named document's current bytes.
    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.store.lock().ok()?.get(name).cloned()
    }
}

#[async_trait]
impl FileResolver for MemoryFileResolver {
    async fn exists(&self, name: &str) -> Result<bool> {
        validate_name(name)?;
        let store = self
            .store
            .lock()
            .map_err(|_| StempelError::Database("memory store poisoned".into()))?;
        Ok(store.contains_key(name))
    }

    async fn open_source(&self, name: &str) -> Result<Option<SourceStream>> {
        validate_name(name)?;
        let store = self
            .store
            .lock()
            .map_err(|_| StempelError::Database("memory store poisoned".into()))?;
        Ok(store
            .get(name)
            .cloned()
            .map(|bytes| Box::new(Cursor::new(bytes)) as SourceStream))
    }

    async fn create_destination(&self, name: &str) -> Result<DestinationSink> {
        validate_name(name)?;
        let mut store = self
            .store
            .lock()
            .map_err(|_| StempelError::Database("memory store poisoned".into()))?;
        // Truncate on create: redeliveries overwrite, never append.
        store.insert(name.to_string(), Vec::new());
        Ok(Box::new(MemorySink {
            name: name.to_string(),
            store: Arc::clone(&self.store),
        }))
    }
}

/// Write-through sink into the shared store.
struct MemorySink {
    name: String,
    store: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl AsyncWrite for MemorySink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let mut store = self
            .store
            .lock()
            .map_err(|_| std::io::Error::other("memory store poisoned"))?;
        store.entry(self.name.clone()).or_default().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
