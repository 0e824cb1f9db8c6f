// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Sync-to-async write bridge.
//
// The transform engine only issues synchronous "write N bytes" / "flush"
// calls, while the destination (an HTTP response body, a file) is an
// asynchronous sink. This adapter is the one place where that boundary
// blocks: each write parks the calling worker thread until the async write
// completes, honouring backpressure and forwarding cancellation.
//
// The bridge is write-only and append-only; there is no read or seek.
// It MUST only be driven from a blocking thread (`tokio::task::spawn_blocking`)
// — `Handle::block_on` panics inside an async execution context, which is
// exactly the misuse this type exists to contain.

use std::io::Write;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

/// Boxed asynchronous sink accepted by the bridge.
pub type AsyncSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Blocks a worker thread on an asynchronous sink.
pub struct SyncSinkBridge {
    sink: AsyncSink,
    handle: Handle,
    cancel: CancellationToken,
}

impl SyncSinkBridge {
    /// Wrap an async sink. Captures the current runtime handle, so this must
    /// be called from within the runtime — before handing the bridge off to
    /// a blocking thread.
    pub fn new(sink: AsyncSink, cancel: CancellationToken) -> Self {
        Self {
            sink,
            handle: Handle::current(),
            cancel,
        }
    }
}

fn cancelled() -> std::io::Error {
    // Not ErrorKind::Interrupted: std's write_all retries Interrupted, and a
    // cancelled request must not be retried.
    std::io::Error::other("write cancelled")
}

impl Write for SyncSinkBridge {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let Self {
            sink,
            handle,
            cancel,
        } = self;
        handle.block_on(async {
            tokio::select! {
                _ = cancel.cancelled() => Err(cancelled()),
                written = sink.write_all(buf) => written.map(|()| buf.len()),
            }
        })
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let Self {
            sink,
            handle,
            cancel,
        } = self;
        handle.block_on(async {
            tokio::select! {
                _ = cancel.cancelled() => Err(cancelled()),
                flushed = sink.flush() => flushed,
            }
        })
    }
}
