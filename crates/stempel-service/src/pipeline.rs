// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Streaming transform pipeline.
//
// Drives the transform engine over a whole document one page at a time,
// pushing output through the sync-to-async bridge so bytes reach the
// consumer while later pages are still being stamped. The working set is
// the engine's per-page state, not the rendered output.
//
// Pipeline state (page index, pages since last flush, timers) is ephemeral
// and per-invocation; nothing is shared between concurrent runs.

use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use stempel_core::error::{Result, StempelError};
use stempel_document::{OpenOptions, OverlaySpec, TransformEngine};

use crate::bridge::SyncSinkBridge;
use crate::resolver::{DestinationSink, SourceStream};

/// Pages stamped between periodic flushes. The writer is additionally
/// flushed after the final page regardless of alignment.
pub const FLUSH_INTERVAL_PAGES: u32 = 10;

/// Transform one document end to end.
///
/// Reads the source, then stamps pages 1..N strictly in order on a blocking
/// thread, flushing through the bridge every [`FLUSH_INTERVAL_PAGES`] pages
/// and after the last page. Cancellation is checked between pages and at
/// flush points; a page render already underway finishes before the
/// checkpoint takes effect.
///
/// Any failure aborts the whole run — there is no partial-success
/// continuation across pages. The session, bridge, and sink are dropped on
/// every exit path.
#[instrument(skip_all, fields(overlay_text = %overlay_text))]
pub async fn run_pipeline(
    engine: Arc<dyn TransformEngine>,
    mut source: SourceStream,
    sink: DestinationSink,
    overlay_text: &str,
    cancel: CancellationToken,
) -> Result<u32> {
    let started = Instant::now();

    let mut source_bytes = Vec::new();
    tokio::select! {
        _ = cancel.cancelled() => return Err(StempelError::Cancelled),
        read = source.read_to_end(&mut source_bytes) => {
            read?;
        }
    }
    debug!(source_bytes = source_bytes.len(), "source loaded");

    // The engine is synchronous; everything below runs on a blocking thread
    // and the bridge parks that thread on each sink write.
    let bridge = SyncSinkBridge::new(sink, cancel.clone());
    let spec = OverlaySpec::new(overlay_text);

    let pages = tokio::task::spawn_blocking(move || -> Result<u32> {
        let mut session = engine.open(&source_bytes, Box::new(bridge), OpenOptions::low_memory())?;
        let page_count = session.page_count();
        debug!(page_count, "transform session opened");

        let mut batch_started = Instant::now();
        for page in 1..=page_count {
            if cancel.is_cancelled() {
                return Err(StempelError::Cancelled);
            }

            session.apply_overlay(page, &spec)?;

            if page % FLUSH_INTERVAL_PAGES == 0 || page == page_count {
                if cancel.is_cancelled() {
                    return Err(StempelError::Cancelled);
                }
                session.flush_writer()?;
                debug!(
                    page,
                    page_count,
                    batch_ms = batch_started.elapsed().as_millis() as u64,
                    "flushed batch"
                );
                batch_started = Instant::now();
            }
        }

        session.close()?;
        Ok(page_count)
    })
    .await
    .map_err(|err| StempelError::Transform(format!("pipeline task failed: {err}")))??;

    info!(
        pages,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "watermark pipeline completed"
    );
    Ok(pages)
}
