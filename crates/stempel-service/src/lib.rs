// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// stempel-service — the coordination core of the Stempel watermark service.
//
// Admission control bounds concurrently running transform pipelines; the
// pipeline streams one document page by page through a sync-to-async write
// bridge; requests that cannot be admitted within a bounded wait are
// deferred to a durable overflow queue and completed in the background by
// the overflow worker.

pub mod admission;
pub mod bridge;
pub mod handler;
pub mod pipeline;
pub mod queue;
pub mod resolver;
pub mod server;
pub mod worker;

// Re-export the primary types so callers can use `stempel_service::RequestHandler` etc.
pub use admission::{Admission, AdmissionController, AdmissionTicket};
pub use handler::{RequestHandler, WatermarkOutcome};
pub use queue::{OverflowMessage, OverflowQueue};
pub use resolver::{FileResolver, LocalFileResolver, MemoryFileResolver};
pub use server::WatermarkServer;
pub use worker::OverflowWorker;
