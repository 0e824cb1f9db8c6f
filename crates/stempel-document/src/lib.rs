// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// stempel-document — PDF watermark overlay engine for the Stempel service.
//
// Exposes the narrow transform capability (open a document over a sink,
// count pages, stamp one page at a time, flush, close) and its production
// implementation on `lopdf`. The rest of the service only ever talks to the
// `TransformEngine`/`TransformSession` traits.

pub mod engine;
pub mod fixtures;
pub mod overlay;

// Re-export the primary types so callers can use `stempel_document::LopdfEngine` etc.
pub use engine::{LopdfEngine, OpenOptions, TransformEngine, TransformSession};
pub use overlay::OverlaySpec;
