// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Transform engine — the narrow capability the service drives page by page,
// and its production implementation on `lopdf`.
//
// Sessions are strictly single-use: open, stamp pages 1..N in order, flush
// as directed, close. Nothing here is shared between concurrent runs; each
// session owns its document and sink exclusively.

use std::collections::BTreeMap;
use std::io::Write;

use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use tracing::{debug, instrument};

use stempel_core::error::{Result, StempelError};

use crate::overlay::{self, OverlaySpec};

/// Fallback page size (US Letter) when no MediaBox can be resolved.
const DEFAULT_PAGE_SIZE: (f32, f32) = (612.0, 792.0);

/// How a session serialises its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOptions {
    /// Run a whole-document compression pass before writing. Off in the
    /// low-memory mode the streaming pipeline uses: streams keep their
    /// original encoding and the working set stays bounded by the pages
    /// being touched, not a recompressed object graph.
    pub compress_output: bool,
}

impl OpenOptions {
    /// Options for the streaming pipeline: no recompression pass.
    pub fn low_memory() -> Self {
        Self {
            compress_output: false,
        }
    }
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::low_memory()
    }
}

/// One open document being transformed. Obtained from [`TransformEngine::open`].
pub trait TransformSession: Send {
    /// Total number of pages in the source document.
    fn page_count(&self) -> u32;

    /// Draw one overlay on the given page (1-indexed).
    fn apply_overlay(&mut self, page_number: u32, spec: &OverlaySpec) -> Result<()>;

    /// Flush the underlying sink, pushing any bytes written so far toward
    /// the consumer.
    fn flush_writer(&mut self) -> Result<()>;

    /// Finalise the document structures, write remaining output, and flush.
    fn close(self: Box<Self>) -> Result<()>;
}

/// Factory for transform sessions. The only seam between the service and
/// the PDF engine.
pub trait TransformEngine: Send + Sync {
    fn open(
        &self,
        source: &[u8],
        sink: Box<dyn Write + Send>,
        options: OpenOptions,
    ) -> Result<Box<dyn TransformSession>>;
}

// ---------------------------------------------------------------------------
// lopdf implementation
// ---------------------------------------------------------------------------

/// Production engine backed by `lopdf`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfEngine;

impl LopdfEngine {
    pub fn new() -> Self {
        Self
    }
}

impl TransformEngine for LopdfEngine {
    #[instrument(skip_all, fields(source_bytes = source.len()))]
    fn open(
        &self,
        source: &[u8],
        sink: Box<dyn Write + Send>,
        options: OpenOptions,
    ) -> Result<Box<dyn TransformSession>> {
        let document = Document::load_mem(source)
            .map_err(|err| StempelError::PdfError(format!("failed to load source PDF: {err}")))?;

        let pages = document.get_pages();
        debug!(pages = pages.len(), "PDF opened for transform");

        Ok(Box::new(LopdfSession {
            document,
            pages,
            sink,
            options,
            font_id: None,
            gstate_id: None,
        }))
    }
}

/// A single lopdf-backed transform run.
struct LopdfSession {
    /// The document being mutated.
    document: Document,
    /// 1-indexed page number → page object ID, captured at open.
    pages: BTreeMap<u32, ObjectId>,
    /// Output sink; receives the serialised document at close.
    sink: Box<dyn Write + Send>,
    options: OpenOptions,
    /// Shared Helvetica font object, created on first overlay.
    font_id: Option<ObjectId>,
    /// Shared ExtGState carrying the fill opacity, created on first overlay.
    gstate_id: Option<ObjectId>,
}

impl TransformSession for LopdfSession {
    fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    #[instrument(skip(self, spec), fields(page_number))]
    fn apply_overlay(&mut self, page_number: u32, spec: &OverlaySpec) -> Result<()> {
        let page_id = *self.pages.get(&page_number).ok_or_else(|| {
            StempelError::PdfError(format!(
                "page {} out of range (document has {} pages)",
                page_number,
                self.pages.len()
            ))
        })?;

        let (width, height) = effective_page_size(&self.document, page_id);
        let font_id = self.ensure_font();
        let gstate_id = self.ensure_gstate(spec.opacity);

        // Per-page scratch: the encoded operations live only for this call;
        // the document keeps a reference to the inserted stream object.
        let content = overlay::overlay_content_bytes(spec, width, height)?;
        let content_id = self
            .document
            .add_object(Object::Stream(Stream::new(Dictionary::new(), content)));

        self.register_page_resources(page_id, font_id, gstate_id)?;
        append_page_content(&mut self.document, page_id, content_id)?;

        debug!(page_number, width, height, "overlay applied");
        Ok(())
    }

    fn flush_writer(&mut self) -> Result<()> {
        self.sink.flush()?;
        Ok(())
    }

    #[instrument(skip(self))]
    fn close(mut self: Box<Self>) -> Result<()> {
        if self.options.compress_output {
            self.document.compress();
        }
        self.document
            .save_to(&mut self.sink)
            .map_err(|err| StempelError::PdfError(format!("failed to serialise output: {err}")))?;
        self.sink.flush()?;
        debug!("document closed");
        Ok(())
    }
}

impl LopdfSession {
    /// Create the shared Helvetica font object on first use.
    fn ensure_font(&mut self) -> ObjectId {
        if let Some(id) = self.font_id {
            return id;
        }
        let mut font = Dictionary::new();
        font.set("Type", "Font");
        font.set("Subtype", "Type1");
        font.set("BaseFont", "Helvetica");
        let id = self.document.add_object(Object::Dictionary(font));
        self.font_id = Some(id);
        id
    }

    /// Create the shared ExtGState carrying the fill opacity on first use.
    fn ensure_gstate(&mut self, opacity: f32) -> ObjectId {
        if let Some(id) = self.gstate_id {
            return id;
        }
        let mut gstate = Dictionary::new();
        gstate.set("Type", "ExtGState");
        gstate.set("BM", "Normal");
        gstate.set("ca", Object::Real(opacity));
        gstate.set("CA", Object::Real(opacity));
        let id = self.document.add_object(Object::Dictionary(gstate));
        self.gstate_id = Some(id);
        id
    }

    /// Make the overlay font and graphics state reachable from the page's
    /// resource dictionary.
    ///
    /// Inherited or referenced resource dictionaries are materialised inline
    /// on the page so the page carries everything its content refers to.
    fn register_page_resources(
        &mut self,
        page_id: ObjectId,
        font_id: ObjectId,
        gstate_id: ObjectId,
    ) -> Result<()> {
        let mut resources = effective_resources(&self.document, page_id).unwrap_or_default();

        let mut fonts = resources
            .get(b"Font")
            .ok()
            .and_then(|obj| dict_owned(&self.document, obj))
            .unwrap_or_default();
        fonts.set(overlay::FONT_RESOURCE, Object::Reference(font_id));
        resources.set("Font", Object::Dictionary(fonts));

        let mut gstates = resources
            .get(b"ExtGState")
            .ok()
            .and_then(|obj| dict_owned(&self.document, obj))
            .unwrap_or_default();
        gstates.set(overlay::GSTATE_RESOURCE, Object::Reference(gstate_id));
        resources.set("ExtGState", Object::Dictionary(gstates));

        let page = page_dict_mut(&mut self.document, page_id)?;
        page.set("Resources", Object::Dictionary(resources));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// lopdf helpers
// ---------------------------------------------------------------------------

/// Resolve an object that may be an inline dictionary or a reference to one.
fn dict_owned(doc: &Document, object: &Object) -> Option<Dictionary> {
    match object {
        Object::Dictionary(dict) => Some(dict.clone()),
        Object::Reference(id) => Some(doc.get_object(*id).ok()?.as_dict().ok()?.clone()),
        _ => None,
    }
}

/// Mutable access to a page dictionary.
fn page_dict_mut(doc: &mut Document, page_id: ObjectId) -> Result<&mut Dictionary> {
    doc.get_object_mut(page_id)
        .and_then(|obj| obj.as_dict_mut())
        .map_err(|err| StempelError::PdfError(format!("cannot access page {page_id:?}: {err}")))
}

/// The page's resource dictionary, following the /Parent chain for
/// inherited resources.
fn effective_resources(doc: &Document, page_id: ObjectId) -> Option<Dictionary> {
    let mut current = doc.get_object(page_id).ok()?.as_dict().ok()?;
    loop {
        if let Ok(obj) = current.get(b"Resources") {
            return dict_owned(doc, obj);
        }
        match current.get(b"Parent") {
            Ok(Object::Reference(parent_id)) => {
                current = doc.get_object(*parent_id).ok()?.as_dict().ok()?;
            }
            _ => return None,
        }
    }
}

/// Page width and height from the effective MediaBox, following the
/// /Parent chain. Falls back to US Letter when absent.
fn effective_page_size(doc: &Document, page_id: ObjectId) -> (f32, f32) {
    fn as_f32(object: &Object) -> Option<f32> {
        match object {
            Object::Integer(i) => Some(*i as f32),
            Object::Real(r) => Some(*r),
            _ => None,
        }
    }

    let Ok(mut current) = doc.get_object(page_id).and_then(|obj| obj.as_dict()) else {
        return DEFAULT_PAGE_SIZE;
    };

    loop {
        if let Ok(Object::Array(media_box)) = current.get(b"MediaBox")
            && media_box.len() == 4
            && let (Some(llx), Some(lly), Some(urx), Some(ury)) = (
                as_f32(&media_box[0]),
                as_f32(&media_box[1]),
                as_f32(&media_box[2]),
                as_f32(&media_box[3]),
            )
        {
            return (urx - llx, ury - lly);
        }
        match current.get(b"Parent") {
            Ok(Object::Reference(parent_id)) => {
                match doc.get_object(*parent_id).and_then(|obj| obj.as_dict()) {
                    Ok(parent) => current = parent,
                    Err(_) => return DEFAULT_PAGE_SIZE,
                }
            }
            _ => return DEFAULT_PAGE_SIZE,
        }
    }
}

/// Append a content stream to a page, preserving any existing content.
fn append_page_content(doc: &mut Document, page_id: ObjectId, content_id: ObjectId) -> Result<()> {
    let page = page_dict_mut(doc, page_id)?;
    let addition = Object::Reference(content_id);

    match page.get_mut(b"Contents") {
        Ok(Object::Array(contents)) => contents.push(addition),
        Ok(Object::Reference(existing)) => {
            let previous = Object::Reference(*existing);
            page.set("Contents", Object::Array(vec![previous, addition]));
        }
        _ => page.set("Contents", addition),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use lopdf::content::Content;

    /// Sink that counts flushes, for asserting flush propagation.
    struct CountingSink {
        bytes: Vec<u8>,
        flushes: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    impl Write for CountingSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.bytes.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.flushes
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    /// Run the engine over a synthetic document, stamping every page.
    fn watermark_all_pages(source: &[u8], text: &str) -> Vec<u8> {
        let engine = LopdfEngine::new();
        let output = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));

        struct SharedSink(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);
        impl Write for SharedSink {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().expect("sink lock").extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut session = engine
            .open(
                source,
                Box::new(SharedSink(output.clone())),
                OpenOptions::low_memory(),
            )
            .expect("open");

        let spec = OverlaySpec::new(text);
        for page in 1..=session.page_count() {
            session.apply_overlay(page, &spec).expect("overlay");
        }
        session.close().expect("close");

        let bytes = output.lock().expect("sink lock").clone();
        bytes
    }

    /// Decode every content stream attached to a page.
    fn page_content_text(doc: &Document, page_id: ObjectId) -> String {
        let mut combined = String::new();
        let page = doc.get_object(page_id).expect("page").as_dict().expect("dict");
        let mut stream_ids = Vec::new();
        match page.get(b"Contents").expect("contents") {
            Object::Reference(id) => stream_ids.push(*id),
            Object::Array(items) => {
                for item in items {
                    if let Object::Reference(id) = item {
                        stream_ids.push(*id);
                    }
                }
            }
            _ => {}
        }
        for id in stream_ids {
            let stream = doc
                .get_object(id)
                .expect("stream object")
                .as_stream()
                .expect("stream");
            let data = stream
                .decompressed_content()
                .unwrap_or_else(|_| stream.content.clone());
            combined.push_str(&String::from_utf8_lossy(&data));
            combined.push('\n');
        }
        combined
    }

    #[test]
    fn every_page_gets_exactly_one_overlay() {
        let source = fixtures::sample_document(3);
        let output = watermark_all_pages(&source, "DRAFT");

        let doc = Document::load_mem(&output).expect("reload output");
        let pages = doc.get_pages();
        assert_eq!(pages.len(), 3);

        for page_id in pages.values() {
            let content = page_content_text(&doc, *page_id);
            let overlays = content.matches(overlay::FONT_RESOURCE).count();
            assert_eq!(overlays, 1, "expected one overlay per page");
            assert!(content.contains("DRAFT"));
        }
    }

    #[test]
    fn overlay_parameters_survive_serialisation() {
        let source = fixtures::sample_document(1);
        let output = watermark_all_pages(&source, "CONFIDENTIAL");

        let doc = Document::load_mem(&output).expect("reload output");
        let page_id = *doc.get_pages().values().next().expect("page");
        let content = page_content_text(&doc, page_id);

        // Parse the overlay stream back into operations and check the
        // rotation matrix and font size numerically.
        let parsed = Content::decode(content.as_bytes());
        let ops = match parsed {
            Ok(content) => content.operations,
            // Multiple concatenated streams may not re-parse as one; fall
            // back to a textual check on the operators we emitted.
            Err(_) => {
                assert!(content.contains("Tf"));
                assert!(content.contains("CONFIDENTIAL"));
                return;
            }
        };

        let tm = ops.iter().find(|op| op.operator == "Tm").expect("Tm");
        let cos = match &tm.operands[0] {
            Object::Real(value) => *value,
            Object::Integer(value) => *value as f32,
            other => panic!("unexpected operand {other:?}"),
        };
        assert!((cos - (std::f32::consts::PI / 6.0).cos()).abs() < 1e-3);
    }

    #[test]
    fn extgstate_carries_fill_opacity() {
        let source = fixtures::sample_document(1);
        let output = watermark_all_pages(&source, "DRAFT");
        let doc = Document::load_mem(&output).expect("reload output");

        let found = doc.objects.values().any(|object| {
            let Object::Dictionary(dict) = object else {
                return false;
            };
            matches!(dict.get(b"ca"), Ok(Object::Real(v)) if (*v - 0.3).abs() < 1e-6)
        });
        assert!(found, "output should contain an ExtGState with ca 0.3");
    }

    #[test]
    fn inherited_resources_are_preserved() {
        // The fixture inherits /Resources from the /Pages node; stamping a
        // page must keep the inherited font visible alongside ours.
        let source = fixtures::sample_document(2);
        let output = watermark_all_pages(&source, "DRAFT");

        let doc = Document::load_mem(&output).expect("reload output");
        for page_id in doc.get_pages().values() {
            let page = doc
                .get_object(*page_id)
                .expect("page")
                .as_dict()
                .expect("dict");
            let resources = dict_owned(&doc, page.get(b"Resources").expect("resources"))
                .expect("resource dict");
            let fonts = dict_owned(&doc, resources.get(b"Font").expect("fonts")).expect("fonts");
            assert!(fonts.get(overlay::FONT_RESOURCE.as_bytes()).is_ok());
            assert!(fonts.get(b"F1").is_ok(), "inherited font entry retained");
        }
    }

    #[test]
    fn page_out_of_range_is_an_error() {
        let source = fixtures::sample_document(2);
        let engine = LopdfEngine::new();
        let mut session = engine
            .open(&source, Box::new(Vec::<u8>::new()), OpenOptions::default())
            .expect("open");

        let spec = OverlaySpec::new("DRAFT");
        let err = session.apply_overlay(3, &spec).expect_err("out of range");
        assert!(matches!(err, StempelError::PdfError(_)));
    }

    #[test]
    fn flush_propagates_to_sink() {
        let flushes = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let sink = CountingSink {
            bytes: Vec::new(),
            flushes: flushes.clone(),
        };

        let source = fixtures::sample_document(1);
        let engine = LopdfEngine::new();
        let mut session = engine
            .open(&source, Box::new(sink), OpenOptions::default())
            .expect("open");

        session.flush_writer().expect("flush");
        session.flush_writer().expect("flush");
        assert_eq!(flushes.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn malformed_source_fails_to_open() {
        let engine = LopdfEngine::new();
        let result = engine.open(b"not a pdf", Box::new(Vec::<u8>::new()), OpenOptions::default());
        assert!(matches!(result, Err(StempelError::PdfError(_))));
    }
}
