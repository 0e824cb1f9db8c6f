// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Synthetic PDF documents for tests and benchmarks.
//
// Kept in the library (not behind cfg(test)) so the service crate's
// integration tests and the criterion benches can share the same fixtures.

use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, Stream, StringFormat};

/// Build a minimal well-formed PDF with `page_count` US Letter pages.
///
/// Each page draws one line of text referencing an inherited font resource
/// (`/F1` on the `/Pages` node), so engine tests exercise the resource
/// inheritance path.
pub fn sample_document(page_count: u32) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let mut font = Dictionary::new();
    font.set("Type", "Font");
    font.set("Subtype", "Type1");
    font.set("BaseFont", "Helvetica");
    let font_id = doc.add_object(Object::Dictionary(font));

    let mut kids: Vec<Object> = Vec::with_capacity(page_count as usize);
    for index in 1..=page_count {
        let label = format!("Page {index}");
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec![Object::Name(b"F1".to_vec()), Object::Integer(12)]),
                Operation::new("Td", vec![Object::Integer(72), Object::Integer(720)]),
                Operation::new(
                    "Tj",
                    vec![Object::String(label.into_bytes(), StringFormat::Literal)],
                ),
                Operation::new("ET", vec![]),
            ],
        };
        let encoded = content.encode().expect("fixture content encodes");
        let content_id = doc.add_object(Object::Stream(Stream::new(Dictionary::new(), encoded)));

        let mut page = Dictionary::new();
        page.set("Type", "Page");
        page.set("Parent", Object::Reference(pages_id));
        page.set("Contents", Object::Reference(content_id));
        page.set(
            "MediaBox",
            Object::Array(vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Integer(612),
                Object::Integer(792),
            ]),
        );
        let page_id = doc.add_object(Object::Dictionary(page));
        kids.push(Object::Reference(page_id));
    }

    let mut font_entries = Dictionary::new();
    font_entries.set("F1", Object::Reference(font_id));
    let mut resources = Dictionary::new();
    resources.set("Font", Object::Dictionary(font_entries));

    let mut pages = Dictionary::new();
    pages.set("Type", "Pages");
    pages.set("Kids", Object::Array(kids));
    pages.set("Count", Object::Integer(page_count as i64));
    // Inherited by every page; pages deliberately carry no own /Resources.
    pages.set("Resources", Object::Dictionary(resources));
    doc.objects.insert(pages_id, Object::Dictionary(pages));

    let mut catalog = Dictionary::new();
    catalog.set("Type", "Catalog");
    catalog.set("Pages", Object::Reference(pages_id));
    let catalog_id = doc.add_object(Object::Dictionary(catalog));
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).expect("fixture document serialises");
    bytes
}
