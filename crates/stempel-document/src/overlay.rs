// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Watermark overlay construction — builds the per-page content stream that
// draws the semi-transparent rotated text, centred on the page.

use lopdf::content::{Content, Operation};
use lopdf::{Object, StringFormat};

use stempel_core::error::{Result, StempelError};

/// Resource name under which the overlay font is registered on each page.
pub const FONT_RESOURCE: &str = "FStempel";

/// Resource name under which the overlay graphics state is registered.
pub const GSTATE_RESOURCE: &str = "GSStempel";

/// Average Helvetica glyph width as a fraction of the font size.
/// Good enough for centring a single watermark line.
const AVG_GLYPH_WIDTH_FACTOR: f32 = 0.50;

/// Half the Helvetica cap height as a fraction of the font size; shifts the
/// baseline down so the text is vertically centred rather than sitting on
/// the centre line.
const HALF_CAP_HEIGHT_FACTOR: f32 = 0.35;

/// Fill gray level for the watermark text.
const FILL_GRAY: f32 = 0.75;

/// Parameters of the watermark drawn once per page.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlaySpec {
    /// The text to draw.
    pub text: String,
    /// Font size in points.
    pub font_size: f32,
    /// Counter-clockwise rotation about the page centre, in radians.
    pub angle_radians: f32,
    /// Fill opacity applied through an ExtGState.
    pub opacity: f32,
}

impl OverlaySpec {
    /// Standard watermark: 60pt Helvetica, rotated π/6, 30% opacity.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            font_size: 60.0,
            angle_radians: std::f32::consts::FRAC_PI_6,
            opacity: 0.3,
        }
    }
}

/// Estimated width of `text` rendered in Helvetica at `font_size`.
pub fn estimated_text_width(text: &str, font_size: f32) -> f32 {
    text.chars().count() as f32 * AVG_GLYPH_WIDTH_FACTOR * font_size
}

/// Build the content-stream operations for one overlay.
///
/// The text matrix rotates by `angle_radians` about the page centre and
/// shifts the baseline start so the (estimated) text box is centred both
/// horizontally and vertically.
pub fn overlay_operations(spec: &OverlaySpec, page_width: f32, page_height: f32) -> Vec<Operation> {
    let (sin, cos) = spec.angle_radians.sin_cos();

    let centre_x = page_width / 2.0;
    let centre_y = page_height / 2.0;
    let half_width = estimated_text_width(&spec.text, spec.font_size) / 2.0;
    let half_cap = HALF_CAP_HEIGHT_FACTOR * spec.font_size;

    // Walk back half the text width along the rotated baseline, and half the
    // cap height along the rotated vertical, so the glyph box straddles the
    // page centre.
    let origin_x = centre_x - half_width * cos + half_cap * sin;
    let origin_y = centre_y - half_width * sin - half_cap * cos;

    vec![
        Operation::new("q", vec![]),
        Operation::new("gs", vec![Object::Name(GSTATE_RESOURCE.into())]),
        Operation::new(
            "rg",
            vec![FILL_GRAY.into(), FILL_GRAY.into(), FILL_GRAY.into()],
        ),
        Operation::new("BT", vec![]),
        Operation::new(
            "Tf",
            vec![Object::Name(FONT_RESOURCE.into()), spec.font_size.into()],
        ),
        Operation::new(
            "Tm",
            vec![
                cos.into(),
                sin.into(),
                (-sin).into(),
                cos.into(),
                origin_x.into(),
                origin_y.into(),
            ],
        ),
        Operation::new(
            "Tj",
            vec![Object::String(
                spec.text.as_bytes().to_vec(),
                StringFormat::Literal,
            )],
        ),
        Operation::new("ET", vec![]),
        Operation::new("Q", vec![]),
    ]
}

/// Encode the overlay operations for a page into raw content-stream bytes.
pub fn overlay_content_bytes(
    spec: &OverlaySpec,
    page_width: f32,
    page_height: f32,
) -> Result<Vec<u8>> {
    let content = Content {
        operations: overlay_operations(spec, page_width, page_height),
    };
    content
        .encode()
        .map_err(|err| StempelError::PdfError(format!("encode overlay content: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn as_f32(object: &Object) -> f32 {
        match object {
            Object::Integer(i) => *i as f32,
            Object::Real(r) => *r,
            other => panic!("not a number: {other:?}"),
        }
    }

    #[test]
    fn spec_carries_fixed_parameters() {
        let spec = OverlaySpec::new("DRAFT");
        assert_eq!(spec.font_size, 60.0);
        assert!((spec.angle_radians - std::f32::consts::PI / 6.0).abs() < 1e-6);
        assert!((spec.opacity - 0.3).abs() < 1e-6);
    }

    #[test]
    fn width_estimate_scales_with_text_and_size() {
        let short = estimated_text_width("AB", 60.0);
        let long = estimated_text_width("ABCD", 60.0);
        assert!((long - 2.0 * short).abs() < 1e-3);
        assert!(estimated_text_width("AB", 120.0) > short);
    }

    #[test]
    fn operations_rotate_by_pi_over_six() {
        let spec = OverlaySpec::new("DRAFT");
        let ops = overlay_operations(&spec, 612.0, 792.0);

        let tm = ops
            .iter()
            .find(|op| op.operator == "Tm")
            .expect("text matrix operation");
        let matrix: Vec<f32> = tm.operands.iter().map(as_f32).collect();

        // [cos sin -sin cos tx ty] for θ = π/6.
        assert!((matrix[0] - 0.866).abs() < 1e-3);
        assert!((matrix[1] - 0.5).abs() < 1e-3);
        assert!((matrix[2] + 0.5).abs() < 1e-3);
        assert!((matrix[3] - 0.866).abs() < 1e-3);
    }

    #[test]
    fn operations_set_font_size_and_text() {
        let spec = OverlaySpec::new("CONFIDENTIAL");
        let ops = overlay_operations(&spec, 612.0, 792.0);

        let tf = ops.iter().find(|op| op.operator == "Tf").expect("Tf");
        assert_eq!(as_f32(&tf.operands[1]), 60.0);

        let tj = ops.iter().find(|op| op.operator == "Tj").expect("Tj");
        match &tj.operands[0] {
            Object::String(bytes, _) => assert_eq!(bytes, b"CONFIDENTIAL"),
            other => panic!("unexpected Tj operand: {other:?}"),
        }
    }

    #[test]
    fn encoded_bytes_reference_resources() {
        let spec = OverlaySpec::new("DRAFT");
        let bytes = overlay_content_bytes(&spec, 612.0, 792.0).expect("encode");
        let text = String::from_utf8_lossy(&bytes);

        assert!(text.contains(FONT_RESOURCE));
        assert!(text.contains(GSTATE_RESOURCE));
        assert!(text.contains("DRAFT"));
    }

    #[test]
    fn graphics_state_is_balanced() {
        let spec = OverlaySpec::new("DRAFT");
        let ops = overlay_operations(&spec, 100.0, 100.0);
        let saves = ops.iter().filter(|op| op.operator == "q").count();
        let restores = ops.iter().filter(|op| op.operator == "Q").count();
        assert_eq!(saves, restores);
    }
}
