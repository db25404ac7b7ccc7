//! Geometric anchor for a recognized text span on a page.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub id: i64,
    pub document_id: String,
    pub page_number: u32,
    /// Normalized to `[0, 1]` relative to page width/height.
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub text: String,
    pub ocr_confidence: f32,
}

impl BoundingBox {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        document_id: String,
        page_number: u32,
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        text: String,
        ocr_confidence: f32,
    ) -> Self {
        Self {
            id: 0,
            document_id,
            page_number,
            x,
            y,
            width,
            height,
            text,
            ocr_confidence,
        }
    }
}
