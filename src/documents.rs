//! Conversions from uploaded files into something the model can read.

use base64::Engine;
use thiserror::Error;
use tracing::{debug, warn};

pub const PDF_MIME: &str = "application/pdf";

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("File must be {expected}")]
    UnsupportedType { expected: &'static str },

    #[error("Error reading PDF: {0}")]
    Pdf(String),

    #[error("No text content found in PDF")]
    Empty,
}

pub fn ensure_image(content_type: Option<&str>) -> Result<&str, DocumentError> {
    match content_type {
        Some(mime) if mime.starts_with("image/") => Ok(mime),
        _ => Err(DocumentError::UnsupportedType {
            expected: "an image",
        }),
    }
}

pub fn ensure_pdf(content_type: Option<&str>) -> Result<(), DocumentError> {
    match content_type {
        Some(PDF_MIME) => Ok(()),
        _ => Err(DocumentError::UnsupportedType { expected: "a PDF" }),
    }
}

/// Extracts the text layer of a PDF. CPU-bound; run it off the async runtime.
pub fn pdf_to_text(content: &[u8]) -> Result<String, DocumentError> {
    let text = pdf_extract::extract_text_from_mem(content).map_err(|e| {
        warn!(error = %e, "Failed to extract PDF text");
        DocumentError::Pdf(e.to_string())
    })?;

    let text = text.trim().to_string();
    if text.is_empty() {
        return Err(DocumentError::Empty);
    }
    debug!(chars = text.len(), "Extracted PDF text");
    Ok(text)
}

/// Encodes image bytes as a `data:` URL for vision requests.
pub fn image_to_data_url(content: &[u8], mime_type: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(content);
    format!("data:{mime_type};base64,{encoded}")
}
