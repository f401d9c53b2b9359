use lopdf::Document;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PdfTextError {
    #[error("document parse failed: {0}")]
    Parse(#[from] lopdf::Error),
}

/// Text of every page, concatenated in page order. This is the only place
/// the registry document's binary format is touched; everything downstream
/// works on plain text.
pub fn extract_text(bytes: &[u8]) -> Result<String, PdfTextError> {
    let document = Document::load_mem(bytes)?;
    let pages: Vec<u32> = document.get_pages().keys().copied().collect();
    Ok(document.extract_text(&pages)?)
}
