use lopdf::Document;

/// Count pages of a PDF from raw bytes. Invalid or unreadable input is a
/// user error, mapped to `fileValidation` by the caller.
pub fn count_pdf_pages(data: &[u8]) -> Result<usize, String> {
    let doc = Document::load_mem(data).map_err(|e| format!("invalid or unreadable PDF: {e}"))?;
    let pages = doc.get_pages().len();
    if pages == 0 {
        return Err("PDF has no pages".to_string());
    }
    Ok(pages)
}

/// Extract the embedded text layer of a PDF, page by page. Used by the
/// local development OCR tier; scanned PDFs without a text layer come back
/// empty and that is fine for dev.
pub fn extract_text_layer(data: &[u8]) -> Result<Vec<String>, String> {
    let doc = Document::load_mem(data).map_err(|e| format!("invalid or unreadable PDF: {e}"))?;
    let mut pages = Vec::new();
    for page_number in doc.get_pages().keys() {
        let text = doc.extract_text(&[*page_number]).unwrap_or_default();
        pages.push(text);
    }
    Ok(pages)
}
