use crate::error::IngestError;
use crate::models::DocumentInput;
use lopdf::{Dictionary, Document, Object};
use serde::Serialize;
use std::path::Path;
use tracing::warn;

const PDF_MAGIC: &[u8] = b"%PDF-";
const FORM_FEED: char = '\u{000c}';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    PlainText,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DocumentMetadata {
    pub file_name: String,
    pub file_size: usize,
    pub num_pages: usize,
    pub title: Option<String>,
    pub author: Option<String>,
    pub subject: Option<String>,
}

pub trait TextExtractor: Send + Sync {
    /// Every page of the document in order, blank pages included.
    fn extract_pages(&self, document: &DocumentInput) -> Result<Vec<PageText>, IngestError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfExtractor;

impl TextExtractor for LopdfExtractor {
    fn extract_pages(&self, document: &DocumentInput) -> Result<Vec<PageText>, IngestError> {
        let pdf = load_pdf(document)?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in pdf.get_pages() {
            let text = match pdf.extract_text(&[page_no]) {
                Ok(text) => text,
                Err(error) => {
                    // image-only and malformed content streams land here
                    warn!(
                        source = %document.source_name,
                        page = page_no,
                        error = %error,
                        "page text unreadable, treating as blank"
                    );
                    String::new()
                }
            };
            pages.push(PageText {
                number: page_no,
                text,
            });
        }

        Ok(pages)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn extract_pages(&self, document: &DocumentInput) -> Result<Vec<PageText>, IngestError> {
        let text = decode_text(document)?;
        Ok(text
            .split(FORM_FEED)
            .enumerate()
            .map(|(index, page)| PageText {
                number: (index + 1) as u32,
                text: page.to_string(),
            })
            .collect())
    }
}

/// Picks the extractor from the document's leading bytes and name.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoExtractor;

impl TextExtractor for AutoExtractor {
    fn extract_pages(&self, document: &DocumentInput) -> Result<Vec<PageText>, IngestError> {
        match detect_format(&document.source_name, &document.bytes)? {
            DocumentFormat::Pdf => LopdfExtractor.extract_pages(document),
            DocumentFormat::PlainText => PlainTextExtractor.extract_pages(document),
        }
    }
}

pub fn extract_page_texts(document: &DocumentInput) -> Result<Vec<PageText>, IngestError> {
    AutoExtractor.extract_pages(document)
}

pub fn detect_format(source_name: &str, bytes: &[u8]) -> Result<DocumentFormat, IngestError> {
    if bytes.starts_with(PDF_MAGIC) {
        return Ok(DocumentFormat::Pdf);
    }

    let extension = Path::new(source_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    if extension.as_deref() == Some("pdf") {
        return Err(unsupported(source_name, "named .pdf but has no %PDF- header"));
    }

    match std::str::from_utf8(bytes) {
        Ok(text) if !text.contains('\0') => Ok(DocumentFormat::PlainText),
        _ => Err(unsupported(source_name, "neither a PDF nor UTF-8 text")),
    }
}

pub fn extract_metadata(document: &DocumentInput) -> Result<DocumentMetadata, IngestError> {
    let mut metadata = DocumentMetadata {
        file_name: document.source_name.clone(),
        file_size: document.bytes.len(),
        ..DocumentMetadata::default()
    };

    match detect_format(&document.source_name, &document.bytes)? {
        DocumentFormat::Pdf => {
            let pdf = load_pdf(document)?;
            metadata.num_pages = pdf.get_pages().len();
            if let Some(info) = info_dictionary(&pdf) {
                metadata.title = info_string(info, b"Title");
                metadata.author = info_string(info, b"Author");
                metadata.subject = info_string(info, b"Subject");
            }
        }
        DocumentFormat::PlainText => {
            metadata.num_pages = decode_text(document)?.split(FORM_FEED).count();
        }
    }

    Ok(metadata)
}

fn load_pdf(document: &DocumentInput) -> Result<Document, IngestError> {
    Document::load_mem(&document.bytes).map_err(|error| {
        IngestError::PdfParse(format!("{}: {error}", document.source_name))
    })
}

fn decode_text(document: &DocumentInput) -> Result<&str, IngestError> {
    let text = std::str::from_utf8(&document.bytes)
        .map_err(|_| unsupported(&document.source_name, "text is not valid UTF-8"))?;
    Ok(text.strip_prefix('\u{feff}').unwrap_or(text))
}

fn info_dictionary(pdf: &Document) -> Option<&Dictionary> {
    match pdf.trailer.get(b"Info").ok()? {
        Object::Reference(id) => pdf.get_dictionary(*id).ok(),
        Object::Dictionary(dict) => Some(dict),
        _ => None,
    }
}

fn info_string(info: &Dictionary, key: &[u8]) -> Option<String> {
    let raw = match info.get(key).ok()? {
        Object::String(bytes, _) => bytes,
        _ => return None,
    };

    let decoded = match raw.strip_prefix(&[0xfe_u8, 0xff][..]) {
        Some(utf16) => {
            let units = utf16
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect::<Vec<_>>();
            String::from_utf16_lossy(&units)
        }
        None => String::from_utf8_lossy(raw).into_owned(),
    };

    let trimmed = decoded.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn unsupported(source_name: &str, reason: &str) -> IngestError {
    IngestError::UnsupportedFormat {
        source_name: source_name.to_string(),
        reason: reason.to_string(),
    }
}
