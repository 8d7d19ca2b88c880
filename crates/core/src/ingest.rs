use crate::error::IngestError;
use crate::models::DocumentInput;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const SUPPORTED_EXTENSIONS: [&str; 4] = ["pdf", "txt", "md", "markdown"];

pub fn is_supported_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|supported| ext.eq_ignore_ascii_case(supported))
        })
}

/// Supported documents under `folder`, recursively, in sorted order.
pub fn discover_documents(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if entry.file_type().is_file() && is_supported_path(entry.path()) {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

/// Name used as the chunk source for a file on disk: its canonical path.
///
/// Every path-based entry point names a file this way, so the same file is one
/// source however it was reached and same-named files in different folders stay apart.
pub fn source_name_for(path: &Path) -> Result<String, IngestError> {
    let canonical = fs::canonicalize(path)?;
    if canonical.file_name().is_none() {
        return Err(IngestError::MissingFileName(format!(
            "path missing filename: {}",
            path.display()
        )));
    }
    Ok(canonical.to_string_lossy().replace('\\', "/"))
}

pub fn load_document(path: &Path) -> Result<DocumentInput, IngestError> {
    let source_name = source_name_for(path)?;
    let bytes = fs::read(path)?;
    Ok(DocumentInput::from_bytes(source_name, bytes))
}
