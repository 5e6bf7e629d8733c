use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use walkdir::WalkDir;

use crate::document::{DocumentLoader, SourceDocument};

/// A candidate file discovered for processing.
#[derive(Debug, Clone)]
pub struct DocumentEntry {
    pub path: PathBuf,
    pub name: String,
    pub size_bytes: u64,
    pub modified: Option<SystemTime>,
}

impl DocumentEntry {
    pub fn from_path(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path)
            .context(format!("Failed to stat file: {:?}", path))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        Ok(Self {
            path: path.to_path_buf(),
            name,
            size_bytes: metadata.len(),
            modified: metadata.modified().ok(),
        })
    }

    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.name.clone())
    }

    /// Stable key from file name, size and modification time.
    ///
    /// Content is not hashed: a file rewritten with identical size and mtime
    /// keeps its old fingerprint.
    pub fn fingerprint(&self) -> String {
        let modified_nanos = self
            .modified
            .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);

        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(self.size_bytes.to_string().as_bytes());
        hasher.update(modified_nanos.to_string().as_bytes());
        let result = hasher.finalize();
        hex::encode(&result[..16])
    }
}

pub struct FileReader;

impl FileReader {
    /// List supported documents directly inside `dir`, ordered by file name.
    pub fn list_documents(dir: &Path) -> Result<Vec<DocumentEntry>> {
        let mut entries = Vec::new();

        for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
            let entry = entry.context(format!("Failed to read directory: {:?}", dir))?;
            let path = entry.path();

            if path.is_file() && Self::is_supported(path) {
                entries.push(DocumentEntry::from_path(path)?);
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub async fn read_document(entry: &DocumentEntry) -> Result<SourceDocument> {
        let extension = Self::extension(&entry.path);

        match extension.as_str() {
            "pdf" => {
                let bytes = fs::read(&entry.path)
                    .await
                    .context(format!("Failed to read file: {:?}", entry.path))?;
                SourceDocument::from_pdf_bytes(&entry.name, &bytes)
            }
            "txt" => {
                let content = fs::read_to_string(&entry.path)
                    .await
                    .context(format!("Failed to read file: {:?}", entry.path))?;
                Ok(SourceDocument::from_text(&entry.name, &content))
            }
            _ => anyhow::bail!("Unsupported file format: {}", extension),
        }
    }

    fn is_supported(path: &Path) -> bool {
        matches!(Self::extension(path).as_str(), "pdf" | "txt")
    }

    fn extension(path: &Path) -> String {
        path.extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase()
    }
}

/// Loads documents from the local filesystem.
pub struct FileLoader;

#[async_trait]
impl DocumentLoader for FileLoader {
    async fn load(&self, entry: &DocumentEntry) -> Result<SourceDocument> {
        FileReader::read_document(entry).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_documents_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.PDF"), b"%PDF").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"text").unwrap();
        std::fs::write(dir.path().join("notes.md"), b"skip").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("c.pdf"), b"%PDF").unwrap();

        let entries = FileReader::list_documents(dir.path()).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();

        assert_eq!(names, vec!["a.txt", "b.PDF"]);
        assert_eq!(entries[0].size_bytes, 4);
        assert_eq!(entries[0].stem(), "a");
    }

    #[test]
    fn test_fingerprint_tracks_size_and_name() {
        let base = DocumentEntry {
            path: PathBuf::from("/tmp/paper.pdf"),
            name: "paper.pdf".to_string(),
            size_bytes: 100,
            modified: Some(UNIX_EPOCH),
        };
        let resized = DocumentEntry { size_bytes: 101, ..base.clone() };

        assert_eq!(base.fingerprint(), base.clone().fingerprint());
        assert_ne!(base.fingerprint(), resized.fingerprint());
        assert_eq!(base.fingerprint().len(), 32);
    }

    #[tokio::test]
    async fn test_text_document_loads_through_loader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paper.txt");
        std::fs::write(&path, "page one\u{c}page two").unwrap();

        let entry = DocumentEntry::from_path(&path).unwrap();
        let document = FileLoader.load(&entry).await.unwrap();

        assert_eq!(document.page_count(), 2);
        assert_eq!(document.name(), "paper.txt");
    }
}
