use std::path::{Path, PathBuf};
use tokio::fs;
use walkdir::WalkDir;

use crate::chunk::Document;
use crate::IngestError;

const SUPPORTED_EXTENSIONS: &[&str] = &["txt", "md"];

pub struct FileReader;

impl FileReader {
    pub async fn read_file(path: &Path) -> Result<String, IngestError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");

        if !SUPPORTED_EXTENSIONS.contains(&extension) {
            return Err(IngestError::Unreadable {
                path: path.display().to_string(),
                reason: format!("unsupported file format: {extension:?}"),
            });
        }

        fs::read_to_string(path)
            .await
            .map_err(|e| IngestError::Unreadable {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
    }

    /// Every supported file under `dir`, recursively, sorted by path so the
    /// seed order of a run does not depend on directory listing order.
    pub async fn read_directory(dir: &Path) -> Result<Vec<(String, String)>, IngestError> {
        let mut paths: Vec<PathBuf> = Vec::new();

        for entry in WalkDir::new(dir).follow_links(true) {
            let entry = entry.map_err(|e| IngestError::Unreadable {
                path: dir.display().to_string(),
                reason: e.to_string(),
            })?;
            let path = entry.path();
            let supported = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext));
            if entry.file_type().is_file() && supported {
                paths.push(path.to_path_buf());
            }
        }
        paths.sort();

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let content = Self::read_file(&path).await?;
            files.push((path.to_string_lossy().to_string(), content));
        }

        Ok(files)
    }

    /// Loads a file or a directory of files as documents.
    pub async fn load_documents(path: &Path) -> Result<Vec<Document>, IngestError> {
        let files = if path.is_dir() {
            Self::read_directory(path).await?
        } else {
            let content = Self::read_file(path).await?;
            vec![(path.to_string_lossy().to_string(), content)]
        };

        Ok(files
            .into_iter()
            .map(|(path, content)| Document::from_path(&path, content))
            .collect())
    }
}
