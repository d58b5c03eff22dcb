//! Background context gathered before drafting.
//!
//! Both stages are optional collaborators: a failure is logged by the
//! orchestrator and the run continues without that context.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::Result;

/// Supplies reference material for the drafting prompt.
#[async_trait]
pub trait KnowledgeSource: Send + Sync {
    async fn load(&self, spec_text: &str) -> Result<Option<String>>;
}

/// Supplies market or competitor research for the drafting prompt.
#[async_trait]
pub trait ResearchProvider: Send + Sync {
    async fn research(&self, spec_text: &str) -> Result<Option<String>>;
}

/// No knowledge configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoKnowledge;

#[async_trait]
impl KnowledgeSource for NoKnowledge {
    async fn load(&self, _spec_text: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// No research configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoResearch;

#[async_trait]
impl ResearchProvider for NoResearch {
    async fn research(&self, _spec_text: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Markdown files from one directory, concatenated in file-name order and
/// cut at a character budget.
#[derive(Debug, Clone)]
pub struct DirectoryKnowledge {
    dir: PathBuf,
    max_chars: usize,
}

impl DirectoryKnowledge {
    pub fn new(dir: impl AsRef<Path>, max_chars: usize) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            max_chars,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn markdown_files(&self) -> Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_markdown = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("md"));
            if is_markdown && entry.file_type().await?.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl KnowledgeSource for DirectoryKnowledge {
    async fn load(&self, _spec_text: &str) -> Result<Option<String>> {
        let mut combined = String::new();
        for path in self.markdown_files().await? {
            let content = tokio::fs::read_to_string(&path).await?;
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            combined.push_str(&format!("### {}\n\n{}\n\n", name, content.trim()));
        }

        let combined = truncate_chars(combined.trim_end(), self.max_chars);
        if combined.is_empty() {
            return Ok(None);
        }
        tracing::debug!(dir = %self.dir.display(), chars = combined.chars().count(), "Knowledge loaded");
        Ok(Some(combined))
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}
