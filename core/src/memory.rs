//! Memory bank: the shared markdown context handed to every task
//!
//! Tasks capture a snapshot of the core files at creation time; finished
//! tasks may send back replacement content per category and file label.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::task::{MemoryContext, MemoryUpdates};
use crate::{Error, Result};

/// Files included in every task's memory snapshot
pub const CORE_FILES: [&str; 3] = ["current.md", "next.md", "overview.md"];

const SEED_FILES: [(&str, &str, &str); 5] = [
    ("core", "current.md", "# Current task\n\n*No tasks yet*\n"),
    ("core", "next.md", "# Next steps\n\n*No next steps defined*\n"),
    ("core", "overview.md", "# Project overview\n\n*Describe the project here*\n"),
    ("context", "tech.md", "# Technical decisions\n\n*Record technical decisions here*\n"),
    ("context", "history.md", "# History\n\n*Record important changes here*\n"),
];

/// File-backed memory bank rooted at `.memento/memory`
#[derive(Debug, Clone)]
pub struct MemoryBank {
    dir: PathBuf,
}

impl MemoryBank {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Seed the default files that do not exist yet
    pub async fn initialize(&self) -> Result<()> {
        for (category, name, content) in SEED_FILES {
            let category_dir = self.dir.join(category);
            tokio::fs::create_dir_all(&category_dir).await?;
            let path = category_dir.join(name);
            if !tokio::fs::try_exists(&path).await? {
                tokio::fs::write(&path, content).await?;
            }
        }
        Ok(())
    }

    /// Read the core files into a context snapshot
    pub async fn snapshot(&self) -> MemoryContext {
        let mut context = MemoryContext::new();
        for name in CORE_FILES {
            let path = self.dir.join("core").join(name);
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => {
                    context.insert(name.to_string(), content);
                }
                Err(e) => warn!("Failed to read memory file {}: {}", path.display(), e),
            }
        }
        context
    }

    /// Write every update, skipping (and reporting) the invalid ones.
    ///
    /// Returns the number of files written.
    pub async fn apply_updates(&self, updates: &MemoryUpdates) -> usize {
        let mut written = 0;
        for (category, files) in updates {
            for (label, content) in files {
                match self.write_file(category, label, content).await {
                    Ok(()) => {
                        info!("Memory updated: {}/{}", category, label);
                        written += 1;
                    }
                    Err(e) => warn!("Rejected memory update {}/{}: {}", category, label, e),
                }
            }
        }
        written
    }

    async fn write_file(&self, category: &str, label: &str, content: &str) -> Result<()> {
        validate_segment(category)?;
        validate_segment(label)?;
        let dir = self.dir.join(category);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(label), content).await?;
        Ok(())
    }
}

fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty()
        || segment == "."
        || segment.contains("..")
        || segment.contains('/')
        || segment.contains('\\')
    {
        return Err(Error::InvalidInput(format!(
            "Invalid memory path segment: {:?}",
            segment
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_initialize_never_overwrites() {
        let temp = TempDir::new().unwrap();
        let bank = MemoryBank::new(temp.path());
        std::fs::create_dir_all(temp.path().join("core")).unwrap();
        std::fs::write(temp.path().join("core/current.md"), "mine").unwrap();

        bank.initialize().await.unwrap();

        assert_eq!(
            std::fs::read_to_string(temp.path().join("core/current.md")).unwrap(),
            "mine"
        );
        assert!(temp.path().join("context/history.md").exists());
    }

    #[tokio::test]
    async fn test_snapshot_reads_core_files() {
        let temp = TempDir::new().unwrap();
        let bank = MemoryBank::new(temp.path());
        bank.initialize().await.unwrap();

        let snapshot = bank.snapshot().await;
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot["overview.md"].starts_with("# Project overview"));
    }

    #[tokio::test]
    async fn test_apply_updates_rejects_traversal() {
        let temp = TempDir::new().unwrap();
        let bank = MemoryBank::new(temp.path().join("memory"));

        let updates = MemoryUpdates::from([
            (
                "core".to_string(),
                BTreeMap::from([("current.md".to_string(), "# Now".to_string())]),
            ),
            (
                "..".to_string(),
                BTreeMap::from([("escape.md".to_string(), "nope".to_string())]),
            ),
        ]);

        assert_eq!(bank.apply_updates(&updates).await, 1);
        assert_eq!(
            std::fs::read_to_string(temp.path().join("memory/core/current.md")).unwrap(),
            "# Now"
        );
        assert!(!temp.path().join("escape.md").exists());
    }
}
