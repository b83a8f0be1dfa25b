//! On-disk mirror of a box's files, used as the terminals' working directory.

use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

/// A directory holding one box's files at their box-relative paths.
pub struct Projection {
    root: PathBuf,
}

impl Projection {
    /// Create (or reuse) the mirror directory at `root`.
    pub async fn create(root: PathBuf) -> io::Result<Self> {
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path for a box-relative path. Rejects anything that could
    /// escape the mirror root.
    pub fn resolve(&self, rel: &str) -> io::Result<PathBuf> {
        let rel = Path::new(rel);
        let safe = rel.components().all(|c| matches!(c, Component::Normal(_)));
        if !safe || rel.as_os_str().is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsafe projection path {}", rel.display()),
            ));
        }
        Ok(self.root.join(rel))
    }

    pub async fn write_file(&self, rel: &str, contents: &str) -> io::Result<()> {
        let path = self.resolve(rel)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, contents).await
    }

    pub async fn create_dir(&self, rel: &str) -> io::Result<()> {
        tokio::fs::create_dir_all(self.resolve(rel)?).await
    }

    pub async fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        let from = self.resolve(from)?;
        let to = self.resolve(to)?;
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        ignore_missing(tokio::fs::rename(from, to).await)
    }

    pub async fn remove_file(&self, rel: &str) -> io::Result<()> {
        ignore_missing(tokio::fs::remove_file(self.resolve(rel)?).await)
    }

    pub async fn remove_dir(&self, rel: &str) -> io::Result<()> {
        ignore_missing(tokio::fs::remove_dir_all(self.resolve(rel)?).await)
    }

    /// Remove the whole mirror.
    pub async fn destroy(self) -> io::Result<()> {
        debug!(root = %self.root.display(), "removing projection");
        ignore_missing(tokio::fs::remove_dir_all(&self.root).await)
    }
}

fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mirrors_file_operations() {
        let dir = tempfile::tempdir().unwrap();
        let projection = Projection::create(dir.path().join("b1")).await.unwrap();

        projection.write_file("src/a.ts", "let a;").await.unwrap();
        let path = dir.path().join("b1/src/a.ts");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "let a;");

        projection.rename("src/a.ts", "lib/b.ts").await.unwrap();
        assert!(!path.exists());
        assert!(dir.path().join("b1/lib/b.ts").exists());

        projection.remove_file("missing.ts").await.unwrap();
        projection.remove_dir("lib").await.unwrap();
        assert!(!dir.path().join("b1/lib").exists());

        projection.destroy().await.unwrap();
        assert!(!dir.path().join("b1").exists());
    }

    #[tokio::test]
    async fn rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let projection = Projection::create(dir.path().join("b1")).await.unwrap();
        assert!(projection.write_file("../evil.sh", "x").await.is_err());
        assert!(projection.resolve("/etc/passwd").is_err());
        assert!(projection.resolve("").is_err());
    }
}
