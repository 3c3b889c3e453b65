// COCO Engine — Workspace Layout & Atomic Writes
//
// Provides:
//   - The on-disk layout of the persistent workspace
//   - Atomic file replacement (write temp, fsync, rename)
//   - Path validation to prevent workspace escapes by filesystem tools

use crate::atoms::error::CoreResult;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Resolved paths for everything the engine persists.
///
/// ```text
/// <workspace>/
///   COCO.md
///   USER_PROFILE.md
///   previous_conversation.md
///   episodes.db
///   facts.db
///   semantic/index.db
///   summaries.json
///   .coco_history
/// ```
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    root: PathBuf,
}

impl WorkspacePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        WorkspacePaths { root: root.into() }
    }

    /// Create the workspace directory tree if it does not exist.
    pub fn ensure(&self) -> CoreResult<()> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(self.semantic_dir())?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn identity_file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn episodes_db(&self) -> PathBuf {
        self.root.join("episodes.db")
    }

    pub fn facts_db(&self) -> PathBuf {
        self.root.join("facts.db")
    }

    pub fn semantic_dir(&self) -> PathBuf {
        self.root.join("semantic")
    }

    pub fn semantic_index_db(&self) -> PathBuf {
        self.semantic_dir().join("index.db")
    }

    pub fn summaries_json(&self) -> PathBuf {
        self.root.join("summaries.json")
    }

    pub fn history_file(&self) -> PathBuf {
        self.root.join(".coco_history")
    }
}

/// Atomically replace `path` with `content`: write to a sibling temp file,
/// fsync it, then rename over the target. Readers never observe a partial
/// file.
pub fn atomic_write(path: &Path, content: &str) -> CoreResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| format!("no parent directory for {:?}", path))?;
    fs::create_dir_all(parent)?;

    let tmp = parent.join(format!(
        ".{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "coco-write".into())
    ));
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(content.as_bytes())?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Validate that a filesystem path stays within the workspace root.
/// Returns the resolved path if valid, an error message if it escapes.
pub fn validate_path(requested: &str, workspace_root: &Path) -> Result<PathBuf, String> {
    let path = Path::new(requested);

    let absolute = if path.is_relative() {
        workspace_root.join(path)
    } else {
        path.to_path_buf()
    };

    // Canonicalize to resolve symlinks and `..` components. For files that do
    // not exist yet, canonicalize the parent and re-append the file name.
    let canonical = if absolute.exists() {
        absolute
            .canonicalize()
            .map_err(|e| format!("Cannot resolve path '{}': {}", requested, e))?
    } else {
        let parent = absolute.parent().unwrap_or(workspace_root);
        if !parent.exists() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create parent directories: {}", e))?;
        }
        let parent_canonical = parent
            .canonicalize()
            .map_err(|e| format!("Cannot resolve parent dir: {}", e))?;
        parent_canonical.join(absolute.file_name().unwrap_or_default())
    };

    let workspace_canonical = workspace_root
        .canonicalize()
        .map_err(|e| format!("Cannot resolve workspace root {:?}: {}", workspace_root, e))?;

    if canonical.starts_with(&workspace_canonical) {
        Ok(canonical)
    } else {
        Err(format!(
            "Path '{}' escapes the workspace. Access denied.",
            requested
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("COCO.md");

        atomic_write(&target, "first").unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "first");

        atomic_write(&target, "second").unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "second");

        // No temp residue
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn validate_path_rejects_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        assert!(validate_path("notes.txt", root).is_ok());
        assert!(validate_path("sub/dir/notes.txt", root).is_ok());
        assert!(validate_path("../outside.txt", root).is_err());
        assert!(validate_path("/etc/passwd", root).is_err());
    }

    #[test]
    fn workspace_layout_paths() {
        let paths = WorkspacePaths::new("/tmp/ws");
        assert!(paths.episodes_db().ends_with("episodes.db"));
        assert!(paths.semantic_index_db().ends_with("semantic/index.db"));
        assert!(paths.history_file().ends_with(".coco_history"));
    }
}
