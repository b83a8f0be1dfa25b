//! Object-key helpers. Every key of a box lives under `projects/{boxId}/`.

use std::path::PathBuf;

pub const PROJECTS_PREFIX: &str = "projects";

/// Id of the box root folder, e.g. `projects/b1`.
pub fn box_root(box_id: &str) -> String {
    format!("{PROJECTS_PREFIX}/{box_id}")
}

/// Listing prefix for every object of a box, e.g. `projects/b1/`.
pub fn box_prefix(box_id: &str) -> String {
    format!("{PROJECTS_PREFIX}/{box_id}/")
}

pub fn child_id(parent_id: &str, name: &str) -> String {
    format!("{}/{name}", parent_id.trim_end_matches('/'))
}

/// Id of the folder containing `id`.
pub fn parent_id(id: &str) -> &str {
    id.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

/// Last segment of `id`.
pub fn file_name(id: &str) -> &str {
    id.rsplit_once('/').map(|(_, name)| name).unwrap_or(id)
}

/// Path of `id` relative to its box root, or `None` if `id` is outside the box.
pub fn relative_path<'a>(box_id: &str, id: &'a str) -> Option<&'a str> {
    id.strip_prefix(PROJECTS_PREFIX)?
        .strip_prefix('/')?
        .strip_prefix(box_id)?
        .strip_prefix('/')
        .filter(|rest| !rest.is_empty())
}

/// True if `id` is the box root or lies beneath it.
pub fn is_within_box(box_id: &str, id: &str) -> bool {
    id == box_root(box_id) || relative_path(box_id, id).is_some()
}

/// A single, non-empty path segment without separators or dot-only names.
pub fn is_valid_segment(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

/// Returns the config/data directory path for vbox.
pub fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("vbox")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("vbox")
    } else {
        PathBuf::from("/tmp/vbox")
    }
}

/// Returns the config file path for the vbox server.
pub fn config_path() -> PathBuf {
    dirs_path().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_compose_and_split() {
        let root = box_root("b1");
        assert_eq!(root, "projects/b1");
        let src = child_id(&root, "src");
        let file = child_id(&src, "a.ts");
        assert_eq!(file, "projects/b1/src/a.ts");
        assert_eq!(parent_id(&file), "projects/b1/src");
        assert_eq!(file_name(&file), "a.ts");
    }

    #[test]
    fn relative_path_requires_matching_box() {
        assert_eq!(relative_path("b1", "projects/b1/src/a.ts"), Some("src/a.ts"));
        assert_eq!(relative_path("b1", "projects/b10/a.ts"), None);
        assert_eq!(relative_path("b1", "projects/b1"), None);
        assert!(is_within_box("b1", "projects/b1"));
        assert!(!is_within_box("b1", "projects/b2/a.ts"));
    }

    #[test]
    fn segment_validation() {
        assert!(is_valid_segment("index.ts"));
        assert!(!is_valid_segment(""));
        assert!(!is_valid_segment(".."));
        assert!(!is_valid_segment("a/b"));
    }
}
