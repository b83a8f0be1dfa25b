//! Building and editing a box's nested file tree from flat object keys.

use tracing::warn;
use vbox_protocol::{FileId, FileNode, paths};

/// Build the tree of `box_id` from listed object keys.
///
/// Returns the children of the box root and the ids of every file, in listing
/// order. A segment is a file iff it is the last one of its key and contains a
/// `.`; every other segment is a folder. Keys outside the box are skipped.
pub fn build_tree<'a>(
    box_id: &str,
    keys: impl IntoIterator<Item = &'a str>,
) -> (Vec<FileNode>, Vec<FileId>) {
    let root_id = paths::box_root(box_id);
    let mut nodes = Vec::new();
    let mut files = Vec::new();
    for key in keys {
        let Some(rel) = paths::relative_path(box_id, key) else {
            continue;
        };
        let parts: Vec<&str> = rel.split('/').filter(|p| !p.is_empty()).collect();
        insert_parts(&mut nodes, &root_id, &parts, key, &mut files);
    }
    (nodes, files)
}

fn insert_parts(
    nodes: &mut Vec<FileNode>,
    parent_id: &str,
    parts: &[&str],
    key: &str,
    files: &mut Vec<FileId>,
) {
    let Some((part, rest)) = parts.split_first() else {
        return;
    };
    let is_file = rest.is_empty() && part.contains('.');
    let node_id = paths::child_id(parent_id, part);

    match nodes.iter_mut().find(|n| n.name() == *part) {
        Some(FileNode::Folder { children, .. }) if !is_file => {
            insert_parts(children, &node_id, rest, key, files);
        }
        Some(existing) => {
            if existing.is_folder() != is_file {
                return;
            }
            warn!(key, existing = existing.id(), "object key collides with tree node, skipping");
        }
        None if is_file => {
            nodes.push(FileNode::file(key, *part));
            files.push(key.to_string());
        }
        None => {
            let mut children = Vec::new();
            insert_parts(&mut children, &node_id, rest, key, files);
            nodes.push(FileNode::Folder {
                id: node_id,
                name: part.to_string(),
                children,
            });
        }
    }
}

/// Children of `folder_id`, where `root_id` names the top level.
pub fn children_mut<'a>(
    nodes: &'a mut Vec<FileNode>,
    root_id: &str,
    folder_id: &str,
) -> Option<&'a mut Vec<FileNode>> {
    if folder_id == root_id {
        return Some(nodes);
    }
    find_children_mut(nodes, folder_id)
}

fn find_children_mut<'a>(
    nodes: &'a mut Vec<FileNode>,
    folder_id: &str,
) -> Option<&'a mut Vec<FileNode>> {
    for node in nodes.iter_mut() {
        if let FileNode::Folder { id, children, .. } = node {
            if id.as_str() == folder_id {
                return Some(children);
            }
            if is_ancestor(id, folder_id) {
                return find_children_mut(children, folder_id);
            }
        }
    }
    None
}

pub fn find<'a>(nodes: &'a [FileNode], id: &str) -> Option<&'a FileNode> {
    for node in nodes {
        if node.id() == id {
            return Some(node);
        }
        if let FileNode::Folder { id: folder, children, .. } = node
            && is_ancestor(folder, id)
        {
            return find(children, id);
        }
    }
    None
}

/// Detach the node `id` (with its subtree) from the tree.
pub fn remove(nodes: &mut Vec<FileNode>, id: &str) -> Option<FileNode> {
    if let Some(pos) = nodes.iter().position(|n| n.id() == id) {
        return Some(nodes.remove(pos));
    }
    for node in nodes.iter_mut() {
        if let FileNode::Folder { id: folder, children, .. } = node
            && is_ancestor(folder, id)
        {
            return remove(children, id);
        }
    }
    None
}

/// Add `node` under `parent_id`. Fails if the parent is unknown.
pub fn insert(nodes: &mut Vec<FileNode>, root_id: &str, parent_id: &str, node: FileNode) -> bool {
    match children_mut(nodes, root_id, parent_id) {
        Some(children) => {
            children.push(node);
            true
        }
        None => false,
    }
}

/// True if `candidate` lies strictly beneath `folder`.
pub fn is_ancestor(folder: &str, candidate: &str) -> bool {
    candidate
        .strip_prefix(folder)
        .is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_nested_tree_from_keys() {
        let keys = [
            "projects/b1/index.html",
            "projects/b1/src/app.ts",
            "projects/b1/src/lib/util.ts",
            "projects/b2/other.ts",
        ];
        let (nodes, files) = build_tree("b1", keys);
        assert_eq!(
            files,
            vec![
                "projects/b1/index.html",
                "projects/b1/src/app.ts",
                "projects/b1/src/lib/util.ts"
            ]
        );
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0], FileNode::file("projects/b1/index.html", "index.html"));
        match &nodes[1] {
            FileNode::Folder { id, name, children } => {
                assert_eq!(id, "projects/b1/src");
                assert_eq!(name, "src");
                assert_eq!(children[0].id(), "projects/b1/src/app.ts");
                assert_eq!(children[1].id(), "projects/b1/src/lib");
                assert!(children[1].is_folder());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn dotless_last_segment_is_folder() {
        let (nodes, files) = build_tree("b1", ["projects/b1/Makefile"]);
        assert!(files.is_empty());
        assert_eq!(nodes[0], FileNode::folder("projects/b1/Makefile", "Makefile"));
    }

    #[test]
    fn ignores_keys_from_other_boxes_and_duplicates() {
        let (nodes, files) = build_tree(
            "b1",
            ["projects/b1/a.ts", "projects/b1/a.ts", "projects/b10/x.ts", "other/b1/y.ts"],
        );
        assert_eq!(files, vec!["projects/b1/a.ts"]);
        assert_eq!(nodes.len(), 1);
    }

    #[test]
    fn find_insert_and_remove() {
        let root = "projects/b1";
        let (mut nodes, _) = build_tree("b1", ["projects/b1/src/lib/util.ts"]);
        assert!(insert(
            &mut nodes,
            root,
            "projects/b1/src/lib",
            FileNode::file("projects/b1/src/lib/more.ts", "more.ts"),
        ));
        assert!(find(&nodes, "projects/b1/src/lib/more.ts").is_some());
        assert!(!insert(&mut nodes, root, "projects/b1/nope", FileNode::file("x", "x")));

        let removed = remove(&mut nodes, "projects/b1/src/lib").unwrap();
        assert!(removed.is_folder());
        assert!(find(&nodes, "projects/b1/src/lib/util.ts").is_none());
        assert!(find(&nodes, "projects/b1/src").is_some());
    }

    #[test]
    fn ancestor_requires_separator() {
        assert!(is_ancestor("projects/b1/src", "projects/b1/src/a.ts"));
        assert!(!is_ancestor("projects/b1/src", "projects/b1/src2/a.ts"));
        assert!(!is_ancestor("projects/b1/src", "projects/b1/src"));
    }
}
