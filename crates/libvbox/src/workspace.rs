//! Per-box cache of the file tree and file contents, written through to storage.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};
use vbox_protocol::{BoxId, FileId, FileNode, paths};

use crate::error::VboxError;
use crate::projection::Projection;
use crate::store::{ObjectStore, prefix_size};
use crate::tree;
use crate::writer::{StoreWrite, StoreWriter, settle};

/// Largest body accepted by a save.
pub const DEFAULT_MAX_SAVE_BYTES: usize = 5 * 1024 * 1024;
/// Largest total size of a box's objects before creation is refused.
pub const DEFAULT_QUOTA_BYTES: u64 = 200 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct WorkspaceOptions {
    pub quota_bytes: u64,
    /// Parent directory of on-disk mirrors. `None` disables mirroring.
    pub projection_root: Option<PathBuf>,
}

impl Default for WorkspaceOptions {
    fn default() -> Self {
        Self {
            quota_bytes: DEFAULT_QUOTA_BYTES,
            projection_root: None,
        }
    }
}

/// Cached state of one box.
///
/// Every mutation updates the cache first and enqueues the matching storage
/// write on the box's ordered writer. Saves are fire-and-forget; structural
/// changes wait for storage before they touch the tree.
pub struct WorkspaceCache {
    box_id: BoxId,
    root_id: FileId,
    store: Arc<dyn ObjectStore>,
    writer: StoreWriter,
    files: Vec<FileNode>,
    file_ids: BTreeSet<FileId>,
    contents: HashMap<FileId, String>,
    pending_deletes: BTreeSet<FileId>,
    quota_bytes: u64,
    loaded_size: u64,
    projection: Option<Projection>,
}

impl WorkspaceCache {
    /// List the box from storage and build its tree. With a projection root
    /// configured, also fetch every file and mirror it to disk.
    pub async fn load(
        box_id: &str,
        store: Arc<dyn ObjectStore>,
        options: WorkspaceOptions,
    ) -> Result<Self, VboxError> {
        let objects = store.list(&paths::box_prefix(box_id)).await?;
        let (files, ids) = tree::build_tree(box_id, objects.iter().map(|o| o.key.as_str()));
        let loaded_size: u64 = objects.iter().map(|o| o.size).sum();
        info!(box_id, files = ids.len(), bytes = loaded_size, "workspace loaded");

        let mut cache = Self {
            box_id: box_id.to_string(),
            root_id: paths::box_root(box_id),
            writer: StoreWriter::spawn(box_id.to_string(), store.clone()),
            store,
            files,
            file_ids: ids.into_iter().collect(),
            contents: HashMap::new(),
            pending_deletes: BTreeSet::new(),
            quota_bytes: options.quota_bytes,
            loaded_size,
            projection: None,
        };
        if let Some(root) = options.projection_root {
            let projection = Projection::create(root.join(box_id)).await?;
            cache.materialize(&projection).await?;
            cache.projection = Some(projection);
        }
        Ok(cache)
    }

    pub fn box_id(&self) -> &str {
        &self.box_id
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    /// Children of the box root.
    pub fn files(&self) -> &[FileNode] {
        &self.files
    }

    pub fn file_ids(&self) -> impl Iterator<Item = &FileId> {
        self.file_ids.iter()
    }

    pub fn contains_file(&self, id: &str) -> bool {
        self.file_ids.contains(id)
    }

    pub fn is_cached(&self, id: &str) -> bool {
        self.contents.contains_key(id)
    }

    /// Summed object size as listed at load time.
    pub fn loaded_size(&self) -> u64 {
        self.loaded_size
    }

    /// Ids queued for deletion but not yet acknowledged by storage.
    pub fn pending_deletes(&self) -> &BTreeSet<FileId> {
        &self.pending_deletes
    }

    /// Directory mirroring the box, if mirroring is enabled.
    pub fn working_dir(&self) -> Option<&Path> {
        self.projection.as_ref().map(|p| p.root())
    }

    pub async fn get_file(&mut self, id: &str) -> Result<String, VboxError> {
        if let Some(body) = self.contents.get(id) {
            return Ok(body.clone());
        }
        if !paths::is_within_box(&self.box_id, id) {
            return Err(VboxError::FileNotFound(id.to_string()));
        }
        let body = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| VboxError::FileNotFound(id.to_string()))?;
        self.contents.insert(id.to_string(), body.clone());
        Ok(body)
    }

    pub async fn save_file(&mut self, id: &str, body: String) -> Result<(), VboxError> {
        if !self.file_ids.contains(id) {
            return Err(VboxError::FileNotFound(id.to_string()));
        }
        self.mirror_write(id, &body).await;
        self.contents.insert(id.to_string(), body.clone());
        self.writer.enqueue(StoreWrite::Put {
            key: id.to_string(),
            body,
        });
        debug!(box_id = %self.box_id, id, "file saved");
        Ok(())
    }

    /// Create an empty file under the box root. Creating an existing file is a no-op.
    pub async fn create_file(&mut self, name: &str) -> Result<FileId, VboxError> {
        let id = self.root_child(name)?;
        if self.file_ids.contains(&id) {
            return Ok(id);
        }
        if tree::find(&self.files, &id).is_some() {
            return Err(VboxError::InvalidRequest(format!("{name} is a folder")));
        }
        self.ensure_within_quota().await?;
        self.writer
            .write(StoreWrite::Put {
                key: id.clone(),
                body: String::new(),
            })
            .await?;

        self.files.push(FileNode::file(id.as_str(), name));
        self.file_ids.insert(id.clone());
        self.contents.insert(id.clone(), String::new());
        self.mirror_write(&id, "").await;
        info!(box_id = %self.box_id, id, "file created");
        Ok(id)
    }

    /// Create an empty folder under the box root. Folders exist only in the
    /// tree until a file is stored beneath them.
    pub async fn create_folder(&mut self, name: &str) -> Result<FileId, VboxError> {
        let id = self.root_child(name)?;
        match tree::find(&self.files, &id) {
            Some(node) if node.is_folder() => return Ok(id),
            Some(_) => return Err(VboxError::InvalidRequest(format!("{name} is a file"))),
            None => {}
        }
        self.ensure_within_quota().await?;
        self.files.push(FileNode::folder(id.as_str(), name));
        if let Some(rel) = paths::relative_path(&self.box_id, &id)
            && let Some(projection) = &self.projection
            && let Err(e) = projection.create_dir(rel).await
        {
            warn!(box_id = %self.box_id, id, "projection mkdir failed: {e}");
        }
        info!(box_id = %self.box_id, id, "folder created");
        Ok(id)
    }

    /// Rename a file within its folder. Returns the new id.
    pub async fn rename_file(&mut self, id: &str, new_name: &str) -> Result<FileId, VboxError> {
        validate_name(new_name)?;
        let parent = paths::parent_id(id).to_string();
        let new_id = paths::child_id(&parent, new_name);
        self.relocate(id, &parent, new_id).await
    }

    /// Move a file into `folder_id` (the box root id or an existing folder).
    pub async fn move_file(&mut self, id: &str, folder_id: &str) -> Result<FileId, VboxError> {
        self.check_move(id, folder_id)?;
        let new_id = paths::child_id(folder_id, paths::file_name(id));
        self.relocate(id, folder_id, new_id).await
    }

    /// Checks a move target without touching storage.
    pub fn check_move(&self, id: &str, folder_id: &str) -> Result<(), VboxError> {
        if !self.file_ids.contains(id) {
            return Err(VboxError::FileNotFound(id.to_string()));
        }
        let known_folder = folder_id == self.root_id
            || tree::find(&self.files, folder_id).is_some_and(FileNode::is_folder);
        if !known_folder {
            return Err(VboxError::FileNotFound(folder_id.to_string()));
        }
        Ok(())
    }

    async fn relocate(&mut self, id: &str, parent: &str, new_id: FileId) -> Result<FileId, VboxError> {
        if !self.file_ids.contains(id) {
            return Err(VboxError::FileNotFound(id.to_string()));
        }
        if new_id == id {
            return Ok(new_id);
        }
        if tree::find(&self.files, &new_id).is_some() {
            return Err(VboxError::InvalidRequest(format!("{new_id} already exists")));
        }
        let body = self.get_file(id).await?;
        let delete = self.writer.submit(StoreWrite::Delete { key: id.to_string() });
        let put = self.writer.submit(StoreWrite::Put {
            key: new_id.clone(),
            body: body.clone(),
        });
        settle(delete).await?;
        settle(put).await?;

        tree::remove(&mut self.files, id);
        tree::insert(
            &mut self.files,
            &self.root_id,
            parent,
            FileNode::file(new_id.as_str(), paths::file_name(&new_id)),
        );
        self.file_ids.remove(id);
        self.file_ids.insert(new_id.clone());
        self.contents.remove(id);
        self.contents.insert(new_id.clone(), body);

        if let Some(projection) = &self.projection
            && let (Some(from), Some(to)) = (
                paths::relative_path(&self.box_id, id),
                paths::relative_path(&self.box_id, &new_id),
            )
            && let Err(e) = projection.rename(from, to).await
        {
            warn!(box_id = %self.box_id, id, "projection rename failed: {e}");
        }
        info!(box_id = %self.box_id, from = id, to = %new_id, "file relocated");
        Ok(new_id)
    }

    pub async fn delete_file(&mut self, id: &str) -> Result<(), VboxError> {
        if !self.file_ids.contains(id) {
            return Err(VboxError::FileNotFound(id.to_string()));
        }
        self.pending_deletes.insert(id.to_string());
        let result = self.writer.write(StoreWrite::Delete { key: id.to_string() }).await;
        self.pending_deletes.remove(id);
        result?;
        self.forget_file(id).await;
        info!(box_id = %self.box_id, id, "file deleted");
        Ok(())
    }

    /// Ids of all files under `folder_id`, from storage plus the cache.
    pub async fn folder_files(&self, folder_id: &str) -> Result<Vec<FileId>, VboxError> {
        if !paths::is_within_box(&self.box_id, folder_id) {
            return Err(VboxError::FileNotFound(folder_id.to_string()));
        }
        let prefix = format!("{}/", folder_id.trim_end_matches('/'));
        let mut ids: BTreeSet<FileId> = self
            .store
            .list(&prefix)
            .await?
            .into_iter()
            .map(|o| o.key)
            .collect();
        ids.extend(
            self.file_ids
                .iter()
                .filter(|id| tree::is_ancestor(folder_id, id))
                .cloned(),
        );
        Ok(ids.into_iter().collect())
    }

    /// First half of a folder delete: collect the folder's files and mark them
    /// pending. Unknown folders fail with `FileNotFound`.
    pub async fn prepare_folder_delete(&mut self, folder_id: &str) -> Result<Vec<FileId>, VboxError> {
        if folder_id == self.root_id {
            return Err(VboxError::InvalidRequest("cannot delete the box root".into()));
        }
        let ids = self.folder_files(folder_id).await?;
        let known = tree::find(&self.files, folder_id).is_some_and(FileNode::is_folder);
        if !known && ids.is_empty() {
            return Err(VboxError::FileNotFound(folder_id.to_string()));
        }
        self.pending_deletes.extend(ids.iter().cloned());
        Ok(ids)
    }

    /// Second half of a folder delete: issue every delete, then drop acknowledged
    /// files from the cache. The folder node is removed only if all succeeded.
    pub async fn finish_folder_delete(
        &mut self,
        folder_id: &str,
        ids: Vec<FileId>,
    ) -> Result<(), VboxError> {
        let pending: Vec<_> = ids
            .iter()
            .map(|id| (id.clone(), self.writer.submit(StoreWrite::Delete { key: id.clone() })))
            .collect();

        let mut failed = 0usize;
        for (id, ack) in pending {
            self.pending_deletes.remove(&id);
            match settle(ack).await {
                Ok(()) => self.forget_file(&id).await,
                Err(e) => {
                    warn!(box_id = %self.box_id, id, "folder member delete failed: {e}");
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            return Err(VboxError::UpstreamUnavailable(format!(
                "failed to delete {failed} of {} files under {folder_id}",
                ids.len()
            )));
        }

        tree::remove(&mut self.files, folder_id);
        if let Some(rel) = paths::relative_path(&self.box_id, folder_id)
            && let Some(projection) = &self.projection
            && let Err(e) = projection.remove_dir(rel).await
        {
            warn!(box_id = %self.box_id, folder_id, "projection rmdir failed: {e}");
        }
        info!(box_id = %self.box_id, folder_id, files = ids.len(), "folder deleted");
        Ok(())
    }

    /// Total stored bytes of the box.
    pub async fn box_size(&self) -> Result<u64, VboxError> {
        prefix_size(self.store.as_ref(), &paths::box_prefix(&self.box_id)).await
    }

    async fn ensure_within_quota(&self) -> Result<(), VboxError> {
        let used = self.box_size().await?;
        if used > self.quota_bytes {
            return Err(VboxError::ProjectQuota {
                used,
                limit: self.quota_bytes,
            });
        }
        Ok(())
    }

    /// Drop derived state. Queued saves still reach storage.
    pub async fn release(mut self) {
        if let Some(projection) = self.projection.take()
            && let Err(e) = projection.destroy().await
        {
            warn!(box_id = %self.box_id, "projection cleanup failed: {e}");
        }
        info!(box_id = %self.box_id, "workspace released");
    }

    fn root_child(&self, name: &str) -> Result<FileId, VboxError> {
        validate_name(name)?;
        Ok(paths::child_id(&self.root_id, name))
    }

    async fn forget_file(&mut self, id: &str) {
        tree::remove(&mut self.files, id);
        self.file_ids.remove(id);
        self.contents.remove(id);
        if let Some(rel) = paths::relative_path(&self.box_id, id)
            && let Some(projection) = &self.projection
            && let Err(e) = projection.remove_file(rel).await
        {
            warn!(box_id = %self.box_id, id, "projection remove failed: {e}");
        }
    }

    async fn mirror_write(&self, id: &str, body: &str) {
        if let Some(rel) = paths::relative_path(&self.box_id, id)
            && let Some(projection) = &self.projection
            && let Err(e) = projection.write_file(rel, body).await
        {
            warn!(box_id = %self.box_id, id, "projection write failed: {e}");
        }
    }

    async fn materialize(&mut self, projection: &Projection) -> Result<(), VboxError> {
        let ids: Vec<FileId> = self.file_ids.iter().cloned().collect();
        for id in ids {
            let Some(rel) = paths::relative_path(&self.box_id, &id).map(str::to_string) else {
                continue;
            };
            let body = match self.get_file(&id).await {
                Ok(body) => body,
                Err(VboxError::FileNotFound(_)) => {
                    warn!(box_id = %self.box_id, id, "listed file vanished before download");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if let Err(e) = projection.write_file(&rel, &body).await {
                warn!(box_id = %self.box_id, id, "projection write failed: {e}");
            }
        }
        let mut folders = Vec::new();
        collect_folders(&self.files, &mut folders);
        for folder in folders {
            if let Some(rel) = paths::relative_path(&self.box_id, &folder)
                && let Err(e) = projection.create_dir(rel).await
            {
                warn!(box_id = %self.box_id, folder, "projection mkdir failed: {e}");
            }
        }
        debug!(box_id = %self.box_id, root = %projection.root().display(), "projection ready");
        Ok(())
    }
}

/// A file or folder name must be a single path segment.
pub fn validate_name(name: &str) -> Result<(), VboxError> {
    if paths::is_valid_segment(name) {
        Ok(())
    } else {
        Err(VboxError::InvalidRequest(format!("invalid name {name:?}")))
    }
}

fn collect_folders(nodes: &[FileNode], out: &mut Vec<FileId>) {
    for node in nodes {
        if let FileNode::Folder { id, children, .. } = node {
            out.push(id.clone());
            collect_folders(children, out);
        }
    }
}
