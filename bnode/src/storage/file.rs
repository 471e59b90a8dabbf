//! File-backed node store.
//!
//! Every tree lives in its own file `tree-XXXXXXXX.bnode` inside the store
//! directory; node `n` occupies bytes `n * node_size .. (n + 1) * node_size`.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::storage::node::NodeId;
use crate::storage::store::{NodeStore, StoreError, TreeId};

/// A directory of per-tree node files.
pub struct FileStore {
    dir: PathBuf,
    files: Mutex<HashMap<TreeId, File>>,
}

impl FileStore {
    /// Open (or create) a store rooted at `dir`.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            files: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file holding `tree`.
    #[must_use]
    pub fn tree_path(&self, tree: TreeId) -> PathBuf {
        self.dir.join(format!("tree-{tree:08x}.bnode"))
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TreeId, File>> {
        self.files.lock().expect("lock poisoned")
    }

    fn file_for<'a>(
        &self,
        files: &'a mut HashMap<TreeId, File>,
        tree: TreeId,
    ) -> Result<&'a mut File, StoreError> {
        if !files.contains_key(&tree) {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(self.tree_path(tree))?;
            files.insert(tree, file);
        }
        files
            .get_mut(&tree)
            .ok_or(StoreError::Missing { tree, node: 0 })
    }
}

impl NodeStore for FileStore {
    fn read_or_create(
        &self,
        tree: TreeId,
        node: NodeId,
        count: u32,
        node_size: usize,
        create: bool,
    ) -> Result<Vec<u8>, StoreError> {
        let mut files = self.lock();
        let file = self.file_for(&mut files, tree)?;
        let file_len = file.metadata()?.len();

        let mut buffer = vec![0u8; node_size * count as usize];
        for (i, chunk) in buffer.chunks_mut(node_size).enumerate() {
            let id = node + i as NodeId;
            let offset = u64::from(id) * node_size as u64;
            if offset + node_size as u64 > file_len {
                if create {
                    continue;
                }
                return Err(StoreError::Missing { tree, node: id });
            }
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(chunk)?;
        }
        Ok(buffer)
    }

    fn write_back(&self, tree: TreeId, node: NodeId, data: &[u8]) -> Result<(), StoreError> {
        let mut files = self.lock();
        let file = self.file_for(&mut files, tree)?;
        let offset = u64::from(node) * data.len() as u64;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn sync(&self) -> Result<(), StoreError> {
        let files = self.lock();
        for file in files.values() {
            file.sync_all()?;
        }
        Ok(())
    }
}
