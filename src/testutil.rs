//! In-memory [`RemoteStore`] used across `client`/`cache`/`fs` unit tests so
//! none of them need a live network dependency. Test-only: not compiled into
//! the real binary.
use crate::client::RemoteStore;
use crate::error::RemoteError;
use crate::wire::{BlobDescriptor, Conflict, DirEntry, EntryKind, FileMeta, Space};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Read;

pub struct FakeRemote {
    pub files: RefCell<HashMap<String, Vec<u8>>>,
    pub folders: RefCell<HashSet<String>>,
    blobs: RefCell<HashMap<String, Vec<u8>>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self {
            files: RefCell::new(HashMap::new()),
            folders: RefCell::new(HashSet::from(["".to_string()])),
            blobs: RefCell::new(HashMap::new()),
        }
    }

    pub fn populate(&self, dir: &str, count: usize) {
        self.folders.borrow_mut().insert(dir.to_string());
        for i in 0..count {
            self.files.borrow_mut().insert(format!("{dir}/f{i:04}"), vec![]);
        }
    }

    fn children(&self, dir: &str) -> Vec<DirEntry> {
        let prefix = if dir.is_empty() { String::new() } else { format!("{dir}/") };
        let mut out = Vec::new();
        for (path, data) in self.files.borrow().iter() {
            if let Some(rest) = path.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') {
                    out.push(DirEntry {
                        name: rest.to_string(),
                        kind: EntryKind::File,
                        size: data.len() as u64,
                        mtime: 0,
                    });
                }
            }
        }
        for path in self.folders.borrow().iter() {
            if let Some(rest) = path.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') {
                    out.push(DirEntry { name: rest.to_string(), kind: EntryKind::Folder, size: 0, mtime: 0 });
                }
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteStore for FakeRemote {
    fn folder(&self, path: &str, page: u32) -> Result<(Vec<DirEntry>, u64, u64), RemoteError> {
        if !self.folders.borrow().contains(path) {
            return Err(RemoteError::NotFound);
        }
        let all = self.children(path);
        let files = all.iter().filter(|e| e.kind == EntryKind::File).count() as u64;
        let folders = all.iter().filter(|e| e.kind == EntryKind::Folder).count() as u64;
        const PAGE_SIZE: usize = 500;
        let start = page as usize * PAGE_SIZE;
        let end = (start + PAGE_SIZE).min(all.len());
        let page_entries = if start >= all.len() { vec![] } else { all[start..end].to_vec() };
        Ok((page_entries, files, folders))
    }

    fn file(&self, path: &str) -> Result<FileMeta, RemoteError> {
        if let Some(data) = self.files.borrow().get(path) {
            return Ok(FileMeta { kind: EntryKind::File, size: data.len() as u64, mtime: 0 });
        }
        if self.folders.borrow().contains(path) {
            return Ok(FileMeta { kind: EntryKind::Folder, size: 0, mtime: 0 });
        }
        Err(RemoteError::NotFound)
    }

    fn zip(&self, _paths: &[String]) -> Result<Vec<u8>, RemoteError> {
        Ok(vec![])
    }

    fn blob_upload(&self, mut source: File) -> Result<BlobDescriptor, RemoteError> {
        use std::io::{Seek, SeekFrom};
        source.seek(SeekFrom::Start(0)).unwrap();
        let mut data = Vec::new();
        source.read_to_end(&mut data).unwrap();
        let size = data.len() as u64;
        let hash = format!("fake:{}:{size}", self.blobs.borrow().len());
        self.blobs.borrow_mut().insert(hash.clone(), data);
        Ok(BlobDescriptor { hash, size })
    }

    fn file_add(&self, path: &str, blob: &BlobDescriptor, conflict: Conflict) -> Result<String, RemoteError> {
        if self.files.borrow().contains_key(path) && conflict == Conflict::Strict {
            return Err(RemoteError::AlreadyExists);
        }
        let data = self.blobs.borrow().get(&blob.hash).cloned().unwrap_or_default();
        self.files.borrow_mut().insert(path.to_string(), data);
        Ok(path.rsplit('/').next().unwrap_or(path).to_string())
    }

    fn file_move(&self, path: &str, target_dir: &str, conflict: Conflict) -> Result<(), RemoteError> {
        let name = path.rsplit('/').next().unwrap_or(path);
        let new_path = if target_dir.is_empty() { name.to_string() } else { format!("{target_dir}/{name}") };
        if self.files.borrow().contains_key(&new_path) && conflict == Conflict::Strict {
            return Err(RemoteError::AlreadyExists);
        }
        match self.files.borrow_mut().remove(path) {
            Some(data) => {
                self.files.borrow_mut().insert(new_path, data);
                Ok(())
            }
            None => Err(RemoteError::NotFound),
        }
    }

    fn file_remove(&self, path: &str) -> Result<(), RemoteError> {
        self.files.borrow_mut().remove(path);
        self.folders.borrow_mut().remove(path);
        Ok(())
    }

    fn folder_add(&self, path: &str, conflict: Conflict) -> Result<String, RemoteError> {
        if self.folders.borrow().contains(path) && conflict == Conflict::Strict {
            return Err(RemoteError::AlreadyExists);
        }
        self.folders.borrow_mut().insert(path.to_string());
        Ok(path.rsplit('/').next().unwrap_or(path).to_string())
    }

    fn file_rename(&self, path: &str, new_name: &str, _conflict: Conflict) -> Result<String, RemoteError> {
        let parent = path.rsplitn(2, '/').nth(1).unwrap_or("");
        let new_path = if parent.is_empty() { new_name.to_string() } else { format!("{parent}/{new_name}") };
        if let Some(data) = self.files.borrow_mut().remove(path) {
            self.files.borrow_mut().insert(new_path, data);
            return Ok(new_name.to_string());
        }
        Err(RemoteError::NotFound)
    }

    fn space(&self) -> Result<Space, RemoteError> {
        Ok(Space { total: 1_000_000, used: 1 })
    }

    fn get_file_reader(&self, path: &str) -> Result<Box<dyn Read + Send>, RemoteError> {
        match self.files.borrow().get(path) {
            Some(data) => Ok(Box::new(std::io::Cursor::new(data.clone()))),
            None => Err(RemoteError::NotFound),
        }
    }
}
