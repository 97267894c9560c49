//! Content loader collaborators.
//!
//! A [`ContentLoader`] resolves one title's metadata, ticket, and content
//! blobs. The service itself never touches content bytes directly; it goes
//! through the loader returned by the [`ContentManager`], which caches one
//! loader per title id and owns the optional in-memory override used when a
//! title is run straight from a loose package without installing it.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::formats::{ContentEntry, TicketReader, TmdReader};
use crate::nand::NandRoot;

/// Access to one title's installed data.
pub trait ContentLoader {
    /// Whether the title resolved at all (TMD present and well-formed).
    fn is_valid(&self) -> bool;
    fn tmd(&self) -> &TmdReader;
    fn ticket(&self) -> &TicketReader;
    fn content_by_index(&self, index: u16) -> Option<ContentEntry>;
    fn content_by_id(&self, id: u32) -> Option<ContentEntry>;
    /// Open the backing stream for a content. Idempotent.
    fn open(&mut self, index: u16) -> bool;
    /// Read `out.len()` bytes starting at `position`. Returns false if the
    /// backing stream could not supply the full range.
    fn read_range(&mut self, index: u16, position: u64, out: &mut [u8]) -> bool;
    /// Close the backing stream for a content.
    fn close(&mut self, index: u16);
}

/// Loader over the installed NAND layout.
pub struct NandContentLoader {
    title_id: u64,
    tmd: TmdReader,
    ticket: TicketReader,
    content_paths: HashMap<u16, PathBuf>,
    open_files: HashMap<u16, File>,
}

impl NandContentLoader {
    /// Resolve a title from the NAND. Always succeeds structurally; a
    /// missing or malformed title yields a loader whose `is_valid` is false.
    pub fn resolve(nand: &NandRoot, title_id: u64) -> Self {
        let tmd = nand.read_tmd(title_id).unwrap_or_default();
        let ticket = nand.find_signed_ticket(title_id);

        let mut content_paths = HashMap::new();
        if tmd.is_valid() {
            let pool = nand.shared_content();
            for entry in tmd.contents() {
                let path = if entry.is_shared() {
                    match pool.path_for_hash(&entry.hash) {
                        Some(path) => path,
                        None => continue,
                    }
                } else {
                    nand.content_path(title_id, entry.id)
                };
                content_paths.insert(entry.index, path);
            }
        }

        NandContentLoader {
            title_id,
            tmd,
            ticket,
            content_paths,
            open_files: HashMap::new(),
        }
    }
}

impl ContentLoader for NandContentLoader {
    fn is_valid(&self) -> bool {
        self.tmd.is_valid()
    }

    fn tmd(&self) -> &TmdReader {
        &self.tmd
    }

    fn ticket(&self) -> &TicketReader {
        &self.ticket
    }

    fn content_by_index(&self, index: u16) -> Option<ContentEntry> {
        self.tmd.content_by_index(index)
    }

    fn content_by_id(&self, id: u32) -> Option<ContentEntry> {
        self.tmd.content_by_id(id)
    }

    fn open(&mut self, index: u16) -> bool {
        if self.open_files.contains_key(&index) {
            return true;
        }
        let Some(path) = self.content_paths.get(&index) else {
            return false;
        };
        match File::open(path) {
            Ok(file) => {
                self.open_files.insert(index, file);
                true
            }
            Err(e) => {
                warn!(
                    "Failed to open content {} of {:016x}: {e}",
                    index, self.title_id
                );
                false
            }
        }
    }

    fn read_range(&mut self, index: u16, position: u64, out: &mut [u8]) -> bool {
        if !self.open(index) {
            return false;
        }
        let file = self.open_files.get_mut(&index).unwrap();
        if file.seek(SeekFrom::Start(position)).is_err() {
            return false;
        }
        file.read_exact(out).is_ok()
    }

    fn close(&mut self, index: u16) {
        self.open_files.remove(&index);
    }
}

/// Fully in-memory loader. Backs the run-without-installing path and tests.
pub struct MemoryContentLoader {
    tmd: TmdReader,
    ticket: TicketReader,
    data: HashMap<u16, Vec<u8>>,
}

impl MemoryContentLoader {
    pub fn new(tmd: TmdReader, ticket: TicketReader) -> Self {
        MemoryContentLoader {
            tmd,
            ticket,
            data: HashMap::new(),
        }
    }

    pub fn with_content(mut self, index: u16, bytes: Vec<u8>) -> Self {
        self.data.insert(index, bytes);
        self
    }
}

impl ContentLoader for MemoryContentLoader {
    fn is_valid(&self) -> bool {
        self.tmd.is_valid()
    }

    fn tmd(&self) -> &TmdReader {
        &self.tmd
    }

    fn ticket(&self) -> &TicketReader {
        &self.ticket
    }

    fn content_by_index(&self, index: u16) -> Option<ContentEntry> {
        self.tmd.content_by_index(index)
    }

    fn content_by_id(&self, id: u32) -> Option<ContentEntry> {
        self.tmd.content_by_id(id)
    }

    fn open(&mut self, _index: u16) -> bool {
        true
    }

    fn read_range(&mut self, index: u16, position: u64, out: &mut [u8]) -> bool {
        let Some(bytes) = self.data.get(&index) else {
            return false;
        };
        let start = position as usize;
        let end = start + out.len();
        if end > bytes.len() {
            return false;
        }
        out.copy_from_slice(&bytes[start..end]);
        true
    }

    fn close(&mut self, _index: u16) {}
}

/// Per-title loader cache, plus the loose-package override slot.
pub struct ContentManager {
    nand: NandRoot,
    cache: HashMap<u64, Box<dyn ContentLoader>>,
    override_loader: Option<Box<dyn ContentLoader>>,
}

impl ContentManager {
    pub fn new(nand: NandRoot) -> Self {
        ContentManager {
            nand,
            cache: HashMap::new(),
            override_loader: None,
        }
    }

    pub fn nand(&self) -> &NandRoot {
        &self.nand
    }

    /// Install an in-memory loader that takes priority over the NAND when
    /// the active title matches it (the run-from-package path).
    pub fn set_override(&mut self, loader: Option<Box<dyn ContentLoader>>) {
        self.override_loader = loader;
    }

    pub fn has_override(&self) -> bool {
        self.override_loader.is_some()
    }

    /// Resolve the loader for a title. `prefer_override` is set by the
    /// caller when the active title context matches `title_id` and a loose
    /// package override is installed.
    pub fn get(&mut self, title_id: u64, prefer_override: bool) -> &mut dyn ContentLoader {
        if prefer_override {
            if let Some(loader) = self.override_loader.as_mut() {
                return loader.as_mut();
            }
        }
        let nand = &self.nand;
        self.cache
            .entry(title_id)
            .or_insert_with(|| {
                debug!("Resolving NAND loader for {:016x}", title_id);
                Box::new(NandContentLoader::resolve(nand, title_id))
            })
            .as_mut()
    }

    /// Drop every cached loader, closing all backing streams. The override
    /// slot survives; its streams are memory-backed.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Forget one title's cached loader (after install/delete invalidated it).
    pub fn evict(&mut self, title_id: u64) {
        self.cache.remove(&title_id);
    }
}
