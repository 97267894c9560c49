//! Persisted NAND layout: title metadata, tickets, content files, the
//! shared-content pool, and the installed-title index.
//!
//! Directory layout under the root:
//!
//! ```text
//! title/{type:08x}/{id:08x}/content/title.tmd
//! title/{type:08x}/{id:08x}/content/{content_id:08x}.app
//! title/{type:08x}/{id:08x}/data/
//! ticket/{type:08x}/{id:08x}.tik
//! shared1/{seq:08x}.app        (hash-addressed via shared1/content.map)
//! sys/uid.sys
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::formats::{split_title_id, TicketReader, TmdReader};

/// Root of an emulated NAND filesystem.
#[derive(Debug, Clone)]
pub struct NandRoot {
    root: PathBuf,
}

fn is_valid_part_of_title_id(name: &str) -> bool {
    name.len() == 8 && name.chars().all(|c| c.is_ascii_hexdigit())
}

impl NandRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        NandRoot { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn title_dir(&self, title_id: u64) -> PathBuf {
        let (hi, lo) = split_title_id(title_id);
        self.root
            .join("title")
            .join(format!("{:08x}", hi))
            .join(format!("{:08x}", lo))
    }

    pub fn title_content_dir(&self, title_id: u64) -> PathBuf {
        self.title_dir(title_id).join("content")
    }

    pub fn title_data_dir(&self, title_id: u64) -> PathBuf {
        self.title_dir(title_id).join("data")
    }

    pub fn tmd_path(&self, title_id: u64) -> PathBuf {
        self.title_content_dir(title_id).join("title.tmd")
    }

    pub fn content_path(&self, title_id: u64, content_id: u32) -> PathBuf {
        self.title_content_dir(title_id)
            .join(format!("{:08x}.app", content_id))
    }

    pub fn ticket_path(&self, title_id: u64) -> PathBuf {
        let (hi, lo) = split_title_id(title_id);
        self.root
            .join("ticket")
            .join(format!("{:08x}", hi))
            .join(format!("{:08x}.tik", lo))
    }

    /// The guest-visible data directory string for GetTitleDir.
    pub fn guest_title_data_dir(title_id: u64) -> String {
        let (hi, lo) = split_title_id(title_id);
        format!("/title/{:08x}/{:08x}/data", hi, lo)
    }

    /// Title ids found under `title/`, two levels of 8-hex-digit directory
    /// names. The TMD is not checked at all here, matching IOS.
    pub fn installed_titles(&self) -> Vec<u64> {
        let titles_dir = self.root.join("title");
        if !titles_dir.is_dir() {
            error!("/title is not a directory");
            return Vec::new();
        }
        let mut title_ids = Vec::new();
        for ty in read_dir_names(&titles_dir) {
            if !is_valid_part_of_title_id(&ty.0) || !ty.1 {
                continue;
            }
            for instance in read_dir_names(&titles_dir.join(&ty.0)) {
                if !is_valid_part_of_title_id(&instance.0) || !instance.1 {
                    continue;
                }
                let hi = u32::from_str_radix(&ty.0, 16).unwrap();
                let lo = u32::from_str_radix(&instance.0, 16).unwrap();
                title_ids.push((hi as u64) << 32 | lo as u64);
            }
        }
        title_ids.sort_unstable();
        title_ids
    }

    /// Title ids for which a `{id:08x}.tik` file exists under `ticket/`.
    pub fn titles_with_tickets(&self) -> Vec<u64> {
        let tickets_dir = self.root.join("ticket");
        if !tickets_dir.is_dir() {
            error!("/ticket is not a directory");
            return Vec::new();
        }
        let mut title_ids = Vec::new();
        for ty in read_dir_names(&tickets_dir) {
            if !is_valid_part_of_title_id(&ty.0) || !ty.1 {
                continue;
            }
            for ticket in read_dir_names(&tickets_dir.join(&ty.0)) {
                if ticket.1 || ticket.0.len() != 12 {
                    continue;
                }
                let (stem, ext) = ticket.0.split_at(8);
                if !is_valid_part_of_title_id(stem) || ext != ".tik" {
                    continue;
                }
                let hi = u32::from_str_radix(&ty.0, 16).unwrap();
                let lo = u32::from_str_radix(stem, 16).unwrap();
                title_ids.push((hi as u64) << 32 | lo as u64);
            }
        }
        title_ids.sort_unstable();
        title_ids
    }

    /// Persist a TMD to its title path.
    pub fn write_tmd(&self, tmd: &TmdReader) -> Result<()> {
        let path = self.tmd_path(tmd.title_id());
        create_parent(&path)?;
        fs::write(&path, tmd.raw_bytes())
            .map_err(|e| Error::WriteFailure(format!("{}: {e}", path.display())))
    }

    pub fn read_tmd(&self, title_id: u64) -> Result<TmdReader> {
        let bytes = fs::read(self.tmd_path(title_id)).map_err(|_| Error::NotFound)?;
        Ok(TmdReader::new(bytes))
    }

    /// Store a ticket under its title path. Invalid tickets are refused.
    pub fn add_ticket(&self, ticket: &TicketReader) -> Result<()> {
        if !ticket.is_valid() {
            error!("ES: Refusing to install invalid ticket");
            return Err(Error::InvalidTicket);
        }
        let path = self.ticket_path(ticket.title_id());
        create_parent(&path)?;
        info!("ES: Installing ticket for {:016x}", ticket.title_id());
        fs::write(&path, ticket.raw_bytes())
            .map_err(|e| Error::WriteFailure(format!("{}: {e}", path.display())))
    }

    /// Find a signed ticket installed for `title_id`. The returned reader may
    /// still be invalid (e.g. a truncated file); callers check.
    pub fn find_signed_ticket(&self, title_id: u64) -> TicketReader {
        match fs::read(self.ticket_path(title_id)) {
            Ok(bytes) => TicketReader::new(bytes),
            Err(_) => TicketReader::default(),
        }
    }

    pub fn delete_ticket(&self, title_id: u64) -> Result<()> {
        fs::remove_file(self.ticket_path(title_id)).map_err(|_| Error::Parameter)
    }

    /// Remove a title directory tree. The ticket is left alone.
    pub fn delete_title_dir(&self, title_id: u64) -> Result<()> {
        let dir = self.title_dir(title_id);
        if !dir.is_dir() {
            return Err(Error::NotFound);
        }
        fs::remove_dir_all(&dir).map_err(|_| {
            error!("DeleteTitle: Failed to delete title directory: {}", dir.display());
            Error::AccessDenied
        })
    }

    /// Remove just the content files of a title.
    pub fn delete_title_content(&self, title_id: u64) -> Result<()> {
        let dir = self.title_content_dir(title_id);
        if !dir.is_dir() {
            return Err(Error::Parameter);
        }
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |e| e == "app") {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    pub fn uid_sys(&self) -> UidSys {
        UidSys {
            path: self.root.join("sys").join("uid.sys"),
        }
    }

    pub fn shared_content(&self) -> SharedContentMap {
        SharedContentMap {
            dir: self.root.join("shared1"),
        }
    }
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::WriteFailure(format!("{}: {e}", parent.display())))?;
    }
    Ok(())
}

/// (name, is_directory) pairs of a directory, empty on error.
fn read_dir_names(dir: &Path) -> Vec<(String, bool)> {
    let mut names = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if let Ok(name) = entry.file_name().into_string() {
                names.push((name, is_dir));
            }
        }
    }
    names.sort();
    names
}

/// The `sys/uid.sys` index: titles known to the system, independent of
/// ticket ownership. Binary records of a big-endian title id followed by a
/// big-endian uid, starting at 0x1000.
#[derive(Debug)]
pub struct UidSys {
    path: PathBuf,
}

const FIRST_UID: u32 = 0x1000;
const UID_RECORD_SIZE: usize = 12;

impl UidSys {
    fn load(&self) -> Vec<(u64, u32)> {
        let mut entries = Vec::new();
        if let Ok(bytes) = fs::read(&self.path) {
            for record in bytes.chunks_exact(UID_RECORD_SIZE) {
                let title_id = u64::from_be_bytes(record[..8].try_into().unwrap());
                let uid = u32::from_be_bytes(record[8..].try_into().unwrap());
                entries.push((title_id, uid));
            }
        }
        entries
    }

    fn store(&self, entries: &[(u64, u32)]) -> Result<()> {
        create_parent(&self.path)?;
        let mut bytes = Vec::with_capacity(entries.len() * UID_RECORD_SIZE);
        for (title_id, uid) in entries {
            bytes.extend_from_slice(&title_id.to_be_bytes());
            bytes.extend_from_slice(&uid.to_be_bytes());
        }
        fs::write(&self.path, bytes)
            .map_err(|e| Error::WriteFailure(format!("{}: {e}", self.path.display())))
    }

    /// Record a title, allocating the next uid if it is new. Returns the uid.
    pub fn add_title(&self, title_id: u64) -> Result<u32> {
        let mut entries = self.load();
        if let Some((_, uid)) = entries.iter().find(|(id, _)| *id == title_id) {
            return Ok(*uid);
        }
        let uid = entries
            .iter()
            .map(|(_, uid)| *uid + 1)
            .max()
            .unwrap_or(FIRST_UID);
        entries.push((title_id, uid));
        self.store(&entries)?;
        Ok(uid)
    }

    pub fn titles(&self) -> Vec<u64> {
        self.load().into_iter().map(|(id, _)| id).collect()
    }
}

/// The hash-addressed shared-content pool (`shared1/`). A flat `content.map`
/// maps 20-byte SHA-1 hashes to 8-character file stems.
#[derive(Debug)]
pub struct SharedContentMap {
    dir: PathBuf,
}

const MAP_RECORD_SIZE: usize = 28;

impl SharedContentMap {
    fn map_path(&self) -> PathBuf {
        self.dir.join("content.map")
    }

    fn load(&self) -> Vec<([u8; 8], [u8; 20])> {
        let mut entries = Vec::new();
        if let Ok(bytes) = fs::read(self.map_path()) {
            for record in bytes.chunks_exact(MAP_RECORD_SIZE) {
                let mut name = [0; 8];
                let mut hash = [0; 20];
                name.copy_from_slice(&record[..8]);
                hash.copy_from_slice(&record[8..]);
                entries.push((name, hash));
            }
        }
        entries
    }

    /// Path of the pooled file for `hash`, if the hash is known.
    pub fn path_for_hash(&self, hash: &[u8; 20]) -> Option<PathBuf> {
        self.load().iter().find(|(_, h)| h == hash).map(|(name, _)| {
            let stem = String::from_utf8_lossy(name).into_owned();
            self.dir.join(format!("{stem}.app"))
        })
    }

    /// Register `hash` in the pool, returning the path its data should live
    /// at. Re-adding a known hash returns the existing path.
    pub fn add(&self, hash: &[u8; 20]) -> Result<PathBuf> {
        if let Some(existing) = self.path_for_hash(hash) {
            warn!(
                "Shared content {} is already in the pool",
                hex::encode(hash)
            );
            return Ok(existing);
        }
        let mut entries = self.load();
        let stem = format!("{:08x}", entries.len());
        let mut name = [0; 8];
        name.copy_from_slice(stem.as_bytes());
        entries.push((name, *hash));

        create_parent(&self.map_path())?;
        let mut bytes = Vec::with_capacity(entries.len() * MAP_RECORD_SIZE);
        for (n, h) in &entries {
            bytes.extend_from_slice(n);
            bytes.extend_from_slice(h);
        }
        fs::write(self.map_path(), bytes)
            .map_err(|e| Error::WriteFailure(format!("content.map: {e}")))?;
        Ok(self.dir.join(format!("{stem}.app")))
    }
}
