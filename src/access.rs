//! Opened-content descriptor table.
//!
//! Guests read installed content through small integer descriptors (CFDs).
//! Descriptors come from a monotonically increasing counter and are never
//! reused within a device instance. Each entry remembers which caller opened
//! it; every later operation on the descriptor must come from that caller.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::formats::ContentEntry;

/// Seek origins accepted by [`ContentTable::seek`].
const SEEK_SET: u32 = 0;
const SEEK_CUR: u32 = 1;
const SEEK_END: u32 = 2;

/// One open descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenedContent {
    pub title_id: u64,
    pub entry: ContentEntry,
    pub uid: u32,
    pub position: u64,
}

/// The descriptor table. Lives in the device instance; descriptors do not
/// survive a device reopen.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ContentTable {
    entries: BTreeMap<u32, OpenedContent>,
    next_cfd: u32,
}

impl ContentTable {
    pub fn new() -> Self {
        ContentTable::default()
    }

    /// Register an opened content and hand out the next descriptor.
    pub fn open(&mut self, uid: u32, title_id: u64, entry: ContentEntry) -> u32 {
        let cfd = self.next_cfd;
        self.next_cfd += 1;
        self.entries.insert(
            cfd,
            OpenedContent {
                title_id,
                entry,
                uid,
                position: 0,
            },
        );
        cfd
    }

    /// Resolve a descriptor, enforcing that `uid` is the opener.
    pub fn get(&mut self, cfd: u32, uid: u32) -> Result<&mut OpenedContent> {
        let slot = self.entries.get_mut(&cfd).ok_or(Error::Parameter)?;
        if slot.uid != uid {
            return Err(Error::AccessDenied);
        }
        Ok(slot)
    }

    /// Closing an unknown descriptor is an error, not a no-op.
    pub fn close(&mut self, cfd: u32, uid: u32) -> Result<OpenedContent> {
        self.get(cfd, uid)?;
        Ok(self.entries.remove(&cfd).unwrap())
    }

    /// Move a descriptor's position. No bounds check; reads clamp instead.
    /// Returns the new position.
    pub fn seek(&mut self, cfd: u32, uid: u32, offset: u32, origin: u32) -> Result<u64> {
        let slot = self.get(cfd, uid)?;
        slot.position = match origin {
            SEEK_SET => u64::from(offset),
            SEEK_CUR => slot.position + u64::from(offset),
            SEEK_END => slot.entry.size + u64::from(offset),
            _ => return Err(Error::Parameter),
        };
        Ok(slot.position)
    }

    pub fn iter_open(&self) -> impl Iterator<Item = (u32, &OpenedContent)> {
        self.entries.iter().map(|(cfd, slot)| (*cfd, slot))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.next_cfd = 0;
    }
}
