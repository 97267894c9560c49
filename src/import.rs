//! Transactional title install.
//!
//! Installs run as a strict sequence: begin title, then per content
//! begin / append / finish, then finish title. At most one content transfer
//! is in flight at a time; the session accumulates the encrypted bytes in
//! memory and only decrypts and persists them when the content is finished.

use std::fs;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::crypto;
use crate::error::{Error, Result};
use crate::formats::{TicketReader, TmdReader};
use crate::nand::NandRoot;

/// "No content transfer in flight."
pub const NO_CONTENT: u32 = 0xffff_ffff;

/// The single in-flight install session.
#[derive(Debug, Serialize, Deserialize)]
pub struct ImportSession {
    tmd: TmdReader,
    content_id: u32,
    buffer: Vec<u8>,
}

impl Default for ImportSession {
    fn default() -> Self {
        ImportSession {
            tmd: TmdReader::default(),
            content_id: NO_CONTENT,
            buffer: Vec::new(),
        }
    }
}

impl ImportSession {
    pub fn new() -> Self {
        ImportSession::default()
    }

    pub fn pending_tmd(&self) -> &TmdReader {
        &self.tmd
    }

    /// Install a ticket on its own. Structural validity is all that is
    /// checked here.
    pub fn add_ticket(nand: &NandRoot, bytes: Vec<u8>) -> Result<()> {
        let ticket = TicketReader::new(bytes);
        if !ticket.is_valid() {
            return Err(Error::InvalidTicket);
        }
        info!("Installing ticket for {:016x}", ticket.title_id());
        nand.add_ticket(&ticket)
    }

    /// Install a TMD on its own, without touching content. Used when only
    /// the metadata needs to be (re-)written.
    pub fn add_tmd(nand: &NandRoot, bytes: Vec<u8>) -> Result<()> {
        let tmd = TmdReader::new(bytes);
        if !tmd.is_valid() {
            return Err(Error::InvalidTmd);
        }
        nand.write_tmd(&tmd)
    }

    /// Begin a title install: validate and persist the TMD, record the
    /// title in the known-titles index, and make it the pending TMD.
    pub fn add_title_start(&mut self, nand: &NandRoot, bytes: Vec<u8>) -> Result<()> {
        let tmd = TmdReader::new(bytes);
        if !tmd.is_valid() {
            return Err(Error::InvalidTmd);
        }
        info!(
            "Beginning install of {:016x} v{}",
            tmd.title_id(),
            tmd.title_version()
        );
        nand.write_tmd(&tmd)
            .map_err(|e| Error::WriteFailure(e.to_string()))?;
        nand.uid_sys().add_title(tmd.title_id())?;
        self.tmd = tmd;
        Ok(())
    }

    /// Begin a content transfer. Only one may be in flight; a second begin
    /// fails without disturbing the first.
    pub fn add_content_start(&mut self, title_id: u64, content_id: u32) -> Result<u32> {
        if self.content_id != NO_CONTENT {
            warn!(
                "Tried to start content {:08x} while {:08x} is in flight",
                content_id, self.content_id
            );
            return Err(Error::Parameter);
        }
        if self.tmd.is_valid() && self.tmd.title_id() != title_id {
            // Observed behavior: mismatches are logged but not rejected.
            warn!(
                "Content begin for {:016x} does not match the pending TMD ({:016x})",
                title_id,
                self.tmd.title_id()
            );
        }
        self.content_id = content_id;
        self.buffer.clear();
        Ok(content_id)
    }

    /// Append encrypted bytes to the in-flight transfer.
    pub fn add_content_data(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Decrypt the accumulated transfer and persist it: shared contents go
    /// to the hash-addressed pool, everything else to the per-title
    /// `{id:08x}.app` file. Exactly `entry.size` bytes are written.
    pub fn add_content_finish(&mut self, nand: &NandRoot) -> Result<()> {
        if self.content_id == NO_CONTENT || !self.tmd.is_valid() {
            return Err(Error::Parameter);
        }
        let title_id = self.tmd.title_id();
        let ticket = nand.find_signed_ticket(title_id);
        if !ticket.is_valid() {
            return Err(Error::NoTicketInstalled(title_id));
        }
        let entry = self
            .tmd
            .content_by_id(self.content_id)
            .ok_or(Error::Parameter)?;

        let iv = crypto::content_iv(entry.index);
        let mut decrypted = crypto::decrypt(&ticket.title_key(), &iv, &self.buffer)?;
        // The declared size wins over however many encrypted blocks arrived.
        decrypted.resize(entry.size as usize, 0);

        let path = if entry.is_shared() {
            nand.shared_content().add(&entry.hash)?
        } else {
            nand.content_path(title_id, entry.id)
        };
        fs::write(&path, &decrypted).map_err(|e| Error::WriteFailure(e.to_string()))?;
        info!(
            "Installed content {:08x} of {:016x} ({} bytes)",
            self.content_id, title_id, entry.size
        );

        self.content_id = NO_CONTENT;
        self.buffer.clear();
        Ok(())
    }

    /// End the install. Requires a still-pending TMD.
    pub fn add_title_finish(&mut self) -> Result<()> {
        if !self.tmd.is_valid() {
            return Err(Error::Parameter);
        }
        info!("Finished install of {:016x}", self.tmd.title_id());
        self.tmd = TmdReader::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::{ContentEntry, TicketBuilder, TmdBuilder};
    use tempfile::TempDir;

    const TITLE_ID: u64 = 0x0001_0001_0000_0042;
    const TITLE_KEY: [u8; 16] = [0x11; 16];

    fn session_with_tmd(nand: &NandRoot, entry: ContentEntry) -> ImportSession {
        nand.add_ticket(&TicketBuilder::new(TITLE_ID).title_key(TITLE_KEY).build())
            .unwrap();
        let tmd = TmdBuilder::new(TITLE_ID).content(entry).build();
        let mut session = ImportSession::new();
        session
            .add_title_start(nand, tmd.raw_bytes().to_vec())
            .unwrap();
        session
    }

    fn entry(id: u32, size: u64, shared: bool) -> ContentEntry {
        ContentEntry {
            id,
            index: 0,
            ty: if shared { 0x8001 } else { 1 },
            size,
            hash: [0xaa; 20],
        }
    }

    #[test]
    fn full_content_install_decrypts_to_the_plaintext() {
        let dir = TempDir::new().unwrap();
        let nand = NandRoot::new(dir.path());
        let plaintext = [0x5a_u8; 32];
        let encrypted =
            crypto::encrypt(&TITLE_KEY, &crypto::content_iv(0), &plaintext).unwrap();

        let mut session = session_with_tmd(&nand, entry(0x10, 32, false));
        session.add_content_start(TITLE_ID, 0x10).unwrap();
        // Data arrives in several appends.
        session.add_content_data(&encrypted[..16]).unwrap();
        session.add_content_data(&encrypted[16..]).unwrap();
        session.add_content_finish(&nand).unwrap();
        session.add_title_finish().unwrap();

        let stored = fs::read(nand.content_path(TITLE_ID, 0x10)).unwrap();
        assert_eq!(stored, plaintext);
    }

    #[test]
    fn shared_content_lands_in_the_pool() {
        let dir = TempDir::new().unwrap();
        let nand = NandRoot::new(dir.path());
        let e = entry(0x20, 16, true);
        let encrypted =
            crypto::encrypt(&TITLE_KEY, &crypto::content_iv(0), &[7; 16]).unwrap();

        let mut session = session_with_tmd(&nand, e);
        session.add_content_start(TITLE_ID, 0x20).unwrap();
        session.add_content_data(&encrypted).unwrap();
        session.add_content_finish(&nand).unwrap();

        let pooled = nand.shared_content().path_for_hash(&e.hash).unwrap();
        assert_eq!(fs::read(pooled).unwrap(), [7; 16]);
        assert!(!nand.content_path(TITLE_ID, 0x20).exists());
    }

    #[test]
    fn second_content_start_leaves_the_first_untouched() {
        let dir = TempDir::new().unwrap();
        let nand = NandRoot::new(dir.path());
        let mut session = session_with_tmd(&nand, entry(0x10, 16, false));

        session.add_content_start(TITLE_ID, 0x10).unwrap();
        session.add_content_data(&[1; 16]).unwrap();
        assert!(matches!(
            session.add_content_start(TITLE_ID, 0x11),
            Err(Error::Parameter)
        ));
        assert_eq!(session.content_id, 0x10);
        assert_eq!(session.buffer.len(), 16);
    }

    #[test]
    fn content_finish_without_a_ticket_fails() {
        let dir = TempDir::new().unwrap();
        let nand = NandRoot::new(dir.path());
        let tmd = TmdBuilder::new(TITLE_ID).content(entry(0x10, 16, false)).build();
        let mut session = ImportSession::new();
        session
            .add_title_start(&nand, tmd.raw_bytes().to_vec())
            .unwrap();
        session.add_content_start(TITLE_ID, 0x10).unwrap();
        assert!(matches!(
            session.add_content_finish(&nand),
            Err(Error::NoTicketInstalled(TITLE_ID))
        ));
    }

    #[test]
    fn title_finish_requires_a_pending_tmd() {
        let mut session = ImportSession::new();
        assert!(matches!(session.add_title_finish(), Err(Error::Parameter)));
    }

    #[test]
    fn malformed_records_are_rejected() {
        let dir = TempDir::new().unwrap();
        let nand = NandRoot::new(dir.path());
        assert!(matches!(
            ImportSession::add_tmd(&nand, vec![0; 16]),
            Err(Error::InvalidTmd)
        ));
        assert!(matches!(
            ImportSession::add_ticket(&nand, vec![0; 16]),
            Err(Error::InvalidTicket)
        ));
        let mut session = ImportSession::new();
        assert!(matches!(
            session.add_title_start(&nand, vec![0; 16]),
            Err(Error::InvalidTmd)
        ));
    }
}
