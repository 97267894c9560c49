//! Title export session.
//!
//! Exports hand installed content back to the guest re-encrypted under the
//! title key. One session at a time, but a session may have several content
//! streams open at once; each stream keeps real CBC chaining state in its
//! own IV so the guest can pull the content in arbitrary chunks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::crypto;
use crate::error::{Error, Result};
use crate::formats::{ContentEntry, TmdReader};
use crate::loader::ContentLoader;

/// Cipher alignment for export reads.
const EXPORT_ALIGNMENT: usize = 32;

/// One open export stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportContent {
    pub entry: ContentEntry,
    pub position: u64,
    iv: [u8; 16],
}

/// The single in-flight export session. `valid == false` is the idle state.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ExportSession {
    valid: bool,
    tmd: TmdReader,
    title_key: [u8; 16],
    contents: BTreeMap<u32, ExportContent>,
}

impl ExportSession {
    pub fn new() -> Self {
        ExportSession::default()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Title id of the session. Only meaningful while valid.
    pub fn title_id(&self) -> u64 {
        self.tmd.title_id()
    }

    /// Start exporting a title. Returns the raw TMD bytes for the guest.
    pub fn title_init(
        &mut self,
        loader: &mut dyn ContentLoader,
        title_id: u64,
    ) -> Result<Vec<u8>> {
        // No nested exports.
        if self.valid {
            return Err(Error::Parameter);
        }
        if !loader.is_valid() {
            return Err(Error::NotFound);
        }
        let tmd = loader.tmd().clone();
        if !tmd.is_valid() {
            return Err(Error::InvalidTmd);
        }
        let ticket = loader.ticket();
        if !ticket.is_valid() {
            return Err(Error::NoTicketInstalled(title_id));
        }
        if ticket.title_id() != tmd.title_id() {
            return Err(Error::InvalidTicket);
        }

        info!("Beginning export of {:016x}", tmd.title_id());
        self.title_key = ticket.title_key();
        let bytes = tmd.raw_bytes().to_vec();
        self.tmd = tmd;
        self.valid = true;
        Ok(bytes)
    }

    /// Open one content for export. Export-content-ids are the lowest
    /// unused value and are reused after a stream is closed.
    pub fn content_begin(
        &mut self,
        loader: &mut dyn ContentLoader,
        title_id: u64,
        content_id: u32,
    ) -> Result<u32> {
        if !self.valid || self.tmd.title_id() != title_id {
            return Err(Error::Parameter);
        }
        let entry = self.tmd.content_by_id(content_id).ok_or(Error::NotFound)?;
        if !loader.open(entry.index) {
            return Err(Error::NotFound);
        }

        let ecid = (0..).find(|id| !self.contents.contains_key(id)).unwrap();
        self.contents.insert(
            ecid,
            ExportContent {
                entry,
                position: 0,
                iv: crypto::content_iv(entry.index),
            },
        );
        Ok(ecid)
    }

    /// Pull the next chunk of an export stream, re-encrypted. The read is
    /// rounded up to the cipher alignment; the tail past the declared size
    /// is zero padding.
    pub fn content_data(
        &mut self,
        loader: &mut dyn ContentLoader,
        ecid: u32,
        max_bytes: u32,
    ) -> Result<Vec<u8>> {
        let stream = self.contents.get_mut(&ecid).ok_or(Error::Parameter)?;
        // Pulling past the end is a caller error, not an empty read.
        if stream.position >= stream.entry.size {
            return Err(Error::Parameter);
        }

        let remaining = stream.entry.size - stream.position;
        let read_len = remaining.min(u64::from(max_bytes)) as usize;
        let padded_len = read_len.div_ceil(EXPORT_ALIGNMENT) * EXPORT_ALIGNMENT;

        let mut buffer = vec![0; padded_len];
        if !loader.read_range(stream.entry.index, stream.position, &mut buffer[..read_len]) {
            return Err(Error::ShortRead);
        }
        let encrypted = crypto::encrypt_chained(&self.title_key, &mut stream.iv, &buffer)?;
        stream.position += read_len as u64;
        Ok(encrypted)
    }

    /// Close an export stream. The content must have been fully consumed.
    pub fn content_end(&mut self, loader: &mut dyn ContentLoader, ecid: u32) -> Result<()> {
        let stream = self.contents.get(&ecid).ok_or(Error::Parameter)?;
        if stream.position != stream.entry.size {
            return Err(Error::Parameter);
        }
        loader.close(stream.entry.index);
        self.contents.remove(&ecid);
        Ok(())
    }

    /// End the session.
    pub fn title_done(&mut self) -> Result<()> {
        if !self.valid {
            return Err(Error::Parameter);
        }
        info!("Finished export of {:016x}", self.tmd.title_id());
        *self = ExportSession::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::{TicketBuilder, TmdBuilder};
    use crate::loader::MemoryContentLoader;

    const TITLE_ID: u64 = 0x0001_0001_0000_0077;
    const TITLE_KEY: [u8; 16] = [0x42; 16];

    fn loader_with_content(plaintext: &[u8]) -> MemoryContentLoader {
        let entry = ContentEntry {
            id: 0x30,
            index: 0,
            ty: 1,
            size: plaintext.len() as u64,
            hash: [0; 20],
        };
        let tmd = TmdBuilder::new(TITLE_ID).content(entry).build();
        let ticket = TicketBuilder::new(TITLE_ID).title_key(TITLE_KEY).build();
        MemoryContentLoader::new(tmd, ticket).with_content(0, plaintext.to_vec())
    }

    #[test]
    fn exported_bytes_decrypt_back_to_the_content() {
        let plaintext = [0x33_u8; 64];
        let mut loader = loader_with_content(&plaintext);
        let mut session = ExportSession::new();

        let tmd_bytes = session.title_init(&mut loader, TITLE_ID).unwrap();
        assert!(TmdReader::new(tmd_bytes).is_valid());

        let ecid = session.content_begin(&mut loader, TITLE_ID, 0x30).unwrap();
        let mut exported = session.content_data(&mut loader, ecid, 32).unwrap();
        exported.extend(session.content_data(&mut loader, ecid, 32).unwrap());
        session.content_end(&mut loader, ecid).unwrap();
        session.title_done().unwrap();

        let decrypted =
            crypto::decrypt(&TITLE_KEY, &crypto::content_iv(0), &exported).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn end_before_fully_consumed_fails() {
        let mut loader = loader_with_content(&[1; 64]);
        let mut session = ExportSession::new();
        session.title_init(&mut loader, TITLE_ID).unwrap();
        let ecid = session.content_begin(&mut loader, TITLE_ID, 0x30).unwrap();
        session.content_data(&mut loader, ecid, 32).unwrap();
        assert!(matches!(
            session.content_end(&mut loader, ecid),
            Err(Error::Parameter)
        ));
    }

    #[test]
    fn data_after_full_consumption_is_rejected() {
        let mut loader = loader_with_content(&[9; 32]);
        let mut session = ExportSession::new();
        session.title_init(&mut loader, TITLE_ID).unwrap();
        let ecid = session.content_begin(&mut loader, TITLE_ID, 0x30).unwrap();
        session.content_data(&mut loader, ecid, 32).unwrap();
        assert!(matches!(
            session.content_data(&mut loader, ecid, 32),
            Err(Error::Parameter)
        ));
        // The stream is still closeable.
        session.content_end(&mut loader, ecid).unwrap();
    }

    #[test]
    fn export_ids_are_reused_after_close() {
        let mut loader = loader_with_content(&[1; 32]);
        let mut session = ExportSession::new();
        session.title_init(&mut loader, TITLE_ID).unwrap();

        let first = session.content_begin(&mut loader, TITLE_ID, 0x30).unwrap();
        assert_eq!(first, 0);
        session.content_data(&mut loader, first, 32).unwrap();
        session.content_end(&mut loader, first).unwrap();
        assert_eq!(session.content_begin(&mut loader, TITLE_ID, 0x30).unwrap(), 0);
    }

    #[test]
    fn nested_exports_are_rejected() {
        let mut loader = loader_with_content(&[1; 32]);
        let mut session = ExportSession::new();
        session.title_init(&mut loader, TITLE_ID).unwrap();
        assert!(matches!(
            session.title_init(&mut loader, TITLE_ID),
            Err(Error::Parameter)
        ));
    }

    #[test]
    fn short_reads_fail_the_data_call() {
        let entry = ContentEntry {
            id: 0x30,
            index: 0,
            ty: 1,
            size: 64,
            hash: [0; 20],
        };
        let tmd = TmdBuilder::new(TITLE_ID).content(entry).build();
        let ticket = TicketBuilder::new(TITLE_ID).title_key(TITLE_KEY).build();
        // Backing data shorter than the declared size.
        let mut loader = MemoryContentLoader::new(tmd, ticket).with_content(0, vec![0; 16]);
        let mut session = ExportSession::new();
        session.title_init(&mut loader, TITLE_ID).unwrap();
        let ecid = session.content_begin(&mut loader, TITLE_ID, 0x30).unwrap();
        assert!(matches!(
            session.content_data(&mut loader, ecid, 32),
            Err(Error::ShortRead)
        ));
    }
}
