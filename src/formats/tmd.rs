//! Title metadata (TMD) reader and test-fixture builder.

use serde::{Deserialize, Serialize};

use super::{read_u16, read_u32, read_u64};

/// Size of the signed TMD header; content records follow immediately.
pub const TMD_HEADER_SIZE: usize = 0x1e4;
/// Size of one content record.
pub const CONTENT_ENTRY_SIZE: usize = 36;

// Header field offsets.
const OFF_SIGNATURE_TYPE: usize = 0x000;
const OFF_TMD_VERSION: usize = 0x180;
const OFF_IOS_ID: usize = 0x184;
const OFF_TITLE_ID: usize = 0x18c;
const OFF_GROUP_ID: usize = 0x198;
const OFF_ACCESS_RIGHTS: usize = 0x1d8;
const OFF_TITLE_VERSION: usize = 0x1dc;
const OFF_NUM_CONTENTS: usize = 0x1de;
const OFF_BOOT_INDEX: usize = 0x1e0;

// Content record field offsets (relative to the record).
const OFF_CONTENT_ID: usize = 0;
const OFF_CONTENT_INDEX: usize = 4;
const OFF_CONTENT_TYPE: usize = 6;
const OFF_CONTENT_SIZE: usize = 8;
const OFF_CONTENT_HASH: usize = 16;

/// First bytes of a content record that make up its "view" form (everything
/// but the hash).
const CONTENT_VIEW_SIZE: usize = 0x10;

/// One content record of a TMD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentEntry {
    pub id: u32,
    pub index: u16,
    pub ty: u16,
    pub size: u64,
    pub hash: [u8; 20],
}

impl ContentEntry {
    /// Shared contents are stored once in a hash-addressed pool instead of
    /// per title.
    pub fn is_shared(&self) -> bool {
        (self.ty & 0x8000) != 0
    }
}

/// Read-only view over raw TMD bytes.
///
/// An empty or truncated byte vector is representable; [`TmdReader::is_valid`]
/// is the gate every consumer checks before trusting any accessor. Accessors
/// must only be called on a valid reader.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TmdReader {
    bytes: Vec<u8>,
}

impl TmdReader {
    pub fn new(bytes: Vec<u8>) -> Self {
        TmdReader { bytes }
    }

    pub fn set_bytes(&mut self, bytes: Vec<u8>) {
        self.bytes = bytes;
    }

    /// Structural validity: the header fits and the content table is fully
    /// present. Signatures are not verified here.
    pub fn is_valid(&self) -> bool {
        if self.bytes.len() < TMD_HEADER_SIZE {
            return false;
        }
        let contents_len = self.num_contents() as usize * CONTENT_ENTRY_SIZE;
        self.bytes.len() >= TMD_HEADER_SIZE + contents_len
    }

    pub fn raw_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn signature_type(&self) -> u32 {
        read_u32(&self.bytes, OFF_SIGNATURE_TYPE)
    }

    /// The IOS version this title requires, as a full title id.
    pub fn ios_id(&self) -> u64 {
        read_u64(&self.bytes, OFF_IOS_ID)
    }

    pub fn title_id(&self) -> u64 {
        read_u64(&self.bytes, OFF_TITLE_ID)
    }

    pub fn group_id(&self) -> u16 {
        read_u16(&self.bytes, OFF_GROUP_ID)
    }

    pub fn title_version(&self) -> u16 {
        read_u16(&self.bytes, OFF_TITLE_VERSION)
    }

    pub fn boot_index(&self) -> u16 {
        read_u16(&self.bytes, OFF_BOOT_INDEX)
    }

    pub fn num_contents(&self) -> u16 {
        read_u16(&self.bytes, OFF_NUM_CONTENTS)
    }

    fn content_at(&self, slot: usize) -> ContentEntry {
        let base = TMD_HEADER_SIZE + slot * CONTENT_ENTRY_SIZE;
        let record = &self.bytes[base..base + CONTENT_ENTRY_SIZE];
        let mut hash = [0; 20];
        hash.copy_from_slice(&record[OFF_CONTENT_HASH..OFF_CONTENT_HASH + 20]);
        ContentEntry {
            id: read_u32(record, OFF_CONTENT_ID),
            index: read_u16(record, OFF_CONTENT_INDEX),
            ty: read_u16(record, OFF_CONTENT_TYPE),
            size: read_u64(record, OFF_CONTENT_SIZE),
            hash,
        }
    }

    /// Look up a content record by its index field.
    pub fn content_by_index(&self, index: u16) -> Option<ContentEntry> {
        if index >= self.num_contents() {
            return None;
        }
        Some(self.content_at(index as usize))
    }

    /// Look up a content record by content id.
    pub fn content_by_id(&self, id: u32) -> Option<ContentEntry> {
        self.contents().into_iter().find(|c| c.id == id)
    }

    pub fn contents(&self) -> Vec<ContentEntry> {
        (0..self.num_contents() as usize)
            .map(|slot| self.content_at(slot))
            .collect()
    }

    /// The unsigned "TMD view" form: header fields from the version byte up
    /// to (but excluding) the access rights, then the title version and
    /// content count, then each content record without its hash.
    pub fn raw_view(&self) -> Vec<u8> {
        let mut view =
            self.bytes[OFF_TMD_VERSION..OFF_ACCESS_RIGHTS].to_vec();
        view.extend_from_slice(&self.bytes[OFF_TITLE_VERSION..OFF_TITLE_VERSION + 2]);
        view.extend_from_slice(&self.bytes[OFF_NUM_CONTENTS..OFF_NUM_CONTENTS + 2]);
        for slot in 0..self.num_contents() as usize {
            let base = TMD_HEADER_SIZE + slot * CONTENT_ENTRY_SIZE;
            view.extend_from_slice(&self.bytes[base..base + CONTENT_VIEW_SIZE]);
        }
        view
    }
}

/// Fabricates structurally valid TMDs with a blank RSA-2048 signature.
/// Used by tests and by embedders that install titles from loose data.
#[derive(Debug, Default)]
pub struct TmdBuilder {
    title_id: u64,
    ios_id: u64,
    group_id: u16,
    title_version: u16,
    boot_index: u16,
    contents: Vec<ContentEntry>,
}

impl TmdBuilder {
    pub fn new(title_id: u64) -> Self {
        TmdBuilder {
            title_id,
            ..Default::default()
        }
    }

    pub fn ios_id(mut self, ios_id: u64) -> Self {
        self.ios_id = ios_id;
        self
    }

    pub fn group_id(mut self, group_id: u16) -> Self {
        self.group_id = group_id;
        self
    }

    pub fn title_version(mut self, version: u16) -> Self {
        self.title_version = version;
        self
    }

    pub fn boot_index(mut self, index: u16) -> Self {
        self.boot_index = index;
        self
    }

    pub fn content(mut self, entry: ContentEntry) -> Self {
        self.contents.push(entry);
        self
    }

    pub fn build(self) -> TmdReader {
        let mut bytes =
            vec![0; TMD_HEADER_SIZE + self.contents.len() * CONTENT_ENTRY_SIZE];
        // RSA-2048 signature type; the signature itself stays zeroed.
        bytes[OFF_SIGNATURE_TYPE..OFF_SIGNATURE_TYPE + 4]
            .copy_from_slice(&0x0001_0001u32.to_be_bytes());
        bytes[OFF_IOS_ID..OFF_IOS_ID + 8].copy_from_slice(&self.ios_id.to_be_bytes());
        bytes[OFF_TITLE_ID..OFF_TITLE_ID + 8].copy_from_slice(&self.title_id.to_be_bytes());
        bytes[OFF_GROUP_ID..OFF_GROUP_ID + 2].copy_from_slice(&self.group_id.to_be_bytes());
        bytes[OFF_TITLE_VERSION..OFF_TITLE_VERSION + 2]
            .copy_from_slice(&self.title_version.to_be_bytes());
        bytes[OFF_NUM_CONTENTS..OFF_NUM_CONTENTS + 2]
            .copy_from_slice(&(self.contents.len() as u16).to_be_bytes());
        bytes[OFF_BOOT_INDEX..OFF_BOOT_INDEX + 2]
            .copy_from_slice(&self.boot_index.to_be_bytes());

        for (slot, entry) in self.contents.iter().enumerate() {
            let base = TMD_HEADER_SIZE + slot * CONTENT_ENTRY_SIZE;
            bytes[base..base + 4].copy_from_slice(&entry.id.to_be_bytes());
            bytes[base + OFF_CONTENT_INDEX..base + OFF_CONTENT_INDEX + 2]
                .copy_from_slice(&entry.index.to_be_bytes());
            bytes[base + OFF_CONTENT_TYPE..base + OFF_CONTENT_TYPE + 2]
                .copy_from_slice(&entry.ty.to_be_bytes());
            bytes[base + OFF_CONTENT_SIZE..base + OFF_CONTENT_SIZE + 8]
                .copy_from_slice(&entry.size.to_be_bytes());
            bytes[base + OFF_CONTENT_HASH..base + OFF_CONTENT_HASH + 20]
                .copy_from_slice(&entry.hash);
        }

        TmdReader::new(bytes)
    }
}
