//! Ticket reader, ticket views, and test-fixture builder.
//!
//! A ticket file holds one or more signed tickets. Each ticket carries the
//! title key, encrypted with the fixed common key and an IV derived from the
//! title id. "Ticket views" are the 0xd8-byte summaries handed out by the
//! view-query commands.

use serde::{Deserialize, Serialize};

use super::{read_u32, read_u64};
use crate::crypto;

/// Size of one ticket payload (excluding the signature block).
pub const TICKET_SIZE: usize = 356;
/// Size of one ticket view.
pub const TICKET_VIEW_SIZE: usize = 0xd8;

// Payload offsets, relative to the end of the signature block.
const OFF_TITLE_KEY: usize = 0x7f;
const OFF_TICKET_ID: usize = 0x90;
const OFF_TITLE_ID: usize = 0x9c;

/// The fixed common key used to unwrap per-title keys. Publicly known
/// placeholder material, not a secret.
pub const COMMON_KEY: [u8; 16] = [
    0xeb, 0xe4, 0x2a, 0x22, 0x5e, 0x85, 0x93, 0xe4, 0x48, 0xd9, 0xc5, 0x45, 0x73, 0x81, 0xaa,
    0xf7,
];

/// Decoded fixed-position fields of a ticket; handy for assertions and
/// display, the raw bytes stay authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub ticket_id: u64,
    pub title_id: u64,
}

/// Read-only view over raw ticket bytes. Like [`super::TmdReader`], validity
/// is derived and must be checked before using any accessor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TicketReader {
    bytes: Vec<u8>,
}

impl TicketReader {
    pub fn new(bytes: Vec<u8>) -> Self {
        TicketReader { bytes }
    }

    pub fn set_bytes(&mut self, bytes: Vec<u8>) {
        self.bytes = bytes;
    }

    pub fn raw_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Offset of the ticket payload past the signature block, derived from
    /// the signature type. Zero means the signature type is unknown.
    pub fn payload_offset(&self) -> usize {
        if self.bytes.len() < 4 {
            return 0;
        }
        match read_u32(&self.bytes, 0) {
            0x10000 => 576, // RSA-4096
            0x10001 => 320, // RSA-2048
            0x10002 => 128, // ECDSA
            _ => 0,
        }
    }

    /// Structural validity: a known signature type and at least one full
    /// ticket payload behind it.
    pub fn is_valid(&self) -> bool {
        let offset = self.payload_offset();
        offset != 0 && self.bytes.len() >= offset + TICKET_SIZE
    }

    /// Number of tickets in the file. Multi-ticket files are rare but IOS
    /// handles them, so we do too.
    pub fn ticket_count(&self) -> u32 {
        (self.bytes.len() / (self.payload_offset() + TICKET_SIZE)) as u32
    }

    pub fn title_id(&self) -> u64 {
        read_u64(&self.bytes, self.payload_offset() + OFF_TITLE_ID)
    }

    pub fn ticket(&self) -> Ticket {
        let offset = self.payload_offset();
        Ticket {
            ticket_id: read_u64(&self.bytes, offset + OFF_TICKET_ID),
            title_id: read_u64(&self.bytes, offset + OFF_TITLE_ID),
        }
    }

    /// The decrypted per-title AES key: the encrypted key field unwrapped
    /// with the common key and the title id as IV.
    pub fn title_key(&self) -> [u8; 16] {
        let offset = self.payload_offset();
        let mut iv = [0; 16];
        iv[..8].copy_from_slice(&self.bytes[offset + OFF_TITLE_ID..offset + OFF_TITLE_ID + 8]);
        let encrypted = &self.bytes[offset + OFF_TITLE_KEY..offset + OFF_TITLE_KEY + 16];
        // 16 bytes are always block-aligned, so this cannot fail.
        let decrypted = crypto::decrypt(&COMMON_KEY, &iv, encrypted).unwrap();
        let mut key = [0; 16];
        key.copy_from_slice(&decrypted);
        key
    }

    /// A raw, unswapped ticket view: a big-endian view id followed by the
    /// ticket tail starting at the ticket-id field.
    pub fn raw_ticket_view(&self, ticket_num: u32) -> Vec<u8> {
        let start =
            self.payload_offset() + TICKET_SIZE * ticket_num as usize + OFF_TICKET_ID;
        let mut view = ticket_num.to_be_bytes().to_vec();
        view.extend_from_slice(&self.bytes[start..start + TICKET_VIEW_SIZE - 4]);
        view
    }
}

/// Fabricates structurally valid single-ticket files with a blank RSA-2048
/// signature. The plaintext title key is wrapped with the common key so
/// [`TicketReader::title_key`] round-trips it.
#[derive(Debug)]
pub struct TicketBuilder {
    title_id: u64,
    ticket_id: u64,
    title_key: [u8; 16],
}

impl TicketBuilder {
    pub fn new(title_id: u64) -> Self {
        TicketBuilder {
            title_id,
            ticket_id: 0,
            title_key: [0; 16],
        }
    }

    pub fn ticket_id(mut self, ticket_id: u64) -> Self {
        self.ticket_id = ticket_id;
        self
    }

    /// Plaintext title key; the builder stores the wrapped form.
    pub fn title_key(mut self, key: [u8; 16]) -> Self {
        self.title_key = key;
        self
    }

    pub fn build(self) -> TicketReader {
        const SIGNATURE_BLOCK: usize = 320; // RSA-2048
        let mut bytes = vec![0; SIGNATURE_BLOCK + TICKET_SIZE];
        bytes[..4].copy_from_slice(&0x0001_0001u32.to_be_bytes());

        bytes[SIGNATURE_BLOCK + OFF_TICKET_ID..SIGNATURE_BLOCK + OFF_TICKET_ID + 8]
            .copy_from_slice(&self.ticket_id.to_be_bytes());
        bytes[SIGNATURE_BLOCK + OFF_TITLE_ID..SIGNATURE_BLOCK + OFF_TITLE_ID + 8]
            .copy_from_slice(&self.title_id.to_be_bytes());

        let mut iv = [0; 16];
        iv[..8].copy_from_slice(&self.title_id.to_be_bytes());
        let wrapped = crypto::encrypt(&COMMON_KEY, &iv, &self.title_key).unwrap();
        bytes[SIGNATURE_BLOCK + OFF_TITLE_KEY..SIGNATURE_BLOCK + OFF_TITLE_KEY + 16]
            .copy_from_slice(&wrapped);

        TicketReader::new(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_ticket_is_valid() {
        let ticket = TicketBuilder::new(0x0001_0001_0000_0042)
            .ticket_id(7)
            .title_key([0x5a; 16])
            .build();
        assert!(ticket.is_valid());
        assert_eq!(ticket.payload_offset(), 320);
        assert_eq!(ticket.ticket_count(), 1);
        assert_eq!(ticket.title_id(), 0x0001_0001_0000_0042);
        assert_eq!(ticket.ticket().ticket_id, 7);
    }

    #[test]
    fn title_key_unwraps_to_the_plaintext_key() {
        let key = [0xc3; 16];
        let ticket = TicketBuilder::new(0x1234_5678_9abc_def0).title_key(key).build();
        assert_eq!(ticket.title_key(), key);
    }

    #[test]
    fn unknown_signature_type_is_invalid() {
        let mut bytes = TicketBuilder::new(1).build().raw_bytes().to_vec();
        bytes[..4].copy_from_slice(&0xdead_beefu32.to_be_bytes());
        assert!(!TicketReader::new(bytes).is_valid());
        assert!(!TicketReader::default().is_valid());
    }

    #[test]
    fn truncated_ticket_is_invalid() {
        let bytes = TicketBuilder::new(1).build().raw_bytes().to_vec();
        assert!(!TicketReader::new(bytes[..bytes.len() - 1].to_vec()).is_valid());
    }

    #[test]
    fn ticket_view_shape() {
        let ticket = TicketBuilder::new(0xabcd).ticket_id(0x0102_0304_0506_0708).build();
        let view = ticket.raw_ticket_view(0);
        assert_eq!(view.len(), TICKET_VIEW_SIZE);
        // View id first, then the ticket tail beginning with the ticket id.
        assert_eq!(&view[..4], &[0, 0, 0, 0]);
        assert_eq!(&view[4..12], &0x0102_0304_0506_0708u64.to_be_bytes());
    }
}
