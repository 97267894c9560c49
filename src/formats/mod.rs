//! On-wire formats of the ES module: title metadata (TMD) and tickets.
//!
//! Both records are signed blobs that the service receives as raw byte
//! vectors from the guest or reads back from the NAND. The readers keep the
//! original bytes around (signatures must survive round trips bit-exact) and
//! decode fields on demand; validity is derived from structure, never stored.

mod ticket;
mod tmd;

pub use ticket::{Ticket, TicketBuilder, TicketReader, TICKET_SIZE, TICKET_VIEW_SIZE};
pub use tmd::{ContentEntry, TmdBuilder, TmdReader, CONTENT_ENTRY_SIZE, TMD_HEADER_SIZE};

/// Title id of the system menu. The launch path treats it like an ordinary
/// title even though its type is System.
pub const TITLE_ID_SYSTEM_MENU: u64 = 0x0000_0001_0000_0002;
/// Title id of the GameCube compatibility launcher.
pub const TITLE_ID_BC: u64 = 0x0000_0001_0000_0100;
/// IOS version used while in GameCube compatibility mode.
pub const MIOS_VERSION: u32 = 0x101;

/// Title types, as stored in the high 32 bits of a title id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TitleType {
    System = 0x0000_0001,
    Game = 0x0001_0000,
    Channel = 0x0001_0001,
    SystemChannel = 0x0001_0002,
    GameWithChannel = 0x0001_0004,
    Dlc = 0x0001_0005,
    HiddenChannel = 0x0001_0008,
}

/// Whether the high word of `title_id` matches `title_type`.
pub fn is_title_type(title_id: u64, title_type: TitleType) -> bool {
    (title_id >> 32) as u32 == title_type as u32
}

/// Split a title id into its (type, instance) halves.
pub fn split_title_id(title_id: u64) -> (u32, u32) {
    ((title_id >> 32) as u32, title_id as u32)
}

pub(crate) fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes(bytes[offset..offset + 2].try_into().unwrap())
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

pub(crate) fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_be_bytes(bytes[offset..offset + 8].try_into().unwrap())
}
