//! Error handling for the ES service.
//!
//! Two layers exist side by side:
//!
//! * [`Error`] is the typed error used inside the crate. Operations return
//!   `Result<T, Error>` and propagate with `?`.
//! * The return-code constants are the 32-bit result codes written back into
//!   the guest request buffer. `0` is success, negative values are the legacy
//!   ES/FS error numbers. Handlers convert at the dispatch boundary via
//!   [`Error::return_code`].
//!
//! The numeric values are part of the guest-visible contract and must not be
//! changed.

use thiserror::Error;

/// IPC success.
pub const IPC_SUCCESS: i32 = 0;
/// Malformed or mismatched vector shapes, bad sizes, or bad alignment.
/// IOS also returns this for a number of unrelated failures (notably ticket
/// view and export validation), so it shows up a lot.
pub const ES_PARAMETER_SIZE_OR_ALIGNMENT: i32 = -1017;
/// A content read returned fewer bytes than the declared content size allows.
pub const ES_READ_LESS_DATA_THAN_EXPECTED: i32 = -1009;
/// Persisting data to the NAND failed.
pub const ES_WRITE_FAILURE: i32 = -1010;
/// The TMD is structurally invalid. Shares its value with `FS_ENOENT`.
pub const ES_INVALID_TMD: i32 = -106;
/// No signed ticket is installed for the requested title.
pub const ES_NO_TICKET_INSTALLED: i32 = -1028;
/// The ticket is structurally invalid.
pub const ES_INVALID_TICKET: i32 = -1035;
/// File or title not found on the NAND.
pub const FS_ENOENT: i32 = -106;
/// Access to a NAND path was denied.
pub const FS_EACCESS: i32 = -102;

/// Sentinel returned by the content-open paths when no handle could be
/// allocated. This is a handle-shaped value, not a return code.
pub const INVALID_CFD: u32 = 0xffff_ffff;

/// Typed error for all ES operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Request vector shape did not match what the handler declared, or a
    /// parameter failed size/alignment validation.
    #[error("parameter size or alignment error")]
    Parameter,

    /// Guest memory access outside the mapped image.
    #[error("guest memory access out of bounds: address {address:#x}, length {length:#x}")]
    Memory { address: u32, length: u32 },

    /// TMD failed structural validation.
    #[error("invalid TMD")]
    InvalidTmd,

    /// Ticket failed structural validation.
    #[error("invalid ticket")]
    InvalidTicket,

    /// No signed ticket installed for the title.
    #[error("no ticket installed for title {0:016x}")]
    NoTicketInstalled(u64),

    /// A NAND write could not be completed.
    #[error("write failure: {0}")]
    WriteFailure(String),

    /// Title, content, or file missing from the NAND.
    #[error("not found")]
    NotFound,

    /// A NAND path could not be removed or rewritten.
    #[error("access denied")]
    AccessDenied,

    /// The backing content stream returned less data than expected.
    #[error("read less data than expected")]
    ShortRead,

    /// Underlying filesystem error while touching the NAND layout.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Cipher input was not a multiple of the AES block size.
    #[error("crypto buffer length {0} is not block-aligned")]
    BlockAlignment(usize),

    /// State snapshot could not be encoded or decoded.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),
}

impl Error {
    /// Map the typed error to the legacy wire code.
    pub fn return_code(&self) -> i32 {
        match self {
            Error::Parameter | Error::Memory { .. } => ES_PARAMETER_SIZE_OR_ALIGNMENT,
            Error::InvalidTmd => ES_INVALID_TMD,
            Error::InvalidTicket => ES_INVALID_TICKET,
            Error::NoTicketInstalled(_) => ES_NO_TICKET_INSTALLED,
            Error::WriteFailure(_) | Error::Io(_) => ES_WRITE_FAILURE,
            Error::NotFound => FS_ENOENT,
            Error::AccessDenied => FS_EACCESS,
            Error::ShortRead => ES_READ_LESS_DATA_THAN_EXPECTED,
            Error::BlockAlignment(_) => ES_PARAMETER_SIZE_OR_ALIGNMENT,
            Error::Snapshot(_) => ES_WRITE_FAILURE,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_match_legacy_values() {
        assert_eq!(Error::Parameter.return_code(), -1017);
        assert_eq!(Error::InvalidTmd.return_code(), -106);
        assert_eq!(Error::NoTicketInstalled(0).return_code(), -1028);
        assert_eq!(Error::ShortRead.return_code(), -1009);
        assert_eq!(Error::NotFound.return_code(), FS_ENOENT);
        assert_eq!(Error::AccessDenied.return_code(), -102);
    }
}
