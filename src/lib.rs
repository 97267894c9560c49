mod access;
mod context;
mod crypto;
mod device;
mod error;
mod export;
mod formats;
mod import;
mod ipc;
mod keys;
mod launch;
mod loader;
mod memory;
mod nand;

pub use access::{ContentTable, OpenedContent};
pub use context::{NullTitleChangeSink, TitleChangeSink, TitleContext};
pub use crypto::{
    content_iv, decrypt, decrypt_with_key_index, encrypt, encrypt_chained,
    encrypt_with_key_index, BLOCK_SIZE,
};
pub use device::{
    ioctl, CommandResult, EsDevice, EsState, IdentityProvider, Ios, PlaceholderIdentity,
    DEVICE_CERT_SIZE, SIGNATURE_SIZE,
};
pub use error::{
    Error, Result, ES_INVALID_TICKET, ES_INVALID_TMD, ES_NO_TICKET_INSTALLED,
    ES_PARAMETER_SIZE_OR_ALIGNMENT, ES_READ_LESS_DATA_THAN_EXPECTED, ES_WRITE_FAILURE,
    FS_EACCESS, FS_ENOENT, INVALID_CFD, IPC_SUCCESS,
};
pub use export::{ExportContent, ExportSession};
pub use formats::{
    is_title_type, split_title_id, ContentEntry, Ticket, TicketBuilder, TicketReader,
    TitleType, TmdBuilder, TmdReader, CONTENT_ENTRY_SIZE, MIOS_VERSION, TICKET_SIZE,
    TICKET_VIEW_SIZE, TITLE_ID_BC, TITLE_ID_SYSTEM_MENU, TMD_HEADER_SIZE,
};
pub use import::{ImportSession, NO_CONTENT};
pub use ipc::{
    read_result, write_ioctlv_frame, IoVector, IoctlvRequest, PendingRequests, Reply,
    ReplyQueue, Request, IPC_CMD_CLOSE, IPC_CMD_IOCTLV, IPC_CMD_OPEN, IPC_REPLY,
};
pub use keys::{KeyTable, KeyType, KEY_TABLE_LEN};
pub use launch::{
    di_verify, launch_bc, launch_title, LaunchContext, LaunchDisposition, LaunchError,
};
pub use loader::{ContentLoader, ContentManager, MemoryContentLoader, NandContentLoader};
pub use memory::GuestMemory;
pub use nand::{NandRoot, SharedContentMap, UidSys};
