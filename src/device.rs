//! The ES command dispatcher and the service harness.
//!
//! [`EsDevice`] is one open instance of the service: it owns the per-instance
//! state (descriptor table, import/export sessions, caller uid) and routes
//! every vectored command. [`EsState`] is the state that must outlive the
//! instance — the title context, the loader cache, and launch bookkeeping —
//! because launching a title can tear the device down and recreate it.
//! [`Ios`] ties both to a guest memory image and the reply queue.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::{debug, error, info, warn};

use crate::access::ContentTable;
use crate::context::{NullTitleChangeSink, TitleChangeSink, TitleContext};
use crate::crypto;
use crate::error::{
    Error, Result, ES_PARAMETER_SIZE_OR_ALIGNMENT, FS_ENOENT, INVALID_CFD, IPC_SUCCESS,
};
use crate::export::ExportSession;
use crate::formats::{TicketReader, TICKET_VIEW_SIZE};
use crate::import::ImportSession;
use crate::ipc::{
    IoVector, IoctlvRequest, PendingRequests, Reply, ReplyQueue, Request, IPC_CMD_CLOSE,
    IPC_CMD_IOCTLV, IPC_CMD_OPEN,
};
use crate::keys::{KeyTable, KeyType};
use crate::launch::{self, LaunchContext, LaunchDisposition, LaunchError};
use crate::loader::ContentManager;
use crate::memory::GuestMemory;
use crate::nand::NandRoot;

/// Vectored command codes.
pub mod ioctl {
    pub const ADD_TICKET: u32 = 0x01;
    pub const ADD_TITLE_START: u32 = 0x02;
    pub const ADD_CONTENT_START: u32 = 0x03;
    pub const ADD_CONTENT_DATA: u32 = 0x04;
    pub const ADD_CONTENT_FINISH: u32 = 0x05;
    pub const ADD_TITLE_FINISH: u32 = 0x06;
    pub const GET_DEVICE_ID: u32 = 0x07;
    pub const LAUNCH: u32 = 0x08;
    pub const OPEN_CONTENT: u32 = 0x09;
    pub const READ_CONTENT: u32 = 0x0a;
    pub const CLOSE_CONTENT: u32 = 0x0b;
    pub const GET_OWNED_TITLE_COUNT: u32 = 0x0c;
    pub const GET_OWNED_TITLES: u32 = 0x0d;
    pub const GET_TITLE_COUNT: u32 = 0x0e;
    pub const GET_TITLES: u32 = 0x0f;
    pub const GET_TITLE_CONTENTS_COUNT: u32 = 0x10;
    pub const GET_TITLE_CONTENTS: u32 = 0x11;
    pub const GET_VIEW_COUNT: u32 = 0x12;
    pub const GET_VIEWS: u32 = 0x13;
    pub const GET_TMD_VIEW_SIZE: u32 = 0x14;
    pub const GET_TMD_VIEWS: u32 = 0x15;
    pub const GET_CONSUMPTION: u32 = 0x16;
    pub const DELETE_TITLE: u32 = 0x17;
    pub const DELETE_TICKET: u32 = 0x18;
    pub const DI_GET_TMD_VIEW_SIZE: u32 = 0x19;
    pub const DI_GET_TMD_VIEW: u32 = 0x1a;
    pub const DI_GET_TICKET_VIEW: u32 = 0x1b;
    pub const GET_TITLE_DIR: u32 = 0x1d;
    pub const GET_DEVICE_CERT: u32 = 0x1e;
    pub const GET_TITLE_ID: u32 = 0x20;
    pub const SET_UID: u32 = 0x21;
    pub const DELETE_TITLE_CONTENT: u32 = 0x22;
    pub const SEEK_CONTENT: u32 = 0x23;
    pub const OPEN_TITLE_CONTENT: u32 = 0x24;
    pub const LAUNCH_BC: u32 = 0x25;
    pub const EXPORT_TITLE_INIT: u32 = 0x26;
    pub const EXPORT_CONTENT_BEGIN: u32 = 0x27;
    pub const EXPORT_CONTENT_DATA: u32 = 0x28;
    pub const EXPORT_CONTENT_END: u32 = 0x29;
    pub const EXPORT_TITLE_DONE: u32 = 0x2a;
    pub const ADD_TMD: u32 = 0x2b;
    pub const ENCRYPT: u32 = 0x2c;
    pub const DECRYPT: u32 = 0x2d;
    pub const GET_BOOT2_VERSION: u32 = 0x2e;
    pub const SIGN: u32 = 0x30;
    pub const GET_STORED_TMD_SIZE: u32 = 0x34;
    pub const GET_STORED_TMD: u32 = 0x35;
    pub const CHECK_KOREA_REGION: u32 = 0x45;
}

/// Size of a device certificate blob.
pub const DEVICE_CERT_SIZE: usize = 0x180;
/// Size of an ECC signature blob.
pub const SIGNATURE_SIZE: usize = 0x3c;

/// Device identity and signing material, treated as opaque inputs.
pub trait IdentityProvider {
    fn device_id(&self) -> u32;
    fn device_cert(&self) -> [u8; DEVICE_CERT_SIZE];
    /// Sign `data`, returning the signature and the certificate it chains to.
    fn sign(&self, data: &[u8]) -> ([u8; SIGNATURE_SIZE], [u8; DEVICE_CERT_SIZE]);
}

/// Fixed placeholder identity. No real console key material ships with the
/// emulator; the certificate carries the usual issuer chain and device name
/// over zeroed key fields, and signatures are a digest of the input.
#[derive(Debug, Default)]
pub struct PlaceholderIdentity;

impl PlaceholderIdentity {
    const DEVICE_ID: u32 = 0x0403_ac68;
}

impl IdentityProvider for PlaceholderIdentity {
    fn device_id(&self) -> u32 {
        Self::DEVICE_ID
    }

    fn device_cert(&self) -> [u8; DEVICE_CERT_SIZE] {
        let mut cert = [0; DEVICE_CERT_SIZE];
        cert[..4].copy_from_slice(&0x0001_0002u32.to_be_bytes());
        let issuer = b"Root-CA00000001-MS00000002";
        cert[0x80..0x80 + issuer.len()].copy_from_slice(issuer);
        let name = format!("NG{:08X}", Self::DEVICE_ID);
        cert[0xc4..0xc4 + name.len()].copy_from_slice(name.as_bytes());
        cert
    }

    fn sign(&self, data: &[u8]) -> ([u8; SIGNATURE_SIZE], [u8; DEVICE_CERT_SIZE]) {
        let mut signature = [0; SIGNATURE_SIZE];
        signature[..20].copy_from_slice(&Sha1::digest(data));
        (signature, self.device_cert())
    }
}

/// How a handled command resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandResult {
    /// Answer the request with this result code.
    Reply(i32),
    /// No reply now; acknowledgements were queued separately or the request
    /// was parked for later completion.
    NoReply,
    /// The service must be torn down and recreated as this IOS title.
    ReloadIos(u64),
}

/// Service state that survives a reload.
pub struct EsState {
    pub title_context: TitleContext,
    pub content_manager: ContentManager,
    pub pending_launch: Option<u64>,
    pub pending_requests: PendingRequests,
    pub ios_version: u32,
    launch_address: Option<u32>,
    sink: Box<dyn TitleChangeSink>,
}

impl EsState {
    pub fn new(nand: NandRoot, ios_version: u32) -> Self {
        EsState::with_sink(nand, ios_version, Box::new(NullTitleChangeSink))
    }

    pub fn with_sink(
        nand: NandRoot,
        ios_version: u32,
        sink: Box<dyn TitleChangeSink>,
    ) -> Self {
        EsState {
            title_context: TitleContext::new(),
            content_manager: ContentManager::new(nand),
            pending_launch: None,
            pending_requests: PendingRequests::new(),
            ios_version,
            launch_address: None,
            sink,
        }
    }

    fn launch_ctx(&mut self) -> LaunchContext<'_> {
        LaunchContext {
            title_context: &mut self.title_context,
            content_manager: &mut self.content_manager,
            sink: self.sink.as_mut(),
            pending_launch: &mut self.pending_launch,
        }
    }
}

/// One open instance of the ES device.
pub struct EsDevice {
    uid: u32,
    content_table: ContentTable,
    import: ImportSession,
    export: ExportSession,
    keys: KeyTable,
    identity: Box<dyn IdentityProvider>,
}

impl Default for EsDevice {
    fn default() -> Self {
        EsDevice::new()
    }
}

impl EsDevice {
    pub fn new() -> Self {
        EsDevice::with_identity(Box::new(PlaceholderIdentity))
    }

    pub fn with_identity(identity: Box<dyn IdentityProvider>) -> Self {
        EsDevice {
            uid: 0,
            content_table: ContentTable::new(),
            import: ImportSession::new(),
            export: ExportSession::new(),
            keys: KeyTable,
            identity,
        }
    }

    /// Device close: descriptors and cached loaders do not survive.
    pub fn close(&mut self, state: &mut EsState) {
        self.content_table.clear();
        state.content_manager.clear_cache();
    }

    /// Route one vectored command. Shape validation runs before any handler
    /// touches state; a request with the wrong vector counts is rejected
    /// without side effects.
    pub fn ioctlv(
        &mut self,
        state: &mut EsState,
        memory: &mut GuestMemory,
        replies: &mut ReplyQueue,
        request: &IoctlvRequest,
    ) -> CommandResult {
        if let Err(e) = request.zero_fill_outputs(memory) {
            return CommandResult::Reply(e.return_code());
        }
        if let Some((in_count, io_count)) = vector_shape(request.code) {
            if !request.has_number_of_valid_vectors(in_count, io_count) {
                warn!("Command {:#04x}: bad vector shape", request.code);
                return CommandResult::Reply(ES_PARAMETER_SIZE_OR_ALIGNMENT);
            }
        }

        match request.code {
            ioctl::LAUNCH => self.launch(state, memory, replies, request),
            ioctl::LAUNCH_BC => self.launch_bc(state, replies, request),
            _ => {
                let result = self.dispatch(state, memory, request);
                CommandResult::Reply(match result {
                    Ok(code) => code,
                    Err(e) => {
                        debug!("Command {:#04x} failed: {e}", request.code);
                        e.return_code()
                    }
                })
            }
        }
    }

    fn dispatch(
        &mut self,
        state: &mut EsState,
        memory: &mut GuestMemory,
        request: &IoctlvRequest,
    ) -> Result<i32> {
        let ins = &request.in_vectors;
        let ios = &request.io_vectors;
        let nand = state.content_manager.nand().clone();

        match request.code {
            ioctl::ADD_TICKET => {
                ImportSession::add_ticket(&nand, read_vec(memory, &ins[0])?)?;
                Ok(IPC_SUCCESS)
            }
            ioctl::ADD_TMD => {
                ImportSession::add_tmd(&nand, read_vec(memory, &ins[0])?)?;
                Ok(IPC_SUCCESS)
            }
            ioctl::ADD_TITLE_START => {
                self.import
                    .add_title_start(&nand, read_vec(memory, &ins[0])?)?;
                Ok(IPC_SUCCESS)
            }
            ioctl::ADD_CONTENT_START => {
                let title_id = in_u64(memory, &ins[0])?;
                let content_id = in_u32(memory, &ins[1])?;
                Ok(self.import.add_content_start(title_id, content_id)? as i32)
            }
            ioctl::ADD_CONTENT_DATA => {
                let _cfd = in_u32(memory, &ins[0])?;
                self.import.add_content_data(&read_vec(memory, &ins[1])?)?;
                Ok(IPC_SUCCESS)
            }
            ioctl::ADD_CONTENT_FINISH => {
                let _cfd = in_u32(memory, &ins[0])?;
                self.import.add_content_finish(&nand)?;
                let pending = self.import.pending_tmd();
                if pending.is_valid() {
                    state.content_manager.evict(pending.title_id());
                }
                Ok(IPC_SUCCESS)
            }
            ioctl::ADD_TITLE_FINISH => {
                let pending = self.import.pending_tmd();
                let title_id = pending.is_valid().then(|| pending.title_id());
                self.import.add_title_finish()?;
                if let Some(title_id) = title_id {
                    state.content_manager.evict(title_id);
                }
                Ok(IPC_SUCCESS)
            }

            ioctl::OPEN_CONTENT => {
                if !state.title_context.active() {
                    return Err(Error::Parameter);
                }
                let index = in_u32(memory, &ins[0])? as u16;
                let title_id = state.title_context.tmd().title_id();
                Ok(self.open_content(state, title_id, index))
            }
            ioctl::OPEN_TITLE_CONTENT => {
                let title_id = in_u64(memory, &ins[0])?;
                let index = in_u32(memory, &ins[2])? as u16;
                Ok(self.open_content(state, title_id, index))
            }
            ioctl::READ_CONTENT => {
                let cfd = in_u32(memory, &ins[0])?;
                self.read_content(state, memory, cfd, &ios[0])
            }
            ioctl::SEEK_CONTENT => {
                let cfd = in_u32(memory, &ins[0])?;
                let offset = in_u32(memory, &ins[1])?;
                let origin = in_u32(memory, &ins[2])?;
                Ok(self.content_table.seek(cfd, self.uid, offset, origin)? as i32)
            }
            ioctl::CLOSE_CONTENT => {
                let cfd = in_u32(memory, &ins[0])?;
                let slot = self.content_table.close(cfd, self.uid)?;
                let prefer = self.prefer_override(state, slot.title_id);
                state
                    .content_manager
                    .get(slot.title_id, prefer)
                    .close(slot.entry.index);
                Ok(IPC_SUCCESS)
            }

            ioctl::GET_OWNED_TITLE_COUNT => {
                out_u32(memory, &ios[0], nand.titles_with_tickets().len() as u32)?;
                Ok(IPC_SUCCESS)
            }
            ioctl::GET_OWNED_TITLES => {
                let count = in_u32(memory, &ins[0])?;
                write_titles(memory, &ios[0], &nand.titles_with_tickets(), count)
            }
            ioctl::GET_TITLE_COUNT => {
                out_u32(memory, &ios[0], nand.installed_titles().len() as u32)?;
                Ok(IPC_SUCCESS)
            }
            ioctl::GET_TITLES => {
                let count = in_u32(memory, &ins[0])?;
                write_titles(memory, &ios[0], &nand.installed_titles(), count)
            }

            ioctl::GET_TITLE_CONTENTS_COUNT => {
                let title_id = in_u64(memory, &ins[0])?;
                let loader = state.content_manager.get(title_id, false);
                if !loader.is_valid() {
                    return Err(Error::InvalidTmd);
                }
                out_u32(memory, &ios[0], u32::from(loader.tmd().num_contents()))?;
                Ok(IPC_SUCCESS)
            }
            ioctl::GET_TITLE_CONTENTS => {
                let title_id = in_u64(memory, &ins[0])?;
                let count = in_u32(memory, &ins[1])?;
                let loader = state.content_manager.get(title_id, false);
                if !loader.is_valid() {
                    return Err(Error::InvalidTmd);
                }
                if u64::from(ios[0].size) != u64::from(count) * 4 {
                    return Err(Error::Parameter);
                }
                for (i, entry) in loader
                    .tmd()
                    .contents()
                    .iter()
                    .take(count as usize)
                    .enumerate()
                {
                    memory.write_u32(ios[0].address + i as u32 * 4, entry.id)?;
                }
                Ok(IPC_SUCCESS)
            }

            ioctl::GET_VIEW_COUNT => {
                let title_id = in_u64(memory, &ins[0])?;
                let ticket = nand.find_signed_ticket(title_id);
                let count = if ticket.is_valid() { ticket.ticket_count() } else { 0 };
                out_u32(memory, &ios[0], count)?;
                Ok(IPC_SUCCESS)
            }
            ioctl::GET_VIEWS => {
                let title_id = in_u64(memory, &ins[0])?;
                let count = in_u32(memory, &ins[1])?;
                let ticket = nand.find_signed_ticket(title_id);
                if !ticket.is_valid() {
                    return Err(Error::NoTicketInstalled(title_id));
                }
                if u64::from(ios[0].size) < u64::from(count) * TICKET_VIEW_SIZE as u64 {
                    return Err(Error::Parameter);
                }
                for n in 0..count.min(ticket.ticket_count()) {
                    let view = ticket.raw_ticket_view(n);
                    memory.copy_to_guest(ios[0].address + n * TICKET_VIEW_SIZE as u32, &view)?;
                }
                Ok(IPC_SUCCESS)
            }

            ioctl::GET_TMD_VIEW_SIZE => {
                let title_id = in_u64(memory, &ins[0])?;
                let loader = state.content_manager.get(title_id, false);
                if !loader.is_valid() {
                    return Err(Error::InvalidTmd);
                }
                out_u32(memory, &ios[0], loader.tmd().raw_view().len() as u32)?;
                Ok(IPC_SUCCESS)
            }
            ioctl::GET_TMD_VIEWS => {
                let title_id = in_u64(memory, &ins[0])?;
                let size = in_u32(memory, &ins[1])?;
                let loader = state.content_manager.get(title_id, false);
                if !loader.is_valid() {
                    return Err(Error::InvalidTmd);
                }
                let view = loader.tmd().raw_view();
                if size as usize != view.len() || ios[0].size != size {
                    return Err(Error::Parameter);
                }
                memory.copy_to_guest(ios[0].address, &view)?;
                Ok(IPC_SUCCESS)
            }

            ioctl::GET_CONSUMPTION => {
                // Never observed with real consumption data; the zero-filled
                // outputs are the answer.
                debug!("GetConsumption");
                Ok(IPC_SUCCESS)
            }

            ioctl::DELETE_TITLE => {
                let title_id = in_u64(memory, &ins[0])?;
                if (title_id >> 32) == 1 && (title_id & 0xffff_ffff) <= 0x101 {
                    return Err(Error::Parameter);
                }
                nand.delete_title_dir(title_id)?;
                state.content_manager.evict(title_id);
                Ok(IPC_SUCCESS)
            }
            ioctl::DELETE_TICKET => {
                let title_id = in_u64(memory, &ins[0])?;
                nand.delete_ticket(title_id)?;
                state.content_manager.evict(title_id);
                Ok(IPC_SUCCESS)
            }
            ioctl::DELETE_TITLE_CONTENT => {
                let title_id = in_u64(memory, &ins[0])?;
                nand.delete_title_content(title_id)?;
                state.content_manager.evict(title_id);
                Ok(IPC_SUCCESS)
            }

            ioctl::DI_GET_TMD_VIEW_SIZE => {
                let view = self.di_tmd_view(state, memory, &ins[0])?;
                out_u32(memory, &ios[0], view.len() as u32)?;
                Ok(IPC_SUCCESS)
            }
            ioctl::DI_GET_TMD_VIEW => {
                let view = self.di_tmd_view(state, memory, &ins[0])?;
                let size = in_u32(memory, &ins[1])?;
                if size as usize != view.len() || ios[0].size != size {
                    return Err(Error::Parameter);
                }
                memory.copy_to_guest(ios[0].address, &view)?;
                Ok(IPC_SUCCESS)
            }
            ioctl::DI_GET_TICKET_VIEW => {
                if ios[0].size != TICKET_VIEW_SIZE as u32 {
                    return Err(Error::Parameter);
                }
                let view = if ins[0].size == 0 {
                    // No ticket supplied: view of the active title's ticket.
                    if !state.title_context.active() {
                        return Err(Error::Parameter);
                    }
                    state.title_context.ticket().raw_ticket_view(0)
                } else {
                    let ticket = TicketReader::new(read_vec(memory, &ins[0])?);
                    if !ticket.is_valid() {
                        return Err(Error::InvalidTicket);
                    }
                    ticket.raw_ticket_view(0)
                };
                memory.copy_to_guest(ios[0].address, &view)?;
                Ok(IPC_SUCCESS)
            }

            ioctl::GET_TITLE_DIR => {
                let title_id = in_u64(memory, &ins[0])?;
                let dir = NandRoot::guest_title_data_dir(title_id);
                if (ios[0].size as usize) <= dir.len() {
                    return Err(Error::Parameter);
                }
                memory.write_cstr(ios[0].address, &dir)?;
                Ok(IPC_SUCCESS)
            }
            ioctl::GET_TITLE_ID => {
                if !state.title_context.active() {
                    return Err(Error::Parameter);
                }
                if ios[0].size != 8 {
                    return Err(Error::Parameter);
                }
                memory.write_u64(ios[0].address, state.title_context.tmd().title_id())?;
                Ok(IPC_SUCCESS)
            }
            ioctl::SET_UID => {
                let title_id = in_u64(memory, &ins[0])?;
                self.uid = nand.uid_sys().add_title(title_id)?;
                Ok(IPC_SUCCESS)
            }

            ioctl::GET_DEVICE_ID => {
                out_u32(memory, &ios[0], self.identity.device_id())?;
                Ok(IPC_SUCCESS)
            }
            ioctl::GET_DEVICE_CERT => {
                if ios[0].size != DEVICE_CERT_SIZE as u32 {
                    return Err(Error::Parameter);
                }
                memory.copy_to_guest(ios[0].address, &self.identity.device_cert())?;
                Ok(IPC_SUCCESS)
            }
            ioctl::SIGN => {
                if ios[0].size != SIGNATURE_SIZE as u32
                    || ios[1].size != DEVICE_CERT_SIZE as u32
                {
                    return Err(Error::Parameter);
                }
                let data = read_vec(memory, &ins[0])?;
                let (signature, cert) = self.identity.sign(&data);
                memory.copy_to_guest(ios[0].address, &signature)?;
                memory.copy_to_guest(ios[1].address, &cert)?;
                Ok(IPC_SUCCESS)
            }

            ioctl::EXPORT_TITLE_INIT => {
                let title_id = in_u64(memory, &ins[0])?;
                let loader = state.content_manager.get(title_id, false);
                let tmd_bytes = self.export.title_init(loader, title_id)?;
                let len = tmd_bytes.len().min(ios[0].size as usize);
                memory.copy_to_guest(ios[0].address, &tmd_bytes[..len])?;
                Ok(IPC_SUCCESS)
            }
            ioctl::EXPORT_CONTENT_BEGIN => {
                let title_id = in_u64(memory, &ins[0])?;
                let content_id = in_u32(memory, &ins[1])?;
                let loader = state.content_manager.get(title_id, false);
                Ok(self.export.content_begin(loader, title_id, content_id)? as i32)
            }
            ioctl::EXPORT_CONTENT_DATA => {
                let ecid = in_u32(memory, &ins[0])?;
                if ios[0].size == 0 || !self.export.is_valid() {
                    return Err(Error::Parameter);
                }
                let title_id = self.export.title_id();
                let loader = state.content_manager.get(title_id, false);
                let data = self.export.content_data(loader, ecid, ios[0].size)?;
                let len = data.len().min(ios[0].size as usize);
                memory.copy_to_guest(ios[0].address, &data[..len])?;
                Ok(IPC_SUCCESS)
            }
            ioctl::EXPORT_CONTENT_END => {
                let ecid = in_u32(memory, &ins[0])?;
                if !self.export.is_valid() {
                    return Err(Error::Parameter);
                }
                let title_id = self.export.title_id();
                let loader = state.content_manager.get(title_id, false);
                self.export.content_end(loader, ecid)?;
                Ok(IPC_SUCCESS)
            }
            ioctl::EXPORT_TITLE_DONE => {
                self.export.title_done()?;
                Ok(IPC_SUCCESS)
            }

            ioctl::ENCRYPT => {
                let (output, iv) = self.cipher(memory, ins, true)?;
                memory.copy_to_guest(ios[0].address, &iv)?;
                memory.copy_to_guest(ios[1].address, &output)?;
                Ok(IPC_SUCCESS)
            }
            ioctl::DECRYPT => {
                let (output, iv) = self.cipher(memory, ins, false)?;
                memory.copy_to_guest(ios[0].address, &iv)?;
                memory.copy_to_guest(ios[1].address, &output)?;
                Ok(IPC_SUCCESS)
            }

            ioctl::GET_BOOT2_VERSION => {
                out_u32(memory, &ios[0], 4)?;
                Ok(IPC_SUCCESS)
            }

            ioctl::GET_STORED_TMD_SIZE => {
                let title_id = in_u64(memory, &ins[0])?;
                let tmd = nand.read_tmd(title_id).map_err(|_| Error::InvalidTmd)?;
                if !tmd.is_valid() {
                    return Err(Error::InvalidTmd);
                }
                out_u32(memory, &ios[0], tmd.raw_bytes().len() as u32)?;
                Ok(IPC_SUCCESS)
            }
            ioctl::GET_STORED_TMD => {
                let title_id = in_u64(memory, &ins[0])?;
                let size = in_u32(memory, &ins[1])?;
                let tmd = nand.read_tmd(title_id).map_err(|_| Error::InvalidTmd)?;
                if !tmd.is_valid() {
                    return Err(Error::InvalidTmd);
                }
                if size as usize != tmd.raw_bytes().len() || ios[0].size != size {
                    return Err(Error::Parameter);
                }
                memory.copy_to_guest(ios[0].address, tmd.raw_bytes())?;
                Ok(IPC_SUCCESS)
            }

            ioctl::CHECK_KOREA_REGION => {
                // Only one known caller, and it expects this to fail.
                Err(Error::Parameter)
            }

            code => {
                warn!("Unimplemented ioctlv {code:#04x}, replying success");
                Ok(IPC_SUCCESS)
            }
        }
    }

    fn prefer_override(&self, state: &EsState, title_id: u64) -> bool {
        state.content_manager.has_override()
            && state.title_context.active()
            && state.title_context.tmd().title_id() == title_id
    }

    /// Resolve and open a content, returning the new descriptor or the
    /// all-ones sentinel when the title, entry, or stream is missing.
    fn open_content(&mut self, state: &mut EsState, title_id: u64, index: u16) -> i32 {
        let prefer = self.prefer_override(state, title_id);
        let loader = state.content_manager.get(title_id, prefer);
        if !loader.is_valid() {
            return INVALID_CFD as i32;
        }
        let Some(entry) = loader.content_by_index(index) else {
            return INVALID_CFD as i32;
        };
        if !loader.open(entry.index) {
            return INVALID_CFD as i32;
        }
        self.content_table.open(self.uid, title_id, entry) as i32
    }

    /// Read from an open descriptor into the output vector, clamped to the
    /// content's declared size. Returns the number of bytes read.
    fn read_content(
        &mut self,
        state: &mut EsState,
        memory: &mut GuestMemory,
        cfd: u32,
        io: &IoVector,
    ) -> Result<i32> {
        let slot = self.content_table.get(cfd, self.uid)?;
        let remaining = slot.entry.size.saturating_sub(slot.position);
        let length = u64::from(io.size).min(remaining) as usize;
        if length == 0 {
            return Ok(0);
        }

        let (title_id, index, position) = (slot.title_id, slot.entry.index, slot.position);
        let prefer = self.prefer_override(state, title_id);
        let mut buffer = vec![0; length];
        if !state
            .content_manager
            .get(title_id, prefer)
            .read_range(index, position, &mut buffer)
        {
            return Err(Error::ShortRead);
        }
        memory.copy_to_guest(io.address, &buffer)?;

        let slot = self.content_table.get(cfd, self.uid)?;
        slot.position += length as u64;
        Ok(length as i32)
    }

    /// The TMD view for the disc interface: an explicit title when the
    /// input carries one, the active title otherwise.
    fn di_tmd_view(
        &mut self,
        state: &mut EsState,
        memory: &GuestMemory,
        input: &IoVector,
    ) -> Result<Vec<u8>> {
        if input.size == 8 {
            let title_id = memory.read_u64(input.address)?;
            let loader = state.content_manager.get(title_id, false);
            if !loader.is_valid() {
                return Err(Error::InvalidTmd);
            }
            Ok(loader.tmd().raw_view())
        } else if input.size == 0 {
            if !state.title_context.active() {
                return Err(Error::Parameter);
            }
            Ok(state.title_context.tmd().raw_view())
        } else {
            Err(Error::Parameter)
        }
    }

    /// Common body of the Encrypt/Decrypt commands: key index, IV, data in;
    /// IV copy and transformed data out.
    fn cipher(
        &self,
        memory: &GuestMemory,
        ins: &[IoVector],
        encrypt: bool,
    ) -> Result<(Vec<u8>, [u8; 16])> {
        let key = KeyType::from_index(in_u32(memory, &ins[0])?).ok_or(Error::Parameter)?;
        if ins[1].size != 16 {
            return Err(Error::Parameter);
        }
        let mut iv = [0; 16];
        memory.copy_from_guest(ins[1].address, &mut iv)?;
        let data = read_vec(memory, &ins[2])?;
        if encrypt {
            crypto::encrypt_with_key_index(&self.keys, key, &iv, &data)
        } else {
            crypto::decrypt_with_key_index(&self.keys, key, &iv, &data)
        }
    }

    fn launch(
        &mut self,
        state: &mut EsState,
        memory: &GuestMemory,
        replies: &mut ReplyQueue,
        request: &IoctlvRequest,
    ) -> CommandResult {
        if request.in_vectors[1].size != TICKET_VIEW_SIZE as u32 {
            return CommandResult::Reply(ES_PARAMETER_SIZE_OR_ALIGNMENT);
        }
        let title_id = match in_u64(memory, &request.in_vectors[0]) {
            Ok(title_id) => title_id,
            Err(e) => return CommandResult::Reply(e.return_code()),
        };
        let outcome = launch::launch_title(state.launch_ctx(), title_id, false);
        self.finish_launch(state, replies, request.address, outcome)
    }

    fn launch_bc(
        &mut self,
        state: &mut EsState,
        replies: &mut ReplyQueue,
        request: &IoctlvRequest,
    ) -> CommandResult {
        let version = state.ios_version;
        let outcome = launch::launch_bc(state.launch_ctx(), version);
        self.finish_launch(state, replies, request.address, outcome)
    }

    /// Successful launches follow the double-acknowledgement convention:
    /// one ack now, a second from the recreated instance's init. Failures
    /// get a single ordinary error reply.
    fn finish_launch(
        &mut self,
        state: &mut EsState,
        replies: &mut ReplyQueue,
        address: u32,
        outcome: std::result::Result<LaunchDisposition, LaunchError>,
    ) -> CommandResult {
        match outcome {
            Ok(LaunchDisposition::ReloadIos(ios_title_id)) => {
                state.launch_address = Some(address);
                replies.push_ack(address);
                CommandResult::ReloadIos(ios_title_id)
            }
            Ok(LaunchDisposition::Bootstrapped) => {
                replies.push_ack(address);
                replies.push_ack(address);
                CommandResult::NoReply
            }
            Err(e) => {
                error!("Launch failed: {e}");
                let code = match &e {
                    LaunchError::MissingFromNand(_) => FS_ENOENT,
                    LaunchError::Other(inner) => inner.return_code(),
                };
                CommandResult::Reply(code)
            }
        }
    }
}

fn vector_shape(code: u32) -> Option<(usize, usize)> {
    Some(match code {
        ioctl::ADD_TICKET => (3, 0),
        ioctl::ADD_TITLE_START => (4, 0),
        ioctl::ADD_CONTENT_START => (2, 0),
        ioctl::ADD_CONTENT_DATA => (2, 0),
        ioctl::ADD_CONTENT_FINISH => (1, 0),
        ioctl::ADD_TITLE_FINISH => (0, 0),
        ioctl::GET_DEVICE_ID => (0, 1),
        ioctl::LAUNCH => (2, 0),
        ioctl::OPEN_CONTENT => (1, 0),
        ioctl::READ_CONTENT => (1, 1),
        ioctl::CLOSE_CONTENT => (1, 0),
        ioctl::GET_OWNED_TITLE_COUNT => (0, 1),
        ioctl::GET_OWNED_TITLES => (1, 1),
        ioctl::GET_TITLE_COUNT => (0, 1),
        ioctl::GET_TITLES => (1, 1),
        ioctl::GET_TITLE_CONTENTS_COUNT => (1, 1),
        ioctl::GET_TITLE_CONTENTS => (2, 1),
        ioctl::GET_VIEW_COUNT => (1, 1),
        ioctl::GET_VIEWS => (2, 1),
        ioctl::GET_TMD_VIEW_SIZE => (1, 1),
        ioctl::GET_TMD_VIEWS => (2, 1),
        ioctl::GET_CONSUMPTION => (1, 2),
        ioctl::DELETE_TITLE => (1, 0),
        ioctl::DELETE_TICKET => (1, 0),
        ioctl::DI_GET_TMD_VIEW_SIZE => (1, 1),
        ioctl::DI_GET_TMD_VIEW => (2, 1),
        ioctl::DI_GET_TICKET_VIEW => (1, 1),
        ioctl::GET_TITLE_DIR => (1, 1),
        ioctl::GET_DEVICE_CERT => (0, 1),
        ioctl::GET_TITLE_ID => (0, 1),
        ioctl::SET_UID => (1, 0),
        ioctl::DELETE_TITLE_CONTENT => (1, 0),
        ioctl::SEEK_CONTENT => (3, 0),
        ioctl::OPEN_TITLE_CONTENT => (3, 0),
        ioctl::LAUNCH_BC => (0, 0),
        ioctl::EXPORT_TITLE_INIT => (1, 1),
        ioctl::EXPORT_CONTENT_BEGIN => (2, 0),
        ioctl::EXPORT_CONTENT_DATA => (1, 1),
        ioctl::EXPORT_CONTENT_END => (1, 0),
        ioctl::EXPORT_TITLE_DONE => (0, 0),
        ioctl::ADD_TMD => (1, 0),
        ioctl::ENCRYPT => (3, 2),
        ioctl::DECRYPT => (3, 2),
        ioctl::GET_BOOT2_VERSION => (0, 1),
        ioctl::SIGN => (1, 2),
        ioctl::GET_STORED_TMD_SIZE => (1, 1),
        ioctl::GET_STORED_TMD => (2, 1),
        ioctl::CHECK_KOREA_REGION => (0, 0),
        _ => return None,
    })
}

fn read_vec(memory: &GuestMemory, vector: &IoVector) -> Result<Vec<u8>> {
    memory.read_bytes(vector.address, vector.size)
}

fn in_u32(memory: &GuestMemory, vector: &IoVector) -> Result<u32> {
    if vector.size != 4 {
        return Err(Error::Parameter);
    }
    memory.read_u32(vector.address)
}

fn in_u64(memory: &GuestMemory, vector: &IoVector) -> Result<u64> {
    if vector.size != 8 {
        return Err(Error::Parameter);
    }
    memory.read_u64(vector.address)
}

fn out_u32(memory: &mut GuestMemory, vector: &IoVector, value: u32) -> Result<()> {
    if vector.size != 4 {
        return Err(Error::Parameter);
    }
    memory.write_u32(vector.address, value)
}

fn write_titles(
    memory: &mut GuestMemory,
    io: &IoVector,
    titles: &[u64],
    count: u32,
) -> Result<i32> {
    // The count is guest-controlled; widen before multiplying.
    if u64::from(io.size) != u64::from(count) * 8 {
        return Err(Error::Parameter);
    }
    for (i, title_id) in titles.iter().take(count as usize).enumerate() {
        memory.write_u64(io.address + i as u32 * 8, *title_id)?;
    }
    Ok(IPC_SUCCESS)
}

/// The service harness: guest memory, reply queue, persistent state, and
/// the current device instance.
pub struct Ios {
    memory: GuestMemory,
    replies: ReplyQueue,
    state: EsState,
    device: EsDevice,
}

impl Ios {
    pub fn new(nand: NandRoot, memory_size: usize, ios_version: u32) -> Self {
        Ios {
            memory: GuestMemory::new(memory_size),
            replies: ReplyQueue::new(),
            state: EsState::new(nand, ios_version),
            device: EsDevice::new(),
        }
    }

    pub fn memory(&self) -> &GuestMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut GuestMemory {
        &mut self.memory
    }

    pub fn state(&self) -> &EsState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut EsState {
        &mut self.state
    }

    pub fn ios_version(&self) -> u32 {
        self.state.ios_version
    }

    /// Process the request at `address`. Replies are queued, not yet
    /// written back; call [`Ios::flush_replies`] to deliver them.
    pub fn dispatch(&mut self, address: u32) -> Result<()> {
        let request = Request::read(&self.memory, address)?;
        match request.command {
            IPC_CMD_OPEN => self.replies.push_reply(address, request.fd as i32),
            IPC_CMD_CLOSE => {
                self.device.close(&mut self.state);
                self.replies.push_reply(address, IPC_SUCCESS);
            }
            IPC_CMD_IOCTLV => {
                let ioctlv = IoctlvRequest::read(&self.memory, address)?;
                let result = self.device.ioctlv(
                    &mut self.state,
                    &mut self.memory,
                    &mut self.replies,
                    &ioctlv,
                );
                match result {
                    CommandResult::Reply(code) => self.replies.push_reply(address, code),
                    CommandResult::NoReply => {}
                    CommandResult::ReloadIos(ios_title_id) => self.reload(ios_title_id),
                }
            }
            other => {
                warn!("Unhandled command {other} at {address:#x}");
                self.replies.push_reply(address, IPC_SUCCESS);
            }
        }
        Ok(())
    }

    /// Write queued replies into guest memory and return them.
    pub fn flush_replies(&mut self) -> Result<Vec<Reply>> {
        self.replies.flush(&mut self.memory)
    }

    /// Park the request at `address` for deferred completion.
    pub fn park_request(&mut self, address: u32) {
        self.state.pending_requests.park(address);
    }

    /// External-event completion of a parked request.
    pub fn complete_request(&mut self, address: u32, return_code: i32) {
        self.state
            .pending_requests
            .complete(address, return_code, &mut self.replies);
    }

    /// Tear the device down and come back up as `ios_title_id`. Pending
    /// launch state survives; everything per-instance does not.
    pub fn reload(&mut self, ios_title_id: u64) {
        info!("Reloading into IOS {:016x}", ios_title_id);
        self.state.ios_version = ios_title_id as u32;
        self.state.content_manager.clear_cache();
        self.device = EsDevice::new();
        self.init();
    }

    /// Post-reload initialization: finish a deferred launch, then deliver
    /// the second acknowledgement the launch convention owes the guest.
    fn init(&mut self) {
        if let Some(title_id) = self.state.pending_launch.take() {
            match launch::launch_title(self.state.launch_ctx(), title_id, true) {
                Ok(LaunchDisposition::Bootstrapped) => {}
                Ok(LaunchDisposition::ReloadIos(_)) => {
                    warn!("Deferred launch of {title_id:016x} asked for another reload")
                }
                Err(e) => error!("Deferred launch of {title_id:016x} failed: {e}"),
            }
        }
        if let Some(address) = self.state.launch_address.take() {
            self.replies.push_ack(address);
        }
    }

    /// Serialize the snapshot-relevant state: sessions, context, and the
    /// descriptor table. Backing streams are not serialized; restore
    /// re-resolves them from (title id, index).
    pub fn snapshot(&self) -> Result<String> {
        #[derive(Serialize)]
        struct Snapshot<'a> {
            title_context: &'a TitleContext,
            pending_launch: Option<u64>,
            launch_address: Option<u32>,
            pending_requests: &'a PendingRequests,
            ios_version: u32,
            import: &'a ImportSession,
            export: &'a ExportSession,
            content_table: &'a ContentTable,
            uid: u32,
        }
        Ok(serde_json::to_string(&Snapshot {
            title_context: &self.state.title_context,
            pending_launch: self.state.pending_launch,
            launch_address: self.state.launch_address,
            pending_requests: &self.state.pending_requests,
            ios_version: self.state.ios_version,
            import: &self.device.import,
            export: &self.device.export,
            content_table: &self.device.content_table,
            uid: self.device.uid,
        })?)
    }

    pub fn restore(&mut self, snapshot: &str) -> Result<()> {
        #[derive(Deserialize)]
        struct Snapshot {
            title_context: TitleContext,
            pending_launch: Option<u64>,
            launch_address: Option<u32>,
            pending_requests: PendingRequests,
            ios_version: u32,
            import: ImportSession,
            export: ExportSession,
            content_table: ContentTable,
            uid: u32,
        }
        let snapshot: Snapshot = serde_json::from_str(snapshot)?;

        self.state.title_context = snapshot.title_context;
        self.state.pending_launch = snapshot.pending_launch;
        self.state.launch_address = snapshot.launch_address;
        self.state.pending_requests = snapshot.pending_requests;
        self.state.ios_version = snapshot.ios_version;
        self.device.import = snapshot.import;
        self.device.export = snapshot.export;
        self.device.content_table = snapshot.content_table;
        self.device.uid = snapshot.uid;

        // Descriptors point at streams that were never serialized; resolve
        // and reopen each one.
        self.state.content_manager.clear_cache();
        let reopen: Vec<(u64, u16)> = self
            .device
            .content_table
            .iter_open()
            .map(|(_, slot)| (slot.title_id, slot.entry.index))
            .collect();
        for (title_id, index) in reopen {
            if !self.state.content_manager.get(title_id, false).open(index) {
                warn!("Snapshot references missing content {index} of {title_id:016x}");
            }
        }
        Ok(())
    }
}
