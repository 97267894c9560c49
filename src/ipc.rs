//! Guest command framing and reply plumbing.
//!
//! Requests live in guest memory; a request's own address doubles as its
//! identity. The command word sits at the base address, the result code is
//! written back at base + 4, and the device descriptor at base + 8. Vectored
//! commands carry their ioctl code and two descriptor lists behind that.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::memory::GuestMemory;

/// Command words of the request header.
pub const IPC_CMD_OPEN: u32 = 1;
pub const IPC_CMD_CLOSE: u32 = 2;
pub const IPC_CMD_IOCTLV: u32 = 7;
/// Written back into the command word once a request has been answered.
pub const IPC_REPLY: u32 = 8;

// Request header offsets.
const OFF_COMMAND: u32 = 0x00;
const OFF_RESULT: u32 = 0x04;
const OFF_FD: u32 = 0x08;
const OFF_IOCTLV_CODE: u32 = 0x0c;
const OFF_IN_COUNT: u32 = 0x10;
const OFF_IO_COUNT: u32 = 0x14;
const OFF_VECTOR_TABLE: u32 = 0x18;

/// One buffer descriptor of a vectored command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoVector {
    pub address: u32,
    pub size: u32,
}

/// The common request header.
#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub address: u32,
    pub command: u32,
    pub fd: u32,
}

impl Request {
    pub fn read(memory: &GuestMemory, address: u32) -> Result<Self> {
        Ok(Request {
            address,
            command: memory.read_u32(address + OFF_COMMAND)?,
            fd: memory.read_u32(address + OFF_FD)?,
        })
    }
}

/// A fully decoded vectored command.
#[derive(Debug, Clone)]
pub struct IoctlvRequest {
    pub address: u32,
    pub fd: u32,
    pub code: u32,
    pub in_vectors: Vec<IoVector>,
    pub io_vectors: Vec<IoVector>,
}

impl IoctlvRequest {
    pub fn read(memory: &GuestMemory, address: u32) -> Result<Self> {
        let fd = memory.read_u32(address + OFF_FD)?;
        let code = memory.read_u32(address + OFF_IOCTLV_CODE)?;
        let in_count = memory.read_u32(address + OFF_IN_COUNT)?;
        let io_count = memory.read_u32(address + OFF_IO_COUNT)?;
        let table = memory.read_u32(address + OFF_VECTOR_TABLE)?;

        let mut read_vectors = |base: u32, count: u32| -> Result<Vec<IoVector>> {
            (0..count)
                .map(|i| {
                    let at = base + i * 8;
                    Ok(IoVector {
                        address: memory.read_u32(at)?,
                        size: memory.read_u32(at + 4)?,
                    })
                })
                .collect()
        };
        let in_vectors = read_vectors(table, in_count)?;
        let io_vectors = read_vectors(table + in_count * 8, io_count)?;

        Ok(IoctlvRequest {
            address,
            fd,
            code,
            in_vectors,
            io_vectors,
        })
    }

    /// Shape check every handler runs first: exact vector counts, and no
    /// null address on a descriptor that claims a size.
    pub fn has_number_of_valid_vectors(&self, in_count: usize, io_count: usize) -> bool {
        let valid = |v: &IoVector| v.size == 0 || v.address != 0;
        self.in_vectors.len() == in_count
            && self.io_vectors.len() == io_count
            && self.in_vectors.iter().all(valid)
            && self.io_vectors.iter().all(valid)
    }

    /// Clear every output buffer that is not aliased by an input buffer, so
    /// handlers that bail early never leak stale guest data.
    pub fn zero_fill_outputs(&self, memory: &mut GuestMemory) -> Result<()> {
        for io in &self.io_vectors {
            let aliased = self.in_vectors.iter().any(|v| v.address == io.address);
            if !aliased && io.address != 0 {
                memory.memset(io.address, 0, io.size)?;
            }
        }
        Ok(())
    }
}

/// Lay out a vectored request frame in guest memory: the header at
/// `address`, the descriptor table at `table`, inputs before outputs. This
/// is the exact layout [`IoctlvRequest::read`] expects; embedders and tests
/// use it to fabricate guest requests.
pub fn write_ioctlv_frame(
    memory: &mut GuestMemory,
    address: u32,
    fd: u32,
    code: u32,
    table: u32,
    in_vectors: &[IoVector],
    io_vectors: &[IoVector],
) -> Result<()> {
    memory.write_u32(address + OFF_COMMAND, IPC_CMD_IOCTLV)?;
    memory.write_u32(address + OFF_FD, fd)?;
    memory.write_u32(address + OFF_IOCTLV_CODE, code)?;
    memory.write_u32(address + OFF_IN_COUNT, in_vectors.len() as u32)?;
    memory.write_u32(address + OFF_IO_COUNT, io_vectors.len() as u32)?;
    memory.write_u32(address + OFF_VECTOR_TABLE, table)?;
    for (i, vector) in in_vectors.iter().chain(io_vectors).enumerate() {
        let at = table + i as u32 * 8;
        memory.write_u32(at, vector.address)?;
        memory.write_u32(at + 4, vector.size)?;
    }
    Ok(())
}

/// Result code of an answered request, as the guest would read it.
pub fn read_result(memory: &GuestMemory, address: u32) -> Result<i32> {
    Ok(memory.read_u32(address + OFF_RESULT)? as i32)
}

/// One answered request, ready to be signalled to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub address: u32,
    pub return_code: i32,
    /// Acknowledgement without a reply payload (the launch convention).
    pub ack_only: bool,
}

/// Outgoing replies, in order. The owner drains the queue and raises the
/// guest-side completion interrupt per entry.
#[derive(Debug, Default)]
pub struct ReplyQueue {
    queue: VecDeque<Reply>,
}

impl ReplyQueue {
    pub fn new() -> Self {
        ReplyQueue::default()
    }

    pub fn push_reply(&mut self, address: u32, return_code: i32) {
        self.queue.push_back(Reply {
            address,
            return_code,
            ack_only: false,
        });
    }

    pub fn push_ack(&mut self, address: u32) {
        self.queue.push_back(Reply {
            address,
            return_code: 0,
            ack_only: true,
        });
    }

    /// Write each pending reply into guest memory (result at base + 4, the
    /// command word flipped to `IPC_REPLY`) and drain the queue.
    /// Acknowledgements only signal completion; the request buffer is left
    /// untouched.
    pub fn flush(&mut self, memory: &mut GuestMemory) -> Result<Vec<Reply>> {
        let mut flushed = Vec::with_capacity(self.queue.len());
        while let Some(reply) = self.queue.pop_front() {
            if !reply.ack_only {
                memory.write_u32(reply.address + OFF_RESULT, reply.return_code as u32)?;
                memory.write_u32(reply.address + OFF_COMMAND, IPC_REPLY)?;
            }
            flushed.push(reply);
        }
        Ok(flushed)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Requests parked without a reply, keyed by their own address. An external
/// event (a hardware button notification, say) completes exactly one entry
/// later; resetting the whole context simply drops them.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PendingRequests {
    parked: HashSet<u32>,
}

impl PendingRequests {
    pub fn new() -> Self {
        PendingRequests::default()
    }

    pub fn park(&mut self, address: u32) {
        self.parked.insert(address);
    }

    pub fn is_parked(&self, address: u32) -> bool {
        self.parked.contains(&address)
    }

    /// Complete a parked request, enqueueing its reply. Completing an
    /// address that was never parked is ignored with a log line.
    pub fn complete(&mut self, address: u32, return_code: i32, replies: &mut ReplyQueue) {
        if !self.parked.remove(&address) {
            warn!("Completion for unparked request {address:#x}");
            return;
        }
        replies.push_reply(address, return_code);
    }

    pub fn clear(&mut self) {
        self.parked.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_ioctlv(memory: &mut GuestMemory, base: u32, code: u32, vectors: &[(u32, u32)], in_count: u32) {
        let vectors: Vec<IoVector> = vectors
            .iter()
            .map(|&(address, size)| IoVector { address, size })
            .collect();
        let (ins, ios) = vectors.split_at(in_count as usize);
        write_ioctlv_frame(memory, base, 0, code, base + 0x40, ins, ios).unwrap();
    }

    #[test]
    fn ioctlv_decoding() {
        let mut memory = GuestMemory::new(0x1000);
        write_ioctlv(&mut memory, 0x100, 0x12, &[(0x200, 8), (0x300, 4)], 1);

        let request = IoctlvRequest::read(&memory, 0x100).unwrap();
        assert_eq!(request.code, 0x12);
        assert_eq!(request.in_vectors, vec![IoVector { address: 0x200, size: 8 }]);
        assert_eq!(request.io_vectors, vec![IoVector { address: 0x300, size: 4 }]);
        assert!(request.has_number_of_valid_vectors(1, 1));
        assert!(!request.has_number_of_valid_vectors(2, 0));
    }

    #[test]
    fn null_vector_with_size_is_invalid() {
        let mut memory = GuestMemory::new(0x1000);
        write_ioctlv(&mut memory, 0x100, 0x12, &[(0, 8)], 1);
        let request = IoctlvRequest::read(&memory, 0x100).unwrap();
        assert!(!request.has_number_of_valid_vectors(1, 0));

        // Null with zero size is fine.
        write_ioctlv(&mut memory, 0x100, 0x12, &[(0, 0)], 1);
        let request = IoctlvRequest::read(&memory, 0x100).unwrap();
        assert!(request.has_number_of_valid_vectors(1, 0));
    }

    #[test]
    fn outputs_are_zero_filled_unless_aliased() {
        let mut memory = GuestMemory::new(0x1000);
        memory.copy_to_guest(0x300, &[0xff; 4]).unwrap();
        memory.copy_to_guest(0x200, &[0xee; 4]).unwrap();
        write_ioctlv(&mut memory, 0x100, 0x12, &[(0x200, 4), (0x200, 4), (0x300, 4)], 1);

        let request = IoctlvRequest::read(&memory, 0x100).unwrap();
        request.zero_fill_outputs(&mut memory).unwrap();
        // Aliased output keeps the input bytes; the other is cleared.
        assert_eq!(memory.read_u32(0x200).unwrap(), 0xeeee_eeee);
        assert_eq!(memory.read_u32(0x300).unwrap(), 0);
    }

    #[test]
    fn reply_flush_writes_result_and_flips_the_command() {
        let mut memory = GuestMemory::new(0x1000);
        memory.write_u32(0x100 + OFF_COMMAND, IPC_CMD_IOCTLV).unwrap();
        let mut replies = ReplyQueue::new();
        replies.push_reply(0x100, -1017);

        let flushed = replies.flush(&mut memory).unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(memory.read_u32(0x100 + OFF_RESULT).unwrap() as i32, -1017);
        assert_eq!(memory.read_u32(0x100 + OFF_COMMAND).unwrap(), IPC_REPLY);
        assert!(replies.is_empty());
    }

    #[test]
    fn ack_flush_leaves_the_request_buffer_alone() {
        let mut memory = GuestMemory::new(0x1000);
        memory.write_u32(0x100 + OFF_COMMAND, IPC_CMD_IOCTLV).unwrap();
        memory.write_u32(0x100 + OFF_RESULT, 0xdead_beef).unwrap();
        let mut replies = ReplyQueue::new();
        replies.push_ack(0x100);

        let flushed = replies.flush(&mut memory).unwrap();
        assert_eq!(flushed.len(), 1);
        assert!(flushed[0].ack_only);
        assert_eq!(memory.read_u32(0x100 + OFF_COMMAND).unwrap(), IPC_CMD_IOCTLV);
        assert_eq!(memory.read_u32(0x100 + OFF_RESULT).unwrap(), 0xdead_beef);
    }

    #[test]
    fn parked_requests_complete_exactly_once() {
        let mut pending = PendingRequests::new();
        let mut replies = ReplyQueue::new();
        pending.park(0x500);
        assert!(pending.is_parked(0x500));

        pending.complete(0x500, 0, &mut replies);
        assert!(!pending.is_parked(0x500));
        assert!(!replies.is_empty());

        // Unknown completions are dropped.
        let mut replies2 = ReplyQueue::new();
        pending.complete(0x500, 0, &mut replies2);
        assert!(replies2.is_empty());
    }
}
