//! Common test utilities for the ES integration tests.
//!
//! The harness owns a service instance over a temporary NAND root and lays
//! vectored requests out in guest memory the way the guest would.

// Not every test binary uses every helper.
#![allow(dead_code)]

use tempfile::TempDir;
use wii_es::{
    content_iv, encrypt, ContentEntry, IoVector, Ios, NandRoot, TicketBuilder, TmdBuilder,
    TmdReader, write_ioctlv_frame,
};

pub const MEMORY_SIZE: usize = 0x40000;
pub const REQUEST_BASE: u32 = 0x100;
pub const TABLE_BASE: u32 = 0x200;
pub const DATA_BASE: u32 = 0x1000;

pub const INITIAL_IOS_VERSION: u32 = 21;
pub const REQUIRED_IOS: u64 = 0x0000_0001_0000_0015;
pub const TITLE_ID: u64 = 0x0001_0001_0000_0042;
pub const CONTENT_ID: u32 = 0x10;
pub const TITLE_KEY: [u8; 16] = [0x2b; 16];

pub struct Harness {
    dir: TempDir,
    pub ios: Ios,
}

impl Harness {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let dir = TempDir::new().unwrap();
        let ios = Ios::new(NandRoot::new(dir.path()), MEMORY_SIZE, INITIAL_IOS_VERSION);
        Harness { dir, ios }
    }

    pub fn nand(&self) -> NandRoot {
        NandRoot::new(self.dir.path())
    }

    pub fn dir_path(&self) -> &std::path::Path {
        self.dir.path()
    }

    /// Run one vectored command: inputs copied into guest memory, outputs
    /// allocated behind them. Returns the reply code and the output bytes.
    pub fn ioctlv(
        &mut self,
        code: u32,
        inputs: &[&[u8]],
        output_sizes: &[u32],
    ) -> (i32, Vec<Vec<u8>>) {
        let mut cursor = DATA_BASE;
        let mut step = |len: u32| {
            let at = cursor;
            cursor += len.div_ceil(32) * 32 + 32;
            at
        };

        let in_vectors: Vec<IoVector> = inputs
            .iter()
            .map(|data| {
                let address = step(data.len() as u32);
                self.ios.memory_mut().copy_to_guest(address, data).unwrap();
                IoVector {
                    address,
                    size: data.len() as u32,
                }
            })
            .collect();
        let io_vectors: Vec<IoVector> = output_sizes
            .iter()
            .map(|&size| IoVector {
                address: step(size),
                size,
            })
            .collect();

        write_ioctlv_frame(
            self.ios.memory_mut(),
            REQUEST_BASE,
            0,
            code,
            TABLE_BASE,
            &in_vectors,
            &io_vectors,
        )
        .unwrap();
        self.ios.dispatch(REQUEST_BASE).unwrap();
        let replies = self.ios.flush_replies().unwrap();
        let code = replies.last().map(|r| r.return_code).unwrap_or(0);

        let outputs = io_vectors
            .iter()
            .map(|v| self.ios.memory().read_bytes(v.address, v.size).unwrap())
            .collect();
        (code, outputs)
    }

    /// Install a one-content title directly on the NAND (bypassing the
    /// command path) so query/launch/export tests have something to chew on.
    pub fn install_title(&self, title_id: u64, plaintext: &[u8]) -> TmdReader {
        let nand = self.nand();
        let tmd = TmdBuilder::new(title_id)
            .ios_id(REQUIRED_IOS)
            .group_id(0x3031)
            .title_version(1)
            .content(ContentEntry {
                id: CONTENT_ID,
                index: 0,
                ty: 1,
                size: plaintext.len() as u64,
                hash: [0xcd; 20],
            })
            .build();
        nand.write_tmd(&tmd).unwrap();
        nand.add_ticket(&TicketBuilder::new(title_id).title_key(TITLE_KEY).build())
            .unwrap();
        std::fs::write(nand.content_path(title_id, CONTENT_ID), plaintext).unwrap();
        tmd
    }
}

/// The encrypted form a guest would upload for a content.
pub fn encrypted_content(index: u16, plaintext: &[u8]) -> Vec<u8> {
    encrypt(&TITLE_KEY, &content_iv(index), plaintext).unwrap()
}
