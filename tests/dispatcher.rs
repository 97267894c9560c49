//! Dispatcher-level behavior: shape validation, launch, deletion rules,
//! deferred replies, and snapshots.

mod common;

use common::{Harness, REQUEST_BASE, TABLE_BASE, TITLE_ID};
use wii_es::{
    ioctl, read_result, write_ioctlv_frame, IoVector, Ios, NandRoot, TicketBuilder,
    IPC_CMD_IOCTLV, IPC_SUCCESS, TICKET_VIEW_SIZE,
};

fn be64(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

fn be32(value: u32) -> [u8; 4] {
    value.to_be_bytes()
}

#[test]
fn wrong_vector_shape_is_rejected_without_side_effects() {
    let mut h = Harness::new();
    let ticket = TicketBuilder::new(TITLE_ID).build();

    // AddTicket wants three inputs; send one.
    let (code, _) = h.ioctlv(ioctl::ADD_TICKET, &[ticket.raw_bytes()], &[]);
    assert_eq!(code, -1017);
    assert!(h.nand().titles_with_tickets().is_empty());

    // GetTitleId wants one output; send none.
    let (code, _) = h.ioctlv(ioctl::GET_TITLE_ID, &[], &[]);
    assert_eq!(code, -1017);
}

#[test]
fn oversized_title_counts_are_a_parameter_error() {
    let mut h = Harness::new();
    h.install_title(TITLE_ID, &[0; 32]);

    // Counts large enough that count * entry size overflows u32.
    let huge = be32(0x2000_0000);
    let (code, _) = h.ioctlv(ioctl::GET_TITLES, &[&huge], &[8]);
    assert_eq!(code, -1017);
    let (code, _) = h.ioctlv(ioctl::GET_OWNED_TITLES, &[&huge], &[8]);
    assert_eq!(code, -1017);
    let (code, _) = h.ioctlv(
        ioctl::GET_TITLE_CONTENTS,
        &[&be64(TITLE_ID), &be32(0x4000_0000)],
        &[4],
    );
    assert_eq!(code, -1017);
    let (code, _) = h.ioctlv(
        ioctl::GET_VIEWS,
        &[&be64(TITLE_ID), &be32(0x0200_0000)],
        &[8],
    );
    assert_eq!(code, -1017);
}

/// Lay out and dispatch a launch request by hand so the individual replies
/// stay observable.
fn dispatch_launch(ios: &mut Ios, title_id: u64) -> Vec<wii_es::Reply> {
    let title = be64(title_id);
    let view = [0u8; TICKET_VIEW_SIZE];
    ios.memory_mut().copy_to_guest(0x1000, &title).unwrap();
    ios.memory_mut().copy_to_guest(0x1040, &view).unwrap();
    write_ioctlv_frame(
        ios.memory_mut(),
        REQUEST_BASE,
        0,
        ioctl::LAUNCH,
        TABLE_BASE,
        &[
            IoVector { address: 0x1000, size: 8 },
            IoVector { address: 0x1040, size: TICKET_VIEW_SIZE as u32 },
        ],
        &[],
    )
    .unwrap();
    ios.dispatch(REQUEST_BASE).unwrap();
    ios.flush_replies().unwrap()
}

#[test]
fn launch_reloads_and_acknowledges_twice() {
    let mut h = Harness::new();
    h.install_title(TITLE_ID, &[0xaa; 32]);

    let replies = dispatch_launch(&mut h.ios, TITLE_ID);
    // One acknowledgement before the reload, one from the new instance.
    assert_eq!(replies.len(), 2);
    assert!(replies.iter().all(|r| r.ack_only && r.address == REQUEST_BASE));
    // Acknowledgements never write into the request buffer.
    assert_eq!(h.ios.memory().read_u32(REQUEST_BASE).unwrap(), IPC_CMD_IOCTLV);
    assert_eq!(read_result(h.ios.memory(), REQUEST_BASE).unwrap(), 0);

    assert_eq!(h.ios.ios_version(), 0x15);
    assert!(h.ios.state().title_context.active());
    assert_eq!(h.ios.state().title_context.tmd().title_id(), TITLE_ID);

    // The launched title is now queryable.
    let (code, outputs) = h.ioctlv(ioctl::GET_TITLE_ID, &[], &[8]);
    assert_eq!(code, IPC_SUCCESS);
    assert_eq!(u64::from_be_bytes(outputs[0][..8].try_into().unwrap()), TITLE_ID);
}

#[test]
fn launch_of_a_missing_title_fails_with_a_single_reply() {
    let mut h = Harness::new();
    let replies = dispatch_launch(&mut h.ios, TITLE_ID);
    assert_eq!(replies.len(), 1);
    assert!(!replies[0].ack_only);
    assert_eq!(replies[0].return_code, -106);
    assert!(!h.ios.state().title_context.active());
}

#[test]
fn system_titles_up_to_ios257_cannot_be_deleted() {
    let mut h = Harness::new();

    // Protected even though nothing is installed there.
    let (code, _) = h.ioctlv(ioctl::DELETE_TITLE, &[&be64(0x0000_0001_0000_0021)], &[]);
    assert_eq!(code, -1017);
    let (code, _) = h.ioctlv(ioctl::DELETE_TITLE, &[&be64(0x0000_0001_0000_0002)], &[]);
    assert_eq!(code, -1017);

    // Deletable range, but not installed.
    let (code, _) = h.ioctlv(ioctl::DELETE_TITLE, &[&be64(0x0000_0001_0000_0200)], &[]);
    assert_eq!(code, -106);

    // An installed channel goes away; its ticket stays.
    h.install_title(TITLE_ID, &[0; 32]);
    let (code, _) = h.ioctlv(ioctl::DELETE_TITLE, &[&be64(TITLE_ID)], &[]);
    assert_eq!(code, IPC_SUCCESS);
    assert!(h.nand().installed_titles().is_empty());
    assert_eq!(h.nand().titles_with_tickets(), vec![TITLE_ID]);

    let (code, _) = h.ioctlv(ioctl::DELETE_TICKET, &[&be64(TITLE_ID)], &[]);
    assert_eq!(code, IPC_SUCCESS);
    assert!(h.nand().titles_with_tickets().is_empty());
}

#[test]
fn parked_requests_reply_when_completed() {
    let mut h = Harness::new();
    let address = 0x3000;
    h.ios.memory_mut().write_u32(address, 7).unwrap();

    h.ios.park_request(address);
    assert!(h.ios.flush_replies().unwrap().is_empty());

    h.ios.complete_request(address, 0x42);
    let replies = h.ios.flush_replies().unwrap();
    assert_eq!(replies.len(), 1);
    assert_eq!(read_result(h.ios.memory(), address).unwrap(), 0x42);
}

#[test]
fn snapshot_restores_descriptors_and_read_positions() {
    let mut h = Harness::new();
    let plaintext: Vec<u8> = (0..64u8).collect();
    h.install_title(TITLE_ID, &plaintext);

    let view = [0u8; 0xd8];
    let (cfd, _) = h.ioctlv(
        ioctl::OPEN_TITLE_CONTENT,
        &[&be64(TITLE_ID), &view, &be32(0)],
        &[],
    );
    let (read, outputs) = h.ioctlv(ioctl::READ_CONTENT, &[&be32(cfd as u32)], &[32]);
    assert_eq!(read, 32);
    assert_eq!(outputs[0], plaintext[..32]);

    let snapshot = h.ios.snapshot().unwrap();

    // A fresh service over the same storage, fast-forwarded to the saved
    // state: the descriptor is still open at the saved position.
    let mut restored = Ios::new(NandRoot::new(h.dir_path()), common::MEMORY_SIZE, 0);
    restored.restore(&snapshot).unwrap();
    std::mem::swap(&mut h.ios, &mut restored);

    let (read, outputs) = h.ioctlv(ioctl::READ_CONTENT, &[&be32(cfd as u32)], &[32]);
    assert_eq!(read, 32);
    assert_eq!(outputs[0], plaintext[32..]);
    assert_eq!(h.ios.ios_version(), common::INITIAL_IOS_VERSION);

    let (code, _) = h.ioctlv(ioctl::CLOSE_CONTENT, &[&be32(cfd as u32)], &[]);
    assert_eq!(code, IPC_SUCCESS);
}
