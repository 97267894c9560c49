//! The active title context.
//!
//! At most one title is "running" at a time. Its context (ticket + metadata)
//! outlives the device instance itself: closing and reopening the device
//! must not drop the running title, so the context lives in the shared
//! service state rather than the device.

use serde::{Deserialize, Serialize};

use tracing::error;

use crate::formats::{TicketReader, TmdReader};

/// Observer for title changes. Embedders hook this to update window titles,
/// per-game settings, and the like.
pub trait TitleChangeSink {
    fn on_title_change(&mut self, context: &TitleContext);
}

/// Sink that ignores all notifications.
#[derive(Debug, Default)]
pub struct NullTitleChangeSink;

impl TitleChangeSink for NullTitleChangeSink {
    fn on_title_change(&mut self, _context: &TitleContext) {}
}

/// The currently running title, if any.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TitleContext {
    ticket: TicketReader,
    tmd: TmdReader,
    active: bool,
    // Only the first activation after a clear notifies the sink; repeated
    // updates while the title stays active do not.
    first_change: bool,
}

impl TitleContext {
    pub fn new() -> Self {
        TitleContext {
            first_change: true,
            ..Default::default()
        }
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn tmd(&self) -> &TmdReader {
        &self.tmd
    }

    pub fn ticket(&self) -> &TicketReader {
        &self.ticket
    }

    pub fn clear(&mut self) {
        self.ticket = TicketReader::default();
        self.tmd = TmdReader::default();
        self.active = false;
        self.first_change = true;
    }

    /// Make `tmd`/`ticket` the running title. Invalid records deactivate the
    /// context instead.
    pub fn update(
        &mut self,
        tmd: TmdReader,
        ticket: TicketReader,
        sink: &mut dyn TitleChangeSink,
    ) {
        if !tmd.is_valid() || !ticket.is_valid() {
            error!("Tried to update title context with an invalid TMD or ticket");
            self.clear();
            return;
        }
        self.tmd = tmd;
        self.ticket = ticket;
        self.active = true;

        if self.first_change {
            self.first_change = false;
            sink.on_title_change(self);
        }
    }

    /// The six-character game id of the running title, when the title id
    /// carries one (four printable id bytes plus the group id). System
    /// titles have none.
    pub fn game_id(&self) -> Option<String> {
        if !self.active {
            return None;
        }
        let low = (self.tmd.title_id() as u32).to_be_bytes();
        if !low.iter().all(|b| b.is_ascii_alphanumeric()) {
            return None;
        }
        let group = self.tmd.group_id().to_be_bytes();
        let mut id = low.to_vec();
        id.extend_from_slice(&group);
        String::from_utf8(id).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::{TicketBuilder, TmdBuilder};

    struct CountingSink(u32);

    impl TitleChangeSink for CountingSink {
        fn on_title_change(&mut self, _context: &TitleContext) {
            self.0 += 1;
        }
    }

    #[test]
    fn update_activates_and_notifies_once() {
        let mut context = TitleContext::new();
        let mut sink = CountingSink(0);
        assert!(!context.active());

        let tmd = TmdBuilder::new(0x0001_0001_5241_4d50).build();
        let ticket = TicketBuilder::new(0x0001_0001_5241_4d50).build();
        context.update(tmd.clone(), ticket.clone(), &mut sink);
        assert!(context.active());
        assert_eq!(sink.0, 1);

        // Relaunch during the same session stays quiet.
        context.update(tmd, ticket, &mut sink);
        assert_eq!(sink.0, 1);
    }

    #[test]
    fn invalid_records_clear_the_context() {
        let mut context = TitleContext::new();
        let mut sink = NullTitleChangeSink;
        let tmd = TmdBuilder::new(1).build();
        context.update(tmd.clone(), TicketBuilder::new(1).build(), &mut sink);
        assert!(context.active());

        context.update(tmd, TicketReader::default(), &mut sink);
        assert!(!context.active());
    }

    #[test]
    fn game_id_requires_printable_id_bytes() {
        let mut context = TitleContext::new();
        let mut sink = NullTitleChangeSink;
        let tmd = TmdBuilder::new(0x0001_0001_5241_4d50).group_id(0x3031).build();
        context.update(tmd, TicketBuilder::new(0x0001_0001_5241_4d50).build(), &mut sink);
        assert_eq!(context.game_id().as_deref(), Some("RAMP01"));

        context.clear();
        assert_eq!(context.game_id(), None);
    }
}
