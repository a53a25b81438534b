use casrv_wire::command::EVENT_ADD;
use casrv_wire::{DbrType, Header};

use crate::config::EventMask;
use crate::events::PostedValue;

/// A client subscription on one channel.
#[derive(Debug)]
pub struct Monitor {
    subscription: u32,
    dbr: DbrType,
    count: u32,
    mask: EventMask,
    held: Option<PostedValue>,
}

impl Monitor {
    pub fn new(subscription: u32, dbr: DbrType, count: u32, mask: EventMask) -> Self {
        Self {
            subscription,
            dbr,
            count,
            mask,
            held: None,
        }
    }

    /// Client-assigned id, echoed in every update.
    pub fn subscription(&self) -> u32 {
        self.subscription
    }

    pub fn dbr(&self) -> DbrType {
        self.dbr
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn mask(&self) -> EventMask {
        self.mask
    }

    /// Whether an event posted with `mask` reaches this subscription.
    pub fn selects(&self, mask: EventMask) -> bool {
        self.mask.intersects(mask)
    }

    /// Header an update for this subscription is sent with.
    pub(crate) fn update_header(&self) -> Header {
        Header::new(EVENT_ADD)
            .with_type(self.dbr.code(), self.count)
            .with_ids(0, self.subscription)
    }

    /// Keep the latest update while it cannot be delivered (events off or
    /// the output buffer full). A newer update replaces an older one.
    pub(crate) fn hold(&mut self, update: PostedValue) {
        self.held = Some(update);
    }

    pub(crate) fn take_held(&mut self) -> Option<PostedValue> {
        self.held.take()
    }
}
