//! Server-side state kept per attached process variable.
//!
//! Created the first time any session claims a channel on the variable and
//! shared by every channel bound to it. The list of installed channels is
//! guarded by its own lock, always taken after (never while waiting for) a
//! session lock.

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::config::EventMask;
use crate::events::{lock, IoBlockedList, PostedValue, SessionEvent, SessionId};
use crate::pv::ProcessVariable;
use crate::session::SessionHandle;

/// A channel installed on a variable, by session and client id.
#[derive(Debug, Clone)]
pub(crate) struct ChannelLink {
    pub(crate) session: SessionHandle,
    pub(crate) cid: u32,
}

pub struct PvAttachment {
    name: String,
    pv: Arc<dyn ProcessVariable>,
    blocked: IoBlockedList,
    links: Mutex<Vec<ChannelLink>>,
    enum_strings: Mutex<Vec<String>>,
}

impl PvAttachment {
    pub fn new(pv: Arc<dyn ProcessVariable>) -> Self {
        Self {
            name: pv.name().to_string(),
            pv,
            blocked: IoBlockedList::new(),
            links: Mutex::new(Vec::new()),
            enum_strings: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pv(&self) -> &Arc<dyn ProcessVariable> {
        &self.pv
    }

    /// Sessions waiting for this variable to accept postponed I/O.
    pub fn blocked(&self) -> &IoBlockedList {
        &self.blocked
    }

    /// Cached enum state strings.
    pub fn enum_strings(&self) -> Vec<String> {
        lock(&self.enum_strings).clone()
    }

    pub fn set_enum_strings(&self, strings: Vec<String>) {
        *lock(&self.enum_strings) = strings;
    }

    /// Number of channels installed across all sessions.
    pub fn installed_count(&self) -> usize {
        lock(&self.links).len()
    }

    pub(crate) fn install(&self, session: SessionHandle, cid: u32) {
        lock(&self.links).push(ChannelLink { session, cid });
    }

    pub(crate) fn uninstall(&self, session: SessionId, cid: u32) -> bool {
        let mut links = lock(&self.links);
        let before = links.len();
        links.retain(|link| !(link.session.id() == session && link.cid == cid));
        links.len() != before
    }

    /// Copy of the installed channels, taken so that no session lock is
    /// acquired while the list is locked.
    pub(crate) fn links(&self) -> Vec<ChannelLink> {
        lock(&self.links).clone()
    }

    /// Queue `update` to every installed channel. Returns how many sessions
    /// accepted it.
    pub(crate) fn post(&self, mask: EventMask, update: &PostedValue) -> usize {
        let mut delivered = 0;
        for link in self.links() {
            let event = SessionEvent::Post {
                cid: link.cid,
                mask,
                update: Arc::clone(update),
            };
            if link.session.events().send(event) {
                delivered += 1;
            } else {
                debug!(pv = %self.name, session = link.session.id(), "post to a closed session");
            }
        }
        delivered
    }
}

impl fmt::Debug for PvAttachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PvAttachment")
            .field("name", &self.name)
            .field("installed", &self.installed_count())
            .field("blocked", &self.blocked.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use casrv_wire::{Value, ValueData};

    use super::*;
    use crate::events::EventSender;
    use crate::testing::ScriptedPv;

    #[test]
    fn test_install_uninstall() {
        let attachment = PvAttachment::new(ScriptedPv::double("tempA", 0.0));
        let (events, _rx) = EventSender::channel(3);
        let handle = SessionHandle::detached(events);

        attachment.install(handle.clone(), 7);
        attachment.install(handle, 8);
        assert_eq!(attachment.installed_count(), 2);

        assert!(attachment.uninstall(3, 7));
        assert!(!attachment.uninstall(3, 7));
        assert!(!attachment.uninstall(4, 8));
        assert_eq!(attachment.installed_count(), 1);
    }

    #[test]
    fn test_post_reaches_each_channel() {
        let attachment = PvAttachment::new(ScriptedPv::double("tempA", 0.0));
        let (events, rx) = EventSender::channel(1);
        let handle = SessionHandle::detached(events);
        attachment.install(handle.clone(), 10);
        attachment.install(handle, 11);

        let update: PostedValue = Arc::new(Ok(Value::new(ValueData::Double(vec![2.5]))));
        assert_eq!(attachment.post(EventMask::VALUE, &update), 2);

        let cids: Vec<u32> = rx
            .try_iter()
            .map(|event| match event {
                SessionEvent::Post { cid, mask, .. } => {
                    assert_eq!(mask, EventMask::VALUE);
                    cid
                }
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(cids, vec![10, 11]);
    }

    #[test]
    fn test_enum_strings_cache() {
        let attachment = PvAttachment::new(ScriptedPv::double("mode", 0.0));
        assert!(attachment.enum_strings().is_empty());
        attachment.set_enum_strings(vec!["off".into(), "on".into()]);
        assert_eq!(attachment.enum_strings().len(), 2);
    }
}
