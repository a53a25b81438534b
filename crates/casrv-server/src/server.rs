//! Server-wide state shared by every session.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use casrv_wire::Value;
use tracing::{debug, info};

use crate::attachment::PvAttachment;
use crate::config::{EventMask, ServerConfig};
use crate::events::{lock, IoBlockedList, PostedValue, SessionId};
use crate::pv::{ProcessVariable, PvError, PvServer};
use crate::session::{Session, SessionHandle};

pub(crate) struct ServerCore {
    pub(crate) config: ServerConfig,
    pub(crate) pv_server: Arc<dyn PvServer>,
    /// Sessions whose claim was postponed by the name server.
    pub(crate) attach_blocked: IoBlockedList,
    attachments: Mutex<HashMap<String, Arc<PvAttachment>>>,
    sessions: Mutex<BTreeMap<SessionId, SessionHandle>>,
    next_session: AtomicU64,
}

impl ServerCore {
    /// Attachment state for `pv`, created on first use. A variable replacing
    /// an earlier one of the same name gets fresh state.
    pub(crate) fn attachment_for(&self, pv: Arc<dyn ProcessVariable>) -> Arc<PvAttachment> {
        let mut attachments = lock(&self.attachments);
        if let Some(existing) = attachments.get(pv.name()) {
            if Arc::ptr_eq(existing.pv(), &pv) {
                return Arc::clone(existing);
            }
        }
        let attachment = Arc::new(PvAttachment::new(pv));
        debug!(pv = attachment.name(), "process variable attached");
        attachments.insert(attachment.name().to_string(), Arc::clone(&attachment));
        attachment
    }

    pub(crate) fn attachment(&self, name: &str) -> Option<Arc<PvAttachment>> {
        lock(&self.attachments).get(name).cloned()
    }

    pub(crate) fn forget_session(&self, id: SessionId) {
        lock(&self.sessions).remove(&id);
    }
}

/// A Channel Access server: the name server it resolves through, its
/// configuration, and the sessions it created.
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct CaServer {
    core: Arc<ServerCore>,
}

impl CaServer {
    pub fn new(config: ServerConfig, pv_server: Arc<dyn PvServer>) -> Self {
        Self {
            core: Arc::new(ServerCore {
                config,
                pv_server,
                attach_blocked: IoBlockedList::new(),
                attachments: Mutex::new(HashMap::new()),
                sessions: Mutex::new(BTreeMap::new()),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.core.config
    }

    /// A handle that does not keep the server alive, for collaborators the
    /// server itself owns.
    pub fn downgrade(&self) -> WeakCaServer {
        WeakCaServer {
            core: Arc::downgrade(&self.core),
        }
    }

    /// Start a session for a newly accepted circuit.
    pub fn create_session(&self, peer: Option<SocketAddr>) -> Session {
        let id = self.core.next_session.fetch_add(1, Ordering::Relaxed);
        let session = Session::new(Arc::clone(&self.core), id, peer);
        lock(&self.core.sessions).insert(id, session.handle());
        session
    }

    /// Sessions not yet torn down.
    pub fn session_count(&self) -> usize {
        lock(&self.core.sessions).len()
    }

    /// Attached variables with the number of channels installed on each,
    /// sorted by name.
    pub fn attached_pvs(&self) -> Vec<(String, usize)> {
        let mut pvs: Vec<(String, usize)> = lock(&self.core.attachments)
            .values()
            .map(|a| (a.name().to_string(), a.installed_count()))
            .collect();
        pvs.sort();
        pvs
    }

    /// Post a new value to every subscription on `name` selecting `mask`.
    /// Returns the number of channels the update was queued for.
    pub fn post_event(&self, name: &str, mask: EventMask, value: Value) -> usize {
        self.post(name, mask, Arc::new(Ok(value)))
    }

    /// Post a failure; subscribers receive a zero-filled update carrying the
    /// matching status.
    pub fn post_failure(&self, name: &str, mask: EventMask, cause: PvError) -> usize {
        self.post(name, mask, Arc::new(Err(cause)))
    }

    fn post(&self, name: &str, mask: EventMask, update: PostedValue) -> usize {
        match self.core.attachment(name) {
            Some(attachment) => attachment.post(mask, &update),
            None => 0,
        }
    }

    /// Have every channel on `name` re-evaluate and resend its access rights.
    pub fn update_access_rights(&self, name: &str) -> usize {
        let Some(attachment) = self.core.attachment(name) else {
            return 0;
        };
        attachment
            .links()
            .iter()
            .filter(|link| link.session.update_access_rights(link.cid))
            .count()
    }

    /// Disconnect every channel on `name` now; the variable stays available
    /// for new claims.
    pub fn disconnect_channels(&self, name: &str) -> usize {
        let Some(attachment) = self.core.attachment(name) else {
            return 0;
        };
        attachment
            .links()
            .iter()
            .filter(|link| link.session.destroy_channel_now(link.cid))
            .count()
    }

    /// Forget `name` and disconnect its channels from within each session.
    pub fn remove_pv(&self, name: &str) -> usize {
        let Some(attachment) = lock(&self.core.attachments).remove(name) else {
            return 0;
        };
        let scheduled = attachment
            .links()
            .iter()
            .filter(|link| link.session.schedule_channel_destroy(link.cid))
            .count();
        info!(pv = name, channels = scheduled, "process variable removed");
        scheduled
    }

    /// Wake sessions waiting for `name` to accept I/O again.
    pub fn release_blocked_io(&self, name: &str) -> usize {
        self.core
            .attachment(name)
            .map_or(0, |attachment| attachment.blocked().release())
    }

    /// Wake sessions whose claim the name server postponed.
    pub fn release_blocked_attach(&self) -> usize {
        self.core.attach_blocked.release()
    }
}

impl fmt::Debug for CaServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaServer")
            .field("config", &self.core.config)
            .field("sessions", &self.session_count())
            .finish()
    }
}

/// Non-owning reference to a [`CaServer`].
#[derive(Clone, Default)]
pub struct WeakCaServer {
    core: Weak<ServerCore>,
}

impl WeakCaServer {
    pub fn upgrade(&self) -> Option<CaServer> {
        self.core.upgrade().map(|core| CaServer { core })
    }
}

impl fmt::Debug for WeakCaServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakCaServer")
            .field("alive", &(self.core.strong_count() > 0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use casrv_wire::ValueData;

    use super::*;
    use crate::testing::{claim, ScriptedPv, ScriptedServer, Step};

    fn server(pvs: Vec<Arc<ScriptedPv>>) -> CaServer {
        let config = ServerConfig::default().with_announce_version(false);
        CaServer::new(config, Arc::new(ScriptedServer::new(pvs)))
    }

    #[test]
    fn test_sessions_registered_and_forgotten() {
        let server = server(Vec::new());
        let a = server.create_session(None);
        let b = server.create_session(None);
        assert_ne!(a.id(), b.id());
        assert_eq!(server.session_count(), 2);
        drop(a);
        assert_eq!(server.session_count(), 1);
    }

    #[test]
    fn test_weak_handle_does_not_keep_server() {
        let server = server(Vec::new());
        let weak = server.downgrade();
        assert!(weak.upgrade().is_some());
        drop(server);
        assert!(weak.upgrade().is_none());
        assert!(WeakCaServer::default().upgrade().is_none());
    }

    #[test]
    fn test_attachment_shared_between_sessions() {
        let server = server(vec![ScriptedPv::double("tempA", 0.0)]);
        let a = server.create_session(None);
        let b = server.create_session(None);
        a.receive(&claim(1, "tempA", 13)).unwrap();
        b.receive(&claim(1, "tempA", 13)).unwrap();
        assert_eq!(server.attached_pvs(), vec![("tempA".to_string(), 2)]);
    }

    #[test]
    fn test_post_to_unknown_pv() {
        let server = server(Vec::new());
        let value = Value::new(ValueData::Double(vec![1.0]));
        assert_eq!(server.post_event("nope", EventMask::VALUE, value), 0);
        assert_eq!(server.release_blocked_io("nope"), 0);
        assert_eq!(server.remove_pv("nope"), 0);
    }

    #[test]
    fn test_remove_pv_schedules_disconnect() {
        let server = server(vec![ScriptedPv::double("tempA", 0.0)]);
        let session = server.create_session(None);
        session.receive(&claim(4, "tempA", 13)).unwrap();

        assert_eq!(server.remove_pv("tempA"), 1);
        assert!(server.attached_pvs().is_empty());
        session.process_queued().unwrap();
        assert_eq!(session.channel_count(), 0);
    }

    #[test]
    fn test_postponed_attach_released() {
        let names = Arc::new(ScriptedServer::new(vec![ScriptedPv::double("tempA", 0.0)]));
        let config = ServerConfig::default().with_announce_version(false);
        let server = CaServer::new(config, names.clone());
        let session = server.create_session(None);

        names.script_attach(Step::Postpone);
        session.receive(&claim(2, "tempA", 13)).unwrap();
        assert_eq!(session.channel_count(), 0);
        assert_eq!(server.release_blocked_attach(), 1);
        session.process_queued().unwrap();
        assert_eq!(session.channel_count(), 1);
        assert_eq!(names.attaches(), 2);
    }
}
