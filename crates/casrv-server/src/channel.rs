use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use casrv_wire::FieldType;

use crate::attachment::PvAttachment;
use crate::monitor::Monitor;
use crate::pv::AccessRights;

/// One client's binding to a process variable.
///
/// Owned by the session's resource table. The channel in turn owns its
/// monitors; dropping it drops every subscription with it.
#[derive(Debug)]
pub struct Channel {
    cid: u32,
    sid: u32,
    pv: Arc<PvAttachment>,
    rights: AccessRights,
    native_type: FieldType,
    native_count: u32,
    monitors: BTreeMap<u32, Monitor>,
    outstanding_reads: BTreeSet<u64>,
}

impl Channel {
    pub(crate) fn new(
        cid: u32,
        sid: u32,
        pv: Arc<PvAttachment>,
        rights: AccessRights,
        native_type: FieldType,
    ) -> Self {
        let native_count = pv.pv().native_count();
        Self {
            cid,
            sid,
            pv,
            rights,
            native_type,
            native_count,
            monitors: BTreeMap::new(),
            outstanding_reads: BTreeSet::new(),
        }
    }

    /// Client-chosen id; the key in the session's resource table.
    pub fn cid(&self) -> u32 {
        self.cid
    }

    /// Server-assigned id returned in the claim confirmation.
    pub fn sid(&self) -> u32 {
        self.sid
    }

    pub fn pv(&self) -> &Arc<PvAttachment> {
        &self.pv
    }

    pub fn rights(&self) -> AccessRights {
        self.rights
    }

    pub(crate) fn set_rights(&mut self, rights: AccessRights) {
        self.rights = rights;
    }

    pub fn native_type(&self) -> FieldType {
        self.native_type
    }

    pub fn native_count(&self) -> u32 {
        self.native_count
    }

    /// Attach a subscription. A monitor already using the id is replaced.
    pub(crate) fn install_monitor(&mut self, monitor: Monitor) -> Option<Monitor> {
        self.monitors.insert(monitor.subscription(), monitor)
    }

    pub(crate) fn remove_monitor(&mut self, subscription: u32) -> Option<Monitor> {
        self.monitors.remove(&subscription)
    }

    pub fn monitor(&self, subscription: u32) -> Option<&Monitor> {
        self.monitors.get(&subscription)
    }

    pub(crate) fn monitor_mut(&mut self, subscription: u32) -> Option<&mut Monitor> {
        self.monitors.get_mut(&subscription)
    }

    pub fn monitor_count(&self) -> usize {
        self.monitors.len()
    }

    pub(crate) fn monitors_mut(&mut self) -> impl Iterator<Item = &mut Monitor> {
        self.monitors.values_mut()
    }

    pub(crate) fn add_outstanding_read(&mut self, request: u64) {
        self.outstanding_reads.insert(request);
    }

    pub(crate) fn finish_read(&mut self, request: u64) -> bool {
        self.outstanding_reads.remove(&request)
    }

    /// Forget every asynchronous read still in flight.
    pub(crate) fn clear_outstanding_reads(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.outstanding_reads)
            .into_iter()
            .collect()
    }
}
