//! In-memory process variables served from a [`Catalog`].
//!
//! Writes replace the stored value and post it to subscribers through the
//! server the provider was bound to.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock};

use casrv_server::{
    AccessRights, AttachOutcome, CaServer, EventMask, IoContext, IoOutcome, ProcessVariable,
    PvError, PvServer, ReadRequest, WeakCaServer,
};
use casrv_wire::{FieldType, Value};
use tracing::debug;

use crate::catalog::{Catalog, PvDefinition, Result};

pub struct MemoryPv {
    definition: PvDefinition,
    field: FieldType,
    value: Mutex<Value>,
    server: OnceLock<WeakCaServer>,
}

impl MemoryPv {
    pub fn new(definition: PvDefinition) -> Result<Self> {
        let field = definition.parsed_type()?;
        let value = Value::new(definition.initial_data()?);
        Ok(Self {
            definition,
            field,
            value: Mutex::new(value),
            server: OnceLock::new(),
        })
    }

    pub fn definition(&self) -> &PvDefinition {
        &self.definition
    }

    /// Current value.
    pub fn value(&self) -> Value {
        self.lock_value().clone()
    }

    fn lock_value(&self) -> std::sync::MutexGuard<'_, Value> {
        self.value.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn post(&self, value: Value) {
        let Some(server) = self.server.get().and_then(WeakCaServer::upgrade) else {
            return;
        };
        let channels = server.post_event(&self.definition.name, EventMask::VALUE | EventMask::LOG, value);
        debug!(pv = %self.definition.name, channels, "value posted");
    }
}

impl ProcessVariable for MemoryPv {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn best_external_type(&self) -> std::result::Result<FieldType, PvError> {
        Ok(self.field)
    }

    fn native_count(&self) -> u32 {
        self.definition.count
    }

    fn read(&self, _ctx: &mut IoContext<'_>, _request: &ReadRequest) -> IoOutcome<Value> {
        IoOutcome::Done(self.value())
    }

    fn write(&self, ctx: &mut IoContext<'_>, value: Value) -> IoOutcome<()> {
        if value.field_type() != self.field {
            return IoOutcome::Failed(PvError::BadType);
        }
        if value.count() > self.definition.count as usize {
            return IoOutcome::Failed(PvError::BadParameter(format!(
                "{} elements for a count of {}",
                value.count(),
                self.definition.count
            )));
        }
        debug!(pv = %self.definition.name, user = ctx.user(), host = ctx.host(), "value written");

        // Short writes keep the trailing elements.
        let stored = {
            let mut current = self.lock_value();
            let mut data = current.data.clone();
            overlay(&mut data, value.data);
            *current = Value::new(data).with_stamp(value.stamp);
            current.clone()
        };
        self.post(stored);
        IoOutcome::Done(())
    }

    fn update_enum_strings(&self, _ctx: &mut IoContext<'_>) -> IoOutcome<Vec<String>> {
        IoOutcome::Done(self.definition.enum_strings.clone())
    }

    fn access_rights(&self, user: &str, _host: &str) -> AccessRights {
        AccessRights {
            read: self.definition.read,
            write: self.definition.write && self.definition.allows_writer(user),
        }
    }
}

fn overlay(dst: &mut casrv_wire::ValueData, src: casrv_wire::ValueData) {
    use casrv_wire::ValueData as D;

    fn copy<T>(dst: &mut [T], src: Vec<T>) {
        for (slot, element) in dst.iter_mut().zip(src) {
            *slot = element;
        }
    }

    match (dst, src) {
        (D::String(d), D::String(s)) => copy(d, s),
        (D::Short(d), D::Short(s)) => copy(d, s),
        (D::Float(d), D::Float(s)) => copy(d, s),
        (D::Enum(d), D::Enum(s)) => copy(d, s),
        (D::Char(d), D::Char(s)) => copy(d, s),
        (D::Long(d), D::Long(s)) => copy(d, s),
        (D::Double(d), D::Double(s)) => copy(d, s),
        (d, s) => *d = s,
    }
}

/// Name server over a fixed catalogue.
pub struct MemoryServer {
    pvs: BTreeMap<String, Arc<MemoryPv>>,
}

impl MemoryServer {
    pub fn from_catalog(catalog: &Catalog) -> Result<Self> {
        let mut pvs = BTreeMap::new();
        for definition in &catalog.pvs {
            let pv = MemoryPv::new(definition.clone())?;
            pvs.insert(definition.name.clone(), Arc::new(pv));
        }
        Ok(Self { pvs })
    }

    /// Route value posts from writes through `server`.
    pub fn bind(&self, server: &CaServer) {
        for pv in self.pvs.values() {
            if pv.server.set(server.downgrade()).is_err() {
                debug!(pv = %pv.definition.name, "provider already bound");
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<MemoryPv>> {
        self.pvs.get(name)
    }

    pub fn len(&self) -> usize {
        self.pvs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pvs.is_empty()
    }
}

impl PvServer for MemoryServer {
    fn attach(&self, _ctx: &mut IoContext<'_>, name: &str) -> AttachOutcome {
        match self.pvs.get(name) {
            Some(pv) => AttachOutcome::Attached(pv.clone()),
            None => AttachOutcome::NotFound,
        }
    }
}

#[cfg(test)]
mod tests {
    use casrv_wire::ValueData;

    use super::*;

    fn catalog() -> Catalog {
        Catalog::from_json(
            r#"{"pvs":[
                {"name":"wave","type":"long","count":3,"value":[1,2,3]},
                {"name":"sp","type":"double","writers":["operator"]},
                {"name":"ro","type":"short","write":false}
            ]}"#,
        )
        .expect("catalogue should parse")
    }

    #[test]
    fn test_access_rights_from_definition() {
        let server = MemoryServer::from_catalog(&catalog()).unwrap();
        assert_eq!(server.len(), 3);

        let sp = server.get("sp").unwrap();
        assert_eq!(sp.access_rights("operator", "h"), AccessRights::READ_WRITE);
        assert_eq!(sp.access_rights("guest", "h"), AccessRights::READ_ONLY);
        let ro = server.get("ro").unwrap();
        assert_eq!(ro.access_rights("operator", "h"), AccessRights::READ_ONLY);
    }

    #[test]
    fn test_short_write_keeps_tail() {
        let mut data = ValueData::Long(vec![1, 2, 3]);
        overlay(&mut data, ValueData::Long(vec![9]));
        assert_eq!(data, ValueData::Long(vec![9, 2, 3]));
    }

    #[test]
    fn test_native_shape() {
        let server = MemoryServer::from_catalog(&catalog()).unwrap();
        let wave = server.get("wave").unwrap();
        assert_eq!(wave.native_count(), 3);
        assert_eq!(wave.best_external_type().unwrap(), FieldType::Long);
        assert_eq!(wave.value().data, ValueData::Long(vec![1, 2, 3]));
    }
}
