//! In-process value containers handed to and from process variables.

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds between the Unix epoch and the EPICS epoch (1990-01-01 UTC).
pub const EPICS_EPOCH_OFFSET: u64 = 631_152_000;

/// Alarm status and severity meaning "no alarm".
pub const NO_ALARM: u16 = 0;

/// Native element type of a process variable or DBR buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    String,
    Short,
    Float,
    Enum,
    Char,
    Long,
    Double,
}

impl FieldType {
    /// Index of the plain DBR type for this field type.
    pub fn dbr_code(self) -> u16 {
        match self {
            FieldType::String => 0,
            FieldType::Short => 1,
            FieldType::Float => 2,
            FieldType::Enum => 3,
            FieldType::Char => 4,
            FieldType::Long => 5,
            FieldType::Double => 6,
        }
    }

    /// Lower-case name used in configuration files and listings.
    pub fn name(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Short => "short",
            FieldType::Float => "float",
            FieldType::Enum => "enum",
            FieldType::Char => "char",
            FieldType::Long => "long",
            FieldType::Double => "double",
        }
    }

    /// Parse a configuration name produced by [`FieldType::name`].
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "string" => Some(FieldType::String),
            "short" => Some(FieldType::Short),
            "float" => Some(FieldType::Float),
            "enum" => Some(FieldType::Enum),
            "char" => Some(FieldType::Char),
            "long" => Some(FieldType::Long),
            "double" => Some(FieldType::Double),
            _ => None,
        }
    }
}

/// Time stamp in EPICS epoch seconds and nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct EpicsTimeStamp {
    pub secs: u32,
    pub nsec: u32,
}

impl EpicsTimeStamp {
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    /// Convert a wall-clock time; times before the EPICS epoch clamp to zero.
    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(since_unix) => {
                let secs = since_unix.as_secs().saturating_sub(EPICS_EPOCH_OFFSET);
                Self {
                    secs: u32::try_from(secs).unwrap_or(u32::MAX),
                    nsec: since_unix.subsec_nanos(),
                }
            }
            Err(_) => Self::default(),
        }
    }
}

/// Element storage, one vector per field type.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueData {
    String(Vec<String>),
    Short(Vec<i16>),
    Float(Vec<f32>),
    Enum(Vec<u16>),
    Char(Vec<u8>),
    Long(Vec<i32>),
    Double(Vec<f64>),
}

impl ValueData {
    pub fn field_type(&self) -> FieldType {
        match self {
            ValueData::String(_) => FieldType::String,
            ValueData::Short(_) => FieldType::Short,
            ValueData::Float(_) => FieldType::Float,
            ValueData::Enum(_) => FieldType::Enum,
            ValueData::Char(_) => FieldType::Char,
            ValueData::Long(_) => FieldType::Long,
            ValueData::Double(_) => FieldType::Double,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ValueData::String(v) => v.len(),
            ValueData::Short(v) => v.len(),
            ValueData::Float(v) => v.len(),
            ValueData::Enum(v) => v.len(),
            ValueData::Char(v) => v.len(),
            ValueData::Long(v) => v.len(),
            ValueData::Double(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `count` zeroed (or empty-string) elements of `field`.
    pub fn zeroed(field: FieldType, count: usize) -> Self {
        match field {
            FieldType::String => ValueData::String(vec![String::new(); count]),
            FieldType::Short => ValueData::Short(vec![0; count]),
            FieldType::Float => ValueData::Float(vec![0.0; count]),
            FieldType::Enum => ValueData::Enum(vec![0; count]),
            FieldType::Char => ValueData::Char(vec![0; count]),
            FieldType::Long => ValueData::Long(vec![0; count]),
            FieldType::Double => ValueData::Double(vec![0.0; count]),
        }
    }

    /// Element `index` as a double, or `None` for strings and out-of-range indices.
    pub fn get_f64(&self, index: usize) -> Option<f64> {
        match self {
            ValueData::String(_) => None,
            ValueData::Short(v) => v.get(index).map(|x| f64::from(*x)),
            ValueData::Float(v) => v.get(index).map(|x| f64::from(*x)),
            ValueData::Enum(v) => v.get(index).map(|x| f64::from(*x)),
            ValueData::Char(v) => v.get(index).map(|x| f64::from(*x)),
            ValueData::Long(v) => v.get(index).map(|x| f64::from(*x)),
            ValueData::Double(v) => v.get(index).copied(),
        }
    }
}

/// A value together with its alarm state and time stamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub data: ValueData,
    pub status: u16,
    pub severity: u16,
    pub stamp: EpicsTimeStamp,
}

impl Value {
    /// A value with no alarm, stamped now.
    pub fn new(data: ValueData) -> Self {
        Self {
            data,
            status: NO_ALARM,
            severity: NO_ALARM,
            stamp: EpicsTimeStamp::now(),
        }
    }

    pub fn with_stamp(mut self, stamp: EpicsTimeStamp) -> Self {
        self.stamp = stamp;
        self
    }

    pub fn with_alarm(mut self, status: u16, severity: u16) -> Self {
        self.status = status;
        self.severity = severity;
        self
    }

    pub fn field_type(&self) -> FieldType {
        self.data.field_type()
    }

    pub fn count(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_field_type_names_roundtrip() {
        for field in [
            FieldType::String,
            FieldType::Short,
            FieldType::Float,
            FieldType::Enum,
            FieldType::Char,
            FieldType::Long,
            FieldType::Double,
        ] {
            assert_eq!(FieldType::from_name(field.name()), Some(field));
        }
        assert_eq!(FieldType::from_name("quad"), None);
    }

    #[test]
    fn test_epics_epoch_conversion() {
        let t = UNIX_EPOCH + Duration::new(EPICS_EPOCH_OFFSET + 10, 500);
        let stamp = EpicsTimeStamp::from_system_time(t);
        assert_eq!(stamp, EpicsTimeStamp { secs: 10, nsec: 500 });

        let before = UNIX_EPOCH + Duration::from_secs(5);
        assert_eq!(EpicsTimeStamp::from_system_time(before).secs, 0);
    }

    #[test]
    fn test_zeroed_data() {
        let data = ValueData::zeroed(FieldType::Double, 3);
        assert_eq!(data, ValueData::Double(vec![0.0; 3]));
        assert_eq!(data.get_f64(2), Some(0.0));
        assert_eq!(data.get_f64(3), None);
        assert!(ValueData::zeroed(FieldType::String, 0).is_empty());
    }
}
