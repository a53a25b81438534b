//! Process variable definitions loaded from JSON.
//!
//! ```json
//! {
//!   "pvs": [
//!     { "name": "tempA", "type": "double", "value": 21.5 },
//!     { "name": "wave", "type": "long", "count": 4, "value": [1, 2, 3, 4] },
//!     { "name": "mode", "type": "enum", "enum_strings": ["off", "on"], "value": "on" },
//!     { "name": "setpoint", "type": "float", "writers": ["operator"] }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use casrv_wire::{FieldType, ValueData, MAX_ENUM_STATES, MAX_ENUM_STRING_SIZE, MAX_STRING_SIZE};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid catalogue JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("process variable {name:?}: {reason}")]
    Invalid { name: String, reason: String },
}

pub type Result<T> = std::result::Result<T, CatalogError>;

/// One configured process variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PvDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default = "default_count")]
    pub count: u32,
    /// Scalar or array; missing elements are zero.
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub enum_strings: Vec<String>,
    #[serde(default = "default_true")]
    pub read: bool,
    #[serde(default = "default_true")]
    pub write: bool,
    /// Users allowed to write. Everyone when absent.
    #[serde(default)]
    pub writers: Option<Vec<String>>,
}

fn default_count() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl PvDefinition {
    pub fn parsed_type(&self) -> Result<FieldType> {
        FieldType::from_name(&self.field_type)
            .ok_or_else(|| self.invalid(format!("unknown type {:?}", self.field_type)))
    }

    /// Initial elements, `count` of them.
    pub fn initial_data(&self) -> Result<ValueData> {
        let field = self.parsed_type()?;
        let count = self.count as usize;
        let elements: Vec<&serde_json::Value> = match &self.value {
            None => Vec::new(),
            Some(serde_json::Value::Array(items)) => items.iter().collect(),
            Some(scalar) => vec![scalar],
        };
        if elements.len() > count {
            return Err(self.invalid(format!(
                "{} initial elements for a count of {count}",
                elements.len()
            )));
        }

        let mut data = ValueData::zeroed(field, count);
        for (index, element) in elements.into_iter().enumerate() {
            self.store(&mut data, index, element)?;
        }
        Ok(data)
    }

    fn store(&self, data: &mut ValueData, index: usize, element: &serde_json::Value) -> Result<()> {
        let bad = || self.invalid(format!("element {index} ({element}) does not fit"));
        match data {
            ValueData::String(v) => {
                let text = element.as_str().ok_or_else(bad)?;
                if text.len() >= MAX_STRING_SIZE {
                    return Err(bad());
                }
                v[index] = text.to_string();
            }
            ValueData::Enum(v) => {
                v[index] = match element {
                    serde_json::Value::String(state) => self
                        .enum_strings
                        .iter()
                        .position(|s| s == state)
                        .and_then(|i| u16::try_from(i).ok())
                        .ok_or_else(bad)?,
                    other => other.as_u64().and_then(|n| u16::try_from(n).ok()).ok_or_else(bad)?,
                };
            }
            ValueData::Short(v) => {
                v[index] = element.as_i64().and_then(|n| i16::try_from(n).ok()).ok_or_else(bad)?;
            }
            ValueData::Char(v) => {
                v[index] = element.as_u64().and_then(|n| u8::try_from(n).ok()).ok_or_else(bad)?;
            }
            ValueData::Long(v) => {
                v[index] = element.as_i64().and_then(|n| i32::try_from(n).ok()).ok_or_else(bad)?;
            }
            ValueData::Float(v) => v[index] = element.as_f64().ok_or_else(bad)? as f32,
            ValueData::Double(v) => v[index] = element.as_f64().ok_or_else(bad)?,
        }
        Ok(())
    }

    /// Whether `user` may write, before the `write` flag is considered.
    pub fn allows_writer(&self, user: &str) -> bool {
        self.writers
            .as_ref()
            .is_none_or(|writers| writers.iter().any(|w| w == user))
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(self.invalid("empty name"));
        }
        if self.count == 0 {
            return Err(self.invalid("count must be at least 1"));
        }
        let field = self.parsed_type()?;
        if field == FieldType::Enum {
            if self.enum_strings.len() > MAX_ENUM_STATES {
                return Err(self.invalid(format!("more than {MAX_ENUM_STATES} enum states")));
            }
            if self.enum_strings.iter().any(|s| s.len() >= MAX_ENUM_STRING_SIZE) {
                return Err(self.invalid("enum state string too long"));
            }
        } else if !self.enum_strings.is_empty() {
            return Err(self.invalid("enum_strings on a non-enum variable"));
        }
        self.initial_data().map(|_| ())
    }

    fn invalid(&self, reason: impl Into<String>) -> CatalogError {
        CatalogError::Invalid {
            name: self.name.clone(),
            reason: reason.into(),
        }
    }
}

/// A validated set of process variable definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub pvs: Vec<PvDefinition>,
}

impl Catalog {
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let catalog: Catalog = serde_json::from_str(text)?;
        catalog.validate()?;
        Ok(catalog)
    }

    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for pv in &self.pvs {
            pv.validate()?;
            if !names.insert(pv.name.as_str()) {
                return Err(pv.invalid("defined more than once"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply() {
        let catalog = Catalog::from_json(r#"{"pvs":[{"name":"tempA","type":"double"}]}"#)
            .expect("catalogue should parse");
        let pv = &catalog.pvs[0];
        assert_eq!(pv.count, 1);
        assert!(pv.read && pv.write);
        assert!(pv.allows_writer("anyone"));
        assert_eq!(pv.initial_data().unwrap(), ValueData::Double(vec![0.0]));
    }

    #[test]
    fn test_array_value_padded_with_zeros() {
        let catalog = Catalog::from_json(
            r#"{"pvs":[{"name":"wave","type":"long","count":4,"value":[1,2]}]}"#,
        )
        .unwrap();
        assert_eq!(
            catalog.pvs[0].initial_data().unwrap(),
            ValueData::Long(vec![1, 2, 0, 0])
        );
    }

    #[test]
    fn test_enum_value_by_state_name() {
        let catalog = Catalog::from_json(
            r#"{"pvs":[{"name":"mode","type":"enum","enum_strings":["off","on"],"value":"on"}]}"#,
        )
        .unwrap();
        assert_eq!(catalog.pvs[0].initial_data().unwrap(), ValueData::Enum(vec![1]));
    }

    #[test]
    fn test_writers_restrict() {
        let catalog = Catalog::from_json(
            r#"{"pvs":[{"name":"sp","type":"float","writers":["operator"]}]}"#,
        )
        .unwrap();
        assert!(catalog.pvs[0].allows_writer("operator"));
        assert!(!catalog.pvs[0].allows_writer("guest"));
    }

    #[test]
    fn test_rejects_bad_definitions() {
        let cases = [
            r#"{"pvs":[{"name":"a","type":"quad"}]}"#,
            r#"{"pvs":[{"name":"a","type":"short","value":70000}]}"#,
            r#"{"pvs":[{"name":"a","type":"double","count":0}]}"#,
            r#"{"pvs":[{"name":"a","type":"double","value":[1,2]}]}"#,
            r#"{"pvs":[{"name":"a","type":"double","enum_strings":["x"]}]}"#,
            r#"{"pvs":[{"name":"a","type":"double"},{"name":"a","type":"long"}]}"#,
        ];
        for case in cases {
            assert!(
                matches!(Catalog::from_json(case), Err(CatalogError::Invalid { .. })),
                "{case} should be rejected"
            );
        }
        assert!(matches!(
            Catalog::from_json("{"),
            Err(CatalogError::Json(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = Catalog::from_path(Path::new("/nonexistent/casrv-pvs.json")).unwrap_err();
        assert!(matches!(err, CatalogError::Io { .. }));
    }
}
