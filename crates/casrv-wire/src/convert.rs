//! Serialization between [`Value`] containers and DBR payloads.
//!
//! Element conversion is a plain cast between numeric types, decimal
//! formatting/parsing for strings, and state-table lookup for enums.
//! Limits, units and precision in GR/CTRL buffers are sent as zero.

use crate::dbr::{
    DbrClass, DbrType, ENUM_NO_STR_OFFSET, ENUM_STRS_OFFSET, MAX_ENUM_STATES,
    MAX_ENUM_STRING_SIZE, MAX_STRING_SIZE,
};
use crate::value::{FieldType, Value, ValueData};

/// Reasons a value cannot be carried by the requested buffer type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConvertError {
    #[error("no conversion from {from:?} to {to:?}")]
    NoConversion { from: FieldType, to: FieldType },

    #[error("{0:?} is not a number")]
    BadNumber(String),

    #[error("{0:?} is not an enum state")]
    UnknownState(String),

    #[error("payload holds {have} bytes, {need} needed")]
    Truncated { have: usize, need: usize },

    #[error("{0} cannot carry a write")]
    Compound(&'static str),
}

/// Serialize `value` as `count` elements of `dbr`.
///
/// The result is exactly `dbr.size_n(count)` bytes. Elements the value does not
/// have are left zero.
pub fn encode_dbr(
    dbr: DbrType,
    count: u32,
    value: &Value,
    enum_strings: &[String],
) -> Result<Vec<u8>, ConvertError> {
    let mut out = vec![0u8; dbr.size_n(count)];

    match dbr.class() {
        DbrClass::Plain | DbrClass::PutAckt | DbrClass::PutAcks => {}
        DbrClass::Sts | DbrClass::Gr | DbrClass::Ctrl | DbrClass::StsAckString => {
            put_alarm(&mut out, value);
        }
        DbrClass::Time => {
            put_alarm(&mut out, value);
            out[4..8].copy_from_slice(&value.stamp.secs.to_be_bytes());
            out[8..12].copy_from_slice(&value.stamp.nsec.to_be_bytes());
        }
        DbrClass::ClassName => {
            put_string(&mut out[..MAX_STRING_SIZE], value.field_type().name());
            return Ok(out);
        }
    }

    if dbr.carries_enum_strings() {
        let states = enum_strings.len().min(MAX_ENUM_STATES);
        out[ENUM_NO_STR_OFFSET..ENUM_NO_STR_OFFSET + 2]
            .copy_from_slice(&(states as u16).to_be_bytes());
        for (i, state) in enum_strings.iter().take(states).enumerate() {
            let at = ENUM_STRS_OFFSET + i * MAX_ENUM_STRING_SIZE;
            put_string(&mut out[at..at + MAX_ENUM_STRING_SIZE], state);
        }
    }

    let converted = convert_data(&value.data, dbr.field_type(), enum_strings)?;
    let elements = converted.len().min(count as usize);
    let base = dbr.value_offset();
    let width = dbr.value_size();
    for i in 0..elements {
        let at = base + i * width;
        put_element(&mut out[at..at + width], &converted, i);
    }

    Ok(out)
}

/// Decode a write payload of `count` elements of `dbr` into `target` elements.
pub fn decode_put(
    dbr: DbrType,
    count: u32,
    payload: &[u8],
    target: FieldType,
    enum_strings: &[String],
) -> Result<ValueData, ConvertError> {
    if dbr.is_compound() {
        return Err(ConvertError::Compound(dbr.name()));
    }

    let width = dbr.value_size();
    let n = count as usize;
    let need = n * width;
    if payload.len() < need {
        return Err(ConvertError::Truncated {
            have: payload.len(),
            need,
        });
    }

    let chunks = payload[..need].chunks_exact(width);
    let wire = match dbr.field_type() {
        FieldType::String => ValueData::String(chunks.map(get_string).collect()),
        FieldType::Short => {
            ValueData::Short(chunks.map(|c| i16::from_be_bytes([c[0], c[1]])).collect())
        }
        FieldType::Float => ValueData::Float(
            chunks
                .map(|c| f32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        FieldType::Enum => {
            ValueData::Enum(chunks.map(|c| u16::from_be_bytes([c[0], c[1]])).collect())
        }
        FieldType::Char => ValueData::Char(chunks.map(|c| c[0]).collect()),
        FieldType::Long => ValueData::Long(
            chunks
                .map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        FieldType::Double => ValueData::Double(
            chunks
                .map(|c| f64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        ),
    };

    convert_data(&wire, target, enum_strings)
}

/// Convert every element of `src` to `target`.
pub fn convert_data(
    src: &ValueData,
    target: FieldType,
    enum_strings: &[String],
) -> Result<ValueData, ConvertError> {
    if src.field_type() == target {
        return Ok(src.clone());
    }

    if let ValueData::String(strings) = src {
        return from_strings(strings, target, enum_strings);
    }

    let n = src.len();
    let nums = (0..n).filter_map(|i| src.get_f64(i));
    Ok(match target {
        FieldType::String => {
            let mut out = Vec::with_capacity(n);
            for i in 0..n {
                out.push(format_element(src, i, enum_strings));
            }
            ValueData::String(out)
        }
        FieldType::Short => ValueData::Short(nums.map(|x| x as i16).collect()),
        FieldType::Float => ValueData::Float(nums.map(|x| x as f32).collect()),
        FieldType::Enum => ValueData::Enum(nums.map(|x| x as u16).collect()),
        FieldType::Char => ValueData::Char(nums.map(|x| x as u8).collect()),
        FieldType::Long => ValueData::Long(nums.map(|x| x as i32).collect()),
        FieldType::Double => ValueData::Double(nums.collect()),
    })
}

fn from_strings(
    strings: &[String],
    target: FieldType,
    enum_strings: &[String],
) -> Result<ValueData, ConvertError> {
    if target == FieldType::Enum {
        let mut states = Vec::with_capacity(strings.len());
        for s in strings {
            let trimmed = s.trim();
            let state = match enum_strings.iter().position(|e| e == trimmed) {
                Some(pos) => pos as u16,
                None => trimmed
                    .parse::<u16>()
                    .map_err(|_| ConvertError::UnknownState(s.clone()))?,
            };
            states.push(state);
        }
        return Ok(ValueData::Enum(states));
    }

    let mut nums = Vec::with_capacity(strings.len());
    for s in strings {
        let trimmed = s.trim();
        let parsed = if trimmed.is_empty() {
            0.0
        } else {
            trimmed
                .parse::<f64>()
                .map_err(|_| ConvertError::BadNumber(s.clone()))?
        };
        nums.push(parsed);
    }
    convert_data(&ValueData::Double(nums), target, enum_strings)
}

fn format_element(src: &ValueData, index: usize, enum_strings: &[String]) -> String {
    match src {
        ValueData::String(v) => v[index].clone(),
        ValueData::Short(v) => v[index].to_string(),
        ValueData::Float(v) => v[index].to_string(),
        ValueData::Enum(v) => enum_strings
            .get(usize::from(v[index]))
            .cloned()
            .unwrap_or_else(|| v[index].to_string()),
        ValueData::Char(v) => v[index].to_string(),
        ValueData::Long(v) => v[index].to_string(),
        ValueData::Double(v) => v[index].to_string(),
    }
}

fn put_alarm(out: &mut [u8], value: &Value) {
    out[0..2].copy_from_slice(&value.status.to_be_bytes());
    out[2..4].copy_from_slice(&value.severity.to_be_bytes());
}

fn put_element(dst: &mut [u8], data: &ValueData, index: usize) {
    match data {
        ValueData::String(v) => put_string(dst, &v[index]),
        ValueData::Short(v) => dst.copy_from_slice(&v[index].to_be_bytes()),
        ValueData::Float(v) => dst.copy_from_slice(&v[index].to_be_bytes()),
        ValueData::Enum(v) => dst.copy_from_slice(&v[index].to_be_bytes()),
        ValueData::Char(v) => dst[0] = v[index],
        ValueData::Long(v) => dst.copy_from_slice(&v[index].to_be_bytes()),
        ValueData::Double(v) => dst.copy_from_slice(&v[index].to_be_bytes()),
    }
}

/// Copy `s` into a fixed-size, zero-filled field, always leaving a terminator.
fn put_string(dst: &mut [u8], s: &str) {
    let n = s.len().min(dst.len().saturating_sub(1));
    dst[..n].copy_from_slice(&s.as_bytes()[..n]);
}

fn get_string(field: &[u8]) -> String {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::EpicsTimeStamp;

    fn states() -> Vec<String> {
        vec!["Off".to_string(), "On".to_string()]
    }

    #[test]
    fn test_encode_plain_double() {
        let value = Value::new(ValueData::Double(vec![1.5]));
        let out = encode_dbr(DbrType::DOUBLE, 1, &value, &[]).unwrap();
        assert_eq!(out, 1.5f64.to_be_bytes().to_vec());
    }

    #[test]
    fn test_encode_time_double_carries_alarm_and_stamp() {
        let value = Value::new(ValueData::Double(vec![2.0, 3.0]))
            .with_alarm(3, 2)
            .with_stamp(EpicsTimeStamp { secs: 7, nsec: 9 });
        let out = encode_dbr(DbrType::TIME_DOUBLE, 2, &value, &[]).unwrap();

        assert_eq!(out.len(), 32);
        assert_eq!(&out[0..4], &[0, 3, 0, 2]);
        assert_eq!(&out[4..8], &7u32.to_be_bytes());
        assert_eq!(&out[8..12], &9u32.to_be_bytes());
        assert_eq!(&out[16..24], &2.0f64.to_be_bytes());
        assert_eq!(&out[24..32], &3.0f64.to_be_bytes());
    }

    #[test]
    fn test_encode_pads_missing_elements() {
        let value = Value::new(ValueData::Long(vec![5]));
        let out = encode_dbr(DbrType::LONG, 3, &value, &[]).unwrap();
        assert_eq!(out, vec![0, 0, 0, 5, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_encode_enum_as_string_uses_state_table() {
        let value = Value::new(ValueData::Enum(vec![1]));
        let out = encode_dbr(DbrType::STRING, 1, &value, &states()).unwrap();
        assert_eq!(out.len(), MAX_STRING_SIZE);
        assert_eq!(&out[..3], b"On\0");
    }

    #[test]
    fn test_encode_ctrl_enum_state_table() {
        let value = Value::new(ValueData::Enum(vec![0]));
        let out = encode_dbr(DbrType::CTRL_ENUM, 1, &value, &states()).unwrap();
        assert_eq!(out.len(), 424);
        assert_eq!(&out[4..6], &2u16.to_be_bytes());
        assert_eq!(&out[6..9], b"Off");
        assert_eq!(&out[32..34], b"On");
    }

    #[test]
    fn test_encode_rejects_non_numeric_string() {
        let value = Value::new(ValueData::String(vec!["abc".to_string()]));
        let err = encode_dbr(DbrType::DOUBLE, 1, &value, &[]).unwrap_err();
        assert_eq!(err, ConvertError::BadNumber("abc".to_string()));
    }

    #[test]
    fn test_long_string_keeps_terminator() {
        let long = "x".repeat(60);
        let value = Value::new(ValueData::String(vec![long]));
        let out = encode_dbr(DbrType::STRING, 1, &value, &[]).unwrap();
        assert_eq!(out[MAX_STRING_SIZE - 1], 0);
        assert_eq!(out[MAX_STRING_SIZE - 2], b'x');
    }

    #[test]
    fn test_decode_short_array_to_double() {
        let payload = [0, 1, 0xff, 0xff, 0, 0, 0, 0];
        let data = decode_put(DbrType::SHORT, 2, &payload, FieldType::Double, &[]).unwrap();
        assert_eq!(data, ValueData::Double(vec![1.0, -1.0]));
    }

    #[test]
    fn test_decode_string_to_enum() {
        let mut payload = vec![0u8; MAX_STRING_SIZE];
        payload[..2].copy_from_slice(b"On");
        let data = decode_put(DbrType::STRING, 1, &payload, FieldType::Enum, &states()).unwrap();
        assert_eq!(data, ValueData::Enum(vec![1]));
    }

    #[test]
    fn test_decode_rejects_compound_and_short_payload() {
        let err = decode_put(DbrType::TIME_DOUBLE, 1, &[0; 24], FieldType::Double, &[]);
        assert_eq!(err, Err(ConvertError::Compound("DBR_TIME_DOUBLE")));

        let err = decode_put(DbrType::DOUBLE, 2, &[0; 8], FieldType::Double, &[]);
        assert_eq!(err, Err(ConvertError::Truncated { have: 8, need: 16 }));
    }
}
