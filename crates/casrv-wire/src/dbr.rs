//! DBR buffer types.
//!
//! Codes 0-34 are five families (plain, STS, TIME, GR, CTRL) over the seven
//! field types; 35-38 are the alarm-acknowledge and class-name specials.
//! Sizes and value offsets are those of the packed C structures clients use.

use crate::value::FieldType;

/// Highest valid DBR code.
pub const LAST_BUFFER_TYPE: u16 = 38;

/// Bytes in a `dbr_string_t`, including the terminator.
pub const MAX_STRING_SIZE: usize = 40;

/// Bytes in one enum state string, including the terminator.
pub const MAX_ENUM_STRING_SIZE: usize = 26;

/// Number of enum state strings carried by GR/CTRL enum buffers.
pub const MAX_ENUM_STATES: usize = 16;

/// Offset of `no_str` in GR/CTRL enum buffers.
pub const ENUM_NO_STR_OFFSET: usize = 4;

/// Offset of the first state string in GR/CTRL enum buffers.
pub const ENUM_STRS_OFFSET: usize = 6;

const COUNT: usize = LAST_BUFFER_TYPE as usize + 1;

const SIZES: [usize; COUNT] = [
    40, 2, 4, 2, 1, 4, 8, // plain
    44, 6, 8, 6, 6, 8, 16, // sts
    52, 16, 16, 16, 16, 16, 24, // time
    44, 26, 44, 424, 20, 40, 72, // gr
    44, 30, 52, 424, 22, 48, 88, // ctrl
    2, 2, 48, 40, // put_ackt, put_acks, stsack_string, class_name
];

const VALUE_SIZES: [usize; COUNT] = [
    40, 2, 4, 2, 1, 4, 8, //
    40, 2, 4, 2, 1, 4, 8, //
    40, 2, 4, 2, 1, 4, 8, //
    40, 2, 4, 2, 1, 4, 8, //
    40, 2, 4, 2, 1, 4, 8, //
    2, 2, 40, 40,
];

const VALUE_OFFSETS: [usize; COUNT] = [
    0, 0, 0, 0, 0, 0, 0, //
    4, 4, 4, 4, 5, 4, 8, //
    12, 14, 12, 14, 15, 12, 16, //
    4, 24, 40, 422, 19, 36, 64, //
    4, 28, 48, 422, 21, 44, 80, //
    0, 0, 8, 0,
];

const NAMES: [&str; COUNT] = [
    "DBR_STRING",
    "DBR_SHORT",
    "DBR_FLOAT",
    "DBR_ENUM",
    "DBR_CHAR",
    "DBR_LONG",
    "DBR_DOUBLE",
    "DBR_STS_STRING",
    "DBR_STS_SHORT",
    "DBR_STS_FLOAT",
    "DBR_STS_ENUM",
    "DBR_STS_CHAR",
    "DBR_STS_LONG",
    "DBR_STS_DOUBLE",
    "DBR_TIME_STRING",
    "DBR_TIME_SHORT",
    "DBR_TIME_FLOAT",
    "DBR_TIME_ENUM",
    "DBR_TIME_CHAR",
    "DBR_TIME_LONG",
    "DBR_TIME_DOUBLE",
    "DBR_GR_STRING",
    "DBR_GR_SHORT",
    "DBR_GR_FLOAT",
    "DBR_GR_ENUM",
    "DBR_GR_CHAR",
    "DBR_GR_LONG",
    "DBR_GR_DOUBLE",
    "DBR_CTRL_STRING",
    "DBR_CTRL_SHORT",
    "DBR_CTRL_FLOAT",
    "DBR_CTRL_ENUM",
    "DBR_CTRL_CHAR",
    "DBR_CTRL_LONG",
    "DBR_CTRL_DOUBLE",
    "DBR_PUT_ACKT",
    "DBR_PUT_ACKS",
    "DBR_STSACK_STRING",
    "DBR_CLASS_NAME",
];

/// Structure family of a DBR type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbrClass {
    Plain,
    Sts,
    Time,
    Gr,
    Ctrl,
    PutAckt,
    PutAcks,
    StsAckString,
    ClassName,
}

/// A validated DBR type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DbrType(u16);

impl DbrType {
    pub const STRING: Self = Self(0);
    pub const SHORT: Self = Self(1);
    pub const FLOAT: Self = Self(2);
    pub const ENUM: Self = Self(3);
    pub const CHAR: Self = Self(4);
    pub const LONG: Self = Self(5);
    pub const DOUBLE: Self = Self(6);
    pub const TIME_DOUBLE: Self = Self(20);
    pub const GR_ENUM: Self = Self(24);
    pub const CTRL_ENUM: Self = Self(31);
    pub const CTRL_DOUBLE: Self = Self(34);

    /// Validate a wire code.
    pub fn from_code(code: u16) -> Option<Self> {
        (code <= LAST_BUFFER_TYPE).then_some(Self(code))
    }

    /// The plain buffer type carrying `field` values.
    pub fn plain(field: FieldType) -> Self {
        Self(field.dbr_code())
    }

    pub fn code(self) -> u16 {
        self.0
    }

    pub fn name(self) -> &'static str {
        NAMES[self.index()]
    }

    pub fn class(self) -> DbrClass {
        match self.0 {
            0..=6 => DbrClass::Plain,
            7..=13 => DbrClass::Sts,
            14..=20 => DbrClass::Time,
            21..=27 => DbrClass::Gr,
            28..=34 => DbrClass::Ctrl,
            35 => DbrClass::PutAckt,
            36 => DbrClass::PutAcks,
            37 => DbrClass::StsAckString,
            _ => DbrClass::ClassName,
        }
    }

    /// Element type of the value member.
    pub fn field_type(self) -> FieldType {
        match self.0 {
            0..=34 => match self.0 % 7 {
                0 => FieldType::String,
                1 => FieldType::Short,
                2 => FieldType::Float,
                3 => FieldType::Enum,
                4 => FieldType::Char,
                5 => FieldType::Long,
                _ => FieldType::Double,
            },
            35 | 36 => FieldType::Short,
            _ => FieldType::String,
        }
    }

    /// Size of the structure holding one element.
    pub fn size(self) -> usize {
        SIZES[self.index()]
    }

    /// Size of one value element.
    pub fn value_size(self) -> usize {
        VALUE_SIZES[self.index()]
    }

    /// Offset of the first value element inside the structure.
    pub fn value_offset(self) -> usize {
        VALUE_OFFSETS[self.index()]
    }

    /// Size of the structure holding `count` elements.
    pub fn size_n(self, count: u32) -> usize {
        if count == 0 {
            self.size()
        } else {
            self.size() + (count as usize - 1) * self.value_size()
        }
    }

    /// Whether the value is preceded by metadata (alarm, stamp, limits).
    pub fn is_compound(self) -> bool {
        self.value_offset() != 0
    }

    /// GR and CTRL enum buffers carry the state string table.
    pub fn carries_enum_strings(self) -> bool {
        self == Self::GR_ENUM || self == Self::CTRL_ENUM
    }

    fn index(self) -> usize {
        usize::from(self.0)
    }
}
