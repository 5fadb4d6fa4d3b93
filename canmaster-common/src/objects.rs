//! A typed object dictionary
//!
//! The dictionary stores one [`ObjectEntry`] per (index, sub-index) pair. Every entry knows its
//! [`DataType`], so raw SDO and PDO bytes can be decoded into [`Value`]s and values can be checked
//! against the entry's type and limits before anything is sent. The master keeps one dictionary
//! per remote node as its record of the last known values, and local nodes serve theirs through
//! an SDO server.
//!
//! Entries are also reachable by name. Variables are named directly (e.g. `"Controlword"`) and
//! record or array members are named `"Object.Sub"` (e.g. `"Identity.Vendor-ID"`).

use std::collections::{BTreeMap, HashMap};

use snafu::Snafu;

use crate::{
    constants::object_ids,
    pdo::default_rpdo_cob_id,
    pdo::default_tpdo_cob_id,
    sdo::AbortCode,
    time_types::{TimeDifference, TimeOfDay},
};

/// CiA-301 data types
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum DataType {
    /// BOOLEAN
    Boolean = 0x1,
    /// INTEGER8
    Int8 = 0x2,
    /// INTEGER16
    Int16 = 0x3,
    /// INTEGER32
    Int32 = 0x4,
    /// UNSIGNED8
    UInt8 = 0x5,
    /// UNSIGNED16
    UInt16 = 0x6,
    /// UNSIGNED32
    UInt32 = 0x7,
    /// REAL32
    Real32 = 0x8,
    /// VISIBLE_STRING
    VisibleString = 0x9,
    /// OCTET_STRING
    OctetString = 0xA,
    /// UNICODE_STRING
    UnicodeString = 0xB,
    /// TIME_OF_DAY
    TimeOfDay = 0xC,
    /// TIME_DIFFERENCE
    TimeDifference = 0xD,
    /// DOMAIN
    Domain = 0xF,
    /// REAL64
    Real64 = 0x11,
    /// INTEGER64
    Int64 = 0x15,
    /// UNSIGNED64
    UInt64 = 0x1B,
}

impl DataType {
    /// Look up a data type by its CiA-301 code
    pub fn from_code(code: u16) -> Option<Self> {
        use DataType::*;
        Some(match code {
            0x1 => Boolean,
            0x2 => Int8,
            0x3 => Int16,
            0x4 => Int32,
            0x5 => UInt8,
            0x6 => UInt16,
            0x7 => UInt32,
            0x8 => Real32,
            0x9 => VisibleString,
            0xA => OctetString,
            0xB => UnicodeString,
            0xC => TimeOfDay,
            0xD => TimeDifference,
            0xF => Domain,
            0x11 => Real64,
            0x15 => Int64,
            0x1B => UInt64,
            _ => return None,
        })
    }

    /// The encoded size in bytes, or None for variable length types
    pub fn size(&self) -> Option<usize> {
        use DataType::*;
        match self {
            Boolean | Int8 | UInt8 => Some(1),
            Int16 | UInt16 => Some(2),
            Int32 | UInt32 | Real32 => Some(4),
            TimeOfDay | TimeDifference => Some(6),
            Int64 | UInt64 | Real64 => Some(8),
            VisibleString | OctetString | UnicodeString | Domain => None,
        }
    }

    /// The size in bits used when mapping this type into a PDO
    pub fn bits(&self) -> Option<u8> {
        match self {
            DataType::Boolean => Some(1),
            _ => self.size().map(|s| (s * 8) as u8),
        }
    }

    /// Returns true if data type is one of the string types
    pub fn is_str(&self) -> bool {
        matches!(
            self,
            Self::VisibleString | Self::OctetString | Self::UnicodeString
        )
    }
}

/// Access rights of an object dictionary entry
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum AccessType {
    /// Read-only
    Ro,
    /// Write-only
    Wo,
    /// Read-write
    #[default]
    Rw,
    /// Read-only, and never changed, even internally by the device
    Const,
}

impl AccessType {
    /// True if the entry may be read over SDO
    pub fn is_readable(&self) -> bool {
        !matches!(self, AccessType::Wo)
    }

    /// True if the entry may be written over SDO
    pub fn is_writable(&self) -> bool {
        matches!(self, AccessType::Wo | AccessType::Rw)
    }
}

/// A typed object value
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// BOOLEAN
    Bool(bool),
    /// INTEGER8
    I8(i8),
    /// INTEGER16
    I16(i16),
    /// INTEGER32
    I32(i32),
    /// INTEGER64
    I64(i64),
    /// UNSIGNED8
    U8(u8),
    /// UNSIGNED16
    U16(u16),
    /// UNSIGNED32
    U32(u32),
    /// UNSIGNED64
    U64(u64),
    /// REAL32
    F32(f32),
    /// REAL64
    F64(f64),
    /// VISIBLE_STRING
    VisibleString(String),
    /// OCTET_STRING
    OctetString(Vec<u8>),
    /// UNICODE_STRING, as UTF-16 code units
    UnicodeString(Vec<u16>),
    /// DOMAIN
    Domain(Vec<u8>),
    /// TIME_OF_DAY
    TimeOfDay(TimeOfDay),
    /// TIME_DIFFERENCE
    TimeDifference(TimeDifference),
}

impl Value {
    /// The data type of this value
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Bool(_) => DataType::Boolean,
            Value::I8(_) => DataType::Int8,
            Value::I16(_) => DataType::Int16,
            Value::I32(_) => DataType::Int32,
            Value::I64(_) => DataType::Int64,
            Value::U8(_) => DataType::UInt8,
            Value::U16(_) => DataType::UInt16,
            Value::U32(_) => DataType::UInt32,
            Value::U64(_) => DataType::UInt64,
            Value::F32(_) => DataType::Real32,
            Value::F64(_) => DataType::Real64,
            Value::VisibleString(_) => DataType::VisibleString,
            Value::OctetString(_) => DataType::OctetString,
            Value::UnicodeString(_) => DataType::UnicodeString,
            Value::Domain(_) => DataType::Domain,
            Value::TimeOfDay(_) => DataType::TimeOfDay,
            Value::TimeDifference(_) => DataType::TimeDifference,
        }
    }

    /// The zero or empty value of a data type
    pub fn zero(data_type: DataType) -> Self {
        match data_type {
            DataType::Boolean => Value::Bool(false),
            DataType::Int8 => Value::I8(0),
            DataType::Int16 => Value::I16(0),
            DataType::Int32 => Value::I32(0),
            DataType::Int64 => Value::I64(0),
            DataType::UInt8 => Value::U8(0),
            DataType::UInt16 => Value::U16(0),
            DataType::UInt32 => Value::U32(0),
            DataType::UInt64 => Value::U64(0),
            DataType::Real32 => Value::F32(0.0),
            DataType::Real64 => Value::F64(0.0),
            DataType::VisibleString => Value::VisibleString(String::new()),
            DataType::OctetString => Value::OctetString(Vec::new()),
            DataType::UnicodeString => Value::UnicodeString(Vec::new()),
            DataType::Domain => Value::Domain(Vec::new()),
            DataType::TimeOfDay => Value::TimeOfDay(TimeOfDay::EPOCH),
            DataType::TimeDifference => Value::TimeDifference(TimeDifference::ZERO),
        }
    }

    /// Encode to the little endian wire format
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Value::Bool(v) => vec![*v as u8],
            Value::I8(v) => v.to_le_bytes().to_vec(),
            Value::I16(v) => v.to_le_bytes().to_vec(),
            Value::I32(v) => v.to_le_bytes().to_vec(),
            Value::I64(v) => v.to_le_bytes().to_vec(),
            Value::U8(v) => v.to_le_bytes().to_vec(),
            Value::U16(v) => v.to_le_bytes().to_vec(),
            Value::U32(v) => v.to_le_bytes().to_vec(),
            Value::U64(v) => v.to_le_bytes().to_vec(),
            Value::F32(v) => v.to_le_bytes().to_vec(),
            Value::F64(v) => v.to_le_bytes().to_vec(),
            Value::VisibleString(s) => s.as_bytes().to_vec(),
            Value::OctetString(b) | Value::Domain(b) => b.clone(),
            Value::UnicodeString(s) => s.iter().flat_map(|c| c.to_le_bytes()).collect(),
            Value::TimeOfDay(t) => t.to_le_bytes().to_vec(),
            Value::TimeDifference(t) => t.to_le_bytes().to_vec(),
        }
    }

    /// Decode a value of the given type from the wire format
    ///
    /// Fixed size types must be given exactly their size. Visible strings are truncated at the
    /// first NUL byte.
    pub fn from_bytes(
        data_type: DataType,
        bytes: &[u8],
    ) -> core::result::Result<Self, ValueDecodeError> {
        if let Some(size) = data_type.size() {
            if bytes.len() > size {
                return TooLongSnafu {
                    expected: size,
                    actual: bytes.len(),
                }
                .fail();
            }
            if bytes.len() < size {
                return TooShortSnafu {
                    expected: size,
                    actual: bytes.len(),
                }
                .fail();
            }
        }
        let mut buf = [0u8; 8];
        let len = bytes.len().min(8);
        buf[..len].copy_from_slice(&bytes[..len]);
        Ok(match data_type {
            DataType::Boolean => Value::Bool(buf[0] != 0),
            DataType::Int8 => Value::I8(buf[0] as i8),
            DataType::Int16 => Value::I16(i16::from_le_bytes([buf[0], buf[1]])),
            DataType::Int32 => Value::I32(i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
            DataType::Int64 => Value::I64(i64::from_le_bytes(buf)),
            DataType::UInt8 => Value::U8(buf[0]),
            DataType::UInt16 => Value::U16(u16::from_le_bytes([buf[0], buf[1]])),
            DataType::UInt32 => Value::U32(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
            DataType::UInt64 => Value::U64(u64::from_le_bytes(buf)),
            DataType::Real32 => Value::F32(f32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
            DataType::Real64 => Value::F64(f64::from_le_bytes(buf)),
            DataType::TimeOfDay => Value::TimeOfDay(TimeOfDay::from_le_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5],
            ])),
            DataType::TimeDifference => Value::TimeDifference(TimeDifference::from_le_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5],
            ])),
            DataType::VisibleString => {
                let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
                let s = std::str::from_utf8(&bytes[..end]).map_err(|_| ValueDecodeError::Utf8)?;
                Value::VisibleString(s.to_string())
            }
            DataType::OctetString => Value::OctetString(bytes.to_vec()),
            DataType::Domain => Value::Domain(bytes.to_vec()),
            DataType::UnicodeString => {
                if bytes.len() % 2 != 0 {
                    return Utf16Snafu.fail();
                }
                Value::UnicodeString(
                    bytes
                        .chunks_exact(2)
                        .map(|c| u16::from_le_bytes([c[0], c[1]]))
                        .collect(),
                )
            }
        })
    }

    /// The raw bits of a fixed size value, for packing into a PDO
    pub fn to_bits(&self) -> Option<u64> {
        Some(match self {
            Value::Bool(v) => *v as u64,
            Value::I8(v) => *v as u8 as u64,
            Value::I16(v) => *v as u16 as u64,
            Value::I32(v) => *v as u32 as u64,
            Value::I64(v) => *v as u64,
            Value::U8(v) => *v as u64,
            Value::U16(v) => *v as u64,
            Value::U32(v) => *v as u64,
            Value::U64(v) => *v,
            Value::F32(v) => v.to_bits() as u64,
            Value::F64(v) => v.to_bits(),
            Value::TimeOfDay(_) | Value::TimeDifference(_) => {
                let mut buf = [0u8; 8];
                buf[..6].copy_from_slice(&self.to_bytes());
                u64::from_le_bytes(buf)
            }
            _ => return None,
        })
    }

    /// Rebuild a fixed size value from bits unpacked from a PDO
    pub fn from_bits(data_type: DataType, bits: u64) -> Option<Self> {
        let size = data_type.size()?;
        let bytes = bits.to_le_bytes();
        let mut value = Value::from_bytes(data_type, &bytes[..size]).ok()?;
        if let Value::Bool(b) = &mut value {
            *b = bits & 1 != 0;
        }
        Some(value)
    }

    /// Integer view of the value, for limit checks
    pub fn as_i128(&self) -> Option<i128> {
        Some(match self {
            Value::Bool(v) => *v as i128,
            Value::I8(v) => *v as i128,
            Value::I16(v) => *v as i128,
            Value::I32(v) => *v as i128,
            Value::I64(v) => *v as i128,
            Value::U8(v) => *v as i128,
            Value::U16(v) => *v as i128,
            Value::U32(v) => *v as i128,
            Value::U64(v) => *v as i128,
            _ => return None,
        })
    }

    /// Floating point view of the value, for limit checks
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F32(v) => Some(*v as f64),
            Value::F64(v) => Some(*v),
            _ => self.as_i128().map(|v| v as f64),
        }
    }
}

impl core::fmt::Display for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::I8(v) => write!(f, "{v}"),
            Value::I16(v) => write!(f, "{v}"),
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::U8(v) => write!(f, "{v}"),
            Value::U16(v) => write!(f, "{v}"),
            Value::U32(v) => write!(f, "{v}"),
            Value::U64(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::VisibleString(s) => write!(f, "{s:?}"),
            Value::OctetString(b) | Value::Domain(b) => write!(f, "{b:02X?}"),
            Value::UnicodeString(s) => write!(f, "{:?}", String::from_utf16_lossy(s)),
            Value::TimeOfDay(t) => write!(f, "{t}"),
            Value::TimeDifference(t) => write!(f, "{}ms", t.total_millis()),
        }
    }
}

macro_rules! value_from {
    ($($t:ty => $variant:ident),*) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

value_from!(
    bool => Bool, i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    u8 => U8, u16 => U16, u32 => U32, u64 => U64, f32 => F32, f64 => F64,
    String => VisibleString, TimeOfDay => TimeOfDay, TimeDifference => TimeDifference
);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::VisibleString(v.to_string())
    }
}

/// Error decoding raw bytes as a [`Value`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Snafu)]
pub enum ValueDecodeError {
    /// More bytes than the type holds
    #[snafu(display("Expected {expected} bytes, got {actual}"))]
    TooLong {
        /// Type size
        expected: usize,
        /// Received size
        actual: usize,
    },
    /// Fewer bytes than the type holds
    #[snafu(display("Expected {expected} bytes, got {actual}"))]
    TooShort {
        /// Type size
        expected: usize,
        /// Received size
        actual: usize,
    },
    /// A visible string is not valid UTF-8
    #[snafu(display("String is not valid UTF-8"))]
    Utf8,
    /// A unicode string has an odd number of bytes
    #[snafu(display("Unicode string has an odd length"))]
    Utf16,
}

/// Errors returned by object dictionary operations
#[derive(Clone, Debug, PartialEq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ObjectDictionaryError {
    /// No object at the index
    #[snafu(display("Object 0x{index:04X} does not exist"))]
    NoSuchObject {
        /// Object index
        index: u16,
    },
    /// The object exists but not the sub index
    #[snafu(display("Sub index 0x{index:04X}sub{sub} does not exist"))]
    NoSuchSubIndex {
        /// Object index
        index: u16,
        /// Sub index
        sub: u8,
    },
    /// No entry with the name
    #[snafu(display("No object named {name:?}"))]
    NoSuchName {
        /// The requested name
        name: String,
    },
    /// Write to a read-only or constant entry
    #[snafu(display("0x{index:04X}sub{sub} is read-only"))]
    ReadOnly {
        /// Object index
        index: u16,
        /// Sub index
        sub: u8,
    },
    /// Read of a write-only entry
    #[snafu(display("0x{index:04X}sub{sub} is write-only"))]
    WriteOnly {
        /// Object index
        index: u16,
        /// Sub index
        sub: u8,
    },
    /// The value type does not match the entry type
    #[snafu(display("0x{index:04X}sub{sub} holds {expected:?}, got {actual:?}"))]
    TypeMismatch {
        /// Object index
        index: u16,
        /// Sub index
        sub: u8,
        /// Entry type
        expected: DataType,
        /// Provided type
        actual: DataType,
    },
    /// Raw bytes could not be decoded as the entry type
    #[snafu(display("0x{index:04X}sub{sub}: {source}"))]
    Decode {
        /// Object index
        index: u16,
        /// Sub index
        sub: u8,
        /// Decode failure
        source: ValueDecodeError,
    },
    /// Value above the entry maximum
    #[snafu(display("0x{index:04X}sub{sub}: value above maximum"))]
    ValueTooHigh {
        /// Object index
        index: u16,
        /// Sub index
        sub: u8,
    },
    /// Value below the entry minimum
    #[snafu(display("0x{index:04X}sub{sub}: value below minimum"))]
    ValueTooLow {
        /// Object index
        index: u16,
        /// Sub index
        sub: u8,
    },
}

impl ObjectDictionaryError {
    /// The SDO abort code a server reports for this error
    pub fn abort_code(&self) -> AbortCode {
        match self {
            ObjectDictionaryError::NoSuchObject { .. } => AbortCode::NoSuchObject,
            ObjectDictionaryError::NoSuchName { .. } => AbortCode::NoSuchObject,
            ObjectDictionaryError::NoSuchSubIndex { .. } => AbortCode::NoSuchSubIndex,
            ObjectDictionaryError::ReadOnly { .. } => AbortCode::ReadOnly,
            ObjectDictionaryError::WriteOnly { .. } => AbortCode::WriteOnly,
            ObjectDictionaryError::TypeMismatch { .. } => AbortCode::DataTypeMismatch,
            ObjectDictionaryError::Decode { source, .. } => match source {
                ValueDecodeError::TooLong { .. } => AbortCode::DataTypeMismatchLengthHigh,
                ValueDecodeError::TooShort { .. } => AbortCode::DataTypeMismatchLengthLow,
                _ => AbortCode::InvalidValue,
            },
            ObjectDictionaryError::ValueTooHigh { .. } => AbortCode::ValueTooHigh,
            ObjectDictionaryError::ValueTooLow { .. } => AbortCode::ValueTooLow,
        }
    }
}

type Result<T> = std::result::Result<T, ObjectDictionaryError>;

/// A single object dictionary entry
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectEntry {
    /// Object index
    pub index: u16,
    /// Sub index
    pub sub: u8,
    /// Name used for lookup
    pub name: String,
    /// Data type
    pub data_type: DataType,
    /// Access rights
    pub access: AccessType,
    /// Whether the entry may be mapped into a PDO
    pub pdo_mappable: bool,
    /// Value restored by [`ObjectDictionary::reset_defaults`]
    pub default: Value,
    /// Optional lower limit
    pub min: Option<Value>,
    /// Optional upper limit
    pub max: Option<Value>,
    /// Current (or last known) value
    pub value: Value,
}

impl ObjectEntry {
    /// Create a read-write entry whose type is taken from the default value
    pub fn new(index: u16, sub: u8, name: impl Into<String>, default: impl Into<Value>) -> Self {
        let default = default.into();
        Self {
            index,
            sub,
            name: name.into(),
            data_type: default.data_type(),
            access: AccessType::Rw,
            pdo_mappable: false,
            value: default.clone(),
            default,
            min: None,
            max: None,
        }
    }

    /// Set the access type
    pub fn access(mut self, access: AccessType) -> Self {
        self.access = access;
        self
    }

    /// Allow the entry to be mapped into PDOs
    pub fn mappable(mut self) -> Self {
        self.pdo_mappable = true;
        self
    }

    /// Set value limits
    pub fn limits(mut self, min: impl Into<Value>, max: impl Into<Value>) -> Self {
        self.min = Some(min.into());
        self.max = Some(max.into());
        self
    }

    /// Check a value against the type and limits of this entry
    pub fn validate(&self, value: &Value) -> Result<()> {
        let (index, sub) = (self.index, self.sub);
        if value.data_type() != self.data_type {
            return TypeMismatchSnafu {
                index,
                sub,
                expected: self.data_type,
                actual: value.data_type(),
            }
            .fail();
        }
        if let Some(min) = &self.min {
            if below(value, min) {
                return ValueTooLowSnafu { index, sub }.fail();
            }
        }
        if let Some(max) = &self.max {
            if below(max, value) {
                return ValueTooHighSnafu { index, sub }.fail();
            }
        }
        Ok(())
    }

    /// The bits this entry occupies when mapped into a PDO
    pub fn pdo_bits(&self) -> Option<u8> {
        self.data_type.bits()
    }
}

fn below(a: &Value, b: &Value) -> bool {
    match (a.as_i128(), b.as_i128()) {
        (Some(a), Some(b)) => a < b,
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
    }
}

/// A typed object dictionary
#[derive(Clone, Debug, Default)]
pub struct ObjectDictionary {
    entries: BTreeMap<(u16, u8), ObjectEntry>,
    names: HashMap<String, (u16, u8)>,
}

impl ObjectDictionary {
    /// Create an empty dictionary
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a dictionary holding the standard communication profile objects for a node
    ///
    /// Includes device type, error register, device name, guarding and heartbeat parameters,
    /// identity, store/restore commands, and four RPDOs and TPDOs with default COB-IDs (disabled)
    /// and room for eight mappings each.
    pub fn communication_profile(node_id: u8, device_type: u32, device_name: &str) -> Self {
        use object_ids::*;
        let mut od = Self::new();
        od.insert(ObjectEntry::new(DEVICE_TYPE, 0, "Device type", device_type).access(AccessType::Const));
        od.insert(
            ObjectEntry::new(ERROR_REGISTER, 0, "Error register", 0u8)
                .access(AccessType::Ro)
                .mappable(),
        );
        od.insert(
            ObjectEntry::new(DEVICE_NAME, 0, "Manufacturer device name", device_name)
                .access(AccessType::Const),
        );
        od.insert(ObjectEntry::new(GUARD_TIME, 0, "Guard time", 0u16));
        od.insert(ObjectEntry::new(LIFE_TIME_FACTOR, 0, "Life time factor", 0u8));
        od.insert_record(
            SAVE_OBJECTS,
            "Store parameters",
            vec![
                ObjectEntry::new(SAVE_OBJECTS, 0, "Highest sub-index supported", 1u8)
                    .access(AccessType::Const),
                ObjectEntry::new(SAVE_OBJECTS, 1, "Save all parameters", 1u32),
            ],
        );
        od.insert_record(
            RESTORE_DEFAULTS,
            "Restore default parameters",
            vec![
                ObjectEntry::new(RESTORE_DEFAULTS, 0, "Highest sub-index supported", 1u8)
                    .access(AccessType::Const),
                ObjectEntry::new(RESTORE_DEFAULTS, 1, "Restore all default parameters", 1u32),
            ],
        );
        od.insert(ObjectEntry::new(HEARTBEAT_PRODUCER_TIME, 0, "Producer heartbeat time", 0u16));
        od.insert_record(
            IDENTITY,
            "Identity",
            vec![
                ObjectEntry::new(IDENTITY, 0, "Highest sub-index supported", 4u8)
                    .access(AccessType::Const),
                ObjectEntry::new(IDENTITY, 1, "Vendor-ID", 0u32).access(AccessType::Ro),
                ObjectEntry::new(IDENTITY, 2, "Product code", 0u32).access(AccessType::Ro),
                ObjectEntry::new(IDENTITY, 3, "Revision number", 0u32).access(AccessType::Ro),
                ObjectEntry::new(IDENTITY, 4, "Serial number", 0u32).access(AccessType::Ro),
            ],
        );
        for n in 1..=4usize {
            let rpdo_cob = default_rpdo_cob_id(n, node_id).map(|id| id.raw()).unwrap_or(0);
            let tpdo_cob = default_tpdo_cob_id(n, node_id).map(|id| id.raw()).unwrap_or(0);
            let offset = n as u16 - 1;
            od.insert_pdo(
                object_ids::RPDO_COMM_BASE + offset,
                object_ids::RPDO_MAP_BASE + offset,
                &format!("RPDO{n}"),
                rpdo_cob,
            );
            od.insert_pdo(
                object_ids::TPDO_COMM_BASE + offset,
                object_ids::TPDO_MAP_BASE + offset,
                &format!("TPDO{n}"),
                tpdo_cob,
            );
        }
        od
    }

    fn insert_pdo(&mut self, comm: u16, map: u16, name: &str, cob_id: u32) {
        self.insert_record(
            comm,
            &format!("{name} communication parameter"),
            vec![
                ObjectEntry::new(comm, 0, "Highest sub-index supported", 5u8)
                    .access(AccessType::Const),
                ObjectEntry::new(comm, 1, "COB-ID", cob_id | 1 << 31),
                ObjectEntry::new(comm, 2, "Transmission type", 255u8),
                ObjectEntry::new(comm, 3, "Inhibit time", 0u16),
                ObjectEntry::new(comm, 5, "Event timer", 0u16),
            ],
        );
        let mut subs = vec![ObjectEntry::new(map, 0, "Number of mapped objects", 0u8).limits(0u8, 8u8)];
        for sub in 1..=8u8 {
            subs.push(ObjectEntry::new(map, sub, format!("Mapping {sub}"), 0u32));
        }
        self.insert_record(map, &format!("{name} mapping parameter"), subs);
    }

    /// Insert or replace an entry
    pub fn insert(&mut self, entry: ObjectEntry) {
        let key = (entry.index, entry.sub);
        self.names.insert(entry.name.clone(), key);
        self.entries.insert(key, entry);
    }

    /// Insert the sub-entries of a record or array, naming each `"{name}.{sub name}"`
    pub fn insert_record(&mut self, index: u16, name: &str, subs: Vec<ObjectEntry>) {
        for mut entry in subs {
            entry.index = index;
            entry.name = format!("{name}.{}", entry.name);
            self.insert(entry);
        }
    }

    /// Returns true if any entry exists at the index
    pub fn contains_object(&self, index: u16) -> bool {
        self.entries.range((index, 0u8)..=(index, u8::MAX)).next().is_some()
    }

    /// Look up an entry
    pub fn get(&self, index: u16, sub: u8) -> Result<&ObjectEntry> {
        match self.entries.get(&(index, sub)) {
            Some(entry) => Ok(entry),
            None if self.contains_object(index) => NoSuchSubIndexSnafu { index, sub }.fail(),
            None => NoSuchObjectSnafu { index }.fail(),
        }
    }

    fn get_mut(&mut self, index: u16, sub: u8) -> Result<&mut ObjectEntry> {
        if !self.entries.contains_key(&(index, sub)) {
            self.get(index, sub)?;
        }
        self.entries
            .get_mut(&(index, sub))
            .ok_or(ObjectDictionaryError::NoSuchSubIndex { index, sub })
    }

    /// Resolve a name to its (index, sub) key
    pub fn key_of(&self, name: &str) -> Result<(u16, u8)> {
        self.names.get(name).copied().ok_or_else(|| {
            NoSuchNameSnafu {
                name: name.to_string(),
            }
            .build()
        })
    }

    /// Look up an entry by name
    pub fn get_by_name(&self, name: &str) -> Result<&ObjectEntry> {
        let (index, sub) = self.key_of(name)?;
        self.get(index, sub)
    }

    /// Get the current value of an entry
    pub fn value(&self, index: u16, sub: u8) -> Result<&Value> {
        Ok(&self.get(index, sub)?.value)
    }

    /// Store a value, checking type and limits but not access rights
    ///
    /// Used to record the last known value of a remote entry, or for the application to update a
    /// local one.
    pub fn set_value(&mut self, index: u16, sub: u8, value: Value) -> Result<()> {
        let entry = self.get_mut(index, sub)?;
        entry.validate(&value)?;
        entry.value = value;
        Ok(())
    }

    /// Record a value reported by a device, checking only its type
    ///
    /// Devices are the authority on their own values, so limits are not applied.
    pub fn update_value(&mut self, index: u16, sub: u8, value: Value) -> Result<()> {
        let entry = self.get_mut(index, sub)?;
        if value.data_type() != entry.data_type {
            return TypeMismatchSnafu {
                index,
                sub,
                expected: entry.data_type,
                actual: value.data_type(),
            }
            .fail();
        }
        entry.value = value;
        Ok(())
    }

    /// Check that a value may be written over SDO
    pub fn check_write(&self, index: u16, sub: u8, value: &Value) -> Result<()> {
        let entry = self.get(index, sub)?;
        if !entry.access.is_writable() {
            return ReadOnlySnafu { index, sub }.fail();
        }
        entry.validate(value)
    }

    /// Check that an entry may be read over SDO
    pub fn check_read(&self, index: u16, sub: u8) -> Result<&ObjectEntry> {
        let entry = self.get(index, sub)?;
        if !entry.access.is_readable() {
            return WriteOnlySnafu { index, sub }.fail();
        }
        Ok(entry)
    }

    /// Decode raw bytes as the type of an entry
    pub fn decode(&self, index: u16, sub: u8, bytes: &[u8]) -> Result<Value> {
        let entry = self.get(index, sub)?;
        Value::from_bytes(entry.data_type, bytes).map_err(|source| {
            ObjectDictionaryError::Decode { index, sub, source }
        })
    }

    /// Read an entry's encoded value, as an SDO server does
    pub fn read_bytes(&self, index: u16, sub: u8) -> Result<Vec<u8>> {
        Ok(self.check_read(index, sub)?.value.to_bytes())
    }

    /// Decode, check and store raw bytes, as an SDO server does
    pub fn write_bytes(&mut self, index: u16, sub: u8, bytes: &[u8]) -> Result<Value> {
        let value = self.decode(index, sub, bytes)?;
        self.check_write(index, sub, &value)?;
        self.get_mut(index, sub)?.value = value.clone();
        Ok(value)
    }

    /// Restore every entry to its default value
    pub fn reset_defaults(&mut self) {
        for entry in self.entries.values_mut() {
            entry.value = entry.default.clone();
        }
    }

    /// Restore the communication profile area (0x1000-0x1FFF) to defaults
    pub fn reset_communication(&mut self) {
        for entry in self.entries.range_mut((0x1000u16, 0u8)..(0x2000u16, 0u8)) {
            entry.1.value = entry.1.default.clone();
        }
    }

    /// Iterate over all entries in (index, sub) order
    pub fn iter(&self) -> impl Iterator<Item = &ObjectEntry> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_size_decode_checks_length() {
        assert_eq!(Ok(Value::U16(0x1234)), Value::from_bytes(DataType::UInt16, &[0x34, 0x12]));
        assert!(matches!(
            Value::from_bytes(DataType::UInt16, &[0, 0, 0]),
            Err(ValueDecodeError::TooLong { .. })
        ));
        assert!(matches!(
            Value::from_bytes(DataType::UInt32, &[0]),
            Err(ValueDecodeError::TooShort { .. })
        ));
    }

    #[test]
    fn bits_roundtrip_signed() {
        let v = Value::I16(-2);
        let bits = v.to_bits().unwrap();
        assert_eq!(0xFFFE, bits);
        assert_eq!(Some(v), Value::from_bits(DataType::Int16, bits));
    }

    #[test]
    fn limits_are_enforced() {
        let entry = ObjectEntry::new(0x2000, 0, "Speed", 0i32).limits(-100i32, 100i32);
        assert!(entry.validate(&Value::I32(100)).is_ok());
        assert!(matches!(
            entry.validate(&Value::I32(101)),
            Err(ObjectDictionaryError::ValueTooHigh { .. })
        ));
        assert!(matches!(
            entry.validate(&Value::I32(-101)),
            Err(ObjectDictionaryError::ValueTooLow { .. })
        ));
        assert!(matches!(
            entry.validate(&Value::U8(1)),
            Err(ObjectDictionaryError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn missing_object_and_sub_are_distinct() {
        let od = ObjectDictionary::communication_profile(5, 0x192, "Test");
        assert_eq!(
            Err(ObjectDictionaryError::NoSuchObject { index: 0x3000 }),
            od.get(0x3000, 0).map(|_| ())
        );
        assert_eq!(
            Err(ObjectDictionaryError::NoSuchSubIndex {
                index: 0x1018,
                sub: 9
            }),
            od.get(0x1018, 9).map(|_| ())
        );
    }
}
