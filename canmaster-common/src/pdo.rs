//! Definitions and data types related to PDOs

use crate::messages::CanId;

/// The largest number of data bits a PDO can carry
pub const MAX_PDO_BITS: u32 = 64;

/// The largest number of mapping entries a mapping parameter record can hold
pub const MAX_MAPPINGS: usize = 64;

/// Represents a PDO mapping
///
/// Each mapping specifies one sub-object to be included in the PDO data bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "std",
    derive(serde::Deserialize),
    serde(deny_unknown_fields)
)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PdoMapping {
    /// The object index
    pub index: u16,
    /// The object sub index
    pub sub: u8,
    /// The size of the object to map, in **bits**
    pub size: u8,
}

impl PdoMapping {
    /// Convert a PdoMapping object to the u32 representation stored in the mapping parameter
    pub fn to_object_value(&self) -> u32 {
        ((self.index as u32) << 16) | ((self.sub as u32) << 8) | (self.size as u32)
    }

    /// Create a PdoMapping object from the raw u32 representation stored in the mapping parameter
    pub fn from_object_value(value: u32) -> Self {
        let index = (value >> 16) as u16;
        let sub = ((value >> 8) & 0xff) as u8;
        let size = (value & 0xff) as u8;
        Self { index, sub, size }
    }
}

/// Returns the total number of bits used by a list of mappings
pub fn mapped_bits(mappings: &[PdoMapping]) -> u32 {
    mappings.iter().map(|m| m.size as u32).sum()
}

/// Pack values into a PDO payload
///
/// Each value is truncated to the size of its mapping and placed little-endian at the bit offset
/// following the previous mapping. Returns the payload and its length in bytes, or None if the
/// mappings exceed 64 bits.
pub fn pack(mappings: &[PdoMapping], values: &[u64]) -> Option<([u8; 8], usize)> {
    let total = mapped_bits(mappings);
    if total > MAX_PDO_BITS {
        return None;
    }
    let mut raw: u64 = 0;
    let mut offset = 0u32;
    for (m, value) in mappings.iter().zip(values.iter()) {
        let bits = m.size as u32;
        if bits > 0 {
            raw |= (value & mask(bits)) << offset;
        }
        offset += bits;
    }
    Some((raw.to_le_bytes(), total.div_ceil(8) as usize))
}

/// Unpack a PDO payload into one value per mapping
///
/// Returns None if the payload is shorter than the mapped length.
pub fn unpack(mappings: &[PdoMapping], data: &[u8]) -> Option<PdoValues> {
    let total = mapped_bits(mappings);
    if total > MAX_PDO_BITS || data.len() * 8 < total as usize {
        return None;
    }
    let mut buf = [0u8; 8];
    buf[..data.len().min(8)].copy_from_slice(&data[..data.len().min(8)]);
    let raw = u64::from_le_bytes(buf);
    let mut values = PdoValues::default();
    let mut offset = 0u32;
    for m in mappings {
        let bits = m.size as u32;
        let value = if offset >= 64 { 0 } else { (raw >> offset) & mask(bits) };
        values.push(value);
        offset += bits;
    }
    Some(values)
}

fn mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Unpacked PDO values, one per mapping, in mapping order
///
/// Fixed capacity, as a PDO holds at most 64 one-bit mappings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PdoValues {
    len: usize,
    values: [u64; MAX_MAPPINGS],
}

impl Default for PdoValues {
    fn default() -> Self {
        Self {
            len: 0,
            values: [0; MAX_MAPPINGS],
        }
    }
}

impl PdoValues {
    fn push(&mut self, value: u64) {
        if self.len < self.values.len() {
            self.values[self.len] = value;
            self.len += 1;
        }
    }

    /// The values as a slice
    pub fn as_slice(&self) -> &[u64] {
        &self.values[..self.len]
    }
}

impl core::ops::Deref for PdoValues {
    type Target = [u64];

    fn deref(&self) -> &[u64] {
        self.as_slice()
    }
}

/// When a PDO is transmitted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransmissionType {
    /// Sent on the first SYNC after its data changes
    SyncAcyclic,
    /// Sent every N SYNCs, N in 1..=240
    SyncCyclic(u8),
    /// Sampled on SYNC, sent only on remote request
    RtrSync,
    /// Sent only on remote request
    RtrEvent,
    /// Manufacturer specific event driven
    EventManufacturer,
    /// Device profile event driven
    EventProfile,
}

/// Error returned for transmission type values which are reserved
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReservedTransmissionType(pub u8);

impl core::fmt::Display for ReservedTransmissionType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Transmission type {} is reserved", self.0)
    }
}

impl core::error::Error for ReservedTransmissionType {}

impl TryFrom<u8> for TransmissionType {
    type Error = ReservedTransmissionType;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TransmissionType::SyncAcyclic),
            1..=240 => Ok(TransmissionType::SyncCyclic(value)),
            252 => Ok(TransmissionType::RtrSync),
            253 => Ok(TransmissionType::RtrEvent),
            254 => Ok(TransmissionType::EventManufacturer),
            255 => Ok(TransmissionType::EventProfile),
            _ => Err(ReservedTransmissionType(value)),
        }
    }
}

impl From<TransmissionType> for u8 {
    fn from(value: TransmissionType) -> Self {
        match value {
            TransmissionType::SyncAcyclic => 0,
            TransmissionType::SyncCyclic(n) => n,
            TransmissionType::RtrSync => 252,
            TransmissionType::RtrEvent => 253,
            TransmissionType::EventManufacturer => 254,
            TransmissionType::EventProfile => 255,
        }
    }
}

impl TransmissionType {
    /// True for types driven by SYNC (acyclic or cyclic)
    pub fn is_synchronous(&self) -> bool {
        matches!(
            self,
            TransmissionType::SyncAcyclic | TransmissionType::SyncCyclic(_)
        )
    }

    /// True for types sent on event timer expiry or data change
    pub fn is_event_driven(&self) -> bool {
        matches!(
            self,
            TransmissionType::EventManufacturer | TransmissionType::EventProfile
        )
    }

    /// True for types only sent in response to a remote request
    pub fn is_rtr_only(&self) -> bool {
        matches!(self, TransmissionType::RtrSync | TransmissionType::RtrEvent)
    }
}

/// The COB-ID value stored in sub 1 of a PDO communication parameter
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PdoCobId {
    /// The frame identifier
    pub id: CanId,
    /// Bit 31 clear: the PDO exists and is active
    pub valid: bool,
    /// Bit 30 clear: remote requests are allowed
    pub rtr_allowed: bool,
}

impl PdoCobId {
    const INVALID_BIT: u32 = 1 << 31;
    const NO_RTR_BIT: u32 = 1 << 30;
    const EXTENDED_BIT: u32 = 1 << 29;

    /// Encode as the u32 object value
    pub fn to_object_value(&self) -> u32 {
        let mut value = self.id.raw();
        if !self.valid {
            value |= Self::INVALID_BIT;
        }
        if !self.rtr_allowed {
            value |= Self::NO_RTR_BIT;
        }
        if self.id.is_extended() {
            value |= Self::EXTENDED_BIT;
        }
        value
    }

    /// Decode from the u32 object value
    pub fn from_object_value(value: u32) -> Self {
        let id = if value & Self::EXTENDED_BIT != 0 {
            CanId::extended(value)
        } else {
            CanId::std((value & 0x7FF) as u16)
        };
        Self {
            id,
            valid: value & Self::INVALID_BIT == 0,
            rtr_allowed: value & Self::NO_RTR_BIT == 0,
        }
    }
}

/// Default COB-ID of TPDO `n` (1-4) for a node in the predefined connection set
pub fn default_tpdo_cob_id(n: usize, node_id: u8) -> Option<CanId> {
    match n {
        1..=4 => Some(CanId::std(0x180 + 0x100 * (n as u16 - 1) + node_id as u16)),
        _ => None,
    }
}

/// Default COB-ID of RPDO `n` (1-4) for a node in the predefined connection set
pub fn default_rpdo_cob_id(n: usize, node_id: u8) -> Option<CanId> {
    match n {
        1..=4 => Some(CanId::std(0x200 + 0x100 * (n as u16 - 1) + node_id as u16)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const fn m(index: u16, sub: u8, size: u8) -> PdoMapping {
        PdoMapping { index, sub, size }
    }

    #[test]
    fn mapping_word() {
        let mapping = m(0x6041, 0, 16);
        assert_eq!(0x6041_0010, mapping.to_object_value());
        assert_eq!(mapping, PdoMapping::from_object_value(0x6041_0010));
    }

    #[test]
    fn bit_packing_follows_mapping_order() {
        let mappings = [m(0x2000, 1, 4), m(0x2000, 2, 12), m(0x2001, 0, 8)];
        let (data, len) = pack(&mappings, &[0xA, 0x123, 0xFF]).unwrap();
        assert_eq!(3, len);
        assert_eq!([0x3A, 0x12, 0xFF], data[..3]);
        let values = unpack(&mappings, &data[..len]).unwrap();
        assert_eq!(&[0xA, 0x123, 0xFF], values.as_slice());
    }

    #[test]
    fn oversized_mapping_rejected() {
        let mappings = [m(0x2000, 1, 64), m(0x2000, 2, 8)];
        assert!(pack(&mappings, &[0, 0]).is_none());
        assert!(unpack(&[m(0x2000, 1, 32)], &[0, 0]).is_none());
    }

    #[test]
    fn zero_size_mapping_after_full_payload() {
        let mappings = [m(0x2000, 1, 64), m(0x2000, 2, 0)];
        let (data, len) = pack(&mappings, &[u64::MAX, 1]).unwrap();
        assert_eq!(8, len);
        assert_eq!([0xFF; 8], data);
        assert_eq!(&[u64::MAX, 0], unpack(&mappings, &data).unwrap().as_slice());
    }

    #[test]
    fn transmission_types() {
        assert_eq!(Ok(TransmissionType::SyncCyclic(240)), 240.try_into());
        assert_eq!(Err(ReservedTransmissionType(241)), TransmissionType::try_from(241));
        assert_eq!(Err(ReservedTransmissionType(251)), TransmissionType::try_from(251));
        assert!(TransmissionType::RtrEvent.is_rtr_only());
        assert_eq!(255u8, TransmissionType::EventProfile.into());
    }

    #[test]
    fn cob_id_word() {
        let cob = PdoCobId::from_object_value(0x8000_0185);
        assert!(!cob.valid);
        assert!(cob.rtr_allowed);
        assert_eq!(CanId::Std(0x185), cob.id);
        assert_eq!(0x8000_0185, cob.to_object_value());
        assert_eq!(Some(CanId::Std(0x385)), default_tpdo_cob_id(3, 5));
        assert_eq!(Some(CanId::Std(0x505)), default_rpdo_cob_id(4, 5));
        assert_eq!(None, default_rpdo_cob_id(5, 5));
    }
}
