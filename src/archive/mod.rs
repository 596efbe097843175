//! Archive Codec
//!
//! One binary code path for three purposes:
//!
//! ```text
//! ┌──────────────┬───────────────────────────────┬──────────────┐
//! │ Purpose      │ Used for                      │ Field gating │
//! ├──────────────┼───────────────────────────────┼──────────────┤
//! │ Replication  │ live state sent to a session  │ channel mask │
//! │ Persistent   │ durable snapshot for storage  │ none         │
//! │ Migration    │ live hand-off between games   │ none         │
//! └──────────────┴───────────────────────────────┴──────────────┘
//! ```
//!
//! Types implement [`Transfer`] once. The same `transfer` body writes when
//! the archive is packing and reads when it is unpacking, so encoder and
//! decoder cannot branch differently on a gated field.
//!
//! Stream layout: `[purpose: u8][policy: varint][fields...]`.
//! The codec does no I/O; it fills or drains an in-memory buffer.

pub mod varint;
pub mod policy;

pub use policy::AoiChannels;

use crate::core::ids::{EntityId, PrototypeId, RegionId, CellId, SessionId, AccountId};
use crate::core::vec3::{Vector3, Orientation};
use varint::{write_varint, read_varint, zigzag_encode, zigzag_decode, float_to_fixed, fixed_to_float};

/// Upper bound for a transferred string, in bytes.
pub const MAX_STRING_LEN: usize = 4096;

/// Upper bound for a transferred collection, in elements.
pub const MAX_COLLECTION_LEN: usize = 65_536;

/// Fractional bits used for positions.
pub const POSITION_PRECISION: u32 = 3;

/// Fractional bits used for orientation angles.
pub const ORIENTATION_PRECISION: u32 = 6;

/// Codec failures.
///
/// None of these are recoverable: once a stream is inconsistent every
/// later field would be read from the wrong offset.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArchiveError {
    /// Ran out of bytes.
    #[error("Unexpected end of archive at offset {offset}")]
    UnexpectedEof {
        /// Read position when the stream ended.
        offset: usize,
    },

    /// Varint longer than a u64.
    #[error("Varint overflow at offset {offset}")]
    VarintOverflow {
        /// Offset of the offending byte.
        offset: usize,
    },

    /// Value does not fit the target integer type.
    #[error("Value {value} out of range for {target}")]
    ValueOutOfRange {
        /// Decoded value.
        value: u64,
        /// Target type name.
        target: &'static str,
    },

    /// Bool byte other than 0 or 1.
    #[error("Invalid bool byte {0:#04x}")]
    InvalidBool(u8),

    /// Length prefix beyond the sanity bound or the remaining bytes.
    #[error("Length {len} exceeds limit {limit}")]
    LengthOutOfBounds {
        /// Decoded length.
        len: u64,
        /// Allowed maximum.
        limit: usize,
    },

    /// String bytes are not UTF-8.
    #[error("Invalid UTF-8 string")]
    InvalidUtf8,

    /// Header purpose byte is unknown.
    #[error("Unknown archive purpose {0}")]
    UnknownPurpose(u8),

    /// Header does not match what the reader expected.
    #[error("Archive header mismatch: expected {expected:?}/{expected_policy:?}, found {found:?}/{found_policy:?}")]
    HeaderMismatch {
        /// Expected purpose.
        expected: ArchivePurpose,
        /// Expected policy.
        expected_policy: AoiChannels,
        /// Purpose in the stream.
        found: ArchivePurpose,
        /// Policy in the stream.
        found_policy: AoiChannels,
    },

    /// Flags carry bits the reader does not understand.
    #[error("Unexpected flag bits {bits:#x} in {context}")]
    UnexpectedFlags {
        /// Offending bits.
        bits: u32,
        /// Which flag field.
        context: &'static str,
    },

    /// Property id not present in the property table.
    #[error("Unknown property id {0}")]
    UnknownProperty(u32),

    /// Stream carries a field the archive policy should have excluded.
    #[error("Property {0} is not visible under the archive policy")]
    PolicyViolation(u32),

    /// Property value type tag is unknown or disagrees with the table.
    #[error("Bad value type {tag} for property {property}")]
    BadValueType {
        /// Property id.
        property: u32,
        /// Type tag read.
        tag: u8,
    },

    /// Entity to archive does not exist.
    #[error("Entity {0:#x} is not available for archiving")]
    UnknownEntity(u64),

    /// Decoding finished with unread bytes.
    #[error("{0} trailing bytes after archive")]
    TrailingBytes(usize),

    /// Operation needs the other direction.
    #[error("Archive is not {0}")]
    WrongDirection(&'static str),
}

/// Why an archive is being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ArchivePurpose {
    /// Live state for one session, gated by its channel policy.
    Replication = 1,
    /// Full durable snapshot.
    Persistent = 2,
    /// Full live hand-off to another game instance.
    Migration = 3,
}

impl ArchivePurpose {
    /// Decode from the header byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Replication),
            2 => Some(Self::Persistent),
            3 => Some(Self::Migration),
            _ => None,
        }
    }
}

#[derive(Debug)]
enum Mode {
    Packing(Vec<u8>),
    Unpacking { buffer: Vec<u8>, pos: usize },
}

/// Serialization context handed to every [`Transfer`] implementation.
#[derive(Debug)]
pub struct Archive {
    purpose: ArchivePurpose,
    policy: AoiChannels,
    mode: Mode,
}

impl Archive {
    /// Packing archive for a session holding `policy` channels.
    pub fn new_replication(policy: AoiChannels) -> Self {
        Self::new_packing(ArchivePurpose::Replication, policy)
    }

    /// Packing archive for storage.
    pub fn new_persistent() -> Self {
        Self::new_packing(ArchivePurpose::Persistent, AoiChannels::ALL)
    }

    /// Packing archive for hand-off to another instance.
    pub fn new_migration() -> Self {
        Self::new_packing(ArchivePurpose::Migration, AoiChannels::ALL)
    }

    fn new_packing(purpose: ArchivePurpose, policy: AoiChannels) -> Self {
        let mut buffer = Vec::with_capacity(64);
        buffer.push(purpose as u8);
        write_varint(&mut buffer, policy.bits() as u64);
        Self { purpose, policy, mode: Mode::Packing(buffer) }
    }

    /// Unpacking archive that takes purpose and policy from the stream header.
    pub fn unpack(buffer: Vec<u8>) -> Result<Self, ArchiveError> {
        let mut pos = 0;
        let purpose_byte = *buffer.first().ok_or(ArchiveError::UnexpectedEof { offset: 0 })?;
        pos += 1;
        let purpose = ArchivePurpose::from_u8(purpose_byte)
            .ok_or(ArchiveError::UnknownPurpose(purpose_byte))?;
        let bits = read_varint(&buffer, &mut pos)?;
        let bits = u32::try_from(bits)
            .map_err(|_| ArchiveError::ValueOutOfRange { value: bits, target: "policy" })?;
        if bits & !AoiChannels::ALL.bits() != 0 {
            return Err(ArchiveError::UnexpectedFlags { bits, context: "policy" });
        }
        Ok(Self {
            purpose,
            policy: AoiChannels(bits),
            mode: Mode::Unpacking { buffer, pos },
        })
    }

    /// Unpacking archive that must match an expected purpose and policy.
    pub fn unpack_expecting(
        purpose: ArchivePurpose,
        policy: AoiChannels,
        buffer: Vec<u8>,
    ) -> Result<Self, ArchiveError> {
        let archive = Self::unpack(buffer)?;
        if archive.purpose != purpose || archive.policy != policy {
            return Err(ArchiveError::HeaderMismatch {
                expected: purpose,
                expected_policy: policy,
                found: archive.purpose,
                found_policy: archive.policy,
            });
        }
        Ok(archive)
    }

    /// Archive purpose.
    pub fn purpose(&self) -> ArchivePurpose {
        self.purpose
    }

    /// Active channel policy.
    pub fn policy(&self) -> AoiChannels {
        self.policy
    }

    /// Writing values.
    pub fn is_packing(&self) -> bool {
        matches!(self.mode, Mode::Packing(_))
    }

    /// Reading values.
    pub fn is_unpacking(&self) -> bool {
        !self.is_packing()
    }

    /// Replication purpose.
    pub fn is_replication(&self) -> bool {
        self.purpose == ArchivePurpose::Replication
    }

    /// Persistent purpose.
    pub fn is_persistent(&self) -> bool {
        self.purpose == ArchivePurpose::Persistent
    }

    /// Migration purpose.
    pub fn is_migration(&self) -> bool {
        self.purpose == ArchivePurpose::Migration
    }

    /// Live state (replication or migration), as opposed to storage.
    pub fn is_transient(&self) -> bool {
        !self.is_persistent()
    }

    /// Replication archive whose policy intersects `channels`.
    pub fn has_replication_policy(&self, channels: AoiChannels) -> bool {
        self.is_replication() && self.policy.intersects(channels)
    }

    /// Whether a field declared with `field_policy` crosses this archive.
    ///
    /// Always true outside replication.
    pub fn allows(&self, field_policy: AoiChannels) -> bool {
        !self.is_replication() || self.policy.intersects(field_policy)
    }

    /// Bytes left to read (0 when packing).
    pub fn remaining(&self) -> usize {
        match &self.mode {
            Mode::Packing(_) => 0,
            Mode::Unpacking { buffer, pos } => buffer.len().saturating_sub(*pos),
        }
    }

    /// Finish packing and take the bytes.
    pub fn into_bytes(self) -> Result<Vec<u8>, ArchiveError> {
        match self.mode {
            Mode::Packing(buffer) => Ok(buffer),
            Mode::Unpacking { .. } => Err(ArchiveError::WrongDirection("packing")),
        }
    }

    /// Finish unpacking; every byte must have been consumed.
    pub fn finish(self) -> Result<(), ArchiveError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(ArchiveError::TrailingBytes(n)),
        }
    }

    // =========================================================================
    // TRANSFER PRIMITIVES
    // =========================================================================

    /// Transfer any [`Transfer`] value.
    #[inline]
    pub fn transfer<T: Transfer + ?Sized>(&mut self, value: &mut T) -> Result<(), ArchiveError> {
        value.transfer(self)
    }

    /// Transfer a value only if `field_policy` is allowed.
    ///
    /// Returns whether the value crossed the archive.
    pub fn transfer_gated<T: Transfer>(
        &mut self,
        field_policy: AoiChannels,
        value: &mut T,
    ) -> Result<bool, ArchiveError> {
        if !self.allows(field_policy) {
            return Ok(false);
        }
        value.transfer(self)?;
        Ok(true)
    }

    /// Unsigned varint.
    pub fn transfer_varint(&mut self, value: &mut u64) -> Result<(), ArchiveError> {
        match &mut self.mode {
            Mode::Packing(buffer) => {
                write_varint(buffer, *value);
                Ok(())
            }
            Mode::Unpacking { buffer, pos } => {
                *value = read_varint(buffer, pos)?;
                Ok(())
            }
        }
    }

    /// Signed zigzag varint.
    pub fn transfer_zigzag(&mut self, value: &mut i64) -> Result<(), ArchiveError> {
        let mut raw = zigzag_encode(*value);
        self.transfer_varint(&mut raw)?;
        *value = zigzag_decode(raw);
        Ok(())
    }

    /// Float quantized to `precision` fractional bits.
    pub fn transfer_float(&mut self, value: &mut f32, precision: u32) -> Result<(), ArchiveError> {
        let mut fixed = float_to_fixed(*value, precision);
        self.transfer_zigzag(&mut fixed)?;
        if self.is_unpacking() {
            *value = fixed_to_float(fixed, precision);
        }
        Ok(())
    }

    /// Packed flag word (bit position = flag index).
    pub fn transfer_flags(&mut self, flags: &mut u32, known: u32, context: &'static str) -> Result<(), ArchiveError> {
        self.transfer(flags)?;
        if *flags & !known != 0 {
            return Err(ArchiveError::UnexpectedFlags { bits: *flags & !known, context });
        }
        Ok(())
    }

    /// Position-precision vector.
    pub fn transfer_vector3(&mut self, value: &mut Vector3, precision: u32) -> Result<(), ArchiveError> {
        self.transfer_float(&mut value.x, precision)?;
        self.transfer_float(&mut value.y, precision)?;
        self.transfer_float(&mut value.z, precision)
    }

    /// Orientation, either all three angles or yaw alone.
    ///
    /// When `full` is false pitch and roll are not sent and read back as zero.
    pub fn transfer_orientation(&mut self, value: &mut Orientation, full: bool) -> Result<(), ArchiveError> {
        self.transfer_float(&mut value.yaw, ORIENTATION_PRECISION)?;
        if full {
            self.transfer_float(&mut value.pitch, ORIENTATION_PRECISION)?;
            self.transfer_float(&mut value.roll, ORIENTATION_PRECISION)?;
        } else if self.is_unpacking() {
            value.pitch = 0.0;
            value.roll = 0.0;
        }
        Ok(())
    }

    /// Optional value preceded by a presence bool.
    pub fn transfer_optional<T: Transfer + Default>(&mut self, value: &mut Option<T>) -> Result<(), ArchiveError> {
        let mut present = value.is_some();
        self.transfer(&mut present)?;
        if self.is_packing() {
            if let Some(v) = value.as_mut() {
                v.transfer(self)?;
            }
        } else if present {
            let mut v = T::default();
            v.transfer(self)?;
            *value = Some(v);
        } else {
            *value = None;
        }
        Ok(())
    }

    /// Length prefix, bounds-checked against `limit` and remaining bytes.
    pub fn transfer_len(&mut self, len: &mut usize, limit: usize) -> Result<(), ArchiveError> {
        let mut raw = *len as u64;
        self.transfer_varint(&mut raw)?;
        if self.is_unpacking() {
            let bound = limit.min(self.remaining());
            if raw > bound as u64 {
                return Err(ArchiveError::LengthOutOfBounds { len: raw, limit: bound });
            }
            *len = raw as usize;
        }
        Ok(())
    }

    /// Raw byte blob with a length prefix.
    pub fn transfer_bytes(&mut self, value: &mut Vec<u8>) -> Result<(), ArchiveError> {
        let mut len = value.len();
        self.transfer_len(&mut len, usize::MAX)?;
        match &mut self.mode {
            Mode::Packing(buffer) => {
                buffer.extend_from_slice(value);
                Ok(())
            }
            Mode::Unpacking { buffer, pos } => {
                let end = *pos + len;
                *value = buffer[*pos..end].to_vec();
                *pos = end;
                Ok(())
            }
        }
    }

    fn transfer_u8(&mut self, value: &mut u8) -> Result<(), ArchiveError> {
        match &mut self.mode {
            Mode::Packing(buffer) => {
                buffer.push(*value);
                Ok(())
            }
            Mode::Unpacking { buffer, pos } => {
                *value = *buffer.get(*pos).ok_or(ArchiveError::UnexpectedEof { offset: *pos })?;
                *pos += 1;
                Ok(())
            }
        }
    }
}

/// A value that can cross an [`Archive`] in either direction.
pub trait Transfer {
    /// Write `self` when packing, overwrite `self` when unpacking.
    fn transfer(&mut self, archive: &mut Archive) -> Result<(), ArchiveError>;
}

impl Transfer for bool {
    fn transfer(&mut self, archive: &mut Archive) -> Result<(), ArchiveError> {
        let mut byte = *self as u8;
        archive.transfer_u8(&mut byte)?;
        match byte {
            0 => *self = false,
            1 => *self = true,
            other => return Err(ArchiveError::InvalidBool(other)),
        }
        Ok(())
    }
}

impl Transfer for u8 {
    fn transfer(&mut self, archive: &mut Archive) -> Result<(), ArchiveError> {
        archive.transfer_u8(self)
    }
}

impl Transfer for u32 {
    fn transfer(&mut self, archive: &mut Archive) -> Result<(), ArchiveError> {
        let mut raw = *self as u64;
        archive.transfer_varint(&mut raw)?;
        *self = u32::try_from(raw).map_err(|_| ArchiveError::ValueOutOfRange { value: raw, target: "u32" })?;
        Ok(())
    }
}

impl Transfer for u64 {
    fn transfer(&mut self, archive: &mut Archive) -> Result<(), ArchiveError> {
        archive.transfer_varint(self)
    }
}

impl Transfer for i32 {
    fn transfer(&mut self, archive: &mut Archive) -> Result<(), ArchiveError> {
        let mut raw = *self as i64;
        archive.transfer_zigzag(&mut raw)?;
        *self = i32::try_from(raw)
            .map_err(|_| ArchiveError::ValueOutOfRange { value: raw as u64, target: "i32" })?;
        Ok(())
    }
}

impl Transfer for i64 {
    fn transfer(&mut self, archive: &mut Archive) -> Result<(), ArchiveError> {
        archive.transfer_zigzag(self)
    }
}

impl Transfer for String {
    fn transfer(&mut self, archive: &mut Archive) -> Result<(), ArchiveError> {
        let mut bytes = std::mem::take(self).into_bytes();
        if archive.is_packing() && bytes.len() > MAX_STRING_LEN {
            return Err(ArchiveError::LengthOutOfBounds { len: bytes.len() as u64, limit: MAX_STRING_LEN });
        }
        let mut len = bytes.len();
        archive.transfer_len(&mut len, MAX_STRING_LEN)?;
        match &mut archive.mode {
            Mode::Packing(buffer) => {
                buffer.extend_from_slice(&bytes);
            }
            Mode::Unpacking { buffer, pos } => {
                let end = *pos + len;
                bytes = buffer[*pos..end].to_vec();
                *pos = end;
            }
        }
        *self = String::from_utf8(bytes).map_err(|_| ArchiveError::InvalidUtf8)?;
        Ok(())
    }
}

impl<T: Transfer + Default> Transfer for Vec<T> {
    fn transfer(&mut self, archive: &mut Archive) -> Result<(), ArchiveError> {
        let mut len = self.len();
        archive.transfer_len(&mut len, MAX_COLLECTION_LEN)?;
        if archive.is_unpacking() {
            self.clear();
            self.resize_with(len, T::default);
        }
        for item in self.iter_mut() {
            item.transfer(archive)?;
        }
        Ok(())
    }
}

impl Transfer for Vector3 {
    fn transfer(&mut self, archive: &mut Archive) -> Result<(), ArchiveError> {
        archive.transfer_vector3(self, POSITION_PRECISION)
    }
}

impl Transfer for AoiChannels {
    fn transfer(&mut self, archive: &mut Archive) -> Result<(), ArchiveError> {
        let mut bits = self.0;
        archive.transfer_flags(&mut bits, AoiChannels::ALL.bits(), "channels")?;
        *self = AoiChannels(bits);
        Ok(())
    }
}

macro_rules! impl_transfer_for_id {
    ($($id:ty),*) => {
        $(
            impl Transfer for $id {
                fn transfer(&mut self, archive: &mut Archive) -> Result<(), ArchiveError> {
                    archive.transfer(&mut self.0)
                }
            }
        )*
    };
}

impl_transfer_for_id!(EntityId, PrototypeId, RegionId, CellId, SessionId, AccountId);

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct Sample {
        id: EntityId,
        name: String,
        secret: u32,
        counts: Vec<u64>,
        position: Vector3,
    }

    impl Transfer for Sample {
        fn transfer(&mut self, archive: &mut Archive) -> Result<(), ArchiveError> {
            archive.transfer(&mut self.id)?;
            archive.transfer(&mut self.name)?;
            archive.transfer_gated(AoiChannels::OWNER, &mut self.secret)?;
            archive.transfer(&mut self.counts)?;
            archive.transfer(&mut self.position)
        }
    }

    fn sample() -> Sample {
        Sample {
            id: EntityId(42),
            name: "Rogue".to_string(),
            secret: 777,
            counts: vec![1, 300, 70_000],
            position: Vector3::new(10.5, -3.25, 0.125),
        }
    }

    fn encode(value: &mut Sample, mut archive: Archive) -> Vec<u8> {
        archive.transfer(value).unwrap();
        archive.into_bytes().unwrap()
    }

    #[test]
    fn test_header() {
        let bytes = Archive::new_replication(AoiChannels::PARTY).into_bytes().unwrap();
        assert_eq!(bytes, vec![ArchivePurpose::Replication as u8, 2]);

        let archive = Archive::unpack(bytes).unwrap();
        assert!(archive.is_replication());
        assert_eq!(archive.policy(), AoiChannels::PARTY);
    }

    #[test]
    fn test_gated_field_owner_only() {
        let bytes = encode(&mut sample(), Archive::new_replication(AoiChannels::PROXIMITY));
        let mut archive = Archive::unpack_expecting(ArchivePurpose::Replication, AoiChannels::PROXIMITY, bytes).unwrap();
        let mut decoded = Sample::default();
        archive.transfer(&mut decoded).unwrap();
        archive.finish().unwrap();
        assert_eq!(decoded.secret, 0);
        assert_eq!(decoded.name, "Rogue");

        let bytes = encode(&mut sample(), Archive::new_replication(AoiChannels::OWNER));
        let mut archive = Archive::unpack(bytes).unwrap();
        let mut decoded = Sample::default();
        archive.transfer(&mut decoded).unwrap();
        archive.finish().unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn test_persistent_is_ungated() {
        let bytes = encode(&mut sample(), Archive::new_persistent());
        let mut archive = Archive::unpack(bytes).unwrap();
        assert!(archive.is_persistent());
        let mut decoded = Sample::default();
        archive.transfer(&mut decoded).unwrap();
        assert_eq!(decoded.secret, 777);
    }

    #[test]
    fn test_header_mismatch_fails_fast() {
        let bytes = encode(&mut sample(), Archive::new_replication(AoiChannels::OWNER));
        let result = Archive::unpack_expecting(ArchivePurpose::Replication, AoiChannels::PROXIMITY, bytes);
        assert!(matches!(result, Err(ArchiveError::HeaderMismatch { .. })));
    }

    #[test]
    fn test_truncated_stream() {
        let mut bytes = encode(&mut sample(), Archive::new_migration());
        bytes.truncate(bytes.len() - 2);
        let mut archive = Archive::unpack(bytes).unwrap();
        let mut decoded = Sample::default();
        assert!(matches!(archive.transfer(&mut decoded), Err(ArchiveError::UnexpectedEof { .. })));
    }

    #[test]
    fn test_trailing_bytes_detected() {
        let mut bytes = encode(&mut sample(), Archive::new_migration());
        bytes.push(0);
        let mut archive = Archive::unpack(bytes).unwrap();
        let mut decoded = Sample::default();
        archive.transfer(&mut decoded).unwrap();
        assert_eq!(archive.finish(), Err(ArchiveError::TrailingBytes(1)));
    }

    #[test]
    fn test_invalid_bool() {
        let mut bytes = Archive::new_persistent().into_bytes().unwrap();
        bytes.push(7);
        let mut archive = Archive::unpack(bytes).unwrap();
        let mut flag = false;
        assert_eq!(archive.transfer(&mut flag), Err(ArchiveError::InvalidBool(7)));
    }

    #[test]
    fn test_string_length_bound() {
        let mut bytes = Archive::new_persistent().into_bytes().unwrap();
        varint::write_varint(&mut bytes, 1_000_000);
        bytes.extend_from_slice(b"abc");
        let mut archive = Archive::unpack(bytes).unwrap();
        let mut s = String::new();
        assert!(matches!(archive.transfer(&mut s), Err(ArchiveError::LengthOutOfBounds { .. })));
    }

    #[test]
    fn test_orientation_reduced() {
        let mut archive = Archive::new_replication(AoiChannels::PROXIMITY);
        let mut o = Orientation::new(1.5, 0.25, -0.5);
        archive.transfer_orientation(&mut o, false).unwrap();
        let reduced_len = archive.into_bytes().unwrap().len();

        let mut archive = Archive::new_replication(AoiChannels::PROXIMITY);
        archive.transfer_orientation(&mut o, true).unwrap();
        let bytes = archive.into_bytes().unwrap();
        assert!(bytes.len() > reduced_len);

        let mut archive = Archive::unpack(bytes).unwrap();
        let mut decoded = Orientation::ZERO;
        archive.transfer_orientation(&mut decoded, true).unwrap();
        assert_eq!(decoded, o);
    }

    #[test]
    fn test_optional() {
        let mut archive = Archive::new_migration();
        let mut some: Option<u32> = Some(9);
        let mut none: Option<u32> = None;
        archive.transfer_optional(&mut some).unwrap();
        archive.transfer_optional(&mut none).unwrap();
        let bytes = archive.into_bytes().unwrap();

        let mut archive = Archive::unpack(bytes).unwrap();
        let mut a: Option<u32> = None;
        let mut b: Option<u32> = Some(3);
        archive.transfer_optional(&mut a).unwrap();
        archive.transfer_optional(&mut b).unwrap();
        archive.finish().unwrap();
        assert_eq!(a, Some(9));
        assert_eq!(b, None);
    }

    #[test]
    fn test_unexpected_flags() {
        let mut bytes = Archive::new_persistent().into_bytes().unwrap();
        varint::write_varint(&mut bytes, 0x100);
        let mut archive = Archive::unpack(bytes).unwrap();
        let mut channels = AoiChannels::NONE;
        assert!(matches!(archive.transfer(&mut channels), Err(ArchiveError::UnexpectedFlags { .. })));
    }
}
