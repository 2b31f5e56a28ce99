// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Parser and writer for the Android Logical Partition (LP) metadata format
//! used by `super` images. The on-disk layout is a fixed geometry block,
//! followed by a header and four entity tables (partitions, extents, partition
//! groups, block devices), all integrity-protected with SHA-256 checksums and
//! stored in primary and backup copies.

use std::{
    fmt,
    io::{self, Read, Seek, SeekFrom, Write},
    mem,
    str::{self, FromStr},
};

use bitflags::bitflags;
use bstr::ByteSlice;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use zerocopy::{byteorder::little_endian, FromBytes, FromZeros, Immutable, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    crypto,
    stream::{FromReader, ReadFixedSizeExt, ToWriter},
    util::{self, is_zero, DebugString},
};

/// Magic value for [`RawGeometry::magic`].
pub const GEOMETRY_MAGIC: u32 = 0x616c4467;

/// Padded size for storing a [`RawGeometry`].
pub const GEOMETRY_SIZE: u32 = 4096;

/// Magic value for [`RawHeader::magic`].
pub const HEADER_MAGIC: u32 = 0x414C5030;

/// Supported major version.
pub const MAJOR_VERSION: u16 = 10;
/// Minimum supported minor version (inclusive).
pub const MINOR_VERSION_MIN: u16 = 0;
/// Maximum supported minor version (inclusive).
pub const MINOR_VERSION_MAX: u16 = 2;

/// Minor version required for using [`PartitionAttributes::UPDATED`].
const VERSION_FOR_UPDATED_ATTR: u16 = 1;
/// Metadata minor version needed for the 256-byte [`RawHeader`] instead of the
/// 128-byte header without [`RawHeader::flags`] and [`RawHeader::reserved`].
const VERSION_FOR_EXPANDED_HEADER: u16 = 2;

/// Size of a sector.
pub const SECTOR_SIZE: u32 = 512;

/// Padding at the beginning of a super image to avoid creating a boot sector.
pub const PARTITION_RESERVED_BYTES: u32 = 4096;

/// Offset of the primary geometry copy.
pub const GEOMETRY_PRIMARY_OFFSET: u64 = PARTITION_RESERVED_BYTES as u64;

/// Offset of the backup geometry copy.
pub const GEOMETRY_BACKUP_OFFSET: u64 = GEOMETRY_PRIMARY_OFFSET + GEOMETRY_SIZE as u64;

/// Offset of metadata slot 0. Both geometry copies precede the slots.
pub const METADATA_SLOT_BASE: u64 = GEOMETRY_PRIMARY_OFFSET + 2 * GEOMETRY_SIZE as u64;

/// Candidate absolute offsets for locating the geometry, in probe order. The
/// trailing zero offset supports a legacy layout where the geometry sits at
/// the very beginning of the image.
const GEOMETRY_CANDIDATE_OFFSETS: [u64; 3] = [GEOMETRY_PRIMARY_OFFSET, GEOMETRY_BACKUP_OFFSET, 0];

/// Maximum allowed size of [`RawGeometry::metadata_max_size`] to prevent the
/// memory usage from blowing up.
const METADATA_MAX_SIZE: u32 = 128 * 1024;

/// Slot suffix appended to per-slot partition names by consumers. Slot 0 maps
/// to `_a` and every other slot maps to `_b`.
pub fn slot_suffix(slot: u32) -> &'static str {
    if slot == 0 {
        "_a"
    } else {
        "_b"
    }
}

#[derive(Debug, Error)]
pub enum Error {
    // Naming errors.
    #[error("Invalid partition name: {0:?}")]
    NameInvalid(DebugString),
    // Geometry errors.
    #[error("Invalid geometry magic: {0:#010x}")]
    GeometryInvalidMagic(u32),
    #[error("Invalid geometry size: {0}")]
    GeometryInvalidSize(u32),
    #[error("Expected geometry digest {expected}, but have {actual}")]
    GeometryInvalidDigest { expected: String, actual: String },
    #[error("Maximum metadata size is not sector-aligned: {0}")]
    MaxMetadataSizeUnaligned(u32),
    #[error("Maximum metadata size exceeds limit: {0} > {METADATA_MAX_SIZE}")]
    MaxMetadataSizeTooLarge(u32),
    #[error("No metadata slots defined")]
    NoMetadataSlots,
    #[error("Logical block size is not sector-aligned: {0}")]
    LogicalBlockSizeUnaligned(u32),
    #[error("No valid geometry found at any known offset")]
    GeometryNotFound,
    #[error("Metadata slot out of range: {slot} >= {count}")]
    SlotOutOfRange { slot: u32, count: u32 },
    // Header errors.
    #[error("Invalid header magic: {0:#010x}")]
    HeaderInvalidMagic(u32),
    #[error("Unsupported header version: {major}.{minor}")]
    HeaderUnsupportedVersion { major: u16, minor: u16 },
    #[error("Invalid header size: {0} != {1}")]
    HeaderInvalidSize(u32, u32),
    #[error("Expected header digest {expected}, but have {actual}")]
    HeaderInvalidDigest { expected: String, actual: String },
    #[error("Expected tables digest {expected}, but have {actual}")]
    TablesInvalidDigest { expected: String, actual: String },
    #[error("Metadata too large: {metadata_size} > {max_size} - {header_size}")]
    MetadataTooLarge {
        metadata_size: u64,
        max_size: u32,
        header_size: u32,
    },
    #[error("Table descriptors overlap, are out of order, or exceed the tables size")]
    DescriptorsInvalid,
    #[error("Descriptor offset #{0}: Entry count too large")]
    DescriptorEntryCountTooLarge(u32),
    #[error("Descriptor offset #{0}: Next entry offset too large")]
    DescriptorNextOffsetTooLarge(u32),
    // Partition errors.
    #[error("Partition {name:?}: Duplicates another partition name")]
    PartitionNameDuplicate { name: DebugString },
    #[error("Partition {name:?}: Invalid attributes: {}", .attributes.0)]
    PartitionInvalidAttributes {
        name: DebugString,
        attributes: PartitionAttributes,
    },
    #[error("Partition {name:?}: Extent indices too large")]
    PartitionExtentIndicesTooLarge { name: DebugString },
    #[error("Partition {name:?}: Invalid partition group index: {index}")]
    PartitionInvalidGroupIndex { name: DebugString, index: u32 },
    #[error("Partition {name:?}: Sector count too large")]
    PartitionSectorCountTooLarge { name: DebugString },
    // Extent errors.
    #[error("Extent #{index}: Invalid block device index: {device_index}")]
    ExtentInvalidDeviceIndex { index: usize, device_index: u32 },
    #[error("Extent #{index}: End sector too large: {start} + {count}")]
    ExtentEndSectorTooLarge {
        index: usize,
        start: u64,
        count: u64,
    },
    #[error("Extent #{index}: {start} starts before block device's first sector {sector}")]
    ExtentStartBeforeDeviceStart {
        index: usize,
        start: u64,
        sector: u64,
    },
    #[error("Extent #{index}: {end} ends after block device's last usable sector {sector}")]
    ExtentEndsAfterDeviceEnd { index: usize, end: u64, sector: u64 },
    #[error("Extent #{index}: Type zero extents cannot have non-zero sector or device")]
    ExtentTypeZeroNotEmpty { index: usize },
    #[error("Extent #{index}: Invalid type: {extent_type}")]
    ExtentInvalidType { index: usize, extent_type: u32 },
    #[error("Extent #{index}: Block device index too large")]
    ExtentDeviceIndexTooLarge { index: usize },
    // Partition group errors.
    #[error("Group {name:?}: Total size of partitions too large")]
    GroupTotalSizeTooLarge { name: DebugString },
    #[error("Group {name:?}: Total partition size {size} exceeds limit {limit}")]
    GroupTotalSizeExceedsLimit {
        name: DebugString,
        size: u64,
        limit: u64,
    },
    #[error("Group {name:?}: Index too large")]
    GroupIndexTooLarge { name: DebugString },
    #[error("Group not found: {0:?}")]
    GroupNotFound(DebugString),
    #[error("Group already exists: {0:?}")]
    GroupExists(DebugString),
    #[error("Group {0:?}: Still contains partitions")]
    GroupInUse(DebugString),
    #[error("The default group cannot be removed")]
    GroupDefaultImmutable,
    // Block device errors.
    #[error("Device {name:?}: Alignment is not sector-aligned")]
    DeviceAlignmentNotSectorAligned { name: DebugString },
    #[error("Device {name:?}: First logical sector is not partition-aligned")]
    DeviceFirstSectorNotAligned { name: DebugString },
    #[error("Device {name:?}: Alignment offset is not sector-aligned")]
    DeviceOffsetNotSectorAligned { name: DebugString },
    #[error("Device {name:?}: Size is not sector-aligned")]
    DeviceSizeNotSectorAligned { name: DebugString },
    #[error("Device size {new_size} is below the last allocated byte {last_byte}")]
    DeviceShrinkBelowUsage { new_size: u64, last_byte: u64 },
    #[error("No block devices defined")]
    NoBlockDevices,
    // Partition/editor errors.
    #[error("Partition not found: {0:?}")]
    PartitionNotFound(DebugString),
    #[error("Partition already exists: {0:?}")]
    PartitionExists(DebugString),
    #[error("Partition {name:?}: No aligned free space for {needed_sectors} more sectors")]
    InsufficientFreeSpace {
        name: DebugString,
        needed_sectors: u64,
    },
    #[error("Compacted layout ends at sector {end_sector}, past the usable limit {limit}")]
    LayoutOverflowsDevice { end_sector: u64, limit: u64 },
    // Wrapped errors.
    #[error("Failed to read LP data: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("Failed to write LP data: {0}")]
    DataWrite(&'static str, #[source] io::Error),
}

/// Coarse classification of [`Error`] variants. The set of kinds is stable
/// even when the underlying variants gain more context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Magic mismatches, unsupported versions, malformed structures, short
    /// reads.
    InvalidData,
    /// A SHA-256 comparison failed.
    Checksum,
    /// A size limit was exceeded: metadata blob, group quota, device size, or
    /// free space during allocation.
    Capacity,
    /// A named entity does not exist.
    NotFound,
    /// A named entity already exists.
    AlreadyExists,
    /// A structural rule was violated by the requested mutation.
    Invariant,
    /// An underlying stream error.
    Io,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NameInvalid(_)
            | Self::GeometryInvalidMagic(_)
            | Self::GeometryInvalidSize(_)
            | Self::MaxMetadataSizeUnaligned(_)
            | Self::MaxMetadataSizeTooLarge(_)
            | Self::NoMetadataSlots
            | Self::LogicalBlockSizeUnaligned(_)
            | Self::GeometryNotFound
            | Self::SlotOutOfRange { .. }
            | Self::HeaderInvalidMagic(_)
            | Self::HeaderUnsupportedVersion { .. }
            | Self::HeaderInvalidSize(..)
            | Self::DescriptorsInvalid
            | Self::DescriptorEntryCountTooLarge(_)
            | Self::DescriptorNextOffsetTooLarge(_)
            | Self::PartitionNameDuplicate { .. }
            | Self::PartitionInvalidAttributes { .. }
            | Self::PartitionExtentIndicesTooLarge { .. }
            | Self::PartitionInvalidGroupIndex { .. }
            | Self::PartitionSectorCountTooLarge { .. }
            | Self::ExtentInvalidDeviceIndex { .. }
            | Self::ExtentEndSectorTooLarge { .. }
            | Self::ExtentStartBeforeDeviceStart { .. }
            | Self::ExtentEndsAfterDeviceEnd { .. }
            | Self::ExtentTypeZeroNotEmpty { .. }
            | Self::ExtentInvalidType { .. }
            | Self::ExtentDeviceIndexTooLarge { .. }
            | Self::GroupIndexTooLarge { .. }
            | Self::DeviceAlignmentNotSectorAligned { .. }
            | Self::DeviceFirstSectorNotAligned { .. }
            | Self::DeviceOffsetNotSectorAligned { .. }
            | Self::DeviceSizeNotSectorAligned { .. }
            | Self::NoBlockDevices => ErrorKind::InvalidData,
            Self::GeometryInvalidDigest { .. }
            | Self::HeaderInvalidDigest { .. }
            | Self::TablesInvalidDigest { .. } => ErrorKind::Checksum,
            Self::MetadataTooLarge { .. }
            | Self::GroupTotalSizeTooLarge { .. }
            | Self::GroupTotalSizeExceedsLimit { .. }
            | Self::DeviceShrinkBelowUsage { .. }
            | Self::InsufficientFreeSpace { .. }
            | Self::LayoutOverflowsDevice { .. } => ErrorKind::Capacity,
            Self::GroupNotFound(_) | Self::PartitionNotFound(_) => ErrorKind::NotFound,
            Self::GroupExists(_) | Self::PartitionExists(_) => ErrorKind::AlreadyExists,
            Self::GroupInUse(_) | Self::GroupDefaultImmutable => ErrorKind::Invariant,
            Self::DataRead(_, e) | Self::DataWrite(_, e) => {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    ErrorKind::InvalidData
                } else {
                    ErrorKind::Io
                }
            }
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

bitflags! {
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
    pub struct HeaderFlags: u32 {
        /// The device uses virtual A/B.
        const VIRTUAL_AB_DEVICE = 1 << 0;

        const _ = !0;
    }

    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
    pub struct PartitionAttributes: u32 {
        /// The device-mapper block device should be created as read-only.
        const READONLY = 1 << 0;
        /// The partition name needs a slot suffix appended.
        const SLOT_SUFFIXED = 1 << 1;
        /// The partition was created or modified for an OTA update using
        /// snapuserd.
        const UPDATED = 1 << 2;
        /// The partition should not be mapped in device-mapper.
        const DISABLED = 1 << 3;

        const _ = !0;
    }

    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
    pub struct PartitionGroupFlags: u32 {
        /// Whether the group name needs a slot suffix to be appended.
        const SLOT_SUFFIXED = 1 << 0;

        const _ = !0;
    }

    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
    pub struct BlockDeviceFlags: u32 {
        /// Whether the partition name needs a slot suffix to be appended.
        const SLOT_SUFFIXED = 1 << 0;

        const _ = !0;
    }
}

impl PartitionAttributes {
    /// Attributes introduced in metadata minor version 0.
    pub const MASK_V0: Self = Self::READONLY.union(Self::SLOT_SUFFIXED);
    /// Attributes introduced in metadata minor version 1.
    pub const MASK_V1: Self = Self::UPDATED.union(Self::DISABLED);
    /// All supported attributes.
    pub const MASK: Self = Self::MASK_V0.union(Self::MASK_V1);
}

/// A 36-byte name buffer holding at most 35 bytes of UTF-8 payload followed by
/// trailing zeros. The final byte is always NUL.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawName([u8; 36]);

impl fmt::Debug for RawName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (prefix, suffix) = self.split();
        let display = if util::is_zero(suffix) {
            prefix
        } else {
            &self.0
        };

        fmt::Debug::fmt(&display.as_bstr(), f)
    }
}

impl RawName {
    /// Maximum number of payload bytes.
    const CAPACITY: usize = 35;

    fn split(&self) -> (&[u8], &[u8]) {
        self.0
            .iter()
            .position(|b| *b == 0)
            .map_or((&self.0, &[]), |i| self.0.split_at(i))
    }

    fn validate(&self) -> Result<()> {
        let (prefix, suffix) = self.split();

        if str::from_utf8(prefix).is_ok() && is_zero(suffix) {
            Ok(())
        } else {
            Err(Error::NameInvalid(DebugString::new(self)))
        }
    }

    fn as_str(&self) -> Result<&str> {
        self.validate()?;

        Ok(str::from_utf8(self.split().0).unwrap())
    }
}

impl FromStr for RawName {
    type Err = Error;

    /// Encode a name, silently truncating at [`RawName::CAPACITY`] bytes on a
    /// UTF-8 character boundary. Callers that care about overlong names are
    /// expected to validate upstream.
    fn from_str(s: &str) -> Result<Self> {
        let mut to_copy = s.len().min(Self::CAPACITY);
        while !s.is_char_boundary(to_copy) {
            to_copy -= 1;
        }

        let mut name = Self([0u8; 36]);
        name.0[..to_copy].copy_from_slice(&s.as_bytes()[..to_copy]);

        Ok(name)
    }
}

/// Raw on-disk layout for the metadata geometry.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawGeometry {
    /// Magic value. This should be equal to [`GEOMETRY_MAGIC`].
    magic: little_endian::U32,
    /// Size of this [`RawGeometry`].
    struct_size: little_endian::U32,
    /// SHA-256 checksum of the first [`RawGeometry::struct_size`] bytes when
    /// this field is set to all zeros.
    checksum: [u8; 32],
    /// Maximum size of a single copy of the metadata (header + tables). This
    /// must be a multiple of [`SECTOR_SIZE`].
    metadata_max_size: little_endian::U32,
    /// Number of metadata slots, excluding the backup copies.
    metadata_slot_count: little_endian::U32,
    /// Block device block size for the logical partitions.
    logical_block_size: little_endian::U32,
}

const _: () = assert!(mem::size_of::<RawGeometry>() < GEOMETRY_SIZE as usize);

/// Byte range of [`RawGeometry::checksum`] within the struct.
const GEOMETRY_CHECKSUM_RANGE: std::ops::Range<usize> = 8..40;

impl fmt::Debug for RawGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawGeometry")
            .field("magic", &format_args!("{:#010x}", self.magic.get()))
            .field("struct_size", &self.struct_size.get())
            .field("checksum", &hex::encode(self.checksum))
            .field("metadata_max_size", &self.metadata_max_size.get())
            .field("metadata_slot_count", &self.metadata_slot_count.get())
            .field("logical_block_size", &self.logical_block_size.get())
            .finish()
    }
}

impl RawGeometry {
    /// Parse and validate a geometry from a padded 4096-byte block. The
    /// checksum covers the first [`RawGeometry::struct_size`] bytes of the
    /// block with the checksum field zeroed, which permits variant layouts
    /// whose recorded size exceeds the current struct definition.
    fn parse(block: &[u8; GEOMETRY_SIZE as usize]) -> Result<Self> {
        let geometry = Self::read_from_prefix(block).unwrap().0;

        if geometry.magic.get() != GEOMETRY_MAGIC {
            return Err(Error::GeometryInvalidMagic(geometry.magic.get()));
        }

        let struct_size = geometry.struct_size.get();
        if (struct_size as usize) < mem::size_of::<Self>() || struct_size > GEOMETRY_SIZE {
            return Err(Error::GeometryInvalidSize(struct_size));
        }

        let digest =
            crypto::sha256_with_hole(&block[..struct_size as usize], GEOMETRY_CHECKSUM_RANGE);
        if digest != geometry.checksum {
            return Err(Error::GeometryInvalidDigest {
                expected: hex::encode(geometry.checksum),
                actual: hex::encode(digest),
            });
        }

        geometry.validate()?;

        Ok(geometry)
    }

    /// Ensure that all fields are semantically valid and can be used without
    /// further checks. The checksum is not covered; [`RawGeometry::parse`]
    /// verifies it against the original block.
    fn validate(&self) -> Result<()> {
        if self.metadata_max_size.get() == 0 || self.metadata_max_size.get() % SECTOR_SIZE != 0 {
            return Err(Error::MaxMetadataSizeUnaligned(
                self.metadata_max_size.get(),
            ));
        } else if self.metadata_max_size.get() > METADATA_MAX_SIZE {
            return Err(Error::MaxMetadataSizeTooLarge(self.metadata_max_size.get()));
        } else if self.metadata_slot_count.get() == 0 {
            return Err(Error::NoMetadataSlots);
        }

        if self.logical_block_size.get() % SECTOR_SIZE != 0 {
            return Err(Error::LogicalBlockSizeUnaligned(
                self.logical_block_size.get(),
            ));
        }

        Ok(())
    }

    /// Serialize to a padded 4096-byte block with a freshly computed checksum.
    fn to_block(mut self) -> [u8; GEOMETRY_SIZE as usize] {
        self.checksum.fill(0);

        let mut block = [0u8; GEOMETRY_SIZE as usize];
        block[..mem::size_of::<Self>()].copy_from_slice(self.as_bytes());

        let digest = crypto::sha256(&block[..self.struct_size.get() as usize]);
        block[GEOMETRY_CHECKSUM_RANGE].copy_from_slice(&digest);

        block
    }

    /// Size of the reservation for the backup metadata slots at the end of
    /// the block device.
    fn backup_reserved_bytes(&self) -> u64 {
        u64::from(self.metadata_max_size.get()) * u64::from(self.metadata_slot_count.get())
    }

    /// Absolute stream offset of the primary copy of a metadata slot.
    fn primary_slot_offset(&self, slot: u32) -> u64 {
        METADATA_SLOT_BASE + u64::from(slot) * u64::from(self.metadata_max_size.get())
    }

    /// Absolute stream offset of the backup copy of a metadata slot, given the
    /// total size of the image.
    fn backup_slot_offset(&self, image_size: u64, slot: u32) -> u64 {
        image_size - self.backup_reserved_bytes()
            + u64::from(slot) * u64::from(self.metadata_max_size.get())
    }
}

/// Raw on-disk layout for a table descriptor within a [`RawHeader`].
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawTableDescriptor {
    /// Offset relative to the end of the [`RawHeader`].
    offset: little_endian::U32,
    /// Number of entries in the table.
    num_entries: little_endian::U32,
    /// Size of each entry.
    entry_size: little_endian::U32,
}

impl fmt::Debug for RawTableDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawTableDescriptor")
            .field("offset", &self.offset.get())
            .field("num_entries", &self.num_entries.get())
            .field("entry_size", &self.entry_size.get())
            .finish()
    }
}

impl RawTableDescriptor {
    /// Decode the table items from the tables buffer. Exactly
    /// [`RawTableDescriptor::entry_size`] bytes are consumed per record and
    /// the known prefix is decoded, so entries larger or smaller than the
    /// current record definition are tolerated for compatibility with other
    /// metadata versions. The descriptor must have already passed
    /// [`RawHeader::validate`].
    fn decode_from_buf<T: FromBytes + IntoBytes + Immutable>(&self, buf: &[u8]) -> Vec<T> {
        let offset = self.offset.get() as usize;
        let entry_size = self.entry_size.get() as usize;
        let num_entries = self.num_entries.get() as usize;

        let mut items = Vec::with_capacity(num_entries);

        for i in 0..num_entries {
            let entry = &buf[offset + i * entry_size..][..entry_size];
            let known = entry.len().min(mem::size_of::<T>());

            let mut item = T::new_zeroed();
            item.as_mut_bytes()[..known].copy_from_slice(&entry[..known]);

            items.push(item);
        }

        items
    }

    /// Update all fields to match the slice of items beginning at the
    /// specified table offset. Returns the starting offset for the next table.
    fn update<T: IntoBytes + Immutable>(&mut self, items: &[T], offset: u32) -> Result<u32> {
        let entry_size = mem::size_of::<T>() as u32;
        let num_entries: u32 = items
            .len()
            .try_into()
            .map_err(|_| Error::DescriptorEntryCountTooLarge(offset))?;
        let next_offset = entry_size
            .checked_mul(num_entries)
            .and_then(|o| o.checked_add(offset))
            .ok_or(Error::DescriptorNextOffsetTooLarge(offset))?;

        self.offset = offset.into();
        self.entry_size = entry_size.into();
        self.num_entries = num_entries.into();

        Ok(next_offset)
    }

    /// Validate bounds against the tables buffer and return the end offset.
    fn validate(&self, tables_size: u32) -> Option<u32> {
        if self.num_entries.get() != 0 && self.entry_size.get() == 0 {
            return None;
        }

        let size = self
            .num_entries
            .get()
            .checked_mul(self.entry_size.get())?;
        let end = self.offset.get().checked_add(size)?;

        if end > tables_size {
            return None;
        }

        Some(end)
    }
}

/// Raw on-disk layout for the metadata header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    /// Magic value. This should be equal to [`HEADER_MAGIC`].
    magic: little_endian::U32,
    /// Major version. [`MAJOR_VERSION`] is the only version supported.
    major_version: little_endian::U16,
    /// Minor version. Versions between [`MINOR_VERSION_MIN`] and
    /// [`MINOR_VERSION_MAX`] are supported.
    minor_version: little_endian::U16,
    /// Size of this [`RawHeader`].
    header_size: little_endian::U32,
    /// SHA-256 checksum of the first [`RawHeader::header_size`] bytes when
    /// this field is set to all zeros.
    header_checksum: [u8; 32],
    /// Size of all tables.
    tables_size: little_endian::U32,
    /// SHA-256 checksum of all tables.
    tables_checksum: [u8; 32],
    /// Partition table descriptor.
    partitions: RawTableDescriptor,
    /// Extent table descriptor.
    extents: RawTableDescriptor,
    /// Updatable group descriptor.
    groups: RawTableDescriptor,
    /// Block device table descriptor.
    block_devices: RawTableDescriptor,
    /// [Minor version >=2 only] Header flags. These are informational and do
    /// not affect parsing.
    flags: little_endian::U32,
    /// [Minor version >=2 only] Reserved bytes for future header versions.
    reserved: [u8; 124],
}

/// Byte range of [`RawHeader::header_checksum`] within the struct.
const HEADER_CHECKSUM_RANGE: std::ops::Range<usize> = 12..44;

impl fmt::Debug for RawHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawHeader")
            .field("magic", &format_args!("{:#010x}", self.magic.get()))
            .field("major_version", &self.major_version.get())
            .field("minor_version", &self.minor_version.get())
            .field("header_size", &self.header_size.get())
            .field("header_checksum", &hex::encode(self.header_checksum))
            .field("tables_size", &self.tables_size.get())
            .field("tables_checksum", &hex::encode(self.tables_checksum))
            .field("partitions", &self.partitions)
            .field("extents", &self.extents)
            .field("groups", &self.groups)
            .field("block_devices", &self.block_devices)
            .field("flags", &HeaderFlags::from_bits_retain(self.flags.get()).0)
            .field("reserved", &hex::encode(self.reserved))
            .finish()
    }
}

impl RawHeader {
    const SIZE_V1_0: usize = mem::offset_of!(Self, flags);

    fn size_for_version(major_version: u16, minor_version: u16) -> usize {
        if major_version == MAJOR_VERSION && minor_version >= VERSION_FOR_EXPANDED_HEADER {
            mem::size_of::<Self>()
        } else {
            Self::SIZE_V1_0
        }
    }

    fn size(&self) -> usize {
        Self::size_for_version(self.major_version.get(), self.minor_version.get())
    }

    /// Validate the magic, version, and recorded size. This must pass before
    /// any other header field is trusted.
    fn validate_prefix(&self) -> Result<()> {
        if self.magic.get() != HEADER_MAGIC {
            return Err(Error::HeaderInvalidMagic(self.magic.get()));
        }

        if self.major_version.get() != MAJOR_VERSION || self.minor_version.get() > MINOR_VERSION_MAX
        {
            return Err(Error::HeaderUnsupportedVersion {
                major: self.major_version.get(),
                minor: self.minor_version.get(),
            });
        }

        if self.header_size.get() != self.size() as u32 {
            return Err(Error::HeaderInvalidSize(
                self.header_size.get(),
                self.size() as u32,
            ));
        }

        Ok(())
    }

    /// Ensure that all fields are semantically valid and can be used without
    /// further checks. [`RawGeometry::parse`] must have passed before this
    /// function is called.
    fn validate(&self, geometry: &RawGeometry) -> Result<()> {
        self.validate_prefix()?;

        let expected_size = self.size();

        let digest = crypto::sha256_with_hole(
            &self.as_bytes()[..expected_size],
            HEADER_CHECKSUM_RANGE,
        );
        if digest != self.header_checksum {
            return Err(Error::HeaderInvalidDigest {
                expected: hex::encode(self.header_checksum),
                actual: hex::encode(digest),
            });
        }

        // metadata_max_size is guaranteed to be at least one sector, so the
        // subtraction cannot overflow.
        if self.tables_size.get() > geometry.metadata_max_size.get() - self.header_size.get() {
            return Err(Error::MetadataTooLarge {
                metadata_size: self.tables_size.get().into(),
                max_size: geometry.metadata_max_size.get(),
                header_size: self.header_size.get(),
            });
        }

        // The partitions table must come first and the tables must be in
        // ascending order without overlapping. Gaps are tolerated for
        // compatibility with other writers.
        if self.partitions.offset.get() != 0 {
            return Err(Error::DescriptorsInvalid);
        }

        let mut prev_end = 0;

        for descriptor in [
            &self.partitions,
            &self.extents,
            &self.groups,
            &self.block_devices,
        ] {
            if descriptor.offset.get() < prev_end {
                return Err(Error::DescriptorsInvalid);
            }

            prev_end = descriptor
                .validate(self.tables_size.get())
                .ok_or(Error::DescriptorsInvalid)?;
        }

        Ok(())
    }
}

/// Raw on-disk layout for an entry in the logical partitions table.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawPartition {
    /// Partition name. This must be unique across all partitions.
    name: RawName,
    /// Partition attributes.
    attributes: little_endian::U32,
    /// Index of the first extent owned by this partition.
    first_extent_index: little_endian::U32,
    /// Number of extents covered by this partition.
    num_extents: little_endian::U32,
    /// Index of the group containing this partition.
    group_index: little_endian::U32,
}

impl fmt::Debug for RawPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let attributes = PartitionAttributes::from_bits_retain(self.attributes.get());

        f.debug_struct("RawPartition")
            .field("name", &self.name)
            .field("attributes", &attributes.0)
            .field("first_extent_index", &self.first_extent_index.get())
            .field("num_extents", &self.num_extents.get())
            .field("group_index", &self.group_index.get())
            .finish()
    }
}

impl RawPartition {
    /// Ensure that all fields are semantically valid and can be used without
    /// further checks. [`RawHeader::validate`] must have passed before this
    /// function is called.
    fn validate(
        &self,
        header: &RawHeader,
        extents: &[RawExtent],
        groups: &[RawPartitionGroup],
    ) -> Result<()> {
        self.name.validate()?;

        let mut valid_attributes = PartitionAttributes::MASK_V0;
        if header.minor_version.get() >= VERSION_FOR_UPDATED_ATTR {
            valid_attributes |= PartitionAttributes::MASK_V1;
        }

        let attributes = PartitionAttributes::from_bits_retain(self.attributes.get());

        if !(attributes - valid_attributes).is_empty() {
            return Err(Error::PartitionInvalidAttributes {
                name: DebugString::new(self.name),
                attributes,
            });
        }

        if self
            .first_extent_index
            .get()
            .checked_add(self.num_extents.get())
            .map_or(true, |n| n as usize > extents.len())
        {
            return Err(Error::PartitionExtentIndicesTooLarge {
                name: DebugString::new(self.name),
            });
        }

        if self.group_index.get() as usize >= groups.len() {
            return Err(Error::PartitionInvalidGroupIndex {
                name: DebugString::new(self.name),
                index: self.group_index.get(),
            });
        }

        Ok(())
    }
}

/// Raw on-disk layout for an entry in the extent table.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawExtent {
    /// Number of [`SECTOR_SIZE`]-byte sectors in this extent.
    num_sectors: little_endian::U64,
    /// device-mapper target type.
    target_type: little_endian::U32,
    /// For [`RawExtent::TARGET_TYPE_LINEAR`], this is the physical partition
    /// sector that this extent maps to. For [`RawExtent::TARGET_TYPE_ZERO`],
    /// this is always 0.
    target_data: little_endian::U64,
    /// For [`RawExtent::TARGET_TYPE_LINEAR`], this is the index into the block
    /// devices table specifying the physical source of this extent. For
    /// [`RawExtent::TARGET_TYPE_ZERO`], this is always 0.
    target_source: little_endian::U32,
}

impl fmt::Debug for RawExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawExtent")
            .field("num_sectors", &self.num_sectors.get())
            .field("target_type", &self.target_type.get())
            .field("target_data", &self.target_data.get())
            .field("target_source", &self.target_source.get())
            .finish()
    }
}

impl RawExtent {
    /// dm-linear target.
    const TARGET_TYPE_LINEAR: u32 = 0;
    /// dm-zero target.
    const TARGET_TYPE_ZERO: u32 = 1;

    /// Ensure that all fields are semantically valid and can be used without
    /// further checks. Linear extents on device 0 must not reach into the
    /// backup metadata reservation at the end of the device.
    fn validate(
        &self,
        index: usize,
        block_devices: &[RawBlockDevice],
        geometry: &RawGeometry,
    ) -> Result<()> {
        match self.target_type.get() {
            Self::TARGET_TYPE_LINEAR => {
                let Some(device) = block_devices.get(self.target_source.get() as usize) else {
                    return Err(Error::ExtentInvalidDeviceIndex {
                        index,
                        device_index: self.target_source.get(),
                    });
                };

                let count = self.num_sectors.get();
                let start = self.target_data.get();
                let end = start.checked_add(count).ok_or({
                    Error::ExtentEndSectorTooLarge {
                        index,
                        start,
                        count,
                    }
                })?;

                if start < device.first_logical_sector.get() {
                    return Err(Error::ExtentStartBeforeDeviceStart {
                        index,
                        start,
                        sector: device.first_logical_sector.get(),
                    });
                }

                // The backup metadata slots live at the tail of device 0.
                let usable_bytes = if self.target_source.get() == 0 {
                    device
                        .size
                        .get()
                        .saturating_sub(geometry.backup_reserved_bytes())
                } else {
                    device.size.get()
                };
                let device_sectors = usable_bytes / u64::from(SECTOR_SIZE);

                if end > device_sectors {
                    return Err(Error::ExtentEndsAfterDeviceEnd {
                        index,
                        end,
                        sector: device_sectors,
                    });
                }
            }
            Self::TARGET_TYPE_ZERO => {
                if self.target_data.get() != 0 || self.target_source.get() != 0 {
                    return Err(Error::ExtentTypeZeroNotEmpty { index });
                }
            }
            n => {
                return Err(Error::ExtentInvalidType {
                    index,
                    extent_type: n,
                })
            }
        }

        Ok(())
    }
}

/// Raw on-disk layout for an entry in the partition groups table.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawPartitionGroup {
    /// Partition group name. This must be unique across all groups.
    name: RawName,
    /// Partition group flags.
    flags: little_endian::U32,
    /// Maximum size of all partitions in this group. If this is set to 0, then
    /// there is no size limit.
    maximum_size: little_endian::U64,
}

impl fmt::Debug for RawPartitionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = PartitionGroupFlags::from_bits_retain(self.flags.get());

        f.debug_struct("RawPartitionGroup")
            .field("name", &self.name)
            .field("flags", &flags.0)
            .field("maximum_size", &self.maximum_size.get())
            .finish()
    }
}

impl RawPartitionGroup {
    /// Ensure that all fields are semantically valid and can be used without
    /// further checks. [`RawPartition::validate`] and [`RawExtent::validate`]
    /// must have passed for all specified partitions and extents before this
    /// function is called. The quota only counts linear extents.
    fn validate(
        &self,
        index: usize,
        partitions: &[RawPartition],
        extents: &[RawExtent],
    ) -> Result<()> {
        if self.maximum_size.get() != 0 {
            let mut total_size = 0u64;

            for partition in partitions {
                if partition.group_index.get() as usize == index {
                    let first = partition.first_extent_index.get() as usize;
                    let count = partition.num_extents.get() as usize;

                    for extent in &extents[first..][..count] {
                        if extent.target_type.get() != RawExtent::TARGET_TYPE_LINEAR {
                            continue;
                        }

                        let sectors = extent
                            .num_sectors
                            .get()
                            .checked_mul(u64::from(SECTOR_SIZE))
                            .ok_or_else(|| Error::GroupTotalSizeTooLarge {
                                name: DebugString::new(self.name),
                            })?;
                        total_size = total_size.checked_add(sectors).ok_or_else(|| {
                            Error::GroupTotalSizeTooLarge {
                                name: DebugString::new(self.name),
                            }
                        })?;
                    }
                }
            }

            if total_size > self.maximum_size.get() {
                return Err(Error::GroupTotalSizeExceedsLimit {
                    name: DebugString::new(self.name),
                    size: total_size,
                    limit: self.maximum_size.get(),
                });
            }
        }

        self.name.validate()
    }
}

/// Raw on-disk layout for an entry in the block devices table.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawBlockDevice {
    /// The first [`SECTOR_SIZE`]-byte sector where actual data for the logical
    /// partitions can be allocated.
    first_logical_sector: little_endian::U64,
    /// Alignment for the partition start offset. 0 disables alignment.
    alignment: little_endian::U32,
    /// Adjustment for when the super partition itself is not aligned.
    alignment_offset: little_endian::U32,
    /// Block device size.
    size: little_endian::U64,
    /// Partition name. This must be unique across all block devices.
    partition_name: RawName,
    /// Block device flags.
    flags: little_endian::U32,
}

impl fmt::Debug for RawBlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = BlockDeviceFlags::from_bits_retain(self.flags.get());

        f.debug_struct("RawBlockDevice")
            .field("first_logical_sector", &self.first_logical_sector.get())
            .field("alignment", &self.alignment.get())
            .field("alignment_offset", &self.alignment_offset.get())
            .field("size", &self.size.get())
            .field("partition_name", &self.partition_name)
            .field("flags", &flags.0)
            .finish()
    }
}

impl RawBlockDevice {
    /// Ensure that all fields are semantically valid and can be used without
    /// further checks.
    fn validate(&self) -> Result<()> {
        if self.alignment.get() != 0 {
            if self.alignment.get() % SECTOR_SIZE != 0 {
                return Err(Error::DeviceAlignmentNotSectorAligned {
                    name: DebugString::new(self.partition_name),
                });
            }

            let alignment_sectors = u64::from(self.alignment.get() / SECTOR_SIZE);
            if self.first_logical_sector.get() % alignment_sectors != 0 {
                return Err(Error::DeviceFirstSectorNotAligned {
                    name: DebugString::new(self.partition_name),
                });
            }
        }

        if self.alignment_offset.get() % SECTOR_SIZE != 0 {
            return Err(Error::DeviceOffsetNotSectorAligned {
                name: DebugString::new(self.partition_name),
            });
        }

        if self.size.get() % u64::from(SECTOR_SIZE) != 0 {
            return Err(Error::DeviceSizeNotSectorAligned {
                name: DebugString::new(self.partition_name),
            });
        }

        self.partition_name.validate()
    }
}

/// A wrapper around the on-disk layouts for a single metadata slot.
#[derive(Clone, Debug)]
struct RawMetadataSlot {
    header: RawHeader,
    partitions: Vec<RawPartition>,
    extents: Vec<RawExtent>,
    groups: Vec<RawPartitionGroup>,
    block_devices: Vec<RawBlockDevice>,
}

impl RawMetadataSlot {
    /// Ensure that all fields are semantically valid and can be used without
    /// further checks. Tables are validated in topological order.
    fn validate(&self, geometry: &RawGeometry) -> Result<()> {
        self.header.validate(geometry)?;

        for block_device in &self.block_devices {
            block_device.validate()?;
        }

        for (i, extent) in self.extents.iter().enumerate() {
            extent.validate(i, &self.block_devices, geometry)?;
        }

        // Overlapping extents are tolerated because AOSP produces them after a
        // virtual A/B CoW merge, but duplicate partition names are not.
        for (i, partition) in self.partitions.iter().enumerate() {
            partition.validate(&self.header, &self.extents, &self.groups)?;

            for other in &self.partitions[..i] {
                if other.name.as_str()? == partition.name.as_str()? {
                    return Err(Error::PartitionNameDuplicate {
                        name: DebugString::new(partition.name),
                    });
                }
            }
        }

        for (i, group) in self.groups.iter().enumerate() {
            group.validate(i, &self.partitions, &self.extents)?;
        }

        Ok(())
    }

    /// Verify the tables checksum against the raw tables buffer. This is done
    /// separately from [`RawMetadataSlot::validate`] because the checksum
    /// covers the on-disk byte representation, including any
    /// foreign-entry-size padding that decoding discards.
    fn validate_tables_digest(header: &RawHeader, tables_buf: &[u8]) -> Result<()> {
        let digest = crypto::sha256(tables_buf);
        if digest != header.tables_checksum {
            return Err(Error::TablesInvalidDigest {
                expected: hex::encode(header.tables_checksum),
                actual: hex::encode(digest),
            });
        }

        Ok(())
    }

    /// Serialize to `header ‖ tables` with freshly computed descriptors and
    /// checksums.
    fn to_bytes(&mut self) -> Result<Vec<u8>> {
        let header_size = self.header.size();

        let mut offset = 0u32;
        offset = self.header.partitions.update(&self.partitions, offset)?;
        offset = self.header.extents.update(&self.extents, offset)?;
        offset = self.header.groups.update(&self.groups, offset)?;
        offset = self
            .header
            .block_devices
            .update(&self.block_devices, offset)?;

        self.header.tables_size = offset.into();

        let mut tables = Vec::with_capacity(offset as usize);
        tables.extend_from_slice(self.partitions.as_bytes());
        tables.extend_from_slice(self.extents.as_bytes());
        tables.extend_from_slice(self.groups.as_bytes());
        tables.extend_from_slice(self.block_devices.as_bytes());

        self.header.tables_checksum = crypto::sha256(&tables);

        self.header.header_checksum.fill(0);
        let digest = crypto::sha256(&self.header.as_bytes()[..header_size]);
        self.header.header_checksum.copy_from_slice(&digest);

        let mut blob = Vec::with_capacity(header_size + tables.len());
        blob.extend_from_slice(&self.header.as_bytes()[..header_size]);
        blob.extend_from_slice(&tables);

        Ok(blob)
    }
}

/// Logical view of the metadata geometry. Struct size and checksum are owned
/// by the codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Geometry {
    /// Maximum size of a single copy of the metadata (header + tables). This
    /// must be a multiple of [`SECTOR_SIZE`].
    pub metadata_max_size: u32,
    /// Number of metadata slots, excluding the backup copies.
    pub metadata_slot_count: u32,
    /// Block device block size for the logical partitions.
    pub logical_block_size: u32,
}

impl Geometry {
    /// Size of the reservation for the backup metadata slots at the end of
    /// the block device.
    pub fn backup_reserved_bytes(&self) -> u64 {
        u64::from(self.metadata_max_size) * u64::from(self.metadata_slot_count)
    }
}

impl From<&RawGeometry> for Geometry {
    fn from(raw: &RawGeometry) -> Self {
        Self {
            metadata_max_size: raw.metadata_max_size.get(),
            metadata_slot_count: raw.metadata_slot_count.get(),
            logical_block_size: raw.logical_block_size.get(),
        }
    }
}

impl From<&Geometry> for RawGeometry {
    fn from(geometry: &Geometry) -> Self {
        Self {
            magic: GEOMETRY_MAGIC.into(),
            struct_size: (mem::size_of::<Self>() as u32).into(),
            checksum: Default::default(),
            metadata_max_size: geometry.metadata_max_size.into(),
            metadata_slot_count: geometry.metadata_slot_count.into(),
            logical_block_size: geometry.logical_block_size.into(),
        }
    }
}

/// Logical view of the metadata header. Sizes, checksums, and table
/// descriptors are owned by the codec and recomputed on every write.
#[derive(Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Header {
    /// Major version. [`MAJOR_VERSION`] is the only version supported.
    pub major_version: u16,
    /// Minor version. Versions between [`MINOR_VERSION_MIN`] and
    /// [`MINOR_VERSION_MAX`] are supported.
    pub minor_version: u16,
    /// Header flags. These are informational and do not affect parsing. They
    /// can only be stored when [`Header::minor_version`] is at least 2.
    pub flags: HeaderFlags,
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("major_version", &self.major_version)
            .field("minor_version", &self.minor_version)
            .field("flags", &self.flags.0)
            .finish()
    }
}

impl Default for Header {
    fn default() -> Self {
        Self {
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION_MIN,
            flags: HeaderFlags::empty(),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Partition {
    /// Partition name. This must be unique across all partitions.
    pub name: String,
    /// Partition attributes.
    pub attributes: PartitionAttributes,
    /// Index of the first extent owned by this partition.
    pub first_extent_index: u32,
    /// Number of extents covered by this partition.
    pub num_extents: u32,
    /// Index of the group containing this partition.
    pub group_index: u32,
}

impl fmt::Debug for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partition")
            .field("name", &self.name)
            .field("attributes", &self.attributes.0)
            .field("first_extent_index", &self.first_extent_index)
            .field("num_extents", &self.num_extents)
            .field("group_index", &self.group_index)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum ExtentType {
    /// dm-linear: maps to a contiguous physical sector range.
    Linear {
        /// The physical sector that this extent starts at on the block device.
        start_sector: u64,
        /// The index of the block device that backs this extent.
        block_device_index: u32,
    },
    /// dm-zero: reads as zeros, writes are discarded.
    Zero,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Extent {
    /// Number of [`SECTOR_SIZE`]-byte sectors in this extent.
    pub num_sectors: u64,
    /// device-mapper target type.
    pub extent_type: ExtentType,
}

#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PartitionGroup {
    /// Partition group name. This must be unique across all groups.
    pub name: String,
    /// Partition group flags.
    pub flags: PartitionGroupFlags,
    /// Maximum combined size of all partitions in this group. 0 means
    /// unbounded.
    pub maximum_size: u64,
}

impl fmt::Debug for PartitionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionGroup")
            .field("name", &self.name)
            .field("flags", &self.flags.0)
            .field("maximum_size", &self.maximum_size)
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BlockDevice {
    /// The first [`SECTOR_SIZE`]-byte sector where actual data for the logical
    /// partitions can be allocated.
    pub first_logical_sector: u64,
    /// Alignment for the partition start offset, in bytes. 0 disables
    /// alignment.
    pub alignment: u32,
    /// Adjustment for when the super partition itself is not aligned.
    pub alignment_offset: u32,
    /// Block device size.
    pub size: u64,
    /// Backing partition name.
    pub partition_name: String,
    /// Block device flags.
    pub flags: BlockDeviceFlags,
}

impl fmt::Debug for BlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockDevice")
            .field("first_logical_sector", &self.first_logical_sector)
            .field("alignment", &self.alignment)
            .field("alignment_offset", &self.alignment_offset)
            .field("size", &self.size)
            .field("partition_name", &self.partition_name)
            .field("flags", &self.flags.0)
            .finish()
    }
}

/// Logical model of one metadata slot plus the geometry. The four entity
/// tables mirror the on-disk layout: partitions reference their extents by
/// index range and their group by index.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Metadata {
    /// Metadata geometry.
    pub geometry: Geometry,
    /// Metadata header.
    pub header: Header,
    /// List of logical partitions.
    pub partitions: Vec<Partition>,
    /// List of extents, referenced by index from the partitions.
    pub extents: Vec<Extent>,
    /// List of partition groups.
    pub groups: Vec<PartitionGroup>,
    /// List of block devices containing data extents.
    pub block_devices: Vec<BlockDevice>,
}

impl TryFrom<&RawMetadataSlot> for Metadata {
    type Error = Error;

    fn try_from(raw_slot: &RawMetadataSlot) -> Result<Self> {
        // The geometry is filled in by the caller; a slot alone doesn't know
        // it.
        let mut metadata = Self {
            geometry: Geometry {
                metadata_max_size: 0,
                metadata_slot_count: 0,
                logical_block_size: 0,
            },
            header: Header {
                major_version: raw_slot.header.major_version.get(),
                minor_version: raw_slot.header.minor_version.get(),
                flags: HeaderFlags::from_bits_retain(raw_slot.header.flags.get()),
            },
            partitions: Vec::with_capacity(raw_slot.partitions.len()),
            extents: Vec::with_capacity(raw_slot.extents.len()),
            groups: Vec::with_capacity(raw_slot.groups.len()),
            block_devices: Vec::with_capacity(raw_slot.block_devices.len()),
        };

        for raw_partition in &raw_slot.partitions {
            metadata.partitions.push(Partition {
                name: raw_partition.name.as_str()?.to_owned(),
                attributes: PartitionAttributes::from_bits_retain(raw_partition.attributes.get()),
                first_extent_index: raw_partition.first_extent_index.get(),
                num_extents: raw_partition.num_extents.get(),
                group_index: raw_partition.group_index.get(),
            });
        }

        for raw_extent in &raw_slot.extents {
            metadata.extents.push(Extent {
                num_sectors: raw_extent.num_sectors.get(),
                extent_type: match raw_extent.target_type.get() {
                    RawExtent::TARGET_TYPE_LINEAR => ExtentType::Linear {
                        start_sector: raw_extent.target_data.get(),
                        block_device_index: raw_extent.target_source.get(),
                    },
                    RawExtent::TARGET_TYPE_ZERO => ExtentType::Zero,
                    _ => unreachable!(),
                },
            });
        }

        for raw_group in &raw_slot.groups {
            metadata.groups.push(PartitionGroup {
                name: raw_group.name.as_str()?.to_owned(),
                flags: PartitionGroupFlags::from_bits_retain(raw_group.flags.get()),
                maximum_size: raw_group.maximum_size.get(),
            });
        }

        for raw_block_device in &raw_slot.block_devices {
            metadata.block_devices.push(BlockDevice {
                first_logical_sector: raw_block_device.first_logical_sector.get(),
                alignment: raw_block_device.alignment.get(),
                alignment_offset: raw_block_device.alignment_offset.get(),
                size: raw_block_device.size.get(),
                partition_name: raw_block_device.partition_name.as_str()?.to_owned(),
                flags: BlockDeviceFlags::from_bits_retain(raw_block_device.flags.get()),
            });
        }

        Ok(metadata)
    }
}

impl TryFrom<&Metadata> for RawMetadataSlot {
    type Error = Error;

    fn try_from(metadata: &Metadata) -> Result<Self> {
        let header_size = RawHeader::size_for_version(
            metadata.header.major_version,
            metadata.header.minor_version,
        );

        let mut raw_slot = RawMetadataSlot {
            header: RawHeader {
                magic: HEADER_MAGIC.into(),
                major_version: metadata.header.major_version.into(),
                minor_version: metadata.header.minor_version.into(),
                header_size: (header_size as u32).into(),
                header_checksum: Default::default(),
                tables_size: 0.into(),
                tables_checksum: Default::default(),
                partitions: RawTableDescriptor::new_zeroed(),
                extents: RawTableDescriptor::new_zeroed(),
                groups: RawTableDescriptor::new_zeroed(),
                block_devices: RawTableDescriptor::new_zeroed(),
                flags: metadata.header.flags.bits().into(),
                reserved: [0u8; 124],
            },
            partitions: Vec::with_capacity(metadata.partitions.len()),
            extents: Vec::with_capacity(metadata.extents.len()),
            groups: Vec::with_capacity(metadata.groups.len()),
            block_devices: Vec::with_capacity(metadata.block_devices.len()),
        };

        for partition in &metadata.partitions {
            raw_slot.partitions.push(RawPartition {
                name: partition.name.parse()?,
                attributes: partition.attributes.bits().into(),
                first_extent_index: partition.first_extent_index.into(),
                num_extents: partition.num_extents.into(),
                group_index: partition.group_index.into(),
            });
        }

        for (index, extent) in metadata.extents.iter().enumerate() {
            let (target_type, target_data, target_source) = match extent.extent_type {
                ExtentType::Linear {
                    start_sector,
                    block_device_index,
                } => {
                    if block_device_index as usize >= metadata.block_devices.len() {
                        return Err(Error::ExtentDeviceIndexTooLarge { index });
                    }

                    (
                        RawExtent::TARGET_TYPE_LINEAR,
                        start_sector,
                        block_device_index,
                    )
                }
                ExtentType::Zero => (RawExtent::TARGET_TYPE_ZERO, 0, 0),
            };

            raw_slot.extents.push(RawExtent {
                num_sectors: extent.num_sectors.into(),
                target_type: target_type.into(),
                target_data: target_data.into(),
                target_source: target_source.into(),
            });
        }

        for group in &metadata.groups {
            raw_slot.groups.push(RawPartitionGroup {
                name: group.name.parse()?,
                flags: group.flags.bits().into(),
                maximum_size: group.maximum_size.into(),
            });
        }

        for block_device in &metadata.block_devices {
            raw_slot.block_devices.push(RawBlockDevice {
                first_logical_sector: block_device.first_logical_sector.into(),
                alignment: block_device.alignment.into(),
                alignment_offset: block_device.alignment_offset.into(),
                size: block_device.size.into(),
                partition_name: block_device.partition_name.parse()?,
                flags: block_device.flags.bits().into(),
            });
        }

        Ok(raw_slot)
    }
}

/// Read the geometry by probing the known offsets in order: the primary copy,
/// the backup copy, and finally the legacy offset 0. A failure at one offset
/// is soft; the next candidate is tried. Checksum failures are remembered so
/// that a corrupted-but-present geometry reports as a checksum error rather
/// than "not found" when every candidate fails.
fn read_geometry(mut reader: impl Read + Seek) -> Result<RawGeometry> {
    let mut checksum_err = None;

    for offset in GEOMETRY_CANDIDATE_OFFSETS {
        reader
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Error::DataRead("geometry_seek", e))?;

        let mut block = [0u8; GEOMETRY_SIZE as usize];
        if let Err(e) = reader.read_exact(&mut block) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                warn!("Short read for geometry candidate at offset {offset}");
                continue;
            }
            return Err(Error::DataRead("geometry", e));
        }

        match RawGeometry::parse(&block) {
            Ok(geometry) => {
                match offset {
                    GEOMETRY_PRIMARY_OFFSET => {}
                    GEOMETRY_BACKUP_OFFSET => {
                        warn!("Primary geometry is invalid; using the backup copy");
                    }
                    _ => {
                        warn!("Using legacy geometry at offset 0");
                    }
                }

                return Ok(geometry);
            }
            Err(e) => {
                warn!("Geometry candidate at offset {offset} is invalid: {e}");

                if e.kind() == ErrorKind::Checksum && checksum_err.is_none() {
                    checksum_err = Some(e);
                }
            }
        }
    }

    Err(checksum_err.unwrap_or(Error::GeometryNotFound))
}

/// Read and validate one raw metadata slot at the given absolute offset.
fn read_raw_slot(
    mut reader: impl Read + Seek,
    geometry: &RawGeometry,
    offset: u64,
) -> Result<RawMetadataSlot> {
    reader
        .seek(SeekFrom::Start(offset))
        .map_err(|e| Error::DataRead("slot_seek", e))?;

    let mut header = RawHeader::new_zeroed();

    reader
        .read_exact(&mut header.as_mut_bytes()[..RawHeader::SIZE_V1_0])
        .map_err(|e| Error::DataRead("header", e))?;

    header.validate_prefix()?;

    if header.size() > RawHeader::SIZE_V1_0 {
        reader
            .read_exact(&mut header.as_mut_bytes()[RawHeader::SIZE_V1_0..])
            .map_err(|e| Error::DataRead("header_expanded", e))?;
    }

    // This is validated again as part of the slot, but the initial check
    // ensures everything is in bounds before the tables are read.
    header.validate(geometry)?;

    let tables_buf = reader
        .read_vec_exact(header.tables_size.get() as usize)
        .map_err(|e| Error::DataRead("tables", e))?;

    RawMetadataSlot::validate_tables_digest(&header, &tables_buf)?;

    let slot = RawMetadataSlot {
        partitions: header.partitions.decode_from_buf(&tables_buf),
        extents: header.extents.decode_from_buf(&tables_buf),
        groups: header.groups.decode_from_buf(&tables_buf),
        block_devices: header.block_devices.decode_from_buf(&tables_buf),
        header,
    };

    slot.validate(geometry)?;

    Ok(slot)
}

/// Current length of the stream, with the position left unspecified.
fn stream_len(mut stream: impl Seek) -> io::Result<u64> {
    stream.seek(SeekFrom::End(0))
}

impl Metadata {
    /// Read the primary copy of the specified metadata slot. The geometry is
    /// discovered by probing the known offsets.
    pub fn read_primary_slot(mut reader: impl Read + Seek, slot: u32) -> Result<Self> {
        let geometry = read_geometry(&mut reader)?;
        Self::check_slot(&geometry, slot)?;

        let raw_slot = read_raw_slot(&mut reader, &geometry, geometry.primary_slot_offset(slot))?;

        Self::from_parts(&geometry, &raw_slot)
    }

    /// Read the backup copy of the specified metadata slot from the end of
    /// the stream.
    pub fn read_backup_slot(mut reader: impl Read + Seek, slot: u32) -> Result<Self> {
        let geometry = read_geometry(&mut reader)?;
        Self::check_slot(&geometry, slot)?;

        let image_size =
            stream_len(&mut reader).map_err(|e| Error::DataRead("stream_len", e))?;
        let offset = geometry.backup_slot_offset(image_size, slot);

        let raw_slot = read_raw_slot(&mut reader, &geometry, offset)?;

        Self::from_parts(&geometry, &raw_slot)
    }

    /// Read the specified metadata slot, falling back to the backup copy at
    /// the end of the stream when the primary copy is damaged. The error from
    /// the backup attempt is surfaced if both copies are unreadable.
    pub fn read_slot(mut reader: impl Read + Seek, slot: u32) -> Result<Self> {
        let geometry = read_geometry(&mut reader)?;
        Self::check_slot(&geometry, slot)?;

        let primary_err =
            match read_raw_slot(&mut reader, &geometry, geometry.primary_slot_offset(slot)) {
                Ok(raw_slot) => return Self::from_parts(&geometry, &raw_slot),
                Err(e @ Error::DataRead(_, _)) if e.kind() == ErrorKind::Io => return Err(e),
                Err(e) => e,
            };

        warn!("Primary metadata slot {slot} is invalid: {primary_err}; trying the backup copy");

        let image_size =
            stream_len(&mut reader).map_err(|e| Error::DataRead("stream_len", e))?;
        let offset = geometry.backup_slot_offset(image_size, slot);

        match read_raw_slot(&mut reader, &geometry, offset) {
            Ok(raw_slot) => Self::from_parts(&geometry, &raw_slot),
            Err(backup_err) => {
                warn!("Backup metadata slot {slot} is invalid: {backup_err}");
                Err(backup_err)
            }
        }
    }

    /// Read metadata slot 0.
    pub fn read(reader: impl Read + Seek) -> Result<Self> {
        Self::read_slot(reader, 0)
    }

    fn check_slot(geometry: &RawGeometry, slot: u32) -> Result<()> {
        if slot >= geometry.metadata_slot_count.get() {
            return Err(Error::SlotOutOfRange {
                slot,
                count: geometry.metadata_slot_count.get(),
            });
        }

        Ok(())
    }

    fn from_parts(geometry: &RawGeometry, raw_slot: &RawMetadataSlot) -> Result<Self> {
        let mut metadata: Self = raw_slot.try_into()?;
        metadata.geometry = geometry.into();

        Ok(metadata)
    }

    /// Serialize this metadata to `header ‖ tables` with freshly computed
    /// table descriptors and checksums. The result is not padded to
    /// [`Geometry::metadata_max_size`].
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let raw_geometry: RawGeometry = (&self.geometry).into();
        let mut raw_slot: RawMetadataSlot = self.try_into()?;

        let blob = raw_slot.to_bytes()?;

        raw_geometry.validate()?;
        raw_slot.validate(&raw_geometry)?;

        Ok(blob)
    }

    /// Serialize the blob and ensure it fits into a metadata slot.
    fn serialize_checked(&self) -> Result<Vec<u8>> {
        let blob = self.serialize()?;

        if blob.len() as u64 > u64::from(self.geometry.metadata_max_size) {
            return Err(Error::MetadataTooLarge {
                metadata_size: blob.len() as u64,
                max_size: self.geometry.metadata_max_size,
                header_size: 0,
            });
        }

        Ok(blob)
    }

    fn write_geometry(&self, mut writer: impl Write + Seek) -> Result<()> {
        let raw_geometry: RawGeometry = (&self.geometry).into();
        raw_geometry.validate()?;

        let block = raw_geometry.to_block();

        // Bytes [0, 4096) are an opaque reserved region and are left alone.
        writer
            .seek(SeekFrom::Start(GEOMETRY_PRIMARY_OFFSET))
            .map_err(|e| Error::DataWrite("geometry_seek", e))?;

        for _ in 0..2 {
            writer
                .write_all(&block)
                .map_err(|e| Error::DataWrite("geometry", e))?;
        }

        Ok(())
    }

    fn write_slot_blob(
        &self,
        mut writer: impl Write + Seek,
        blob: &[u8],
        slot: u32,
    ) -> Result<()> {
        let raw_geometry: RawGeometry = (&self.geometry).into();

        writer
            .seek(SeekFrom::Start(raw_geometry.primary_slot_offset(slot)))
            .map_err(|e| Error::DataWrite("slot_seek", e))?;
        writer
            .write_all(blob)
            .map_err(|e| Error::DataWrite("slot", e))?;

        if let Some(device) = self.block_devices.first() {
            let offset = raw_geometry.backup_slot_offset(device.size, slot);

            writer
                .seek(SeekFrom::Start(offset))
                .map_err(|e| Error::DataWrite("backup_slot_seek", e))?;
            writer
                .write_all(blob)
                .map_err(|e| Error::DataWrite("backup_slot", e))?;
        }

        Ok(())
    }

    /// Write one metadata slot (primary and backup copy) without touching the
    /// geometry or the other slots. The geometry must match what is already
    /// stored in the image.
    pub fn write_slot(&self, mut writer: impl Write + Seek, slot: u32) -> Result<()> {
        let raw_geometry: RawGeometry = (&self.geometry).into();
        raw_geometry.validate()?;
        Self::check_slot(&raw_geometry, slot)?;

        let blob = self.serialize_checked()?;

        self.write_slot_blob(&mut writer, &blob, slot)
    }

    /// Write a complete image: both geometry copies, then every primary
    /// metadata slot with its backup copy. The metadata blob is validated
    /// against [`Geometry::metadata_max_size`] before any slot byte is
    /// written. When block devices are defined, the caller must have sized
    /// the stream to the first device's size beforehand.
    pub fn write(&self, mut writer: impl Write + Seek) -> Result<()> {
        let blob = self.serialize_checked()?;

        self.write_geometry(&mut writer)?;

        for slot in 0..self.geometry.metadata_slot_count {
            self.write_slot_blob(&mut writer, &blob, slot)?;
        }

        Ok(())
    }
}

impl<R: Read + Seek> FromReader<R> for Metadata {
    type Error = Error;

    fn from_reader(reader: R) -> Result<Self> {
        Self::read(reader)
    }
}

impl<W: Write + Seek> ToWriter<W> for Metadata {
    type Error = Error;

    fn to_writer(&self, writer: W) -> Result<()> {
        self.write(writer)
    }
}
