// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! In-memory editor for LP metadata layouts. The builder tracks partitions
//! with their extents attached and maintains free-region accounting on the
//! backing block device, enforcing group quotas and device capacity when
//! partitions are added, resized, or compacted.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    format::{
        lp::{
            BlockDevice, BlockDeviceFlags, Error, Extent, ExtentType, Geometry, Header, Metadata,
            Partition, PartitionAttributes, PartitionGroup, PartitionGroupFlags,
            GEOMETRY_SIZE, PARTITION_RESERVED_BYTES, SECTOR_SIZE,
        },
        padding,
    },
    util::DebugString,
};

type Result<T> = std::result::Result<T, Error>;

/// Name of the group that always exists and cannot be removed.
pub const DEFAULT_GROUP: &str = "default";

/// Backing partition name used for freshly created block devices.
pub const SUPER_PARTITION_NAME: &str = "super";

/// Default alignment for extent placement on freshly created block devices.
const DEFAULT_ALIGNMENT: u32 = 4096;

/// A partition tracked by the editor, with its extents attached and its group
/// referenced by name.
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PartitionInfo {
    /// Partition name. This must be unique across all partitions.
    pub name: String,
    /// Partition attributes.
    pub attributes: PartitionAttributes,
    /// Name of the group containing this partition.
    pub group_name: String,
    /// Extents covered by this partition.
    #[serde(skip)]
    pub extents: Vec<Extent>,
}

impl fmt::Debug for PartitionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionInfo")
            .field("name", &self.name)
            .field("attributes", &self.attributes)
            .field("group_name", &self.group_name)
            .field("extents", &self.extents)
            .finish()
    }
}

impl PartitionInfo {
    /// Compute the number of sectors covered by the extents.
    pub fn num_sectors(&self) -> Result<u64> {
        self.extents
            .iter()
            .try_fold(0u64, |total, e| total.checked_add(e.num_sectors))
            .ok_or_else(|| Error::PartitionSectorCountTooLarge {
                name: DebugString::new(&self.name),
            })
    }

    /// Compute the number of bytes covered by the extents.
    pub fn size(&self) -> Result<u64> {
        self.num_sectors()?
            .checked_mul(SECTOR_SIZE.into())
            .ok_or_else(|| Error::PartitionSectorCountTooLarge {
                name: DebugString::new(&self.name),
            })
    }
}

/// A contiguous run of unallocated sectors on the block device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeRegion {
    /// First free sector.
    pub start_sector: u64,
    /// Number of free sectors.
    pub num_sectors: u64,
}

/// Builder for editing an LP metadata layout. Mutations are validated up
/// front; an operation that fails leaves the builder unchanged.
#[derive(Clone, Debug)]
pub struct MetadataBuilder {
    geometry: Geometry,
    header: Header,
    groups: Vec<PartitionGroup>,
    partitions: Vec<PartitionInfo>,
    block_devices: Vec<BlockDevice>,
}

impl MetadataBuilder {
    /// Create a builder for a fresh layout on a single block device of the
    /// specified size, with the `"default"` group installed and no
    /// partitions. The first logical sector is placed after the reserved
    /// header, both geometry copies, and space for two full sets of metadata
    /// slots, rounded up to the block size.
    pub fn new(device_size: u64, metadata_max_size: u32, metadata_slot_count: u32) -> Result<Self> {
        if metadata_max_size == 0 || metadata_max_size % SECTOR_SIZE != 0 {
            return Err(Error::MaxMetadataSizeUnaligned(metadata_max_size));
        } else if metadata_slot_count == 0 {
            return Err(Error::NoMetadataSlots);
        }

        let metadata_bytes =
            u64::from(GEOMETRY_SIZE) + u64::from(metadata_max_size) * u64::from(metadata_slot_count);
        let reserved = u64::from(PARTITION_RESERVED_BYTES) + metadata_bytes * 2;
        let first_logical_sector = padding::round(reserved, u64::from(DEFAULT_ALIGNMENT))
            .ok_or(Error::MaxMetadataSizeTooLarge(metadata_max_size))?
            / u64::from(SECTOR_SIZE);

        Ok(Self {
            geometry: Geometry {
                metadata_max_size,
                metadata_slot_count,
                logical_block_size: 4096,
            },
            header: Header::default(),
            groups: vec![PartitionGroup {
                name: DEFAULT_GROUP.to_owned(),
                flags: PartitionGroupFlags::empty(),
                maximum_size: 0,
            }],
            partitions: Vec::new(),
            block_devices: vec![BlockDevice {
                first_logical_sector,
                alignment: DEFAULT_ALIGNMENT,
                alignment_offset: 0,
                size: device_size,
                partition_name: SUPER_PARTITION_NAME.to_owned(),
                flags: BlockDeviceFlags::empty(),
            }],
        })
    }

    /// Rebuild an editor from a parsed layout. Each partition's extents are
    /// sliced out of the extent table and its group is resolved by index. The
    /// header version and flags are preserved so that re-exported metadata
    /// does not lose information from newer minor versions.
    pub fn from_metadata(metadata: &Metadata) -> Result<Self> {
        let mut partitions = Vec::with_capacity(metadata.partitions.len());

        for partition in &metadata.partitions {
            let first = partition.first_extent_index as usize;
            let count = partition.num_extents as usize;

            if first
                .checked_add(count)
                .map_or(true, |n| n > metadata.extents.len())
            {
                return Err(Error::PartitionExtentIndicesTooLarge {
                    name: DebugString::new(&partition.name),
                });
            }

            let group = metadata
                .groups
                .get(partition.group_index as usize)
                .ok_or(Error::PartitionInvalidGroupIndex {
                    name: DebugString::new(&partition.name),
                    index: partition.group_index,
                })?;

            partitions.push(PartitionInfo {
                name: partition.name.clone(),
                attributes: partition.attributes,
                group_name: group.name.clone(),
                extents: metadata.extents[first..][..count].to_vec(),
            });
        }

        Ok(Self {
            geometry: metadata.geometry,
            header: metadata.header,
            groups: metadata.groups.clone(),
            partitions,
            block_devices: metadata.block_devices.clone(),
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn partitions(&self) -> &[PartitionInfo] {
        &self.partitions
    }

    pub fn groups(&self) -> &[PartitionGroup] {
        &self.groups
    }

    pub fn block_devices(&self) -> &[BlockDevice] {
        &self.block_devices
    }

    pub fn partition(&self, name: &str) -> Option<&PartitionInfo> {
        self.partitions.iter().find(|p| p.name == name)
    }

    pub fn group(&self, name: &str) -> Option<&PartitionGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    fn device(&self) -> Result<&BlockDevice> {
        self.block_devices.first().ok_or(Error::NoBlockDevices)
    }

    /// Total size in bytes of all partitions assigned to a group.
    pub fn group_usage(&self, name: &str) -> Result<u64> {
        let mut total = 0u64;

        for partition in &self.partitions {
            if partition.group_name == name {
                total = total.checked_add(partition.size()?).ok_or_else(|| {
                    Error::GroupTotalSizeTooLarge {
                        name: DebugString::new(name),
                    }
                })?;
            }
        }

        Ok(total)
    }

    /// Add an empty partition to a group.
    pub fn add_partition(
        &mut self,
        name: &str,
        group_name: &str,
        attributes: PartitionAttributes,
    ) -> Result<()> {
        if self.partition(name).is_some() {
            return Err(Error::PartitionExists(DebugString::new(name)));
        }
        if self.group(group_name).is_none() {
            return Err(Error::GroupNotFound(DebugString::new(group_name)));
        }

        self.partitions.push(PartitionInfo {
            name: name.to_owned(),
            attributes,
            group_name: group_name.to_owned(),
            extents: Vec::new(),
        });

        Ok(())
    }

    /// Remove a partition and release its extents. Removing a partition that
    /// doesn't exist is a no-op.
    pub fn remove_partition(&mut self, name: &str) {
        self.partitions.retain(|p| p.name != name);
    }

    /// Reorder partitions to match the supplied sequence. Names that don't
    /// match any partition are ignored. Partitions not named in the sequence
    /// are dropped from the layout, so a caller that wants to keep them must
    /// list them explicitly.
    pub fn reorder_partitions<S: AsRef<str>>(&mut self, names: &[S]) {
        let mut reordered = Vec::with_capacity(self.partitions.len());

        for name in names {
            if let Some(index) = self
                .partitions
                .iter()
                .position(|p| p.name == name.as_ref())
            {
                reordered.push(self.partitions.remove(index));
            }
        }

        for dropped in &self.partitions {
            debug!("Dropping partition not named in the new order: {}", dropped.name);
        }

        self.partitions = reordered;
    }

    /// Add a group. A maximum size of 0 means the group is unbounded.
    pub fn add_group(&mut self, name: &str, maximum_size: u64) -> Result<()> {
        if self.group(name).is_some() {
            return Err(Error::GroupExists(DebugString::new(name)));
        }

        self.groups.push(PartitionGroup {
            name: name.to_owned(),
            flags: PartitionGroupFlags::empty(),
            maximum_size,
        });

        Ok(())
    }

    /// Remove an empty group. The `"default"` group cannot be removed.
    pub fn remove_group(&mut self, name: &str) -> Result<()> {
        if name == DEFAULT_GROUP {
            return Err(Error::GroupDefaultImmutable);
        }
        if self.group(name).is_none() {
            return Err(Error::GroupNotFound(DebugString::new(name)));
        }
        if self.partitions.iter().any(|p| p.group_name == name) {
            return Err(Error::GroupInUse(DebugString::new(name)));
        }

        self.groups.retain(|g| g.name != name);

        Ok(())
    }

    /// Change a group's maximum size. Shrinking below the current combined
    /// size of its partitions is rejected. A maximum size of 0 makes the
    /// group unbounded.
    pub fn resize_group(&mut self, name: &str, maximum_size: u64) -> Result<()> {
        let index = self
            .groups
            .iter()
            .position(|g| g.name == name)
            .ok_or_else(|| Error::GroupNotFound(DebugString::new(name)))?;

        if maximum_size > 0 {
            let usage = self.group_usage(name)?;
            if usage > maximum_size {
                return Err(Error::GroupTotalSizeExceedsLimit {
                    name: DebugString::new(name),
                    size: usage,
                    limit: maximum_size,
                });
            }
        }

        self.groups[index].maximum_size = maximum_size;

        Ok(())
    }

    /// Change the block device size. Shrinking below the end of the last
    /// allocated extent is rejected.
    pub fn resize_block_device(&mut self, new_size: u64) -> Result<()> {
        self.device()?;

        if new_size % u64::from(SECTOR_SIZE) != 0 {
            return Err(Error::DeviceSizeNotSectorAligned {
                name: DebugString::new(&self.block_devices[0].partition_name),
            });
        }

        let mut last_sector = 0u64;

        for partition in &self.partitions {
            for extent in &partition.extents {
                if let ExtentType::Linear { start_sector, .. } = extent.extent_type {
                    last_sector = last_sector.max(start_sector + extent.num_sectors);
                }
            }
        }

        let last_byte = last_sector * u64::from(SECTOR_SIZE);
        if new_size < last_byte {
            return Err(Error::DeviceShrinkBelowUsage { new_size, last_byte });
        }

        self.block_devices[0].size = new_size;

        Ok(())
    }

    /// Advance a sector to the next aligned position on the device. Returns
    /// the sector unchanged when the device has no alignment configured.
    fn align_sector(device: &BlockDevice, sector: u64) -> u64 {
        let alignment_sectors = u64::from(device.alignment / SECTOR_SIZE);
        if alignment_sectors == 0 {
            return sector;
        }

        let offset_sectors = u64::from(device.alignment_offset / SECTOR_SIZE);
        let misalign =
            (sector % alignment_sectors + alignment_sectors - offset_sectors % alignment_sectors)
                % alignment_sectors;

        sector + (alignment_sectors - misalign) % alignment_sectors
    }

    /// Last usable sector (exclusive): the device end minus the reservation
    /// for the backup metadata slots. The reservation at the head of the
    /// device is already absorbed by [`BlockDevice::first_logical_sector`].
    fn usable_end(&self) -> Result<u64> {
        let device = self.device()?;

        let usable_bytes = device
            .size
            .saturating_sub(self.geometry.backup_reserved_bytes());

        Ok(usable_bytes / u64::from(SECTOR_SIZE))
    }

    /// Compute the free regions on the block device: the gaps between linear
    /// extents within the usable sector range, ascending by start sector.
    /// Overlapping extents are tolerated.
    pub fn free_regions(&self) -> Result<Vec<FreeRegion>> {
        let device = self.device()?;
        let last = self.usable_end()?;

        let mut allocated = Vec::new();

        for partition in &self.partitions {
            for extent in &partition.extents {
                if let ExtentType::Linear {
                    start_sector,
                    block_device_index: 0,
                } = extent.extent_type
                {
                    allocated.push((start_sector, extent.num_sectors));
                }
            }
        }

        allocated.sort_unstable();

        let mut regions = Vec::new();
        let mut cur = device.first_logical_sector;

        for (start, len) in allocated {
            if start > cur {
                regions.push(FreeRegion {
                    start_sector: cur,
                    num_sectors: start - cur,
                });
            }

            cur = cur.max(start.saturating_add(len));
        }

        if cur < last {
            regions.push(FreeRegion {
                start_sector: cur,
                num_sectors: last - cur,
            });
        }

        Ok(regions)
    }

    /// Allocate `sectors` additional sectors as linear extents placed in the
    /// free regions, in order, with each extent's start aligned to the device
    /// alignment. The returned extents are not yet attached to a partition.
    fn allocate(&self, name: &str, mut sectors: u64) -> Result<Vec<Extent>> {
        let device = self.device()?.clone();
        let mut extents = Vec::new();

        for region in self.free_regions()? {
            if sectors == 0 {
                break;
            }

            let start = Self::align_sector(&device, region.start_sector);
            let skipped = start - region.start_sector;
            if skipped >= region.num_sectors {
                // The whole region is unusable due to alignment.
                continue;
            }

            let num_sectors = sectors.min(region.num_sectors - skipped);

            extents.push(Extent {
                num_sectors,
                extent_type: ExtentType::Linear {
                    start_sector: start,
                    block_device_index: 0,
                },
            });

            sectors -= num_sectors;
        }

        if sectors > 0 {
            return Err(Error::InsufficientFreeSpace {
                name: DebugString::new(name),
                needed_sectors: sectors,
            });
        }

        Ok(extents)
    }

    /// Resize a partition to the requested size in bytes (truncated to whole
    /// sectors). Growing checks the group quota first and then appends newly
    /// allocated extents, leaving the existing extents intact. Shrinking
    /// retains the leading extents and truncates the first extent that
    /// crosses the new boundary.
    pub fn resize_partition(&mut self, name: &str, new_size: u64) -> Result<()> {
        let index = self
            .partitions
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| Error::PartitionNotFound(DebugString::new(name)))?;

        let new_sectors = new_size / u64::from(SECTOR_SIZE);
        let cur_sectors = self.partitions[index].num_sectors()?;

        if new_sectors == cur_sectors {
            return Ok(());
        }

        if new_sectors < cur_sectors {
            self.shrink_partition(index, new_sectors);
            return Ok(());
        }

        // Check the group quota before touching the free regions.
        let group_name = self.partitions[index].group_name.clone();
        let group_limit = self
            .group(&group_name)
            .ok_or_else(|| Error::GroupNotFound(DebugString::new(&group_name)))?
            .maximum_size;

        if group_limit > 0 {
            let usage = self.group_usage(&group_name)?;
            let cur_size = self.partitions[index].size()?;
            let new_usage = usage - cur_size + new_size;

            if new_usage > group_limit {
                return Err(Error::GroupTotalSizeExceedsLimit {
                    name: DebugString::new(&group_name),
                    size: new_usage,
                    limit: group_limit,
                });
            }
        }

        let new_extents = self.allocate(name, new_sectors - cur_sectors)?;
        self.partitions[index].extents.extend(new_extents);

        Ok(())
    }

    fn shrink_partition(&mut self, index: usize, new_sectors: u64) {
        let partition = &mut self.partitions[index];
        let mut kept = Vec::new();
        let mut total = 0u64;

        for extent in &partition.extents {
            if total == new_sectors {
                break;
            }

            let remain = new_sectors - total;

            if extent.num_sectors <= remain {
                total += extent.num_sectors;
                kept.push(extent.clone());
            } else {
                // Partial copy of the extent that crosses the boundary.
                total += remain;
                kept.push(Extent {
                    num_sectors: remain,
                    extent_type: extent.extent_type.clone(),
                });
            }
        }

        partition.extents = kept;
    }

    /// Repack every partition with a non-zero size into a single linear
    /// extent, placed contiguously in partition order starting at the first
    /// logical sector, with each start aligned to the device alignment. Fails
    /// without modifying anything when the compacted layout would reach into
    /// the backup metadata reservation.
    pub fn compact_partitions(&mut self) -> Result<()> {
        let device = self.device()?.clone();
        let limit = self.usable_end()?;

        let mut replacements = Vec::with_capacity(self.partitions.len());
        let mut cur = device.first_logical_sector;

        for partition in &self.partitions {
            let sectors = partition.num_sectors()?;
            if sectors == 0 {
                replacements.push(None);
                continue;
            }

            cur = Self::align_sector(&device, cur);

            let end = cur
                .checked_add(sectors)
                .ok_or(Error::LayoutOverflowsDevice {
                    end_sector: u64::MAX,
                    limit,
                })?;
            if end > limit {
                return Err(Error::LayoutOverflowsDevice {
                    end_sector: end,
                    limit,
                });
            }

            replacements.push(Some(vec![Extent {
                num_sectors: sectors,
                extent_type: ExtentType::Linear {
                    start_sector: cur,
                    block_device_index: 0,
                },
            }]));

            cur = end;
        }

        for (partition, replacement) in self.partitions.iter_mut().zip(replacements) {
            if let Some(extents) = replacement {
                partition.extents = extents;
            }
        }

        Ok(())
    }

    /// Export the layout as [`Metadata`]: groups in insertion order,
    /// partitions in editor order with their extent index ranges pointing
    /// into the concatenated extent table, and group indices resolved from
    /// the group names.
    pub fn export(&self) -> Result<Metadata> {
        let mut partitions = Vec::with_capacity(self.partitions.len());
        let mut extents = Vec::new();

        for partition in &self.partitions {
            let group_index = self
                .groups
                .iter()
                .position(|g| g.name == partition.group_name)
                .ok_or_else(|| Error::GroupNotFound(DebugString::new(&partition.group_name)))?;
            let group_index: u32 =
                group_index
                    .try_into()
                    .map_err(|_| Error::GroupIndexTooLarge {
                        name: DebugString::new(&partition.group_name),
                    })?;

            let first_extent_index = extents.len() as u32;
            let num_extents = partition.extents.len() as u32;

            partitions.push(Partition {
                name: partition.name.clone(),
                attributes: partition.attributes,
                first_extent_index,
                num_extents,
                group_index,
            });

            extents.extend(partition.extents.iter().cloned());
        }

        Ok(Metadata {
            geometry: self.geometry,
            header: self.header,
            partitions,
            extents,
            groups: self.groups.clone(),
            block_devices: self.block_devices.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::format::lp::{BlockDevice, BlockDeviceFlags};

    use super::MetadataBuilder;

    fn device(alignment: u32, alignment_offset: u32) -> BlockDevice {
        BlockDevice {
            first_logical_sector: 1024,
            alignment,
            alignment_offset,
            size: 1024 * 1024 * 1024,
            partition_name: "super".into(),
            flags: BlockDeviceFlags::empty(),
        }
    }

    #[test]
    fn sector_alignment() {
        let d = device(4096, 0);
        assert_eq!(MetadataBuilder::align_sector(&d, 0), 0);
        assert_eq!(MetadataBuilder::align_sector(&d, 1), 8);
        assert_eq!(MetadataBuilder::align_sector(&d, 8), 8);
        assert_eq!(MetadataBuilder::align_sector(&d, 9), 16);
    }

    #[test]
    fn sector_alignment_with_offset() {
        // Boundaries are at offset + n * alignment.
        let d = device(4096, 1024);
        assert_eq!(MetadataBuilder::align_sector(&d, 0), 2);
        assert_eq!(MetadataBuilder::align_sector(&d, 2), 2);
        assert_eq!(MetadataBuilder::align_sector(&d, 3), 10);
    }

    #[test]
    fn sector_alignment_disabled() {
        let d = device(0, 0);
        assert_eq!(MetadataBuilder::align_sector(&d, 7), 7);
    }

    #[test]
    fn first_logical_sector_placement() {
        let builder = MetadataBuilder::new(16 << 30, 65536, 2).unwrap();

        // 4096 reserved + 2 * (4096 geometry + 2 * 65536 slots), in sectors.
        assert_eq!(builder.block_devices()[0].first_logical_sector, 536);
    }
}
