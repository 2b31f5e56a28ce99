/*
 * SPDX-FileCopyrightText: 2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use lpedit::format::{
    layout::{FreeRegion, MetadataBuilder},
    lp::{
        BlockDevice, BlockDeviceFlags, ErrorKind, Extent, ExtentType, Geometry, Header, Metadata,
        Partition, PartitionAttributes, PartitionGroup, PartitionGroupFlags,
    },
};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

fn builder_1gib() -> MetadataBuilder {
    MetadataBuilder::new(GIB, 65536, 2).unwrap()
}

/// Collect the (start, length) ranges of every linear extent.
fn linear_ranges(builder: &MetadataBuilder) -> Vec<(u64, u64)> {
    let mut ranges = vec![];

    for partition in builder.partitions() {
        for extent in &partition.extents {
            if let ExtentType::Linear { start_sector, .. } = extent.extent_type {
                ranges.push((start_sector, extent.num_sectors));
            }
        }
    }

    ranges
}

fn assert_free_regions_consistent(builder: &MetadataBuilder) {
    let regions = builder.free_regions().unwrap();

    // Sorted and pairwise disjoint.
    for window in regions.windows(2) {
        let (a, b) = (window[0], window[1]);
        assert!(a.start_sector + a.num_sectors <= b.start_sector, "{a:?} overlaps {b:?}");
    }

    // Disjoint from every allocated range.
    for region in &regions {
        for (start, len) in linear_ranges(builder) {
            let no_overlap = region.start_sector + region.num_sectors <= start
                || start + len <= region.start_sector;
            assert!(no_overlap, "{region:?} overlaps extent at {start}+{len}");
        }
    }
}

#[test]
fn add_and_remove_partitions() {
    let mut builder = builder_1gib();

    builder
        .add_partition("system_a", "default", PartitionAttributes::READONLY)
        .unwrap();

    let err = builder
        .add_partition("system_a", "default", PartitionAttributes::empty())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    let err = builder
        .add_partition("vendor_a", "missing", PartitionAttributes::empty())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    builder.remove_partition("system_a");
    assert!(builder.partition("system_a").is_none());

    // Removal is idempotent.
    builder.remove_partition("system_a");
}

#[test]
fn group_lifecycle() {
    let mut builder = builder_1gib();

    builder.add_group("apps", 64 * MIB).unwrap();

    let err = builder.add_group("apps", 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    let err = builder.remove_group("default").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invariant);

    builder
        .add_partition("app_a", "apps", PartitionAttributes::empty())
        .unwrap();

    let err = builder.remove_group("apps").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invariant);

    builder.remove_partition("app_a");
    builder.remove_group("apps").unwrap();
    assert!(builder.group("apps").is_none());
}

#[test]
fn group_quota_enforcement() {
    let mut builder = MetadataBuilder::new(4 * GIB, 65536, 2).unwrap();

    builder.add_group("g1", GIB).unwrap();
    builder
        .add_partition("p1", "g1", PartitionAttributes::empty())
        .unwrap();
    builder.resize_partition("p1", 900 * MIB).unwrap();

    // Growing past the group limit fails and changes nothing.
    let err = builder.resize_partition("p1", GIB + 100 * MIB).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capacity);
    assert_eq!(builder.partition("p1").unwrap().size().unwrap(), 900 * MIB);

    // Shrinking the group limit below the current usage fails.
    let err = builder.resize_group("g1", 800 * MIB).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capacity);
    assert_eq!(builder.group("g1").unwrap().maximum_size, GIB);

    // Raising it and making it unbounded both work.
    builder.resize_group("g1", 2 * GIB).unwrap();
    builder.resize_partition("p1", GIB + 100 * MIB).unwrap();
    builder.resize_group("g1", 0).unwrap();
    builder.resize_partition("p1", 2 * GIB).unwrap();
}

#[test]
fn grow_appends_and_keeps_existing_extents() {
    let mut builder = builder_1gib();

    builder
        .add_partition("system_a", "default", PartitionAttributes::empty())
        .unwrap();
    builder.resize_partition("system_a", 8 * MIB).unwrap();

    let before = builder.partition("system_a").unwrap().extents.clone();

    builder.resize_partition("system_a", 32 * MIB).unwrap();

    let after = &builder.partition("system_a").unwrap().extents;
    assert_eq!(&after[..before.len()], &before[..]);
    assert_eq!(
        builder.partition("system_a").unwrap().size().unwrap(),
        32 * MIB
    );

    assert_free_regions_consistent(&builder);
}

#[test]
fn shrink_truncates_extents() {
    let mut builder = builder_1gib();

    builder
        .add_partition("a", "default", PartitionAttributes::empty())
        .unwrap();
    builder
        .add_partition("b", "default", PartitionAttributes::empty())
        .unwrap();

    // Interleave the allocations so that "a" ends up with two extents.
    builder.resize_partition("a", 4 * MIB).unwrap();
    builder.resize_partition("b", 4 * MIB).unwrap();
    builder.resize_partition("a", 12 * MIB).unwrap();

    let extents = &builder.partition("a").unwrap().extents;
    assert!(extents.len() >= 2);

    // Shrink to a size that cuts through the second extent.
    builder.resize_partition("a", 6 * MIB).unwrap();

    let partition = builder.partition("a").unwrap();
    assert_eq!(partition.size().unwrap(), 6 * MIB);
    assert_eq!(partition.extents.len(), 2);
    assert_eq!(partition.extents[0].num_sectors, 4 * MIB / 512);
    assert_eq!(partition.extents[1].num_sectors, 2 * MIB / 512);

    // Shrinking to zero drops every extent.
    builder.resize_partition("a", 0).unwrap();
    assert!(builder.partition("a").unwrap().extents.is_empty());

    assert_free_regions_consistent(&builder);
}

#[test]
fn resize_to_same_size_is_noop() {
    let mut builder = builder_1gib();

    builder
        .add_partition("a", "default", PartitionAttributes::empty())
        .unwrap();
    builder.resize_partition("a", 4 * MIB).unwrap();

    let before = builder.partition("a").unwrap().extents.clone();

    // Equal size, and a size that truncates to the same sector count.
    builder.resize_partition("a", 4 * MIB).unwrap();
    builder.resize_partition("a", 4 * MIB + 511).unwrap();

    assert_eq!(builder.partition("a").unwrap().extents, before);
}

#[test]
fn grow_fails_when_device_is_full() {
    let mut builder = MetadataBuilder::new(16 * MIB, 65536, 2).unwrap();

    builder
        .add_partition("a", "default", PartitionAttributes::empty())
        .unwrap();

    let err = builder.resize_partition("a", GIB).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capacity);
    assert_eq!(builder.partition("a").unwrap().size().unwrap(), 0);
}

#[test]
fn grow_reuses_freed_holes() {
    let mut builder = builder_1gib();

    builder
        .add_partition("a", "default", PartitionAttributes::empty())
        .unwrap();
    builder
        .add_partition("b", "default", PartitionAttributes::empty())
        .unwrap();
    builder.resize_partition("a", 4 * MIB).unwrap();
    builder.resize_partition("b", 4 * MIB).unwrap();

    // Freeing "a" leaves a hole before "b" that a new allocation must reuse.
    builder.remove_partition("a");

    builder
        .add_partition("c", "default", PartitionAttributes::empty())
        .unwrap();
    builder.resize_partition("c", 2 * MIB).unwrap();

    let c_start = match builder.partition("c").unwrap().extents[0].extent_type {
        ExtentType::Linear { start_sector, .. } => start_sector,
        ExtentType::Zero => unreachable!(),
    };
    let b_start = match builder.partition("b").unwrap().extents[0].extent_type {
        ExtentType::Linear { start_sector, .. } => start_sector,
        ExtentType::Zero => unreachable!(),
    };

    assert!(c_start < b_start);
    assert_free_regions_consistent(&builder);
}

#[test]
fn alignment_law_with_offset() {
    // A device whose super partition starts 512 bytes into an aligned unit.
    let metadata = Metadata {
        geometry: Geometry {
            metadata_max_size: 65536,
            metadata_slot_count: 2,
            logical_block_size: 4096,
        },
        header: Header::default(),
        partitions: vec![],
        extents: vec![],
        groups: vec![PartitionGroup {
            name: "default".into(),
            flags: PartitionGroupFlags::empty(),
            maximum_size: 0,
        }],
        block_devices: vec![BlockDevice {
            first_logical_sector: 2048,
            alignment: 4096,
            alignment_offset: 512,
            size: GIB,
            partition_name: "super".into(),
            flags: BlockDeviceFlags::empty(),
        }],
    };

    let mut builder = MetadataBuilder::from_metadata(&metadata).unwrap();
    builder
        .add_partition("a", "default", PartitionAttributes::empty())
        .unwrap();
    builder.resize_partition("a", 10 * MIB).unwrap();
    builder
        .add_partition("b", "default", PartitionAttributes::empty())
        .unwrap();
    builder.resize_partition("b", 3 * MIB).unwrap();

    for partition in builder.partitions() {
        for extent in &partition.extents {
            if let ExtentType::Linear { start_sector, .. } = extent.extent_type {
                assert_eq!((start_sector * 512 - 512) % 4096, 0);
            }
        }
    }
}

#[test]
fn free_regions_tolerate_overlapping_extents() {
    // Overlapping extents can exist in metadata produced by other tools. The
    // free region sweep must clamp rather than underflow.
    let metadata = Metadata {
        geometry: Geometry {
            metadata_max_size: 65536,
            metadata_slot_count: 2,
            logical_block_size: 4096,
        },
        header: Header::default(),
        partitions: vec![
            Partition {
                name: "a".into(),
                attributes: PartitionAttributes::empty(),
                first_extent_index: 0,
                num_extents: 1,
                group_index: 0,
            },
            Partition {
                name: "b".into(),
                attributes: PartitionAttributes::empty(),
                first_extent_index: 1,
                num_extents: 1,
                group_index: 0,
            },
        ],
        extents: vec![
            Extent {
                num_sectors: 4096,
                extent_type: ExtentType::Linear {
                    start_sector: 2048,
                    block_device_index: 0,
                },
            },
            // Fully contained within the first extent.
            Extent {
                num_sectors: 1024,
                extent_type: ExtentType::Linear {
                    start_sector: 3072,
                    block_device_index: 0,
                },
            },
        ],
        groups: vec![PartitionGroup {
            name: "default".into(),
            flags: PartitionGroupFlags::empty(),
            maximum_size: 0,
        }],
        block_devices: vec![BlockDevice {
            first_logical_sector: 2048,
            alignment: 4096,
            alignment_offset: 0,
            size: GIB,
            partition_name: "super".into(),
            flags: BlockDeviceFlags::empty(),
        }],
    };

    let builder = MetadataBuilder::from_metadata(&metadata).unwrap();
    let regions = builder.free_regions().unwrap();

    let usable_end = (GIB - 2 * 65536) / 512;
    assert_eq!(
        regions,
        [FreeRegion {
            start_sector: 2048 + 4096,
            num_sectors: usable_end - (2048 + 4096),
        }]
    );
}

#[test]
fn compaction_packs_partitions_in_order() {
    let mut builder = builder_1gib();

    for name in ["a", "b", "c"] {
        builder
            .add_partition(name, "default", PartitionAttributes::empty())
            .unwrap();
    }
    builder.resize_partition("a", 4 * MIB).unwrap();
    builder.resize_partition("b", 4 * MIB).unwrap();
    builder.resize_partition("c", 4 * MIB).unwrap();

    // Fragment the layout, then put it back together.
    builder.remove_partition("b");
    builder.resize_partition("c", 12 * MIB).unwrap();
    assert!(builder.partition("c").unwrap().extents.len() > 1);

    builder.compact_partitions().unwrap();

    let mut last_start = 0;

    for partition in builder.partitions() {
        assert_eq!(partition.extents.len(), 1);

        match partition.extents[0].extent_type {
            ExtentType::Linear { start_sector, .. } => {
                assert!(start_sector >= last_start);
                last_start = start_sector;
            }
            ExtentType::Zero => panic!("compaction must produce linear extents"),
        }
    }

    assert_free_regions_consistent(&builder);
}

#[test]
fn compaction_rejects_oversized_layouts() {
    let mut builder = MetadataBuilder::new(64 * MIB, 65536, 2).unwrap();

    builder
        .add_partition("a", "default", PartitionAttributes::empty())
        .unwrap();
    builder.resize_partition("a", 32 * MIB).unwrap();
    builder
        .add_partition("b", "default", PartitionAttributes::empty())
        .unwrap();
    builder.resize_partition("b", 16 * MIB).unwrap();

    let before_a = builder.partition("a").unwrap().extents.clone();

    // Shrink the device so the compacted layout no longer fits, bypassing the
    // editor's own shrink guard by rebuilding from exported metadata.
    let mut metadata = builder.export().unwrap();
    metadata.block_devices[0].size = 16 * MIB;

    let mut shrunk = MetadataBuilder::from_metadata(&metadata).unwrap();
    let err = shrunk.compact_partitions().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capacity);

    // Nothing was modified.
    assert_eq!(shrunk.partition("a").unwrap().extents, before_a);
}

#[test]
fn device_resize_bounds() {
    let metadata = Metadata {
        geometry: Geometry {
            metadata_max_size: 65536,
            metadata_slot_count: 2,
            logical_block_size: 4096,
        },
        header: Header::default(),
        partitions: vec![Partition {
            name: "p1".into(),
            attributes: PartitionAttributes::empty(),
            first_extent_index: 0,
            num_extents: 1,
            group_index: 0,
        }],
        extents: vec![Extent {
            num_sectors: 1024,
            extent_type: ExtentType::Linear {
                start_sector: 2048,
                block_device_index: 0,
            },
        }],
        groups: vec![PartitionGroup {
            name: "default".into(),
            flags: PartitionGroupFlags::empty(),
            maximum_size: 0,
        }],
        block_devices: vec![BlockDevice {
            first_logical_sector: 2048,
            alignment: 4096,
            alignment_offset: 0,
            size: GIB,
            partition_name: "super".into(),
            flags: BlockDeviceFlags::empty(),
        }],
    };

    let mut builder = MetadataBuilder::from_metadata(&metadata).unwrap();

    // The last allocated byte is (2048 + 1024) * 512 = 1.5 MiB, so shrinking
    // to 512 MiB is fine but 1 MiB is not.
    builder.resize_block_device(512 * MIB).unwrap();
    assert_eq!(builder.block_devices()[0].size, 512 * MIB);

    let err = builder.resize_block_device(MIB).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capacity);
    assert_eq!(builder.block_devices()[0].size, 512 * MIB);
}

#[test]
fn reorder_drops_unnamed_partitions() {
    let mut builder = builder_1gib();

    for name in ["a", "b", "c"] {
        builder
            .add_partition(name, "default", PartitionAttributes::empty())
            .unwrap();
    }

    builder.reorder_partitions(&["c", "missing", "a"]);

    let names = builder
        .partitions()
        .iter()
        .map(|p| p.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, ["c", "a"]);
}

#[test]
fn export_rebuilds_extent_indices() {
    let mut builder = builder_1gib();

    builder.add_group("apps", 0).unwrap();
    builder
        .add_partition("a", "default", PartitionAttributes::empty())
        .unwrap();
    builder
        .add_partition("b", "apps", PartitionAttributes::READONLY)
        .unwrap();
    builder.resize_partition("a", 4 * MIB).unwrap();
    builder.resize_partition("b", 2 * MIB).unwrap();

    let metadata = builder.export().unwrap();

    assert_eq!(metadata.groups.len(), 2);
    assert_eq!(metadata.partitions.len(), 2);

    let a = &metadata.partitions[0];
    let b = &metadata.partitions[1];

    assert_eq!(a.first_extent_index, 0);
    assert_eq!(b.first_extent_index, a.num_extents);
    assert_eq!(
        metadata.extents.len() as u32,
        a.num_extents + b.num_extents
    );
    assert_eq!(metadata.groups[a.group_index as usize].name, "default");
    assert_eq!(metadata.groups[b.group_index as usize].name, "apps");

    // An editor rebuilt from the export sees the same layout.
    let reloaded = MetadataBuilder::from_metadata(&metadata).unwrap();
    assert_eq!(reloaded.partitions(), builder.partitions());
}
