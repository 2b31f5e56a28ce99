/*
 * SPDX-FileCopyrightText: 2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fs::File,
    io::{Cursor, Read, Seek, SeekFrom, Write},
};

use lpedit::format::{
    layout::MetadataBuilder,
    lp::{
        BlockDevice, BlockDeviceFlags, ErrorKind, Extent, ExtentType, Geometry, Header, Metadata,
        Partition, PartitionAttributes, PartitionGroup, PartitionGroupFlags,
    },
};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Offset of metadata slot 0 in an image.
const SLOT_0: usize = 12288;
/// Size of the 10.0 header.
const HEADER_SIZE: usize = 128;

/// Build a small layout on a 16 MiB device with two sized partitions.
fn small_metadata() -> Metadata {
    let mut builder = MetadataBuilder::new(16 * MIB, 65536, 2).unwrap();
    builder.add_group("apps", 8 * MIB).unwrap();
    builder
        .add_partition("system_a", "apps", PartitionAttributes::READONLY)
        .unwrap();
    builder
        .add_partition("userdata", "default", PartitionAttributes::empty())
        .unwrap();
    builder.resize_partition("system_a", 2 * MIB).unwrap();
    builder.resize_partition("userdata", MIB).unwrap();

    builder.export().unwrap()
}

/// Write a full image into a memory buffer sized to the block device.
fn write_image(metadata: &Metadata) -> Vec<u8> {
    let size = metadata.block_devices[0].size as usize;
    let mut cursor = Cursor::new(vec![0u8; size]);

    metadata.write(&mut cursor).unwrap();

    cursor.into_inner()
}

#[test]
fn round_trip() {
    let metadata = small_metadata();
    let image = write_image(&metadata);

    let parsed = Metadata::read(Cursor::new(&image)).unwrap();
    assert_eq!(parsed, metadata);

    // Both slots carry the same metadata.
    let parsed = Metadata::read_slot(Cursor::new(&image), 1).unwrap();
    assert_eq!(parsed, metadata);
}

#[test]
fn round_trip_zero_extents() {
    let metadata = Metadata {
        geometry: Geometry {
            metadata_max_size: 65536,
            metadata_slot_count: 2,
            logical_block_size: 4096,
        },
        header: Header::default(),
        partitions: vec![
            Partition {
                name: "scratch".into(),
                attributes: PartitionAttributes::empty(),
                first_extent_index: 0,
                num_extents: 2,
                group_index: 0,
            },
        ],
        extents: vec![
            Extent {
                num_sectors: 2048,
                extent_type: ExtentType::Linear {
                    start_sector: 2048,
                    block_device_index: 0,
                },
            },
            Extent {
                num_sectors: 100,
                extent_type: ExtentType::Zero,
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
            size: 16 * MIB,
            partition_name: "super".into(),
            flags: BlockDeviceFlags::empty(),
        }],
    };

    let image = write_image(&metadata);
    let parsed = Metadata::read(Cursor::new(&image)).unwrap();
    assert_eq!(parsed, metadata);
}

#[test]
fn geometry_corruption_recovers_from_backup() {
    let metadata = small_metadata();
    let mut image = write_image(&metadata);

    // Corrupt a payload byte inside the primary geometry only.
    image[4096 + 41] ^= 0xff;

    let parsed = Metadata::read(Cursor::new(&image)).unwrap();
    assert_eq!(parsed, metadata);

    // Zeroing the entire primary copy also recovers from the backup.
    let mut image = write_image(&metadata);
    image[4096..8192].fill(0);

    let parsed = Metadata::read(Cursor::new(&image)).unwrap();
    assert_eq!(parsed, metadata);
}

#[test]
fn geometry_corruption_in_both_copies_is_checksum_error() {
    let metadata = small_metadata();
    let mut image = write_image(&metadata);

    // Corrupt the same payload byte in the primary and backup copies. The
    // byte sits inside metadata_max_size, away from the magic and size
    // fields, so the structures still look like geometries.
    image[4096 + 41] ^= 0xff;
    image[8192 + 41] ^= 0xff;

    let err = Metadata::read(Cursor::new(&image)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Checksum);
}

#[test]
fn geometry_magic_corruption_in_both_copies_is_invalid_data() {
    let metadata = small_metadata();
    let mut image = write_image(&metadata);

    image[4096] ^= 0xff;
    image[8192] ^= 0xff;

    let err = Metadata::read(Cursor::new(&image)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidData);
}

#[test]
fn header_corruption_is_checksum_error() {
    let metadata = small_metadata();
    let mut image = write_image(&metadata);

    // Flip the high bit of a byte in the primary header of slot 0.
    image[SLOT_0 + 12] ^= 0x80;

    let err = Metadata::read_primary_slot(Cursor::new(&image), 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Checksum);

    // The backup copy at the device tail still verifies.
    let parsed = Metadata::read_backup_slot(Cursor::new(&image), 0).unwrap();
    assert_eq!(parsed, metadata);

    // And the fallback read path uses it transparently.
    let parsed = Metadata::read(Cursor::new(&image)).unwrap();
    assert_eq!(parsed, metadata);

    // Slot 1 is untouched.
    let parsed = Metadata::read_primary_slot(Cursor::new(&image), 1).unwrap();
    assert_eq!(parsed, metadata);
}

#[test]
fn tables_corruption_is_checksum_error() {
    let metadata = small_metadata();
    let mut image = write_image(&metadata);

    // First byte of the partitions table in slot 0.
    image[SLOT_0 + HEADER_SIZE] ^= 0x01;

    let err = Metadata::read_primary_slot(Cursor::new(&image), 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Checksum);

    let parsed = Metadata::read_backup_slot(Cursor::new(&image), 0).unwrap();
    assert_eq!(parsed, metadata);
}

#[test]
fn corruption_in_both_slot_copies_surfaces_backup_error() {
    let metadata = small_metadata();
    let mut image = write_image(&metadata);

    // Backup copy of slot 0 lives at the start of the tail reservation.
    let backup_0 = image.len() - 2 * 65536;

    // Give the two copies different failure modes so the surfaced error is
    // attributable: a checksum mismatch in the primary and a bad magic in
    // the backup.
    image[SLOT_0 + 12] ^= 0x80;
    image[backup_0] ^= 0xff;

    let err = Metadata::read_primary_slot(Cursor::new(&image), 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Checksum);

    let err = Metadata::read_backup_slot(Cursor::new(&image), 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidData);

    // With both copies damaged, the fallback read reports the error from the
    // backup attempt, the last copy tried.
    let err = Metadata::read_slot(Cursor::new(&image), 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidData);
}

#[test]
fn slots_are_independent() {
    let metadata = small_metadata();

    let mut other = metadata.clone();
    let mut builder = MetadataBuilder::from_metadata(&other).unwrap();
    builder.remove_partition("userdata");
    builder.resize_partition("system_a", 4 * MIB).unwrap();
    other = builder.export().unwrap();

    let size = metadata.block_devices[0].size as usize;
    let mut cursor = Cursor::new(vec![0u8; size]);

    metadata.write(&mut cursor).unwrap();
    other.write_slot(&mut cursor, 1).unwrap();

    let image = cursor.into_inner();

    let slot_0 = Metadata::read_slot(Cursor::new(&image), 0).unwrap();
    let slot_1 = Metadata::read_slot(Cursor::new(&image), 1).unwrap();

    assert_eq!(slot_0, metadata);
    assert_eq!(slot_1, other);
    assert_ne!(slot_0, slot_1);
}

#[test]
fn oversized_metadata_is_capacity_error() {
    // The smallest legal metadata_max_size is one sector. The 128-byte header
    // plus 8 partition entries plus the group and block device tables exceeds
    // 512 bytes.
    let mut builder = MetadataBuilder::new(16 * MIB, 512, 2).unwrap();
    for i in 0..8 {
        builder
            .add_partition(&format!("p{i}"), "default", PartitionAttributes::empty())
            .unwrap();
    }
    let metadata = builder.export().unwrap();

    let size = metadata.block_devices[0].size as usize;
    let mut cursor = Cursor::new(vec![0u8; size]);

    let err = metadata.write(&mut cursor).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capacity);

    // Nothing was written.
    assert!(cursor.into_inner().iter().all(|b| *b == 0));
}

#[test]
fn metadata_within_capacity_writes() {
    // Same layout as above, but with a single partition it fits.
    let mut builder = MetadataBuilder::new(16 * MIB, 512, 2).unwrap();
    builder
        .add_partition("p0", "default", PartitionAttributes::empty())
        .unwrap();
    let metadata = builder.export().unwrap();

    assert!(metadata.serialize().unwrap().len() <= 512);

    let image = write_image(&metadata);
    let parsed = Metadata::read(Cursor::new(&image)).unwrap();
    assert_eq!(parsed, metadata);
}

#[test]
fn foreign_entry_sizes_are_tolerated() {
    // Simulate metadata written by a tool whose group entries carry 8 extra
    // bytes at the end. The known prefix should decode and the extra bytes
    // should be ignored.
    let metadata = MetadataBuilder::new(16 * MIB, 65536, 2)
        .unwrap()
        .export()
        .unwrap();
    let mut image = write_image(&metadata);

    // Tables are: partitions (empty), extents (empty), groups (1 x 48 bytes),
    // block devices (1 x 64 bytes).
    let tables_start = SLOT_0 + HEADER_SIZE;
    let group = image[tables_start..tables_start + 48].to_vec();
    let device = image[tables_start + 48..tables_start + 112].to_vec();

    let mut new_tables = Vec::new();
    new_tables.extend_from_slice(&group);
    new_tables.extend_from_slice(&[0u8; 8]);
    new_tables.extend_from_slice(&device);

    let mut header = image[SLOT_0..SLOT_0 + HEADER_SIZE].to_vec();
    // tables_size
    header[44..48].copy_from_slice(&120u32.to_le_bytes());
    // tables_checksum
    header[48..80].copy_from_slice(&lpedit::crypto::sha256(&new_tables));
    // groups descriptor: offset 0, 1 entry of 56 bytes
    header[104..108].copy_from_slice(&0u32.to_le_bytes());
    header[108..112].copy_from_slice(&1u32.to_le_bytes());
    header[112..116].copy_from_slice(&56u32.to_le_bytes());
    // block devices descriptor: offset moves from 48 to 56
    header[116..120].copy_from_slice(&56u32.to_le_bytes());
    // header_checksum: zero, then hash the whole header
    header[12..44].fill(0);
    let digest = lpedit::crypto::sha256(&header);
    header[12..44].copy_from_slice(&digest);

    image[SLOT_0..SLOT_0 + HEADER_SIZE].copy_from_slice(&header);
    image[tables_start..tables_start + 120].copy_from_slice(&new_tables);

    let parsed = Metadata::read_primary_slot(Cursor::new(&image), 0).unwrap();
    assert_eq!(parsed.groups, metadata.groups);
    assert_eq!(parsed.block_devices, metadata.block_devices);
}

#[test]
fn legacy_geometry_at_offset_zero() {
    let metadata = small_metadata();
    let image = write_image(&metadata);

    // Move the geometry to offset 0 and wipe both copies at the normal
    // offsets, leaving the metadata slots in place.
    let mut legacy = image.clone();
    let geometry_block = image[4096..8192].to_vec();
    legacy[..4096].copy_from_slice(&geometry_block);
    legacy[4096..12288].fill(0);

    let parsed = Metadata::read(Cursor::new(&legacy)).unwrap();
    assert_eq!(parsed, metadata);
}

#[test]
fn build_write_read_16gib_device() {
    let mut builder = MetadataBuilder::new(16 * GIB, 65536, 2).unwrap();
    builder.add_group("main", 8 * GIB).unwrap();
    builder
        .add_partition("system_a", "main", PartitionAttributes::READONLY)
        .unwrap();
    builder
        .add_partition("vendor_a", "main", PartitionAttributes::READONLY)
        .unwrap();
    builder.resize_partition("system_a", 2 * GIB).unwrap();
    builder.resize_partition("vendor_a", 512 * MIB).unwrap();
    builder.compact_partitions().unwrap();

    let metadata = builder.export().unwrap();

    // Backed by a sparse temp file to keep the 16 GiB image cheap.
    let mut file = tempfile::tempfile().unwrap();
    file.set_len(16 * GIB).unwrap();

    metadata.write(&mut file).unwrap();

    let parsed = Metadata::read(&mut file).unwrap();
    assert_eq!(parsed, metadata);
    assert_eq!(parsed.header.major_version, 10);

    let names = parsed
        .partitions
        .iter()
        .map(|p| p.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, ["system_a", "vendor_a"]);

    let reloaded = MetadataBuilder::from_metadata(&parsed).unwrap();
    assert_eq!(reloaded.group_usage("main").unwrap(), 2 * GIB + 512 * MIB);

    // The backup copies live in the last metadata_max_size * slot_count bytes
    // of the device.
    let mut tail = vec![0u8; 2 * 65536];
    file.seek(SeekFrom::Start(16 * GIB - 2 * 65536)).unwrap();
    file.read_exact(&mut tail).unwrap();
    assert!(tail.iter().any(|b| *b != 0));
}

#[test]
fn truncated_image_is_invalid_data() {
    let err = Metadata::read(Cursor::new(vec![0u8; 1024])).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidData);
}

#[test]
fn sparse_file_round_trip_preserves_partition_table() {
    // Writing must only touch the geometry, slots, and backup slots; the rest
    // of a preexisting image must be left alone.
    let metadata = small_metadata();
    let size = metadata.block_devices[0].size as usize;

    let mut file: File = tempfile::tempfile().unwrap();
    file.set_len(size as u64).unwrap();

    // Plant a marker inside the first partition's data area.
    let extent_offset = match metadata.extents[0].extent_type {
        ExtentType::Linear { start_sector, .. } => start_sector * 512,
        ExtentType::Zero => unreachable!(),
    };
    file.seek(SeekFrom::Start(extent_offset)).unwrap();
    file.write_all(b"marker").unwrap();

    metadata.write(&mut file).unwrap();

    let mut buf = [0u8; 6];
    file.seek(SeekFrom::Start(extent_offset)).unwrap();
    file.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"marker");

    let parsed = Metadata::read(&mut file).unwrap();
    assert_eq!(parsed, metadata);
}
