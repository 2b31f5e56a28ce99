// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::format::{
    detect,
    layout::{MetadataBuilder, DEFAULT_GROUP},
    lp::{ExtentType, Metadata, PartitionAttributes, SECTOR_SIZE},
};

/// Description of a partition group in a layout TOML file.
#[derive(Debug, Deserialize, Serialize)]
struct GroupInfo {
    name: String,
    /// Maximum combined size of the group's partitions in bytes. 0 means
    /// unbounded.
    #[serde(default)]
    maximum_size: u64,
}

/// Description of a partition in a layout TOML file.
#[derive(Debug, Deserialize, Serialize)]
struct PartitionInfo {
    name: String,
    #[serde(default = "default_group")]
    group: String,
    /// Size in bytes. The stored size is truncated to whole sectors.
    #[serde(default)]
    size: u64,
    #[serde(default)]
    readonly: bool,
}

fn default_group() -> String {
    DEFAULT_GROUP.to_owned()
}

/// Description of a complete layout in a TOML file.
#[derive(Debug, Deserialize, Serialize)]
struct LayoutInfo {
    device_size: u64,
    metadata_max_size: u32,
    metadata_slot_count: u32,
    #[serde(default)]
    groups: Vec<GroupInfo>,
    #[serde(default)]
    partitions: Vec<PartitionInfo>,
}

impl LayoutInfo {
    fn from_builder(builder: &MetadataBuilder) -> Result<Self> {
        let device = builder
            .block_devices()
            .first()
            .context("Metadata has no block devices")?;

        Ok(Self {
            device_size: device.size,
            metadata_max_size: builder.geometry().metadata_max_size,
            metadata_slot_count: builder.geometry().metadata_slot_count,
            groups: builder
                .groups()
                .iter()
                .map(|g| GroupInfo {
                    name: g.name.clone(),
                    maximum_size: g.maximum_size,
                })
                .collect(),
            partitions: builder
                .partitions()
                .iter()
                .map(|p| {
                    Ok(PartitionInfo {
                        name: p.name.clone(),
                        group: p.group_name.clone(),
                        size: p.size()?,
                        readonly: p.attributes.contains(PartitionAttributes::READONLY),
                    })
                })
                .collect::<Result<_>>()?,
        })
    }
}

fn read_info(path: &Path) -> Result<LayoutInfo> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read layout info TOML: {path:?}"))?;
    let info = toml::de::from_str(&data)
        .with_context(|| format!("Failed to parse layout info TOML: {path:?}"))?;

    Ok(info)
}

fn write_info(path: &Path, info: &LayoutInfo) -> Result<()> {
    let data = toml::ser::to_string_pretty(info)
        .context("Failed to serialize layout info TOML")?;
    fs::write(path, data)
        .with_context(|| format!("Failed to write layout info TOML: {path:?}"))?;

    Ok(())
}

fn read_image(path: &Path, slot: u32) -> Result<Metadata> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open LP image for reading: {path:?}"))?;

    Metadata::read_slot(file, slot)
        .with_context(|| format!("Failed to parse LP image metadata: {path:?}"))
}

/// Read the metadata from slot 0, apply the edit, and write every slot back
/// with the resulting metadata.
fn edit_image(path: &Path, edit: impl FnOnce(&mut MetadataBuilder) -> Result<()>) -> Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to open LP image for editing: {path:?}"))?;

    let metadata = Metadata::read(&mut file)
        .with_context(|| format!("Failed to parse LP image metadata: {path:?}"))?;
    let mut builder = MetadataBuilder::from_metadata(&metadata)
        .context("Failed to load metadata into the editor")?;

    edit(&mut builder)?;

    let metadata = builder.export().context("Failed to export metadata")?;

    metadata
        .write(&mut file)
        .with_context(|| format!("Failed to write LP image metadata: {path:?}"))?;

    Ok(())
}

fn display_metadata(metadata: &Metadata, quiet: bool) {
    if !quiet {
        println!("{metadata:#?}");
    }
}

pub fn info_subcommand(cli: &InfoCli) -> Result<()> {
    let metadata = read_image(&cli.input, cli.slot)?;

    display_metadata(&metadata, cli.quiet);

    if let Some(path) = &cli.output_info {
        let builder = MetadataBuilder::from_metadata(&metadata)
            .context("Failed to load metadata into the editor")?;
        write_info(path, &LayoutInfo::from_builder(&builder)?)?;
    }

    Ok(())
}

pub fn create_subcommand(cli: &CreateCli) -> Result<()> {
    let info = read_info(&cli.input_info)?;

    let mut builder = MetadataBuilder::new(
        info.device_size,
        info.metadata_max_size,
        info.metadata_slot_count,
    )
    .context("Failed to create metadata layout")?;

    for group in &info.groups {
        builder
            .add_group(&group.name, group.maximum_size)
            .with_context(|| format!("Failed to add group: {}", group.name))?;
    }

    for partition in &info.partitions {
        let mut attributes = PartitionAttributes::empty();
        if partition.readonly {
            attributes |= PartitionAttributes::READONLY;
        }

        builder
            .add_partition(&partition.name, &partition.group, attributes)
            .with_context(|| format!("Failed to add partition: {}", partition.name))?;

        if partition.size > 0 {
            builder
                .resize_partition(&partition.name, partition.size)
                .with_context(|| format!("Failed to size partition: {}", partition.name))?;
        }
    }

    let metadata = builder.export().context("Failed to export metadata")?;

    let file = File::create(&cli.output)
        .with_context(|| format!("Failed to open LP image for writing: {:?}", cli.output))?;
    file.set_len(info.device_size)
        .with_context(|| format!("Failed to truncate file: {:?}", cli.output))?;

    metadata
        .write(&file)
        .with_context(|| format!("Failed to write LP image metadata: {:?}", cli.output))?;

    display_metadata(&metadata, cli.quiet);

    Ok(())
}

pub fn add_subcommand(cli: &AddCli) -> Result<()> {
    edit_image(&cli.image, |builder| {
        let mut attributes = PartitionAttributes::empty();
        if cli.readonly {
            attributes |= PartitionAttributes::READONLY;
        }

        builder
            .add_partition(&cli.partition, &cli.group, attributes)
            .with_context(|| format!("Failed to add partition: {}", cli.partition))?;

        if cli.size > 0 {
            builder
                .resize_partition(&cli.partition, cli.size)
                .with_context(|| format!("Failed to size partition: {}", cli.partition))?;
        }

        Ok(())
    })
}

pub fn remove_subcommand(cli: &RemoveCli) -> Result<()> {
    edit_image(&cli.image, |builder| {
        builder.remove_partition(&cli.partition);
        Ok(())
    })
}

pub fn resize_subcommand(cli: &ResizeCli) -> Result<()> {
    edit_image(&cli.image, |builder| {
        builder
            .resize_partition(&cli.partition, cli.size)
            .with_context(|| format!("Failed to resize partition: {}", cli.partition))
    })
}

pub fn resize_group_subcommand(cli: &ResizeGroupCli) -> Result<()> {
    edit_image(&cli.image, |builder| {
        builder
            .resize_group(&cli.group, cli.size)
            .with_context(|| format!("Failed to resize group: {}", cli.group))
    })
}

pub fn compact_subcommand(cli: &CompactCli) -> Result<()> {
    edit_image(&cli.image, |builder| {
        builder
            .compact_partitions()
            .context("Failed to compact partitions")
    })
}

pub fn detect_subcommand(cli: &DetectCli) -> Result<()> {
    let mut file = File::open(&cli.input)
        .with_context(|| format!("Failed to open image for reading: {:?}", cli.input))?;

    let offset = if let Some(name) = &cli.partition {
        let metadata = Metadata::read(&mut file)
            .with_context(|| format!("Failed to parse LP image metadata: {:?}", cli.input))?;

        let partition = metadata
            .partitions
            .iter()
            .find(|p| p.name == *name)
            .with_context(|| format!("Partition not found: {name}"))?;

        if partition.num_extents == 0 {
            bail!("Partition has no extents: {name}");
        }

        let extent = metadata
            .extents
            .get(partition.first_extent_index as usize)
            .with_context(|| format!("Partition extent index out of range: {name}"))?;

        match extent.extent_type {
            ExtentType::Linear { start_sector, .. } => start_sector * u64::from(SECTOR_SIZE),
            ExtentType::Zero => bail!("Partition starts with a zero extent: {name}"),
        }
    } else {
        cli.offset
    };

    let (fs_type, size) = detect::detect(&mut file, offset)
        .with_context(|| format!("Failed to probe filesystem at offset {offset}"))?;

    println!("{fs_type} {size}");

    Ok(())
}

/// Display LP image metadata.
#[derive(Debug, Parser)]
pub struct InfoCli {
    /// Path to input LP image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// The LP metadata slot to read.
    #[arg(short, long, default_value_t = 0)]
    slot: u32,

    /// Path to output layout info TOML.
    #[arg(long, value_name = "FILE", value_parser)]
    output_info: Option<PathBuf>,

    /// Don't print LP metadata information.
    #[arg(short, long)]
    quiet: bool,
}

/// Create a new LP image from a layout description.
///
/// The layout info TOML lists the device size, metadata geometry, groups, and
/// partitions. Partition data is not written, only metadata; every metadata
/// slot receives an identical copy.
#[derive(Debug, Parser)]
pub struct CreateCli {
    /// Path to output LP image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Path to input layout info TOML.
    #[arg(long, value_name = "FILE", value_parser, default_value = "lp.toml")]
    input_info: PathBuf,

    /// Don't print LP metadata information.
    #[arg(short, long)]
    quiet: bool,
}

/// Add a partition to an LP image in place.
///
/// The metadata is loaded from slot 0 and every slot is rewritten with the
/// edited metadata.
#[derive(Debug, Parser)]
pub struct AddCli {
    /// Path to LP image to edit.
    #[arg(short, long, value_name = "FILE", value_parser)]
    image: PathBuf,

    /// Name of the partition to add.
    #[arg(short, long)]
    partition: String,

    /// Name of the group to add the partition to.
    #[arg(short, long, default_value = DEFAULT_GROUP)]
    group: String,

    /// Initial partition size in bytes.
    #[arg(short, long, default_value_t = 0)]
    size: u64,

    /// Mark the partition as read-only.
    #[arg(long)]
    readonly: bool,
}

/// Remove a partition from an LP image in place.
///
/// Removing a partition that does not exist is not an error.
#[derive(Debug, Parser)]
pub struct RemoveCli {
    /// Path to LP image to edit.
    #[arg(short, long, value_name = "FILE", value_parser)]
    image: PathBuf,

    /// Name of the partition to remove.
    #[arg(short, long)]
    partition: String,
}

/// Resize a partition in an LP image in place.
///
/// Growing allocates new extents from the free regions on the block device.
/// Shrinking truncates the extent list. The partition data is not moved.
#[derive(Debug, Parser)]
pub struct ResizeCli {
    /// Path to LP image to edit.
    #[arg(short, long, value_name = "FILE", value_parser)]
    image: PathBuf,

    /// Name of the partition to resize.
    #[arg(short, long)]
    partition: String,

    /// New size in bytes. The stored size is truncated to whole sectors.
    #[arg(short, long)]
    size: u64,
}

/// Change a group's maximum size in an LP image in place.
#[derive(Debug, Parser)]
pub struct ResizeGroupCli {
    /// Path to LP image to edit.
    #[arg(short, long, value_name = "FILE", value_parser)]
    image: PathBuf,

    /// Name of the group to resize.
    #[arg(short, long)]
    group: String,

    /// New maximum size in bytes. 0 makes the group unbounded.
    #[arg(short, long)]
    size: u64,
}

/// Repack every partition into a single contiguous extent.
///
/// Partitions are placed in their current order starting at the first logical
/// sector. Note that this only rewrites the metadata; partition data is not
/// moved, so this is only safe on images whose partition contents have not
/// been written yet or are migrated separately.
#[derive(Debug, Parser)]
pub struct CompactCli {
    /// Path to LP image to edit.
    #[arg(short, long, value_name = "FILE", value_parser)]
    image: PathBuf,
}

/// Identify the filesystem stored in a partition or at an offset.
///
/// Prints the filesystem type and the size recorded in its superblock.
#[derive(Debug, Parser)]
pub struct DetectCli {
    /// Path to input image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Name of the partition to probe.
    #[arg(short, long, conflicts_with = "offset")]
    partition: Option<String>,

    /// Absolute byte offset to probe.
    #[arg(long, default_value_t = 0)]
    offset: u64,
}
