// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Filesystem identification by superblock magic. Given a stream and the
//! absolute offset of a partition's data, this reports the filesystem type
//! and the filesystem's own idea of its size in bytes, which is useful for
//! sizing partitions to their contents.

use std::{
    fmt,
    io::{self, Read, Seek, SeekFrom},
};

use serde::{Deserialize, Serialize};

use crate::stream::ReadFixedSizeExt;

/// SquashFS superblock magic at offset 0.
const SQUASHFS_MAGIC: u32 = 0x73717368;
/// EROFS superblock magic at offset 1024.
const EROFS_MAGIC: u32 = 0xE0F5E1E2;
/// EXT2/3/4 superblock magic at offset 1024 + 0x38.
const EXT_MAGIC: u16 = 0xEF53;
/// F2FS superblock magic.
const F2FS_MAGIC: u32 = 0xF2F52010;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum FsType {
    Ext4,
    Erofs,
    F2fs,
    Squashfs,
    Fat,
    Unknown,
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ext4 => "ext4",
            Self::Erofs => "erofs",
            Self::F2fs => "f2fs",
            Self::Squashfs => "squashfs",
            Self::Fat => "vfat",
            Self::Unknown => "unknown",
        };

        f.write_str(name)
    }
}

fn u16_at(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(buf[offset..offset + 2].try_into().unwrap())
}

fn u32_at(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn u64_at(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

/// Read a fixed-size block at an absolute offset, returning `None` when the
/// stream ends before the block does.
fn read_block<const N: usize>(
    mut reader: impl Read + Seek,
    offset: u64,
) -> io::Result<Option<[u8; N]>> {
    reader.seek(SeekFrom::Start(offset))?;

    match reader.read_array_exact::<N>() {
        Ok(buf) => Ok(Some(buf)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

/// Identify the filesystem stored at the specified absolute offset and return
/// its type along with the size in bytes recorded in its superblock. Unknown
/// filesystems and VFAT (whose boot sector does not record a reliable size)
/// report a size of 0.
pub fn detect(mut reader: impl Read + Seek, offset: u64) -> io::Result<(FsType, u64)> {
    // SquashFS, F2FS, and the VFAT/MBR boot signature live in the first
    // sector; the EROFS and EXT superblocks sit 1024 bytes in.
    let head: Option<[u8; 512]> = read_block(&mut reader, offset)?;
    let superblock: Option<[u8; 128]> = read_block(&mut reader, offset + 1024)?;

    if let Some(head) = &head {
        if u32_at(head, 0) == SQUASHFS_MAGIC {
            return Ok((FsType::Squashfs, u64_at(head, 40)));
        }
    }

    if let Some(sb) = &superblock {
        if u32_at(sb, 0) == EROFS_MAGIC {
            let blocks = u64::from(u32_at(sb, 44));
            let log2_blksz = sb[12];
            let shift = if log2_blksz == 0 { 12 } else { u32::from(log2_blksz) };

            return Ok((FsType::Erofs, blocks << shift));
        }

        if u16_at(sb, 0x38) == EXT_MAGIC {
            let block_count = u64::from(u32_at(sb, 4));
            let block_size = 1024u64 << u32_at(sb, 0x18);

            return Ok((FsType::Ext4, block_count * block_size));
        }
    }

    if let Some(head) = &head {
        if u32_at(head, 0) == F2FS_MAGIC {
            return Ok((FsType::F2fs, u64::from(u32_at(head, 0x48)) * 4096));
        }

        if head[510] == 0x55 && head[511] == 0xAA {
            return Ok((FsType::Fat, 0));
        }
    }

    Ok((FsType::Unknown, 0))
}
