//! Per-format processors that report an artifact's guest-visible virtual size
//! by reading its header.

use crate::error::ImageError;
use secstor_core::ImageFormat;
use std::io::{Read, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

const SECTOR_SIZE: u64 = 512;
const QCOW2_MAGIC: &[u8; 4] = b"QFI\xfb";
const QCOW2_SIZE_OFFSET: usize = 24;
const VHD_COOKIE: &[u8; 8] = b"conectix";
const VHD_FOOTER_LEN: u64 = 512;
const VHD_CURRENT_SIZE_OFFSET: usize = 48;
const VMDK_MAGIC: &[u8; 4] = b"KDMV";
const VMDK_CAPACITY_OFFSET: usize = 12;
const VMDK_DESCRIPTOR_LIMIT: u64 = 64 * 1024;

/// What a processor learned about one artifact on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatInfo {
    pub format: ImageFormat,
    pub filename: String,
    /// Bytes on disk.
    pub size: u64,
    pub virtual_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processor {
    Qcow2,
    Vhd,
    Vmdk,
    Ova,
    Raw,
}

impl Processor {
    pub fn for_format(format: ImageFormat) -> Option<Self> {
        match format {
            ImageFormat::Qcow2 => Some(Processor::Qcow2),
            ImageFormat::Vhd => Some(Processor::Vhd),
            ImageFormat::Vmdk => Some(Processor::Vmdk),
            ImageFormat::Ova => Some(Processor::Ova),
            ImageFormat::Raw => Some(Processor::Raw),
            _ => None,
        }
    }

    pub fn format(&self) -> ImageFormat {
        match self {
            Processor::Qcow2 => ImageFormat::Qcow2,
            Processor::Vhd => ImageFormat::Vhd,
            Processor::Vmdk => ImageFormat::Vmdk,
            Processor::Ova => ImageFormat::Ova,
            Processor::Raw => ImageFormat::Raw,
        }
    }

    /// Parses the header of `path`. Fails on a missing, truncated or
    /// foreign file; see [`virtual_size_or_len`] for the lenient variant.
    pub async fn virtual_size(&self, path: &Path) -> Result<u64, ImageError> {
        match self {
            Processor::Qcow2 => qcow2_virtual_size(path).await,
            Processor::Vhd => vhd_virtual_size(path).await,
            Processor::Vmdk => vmdk_virtual_size(path).await,
            Processor::Ova => ova_virtual_size(path.to_path_buf()).await,
            Processor::Raw => Ok(fs::metadata(path).await?.len()),
        }
    }

    /// Looks for `<name>.<ext>` in `dir`. Returns `None` when no such file
    /// exists; a header that cannot be parsed falls back to the file length.
    pub async fn process(&self, dir: &Path, name: &str) -> Result<Option<FormatInfo>, ImageError> {
        let filename = format!("{}.{}", name, self.format().file_extension());
        let path = dir.join(&filename);

        let meta = match fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("{:?} does not exist, not a {} image", path, self.format());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let size = meta.len();
        let virtual_size = match self.virtual_size(&path).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(
                    "Unable to get virtual size of {:?}, using file length {}: {}",
                    path,
                    size,
                    e
                );
                size
            }
        };

        Ok(Some(FormatInfo {
            format: self.format(),
            filename,
            size,
            virtual_size,
        }))
    }
}

/// Best-effort virtual size: the processor's answer when there is one,
/// the file length otherwise. Only fails when the file itself is unreadable.
pub async fn virtual_size_or_len(
    path: &Path,
    format: Option<ImageFormat>,
) -> Result<u64, ImageError> {
    let len = fs::metadata(path).await?.len();
    let Some(processor) = format.and_then(Processor::for_format) else {
        return Ok(len);
    };
    match processor.virtual_size(path).await {
        Ok(size) => Ok(size),
        Err(e) => {
            tracing::warn!("Falling back to file length for {:?}: {}", path, e);
            Ok(len)
        }
    }
}

async fn read_at(path: &Path, offset: SeekFrom, len: usize) -> Result<Vec<u8>, ImageError> {
    let mut file = fs::File::open(path).await?;
    file.seek(offset).await?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)
        .await
        .map_err(|e| ImageError::InvalidHeader(format!("{:?}: {}", path, e)))?;
    Ok(buf)
}

fn be_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}

fn le_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

async fn qcow2_virtual_size(path: &Path) -> Result<u64, ImageError> {
    let header = read_at(path, SeekFrom::Start(0), QCOW2_SIZE_OFFSET + 8).await?;
    if &header[..4] != QCOW2_MAGIC {
        return Err(ImageError::InvalidHeader(format!("{:?} is not a qcow2 file", path)));
    }
    Ok(be_u64(&header, QCOW2_SIZE_OFFSET))
}

async fn vhd_virtual_size(path: &Path) -> Result<u64, ImageError> {
    let len = fs::metadata(path).await?.len();
    if len < VHD_FOOTER_LEN {
        return Err(ImageError::InvalidHeader(format!("{:?} is too short for a vhd footer", path)));
    }
    let footer = read_at(path, SeekFrom::Start(len - VHD_FOOTER_LEN), VHD_FOOTER_LEN as usize).await?;
    if &footer[..8] != VHD_COOKIE {
        return Err(ImageError::InvalidHeader(format!("{:?} has no vhd footer", path)));
    }
    Ok(be_u64(&footer, VHD_CURRENT_SIZE_OFFSET))
}

async fn vmdk_virtual_size(path: &Path) -> Result<u64, ImageError> {
    let len = fs::metadata(path).await?.len();
    let head = read_at(path, SeekFrom::Start(0), len.min(VMDK_DESCRIPTOR_LIMIT) as usize).await?;

    let overflow =
        || ImageError::InvalidHeader(format!("{:?} declares an impossible vmdk size", path));

    if head.len() >= VMDK_CAPACITY_OFFSET + 8 && &head[..4] == VMDK_MAGIC {
        return le_u64(&head, VMDK_CAPACITY_OFFSET)
            .checked_mul(SECTOR_SIZE)
            .ok_or_else(overflow);
    }

    // Plain text descriptor: sum the sectors of every extent line.
    let text = String::from_utf8_lossy(&head);
    let sectors = text
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("RW ") || l.starts_with("RDONLY ") || l.starts_with("NOACCESS "))
        .filter_map(|l| l.split_whitespace().nth(1)?.parse::<u64>().ok())
        .try_fold(0u64, u64::checked_add)
        .ok_or_else(overflow)?;

    if sectors == 0 {
        return Err(ImageError::InvalidHeader(format!("{:?} has no vmdk extents", path)));
    }
    sectors.checked_mul(SECTOR_SIZE).ok_or_else(overflow)
}

async fn ova_virtual_size(path: PathBuf) -> Result<u64, ImageError> {
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&path)?;
        let mut archive = tar::Archive::new(file);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let is_ovf = entry
                .path()?
                .extension()
                .is_some_and(|e| e.eq_ignore_ascii_case("ovf"));
            if !is_ovf {
                continue;
            }
            let mut descriptor = String::new();
            entry.read_to_string(&mut descriptor)?;
            return ovf_capacity(&descriptor).ok_or_else(|| {
                ImageError::InvalidHeader(format!("{:?} declares no disk capacity", path))
            });
        }
        Err(ImageError::InvalidHeader(format!("{:?} contains no ovf descriptor", path)))
    })
    .await
    .map_err(|e| ImageError::Processing(e.to_string()))?
}

/// Sums `ovf:capacity` over every disk element of an OVF descriptor.
fn ovf_capacity(descriptor: &str) -> Option<u64> {
    const CAPACITY: &str = "ovf:capacity=\"";
    let mut total = 0u64;
    let mut found = false;
    let mut rest = descriptor;

    while let Some(pos) = rest.find(CAPACITY) {
        let start = rest[..pos].rfind('<').unwrap_or(0);
        let end = rest[pos..].find('>').map(|e| pos + e).unwrap_or(rest.len());
        let element = &rest[start..end];

        let capacity: u64 = attribute(element, "ovf:capacity")?.parse().ok()?;
        let units = attribute(element, "ovf:capacityAllocationUnits")
            .map(allocation_units)
            .unwrap_or(Some(1))?;
        total = total.checked_add(capacity.checked_mul(units)?)?;
        found = true;
        rest = &rest[end..];
    }

    found.then_some(total)
}

fn attribute<'a>(element: &'a str, name: &str) -> Option<&'a str> {
    let needle = format!("{}=\"", name);
    let start = element.find(&needle)? + needle.len();
    let len = element[start..].find('"')?;
    Some(&element[start..start + len])
}

// "byte * 2^30" style programmatic units.
fn allocation_units(units: &str) -> Option<u64> {
    let mut factor = 1u64;
    for term in units.split('*').map(str::trim) {
        if term.is_empty() || term.eq_ignore_ascii_case("byte") {
            continue;
        }
        let value = match term.split_once('^') {
            Some((base, exp)) => base
                .trim()
                .parse::<u64>()
                .ok()?
                .checked_pow(exp.trim().parse().ok()?)?,
            None => term.parse().ok()?,
        };
        factor = factor.checked_mul(value)?;
    }
    Some(factor)
}
