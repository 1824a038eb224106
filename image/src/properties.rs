//! The `key=value` sidecar stored next to every complete artifact.

use crate::error::ImageError;
use crate::format;
use crate::processor::FormatInfo;
use secstor_core::TemplateProp;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

pub const TEMPLATE_PROPERTIES: &str = "template.properties";
pub const VOLUME_PROPERTIES: &str = "volume.properties";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Properties {
    pub unique_name: String,
    pub filename: String,
    /// Bytes on disk.
    pub size: u64,
    pub virtual_size: Option<u64>,
    pub is_public: bool,
    pub formats: Vec<FormatInfo>,
}

impl Properties {
    pub fn new(unique_name: impl Into<String>, filename: impl Into<String>, size: u64) -> Self {
        Self {
            unique_name: unique_name.into(),
            filename: filename.into(),
            size,
            virtual_size: None,
            is_public: true,
            formats: Vec::new(),
        }
    }

    /// Records a processed format; its virtual size becomes the artifact's.
    pub fn with_format(mut self, info: FormatInfo) -> Self {
        self.virtual_size = Some(info.virtual_size);
        self.formats.retain(|f| f.format != info.format);
        self.formats.push(info);
        self
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("uniquename={}\n", self.unique_name));
        out.push_str(&format!("filename={}\n", self.filename));
        out.push_str(&format!("size={}\n", self.size));
        if let Some(virtual_size) = self.virtual_size {
            out.push_str(&format!("virtualsize={}\n", virtual_size));
        }
        out.push_str(&format!("public={}\n", self.is_public));
        for info in &self.formats {
            let ext = info.format.file_extension();
            out.push_str(&format!("{}=true\n", ext));
            out.push_str(&format!("{}.filename={}\n", ext, info.filename));
            out.push_str(&format!("{}.size={}\n", ext, info.size));
            out.push_str(&format!("{}.virtualsize={}\n", ext, info.virtual_size));
        }
        out
    }

    /// Parses a sidecar. `None` when any of `uniquename`, `filename` or a
    /// numeric `size` is missing; unknown keys are ignored.
    pub fn parse(text: &str) -> Option<Self> {
        let entries: BTreeMap<&str, &str> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(|l| l.split_once('='))
            .map(|(k, v)| (k.trim(), v.trim()))
            .collect();

        let unique_name = entries.get("uniquename").filter(|v| !v.is_empty())?;
        let filename = entries.get("filename").filter(|v| !v.is_empty())?;
        let size = entries.get("size")?.parse().ok()?;
        let virtual_size = entries.get("virtualsize").and_then(|v| v.parse().ok());
        let is_public = entries.get("public").is_none_or(|v| *v != "false");

        let formats = entries
            .iter()
            .filter(|(_, v)| **v == "true")
            .filter_map(|(k, _)| {
                let format = format::from_extension(k)?;
                let key = |suffix: &str| entries.get(format!("{}.{}", k, suffix).as_str()).copied();
                Some(FormatInfo {
                    format,
                    filename: key("filename")?.to_string(),
                    size: key("size")?.parse().ok()?,
                    virtual_size: key("virtualsize")?.parse().ok()?,
                })
            })
            .collect();

        Some(Self {
            unique_name: unique_name.to_string(),
            filename: filename.to_string(),
            size,
            virtual_size,
            is_public,
            formats,
        })
    }

    /// Inventory entry: size is the virtual size when known, physical size
    /// is the bytes on disk.
    pub fn to_prop(&self, install_path: impl Into<String>) -> TemplateProp {
        TemplateProp {
            unique_name: self.unique_name.clone(),
            install_path: install_path.into(),
            size: self.virtual_size.unwrap_or(self.size),
            physical_size: self.size,
            is_public: self.is_public,
            is_corrupted: false,
        }
    }

    pub async fn write(&self, dir: &Path, file_name: &str) -> Result<PathBuf, ImageError> {
        let path = dir.join(file_name);
        fs::write(&path, self.render()).await?;
        tracing::debug!("Wrote {:?} for {}", path, self.unique_name);
        Ok(path)
    }

    /// A missing or malformed sidecar reads as `None`: the artifact next to it
    /// is incomplete.
    pub async fn read(path: &Path) -> Option<Self> {
        let text = match fs::read_to_string(path).await {
            Ok(t) => t,
            Err(e) => {
                tracing::debug!("No readable sidecar at {:?}: {}", path, e);
                return None;
            }
        };
        let props = Self::parse(&text);
        if props.is_none() {
            tracing::warn!("Ignoring malformed sidecar {:?}", path);
        }
        props
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secstor_core::ImageFormat;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sidecar_round_trip() {
        let dir = TempDir::new().unwrap();
        let props = Properties::new("abc", "abc.qcow2", 12345);

        let path = props.write(dir.path(), TEMPLATE_PROPERTIES).await.unwrap();
        let read = Properties::read(&path).await.unwrap();

        assert_eq!(read.unique_name, "abc");
        assert_eq!(read.filename, "abc.qcow2");
        assert_eq!(read.size, 12345);
        assert_eq!(read, props);
    }

    #[test]
    fn test_missing_uniquename_is_incomplete() {
        assert!(Properties::parse("filename=abc.qcow2\nsize=12345\n").is_none());
        assert!(Properties::parse("uniquename=abc\nfilename=abc.qcow2\nsize=big\n").is_none());
        assert!(Properties::parse("").is_none());
    }

    #[tokio::test]
    async fn test_missing_sidecar() {
        let dir = TempDir::new().unwrap();
        assert!(Properties::read(&dir.path().join(VOLUME_PROPERTIES)).await.is_none());
    }

    #[test]
    fn test_format_records() {
        let props = Properties::new("abc", "abc.qcow2", 4096).with_format(FormatInfo {
            format: ImageFormat::Qcow2,
            filename: "abc.qcow2".to_string(),
            size: 4096,
            virtual_size: 1 << 30,
        });

        let text = props.render();
        assert!(text.contains("virtualsize=1073741824\n"));
        assert!(text.contains("qcow2=true\n"));
        assert!(text.contains("qcow2.size=4096\n"));

        let parsed = Properties::parse(&text).unwrap();
        assert_eq!(parsed, props);

        let prop = parsed.to_prop("template/tmpl/2/201/abc.qcow2");
        assert_eq!(prop.size, 1 << 30);
        assert_eq!(prop.physical_size, 4096);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let parsed = Properties::parse(
            "#comment\nid=1\nuniquename=u\nfilename=f.vhd\nsize=7\nchecksum=abc\n",
        )
        .unwrap();
        assert_eq!(parsed.size, 7);
        assert!(parsed.formats.is_empty());
    }
}
