use crate::error::MountError;
use std::path::{Path, PathBuf};
use tokio::fs;

/// The system mount table (`/proc/mounts` format), read fresh on every probe.
#[derive(Debug, Clone)]
pub struct MountTable {
    path: PathBuf,
}

impl MountTable {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub async fn mount_points(&self) -> Result<Vec<PathBuf>, MountError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        Ok(content
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .map(|field| PathBuf::from(unescape(field)))
            .collect())
    }

    pub async fn is_mounted(&self, target: &Path) -> Result<bool, MountError> {
        let mounted = self
            .mount_points()
            .await?
            .iter()
            .any(|p| p.as_path() == target);
        Ok(mounted)
    }
}

// The kernel escapes space, tab, newline and backslash as three-digit octal.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = (bytes[i + 1] - b'0') as u32 * 64
                + (bytes[i + 2] - b'0') as u32 * 8
                + (bytes[i + 3] - b'0') as u32;
            out.push(value as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).to_string()
}
