//! External conversion scripts: installing a downloaded artifact into its
//! final single-file form, and turning a XenServer snapshot chain into a
//! template.

use crate::error::ImageError;
use secstor_core::{ImageFormat, Script};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

pub const CREATE_TEMPLATE_SCRIPT: &str = "createtmplt.sh";
pub const CREATE_VOLUME_SCRIPT: &str = "createvolume.sh";
pub const XEN_SNAPSHOT_SCRIPT: &str = "create_privatetemplate_from_snapshot_xen.sh";

const GIB: u64 = 1024 * 1024 * 1024;
const INSTALL_TIMEOUT_PER_GIB: Duration = Duration::from_secs(180 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallKind {
    Template,
    Volume,
}

/// Result of installing a downloaded artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installed {
    pub unique_name: String,
    pub filename: String,
    pub size: u64,
}

/// Whole gigabytes the artifact occupies plus one unit of slack, and the
/// matching install timeout.
pub fn install_timeout(bytes: u64) -> (u64, Duration) {
    let gigs = bytes.div_ceil(GIB) + 1;
    (gigs, INSTALL_TIMEOUT_PER_GIB * gigs as u32)
}

/// XenServer snapshot files are VHDs; the name on record may lack the suffix.
pub fn xen_snapshot_file_name(name: &str) -> String {
    if name.starts_with("VHD-") || name.ends_with(".vhd") {
        name.to_string()
    } else {
        format!("{}.vhd", name)
    }
}

#[derive(Debug, Clone)]
pub struct Scripts {
    create_template: PathBuf,
    create_volume: PathBuf,
    xen_snapshot: PathBuf,
}

impl Scripts {
    /// Finds every required script under `dir`. A missing script is a
    /// configuration error the node cannot run without.
    pub fn locate(dir: &Path) -> Result<Self, ImageError> {
        let find = |name: &str| {
            let path = dir.join(name);
            if path.is_file() {
                tracing::info!("{} found in {:?}", name, path);
                Ok(path)
            } else {
                Err(ImageError::Configuration(format!(
                    "Unable to find {} in {:?}",
                    name, dir
                )))
            }
        };

        Ok(Self {
            create_template: find(CREATE_TEMPLATE_SCRIPT)?,
            create_volume: find(CREATE_VOLUME_SCRIPT)?,
            xen_snapshot: find(XEN_SNAPSHOT_SCRIPT)?,
        })
    }

    /// Runs the install script over `artifact`, producing `<uuid>.<ext>` in
    /// `install_dir`.
    pub async fn install(
        &self,
        kind: InstallKind,
        artifact: &Path,
        install_dir: &Path,
        format: ImageFormat,
    ) -> Result<Installed, ImageError> {
        let script = match kind {
            InstallKind::Template => &self.create_template,
            InstallKind::Volume => &self.create_volume,
        };

        let len = fs::metadata(artifact).await?.len();
        let (gigs, timeout) = install_timeout(len);

        let unique_name = uuid::Uuid::new_v4().to_string();
        let filename = format!("{}.{}", unique_name, format.file_extension());

        Script::new(script, timeout)
            .opt("-s", gigs.to_string())
            .opt("-n", &filename)
            .opt("-t", install_dir.as_os_str())
            .opt("-f", artifact.as_os_str())
            .execute()
            .await
            .map_err(|e| {
                ImageError::Processing(format!("Failed to run script {:?}: {}", script, e))
            })?;

        let size = fs::metadata(install_dir.join(&filename)).await?.len();
        tracing::info!("Installed {:?} as {} ({} bytes)", artifact, filename, size);

        Ok(Installed {
            unique_name,
            filename,
            size,
        })
    }

    /// Coalesces the snapshot `snapshot_name` found in `snapshot_dir` into a
    /// new `<uuid>.vhd` under `dest_dir`, returning the uuid.
    pub async fn snapshot_to_vhd(
        &self,
        snapshot_dir: &Path,
        snapshot_name: &str,
        dest_dir: &Path,
        timeout: Duration,
    ) -> Result<String, ImageError> {
        let template_uuid = uuid::Uuid::new_v4().to_string();
        let template_name = format!("{}.vhd", template_uuid);

        Script::new(&self.xen_snapshot, timeout)
            .opt("-p", snapshot_dir.as_os_str())
            .opt("-s", snapshot_name)
            .opt("-n", &template_name)
            .opt("-t", dest_dir.as_os_str())
            .execute()
            .await
            .map_err(|e| ImageError::Processing(e.to_string()))?;

        Ok(template_uuid)
    }
}
