use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const TEMPLATE_ROOT_DIR: &str = "template/tmpl";
pub const VOLUME_ROOT_DIR: &str = "volumes";
pub const SNAPSHOT_ROOT_DIR: &str = "snapshots";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImageFormat {
    Raw,
    Qcow2,
    Vhd,
    Vhdx,
    Ova,
    Tar,
    Vmdk,
    Vdi,
}

impl ImageFormat {
    pub fn file_extension(&self) -> &'static str {
        match self {
            ImageFormat::Raw => "img",
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Vhd => "vhd",
            ImageFormat::Vhdx => "vhdx",
            ImageFormat::Ova => "ova",
            ImageFormat::Tar => "tar",
            ImageFormat::Vmdk => "vmdk",
            ImageFormat::Vdi => "vdi",
        }
    }
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ImageFormat::Raw => "RAW",
            ImageFormat::Qcow2 => "QCOW2",
            ImageFormat::Vhd => "VHD",
            ImageFormat::Vhdx => "VHDX",
            ImageFormat::Ova => "OVA",
            ImageFormat::Tar => "TAR",
            ImageFormat::Vmdk => "VMDK",
            ImageFormat::Vdi => "VDI",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HypervisorType {
    XenServer,
    #[serde(rename = "KVM")]
    Kvm,
    VMware,
    Hyperv,
    #[serde(rename = "LXC")]
    Lxc,
}

impl std::fmt::Display for HypervisorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HypervisorType::XenServer => write!(f, "XenServer"),
            HypervisorType::Kvm => write!(f, "KVM"),
            HypervisorType::VMware => write!(f, "VMware"),
            HypervisorType::Hyperv => write!(f, "Hyperv"),
            HypervisorType::Lxc => write!(f, "LXC"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DataStoreRole {
    #[default]
    Image,
    ImageCache,
    Primary,
}

/// What kind of artifact a [`DataObject`] describes. Snapshots carry their
/// hypervisor origin and the format of the volume they were taken from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObjectKind {
    Template,
    Volume,
    Snapshot {
        hypervisor: HypervisorType,
        #[serde(default)]
        volume_format: Option<ImageFormat>,
    },
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectKind::Template => write!(f, "template"),
            ObjectKind::Volume => write!(f, "volume"),
            ObjectKind::Snapshot { .. } => write!(f, "snapshot"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataObject {
    pub kind: ObjectKind,
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub format: Option<ImageFormat>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub physical_size: Option<u64>,
    #[serde(default)]
    pub account_id: Option<u64>,
}

impl DataObject {
    pub fn new(kind: ObjectKind) -> Self {
        Self {
            kind,
            id: 0,
            name: None,
            path: None,
            format: None,
            size: None,
            physical_size: None,
            account_id: None,
        }
    }

    pub fn template() -> Self {
        Self::new(ObjectKind::Template)
    }

    pub fn volume() -> Self {
        Self::new(ObjectKind::Volume)
    }

    pub fn snapshot(hypervisor: HypervisorType, volume_format: Option<ImageFormat>) -> Self {
        Self::new(ObjectKind::Snapshot {
            hypervisor,
            volume_format,
        })
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_format(mut self, format: ImageFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_physical_size(mut self, size: u64) -> Self {
        self.physical_size = Some(size);
        self
    }

    pub fn is_template(&self) -> bool {
        matches!(self.kind, ObjectKind::Template)
    }

    pub fn is_snapshot(&self) -> bool {
        matches!(self.kind, ObjectKind::Snapshot { .. })
    }

    pub fn path_str(&self) -> &str {
        self.path.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfsStore {
    pub url: String,
    #[serde(default)]
    pub role: DataStoreRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Store {
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default = "default_https")]
    pub https: bool,
    /// Largest object sent in a single PUT. `None` or negative means always
    /// single, zero means always multipart.
    #[serde(default)]
    pub max_single_upload_bytes: Option<i64>,
    #[serde(default)]
    pub role: DataStoreRole,
}

fn default_https() -> bool {
    true
}

impl S3Store {
    pub fn single_upload(&self, object_size: u64) -> bool {
        match self.max_single_upload_bytes {
            None => true,
            Some(max) if max < 0 => true,
            Some(0) => false,
            Some(max) => object_size <= max as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwiftStore {
    pub url: String,
    pub account: String,
    pub user_name: String,
    pub key: String,
    #[serde(default)]
    pub role: DataStoreRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum DataStore {
    Nfs(NfsStore),
    S3(S3Store),
    Swift(SwiftStore),
}

impl DataStore {
    pub fn role(&self) -> DataStoreRole {
        match self {
            DataStore::Nfs(s) => s.role,
            DataStore::S3(s) => s.role,
            DataStore::Swift(s) => s.role,
        }
    }

    pub fn is_object_store(&self) -> bool {
        !matches!(self, DataStore::Nfs(_))
    }
}

impl std::fmt::Display for DataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataStore::Nfs(s) => write!(f, "nfs store {}", s.url),
            DataStore::S3(s) => write!(f, "s3 bucket {}", s.bucket),
            DataStore::Swift(s) => write!(f, "swift {} account {}", s.url, s.account),
        }
    }
}

/// Inventory entry for a stored template or volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateProp {
    pub unique_name: String,
    pub install_path: String,
    pub size: u64,
    pub physical_size: u64,
    pub is_public: bool,
    pub is_corrupted: bool,
}

pub type TemplateInventory = BTreeMap<String, TemplateProp>;
pub type VolumeInventory = BTreeMap<u64, TemplateProp>;
