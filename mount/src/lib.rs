mod error;
mod manager;
mod table;

pub use error::MountError;
pub use manager::{MountConfig, MountManager, MountPoint, MountState, mount_dir_name};
pub use table::MountTable;

use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Nfs,
    Cifs,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Nfs => "nfs",
            Scheme::Cifs => "cifs",
        }
    }
}

/// A remote share as given in a store URL, e.g. `nfs://10.0.0.5/export/secondary`
/// or `cifs://host/share?user=foo&password=bar`.
#[derive(Debug, Clone)]
pub struct RemoteTarget {
    pub scheme: Scheme,
    pub host: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    uri: String,
}

impl RemoteTarget {
    pub fn parse(uri: &str) -> Result<Self, MountError> {
        let url = Url::parse(uri)
            .map_err(|e| MountError::InvalidSpec(format!("invalid uri {}: {}", uri, e)))?;

        let scheme = match url.scheme().to_ascii_lowercase().as_str() {
            "nfs" => Scheme::Nfs,
            "cifs" => Scheme::Cifs,
            other => {
                return Err(MountError::InvalidSpec(format!(
                    "unsupported storage device scheme {} in uri {}",
                    other, uri
                )));
            }
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| MountError::InvalidSpec(format!("no host in uri {}", uri)))?
            .to_string();

        let query = url
            .query_pairs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Ok(Self {
            scheme,
            host,
            path: url.path().to_string(),
            query,
            uri: uri.to_string(),
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Remote device argument for the mount tool.
    pub fn device(&self, host_ip: &str) -> String {
        match self.scheme {
            Scheme::Nfs => format!("{}:{}", host_ip, self.path),
            Scheme::Cifs => format!("//{}{}", host_ip, self.path),
        }
    }

    /// `-o` argument for the mount tool, if any. CIFS shares must carry both
    /// `user` and `password` query parameters.
    pub fn mount_options(&self, in_system_vm: bool) -> Result<Option<String>, MountError> {
        match self.scheme {
            Scheme::Nfs => {
                if cfg!(target_os = "macos") {
                    Ok(Some("resvport".to_string()))
                } else if in_system_vm {
                    Ok(Some(
                        "soft,timeo=133,retrans=2147483647,tcp,acdirmax=0,acdirmin=0".to_string(),
                    ))
                } else {
                    Ok(None)
                }
            }
            Scheme::Cifs => {
                let found_user = self.query.iter().any(|(k, _)| k == "user");
                let found_password = self.query.iter().any(|(k, _)| k == "password");
                if !found_user || !found_password {
                    return Err(MountError::InvalidSpec(
                        "Missing user and password from URI. Make sure they are in the query string \
                         and separated by '&'. E.g. cifs://example.com/some_share?user=foo&password=bar"
                            .to_string(),
                    ));
                }

                let mut options = String::new();
                for (name, value) in &self.query {
                    options.push_str(&format!("{}={},", name, value));
                }
                options.push_str("soft,actimeo=0");
                Ok(Some(options))
            }
        }
    }
}
