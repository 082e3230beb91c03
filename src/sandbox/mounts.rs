use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{BoxenvError, Result};

/// Bind propagation mode, only meaningful for bind mounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Propagation {
    Private,
    Rprivate,
    Shared,
    Rshared,
    Slave,
    Rslave,
}

impl Propagation {
    /// Parse an optional propagation value. Missing, empty or `"None"` means no override.
    pub fn parse_optional(value: Option<&str>) -> Result<Option<Self>> {
        match value.map(str::trim) {
            None | Some("") => Ok(None),
            Some(v) if v.eq_ignore_ascii_case("none") => Ok(None),
            Some(v) => v.parse().map(Some),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Rprivate => "rprivate",
            Self::Shared => "shared",
            Self::Rshared => "rshared",
            Self::Slave => "slave",
            Self::Rslave => "rslave",
        }
    }
}

impl FromStr for Propagation {
    type Err = BoxenvError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "private" => Ok(Self::Private),
            "rprivate" => Ok(Self::Rprivate),
            "shared" => Ok(Self::Shared),
            "rshared" => Ok(Self::Rshared),
            "slave" => Ok(Self::Slave),
            "rslave" => Ok(Self::Rslave),
            other => Err(BoxenvError::InvalidConfig(format!(
                "Unknown bind propagation '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn deserialize_propagation<'de, D>(deserializer: D) -> std::result::Result<Option<Propagation>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Propagation::parse_optional(raw.as_deref()).map_err(serde::de::Error::custom)
}

/// A mount request for a new sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MountSpec {
    Bind {
        source: PathBuf,
        target: String,
        #[serde(default)]
        read_only: bool,
        #[serde(default, deserialize_with = "deserialize_propagation")]
        propagation: Option<Propagation>,
        #[serde(default)]
        consistency: Option<String>,
    },
    Volume {
        name: String,
        target: String,
        #[serde(default)]
        read_only: bool,
        #[serde(default)]
        no_copy: bool,
        #[serde(default)]
        labels: BTreeMap<String, String>,
        #[serde(default)]
        consistency: Option<String>,
    },
    Tmpfs {
        target: String,
        #[serde(default)]
        read_only: bool,
        #[serde(default)]
        size_bytes: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    Bind,
    Volume,
    Tmpfs,
}

impl MountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bind => "bind",
            Self::Volume => "volume",
            Self::Tmpfs => "tmpfs",
        }
    }
}

/// Runtime-facing mount record. Kind-specific fields are only set for their kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountDescriptor {
    pub kind: MountKind,
    pub source: Option<String>,
    pub target: String,
    pub read_only: bool,
    pub consistency: Option<String>,
    pub propagation: Option<Propagation>,
    pub no_copy: Option<bool>,
    pub labels: Option<BTreeMap<String, String>>,
    pub tmpfs_size: Option<u64>,
}

impl MountSpec {
    pub fn bind(source: impl Into<PathBuf>, target: impl Into<String>, read_only: bool) -> Self {
        Self::Bind {
            source: source.into(),
            target: target.into(),
            read_only,
            propagation: None,
            consistency: None,
        }
    }

    pub fn volume(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::Volume {
            name: name.into(),
            target: target.into(),
            read_only: false,
            no_copy: false,
            labels: BTreeMap::new(),
            consistency: None,
        }
    }

    pub fn tmpfs(target: impl Into<String>) -> Self {
        Self::Tmpfs {
            target: target.into(),
            read_only: false,
            size_bytes: None,
        }
    }

    pub fn kind(&self) -> MountKind {
        match self {
            Self::Bind { .. } => MountKind::Bind,
            Self::Volume { .. } => MountKind::Volume,
            Self::Tmpfs { .. } => MountKind::Tmpfs,
        }
    }

    pub fn target(&self) -> &str {
        match self {
            Self::Bind { target, .. } | Self::Volume { target, .. } | Self::Tmpfs { target, .. } => {
                target
            }
        }
    }

    /// Check required fields: target always, source for bind, name for volume.
    pub fn validate(&self) -> Result<()> {
        if self.target().trim().is_empty() {
            return Err(BoxenvError::InvalidConfig(format!(
                "{} mount requires a target path",
                self.kind().as_str()
            )));
        }

        match self {
            Self::Bind { source, .. } if source.as_os_str().is_empty() => Err(
                BoxenvError::InvalidConfig("bind mount requires a source path".to_string()),
            ),
            Self::Volume { name, .. } if name.trim().is_empty() => Err(
                BoxenvError::InvalidConfig("volume mount requires a volume name".to_string()),
            ),
            _ => Ok(()),
        }
    }

    pub fn to_descriptor(&self) -> MountDescriptor {
        match self {
            Self::Bind {
                source,
                target,
                read_only,
                propagation,
                consistency,
            } => MountDescriptor {
                kind: MountKind::Bind,
                source: Some(source.display().to_string()),
                target: target.clone(),
                read_only: *read_only,
                consistency: consistency.clone(),
                propagation: *propagation,
                no_copy: None,
                labels: None,
                tmpfs_size: None,
            },
            Self::Volume {
                name,
                target,
                read_only,
                no_copy,
                labels,
                consistency,
            } => MountDescriptor {
                kind: MountKind::Volume,
                source: Some(name.clone()),
                target: target.clone(),
                read_only: *read_only,
                consistency: consistency.clone(),
                propagation: None,
                no_copy: Some(*no_copy),
                labels: Some(labels.clone()),
                tmpfs_size: None,
            },
            Self::Tmpfs {
                target,
                read_only,
                size_bytes,
            } => MountDescriptor {
                kind: MountKind::Tmpfs,
                source: None,
                target: target.clone(),
                read_only: *read_only,
                consistency: None,
                propagation: None,
                no_copy: None,
                labels: None,
                tmpfs_size: *size_bytes,
            },
        }
    }
}

/// Parse a CLI mount flag.
///
/// Accepts `host_path:guest_path[:ro]` for bind mounts, `volume:name:guest_path[:ro]`
/// and `tmpfs:guest_path`.
pub fn parse_mount_flag(s: &str) -> std::result::Result<MountSpec, String> {
    let parts: Vec<&str> = s.split(':').collect();
    let spec = match parts.as_slice() {
        ["tmpfs", target] => MountSpec::tmpfs(*target),
        ["volume", name, target] => MountSpec::volume(*name, *target),
        ["volume", name, target, "ro"] => MountSpec::Volume {
            name: name.to_string(),
            target: target.to_string(),
            read_only: true,
            no_copy: false,
            labels: BTreeMap::new(),
            consistency: None,
        },
        [source, target] => MountSpec::bind(*source, *target, false),
        [source, target, "ro"] => MountSpec::bind(*source, *target, true),
        _ => {
            return Err(
                "Mount format: host_path:guest_path[:ro], volume:name:guest_path[:ro] or tmpfs:guest_path"
                    .to_string(),
            )
        }
    };

    spec.validate().map_err(|e| e.to_string())?;
    Ok(spec)
}
