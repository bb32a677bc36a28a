use crate::error::DomainError;
use crate::types::AppId;

/// A service volume reference in its two string forms:
///
/// - `name:/path` for a named, agent-managed volume
/// - `/host:/container` for a bind mount, never reconciled by the agent
///
/// The left side decides: anything starting with `/` is a host path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VolumeRef {
    Named { name: String, container_path: String },
    Bind { host_path: String, container_path: String },
}

impl VolumeRef {
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let (left, right) = raw
            .split_once(':')
            .ok_or_else(|| DomainError::InvalidVolumeRef(raw.to_string()))?;
        if left.is_empty() || right.is_empty() || !right.starts_with('/') {
            return Err(DomainError::InvalidVolumeRef(raw.to_string()));
        }
        if left.starts_with('/') {
            Ok(VolumeRef::Bind {
                host_path: left.to_string(),
                container_path: right.to_string(),
            })
        } else {
            Ok(VolumeRef::Named {
                name: left.to_string(),
                container_path: right.to_string(),
            })
        }
    }

    pub fn is_bind(&self) -> bool {
        matches!(self, VolumeRef::Bind { .. })
    }

    /// Docker-side name for a named volume, prefixed with the app id so the
    /// same `name:` in two apps maps to two distinct volumes.
    pub fn mount_name(&self, app_id: AppId) -> Option<String> {
        match self {
            VolumeRef::Named { name, .. } => Some(format!("{}_{}", app_id, name)),
            VolumeRef::Bind { .. } => None,
        }
    }

    pub fn container_path(&self) -> &str {
        match self {
            VolumeRef::Named { container_path, .. } => container_path,
            VolumeRef::Bind { container_path, .. } => container_path,
        }
    }

    /// The `source:destination` string handed to the runtime, with named
    /// volumes already resolved to their app-scoped Docker name.
    pub fn bind_string(&self, app_id: AppId) -> String {
        match self {
            VolumeRef::Named { container_path, .. } => {
                // mount_name is always Some for Named
                format!("{}:{}", self.mount_name(app_id).unwrap_or_default(), container_path)
            }
            VolumeRef::Bind { host_path, container_path } => {
                format!("{}:{}", host_path, container_path)
            }
        }
    }
}

impl std::fmt::Display for VolumeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeRef::Named { name, container_path } => write!(f, "{}:{}", name, container_path),
            VolumeRef::Bind { host_path, container_path } => {
                write!(f, "{}:{}", host_path, container_path)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_volume_parses() {
        let v = VolumeRef::parse("data:/var/lib/data").unwrap();
        assert_eq!(
            v,
            VolumeRef::Named { name: "data".into(), container_path: "/var/lib/data".into() }
        );
        assert!(!v.is_bind());
        assert_eq!(v.mount_name(AppId(3)).unwrap(), "3_data");
        assert_eq!(v.bind_string(AppId(3)), "3_data:/var/lib/data");
    }

    #[test]
    fn bind_mount_parses() {
        let v = VolumeRef::parse("/etc/localtime:/etc/localtime").unwrap();
        assert!(v.is_bind());
        assert_eq!(v.mount_name(AppId(1)), None);
        assert_eq!(v.bind_string(AppId(1)), "/etc/localtime:/etc/localtime");
    }

    #[test]
    fn rejects_malformed_refs() {
        assert!(VolumeRef::parse("noseparator").is_err());
        assert!(VolumeRef::parse(":/container").is_err());
        assert!(VolumeRef::parse("name:relative/path").is_err());
        assert!(VolumeRef::parse("name:").is_err());
    }

    #[test]
    fn display_round_trips() {
        for raw in ["data:/var/lib/data", "/host/dir:/in/container"] {
            let v = VolumeRef::parse(raw).unwrap();
            assert_eq!(v.to_string(), raw);
        }
    }
}
