use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Kubernetes-style resource requirements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub limits: ResourceSpec,
    #[serde(default)]
    pub requests: ResourceSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Decimal cores (`"0.5"`) or millicores (`"500m"`).
    #[serde(default)]
    pub cpu: Option<String>,
    /// Raw bytes, binary suffixes (`Ki/Mi/Gi`) or decimal (`K/M/G`).
    #[serde(default)]
    pub memory: Option<String>,
}

impl ResourceSpec {
    pub fn cpu_millicores(&self) -> Result<Option<u64>, DomainError> {
        self.cpu.as_deref().map(parse_cpu).transpose()
    }

    pub fn memory_bytes(&self) -> Result<Option<u64>, DomainError> {
        self.memory.as_deref().map(parse_memory).transpose()
    }
}

/// `"500m"` → 500, `"0.5"` → 500, `"2"` → 2000.
pub fn parse_cpu(raw: &str) -> Result<u64, DomainError> {
    let raw = raw.trim();
    if let Some(milli) = raw.strip_suffix('m') {
        return milli
            .parse::<u64>()
            .map_err(|_| DomainError::InvalidCpuQuantity(raw.to_string()));
    }
    let cores: f64 = raw
        .parse()
        .map_err(|_| DomainError::InvalidCpuQuantity(raw.to_string()))?;
    if !cores.is_finite() || cores < 0.0 {
        return Err(DomainError::InvalidCpuQuantity(raw.to_string()));
    }
    Ok((cores * 1000.0).round() as u64)
}

/// `"64Mi"` → 67108864, `"1G"` → 1000000000, `"1048576"` → 1048576.
pub fn parse_memory(raw: &str) -> Result<u64, DomainError> {
    let raw = raw.trim();
    let (digits, multiplier) = if let Some(d) = raw.strip_suffix("Ki") {
        (d, 1024u64)
    } else if let Some(d) = raw.strip_suffix("Mi") {
        (d, 1024 * 1024)
    } else if let Some(d) = raw.strip_suffix("Gi") {
        (d, 1024 * 1024 * 1024)
    } else if let Some(d) = raw.strip_suffix('K') {
        (d, 1_000)
    } else if let Some(d) = raw.strip_suffix('M') {
        (d, 1_000_000)
    } else if let Some(d) = raw.strip_suffix('G') {
        (d, 1_000_000_000)
    } else {
        (raw, 1)
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| DomainError::InvalidMemoryQuantity(raw.to_string()))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| DomainError::InvalidMemoryQuantity(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_millicores() {
        assert_eq!(parse_cpu("500m").unwrap(), 500);
        assert_eq!(parse_cpu("0.5").unwrap(), 500);
        assert_eq!(parse_cpu("2").unwrap(), 2000);
        assert_eq!(parse_cpu("0.25").unwrap(), 250);
        assert!(parse_cpu("lots").is_err());
        assert!(parse_cpu("-1").is_err());
    }

    #[test]
    fn memory_suffixes() {
        assert_eq!(parse_memory("64Mi").unwrap(), 64 * 1024 * 1024);
        assert_eq!(parse_memory("1Gi").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory("512Ki").unwrap(), 512 * 1024);
        assert_eq!(parse_memory("1G").unwrap(), 1_000_000_000);
        assert_eq!(parse_memory("250M").unwrap(), 250_000_000);
        assert_eq!(parse_memory("1048576").unwrap(), 1_048_576);
        assert!(parse_memory("64QB").is_err());
    }

    #[test]
    fn spec_helpers() {
        let spec = ResourceSpec { cpu: Some("250m".into()), memory: Some("128Mi".into()) };
        assert_eq!(spec.cpu_millicores().unwrap(), Some(250));
        assert_eq!(spec.memory_bytes().unwrap(), Some(128 * 1024 * 1024));

        let empty = ResourceSpec::default();
        assert_eq!(empty.cpu_millicores().unwrap(), None);
        assert_eq!(empty.memory_bytes().unwrap(), None);
    }
}
