use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Alert severity as published on the alert stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Ok,
    Warning,
    Critical,
}

impl Severity {
    /// Maps a rule result code to a severity: `|code| == 2` is critical,
    /// `|code| == 1` is warning, `0` is ok.
    pub fn from_result(code: i32) -> Severity {
        match code.abs() {
            2 => Severity::Critical,
            1 => Severity::Warning,
            _ => Severity::Ok,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Ok => write!(f, "OK"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "OK" => Ok(Severity::Ok),
            "WARNING" => Ok(Severity::Warning),
            "CRITICAL" => Ok(Severity::Critical),
            _ => Err(format!("unknown severity: {s}")),
        }
    }
}

/// Alert lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertState {
    Active,
    Resolved,
}

impl std::fmt::Display for AlertState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertState::Active => write!(f, "ACTIVE"),
            AlertState::Resolved => write!(f, "RESOLVED"),
        }
    }
}

/// Alert envelope published downstream.
///
/// `asset` is the logical asset when the rule declares one, otherwise the
/// evaluated asset; the outbound topic always names the evaluated asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub rule: String,
    pub asset: String,
    pub state: AlertState,
    pub severity: Severity,
    pub message: String,
    pub ttl_secs: u32,
    pub actions: Vec<String>,
    pub time: DateTime<Utc>,
}

/// One metric publication. Samples are never mutated in place; a new
/// publication replaces the cached one wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    /// Asset iname the sample refers to (e.g. `ups-1234`).
    pub asset: String,
    /// Metric kind (e.g. `status.ups`, `ambient.temperature`).
    pub quantity: String,
    pub value: String,
    pub time: DateTime<Utc>,
    pub ttl_secs: u32,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub aux: HashMap<String, String>,
}

impl MetricSample {
    pub fn new(asset: &str, quantity: &str, value: &str, ttl_secs: u32) -> Self {
        Self {
            asset: asset.to_string(),
            quantity: quantity.to_string(),
            value: value.to_string(),
            time: Utc::now(),
            ttl_secs,
            aux: HashMap::new(),
        }
    }

    /// Cache/store key, `<quantity>@<asset>`.
    pub fn topic(&self) -> String {
        format!("{}@{}", self.quantity, self.asset)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.time + chrono::Duration::seconds(i64::from(self.ttl_secs)) < now
    }
}

/// Asset announcement operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetOperation {
    Create,
    Update,
    Delete,
    Inventory,
    Retire,
}

/// One asset announcement from the asset stream.
///
/// `aux` carries structured attributes (`status`, `type`, `subtype`,
/// `parent_name.1`..`parent_name.4`); `ext` carries free-form extended
/// attributes (`name`, `model`, `device.part`, `group.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetMessage {
    pub iname: String,
    pub operation: AssetOperation,
    #[serde(default)]
    pub aux: HashMap<String, String>,
    #[serde(default)]
    pub ext: HashMap<String, String>,
}

impl AssetMessage {
    pub fn new(iname: &str, operation: AssetOperation) -> Self {
        Self {
            iname: iname.to_string(),
            operation,
            aux: HashMap::new(),
            ext: HashMap::new(),
        }
    }

    /// Lifecycle status, defaulting to `active` when the announcement does
    /// not carry one.
    pub fn status(&self) -> &str {
        self.aux.get("status").map(String::as_str).unwrap_or("active")
    }

    pub fn asset_type(&self) -> &str {
        self.aux.get("type").map(String::as_str).unwrap_or("")
    }

    pub fn subtype(&self) -> &str {
        self.aux.get("subtype").map(String::as_str).unwrap_or("")
    }

    pub fn model(&self) -> &str {
        self.ext.get("model").map(String::as_str).unwrap_or("")
    }

    pub fn device_part(&self) -> &str {
        self.ext.get("device.part").map(String::as_str).unwrap_or("")
    }

    /// Display name from the `name` extended attribute.
    pub fn display_name(&self) -> Option<&str> {
        self.ext.get("name").map(String::as_str)
    }

    /// Parent-location chain, innermost first (`parent_name.1` is the direct
    /// parent). At most four levels are announced.
    pub fn parent_names(&self) -> Vec<String> {
        let mut parents = Vec::new();
        for i in 1..=4 {
            if let Some(p) = self.aux.get(&format!("parent_name.{i}")) {
                parents.push(p.clone());
            }
        }
        parents
    }

    /// Values of all `group.*` extended attributes.
    pub fn group_values(&self) -> impl Iterator<Item = &str> {
        self.ext
            .iter()
            .filter(|(k, _)| k.starts_with("group."))
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_mapping_is_pure() {
        assert_eq!(Severity::from_result(-2), Severity::Critical);
        assert_eq!(Severity::from_result(-1), Severity::Warning);
        assert_eq!(Severity::from_result(0), Severity::Ok);
        assert_eq!(Severity::from_result(1), Severity::Warning);
        assert_eq!(Severity::from_result(2), Severity::Critical);
    }

    #[test]
    fn sample_expiry() {
        let mut sample = MetricSample::new("ups-1", "status.ups", "64", 10);
        let now = Utc::now();
        assert!(!sample.is_expired(now));
        sample.time = now - chrono::Duration::seconds(11);
        assert!(sample.is_expired(now));
    }

    #[test]
    fn asset_defaults_and_parents() {
        let mut asset = AssetMessage::new("ups-1234", AssetOperation::Update);
        assert_eq!(asset.status(), "active");
        asset.aux.insert("parent_name.1".into(), "rack-1".into());
        asset.aux.insert("parent_name.2".into(), "room-7".into());
        assert_eq!(asset.parent_names(), vec!["rack-1", "room-7"]);
    }
}
