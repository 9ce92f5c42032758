//! Shared types for the flexmon alarm engine.
//!
//! The wire-facing data model lives here: metric samples, asset
//! announcements, the alert envelope and the stream/identity constants
//! the engine and the agent binary both need.

pub mod assets;
pub mod types;

/// Stream carrying asset announcements (create/update/delete/inventory).
pub const STREAM_ASSETS: &str = "ASSETS";
/// Stream carrying regular metric publications.
pub const STREAM_METRICS: &str = "METRICS";
/// Stream carrying sensor (GPI) metric publications.
pub const STREAM_METRICS_SENSOR: &str = "METRICS_SENSOR";
/// Stream carrying licensing announcements (e.g. `licensing.expiration`).
pub const STREAM_LICENSING: &str = "LICENSING_ANNOUNCEMENTS";
/// Stream the engine produces alerts on.
pub const STREAM_ALERTS: &str = "ALERTS";

/// Mailbox address of the external asset service (REPUBLISH target).
pub const ASSET_AGENT_ADDRESS: &str = "asset-agent";
/// Sender identity that triggers the ADD merge semantics for gpio rules.
pub const AUTOCONFIG_SENDER: &str = "fty-autoconfig";
