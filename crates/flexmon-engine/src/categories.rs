//! Category classification of rule names.
//!
//! The mailbox LIST2 filter selects rules by category. A rule's categories
//! derive from its name prefix (the part before `@`) through a fixed
//! table; enumerated families like `outlet.group.<n>.current` redirect to
//! their canonical `…1…` entry, and unknown prefixes fall back to
//! `other`. The table must stay in sync with the peer alert engines that
//! share this mailbox protocol.

use regex::Regex;
use std::sync::LazyLock;

/// The closed set of category tokens.
pub const CATEGORIES: &[&str] = &[
    "load",
    "phase_imbalance",
    "temperature",
    "humidity",
    "expiry",
    "input_current",
    "output_current",
    "battery",
    "input_voltage",
    "output_voltage",
    "sts",
    "other",
];

/// Rule-name prefix → category tokens.
static CATEGORY_TABLE: &[(&str, &[&str])] = &[
    ("realpower.default", &["load"]),
    ("phase_imbalance", &["phase_imbalance"]),
    ("average.temperature", &["temperature"]),
    ("average.humidity", &["humidity"]),
    ("average.temperature-input", &["temperature"]),
    ("average.humidity-input", &["humidity"]),
    ("licensing.expiration", &["expiry"]),
    ("warranty", &["expiry"]),
    ("load.default", &["load"]),
    ("input.L1.current", &["input_current"]),
    ("input.L2.current", &["input_current"]),
    ("input.L3.current", &["input_current"]),
    ("charge.battery", &["battery"]),
    ("runtime.battery", &["battery"]),
    ("voltage.input_1phase", &["input_voltage"]),
    ("voltage.input_3phase", &["input_voltage"]),
    ("input.L1.voltage", &["input_voltage"]),
    ("input.L2.voltage", &["input_voltage"]),
    ("input.L3.voltage", &["input_voltage"]),
    ("temperature.default", &["temperature"]),
    ("realpower.default_1phase", &["load"]),
    ("load.input_1phase", &["load"]),
    ("load.input_3phase", &["load"]),
    ("section_load", &["load"]),
    ("sts-frequency", &["sts"]),
    ("sts-preferred-source", &["sts"]),
    ("sts-voltage", &["sts"]),
    ("ambient.humidity", &["humidity"]),
    ("ambient.temperature", &["temperature"]),
    // enumerated families, canonical entries
    ("outlet.group.1.current", &["output_current"]),
    ("outlet.group.1.voltage", &["output_voltage"]),
    ("ambient.1.humidity.status", &["humidity"]),
    ("ambient.1.temperature.status", &["temperature"]),
];

/// Enumerated rule names redirect to their canonical table entry.
static ENUMERATED: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"^outlet\.group\.\d{1,4}\.current$", "outlet.group.1.current"),
        (r"^outlet\.group\.\d{1,4}\.voltage$", "outlet.group.1.voltage"),
        (
            r"^ambient\.\d{1,4}\.humidity\.status$",
            "ambient.1.humidity.status",
        ),
        (
            r"^ambient\.\d{1,4}\.temperature\.status$",
            "ambient.1.temperature.status",
        ),
    ]
    .into_iter()
    .map(|(pattern, target)| (Regex::new(pattern).expect("valid pattern"), target))
    .collect()
});

/// Category tokens for a rule name; unknown prefixes map to `["other"]`.
pub fn tokens_for_rule_name(rule_name: &str) -> Vec<&'static str> {
    let mut prefix = rule_name
        .rsplit_once('@')
        .map(|(prefix, _)| prefix)
        .unwrap_or(rule_name);

    for (pattern, target) in ENUMERATED.iter() {
        if pattern.is_match(prefix) {
            prefix = target;
            break;
        }
    }

    CATEGORY_TABLE
        .iter()
        .find(|(key, _)| *key == prefix)
        .map(|(_, tokens)| tokens.to_vec())
        .unwrap_or_else(|| vec!["other"])
}
