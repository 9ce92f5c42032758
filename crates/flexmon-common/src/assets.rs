//! Closed tables of known asset types and sub-types.
//!
//! Rule names encode the asset they watch (`load@ups-1234`), and the iname
//! prefix before the last dash names the asset kind. The mailbox LIST2
//! filter validates its `asset_type` / `asset_sub_type` fields against
//! these tables; `device` is accepted as a type alias for "any known
//! device sub-type".

/// Container and logical asset types.
const TYPES: &[&str] = &[
    "group",
    "datacenter",
    "room",
    "row",
    "rack",
    "device",
    "infra-service",
    "cluster",
    "hypervisor",
    "virtual-machine",
    "storage-service",
    "vm-service",
    "connector",
    "planner",
    "plan",
];

/// Device sub-types.
const SUBTYPES: &[&str] = &[
    "ups",
    "genset",
    "epdu",
    "pdu",
    "server",
    "feed",
    "sts",
    "switch",
    "storage",
    "vm",
    "router",
    "rackcontroller",
    "sensor",
    "appliance",
    "chassis",
    "patchpanel",
    "other",
    "sensorgpio",
    "gpo",
];

pub fn is_known_type(name: &str) -> bool {
    TYPES.contains(&name)
}

pub fn is_known_subtype(name: &str) -> bool {
    SUBTYPES.contains(&name)
}

/// Location kinds usable in a LIST2 `in` filter.
pub fn is_location_type(name: &str) -> bool {
    matches!(name, "datacenter" | "room" | "row" | "rack")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_and_subtype_tables_do_not_overlap_on_key_entries() {
        // `rack` is a container type, `ups` is a device sub-type; the LIST2
        // validation depends on them not leaking into the other table.
        assert!(is_known_type("rack"));
        assert!(!is_known_subtype("rack"));
        assert!(is_known_subtype("ups"));
        assert!(!is_known_type("ups"));
        assert!(!is_known_type("hello"));
        assert!(!is_known_subtype("hello"));
    }

    #[test]
    fn location_types() {
        assert!(is_location_type("datacenter"));
        assert!(is_location_type("rack"));
        assert!(!is_location_type("ups"));
        assert!(!is_location_type(""));
    }
}
