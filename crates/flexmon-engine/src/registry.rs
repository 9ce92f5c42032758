use flexmon_common::types::AssetMessage;
use flexmon_rule::{Rule, RuleStore};
use std::collections::HashMap;

/// Asset-side state: display names, parent-location chains and the
/// asset → rule binding index.
///
/// Bindings are rebuilt from scratch every time an asset is announced, by
/// scanning the rule store; rules are referenced by name only, never by
/// pointer, which keeps cascade deletion trivial.
pub struct AssetRegistry {
    bindings: HashMap<String, Vec<String>>,
    display_names: HashMap<String, String>,
    locations: HashMap<String, Vec<String>>,
}

impl AssetRegistry {
    pub fn new() -> AssetRegistry {
        AssetRegistry {
            bindings: HashMap::new(),
            display_names: HashMap::new(),
            locations: HashMap::new(),
        }
    }

    /// Recomputes the binding list for an announced asset. An empty result
    /// purges the asset from every index.
    pub fn rebind(&mut self, asset: &AssetMessage, store: &RuleStore) -> usize {
        let mut matching: Vec<String> = store
            .iter()
            .filter(|rule| is_rule_for_asset(rule, asset))
            .map(|rule| rule.name().to_string())
            .collect();
        matching.sort();

        if matching.is_empty() {
            tracing::debug!(asset = %asset.iname, "No rule for asset");
            self.purge(&asset.iname);
            return 0;
        }

        for rule in &matching {
            tracing::debug!(rule = %rule, asset = %asset.iname, "Rule bound to asset");
        }
        let count = matching.len();
        self.bindings.insert(asset.iname.clone(), matching);

        // Location overwrite policy: only when the asset is new or the
        // announcement carries aux attributes. Inventory messages may come
        // with ext attributes only, and overwriting with an empty parent
        // chain would corrupt location filters.
        if !self.locations.contains_key(&asset.iname) || !asset.aux.is_empty() {
            self.locations
                .insert(asset.iname.clone(), asset.parent_names());
        }

        if let Some(name) = asset.display_name() {
            self.display_names
                .insert(asset.iname.clone(), name.to_string());
        }

        count
    }

    /// Removes the asset from every index.
    pub fn purge(&mut self, iname: &str) {
        self.bindings.remove(iname);
        self.display_names.remove(iname);
        self.locations.remove(iname);
    }

    /// Drops a deleted rule from every binding list, so bindings never
    /// name a rule that is no longer in the store.
    pub fn unbind_rule(&mut self, rule_name: &str) {
        for rules in self.bindings.values_mut() {
            rules.retain(|r| r != rule_name);
        }
        self.bindings.retain(|_, rules| !rules.is_empty());
    }

    pub fn bound_rules(&self, iname: &str) -> Option<&[String]> {
        self.bindings.get(iname).map(Vec::as_slice)
    }

    pub fn is_bound(&self, iname: &str) -> bool {
        self.bindings.contains_key(iname)
    }

    pub fn display_name(&self, iname: &str) -> Option<&str> {
        self.display_names.get(iname).map(String::as_str)
    }

    /// True when `location` appears in the asset's parent chain.
    pub fn is_in_location(&self, iname: &str, location: &str) -> bool {
        self.locations
            .get(iname)
            .is_some_and(|parents| parents.iter().any(|p| p == location))
    }

    /// Inames of every asset currently carrying a binding.
    pub fn assets(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }
}

impl Default for AssetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Decides whether a rule applies to an announced asset. Checks run in
/// order, first match wins:
///
/// 1. `sensorgpio` assets match only when the rule lists both the asset
///    and the asset's model;
/// 2. the rule lists the asset iname;
/// 3. any `group.*` ext attribute value is listed as a group;
/// 4. the model or device part is listed as a model;
/// 5. the type or sub-type is listed as a type.
pub fn is_rule_for_asset(rule: &Rule, asset: &AssetMessage) -> bool {
    if asset.subtype() == "sensorgpio" {
        return rule.has_asset(&asset.iname) && rule.has_model(asset.model());
    }

    if rule.has_asset(&asset.iname) {
        return true;
    }

    if asset.group_values().any(|group| rule.has_group(group)) {
        return true;
    }

    if rule.has_model(asset.model()) || rule.has_model(asset.device_part()) {
        return true;
    }

    rule.has_type(asset.asset_type()) || rule.has_type(asset.subtype())
}
