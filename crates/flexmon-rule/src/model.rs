use crate::error::{Result, RuleError};
use crate::script::{CompiledScript, Evaluation, ScriptError};
use serde_json::{Map, Value};
use std::sync::OnceLock;
use std::collections::BTreeMap;

/// Action tag for device interactions, stored internally in the flattened
/// form `GPO_INTERACTION:<asset>:<mode>`.
pub const GPO_INTERACTION: &str = "GPO_INTERACTION";

const KNOWN_ACTIONS: &[&str] = &["EMAIL", "SMS", "AUTOMATION"];

/// The five result buckets an evaluation can land in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResultBucket {
    Ok,
    LowWarning,
    LowCritical,
    HighWarning,
    HighCritical,
}

impl ResultBucket {
    pub const ALL: [ResultBucket; 5] = [
        ResultBucket::Ok,
        ResultBucket::LowWarning,
        ResultBucket::LowCritical,
        ResultBucket::HighWarning,
        ResultBucket::HighCritical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResultBucket::Ok => "ok",
            ResultBucket::LowWarning => "low_warning",
            ResultBucket::LowCritical => "low_critical",
            ResultBucket::HighWarning => "high_warning",
            ResultBucket::HighCritical => "high_critical",
        }
    }

    pub fn from_key(key: &str) -> Option<ResultBucket> {
        ResultBucket::ALL.into_iter().find(|b| b.as_str() == key)
    }

    /// Maps a valid result code to its bucket.
    pub fn from_code(code: i32) -> Option<ResultBucket> {
        match code {
            -2 => Some(ResultBucket::LowCritical),
            -1 => Some(ResultBucket::LowWarning),
            0 => Some(ResultBucket::Ok),
            1 => Some(ResultBucket::HighWarning),
            2 => Some(ResultBucket::HighCritical),
            _ => None,
        }
    }
}

/// One alarm rule: a declarative filter (asset/group/model/type predicates)
/// bound to a Lua evaluation returning a message and a result code.
///
/// Rules are immutable once loaded; an edit replaces the rule wholesale,
/// which also discards the lazily compiled script state.
pub struct Rule {
    name: String,
    description: String,
    logical_asset: String,
    metrics: Vec<String>,
    assets: Vec<String>,
    groups: Vec<String>,
    models: Vec<String>,
    types: Vec<String>,
    result_actions: BTreeMap<ResultBucket, Vec<String>>,
    variables: BTreeMap<String, String>,
    evaluation: String,
    // Compiled lazily on first evaluation; None after a failed compile,
    // which keeps the rule inert until it is replaced.
    script: OnceLock<Option<CompiledScript>>,
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("logical_asset", &self.logical_asset)
            .field("metrics", &self.metrics)
            .field("assets", &self.assets)
            .field("groups", &self.groups)
            .field("models", &self.models)
            .field("types", &self.types)
            .field("result_actions", &self.result_actions)
            .field("variables", &self.variables)
            .field("evaluation", &self.evaluation)
            .finish()
    }
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.description == other.description
            && self.logical_asset == other.logical_asset
            && self.metrics == other.metrics
            && self.assets == other.assets
            && self.groups == other.groups
            && self.models == other.models
            && self.types == other.types
            && self.result_actions == other.result_actions
            && self.variables == other.variables
            && self.evaluation == other.evaluation
    }
}

impl Rule {
    /// Parses a rule from JSON. The top level may be the rule object itself
    /// or an envelope `{"flexible": <rule>}`.
    ///
    /// All fields are optional except `name`. The `results` object accepts
    /// both the legacy shape (`"action": ["EMAIL", "SMS"]`) and the
    /// structured one (`"action": [{"action": "EMAIL"}, …]`);
    /// `GPO_INTERACTION` entries are collapsed to
    /// `GPO_INTERACTION:<asset>:<mode>` internally.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::InvalidJson`] when the document is not valid
    /// JSON or a field has the wrong shape. Nothing is partially applied
    /// on failure.
    pub fn parse(json: &str) -> Result<Rule> {
        let doc: Value =
            serde_json::from_str(json).map_err(|e| RuleError::InvalidJson(e.to_string()))?;
        let body = match doc.get("flexible") {
            Some(v) if !v.is_null() => v,
            _ => &doc,
        };
        let obj = body
            .as_object()
            .ok_or_else(|| RuleError::InvalidJson("rule document is not an object".into()))?;

        let name = string_field(obj, "name")?.unwrap_or_default();
        if name.is_empty() {
            return Err(RuleError::InvalidJson("rule has no name".into()));
        }

        let mut result_actions = BTreeMap::new();
        if let Some(results) = obj.get("results").filter(|v| !v.is_null()) {
            let results = results
                .as_object()
                .ok_or_else(|| RuleError::InvalidJson("'results' is not an object".into()))?;
            for (key, entry) in results {
                let bucket = ResultBucket::from_key(key).ok_or_else(|| {
                    RuleError::InvalidJson(format!("unknown result bucket '{key}'"))
                })?;
                let entry = entry.as_object().ok_or_else(|| {
                    RuleError::InvalidJson(format!("results/{key} is not an object"))
                })?;
                let actions = entry
                    .get("action")
                    .and_then(Value::as_array)
                    .ok_or_else(|| {
                        RuleError::InvalidJson(format!("'action' array missing (results/{key})"))
                    })?;
                let mut list = Vec::with_capacity(actions.len());
                for item in actions {
                    list.push(parse_action(key, item)?);
                }
                result_actions.insert(bucket, list);
            }
        }

        let mut variables = BTreeMap::new();
        if let Some(vars) = obj.get("variables").filter(|v| !v.is_null()) {
            let vars = vars
                .as_object()
                .ok_or_else(|| RuleError::InvalidJson("'variables' is not an object".into()))?;
            for (key, value) in vars {
                let value = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => {
                        return Err(RuleError::InvalidJson(format!(
                            "variable '{key}' is not a scalar"
                        )))
                    }
                };
                variables.insert(key.clone(), value);
            }
        }

        Ok(Rule {
            name,
            description: string_field(obj, "description")?.unwrap_or_default(),
            logical_asset: string_field(obj, "logical_asset")?.unwrap_or_default(),
            metrics: list_field(obj, "metrics")?,
            assets: list_field(obj, "assets")?,
            groups: list_field(obj, "groups")?,
            models: list_field(obj, "models")?,
            types: list_field(obj, "types")?,
            result_actions,
            variables,
            evaluation: string_field(obj, "evaluation")?.unwrap_or_default(),
            script: OnceLock::new(),
        })
    }

    /// Serializes the rule to its canonical JSON form.
    ///
    /// The inverse of [`Rule::parse`] at the semantic level: values, list
    /// orderings and action expansions round-trip, key order does not.
    /// Legacy action tags are upgraded to the structured shape; flattened
    /// `GPO_INTERACTION` strings are expanded back to objects.
    pub fn serialize(&self) -> String {
        let mut root = Map::new();
        root.insert("name".into(), Value::String(self.name.clone()));
        root.insert("description".into(), Value::String(self.description.clone()));
        root.insert(
            "logical_asset".into(),
            Value::String(self.logical_asset.clone()),
        );

        let lists: [(&str, &Vec<String>); 5] = [
            ("metrics", &self.metrics),
            ("assets", &self.assets),
            ("models", &self.models),
            ("groups", &self.groups),
            ("types", &self.types),
        ];
        for (key, list) in lists {
            let items = list.iter().cloned().map(Value::String).collect();
            root.insert(key.into(), Value::Array(items));
        }

        let mut results = Map::new();
        for (bucket, actions) in &self.result_actions {
            let expanded: Vec<Value> = actions
                .iter()
                .map(|a| action_to_json(&self.name, a))
                .collect();
            let mut entry = Map::new();
            entry.insert("action".into(), Value::Array(expanded));
            results.insert(bucket.as_str().into(), Value::Object(entry));
        }
        root.insert("results".into(), Value::Object(results));

        if !self.variables.is_empty() {
            let vars = self
                .variables
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            root.insert("variables".into(), Value::Object(vars));
        }

        root.insert("evaluation".into(), Value::String(self.evaluation.clone()));
        Value::Object(root).to_string()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Override iname carried in emitted alerts, when non-empty.
    pub fn logical_asset(&self) -> &str {
        &self.logical_asset
    }

    /// Asset iname encoded in the rule name (suffix after the last `@`).
    pub fn asset(&self) -> Option<&str> {
        self.name.rsplit_once('@').map(|(_, asset)| asset)
    }

    /// Quantities required by the script, in declaration order. This order
    /// is the script's parameter order.
    pub fn metrics(&self) -> &[String] {
        &self.metrics
    }

    pub fn evaluation(&self) -> &str {
        &self.evaluation
    }

    pub fn variables(&self) -> &BTreeMap<String, String> {
        &self.variables
    }

    pub fn has_metric(&self, quantity: &str) -> bool {
        self.metrics.iter().any(|m| m == quantity)
    }

    pub fn has_asset(&self, iname: &str) -> bool {
        self.assets.iter().any(|a| a == iname)
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }

    pub fn has_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    pub fn has_type(&self, type_name: &str) -> bool {
        self.types.iter().any(|t| t == type_name)
    }

    /// Actions configured for a result code; empty when the bucket has no
    /// entry or the code is out of range.
    pub fn actions_for(&self, code: i32) -> &[String] {
        ResultBucket::from_code(code)
            .and_then(|bucket| self.result_actions.get(&bucket))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Replaces this rule's actions with another rule's. Used when an
    /// autoconfig update omits the actions a user already configured.
    pub fn adopt_actions_from(&mut self, other: &Rule) {
        self.result_actions = other.result_actions.clone();
    }

    /// Evaluates the rule script against the metric values, given in
    /// [`Rule::metrics`] order.
    ///
    /// The script is compiled on the first call and reused afterwards.
    /// A failed compile leaves the rule inert until it is replaced; every
    /// later call returns [`ScriptError::Inert`] without re-logging.
    pub fn evaluate(
        &self,
        values: &[String],
        iname: &str,
        display_name: Option<&str>,
    ) -> std::result::Result<Evaluation, ScriptError> {
        let script = self.script.get_or_init(|| {
            match CompiledScript::compile(&self.evaluation, &self.variables) {
                Ok(script) => Some(script),
                Err(e) => {
                    tracing::error!(
                        rule = %self.name,
                        error = %e,
                        "Script compilation failed, rule is inert until replaced"
                    );
                    None
                }
            }
        });
        match script {
            Some(script) => script.call(values, iname, display_name),
            None => Err(ScriptError::Inert),
        }
    }
}

fn string_field(obj: &Map<String, Value>, key: &str) -> Result<Option<String>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(RuleError::InvalidJson(format!("'{key}' is not a string"))),
    }
}

fn list_field(obj: &Map<String, Value>, key: &str) -> Result<Vec<String>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => {
            let mut list = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => list.push(s.clone()),
                    _ => {
                        return Err(RuleError::InvalidJson(format!(
                            "'{key}' contains a non-string entry"
                        )))
                    }
                }
            }
            Ok(list)
        }
        Some(_) => Err(RuleError::InvalidJson(format!("'{key}' is not an array"))),
    }
}

fn parse_action(bucket: &str, item: &Value) -> Result<String> {
    match item {
        // legacy shape: ["EMAIL", "SMS"]
        Value::String(tag) => Ok(tag.clone()),
        Value::Object(act) => {
            let tag = act.get("action").and_then(Value::as_str).ok_or_else(|| {
                RuleError::InvalidJson(format!("action entry without 'action' (results/{bucket})"))
            })?;
            if tag == GPO_INTERACTION {
                let asset = act.get("asset").and_then(Value::as_str).ok_or_else(|| {
                    RuleError::InvalidJson(format!(
                        "GPO_INTERACTION without 'asset' (results/{bucket})"
                    ))
                })?;
                let mode = act.get("mode").and_then(Value::as_str).ok_or_else(|| {
                    RuleError::InvalidJson(format!(
                        "GPO_INTERACTION without 'mode' (results/{bucket})"
                    ))
                })?;
                Ok(format!("{GPO_INTERACTION}:{asset}:{mode}"))
            } else {
                Ok(tag.to_string())
            }
        }
        _ => Err(RuleError::InvalidJson(format!(
            "invalid action entry (results/{bucket})"
        ))),
    }
}

fn action_to_json(rule: &str, action: &str) -> Value {
    if let Some(rest) = action.strip_prefix("GPO_INTERACTION:") {
        let (asset, mode) = rest.split_once(':').unwrap_or((rest, ""));
        let mut obj = Map::new();
        obj.insert("action".into(), Value::String(GPO_INTERACTION.into()));
        obj.insert("asset".into(), Value::String(asset.into()));
        obj.insert("mode".into(), Value::String(mode.into()));
        Value::Object(obj)
    } else {
        if !KNOWN_ACTIONS.contains(&action) {
            tracing::warn!(rule, action, "Unknown action tag");
        }
        let mut obj = Map::new();
        obj.insert("action".into(), Value::String(action.into()));
        Value::Object(obj)
    }
}
