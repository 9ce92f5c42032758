//! Rule-management mailbox protocol: LIST, LIST2, GET, ADD, DELETE.
//!
//! Handlers are synchronous over the engine state and return the reply
//! frames plus any republish side effects, which the engine loop carries
//! out only after the reply has been sent.

use crate::categories;
use crate::registry::AssetRegistry;
use flexmon_common::assets;
use flexmon_common::AUTOCONFIG_SENDER;
use flexmon_rule::{Rule, RuleError, RuleStore};
use serde::Deserialize;

/// Mutable engine state a request may touch.
pub struct MailboxContext<'a> {
    pub store: &'a mut RuleStore,
    pub registry: &'a mut AssetRegistry,
}

/// Reply frames and deferred side effects of one request.
pub struct MailboxOutcome {
    pub reply: Vec<String>,
    /// Assets to ask the asset service to re-announce, after replying.
    pub republish: Vec<String>,
}

impl MailboxOutcome {
    fn reply(frames: Vec<String>) -> MailboxOutcome {
        MailboxOutcome {
            reply: frames,
            republish: Vec::new(),
        }
    }
}

/// Dispatches one mailbox request. Returns `None` for an unknown verb
/// (logged, no reply — the peer times out).
pub fn dispatch(ctx: &mut MailboxContext, sender: &str, frames: &[String]) -> Option<MailboxOutcome> {
    let verb = frames.first().map(String::as_str)?;
    let p1 = frames.get(1).map(String::as_str);
    let p2 = frames.get(2).map(String::as_str);

    match verb {
        "LIST" => {
            tracing::info!(sender, r#type = p1.unwrap_or(""), "LIST");
            Some(list_rules(ctx.store, p1.unwrap_or(""), p2.unwrap_or("")))
        }
        "LIST2" => {
            tracing::info!(sender, filter = p1.unwrap_or(""), "LIST2");
            Some(list_rules2(ctx, p1.unwrap_or("")))
        }
        "GET" => {
            tracing::info!(sender, rule = p1.unwrap_or(""), "GET");
            Some(get_rule(ctx.store, p1.unwrap_or("")))
        }
        "ADD" => {
            tracing::info!(sender, old_name = p2.unwrap_or(""), "ADD");
            Some(add_rule(ctx, sender, p1.unwrap_or(""), p2))
        }
        "DELETE" => {
            tracing::info!(sender, rule = p1.unwrap_or(""), "DELETE");
            Some(delete_rule(ctx, p1.unwrap_or("")))
        }
        _ => {
            tracing::warn!(sender, verb, "Mailbox command not handled");
            None
        }
    }
}

fn flexible_frame(rule: &Rule) -> String {
    format!("{{\"flexible\":{}}}", rule.serialize())
}

fn error_reply(reason: &str) -> MailboxOutcome {
    MailboxOutcome::reply(vec!["ERROR".into(), reason.into()])
}

fn list_rules(store: &RuleStore, rule_type: &str, rule_class: &str) -> MailboxOutcome {
    if !matches!(rule_type, "" | "all" | "flexible") {
        tracing::warn!(r#type = rule_type, "LIST type is invalid");
        return error_reply("INVALID_TYPE");
    }

    let mut reply = vec!["LIST".to_string(), rule_type.to_string(), rule_class.to_string()];
    reply.extend(store.iter().map(flexible_frame));
    MailboxOutcome::reply(reply)
}

/// LIST2 filter payload. Unknown fields are ignored; every field is
/// optional. `rule_class` is accepted and ignored.
#[derive(Debug, Default, Deserialize)]
struct ListFilter {
    #[serde(rename = "type")]
    rule_type: Option<String>,
    #[allow(dead_code)]
    rule_class: Option<String>,
    asset_type: Option<String>,
    asset_sub_type: Option<String>,
    #[serde(rename = "in")]
    location: Option<String>,
    category: Option<String>,
}

fn list_rules2(ctx: &mut MailboxContext, payload: &str) -> MailboxOutcome {
    let filter: ListFilter = match serde_json::from_str(payload) {
        Ok(filter) => filter,
        Err(e) => {
            tracing::warn!(error = %e, "LIST2 filter is not valid JSON");
            return error_reply("INVALID_INPUT");
        }
    };

    if let Some(t) = filter.rule_type.as_deref() {
        if !matches!(t, "" | "all" | "flexible") {
            return error_reply("INVALID_TYPE");
        }
    }
    if let Some(t) = filter.asset_type.as_deref() {
        if !t.is_empty() && !assets::is_known_type(t) {
            return error_reply("INVALID_ASSET_TYPE");
        }
    }
    if let Some(t) = filter.asset_sub_type.as_deref() {
        if !t.is_empty() && !assets::is_known_subtype(t) {
            return error_reply("INVALID_ASSET_SUB_TYPE");
        }
    }
    if let Some(location) = filter.location.as_deref() {
        if !location.is_empty() {
            let kind = location.rsplit_once('-').map(|(kind, _)| kind).unwrap_or("");
            if !assets::is_location_type(kind) {
                return error_reply("INVALID_IN");
            }
        }
    }
    let category_tokens: Vec<&str> = filter
        .category
        .as_deref()
        .unwrap_or("")
        .split(',')
        .filter(|token| !token.is_empty())
        .collect();
    if filter.category.as_deref().is_some_and(|c| !c.is_empty()) && category_tokens.is_empty() {
        return error_reply("INVALID_CATEGORY");
    }

    let matches = |rule: &Rule| -> bool {
        let rule_asset = rule.asset().unwrap_or("");
        let type_prefix = rule_asset.rsplit_once('-').map(|(kind, _)| kind).unwrap_or("");

        if let Some(wanted) = filter.asset_type.as_deref().filter(|t| !t.is_empty()) {
            // "device" matches any asset whose kind is a known device
            // sub-type.
            if wanted == "device" {
                if !assets::is_known_subtype(type_prefix) {
                    return false;
                }
            } else if wanted != type_prefix {
                return false;
            }
        }
        if let Some(wanted) = filter.asset_sub_type.as_deref().filter(|t| !t.is_empty()) {
            if wanted != type_prefix {
                return false;
            }
        }
        if let Some(location) = filter.location.as_deref().filter(|l| !l.is_empty()) {
            if !ctx.registry.is_in_location(rule_asset, location) {
                return false;
            }
        }
        if !category_tokens.is_empty() {
            let rule_tokens = categories::tokens_for_rule_name(rule.name());
            if !category_tokens.iter().any(|t| rule_tokens.contains(t)) {
                return false;
            }
        }
        true
    };

    let mut reply = vec!["LIST2".to_string(), payload.to_string()];
    for rule in ctx.store.iter() {
        if matches(rule) {
            tracing::debug!(rule = %rule.name(), "LIST2 add rule");
            reply.push(flexible_frame(rule));
        } else {
            tracing::debug!(rule = %rule.name(), "LIST2 skip rule");
        }
    }
    MailboxOutcome::reply(reply)
}

fn get_rule(store: &RuleStore, name: &str) -> MailboxOutcome {
    match store.get(name) {
        Some(rule) => MailboxOutcome::reply(vec!["OK".into(), rule.serialize()]),
        None => error_reply("NOT_FOUND"),
    }
}

fn add_rule(
    ctx: &mut MailboxContext,
    sender: &str,
    json: &str,
    old_name: Option<&str>,
) -> MailboxOutcome {
    let mut rule = match Rule::parse(json) {
        Ok(rule) => rule,
        Err(e) => {
            tracing::warn!(sender, error = %e, "ADD rejected");
            return error_reply("INVALID_JSON");
        }
    };

    // Autoconfig re-announces gpio rules without the actions a user may
    // have configured; keep the previous ones in that case.
    let incomplete = sender == AUTOCONFIG_SENDER;
    if incomplete {
        if let Some(old) = ctx.store.get(rule.name()) {
            if old.name().contains("sensorgpio") {
                tracing::info!(rule = %rule.name(), "Merging actions of incomplete rule");
                rule.adopt_actions_from(old);
            }
        }
    }

    if let Some(old_name) = old_name.filter(|n| !n.is_empty()) {
        tracing::info!(rule = old_name, "Deleting replaced rule");
        if let Err(e) = remove_rule(ctx, old_name) {
            tracing::warn!(rule = old_name, error = %e, "Failed to delete replaced rule");
        }
    }

    if ctx.store.contains(rule.name()) && !rule.name().contains("sensorgpio") {
        tracing::error!(rule = %rule.name(), "Rule exists");
        return error_reply("ALREADY_EXISTS");
    }

    let name = rule.name().to_string();
    let rule_asset = rule.asset().map(str::to_string);
    if let Err(e) = ctx.store.add(rule) {
        tracing::error!(rule = %name, error = %e, "Failed to save rule");
        return error_reply("SAVE_FAILURE");
    }
    tracing::info!(rule = %name, "Rule saved");

    // The binding index re-materializes when the asset service re-announces
    // the assets this rule references.
    let mut republish: Vec<String> = rule_asset.into_iter().collect();
    if let Some(rule) = ctx.store.get(&name) {
        republish.extend(
            ctx.registry
                .assets()
                .filter(|asset| rule.has_asset(asset))
                .map(str::to_string),
        );
    }

    MailboxOutcome {
        reply: vec!["OK".into(), json.to_string()],
        republish,
    }
}

fn delete_rule(ctx: &mut MailboxContext, name: &str) -> MailboxOutcome {
    let mut reply = vec!["DELETE".to_string(), name.to_string()];
    match remove_rule(ctx, name) {
        Ok(()) => reply.push("OK".into()),
        Err(RuleError::DoesNotExist(_)) => {
            reply.push("ERROR".into());
            reply.push("DOES_NOT_EXISTS".into());
        }
        Err(e) => {
            tracing::error!(rule = name, error = %e, "Cannot delete rule");
            reply.push("ERROR".into());
            reply.push("CAN_NOT_REMOVE".into());
        }
    }
    MailboxOutcome::reply(reply)
}

/// Removes a rule from disk, memory and every binding list.
pub fn remove_rule(ctx: &mut MailboxContext, name: &str) -> Result<(), RuleError> {
    ctx.store.remove(name)?;
    ctx.registry.unbind_rule(name);
    tracing::info!(rule = name, "Rule deleted");
    Ok(())
}
