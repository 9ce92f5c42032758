use crate::bus::{BusClient, BusEvent};
use crate::cache::{truncate_sensor_quantity, MetricCache};
use crate::mailbox::{self, MailboxContext};
use crate::registry::AssetRegistry;
use crate::shm::SharedMetricStore;
use chrono::Utc;
use flexmon_common::types::{Alert, AlertState, AssetMessage, AssetOperation, MetricSample, Severity};
use flexmon_common::{
    ASSET_AGENT_ADDRESS, STREAM_LICENSING, STREAM_METRICS, STREAM_METRICS_SENSOR,
};
use flexmon_rule::{Rule, RuleStore};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Soft deadline for REPUBLISH requests to the asset service.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);
/// Soft deadline for mailbox replies.
const REPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Control commands for a running engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Term,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding the persistent `.rule` files.
    pub rules_dir: PathBuf,
    /// Directory of the shared-metric store, if one is attached.
    pub shm_dir: Option<PathBuf>,
    /// Glob filter on asset inames read from the shared-metric store.
    pub assets_pattern: String,
    /// Glob filter on quantities read from the shared-metric store.
    pub metrics_pattern: String,
    /// Period of the evaluation tick.
    pub polling_interval: Duration,
    /// Mailbox address of the external asset service.
    pub asset_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            rules_dir: PathBuf::from("rules"),
            shm_dir: None,
            assets_pattern: "*".to_string(),
            metrics_pattern: "*".to_string(),
            polling_interval: Duration::from_secs(30),
            asset_agent: ASSET_AGENT_ADDRESS.to_string(),
        }
    }
}

/// The alarm engine. Owns all mutable state (rule store, metric cache,
/// asset registry); the periodic ticker runs as a separate task and only
/// sends tick messages, so an evaluation pass never interleaves with bus
/// events.
pub struct Engine {
    cfg: EngineConfig,
    store: RuleStore,
    cache: MetricCache,
    registry: AssetRegistry,
    shm: Option<SharedMetricStore>,
    bus: Arc<dyn BusClient>,
}

impl Engine {
    pub fn new(cfg: EngineConfig, bus: Arc<dyn BusClient>) -> Engine {
        let store = RuleStore::open(&cfg.rules_dir);
        let shm = cfg.shm_dir.as_ref().map(SharedMetricStore::new);
        Engine {
            cfg,
            store,
            cache: MetricCache::new(),
            registry: AssetRegistry::new(),
            shm,
            bus,
        }
    }

    /// Loads every rule from the rules directory and asks the asset
    /// service to re-announce the assets they reference. Per-file load
    /// failures are logged and skipped. Returns the number of rules.
    pub async fn load_rules(&mut self) -> usize {
        let loaded = match self.store.load_all() {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::error!(dir = %self.cfg.rules_dir.display(), error = %e, "Failed to scan rules directory");
                return 0;
            }
        };

        let assets: Vec<String> = loaded
            .iter()
            .filter_map(|name| self.store.get(name))
            .filter_map(|rule| rule.asset())
            .map(str::to_string)
            .collect();
        self.republish(assets).await;

        self.store.len()
    }

    /// Runs until a [`Command::Term`] arrives or the event channel closes.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<BusEvent>,
        mut control: mpsc::Receiver<Command>,
    ) {
        tracing::info!(
            polling_secs = self.cfg.polling_interval.as_secs(),
            rules = self.store.len(),
            "Engine started"
        );

        // The ticker shares no state with the engine; it only sends ticks.
        let (tick_tx, mut tick_rx) = mpsc::channel::<()>(1);
        let period = self.cfg.polling_interval;
        let ticker = tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick fires immediately; skip it so startup can settle
            tick.tick().await;
            loop {
                tick.tick().await;
                if tick_tx.send(()).await.is_err() {
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        tracing::info!("Event channel closed");
                        break;
                    }
                },
                Some(()) = tick_rx.recv() => self.on_tick().await,
                command = control.recv() => match command {
                    Some(Command::Term) | None => {
                        tracing::info!("Terminating");
                        break;
                    }
                },
            }
        }

        ticker.abort();
        tracing::info!("Engine ended");
    }

    async fn handle_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::Asset(asset) => self.handle_asset(asset).await,
            BusEvent::Metric { stream, sample } => self.handle_metric(&stream, sample).await,
            BusEvent::Mailbox {
                sender,
                subject,
                tracker,
                frames,
            } => self.handle_mailbox(&sender, &subject, tracker.as_deref(), &frames).await,
        }
    }

    async fn handle_asset(&mut self, asset: AssetMessage) {
        tracing::debug!(
            operation = ?asset.operation,
            asset = %asset.iname,
            status = asset.status(),
            "Asset announcement"
        );

        if asset.operation == AssetOperation::Delete || asset.status() != "active" {
            self.registry.purge(&asset.iname);

            // Cascade: drop the rules that were created for this asset.
            // Rules that merely list it among others are preserved.
            let doomed: Vec<String> = self
                .store
                .iter()
                .filter(|rule| rule.asset() == Some(asset.iname.as_str()))
                .map(|rule| rule.name().to_string())
                .collect();
            for name in doomed {
                let mut ctx = MailboxContext {
                    store: &mut self.store,
                    registry: &mut self.registry,
                };
                if let Err(e) = mailbox::remove_rule(&mut ctx, &name) {
                    tracing::error!(rule = %name, error = %e, "Cascade delete failed");
                }
            }
            return;
        }

        if matches!(
            asset.operation,
            AssetOperation::Update | AssetOperation::Inventory
        ) {
            self.registry.rebind(&asset, &self.store);
        }
    }

    async fn handle_metric(&mut self, stream: &str, mut sample: MetricSample) {
        if stream == STREAM_METRICS || stream == STREAM_LICENSING {
            sample.time = Utc::now();
            self.cache_sample(sample);
        } else if stream == STREAM_METRICS_SENSOR {
            // only GPI contacts are recognized on the sensor stream
            if !is_metric_gpi(&sample) {
                return;
            }
            let Some(sname) = sample.aux.get("sname").cloned() else {
                tracing::warn!(asset = %sample.asset, "No aux 'sname' provided for sensor");
                return;
            };
            if !self.registry.is_bound(&sname) {
                tracing::debug!(sensor = %sname, "Asking republish for unknown sensor");
                self.republish(vec![sname.clone()]).await;
            }
            // the sample belongs to the sensor itself, not the host device
            sample.asset = sname;
            sample.time = Utc::now();
            self.cache_sample(sample);
        } else {
            tracing::debug!(stream, "Metric on unexpected stream, dropped");
        }
    }

    /// Cache-write policy: keep the sample only when a rule bound to the
    /// asset declares its quantity. Sensors connected to other sensors
    /// publish `status.<PORT>.<INDEX>`; the index is truncated before the
    /// lookup.
    fn cache_sample(&mut self, mut sample: MetricSample) {
        let Some(bound) = self.registry.bound_rules(&sample.asset) else {
            return;
        };

        if sample.aux.contains_key("ext-port") {
            let truncated = match truncate_sensor_quantity(&sample.quantity) {
                Some(truncated) => truncated.to_string(),
                None => {
                    tracing::error!(
                        asset = %sample.asset,
                        quantity = %sample.quantity,
                        "Malformed sensor quantity"
                    );
                    return;
                }
            };
            sample.quantity = truncated;
        }

        let wanted = bound
            .iter()
            .filter_map(|name| self.store.get(name))
            .any(|rule| rule.has_metric(&sample.quantity));
        if wanted {
            tracing::debug!(topic = %sample.topic(), value = %sample.value, "Metric cached");
            self.cache.upsert(sample);
        }
    }

    async fn handle_mailbox(
        &mut self,
        sender: &str,
        subject: &str,
        tracker: Option<&str>,
        frames: &[String],
    ) {
        let mut ctx = MailboxContext {
            store: &mut self.store,
            registry: &mut self.registry,
        };
        let Some(outcome) = mailbox::dispatch(&mut ctx, sender, frames) else {
            return;
        };

        // Reply first; the republish side effect must not delay it.
        let reply = self
            .bus
            .sendto(sender, subject, tracker, outcome.reply);
        match tokio::time::timeout(REPLY_TIMEOUT, reply).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(peer = sender, error = %e, "Failed to send reply"),
            Err(_) => tracing::error!(peer = sender, "Reply timed out"),
        }

        self.republish(outcome.republish).await;
    }

    /// Asks the asset service to re-announce the given assets so bindings
    /// re-materialize promptly. Failures are logged, not retried.
    async fn republish(&mut self, assets: Vec<String>) {
        let mut seen = HashSet::new();
        let frames: Vec<String> = assets
            .into_iter()
            .filter(|a| !a.is_empty() && seen.insert(a.clone()))
            .collect();
        if frames.is_empty() {
            return;
        }

        tracing::debug!(assets = %frames.join(" "), "REPUBLISH");
        let send = self
            .bus
            .sendto(&self.cfg.asset_agent, "REPUBLISH", None, frames);
        match tokio::time::timeout(SEND_TIMEOUT, send).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "REPUBLISH failed"),
            Err(_) => tracing::error!("REPUBLISH timed out"),
        }
    }

    /// One evaluation tick: pick up shared-store samples, sweep expired
    /// ones, then evaluate every rule whose metrics are all present.
    async fn on_tick(&mut self) {
        if let Some(shm) = &self.shm {
            let samples = shm.read_matching(&self.cfg.assets_pattern, &self.cfg.metrics_pattern);
            tracing::debug!(count = samples.len(), "Read metrics from shared store");
            for sample in samples {
                self.cache_sample(sample);
            }
        }

        self.cache.sweep(Utc::now());

        let mut alerts = Vec::new();
        for rule in self.store.iter() {
            if let Some(outbound) = self.evaluate_rule(rule) {
                alerts.push(outbound);
            }
        }

        for (topic, alert) in alerts {
            if alert.severity == Severity::Ok {
                tracing::debug!(topic = %topic, asset = %alert.asset, "Alert");
            } else {
                tracing::info!(topic = %topic, asset = %alert.asset, severity = %alert.severity, "Alert");
            }
            if let Err(e) = self.bus.publish_alert(&topic, &alert).await {
                tracing::error!(topic = %topic, error = %e, "Failed to publish alert");
            }
        }
    }

    /// Evaluates one rule against the cache. Returns the outbound topic
    /// and alert when the rule produced a valid result; writes the audit
    /// record in every case.
    fn evaluate_rule(&self, rule: &Rule) -> Option<(String, Alert)> {
        let asset = rule.asset()?;

        let mut values = Vec::with_capacity(rule.metrics().len());
        let mut audit_values = String::new();
        let mut min_ttl: u32 = 0;
        for quantity in rule.metrics() {
            let Some(sample) = self.cache.get(quantity, asset) else {
                tracing::trace!(
                    rule = %rule.name(),
                    metric = %format!("{quantity}@{asset}"),
                    "Evaluation aborted, metric missing"
                );
                push_audit_value(&mut audit_values, quantity, None);
                audit(AuditOutcome::Unknown, rule.name(), &audit_values);
                return None;
            };
            if min_ttl == 0 || sample.ttl_secs < min_ttl {
                min_ttl = sample.ttl_secs;
            }
            push_audit_value(&mut audit_values, quantity, Some(&sample.value));
            values.push(sample.value.clone());
        }

        let display_name = self.registry.display_name(asset);
        match rule.evaluate(&values, asset, display_name) {
            Ok(eval) => {
                tracing::debug!(
                    rule = %rule.name(),
                    asset,
                    result = eval.code,
                    "Rule evaluated"
                );
                let outcome = match eval.code {
                    0 => AuditOutcome::Resolved,
                    -1 | 1 => AuditOutcome::ActiveWarning,
                    _ => AuditOutcome::ActiveCritical,
                };
                audit(outcome, rule.name(), &audit_values);

                let severity = Severity::from_result(eval.code);
                let state = if eval.code == 0 {
                    AlertState::Resolved
                } else {
                    AlertState::Active
                };
                let topic = format!("{}/{}@{}", rule.name(), severity, asset);
                let logical = rule.logical_asset();
                let alert = Alert {
                    rule: rule.name().to_string(),
                    asset: if logical.is_empty() {
                        asset.to_string()
                    } else {
                        logical.to_string()
                    },
                    state,
                    severity,
                    message: eval.message,
                    ttl_secs: min_ttl * 5 / 2,
                    actions: rule.actions_for(eval.code).to_vec(),
                    time: Utc::now(),
                };
                Some((topic, alert))
            }
            Err(e) => {
                tracing::error!(rule = %rule.name(), error = %e, "Error evaluating rule");
                audit(AuditOutcome::Error, rule.name(), &audit_values);
                None
            }
        }
    }
}

fn push_audit_value(audit_values: &mut String, quantity: &str, value: Option<&str>) {
    if !audit_values.is_empty() {
        audit_values.push_str(", ");
    }
    audit_values.push_str(quantity);
    audit_values.push('=');
    audit_values.push_str(value.unwrap_or(""));
}

#[derive(Debug, Clone, Copy)]
enum AuditOutcome {
    Unknown,
    Resolved,
    ActiveWarning,
    ActiveCritical,
    Error,
}

impl AuditOutcome {
    fn as_str(self) -> &'static str {
        match self {
            AuditOutcome::Unknown => "UNKNOWN",
            AuditOutcome::Resolved => "RESOLVED",
            AuditOutcome::ActiveWarning => "ACTIVE/W",
            AuditOutcome::ActiveCritical => "ACTIVE/C",
            AuditOutcome::Error => "ERROR",
        }
    }
}

/// One audit record per rule per tick, on the dedicated `audit` target.
fn audit(outcome: AuditOutcome, rule: &str, values: &str) {
    tracing::info!(target: "audit", "{:>8} {} ({})", outcome.as_str(), rule, values);
}

/// A sensor metric belongs to a GPI contact when it carries an `ext-port`
/// aux (sensor daisy-chained behind another sensor) or its `port` aux
/// names a GPI port.
fn is_metric_gpi(sample: &MetricSample) -> bool {
    if sample.aux.contains_key("ext-port") {
        return true;
    }
    sample
        .aux
        .get("port")
        .is_some_and(|port| port.contains("GPI"))
}
