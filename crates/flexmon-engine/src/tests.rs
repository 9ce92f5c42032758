use crate::bus::{BusEvent, MemoryBus, MemoryBusOutput, SentMessage};
use crate::cache::{truncate_sensor_quantity, MetricCache};
use crate::categories::tokens_for_rule_name;
use crate::engine::{Command, Engine, EngineConfig};
use crate::registry::{is_rule_for_asset, AssetRegistry};
use crate::shm::SharedMetricStore;
use chrono::Utc;
use flexmon_common::types::{
    AlertState, AssetMessage, AssetOperation, MetricSample, Severity,
};
use flexmon_common::{ASSET_AGENT_ADDRESS, STREAM_METRICS, STREAM_METRICS_SENSOR};
use flexmon_rule::{Rule, RuleStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct TestEngine {
    events: mpsc::Sender<BusEvent>,
    #[allow(dead_code)]
    control: mpsc::Sender<Command>,
    output: MemoryBusOutput,
    rules_dir: tempfile::TempDir,
    #[allow(dead_code)]
    shm_dir: tempfile::TempDir,
    shm: SharedMetricStore,
}

async fn start(rules: &[(&str, &str)]) -> TestEngine {
    let rules_dir = tempfile::tempdir().unwrap();
    for (name, json) in rules {
        std::fs::write(rules_dir.path().join(format!("{name}.rule")), json).unwrap();
    }
    let shm_dir = tempfile::tempdir().unwrap();
    let shm = SharedMetricStore::new(shm_dir.path());

    let cfg = EngineConfig {
        rules_dir: rules_dir.path().to_path_buf(),
        shm_dir: Some(shm_dir.path().to_path_buf()),
        polling_interval: Duration::from_millis(100),
        ..Default::default()
    };
    let (bus, output) = MemoryBus::new();
    let mut engine = Engine::new(cfg, Arc::new(bus));
    engine.load_rules().await;

    let (events_tx, events_rx) = mpsc::channel(64);
    let (control_tx, control_rx) = mpsc::channel(4);
    tokio::spawn(engine.run(events_rx, control_rx));

    TestEngine {
        events: events_tx,
        control: control_tx,
        output,
        rules_dir,
        shm_dir,
        shm,
    }
}

/// Next mailbox reply, skipping REPUBLISH traffic to the asset service.
async fn next_reply(output: &mut MemoryBusOutput) -> SentMessage {
    loop {
        let sent = timeout(RECV_TIMEOUT, output.sends.recv())
            .await
            .expect("reply in time")
            .expect("bus open");
        if sent.subject != "REPUBLISH" {
            return sent;
        }
    }
}

/// Next REPUBLISH request to the asset service.
async fn next_republish(output: &mut MemoryBusOutput) -> SentMessage {
    loop {
        let sent = timeout(RECV_TIMEOUT, output.sends.recv())
            .await
            .expect("republish in time")
            .expect("bus open");
        if sent.subject == "REPUBLISH" {
            assert_eq!(sent.address, ASSET_AGENT_ADDRESS);
            return sent;
        }
    }
}

fn ok_rule(name: &str, metric: &str) -> String {
    let asset = name.rsplit_once('@').map(|(_, a)| a).unwrap_or("none");
    format!(
        r#"{{"name":"{name}","metrics":["{metric}"],"assets":["{asset}"],
            "evaluation":"function main(x) return OK, 'ok' end"}}"#
    )
}

fn nine_rules() -> Vec<(String, String)> {
    [
        "load@ups-1234",
        "threshold@ups-1234",
        "test@ups-1",
        "old@ups-2",
        "ups@ups-3",
        "door-contact@sensor-9",
        "sts-frequency@sts-1",
        "sts-preferred-source@sts-1",
        "sts-voltage@sts-1",
    ]
    .iter()
    .map(|name| (name.to_string(), ok_rule(name, "status.x")))
    .collect()
}

fn ups_announcement(iname: &str, display_name: &str) -> AssetMessage {
    let mut asset = AssetMessage::new(iname, AssetOperation::Update);
    asset.aux.insert("type".into(), "device".into());
    asset.aux.insert("subtype".into(), "ups".into());
    asset.ext.insert("name".into(), display_name.into());
    asset
}

async fn send_mailbox(engine: &TestEngine, subject: &str, frames: &[&str]) {
    engine
        .events
        .send(BusEvent::Mailbox {
            sender: "tester".into(),
            subject: subject.into(),
            tracker: Some("tracker-1".into()),
            frames: frames.iter().map(|f| f.to_string()).collect(),
        })
        .await
        .unwrap();
}

// ---------------------------------------------------------------------------
// end-to-end scenarios

#[tokio::test]
async fn ok_alert_round_trip() {
    let rules = [(
        "load@ups-1234",
        r#"{"name":"load@ups-1234","metrics":["status.ups"],"assets":["ups-1234"],
            "evaluation":"function main(x) return OK, 'ok' end"}"#,
    )];
    let mut engine = start(&rules).await;

    engine
        .events
        .send(BusEvent::Asset(ups_announcement("ups-1234", "my_ups")))
        .await
        .unwrap();
    engine
        .events
        .send(BusEvent::Metric {
            stream: STREAM_METRICS.into(),
            sample: MetricSample::new("ups-1234", "status.ups", "64", 10),
        })
        .await
        .unwrap();

    let published = timeout(RECV_TIMEOUT, engine.output.alerts.recv())
        .await
        .expect("alert in time")
        .unwrap();
    assert_eq!(published.topic, "load@ups-1234/OK@ups-1234");
    assert_eq!(published.alert.rule, "load@ups-1234");
    assert_eq!(published.alert.asset, "ups-1234");
    assert_eq!(published.alert.state, AlertState::Resolved);
    assert_eq!(published.alert.severity, Severity::Ok);
    assert_eq!(published.alert.message, "ok");
    assert_eq!(published.alert.ttl_secs, 25); // (10 * 5) / 2
    assert!(published.alert.actions.is_empty());
}

#[tokio::test]
async fn critical_alert_carries_actions_and_logical_asset() {
    let rules = [(
        "charge.battery@ups-5",
        r#"{"name":"charge.battery@ups-5","metrics":["charge.battery"],"assets":["ups-5"],
            "logical_asset":"rack-7",
            "results":{"low_critical":{"action":[{"action":"EMAIL"},{"action":"SMS"}]}},
            "evaluation":"function main(x) if tonumber(x) < 10 then return LOW_CRITICAL, 'battery low' end return OK, 'ok' end"}"#,
    )];
    let mut engine = start(&rules).await;

    engine
        .events
        .send(BusEvent::Asset(ups_announcement("ups-5", "big_ups")))
        .await
        .unwrap();
    engine
        .events
        .send(BusEvent::Metric {
            stream: STREAM_METRICS.into(),
            sample: MetricSample::new("ups-5", "charge.battery", "4", 20),
        })
        .await
        .unwrap();

    let published = timeout(RECV_TIMEOUT, engine.output.alerts.recv())
        .await
        .expect("alert in time")
        .unwrap();
    // the topic names the evaluated asset, the body the logical one
    assert_eq!(published.topic, "charge.battery@ups-5/CRITICAL@ups-5");
    assert_eq!(published.alert.asset, "rack-7");
    assert_eq!(published.alert.state, AlertState::Active);
    assert_eq!(published.alert.severity, Severity::Critical);
    assert_eq!(published.alert.actions, ["EMAIL", "SMS"]);
}

#[tokio::test]
async fn shared_store_metrics_are_picked_up_by_the_ticker() {
    let rules = [("load@ups-1234", ok_rule("load@ups-1234", "status.ups"))];
    let rules: Vec<(&str, &str)> = rules.iter().map(|(n, j)| (*n, j.as_str())).collect();
    let mut engine = start(&rules).await;

    engine
        .events
        .send(BusEvent::Asset(ups_announcement("ups-1234", "my_ups")))
        .await
        .unwrap();
    // give the announcement a head start over the next tick
    tokio::time::sleep(Duration::from_millis(50)).await;

    engine
        .shm
        .write(&MetricSample::new("ups-1234", "status.ups", "64", 10))
        .unwrap();

    let published = timeout(RECV_TIMEOUT, engine.output.alerts.recv())
        .await
        .expect("alert in time")
        .unwrap();
    assert_eq!(published.topic, "load@ups-1234/OK@ups-1234");
}

#[tokio::test]
async fn missing_metric_suppresses_alert() {
    let rules = [(
        "pair@ups-9",
        r#"{"name":"pair@ups-9","metrics":["m.a","m.b"],"assets":["ups-9"],
            "evaluation":"function main(a, b) return OK, 'ok' end"}"#,
    )];
    let mut engine = start(&rules).await;

    engine
        .events
        .send(BusEvent::Asset(ups_announcement("ups-9", "ups9")))
        .await
        .unwrap();
    engine
        .events
        .send(BusEvent::Metric {
            stream: STREAM_METRICS.into(),
            sample: MetricSample::new("ups-9", "m.a", "1", 60),
        })
        .await
        .unwrap();

    // several ticks pass, no alert may be published while m.b is absent
    let outcome = timeout(Duration::from_millis(400), engine.output.alerts.recv()).await;
    assert!(outcome.is_err(), "no alert expected, got {outcome:?}");

    engine
        .events
        .send(BusEvent::Metric {
            stream: STREAM_METRICS.into(),
            sample: MetricSample::new("ups-9", "m.b", "2", 60),
        })
        .await
        .unwrap();
    let published = timeout(RECV_TIMEOUT, engine.output.alerts.recv())
        .await
        .expect("alert once both metrics are present")
        .unwrap();
    assert_eq!(published.topic, "pair@ups-9/OK@ups-9");
}

#[tokio::test]
async fn sensor_gpi_metric_is_rewritten_to_the_sensor() {
    let rules = [(
        "door-contact@gpi-5",
        r#"{"name":"door-contact@gpi-5","metrics":["status.GPI1"],"assets":["gpi-5"],
            "models":["DCS001"],
            "evaluation":"function main(x) if x == 'opened' then return HIGH_CRITICAL, 'door opened' end return OK, 'ok' end"}"#,
    )];
    let mut engine = start(&rules).await;

    let mut sensor = AssetMessage::new("gpi-5", AssetOperation::Update);
    sensor.aux.insert("type".into(), "device".into());
    sensor.aux.insert("subtype".into(), "sensorgpio".into());
    sensor.ext.insert("model".into(), "DCS001".into());
    engine.events.send(BusEvent::Asset(sensor)).await.unwrap();

    // published by the host sensor, quantity carries the GPI index
    let mut sample = MetricSample::new("sensor-host-1", "status.GPI1.3", "opened", 30);
    sample.aux.insert("sname".into(), "gpi-5".into());
    sample.aux.insert("port".into(), "GPI-1".into());
    sample.aux.insert("ext-port".into(), "3".into());
    engine
        .events
        .send(BusEvent::Metric {
            stream: STREAM_METRICS_SENSOR.into(),
            sample,
        })
        .await
        .unwrap();

    let published = timeout(RECV_TIMEOUT, engine.output.alerts.recv())
        .await
        .expect("alert in time")
        .unwrap();
    assert_eq!(published.topic, "door-contact@gpi-5/CRITICAL@gpi-5");
    assert_eq!(published.alert.message, "door opened");
}

#[tokio::test]
async fn expired_metric_stops_the_alert_flow() {
    let rules = [("load@ups-1234", ok_rule("load@ups-1234", "status.ups"))];
    let rules: Vec<(&str, &str)> = rules.iter().map(|(n, j)| (*n, j.as_str())).collect();
    let mut engine = start(&rules).await;

    engine
        .events
        .send(BusEvent::Asset(ups_announcement("ups-1234", "my_ups")))
        .await
        .unwrap();
    engine
        .events
        .send(BusEvent::Metric {
            stream: STREAM_METRICS.into(),
            sample: MetricSample::new("ups-1234", "status.ups", "64", 1),
        })
        .await
        .unwrap();

    // alive while the sample is fresh
    let published = timeout(RECV_TIMEOUT, engine.output.alerts.recv())
        .await
        .expect("alert while fresh")
        .unwrap();
    assert_eq!(published.topic, "load@ups-1234/OK@ups-1234");

    // wait past the TTL, drain what was already in flight
    tokio::time::sleep(Duration::from_secs(2)).await;
    while engine.output.alerts.try_recv().is_ok() {}

    // once swept, the missing metric suppresses further alerts
    let outcome = timeout(Duration::from_millis(400), engine.output.alerts.recv()).await;
    assert!(outcome.is_err(), "no alert after expiry, got {outcome:?}");
}

#[tokio::test]
async fn unknown_sensor_triggers_republish() {
    let rules: [(&str, &str); 0] = [];
    let mut engine = start(&rules).await;

    let mut sample = MetricSample::new("sensor-host-1", "status.GPI2.1", "closed", 30);
    sample.aux.insert("sname".into(), "gpi-77".into());
    sample.aux.insert("port".into(), "GPI-2".into());
    engine
        .events
        .send(BusEvent::Metric {
            stream: STREAM_METRICS_SENSOR.into(),
            sample,
        })
        .await
        .unwrap();

    let republish = next_republish(&mut engine.output).await;
    assert_eq!(republish.frames, ["gpi-77"]);
}

#[tokio::test]
async fn asset_delete_cascades_to_its_rules_only() {
    let rules = [
        ("load@ups-77", ok_rule("load@ups-77", "status.ups")),
        (
            "watch@group-1",
            r#"{"name":"watch@group-1","metrics":["status.ups"],
                "assets":["ups-77","ups-88"],
                "evaluation":"function main(x) return OK, 'ok' end"}"#
                .to_string(),
        ),
    ];
    let rules: Vec<(&str, &str)> = rules.iter().map(|(n, j)| (*n, j.as_str())).collect();
    let mut engine = start(&rules).await;

    engine
        .events
        .send(BusEvent::Asset(ups_announcement("ups-77", "ups77")))
        .await
        .unwrap();
    engine
        .events
        .send(BusEvent::Asset(AssetMessage::new(
            "ups-77",
            AssetOperation::Delete,
        )))
        .await
        .unwrap();

    // the rule named for the asset is gone, the multi-asset rule survives
    send_mailbox(&engine, "rules", &["GET", "load@ups-77"]).await;
    let reply = next_reply(&mut engine.output).await;
    assert_eq!(reply.frames, ["ERROR", "NOT_FOUND"]);

    send_mailbox(&engine, "rules", &["GET", "watch@group-1"]).await;
    let reply = next_reply(&mut engine.output).await;
    assert_eq!(reply.frames[0], "OK");

    assert!(!engine.rules_dir.path().join("load@ups-77.rule").exists());
    assert!(engine.rules_dir.path().join("watch@group-1.rule").exists());
}

// ---------------------------------------------------------------------------
// mailbox protocol

#[tokio::test]
async fn list_returns_header_and_all_rules() {
    let rules = nine_rules();
    let rules: Vec<(&str, &str)> = rules.iter().map(|(n, j)| (n.as_str(), j.as_str())).collect();
    let mut engine = start(&rules).await;

    send_mailbox(&engine, "rule-list", &["LIST", "all", "myclass"]).await;
    let reply = next_reply(&mut engine.output).await;

    assert_eq!(reply.address, "tester");
    assert_eq!(reply.subject, "rule-list");
    assert_eq!(reply.tracker.as_deref(), Some("tracker-1"));
    assert_eq!(&reply.frames[..3], ["LIST", "all", "myclass"]);
    assert_eq!(reply.frames.len(), 3 + 9);
    for frame in &reply.frames[3..] {
        assert!(frame.starts_with("{\"flexible\":"), "frame: {frame}");
    }
}

#[tokio::test]
async fn list_rejects_unknown_type() {
    let rules: [(&str, &str); 0] = [];
    let mut engine = start(&rules).await;

    send_mailbox(&engine, "rule-list", &["LIST", "threshold", "c"]).await;
    let reply = next_reply(&mut engine.output).await;
    assert_eq!(reply.frames, ["ERROR", "INVALID_TYPE"]);
}

#[tokio::test]
async fn list2_filters_and_errors() {
    let rules = nine_rules();
    let rules: Vec<(&str, &str)> = rules.iter().map(|(n, j)| (n.as_str(), j.as_str())).collect();
    let mut engine = start(&rules).await;

    // (payload, expected rule count on success)
    let accepted: &[(&str, usize)] = &[
        ("{}", 9),
        (r#"{"type":"all","rule_class":"deprecated?"}"#, 9),
        (r#"{"type":""}"#, 9),
        (r#"{"type":"flexible"}"#, 9),
        (r#"{"hello":"world"}"#, 9),
        (r#"{"category":"sts"}"#, 3),
        (r#"{"category":"other"}"#, 6),
        (r#"{"category":"sts,other"}"#, 9),
        (r#"{"category":"hello"}"#, 0),
        (r#"{"asset_type":"device"}"#, 9),
        (r#"{"asset_type":"rack"}"#, 0),
        (r#"{"asset_sub_type":"ups"}"#, 5),
        (r#"{"in":"rack-123"}"#, 0),
    ];
    for (payload, expected) in accepted {
        send_mailbox(&engine, "rules", &["LIST2", payload]).await;
        let reply = next_reply(&mut engine.output).await;
        assert_eq!(&reply.frames[..2], ["LIST2", *payload], "payload {payload}");
        assert_eq!(reply.frames.len(), 2 + expected, "payload {payload}");
    }

    let rejected: &[(&str, &str)] = &[
        ("", "INVALID_INPUT"),
        ("{", "INVALID_INPUT"),
        (r#"{"type":"threshold"}"#, "INVALID_TYPE"),
        (r#"{"type":"single"}"#, "INVALID_TYPE"),
        (r#"{"asset_type":"hello"}"#, "INVALID_ASSET_TYPE"),
        (r#"{"asset_type":"ups"}"#, "INVALID_ASSET_TYPE"),
        (r#"{"asset_sub_type":"rack"}"#, "INVALID_ASSET_SUB_TYPE"),
        (r#"{"in":"ups-123"}"#, "INVALID_IN"),
        (r#"{"category":","}"#, "INVALID_CATEGORY"),
    ];
    for (payload, reason) in rejected {
        send_mailbox(&engine, "rules", &["LIST2", payload]).await;
        let reply = next_reply(&mut engine.output).await;
        assert_eq!(reply.frames, ["ERROR", *reason], "payload {payload}");
    }
}

#[tokio::test]
async fn list2_location_filter_uses_parent_chain() {
    let rules = nine_rules();
    let rules: Vec<(&str, &str)> = rules.iter().map(|(n, j)| (n.as_str(), j.as_str())).collect();
    let mut engine = start(&rules).await;

    let mut asset = ups_announcement("ups-1234", "my_ups");
    asset.aux.insert("parent_name.1".into(), "rack-123".into());
    asset.aux.insert("parent_name.2".into(), "room-7".into());
    engine.events.send(BusEvent::Asset(asset)).await.unwrap();

    send_mailbox(&engine, "rules", &["LIST2", r#"{"in":"rack-123"}"#]).await;
    let reply = next_reply(&mut engine.output).await;
    // the two ups-1234 rules are inside rack-123
    assert_eq!(reply.frames.len(), 2 + 2);

    send_mailbox(&engine, "rules", &["LIST2", r#"{"in":"room-7"}"#]).await;
    let reply = next_reply(&mut engine.output).await;
    assert_eq!(reply.frames.len(), 2 + 2);

    send_mailbox(&engine, "rules", &["LIST2", r#"{"in":"rack-999"}"#]).await;
    let reply = next_reply(&mut engine.output).await;
    assert_eq!(reply.frames.len(), 2);
}

#[tokio::test]
async fn get_returns_rule_json() {
    let rules = [("load@ups-1234", ok_rule("load@ups-1234", "status.ups"))];
    let rules: Vec<(&str, &str)> = rules.iter().map(|(n, j)| (*n, j.as_str())).collect();
    let mut engine = start(&rules).await;

    send_mailbox(&engine, "rules", &["GET", "load@ups-1234"]).await;
    let reply = next_reply(&mut engine.output).await;
    assert_eq!(reply.frames[0], "OK");
    assert!(reply.frames[1].starts_with('{'));
    let rule = Rule::parse(&reply.frames[1]).unwrap();
    assert_eq!(rule.name(), "load@ups-1234");

    send_mailbox(&engine, "rules", &["GET", "nope"]).await;
    let reply = next_reply(&mut engine.output).await;
    assert_eq!(reply.frames, ["ERROR", "NOT_FOUND"]);
}

#[tokio::test]
async fn add_persists_and_delete_removes() {
    let rules: [(&str, &str); 0] = [];
    let mut engine = start(&rules).await;

    let json = r#"{"name":"testrulejson","description":"none","evaluation":"function main(x) return OK,'yes' end"}"#;
    send_mailbox(&engine, "rules", &["ADD", json]).await;
    let reply = next_reply(&mut engine.output).await;
    assert_eq!(reply.frames[0], "OK");
    // the reply echoes the submitted document
    assert_eq!(reply.frames[1], json);

    let path = engine.rules_dir.path().join("testrulejson.rule");
    assert!(path.exists());

    // a second ADD of the same rule conflicts
    send_mailbox(&engine, "rules", &["ADD", json]).await;
    let reply = next_reply(&mut engine.output).await;
    assert_eq!(reply.frames, ["ERROR", "ALREADY_EXISTS"]);

    send_mailbox(&engine, "rules", &["DELETE", "testrulejson"]).await;
    let reply = next_reply(&mut engine.output).await;
    assert_eq!(reply.frames, ["DELETE", "testrulejson", "OK"]);
    assert!(!path.exists());

    send_mailbox(&engine, "rules", &["DELETE", "testrulejson"]).await;
    let reply = next_reply(&mut engine.output).await;
    assert_eq!(
        reply.frames,
        ["DELETE", "testrulejson", "ERROR", "DOES_NOT_EXISTS"]
    );

    send_mailbox(&engine, "rules", &["ADD", "{"]).await;
    let reply = next_reply(&mut engine.output).await;
    assert_eq!(reply.frames, ["ERROR", "INVALID_JSON"]);
}

#[tokio::test]
async fn add_republishes_the_referenced_asset() {
    let rules: [(&str, &str); 0] = [];
    let mut engine = start(&rules).await;

    let json = ok_rule("load@ups-42", "status.ups");
    send_mailbox(&engine, "rules", &["ADD", &json]).await;

    let reply = next_reply(&mut engine.output).await;
    assert_eq!(reply.frames[0], "OK");
    let republish = next_republish(&mut engine.output).await;
    assert_eq!(republish.frames, ["ups-42"]);
}

#[tokio::test]
async fn add_with_old_name_replaces_the_rule() {
    let rules = [("load@ups-1", ok_rule("load@ups-1", "status.ups"))];
    let rules: Vec<(&str, &str)> = rules.iter().map(|(n, j)| (*n, j.as_str())).collect();
    let mut engine = start(&rules).await;

    let json = ok_rule("load@ups-2", "status.ups");
    send_mailbox(&engine, "rules", &["ADD", &json, "load@ups-1"]).await;
    let reply = next_reply(&mut engine.output).await;
    assert_eq!(reply.frames[0], "OK");

    assert!(!engine.rules_dir.path().join("load@ups-1.rule").exists());
    assert!(engine.rules_dir.path().join("load@ups-2.rule").exists());
}

#[tokio::test]
async fn autoconfig_add_preserves_configured_gpio_actions() {
    let rules = [(
        "door-contact@sensorgpio-81",
        r#"{"name":"door-contact@sensorgpio-81","metrics":["status.GPI1"],
            "assets":["sensorgpio-81"],"models":["DCS001"],
            "results":{"high_critical":{"action":[{"action":"EMAIL"},{"action":"SMS"}]}},
            "evaluation":"function main(x) return OK, 'ok' end"}"#,
    )];
    let mut engine = start(&rules).await;

    // autoconfig re-announces the rule without any actions
    let incoming = r#"{"name":"door-contact@sensorgpio-81","metrics":["status.GPI1"],
        "assets":["sensorgpio-81"],"models":["DCS001"],
        "evaluation":"function main(x) return OK, 'ok' end"}"#;
    engine
        .events
        .send(BusEvent::Mailbox {
            sender: flexmon_common::AUTOCONFIG_SENDER.into(),
            subject: "rules".into(),
            tracker: None,
            frames: vec!["ADD".into(), incoming.into()],
        })
        .await
        .unwrap();
    let reply = next_reply(&mut engine.output).await;
    assert_eq!(reply.frames[0], "OK");

    // the configured actions survived the replacement
    send_mailbox(&engine, "rules", &["GET", "door-contact@sensorgpio-81"]).await;
    let reply = next_reply(&mut engine.output).await;
    let rule = Rule::parse(&reply.frames[1]).unwrap();
    assert_eq!(rule.actions_for(2), ["EMAIL", "SMS"]);
}

// ---------------------------------------------------------------------------
// unit tests

#[test]
fn sensor_quantity_truncation() {
    assert_eq!(truncate_sensor_quantity("status.GPI1.3"), Some("status.GPI1"));
    assert_eq!(truncate_sensor_quantity("status.GPI1"), Some("status.GPI1"));
    assert_eq!(truncate_sensor_quantity("status"), None);
    assert_eq!(
        truncate_sensor_quantity("status.GPI2.10.extra"),
        Some("status.GPI2")
    );
}

#[test]
fn cache_sweep_is_idempotent() {
    let mut cache = MetricCache::new();
    let now = Utc::now();

    let fresh = MetricSample::new("ups-1", "status.ups", "64", 300);
    let mut stale = MetricSample::new("ups-1", "load.default", "80", 10);
    stale.time = now - chrono::Duration::seconds(60);
    cache.upsert(fresh);
    cache.upsert(stale);

    assert_eq!(cache.sweep(now), 1);
    assert_eq!(cache.sweep(now), 0);
    assert!(cache.get("status.ups", "ups-1").is_some());
    assert!(cache.get("load.default", "ups-1").is_none());
}

#[test]
fn cache_replaces_samples_wholesale() {
    let mut cache = MetricCache::new();
    cache.upsert(MetricSample::new("ups-1", "status.ups", "64", 300));
    cache.upsert(MetricSample::new("ups-1", "status.ups", "70", 300));
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.get("status.ups", "ups-1").unwrap().value, "70");
}

#[test]
fn rule_binding_predicate_precedence() {
    let by_asset = Rule::parse(r#"{"name":"a@ups-1","assets":["ups-1"]}"#).unwrap();
    let by_group = Rule::parse(r#"{"name":"g@x","groups":["all-upses"]}"#).unwrap();
    let by_model = Rule::parse(r#"{"name":"m@x","models":["MX5000"]}"#).unwrap();
    let by_type = Rule::parse(r#"{"name":"t@x","types":["ups"]}"#).unwrap();

    let mut asset = AssetMessage::new("ups-1", AssetOperation::Update);
    asset.aux.insert("type".into(), "device".into());
    asset.aux.insert("subtype".into(), "ups".into());
    asset.ext.insert("model".into(), "MX5000".into());
    asset.ext.insert("group.1".into(), "all-upses".into());

    assert!(is_rule_for_asset(&by_asset, &asset));
    assert!(is_rule_for_asset(&by_group, &asset));
    assert!(is_rule_for_asset(&by_model, &asset));
    assert!(is_rule_for_asset(&by_type, &asset));

    let other = AssetMessage::new("ups-2", AssetOperation::Update);
    assert!(!is_rule_for_asset(&by_asset, &other));
    assert!(!is_rule_for_asset(&by_group, &other));
}

#[test]
fn gpio_sensors_need_asset_and_model() {
    let rule = Rule::parse(
        r#"{"name":"d@gpi-5","assets":["gpi-5"],"models":["DCS001"]}"#,
    )
    .unwrap();
    let listed_only = Rule::parse(r#"{"name":"d2@gpi-5","assets":["gpi-5"]}"#).unwrap();

    let mut sensor = AssetMessage::new("gpi-5", AssetOperation::Update);
    sensor.aux.insert("subtype".into(), "sensorgpio".into());
    sensor.ext.insert("model".into(), "DCS001".into());

    assert!(is_rule_for_asset(&rule, &sensor));
    // listing the asset alone is not enough for gpio sensors
    assert!(!is_rule_for_asset(&listed_only, &sensor));
}

#[test]
fn rebind_is_deterministic_and_purges_unmatched() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = RuleStore::open(dir.path());
    for json in [
        r#"{"name":"a@ups-1","assets":["ups-1"]}"#,
        r#"{"name":"b@ups-1","assets":["ups-1"]}"#,
        r#"{"name":"c@ups-2","assets":["ups-2"]}"#,
    ] {
        store.add(Rule::parse(json).unwrap()).unwrap();
    }

    let mut registry = AssetRegistry::new();
    let asset = ups_announcement("ups-1", "one");

    assert_eq!(registry.rebind(&asset, &store), 2);
    let first = registry.bound_rules("ups-1").unwrap().to_vec();
    assert_eq!(registry.rebind(&asset, &store), 2);
    assert_eq!(registry.bound_rules("ups-1").unwrap(), first.as_slice());
    assert_eq!(first, ["a@ups-1", "b@ups-1"]);

    // an asset matching nothing is dropped from every index
    let stranger = ups_announcement("epdu-9", "nine");
    registry.rebind(&stranger, &store);
    assert!(!registry.is_bound("epdu-9"));
    assert!(registry.display_name("epdu-9").is_none());
}

#[test]
fn unbind_rule_keeps_bindings_consistent_with_store() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = RuleStore::open(dir.path());
    store
        .add(Rule::parse(r#"{"name":"a@ups-1","assets":["ups-1"]}"#).unwrap())
        .unwrap();
    store
        .add(Rule::parse(r#"{"name":"b@ups-1","assets":["ups-1"]}"#).unwrap())
        .unwrap();

    let mut registry = AssetRegistry::new();
    registry.rebind(&ups_announcement("ups-1", "one"), &store);

    store.remove("a@ups-1").unwrap();
    registry.unbind_rule("a@ups-1");
    assert_eq!(registry.bound_rules("ups-1").unwrap(), ["b@ups-1"]);

    store.remove("b@ups-1").unwrap();
    registry.unbind_rule("b@ups-1");
    assert!(!registry.is_bound("ups-1"));
}

#[test]
fn inventory_without_aux_keeps_known_locations() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = RuleStore::open(dir.path());
    store
        .add(Rule::parse(r#"{"name":"a@ups-1","assets":["ups-1"]}"#).unwrap())
        .unwrap();

    let mut registry = AssetRegistry::new();
    let mut asset = ups_announcement("ups-1", "one");
    asset.aux.insert("parent_name.1".into(), "rack-1".into());
    registry.rebind(&asset, &store);
    assert!(registry.is_in_location("ups-1", "rack-1"));

    // inventory update carrying only ext attributes must not clear them
    let mut inventory = AssetMessage::new("ups-1", AssetOperation::Inventory);
    inventory.ext.insert("name".into(), "renamed".into());
    registry.rebind(&inventory, &store);
    assert!(registry.is_in_location("ups-1", "rack-1"));
    assert_eq!(registry.display_name("ups-1"), Some("renamed"));

    // an aux-bearing update rewrites the chain
    let mut moved = ups_announcement("ups-1", "one");
    moved.aux.insert("parent_name.1".into(), "rack-2".into());
    registry.rebind(&moved, &store);
    assert!(registry.is_in_location("ups-1", "rack-2"));
    assert!(!registry.is_in_location("ups-1", "rack-1"));
}

#[test]
fn category_tokens() {
    assert_eq!(tokens_for_rule_name("sts-frequency@sts-1"), ["sts"]);
    assert_eq!(tokens_for_rule_name("realpower.default@ups-1"), ["load"]);
    assert_eq!(
        tokens_for_rule_name("ambient.temperature@room-3"),
        ["temperature"]
    );
    assert_eq!(tokens_for_rule_name("something.odd@ups-1"), ["other"]);
}

#[test]
fn enumerated_categories_redirect() {
    assert_eq!(
        tokens_for_rule_name("outlet.group.17.current@epdu-4"),
        ["output_current"]
    );
    assert_eq!(
        tokens_for_rule_name("outlet.group.2.voltage@epdu-4"),
        ["output_voltage"]
    );
    assert_eq!(
        tokens_for_rule_name("ambient.3.humidity.status@sensor-2"),
        ["humidity"]
    );
    assert_eq!(
        tokens_for_rule_name("ambient.12.temperature.status@sensor-2"),
        ["temperature"]
    );
}

#[test]
fn shared_store_round_trip_with_patterns() {
    let dir = tempfile::tempdir().unwrap();
    let shm = SharedMetricStore::new(dir.path());

    shm.write(&MetricSample::new("ups-1", "status.ups", "64", 10))
        .unwrap();
    shm.write(&MetricSample::new("epdu-2", "load.default", "30", 10))
        .unwrap();

    let all = shm.read_matching("*", "*");
    assert_eq!(all.len(), 2);

    let ups_only = shm.read_matching("ups-*", "*");
    assert_eq!(ups_only.len(), 1);
    assert_eq!(ups_only[0].asset, "ups-1");

    let status_only = shm.read_matching("*", "status.*");
    assert_eq!(status_only.len(), 1);
    assert_eq!(status_only[0].quantity, "status.ups");
}
