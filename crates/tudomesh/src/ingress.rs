//! MQTT ingress: one `tokio::spawn`ed connection loop per configured
//! client (rumqttc multiplexes all subscriptions over one connection),
//! with per-message handling shaped like a long-lived stream handler: a
//! span per message, metrics counters on each accepted payload, a bounded
//! channel handing work to a single drain task.
//!
//! `rumqttc` is used here because the pack carries no MQTT example; it is
//! the one real, registry-published, idiomatically-async MQTT client crate
//! (noted in DESIGN.md).

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::{mpsc, watch};

use tudomesh_core::icp::IcpConfig;
use tudomesh_core::pose::{process_payload, MapPayload, MapUpdate};

use crate::align;
use crate::context::{now_unix, AppContext};
use crate::snapshot;

const PERSISTENCE_QUEUE_CAPACITY: usize = 64;

struct PendingSnapshot {
    vacuum_id: String,
    bytes: Vec<u8>,
    timestamp_unix_ms: i64,
}

/// Parses an `mqtt://host:port` (or bare `host:port`) broker URI.
fn parse_broker(uri: &str) -> (String, u16) {
    let stripped = uri
        .strip_prefix("mqtt://")
        .or_else(|| uri.strip_prefix("tcp://"))
        .unwrap_or(uri);
    match stripped.rsplit_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse().unwrap_or(1883),
        ),
        None => (stripped.to_string(), 1883),
    }
}

/// Classifies a raw MQTT payload into the three-way `MapPayload` shape:
/// valid JSON matching `OccupancyMap` decodes to `DecodedMap`; JSON that
/// fails to match the schema, or bytes that aren't JSON at all but look
/// like an image, fall back to `RawImage`/`Unparseable`.
fn classify_payload(bytes: &[u8]) -> MapPayload {
    if bytes.starts_with(b"\x89PNG") {
        return MapPayload::RawImage(bytes.to_vec());
    }
    match serde_json::from_slice(bytes) {
        Ok(map) => MapPayload::DecodedMap(map),
        Err(_) if bytes.is_empty() => MapPayload::Unparseable,
        Err(_) => MapPayload::RawImage(bytes.to_vec()),
    }
}

/// Runs the MQTT ingress worker until `shutdown` fires. Subscribes to
/// every configured robot's map topic, and its lifecycle topic
/// (`<topic>/lifecycle`) for dock-triggered recalibration.
pub async fn run(context: Arc<AppContext>, mut shutdown: watch::Receiver<()>) -> anyhow::Result<()> {
    let broker = context
        .config
        .mqtt
        .broker
        .clone()
        .ok_or_else(|| anyhow::anyhow!("mqtt.broker must be set to run ingress"))?;
    let (host, port) = parse_broker(&broker);

    let client_id = context
        .config
        .mqtt
        .client_id
        .clone()
        .unwrap_or_else(|| "tudomesh".to_string());
    let mut mqtt_options = MqttOptions::new(client_id, host, port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    if let (Some(username), Some(password)) = (
        context.config.mqtt.username.clone(),
        context.config.mqtt.password.clone(),
    ) {
        mqtt_options.set_credentials(username, password);
    }

    let (client, mut event_loop) = AsyncClient::new(mqtt_options, 64);

    for vacuum in &context.config.vacuums {
        client.subscribe(&vacuum.topic, QoS::AtLeastOnce).await?;
        client
            .subscribe(format!("{}/lifecycle", vacuum.topic), QoS::AtLeastOnce)
            .await?;
    }

    let (persist_tx, persist_rx) = mpsc::channel(PERSISTENCE_QUEUE_CAPACITY);
    let persist_handle = tokio::spawn(run_persistence_worker(context.data_dir.clone(), persist_rx));

    let publish_prefix = context.config.mqtt.publish_prefix.clone();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::info!("ingress shutting down");
                break;
            }
            event = event_loop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        handle_publish(
                            &context,
                            &client,
                            &publish_prefix,
                            &persist_tx,
                            publish.topic,
                            publish.payload.to_vec(),
                        )
                        .await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "mqtt connection error, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    drop(persist_tx);
    let _ = persist_handle.await;
    Ok(())
}

async fn handle_publish(
    context: &Arc<AppContext>,
    client: &AsyncClient,
    publish_prefix: &str,
    persist_tx: &mpsc::Sender<PendingSnapshot>,
    topic: String,
    payload: Vec<u8>,
) {
    let Some(vacuum_id) = vacuum_id_for_topic(context, &topic) else {
        tracing::warn!(topic, "publish on unrecognised topic");
        return;
    };

    let lock = context.lock_for(&vacuum_id);
    let _guard = lock.lock().await;

    let span = tracing::info_span!("ingress_message", vacuum_id = %vacuum_id, topic = %topic);
    let _entered = span.enter();

    if topic.ends_with("/lifecycle") {
        if payload == b"docked" {
            handle_dock_event(context, &vacuum_id);
        }
        return;
    }

    context.metrics.maps_ingested_total.inc();
    let payload_kind = classify_payload(&payload);
    let (transform, _) = context.get_transform(&vacuum_id);
    let outcome = process_payload(&vacuum_id, payload_kind, transform);

    if let Some(err) = &outcome.soft_error {
        tracing::warn!(error = %err, "soft failure processing payload");
    }

    match outcome.map_update {
        MapUpdate::Unusable(bytes) => {
            if let Some(bytes) = bytes {
                let _ = persist_tx
                    .send(PendingSnapshot {
                        vacuum_id: vacuum_id.clone(),
                        bytes,
                        timestamp_unix_ms: now_unix_ms(),
                    })
                    .await;
            }
        }
        MapUpdate::ReplaceMap(map) => {
            if let Ok(bytes) = serde_json::to_vec(&map) {
                let _ = persist_tx
                    .send(PendingSnapshot {
                        vacuum_id: vacuum_id.clone(),
                        bytes,
                        timestamp_unix_ms: now_unix_ms(),
                    })
                    .await;
            }
            context.set_map(&vacuum_id, map);
        }
        MapUpdate::KeepPrevious => {}
    }

    if let Some(pose) = outcome.pose {
        context.metrics.poses_published_total.inc();
        publish_pose(client, publish_prefix, &pose).await;
        context.set_pose(pose);
    }
}

fn handle_dock_event(context: &Arc<AppContext>, vacuum_id: &str) {
    let Some(map) = context.map_snapshot(vacuum_id) else {
        return;
    };
    let area = map.total_layer_area();
    if !context.is_stale(vacuum_id, area, now_unix()) {
        return;
    }
    tracing::info!(vacuum_id, "dock event triggered recalibration");
    if let Err(e) = align::recalibrate(context, vacuum_id, &map, &IcpConfig::default()) {
        tracing::warn!(vacuum_id, error = %e, "recalibration failed");
    }
}

async fn publish_pose(client: &AsyncClient, publish_prefix: &str, pose: &tudomesh_core::pose::LivePose) {
    let body = serde_json::json!({
        "vacuum_id": pose.vacuum_id,
        "x": pose.x,
        "y": pose.y,
        "angle": pose.heading_deg,
    });
    let Ok(bytes) = serde_json::to_vec(&body) else {
        return;
    };
    let topic = format!("{publish_prefix}/{}", pose.vacuum_id);
    if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, bytes).await {
        tracing::warn!(error = %e, "failed to publish pose");
    }
}

fn vacuum_id_for_topic(context: &Arc<AppContext>, topic: &str) -> Option<String> {
    let base_topic = topic.strip_suffix("/lifecycle").unwrap_or(topic);
    context
        .config
        .vacuums
        .iter()
        .find(|v| v.topic == base_topic)
        .map(|v| v.id.clone())
}

async fn run_persistence_worker(
    data_dir: std::path::PathBuf,
    mut rx: mpsc::Receiver<PendingSnapshot>,
) {
    while let Some(item) = rx.recv().await {
        if let Err(e) = snapshot::write_snapshot_bytes(
            &data_dir,
            &item.vacuum_id,
            item.timestamp_unix_ms,
            &item.bytes,
        ) {
            tracing::warn!(vacuum_id = %item.vacuum_id, error = %e, "failed to persist snapshot");
        }
    }
}

fn now_unix_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_broker_strips_scheme_and_parses_port() {
        assert_eq!(parse_broker("mqtt://broker.local:1883"), ("broker.local".to_string(), 1883));
        assert_eq!(parse_broker("broker.local:8883"), ("broker.local".to_string(), 8883));
        assert_eq!(parse_broker("broker.local"), ("broker.local".to_string(), 1883));
    }

    #[test]
    fn classify_payload_detects_png_magic_bytes() {
        let mut bytes = vec![0x89, b'P', b'N', b'G'];
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        assert!(matches!(classify_payload(&bytes), MapPayload::RawImage(_)));
    }

    #[test]
    fn classify_payload_decodes_valid_occupancy_map_json() {
        let json = br#"{"size":{"width":1,"height":1},"pixelSize":5,"layers":[],"entities":[]}"#;
        assert!(matches!(classify_payload(json), MapPayload::DecodedMap(_)));
    }

    #[test]
    fn classify_payload_treats_empty_bytes_as_unparseable() {
        assert!(matches!(classify_payload(&[]), MapPayload::Unparseable));
    }

    #[test]
    fn classify_payload_treats_malformed_json_as_raw_image() {
        assert!(matches!(
            classify_payload(b"not json"),
            MapPayload::RawImage(_)
        ));
    }

    fn square_map(side: i32) -> tudomesh_core::map::OccupancyMap {
        use tudomesh_core::map::{Cell, GridSize, Layer, LayerType};
        let mut pixels = Vec::new();
        for x in 0..side {
            for y in 0..side {
                if x == 0 || y == 0 || x == side - 1 || y == side - 1 {
                    pixels.push(Cell::new(x, y));
                }
            }
        }
        tudomesh_core::map::OccupancyMap {
            size: GridSize {
                width: side as u32,
                height: side as u32,
            },
            pixel_size_mm: 10,
            layers: vec![Layer {
                layer_type: LayerType::Wall,
                pixels,
                metadata: serde_json::Value::Null,
            }],
            entities: vec![],
        }
    }

    fn dock_test_context(dir: &std::path::Path) -> Arc<AppContext> {
        let mut config = crate::config::Config::default();
        config.reference = Some("robotA".to_string());
        AppContext::new(
            config,
            dir.to_path_buf(),
            dir.join("calibration.json"),
            Arc::new(crate::metrics::Metrics::new()),
        )
        .unwrap()
    }

    #[test]
    fn dock_event_within_debounce_window_does_not_recalibrate() {
        let dir = tempfile::tempdir().unwrap();
        let context = dock_test_context(dir.path());
        let map = square_map(10);
        let area = map.total_layer_area();

        context.set_map("robotA", map.clone());
        context.set_map("robotB", map.clone());
        context
            .update_calibration("robotB", Default::default(), area, 0)
            .unwrap();

        let before = context.get_transform("robotB");
        let twenty_nine_minutes = 29 * 60;
        assert!(!context.is_stale("robotB", area, twenty_nine_minutes));
        handle_dock_event(&context, "robotB");
        assert_eq!(context.get_transform("robotB").0, before.0);
    }

    #[test]
    fn dock_event_past_debounce_window_recalibrates() {
        let dir = tempfile::tempdir().unwrap();
        let context = dock_test_context(dir.path());
        let map = square_map(10);
        let area = map.total_layer_area();

        context.set_map("robotA", map.clone());
        context.set_map("robotB", map.clone());
        context
            .update_calibration("robotB", Default::default(), area, 0)
            .unwrap();

        let thirty_one_minutes = 31 * 60;
        assert!(context.is_stale("robotB", area, thirty_one_minutes));

        // handle_dock_event re-derives staleness from now_unix() internally;
        // exercise recalibrate directly with the same map to confirm the
        // cache is updated once staleness is established above.
        crate::align::recalibrate(&context, "robotB", &map, &tudomesh_core::icp::IcpConfig::default())
            .unwrap();
        let (_, missing) = context.get_transform("robotB");
        assert!(!missing);
    }
}
