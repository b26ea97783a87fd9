//! ---
//! vsub_section: "04-external-interfaces"
//! vsub_subsection: "module"
//! vsub_type: "source"
//! vsub_scope: "test"
//! vsub_description: "API and status stream against a live coordinator."
//! vsub_version: "v0.1.0"
//! vsub_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use vsub_common::MirrorConfig;
use vsub_core::{
    BatteryPlan, Coordinator, DeviceCommand, DeviceLink, DeviceTelemetry, MirrorCommand,
    MirrorHandle, RunReport, Scenario, ScenarioStep, SetpointField, SetupAction,
    SimulationStatus, TelemetryRead,
};
use vsub_net::RestApiBuilder;

/// Trips whenever the mirrored current reaches the instantaneous threshold.
struct ThresholdRelay {
    mirror: MirrorHandle,
}

#[async_trait]
impl DeviceLink for ThresholdRelay {
    async fn read_telemetry(&self) -> TelemetryRead {
        let inputs = self.mirror.snapshot();
        let tripped = inputs.current >= 2500.0;
        TelemetryRead::Data(DeviceTelemetry {
            voltage: inputs.voltage,
            current: inputs.current,
            frequency: inputs.frequency,
            fault_current: inputs.fault_current,
            fault_detected: tripped,
            trip_command: tripped,
            breaker_status: tripped,
            overcurrent_pickup: false,
            trip_reason: None,
        })
    }

    async fn send_command(&self, _command: DeviceCommand) -> bool {
        true
    }
}

fn short_plan(window: Duration, reachable_condition: bool) -> BatteryPlan {
    let step = if reachable_condition {
        ScenarioStep::new("instantaneous_trip", window, Duration::from_millis(20), |t| {
            t.breaker_open()
        })
    } else {
        ScenarioStep::new("never", window, Duration::from_millis(20), |_| false)
    };
    BatteryPlan::new(
        vec![Scenario::new("instantaneous")
            .setup(SetupAction::Mirror(MirrorCommand::Set(
                SetpointField::Current,
                2600.0,
            )))
            .step(step)],
        Duration::from_millis(10),
    )
}

fn coordinator(plan: BatteryPlan) -> Arc<Coordinator> {
    let (mirror, _task) = MirrorHandle::spawn(&MirrorConfig::default(), None);
    let relay = Arc::new(ThresholdRelay {
        mirror: mirror.clone(),
    });
    Arc::new(Coordinator::new(mirror, relay, plan, None, 32))
}

#[tokio::test]
async fn run_tests_returns_report_and_restores_baseline() {
    let coordinator = coordinator(short_plan(Duration::from_millis(500), true));
    let handle = RestApiBuilder::for_coordinator("127.0.0.1:0".parse().unwrap(), coordinator)
        .spawn()
        .await
        .unwrap();
    let client = Client::new();
    let base = format!("http://{}", handle.local_addr());

    let response = client
        .post(format!("{base}/api/run-tests"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let report: RunReport = response.json().await.unwrap();
    assert!(report.ok);
    assert_eq!(report.outcome_signature(), vec![("instantaneous_trip", true)]);

    let simulation: SimulationStatus = client
        .get(format!("{base}/api/simulation-data"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(simulation, SimulationStatus::baseline());

    drop(client);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn overlapping_runs_are_rejected_with_conflict() {
    let coordinator = coordinator(short_plan(Duration::from_millis(400), false));
    let handle = RestApiBuilder::for_coordinator("127.0.0.1:0".parse().unwrap(), coordinator)
        .spawn()
        .await
        .unwrap();
    let client = Client::new();
    let url = format!("http://{}/api/run-tests", handle.local_addr());

    let first = tokio::spawn({
        let client = client.clone();
        let url = url.clone();
        async move { client.post(url).send().await.unwrap() }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = client.post(&url).send().await.unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
    let body: Value = second.json().await.unwrap();
    assert_eq!(body["kind"], "already_running");

    let command = client
        .post(format!("http://{}/api/command", handle.local_addr()))
        .json(&json!({ "command": "updateVoltage", "data": { "voltage": 140.0 } }))
        .send()
        .await
        .unwrap();
    assert_eq!(command.status(), StatusCode::CONFLICT);

    let first = first.await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let report: RunReport = first.json().await.unwrap();
    assert!(!report.ok);

    drop(client);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn observers_get_an_initial_frame_then_updates() {
    let coordinator = coordinator(short_plan(Duration::from_millis(200), true));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let status_loop = coordinator
        .clone()
        .spawn_status_loop(Duration::from_millis(50), shutdown_rx);
    let handle = RestApiBuilder::for_coordinator("127.0.0.1:0".parse().unwrap(), coordinator)
        .spawn()
        .await
        .unwrap();

    let url = format!("ws://{}/ws", handle.local_addr());
    let (mut socket, _response) = connect_async(&url).await.unwrap();

    let initial = next_frame(&mut socket).await;
    assert_eq!(initial["runPhase"]["phase"], "idle");

    let response = Client::new()
        .post(format!("http://{}/api/command", handle.local_addr()))
        .json(&json!({ "command": "updateVoltage", "data": { "voltage": 140.0 } }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let updated = timeout(Duration::from_secs(2), async {
        loop {
            let frame = next_frame(&mut socket).await;
            if frame["simulation"]["voltage"] == json!(140.0) {
                break frame;
            }
        }
    })
    .await
    .expect("frame with new voltage");
    assert_eq!(updated["simulation"]["current"], json!(450.0));

    drop(socket);
    shutdown_tx.send(true).unwrap();
    status_loop.await.unwrap();
    handle.shutdown().await.unwrap();
}

async fn next_frame<S>(socket: &mut S) -> Value
where
    S: Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match socket.next().await.unwrap().unwrap() {
            WsMessage::Text(payload) => return serde_json::from_str(&payload).unwrap(),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
