//! HTTP API and UDP ingestion against a running daemon.

use flowtel_common::{FlowKey, PersistedFlow, IPPROTO_TCP};
use flowtel_dataplane::{FlowPipeline, PipelineConfig, UdpSink};
use flowteld::{Daemon, FlowtelConfig, DATAGRAM_LEN};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct Harness {
    base: String,
    digest_addr: SocketAddr,
    client: reqwest::Client,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<flowteld::Result<()>>,
    _dir: tempfile::TempDir,
    store_dir: std::path::PathBuf,
}

impl Harness {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FlowtelConfig::default();
        config.server.http_listen = "127.0.0.1:0".to_string();
        config.server.digest_listen = "127.0.0.1:0".to_string();
        config.collector.batch_size = 1;
        config.collector.buffer_capacity = 16;
        config.collector.store_dir = Some(dir.path().to_path_buf());
        // No switch answers HTTP probes in these tests.
        config.manager.heartbeat_interval_secs = 3_600;
        config.manager.reconcile_interval_secs = 3_600;

        let daemon = Daemon::bind(config).await.unwrap();
        let base = format!("http://{}", daemon.http_addr());
        let digest_addr = daemon.digest_addr();

        let (stop, rx) = oneshot::channel();
        let handle = tokio::spawn(daemon.run(async move {
            let _ = rx.await;
        }));

        Self {
            base,
            digest_addr,
            client: reqwest::Client::new(),
            stop,
            handle,
            store_dir: dir.path().to_path_buf(),
            _dir: dir,
        }
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let response = self
            .client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> (u16, Value) {
        let response = request.send().await.unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    async fn register(&self, switch_id: &str) -> u64 {
        let (status, body) = self
            .send(
                self.client
                    .post(format!("{}/switches/register", self.base))
                    .json(&json!({
                        "switch_id": switch_id,
                        "control_address": "127.0.0.1:9100",
                        "device_id": "asic0",
                    })),
            )
            .await;
        assert_eq!(status, 201, "{}", body);
        body["data"]["session_token"].as_u64().unwrap()
    }

    async fn stop(self) {
        let _ = self.stop.send(());
        self.handle.await.unwrap().unwrap();
    }
}

async fn wait_for_lines(path: &Path, count: usize) -> Vec<String> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let contents = tokio::fs::read_to_string(path).await.unwrap_or_default();
        let lines: Vec<String> = contents.lines().map(str::to_string).collect();
        if lines.len() >= count || tokio::time::Instant::now() >= deadline {
            return lines;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn key() -> FlowKey {
    FlowKey::new(
        Ipv4Addr::new(192, 168, 1, 100),
        Ipv4Addr::new(10, 0, 0, 50),
        IPPROTO_TCP,
        12345,
        80,
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_registered_switch_digests_reach_store() {
    let harness = Harness::start().await;
    let token = harness.register("leaf-1").await;
    assert_ne!(token, 0);

    let sink = UdpSink::connect(harness.digest_addr, token).unwrap();
    let pipeline = FlowPipeline::new(PipelineConfig::default(), Arc::new(sink)).unwrap();
    for ts in [1_000, 2_000, 3_000] {
        pipeline.process_key(&key(), 200, ts);
    }

    let lines = wait_for_lines(&harness.store_dir.join("flows.jsonl"), 3).await;
    let flows: Vec<PersistedFlow> = lines
        .iter()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let counts: Vec<u32> = flows.iter().map(|f| f.packet_count).collect();
    assert_eq!(counts, vec![1, 2, 3]);
    assert!(flows.iter().all(|f| f.switch_id == "leaf-1"));
    assert_eq!(flows[2].byte_count, 600);

    let (status, body) = harness.get("/flows?limit=10").await;
    assert_eq!(status, 200);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"][0]["packet_count"], 3);

    let (_, body) = harness.get("/stats").await;
    assert_eq!(body["data"]["active_flows"], 1);
    assert_eq!(body["data"]["total_packets"], 3);
    assert_eq!(body["data"]["switches_connected"], 1);

    let flow_id = flows[0].flow_id.value();
    let (status, _) = harness.get(&format!("/flows/leaf-1/{}", flow_id)).await;
    assert_eq!(status, 200);

    let switches_log = wait_for_lines(&harness.store_dir.join("switches.jsonl"), 2).await;
    assert!(switches_log.last().unwrap().contains("\"state\":\"active\""));

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_switches_ingest_on_separate_sessions() {
    let harness = Harness::start().await;
    let mut pipelines = Vec::new();
    for switch_id in ["leaf-1", "leaf-2"] {
        let token = harness.register(switch_id).await;
        let sink = UdpSink::connect(harness.digest_addr, token).unwrap();
        pipelines.push(FlowPipeline::new(PipelineConfig::default(), Arc::new(sink)).unwrap());
    }
    for ts in [1_000, 2_000, 3_000] {
        for pipeline in &pipelines {
            pipeline.process_key(&key(), 100, ts);
        }
    }

    let lines = wait_for_lines(&harness.store_dir.join("flows.jsonl"), 6).await;
    let flows: Vec<PersistedFlow> = lines
        .iter()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    for switch_id in ["leaf-1", "leaf-2"] {
        let counts: Vec<u32> = flows
            .iter()
            .filter(|f| f.switch_id == switch_id)
            .map(|f| f.packet_count)
            .collect();
        assert_eq!(counts, vec![1, 2, 3], "{}", switch_id);
    }

    let (_, body) = harness.get("/stats").await;
    assert_eq!(body["data"]["switches_reporting"], 2);
    assert_eq!(body["data"]["total_packets"], 6);

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_token_and_bad_length_rejected() {
    let harness = Harness::start().await;
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(&[0u8; DATAGRAM_LEN], harness.digest_addr)
        .await
        .unwrap();
    socket.send_to(&[1u8; 10], harness.digest_addr).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let metrics = loop {
        let text = harness
            .client
            .get(format!("{}/metrics", harness.base))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        if text.contains("flowtel_frames_rejected_total 2")
            || tokio::time::Instant::now() >= deadline
        {
            break text;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert!(metrics.contains("flowtel_frames_rejected_total 2"));
    assert!(metrics.contains("flowtel_switch_sessions{state=\"active\"} 0"));

    let (_, body) = harness.get("/flows").await;
    assert_eq!(body["data"], json!([]));

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_switch_lifecycle_endpoints() {
    let harness = Harness::start().await;

    let (status, body) = harness
        .send(
            harness
                .client
                .post(format!("{}/switches/register", harness.base))
                .json(&json!({ "switch_id": "leaf-1", "control_address": "leaf-1" })),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["success"], false);

    harness.register("leaf-1").await;

    let (_, body) = harness.get("/switches").await;
    assert_eq!(body["data"][0]["switch_id"], "leaf-1");
    assert_eq!(body["data"][0]["state"], "active");
    assert!(body["data"][0].get("token").is_none());

    let (status, body) = harness
        .send(
            harness
                .client
                .post(format!("{}/switches/leaf-1/heartbeat", harness.base)),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["state"], "active");

    let (status, _) = harness
        .send(
            harness
                .client
                .post(format!("{}/switches/leaf-9/heartbeat", harness.base)),
        )
        .await;
    assert_eq!(status, 404);

    let (status, _) = harness
        .send(
            harness
                .client
                .delete(format!("{}/switches/leaf-1", harness.base)),
        )
        .await;
    assert_eq!(status, 200);

    let (_, body) = harness.get("/switches").await;
    assert_eq!(body["data"], json!([]));

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_policy_update_validated() {
    let harness = Harness::start().await;

    let (status, body) = harness
        .send(
            harness
                .client
                .put(format!("{}/policy", harness.base))
                .json(&json!({ "sampling_rate_default": 0 })),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["success"], false);

    let (status, body) = harness
        .send(
            harness
                .client
                .put(format!("{}/policy", harness.base))
                .json(&json!({ "sampling_rate_default": 8, "flow_timeout_secs": 60 })),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["sampling_rate_default"], 8);

    let (_, body) = harness.get("/policy").await;
    assert_eq!(body["data"]["sampling_rate_default"], 8);
    assert_eq!(body["data"]["flow_timeout_secs"], 60);

    let (status, body) = harness.get("/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["status"], "healthy");

    harness.stop().await;
}
