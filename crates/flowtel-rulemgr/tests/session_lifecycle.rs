//! Switch sessions driven by the background loops.

use flowtel_common::{MemorySwitchStatusStore, PolicyConfig};
use flowtel_dataplane::{ChannelSink, FlowPipeline, PipelineConfig};
use flowtel_rulemgr::{
    BackoffPolicy, FlowRuleManager, LocalChannelFactory, LocalSwitchChannel, ManagerConfig,
    RegistrationRequest, SessionState,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    manager: Arc<FlowRuleManager>,
    factory: Arc<LocalChannelFactory>,
    store: Arc<MemorySwitchStatusStore>,
}

fn local_switch() -> Arc<LocalSwitchChannel> {
    let (sink, _rx) = ChannelSink::channel(8);
    let pipeline = FlowPipeline::new(PipelineConfig::default(), Arc::new(sink)).unwrap();
    Arc::new(LocalSwitchChannel::new(Arc::new(pipeline)))
}

fn harness(switches: &[&str]) -> Harness {
    let factory = Arc::new(LocalChannelFactory::new());
    for id in switches {
        factory.add_switch(*id, local_switch());
    }
    let store = Arc::new(MemorySwitchStatusStore::new());
    let config = ManagerConfig {
        request_timeout: Duration::from_millis(100),
        reconcile_interval: Duration::from_millis(20),
        heartbeat_interval: Duration::from_millis(20),
        max_missed_heartbeats: 2,
        backoff: BackoffPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            max_attempts: 3,
        },
    };
    let manager = FlowRuleManager::new(
        config,
        factory.clone(),
        store.clone(),
        PolicyConfig::default(),
    )
    .unwrap();
    Harness {
        manager,
        factory,
        store,
    }
}

fn request(switch_id: &str, port: u16) -> RegistrationRequest {
    RegistrationRequest {
        switch_id: switch_id.to_string(),
        control_address: format!("127.0.0.1:{}", port),
        device_id: format!("{}-asic", switch_id),
    }
}

async fn wait_for_state(manager: &FlowRuleManager, switch_id: &str, state: SessionState) {
    for _ in 0..200 {
        if manager.session(switch_id).map(|s| s.state) == Some(state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{} never reached {}", switch_id, state);
}

#[tokio::test]
async fn test_policy_update_reaches_every_switch() {
    let h = harness(&["leaf-1", "leaf-2", "spine-1"]);
    h.manager.start();
    for (i, id) in ["leaf-1", "leaf-2", "spine-1"].iter().enumerate() {
        h.manager.register(request(id, 9000 + i as u16)).await.unwrap();
    }

    let policy = PolicyConfig {
        sampling_rate_default: 25,
        ..Default::default()
    };
    h.manager.update_policy(policy.clone()).unwrap();

    for _ in 0..200 {
        if h.manager
            .sessions()
            .iter()
            .all(|s| s.last_applied_policy.as_ref() == Some(&policy))
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    for id in ["leaf-1", "leaf-2", "spine-1"] {
        let switch = h.factory.switch(id).unwrap();
        assert_eq!(switch.pipeline().current_policy().default_interval(), 25);
    }
    h.manager.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_switch_degrades_then_disconnects() {
    let h = harness(&["leaf-1", "leaf-2"]);
    h.manager.register(request("leaf-1", 9001)).await.unwrap();
    h.manager.register(request("leaf-2", 9002)).await.unwrap();
    h.manager.start();

    h.factory.switch("leaf-1").unwrap().set_reachable(false);
    wait_for_state(&h.manager, "leaf-1", SessionState::Disconnected).await;

    // The healthy switch is unaffected.
    assert_eq!(
        h.manager.session("leaf-2").unwrap().state,
        SessionState::Active
    );
    assert_eq!(
        h.store.states_for("leaf-1"),
        vec!["registering", "active", "degraded", "disconnected"]
    );

    // Re-registration brings it back as a fresh session.
    h.factory.switch("leaf-1").unwrap().set_reachable(true);
    h.manager.register(request("leaf-1", 9001)).await.unwrap();
    assert_eq!(
        h.manager.session("leaf-1").unwrap().state,
        SessionState::Active
    );
    h.manager.shutdown().await;
}

#[tokio::test]
async fn test_degraded_switch_recovers_on_heartbeat() {
    let h = harness(&["leaf-1"]);
    h.manager.register(request("leaf-1", 9001)).await.unwrap();
    let switch = h.factory.switch("leaf-1").unwrap();

    switch.set_reachable(false);
    h.manager.check_heartbeats().await;
    assert_eq!(
        h.manager.session("leaf-1").unwrap().state,
        SessionState::Degraded
    );

    switch.set_reachable(true);
    h.manager.check_heartbeats().await;
    let session = h.manager.session("leaf-1").unwrap();
    assert_eq!(session.state, SessionState::Active);
    assert_eq!(session.missed_heartbeats, 0);
}

#[tokio::test]
async fn test_deregistration_during_push_is_cancelled() {
    let h = harness(&["leaf-1"]);
    h.manager.register(request("leaf-1", 9001)).await.unwrap();
    h.factory.switch("leaf-1").unwrap().set_reachable(false);

    h.manager
        .update_policy(PolicyConfig {
            sampling_rate_default: 3,
            ..Default::default()
        })
        .unwrap();
    let manager = h.manager.clone();
    let reconcile = tokio::spawn(async move { manager.reconcile_once().await });
    // Let the push fail once and enter its backoff sleep.
    tokio::task::yield_now().await;
    h.manager.deregister("leaf-1").await.unwrap();

    assert_eq!(reconcile.await.unwrap(), 0);
    assert!(h.manager.sessions().is_empty());
    assert_eq!(h.store.get("leaf-1").unwrap().state, "deregistered");
}
