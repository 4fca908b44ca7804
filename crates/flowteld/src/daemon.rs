//! Daemon wiring.
//!
//! Builds the stores, the digest consumer and the rule manager from a
//! [`FlowtelConfig`], binds the HTTP and UDP listeners and runs until the
//! shutdown signal, then drains everything in order: listeners first, then
//! switch sessions, then the flush buffer.

use crate::api::{build_router, AppState};
use crate::config_file::FlowtelConfig;
use crate::error::Result;
use crate::listener::DigestListener;
use crate::simulate::{self, SimulatedSwitch};
use flowtel_collector::{CollectorError, DigestConsumer, JsonLinesStore, MetricsCollector};
use flowtel_common::{FlowStore, MemoryFlowStore, MemorySwitchStatusStore, SwitchStatusStore};
use flowtel_rulemgr::{FlowRuleManager, HttpChannelFactory, LocalChannelFactory};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

/// A bound, not yet running, flowteld instance.
pub struct Daemon {
    config: FlowtelConfig,
    consumer: Arc<DigestConsumer>,
    manager: Arc<FlowRuleManager>,
    factory: Arc<LocalChannelFactory>,
    http: TcpListener,
    digests: DigestListener,
    http_addr: SocketAddr,
    digest_addr: SocketAddr,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

async fn open_stores(
    config: &FlowtelConfig,
) -> Result<(Arc<dyn FlowStore>, Arc<dyn SwitchStatusStore>)> {
    match &config.collector.store_dir {
        Some(dir) => {
            let flows = JsonLinesStore::open(dir.join("flows.jsonl")).await?;
            let switches = JsonLinesStore::open(dir.join("switches.jsonl")).await?;
            info!(dir = %dir.display(), "Using JSON-lines stores");
            Ok((Arc::new(flows), Arc::new(switches)))
        }
        None => {
            info!("No store directory configured, keeping records in memory");
            Ok((
                Arc::new(MemoryFlowStore::new()),
                Arc::new(MemorySwitchStatusStore::new()),
            ))
        }
    }
}

impl Daemon {
    /// Validates `config`, builds the components and binds both listeners.
    pub async fn bind(config: FlowtelConfig) -> Result<Self> {
        config.validate()?;
        let (flow_store, status_store) = open_stores(&config).await?;

        let metrics = MetricsCollector::new().map_err(CollectorError::from)?;
        let consumer = DigestConsumer::new(
            config.collector_config(),
            config.policy.clone(),
            flow_store,
            metrics,
        )?;

        // Simulated switches resolve in-process; everything else over HTTP.
        let manager_config = config.manager_config();
        let factory = Arc::new(LocalChannelFactory::with_fallback(Arc::new(
            HttpChannelFactory::new(manager_config.request_timeout),
        )));
        let manager = FlowRuleManager::new(
            manager_config,
            factory.clone(),
            status_store,
            config.policy.clone(),
        )?;

        let http = TcpListener::bind(config.http_addr()?).await?;
        let http_addr = http.local_addr()?;
        let digests =
            DigestListener::bind(config.digest_addr()?, consumer.clone(), manager.clone()).await?;
        let digest_addr = digests.local_addr()?;

        Ok(Self {
            config,
            consumer,
            manager,
            factory,
            http,
            digests,
            http_addr,
            digest_addr,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn digest_addr(&self) -> SocketAddr {
        self.digest_addr
    }

    pub fn consumer(&self) -> &Arc<DigestConsumer> {
        &self.consumer
    }

    pub fn manager(&self) -> &Arc<FlowRuleManager> {
        &self.manager
    }

    /// Starts `count` in-process switches generating synthetic traffic.
    pub async fn start_simulation(&self, count: usize) -> Result<Vec<SimulatedSwitch>> {
        simulate::spawn_switches(
            count,
            &self.config,
            &self.factory,
            &self.manager,
            &self.consumer,
            &self.tasks,
            &self.cancel,
        )
        .await
    }

    /// Serves until `shutdown` completes, then stops every component.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Daemon {
            consumer,
            manager,
            http,
            digests,
            http_addr,
            digest_addr,
            cancel,
            tasks,
            ..
        } = self;

        consumer.start();
        manager.start();
        tasks.spawn(digests.run(cancel.child_token()));

        let app = build_router(AppState {
            consumer: consumer.clone(),
            manager: manager.clone(),
        });
        info!(http = %http_addr, digests = %digest_addr, "flowteld: Serving");

        let stop = cancel.clone();
        axum::serve(http, app)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = shutdown => {}
                    _ = stop.cancelled() => {}
                }
            })
            .await?;

        info!("flowteld: Shutting down");
        cancel.cancel();
        tasks.close();
        tasks.wait().await;
        manager.shutdown().await;
        consumer.shutdown().await;
        info!("flowteld: Stopped");
        Ok(())
    }
}
