//! Process orchestrator wiring every component together.
//!
//! [`Adapter`] owns one instance of each component, created once at
//! construction and shared by reference. [`Adapter::run`] starts the
//! background work, waits for a shutdown signal or a fatal error, and then
//! runs the [`ShutdownCoordinator`].

use std::{future::Future, sync::Arc, time::Duration};

use log::{error, info};
use tokio::{select, sync::mpsc};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    backend::{BackendHandler, BackendLink, BackendTransport},
    config::AdapterConfig,
    error::AdapterError,
    fragment::Reassembler,
    gateway::GatewayConnection,
    pipeline::{Handlers, MessagePipeline},
    shutdown::{ShutdownCoordinator, ShutdownReport, Teardown},
    sweep::Sweeper,
};

/// The assembled relay.
#[derive(Debug)]
pub struct Adapter {
    config: AdapterConfig,
    reassembler: Arc<Reassembler>,
    pipeline: Arc<MessagePipeline>,
    gateway: Arc<GatewayConnection>,
    backend: Arc<BackendLink>,
    sweeper: Arc<Sweeper>,
    task_token: CancellationToken,
    tasks: TaskTracker,
}

impl Adapter {
    /// Build every component from `config`, reaching the backend through
    /// `transport`.
    #[must_use]
    pub fn new(config: AdapterConfig, transport: Arc<dyn BackendTransport>) -> Self {
        let reassembler = Arc::new(Reassembler::new(
            config.chunking.max_message_size(),
            Duration::from_secs(config.chunking.reassembly_ttl_secs),
        ));
        let pipeline = Arc::new(MessagePipeline::new(&config.pipeline));
        let gateway = Arc::new(GatewayConnection::new(
            config.gateway.clone(),
            Arc::clone(&reassembler),
            Arc::clone(&pipeline),
        ));
        let backend = Arc::new(BackendLink::new(
            config.platform.clone(),
            config.backend.clone(),
            &config.chunking,
            transport,
            Arc::clone(&reassembler),
        ));
        Self {
            config,
            reassembler,
            pipeline,
            gateway,
            backend,
            sweeper: Arc::new(Sweeper::new()),
            task_token: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &AdapterConfig { &self.config }

    #[must_use]
    pub fn gateway(&self) -> &Arc<GatewayConnection> { &self.gateway }

    #[must_use]
    pub fn backend(&self) -> &Arc<BackendLink> { &self.backend }

    #[must_use]
    pub fn pipeline(&self) -> &Arc<MessagePipeline> { &self.pipeline }

    #[must_use]
    pub fn reassembler(&self) -> &Arc<Reassembler> { &self.reassembler }

    /// Run until `signal` resolves or a component fails fatally, then shut
    /// down.
    ///
    /// # Errors
    ///
    /// Returns the fatal [`AdapterError`] that ended the run, after shutdown
    /// has completed.
    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus internally"
    )]
    pub async fn run<S>(
        &self,
        handlers: Handlers,
        backend_handler: Arc<dyn BackendHandler>,
        signal: S,
    ) -> Result<(), AdapterError>
    where
        S: Future<Output = ()> + Send,
    {
        self.start_sweeps();
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<AdapterError>(2);

        let consumer = {
            let pipeline = Arc::clone(&self.pipeline);
            let token = self.task_token.clone();
            self.tasks
                .spawn(async move { pipeline.run(&handlers, &token).await })
        };
        {
            let gateway = Arc::clone(&self.gateway);
            let fatal_tx = fatal_tx.clone();
            self.tasks.spawn(async move {
                if let Err(e) = gateway.run().await {
                    let _ = fatal_tx.send(e.into()).await;
                }
            });
        }
        {
            let backend = Arc::clone(&self.backend);
            let fatal_tx = fatal_tx.clone();
            self.tasks.spawn(async move {
                if let Err(e) = backend.run(backend_handler.as_ref()).await {
                    let _ = fatal_tx.send(e.into()).await;
                }
            });
        }
        drop(fatal_tx);
        info!(
            "adapter started: platform={}, gateway_mode={:?}",
            self.config.platform, self.config.gateway.mode
        );

        let outcome = select! {
            () = signal => {
                info!("shutdown requested");
                Ok(())
            }
            Some(err) = fatal_rx.recv() => {
                error!("fatal error, shutting down: error={err}");
                Err(err)
            }
        };

        self.coordinator(vec![consumer.abort_handle()])
            .shutdown()
            .await;
        outcome
    }

    /// Tear everything down without running first.
    pub async fn shutdown(&self) -> ShutdownReport { self.coordinator(Vec::new()).shutdown().await }

    fn start_sweeps(&self) {
        let reassembler = Arc::clone(&self.reassembler);
        self.sweeper.spawn(
            "reassembly-ttl",
            Duration::from_secs(self.config.chunking.sweep_interval_secs),
            move || {
                reassembler.purge_expired();
            },
        );

        let gateway = Arc::clone(&self.gateway);
        let backend = Arc::clone(&self.backend);
        self.sweeper.spawn(
            "correlation-deadline",
            Duration::from_millis(self.config.correlation.sweep_interval_ms),
            move || {
                gateway.correlator().sweep_expired();
                backend.correlator().sweep_expired();
            },
        );
    }

    fn coordinator(&self, abort_handles: Vec<tokio::task::AbortHandle>) -> ShutdownCoordinator {
        ShutdownCoordinator::new(Duration::from_secs(self.config.shutdown.wait_secs))
            .step(Arc::clone(&self.sweeper) as Arc<dyn Teardown>)
            .step(Arc::clone(&self.gateway) as Arc<dyn Teardown>)
            .step(Arc::clone(&self.backend) as Arc<dyn Teardown>)
            .tasks(self.task_token.clone(), self.tasks.clone(), abort_handles)
            .pipeline(Arc::clone(&self.pipeline))
    }
}
