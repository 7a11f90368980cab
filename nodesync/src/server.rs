//! Server lifecycle management
//!
//! Builds the worker pool and wires every slot to the sync engine:
//! - worker slots, each with its own load balancers and mailbox
//! - the `instance-center-fetcher` auxiliary process in `process` mode
//! - the push listener on worker 0
//! - service logout on shutdown

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use nodesync_cluster::discovery::{ClientIdentity, LoadBalancerManager};
use nodesync_cluster::sync::{
    process_channel, DriverFactory, PipeMessage, ProcessContext, ProcessIdentity, ProcessReceiver,
    PushHandler, PushListener, ServerTransport, ServiceDeregistrar, SyncDriver, WorkerId,
    WorkerSender,
};
use nodesync_core::{net, Config, Mode, ServicesConfig};

/// Name of the auxiliary process owning the poll loop in `process` mode
pub const FETCHER_PROCESS_NAME: &str = "instance-center-fetcher";

const WORKER_MAILBOX_CAPACITY: usize = 64;
const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Worker pool of one server
pub struct NodeSyncServer {
    config: Config,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    deregistrar: Option<ServiceDeregistrar>,
}

impl NodeSyncServer {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
            deregistrar: None,
        }
    }

    /// Start every slot and wait for a shutdown signal
    pub async fn start(mut self) -> anyhow::Result<()> {
        info!("Starting NodeSync server...");

        let services = Arc::new(self.config.services.clone());
        let identity = ClientIdentity {
            app: net::app_name(&self.config),
            client_ip: net::announce_ip(&self.config),
            udp_port: self.config.server.udp_port,
        };
        info!(app = %identity.app, ip = %identity.client_ip, "Registry client identity");

        // Slot pids are derived from the server pid so they stay unique per host
        let base_pid = std::process::id();
        let total_workers = self.config.server.total_workers();
        let fetcher_pid = base_pid + 1 + u32::try_from(total_workers)?;
        let use_fetcher = services.mode == Mode::Process && services.discovery_driver().is_some();

        let mut transport = ServerTransport::new();
        let mut mailboxes = Vec::with_capacity(total_workers);
        for worker_id in 0..total_workers {
            let (tx, rx) = mpsc::channel(WORKER_MAILBOX_CAPACITY);
            transport.add_worker(worker_id, Arc::new(WorkerSender::new(tx)));
            mailboxes.push(rx);
        }

        let fetcher_receiver = if use_fetcher {
            let (sender, receiver) = process_channel(self.config.server.ipc_send_timeout())?;
            transport.add_process(fetcher_pid, Arc::new(sender));
            Some(receiver)
        } else {
            None
        };
        let transport = Arc::new(transport);

        for (worker_id, mailbox) in mailboxes.into_iter().enumerate() {
            let pid = base_pid + 1 + u32::try_from(worker_id)?;
            let factory = self.factory(
                &services,
                &identity,
                ProcessIdentity::worker(worker_id, pid),
                &transport,
            );
            let driver = factory.create_from_config()?;

            if worker_id == 0 {
                self.deregistrar = self.build_deregistrar(&factory, &identity.client_ip)?;
            }

            if let Some(driver) = &driver {
                driver.fetch_instance().await;
                if services.mode == Mode::Coroutine {
                    self.tasks.push(driver.create_message_instance_loop()?);
                }
                if worker_id == 0 && self.config.server.udp_port != 0 {
                    let listener = PushListener::bind(
                        &self.config.server.udp_address(),
                        Arc::new(PushHandler::new(Arc::clone(driver))),
                        self.shutdown.clone(),
                    )
                    .await?;
                    self.tasks.push(listener.spawn());
                }
            }

            let worker = run_worker(worker_id, driver, mailbox, self.shutdown.clone());
            self.tasks.push(tokio::spawn(worker));
        }

        if let Some(receiver) = fetcher_receiver {
            let factory = self.factory(
                &services,
                &identity,
                ProcessIdentity::auxiliary(fetcher_pid),
                &transport,
            );
            if let Some(driver) = factory.create_from_config()? {
                driver.fetch_instance().await;
                self.tasks.push(driver.create_message_instance_loop()?);
                let process = run_fetcher_process(driver, receiver, self.shutdown.clone());
                self.tasks.push(tokio::spawn(process));
                info!(
                    process = FETCHER_PROCESS_NAME,
                    pid = fetcher_pid,
                    "Auxiliary process started"
                );
            }
        }

        info!(workers = total_workers, tasks = self.tasks.len(), "All slots started");

        shutdown_signal(self.shutdown.clone()).await;
        info!("Shutdown signal received, starting graceful shutdown...");

        self.stop().await;
        Ok(())
    }

    fn factory(
        &self,
        services: &Arc<ServicesConfig>,
        identity: &ClientIdentity,
        process: ProcessIdentity,
        transport: &Arc<ServerTransport>,
    ) -> DriverFactory {
        DriverFactory::new(
            Arc::clone(services),
            identity.clone(),
            ProcessContext {
                identity: process,
                transport: Arc::clone(transport),
                sink: Arc::new(LoadBalancerManager::new()),
                shutdown: self.shutdown.clone(),
            },
        )
    }

    fn build_deregistrar(
        &self,
        factory: &DriverFactory,
        ip: &str,
    ) -> anyhow::Result<Option<ServiceDeregistrar>> {
        let services = &self.config.services;
        if services.registrations.is_empty() {
            return Ok(None);
        }
        let Some(driver) = services.active_driver() else {
            warn!(
                driver = %services.driver,
                "No driver configured, services will not be deregistered"
            );
            return Ok(None);
        };

        Ok(Some(ServiceDeregistrar::new(
            factory.registry_client(&services.driver)?,
            driver,
            services.registrations.clone(),
            ip,
            services.enable.auto_logout,
            self.shutdown.clone(),
        )))
    }

    /// Log out, stop every loop and wait for the tasks to finish
    async fn stop(self) {
        info!("Shutting down NodeSync server...");

        if let Some(deregistrar) = &self.deregistrar {
            if let Some(report) = deregistrar.logout().await {
                info!(
                    removed = report.removed.len(),
                    failed = report.failed.len(),
                    "Services deregistered"
                );
            }
        }
        self.shutdown.cancel();

        let drained = tokio::time::timeout(TASK_DRAIN_TIMEOUT, join_all(self.tasks)).await;
        match drained {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!(error = %e, "Task ended abnormally");
                    }
                }
                info!("NodeSync server stopped");
            }
            Err(_) => warn!(
                timeout_secs = TASK_DRAIN_TIMEOUT.as_secs(),
                "Tasks still running at shutdown timeout"
            ),
        }
    }
}

/// Worker slot: applies node updates from siblings until shutdown
async fn run_worker(
    worker_id: WorkerId,
    driver: Option<Arc<SyncDriver>>,
    mut mailbox: mpsc::Receiver<PipeMessage>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            message = mailbox.recv() => message,
        };
        let Some(message) = message else { break };

        match &driver {
            Some(driver) => driver.on_pipe_message(&message),
            None => debug!(worker_id = worker_id, "Discovery disabled, ignoring node update"),
        }
    }
    debug!(worker_id = worker_id, "Worker stopped");
}

/// Auxiliary fetcher: applies updates arriving on its process channel
async fn run_fetcher_process(
    driver: Arc<SyncDriver>,
    mut receiver: ProcessReceiver<tokio::net::UnixStream>,
    shutdown: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            received = receiver.recv() => received,
        };

        match received {
            Some(Ok(message)) => driver.on_pipe_message(&message),
            Some(Err(e)) => warn!(
                process = FETCHER_PROCESS_NAME,
                error = %e,
                "Dropping unreadable node update"
            ),
            None => break,
        }
    }
    debug!(process = FETCHER_PROCESS_NAME, "Auxiliary process stopped");
}

/// Wait for SIGTERM, Ctrl+C or an internal shutdown
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
        () = shutdown.cancelled() => { info!("Internal shutdown requested"); }
    }
}
