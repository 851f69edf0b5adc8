//! Server entry point tying the listener, workers and fault handling together

use crate::console::{run_console, spawn_stdin_reader};
use crate::fault::{spawn_worker, ServerFault};
use crate::monitor::TimeoutMonitor;
use crate::screenshots::{DirectoryScreenshotSink, ScreenshotSink};
use crate::settings::ServerSettings;
use crate::state::{ServerState, DISCONNECT_SEND_TIMEOUT};
use crate::supervisor::accept_loop;
use log::{debug, info};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How often the main loop checks the fault cell
pub const FAULT_POLL_PERIOD: Duration = Duration::from_millis(15);

/// A bound relay server, ready to run
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<ServerState>,
    console: bool,
}

impl Server {
    /// Binds the configured address, saving screenshots under the configured directory
    pub async fn new(settings: ServerSettings) -> Result<Self, ServerFault> {
        let sink: Arc<dyn ScreenshotSink> =
            Arc::new(DirectoryScreenshotSink::new(settings.screenshot_dir.clone()));
        Self::with_sink(settings, Some(sink)).await
    }

    pub async fn with_sink(
        settings: ServerSettings,
        screenshots: Option<Arc<dyn ScreenshotSink>>,
    ) -> Result<Self, ServerFault> {
        let address = settings.bind_address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| ServerFault::Bind {
                address: address.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerFault::Bind { address, source })?;
        info!("Server listening on {}", local_addr);

        Ok(Server {
            listener,
            local_addr,
            state: Arc::new(ServerState::new(settings, screenshots)),
            console: false,
        })
    }

    /// Reads operator commands from stdin while running
    pub fn with_console(mut self, enabled: bool) -> Self {
        self.console = enabled;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Cancelling this token stops [`Server::run`]
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.state.shutdown_token().clone()
    }

    fn spawn_accept_loop(state: &Arc<ServerState>, listener: TcpListener) -> JoinHandle<()> {
        let work = accept_loop(Arc::clone(state), listener);
        spawn_worker(Arc::clone(state.faults()), "accept", work)
    }

    fn spawn_timeout_monitor(state: &Arc<ServerState>) -> JoinHandle<()> {
        let monitor = TimeoutMonitor::new(Arc::clone(state));
        spawn_worker(Arc::clone(state.faults()), "timeout-monitor", monitor.run())
    }

    fn spawn_console(state: &Arc<ServerState>) -> JoinHandle<()> {
        let work = run_console(Arc::clone(state), spawn_stdin_reader());
        spawn_worker(Arc::clone(state.faults()), "console", work)
    }

    /// Runs until shutdown is requested or a worker faults
    ///
    /// On a fault the server is torn down and the fault returned.
    pub async fn run(self) -> Result<(), ServerFault> {
        let Server {
            listener,
            state,
            console,
            ..
        } = self;

        let mut workers = vec![
            Self::spawn_accept_loop(&state, listener),
            Self::spawn_timeout_monitor(&state),
        ];
        if console {
            workers.push(Self::spawn_console(&state));
        }
        info!("Server started successfully");

        let shutdown = state.shutdown_token().clone();
        let mut poll = tokio::time::interval(FAULT_POLL_PERIOD);
        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                _ = poll.tick() => {
                    if let Some(fault) = state.faults().take() {
                        break Err(fault);
                    }
                }
            }
        };

        Self::shutdown(&state, workers).await;
        result
    }

    async fn shutdown(state: &ServerState, workers: Vec<JoinHandle<()>>) {
        info!("Shutting down server");
        state.shutdown_token().cancel();
        state.slots.close_all(DISCONNECT_SEND_TIMEOUT).await;

        for worker in workers {
            if tokio::time::timeout(Duration::from_secs(1), worker).await.is_err() {
                debug!("A worker did not stop in time");
            }
        }
        info!("Server stopped");
    }
}
