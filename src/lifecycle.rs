use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use aws_lambda_events::apigw::ApiGatewayProxyRequest;
use axum::Router;
use lambda_runtime::{LambdaEvent, service_fn};
use tokio::{net::TcpListener, signal, sync::watch};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info, warn};

use crate::{
    api,
    clients::queue::{QueueClient, QueueOptions, TaskQueue},
    config::{Config, ServerConfig},
    invocation::InvocationAdapter,
};

/// Upper bound on how long in-flight requests may run after shutdown starts.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Time the invocation runtime gets to post a response after its handler returns.
const RESPONSE_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    QueueConnected,
    Serving,
    Draining,
    Stopped,
}

/// How the process receives requests. Chosen once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServeMode {
    Listener { addr: String },
    /// Events are pulled from the platform runtime API named by
    /// `AWS_LAMBDA_RUNTIME_API`.
    Invocation,
}

impl ServeMode {
    /// Fails on an incomplete platform environment instead of letting the
    /// runtime abort on it later.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        match config.aws_lambda_function_name.as_deref() {
            Some(name) if !name.is_empty() => {
                let required = [
                    ("AWS_LAMBDA_RUNTIME_API", &config.aws_lambda_runtime_api),
                    (
                        "AWS_LAMBDA_FUNCTION_MEMORY_SIZE",
                        &config.aws_lambda_function_memory_size,
                    ),
                    ("AWS_LAMBDA_FUNCTION_VERSION", &config.aws_lambda_function_version),
                ];

                for (var, value) in required {
                    if value.as_deref().is_none_or(str::is_empty) {
                        return Err(anyhow!("{} must be set in invocation mode", var));
                    }
                }

                Ok(ServeMode::Invocation)
            }
            _ => Ok(ServeMode::Listener {
                addr: config.listen_addr(),
            }),
        }
    }
}

pub struct Lifecycle {
    server: ServerConfig,
    shutdown: CancellationToken,
    state: watch::Sender<LifecycleState>,
}

impl Lifecycle {
    pub fn new(server: ServerConfig) -> Self {
        let (state, _) = watch::channel(LifecycleState::Uninitialized);

        Self {
            server,
            shutdown: CancellationToken::new(),
            state,
        }
    }

    /// Cancelling this token starts the drain.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    fn transition(&self, next: LifecycleState) {
        let previous = self.state.send_replace(next);
        info!(from = ?previous, to = ?next, "Lifecycle transition");
    }

    /// Resolves the serve mode before connecting, so a bad environment never
    /// leaves an open queue behind.
    pub async fn run(&self, config: &Config) -> Result<(), Error> {
        let mode = ServeMode::from_config(config)?;
        let queue = self.connect(config).await?;

        self.serve(mode, queue).await
    }

    pub async fn connect(&self, config: &Config) -> Result<Arc<QueueClient>, Error> {
        let options = QueueOptions::from_config(config)?;
        let client = QueueClient::connect(options).await?;

        self.transition(LifecycleState::QueueConnected);

        Ok(Arc::new(client))
    }

    /// Serves until shutdown, then closes the queue exactly once.
    pub async fn serve(&self, mode: ServeMode, queue: Arc<dyn TaskQueue>) -> Result<(), Error> {
        match mode {
            ServeMode::Listener { addr } => match TcpListener::bind(&addr).await {
                Ok(listener) => self.serve_listener(listener, queue).await,
                Err(e) => {
                    self.stop(queue.as_ref()).await;
                    Err(anyhow!("Failed to bind {}: {}", addr, e))
                }
            },
            ServeMode::Invocation => self.serve_invocations(queue).await,
        }
    }

    pub async fn serve_listener(
        &self,
        listener: TcpListener,
        queue: Arc<dyn TaskQueue>,
    ) -> Result<(), Error> {
        let router = api::router(queue.clone(), self.server);
        let result = self.listen(listener, router).await;
        self.stop(queue.as_ref()).await;
        result
    }

    pub async fn serve_invocations(&self, queue: Arc<dyn TaskQueue>) -> Result<(), Error> {
        let router = api::router(queue.clone(), self.server);
        let result = self.invoke(router).await;
        self.stop(queue.as_ref()).await;
        result
    }

    async fn stop(&self, queue: &dyn TaskQueue) {
        queue.close().await;
        self.transition(LifecycleState::Stopped);
    }

    async fn listen(&self, listener: TcpListener, router: Router) -> Result<(), Error> {
        self.transition(LifecycleState::Serving);
        info!(address = %listener.local_addr()?, "Gateway listening");

        let token = self.shutdown.clone();
        let server = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .into_future();
        let mut server = std::pin::pin!(server);

        tokio::select! {
            result = &mut server => result?,
            _ = self.shutdown.cancelled() => {
                self.transition(LifecycleState::Draining);
                info!(timeout_secs = DRAIN_TIMEOUT.as_secs(), "Draining in-flight requests");

                match tokio::time::timeout(DRAIN_TIMEOUT, &mut server).await {
                    Ok(result) => result?,
                    Err(_) => warn!("Drain timeout elapsed, abandoning in-flight requests"),
                }
            }
        }

        Ok(())
    }

    async fn invoke(&self, router: Router) -> Result<(), Error> {
        self.transition(LifecycleState::Serving);
        info!("Serving platform invocations");

        let adapter = InvocationAdapter::new(router);
        let in_flight = TaskTracker::new();

        let runtime: std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<(), lambda_runtime::Error>> + Send + '_>,
        > = {
            let in_flight = in_flight.clone();
            Box::pin(lambda_runtime::run(service_fn(
                move |event: LambdaEvent<ApiGatewayProxyRequest>| {
                    let adapter = adapter.clone();
                    let lease = in_flight.token();
                    async move {
                        let response = adapter.handle_event(event).await;
                        drop(lease);
                        response
                    }
                },
            )))
        };
        let mut runtime = runtime;

        tokio::select! {
            result = &mut runtime => {
                return result.map_err(|e| anyhow!("Invocation runtime stopped: {}", e));
            }
            _ = self.shutdown.cancelled() => {}
        }

        self.transition(LifecycleState::Draining);
        if in_flight.is_empty() {
            return Ok(());
        }
        in_flight.close();

        // keep driving the runtime so the current event can post its response
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            in_flight.wait().await;
            tokio::time::sleep(RESPONSE_GRACE).await;
        });

        tokio::select! {
            result = &mut runtime => {
                result.map_err(|e| anyhow!("Invocation runtime stopped: {}", e))?;
            }
            drained = drained => {
                if drained.is_err() {
                    warn!("Drain timeout elapsed, abandoning the current invocation");
                }
            }
        }

        Ok(())
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let vars = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()));
        envy::from_iter::<_, Config>(vars).unwrap()
    }

    #[test]
    fn test_listener_mode_without_platform_marker() {
        let mode = ServeMode::from_config(&config(&[
            ("SERVER_BIND_IP", "127.0.0.1"),
            ("SERVER_PORT", "9090"),
        ]))
        .unwrap();

        assert_eq!(
            mode,
            ServeMode::Listener {
                addr: "127.0.0.1:9090".into()
            }
        );
    }

    #[test]
    fn test_invocation_mode_with_platform_marker() {
        let mode = ServeMode::from_config(&config(&[
            ("AWS_LAMBDA_FUNCTION_NAME", "overpush"),
            ("AWS_LAMBDA_RUNTIME_API", "127.0.0.1:9001"),
            ("AWS_LAMBDA_FUNCTION_MEMORY_SIZE", "128"),
            ("AWS_LAMBDA_FUNCTION_VERSION", "$LATEST"),
        ]))
        .unwrap();

        assert_eq!(mode, ServeMode::Invocation);
    }

    #[test]
    fn test_invocation_mode_requires_runtime_environment() {
        let result = ServeMode::from_config(&config(&[
            ("AWS_LAMBDA_FUNCTION_NAME", "overpush"),
            ("AWS_LAMBDA_FUNCTION_MEMORY_SIZE", "128"),
            ("AWS_LAMBDA_FUNCTION_VERSION", "$LATEST"),
        ]));

        let err = result.unwrap_err().to_string();
        assert!(err.contains("AWS_LAMBDA_RUNTIME_API"), "Unexpected error: {}", err);
    }

    #[tokio::test]
    async fn test_bad_serve_mode_fails_before_connecting() {
        let lifecycle = Lifecycle::new(ServerConfig::default());

        // an unreachable standalone address would fail differently if dialed
        let err = lifecycle
            .run(&config(&[
                ("AWS_LAMBDA_FUNCTION_NAME", "overpush"),
                ("REDIS_CONNECTION", "127.0.0.1:1"),
            ]))
            .await
            .unwrap_err()
            .to_string();

        assert!(err.contains("must be set in invocation mode"), "Unexpected error: {}", err);
        assert_eq!(lifecycle.state(), LifecycleState::Uninitialized);
    }

    #[test]
    fn test_new_lifecycle_is_uninitialized() {
        let lifecycle = Lifecycle::new(ServerConfig::default());
        assert_eq!(lifecycle.state(), LifecycleState::Uninitialized);
    }
}
