//! Clientele Entry Point
//!
//! Reads configuration from the environment, connects the outbound drivers
//! and runs one of the inbound transports: the HTTP server, the upsert
//! subscriber, or a one-shot publish/workflow start.

use clap::{Parser, Subcommand};
use clientele_api::{
    create_router, drivers::Backends, telemetry::init_tracing, ApiError, ApiResult, AppConfig,
    AppState, AuthDriver, JwtValidator,
};
use clientele_core::{ClientInput, ClienteleError, ClienteleResult, UPSERT_CLIENT_TOPIC};
use clientele_domain::ClientService;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Parser)]
#[command(name = "clientele", version, about = "Client identity service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP server and the in-process workflow worker.
    Serve,
    /// Run a message subscriber until Ctrl-C.
    Subscribe {
        #[command(subcommand)]
        topic: SubscribeTopic,
    },
    /// Publish a single-client upsert batch.
    PublishUpsert {
        name: String,
        #[arg(long, default_value = "")]
        bearer_key: String,
    },
    /// Start an upsert workflow run and print its result.
    StartUpsert {
        name: String,
        #[arg(long, default_value = "")]
        bearer_key: String,
    },
}

#[derive(Debug, Subcommand)]
enum SubscribeTopic {
    /// Apply published upsert batches.
    UpsertClient,
}

#[tokio::main]
async fn main() -> ApiResult<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_env()?;
    init_tracing(config.mode)?;

    let backends = Backends::connect(&config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    match cli.command {
        Command::Serve => serve(&config, &backends, shutdown_tx, shutdown_rx).await,
        Command::Subscribe {
            topic: SubscribeTopic::UpsertClient,
        } => {
            if config.drivers.is_process_local_broker() {
                tracing::warn!("In-memory broker: only messages published by this process arrive");
            }
            let subscriber = backends.subscriber();
            let broker = Arc::clone(&backends.deps.broker);
            let task =
                tokio::spawn(async move { subscriber.run(broker.as_ref(), shutdown_rx).await });
            wait_for_ctrl_c(&shutdown_tx).await;
            join(task).await
        }
        Command::PublishUpsert { name, bearer_key } => {
            if config.drivers.is_process_local_broker() {
                tracing::warn!("In-memory broker: the batch is dropped when this process exits");
            }
            let input = ClientInput::named(name).with_bearer_key(bearer_key);
            backends.service().publish_upsert(vec![input]).await?;
            println!("Published");
            Ok(())
        }
        Command::StartUpsert { name, bearer_key } => {
            let worker = tokio::spawn(backends.worker().run(shutdown_rx));
            let input = ClientInput::named(name).with_bearer_key(bearer_key);
            let outcome = start_and_await(&backends.service(), input).await;

            let _ = shutdown_tx.send(true);
            join(worker).await?;
            println!("{}", outcome?);
            Ok(())
        }
    }
}

async fn serve(
    config: &AppConfig,
    backends: &Backends,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
) -> ApiResult<()> {
    let mut tasks: Vec<JoinHandle<ClienteleResult<()>>> = Vec::new();
    tasks.push(tokio::spawn(backends.worker().run(shutdown_rx.clone())));

    if config.drivers.is_process_local_broker() {
        // Bind before serving so nothing published over HTTP is dropped.
        let subscriber = backends.subscriber();
        let consumer = backends
            .deps
            .broker
            .subscribe(UPSERT_CLIENT_TOPIC, subscriber.queue())
            .await?;
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { subscriber.consume(consumer, rx).await }));
    }

    let mut state =
        AppState::new(backends.service()).with_ping_sample(config.server.ping_sample);
    match &config.server.internal_key {
        Some(key) => state = state.with_internal_key(key.clone()),
        None => tracing::warn!("INTERNAL_KEY is unset; /internal routes reject every request"),
    }
    if let AuthDriver::Jwt { jwks_url } = &config.auth {
        let validator = JwtValidator::from_url(jwks_url.clone())
            .map_err(|e| ApiError::internal_error(format!("JWKS client: {}", e)))?;
        tracing::info!(%jwks_url, "Client routes authenticate with JWT");
        state = state.with_jwt_validator(validator);
    }
    let app = create_router(state);

    let addr = config.server.bind_addr().map_err(ClienteleError::from)?;
    tracing::info!(%addr, "Starting clientele server");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", addr, e)))?;

    let mut server_rx = shutdown_rx;
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move { wait_for_ctrl_c(&signal_tx).await });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = server_rx.wait_for(|stop| *stop).await;
        })
        .await
        .map_err(|e| ApiError::internal_error(format!("Server error: {}", e)))?;

    let _ = shutdown_tx.send(true);
    for task in tasks {
        join(task).await?;
    }
    tracing::info!("Server stopped");
    Ok(())
}

async fn start_and_await(service: &ClientService, input: ClientInput) -> ClienteleResult<String> {
    let handle = service.start_upsert(input).await?;
    println!("Run id: {}", handle.run_id);
    service.await_upsert(&handle.run_id).await
}

async fn wait_for_ctrl_c(shutdown: &watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
    }
    tracing::info!("Shutdown signal received");
    let _ = shutdown.send(true);
}

async fn join(task: JoinHandle<ClienteleResult<()>>) -> ApiResult<()> {
    task.await
        .map_err(|e| ApiError::internal_error(format!("Task panicked: {}", e)))?
        .map_err(ApiError::from)
}
