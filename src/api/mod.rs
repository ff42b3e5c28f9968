use crate::{
    api::handlers::{health, login, register},
    broker::{
        self,
        publisher::EventPublisher,
        rpc::{RpcClient, RpcConfig},
        topology::{self, Topology},
        Broker,
    },
    config::Config,
    store::{ObjectStore, PgUserStore, RegistrationStore, S3ObjectStore},
    verifier::{VerificationConsumer, VerifierConfig},
};
use anyhow::{anyhow, Context, Result};
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, MatchedPath},
    http::{header::CONTENT_TYPE, HeaderName, HeaderValue, Method, Request},
    routing::{get, post},
    Extension, Router,
};
use secrecy::ExposeSecret;
use sqlx::postgres::PgPoolOptions;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::watch, task::JoinSet};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{error, info, info_span, warn, Span};
use ulid::Ulid;
use url::Url;

pub mod handlers;
mod openapi;

pub use self::handlers::{login::LoginClient, register::RegistrationEvents};
pub use self::openapi::openapi;

// Photos plus several scanned documents.
const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

/// Everything the handlers need, injected as request extensions.
#[derive(Clone)]
pub struct AppState {
    pub users: Arc<dyn RegistrationStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub events: Arc<RegistrationEvents>,
    pub rpc: Arc<RpcClient>,
    pub login_timeout: Duration,
}

/// Build the HTTP application.
#[must_use]
pub fn router(state: AppState, frontend_origin: HeaderValue) -> Router {
    let cors = CorsLayer::new()
        .allow_headers([CONTENT_TYPE])
        .allow_methods([Method::GET, Method::POST])
        .allow_origin(AllowOrigin::exact(frontend_origin));

    let login_client = Arc::new(LoginClient::new(state.rpc.clone(), state.login_timeout));

    Router::new()
        .route("/register", post(register::register))
        .route("/login", post(login::login))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(cors)
                .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
                .layer(Extension(state.objects))
                .layer(Extension(state.events))
                .layer(Extension(login_client)),
        )
        .route("/health", get(health::health).options(health::health))
        .layer(Extension(state.rpc))
        .layer(Extension(state.users))
}

/// Run the service until SIGINT/SIGTERM.
///
/// Startup order: broker, topology, database, object store, verification
/// consumers, reply listener, HTTP. A topology error aborts startup before
/// anything listens.
///
/// # Errors
/// Returns an error if any dependency cannot be reached at startup or the
/// listener fails.
pub async fn new(config: Config) -> Result<()> {
    let broker_url = config.broker_url()?;
    let broker = broker::connect(&broker_url)
        .await
        .context("Failed to connect to broker")?;

    run(&config, broker).await
}

/// Serve on an already connected broker. Consumers are stopped and the
/// broker is closed on every exit path, including startup failures.
///
/// # Errors
/// Same as [`new`].
pub async fn run(config: &Config, broker: Arc<dyn Broker>) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut consumers = JoinSet::new();

    let result = serve(config, broker.clone(), shutdown_rx, &mut consumers).await;

    drain(broker.as_ref(), &shutdown_tx, consumers).await;

    result
}

async fn serve(
    config: &Config,
    broker: Arc<dyn Broker>,
    shutdown: watch::Receiver<bool>,
    consumers: &mut JoinSet<Result<(), broker::ConsumeError>>,
) -> Result<()> {
    let topology_config = config.topology();
    topology::declare(broker.as_ref(), &Topology::registration(&topology_config))
        .await
        .context("Failed to declare broker topology")?;

    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(config.dsn().expose_secret())
        .await
        .context("Failed to connect to database")?;
    let store = Arc::new(PgUserStore::new(pool));

    let objects = S3ObjectStore::connect(config.object_store()).await;
    objects
        .ensure_bucket()
        .await
        .context("Failed to prepare object store bucket")?;

    for _ in 0..config.verifier_workers() {
        let consumer = VerificationConsumer::new(
            broker.clone(),
            store.clone(),
            VerifierConfig {
                queue: topology_config.verification_queue.clone(),
                reply_exchange: topology_config.auth_exchange.clone(),
                reply_routing_key: topology_config.response_routing_key.clone(),
                prefetch: 1,
            },
        );
        consumers.spawn(consumer.run(shutdown.clone()));
    }
    if config.verifier_workers() == 0 {
        info!("in-process verification disabled");
    }

    let rpc = RpcClient::start(
        broker.clone(),
        RpcConfig {
            exchange: topology_config.auth_exchange.clone(),
            routing_key: topology_config.verification_routing_key.clone(),
            reply_queue: topology_config.response_queue.clone(),
        },
    )
    .await
    .context("Failed to start reply listener")?;

    let state = AppState {
        users: store,
        objects: Arc::new(objects),
        events: Arc::new(RegistrationEvents::new(
            EventPublisher::new(broker),
            &topology_config.user_exchange,
            &topology_config.registration_routing_key,
        )),
        rpc: Arc::new(rpc),
        login_timeout: config.login_timeout(),
    };

    let app = router(state, frontend_origin(config.frontend_origin())?);

    let port = config.port();
    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Gracefully shutdown");

    Ok(())
}

async fn drain(
    broker: &dyn Broker,
    shutdown: &watch::Sender<bool>,
    mut consumers: JoinSet<Result<(), broker::ConsumeError>>,
) {
    // Receivers may already be gone if every consumer exited on its own.
    let _ = shutdown.send(true);

    while let Some(joined) = consumers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!("verification consumer failed: {err}"),
            Err(err) => error!("verification consumer panicked: {err}"),
        }
    }

    if let Err(err) = broker.close().await {
        warn!("Failed to close broker connection: {err}");
    }
}

/// Completes on Ctrl+C or SIGTERM.
pub fn shutdown_signal() -> impl Future<Output = ()> {
    async {
        let ctrl_c = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {err}");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(err) => {
                    error!("Failed to listen for SIGTERM: {err}");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => info!("Received Ctrl+C, shutting down"),
            () = terminate => info!("Received SIGTERM, shutting down"),
        }
    }
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

/// Reduce a configured frontend URL to the `scheme://host[:port]` origin.
///
/// # Errors
/// Returns an error if the URL does not parse or has no host.
pub fn frontend_origin(frontend_base_url: &str) -> Result<HeaderValue> {
    let parsed = Url::parse(frontend_base_url)
        .with_context(|| format!("Invalid frontend base URL: {frontend_base_url}"))?;
    let host = parsed.host_str().ok_or_else(|| {
        anyhow!("Frontend base URL must include a valid host: {frontend_base_url}")
    })?;
    let port = parsed
        .port()
        .map_or_else(String::new, |port| format!(":{port}"));
    let origin = format!("{}://{}{}", parsed.scheme(), host, port);
    HeaderValue::from_str(&origin).context("Failed to build frontend origin header")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, Message, PublishError};
    use secrecy::SecretString;

    #[test]
    fn frontend_origin_strips_path() {
        let origin = frontend_origin("http://localhost:3000/app/login").unwrap();
        assert_eq!(origin, "http://localhost:3000");

        let origin = frontend_origin("https://registrar.dev").unwrap();
        assert_eq!(origin, "https://registrar.dev");

        assert!(frontend_origin("localhost:3000").is_err());
    }

    #[tokio::test]
    async fn failed_startup_still_closes_the_broker() {
        let broker = Arc::new(MemoryBroker::new());
        let config = Config::new(
            SecretString::from("not a postgres dsn".to_string()),
            SecretString::from("memory://local".to_string()),
        );

        let err = run(&config, broker.clone()).await.unwrap_err();
        assert!(format!("{err:#}").contains("Failed to connect to database"));

        // topology was declared before the failure, then the broker was closed
        assert_eq!(broker.queue_count().await, 4);
        let publish = broker
            .publish("user_exchange", "user.registration", Message::json(b"{}".to_vec()))
            .await;
        assert!(matches!(publish, Err(PublishError::ChannelClosed)));
    }
}
