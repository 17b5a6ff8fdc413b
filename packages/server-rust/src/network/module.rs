//! Network module with deferred startup lifecycle.
//!
//! `new()` creates resources, `start()` binds the TCP listener, and `serve()`
//! starts accepting connections. Between `start()` and `serve()` the caller
//! can bring up the rest of the application (store, coordinator).

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::{NetworkConfig, TlsConfig};
use super::handlers::{
    create_contract, create_user, delete_contract, delete_user, get_contract, get_user,
    health_handler, list_contracts, liveness_handler, lookup_user, readiness_handler, update_user,
    ApiBackend, AppState,
};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;

/// Manages the HTTP server lifecycle.
///
/// 1. `new()` -- allocates shared state (shutdown controller)
/// 2. `start()` -- binds TCP listener to the configured address
/// 3. `serve()` -- accepts connections until shutdown is signalled, then
///    drains in-flight requests
pub struct NetworkModule {
    config: NetworkConfig,
    backend: ApiBackend,
    listener: Option<TcpListener>,
    shutdown: Arc<ShutdownController>,
}

impl NetworkModule {
    #[must_use]
    pub fn new(config: NetworkConfig, backend: ApiBackend) -> Self {
        Self {
            config,
            backend,
            listener: None,
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    /// Shared handle used to check health state or trigger shutdown.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Assembles the axum router with all routes and middleware.
    ///
    /// Routes:
    /// - `POST /users`, `GET /users?email=..|cpf=..`
    /// - `GET|PUT|DELETE /users/{id}`
    /// - `POST /contracts`, `GET /contracts?customer=..`
    /// - `GET|DELETE /contracts/{id}`
    /// - `GET /health`, `/health/live`, `/health/ready`
    pub fn build_router(&self) -> Router {
        router(
            AppState {
                backend: self.backend.clone(),
                shutdown: Arc::clone(&self.shutdown),
                config: Arc::new(self.config.clone()),
                start_time: Instant::now(),
            },
            &self.config,
        )
    }

    /// Binds the TCP listener and returns the actual port (useful with port 0).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!("TCP listener bound to {}:{}", self.config.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then drains in-flight requests.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first or the server hits a
    /// fatal I/O error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let router = self.build_router();
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;
        let controller = self.shutdown;
        let config = self.config;

        controller.set_ready();

        if let Some(ref tls) = config.tls {
            serve_tls(listener, router, tls, shutdown).await?;
        } else {
            info!("Serving plain HTTP connections");
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await?;
        }

        drain(&controller, &config).await;
        Ok(())
    }
}

fn router(state: AppState, config: &NetworkConfig) -> Router {
    Router::new()
        .route("/users", get(lookup_user).post(create_user))
        .route(
            "/users/{id}",
            get(get_user).put(update_user).delete(delete_user),
        )
        .route("/contracts", get(list_contracts).post(create_contract))
        .route("/contracts/{id}", get(get_contract).delete(delete_contract))
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .layer(build_http_layers(config))
        .with_state(state)
}

/// Serves TLS connections using `axum-server` with rustls, reusing the
/// pre-bound listener.
async fn serve_tls(
    listener: TcpListener,
    router: Router,
    tls: &TlsConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    use axum_server::tls_rustls::RustlsConfig;

    let rustls_config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load TLS certificates: {e}"))?;

    let addr = listener.local_addr()?;
    let std_listener = listener.into_std()?;
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();

    tokio::spawn(async move {
        shutdown.await;
        shutdown_handle.graceful_shutdown(None);
    });

    info!("Serving TLS connections on {}", addr);

    axum_server::from_tcp_rustls(std_listener, rustls_config)
        .handle(handle)
        .serve(router.into_make_service())
        .await?;
    Ok(())
}

/// Moves to Draining and waits for in-flight submissions to finish.
async fn drain(controller: &ShutdownController, config: &NetworkConfig) {
    controller.trigger_shutdown();

    if controller.wait_for_drain(config.drain_timeout).await {
        info!("All in-flight requests drained");
    } else {
        warn!(
            in_flight = controller.in_flight_count(),
            "Drain timeout expired with in-flight requests remaining"
        );
    }
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::network::handlers::test_support::TestApp;
    use crate::traits::UserRepository as _;

    fn module(app: &TestApp) -> NetworkModule {
        let module = NetworkModule::new(NetworkConfig::default(), app.state.backend.clone());
        module.shutdown.set_ready();
        module
    }

    async fn call(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post(uri: &str, body: &Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn ana(email: &str, cpf: &str) -> Value {
        json!({
            "name": "Ana",
            "last_name": "Souza",
            "email": email,
            "cpf": cpf,
            "password": "correct-horse",
        })
    }

    #[tokio::test]
    async fn user_lifecycle_over_http() {
        let app = TestApp::new();
        app.start().await;
        let router = module(&app).build_router();

        let (status, created) = call(&router, post("/users", &ana("a@x.com", "12345678901"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(created["status"], "created");
        let id = created["id"].as_str().unwrap().to_string();

        let (status, user) = call(
            &router,
            Request::get(format!("/users/{id}")).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(user["name"], "Ana");
        assert!(user.get("password").is_none());

        let (status, updated) = call(
            &router,
            Request::put(format!("/users/{id}"))
                .header("content-type", "application/json")
                .body(Body::from(json!({"name": "Bia"}).to_string()))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["status"], "updated");

        let (status, _) = call(
            &router,
            Request::delete(format!("/users/{id}")).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            &router,
            Request::get(format!("/users/{id}")).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");

        app.stop().await;
    }

    #[tokio::test]
    async fn concurrent_duplicate_email_gives_one_bad_request() {
        let app = TestApp::new();
        app.start().await;
        let router = module(&app).build_router();

        let (first, second) = tokio::join!(
            call(&router, post("/users", &ana("a@x.com", "11111111111"))),
            call(&router, post("/users", &ana("a@x.com", "22222222222"))),
        );

        let mut statuses = [first.0, second.0];
        statuses.sort();
        assert_eq!(statuses, [StatusCode::OK, StatusCode::BAD_REQUEST]);
        assert_eq!(app.store.count().await.unwrap(), 1);

        app.stop().await;
    }

    #[tokio::test]
    async fn malformed_json_is_a_bad_request() {
        let app = TestApp::new();
        app.start().await;
        let router = module(&app).build_router();

        let (status, body) = call(
            &router,
            Request::post("/users")
                .header("content-type", "application/json")
                .body(Body::from("{\"name\":"))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "decode");

        let (status, _) = call(
            &router,
            Request::get("/users/not-a-uuid").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        app.stop().await;
    }

    #[tokio::test]
    async fn stopped_coordinator_is_service_unavailable() {
        let app = TestApp::new();
        let router = module(&app).build_router();

        let (status, body) = call(&router, post("/users", &ana("a@x.com", "12345678901"))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "coordinator_down");

        let (status, _) = call(
            &router,
            Request::get("/health/ready").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn contracts_over_http() {
        let app = TestApp::new();
        app.start().await;
        let router = module(&app).build_router();

        let contract = json!({
            "kind": "contract",
            "customer": "ACME",
            "title": "Lease",
            "parties": ["ACME", "Ana"],
            "object": "Office 12",
        });
        let (status, created) = call(&router, post("/contracts", &contract)).await;
        assert_eq!(status, StatusCode::OK);
        let id = created["id"].as_str().unwrap().to_string();

        let (status, listed) = call(
            &router,
            Request::get("/contracts?customer=ACME").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["file"]["customer"], "ACME");

        let (status, _) = call(
            &router,
            Request::delete(format!("/contracts/{id}")).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(
            &router,
            Request::get(format!("/contracts/{id}")).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        app.stop().await;
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let app = TestApp::new();
        let mut module = NetworkModule::new(NetworkConfig::default(), app.state.backend.clone());
        let port = module.start().await.unwrap();
        assert!(port > 0);
        assert!(module.listener.is_some());
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let app = TestApp::new();
        let module = NetworkModule::new(NetworkConfig::default(), app.state.backend.clone());
        let err = module.serve(std::future::ready(())).await.unwrap_err();
        assert!(err.to_string().contains("start()"));
    }

    #[tokio::test]
    async fn serve_drains_and_stops_on_shutdown() {
        let app = TestApp::new();
        let mut module = NetworkModule::new(NetworkConfig::default(), app.state.backend.clone());
        let controller = module.shutdown_controller();
        module.start().await.unwrap();

        module.serve(std::future::ready(())).await.unwrap();

        assert_eq!(controller.health_state(), crate::network::HealthState::Stopped);
    }
}
