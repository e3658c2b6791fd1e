//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! HTTP server for Waypoint Gateway
//!
//! Health endpoints, the management API under `gateway.api_prefix`, and a
//! fallback that reverse-proxies everything else.

use crate::{
    clock::generate_instance_id,
    error::GatewayError,
    gateway::WaypointGateway,
    middleware::{auth_layer, request_pipeline, ApiError, PipelineSettings, RequestScope},
    types::{Endpoint, GatewayStatus, HealthCheckDescriptor, HealthRecord, ServiceInstance, StatusCounts},
};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderValue, Method, Request, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, put},
    Extension, Router as AxumRouter,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

type ApiResult<T> = Result<T, ApiError>;

/// Instance registration body of `POST {api_prefix}/services`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Defaults to `{service}-{host}-{port}`
    #[serde(default)]
    pub instance_id: Option<String>,

    pub service_name: String,

    /// `host:port`, optionally with an `http://` or `https://` scheme
    pub address: String,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// Defaults to a single HTTP probe of `/health`
    #[serde(default)]
    pub health_check: Option<HealthCheckDescriptor>,
}

impl RegisterRequest {
    fn into_instance(self) -> Result<ServiceInstance, GatewayError> {
        let endpoint = Endpoint::parse(&self.address)?;
        let instance_id = self.instance_id.unwrap_or_else(|| {
            generate_instance_id(&self.service_name, &endpoint.host, endpoint.port)
        });
        let mut instance = ServiceInstance::new(instance_id, self.service_name, endpoint);
        instance.tags = self.tags.into_iter().collect();
        instance.metadata = self.metadata;
        instance.health_check = self.health_check.unwrap_or_default();
        Ok(instance)
    }
}

/// Body of `PUT {api_prefix}/config/{key}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigValue {
    pub value: String,
}

/// HTTP server for gateway
#[derive(Clone)]
pub struct HttpServer {
    gateway: Arc<WaypointGateway>,
}

impl HttpServer {
    /// Create new HTTP server
    pub fn new(gateway: Arc<WaypointGateway>) -> Self {
        Self { gateway }
    }

    /// Create router with all endpoints
    pub fn create_router(&self) -> AxumRouter {
        let config = self.gateway.config();
        let api = config.gateway.api_prefix.trim_end_matches('/').to_string();

        let app = AxumRouter::new()
            // Health and monitoring endpoints
            .route("/health", get(Self::health_check))
            .route("/health/live", get(Self::health_live))
            .route("/health/ready", get(Self::health_ready))
            .route("/health/services", get(Self::health_services))
            .route("/health/services/{id}", get(Self::health_instance))
            .route("/health/check/{name}", get(Self::check_service))
            .route("/info", get(Self::gateway_info))
            // Service registry endpoints
            .route(
                &format!("{api}/services"),
                get(Self::list_services).post(Self::register_instance),
            )
            .route(&format!("{api}/services/{{name}}"), get(Self::get_service))
            .route(
                &format!("{api}/services/instances/{{id}}"),
                delete(Self::deregister_instance),
            )
            .route(
                &format!("{api}/services/instances/{{id}}/metadata"),
                put(Self::update_metadata),
            )
            // Dynamic configuration endpoints
            .route(
                &format!("{api}/config/{{*key}}"),
                get(Self::get_config)
                    .put(Self::put_config)
                    .delete(Self::delete_config),
            )
            // Proxy all other requests
            .fallback(Self::proxy_request)
            .with_state(Arc::new(self.clone()));

        // Auth runs inside the pipeline so rejections are logged with their request id
        let app = app
            .layer(middleware::from_fn_with_state(
                self.gateway.auth_gate().cloned(),
                auth_layer,
            ))
            .layer(middleware::from_fn_with_state(
                Arc::new(PipelineSettings::from(config)),
                request_pipeline,
            ));

        if config.gateway.enable_cors {
            app.layer(cors_layer(&config.gateway.cors_origins))
        } else {
            app
        }
    }

    /// Health check endpoint
    async fn health_check(State(server): State<Arc<Self>>) -> impl IntoResponse {
        let gateway = &server.gateway;
        let store = gateway.ping_store().await;
        let running = gateway.state().is_running().await;

        let healthy = store.is_ok() && running;
        if let Err(e) = &store {
            warn!("Health check: {}", e);
        }
        let status_code = if healthy {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };

        let response = json!({
            "status": if healthy { "healthy" } else { "unhealthy" },
            "service": gateway.config().gateway.service_name,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": crate::GATEWAY_VERSION,
        });
        (status_code, Json(response))
    }

    /// Liveness probe endpoint
    async fn health_live() -> impl IntoResponse {
        let response = json!({
            "status": "alive",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        (StatusCode::OK, Json(response))
    }

    /// Readiness probe endpoint
    async fn health_ready(State(server): State<Arc<Self>>) -> impl IntoResponse {
        let gateway = &server.gateway;
        let status = gateway.state().status().await;
        let is_ready = status == GatewayStatus::Running && gateway.ping_store().await.is_ok();

        let status_code = if is_ready {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };

        let response = json!({
            "status": if is_ready { "ready" } else { "not_ready" },
            "gateway_status": status,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        (status_code, Json(response))
    }

    /// Every instance with its health, plus counts by status
    async fn health_services(State(server): State<Arc<Self>>) -> impl IntoResponse {
        let instances = server.gateway.registry().list(None).await;
        let counts = StatusCounts::tally(&instances);
        let instances: Vec<_> = instances
            .iter()
            .map(|view| {
                json!({
                    "instance_id": view.instance_id,
                    "service_name": view.service_name,
                    "address": view.endpoint.authority(),
                    "status": view.status(),
                    "checked_at": view.health.checked_at,
                })
            })
            .collect();

        Json(json!({
            "instances": instances,
            "counts": counts,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
    }

    /// Health record of a single instance
    async fn health_instance(
        State(server): State<Arc<Self>>,
        Extension(scope): Extension<RequestScope>,
        Path(id): Path<String>,
    ) -> ApiResult<Json<serde_json::Value>> {
        let view = server
            .gateway
            .registry()
            .get(&id)
            .await
            .map_err(|e| ApiError::new(e, &scope))?;

        Ok(Json(json!({
            "instance_id": view.instance_id,
            "service_name": view.service_name,
            "status": view.status(),
            "health": view.health,
        })))
    }

    /// Probe every instance of a service now
    async fn check_service(
        State(server): State<Arc<Self>>,
        Extension(scope): Extension<RequestScope>,
        Path(name): Path<String>,
    ) -> ApiResult<Json<serde_json::Value>> {
        let gateway = &server.gateway;
        if gateway.registry().list(Some(&name)).await.is_empty() {
            return Err(ApiError::new(
                GatewayError::NotFound(format!("service {name}")),
                &scope,
            ));
        }

        let results = gateway.health_checker().check_service(&name).await;
        let counts = StatusCounts::tally(&gateway.registry().list(Some(&name)).await);
        let results: BTreeMap<String, HealthRecord> = results.into_iter().collect();
        debug!(request_id = %scope.request_id, "On-demand check of {}: {:?}", name, counts);

        Ok(Json(json!({
            "service": name,
            "results": results,
            "counts": counts,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })))
    }

    /// Gateway information endpoint
    async fn gateway_info(State(server): State<Arc<Self>>) -> impl IntoResponse {
        Json(server.gateway.state().info().await)
    }

    /// All registered instances
    async fn list_services(State(server): State<Arc<Self>>) -> impl IntoResponse {
        let instances = server.gateway.registry().list(None).await;
        let services = server.gateway.registry().service_names().await;

        Json(json!({
            "instances": instances,
            "total_instances": instances.len(),
            "services": services,
        }))
    }

    /// Instances of one service; 404 when there are none
    async fn get_service(
        State(server): State<Arc<Self>>,
        Extension(scope): Extension<RequestScope>,
        Path(name): Path<String>,
    ) -> ApiResult<Json<serde_json::Value>> {
        let instances = server.gateway.registry().list(Some(&name)).await;
        if instances.is_empty() {
            return Err(ApiError::new(
                GatewayError::NotFound(format!("service {name}")),
                &scope,
            ));
        }

        let counts = StatusCounts::tally(&instances);
        Ok(Json(json!({
            "service": name,
            "instances": instances,
            "counts": counts,
        })))
    }

    /// Register an instance
    async fn register_instance(
        State(server): State<Arc<Self>>,
        Extension(scope): Extension<RequestScope>,
        body: Result<Json<RegisterRequest>, axum::extract::rejection::JsonRejection>,
    ) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
        let Json(request) = body.map_err(|e| {
            ApiError::new(GatewayError::BadRequest(e.body_text()), &scope)
        })?;
        let instance = request
            .into_instance()
            .map_err(|e| ApiError::new(e, &scope))?;

        let view = server
            .gateway
            .registry()
            .register(instance)
            .await
            .map_err(|e| ApiError::new(e, &scope))?;

        info!(
            request_id = %scope.request_id,
            "Instance {} of {} registered over HTTP",
            view.instance_id,
            view.service_name
        );
        Ok((StatusCode::CREATED, Json(json!({ "instance": view }))))
    }

    /// Deregister an instance. Unknown ids succeed.
    async fn deregister_instance(
        State(server): State<Arc<Self>>,
        Extension(scope): Extension<RequestScope>,
        Path(id): Path<String>,
    ) -> ApiResult<StatusCode> {
        server
            .gateway
            .registry()
            .deregister(&id)
            .await
            .map_err(|e| ApiError::new(e, &scope))?;
        Ok(StatusCode::NO_CONTENT)
    }

    /// Replace an instance's metadata
    async fn update_metadata(
        State(server): State<Arc<Self>>,
        Extension(scope): Extension<RequestScope>,
        Path(id): Path<String>,
        body: Result<Json<BTreeMap<String, String>>, axum::extract::rejection::JsonRejection>,
    ) -> ApiResult<Json<serde_json::Value>> {
        let Json(metadata) = body.map_err(|e| {
            ApiError::new(GatewayError::BadRequest(e.body_text()), &scope)
        })?;
        let view = server
            .gateway
            .registry()
            .update_metadata(&id, metadata)
            .await
            .map_err(|e| ApiError::new(e, &scope))?;
        Ok(Json(json!({ "instance": view })))
    }

    async fn get_config(
        State(server): State<Arc<Self>>,
        Extension(scope): Extension<RequestScope>,
        Path(key): Path<String>,
    ) -> ApiResult<Json<serde_json::Value>> {
        let value = server
            .gateway
            .config_value(&key)
            .await
            .map_err(|e| ApiError::new(e, &scope))?;
        Ok(Json(json!({ "key": key, "value": value })))
    }

    async fn put_config(
        State(server): State<Arc<Self>>,
        Extension(scope): Extension<RequestScope>,
        Path(key): Path<String>,
        body: Result<Json<ConfigValue>, axum::extract::rejection::JsonRejection>,
    ) -> ApiResult<Json<serde_json::Value>> {
        let Json(body) = body.map_err(|e| {
            ApiError::new(GatewayError::BadRequest(e.body_text()), &scope)
        })?;
        server
            .gateway
            .set_config_value(&key, &body.value)
            .await
            .map_err(|e| ApiError::new(e, &scope))?;
        Ok(Json(json!({ "key": key, "value": body.value })))
    }

    async fn delete_config(
        State(server): State<Arc<Self>>,
        Extension(scope): Extension<RequestScope>,
        Path(key): Path<String>,
    ) -> ApiResult<StatusCode> {
        server
            .gateway
            .delete_config_value(&key)
            .await
            .map_err(|e| ApiError::new(e, &scope))?;
        Ok(StatusCode::NO_CONTENT)
    }

    /// Proxy request to backend service
    async fn proxy_request(
        State(server): State<Arc<Self>>,
        Extension(scope): Extension<RequestScope>,
        request: Request<Body>,
    ) -> Response {
        debug!(
            request_id = %scope.request_id,
            "Proxying request: {} {}",
            request.method(),
            request.uri()
        );
        match server.gateway.dispatcher().dispatch(request, &scope).await {
            Ok(response) => response,
            Err(e) => ApiError::new(e, &scope).into_response(),
        }
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::PATCH,
            Method::HEAD,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", o);
                None
            }
        })
        .collect();
    layer.allow_origin(origins)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;
    use crate::config::GatewayConfig;
    use crate::discovery::MemoryStore;
    use axum::http::header;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn app() -> (Arc<WaypointGateway>, AxumRouter) {
        let mut config = GatewayConfig::default();
        config.health.enabled = false;
        let gateway = Arc::new(
            WaypointGateway::with_store(config, Arc::new(MemoryStore::new()), system_clock())
                .unwrap(),
        );
        gateway.start().await.unwrap();
        let router = gateway.router();
        (gateway, router)
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn request(method: Method, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder().method(method).uri(uri);
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let (_gateway, app) = app().await;

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/health", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "api-gateway");
        assert_eq!(body["version"], crate::GATEWAY_VERSION);

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/health/ready", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(request(Method::GET, "/health/live", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_reports_store_outage() {
        let store = Arc::new(MemoryStore::new());
        let mut config = GatewayConfig::default();
        config.health.enabled = false;
        let gateway = Arc::new(
            WaypointGateway::with_store(config, store.clone(), system_clock()).unwrap(),
        );
        gateway.start().await.unwrap();
        store.set_online(false);

        let response = gateway
            .router()
            .oneshot(request(Method::GET, "/health", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["status"], "unhealthy");
    }

    #[tokio::test]
    async fn test_register_list_and_deregister() {
        let (_gateway, app) = app().await;

        let response = app
            .clone()
            .oneshot(request(
                Method::POST,
                "/api/v1/services",
                Some(json!({
                    "service_name": "users",
                    "address": "127.0.0.1:9001",
                    "tags": ["v1"],
                    "metadata": {"zone": "a"},
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_body(response).await;
        assert_eq!(body["instance"]["instance_id"], "users-127.0.0.1-9001");

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/api/v1/services/users", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["instances"].as_array().unwrap().len(), 1);
        assert_eq!(body["counts"]["unknown"], 1);

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/api/v1/services", None))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["total_instances"], 1);

        let response = app
            .clone()
            .oneshot(request(
                Method::DELETE,
                "/api/v1/services/instances/users-127.0.0.1-9001",
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(request(Method::GET, "/api/v1/services/users", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json_body(response).await;
        assert_eq!(body["error"], "not_found");
        assert_eq!(body["code"], 404);
        assert!(body["request_id"].is_string());
    }

    #[tokio::test]
    async fn test_register_rejects_bad_input() {
        let (_gateway, app) = app().await;

        let response = app
            .clone()
            .oneshot(request(
                Method::POST,
                "/api/v1/services",
                Some(json!({"service_name": "bad name", "address": "127.0.0.1:9001"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "invalid_input");

        let response = app
            .oneshot(request(
                Method::POST,
                "/api/v1/services",
                Some(json!({"address": "127.0.0.1:9001"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "bad_request");
    }

    #[tokio::test]
    async fn test_update_metadata() {
        let (gateway, app) = app().await;
        gateway
            .registry()
            .register(ServiceInstance::new("m-1", "meta", Endpoint::new("127.0.0.1", 9100)))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(request(
                Method::PUT,
                "/api/v1/services/instances/m-1/metadata",
                Some(json!({"version": "2"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["instance"]["metadata"]["version"], "2");

        let response = app
            .oneshot(request(
                Method::PUT,
                "/api/v1/services/instances/missing/metadata",
                Some(json!({})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_config_api() {
        let (_gateway, app) = app().await;

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/api/v1/config/routes/users", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .clone()
            .oneshot(request(
                Method::PUT,
                "/api/v1/config/routes/users",
                Some(json!({"value": "enabled"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/api/v1/config/routes/users", None))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["key"], "routes/users");
        assert_eq!(body["value"], "enabled");

        let response = app
            .oneshot(request(Method::DELETE, "/api/v1/config/routes/users", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_info_and_instance_health() {
        let (gateway, app) = app().await;
        gateway
            .registry()
            .register(ServiceInstance::new("h-1", "hx", Endpoint::new("127.0.0.1", 9200)))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/info", None))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["status"], "running");
        assert_eq!(body["api_prefix"], "/api/v1");

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/health/services/h-1", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "unknown");

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/health/services", None))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["counts"]["total"], 1);

        let response = app
            .oneshot(request(Method::GET, "/health/check/absent", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_service_is_unavailable() {
        let (_gateway, app) = app().await;
        let response = app
            .oneshot(request(Method::GET, "/api/v1/orders/list", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(response).await;
        assert_eq!(body["error"], "service_unavailable");
        assert_eq!(body["code"], 503);
    }
}
