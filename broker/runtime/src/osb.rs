//! The Open Service Broker HTTP API.

use crate::{
    core::{self, BindRequest, Broker, CatalogService, Params, ProvisionRequest},
    metrics::OsbMetrics,
    settings::Settings,
};
use bytes::Bytes;
use futures::future;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde::{Deserialize, Serialize};
use std::{
    future::Future,
    net::SocketAddr,
    sync::Arc,
    task::{Context, Poll},
};
use thiserror::Error;
use tracing::{debug, info, info_span, trace, warn, Instrument};


type Body = http_body_util::Full<Bytes>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Serves the OSB verbs against a [`Broker`].
#[derive(Clone)]
pub struct Osb {
    broker: Broker,
    settings: Arc<Settings>,
    metrics: OsbMetrics,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[source] BoxError),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Route {
    Catalog,
    Instance(String),
    InstanceOperation(String),
    Binding(String, String),
    BindingOperation(String, String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Action {
    Catalog,
    Provision(String),
    Update(String),
    Deprovision(String),
    LastOperation(String),
    Bind(String, String),
    GetBinding(String, String),
    Unbind(String, String),
    LastBindingOperation(String, String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Query {
    accepts_incomplete: bool,
    operation: Option<String>,
}

/// Why a request did not produce a success response.
enum Failure {
    Broker(core::Error),
    Encode(serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct ProvisionBody {
    service_id: String,
    plan_id: String,
    #[serde(default)]
    context: Option<RequestContext>,
    #[serde(default)]
    parameters: Option<Params>,
}

#[derive(Debug, Deserialize)]
struct RequestContext {
    #[serde(default)]
    namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BindBody {
    service_id: String,
    #[serde(default)]
    parameters: Option<Params>,
}

#[derive(Debug, Serialize)]
struct CatalogResponse<'a> {
    services: &'a [CatalogService],
}

#[derive(Debug, Serialize)]
struct OperationResponse {
    operation: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse<'a> {
    error: &'a str,
    description: String,
}

#[derive(Debug, Serialize)]
struct Empty {}

// === impl Osb ===

impl Osb {
    pub fn new(broker: Broker, settings: Settings, metrics: OsbMetrics) -> Self {
        Self {
            broker,
            settings: Arc::new(settings),
            metrics,
        }
    }

    async fn handle(self, action: Action, query: Query, body: Bytes) -> Result<Response<Body>, Error> {
        let name = action.name();
        self.metrics.action(name);
        match self.dispatch(action, query, body).await {
            Ok((status, body)) => {
                debug!(%status, "Handled");
                Ok(json_response(status, body))
            }
            Err(Failure::Encode(error)) => Err(error.into()),
            Err(Failure::Broker(error)) => {
                let status = error.status();
                if status.is_server_error() {
                    warn!(%status, %error, "Request failed");
                } else {
                    debug!(%status, %error, "Request rejected");
                }
                self.metrics.error(name, status);
                error_response(status, error.code(), error.description())
            }
        }
    }

    async fn dispatch(
        &self,
        action: Action,
        query: Query,
        body: Bytes,
    ) -> Result<(StatusCode, Vec<u8>), Failure> {
        match action {
            Action::Catalog => {
                let services = self.broker.catalog().await?;
                encode(
                    StatusCode::OK,
                    &CatalogResponse {
                        services: &services,
                    },
                )
            }

            Action::Provision(instance_id) => {
                let body = decode::<ProvisionBody>(&body)?;
                let params = self
                    .settings
                    .provision_params(&body.service_id, body.parameters.unwrap_or_default());
                let namespace = body
                    .context
                    .and_then(|ctx| ctx.namespace)
                    .filter(|ns| !ns.is_empty());
                let token = self
                    .broker
                    .provision(ProvisionRequest {
                        instance_id,
                        service_id: body.service_id,
                        plan_id: body.plan_id,
                        namespace,
                        accepts_incomplete: query.accepts_incomplete,
                        params,
                    })
                    .await?;
                match token {
                    Some(operation) => encode(StatusCode::ACCEPTED, &OperationResponse { operation }),
                    None => encode(StatusCode::CREATED, &Empty {}),
                }
            }

            Action::Update(instance_id) => {
                self.broker.update(&instance_id).await?;
                encode(StatusCode::OK, &Empty {})
            }

            Action::Deprovision(instance_id) => {
                let token = self
                    .broker
                    .deprovision(&instance_id, query.accepts_incomplete)
                    .await?;
                match token {
                    Some(operation) => encode(StatusCode::ACCEPTED, &OperationResponse { operation }),
                    None => encode(StatusCode::OK, &Empty {}),
                }
            }

            Action::LastOperation(instance_id) => {
                let op = self
                    .broker
                    .last_operation(&instance_id, query.operation.as_deref())
                    .await?;
                encode(StatusCode::OK, &op)
            }

            Action::Bind(instance_id, binding_id) => {
                let body = decode::<BindBody>(&body)?;
                let rsp = self
                    .broker
                    .bind(BindRequest {
                        instance_id,
                        service_id: body.service_id,
                        binding_id,
                        accepts_incomplete: query.accepts_incomplete,
                        params: body.parameters.unwrap_or_default(),
                    })
                    .await?;
                match (rsp.operation, rsp.payload) {
                    (Some(operation), _) => encode(StatusCode::ACCEPTED, &OperationResponse { operation }),
                    (None, Some(payload)) => encode(StatusCode::CREATED, &payload),
                    (None, None) => encode(StatusCode::CREATED, &Empty {}),
                }
            }

            Action::GetBinding(instance_id, binding_id) => {
                let payload = self.broker.get_binding(&instance_id, &binding_id).await?;
                encode(StatusCode::OK, &payload)
            }

            Action::Unbind(instance_id, binding_id) => {
                self.broker.unbind(&instance_id, &binding_id).await?;
                encode(StatusCode::OK, &Empty {})
            }

            Action::LastBindingOperation(instance_id, binding_id) => {
                let op = self
                    .broker
                    .last_binding_operation(&instance_id, &binding_id)
                    .await?;
                encode(StatusCode::OK, &op)
            }
        }
    }
}

impl<B> tower::Service<Request<B>> for Osb
where
    B: http_body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let (parts, body) = req.into_parts();
        trace!(method = %parts.method, uri = %parts.uri);

        let action = match Route::parse(parts.uri.path()) {
            None => {
                return Box::pin(future::ready(error_response(
                    StatusCode::NOT_FOUND,
                    None,
                    format!("no such resource {}", parts.uri.path()),
                )))
            }
            Some(route) => match Action::new(&parts.method, route) {
                Some(action) => action,
                None => {
                    return Box::pin(future::ready(error_response(
                        StatusCode::METHOD_NOT_ALLOWED,
                        None,
                        format!("{} is not supported on {}", parts.method, parts.uri.path()),
                    )))
                }
            },
        };
        let query = Query::parse(parts.uri.query());

        let osb = self.clone();
        let span = info_span!("osb", action = %action.name());
        Box::pin(
            async move {
                let body = body
                    .collect()
                    .await
                    .map_err(|e| Error::Request(e.into()))?
                    .to_bytes();
                osb.handle(action, query, body).await
            }
            .instrument(span),
        )
    }
}

/// Accepts connections on `addr` until `shutdown` completes.
pub async fn serve(
    addr: SocketAddr,
    osb: Osb,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "OSB server listening");

    tokio::pin!(shutdown);
    loop {
        let (io, client) = tokio::select! {
            accept = listener.accept() => match accept {
                Ok(conn) => conn,
                Err(error) => {
                    warn!(%error, "Failed to accept connection");
                    continue;
                }
            },
            () = &mut shutdown => {
                debug!("OSB server shutting down");
                return Ok(());
            }
        };

        let svc = hyper_util::service::TowerToHyperService::new(osb.clone());
        tokio::spawn(
            async move {
                if let Err(error) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(io), svc)
                    .await
                {
                    debug!(%error, "Connection closed");
                }
            }
            .instrument(info_span!("conn", %client)),
        );
    }
}

fn decode<'de, T: Deserialize<'de>>(body: &'de [u8]) -> Result<T, core::Error> {
    serde_json::from_slice(body)
        .map_err(|error| core::Error::Validation(format!("malformed request body: {error}")))
}

fn encode<T: Serialize>(status: StatusCode, value: &T) -> Result<(StatusCode, Vec<u8>), Failure> {
    let body = serde_json::to_vec(value)?;
    Ok((status, body))
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response<Body> {
    let mut rsp = Response::new(Body::from(body));
    *rsp.status_mut() = status;
    rsp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    rsp
}

fn error_response(
    status: StatusCode,
    code: Option<&str>,
    description: String,
) -> Result<Response<Body>, Error> {
    let error = code.or(status.canonical_reason()).unwrap_or("Error");
    let body = serde_json::to_vec(&ErrorResponse { error, description })?;
    Ok(json_response(status, body))
}

// === impl Route ===

impl Route {
    fn parse(path: &str) -> Option<Self> {
        let segments = path.trim_matches('/').split('/').collect::<Vec<_>>();
        let route = match segments.as_slice() {
            ["v2", "catalog"] => Self::Catalog,
            ["v2", "service_instances", id] => Self::Instance(id.to_string()),
            ["v2", "service_instances", id, "last_operation"] => {
                Self::InstanceOperation(id.to_string())
            }
            ["v2", "service_instances", id, "service_bindings", binding] => {
                Self::Binding(id.to_string(), binding.to_string())
            }
            ["v2", "service_instances", id, "service_bindings", binding, "last_operation"] => {
                Self::BindingOperation(id.to_string(), binding.to_string())
            }
            _ => return None,
        };
        if route.ids().any(str::is_empty) {
            return None;
        }
        Some(route)
    }

    fn ids(&self) -> impl Iterator<Item = &str> {
        let (id, binding) = match self {
            Self::Catalog => (None, None),
            Self::Instance(id) | Self::InstanceOperation(id) => (Some(id), None),
            Self::Binding(id, binding) | Self::BindingOperation(id, binding) => {
                (Some(id), Some(binding))
            }
        };
        id.into_iter().chain(binding).map(String::as_str)
    }
}

// === impl Action ===

impl Action {
    fn new(method: &Method, route: Route) -> Option<Self> {
        let action = match (method, route) {
            (&Method::GET, Route::Catalog) => Self::Catalog,
            (&Method::PUT, Route::Instance(id)) => Self::Provision(id),
            (&Method::PATCH, Route::Instance(id)) => Self::Update(id),
            (&Method::DELETE, Route::Instance(id)) => Self::Deprovision(id),
            (&Method::GET, Route::InstanceOperation(id)) => Self::LastOperation(id),
            (&Method::PUT, Route::Binding(id, binding)) => Self::Bind(id, binding),
            (&Method::GET, Route::Binding(id, binding)) => Self::GetBinding(id, binding),
            (&Method::DELETE, Route::Binding(id, binding)) => Self::Unbind(id, binding),
            (&Method::GET, Route::BindingOperation(id, binding)) => {
                Self::LastBindingOperation(id, binding)
            }
            _ => return None,
        };
        Some(action)
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Catalog => "catalog",
            Self::Provision(_) => "provision",
            Self::Update(_) => "update",
            Self::Deprovision(_) => "deprovision",
            Self::LastOperation(_) => "last_operation",
            Self::Bind(..) => "bind",
            Self::GetBinding(..) => "get_binding",
            Self::Unbind(..) => "unbind",
            Self::LastBindingOperation(..) => "last_binding_operation",
        }
    }
}

// === impl Query ===

impl Query {
    fn parse(query: Option<&str>) -> Self {
        let mut parsed = Self::default();
        for (key, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
            match key.as_ref() {
                "accepts_incomplete" => parsed.accepts_incomplete = value == "true",
                "operation" => parsed.operation = Some(value.into_owned()),
                _ => {}
            }
        }
        parsed
    }
}

// === impl Failure ===

impl From<core::Error> for Failure {
    fn from(error: core::Error) -> Self {
        Self::Broker(error)
    }
}

impl From<serde_json::Error> for Failure {
    fn from(error: serde_json::Error) -> Self {
        Self::Encode(error)
    }
}
