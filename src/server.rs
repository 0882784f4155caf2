//! HTTP front for the provisioning service.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Form, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::provisioning::{CompletionSignal, ProvisioningError};
use crate::service::{ProvisioningService, ProvisioningStatus};

pub const SIGNAL_ACCEPTED: &str = "Signal sent to workflow successfully";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitForm {
    #[serde(default)]
    pub vcluster_name: String,
    #[serde(default)]
    pub cpu: String,
    #[serde(default)]
    pub memory: String,
    #[serde(default)]
    pub storage: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub execution_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalRequest {
    pub workflow_id: String,
    pub signal_name: String,
    #[serde(default)]
    pub signal_input: String,
}

impl From<SignalRequest> for CompletionSignal {
    fn from(req: SignalRequest) -> Self {
        CompletionSignal {
            target_execution_id: req.workflow_id,
            signal_name: req.signal_name,
            payload: req.signal_input,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
}

impl IntoResponse for ProvisioningError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ProvisioningError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            ProvisioningError::DuplicateExecution(_) => (StatusCode::CONFLICT, "duplicate_execution"),
            ProvisioningError::NoActiveExecution(_) => (StatusCode::NOT_FOUND, "no_active_execution"),
            ProvisioningError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ProvisioningError::StepFailed { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "step_failed"),
            ProvisioningError::Timeout { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "timeout"),
            ProvisioningError::Runtime(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        let message = self.to_string();
        if status.is_server_error() {
            error!(status = %status, code, error = %message, "request failed");
        } else {
            warn!(status = %status, code, error = %message, "request rejected");
        }
        (status, Json(ErrorResponse { code, message })).into_response()
    }
}

pub fn router(service: Arc<ProvisioningService>) -> Router {
    Router::new()
        .route("/submit", post(submit))
        .route("/trigger-signal", post(trigger_signal))
        .route("/status/{name}", get(status))
        .with_state(service)
}

async fn submit(
    State(service): State<Arc<ProvisioningService>>,
    Form(form): Form<SubmitForm>,
) -> Result<Json<SubmitResponse>, ProvisioningError> {
    let execution_id = service
        .start_provisioning(&form.vcluster_name, &form.cpu, &form.memory, &form.storage)
        .await?;
    Ok(Json(SubmitResponse { execution_id }))
}

async fn trigger_signal(
    State(service): State<Arc<ProvisioningService>>,
    Json(req): Json<SignalRequest>,
) -> Result<&'static str, ProvisioningError> {
    service.deliver_signal(req.into()).await?;
    Ok(SIGNAL_ACCEPTED)
}

async fn status(
    State(service): State<Arc<ProvisioningService>>,
    Path(name): Path<String>,
) -> Result<Json<ProvisioningStatus>, ProvisioningError> {
    Ok(Json(service.status_for_name(&name).await?))
}

/// Serve until ctrl-c.
pub async fn serve(service: Arc<ProvisioningService>, addr: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, router(service))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutting down");
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::in_memory::InMemoryHistoryStore;
    use crate::provisioning::{
        ActionKind, ActionTrigger, InvocationError, OrchestrationPolicy, ProvisioningPhase, ProvisioningRequest,
    };
    use crate::runtime::ActivityOptions;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, header};
    use tower::ServiceExt;

    struct Accepting;

    #[async_trait]
    impl ActionTrigger for Accepting {
        async fn invoke(&self, _kind: ActionKind, _request: &ProvisioningRequest) -> Result<(), InvocationError> {
            Ok(())
        }
    }

    async fn app() -> (Router, Arc<ProvisioningService>) {
        let service = Arc::new(
            ProvisioningService::start(
                Arc::new(InMemoryHistoryStore::default()),
                Arc::new(Accepting),
                ActivityOptions::single_attempt(),
                OrchestrationPolicy::default(),
            )
            .await,
        );
        (router(service.clone()), service)
    }

    fn submit_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/submit")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn signal_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/trigger-signal")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn submit_returns_execution_id_then_conflicts() {
        let (app, service) = app().await;
        let response = app
            .clone()
            .oneshot(submit_request("vclusterName=demo&cpu=2&memory=4Gi&storage=10Gi"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: SubmitResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body.execution_id, "vcluster-workflow-demo");

        let again = app
            .oneshot(submit_request("vclusterName=demo&cpu=2&memory=4Gi&storage=10Gi"))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::CONFLICT);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn submit_with_missing_fields_is_bad_request() {
        let (app, service) = app().await;
        let response = app.oneshot(submit_request("vclusterName=demo&cpu=2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body["code"], "invalid_request");
        assert_eq!(body["message"], "invalid request: missing required parameters: memory, storage");
        service.shutdown().await;
    }

    #[tokio::test]
    async fn signal_for_unknown_execution_is_not_found() {
        let (app, service) = app().await;
        let response = app
            .oneshot(signal_request(
                r#"{"workflowId":"vcluster-workflow-ghost","signalName":"vcluster-created","signalInput":"done"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn signal_for_running_execution_is_accepted() {
        let (app, service) = app().await;
        service.start_provisioning("demo", "2", "4Gi", "10Gi").await.unwrap();
        let response = app
            .clone()
            .oneshot(signal_request(
                r#"{"workflowId":"vcluster-workflow-demo","signalName":"vcluster-created","signalInput":"done"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, SIGNAL_ACCEPTED.as_bytes());

        // The signal may arrive before the wait subscribes; it still completes the run
        let terminal = service
            .wait_for_terminal("vcluster-workflow-demo", std::time::Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(terminal, crate::runtime::OrchestrationStatus::Completed { .. }));

        let status = app
            .oneshot(
                Request::builder()
                    .uri("/status/demo")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(status.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(&body_bytes(status).await).unwrap();
        assert_eq!(body["executionId"], "vcluster-workflow-demo");
        assert_eq!(body["attempt"], 1);
        assert_eq!(body["status"], "Completed");
        assert_eq!(body["phase"], serde_json::json!(ProvisioningPhase::Completed));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn status_of_unknown_cluster_is_not_found() {
        let (app, service) = app().await;
        let response = app
            .oneshot(Request::builder().uri("/status/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        service.shutdown().await;
    }
}
