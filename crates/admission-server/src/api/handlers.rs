use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::{engine::general_purpose, Engine as _};
use image_verifier::alerting::{NotificationResult, NotificationValues};
use image_verifier::policy::ValidationMode;
use tokio_util::sync::CancellationToken;
use tracing::error;

use super::admission::{
    AdmissionRequest, AdmissionRequestObjects, AdmissionResponse, AdmissionResponseStatus,
    AdmissionReview,
};
use super::state::AppState;
use crate::{metrics, settings, validation};

/// Kept below the API server's 30 s request ceiling so a timeout denial
/// still reaches the caller.
const VALIDATION_TIMEOUT: Duration = Duration::from_secs(29);

const SERVICE_UNAVAILABLE: &str = "Service unavailable.";

pub(crate) async fn health_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness additionally requires the cache to answer a ping.
pub(crate) async fn ready_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.cache.ping().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            error!(error = %e, "cache ping failed");
            (StatusCode::SERVICE_UNAVAILABLE, SERVICE_UNAVAILABLE).into_response()
        }
    }
}

pub(crate) async fn metrics_handler() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
        .into_response()
}

pub(crate) async fn mutate_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    metrics::inc_admissions_received();

    // single cancellation path for every validation task and alert of
    // this request: deadline or client disconnect, whichever is first
    let token = CancellationToken::new();
    let _cancel_guard = token.clone().drop_guard();
    {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(VALIDATION_TIMEOUT).await;
            token.cancel();
        });
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if content_type != "application/json" {
        return handle_error(
            StatusCode::BAD_REQUEST,
            format!("wrong content type: expected json, got {content_type}"),
        );
    }

    let body = match body {
        Ok(body) => body,
        Err(e) => {
            return handle_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("error reading request body: {e}"),
            )
        }
    };

    let review: AdmissionReview = match serde_json::from_slice(&body) {
        Ok(review) => review,
        Err(e) => {
            return handle_error(
                StatusCode::BAD_REQUEST,
                format!("received invalid json: {e}"),
            )
        }
    };
    let request = match &review.request {
        Some(request) => request,
        None => {
            return handle_error(
                StatusCode::BAD_REQUEST,
                "received empty admission request".to_string(),
            )
        }
    };

    let (mut response, mut notification) = mutate_review(&state, &token, request).await;

    // a lost notification must not go unnoticed: it overrides the allow
    if let Err(e) = state
        .config
        .alerting
        .eval_and_send(&token, &mut notification)
        .await
    {
        error!(error = %e, "error sending notifications");
        response.allowed = false;
        response.status = Some(AdmissionResponseStatus {
            message: Some(format!("error sending notifications: {e}")),
        });
    }

    apply_admission_overrides(request, &mut response);

    if response.allowed {
        metrics::inc_admissions_admitted();
    } else {
        metrics::inc_admissions_denied(token.is_cancelled());
    }

    Json(AdmissionReview::response(&review, response)).into_response()
}

/// Pod-only resource validation and detection mode rewrite denials into
/// allows with warnings, after the notification result was computed.
fn apply_admission_overrides(request: &AdmissionRequest, response: &mut AdmissionResponse) {
    if request.kind.kind != "Pod" && !settings::block_all_resources() {
        if !response.allowed {
            response.warnings = Some(vec![
                "pod-only validation active".to_string(),
                response.message(),
            ]);
        }
        response.allowed = true;
        response.patch = None;
        response.patch_type = None;
    }

    if settings::detection_mode() && !response.allowed {
        response.warnings = Some(vec![
            "detection mode active".to_string(),
            response.message(),
        ]);
        response.allowed = true;
    }
}

/// Validates every image of the workload and assembles the response and
/// the notification values.
async fn mutate_review(
    state: &Arc<AppState>,
    token: &CancellationToken,
    request: &AdmissionRequest,
) -> (AdmissionResponse, NotificationValues) {
    let mut notification = NotificationValues {
        request_id: request.uid.clone(),
        namespace: request.namespace.clone().unwrap_or_default(),
        pod_id: settings::pod_name(),
        ..Default::default()
    };

    let objects = match AdmissionRequestObjects::new(request) {
        Ok(objects) => objects,
        Err(e) => {
            error!(error = %e, "error creating admission request objects");
            notification.result = NotificationResult::Invalid;
            return (
                AdmissionResponse::reject(request.uid.clone(), e.to_string()),
                notification,
            );
        }
    };

    let new_workload = Arc::new(objects.new_workload);
    let (mut results_rx, capacity) = validation::validate_workload_object(
        state.clone(),
        token.clone(),
        new_workload.clone(),
        &objects.old_workload,
    );

    // drain exactly `capacity` results, first come first served
    let mut results = Vec::with_capacity(capacity);
    for validated in 0..capacity {
        let output = tokio::select! {
            _ = token.cancelled() => None,
            output = results_rx.recv() => output,
        };

        let output = match output {
            Some(output) => output,
            None => {
                notification.result = NotificationResult::Timeout;
                return (
                    AdmissionResponse::reject(
                        request.uid.clone(),
                        format!(
                            "validation of admission request {} timed out after validating {}/{} images",
                            request.uid, validated, capacity
                        ),
                    ),
                    notification,
                );
            }
        };

        if let Some(error) = &output.error {
            error!(
                kind = new_workload.kind.as_str(),
                name = new_workload.name.as_str(),
                error = %error,
                "error validating workload"
            );
            notification.result = NotificationResult::Error;
            notification.error = error.to_string();
            notification.images = output.raw_image.clone();
            return (
                AdmissionResponse::reject(request.uid.clone(), error.to_string()),
                notification,
            );
        }

        results.push(output);
    }

    let (patch, images, skipped) = build_patch(&results, &new_workload);

    let mut response = AdmissionResponse {
        uid: request.uid.clone(),
        allowed: true,
        ..Default::default()
    };
    if let Some(patch) = patch {
        response.patch_type = Some("JSONPatch".to_string());
        response.patch = Some(patch);
    }

    notification.images = images.join(", ");
    notification.result = if skipped {
        NotificationResult::Skip
    } else {
        NotificationResult::Success
    };

    (response, notification)
}

/// Builds the base64-encoded JSON patch over every slot of every image
/// in mutate mode whose reference changed, plus the list of mutated
/// images and whether every validation was skipped.
fn build_patch(
    results: &[validation::ValidationOutput],
    workload: &image_verifier::workload::WorkloadObject,
) -> (Option<String>, Vec<String>, bool) {
    let mut patch_ops: Vec<serde_json::Value> = Vec::new();
    let mut images: Vec<String> = Vec::new();
    let mut skipped = true;

    for output in results {
        if output.validation_mode == ValidationMode::Mutate && output.new_image != output.old_image
        {
            for slot in &output.slots {
                patch_ops.push(serde_json::json!({
                    "op": "replace",
                    "path": workload.container_path(slot),
                    "value": output.new_image,
                }));
                images.push(output.raw_image.clone());
            }
        }
        skipped = skipped && output.skipped;
    }

    let patch = if patch_ops.is_empty() {
        None
    } else {
        let patch = serde_json::to_string(&patch_ops).unwrap_or_default();
        Some(general_purpose::STANDARD.encode(patch))
    };

    (patch, images, skipped)
}

fn handle_error(code: StatusCode, message: String) -> Response {
    error!("{message}");
    (code, message).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use image_verifier::cache::DisabledCache;
    use image_verifier::config::Config;
    use serde_json::json;
    use serial_test::serial;
    use tower::ServiceExt;

    use crate::api::admission::GroupVersionKind;
    use crate::api::router;

    const CONFIG: &str = r#"
validators:
  - name: default
    type: static
    approve: true
  - name: deny
    type: static
    approve: false
policy:
  - pattern: "*:*"
  - pattern: "*"
  - pattern: "deny.me/*"
    validator: deny
"#;

    fn app() -> axum::Router {
        let state = Arc::new(AppState {
            config: serde_yaml::from_str::<Config>(CONFIG).unwrap(),
            cache: Arc::new(DisabledCache),
            kube_client: None,
        });
        router(state)
    }

    fn pod_review(image: &str) -> serde_json::Value {
        json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "uid-1",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "namespace": "default",
                "operation": "CREATE",
                "object": {
                    "metadata": {"name": "mypod"},
                    "spec": {"containers": [{"name": "c", "image": image}]}
                }
            }
        })
    }

    async fn post_review(body: serde_json::Value) -> AdmissionReview {
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/mutate")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    #[serial]
    async fn static_allow_admits_without_patch() {
        let review = post_review(pod_review("allow-me")).await;
        let response = review.response.unwrap();
        assert_eq!(response.uid, "uid-1");
        assert!(response.allowed);
        assert!(response.patch.is_none());
        assert!(response.status.is_none());
    }

    #[tokio::test]
    #[serial]
    async fn static_deny_rejects_with_message() {
        let review = post_review(pod_review("deny.me/image:v1")).await;
        let response = review.response.unwrap();
        assert!(!response.allowed);
        assert_eq!(response.status.unwrap().message.unwrap(), "static deny");
    }

    #[tokio::test]
    #[serial]
    async fn detection_mode_downgrades_denial() {
        std::env::set_var(settings::DETECTION_MODE, "true");
        let review = post_review(pod_review("deny.me/image:v1")).await;
        std::env::remove_var(settings::DETECTION_MODE);

        let response = review.response.unwrap();
        assert!(response.allowed);
        let warnings = response.warnings.unwrap();
        assert_eq!(warnings[0], "detection mode active");
        assert_eq!(warnings[1], "static deny");
    }

    #[tokio::test]
    #[serial]
    async fn pod_only_mode_admits_other_kinds() {
        std::env::set_var(settings::RESOURCE_VALIDATION_MODE, "podsOnly");
        let review = post_review(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "uid-2",
                "kind": {"group": "batch", "version": "v1", "kind": "Job"},
                "namespace": "default",
                "operation": "CREATE",
                "object": {
                    "metadata": {"name": "myjob"},
                    "spec": {
                        "template": {
                            "spec": {"containers": [{"name": "c", "image": "deny.me/image:v1"}]}
                        }
                    }
                }
            }
        }))
        .await;
        std::env::remove_var(settings::RESOURCE_VALIDATION_MODE);

        let response = review.response.unwrap();
        assert!(response.allowed);
        assert!(response.patch.is_none());
        let warnings = response.warnings.unwrap();
        assert_eq!(warnings[0], "pod-only validation active");
        assert_eq!(warnings[1], "static deny");
    }

    #[tokio::test]
    #[serial]
    async fn invalid_workload_is_denied() {
        let review = post_review(json!({
            "request": {
                "uid": "uid-3",
                "kind": {"kind": "Pod", "version": "v1"},
                "operation": "CREATE",
                "object": {"metadata": {"name": "empty"}, "spec": {"containers": []}}
            }
        }))
        .await;
        let response = review.response.unwrap();
        assert!(!response.allowed);
        assert_eq!(
            response.status.unwrap().message.unwrap(),
            "no containers found in workload object"
        );
    }

    #[tokio::test]
    async fn wrong_content_type_is_a_bad_request() {
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/mutate")
                    .header("content-type", "text/plain")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn invalid_json_is_a_bad_request() {
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/mutate")
                    .header("content-type", "application/json")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn empty_admission_request_is_a_bad_request() {
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/mutate")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn mutate_rejects_other_methods() {
        let response = app()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/mutate")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn health_and_metrics_respond() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/ready")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn patch_rewrites_changed_references_per_slot() {
        use image_verifier::workload::{ContainerSection, ContainerSlot, WorkloadObject};

        let workload = WorkloadObject {
            kind: "Deployment".to_string(),
            ..Default::default()
        };
        let digest = "sha256:1234567890123456789012345678901234567890123456789012345678901256";
        let results = vec![
            validation::ValidationOutput {
                slots: vec![ContainerSlot {
                    index: 0,
                    section: ContainerSection::Containers,
                }],
                raw_image: "docker.io/org/img:v1".to_string(),
                old_image: "index.docker.io/org/img:v1".to_string(),
                new_image: format!("index.docker.io/org/img:v1@{digest}"),
                ..Default::default()
            },
            // unchanged reference contributes no patch op
            validation::ValidationOutput {
                slots: vec![ContainerSlot {
                    index: 1,
                    section: ContainerSection::Containers,
                }],
                raw_image: "other:v1".to_string(),
                old_image: "index.docker.io/library/other:v1".to_string(),
                new_image: "index.docker.io/library/other:v1".to_string(),
                ..Default::default()
            },
        ];

        let (patch, images, skipped) = build_patch(&results, &workload);
        assert!(!skipped);
        assert_eq!(images, vec!["docker.io/org/img:v1"]);

        let decoded = general_purpose::STANDARD.decode(patch.unwrap()).unwrap();
        let ops: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(
            ops,
            serde_json::json!([{
                "op": "replace",
                "path": "/spec/template/spec/containers/0/image",
                "value": format!("index.docker.io/org/img:v1@{digest}"),
            }])
        );
    }

    #[test]
    fn validate_only_mode_never_patches() {
        use image_verifier::workload::{ContainerSection, ContainerSlot, WorkloadObject};

        let results = vec![validation::ValidationOutput {
            slots: vec![ContainerSlot {
                index: 0,
                section: ContainerSection::Containers,
            }],
            raw_image: "img:v1".to_string(),
            old_image: "index.docker.io/library/img:v1".to_string(),
            new_image: "index.docker.io/library/img:v1@sha256:abc".to_string(),
            validation_mode: ValidationMode::InsecureValidateOnly,
            ..Default::default()
        }];

        let (patch, images, _) = build_patch(&results, &WorkloadObject::default());
        assert!(patch.is_none());
        assert!(images.is_empty());
    }

    #[test]
    fn all_skipped_results_report_skip() {
        let results = vec![validation::ValidationOutput {
            skipped: true,
            old_image: "a".to_string(),
            new_image: "a".to_string(),
            ..Default::default()
        }];
        let (_, _, skipped) = build_patch(&results, &Default::default());
        assert!(skipped);
    }

    #[tokio::test]
    #[serial]
    async fn timeout_denies_with_progress_message() {
        let state = Arc::new(AppState {
            config: serde_yaml::from_str::<Config>(CONFIG).unwrap(),
            cache: Arc::new(DisabledCache),
            kube_client: None,
        });
        let token = CancellationToken::new();
        token.cancel();

        let request = AdmissionRequest {
            uid: "uid-4".to_string(),
            kind: GroupVersionKind {
                group: String::new(),
                version: "v1".to_string(),
                kind: "Pod".to_string(),
            },
            name: None,
            namespace: Some("default".to_string()),
            operation: "CREATE".to_string(),
            object: json!({
                "metadata": {"name": "mypod"},
                "spec": {"containers": [{"name": "c", "image": "allow-me"}]}
            }),
            old_object: serde_json::Value::Null,
        };

        let (response, notification) = mutate_review(&state, &token, &request).await;
        assert!(!response.allowed);
        assert!(response
            .message()
            .contains("timed out after validating 0/1 images"));
        assert_eq!(notification.result, NotificationResult::Timeout);
    }
}
