use image_verifier::workload::{WorkloadError, WorkloadObject};
use serde::{Deserialize, Serialize};

use crate::settings;

/// The admission.k8s.io/v1 AdmissionReview envelope, carrying a request
/// on the way in and a response on the way out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<AdmissionRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionResponse>,
}

impl AdmissionReview {
    pub fn response(request_review: &AdmissionReview, response: AdmissionResponse) -> Self {
        AdmissionReview {
            api_version: request_review
                .api_version
                .clone()
                .or_else(|| Some("admission.k8s.io/v1".to_string())),
            kind: request_review
                .kind
                .clone()
                .or_else(|| Some("AdmissionReview".to_string())),
            request: None,
            response: Some(response),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupVersionKind {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub uid: String,
    pub kind: GroupVersionKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    pub operation: String,
    #[serde(default)]
    pub object: serde_json::Value,
    #[serde(default)]
    pub old_object: serde_json::Value,
}

/// Models the admission/v1 AdmissionResponse object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<String>,
    /// Base64-encoded JSON-patch document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AdmissionResponseStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdmissionResponseStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AdmissionResponse {
    pub fn reject(uid: String, message: String) -> AdmissionResponse {
        AdmissionResponse {
            uid,
            allowed: false,
            status: Some(AdmissionResponseStatus {
                message: Some(message),
            }),
            ..Default::default()
        }
    }

    pub fn message(&self) -> String {
        self.status
            .as_ref()
            .and_then(|status| status.message.clone())
            .unwrap_or_default()
    }
}

/// The workload objects decoded out of an admission request. The old
/// object stays empty unless the request is an UPDATE and unchanged
/// approval is active.
#[derive(Debug)]
pub struct AdmissionRequestObjects {
    pub new_workload: WorkloadObject,
    pub old_workload: WorkloadObject,
}

impl AdmissionRequestObjects {
    pub fn new(request: &AdmissionRequest) -> Result<Self, WorkloadError> {
        let namespace = request.namespace.clone().unwrap_or_default();

        let mut old_workload = WorkloadObject::default();
        if settings::automatic_unchanged_approval() && request.operation == "UPDATE" {
            let raw = serde_json::to_vec(&request.old_object)?;
            old_workload = WorkloadObject::from_bytes(&raw, &request.kind.kind, &namespace)?;
        }

        let raw = serde_json::to_vec(&request.object)?;
        let new_workload = WorkloadObject::from_bytes(&raw, &request.kind.kind, &namespace)?;

        Ok(AdmissionRequestObjects {
            new_workload,
            old_workload,
        })
    }
}
