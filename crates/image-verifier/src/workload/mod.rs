use std::collections::HashMap;
use std::fmt;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{
    Container, EphemeralContainer, Pod, PodSpec, ReplicationController,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DynamicObject};
use kube::core::{ApiResource, GroupVersionKind};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum WorkloadError {
    #[error("unknown workload kind \"{0}\"")]
    UnknownKind(String),
    #[error("error deserializing workload object: {0}")]
    Deserialize(#[from] serde_json::Error),
    #[error("no containers found in workload object")]
    NoContainers,
}

/// Which of the three container lists a slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerSection {
    Containers,
    InitContainers,
    EphemeralContainers,
}

impl fmt::Display for ContainerSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerSection::Containers => "containers",
            ContainerSection::InitContainers => "initContainers",
            ContainerSection::EphemeralContainers => "ephemeralContainers",
        };
        write!(f, "{s}")
    }
}

/// Position of a container image inside a workload object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerSlot {
    pub index: usize,
    pub section: ContainerSection,
}

/// The container-bearing parts of any supported workload kind, decoded
/// into one shape.
#[derive(Debug, Clone, Default)]
pub struct WorkloadObject {
    pub name: String,
    pub kind: String,
    pub namespace: String,
    pub containers: Vec<Container>,
    pub init_containers: Vec<Container>,
    pub ephemeral_containers: Vec<EphemeralContainer>,
    pub owners: Vec<OwnerReference>,
}

fn parse<T: DeserializeOwned>(raw: &[u8]) -> Result<T, WorkloadError> {
    Ok(serde_json::from_slice(raw)?)
}

type Containers = (Vec<Container>, Vec<Container>, Vec<EphemeralContainer>);

fn pod_spec_containers(spec: Option<PodSpec>) -> Containers {
    match spec {
        Some(spec) => (
            spec.containers,
            spec.init_containers.unwrap_or_default(),
            spec.ephemeral_containers.unwrap_or_default(),
        ),
        None => (Vec::new(), Vec::new(), Vec::new()),
    }
}

impl WorkloadObject {
    pub fn from_bytes(raw: &[u8], kind: &str, namespace: &str) -> Result<Self, WorkloadError> {
        let (name, containers, owners) = match kind {
            "Pod" => {
                let pod: Pod = parse(raw)?;
                let name = pod
                    .metadata
                    .name
                    .or(pod.metadata.generate_name)
                    .unwrap_or_default();
                (
                    name,
                    pod_spec_containers(pod.spec),
                    pod.metadata.owner_references.unwrap_or_default(),
                )
            }
            "Deployment" => {
                let deployment: Deployment = parse(raw)?;
                (
                    deployment.metadata.name.unwrap_or_default(),
                    pod_spec_containers(deployment.spec.and_then(|s| s.template.spec)),
                    deployment.metadata.owner_references.unwrap_or_default(),
                )
            }
            "ReplicaSet" => {
                let replica_set: ReplicaSet = parse(raw)?;
                (
                    replica_set.metadata.name.unwrap_or_default(),
                    pod_spec_containers(
                        replica_set
                            .spec
                            .and_then(|s| s.template)
                            .and_then(|t| t.spec),
                    ),
                    replica_set.metadata.owner_references.unwrap_or_default(),
                )
            }
            "ReplicationController" => {
                let rc: ReplicationController = parse(raw)?;
                (
                    rc.metadata.name.unwrap_or_default(),
                    pod_spec_containers(rc.spec.and_then(|s| s.template).and_then(|t| t.spec)),
                    rc.metadata.owner_references.unwrap_or_default(),
                )
            }
            "DaemonSet" => {
                let daemon_set: DaemonSet = parse(raw)?;
                (
                    daemon_set.metadata.name.unwrap_or_default(),
                    pod_spec_containers(daemon_set.spec.and_then(|s| s.template.spec)),
                    daemon_set.metadata.owner_references.unwrap_or_default(),
                )
            }
            "StatefulSet" => {
                let stateful_set: StatefulSet = parse(raw)?;
                (
                    stateful_set.metadata.name.unwrap_or_default(),
                    pod_spec_containers(stateful_set.spec.and_then(|s| s.template.spec)),
                    stateful_set.metadata.owner_references.unwrap_or_default(),
                )
            }
            "Job" => {
                let job: Job = parse(raw)?;
                (
                    job.metadata.name.unwrap_or_default(),
                    pod_spec_containers(job.spec.and_then(|s| s.template.spec)),
                    job.metadata.owner_references.unwrap_or_default(),
                )
            }
            "CronJob" => {
                let cron_job: CronJob = parse(raw)?;
                (
                    cron_job.metadata.name.unwrap_or_default(),
                    pod_spec_containers(
                        cron_job
                            .spec
                            .map(|s| s.job_template)
                            .and_then(|jt| jt.spec)
                            .and_then(|js| js.template.spec),
                    ),
                    cron_job.metadata.owner_references.unwrap_or_default(),
                )
            }
            other => return Err(WorkloadError::UnknownKind(other.to_string())),
        };

        let (containers, init_containers, ephemeral_containers) = containers;
        if containers.is_empty() && init_containers.is_empty() && ephemeral_containers.is_empty() {
            return Err(WorkloadError::NoContainers);
        }

        Ok(WorkloadObject {
            name,
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            containers,
            init_containers,
            ephemeral_containers,
            owners,
        })
    }

    /// Maps every image string to the slots that carry it, across all
    /// three container lists.
    pub fn consolidated_containers(&self) -> HashMap<String, Vec<ContainerSlot>> {
        let mut consolidated: HashMap<String, Vec<ContainerSlot>> = HashMap::new();

        let images = self
            .containers
            .iter()
            .map(|c| (c.image.clone(), ContainerSection::Containers))
            .chain(
                self.init_containers
                    .iter()
                    .map(|c| (c.image.clone(), ContainerSection::InitContainers)),
            );

        let mut indices: HashMap<ContainerSection, usize> = HashMap::new();
        for (image, section) in images.chain(
            self.ephemeral_containers
                .iter()
                .map(|c| (c.image.clone(), ContainerSection::EphemeralContainers)),
        ) {
            let index = indices.entry(section).or_insert(0);
            consolidated
                .entry(image.unwrap_or_default())
                .or_default()
                .push(ContainerSlot {
                    index: *index,
                    section,
                });
            *index += 1;
        }

        consolidated
    }

    /// Unique set of images across all container lists.
    pub fn image_set(&self) -> Vec<String> {
        let mut images: Vec<String> = self
            .consolidated_containers()
            .into_keys()
            .collect();
        images.sort();
        images
    }

    /// JSON-patch path of a container slot, depending on where the pod
    /// template sits within the workload kind.
    pub fn container_path(&self, slot: &ContainerSlot) -> String {
        match self.kind.as_str() {
            "Pod" => format!("/spec/{}/{}/image", slot.section, slot.index),
            "CronJob" => format!(
                "/spec/jobTemplate/spec/template/spec/{}/{}/image",
                slot.section, slot.index
            ),
            _ => format!("/spec/template/spec/{}/{}/image", slot.section, slot.index),
        }
    }

    /// Collects the container images of all owner objects from the
    /// cluster API. Per-owner failures are logged and skipped; an owner
    /// whose UID does not match the reference is discarded.
    pub async fn parent_images(&self, client: &kube::Client) -> Vec<String> {
        let mut images = Vec::new();

        for owner in &self.owners {
            let (group, version) = match owner.api_version.split_once('/') {
                Some((group, version)) => (group, version),
                None => ("", owner.api_version.as_str()),
            };

            let gvk = GroupVersionKind::gvk(group, version, &owner.kind);
            let resource = ApiResource::from_gvk(&gvk);
            let api: Api<DynamicObject> =
                Api::namespaced_with(client.clone(), &self.namespace, &resource);

            let parent = match api.get(&owner.name).await {
                Ok(parent) => parent,
                Err(e) => {
                    info!(owner = owner.name.as_str(), error = %e, "error getting kube resource");
                    continue;
                }
            };

            if parent.metadata.uid.as_deref() != Some(owner.uid.as_str()) {
                warn!(owner = owner.name.as_str(), "non matching UIDs");
                continue;
            }

            let raw = match serde_json::to_vec(&parent) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(owner = owner.name.as_str(), error = %e, "cannot serialize parent");
                    continue;
                }
            };

            let parent_workload =
                match WorkloadObject::from_bytes(&raw, &owner.kind, &self.namespace) {
                    Ok(parent_workload) => parent_workload,
                    Err(e) => {
                        warn!(owner = owner.name.as_str(), error = %e, "error creating parent workload object");
                        continue;
                    }
                };

            images.extend(parent_workload.image_set());
        }

        debug!(images = ?images, "parent container images");
        images
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn pod_json(images: &[&str]) -> Vec<u8> {
        let containers: Vec<_> = images
            .iter()
            .enumerate()
            .map(|(i, image)| json!({"name": format!("c{i}"), "image": image}))
            .collect();
        serde_json::to_vec(&json!({
            "metadata": {"name": "mypod"},
            "spec": {"containers": containers}
        }))
        .unwrap()
    }

    #[test]
    fn decodes_pod() {
        let workload =
            WorkloadObject::from_bytes(&pod_json(&["nginx", "redis"]), "Pod", "default").unwrap();
        assert_eq!(workload.name, "mypod");
        assert_eq!(workload.kind, "Pod");
        assert_eq!(workload.containers.len(), 2);
    }

    #[test]
    fn pod_name_falls_back_to_generate_name() {
        let raw = serde_json::to_vec(&json!({
            "metadata": {"generateName": "mypod-"},
            "spec": {"containers": [{"name": "c", "image": "nginx"}]}
        }))
        .unwrap();
        let workload = WorkloadObject::from_bytes(&raw, "Pod", "default").unwrap();
        assert_eq!(workload.name, "mypod-");
    }

    #[test]
    fn decodes_deployment() {
        let raw = serde_json::to_vec(&json!({
            "metadata": {"name": "mydeployment"},
            "spec": {
                "selector": {},
                "template": {
                    "spec": {
                        "containers": [{"name": "c", "image": "nginx"}],
                        "initContainers": [{"name": "init", "image": "busybox"}]
                    }
                }
            }
        }))
        .unwrap();
        let workload = WorkloadObject::from_bytes(&raw, "Deployment", "default").unwrap();
        assert_eq!(workload.containers.len(), 1);
        assert_eq!(workload.init_containers.len(), 1);
    }

    #[test]
    fn decodes_cron_job() {
        let raw = serde_json::to_vec(&json!({
            "metadata": {"name": "mycronjob"},
            "spec": {
                "schedule": "* * * * *",
                "jobTemplate": {
                    "spec": {
                        "template": {
                            "spec": {"containers": [{"name": "c", "image": "nginx"}]}
                        }
                    }
                }
            }
        }))
        .unwrap();
        let workload = WorkloadObject::from_bytes(&raw, "CronJob", "default").unwrap();
        assert_eq!(workload.containers.len(), 1);
    }

    #[test]
    fn rejects_unknown_kind() {
        let err = WorkloadObject::from_bytes(&pod_json(&["nginx"]), "Service", "default")
            .unwrap_err();
        assert!(matches!(err, WorkloadError::UnknownKind(kind) if kind == "Service"));
    }

    #[test]
    fn rejects_workload_without_containers() {
        let raw = serde_json::to_vec(&json!({
            "metadata": {"name": "empty"},
            "spec": {"containers": []}
        }))
        .unwrap();
        let err = WorkloadObject::from_bytes(&raw, "Pod", "default").unwrap_err();
        assert!(matches!(err, WorkloadError::NoContainers));
    }

    #[test]
    fn consolidates_duplicate_images() {
        let workload =
            WorkloadObject::from_bytes(&pod_json(&["nginx", "nginx", "redis"]), "Pod", "default")
                .unwrap();
        let consolidated = workload.consolidated_containers();
        assert_eq!(consolidated.len(), 2);
        let slots = &consolidated["nginx"];
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].index, 0);
        assert_eq!(slots[1].index, 1);
    }

    #[test]
    fn image_set_is_unique() {
        let workload =
            WorkloadObject::from_bytes(&pod_json(&["nginx", "nginx", "redis"]), "Pod", "default")
                .unwrap();
        assert_eq!(workload.image_set(), vec!["nginx", "redis"]);
    }

    #[test]
    fn container_paths_follow_workload_kind() {
        let slot = ContainerSlot {
            index: 1,
            section: ContainerSection::InitContainers,
        };

        let mut workload =
            WorkloadObject::from_bytes(&pod_json(&["nginx"]), "Pod", "default").unwrap();
        assert_eq!(
            workload.container_path(&slot),
            "/spec/initContainers/1/image"
        );

        workload.kind = "Deployment".to_string();
        assert_eq!(
            workload.container_path(&slot),
            "/spec/template/spec/initContainers/1/image"
        );

        workload.kind = "CronJob".to_string();
        assert_eq!(
            workload.container_path(&slot),
            "/spec/jobTemplate/spec/template/spec/initContainers/1/image"
        );
    }
}
