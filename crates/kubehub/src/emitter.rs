//! `ActionEmitter` backed by the Kubernetes API.

use k8s_openapi::api::core::v1::{Pod, ReplicationController};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, DeleteParams, PostParams, Preconditions},
    Client, Resource as KubeResource,
};
use replicant_core::{ActionEmitter, ActionError, CreateRequest, Created, DeleteRequest};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{to_uid, POD_KIND};

/// Creates pods from the owning replication controller's template and
/// deletes them with uid + resourceVersion preconditions.
#[derive(Clone)]
pub struct KubeEmitter {
    client: Client,
}

impl KubeEmitter {
    pub fn new(client: Client) -> Self { Self { client } }
}

/// Map an API failure onto the reconciler's error classes.
pub fn classify(err: kube::Error, target: &str, expected: Option<&str>) -> ActionError {
    match err {
        kube::Error::Api(ae) => match ae.code {
            409 => ActionError::Conflict { target: target.to_string(), expected: expected.unwrap_or_default().to_string() },
            404 => ActionError::NotFound(target.to_string()),
            400 | 403 | 422 => ActionError::Rejected(format!("{}: {}", ae.reason, ae.message)),
            _ => ActionError::StoreUnavailable(format!("{} {}: {}", ae.code, ae.reason, ae.message)),
        },
        other => ActionError::StoreUnavailable(other.to_string()),
    }
}

/// Pod built from the controller's template. Requested labels override
/// template labels; the name is generated server-side.
pub fn pod_from_template(rc: &ReplicationController, req: &CreateRequest) -> Result<Pod, ActionError> {
    let template = rc
        .spec
        .as_ref()
        .and_then(|s| s.template.as_ref())
        .ok_or_else(|| ActionError::Rejected(format!("{} has no pod template", req.controller)))?;
    let mut meta: ObjectMeta = template.metadata.clone().unwrap_or_default();
    let labels = meta.labels.get_or_insert_with(Default::default);
    for (k, v) in req.labels.iter() {
        labels.insert(k.to_string(), v.to_string());
    }
    meta.name = None;
    meta.generate_name = Some(format!("{}-", req.controller.name));
    meta.namespace = Some(req.namespace.clone());
    meta.owner_references = rc.controller_owner_ref(&()).map(|o| vec![o]);
    Ok(Pod { metadata: meta, spec: template.spec.clone(), status: None })
}

#[async_trait::async_trait]
impl ActionEmitter for KubeEmitter {
    async fn create(&self, req: &CreateRequest) -> Result<Created, ActionError> {
        if req.kind != POD_KIND {
            return Err(ActionError::Rejected(format!("cannot create {} resources", req.kind)));
        }
        let owner = req.controller.to_string();
        let rcs: Api<ReplicationController> = Api::namespaced(self.client.clone(), &req.namespace);
        let rc = rcs.get(&req.controller.name).await.map_err(|e| classify(e, &owner, None))?;
        // Same name, different object: the controller we planned for is gone.
        let rc_uid = rc.metadata.uid.as_deref().and_then(|u| to_uid(u).ok());
        if rc_uid != Some(req.controller_uid) {
            return Err(ActionError::Conflict { target: owner, expected: Uuid::from_bytes(req.controller_uid).to_string() });
        }

        let pod = pod_from_template(&rc, req)?;
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &req.namespace);
        let made = pods.create(&PostParams::default(), &pod).await.map_err(|e| classify(e, &owner, None))?;
        let name = made.metadata.name.clone().unwrap_or_default();
        let uid = made
            .metadata
            .uid
            .as_deref()
            .and_then(|u| to_uid(u).ok())
            .ok_or_else(|| ActionError::StoreUnavailable(format!("created pod {} has no uid", name)))?;
        info!(ns = %req.namespace, pod = %name, controller = %req.controller.name, "pod created");
        Ok(Created { name, uid, resource_version: made.metadata.resource_version.unwrap_or_default() })
    }

    async fn delete(&self, req: &DeleteRequest) -> Result<(), ActionError> {
        let target = req.target.to_string();
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &req.target.namespace);
        let dp = DeleteParams {
            preconditions: Some(Preconditions {
                resource_version: Some(req.expected_resource_version.clone()),
                uid: Some(Uuid::from_bytes(req.uid).to_string()),
            }),
            ..Default::default()
        };
        pods.delete(&req.target.name, &dp)
            .await
            .map_err(|e| classify(e, &target, Some(&req.expected_resource_version)))?;
        debug!(pod = %target, rv = %req.expected_resource_version, "pod deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec, ReplicationControllerSpec};
    use kube::core::ErrorResponse;
    use replicant_core::{LabelSet, ObjectKey};

    fn api_err(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: "nope".into(), reason: "Test".into(), code })
    }

    #[test]
    fn status_codes_map_to_action_errors() {
        assert_eq!(
            classify(api_err(409), "Pod/default/mock-3", Some("7")),
            ActionError::Conflict { target: "Pod/default/mock-3".into(), expected: "7".into() }
        );
        assert_eq!(classify(api_err(404), "t", None).kind(), "not_found");
        assert_eq!(classify(api_err(422), "t", None).kind(), "rejected");
        assert_eq!(classify(api_err(403), "t", None).kind(), "rejected");
        assert_eq!(classify(api_err(500), "t", None).kind(), "unavailable");
        assert_eq!(classify(api_err(429), "t", None).kind(), "unavailable");
    }

    fn request() -> CreateRequest {
        CreateRequest {
            controller: ObjectKey::new("default", "ReplicationController", "oddcontroller"),
            controller_uid: [1; 16],
            kind: POD_KIND.into(),
            namespace: "default".into(),
            labels: LabelSet::from_pairs([("type", "odd"), ("tag", "silly")]),
        }
    }

    #[test]
    fn template_labels_merge_with_requested_labels() {
        let rc = ReplicationController {
            metadata: ObjectMeta {
                name: Some("oddcontroller".into()),
                uid: Some(Uuid::from_bytes([1; 16]).to_string()),
                ..Default::default()
            },
            spec: Some(ReplicationControllerSpec {
                template: Some(PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        name: Some("ignored".into()),
                        labels: Some([("type", "even"), ("app", "web")].iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec::default()),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let pod = pod_from_template(&rc, &request()).unwrap();
        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels.get("type").map(String::as_str), Some("odd"));
        assert_eq!(labels.get("app").map(String::as_str), Some("web"));
        assert_eq!(labels.get("tag").map(String::as_str), Some("silly"));
        assert_eq!(pod.metadata.name, None);
        assert_eq!(pod.metadata.generate_name.as_deref(), Some("oddcontroller-"));
        let owners = pod.metadata.owner_references.unwrap();
        assert_eq!(owners[0].name, "oddcontroller");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn missing_template_is_rejected() {
        let rc = ReplicationController::default();
        assert_eq!(pod_from_template(&rc, &request()).unwrap_err().kind(), "rejected");
    }
}
