//! Replicant core types: objects, feed events, actions and the emitter seam.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod error;
pub mod labels;

pub use error::{ActionError, LabelParseError, ReconcileError};
pub use labels::{LabelSet, Selector};

/// Store-assigned unique identifier, immutable for the object's lifetime.
pub type Uid = [u8; 16];

/// Human-facing identity of an object within the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub kind: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), kind: kind.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectClass {
    Resource,
    Controller,
}

/// A labeled object observed in the store (a pod).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub key: ObjectKey,
    pub uid: Uid,
    pub resource_version: String,
    /// Position in creation order; older resources have smaller values.
    pub creation_order: u64,
    pub labels: LabelSet,
}

/// An object declaring a selector and a desired replica count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Controller {
    pub key: ObjectKey,
    pub uid: Uid,
    pub resource_version: String,
    pub selector: Selector,
    pub desired_replicas: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventOp {
    Add,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectBody {
    Resource { labels: LabelSet },
    Controller { selector: Selector, desired_replicas: u32 },
}

impl ObjectBody {
    pub fn class(&self) -> ObjectClass {
        match self {
            ObjectBody::Resource { .. } => ObjectClass::Resource,
            ObjectBody::Controller { .. } => ObjectClass::Controller,
        }
    }
}

/// One add/update/delete notification from the store's watch feed.
/// Add and Update are both treated as upserts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub op: EventOp,
    pub key: ObjectKey,
    pub uid: Uid,
    pub resource_version: String,
    /// Creation position supplied by the store, if it has one.
    pub creation_order: Option<u64>,
    pub body: ObjectBody,
}

impl ChangeEvent {
    pub fn class(&self) -> ObjectClass { self.body.class() }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedEvent {
    Change(ChangeEvent),
    /// The watch restarted and re-delivered its full list: every known
    /// object of `class` missing from `live` is gone.
    Relisted { class: ObjectClass, live: Vec<Uid> },
}

impl From<ChangeEvent> for FeedEvent {
    fn from(ev: ChangeEvent) -> Self { FeedEvent::Change(ev) }
}

/// "Create one more resource whose labels satisfy this controller's selector."
/// Everything else about the new resource comes from the store's defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub controller: ObjectKey,
    pub controller_uid: Uid,
    pub kind: String,
    pub namespace: String,
    pub labels: LabelSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub controller: ObjectKey,
    pub controller_uid: Uid,
    pub target: ObjectKey,
    pub uid: Uid,
    pub expected_resource_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Create(CreateRequest),
    Delete(DeleteRequest),
}

impl Action {
    pub fn controller(&self) -> &ObjectKey {
        match self {
            Action::Create(c) => &c.controller,
            Action::Delete(d) => &d.controller,
        }
    }

    pub fn controller_uid(&self) -> Uid {
        match self {
            Action::Create(c) => c.controller_uid,
            Action::Delete(d) => d.controller_uid,
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Action::Create(_) => "create",
            Action::Delete(_) => "delete",
        }
    }

    /// Object the action is about: the deletion target, or the controller for creates.
    pub fn target(&self) -> String {
        match self {
            Action::Create(c) => format!("{}/{} for {}", c.kind, c.namespace, c.controller.name),
            Action::Delete(d) => d.target.to_string(),
        }
    }
}

/// Store's answer to a successful create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Created {
    pub name: String,
    pub uid: Uid,
    pub resource_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionResult {
    Created(Created),
    Deleted,
}

/// Completion report for one emitted action; re-enters the engine's event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub action: Action,
    pub result: Result<ActionResult, ActionError>,
}

/// Executes create/delete calls against the resource store.
///
/// Calls may block or be rate limited; the engine never awaits them on its
/// ingest path.
#[async_trait::async_trait]
pub trait ActionEmitter: Send + Sync + 'static {
    async fn create(&self, req: &CreateRequest) -> Result<Created, ActionError>;
    async fn delete(&self, req: &DeleteRequest) -> Result<(), ActionError>;
}

pub mod prelude {
    pub use super::{
        Action, ActionEmitter, ActionError, ActionResult, ChangeEvent, Controller, CreateRequest, Created,
        DeleteRequest, EventOp, FeedEvent, LabelSet, ObjectBody, ObjectClass, ObjectKey, Outcome,
        ReconcileError, Resource, Selector, Uid,
    };
}
