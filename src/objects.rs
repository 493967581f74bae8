//! Live object mirror
//!
//! Tracks which engine objects the session holds open, keyed by handle, with
//! their stable ids and the last layout/data fetched for them. Handles die
//! with the connection; ids survive it, which is what reconnect replays.

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use crate::rpc::Handle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Document,
    Sheet,
    GenericObject,
}

#[derive(Debug, Clone)]
pub struct EngineObject {
    pub handle: Handle,
    pub id: String,
    pub kind: ObjectKind,
    pub layout: Option<Value>,
    /// Follow-up data keyed by the method that fetched it.
    pub data: HashMap<String, Value>,
}

impl EngineObject {
    pub fn new(handle: Handle, id: impl Into<String>, kind: ObjectKind) -> Self {
        Self {
            handle,
            id: id.into(),
            kind,
            layout: None,
            data: HashMap::new(),
        }
    }
}

/// Ids subscribed before a reconnect, split by how they are replayed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub sheets: Vec<String>,
    pub objects: Vec<String>,
}

impl SubscriptionSnapshot {
    pub fn is_empty(&self) -> bool {
        self.sheets.is_empty() && self.objects.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct ObjectRegistry {
    objects: DashMap<Handle, EngineObject>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, object: EngineObject) {
        debug!(handle = object.handle, id = %object.id, kind = ?object.kind, "Object opened");
        self.objects.insert(object.handle, object);
    }

    pub fn get(&self, handle: Handle) -> Option<EngineObject> {
        self.objects.get(&handle).map(|o| o.clone())
    }

    /// Current handle of the object with `id`, if it is open.
    pub fn handle_of(&self, id: &str, kind: ObjectKind) -> Option<Handle> {
        self.objects
            .iter()
            .find(|o| o.id == id && o.kind == kind)
            .map(|o| o.handle)
    }

    pub fn document(&self) -> Option<EngineObject> {
        self.objects
            .iter()
            .find(|o| o.kind == ObjectKind::Document)
            .map(|o| o.clone())
    }

    /// Drop the object and everything cached for it.
    pub fn remove(&self, handle: Handle) -> Option<EngineObject> {
        self.objects.remove(&handle).map(|(_, object)| {
            debug!(handle, id = %object.id, "Object released");
            object
        })
    }

    pub fn set_layout(&self, handle: Handle, layout: Value) -> bool {
        match self.objects.get_mut(&handle) {
            Some(mut object) => {
                object.layout = Some(layout);
                true
            }
            None => false,
        }
    }

    pub fn set_data(&self, handle: Handle, method: &str, data: Value) -> bool {
        match self.objects.get_mut(&handle) {
            Some(mut object) => {
                object.data.insert(method.to_string(), data);
                true
            }
            None => false,
        }
    }

    /// Subscribed ids by kind. The document is re-established by the redial
    /// itself and is left out.
    pub fn snapshot(&self) -> SubscriptionSnapshot {
        let mut snapshot = SubscriptionSnapshot::default();
        for object in self.objects.iter() {
            match object.kind {
                ObjectKind::Sheet => snapshot.sheets.push(object.id.clone()),
                ObjectKind::GenericObject => snapshot.objects.push(object.id.clone()),
                ObjectKind::Document => {}
            }
        }
        snapshot.sheets.sort();
        snapshot.objects.sort();
        snapshot
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn clear(&self) {
        self.objects.clear();
    }
}

/// Follow-up request the engine should answer for an object.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRequest {
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DefinitionOutcome {
    Requests(Vec<DataRequest>),
    /// The object type is not known.
    NoDefinition,
    /// The object type is known but carries no data.
    NoDataCarrier,
}

/// Decides which data requests a freshly laid out object needs.
pub trait ObjectDefinitions: Send + Sync {
    fn data_requests(&self, object: &EngineObject) -> DefinitionOutcome;
}

/// Knows no object types; objects are kept in sync by layout only.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDefinitions;

impl ObjectDefinitions for NoDefinitions {
    fn data_requests(&self, _object: &EngineObject) -> DefinitionOutcome {
        DefinitionOutcome::NoDefinition
    }
}
