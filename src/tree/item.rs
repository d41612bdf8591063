//! Arena-based object tree.
//!
//! Nodes are identified by index; children are an ordered `Vec<NodeId>` and
//! every node knows its parent, so there are no owning cycles. A leaf carries
//! a typed value plus presentation metadata (unit, precision, min/max,
//! description); an interior node carries children and never a value.
//!
//! Change notifications go out over `flume` channels. Emission iterates a
//! snapshot of the subscriber list so a handler that mutates subscriptions
//! cannot invalidate the walk. External writes enter through `write_value`:
//! leaves with a registered sink forward the write (command leaves owned by a
//! poller), plainly writable leaves store it, everything else rejects.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct NodeId(usize);

/// Typed leaf value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Real(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Real(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Real(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        self.as_i64().and_then(|v| u16::try_from(v).ok())
    }
}

/// Emitted on every accepted value change (including invalidation).
#[derive(Debug, Clone)]
pub struct ItemChange {
    pub node: NodeId,
    pub path: String,
    pub value: Option<Value>,
}

/// An external write forwarded to the component owning the leaf.
#[derive(Debug, Clone)]
pub struct ItemWrite {
    pub node: NodeId,
    pub path: String,
    pub value: Value,
}

/// Outcome of an external write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDisposition {
    /// Handed to the owning component; the leaf updates once that component
    /// confirms the write took effect.
    Forwarded,
    /// Stored directly on the leaf.
    Stored,
    /// The leaf does not accept external writes.
    Rejected,
    UnknownItem,
}

struct Node {
    name: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    value: Option<Value>,
    default: Option<Value>,
    min: Option<Value>,
    max: Option<Value>,
    unit: String,
    precision: usize,
    description: Option<String>,
    writable: bool,
    sink: Option<flume::Sender<ItemWrite>>,
    subscribers: Vec<flume::Sender<ItemChange>>,
}

impl Node {
    fn new(name: String, parent: Option<NodeId>) -> Self {
        Self {
            name,
            parent,
            children: Vec::new(),
            value: None,
            default: None,
            min: None,
            max: None,
            unit: String::new(),
            precision: 0,
            description: None,
            writable: false,
            sink: None,
            subscribers: Vec::new(),
        }
    }
}

pub struct ItemTree {
    nodes: Vec<Node>,
    watchers: Vec<flume::Sender<ItemChange>>,
}

impl Default for ItemTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ItemTree {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::new(String::new(), None)],
            watchers: Vec::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.nodes[id.0].name
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    /// Full `/`-separated path of a node (empty for the root).
    pub fn path_of(&self, id: NodeId) -> String {
        let mut segments = Vec::new();
        let mut current = Some(id);
        while let Some(node) = current {
            if !self.nodes[node.0].name.is_empty() {
                segments.push(self.nodes[node.0].name.clone());
            }
            current = self.nodes[node.0].parent;
        }
        segments.reverse();
        segments.join("/")
    }

    pub fn lookup(&self, path: &str) -> Option<NodeId> {
        self.lookup_under(self.root(), path)
    }

    pub fn lookup_under(&self, base: NodeId, path: &str) -> Option<NodeId> {
        let mut current = base;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = *self.nodes[current.0]
                .children
                .iter()
                .find(|&&child| self.nodes[child.0].name == segment)?;
        }
        Some(current)
    }

    pub fn get_or_create(&mut self, path: &str) -> NodeId {
        self.get_or_create_under(self.root(), path)
    }

    pub fn get_or_create_under(&mut self, base: NodeId, path: &str) -> NodeId {
        let mut current = base;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let existing = self.nodes[current.0]
                .children
                .iter()
                .find(|&&child| self.nodes[child.0].name == segment)
                .copied();
            current = match existing {
                Some(child) => child,
                None => {
                    debug_assert!(
                        self.nodes[current.0].value.is_none(),
                        "cannot add children under a value-carrying leaf"
                    );
                    let id = NodeId(self.nodes.len());
                    self.nodes.push(Node::new(segment.to_string(), Some(current)));
                    self.nodes[current.0].children.push(id);
                    id
                }
            };
        }
        current
    }

    pub fn value(&self, id: NodeId) -> Option<&Value> {
        self.nodes[id.0].value.as_ref()
    }

    /// Store a new value; notifies only when the value actually changed.
    /// Returns whether a notification went out.
    pub fn set_value(&mut self, id: NodeId, value: Value) -> bool {
        if !self.nodes[id.0].children.is_empty() {
            log::error!("refusing to set a value on interior node {}", self.path_of(id));
            return false;
        }
        if self.nodes[id.0].value.as_ref() == Some(&value) {
            return false;
        }
        self.nodes[id.0].value = Some(value);
        self.notify(id);
        true
    }

    /// Store a value and notify unconditionally (a confirmed external set
    /// notifies even when the value is unchanged).
    pub fn set_value_notify(&mut self, id: NodeId, value: Value) {
        if !self.nodes[id.0].children.is_empty() {
            log::error!("refusing to set a value on interior node {}", self.path_of(id));
            return;
        }
        self.nodes[id.0].value = Some(value);
        self.notify(id);
    }

    /// Clear the value, keeping the leaf itself. Notifies when a value was
    /// present.
    pub fn invalidate(&mut self, id: NodeId) {
        if self.nodes[id.0].value.take().is_some() {
            self.notify(id);
        }
    }

    /// Formatted presentation text of the current value.
    pub fn text(&self, id: NodeId) -> String {
        let node = &self.nodes[id.0];
        match &node.value {
            None => String::new(),
            Some(Value::Int(v)) => format!("{v}{}", node.unit),
            Some(Value::Real(v)) => format!("{:.*}{}", node.precision, v, node.unit),
            Some(Value::Text(v)) => v.clone(),
            Some(Value::Bytes(v)) => v.iter().map(|b| format!("{b:02x}")).collect(),
        }
    }

    pub fn set_unit(&mut self, id: NodeId, unit: &str, precision: usize) {
        self.nodes[id.0].unit = unit.to_string();
        self.nodes[id.0].precision = precision;
    }

    pub fn unit(&self, id: NodeId) -> &str {
        &self.nodes[id.0].unit
    }

    pub fn set_min(&mut self, id: NodeId, min: Value) {
        self.nodes[id.0].min = Some(min);
    }

    pub fn min(&self, id: NodeId) -> Option<&Value> {
        self.nodes[id.0].min.as_ref()
    }

    pub fn set_max(&mut self, id: NodeId, max: Value) {
        self.nodes[id.0].max = Some(max);
    }

    pub fn max(&self, id: NodeId) -> Option<&Value> {
        self.nodes[id.0].max.as_ref()
    }

    pub fn set_description(&mut self, id: NodeId, description: &str) {
        self.nodes[id.0].description = Some(description.to_string());
    }

    pub fn description(&self, id: NodeId) -> Option<&str> {
        self.nodes[id.0].description.as_deref()
    }

    pub fn set_default(&mut self, id: NodeId, default: Value) {
        self.nodes[id.0].default = Some(default);
    }

    pub fn default_value(&self, id: NodeId) -> Option<&Value> {
        self.nodes[id.0].default.as_ref()
    }

    pub fn set_writable(&mut self, id: NodeId, writable: bool) {
        self.nodes[id.0].writable = writable;
    }

    /// Route external writes on this leaf to the given channel instead of
    /// storing them directly.
    pub fn set_sink(&mut self, id: NodeId, sink: flume::Sender<ItemWrite>) {
        self.nodes[id.0].sink = Some(sink);
    }

    /// Subscribe to changes of one node.
    pub fn subscribe(&mut self, id: NodeId, tx: flume::Sender<ItemChange>) {
        self.nodes[id.0].subscribers.push(tx);
    }

    /// Subscribe to changes of every node (the external bus bridge).
    pub fn watch(&mut self, tx: flume::Sender<ItemChange>) {
        self.watchers.push(tx);
    }

    /// External write entry point (SetValue on the bus).
    pub fn write_value(&mut self, path: &str, value: Value) -> WriteDisposition {
        let Some(id) = self.lookup(path) else {
            return WriteDisposition::UnknownItem;
        };
        if let Some(sink) = &self.nodes[id.0].sink {
            let write = ItemWrite {
                node: id,
                path: self.path_of(id),
                value,
            };
            if sink.send(write).is_err() {
                log::warn!("write sink for {path} is gone");
                return WriteDisposition::Rejected;
            }
            return WriteDisposition::Forwarded;
        }
        if self.nodes[id.0].writable {
            self.set_value_notify(id, value);
            return WriteDisposition::Stored;
        }
        WriteDisposition::Rejected
    }

    fn notify(&mut self, id: NodeId) {
        let change = ItemChange {
            node: id,
            path: self.path_of(id),
            value: self.nodes[id.0].value.clone(),
        };
        // Snapshot so reentrant subscription changes cannot break the walk.
        let subscribers = self.nodes[id.0].subscribers.clone();
        for tx in &subscribers {
            let _ = tx.send(change.clone());
        }
        self.nodes[id.0]
            .subscribers
            .retain(|tx| !tx.is_disconnected());
        let watchers = self.watchers.clone();
        for tx in &watchers {
            let _ = tx.send(change.clone());
        }
        self.watchers.retain(|tx| !tx.is_disconnected());
    }
}
