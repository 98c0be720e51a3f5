//! # The Value Reducer
//!
//! Turns a decoded [`Value`] (plus the [`Heap`] its nodes live in) into
//! canonical JSON.
//!
//! ## Two Passes
//!
//! Most object states are trees. The first pass assumes that and renders
//! every node inline, tracking only the nodes currently being rendered. If a
//! node is reached while it is already in progress, the graph has a cycle
//! and the pass gives up:
//!
//! ```text
//!   pass 1 (plain)                         pass 2 (sharing-aware)
//!   ──────────────                         ──────────────────────
//!   [ [..], [..] ]  ── ok ──► done         first visit of a memo-read node:
//!                                            {"::":"shared","id":"K","value":..}
//!   L = [ L ]       ── cycle ──►           every later visit:
//!                                            {"::":"ref","id":"K"}
//! ```
//!
//! Only nodes whose defining memo slot was read back get markers, so a
//! sharing-free graph never carries markup. Definitions always precede
//! their references because markers are assigned in output order.
//!
//! ## Canonical Forms
//!
//! | Value | JSON |
//! |-------|------|
//! | bytes | `{"::":"hex","hex":"..."}` |
//! | global | `{"::":"global","name":"module.Name"}` |
//! | persistent | `{"::":"persistent","id":N}` or `{"::":"persistent","id":[N,"module.Name"]}` |
//! | instance | state map + `"::": class` (+ `"__class_args__"`) |
//! | NaN / ±inf | `"NaN"`, `"Infinity"`, `"-Infinity"` |

use std::collections::HashSet;
use std::str::FromStr;

use serde_json::{Map, Number, Value as Json};

use crate::error::{Error, Result};
use crate::value::{Heap, Instance, Node, NodeId, PersistentRef, Value};

/// Tag key used by every marker object.
pub const TAG: &str = "::";

/// Key holding the constructor arguments of an instance.
pub const CLASS_ARGS: &str = "__class_args__";

/// Key holding instance state that is not a mapping.
pub const STATE: &str = "state";

/// Deepest node nesting the reducer will follow.
pub const MAX_DEPTH: usize = 500;

// =============================================================================
// Public API
// =============================================================================

/// Reduces `root` to a JSON value.
pub fn to_json(root: &Value, heap: &Heap) -> Result<Json> {
    match Reducer::new(heap, Mode::Plain).value(root) {
        Ok(json) => Ok(json),
        Err(Failure::Fatal(err)) => Err(err),
        Err(Failure::Cycle) => Reducer::new(heap, Mode::Sharing)
            .value(root)
            .map_err(Failure::into_error),
    }
}

/// Reduces `root` to compact canonical JSON text.
pub fn to_json_text(root: &Value, heap: &Heap) -> Result<String> {
    Ok(serde_json::to_string(&to_json(root, heap)?)?)
}

/// Shortest round-trip text for a float; non-finite values use their names.
pub fn float_text(f: f64) -> String {
    match Number::from_f64(f) {
        Some(n) => n.to_string(),
        None => non_finite_name(f).to_string(),
    }
}

fn non_finite_name(f: f64) -> &'static str {
    if f.is_nan() {
        "NaN"
    } else if f.is_sign_positive() {
        "Infinity"
    } else {
        "-Infinity"
    }
}

// =============================================================================
// Reducer
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Inline everything; fail on the first cycle.
    Plain,
    /// Wrap memo-read nodes in shared/ref markers.
    Sharing,
}

/// Why a pass stopped.
enum Failure {
    /// A node was reached from inside itself.
    Cycle,
    /// Anything else; final for the record.
    Fatal(Error),
}

impl Failure {
    fn into_error(self) -> Error {
        match self {
            Failure::Fatal(err) => err,
            Failure::Cycle => Error::Unrepresentable("cycle that bypasses the memo".to_string()),
        }
    }
}

impl From<Error> for Failure {
    fn from(err: Error) -> Self {
        Failure::Fatal(err)
    }
}

impl From<serde_json::Error> for Failure {
    fn from(err: serde_json::Error) -> Self {
        Failure::Fatal(err.into())
    }
}

type Reduced = std::result::Result<Json, Failure>;

struct Reducer<'h> {
    heap: &'h Heap,
    mode: Mode,
    /// Nodes on the current rendering path.
    in_progress: HashSet<NodeId>,
    /// Shared nodes already emitted as definitions.
    defined: HashSet<NodeId>,
    depth: usize,
}

impl<'h> Reducer<'h> {
    fn new(heap: &'h Heap, mode: Mode) -> Self {
        Self {
            heap,
            mode,
            in_progress: HashSet::new(),
            defined: HashSet::new(),
            depth: 0,
        }
    }

    fn value(&mut self, value: &Value) -> Reduced {
        Ok(match value {
            Value::None => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::BigInt(digits) => Json::Number(Number::from_str(digits)?),
            Value::Float(f) => match Number::from_f64(*f) {
                Some(n) => Json::Number(n),
                None => Json::String(non_finite_name(*f).to_string()),
            },
            Value::Str(s) => Json::String(s.clone()),
            Value::Bytes(bytes) => marker("hex", "hex", Json::String(hex::encode(bytes))),
            Value::Tuple(items) => {
                self.descend()?;
                let items = self.values(items);
                self.depth -= 1;
                Json::Array(items?)
            }
            Value::Global(global) => marker("global", "name", Json::String(global.qualified())),
            Value::Persistent(PersistentRef::Oid(oid)) => marker("persistent", "id", Json::from(*oid)),
            Value::Persistent(PersistentRef::Typed { oid, class_name }) => marker(
                "persistent",
                "id",
                Json::Array(vec![Json::from(*oid), Json::String(class_name.clone())]),
            ),
            Value::Node(id) => self.node(*id)?,
        })
    }

    fn values(&mut self, items: &[Value]) -> std::result::Result<Vec<Json>, Failure> {
        items.iter().map(|item| self.value(item)).collect()
    }

    fn node(&mut self, id: NodeId) -> Reduced {
        if self.mode == Mode::Sharing {
            if let Some(key) = self.heap.shared_key(id) {
                if !self.defined.insert(id) {
                    return Ok(marker("ref", "id", Json::String(key.to_string())));
                }
                let body = self.node_body(id)?;
                let mut wrapper = Map::new();
                wrapper.insert(TAG.to_string(), Json::String("shared".to_string()));
                wrapper.insert("id".to_string(), Json::String(key.to_string()));
                wrapper.insert("value".to_string(), body);
                return Ok(Json::Object(wrapper));
            }
        }

        if !self.in_progress.insert(id) {
            return Err(match self.mode {
                Mode::Plain => Failure::Cycle,
                // A cycle through a node that was never read from the memo
                // (built with DUP) has no id to point back to.
                Mode::Sharing => Failure::Fatal(Error::Unrepresentable(
                    "cycle that bypasses the memo".to_string(),
                )),
            });
        }
        let body = self.node_body(id);
        self.in_progress.remove(&id);
        body
    }

    /// Enters one container level.
    fn descend(&mut self) -> std::result::Result<(), Failure> {
        if self.depth >= MAX_DEPTH {
            return Err(Failure::Fatal(Error::Unrepresentable(format!(
                "nesting deeper than {MAX_DEPTH} levels"
            ))));
        }
        self.depth += 1;
        Ok(())
    }

    fn node_body(&mut self, id: NodeId) -> Reduced {
        self.descend()?;

        let heap = self.heap;
        let result = match heap.node(id) {
            Node::List(items) => self.values(items).map(Json::Array),
            Node::Dict(map) => {
                let mut out = Map::new();
                for (key, value) in map {
                    out.insert(key.clone(), self.value(value)?);
                }
                Ok(Json::Object(out))
            }
            Node::Instance(instance) => self.instance(instance),
        };

        self.depth -= 1;
        result
    }

    fn instance(&mut self, instance: &Instance) -> Reduced {
        let mut out = match &instance.state {
            None => Map::new(),
            Some(state) => {
                // A state dict that carries its own sharing markup keeps it
                // intact under the state key.
                let marked = self.mode == Mode::Sharing
                    && matches!(state, Value::Node(sid) if self.heap.shared_key(*sid).is_some());
                match self.value(state)? {
                    Json::Object(map) if !marked => map,
                    other => {
                        let mut map = Map::new();
                        map.insert(STATE.to_string(), other);
                        map
                    }
                }
            }
        };

        out.insert(TAG.to_string(), Json::String(instance.class_name.clone()));
        if !instance.args.is_empty() {
            out.insert(CLASS_ARGS.to_string(), Json::Array(self.values(&instance.args)?));
        }
        Ok(Json::Object(out))
    }
}

/// `{"::": tag, key: value}`.
fn marker(tag: &str, key: &str, value: Json) -> Json {
    let mut map = Map::new();
    map.insert(TAG.to_string(), Json::String(tag.to_string()));
    map.insert(key.to_string(), value);
    Json::Object(map)
}

// =============================================================================
// Tests
// =============================================================================
