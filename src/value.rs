//! # Stack-Machine Values and the Memo Heap
//!
//! The stack machine produces [`Value`]s. Scalars, tuples, global symbols and
//! persistent references are plain values: they are compared by value and
//! copied freely. Lists, dicts and instances are *identity-significant*: they
//! can be mutated after creation (APPEND, SETITEM, BUILD) and can appear in
//! several places of one object graph, including inside themselves.
//!
//! ## Arena Instead of Pointers
//!
//! ```text
//!   stack / tuples / dict values           Heap
//!  ┌──────────────────────────┐   ┌────────────────────────────────┐
//!  │ Value::Node(NodeId(0)) ──┼──►│ nodes[0] = List [ .., Node(0) ]│◄─┐
//!  │ Value::Int(3)            │   │ nodes[1] = Dict {..}           │  │
//!  └──────────────────────────┘   │                                │  │
//!                                 │ memo["2"] = Node(0), got=true ─┼──┘
//!                                 │ owners[NodeId(0)] = "2"        │
//!                                 └────────────────────────────────┘
//! ```
//!
//! Composite values live in an arena owned by the [`Heap`] and are referred
//! to by [`NodeId`]. A list that contains itself is just a node whose items
//! include its own id, so cycles need no reference counting or unsafe code.
//!
//! The memo table maps memo keys to values. A `put` records the value under
//! a key and, for composites, remembers which key *defined* the node. A `get`
//! marks the slot as referenced. The reducer later emits sharing markers
//! only for nodes whose defining slot was referenced.
//!
//! The heap belongs to one decode session and is dropped with it.

use std::collections::HashMap;
use std::fmt;

use indexmap::IndexMap;

// =============================================================================
// Values
// =============================================================================

/// A value on the stack machine's operand stack.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Python `None`.
    None,
    /// A boolean.
    Bool(bool),
    /// An integer that fits in 64 bits.
    Int(i64),
    /// An integer beyond 64 bits, as normalized decimal text.
    BigInt(String),
    /// A float.
    Float(f64),
    /// Text (also used for byte strings that are pure ASCII).
    Str(String),
    /// A byte string that is not ASCII; kept opaque.
    Bytes(Vec<u8>),
    /// An immutable sequence.
    Tuple(Vec<Value>),
    /// A `(module, name)` symbol.
    Global(Global),
    /// A reference to another persistent object.
    Persistent(PersistentRef),
    /// A list, dict or instance in the heap arena.
    Node(NodeId),
}

impl Value {
    /// Short name of the value's kind, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) | Value::BigInt(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Tuple(_) => "tuple",
            Value::Global(_) => "global",
            Value::Persistent(_) => "persistent",
            Value::Node(_) => "object",
        }
    }

    /// Returns the raw bytes of a byte-string value.
    ///
    /// ASCII byte strings decode to [`Value::Str`], so both forms count.
    pub fn as_byte_string(&self) -> Option<&[u8]> {
        match self {
            Value::Str(s) => Some(s.as_bytes()),
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

/// A global symbol: a class or function named by module and attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Global {
    /// Module path, e.g. `persistent.mapping`.
    pub module: String,
    /// Attribute name, e.g. `PersistentMapping`.
    pub name: String,
}

impl Global {
    /// Creates a global symbol.
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }

    /// The dotted name, e.g. `persistent.mapping.PersistentMapping`.
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.module, self.name)
    }
}

impl fmt::Display for Global {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

/// An external object reference, normalized from its pickled form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistentRef {
    /// A bare 8-byte object id.
    Oid(u64),
    /// An object id with a class hint.
    Typed {
        /// The referenced object's id.
        oid: u64,
        /// Qualified class name of the referenced object.
        class_name: String,
    },
}

// =============================================================================
// Arena Nodes
// =============================================================================

/// Index of a composite value in the [`Heap`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    /// Position in the arena.
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// A generic instance produced by INST, OBJ, REDUCE or NEWOBJ.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    /// Qualified class name.
    pub class_name: String,
    /// Positional constructor arguments.
    pub args: Vec<Value>,
    /// State attached by BUILD, if any.
    pub state: Option<Value>,
}

/// An identity-significant value.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// A mutable sequence.
    List(Vec<Value>),
    /// A mapping with text keys, in insertion order; later writes win.
    Dict(IndexMap<String, Value>),
    /// A tagged instance awaiting or holding its state.
    Instance(Instance),
}

// =============================================================================
// Memo Heap
// =============================================================================

/// A memo key. Keys are small integers assigned in stream order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoKey(u32);

impl MemoKey {
    /// Creates a memo key.
    pub fn new(key: u32) -> Self {
        Self(key)
    }

    /// The raw key.
    pub fn as_raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for MemoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct MemoSlot {
    value: Value,
    referenced: bool,
}

/// The private heap of one decode session: composite nodes plus memo slots.
#[derive(Debug, Default)]
pub struct Heap {
    nodes: Vec<Node>,
    memo: HashMap<MemoKey, MemoSlot>,
    /// The key that first recorded each composite node.
    owners: HashMap<NodeId, MemoKey>,
}

impl Heap {
    /// Creates an empty heap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves a composite into the arena.
    pub fn alloc(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    /// Borrows a node.
    ///
    /// Ids are only minted by [`Heap::alloc`] on this heap, so lookups
    /// cannot miss.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    /// Mutably borrows a node.
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    /// Number of composite nodes allocated so far.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Records `value` under `key` (the PUT family).
    ///
    /// Scalars are stored by value. For composites, the first key that
    /// records a node becomes its definition site.
    pub fn put(&mut self, key: MemoKey, value: Value) {
        if let Value::Node(id) = value {
            self.owners.entry(id).or_insert(key);
        }
        self.memo.insert(
            key,
            MemoSlot {
                value,
                referenced: false,
            },
        );
    }

    /// Reads the value under `key` (the GET family), marking composites as
    /// referenced.
    pub fn get(&mut self, key: MemoKey) -> Option<Value> {
        let slot = self.memo.get_mut(&key)?;
        let value = slot.value.clone();
        if let Value::Node(id) = value {
            slot.referenced = true;
            // A node recorded under several keys is shared through whichever
            // key defined it.
            if let Some(owner) = self.owners.get(&id).copied() {
                if let Some(owner_slot) = self.memo.get_mut(&owner) {
                    owner_slot.referenced = true;
                }
            }
        }
        Some(value)
    }

    /// Returns the defining memo key of a node that was read back at least
    /// once, i.e. a node that may be shared or cyclic.
    pub fn shared_key(&self, id: NodeId) -> Option<MemoKey> {
        let key = self.owners.get(&id)?;
        match self.memo.get(key) {
            Some(slot) if slot.referenced => Some(*key),
            _ => None,
        }
    }

    /// Number of memo slots.
    pub fn memo_len(&self) -> usize {
        self.memo.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
