//! # The Stack Machine
//!
//! Executes a pickle opcode stream and assembles the values it encodes.
//!
//! ## Execution Model
//!
//! ```text
//!   bytes ──► [opcode][operand][opcode][operand] ... [STOP]
//!                │
//!                ▼  Opcode::from_byte (256-entry table)
//!            match op { ... }
//!                │
//!      ┌─────────┼─────────────┬──────────────┐
//!      ▼         ▼             ▼              ▼
//!   stack      marks         heap.memo     heap.nodes
//!   Vec<Value> Vec<usize>    put / get     lists, dicts, instances
//! ```
//!
//! A record holds two concatenated pickles, so the caller invokes
//! [`Machine::load`] twice on the same machine. Each call runs until its STOP
//! opcode and leaves the cursor on the first byte of the next pickle.
//! [`Machine::position`] after the first load is the exact length of the
//! class descriptor prefix.
//!
//! The memo heap is shared by both loads of one record and dropped with the
//! machine.
//!
//! ## Failure Policy
//!
//! Every failure is an [`Error`] carrying the offset of the opcode that was
//! executing. Nothing here logs or retries; the record converter decides
//! what a failed record means.

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::literal;
use crate::opcode::Opcode;
use crate::reduce::MAX_DEPTH;
use crate::value::{Global, Heap, Instance, MemoKey, Node, NodeId, PersistentRef, Value};

/// Qualified names of the classes rendered as ISO-8601 text.
const DATE_CLASS: &str = "datetime.date";
const DATETIME_CLASS: &str = "datetime.datetime";

// =============================================================================
// Machine
// =============================================================================

/// A pickle decoder over one byte buffer.
pub struct Machine<'a> {
    data: &'a [u8],
    pos: usize,
    stack: Vec<Value>,
    /// Stack heights recorded by MARK, innermost last.
    marks: Vec<usize>,
    heap: Heap,
}

impl<'a> Machine<'a> {
    /// Creates a machine positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            stack: Vec::new(),
            marks: Vec::new(),
            heap: Heap::new(),
        }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// The memo heap built so far.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Consumes the machine, keeping only its heap.
    pub fn into_heap(self) -> Heap {
        self.heap
    }

    /// Runs opcodes until one top-level value is complete and returns it.
    ///
    /// The value ends at STOP. End of input is accepted instead of STOP only
    /// when exactly one value and no open mark are left.
    pub fn load(&mut self) -> Result<Value> {
        self.stack.clear();
        self.marks.clear();

        loop {
            let offset = self.pos;
            let Some(&byte) = self.data.get(offset) else {
                if self.stack.len() == 1 && self.marks.is_empty() {
                    return self.pop(offset);
                }
                return Err(Error::Truncated { offset, needed: 1 });
            };
            self.pos += 1;

            let op = Opcode::from_byte(byte).ok_or(Error::UnknownOpcode {
                opcode: byte,
                offset,
            })?;
            if op == Opcode::Stop {
                return self.pop(offset);
            }
            self.step(op, offset)?;
        }
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    fn step(&mut self, op: Opcode, offset: usize) -> Result<()> {
        match op {
            // Stack and mark manipulation
            Opcode::Mark => self.marks.push(self.stack.len()),
            Opcode::Stop => return Err(Error::malformed(offset, "unexpected STOP")),
            Opcode::Pop => match self.marks.last() {
                // Nothing above the innermost mark: POP discards the mark.
                Some(&mark) if mark == self.stack.len() => {
                    self.marks.pop();
                }
                _ => {
                    self.pop(offset)?;
                }
            },
            Opcode::PopMark => {
                self.pop_mark(offset)?;
            }
            Opcode::Dup => {
                let top = self.top(offset)?.clone();
                self.stack.push(top);
            }

            // Scalars
            Opcode::None => self.stack.push(Value::None),
            Opcode::NewTrue => self.stack.push(Value::Bool(true)),
            Opcode::NewFalse => self.stack.push(Value::Bool(false)),
            Opcode::Int => {
                let line = self.read_line()?;
                let value = match line {
                    b"01" => Value::Bool(true),
                    b"00" => Value::Bool(false),
                    _ => literal::parse_int_text(line)
                        .ok_or_else(|| Error::malformed(offset, "invalid INT literal"))?,
                };
                self.stack.push(value);
            }
            Opcode::BinInt => {
                let value = i32::from_le_bytes(self.read_array()?);
                self.stack.push(Value::Int(i64::from(value)));
            }
            Opcode::BinInt1 => {
                let value = self.read_u8()?;
                self.stack.push(Value::Int(i64::from(value)));
            }
            Opcode::BinInt2 => {
                let value = u16::from_le_bytes(self.read_array()?);
                self.stack.push(Value::Int(i64::from(value)));
            }
            Opcode::Long => {
                let line = self.read_line()?;
                let value = literal::parse_int_text(line)
                    .ok_or_else(|| Error::malformed(offset, "invalid LONG literal"))?;
                self.stack.push(value);
            }
            Opcode::Long1 => {
                let len = usize::from(self.read_u8()?);
                let bytes = self.take(len)?;
                self.stack.push(literal::decode_long_le(bytes));
            }
            Opcode::Long4 => {
                let len = self.read_i32_len(offset)?;
                let bytes = self.take(len)?;
                self.stack.push(literal::decode_long_le(bytes));
            }
            Opcode::Float => {
                let line = self.read_line()?;
                let value = literal::parse_float_text(line)
                    .ok_or_else(|| Error::malformed(offset, "invalid FLOAT literal"))?;
                self.stack.push(Value::Float(value));
            }
            Opcode::BinFloat => {
                let value = f64::from_be_bytes(self.read_array()?);
                self.stack.push(Value::Float(value));
            }
            Opcode::String => {
                let line = self.read_line()?;
                let bytes =
                    literal::decode_repr_string(line).map_err(|r| Error::malformed(offset, r))?;
                self.stack.push(byte_string(bytes));
            }
            Opcode::BinString => {
                let len = self.read_i32_len(offset)?;
                let bytes = self.take(len)?.to_vec();
                self.stack.push(byte_string(bytes));
            }
            Opcode::ShortBinString => {
                let len = usize::from(self.read_u8()?);
                let bytes = self.take(len)?.to_vec();
                self.stack.push(byte_string(bytes));
            }
            Opcode::BinBytes => {
                let len = u32::from_le_bytes(self.read_array()?) as usize;
                let bytes = self.take(len)?.to_vec();
                self.stack.push(Value::Bytes(bytes));
            }
            Opcode::ShortBinBytes => {
                let len = usize::from(self.read_u8()?);
                let bytes = self.take(len)?.to_vec();
                self.stack.push(Value::Bytes(bytes));
            }
            Opcode::Unicode => {
                let line = self.read_line()?;
                let text = literal::decode_raw_unicode_escape(line)
                    .map_err(|r| Error::malformed(offset, r))?;
                self.stack.push(Value::Str(text));
            }
            Opcode::BinUnicode => {
                let len = u32::from_le_bytes(self.read_array()?) as usize;
                let bytes = self.take(len)?;
                let text =
                    literal::decode_utf8_lenient(bytes).map_err(|r| Error::malformed(offset, r))?;
                self.stack.push(Value::Str(text));
            }

            // Tuples
            Opcode::EmptyTuple => self.stack.push(Value::Tuple(Vec::new())),
            Opcode::Tuple => {
                let items = self.pop_mark(offset)?;
                self.stack.push(nested_tuple(items)?);
            }
            Opcode::Tuple1 | Opcode::Tuple2 | Opcode::Tuple3 => {
                let n = match op {
                    Opcode::Tuple1 => 1,
                    Opcode::Tuple2 => 2,
                    _ => 3,
                };
                let items = self.pop_n(n, offset)?;
                self.stack.push(nested_tuple(items)?);
            }

            // Lists
            Opcode::EmptyList => {
                let id = self.heap.alloc(Node::List(Vec::new()));
                self.stack.push(Value::Node(id));
            }
            Opcode::List => {
                let items = self.pop_mark(offset)?;
                let id = self.heap.alloc(Node::List(items));
                self.stack.push(Value::Node(id));
            }
            Opcode::Append => {
                let value = self.pop(offset)?;
                self.extend_list(vec![value], offset)?;
            }
            Opcode::Appends => {
                let items = self.pop_mark(offset)?;
                self.extend_list(items, offset)?;
            }

            // Dicts
            Opcode::EmptyDict => {
                let id = self.heap.alloc(Node::Dict(IndexMap::new()));
                self.stack.push(Value::Node(id));
            }
            Opcode::Dict => {
                let items = self.pop_mark(offset)?;
                let map = pairs_to_map(items, offset)?;
                let id = self.heap.alloc(Node::Dict(map));
                self.stack.push(Value::Node(id));
            }
            Opcode::SetItem => {
                let value = self.pop(offset)?;
                let key = self.pop(offset)?;
                self.set_items(vec![key, value], offset)?;
            }
            Opcode::SetItems => {
                let items = self.pop_mark(offset)?;
                self.set_items(items, offset)?;
            }

            // Classes and instances
            Opcode::Global => {
                let global = self.read_global(offset)?;
                self.stack.push(Value::Global(global));
            }
            Opcode::Inst => {
                let global = self.read_global(offset)?;
                let args = self.pop_mark(offset)?;
                let value = self.instantiate(Value::Global(global), args, offset)?;
                self.stack.push(value);
            }
            Opcode::Obj => {
                let mut items = self.pop_mark(offset)?.into_iter();
                let class = items
                    .next()
                    .ok_or_else(|| Error::malformed(offset, "OBJ without a class"))?;
                let value = self.instantiate(class, items.collect(), offset)?;
                self.stack.push(value);
            }
            Opcode::Reduce | Opcode::NewObj => {
                let args = match self.pop(offset)? {
                    Value::Tuple(items) => items,
                    Value::None => Vec::new(),
                    other => {
                        return Err(Error::malformed(
                            offset,
                            format!("constructor arguments must be a tuple, got {}", other.kind()),
                        ))
                    }
                };
                let class = self.pop(offset)?;
                let value = self.instantiate(class, args, offset)?;
                self.stack.push(value);
            }
            Opcode::Build => {
                let state = self.pop(offset)?;
                self.build(state, offset)?;
            }

            // External references
            Opcode::PersId => {
                let line = self.read_line()?;
                let pid = byte_string(line.to_vec());
                self.stack.push(Value::Persistent(persistent_ref(&pid, offset)?));
            }
            Opcode::BinPersId => {
                let pid = self.pop(offset)?;
                self.stack.push(Value::Persistent(persistent_ref(&pid, offset)?));
            }

            // Memo
            Opcode::Put => {
                let line = self.read_line()?;
                let key = parse_memo_key(line, offset)?;
                self.memo_put(key, offset)?;
            }
            Opcode::BinPut => {
                let key = MemoKey::new(u32::from(self.read_u8()?));
                self.memo_put(key, offset)?;
            }
            Opcode::LongBinPut => {
                let key = MemoKey::new(u32::from_le_bytes(self.read_array()?));
                self.memo_put(key, offset)?;
            }
            Opcode::Get => {
                let line = self.read_line()?;
                let key = parse_memo_key(line, offset)?;
                self.memo_get(key, offset)?;
            }
            Opcode::BinGet => {
                let key = MemoKey::new(u32::from(self.read_u8()?));
                self.memo_get(key, offset)?;
            }
            Opcode::LongBinGet => {
                let key = MemoKey::new(u32::from_le_bytes(self.read_array()?));
                self.memo_get(key, offset)?;
            }

            // Framing
            Opcode::Proto => {
                self.read_u8()?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Operand Readers
    // =========================================================================

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let remaining = self.remaining();
        if n > remaining {
            return Err(Error::Truncated {
                offset: self.pos,
                needed: n - remaining,
            });
        }
        let data = self.data;
        let bytes = &data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8> {
        let [b] = self.read_array::<1>()?;
        Ok(b)
    }

    /// Reads a signed 4-byte length; negative lengths are malformed.
    fn read_i32_len(&mut self, offset: usize) -> Result<usize> {
        let len = i32::from_le_bytes(self.read_array()?);
        usize::try_from(len).map_err(|_| Error::malformed(offset, format!("negative length {len}")))
    }

    /// Reads up to the next newline, which is consumed but not returned.
    fn read_line(&mut self) -> Result<&'a [u8]> {
        let data = self.data;
        let rest = &data[self.pos..];
        let end = rest.iter().position(|&b| b == b'\n').ok_or(Error::Truncated {
            offset: self.data.len(),
            needed: 1,
        })?;
        self.pos += end + 1;
        Ok(&rest[..end])
    }

    fn read_global(&mut self, offset: usize) -> Result<Global> {
        let module = line_text(self.read_line()?, offset)?;
        let name = line_text(self.read_line()?, offset)?;
        Ok(Global::new(module, name))
    }

    // =========================================================================
    // Stack Helpers
    // =========================================================================

    /// Lowest stack index the current frame may touch.
    fn floor(&self) -> usize {
        self.marks.last().copied().unwrap_or(0)
    }

    fn pop(&mut self, offset: usize) -> Result<Value> {
        if self.stack.len() <= self.floor() {
            return Err(Error::malformed(offset, "stack underflow"));
        }
        self.stack
            .pop()
            .ok_or_else(|| Error::malformed(offset, "stack underflow"))
    }

    fn pop_n(&mut self, n: usize, offset: usize) -> Result<Vec<Value>> {
        if self.stack.len() < self.floor() + n {
            return Err(Error::malformed(offset, "stack underflow"));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn top(&self, offset: usize) -> Result<&Value> {
        if self.stack.len() <= self.floor() {
            return Err(Error::malformed(offset, "stack underflow"));
        }
        self.stack
            .last()
            .ok_or_else(|| Error::malformed(offset, "stack underflow"))
    }

    /// Pops everything above the innermost mark, and the mark itself.
    fn pop_mark(&mut self, offset: usize) -> Result<Vec<Value>> {
        let mark = self
            .marks
            .pop()
            .ok_or_else(|| Error::malformed(offset, "no mark on the stack"))?;
        if mark > self.stack.len() {
            return Err(Error::malformed(offset, "mark above stack top"));
        }
        Ok(self.stack.split_off(mark))
    }

    /// The arena node at the top of the stack.
    fn top_node(&self, offset: usize, what: &str) -> Result<NodeId> {
        match self.top(offset)? {
            Value::Node(id) => Ok(*id),
            other => Err(Error::malformed(
                offset,
                format!("{what} target must be a container, got {}", other.kind()),
            )),
        }
    }

    // =========================================================================
    // Container and Instance Operations
    // =========================================================================

    fn extend_list(&mut self, items: Vec<Value>, offset: usize) -> Result<()> {
        let id = self.top_node(offset, "APPEND")?;
        match self.heap.node_mut(id) {
            Node::List(list) => {
                list.extend(items);
                Ok(())
            }
            _ => Err(Error::malformed(offset, "APPEND target is not a list")),
        }
    }

    fn set_items(&mut self, items: Vec<Value>, offset: usize) -> Result<()> {
        let id = self.top_node(offset, "SETITEM")?;
        let pairs = pairs_to_map(items, offset)?;
        match self.heap.node_mut(id) {
            Node::Dict(map) => {
                map.extend(pairs);
                Ok(())
            }
            _ => Err(Error::malformed(offset, "SETITEM target is not a dict")),
        }
    }

    fn build(&mut self, state: Value, offset: usize) -> Result<()> {
        let id = self.top_node(offset, "BUILD")?;

        // Dict state merged into a dict target needs both nodes at once.
        let merge = match (self.heap.node(id), &state) {
            (Node::Dict(_), Value::Node(state_id)) => match self.heap.node(*state_id) {
                Node::Dict(entries) => Some(entries.clone()),
                _ => None,
            },
            _ => None,
        };

        match self.heap.node_mut(id) {
            Node::Instance(instance) => {
                instance.state = Some(state);
                Ok(())
            }
            Node::Dict(map) => match merge {
                Some(entries) => {
                    map.extend(entries);
                    Ok(())
                }
                None => Err(Error::malformed(offset, "BUILD on a dict needs dict state")),
            },
            Node::List(_) => Err(Error::malformed(offset, "BUILD target is a list")),
        }
    }

    fn instantiate(&mut self, class: Value, args: Vec<Value>, offset: usize) -> Result<Value> {
        let class_name = match class {
            Value::Global(global) => global.qualified(),
            Value::Str(name) => name,
            other => {
                return Err(Error::malformed(
                    offset,
                    format!("instance class must be a global, got {}", other.kind()),
                ))
            }
        };

        if class_name == DATE_CLASS || class_name == DATETIME_CLASS {
            let with_time = class_name == DATETIME_CLASS;
            let iso = date_text(&args, with_time)
                .ok_or_else(|| Error::malformed(offset, format!("invalid {class_name} state")))?;
            return Ok(Value::Str(iso));
        }

        let id = self.heap.alloc(Node::Instance(Instance {
            class_name,
            args,
            state: None,
        }));
        Ok(Value::Node(id))
    }

    // =========================================================================
    // Memo
    // =========================================================================

    fn memo_put(&mut self, key: MemoKey, offset: usize) -> Result<()> {
        let value = self.top(offset)?.clone();
        self.heap.put(key, value);
        Ok(())
    }

    fn memo_get(&mut self, key: MemoKey, offset: usize) -> Result<()> {
        let value = self
            .heap
            .get(key)
            .ok_or_else(|| Error::malformed(offset, format!("unknown memo key {key}")))?;
        self.stack.push(value);
        Ok(())
    }
}

// =============================================================================
// Free Helpers
// =============================================================================

/// ASCII byte strings become text; anything else stays opaque.
fn byte_string(bytes: Vec<u8>) -> Value {
    if bytes.is_ascii() {
        // ASCII is valid UTF-8, so this never falls through.
        match String::from_utf8(bytes) {
            Ok(text) => Value::Str(text),
            Err(err) => Value::Bytes(err.into_bytes()),
        }
    } else {
        Value::Bytes(bytes)
    }
}

fn line_text(line: &[u8], offset: usize) -> Result<String> {
    std::str::from_utf8(line)
        .map(str::to_owned)
        .map_err(|_| Error::malformed(offset, "symbol name is not valid text"))
}

fn parse_memo_key(line: &[u8], offset: usize) -> Result<MemoKey> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|text| text.trim().parse::<u32>().ok())
        .map(MemoKey::new)
        .ok_or_else(|| Error::malformed(offset, "invalid memo key"))
}

/// Turns a flat `[k1, v1, k2, v2, ...]` run into a map. Later keys win.
fn pairs_to_map(items: Vec<Value>, offset: usize) -> Result<IndexMap<String, Value>> {
    if items.len() % 2 != 0 {
        return Err(Error::malformed(offset, "odd number of dict items"));
    }
    let mut map = IndexMap::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        map.insert(coerce_key(&key, offset)?, value);
    }
    Ok(map)
}

/// Coerces a mapping key to text.
fn coerce_key(key: &Value, offset: usize) -> Result<String> {
    match key {
        Value::Str(s) => Ok(s.clone()),
        Value::Int(i) => Ok(i.to_string()),
        Value::BigInt(digits) => Ok(digits.clone()),
        Value::Float(f) => Ok(crate::reduce::float_text(*f)),
        Value::Bool(b) => Ok(b.to_string()),
        Value::None => Ok("null".to_string()),
        Value::Bytes(bytes) => Ok(hex::encode(bytes)),
        Value::Global(global) => Ok(global.qualified()),
        other => Err(Error::malformed(
            offset,
            format!("unsupported mapping key of kind {}", other.kind()),
        )),
    }
}

/// Wraps `items` in a tuple, refusing chains nested past [`MAX_DEPTH`].
///
/// Tuples are owned values rather than arena nodes, so an unbounded chain
/// would overflow the stack when it is cloned, reduced or dropped.
fn nested_tuple(items: Vec<Value>) -> Result<Value> {
    let depth = 1 + items.iter().map(tuple_depth).max().unwrap_or(0);
    if depth > MAX_DEPTH {
        return Err(Error::Unrepresentable(format!(
            "tuples nested deeper than {MAX_DEPTH} levels"
        )));
    }
    Ok(Value::Tuple(items))
}

fn tuple_depth(value: &Value) -> usize {
    match value {
        Value::Tuple(items) => 1 + items.iter().map(tuple_depth).max().unwrap_or(0),
        _ => 0,
    }
}

/// Normalizes a persistent id: an 8-byte oid, or `(oid, class)`.
fn persistent_ref(pid: &Value, offset: usize) -> Result<PersistentRef> {
    let oid_of = |value: &Value| -> Option<u64> {
        let bytes: [u8; 8] = value.as_byte_string()?.try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    };

    if let Some(oid) = oid_of(pid) {
        return Ok(PersistentRef::Oid(oid));
    }
    if let Value::Tuple(items) = pid {
        if let [oid, Value::Global(class)] = items.as_slice() {
            if let Some(oid) = oid_of(oid) {
                return Ok(PersistentRef::Typed {
                    oid,
                    class_name: class.qualified(),
                });
            }
        }
    }
    Err(Error::malformed(
        offset,
        format!("unsupported persistent id of kind {}", pid.kind()),
    ))
}

/// Renders a date or datetime from its constructor arguments.
///
/// Pickles carry either the packed state bytes, optionally followed by a
/// tzinfo, or the integer fields.
fn date_text(args: &[Value], with_time: bool) -> Option<String> {
    if let Some(bytes) = args.first().and_then(Value::as_byte_string) {
        return if with_time {
            literal::datetime_from_state(bytes).map(|dt| literal::iso_datetime(&dt))
        } else {
            literal::date_from_state(bytes).map(|d| literal::iso_date(&d))
        };
    }
    let fields = args
        .iter()
        .map(|v| match v {
            Value::Int(i) => Some(*i),
            _ => None,
        })
        .collect::<Option<Vec<i64>>>()?;
    if with_time {
        literal::datetime_from_components(&fields).map(|dt| literal::iso_datetime(&dt))
    } else {
        literal::date_from_components(&fields).map(|d| literal::iso_date(&d))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn load_one(data: &[u8]) -> (Value, Heap) {
        let mut machine = Machine::new(data);
        let value = machine.load().unwrap();
        (value, machine.into_heap())
    }

    #[test]
    fn test_integer_opcodes() {
        assert_eq!(load_one(b"I42\n.").0, Value::Int(42));
        assert_eq!(load_one(b"I01\n.").0, Value::Bool(true));
        assert_eq!(load_one(b"K\x05.").0, Value::Int(5));
        assert_eq!(load_one(b"M\x00\x01.").0, Value::Int(256));
        assert_eq!(load_one(b"J\xff\xff\xff\xff.").0, Value::Int(-1));
        assert_eq!(
            load_one(b"L1180591620717411303424L\n.").0,
            Value::BigInt("1180591620717411303424".to_string())
        );
        assert_eq!(
            load_one(b"\x8a\x09\x00\x00\x00\x00\x00\x00\x00\x00\x40.").0,
            Value::BigInt("1180591620717411303424".to_string())
        );
    }

    #[test]
    fn test_float_opcodes() {
        assert_eq!(load_one(b"F1.5\n.").0, Value::Float(1.5));
        assert_eq!(load_one(b"G?\xf8\x00\x00\x00\x00\x00\x00.").0, Value::Float(1.5));
    }

    #[test]
    fn test_string_opcodes() {
        assert_eq!(load_one(b"S'abc'\np0\n.").0, Value::Str("abc".to_string()));
        assert_eq!(load_one(b"U\x02hi.").0, Value::Str("hi".to_string()));
        assert_eq!(load_one(b"U\x02\xff\xfe.").0, Value::Bytes(vec![0xff, 0xfe]));
        assert_eq!(load_one(b"C\x01a.").0, Value::Bytes(b"a".to_vec()));
        assert_eq!(
            load_one(b"X\x03\x00\x00\x00\xc3\xa9!.").0,
            Value::Str("é!".to_string())
        );
        assert_eq!(load_one(b"Vcaf\\u00e9\n.").0, Value::Str("café".to_string()));
    }

    #[test]
    fn test_two_loads_report_prefix_length() {
        let data = b"cfoo\nBar\nq\x00.}q\x01U\x01xK\x01s.";
        let mut machine = Machine::new(data);

        let first = machine.load().unwrap();
        assert_eq!(first, Value::Global(Global::new("foo", "Bar")));
        assert_eq!(machine.position(), 12);

        let second = machine.load().unwrap();
        let Value::Node(id) = second else {
            panic!("expected a dict node, got {second:?}");
        };
        let Node::Dict(map) = machine.heap().node(id) else {
            panic!("expected a dict");
        };
        assert_eq!(map.get("x"), Some(&Value::Int(1)));
        assert_eq!(machine.remaining(), 0);
    }

    #[test]
    fn test_self_referential_list() {
        let (value, heap) = load_one(b"]q\x00h\x00a.");
        let Value::Node(id) = value else {
            panic!("expected a list node");
        };
        assert_eq!(heap.node(id), &Node::List(vec![Value::Node(id)]));
        assert_eq!(heap.shared_key(id), Some(MemoKey::new(0)));
    }

    #[test]
    fn test_duplicate_dict_keys_last_write_wins() {
        let (value, heap) = load_one(b"(U\x01aK\x01U\x01bK\x03U\x01aK\x02d.");
        let Value::Node(id) = value else {
            panic!("expected a dict node");
        };
        let Node::Dict(map) = heap.node(id) else {
            panic!("expected a dict");
        };
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("a"), Some(&Value::Int(2)));
        assert_eq!(map.keys().next().map(String::as_str), Some("a"));
    }

    #[test]
    fn test_mapping_keys_are_coerced() {
        let (value, heap) = load_one(b"}(K\x07U\x01xN\x88\x88U\x01ycfoo\nBar\nK\x00u.");
        let Value::Node(id) = value else {
            panic!("expected a dict node");
        };
        let Node::Dict(map) = heap.node(id) else {
            panic!("expected a dict");
        };
        let keys: Vec<&str> = map.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["7", "null", "true", "foo.Bar"]);
    }

    #[test]
    fn test_datetime_renders_iso() {
        let data = b"cdatetime\ndatetime\n(U\n\x07\xd1\x02\x03\x04\x05\x06\x00\x00\x07tR.";
        assert_eq!(
            load_one(data).0,
            Value::Str("2001-02-03T04:05:06.000007".to_string())
        );

        let data = b"cdatetime\ndate\n(M\xd1\x07K\x02K\x03tR.";
        assert_eq!(load_one(data).0, Value::Str("2001-02-03".to_string()));
    }

    #[test]
    fn test_timezone_aware_datetime_keeps_wall_time() {
        let data = b"cdatetime\ndatetime\n(U\n\x07\xd1\x02\x03\x04\x05\x06\x00\x00\x07cpytz\n_UTC\n)RtR.";
        assert_eq!(
            load_one(data).0,
            Value::Str("2001-02-03T04:05:06.000007".to_string())
        );
    }

    #[test]
    fn test_impossible_dates_are_rejected() {
        let mut machine = Machine::new(b"cdatetime\ndate\n(U\x04\x07\xd1\x02\x1ftR.");
        let err = machine.load().unwrap_err();
        assert!(matches!(err, Error::Malformed { .. }), "{err:?}");

        let mut machine = Machine::new(b"cdatetime\ndate\n(M\xd1\x07K\x02K\x1etR.");
        assert!(machine.load().unwrap_err().is_decode());
    }

    #[test]
    fn test_persistent_references() {
        let (value, _) = load_one(b"U\x08\x00\x00\x00\x00\x00\x00\x00\x01Q.");
        assert_eq!(value, Value::Persistent(PersistentRef::Oid(1)));

        let data = b"(U\x08\x00\x00\x00\x00\x00\x00\x00\x02cpersistent.mapping\nPersistentMapping\ntQ.";
        assert_eq!(
            load_one(data).0,
            Value::Persistent(PersistentRef::Typed {
                oid: 2,
                class_name: "persistent.mapping.PersistentMapping".to_string(),
            })
        );

        let mut machine = Machine::new(b"K\x01Q.");
        assert!(machine.load().unwrap_err().is_decode());
    }

    #[test]
    fn test_build_sets_instance_state() {
        let (value, heap) = load_one(b"cfoo\nBar\n)\x81}U\x01xK\x01sb.");
        let Value::Node(id) = value else {
            panic!("expected an instance node");
        };
        let Node::Instance(instance) = heap.node(id) else {
            panic!("expected an instance");
        };
        assert_eq!(instance.class_name, "foo.Bar");
        assert!(instance.args.is_empty());
        assert!(matches!(instance.state, Some(Value::Node(_))));
    }

    #[test]
    fn test_unknown_opcode() {
        let err = Machine::new(b"K\x01\x95").load().unwrap_err();
        assert!(matches!(
            err,
            Error::UnknownOpcode {
                opcode: 0x95,
                offset: 2
            }
        ));
    }

    #[test]
    fn test_truncated_operand() {
        let err = Machine::new(b"J\x01\x00").load().unwrap_err();
        assert!(matches!(
            err,
            Error::Truncated {
                offset: 1,
                needed: 2
            }
        ));

        let err = Machine::new(b"I12").load().unwrap_err();
        assert!(matches!(err, Error::Truncated { .. }));
    }

    #[test]
    fn test_end_of_input_without_stop() {
        assert_eq!(load_one(b"K\x01").0, Value::Int(1));
        assert!(Machine::new(b"(K\x01").load().is_err());
        assert!(Machine::new(b"").load().is_err());
    }

    #[test]
    fn test_structural_errors() {
        assert!(Machine::new(b"a.").load().unwrap_err().is_decode());
        assert!(Machine::new(b"K\x01t.").load().unwrap_err().is_decode());
        assert!(Machine::new(b"h\x05.").load().unwrap_err().is_decode());
        assert!(Machine::new(b"K\x01K\x02a.").load().unwrap_err().is_decode());
    }

    #[test]
    fn test_pop_and_pop_mark() {
        assert_eq!(load_one(b"K\x01K\x020.").0, Value::Int(1));
        assert_eq!(load_one(b"K\x01(K\x02K\x031.").0, Value::Int(1));
        assert_eq!(load_one(b"K\x01(0.").0, Value::Int(1));
        assert_eq!(
            load_one(b"K\x012\x86.").0,
            Value::Tuple(vec![Value::Int(1), Value::Int(1)])
        );
    }
}
