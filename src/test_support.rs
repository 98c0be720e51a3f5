//! Builders for pickle streams and log records, shared by unit and
//! integration tests.
//!
//! Not part of the stable API.

use crate::opcode::Opcode;
use crate::types::{ObjectId, Record, Version};

/// Writes a pickle opcode by opcode.
///
/// ```rust
/// use picklejson::test_support::PickleWriter;
///
/// let bytes = PickleWriter::new().empty_dict().text("a").int(1).set_item().finish();
/// assert_eq!(bytes.last(), Some(&b'.'));
/// ```
#[derive(Debug, Default, Clone)]
pub struct PickleWriter {
    buf: Vec<u8>,
}

impl PickleWriter {
    /// A protocol 2 stream.
    pub fn new() -> Self {
        Self::default().proto(2)
    }

    /// A stream with no PROTO header.
    pub fn bare() -> Self {
        Self::default()
    }

    fn op(mut self, op: Opcode) -> Self {
        self.buf.push(op.byte());
        self
    }

    pub fn proto(mut self, version: u8) -> Self {
        self.buf.extend([Opcode::Proto.byte(), version]);
        self
    }

    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn mark(self) -> Self {
        self.op(Opcode::Mark)
    }

    pub fn none(self) -> Self {
        self.op(Opcode::None)
    }

    pub fn bool(self, value: bool) -> Self {
        self.op(if value { Opcode::NewTrue } else { Opcode::NewFalse })
    }

    /// The shortest integer opcode that holds `value`.
    pub fn int(mut self, value: i64) -> Self {
        if (0..=0xff).contains(&value) {
            self.buf.extend([Opcode::BinInt1.byte(), value as u8]);
        } else if (0..=0xffff).contains(&value) {
            self.buf.push(Opcode::BinInt2.byte());
            self.buf.extend((value as u16).to_le_bytes());
        } else if i32::try_from(value).is_ok() {
            self.buf.push(Opcode::BinInt.byte());
            self.buf.extend((value as i32).to_le_bytes());
        } else {
            self.buf.extend([Opcode::Long1.byte(), 8]);
            self.buf.extend(value.to_le_bytes());
        }
        self
    }

    pub fn float(mut self, value: f64) -> Self {
        self.buf.push(Opcode::BinFloat.byte());
        self.buf.extend(value.to_be_bytes());
        self
    }

    /// A BINUNICODE string.
    pub fn text(mut self, value: &str) -> Self {
        self.buf.push(Opcode::BinUnicode.byte());
        self.buf.extend((value.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    /// A SHORT_BINSTRING byte string (at most 255 bytes).
    pub fn short_string(mut self, value: &[u8]) -> Self {
        self.buf.extend([Opcode::ShortBinString.byte(), value.len() as u8]);
        self.buf.extend_from_slice(value);
        self
    }

    /// A SHORT_BINBYTES value (at most 255 bytes).
    pub fn bytes(mut self, value: &[u8]) -> Self {
        self.buf.extend([Opcode::ShortBinBytes.byte(), value.len() as u8]);
        self.buf.extend_from_slice(value);
        self
    }

    pub fn global(mut self, module: &str, name: &str) -> Self {
        self.buf.push(Opcode::Global.byte());
        self.buf.extend_from_slice(module.as_bytes());
        self.buf.push(b'\n');
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.push(b'\n');
        self
    }

    /// A persistent reference to `oid` via BINPERSID.
    pub fn persistent(self, oid: u64) -> Self {
        self.short_string(&oid.to_be_bytes()).op(Opcode::BinPersId)
    }

    pub fn empty_dict(self) -> Self {
        self.op(Opcode::EmptyDict)
    }

    pub fn empty_list(self) -> Self {
        self.op(Opcode::EmptyList)
    }

    pub fn empty_tuple(self) -> Self {
        self.op(Opcode::EmptyTuple)
    }

    pub fn set_item(self) -> Self {
        self.op(Opcode::SetItem)
    }

    pub fn set_items(self) -> Self {
        self.op(Opcode::SetItems)
    }

    pub fn append(self) -> Self {
        self.op(Opcode::Append)
    }

    pub fn appends(self) -> Self {
        self.op(Opcode::Appends)
    }

    pub fn tuple(self) -> Self {
        self.op(Opcode::Tuple)
    }

    pub fn tuple2(self) -> Self {
        self.op(Opcode::Tuple2)
    }

    pub fn reduce(self) -> Self {
        self.op(Opcode::Reduce)
    }

    pub fn build(self) -> Self {
        self.op(Opcode::Build)
    }

    pub fn put(mut self, key: u8) -> Self {
        self.buf.extend([Opcode::BinPut.byte(), key]);
        self
    }

    pub fn get(mut self, key: u8) -> Self {
        self.buf.extend([Opcode::BinGet.byte(), key]);
        self
    }

    pub fn stop(self) -> Self {
        self.op(Opcode::Stop)
    }

    /// Terminates the stream with STOP and returns its bytes.
    pub fn finish(self) -> Vec<u8> {
        self.stop().buf
    }
}

/// The class descriptor ZODB writes: `((module, name), None)`.
pub fn class_pickle(module: &str, name: &str) -> Vec<u8> {
    PickleWriter::new()
        .global(module, name)
        .none()
        .tuple2()
        .finish()
}

/// A state pickle of a flat mapping from text keys to integers.
pub fn int_map_pickle(pairs: &[(&str, i64)]) -> Vec<u8> {
    let mut writer = PickleWriter::new().empty_dict();
    if !pairs.is_empty() {
        writer = writer.mark();
        for (key, value) in pairs {
            writer = writer.text(key).int(*value);
        }
        writer = writer.set_items();
    }
    writer.finish()
}

/// A record body: a class descriptor followed by `state`.
pub fn record_body(module: &str, name: &str, state: &[u8]) -> Vec<u8> {
    let mut body = class_pickle(module, name);
    body.extend_from_slice(state);
    body
}

/// A record of class `module.name` whose state is `{"n": zoid}`.
pub fn simple_record(version: i64, zoid: i64, module: &str, name: &str) -> Record {
    Record::new(
        Version::from_raw(version),
        ObjectId::from_raw(zoid),
        record_body(module, name, &int_map_pickle(&[("n", zoid)])),
    )
}

/// `count` records spread over versions of `per_version` records each,
/// starting at version 1 and object id 1.
pub fn grouped_records(count: usize, per_version: usize) -> Vec<Record> {
    (0..count)
        .map(|i| {
            let version = (i / per_version) as i64 + 1;
            simple_record(version, i as i64 + 1, "app.models", "Thing")
        })
        .collect()
}
