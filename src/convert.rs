//! # The Record Converter
//!
//! Turns one upstream [`Record`] into a [`ProjectionRow`]:
//!
//! ```text
//!   record.state = [ class descriptor pickle ][ state pickle ]
//!                    └──── prefix_len ─────┘
//!
//!   1. load descriptor      → class name        → skip predicate
//!   2. load state           → canonical JSON    (same memo heap)
//!   3. state transformation → replacement state (optional)
//!   4. surrogate scrub      → stored text
//! ```
//!
//! The descriptor bytes are stored verbatim so readers can rebuild ghost
//! objects from them without re-encoding.

use std::borrow::Cow;
use std::sync::Arc;

use regex::Regex;

use crate::config::UpdaterConfig;
use crate::error::{Error, Result};
use crate::machine::Machine;
use crate::reduce;
use crate::transform::{self, StateTransform, Transformed};
use crate::types::{ProjectionRow, Record};
use crate::value::Value;

// =============================================================================
// Conversion Outcome
// =============================================================================

/// What became of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conversion {
    /// The record produced a row.
    Row(ProjectionRow),
    /// The record's class matched the skip pattern. Not an error.
    Skipped {
        /// The class that was skipped.
        class_name: String,
    },
}

// =============================================================================
// RecordConverter
// =============================================================================

/// Converts records using an optional skip pattern and state hook.
#[derive(Clone, Default)]
pub struct RecordConverter {
    skip: Option<Regex>,
    transform: Option<Arc<dyn StateTransform>>,
}

impl std::fmt::Debug for RecordConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordConverter")
            .field("skip", &self.skip.as_ref().map(Regex::as_str))
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

impl RecordConverter {
    /// A converter that keeps every record and applies no hook.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the converter described by `config`.
    pub fn from_config(config: &UpdaterConfig) -> Result<Self> {
        let transform = config
            .transformation
            .as_deref()
            .map(transform::builtin)
            .transpose()?;
        Ok(Self {
            skip: config.skip_regex()?,
            transform,
        })
    }

    /// Drops records whose class name starts with a match of `pattern`.
    pub fn with_skip_pattern(mut self, pattern: &str) -> Result<Self> {
        self.skip = UpdaterConfig::default()
            .with_skip_classes(Some(pattern))
            .skip_regex()?;
        Ok(self)
    }

    /// Installs a state hook.
    pub fn with_transform(mut self, transform: Arc<dyn StateTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Returns true if records of `class_name` are dropped.
    pub fn is_skipped(&self, class_name: &str) -> bool {
        self.skip
            .as_ref()
            .is_some_and(|skip| skip.is_match(class_name))
    }

    /// Converts one record.
    ///
    /// Decode and hook failures come back as record-level errors (see
    /// [`Error::is_record_level`]); the caller decides whether to log and
    /// continue.
    pub fn convert(&self, record: &Record) -> Result<Conversion> {
        let mut machine = Machine::new(&record.state);

        let descriptor = machine.load()?;
        let prefix_len = machine.position();
        let class_name = class_name_of(&descriptor)?;
        if self.is_skipped(&class_name) {
            return Ok(Conversion::Skipped { class_name });
        }

        let state = machine.load()?;
        let heap = machine.into_heap();
        let canonical = reduce::to_json_text(&state, &heap)?;

        let text = match &self.transform {
            None => canonical,
            Some(hook) => match hook
                .transform(record.zoid, &class_name, &canonical)
                .map_err(|e| Error::Transform {
                    zoid: record.zoid.as_raw(),
                    message: e.to_string(),
                })? {
                Transformed::Unchanged => canonical,
                Transformed::Json(value) => serde_json::to_string(&value)?,
                Transformed::Text(text) => text,
            },
        };

        Ok(Conversion::Row(ProjectionRow {
            zoid: record.zoid,
            class_name,
            class_pickle: record.state[..prefix_len].to_vec(),
            state: scrub_surrogates(&text).into_owned(),
        }))
    }
}

// =============================================================================
// Class Names
// =============================================================================

/// Derives the class name from a stored class descriptor prefix.
///
/// Agrees with the name [`RecordConverter::convert`] stores for the record
/// the prefix came from.
pub fn class_name_from_pickle(prefix: &[u8]) -> Result<String> {
    let mut machine = Machine::new(prefix);
    let descriptor = machine.load()?;
    class_name_of(&descriptor)
}

/// Flattens a class descriptor to a dotted name.
///
/// Accepted forms: a global, `(global, args)`, `((module, name), args)`,
/// a tuple of name parts, or bare text.
fn class_name_of(descriptor: &Value) -> Result<String> {
    fn parts(items: &[Value]) -> Option<String> {
        let names = items
            .iter()
            .map(|item| match item {
                Value::Str(s) => Some(s.as_str()),
                _ => None,
            })
            .collect::<Option<Vec<&str>>>()?;
        (!names.is_empty()).then(|| names.join("."))
    }

    let name = match descriptor {
        Value::Global(global) => Some(global.qualified()),
        Value::Str(name) => Some(name.clone()),
        Value::Tuple(items) => match items.as_slice() {
            [Value::Global(global), _args] => Some(global.qualified()),
            [Value::Tuple(path), _args] => parts(path),
            _ => parts(items),
        },
        _ => None,
    };
    name.ok_or_else(|| {
        Error::malformed(
            0,
            format!("unrecognized class descriptor of kind {}", descriptor.kind()),
        )
    })
}

// =============================================================================
// Surrogate Scrubbing
// =============================================================================

/// Replaces each run of `\uD800`-`\uDFFF` escapes with a single space.
///
/// Only escapes introduced by an unescaped backslash count, so an escaped
/// backslash followed by `ud800` is ordinary text.
pub fn scrub_surrogates(text: &str) -> Cow<'_, str> {
    let bytes = text.as_bytes();
    let mut out: Option<String> = None;
    let mut copied = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'\\' {
            i += 1;
            continue;
        }
        let run_start = i;
        while i < bytes.len() && bytes[i] == b'\\' {
            i += 1;
        }
        if (i - run_start) % 2 == 0 {
            continue;
        }

        let escape = i - 1;
        let mut end = escape;
        while let Some(len) = surrogate_escape_at(bytes, end) {
            end += len;
        }
        if end > escape {
            let buf = out.get_or_insert_with(|| String::with_capacity(text.len()));
            buf.push_str(&text[copied..escape]);
            buf.push(' ');
            copied = end;
            i = end;
        }
    }

    match out {
        None => Cow::Borrowed(text),
        Some(mut buf) => {
            buf.push_str(&text[copied..]);
            Cow::Owned(buf)
        }
    }
}

/// Length of a `\uDxxx` surrogate escape starting at `at`, if there is one.
fn surrogate_escape_at(bytes: &[u8], at: usize) -> Option<usize> {
    let escape = bytes.get(at..at + 6)?;
    if escape[0] != b'\\' || !matches!(escape[1], b'u' | b'U') {
        return None;
    }
    let digits = &escape[2..];
    if !digits.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    let code = u32::from_str_radix(std::str::from_utf8(digits).ok()?, 16).ok()?;
    (0xd800..=0xdfff).contains(&code).then_some(6)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::HookError;
    use crate::types::{ObjectId, Version};

    const DESCRIPTOR: &[u8] = b"cfoo\nBar\nq\x01.";
    const STATE: &[u8] = b"}q\x02(U\x01xK\x01U\x01yU\x03abcu.";

    fn record(descriptor: &[u8], state: &[u8]) -> Record {
        let mut bytes = descriptor.to_vec();
        bytes.extend_from_slice(state);
        Record::new(Version::from_raw(5), ObjectId::from_raw(9), bytes)
    }

    #[test]
    fn test_convert_basic_record() {
        let conversion = RecordConverter::new().convert(&record(DESCRIPTOR, STATE)).unwrap();
        let Conversion::Row(row) = conversion else {
            panic!("expected a row");
        };
        assert_eq!(row.zoid, ObjectId::from_raw(9));
        assert_eq!(row.class_name, "foo.Bar");
        assert_eq!(row.class_pickle, DESCRIPTOR);
        assert_eq!(row.state, r#"{"x":1,"y":"abc"}"#);
    }

    #[test]
    fn test_class_pickle_prefix_decodes_to_same_name() {
        let descriptor = b"(cpersistent.mapping\nPersistentMapping\nq\x01Ntq\x02.";
        let Conversion::Row(row) = RecordConverter::new()
            .convert(&record(descriptor, STATE))
            .unwrap()
        else {
            panic!("expected a row");
        };
        assert_eq!(row.class_name, "persistent.mapping.PersistentMapping");
        assert_eq!(class_name_from_pickle(&row.class_pickle).unwrap(), row.class_name);
    }

    #[test]
    fn test_nested_name_descriptor() {
        let descriptor = b"((U\x03pkgU\x03Modt)t.";
        assert_eq!(class_name_from_pickle(descriptor).unwrap(), "pkg.Mod");
        assert!(class_name_from_pickle(b"K\x01.").unwrap_err().is_decode());
    }

    #[test]
    fn test_skip_pattern() {
        let converter = RecordConverter::new()
            .with_skip_pattern("BTrees[.]|ZODB.blob")
            .unwrap();
        let skipped = converter
            .convert(&record(b"cBTrees.OOBTree\nOOBucket\n.", b"garbage"))
            .unwrap();
        assert_eq!(
            skipped,
            Conversion::Skipped {
                class_name: "BTrees.OOBTree.OOBucket".to_string()
            }
        );
        assert!(!converter.is_skipped("foo.Bar"));
    }

    #[test]
    fn test_decode_failure_is_record_level() {
        let err = RecordConverter::new()
            .convert(&record(DESCRIPTOR, b"\x95"))
            .unwrap_err();
        assert!(err.is_record_level());
    }

    #[test]
    fn test_transform_replaces_state() {
        let hook = |_: ObjectId, _: &str, state: &str| -> std::result::Result<Transformed, HookError> {
            let mut value: serde_json::Value = serde_json::from_str(state)?;
            value["seen"] = serde_json::Value::Bool(true);
            Ok(Transformed::Json(value))
        };
        let converter = RecordConverter::new().with_transform(Arc::new(hook));
        let Conversion::Row(row) = converter.convert(&record(DESCRIPTOR, STATE)).unwrap() else {
            panic!("expected a row");
        };
        assert_eq!(row.state, r#"{"x":1,"y":"abc","seen":true}"#);
    }

    #[test]
    fn test_transform_failure_is_record_level() {
        let hook = |_: ObjectId, _: &str, _: &str| -> std::result::Result<Transformed, HookError> {
            Err("boom".into())
        };
        let converter = RecordConverter::new().with_transform(Arc::new(hook));
        let err = converter.convert(&record(DESCRIPTOR, STATE)).unwrap_err();
        assert!(matches!(err, Error::Transform { zoid: 9, .. }));
    }

    #[test]
    fn test_transform_text_is_scrubbed() {
        let hook = |_: ObjectId, _: &str, _: &str| -> std::result::Result<Transformed, HookError> {
            Ok(Transformed::Text(r#"{"t":"a\ud800\udfffb"}"#.to_string()))
        };
        let converter = RecordConverter::new().with_transform(Arc::new(hook));
        let Conversion::Row(row) = converter.convert(&record(DESCRIPTOR, STATE)).unwrap() else {
            panic!("expected a row");
        };
        assert_eq!(row.state, r#"{"t":"a b"}"#);
    }

    #[test]
    fn test_scrub_surrogates() {
        assert_eq!(scrub_surrogates(r#""x\ud83dy""#), r#""x y""#);
        assert_eq!(scrub_surrogates(r#""\uDC00\ud800""#), r#"" ""#);
        assert_eq!(scrub_surrogates(r#""\u00e9""#), r#""\u00e9""#);
        // An escaped backslash is not an escape.
        assert_eq!(scrub_surrogates(r#""\\ud800""#), r#""\\ud800""#);
        assert_eq!(scrub_surrogates(r#""\\\ud800""#), r#""\\ ""#);
        assert!(matches!(scrub_surrogates("plain"), Cow::Borrowed(_)));
    }
}
