//! State transformation hooks.
//!
//! A hook sees every converted record before it is stored and may replace
//! its canonical state. Hooks are trusted code: a failing hook fails only
//! the record it was called for, and is never retried.
//!
//! Any `Fn(ObjectId, &str, &str) -> Result<Transformed, HookError>` closure
//! is a hook. The `json-updater` binary selects hooks by name through
//! [`builtin`].

use std::borrow::Cow;
use std::io::Read;
use std::sync::Arc;

use encoding_rs::{Encoding, UTF_16BE, UTF_16LE};
use flate2::read::ZlibDecoder;
use serde_json::{json, Value as Json};

use crate::error::{Error, Result};
use crate::types::ObjectId;

/// Error type returned by hooks.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// The outcome of a hook call.
#[derive(Debug, Clone, PartialEq)]
pub enum Transformed {
    /// Keep the canonical text as it is.
    Unchanged,
    /// Replace the state with this value; it is re-serialized.
    Json(Json),
    /// Replace the state with this text verbatim.
    Text(String),
}

/// A state transformation applied to each converted record.
pub trait StateTransform: Send + Sync {
    /// Transforms the canonical JSON `state` of object `zoid`.
    fn transform(
        &self,
        zoid: ObjectId,
        class_name: &str,
        state: &str,
    ) -> std::result::Result<Transformed, HookError>;
}

impl<F> StateTransform for F
where
    F: Fn(ObjectId, &str, &str) -> std::result::Result<Transformed, HookError> + Send + Sync,
{
    fn transform(
        &self,
        zoid: ObjectId,
        class_name: &str,
        state: &str,
    ) -> std::result::Result<Transformed, HookError> {
        self(zoid, class_name, state)
    }
}

// =============================================================================
// Built-in Hooks
// =============================================================================

/// Name of the [`CachedDataTransform`] hook.
pub const CACHED_DATA: &str = "cached-data";

/// Names accepted by [`builtin`].
pub const BUILTIN_NAMES: &[&str] = &[CACHED_DATA];

/// Looks up a built-in hook by name.
pub fn builtin(name: &str) -> Result<Arc<dyn StateTransform>> {
    match name {
        CACHED_DATA => Ok(Arc::new(CachedDataTransform)),
        other => Err(Error::Config(format!(
            "unknown transformation {other:?} (known: {})",
            BUILTIN_NAMES.join(", ")
        ))),
    }
}

/// Replaces cached document blobs with their extracted text.
///
/// Objects of [`CachedDataTransform::CLASS`] hold zlib-compressed text in
/// `data` and its character set in `encoding`. The stored state becomes
/// `{"text": ...}` with NUL characters removed. Text that does not decode
/// with the recorded encoding is stored as an empty string.
#[derive(Debug, Clone, Copy, Default)]
pub struct CachedDataTransform;

impl CachedDataTransform {
    /// The class this hook rewrites.
    pub const CLASS: &'static str = "karl.content.models.adapters._CachedData";
}

impl StateTransform for CachedDataTransform {
    fn transform(
        &self,
        _zoid: ObjectId,
        class_name: &str,
        state: &str,
    ) -> std::result::Result<Transformed, HookError> {
        if class_name != Self::CLASS {
            return Ok(Transformed::Unchanged);
        }

        let state: Json = serde_json::from_str(state)?;
        let compressed = match state.get("data") {
            Some(Json::String(raw)) => raw.as_bytes().to_vec(),
            Some(data) => {
                let hex_text = data
                    .get("hex")
                    .and_then(Json::as_str)
                    .ok_or("cached data has no hex payload")?;
                hex::decode(hex_text)?
            }
            None => return Err("cached data has no data attribute".into()),
        };

        let mut raw = Vec::new();
        ZlibDecoder::new(compressed.as_slice()).read_to_end(&mut raw)?;

        let encoding = state
            .get("encoding")
            .and_then(Json::as_str)
            .unwrap_or("ascii");
        let text = decode_text(&raw, encoding)
            .map(|text| text.replace('\0', ""))
            .unwrap_or_default();

        Ok(Transformed::Json(json!({ "text": text })))
    }
}

/// Decodes `raw` with the encoding named by a Python codec label.
///
/// `ascii` and `latin-1` keep their strict Python meaning; every other
/// label resolves through the WHATWG registry. Returns `None` for an
/// unknown label or bytes that are invalid in the encoding.
fn decode_text(raw: &[u8], label: &str) -> Option<String> {
    let label = label.trim().to_ascii_lowercase().replace('_', "-");
    match label.as_str() {
        "ascii" | "us-ascii" | "646" => {
            return raw.is_ascii().then(|| raw.iter().map(|&b| char::from(b)).collect())
        }
        "latin-1" | "latin1" | "iso-8859-1" | "iso8859-1" | "l1" => {
            return Some(raw.iter().map(|&b| char::from(b)).collect())
        }
        _ => {}
    }

    // Python spells the byte-order variants `utf_16_le`.
    let label = label.replace("utf-16-le", "utf-16le").replace("utf-16-be", "utf-16be");
    let mut encoding = Encoding::for_label(label.as_bytes())?;
    let mut body = raw;
    // Plain `utf-16` reads its byte order from the BOM.
    if label == "utf-16" {
        if let Some((sniffed, bom_len)) = Encoding::for_bom(raw) {
            if sniffed == UTF_16LE || sniffed == UTF_16BE {
                encoding = sniffed;
                body = &raw[bom_len..];
            }
        }
    }
    encoding
        .decode_without_bom_handling_and_without_replacement(body)
        .map(Cow::into_owned)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    use super::*;

    fn compress(data: &[u8]) -> String {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        hex::encode(encoder.finish().unwrap())
    }

    fn cached_state(payload: &[u8], encoding: Option<&str>) -> String {
        let mut state = json!({ "data": { "::": "hex", "hex": compress(payload) } });
        if let Some(encoding) = encoding {
            state["encoding"] = json!(encoding);
        }
        state.to_string()
    }

    #[test]
    fn test_cached_data_extracts_text() {
        let state = cached_state("caf\u{e9}\0!".as_bytes(), Some("utf-8"));
        let out = CachedDataTransform
            .transform(ObjectId::from_raw(1), CachedDataTransform::CLASS, &state)
            .unwrap();
        assert_eq!(out, Transformed::Json(json!({ "text": "café!" })));
    }

    #[test]
    fn test_cached_data_bad_encoding_yields_empty_text() {
        let state = cached_state(b"\xff\xfe", None);
        let out = CachedDataTransform
            .transform(ObjectId::from_raw(1), CachedDataTransform::CLASS, &state)
            .unwrap();
        assert_eq!(out, Transformed::Json(json!({ "text": "" })));
    }

    #[test]
    fn test_cached_data_regional_encodings() {
        let state = cached_state(b"caf\xe9 \x93quoted\x94", Some("cp1252"));
        let out = CachedDataTransform
            .transform(ObjectId::from_raw(1), CachedDataTransform::CLASS, &state)
            .unwrap();
        assert_eq!(
            out,
            Transformed::Json(json!({ "text": "caf\u{e9} \u{201c}quoted\u{201d}" }))
        );

        let state = cached_state(b"\xfe\xff\x00h\x00i", Some("utf_16"));
        let out = CachedDataTransform
            .transform(ObjectId::from_raw(1), CachedDataTransform::CLASS, &state)
            .unwrap();
        assert_eq!(out, Transformed::Json(json!({ "text": "hi" })));
    }

    #[test]
    fn test_decode_text_labels() {
        assert_eq!(decode_text(b"\x80", "latin_1").as_deref(), Some("\u{80}"));
        assert_eq!(decode_text(b"\x80", "cp1252").as_deref(), Some("\u{20ac}"));
        assert_eq!(decode_text(b"h\x00i\x00", "utf-16-le").as_deref(), Some("hi"));
        assert_eq!(decode_text(b"\xff\xfeh\x00", "UTF-16").as_deref(), Some("h"));
        assert_eq!(decode_text("\u{e9}".as_bytes(), "UTF8").as_deref(), Some("\u{e9}"));
        assert!(decode_text(b"\xe9", "utf-8").is_none());
        assert!(decode_text(b"\x80", "ascii").is_none());
        assert!(decode_text(b"abc", "klingon").is_none());
    }

    #[test]
    fn test_cached_data_ignores_other_classes() {
        let out = CachedDataTransform
            .transform(ObjectId::from_raw(1), "foo.Bar", "{}")
            .unwrap();
        assert_eq!(out, Transformed::Unchanged);
    }

    #[test]
    fn test_cached_data_without_payload_fails() {
        let result =
            CachedDataTransform.transform(ObjectId::from_raw(1), CachedDataTransform::CLASS, "{}");
        assert!(result.is_err());
    }

    #[test]
    fn test_closures_are_hooks() {
        let hook = |zoid: ObjectId, class_name: &str, _state: &str| -> std::result::Result<Transformed, HookError> {
            Ok(Transformed::Text(format!("{class_name}#{zoid}")))
        };
        let hook: Arc<dyn StateTransform> = Arc::new(hook);
        assert_eq!(
            hook.transform(ObjectId::from_raw(3), "a.B", "{}").unwrap(),
            Transformed::Text("a.B#3".to_string())
        );
    }

    #[test]
    fn test_builtin_lookup() {
        assert!(builtin(CACHED_DATA).is_ok());
        assert!(matches!(builtin("nope"), Err(Error::Config(_))));
    }
}
