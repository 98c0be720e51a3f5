//! Operand decoders for the textual and packed literals inside a pickle.
//!
//! These are pure byte-to-value functions. They report failures as a plain
//! reason string; the stack machine attaches the stream offset.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use crate::value::Value;

// =============================================================================
// Integers
// =============================================================================

/// Parses decimal integer text (INT and LONG operands).
///
/// Accepts an optional sign, surrounding whitespace and a trailing `L`.
/// Magnitudes beyond 64 bits become [`Value::BigInt`].
pub fn parse_int_text(raw: &[u8]) -> Option<Value> {
    let text = std::str::from_utf8(raw).ok()?.trim();
    let text = text
        .strip_suffix('L')
        .or_else(|| text.strip_suffix('l'))
        .unwrap_or(text);

    let (negative, digits) = match text.as_bytes().first()? {
        b'-' => (true, &text[1..]),
        b'+' => (false, &text[1..]),
        _ => (false, text),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let signed = if negative {
        format!("-{digits}")
    } else {
        digits.to_string()
    };
    match signed.parse::<i64>() {
        Ok(v) => Some(Value::Int(v)),
        // Digits were validated, so the only failure left is overflow.
        Err(_) => Some(Value::BigInt(normalize_decimal(negative, digits))),
    }
}

fn normalize_decimal(negative: bool, digits: &str) -> String {
    let trimmed = digits.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else if negative {
        format!("-{trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// Decodes a little-endian two's-complement integer (LONG1 and LONG4).
pub fn decode_long_le(bytes: &[u8]) -> Value {
    let Some(&last) = bytes.last() else {
        return Value::Int(0);
    };
    let negative = last & 0x80 != 0;

    if bytes.len() <= 16 {
        let mut buf = if negative { [0xffu8; 16] } else { [0u8; 16] };
        buf[..bytes.len()].copy_from_slice(bytes);
        let wide = i128::from_le_bytes(buf);
        return match i64::try_from(wide) {
            Ok(v) => Value::Int(v),
            Err(_) => Value::BigInt(wide.to_string()),
        };
    }

    let mut magnitude = bytes.to_vec();
    if negative {
        let mut carry = true;
        for byte in magnitude.iter_mut() {
            *byte = !*byte;
            if carry {
                let (sum, overflow) = byte.overflowing_add(1);
                *byte = sum;
                carry = overflow;
            }
        }
    }

    let digits = le_magnitude_to_decimal(&magnitude);
    Value::BigInt(normalize_decimal(negative, &digits))
}

/// Converts an unsigned little-endian magnitude to decimal text.
fn le_magnitude_to_decimal(bytes: &[u8]) -> String {
    const BASE: u64 = 1_000_000_000;

    // Little-endian limbs in base 10^9.
    let mut limbs: Vec<u32> = vec![0];
    for &byte in bytes.iter().rev() {
        let mut carry = u64::from(byte);
        for limb in limbs.iter_mut() {
            let v = u64::from(*limb) * 256 + carry;
            *limb = (v % BASE) as u32;
            carry = v / BASE;
        }
        while carry > 0 {
            limbs.push((carry % BASE) as u32);
            carry /= BASE;
        }
    }

    let mut out = String::new();
    let mut iter = limbs.iter().rev();
    if let Some(first) = iter.next() {
        out.push_str(&first.to_string());
    }
    for limb in iter {
        out.push_str(&format!("{limb:09}"));
    }
    out
}

// =============================================================================
// Floats
// =============================================================================

/// Parses FLOAT operand text (`1.5`, `1e100`, `inf`, `nan`).
pub fn parse_float_text(raw: &[u8]) -> Option<f64> {
    std::str::from_utf8(raw).ok()?.trim().parse::<f64>().ok()
}

// =============================================================================
// Byte Strings
// =============================================================================

/// Decodes a quoted byte-string literal as written by `repr()` (STRING).
pub fn decode_repr_string(line: &[u8]) -> Result<Vec<u8>, String> {
    let body = match line {
        [first @ (b'\'' | b'"'), body @ .., last] if first == last => body,
        _ => return Err("string literal is not quoted".to_string()),
    };

    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        let b = body[i];
        i += 1;
        if b != b'\\' {
            out.push(b);
            continue;
        }

        let Some(&esc) = body.get(i) else {
            return Err("trailing backslash in string literal".to_string());
        };
        i += 1;
        match esc {
            b'\\' | b'\'' | b'"' => out.push(esc),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'v' => out.push(0x0b),
            b'\n' => {}
            b'x' => {
                let hex = body
                    .get(i..i + 2)
                    .ok_or_else(|| "truncated \\x escape".to_string())?;
                out.push(parse_hex(hex).ok_or_else(|| "invalid \\x escape".to_string())? as u8);
                i += 2;
            }
            b'0'..=b'7' => {
                let mut value = u32::from(esc - b'0');
                let mut taken = 1;
                while taken < 3 {
                    match body.get(i) {
                        Some(&d @ b'0'..=b'7') => {
                            value = value * 8 + u32::from(d - b'0');
                            i += 1;
                            taken += 1;
                        }
                        _ => break,
                    }
                }
                out.push((value & 0xff) as u8);
            }
            other => {
                // Unknown escapes are kept verbatim.
                out.push(b'\\');
                out.push(other);
            }
        }
    }
    Ok(out)
}

fn parse_hex(digits: &[u8]) -> Option<u32> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    let text = std::str::from_utf8(digits).ok()?;
    u32::from_str_radix(text, 16).ok()
}

// =============================================================================
// Text
// =============================================================================

/// Decodes a `raw-unicode-escape` line (UNICODE).
///
/// Bytes map to Latin-1 code points; `\uXXXX` and `\UXXXXXXXX` are escapes
/// only when preceded by an odd run of backslashes.
pub fn decode_raw_unicode_escape(bytes: &[u8]) -> Result<String, String> {
    let mut units: Vec<u32> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            units.push(u32::from(bytes[i]));
            i += 1;
            continue;
        }

        let start = i;
        while i < bytes.len() && bytes[i] == b'\\' {
            i += 1;
        }
        let run = i - start;
        let escape = run % 2 == 1 && matches!(bytes.get(i), Some(b'u' | b'U'));
        let literal = if escape { run - 1 } else { run };
        units.extend(std::iter::repeat(u32::from(b'\\')).take(literal));

        if escape {
            let width = if bytes[i] == b'u' { 4 } else { 8 };
            let hex = bytes
                .get(i + 1..i + 1 + width)
                .ok_or_else(|| "truncated unicode escape".to_string())?;
            let cp = parse_hex(hex).ok_or_else(|| "invalid unicode escape".to_string())?;
            if cp > 0x10_FFFF {
                return Err(format!("code point {cp:#x} out of range"));
            }
            units.push(cp);
            i += 1 + width;
        }
    }
    Ok(from_code_points(&units))
}

/// Decodes UTF-8 that may contain encoded surrogates (BINUNICODE).
///
/// Legacy writers encoded surrogate halves directly as three-byte
/// sequences. Those are accepted and then paired or blanked like any
/// other surrogate.
pub fn decode_utf8_lenient(bytes: &[u8]) -> Result<String, String> {
    if let Ok(s) = std::str::from_utf8(bytes) {
        return Ok(s.to_owned());
    }

    let mut units: Vec<u32> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let lead = bytes[i];
        let (len, initial, min) = match lead {
            0x00..=0x7f => (1, u32::from(lead), 0),
            0xc2..=0xdf => (2, u32::from(lead & 0x1f), 0x80),
            0xe0..=0xef => (3, u32::from(lead & 0x0f), 0x800),
            0xf0..=0xf4 => (4, u32::from(lead & 0x07), 0x1_0000),
            _ => return Err(format!("invalid utf-8 lead byte {lead:#04x} at {i}")),
        };
        let tail = bytes
            .get(i + 1..i + len)
            .ok_or_else(|| "truncated utf-8 sequence".to_string())?;

        let mut cp = initial;
        for &b in tail {
            if b & 0xc0 != 0x80 {
                return Err(format!("invalid utf-8 continuation byte {b:#04x}"));
            }
            cp = (cp << 6) | u32::from(b & 0x3f);
        }
        if cp < min || cp > 0x10_FFFF {
            return Err(format!("invalid utf-8 sequence at {i}"));
        }
        units.push(cp);
        i += len;
    }
    Ok(from_code_points(&units))
}

/// Builds a string from code points, combining surrogate pairs.
///
/// Each run of unpaired surrogates becomes one space: such text already
/// went through a lossy encoding and cannot be stored as UTF-8.
pub fn from_code_points(units: &[u32]) -> String {
    let mut out = String::with_capacity(units.len());
    let mut iter = units.iter().copied().peekable();
    let mut in_lone_run = false;

    while let Some(unit) = iter.next() {
        let decoded = match unit {
            0xd800..=0xdbff => match iter.peek() {
                Some(&low @ 0xdc00..=0xdfff) => {
                    iter.next();
                    char::from_u32(0x1_0000 + ((unit - 0xd800) << 10) + (low - 0xdc00))
                }
                _ => None,
            },
            0xdc00..=0xdfff => None,
            _ => char::from_u32(unit),
        };

        match decoded {
            Some(c) => {
                out.push(c);
                in_lone_run = false;
            }
            None => {
                if !in_lone_run {
                    out.push(' ');
                }
                in_lone_run = true;
            }
        }
    }
    out
}

// =============================================================================
// Dates
// =============================================================================

/// Unpacks the 4-byte `datetime.date` state.
pub fn date_from_state(state: &[u8]) -> Option<NaiveDate> {
    match state {
        [y_hi, y_lo, month, day] => calendar_date(
            i32::from(*y_hi) << 8 | i32::from(*y_lo),
            u32::from(*month),
            u32::from(*day),
        ),
        _ => None,
    }
}

/// Unpacks the 10-byte `datetime.datetime` state.
///
/// Anything pickled after the state (a tzinfo, the fold flag) does not
/// change the wall-clock time and is not read here.
pub fn datetime_from_state(state: &[u8]) -> Option<NaiveDateTime> {
    match state {
        [y_hi, y_lo, month, day, hour, minute, second, us0, us1, us2] => {
            // The high bit of the month byte carries the `fold` flag.
            let date = calendar_date(
                i32::from(*y_hi) << 8 | i32::from(*y_lo),
                u32::from(*month & 0x7f),
                u32::from(*day),
            )?;
            let micros = u32::from(*us0) << 16 | u32::from(*us1) << 8 | u32::from(*us2);
            clock_time(u32::from(*hour), u32::from(*minute), u32::from(*second), micros)
                .map(|time| date.and_time(time))
        }
        _ => None,
    }
}

/// Builds a date from `(year, month, day)` constructor arguments.
pub fn date_from_components(components: &[i64]) -> Option<NaiveDate> {
    match components {
        [year, month, day] => calendar_date(
            i32::try_from(*year).ok()?,
            u32::try_from(*month).ok()?,
            u32::try_from(*day).ok()?,
        ),
        _ => None,
    }
}

/// Builds a datetime from
/// `(year, month, day[, hour[, minute[, second[, microsecond]]]])`.
pub fn datetime_from_components(components: &[i64]) -> Option<NaiveDateTime> {
    if components.len() > 7 {
        return None;
    }
    let date = date_from_components(components.get(..3)?)?;
    let field = |i: usize| -> Option<u32> {
        components.get(i).map_or(Some(0), |v| u32::try_from(*v).ok())
    };
    let time = clock_time(field(3)?, field(4)?, field(5)?, field(6)?)?;
    Some(date.and_time(time))
}

fn calendar_date(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    if !(1..=9999).contains(&year) {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, day)
}

fn clock_time(hour: u32, minute: u32, second: u32, micros: u32) -> Option<NaiveTime> {
    // chrono reads second 59 with micros >= 1_000_000 as a leap second.
    if micros >= 1_000_000 {
        return None;
    }
    NaiveTime::from_hms_micro_opt(hour, minute, second, micros)
}

/// `YYYY-MM-DD`.
pub fn iso_date(date: &NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// `YYYY-MM-DDTHH:MM:SS`, with `.ffffff` when microseconds are set.
pub fn iso_datetime(datetime: &NaiveDateTime) -> String {
    if datetime.nanosecond() == 0 {
        datetime.format("%Y-%m-%dT%H:%M:%S").to_string()
    } else {
        datetime.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_int_text() {
        assert_eq!(parse_int_text(b"123"), Some(Value::Int(123)));
        assert_eq!(parse_int_text(b"-7"), Some(Value::Int(-7)));
        assert_eq!(parse_int_text(b"42L"), Some(Value::Int(42)));
        assert_eq!(
            parse_int_text(b"1180591620717411303424L"),
            Some(Value::BigInt("1180591620717411303424".to_string()))
        );
        assert_eq!(
            parse_int_text(b"-00099999999999999999999"),
            Some(Value::BigInt("-99999999999999999999".to_string()))
        );
        assert_eq!(parse_int_text(b"12a"), None);
        assert_eq!(parse_int_text(b""), None);
    }

    #[test]
    fn test_decode_long_le() {
        assert_eq!(decode_long_le(&[]), Value::Int(0));
        assert_eq!(decode_long_le(&[0xff]), Value::Int(-1));
        assert_eq!(decode_long_le(&[0x00, 0x01]), Value::Int(256));
        // 2**70, as LONG1 writes it.
        let mut bytes = vec![0u8; 9];
        bytes[8] = 0x40;
        assert_eq!(
            decode_long_le(&bytes),
            Value::BigInt("1180591620717411303424".to_string())
        );
    }

    #[test]
    fn test_decode_long_le_wide_negative() {
        // -(2**160) over 21 bytes.
        let mut bytes = vec![0u8; 21];
        bytes[20] = 0xff;
        assert_eq!(
            decode_long_le(&bytes),
            Value::BigInt("-1461501637330902918203684832716283019655932542976".to_string())
        );
    }

    #[test]
    fn test_repr_string() {
        assert_eq!(decode_repr_string(b"'abc'").unwrap(), b"abc");
        assert_eq!(decode_repr_string(b"\"it's\"").unwrap(), b"it's");
        assert_eq!(decode_repr_string(br"'a\nb\x41\101\\'").unwrap(), b"a\nbAA\\");
        assert_eq!(decode_repr_string(br"'\xff'").unwrap(), vec![0xff]);
        assert!(decode_repr_string(b"abc").is_err());
        assert!(decode_repr_string(b"'abc\"").is_err());
    }

    #[test]
    fn test_raw_unicode_escape() {
        assert_eq!(decode_raw_unicode_escape(b"caf\xe9").unwrap(), "café");
        // Even backslash runs are literal.
        assert_eq!(decode_raw_unicode_escape(br"a\\u0041").unwrap(), r"a\\u0041");
        assert_eq!(decode_raw_unicode_escape(br"\U0001F600").unwrap(), "😀");
        assert!(decode_raw_unicode_escape(br"\u00").is_err());
    }

    #[test]
    fn test_surrogates() {
        // A valid pair combines.
        assert_eq!(decode_raw_unicode_escape(br"\ud83d\ude00").unwrap(), "😀");
        // A run of lone halves becomes a single space.
        assert_eq!(decode_raw_unicode_escape(br"a\ud800\ud801b").unwrap(), "a b");
        // CESU-style encoded surrogates in UTF-8.
        assert_eq!(decode_utf8_lenient(b"x\xed\xa0\x80y").unwrap(), "x y");
        assert_eq!(
            decode_utf8_lenient(b"\xed\xa0\xbd\xed\xb8\x80").unwrap(),
            "😀"
        );
        assert!(decode_utf8_lenient(b"\xff").is_err());
    }

    #[test]
    fn test_date_states() {
        let dt = datetime_from_state(&[0x07, 0xd1, 2, 3, 4, 5, 6, 0, 0, 7]).unwrap();
        assert_eq!(iso_datetime(&dt), "2001-02-03T04:05:06.000007");

        let midnight = datetime_from_state(&[0x07, 0xd1, 2, 3, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(iso_datetime(&midnight), "2001-02-03T00:00:00");

        let folded = datetime_from_state(&[0x07, 0xd1, 0x82, 3, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(folded, midnight);

        let d = date_from_state(&[0x07, 0xd1, 2, 3]).unwrap();
        assert_eq!(iso_date(&d), "2001-02-03");

        assert!(date_from_state(&[0x07, 0xd1, 13, 1]).is_none());
        assert!(date_from_state(&[0x00, 0x00, 1, 1]).is_none());
        assert!(datetime_from_state(&[0x07, 0xd1, 2, 3, 24, 0, 0, 0, 0, 0]).is_none());
        assert!(datetime_from_state(&[0x07, 0xd1, 2, 3, 23, 59, 59, 0x0f, 0x42, 0x40]).is_none());
    }

    #[test]
    fn test_impossible_calendar_dates() {
        assert!(date_from_state(&[0x07, 0xd1, 2, 31]).is_none());
        assert!(date_from_state(&[0x07, 0xd1, 2, 29]).is_none());
        assert!(date_from_state(&[0x07, 0xd0, 2, 29]).is_some());
        assert!(date_from_state(&[0x07, 0xd1, 4, 31]).is_none());
        assert!(datetime_from_state(&[0x07, 0xd1, 2, 30, 0, 0, 0, 0, 0, 0]).is_none());
        assert!(date_from_components(&[2021, 6, 31]).is_none());
    }

    #[test]
    fn test_date_components() {
        let d = date_from_components(&[2020, 12, 31]).unwrap();
        assert_eq!(iso_date(&d), "2020-12-31");

        let dt = datetime_from_components(&[2020, 12, 31, 23, 59]).unwrap();
        assert_eq!(iso_datetime(&dt), "2020-12-31T23:59:00");

        assert!(date_from_components(&[2020]).is_none());
        assert!(date_from_components(&[2020, 1, 1, 0]).is_none());
        assert!(datetime_from_components(&[2020, 1, 1, 0, 0, 0, 0, 0]).is_none());
        assert!(datetime_from_components(&[2020, 1, 1, -1]).is_none());
    }
}
