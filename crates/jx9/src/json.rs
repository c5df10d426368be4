//! JSON wire format: value ⇄ text.
//!
//! The serializer is deliberately byte-compatible with the engine's historic
//! output rather than RFC-strict: strings escape only `"` and `\` (control
//! bytes pass through verbatim), reals print with `%.15g`, and nesting deeper
//! than [`MAX_NESTING`] is truncated silently. The decoder is forgiving on
//! input: unquoted identifiers are accepted where strings are expected.

use crate::{
    heap::Heap,
    map::{Map, MapKey},
    value::{self, MAX_NESTING, Value},
};

/// Serializes a value to its JSON image.
pub(crate) fn encode(value: &Value, heap: &Heap) -> String {
    let mut out = String::new();
    encode_into(&mut out, value, heap, 0);
    out
}

fn encode_into(out: &mut String, value: &Value, heap: &Heap, depth: usize) {
    match value {
        Value::Null | Value::Resource(_) => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Int(n) => {
            out.push_str(&n.to_string());
        }
        Value::Real(r) => out.push_str(&value::fmt_real(*r)),
        Value::Str(s) => encode_string(out, s),
        Value::Map(id) => {
            let map = heap.get(*id);
            if map.is_json_object() {
                out.push('{');
                let mut first = true;
                for (key, entry) in map.iter() {
                    if depth + 1 >= MAX_NESTING {
                        break;
                    }
                    if !first {
                        out.push(',');
                    }
                    first = false;
                    out.push('"');
                    out.push_str(&key.image());
                    out.push('"');
                    out.push(':');
                    encode_into(out, entry, heap, depth + 1);
                }
                out.push('}');
            } else {
                out.push('[');
                let mut first = true;
                for entry in map.values() {
                    if depth + 1 >= MAX_NESTING {
                        break;
                    }
                    if !first {
                        out.push(',');
                    }
                    first = false;
                    encode_into(out, entry, heap, depth + 1);
                }
                out.push(']');
            }
        }
    }
}

/// Emits a string literal escaping only the double quote and the backslash.
fn encode_string(out: &mut String, s: &str) {
    out.push('"');
    for ch in s.chars() {
        if ch == '"' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
}

/// Decodes a JSON image into a value. Returns `None` on malformed input or
/// when nesting exceeds the cap; the `json_decode` builtin turns that into
/// null.
pub(crate) fn decode(input: &str, heap: &mut Heap) -> Option<Value> {
    let mut parser = Decoder {
        bytes: input.as_bytes(),
        pos: 0,
    };
    parser.skip_ws();
    let value = parser.parse_value(heap, 0)?;
    parser.skip_ws();
    if parser.pos != parser.bytes.len() {
        value.drop_with_heap(heap);
        return None;
    }
    Some(value)
}

struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Decoder<'_> {
    fn skip_ws(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn eat(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn parse_value(&mut self, heap: &mut Heap, depth: usize) -> Option<Value> {
        if depth >= MAX_NESTING {
            return None;
        }
        self.skip_ws();
        match self.peek()? {
            b'{' => self.parse_object(heap, depth),
            b'[' => self.parse_array(heap, depth),
            b'"' => self.parse_string().map(Value::Str),
            b'-' | b'+' | b'0'..=b'9' => Some(self.parse_number()),
            _ => {
                let ident = self.parse_ident()?;
                Some(match ident {
                    "null" => Value::Null,
                    "true" => Value::Bool(true),
                    "false" => Value::Bool(false),
                    other => Value::Str(other.to_string()),
                })
            }
        }
    }

    fn parse_object(&mut self, heap: &mut Heap, depth: usize) -> Option<Value> {
        self.pos += 1; // '{'
        let id = heap.alloc(Map::new(true));
        loop {
            self.skip_ws();
            if self.eat(b'}') {
                break;
            }
            let key = match self.peek() {
                Some(b'"') => self.parse_string(),
                Some(b'-' | b'0'..=b'9') => match self.parse_number() {
                    Value::Int(n) => Some(n.to_string()),
                    Value::Real(r) => Some(value::fmt_real(r)),
                    _ => None,
                },
                _ => self.parse_ident().map(str::to_string),
            };
            let Some(key) = key else {
                return self.fail(id, heap);
            };
            self.skip_ws();
            if !self.eat(b':') {
                return self.fail(id, heap);
            }
            let Some(entry) = self.parse_value(heap, depth + 1) else {
                return self.fail(id, heap);
            };
            if let Some(old) = heap.get_mut(id).insert(MapKey::from_str_image(&key), entry) {
                old.drop_with_heap(heap);
            }
            self.skip_ws();
            if self.eat(b',') {
                continue;
            }
            if self.eat(b'}') {
                break;
            }
            return self.fail(id, heap);
        }
        Some(Value::Map(id))
    }

    fn parse_array(&mut self, heap: &mut Heap, depth: usize) -> Option<Value> {
        self.pos += 1; // '['
        let id = heap.alloc(Map::new(false));
        loop {
            self.skip_ws();
            if self.eat(b']') {
                break;
            }
            let Some(entry) = self.parse_value(heap, depth + 1) else {
                return self.fail(id, heap);
            };
            heap.get_mut(id).push(entry);
            self.skip_ws();
            if self.eat(b',') {
                continue;
            }
            if self.eat(b']') {
                break;
            }
            return self.fail(id, heap);
        }
        Some(Value::Map(id))
    }

    /// Releases a partially built container on syntax error.
    fn fail(&mut self, id: crate::heap::HeapId, heap: &mut Heap) -> Option<Value> {
        heap.dec_ref(id);
        None
    }

    /// Parses a double-quoted string, resolving backslash escapes the way the
    /// serializer's counterpart does: `\" \\ \n \r \t \f` plus pass-through
    /// for anything else.
    fn parse_string(&mut self) -> Option<String> {
        self.pos += 1; // '"'
        let mut out = String::new();
        loop {
            let b = self.peek()?;
            self.pos += 1;
            match b {
                b'"' => return Some(out),
                b'\\' => {
                    let esc = self.peek()?;
                    self.pos += 1;
                    match esc {
                        b'n' => out.push('\n'),
                        b'r' => out.push('\r'),
                        b't' => out.push('\t'),
                        b'f' => out.push('\u{c}'),
                        other => out.push(char::from(other)),
                    }
                }
                other => {
                    // Re-assemble multibyte sequences byte by byte.
                    let start = self.pos - 1;
                    let mut end = self.pos;
                    while end < self.bytes.len() && !matches!(self.bytes[end], b'"' | b'\\') {
                        end += 1;
                    }
                    match std::str::from_utf8(&self.bytes[start..end]) {
                        Ok(chunk) => {
                            out.push_str(chunk);
                            self.pos = end;
                        }
                        Err(_) => out.push(char::from(other)),
                    }
                }
            }
        }
    }

    /// Parses a numeric token and re-coerces it through the numeric string
    /// rules, so `1e3` and `-2.5` come out typed.
    fn parse_number(&mut self) -> Value {
        let start = self.pos;
        if matches!(self.peek(), Some(b'-' | b'+')) {
            self.pos += 1;
        }
        while let Some(b) = self.peek() {
            if b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'-' | b'+') {
                self.pos += 1;
            } else {
                break;
            }
        }
        let image = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap_or("0");
        value::str_to_numeric(image)
    }

    fn parse_ident(&mut self) -> Option<&str> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return None;
        }
        std::str::from_utf8(&self.bytes[start..self.pos]).ok()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::value::strict_eq;

    #[test]
    fn scalars_encode() {
        let heap = Heap::new();
        assert_eq!(encode(&Value::Null, &heap), "null");
        assert_eq!(encode(&Value::Bool(true), &heap), "true");
        assert_eq!(encode(&Value::Int(-7), &heap), "-7");
        assert_eq!(encode(&Value::Real(0.5), &heap), "0.5");
        assert_eq!(encode(&Value::Str("a\"b\\c".to_string()), &heap), r#""a\"b\\c""#);
    }

    #[test]
    fn control_bytes_pass_through() {
        let heap = Heap::new();
        assert_eq!(encode(&Value::Str("a\nb".to_string()), &heap), "\"a\nb\"");
    }

    #[test]
    fn object_and_array_shapes() {
        let mut heap = Heap::new();
        let users = heap.alloc(Map::new(false));
        let ada = heap.alloc(Map::new(false));
        heap.get_mut(ada)
            .insert(MapKey::from_str_image("name"), Value::Str("Ada".to_string()));
        heap.get_mut(ada).insert(MapKey::from_str_image("born"), Value::Int(1815));
        heap.get_mut(users).push(Value::Map(ada));
        let root = heap.alloc(Map::new(true));
        heap.get_mut(root).insert(MapKey::from_str_image("users"), Value::Map(users));
        let value = Value::Map(root);
        assert_eq!(encode(&value, &heap), r#"{"users":[{"name":"Ada","born":1815}]}"#);
        value.drop_with_heap(&mut heap);
    }

    #[test]
    fn decode_round_trips_strictly() {
        let mut heap = Heap::new();
        let image = r#"{"a":[1,"two",null,true],"b":{"c":false}}"#;
        let decoded = decode(image, &mut heap).expect("valid input");
        let encoded = encode(&decoded, &heap);
        let again = decode(&encoded, &mut heap).expect("round trip");
        assert!(strict_eq(&decoded, &again, &heap));
        assert_eq!(encoded, image);
        decoded.drop_with_heap(&mut heap);
        again.drop_with_heap(&mut heap);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn decode_rejects_garbage() {
        let mut heap = Heap::new();
        assert!(decode("{", &mut heap).is_none());
        assert!(decode("[1,]2", &mut heap).is_none());
        assert!(decode("", &mut heap).is_none());
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn decode_accepts_bare_identifiers() {
        let mut heap = Heap::new();
        let decoded = decode("{key: value}", &mut heap).expect("loose keys parse");
        let Value::Map(id) = &decoded else { panic!("expected map") };
        assert!(matches!(
            heap.get(*id).get(&MapKey::from_str_image("key")),
            Some(Value::Str(s)) if s == "value"
        ));
        decoded.drop_with_heap(&mut heap);
    }

    #[test]
    fn nesting_cap_truncates_encoding() {
        let mut heap = Heap::new();
        // Build a chain 40 maps deep.
        let mut inner = heap.alloc(Map::new(false));
        for _ in 0..40 {
            let outer = heap.alloc(Map::new(false));
            heap.get_mut(outer).push(Value::Map(inner));
            inner = outer;
        }
        let value = Value::Map(inner);
        let image = encode(&value, &heap);
        // The walk stops quietly instead of recursing forever.
        assert!(image.len() < 2 * MAX_NESTING + 4);
        value.drop_with_heap(&mut heap);
    }
}
