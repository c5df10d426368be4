//! The runtime value: a tagged variant carrying all script data.
//!
//! Scalars live inline; hashmaps live in the arena and are referenced through
//! [`HeapId`]. `Clone` is intentionally NOT derived: use `clone_with_heap()`
//! so that map reference counts stay correct, and release values with
//! `drop_with_heap()`. `clone_immediate()` exists for values that are known
//! to be scalar (literal pool entries).

use std::fmt::Write as _;

use ahash::AHashSet;

use crate::{
    heap::{Heap, HeapId},
    json,
    map::{Map, MapKey},
};

/// Opaque host-managed resource handle.
///
/// The engine never looks inside: it is minted by the host, travels through
/// scripts untouched and comes back out through the foreign call context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(pub u64);

/// Maximum nesting honored by deep comparison and JSON encoding before the
/// walk stops (cycle guard).
pub(crate) const MAX_NESTING: usize = 32;

/// A JX9 runtime value.
#[derive(Debug, Default)]
pub(crate) enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Real(f64),
    Str(String),
    /// Shared hashmap; the id's reference count is owned by this value.
    Map(HeapId),
    Resource(ResourceId),
}

impl Value {
    /// Duplicates the value, bumping the map reference count when needed.
    pub(crate) fn clone_with_heap(&self, heap: &mut Heap) -> Self {
        match self {
            Self::Null => Self::Null,
            Self::Bool(b) => Self::Bool(*b),
            Self::Int(n) => Self::Int(*n),
            Self::Real(r) => Self::Real(*r),
            Self::Str(s) => Self::Str(s.clone()),
            Self::Map(id) => {
                heap.inc_ref(*id);
                Self::Map(*id)
            }
            Self::Resource(r) => Self::Resource(*r),
        }
    }

    /// Duplicates a value known to be scalar (no heap reference).
    ///
    /// # Panics
    ///
    /// Panics on a map value: those must go through `clone_with_heap`.
    pub(crate) fn clone_immediate(&self) -> Self {
        match self {
            Self::Map(id) => panic!("clone_immediate on heap value {id:?}"),
            Self::Null => Self::Null,
            Self::Bool(b) => Self::Bool(*b),
            Self::Int(n) => Self::Int(*n),
            Self::Real(r) => Self::Real(*r),
            Self::Str(s) => Self::Str(s.clone()),
            Self::Resource(r) => Self::Resource(*r),
        }
    }

    /// Releases the value, dropping one map reference when needed.
    pub(crate) fn drop_with_heap(self, heap: &mut Heap) {
        if let Self::Map(id) = self {
            heap.dec_ref(id);
        }
    }

    pub(crate) fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub(crate) fn is_map(&self) -> bool {
        matches!(self, Self::Map(_))
    }

    /// Type name as reported by `gettype()` and `dump()`.
    pub(crate) fn type_name(&self, heap: &Heap) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Real(_) => "float",
            Self::Str(_) => "string",
            Self::Map(id) => {
                if heap.get(*id).is_json_object() {
                    "JSON Object"
                } else {
                    "JSON Array"
                }
            }
            Self::Resource(_) => "resource",
        }
    }

    /// One-character type tag used for overload signatures.
    pub(crate) fn sig_char(&self) -> u8 {
        match self {
            Self::Bool(_) => b'b',
            Self::Int(_) => b'i',
            Self::Real(_) => b'f',
            Self::Str(_) => b's',
            Self::Map(_) => b'a',
            Self::Null | Self::Resource(_) => b'n',
        }
    }

    // ----------------------------------------------------------------
    // Coercions
    // ----------------------------------------------------------------

    /// Best-effort 64-bit integer image of the value.
    pub(crate) fn to_int(&self, heap: &Heap) -> i64 {
        match self {
            Self::Null => 0,
            Self::Bool(b) => i64::from(*b),
            Self::Int(n) => *n,
            Self::Real(r) => real_to_int(*r),
            Self::Str(s) => str_to_int(s),
            Self::Map(id) => i64::try_from(heap.get(*id).len()).unwrap_or(i64::MAX),
            Self::Resource(_) => 1,
        }
    }

    /// Best-effort real image of the value.
    pub(crate) fn to_real(&self, heap: &Heap) -> f64 {
        match self {
            Self::Null => 0.0,
            Self::Bool(b) => f64::from(u8::from(*b)),
            Self::Int(n) => *n as f64,
            Self::Real(r) => *r,
            Self::Str(s) => str_to_real(s),
            Self::Map(id) => heap.get(*id).len() as f64,
            Self::Resource(_) => 1.0,
        }
    }

    /// Truth value. The falsy set: null, false, 0, 0.0, the empty string,
    /// `"false"`, any all-zero digit string, the empty map.
    pub(crate) fn to_bool(&self, heap: &Heap) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Int(n) => *n != 0,
            Self::Real(r) => *r != 0.0,
            Self::Str(s) => str_to_bool(s),
            Self::Map(id) => !heap.get(*id).is_empty(),
            Self::Resource(_) => true,
        }
    }

    /// String image. Maps serialize to their full JSON form.
    pub(crate) fn to_display(&self, heap: &Heap) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(true) => "true".to_string(),
            Self::Bool(false) => "false".to_string(),
            Self::Int(n) => n.to_string(),
            Self::Real(r) => fmt_real(*r),
            Self::Str(s) => s.clone(),
            Self::Map(_) => json::encode(self, heap),
            Self::Resource(r) => format!("ResourceID_{:#x}", r.0),
        }
    }

    /// In-place numeric promotion: strings parse, bools widen, maps count.
    ///
    /// The result is always `Int` or `Real`.
    pub(crate) fn make_numeric(&mut self, heap: &mut Heap) {
        let replacement = match self {
            Self::Int(_) | Self::Real(_) => return,
            Self::Null => Self::Int(0),
            Self::Bool(b) => Self::Int(i64::from(*b)),
            Self::Str(s) => str_to_numeric(s),
            Self::Map(_) | Self::Resource(_) => Self::Int(self.to_int(heap)),
        };
        let old = std::mem::replace(self, replacement);
        old.drop_with_heap(heap);
    }

    /// In-place cast to one of the scalar types (the `CVT_*` opcodes).
    pub(crate) fn cast_int(&mut self, heap: &mut Heap) {
        let n = self.to_int(heap);
        let old = std::mem::replace(self, Self::Int(n));
        old.drop_with_heap(heap);
    }

    pub(crate) fn cast_real(&mut self, heap: &mut Heap) {
        let r = self.to_real(heap);
        let old = std::mem::replace(self, Self::Real(r));
        old.drop_with_heap(heap);
    }

    pub(crate) fn cast_bool(&mut self, heap: &mut Heap) {
        let b = self.to_bool(heap);
        let old = std::mem::replace(self, Self::Bool(b));
        old.drop_with_heap(heap);
    }

    pub(crate) fn cast_str(&mut self, heap: &mut Heap) {
        if matches!(self, Self::Str(_)) {
            return;
        }
        let s = self.to_display(heap);
        let old = std::mem::replace(self, Self::Str(s));
        old.drop_with_heap(heap);
    }

    pub(crate) fn cast_null(&mut self, heap: &mut Heap) {
        let old = std::mem::take(self);
        old.drop_with_heap(heap);
    }

    /// In-place cast to a hashmap: scalars become a one-element array at key
    /// 0, null and resources become the empty array, maps stay untouched.
    pub(crate) fn cast_map(&mut self, heap: &mut Heap) {
        if self.is_map() {
            return;
        }
        let mut map = Map::new(false);
        match std::mem::take(self) {
            Self::Null | Self::Resource(_) => {}
            scalar => {
                map.push(scalar);
            }
        }
        let id = heap.alloc(map);
        *self = Self::Map(id);
    }

    /// Builds a hashmap key from the value (index expressions).
    pub(crate) fn to_map_key(&self, heap: &Heap) -> MapKey {
        match self {
            Self::Int(n) => MapKey::Int(*n),
            Self::Bool(b) => MapKey::Int(i64::from(*b)),
            Self::Real(r) => MapKey::Int(real_to_int(*r)),
            Self::Str(s) => MapKey::from_str_image(s),
            Self::Null => MapKey::Str("".into()),
            Self::Map(_) | Self::Resource(_) => MapKey::Int(self.to_int(heap)),
        }
    }

    /// `dump()` image: `type(detail)` plus a newline, e.g. `int(5)`,
    /// `string(3 'abc')`, `JSON Array(2 [1,2])`. Null dumps bare.
    pub(crate) fn dump(&self, heap: &Heap) -> String {
        let mut out = String::from(self.type_name(heap));
        match self {
            Self::Null => {}
            Self::Str(s) => {
                let _ = write!(out, "({} '{}')", s.len(), s);
            }
            Self::Map(id) => {
                let _ = write!(out, "({} {})", heap.get(*id).len(), json::encode(self, heap));
            }
            other => {
                let _ = write!(out, "({})", other.to_display(heap));
            }
        }
        out.push('\n');
        out
    }
}

// --------------------------------------------------------------------
// String parsing
// --------------------------------------------------------------------

/// Real → int with truncation toward zero; out-of-range clamps to i64::MIN
/// (both directions, mirroring x86 conversion behavior).
pub(crate) fn real_to_int(r: f64) -> i64 {
    if r.is_nan() {
        return 0;
    }
    if r < i64::MIN as f64 || r > i64::MAX as f64 {
        return i64::MIN;
    }
    r as i64
}

/// Integer image of a string: leading whitespace skipped, optional sign,
/// then a `0x`/`0b`/`0` prefix selects hex/binary/octal, otherwise decimal.
/// Parsing stops at the first byte that does not belong to the base.
pub(crate) fn str_to_int(s: &str) -> i64 {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    let mut neg = false;
    if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
        neg = bytes[i] == b'-';
        i += 1;
    }
    let magnitude = parse_unsigned_prefixed(&bytes[i..]);
    if neg { magnitude.wrapping_neg() } else { magnitude }
}

/// Parses the digit stream after any sign, honoring base prefixes.
fn parse_unsigned_prefixed(bytes: &[u8]) -> i64 {
    if bytes.is_empty() {
        return 0;
    }
    if bytes[0] == b'0' && bytes.len() > 1 {
        match bytes[1] {
            b'x' | b'X' => return accumulate(&bytes[2..], 16),
            b'b' | b'B' => return accumulate(&bytes[2..], 2),
            _ => return accumulate(&bytes[1..], 8),
        }
    }
    accumulate(bytes, 10)
}

/// Accumulates digits of `base`, stopping at the first foreign byte.
/// Decimal saturates at the i64 boundary; power-of-two bases wrap, which
/// matches reading the raw bit image.
fn accumulate(bytes: &[u8], base: i64) -> i64 {
    let mut value: i64 = 0;
    for &b in bytes {
        let digit = match b {
            b'0'..=b'9' => i64::from(b - b'0'),
            b'a'..=b'f' => i64::from(b - b'a') + 10,
            b'A'..=b'F' => i64::from(b - b'A') + 10,
            _ => break,
        };
        if digit >= base {
            break;
        }
        if base == 10 {
            value = value.saturating_mul(10).saturating_add(digit);
        } else {
            value = value.wrapping_mul(base).wrapping_add(digit);
        }
    }
    value
}

/// Real image of a string: sign, integer part, optional fraction, optional
/// exponent; anything unparseable yields 0.
pub(crate) fn str_to_real(s: &str) -> f64 {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    let start = i;
    if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
        i += 1;
    }
    let int_start = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
    }
    if i == int_start {
        return 0.0;
    }
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        let mut j = i + 1;
        if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
            j += 1;
        }
        let exp_start = j;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        if j > exp_start {
            i = j;
        }
    }
    s[start..i].parse::<f64>().unwrap_or(0.0)
}

/// Truth image of a string.
fn str_to_bool(s: &str) -> bool {
    if s.is_empty() || s == "false" {
        return false;
    }
    !s.bytes().all(|b| b == b'0')
}

/// Numeric image of a string: a real when the leading numeric token carries
/// a fraction or exponent, an integer otherwise.
pub(crate) fn str_to_numeric(s: &str) -> Value {
    if looks_real(s) {
        Value::Real(str_to_real(s))
    } else {
        Value::Int(str_to_int(s))
    }
}

/// True when the leading numeric token of `s` has a `.` fraction or an
/// exponent marker.
fn looks_real(s: &str) -> bool {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
        i += 1;
    }
    let digit_start = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i == digit_start {
        return false;
    }
    if i < bytes.len() && bytes[i] == b'.' && i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit() {
        return true;
    }
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        let mut j = i + 1;
        if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
            j += 1;
        }
        return j < bytes.len() && bytes[j].is_ascii_digit();
    }
    false
}

/// `%.15g` formatting for reals: 15 significant digits, fixed or scientific
/// notation by exponent magnitude, trailing zeros trimmed.
pub(crate) fn fmt_real(r: f64) -> String {
    if r == 0.0 {
        return if r.is_sign_negative() { "-0".to_string() } else { "0".to_string() };
    }
    if r.is_nan() {
        return "nan".to_string();
    }
    if r.is_infinite() {
        return if r < 0.0 { "-inf".to_string() } else { "inf".to_string() };
    }
    // Round to 15 significant digits via scientific formatting, then decide
    // presentation from the decimal exponent like printf's %g.
    let sci = format!("{r:.14e}");
    let (mantissa, exp) = sci.split_once('e').expect("scientific format always has an exponent");
    let exp: i32 = exp.parse().expect("exponent is numeric");
    if exp < -4 || exp >= 15 {
        let mantissa = trim_real_zeros(mantissa);
        let sign = if exp < 0 { '-' } else { '+' };
        return format!("{mantissa}e{sign}{:02}", exp.abs());
    }
    let precision = usize::try_from(14 - exp).expect("precision in range");
    let fixed = format!("{r:.precision$}");
    trim_real_zeros(&fixed).to_string()
}

/// Trims trailing fractional zeros and a dangling decimal point.
fn trim_real_zeros(image: &str) -> &str {
    if !image.contains('.') {
        return image;
    }
    let image = image.trim_end_matches('0');
    image.strip_suffix('.').unwrap_or(image)
}

/// Demotes a real arithmetic result to an integer when the real→int→real
/// round trip is exact and the value is strictly inside the i64 range.
pub(crate) fn demote_real(r: f64) -> Value {
    let i = real_to_int(r);
    if r == i as f64 && i > i64::MIN && i < i64::MAX {
        Value::Int(i)
    } else {
        Value::Real(r)
    }
}

// --------------------------------------------------------------------
// Comparison
// --------------------------------------------------------------------

/// Three-way comparison of two values.
///
/// `strict` requires identical type tags first (`===`). The loose ladder:
/// bool/resource contamination compares truth values (false < true); null
/// pairs only with null; a map outranks any scalar and maps compare deeply;
/// two strings compare byte-wise with the shorter-is-less tiebreak; anything
/// else is compared numerically, converting string operands to numbers.
pub(crate) fn compare(lhs: &Value, rhs: &Value, strict: bool, heap: &Heap) -> i32 {
    if strict && std::mem::discriminant(lhs) != std::mem::discriminant(rhs) {
        return 1;
    }
    let mut visited = AHashSet::new();
    compare_inner(lhs, rhs, strict, heap, &mut visited, 0)
}

fn compare_inner(
    lhs: &Value,
    rhs: &Value,
    strict: bool,
    heap: &Heap,
    visited: &mut AHashSet<(HeapId, HeapId)>,
    depth: usize,
) -> i32 {
    use Value::{Bool, Map, Null, Real, Resource, Str};

    if matches!(lhs, Bool(_) | Resource(_)) || matches!(rhs, Bool(_) | Resource(_)) {
        let (a, b) = (lhs.to_bool(heap), rhs.to_bool(heap));
        return i32::from(a) - i32::from(b);
    }
    if lhs.is_null() || rhs.is_null() {
        // Null pairs with null and, loosely, with the empty map.
        return match (lhs, rhs) {
            (Null, Null) => 0,
            (Null, Map(id)) if !strict && heap.get(*id).is_empty() => 0,
            (Map(id), Null) if !strict && heap.get(*id).is_empty() => 0,
            (Null, _) => -1,
            _ => 1,
        };
    }
    if lhs.is_map() || rhs.is_map() {
        return match (lhs, rhs) {
            (Map(a), Map(b)) => compare_maps(*a, *b, strict, heap, visited, depth),
            (Map(_), _) => 1,
            _ => -1,
        };
    }
    if let (Str(a), Str(b)) = (lhs, rhs) {
        return match a.as_bytes().cmp(b.as_bytes()) {
            std::cmp::Ordering::Less => -1,
            std::cmp::Ordering::Equal => 0,
            std::cmp::Ordering::Greater => 1,
        };
    }
    // Numeric comparison; string operands convert to numbers.
    let num = |v: &Value| match v {
        Str(s) => str_to_numeric(s),
        other => other.clone_immediate(),
    };
    match (num(lhs), num(rhs)) {
        (Value::Int(a), Value::Int(b)) => match a.cmp(&b) {
            std::cmp::Ordering::Less => -1,
            std::cmp::Ordering::Equal => 0,
            std::cmp::Ordering::Greater => 1,
        },
        (a, b) => {
            let (a, b) = (num_as_real(&a), num_as_real(&b));
            if a > b {
                1
            } else if a < b {
                -1
            } else {
                0
            }
        }
    }
}

fn num_as_real(v: &Value) -> f64 {
    match v {
        Value::Int(n) => *n as f64,
        Value::Real(r) => *r,
        _ => 0.0,
    }
}

/// Deep map comparison in insertion order with a visited set guarding
/// cycles and a nesting cap.
fn compare_maps(
    a: HeapId,
    b: HeapId,
    strict: bool,
    heap: &Heap,
    visited: &mut AHashSet<(HeapId, HeapId)>,
    depth: usize,
) -> i32 {
    if a == b {
        return 0;
    }
    if depth >= MAX_NESTING || !visited.insert((a, b)) {
        // Already being compared further up the walk, or too deep: treat as
        // equal to terminate.
        return 0;
    }
    let (ma, mb) = (heap.get(a), heap.get(b));
    if ma.len() != mb.len() {
        return if ma.len() < mb.len() { -1 } else { 1 };
    }
    for (key, va) in ma.iter() {
        let Some(vb) = mb.get(key) else {
            return 1;
        };
        if strict && std::mem::discriminant(va) != std::mem::discriminant(vb) {
            return 1;
        }
        let rc = compare_inner(va, vb, strict, heap, visited, depth + 1);
        if rc != 0 {
            return rc;
        }
    }
    0
}

/// Loose equality (`==`).
pub(crate) fn loose_eq(lhs: &Value, rhs: &Value, heap: &Heap) -> bool {
    compare(lhs, rhs, false, heap) == 0
}

/// Strict equality (`===`): identical type tag and identical contents.
pub(crate) fn strict_eq(lhs: &Value, rhs: &Value, heap: &Heap) -> bool {
    compare(lhs, rhs, true, heap) == 0
}

// --------------------------------------------------------------------
// Arithmetic
// --------------------------------------------------------------------

/// Addition, including the hashmap union overload: when either operand is a
/// map the result is a fresh map seeded from the left operand with the right
/// operand's missing keys appended (left wins on collision). Scalar operands
/// join under key 0; null operands contribute nothing.
pub(crate) fn add(lhs: Value, rhs: Value, heap: &mut Heap) -> Value {
    if !lhs.is_map() && !rhs.is_map() {
        return arith_add(lhs, rhs, heap);
    }
    let mut union = Map::new(false);
    seed_union(&mut union, &lhs, heap);
    merge_union(&mut union, &rhs, heap);
    lhs.drop_with_heap(heap);
    rhs.drop_with_heap(heap);
    let id = heap.alloc(union);
    Value::Map(id)
}

/// Clones one entry value out of a live map, bumping child references.
fn clone_entry(id: HeapId, key: &MapKey, heap: &mut Heap) -> Value {
    let child = match heap.get(id).get(key) {
        Some(Value::Map(child)) => *child,
        Some(other) => return other.clone_immediate(),
        None => return Value::Null,
    };
    heap.inc_ref(child);
    Value::Map(child)
}

fn seed_union(dest: &mut Map, src: &Value, heap: &mut Heap) {
    match src {
        Value::Map(id) => {
            dest.set_json_object(heap.get(*id).is_json_object());
            for key in heap.get(*id).key_snapshot() {
                let value = clone_entry(*id, &key, heap);
                dest.insert(key, value);
            }
        }
        Value::Null => {}
        scalar => {
            dest.push(scalar.clone_immediate());
        }
    }
}

fn merge_union(dest: &mut Map, src: &Value, heap: &mut Heap) {
    match src {
        Value::Map(id) => {
            for key in heap.get(*id).key_snapshot() {
                if dest.contains(&key) {
                    continue;
                }
                let value = clone_entry(*id, &key, heap);
                dest.insert(key, value);
            }
        }
        Value::Null => {}
        scalar => {
            if !dest.contains(&MapKey::Int(0)) {
                dest.insert(MapKey::Int(0), scalar.clone_immediate());
            }
        }
    }
}

fn arith_add(lhs: Value, rhs: Value, heap: &mut Heap) -> Value {
    binary_numeric(lhs, rhs, heap, i64::wrapping_add, |a, b| a + b)
}

pub(crate) fn sub(lhs: Value, rhs: Value, heap: &mut Heap) -> Value {
    binary_numeric(lhs, rhs, heap, i64::wrapping_sub, |a, b| a - b)
}

pub(crate) fn mul(lhs: Value, rhs: Value, heap: &mut Heap) -> Value {
    binary_numeric(lhs, rhs, heap, i64::wrapping_mul, |a, b| a * b)
}

/// Numeric promotion core: both operands become numbers; integer arithmetic
/// when both are integers, real otherwise, with exact reals demoting back.
fn binary_numeric(
    lhs: Value,
    rhs: Value,
    heap: &mut Heap,
    int_op: impl Fn(i64, i64) -> i64,
    real_op: impl Fn(f64, f64) -> f64,
) -> Value {
    let mut a = lhs;
    let mut b = rhs;
    a.make_numeric(heap);
    b.make_numeric(heap);
    match (&a, &b) {
        (Value::Int(x), Value::Int(y)) => Value::Int(int_op(*x, *y)),
        _ => demote_real(real_op(a.to_real(heap), b.to_real(heap))),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn int_from_string_honors_base_prefixes() {
        assert_eq!(str_to_int("42"), 42);
        assert_eq!(str_to_int("  -17"), -17);
        assert_eq!(str_to_int("0x1f"), 31);
        assert_eq!(str_to_int("0b101"), 5);
        assert_eq!(str_to_int("0755"), 493);
        assert_eq!(str_to_int("3 apples"), 3);
        assert_eq!(str_to_int(""), 0);
        assert_eq!(str_to_int("junk"), 0);
    }

    #[test]
    fn real_from_string_consumes_leading_token() {
        assert_eq!(str_to_real("1.5"), 1.5);
        assert_eq!(str_to_real("-2.5e2x"), -250.0);
        assert_eq!(str_to_real("nope"), 0.0);
        assert_eq!(str_to_real("7"), 7.0);
    }

    #[test]
    fn bool_from_string_falsy_set() {
        assert!(!str_to_bool(""));
        assert!(!str_to_bool("false"));
        assert!(!str_to_bool("0"));
        assert!(!str_to_bool("0000"));
        assert!(str_to_bool("1"));
        assert!(str_to_bool("no"));
        assert!(str_to_bool("FALSE"));
    }

    #[test]
    fn real_to_int_truncates_and_clamps() {
        assert_eq!(real_to_int(3.9), 3);
        assert_eq!(real_to_int(-3.9), -3);
        assert_eq!(real_to_int(1e300), i64::MIN);
        assert_eq!(real_to_int(-1e300), i64::MIN);
    }

    #[test]
    fn fmt_real_matches_g15() {
        assert_eq!(fmt_real(0.5), "0.5");
        assert_eq!(fmt_real(2.0), "2");
        assert_eq!(fmt_real(1e20), "1e+20");
        assert_eq!(fmt_real(1.0e-5), "1e-05");
        assert_eq!(fmt_real(1234.5), "1234.5");
        assert_eq!(fmt_real(0.1), "0.1");
    }

    #[test]
    fn loose_equality_is_not_transitive() {
        let heap = Heap::new();
        let zero_str = Value::Str("0".to_string());
        let zero = Value::Int(0);
        let empty = Value::Str(String::new());
        assert!(loose_eq(&zero_str, &zero, &heap));
        assert!(loose_eq(&zero, &empty, &heap));
        assert!(!loose_eq(&zero_str, &empty, &heap));
    }

    #[test]
    fn loose_equality_is_symmetric() {
        let heap = Heap::new();
        let samples = [
            Value::Null,
            Value::Bool(true),
            Value::Int(1),
            Value::Real(1.0),
            Value::Str("1".to_string()),
        ];
        for a in &samples {
            for b in &samples {
                assert_eq!(loose_eq(a, b, &heap), loose_eq(b, a, &heap));
            }
        }
    }

    #[test]
    fn strict_equality_requires_same_tag() {
        let heap = Heap::new();
        assert!(!strict_eq(&Value::Int(1), &Value::Real(1.0), &heap));
        assert!(!strict_eq(&Value::Int(0), &Value::Str("0".to_string()), &heap));
        assert!(strict_eq(&Value::Int(5), &Value::Int(5), &heap));
        assert!(strict_eq(&Value::Null, &Value::Null, &heap));
    }

    #[test]
    fn null_matches_empty_map_loosely() {
        let mut heap = Heap::new();
        let id = heap.alloc(Map::new(false));
        let empty_map = Value::Map(id);
        assert!(loose_eq(&Value::Null, &empty_map, &heap));
        assert!(!strict_eq(&Value::Null, &empty_map, &heap));
        empty_map.drop_with_heap(&mut heap);
        let id = heap.alloc(Map::new(false));
        heap.get_mut(id).push(Value::Int(1));
        let full_map = Value::Map(id);
        assert!(!loose_eq(&Value::Null, &full_map, &heap));
        full_map.drop_with_heap(&mut heap);
    }

    #[test]
    fn map_greater_than_scalar() {
        let mut heap = Heap::new();
        let id = heap.alloc(Map::new(false));
        heap.get_mut(id).push(Value::Int(1));
        let map = Value::Map(id);
        assert_eq!(compare(&map, &Value::Int(100), false, &heap), 1);
        assert_eq!(compare(&Value::Int(100), &map, false, &heap), -1);
        map.drop_with_heap(&mut heap);
    }

    #[test]
    fn self_referential_map_comparison_terminates() {
        let mut heap = Heap::new();
        let a = heap.alloc(Map::new(false));
        let b = heap.alloc(Map::new(false));
        heap.inc_ref(a);
        heap.inc_ref(b);
        heap.get_mut(a).insert(MapKey::Int(0), Value::Map(a));
        heap.get_mut(b).insert(MapKey::Int(0), Value::Map(b));
        assert_eq!(compare(&Value::Map(a), &Value::Map(b), false, &heap), 0);
        Value::Map(a).drop_with_heap(&mut heap);
        Value::Map(b).drop_with_heap(&mut heap);
    }

    #[test]
    fn string_plus_int_coerces() {
        let mut heap = Heap::new();
        let r = add(Value::Int(2), Value::Str("3 apples".to_string()), &mut heap);
        assert!(matches!(r, Value::Int(5)));
    }

    #[test]
    fn real_results_demote_when_exact() {
        let mut heap = Heap::new();
        let r = add(Value::Real(1.5), Value::Real(0.5), &mut heap);
        assert!(matches!(r, Value::Int(2)));
        let r = add(Value::Real(1.25), Value::Real(0.5), &mut heap);
        assert!(matches!(r, Value::Real(v) if v == 1.75));
    }

    #[test]
    fn map_union_left_wins() {
        let mut heap = Heap::new();
        let a = heap.alloc(Map::new(true));
        heap.get_mut(a).insert(MapKey::from_str_image("k"), Value::Int(1));
        let b = heap.alloc(Map::new(true));
        heap.get_mut(b).insert(MapKey::from_str_image("k"), Value::Int(2));
        heap.get_mut(b).insert(MapKey::from_str_image("only"), Value::Int(3));
        let union = add(Value::Map(a), Value::Map(b), &mut heap);
        let Value::Map(u) = &union else { panic!("expected map") };
        assert!(matches!(heap.get(*u).get(&MapKey::from_str_image("k")), Some(Value::Int(1))));
        assert!(matches!(
            heap.get(*u).get(&MapKey::from_str_image("only")),
            Some(Value::Int(3))
        ));
        union.drop_with_heap(&mut heap);
        assert_eq!(heap.live_count(), 0);
    }
}
