//! The JX9 hashmap: one container serving as both JSON array and JSON object.
//!
//! Entries keep insertion order. Keys are 64-bit integers or byte strings and
//! a single map may mix both kinds. Whether the map prints as `{...}` or
//! `[...]` is a serialization-only flag (see `json_object`): storage and
//! lookup are identical in both modes.

use ahash::RandomState;
use indexmap::IndexMap;

use crate::value::Value;

/// A hashmap key: integer or byte string.
///
/// String keys that carry a canonical decimal integer image (`"7"`, `"-3"`)
/// are normalized to integer keys at insertion, so `$a[7]` and `$a["7"]`
/// address the same slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum MapKey {
    Int(i64),
    Str(Box<str>),
}

impl MapKey {
    /// Builds a key from a string image, normalizing canonical decimal
    /// integers to `Int`.
    pub(crate) fn from_str_image(image: &str) -> Self {
        if let Some(n) = canonical_int(image) {
            return Self::Int(n);
        }
        Self::Str(image.into())
    }

    /// Returns the string image of the key (decimal for integer keys).
    pub(crate) fn image(&self) -> String {
        match self {
            Self::Int(n) => n.to_string(),
            Self::Str(s) => s.to_string(),
        }
    }
}

/// Parses `image` as a canonical decimal i64: optional minus, no leading
/// zeros (except `"0"` itself), everything a digit, value in range.
fn canonical_int(image: &str) -> Option<i64> {
    let bytes = image.as_bytes();
    let digits = if bytes.first() == Some(&b'-') { &bytes[1..] } else { bytes };
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    if digits.len() > 1 && digits[0] == b'0' {
        return None;
    }
    image.parse::<i64>().ok()
}

/// Order-preserving key→value mapping with automatic integer indexing.
#[derive(Debug, Default)]
pub(crate) struct Map {
    entries: IndexMap<MapKey, Value, RandomState>,
    /// Next automatic integer key: `max(existing integer keys) + 1`, 0 when
    /// no integer key was ever inserted.
    next_index: i64,
    /// Serialize as a JSON object (`{}`) rather than an array (`[]`).
    json_object: bool,
}

impl Map {
    /// Creates an empty map with the given serialization mode.
    pub(crate) fn new(json_object: bool) -> Self {
        Self {
            entries: IndexMap::default(),
            next_index: 0,
            json_object,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn is_json_object(&self) -> bool {
        self.json_object
    }

    pub(crate) fn set_json_object(&mut self, flag: bool) {
        self.json_object = flag;
    }

    pub(crate) fn get(&self, key: &MapKey) -> Option<&Value> {
        self.entries.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &MapKey) -> Option<&mut Value> {
        self.entries.get_mut(key)
    }

    pub(crate) fn contains(&self, key: &MapKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Inserts or replaces an entry, returning the previous value if any.
    ///
    /// Integer keys advance the automatic index. String keys flip the map to
    /// object serialization: a container that holds named attributes prints
    /// as `{...}` from then on.
    pub(crate) fn insert(&mut self, key: MapKey, value: Value) -> Option<Value> {
        match &key {
            MapKey::Int(n) => {
                if *n >= self.next_index {
                    self.next_index = n.saturating_add(1);
                }
            }
            MapKey::Str(_) => self.json_object = true,
        }
        self.entries.insert(key, value)
    }

    /// Appends `value` under the next free integer key and returns that key.
    pub(crate) fn push(&mut self, value: Value) -> i64 {
        let key = self.next_index;
        self.insert(MapKey::Int(key), value);
        key
    }

    /// Removes an entry, preserving the order of the remaining ones.
    pub(crate) fn remove(&mut self, key: &MapKey) -> Option<Value> {
        self.entries.shift_remove(key)
    }

    /// Removes and returns the most recently inserted entry.
    pub(crate) fn pop_last(&mut self) -> Option<(MapKey, Value)> {
        self.entries.pop()
    }

    /// Removes and returns the first entry, shifting the rest forward.
    pub(crate) fn shift_first(&mut self) -> Option<(MapKey, Value)> {
        self.entries.shift_remove_index(0)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&MapKey, &Value)> {
        self.entries.iter()
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.values()
    }

    /// Snapshot of the key sequence in insertion order.
    ///
    /// `foreach` iterates over such a snapshot so that entries inserted
    /// during the loop are not visited and deletions of unrelated entries do
    /// not disturb the walk.
    pub(crate) fn key_snapshot(&self) -> Vec<MapKey> {
        self.entries.keys().cloned().collect()
    }

    /// Drains all entries, handing the values back for reference release.
    pub(crate) fn drain_values(&mut self) -> Vec<Value> {
        self.next_index = 0;
        self.entries.drain(..).map(|(_, v)| v).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insertion_order_is_preserved() {
        let mut map = Map::new(true);
        map.insert(MapKey::from_str_image("b"), Value::Int(2));
        map.insert(MapKey::from_str_image("a"), Value::Int(1));
        map.insert(MapKey::Int(0), Value::Int(0));
        let keys: Vec<String> = map.iter().map(|(k, _)| k.image()).collect();
        assert_eq!(keys, ["b", "a", "0"]);
    }

    #[test]
    fn auto_index_tracks_max_plus_one() {
        let mut map = Map::new(false);
        assert_eq!(map.push(Value::Null), 0);
        map.insert(MapKey::Int(9), Value::Null);
        assert_eq!(map.push(Value::Null), 10);
    }

    #[test]
    fn numeric_string_keys_normalize() {
        let mut map = Map::new(false);
        map.insert(MapKey::from_str_image("7"), Value::Int(1));
        assert!(map.contains(&MapKey::Int(7)));
        // Non-canonical images stay strings.
        map.insert(MapKey::from_str_image("07"), Value::Int(2));
        assert!(map.contains(&MapKey::Str("07".into())));
    }

    #[test]
    fn string_key_promotes_to_object() {
        let mut map = Map::new(false);
        map.push(Value::Int(1));
        assert!(!map.is_json_object());
        map.insert(MapKey::from_str_image("name"), Value::Int(2));
        assert!(map.is_json_object());
    }
}
