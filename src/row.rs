//! Row: an ordered, case-insensitively-keyed mapping from column name to
//! value, tagged with the source entity/alias (§3).

use std::hash::{Hash, Hasher};

use indexmap::IndexMap;

use crate::value::Value;

/// Case-insensitive column key. Stores the original casing for output but
/// compares/hashes on the uppercased form, matching FetchXML's
/// case-insensitive attribute names.
#[derive(Debug, Clone)]
pub struct ColumnKey(String);

impl ColumnKey {
    pub fn new(name: impl Into<String>) -> Self {
        ColumnKey(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for ColumnKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}
impl Eq for ColumnKey {}

impl Hash for ColumnKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.0.bytes() {
            b.to_ascii_uppercase().hash(state);
        }
    }
}

impl From<&str> for ColumnKey {
    fn from(s: &str) -> Self {
        ColumnKey::new(s)
    }
}
impl From<String> for ColumnKey {
    fn from(s: String) -> Self {
        ColumnKey::new(s)
    }
}

/// A single row flowing through the operator tree.
///
/// The `entity` tag records the primary source entity/alias this row was
/// produced from (used by the join combination rule in §4.6 to disambiguate
/// colliding column names as `<right_entity>.<key>`).
#[derive(Debug, Clone, Default)]
pub struct Row {
    columns: IndexMap<ColumnKey, Value>,
    pub entity: Option<String>,
}

impl Row {
    pub fn new() -> Self {
        Row { columns: IndexMap::new(), entity: None }
    }

    pub fn with_entity(entity: impl Into<String>) -> Self {
        Row { columns: IndexMap::new(), entity: Some(entity.into()) }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns.get(&ColumnKey::new(name))
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.columns.insert(ColumnKey::new(name.into()), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.contains_key(&ColumnKey::new(name))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Build a content-addressed composite key for set operations (§4.8).
    /// Joins column names and canonical value string-forms with the ASCII
    /// Unit Separator (0x1F) and Record Separator (0x1E) control characters,
    /// the same byte-level trick the source engine uses; see DESIGN.md for
    /// why we keep it rather than hashing the tuple.
    pub fn composite_key(&self) -> String {
        let mut parts: Vec<&ColumnKey> = self.columns.keys().collect();
        parts.sort_by_key(|k| k.as_str().to_ascii_uppercase());
        let mut out = String::new();
        for (i, key) in parts.iter().enumerate() {
            if i > 0 {
                out.push('\u{1E}');
            }
            out.push_str(key.as_str());
            out.push('\u{1F}');
            out.push_str(&self.columns[*key].canonical_string());
        }
        out
    }

    /// Merge two rows per the join combination rule (§4.6): keys are the
    /// union; on collision the right value is stored under
    /// `<right_entity>.<key>`.
    pub fn combine(left: &Row, right: &Row) -> Row {
        let mut out = left.clone();
        let right_entity = right.entity.clone().unwrap_or_else(|| "right".to_string());
        for (k, v) in right.columns.iter() {
            if out.columns.contains_key(k) {
                let qualified = format!("{right_entity}.{}", k.as_str());
                out.columns.insert(ColumnKey::new(qualified), v.clone());
            } else {
                out.columns.insert(k.clone(), v.clone());
            }
        }
        out
    }

    /// A row with the same keys as `schema` but every value set to `Value::Null`
    /// — used for outer-join fills (§4.6).
    pub fn null_filled_like(schema: &Row) -> Row {
        let mut out = Row::new();
        out.entity = schema.entity.clone();
        for key in schema.columns.keys() {
            out.columns.insert(key.clone(), Value::Null);
        }
        out
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut row = Row::new();
        for (k, v) in iter {
            row.set(k, v);
        }
        row
    }
}
