use std::{collections::BTreeMap, fmt, sync::Arc};

use bson::{Bson, Document};
use itertools::Itertools;
use sha2::{Digest, Sha256};

/// Name prefix marking an index as engine-owned. Only indexes carrying it may
/// ever be dropped or replaced by the engine.
pub const OWNERSHIP_PREFIX: &str = "auto_";

/// The index MongoDB creates for the primary key in every collection. Never
/// diffed, created or dropped.
pub const PRIMARY_KEY_INDEX_NAME: &str = "_id_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Ascending,
    Descending,
    Hashed,
}

impl Direction {
    pub fn as_bson(self) -> Bson {
        match self {
            Direction::Ascending => Bson::Int32(1),
            Direction::Descending => Bson::Int32(-1),
            Direction::Hashed => Bson::String("hashed".to_owned()),
        }
    }

    fn from_bson(bson: &Bson) -> Option<Self> {
        match bson {
            Bson::Int32(1) | Bson::Int64(1) => Some(Direction::Ascending),
            Bson::Int32(-1) | Bson::Int64(-1) => Some(Direction::Descending),
            Bson::Double(d) if *d == 1.0 => Some(Direction::Ascending),
            Bson::Double(d) if *d == -1.0 => Some(Direction::Descending),
            Bson::String(s) if s == "hashed" => Some(Direction::Hashed),
            _ => None,
        }
    }

    fn canonical(self) -> &'static str {
        match self {
            Direction::Ascending => "1",
            Direction::Descending => "-1",
            Direction::Hashed => "hashed",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Hashed => f.write_str("\"hashed\""),
            other => f.write_str(other.canonical()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexField {
    pub path: String,
    pub direction: Direction,
}

impl IndexField {
    pub fn new(path: impl Into<String>, direction: Direction) -> Self {
        IndexField {
            path: path.into(),
            direction,
        }
    }
}

/// An ordered sequence of indexed fields, bound to a collection. Two indexes
/// are the same iff their sequences are pointwise equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompoundIndex {
    collection: String,
    fields: Vec<IndexField>,
}

impl CompoundIndex {
    pub fn new(collection: impl Into<String>, fields: Vec<IndexField>) -> Self {
        CompoundIndex {
            collection: collection.into(),
            fields,
        }
    }

    pub fn single(collection: impl Into<String>, path: impl Into<String>, direction: Direction) -> Self {
        CompoundIndex::new(collection, vec![IndexField::new(path, direction)])
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn fields(&self) -> &[IndexField] {
        &self.fields
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.path.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn contains_path(&self, path: &str) -> bool {
        self.fields.iter().any(|f| f.path == path)
    }

    /// The serialized field sequence. This is what the canonical name hashes,
    /// so it excludes the collection.
    pub fn sequence_key(&self) -> String {
        self.fields
            .iter()
            .map(|f| format!("{}:{}", f.path, f.direction.canonical()))
            .join(",")
    }

    /// Pool key for identity canonicalization: sequence plus collection.
    pub fn canonical_key(&self) -> String {
        format!("{}${}", self.collection, self.sequence_key())
    }

    /// The deterministic index name. The `auto_` prefix marks the index as
    /// engine-owned.
    pub fn name(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sequence_key().as_bytes());
        let digest: [u8; 32] = hasher.finalize().into();

        let mut name = String::with_capacity(OWNERSHIP_PREFIX.len() + 64);
        name.push_str(OWNERSHIP_PREFIX);

        use std::fmt::Write as _;
        for byte in digest {
            write!(name, "{byte:02x}").expect("writing to a String cannot fail");
        }

        name
    }

    /// A is an index-prefix of B iff A's sequence equals the first |A|
    /// entries of B's and A is strictly shorter.
    pub fn is_index_prefix_of(&self, other: &CompoundIndex) -> bool {
        self.collection == other.collection
            && self.fields.len() < other.fields.len()
            && self.fields == other.fields[..self.fields.len()]
    }

    pub fn key_document(&self) -> Document {
        let mut keys = Document::new();
        for field in &self.fields {
            keys.insert(field.path.clone(), field.direction.as_bson());
        }
        keys
    }

    /// Parses an index key document as listed by the database. Returns `None`
    /// for key types the engine does not model (text, geo, wildcard); those
    /// indexes are user-owned by definition.
    pub fn from_key_document(collection: &str, keys: &Document) -> Option<CompoundIndex> {
        let mut fields = Vec::with_capacity(keys.len());

        for (path, value) in keys {
            let direction = Direction::from_bson(value)?;
            fields.push(IndexField::new(path.clone(), direction));
        }

        if fields.is_empty() {
            return None;
        }

        Some(CompoundIndex::new(collection, fields))
    }

    pub fn without_field(&self, path: &str) -> CompoundIndex {
        CompoundIndex {
            collection: self.collection.clone(),
            fields: self.fields.iter().filter(|f| f.path != path).cloned().collect(),
        }
    }

    pub fn with_appended(&self, field: IndexField) -> CompoundIndex {
        let mut fields = self.fields.clone();
        fields.push(field);
        CompoundIndex {
            collection: self.collection.clone(),
            fields,
        }
    }
}

impl fmt::Display for CompoundIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{ ")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", field.path, field.direction)?;
        }
        f.write_str(" }")
    }
}

/// A set of compound indexes, deduplicated by canonical sequence.
#[derive(Debug, Default, Clone)]
pub struct IndexSet {
    indexes: Vec<Arc<CompoundIndex>>,
}

impl IndexSet {
    pub fn push_unique(&mut self, index: Arc<CompoundIndex>) {
        if !self.contains(&index) {
            self.indexes.push(index);
        }
    }

    pub fn contains(&self, index: &CompoundIndex) -> bool {
        let key = index.canonical_key();
        self.indexes.iter().any(|i| i.canonical_key() == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<CompoundIndex>> {
        self.indexes.iter()
    }

    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    pub fn by_collection(&self) -> BTreeMap<&str, Vec<&Arc<CompoundIndex>>> {
        let mut grouped: BTreeMap<&str, Vec<&Arc<CompoundIndex>>> = BTreeMap::new();
        for index in &self.indexes {
            grouped.entry(index.collection()).or_default().push(index);
        }
        grouped
    }
}

impl FromIterator<Arc<CompoundIndex>> for IndexSet {
    fn from_iter<T: IntoIterator<Item = Arc<CompoundIndex>>>(iter: T) -> Self {
        let mut set = IndexSet::default();
        for index in iter {
            set.push_unique(index);
        }
        set
    }
}
