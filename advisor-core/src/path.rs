//! Dotted field paths. Array element positions are collapsed during document
//! flattening, so `names.0.first` and `names.1.first` both land on
//! `names.first`; an empty array gets a synthetic `[]` leaf segment.

/// Segment appended for an empty array so the field still shows up in the
/// statistics.
pub(crate) const EMPTY_ARRAY_SEGMENT: &str = "[]";

/// MongoDB forbids `.` in document keys on some versions, so persisted map
/// keys replace it with this separator.
const DOT_SEPARATOR: &str = "_____";

pub(crate) fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_owned()
    } else {
        format!("{prefix}.{key}")
    }
}

/// All strict ancestors of a path, shortest first: `a.b.c` yields `a`, `a.b`.
pub(crate) fn strict_prefixes(path: &str) -> impl Iterator<Item = &str> {
    path.char_indices()
        .filter(|(_, c)| *c == '.')
        .map(move |(i, _)| &path[..i])
}

pub(crate) fn encode_key(key: &str) -> String {
    key.replace('.', DOT_SEPARATOR)
}

pub(crate) fn decode_key(key: &str) -> String {
    key.replace(DOT_SEPARATOR, ".")
}
