use serde_json::Value as JsonValue;

/// Path that refers to the document root (emitted for top-level scalars).
pub const ROOT_PATH: &str = "$";

/// Splits a path into key/index segments.
///
/// `items[2].price` becomes `items`, `2`, `price`. Empty pieces (`a..b`,
/// `[]`) are dropped.
pub fn segments(path: &str) -> Vec<&str> {
    path.split('.')
        .flat_map(|part| part.split(['[', ']']))
        .filter(|s| !s.is_empty())
        .collect()
}

fn is_index(seg: &str) -> bool {
    seg.bytes().all(|b| b.is_ascii_digit())
}

/// Resolves `path` against `root`.
///
/// Never fails: mismatched shapes, missing keys, out-of-range indices and
/// malformed paths all yield `None`. An all-digit segment indexes arrays; on
/// anything else it is used as a literal object key, so `{"0": x}` resolves
/// `"0"` to `x`.
pub fn resolve<'a>(root: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    if path.is_empty() {
        return None;
    }
    if path == ROOT_PATH {
        return Some(root);
    }

    let mut cur = root;
    for seg in segments(path) {
        cur = match cur {
            JsonValue::Null => return None,
            JsonValue::Array(items) if is_index(seg) => items.get(seg.parse::<usize>().ok()?)?,
            JsonValue::Object(map) => map.get(seg)?,
            _ => return None,
        };
    }
    Some(cur)
}

/// Resolves an optional path; `None` and `""` resolve to nothing.
pub fn resolve_opt<'a>(root: &'a JsonValue, path: Option<&str>) -> Option<&'a JsonValue> {
    path.and_then(|p| resolve(root, p))
}
