//! Identifier and href rules shared by the package model and the emitter.

/// Whether `c` may appear in a package item id.
fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
}

/// Whether `id` matches `[A-Za-z_][A-Za-z0-9_.-]*`.
pub fn is_valid_id(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => chars.all(is_id_char),
        _ => false,
    }
}

/// Replaces every character outside the id alphabet with `_`.
///
/// The result may still start with a digit; use [`sanitize_id`] for a full id.
pub fn id_fragment(raw: &str) -> String {
    let fragment: String = raw
        .trim()
        .chars()
        .map(|c| if is_id_char(c) { c } else { '_' })
        .collect();
    if fragment.is_empty() {
        "_".to_string()
    } else {
        fragment
    }
}

/// Turns any string into a valid item id.
pub fn sanitize_id(raw: &str) -> String {
    let fragment = id_fragment(raw);
    if is_valid_id(&fragment) {
        fragment
    } else {
        format!("id_{}", fragment)
    }
}

/// Replaces spaces in a container-relative href with underscores.
pub fn normalize_href(href: &str) -> String {
    href.trim().replace(' ', "_")
}

/// `base`, or `base_2`, `base_3`, ... for the first value `taken` rejects.
pub fn unique_id(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{}_{}", base, n))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| base.to_string())
}

/// Like [`unique_id`] but inserts the suffix before the file extension.
pub fn unique_href(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    let (stem, ext) = match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.contains('/') => (stem, Some(ext)),
        _ => (base, None),
    };
    (2..)
        .map(|n| match ext {
            Some(ext) => format!("{}_{}.{}", stem, n, ext),
            None => format!("{}_{}", stem, n),
        })
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| base.to_string())
}
