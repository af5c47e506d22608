//! Image path normalization.
//!
//! Graph keys are bare file names. Callers pass paths in several
//! conventions (`images/foo.jpg`, `foo.jpg`, `/srv/app/images/foo.jpg`),
//! so lookups walk a fixed, purely string-based chain of variants.

/// Conventional prefix used by the frontend when referring to images.
pub const DEFAULT_PATH_PREFIX: &str = "images/";

/// Reduce any path form to its graph key: the bare file name.
///
/// Strips one leading [`DEFAULT_PATH_PREFIX`], then every directory
/// component (both `/` and `\` separators).
pub fn normalize_image_path(path: &str) -> String {
    normalize_with_prefix(path, DEFAULT_PATH_PREFIX)
}

/// [`normalize_image_path`] with a caller-chosen prefix.
pub fn normalize_with_prefix(path: &str, prefix: &str) -> String {
    let stripped = if !prefix.is_empty() {
        path.strip_prefix(prefix).unwrap_or(path)
    } else {
        path
    };
    basename(stripped).to_string()
}

fn basename(path: &str) -> &str {
    match path.rfind(|c: char| c == '/' || c == '\\') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Candidate keys for resolving `raw`, in lookup order.
///
/// 1. `raw` as given
/// 2. `raw` with `prefix` removed (only if it starts with it)
/// 3. `prefix + raw` (only if it does not)
/// 4. the normalized file name
///
/// Duplicates and empty strings are dropped; the first variant that
/// resolves to a node wins.
pub fn lookup_variants(raw: &str, prefix: &str) -> Vec<String> {
    let mut variants: Vec<String> = Vec::with_capacity(4);
    let mut push = |candidate: String| {
        if !candidate.is_empty() && !variants.contains(&candidate) {
            variants.push(candidate);
        }
    };

    push(raw.to_string());
    if !prefix.is_empty() {
        match raw.strip_prefix(prefix) {
            Some(rest) => push(rest.to_string()),
            None => push(format!("{prefix}{raw}")),
        }
    }
    push(normalize_with_prefix(raw, prefix));
    variants
}

/// True when a normalized key cannot name a file inside the images directory.
///
/// Only whole-component `.` and `..` are rejected; `b..jpg` is an ordinary
/// file name.
pub fn is_unsafe_name(name: &str) -> bool {
    matches!(name, "" | "." | "..") || name.contains('/') || name.contains('\\')
}
