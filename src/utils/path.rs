//! Lexical path helpers.
//!
//! Paths here are plain strings that never touch the host filesystem: cleaning
//! collapses separators and resolves `.`/`..` purely textually, and splitting
//! separates the final component from its directory prefix.

/// Lexically clean a slash-separated path.
///
/// - Collapses repeated separators and eliminates `.` components.
/// - Resolves `..` against preceding components; `..` at the root is dropped,
///   `..` leading a relative path is kept.
/// - Returns `"."` for an empty result.
pub(crate) fn clean(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let b = path.as_bytes();
    let n = b.len();
    let rooted = b[0] == b'/';
    let mut out: Vec<u8> = Vec::with_capacity(n);
    let mut r = 0;
    // Index in `out` below which `..` must not backtrack.
    let mut dotdot = 0;
    if rooted {
        out.push(b'/');
        r = 1;
        dotdot = 1;
    }
    while r < n {
        if b[r] == b'/' {
            r += 1;
        } else if b[r] == b'.' && (r + 1 == n || b[r + 1] == b'/') {
            r += 1;
        } else if b[r] == b'.' && b[r + 1] == b'.' && (r + 2 == n || b[r + 2] == b'/') {
            r += 2;
            if out.len() > dotdot {
                // Drop the previous component.
                let mut w = out.len() - 1;
                while w > dotdot && out[w] != b'/' {
                    w -= 1;
                }
                out.truncate(w);
            } else if !rooted {
                if !out.is_empty() {
                    out.push(b'/');
                }
                out.extend_from_slice(b"..");
                dotdot = out.len();
            }
        } else {
            if (rooted && out.len() != 1) || (!rooted && !out.is_empty()) {
                out.push(b'/');
            }
            while r < n && b[r] != b'/' {
                out.push(b[r]);
                r += 1;
            }
        }
    }
    if out.is_empty() {
        return ".".to_string();
    }
    // Only ASCII separators were inspected, so multi-byte characters pass
    // through intact.
    String::from_utf8(out).expect("cleaned path is valid utf-8")
}

/// Split a path at its final separator, keeping the separator on the
/// directory half. A path with no separator is all file name.
pub(crate) fn split(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(i) => (&path[..i + 1], &path[i + 1..]),
        None => ("", path),
    }
}
