//! Article list rendering.

use sha2::{Digest, Sha256};

/// Render article titles as a single-column TSV, one title per line.
///
/// Tabs and line breaks cannot appear inside a field, so they become `_`
/// like every other whitespace in a wiki title.
pub fn render_tsv(titles: &[String]) -> Vec<u8> {
    let mut out = String::with_capacity(titles.iter().map(|t| t.len() + 1).sum());
    for title in titles {
        for c in title.chars() {
            out.push(if matches!(c, '\t' | '\r' | '\n') { '_' } else { c });
        }
        out.push('\n');
    }
    out.into_bytes()
}

/// Hex-encoded SHA-256 of the artifact bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
