//! Deterministic storage keys for selection artifacts.
//!
//! New artifacts are always written as
//! `selections/{model}/{selection_id}/{name}.{ext}`. Older deployments wrote
//! `selections/{model}/{selection_id}.{ext}`; those keys are still recognized
//! by [`parse_key`] but never produced for new writes.

/// File name used when a selection has no explicit name.
pub const DEFAULT_ARTIFACT_NAME: &str = "selection";

/// Extension used for content types without a known mapping.
pub const UNKNOWN_EXTENSION: &str = "???";

const KEY_PREFIX: &str = "selections";

/// Map a content type to its file extension.
pub fn extension_for(content_type: &str) -> &'static str {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "text/tab-separated-values" => "tsv",
        "text/csv" => "csv",
        "application/json" => "json",
        _ => UNKNOWN_EXTENSION,
    }
}

/// Derive the storage key for a selection artifact.
///
/// `name` falls back to [`DEFAULT_ARTIFACT_NAME`] when absent or blank.
/// Path separators and `%` inside the name are percent-encoded, so the key
/// keeps its shape and distinct names give distinct keys.
pub fn derive_key(
    selection_id: &str,
    content_type: &str,
    model: &str,
    name: Option<&str>,
) -> String {
    let name = name
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(encode_name)
        .unwrap_or_else(|| DEFAULT_ARTIFACT_NAME.to_string());
    format!(
        "{KEY_PREFIX}/{model}/{selection_id}/{name}.{}",
        extension_for(content_type)
    )
}

fn encode_name(name: &str) -> String {
    let mut encoded = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '%' => encoded.push_str("%25"),
            '/' => encoded.push_str("%2F"),
            '\\' => encoded.push_str("%5C"),
            c => encoded.push(c),
        }
    }
    encoded
}

/// The key an artifact would have had under the legacy layout.
pub fn legacy_key(selection_id: &str, content_type: &str, model: &str) -> String {
    format!(
        "{KEY_PREFIX}/{model}/{selection_id}.{}",
        extension_for(content_type)
    )
}

/// Layout a stored key was written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyShape {
    Current,
    Legacy,
}

/// Components recovered from a storage key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey {
    pub shape: KeyShape,
    pub model: String,
    pub selection_id: String,
    /// Decoded artifact name; `None` for legacy keys.
    pub name: Option<String>,
    pub extension: String,
}

/// Classify a storage key. Returns `None` for keys outside the selections namespace.
pub fn parse_key(key: &str) -> Option<ParsedKey> {
    let mut parts = key.split('/');
    if parts.next()? != KEY_PREFIX {
        return None;
    }
    let model = parts.next().filter(|m| !m.is_empty())?;
    let third = parts.next()?;
    let fourth = parts.next();
    if parts.next().is_some() {
        return None;
    }

    match fourth {
        Some(file) => {
            let (name, extension) = file.rsplit_once('.')?;
            if third.is_empty() || name.is_empty() {
                return None;
            }
            Some(ParsedKey {
                shape: KeyShape::Current,
                model: model.to_string(),
                selection_id: third.to_string(),
                name: Some(urlencoding::decode(name).ok()?.into_owned()),
                extension: extension.to_string(),
            })
        }
        None => {
            let (selection_id, extension) = third.rsplit_once('.')?;
            if selection_id.is_empty() {
                return None;
            }
            Some(ParsedKey {
                shape: KeyShape::Legacy,
                model: model.to_string(),
                selection_id: selection_id.to_string(),
                name: None,
                extension: extension.to_string(),
            })
        }
    }
}
