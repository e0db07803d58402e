//! `simple` model: an explicit list of article titles.

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;
use wikiselect_shared::Result;

use crate::{BuilderModel, FieldError, Validation, normalize_title};

/// Characters that can never appear in a wiki title.
const INVALID_CHARS: &[char] = &['#', '<', '>', '[', ']', '{', '}', '|'];

const MAX_TITLE_BYTES: usize = 256;

const MAX_LIST_BYTES: usize = 1024 * 1024;

const FIELD: &str = "list";

/// Titles given directly in `params.list`, as an array or a newline-separated string.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleModel;

#[async_trait]
impl BuilderModel for SimpleModel {
    fn tag(&self) -> &'static str {
        "simple"
    }

    fn validate(&self, project: &str, params: &Value) -> Validation {
        let mut validation = Validation::default();

        let items: Vec<&str> = match params.get(FIELD) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::String(s)) => s.lines().collect(),
            Some(Value::Array(values)) => {
                let mut items = Vec::with_capacity(values.len());
                for value in values {
                    match value.as_str() {
                        Some(s) => items.push(s),
                        None => validation.rejected.push(value.to_string()),
                    }
                }
                items
            }
            Some(_) => {
                validation.errors.push(FieldError::new(
                    FIELD,
                    "The list must be an array of titles or a newline-separated string",
                ));
                return validation;
            }
        };

        let raw_size: usize = items.iter().map(|s| s.len() + 1).sum();
        if raw_size > MAX_LIST_BYTES {
            validation
                .errors
                .push(FieldError::new(FIELD, "The list was more than 1MB long"));
            return validation;
        }

        let mut invalid_chars = Vec::new();
        let mut too_long = Vec::new();
        let mut seen = HashSet::new();
        for item in items {
            if item.trim().is_empty() {
                continue;
            }
            let title = normalize_title(item, project);
            if title.contains(INVALID_CHARS) {
                invalid_chars.push(title);
            } else if title.len() > MAX_TITLE_BYTES {
                too_long.push(title);
            } else if seen.insert(title.clone()) {
                validation.accepted.push(title);
            }
        }

        if !invalid_chars.is_empty() {
            validation.errors.push(FieldError::new(
                FIELD,
                format!(
                    "The list contained the following invalid characters: {}",
                    invalid_chars.join(", ")
                ),
            ));
        }
        if !too_long.is_empty() {
            validation.errors.push(FieldError::new(
                FIELD,
                format!(
                    "The list contained the following invalid items, longer than 256 bytes: {}",
                    too_long.join(", ")
                ),
            ));
        }
        if !validation.rejected.is_empty() {
            validation.errors.push(FieldError::new(
                FIELD,
                "The list may only contain strings",
            ));
        }
        validation.rejected.extend(invalid_chars);
        validation.rejected.extend(too_long);

        if validation.accepted.is_empty() && validation.errors.is_empty() {
            validation.errors.push(FieldError::new(FIELD, "Empty list"));
        }
        validation
    }

    async fn materialize(&self, project: &str, params: &Value) -> Result<Vec<String>> {
        self.validate(project, params).into_result()
    }
}
