//! Structural validation of distilled profiles.
//!
//! The accepted shape is described by [`PROFILE_FIELDS`], a table of field
//! descriptors compiled once into a JSON Schema. Adding a profile field means
//! adding a row here (and to [`UserProfile`]).

use std::sync::OnceLock;

use serde_json::{Value, json};
use thiserror::Error;

use mnemo_types::UserProfile;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("response is not valid JSON: {0}")]
    Syntax(String),
    #[error("response is not a single JSON object")]
    NotAnObject,
    #[error("profile does not match schema: {0}")]
    Schema(String),
    #[error("profile schema failed to compile: {0}")]
    BadSchema(String),
}

#[derive(Debug, Clone, Copy)]
enum FieldKind {
    /// Object whose values are all strings.
    TextMap,
    /// List of `(text, integer in 0..=100, text)` triples.
    AssessmentList,
    TextList,
    Text,
}

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    kind: FieldKind,
    max_items: Option<usize>,
}

const LIST_LIMIT: usize = UserProfile::MAX_LIST_ENTRIES;

const PROFILE_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        name: "basic_info",
        kind: FieldKind::TextMap,
        max_items: None,
    },
    FieldSpec {
        name: "traits",
        kind: FieldKind::AssessmentList,
        max_items: Some(LIST_LIMIT),
    },
    FieldSpec {
        name: "skills",
        kind: FieldKind::AssessmentList,
        max_items: Some(LIST_LIMIT),
    },
    FieldSpec {
        name: "factual_history",
        kind: FieldKind::TextList,
        max_items: Some(LIST_LIMIT),
    },
    FieldSpec {
        name: "summary",
        kind: FieldKind::Text,
        max_items: None,
    },
];

fn field_schema(spec: &FieldSpec) -> Value {
    let mut schema = match spec.kind {
        FieldKind::TextMap => json!({
            "type": "object",
            "additionalProperties": { "type": "string" }
        }),
        FieldKind::AssessmentList => json!({
            "type": "array",
            "items": {
                "type": "array",
                "prefixItems": [
                    { "type": "string" },
                    { "type": "integer", "minimum": 0, "maximum": UserProfile::MAX_STRENGTH },
                    { "type": "string" }
                ],
                "minItems": 3,
                "maxItems": 3
            }
        }),
        FieldKind::TextList => json!({
            "type": "array",
            "items": { "type": "string" }
        }),
        FieldKind::Text => json!({ "type": "string" }),
    };
    if let (Some(max), Some(object)) = (spec.max_items, schema.as_object_mut()) {
        object.insert("maxItems".to_string(), json!(max));
    }
    schema
}

/// JSON Schema (draft 2020-12) for a distilled profile.
#[must_use]
pub fn profile_schema() -> Value {
    let properties: serde_json::Map<String, Value> = PROFILE_FIELDS
        .iter()
        .map(|spec| (spec.name.to_string(), field_schema(spec)))
        .collect();
    let required: Vec<&str> = PROFILE_FIELDS.iter().map(|spec| spec.name).collect();
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "properties": properties,
        "required": required
    })
}

fn validator() -> Result<&'static jsonschema::Validator, ValidationError> {
    static VALIDATOR: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();
    VALIDATOR
        .get_or_init(|| jsonschema::validator_for(&profile_schema()).map_err(|e| e.to_string()))
        .as_ref()
        .map_err(|e| ValidationError::BadSchema(e.clone()))
}

/// Parse and validate a raw distillation reply.
pub fn validate_profile(raw: &str) -> Result<UserProfile, ValidationError> {
    let value: Value =
        serde_json::from_str(raw.trim()).map_err(|e| ValidationError::Syntax(e.to_string()))?;
    if !value.is_object() {
        return Err(ValidationError::NotAnObject);
    }

    if let Err(err) = validator()?.validate(&value) {
        return Err(ValidationError::Schema(err.to_string()));
    }

    // The schema admits integral floats such as 50.0 for strengths; serde
    // does not, so this can still fail.
    serde_json::from_value(value).map_err(|e| ValidationError::Schema(e.to_string()))
}
