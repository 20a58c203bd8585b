//! Typed key shapes for the assignment data map.
//!
//! The data map is not an open-ended object: every workflow-editable key is
//! declared by the owning template and namespaced by a shape prefix. Writes
//! are validated here, at the edit boundary, not inside each handler.
//! Workflow-owned keys (e.g. the promotion records appended by the promotion
//! workflow) are not template fields and are rejected at this boundary.

use rusqlite::{Connection, OptionalExtension};
use serde_json::{Map, Value};

use crate::error::WorkflowError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    LanguageToggle,
    TableRow,
    Dropdown,
    FreeText,
}

impl FieldKind {
    pub fn token(self) -> &'static str {
        match self {
            FieldKind::LanguageToggle => "language_toggle",
            FieldKind::TableRow => "table_row",
            FieldKind::Dropdown => "dropdown",
            FieldKind::FreeText => "free_text",
        }
    }

    pub fn from_token(s: &str) -> Option<Self> {
        match s {
            "language_toggle" => Some(FieldKind::LanguageToggle),
            "table_row" => Some(FieldKind::TableRow),
            "dropdown" => Some(FieldKind::Dropdown),
            "free_text" => Some(FieldKind::FreeText),
            _ => None,
        }
    }

    pub fn prefix(self) -> &'static str {
        match self {
            FieldKind::LanguageToggle => "lang:",
            FieldKind::TableRow => "row:",
            FieldKind::Dropdown => "choice:",
            FieldKind::FreeText => "text:",
        }
    }

    fn value_fits(self, v: &Value) -> bool {
        if v.is_null() {
            // null clears the field
            return true;
        }
        match self {
            FieldKind::LanguageToggle => v.is_boolean(),
            FieldKind::TableRow => v.is_array() || v.is_object(),
            FieldKind::Dropdown | FieldKind::FreeText => v.is_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TemplateField {
    pub key: String,
    pub kind: FieldKind,
}

pub fn load_template_fields(
    conn: &Connection,
    template_id: &str,
) -> Result<Vec<TemplateField>, WorkflowError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT fields FROM templates WHERE id = ?",
            [template_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(raw) = raw else {
        return Err(WorkflowError::NotFound("template"));
    };

    let parsed: Value = serde_json::from_str(&raw).unwrap_or(Value::Array(vec![]));
    let Value::Array(entries) = parsed else {
        return Ok(Vec::new());
    };

    let mut fields = Vec::with_capacity(entries.len());
    for entry in entries {
        let key = entry
            .get("key")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let kind = entry
            .get("kind")
            .and_then(|v| v.as_str())
            .and_then(FieldKind::from_token);
        let (Some(kind), false) = (kind, key.is_empty()) else {
            return Err(WorkflowError::InvalidArgument(format!(
                "template declares a malformed field: {entry}"
            )));
        };
        fields.push(TemplateField { key, kind });
    }
    Ok(fields)
}

pub fn validate_patch(
    fields: &[TemplateField],
    patch: &Map<String, Value>,
) -> Result<(), WorkflowError> {
    for (key, value) in patch {
        let Some(field) = fields.iter().find(|f| f.key == *key) else {
            return Err(WorkflowError::InvalidArgument(format!(
                "unknown data field '{key}'"
            )));
        };
        if !key.starts_with(field.kind.prefix()) {
            return Err(WorkflowError::InvalidArgument(format!(
                "field '{key}' does not carry the '{}' shape prefix of its declared kind",
                field.kind.prefix()
            )));
        }
        if !field.kind.value_fits(value) {
            return Err(WorkflowError::InvalidArgument(format!(
                "value for '{key}' does not fit its {} shape",
                field.kind.token()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields() -> Vec<TemplateField> {
        vec![
            TemplateField {
                key: "text:remarks".into(),
                kind: FieldKind::FreeText,
            },
            TemplateField {
                key: "lang:greeting".into(),
                kind: FieldKind::LanguageToggle,
            },
            TemplateField {
                key: "row:motor-skills".into(),
                kind: FieldKind::TableRow,
            },
        ]
    }

    fn patch(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn declared_keys_with_fitting_values_pass() {
        let p = patch(json!({
            "text:remarks": "bon travail",
            "lang:greeting": true,
            "row:motor-skills": ["acquired", "in_progress"],
        }));
        assert!(validate_patch(&fields(), &p).is_ok());
    }

    #[test]
    fn undeclared_key_is_rejected() {
        let p = patch(json!({ "text:other": "x" }));
        assert!(matches!(
            validate_patch(&fields(), &p),
            Err(WorkflowError::InvalidArgument(_))
        ));
    }

    #[test]
    fn workflow_owned_keys_are_rejected_at_the_edit_boundary() {
        let p = patch(json!({ "promotions": [] }));
        assert!(validate_patch(&fields(), &p).is_err());
    }

    #[test]
    fn value_shape_must_match_kind() {
        let p = patch(json!({ "lang:greeting": "oui" }));
        assert!(validate_patch(&fields(), &p).is_err());
        let p = patch(json!({ "text:remarks": 42 }));
        assert!(validate_patch(&fields(), &p).is_err());
    }

    #[test]
    fn null_clears_any_field() {
        let p = patch(json!({ "text:remarks": null, "lang:greeting": null }));
        assert!(validate_patch(&fields(), &p).is_ok());
    }
}
