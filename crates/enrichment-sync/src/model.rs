//! Data model shared by every component of the engine.
//!
//! Cell values come in two shapes. Which one a field uses is decided by its
//! owning column (see [`crate::columns::ColumnSet`]), never by inspecting the
//! payload, so the wire decoders here always take the column kind as input.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type TableId = String;
pub type RowId = String;
pub type FieldId = String;

/// Content produced by a background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiValue {
    pub value: Value,
    #[serde(default)]
    pub is_finished: bool,
}

impl AiValue {
    pub fn pending() -> Self {
        Self {
            value: Value::Null,
            is_finished: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Plain(Value),
    Ai(AiValue),
}

impl CellValue {
    /// Decode a raw wire value for a column of the given kind.
    pub fn from_wire(raw: Value, ai_column: bool) -> Self {
        if !ai_column {
            return CellValue::Plain(raw);
        }
        match raw {
            Value::Null => CellValue::Ai(AiValue::pending()),
            Value::Object(obj) if obj.contains_key("value") => {
                let raw = Value::Object(obj);
                match serde_json::from_value::<AiValue>(raw.clone()) {
                    Ok(ai) => CellValue::Ai(ai),
                    Err(_) => CellValue::Ai(AiValue {
                        value: raw,
                        is_finished: false,
                    }),
                }
            }
            other => CellValue::Ai(AiValue {
                value: other,
                is_finished: false,
            }),
        }
    }

    pub fn is_ai(&self) -> bool {
        matches!(self, CellValue::Ai(_))
    }

    pub fn content(&self) -> &Value {
        match self {
            CellValue::Plain(value) => value,
            CellValue::Ai(ai) => &ai.value,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, CellValue::Ai(ai) if ai.is_finished)
    }

    pub fn is_empty(&self) -> bool {
        is_empty_content(self.content())
    }

    /// Replace the content while keeping the wrapper shape.
    pub fn with_content(&self, content: Value) -> Self {
        match self {
            CellValue::Plain(_) => CellValue::Plain(content),
            CellValue::Ai(ai) => CellValue::Ai(AiValue {
                value: content,
                is_finished: ai.is_finished,
            }),
        }
    }
}

fn is_empty_content(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// A loaded row: field id to cell value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Row {
    fields: BTreeMap<FieldId, CellValue>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, field: impl Into<FieldId>, value: CellValue) -> Self {
        self.fields.insert(field.into(), value);
        self
    }

    pub fn get(&self, field: &str) -> Option<&CellValue> {
        self.fields.get(field)
    }

    pub fn set(&mut self, field: impl Into<FieldId>, value: CellValue) {
        self.fields.insert(field.into(), value);
    }

    pub fn remove(&mut self, field: &str) -> Option<CellValue> {
        self.fields.remove(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&FieldId, &CellValue)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field-additive merge. Returns true when anything changed.
    pub fn merge_fields<I>(&mut self, fields: I) -> bool
    where
        I: IntoIterator<Item = (FieldId, CellValue)>,
    {
        let mut changed = false;
        for (field, value) in fields {
            if self.fields.get(&field) != Some(&value) {
                self.fields.insert(field, value);
                changed = true;
            }
        }
        changed
    }
}

/// Row as returned by the remote batch fetch, before column-aware decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowRecord {
    pub id: RowId,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl RowRecord {
    pub fn new(id: impl Into<RowId>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, field: impl Into<String>, value: Value) -> Self {
        self.fields.insert(field.into(), value);
        self
    }
}

/// Lifecycle of a row known to the sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum RowSlot {
    Unloaded,
    /// Not fetched yet, but some fields arrived first (pushed results,
    /// edits). The fetched row is merged beneath them.
    Partial(Arc<Row>),
    Loaded(Arc<Row>),
}

impl RowSlot {
    pub fn is_loaded(&self) -> bool {
        matches!(self, RowSlot::Loaded(_))
    }

    /// The fetched row; `None` until the batch fetch lands.
    pub fn row(&self) -> Option<&Arc<Row>> {
        match self {
            RowSlot::Loaded(row) => Some(row),
            RowSlot::Partial(_) | RowSlot::Unloaded => None,
        }
    }

    /// Every field the client holds for this row, fetched or buffered.
    pub fn known(&self) -> Option<&Arc<Row>> {
        match self {
            RowSlot::Loaded(row) | RowSlot::Partial(row) => Some(row),
            RowSlot::Unloaded => None,
        }
    }
}

/// One entry of the render-ready projection.
#[derive(Debug, Clone, PartialEq)]
pub enum GridRow {
    Loading { id: RowId },
    Loaded { id: RowId, row: Arc<Row> },
}

impl GridRow {
    pub fn id(&self) -> &str {
        match self {
            GridRow::Loading { id } | GridRow::Loaded { id, .. } => id,
        }
    }

    pub fn row(&self) -> Option<&Row> {
        match self {
            GridRow::Loaded { row, .. } => Some(&**row),
            GridRow::Loading { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ai_columns_always_decode_to_wrapper() {
        let finished = CellValue::from_wire(json!({"value": "acme", "isFinished": true}), true);
        assert_eq!(
            finished,
            CellValue::Ai(AiValue {
                value: json!("acme"),
                is_finished: true
            })
        );
        assert!(CellValue::from_wire(json!("bare"), true).is_ai());
        assert_eq!(
            CellValue::from_wire(Value::Null, true),
            CellValue::Ai(AiValue::pending())
        );
    }

    #[test]
    fn plain_columns_keep_objects_verbatim() {
        let raw = json!({"value": "looks like ai", "isFinished": true});
        assert_eq!(
            CellValue::from_wire(raw.clone(), false),
            CellValue::Plain(raw)
        );
    }

    #[test]
    fn emptiness_ignores_whitespace_and_null() {
        assert!(CellValue::Plain(json!("  ")).is_empty());
        assert!(CellValue::Ai(AiValue::pending()).is_empty());
        assert!(!CellValue::Plain(json!(0)).is_empty());
        assert!(!CellValue::Plain(json!(false)).is_empty());
    }

    #[test]
    fn with_content_preserves_shape() {
        let ai = CellValue::Ai(AiValue {
            value: json!("old"),
            is_finished: true,
        });
        let updated = ai.with_content(json!("new"));
        assert!(updated.is_ai());
        assert!(updated.is_finished());
        assert_eq!(updated.content(), &json!("new"));

        let plain = CellValue::Plain(json!("old")).with_content(json!("new"));
        assert_eq!(plain, CellValue::Plain(json!("new")));
    }

    #[test]
    fn merge_fields_reports_changes_only() {
        let mut row = Row::new().with_field("name", CellValue::Plain(json!("Ada")));
        assert!(!row.merge_fields([("name".to_string(), CellValue::Plain(json!("Ada")))]));
        assert!(row.merge_fields([("title".to_string(), CellValue::Plain(json!("CTO")))]));
        assert_eq!(row.len(), 2);
    }

    #[test]
    fn serializes_ai_values_in_wire_shape() {
        let row = Row::new().with_field(
            "summary",
            CellValue::Ai(AiValue {
                value: json!("done"),
                is_finished: true,
            }),
        );
        assert_eq!(
            serde_json::to_value(&row).unwrap(),
            json!({"summary": {"value": "done", "isFinished": true}})
        );
    }
}
