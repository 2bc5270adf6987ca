use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::{CellValue, FieldId, Row};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub id: FieldId,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    /// Key of the action that fills this column, if any.
    #[serde(default)]
    pub generator: Option<String>,
    /// Another column that this column's job also writes.
    #[serde(default)]
    pub dependent_field_id: Option<FieldId>,
}

impl Column {
    pub fn plain(id: impl Into<FieldId>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind: "text".into(),
            generator: None,
            dependent_field_id: None,
        }
    }

    pub fn generated(id: impl Into<FieldId>, generator: impl Into<String>) -> Self {
        Self {
            generator: Some(generator.into()),
            ..Self::plain(id)
        }
    }

    pub fn with_dependent(mut self, field: impl Into<FieldId>) -> Self {
        self.dependent_field_id = Some(field.into());
        self
    }
}

/// Read-only column list with its derived AI-column set.
#[derive(Debug, Clone, Default)]
pub struct ColumnSet {
    columns: Vec<Column>,
    by_id: HashMap<FieldId, usize>,
    ai: HashSet<FieldId>,
}

impl ColumnSet {
    pub fn new(columns: Vec<Column>, ai_actions: &[String]) -> Self {
        let by_id = columns
            .iter()
            .enumerate()
            .map(|(idx, column)| (column.id.clone(), idx))
            .collect();
        let mut ai = HashSet::new();
        for column in &columns {
            let known_action = column
                .generator
                .as_deref()
                .is_some_and(|key| ai_actions.iter().any(|action| action == key));
            if known_action || column.dependent_field_id.is_some() {
                ai.insert(column.id.clone());
            }
            if let Some(dependent) = &column.dependent_field_id {
                ai.insert(dependent.clone());
            }
        }
        Self { columns, by_id, ai }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn get(&self, id: &str) -> Option<&Column> {
        self.by_id.get(id).map(|&idx| &self.columns[idx])
    }

    pub fn is_ai(&self, id: &str) -> bool {
        self.ai.contains(id)
    }

    pub fn ai_columns(&self) -> impl Iterator<Item = &FieldId> {
        self.ai.iter()
    }

    pub fn dependent_of(&self, id: &str) -> Option<&FieldId> {
        self.get(id).and_then(|column| column.dependent_field_id.as_ref())
    }

    pub fn decode(&self, field: &str, raw: Value) -> CellValue {
        CellValue::from_wire(raw, self.is_ai(field))
    }

    /// Decode a whole wire field map into a row.
    pub fn decode_row(&self, fields: Map<String, Value>) -> Row {
        let mut row = Row::new();
        for (field, raw) in fields {
            let value = self.decode(&field, raw);
            row.set(field, value);
        }
        row
    }
}
