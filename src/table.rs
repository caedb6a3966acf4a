use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::TableError;

/// A single cell. Missing cells are `Null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Infer a typed value from a raw CSV cell.
    pub fn infer(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Value::Null;
        }
        if let Ok(int) = trimmed.parse::<i64>() {
            return Value::Int(int);
        }
        if let Ok(float) = trimmed.parse::<f64>()
            && float.is_finite()
        {
            return Value::Float(float);
        }
        Value::Text(trimmed.to_string())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view used for model matrices. Booleans count as 0/1.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Value::Null | Value::Text(_) => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "missing",
            Value::Bool(_) => "bool",
            Value::Int(_) | Value::Float(_) => "number",
            Value::Text(_) => "text",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
        }
    }
}

/// Row-major table with named columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self, TableError> {
        let mut table = Self::new(columns);
        for row in rows {
            table.push_row(row)?;
        }
        Ok(table)
    }

    pub fn read_csv(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open table: {}", path.display()))?;
        Self::from_csv_reader(file)
            .with_context(|| format!("Failed to parse CSV table: {}", path.display()))
    }

    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let columns = reader
            .headers()
            .context("Failed to read CSV header")?
            .iter()
            .map(str::to_string)
            .collect::<Vec<_>>();

        let mut table = Self::new(columns);
        for (idx, record) in reader.records().enumerate() {
            let record = record.with_context(|| format!("Failed to read CSV row {}", idx + 1))?;
            table.push_row(record.iter().map(Value::infer).collect())?;
        }
        Ok(table)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> Result<(), TableError> {
        if row.len() != self.columns.len() {
            return Err(TableError::Arity {
                row: self.rows.len(),
                expected: self.columns.len(),
                found: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn column_index(&self, name: &str) -> Result<usize, TableError> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| TableError::MissingColumn(name.to_string()))
    }

    pub fn column_values(&self, name: &str) -> Result<Vec<&Value>, TableError> {
        let idx = self.column_index(name)?;
        Ok(self.rows.iter().map(|row| &row[idx]).collect())
    }

    /// Rewrite every cell of a column in place. The closure receives the row index.
    pub fn map_column<F>(&mut self, name: &str, mut f: F) -> Result<(), TableError>
    where
        F: FnMut(usize, &Value) -> Result<Value, TableError>,
    {
        let idx = self.column_index(name)?;
        for (row_idx, row) in self.rows.iter_mut().enumerate() {
            row[idx] = f(row_idx, &row[idx])?;
        }
        Ok(())
    }

    pub fn drop_column(&mut self, name: &str) -> Result<(), TableError> {
        let idx = self.column_index(name)?;
        self.columns.remove(idx);
        for row in &mut self.rows {
            row.remove(idx);
        }
        Ok(())
    }

    pub fn select(&self, names: &[String]) -> Result<Table, TableError> {
        let indices = names
            .iter()
            .map(|name| self.column_index(name))
            .collect::<Result<Vec<_>, _>>()?;
        let rows = self
            .rows
            .iter()
            .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
            .collect();
        Ok(Table {
            columns: names.to_vec(),
            rows,
        })
    }

    /// Copy the given rows, in the given order.
    pub fn take(&self, indices: &[usize]) -> Table {
        Table {
            columns: self.columns.clone(),
            rows: indices.iter().map(|&i| self.rows[i].clone()).collect(),
        }
    }

    /// Drop rows containing any missing cell. Returns the filtered table and the number dropped.
    pub fn drop_missing(&self) -> (Table, usize) {
        let rows: Vec<_> = self
            .rows
            .iter()
            .filter(|row| !row.iter().any(Value::is_null))
            .cloned()
            .collect();
        let dropped = self.rows.len() - rows.len();
        (
            Table {
                columns: self.columns.clone(),
                rows,
            },
            dropped,
        )
    }

    pub fn numeric_column(&self, name: &str) -> Result<Vec<f64>, TableError> {
        let idx = self.column_index(name)?;
        self.rows
            .iter()
            .enumerate()
            .map(|(row, cells)| {
                cells[idx].as_f64().ok_or_else(|| TableError::NonNumeric {
                    column: name.to_string(),
                    row,
                })
            })
            .collect()
    }

    /// Inner join on `self.left_on == other.right_on`.
    ///
    /// Output rows follow the left table's order, then the right table's order
    /// for repeated keys. Columns present on both sides get `_x`/`_y` suffixes;
    /// when both key columns share a name only the left one is kept. Missing
    /// keys never match.
    pub fn inner_join(
        &self,
        other: &Table,
        left_on: &str,
        right_on: &str,
    ) -> Result<Table, TableError> {
        let left_key = self.column_index(left_on)?;
        let right_key = other.column_index(right_on)?;
        let shared_key = left_on == right_on;

        let left_kind = key_kind(self.rows.iter().map(|row| &row[left_key]), left_on)?;
        let right_kind = key_kind(other.rows.iter().map(|row| &row[right_key]), right_on)?;
        if let (Some(l), Some(r)) = (left_kind, right_kind)
            && l != r
        {
            return Err(TableError::KeyMismatch(format!(
                "'{left_on}' holds {} values, '{right_on}' holds {} values",
                l.as_str(),
                r.as_str()
            )));
        }

        let right_columns: Vec<usize> = (0..other.columns.len())
            .filter(|&i| !(shared_key && i == right_key))
            .collect();
        let left_names: BTreeSet<&str> = self.columns.iter().map(String::as_str).collect();
        let right_names: BTreeSet<&str> = right_columns
            .iter()
            .map(|&i| other.columns[i].as_str())
            .collect();

        let mut columns = Vec::with_capacity(self.columns.len() + right_columns.len());
        for (i, name) in self.columns.iter().enumerate() {
            if right_names.contains(name.as_str()) && !(shared_key && i == left_key) {
                columns.push(format!("{name}_x"));
            } else {
                columns.push(name.clone());
            }
        }
        for &i in &right_columns {
            let name = &other.columns[i];
            if left_names.contains(name.as_str()) {
                columns.push(format!("{name}_y"));
            } else {
                columns.push(name.clone());
            }
        }

        let mut index: HashMap<JoinKey, Vec<usize>> = HashMap::new();
        for (idx, row) in other.rows.iter().enumerate() {
            if let Some(key) = JoinKey::from_value(&row[right_key]) {
                index.entry(key).or_default().push(idx);
            }
        }

        let mut rows = Vec::new();
        for left in &self.rows {
            let Some(key) = JoinKey::from_value(&left[left_key]) else {
                continue;
            };
            let Some(matches) = index.get(&key) else {
                continue;
            };
            for &right_idx in matches {
                let right = &other.rows[right_idx];
                let mut row = left.clone();
                row.extend(right_columns.iter().map(|&i| right[i].clone()));
                rows.push(row);
            }
        }

        Ok(Table { columns, rows })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyKind {
    Number,
    Text,
    Bool,
}

impl KeyKind {
    fn as_str(self) -> &'static str {
        match self {
            KeyKind::Number => "number",
            KeyKind::Text => "text",
            KeyKind::Bool => "bool",
        }
    }
}

fn key_kind<'a>(
    values: impl Iterator<Item = &'a Value>,
    column: &str,
) -> Result<Option<KeyKind>, TableError> {
    let mut kind = None;
    for value in values {
        let current = match value {
            Value::Null => continue,
            Value::Int(_) | Value::Float(_) => KeyKind::Number,
            Value::Text(_) => KeyKind::Text,
            Value::Bool(_) => KeyKind::Bool,
        };
        match kind {
            None => kind = Some(current),
            Some(existing) if existing != current => {
                return Err(TableError::KeyMismatch(format!(
                    "'{column}' mixes {} and {} values",
                    existing.as_str(),
                    current.as_str()
                )));
            }
            Some(_) => {}
        }
    }
    Ok(kind)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum JoinKey {
    Int(i64),
    Float(u64),
    Text(String),
    Bool(bool),
}

impl JoinKey {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Int(v) => Some(JoinKey::Int(*v)),
            Value::Float(v) if v.fract() == 0.0 && v.abs() < i64::MAX as f64 => {
                Some(JoinKey::Int(*v as i64))
            }
            Value::Float(v) => Some(JoinKey::Float(v.to_bits())),
            Value::Text(v) => Some(JoinKey::Text(v.clone())),
            Value::Bool(v) => Some(JoinKey::Bool(*v)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(columns: &[&str], rows: Vec<Vec<Value>>) -> Table {
        Table::from_rows(columns.iter().map(|c| c.to_string()).collect(), rows).unwrap()
    }

    #[test]
    fn csv_cells_are_typed() {
        let csv = "id,rating,flag,price\n1,90%,t,\n2,0.5,f,12\n";
        let parsed = Table::from_csv_reader(csv.as_bytes()).unwrap();
        assert_eq!(parsed.num_rows(), 2);
        assert_eq!(parsed.rows()[0][0], Value::Int(1));
        assert_eq!(parsed.rows()[0][1], Value::Text("90%".into()));
        assert_eq!(parsed.rows()[0][3], Value::Null);
        assert_eq!(parsed.rows()[1][1], Value::Float(0.5));
    }

    #[test]
    fn inner_join_preserves_left_order_and_suffixes_collisions() {
        let left = table(
            &["id", "name"],
            vec![
                vec![Value::Int(2), Value::Text("b".into())],
                vec![Value::Int(1), Value::Text("a".into())],
                vec![Value::Int(3), Value::Text("c".into())],
            ],
        );
        let right = table(
            &["ref", "name"],
            vec![
                vec![Value::Int(1), Value::Text("x".into())],
                vec![Value::Float(2.0), Value::Text("y".into())],
                vec![Value::Int(1), Value::Text("z".into())],
            ],
        );

        let joined = left.inner_join(&right, "id", "ref").unwrap();
        assert_eq!(joined.columns(), ["id", "name_x", "ref", "name_y"]);
        assert_eq!(joined.num_rows(), 3);
        assert_eq!(joined.rows()[0][3], Value::Text("y".into()));
        assert_eq!(joined.rows()[1][3], Value::Text("x".into()));
        assert_eq!(joined.rows()[2][3], Value::Text("z".into()));
    }

    #[test]
    fn join_on_shared_key_name_keeps_one_key_column() {
        let left = table(&["id", "a"], vec![vec![Value::Int(1), Value::Int(10)]]);
        let right = table(&["id", "b"], vec![vec![Value::Int(1), Value::Int(20)]]);
        let joined = left.inner_join(&right, "id", "id").unwrap();
        assert_eq!(joined.columns(), ["id", "a", "b"]);
    }

    #[test]
    fn join_rejects_incomparable_keys() {
        let left = table(&["id"], vec![vec![Value::Int(1)]]);
        let right = table(&["id"], vec![vec![Value::Text("1".into())]]);
        let err = left.inner_join(&right, "id", "id").unwrap_err();
        assert!(matches!(err, TableError::KeyMismatch(_)));
    }

    #[test]
    fn drop_missing_reports_count() {
        let t = table(
            &["a", "b"],
            vec![
                vec![Value::Int(1), Value::Null],
                vec![Value::Int(2), Value::Int(3)],
            ],
        );
        let (filtered, dropped) = t.drop_missing();
        assert_eq!(dropped, 1);
        assert_eq!(filtered.num_rows(), 1);
    }
}
