//! 정규화된 행 변경 이벤트와 기본 키 추출

use crate::error::{CdcError, Result};
use crate::schema::TableMetadata;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// 셀 값 - 이 계층에서 허용되는 모양은 네 가지뿐
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RowValue {
    Null,
    Integer(i64),
    Float(f64),
    String(String),
}

impl RowValue {
    pub fn is_null(&self) -> bool {
        matches!(self, RowValue::Null)
    }
}

impl fmt::Display for RowValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowValue::Null => write!(f, "NULL"),
            RowValue::Integer(i) => write!(f, "{}", i),
            RowValue::Float(v) => write!(f, "{}", v),
            RowValue::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for RowValue {
    fn from(v: i64) -> Self {
        RowValue::Integer(v)
    }
}

impl From<f64> for RowValue {
    fn from(v: f64) -> Self {
        RowValue::Float(v)
    }
}

impl From<&str> for RowValue {
    fn from(v: &str) -> Self {
        RowValue::String(v.to_string())
    }
}

impl From<String> for RowValue {
    fn from(v: String) -> Self {
        RowValue::String(v)
    }
}

/// 행 이미지 - `table.columns` 와 위치로 정렬됨
pub type Row = Vec<RowValue>;

/// 변경 연산 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowAction {
    Insert,
    Update,
    Delete,
}

impl RowAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowAction::Insert => "insert",
            RowAction::Update => "update",
            RowAction::Delete => "delete",
        }
    }
}

impl fmt::Display for RowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 행 변경 이벤트
///
/// insert/delete 는 원소 하나가 행 하나이고, update 는 `[변경 전, 변경 후]` 쌍으로
/// 저장되므로 행 개수가 항상 짝수입니다.
#[derive(Debug, Clone)]
pub struct RowsEvent {
    table: Arc<TableMetadata>,
    action: RowAction,
    rows: Vec<Row>,
}

impl RowsEvent {
    pub fn new(table: Arc<TableMetadata>, action: RowAction, rows: Vec<Row>) -> Result<Self> {
        if rows.is_empty() {
            return Err(CdcError::InvalidEvent(format!(
                "{} event for {} carries no rows",
                action, table
            )));
        }
        if action == RowAction::Update && rows.len() % 2 != 0 {
            return Err(CdcError::InvalidEvent(format!(
                "update event for {} has {} rows, expected before/after pairs",
                table,
                rows.len()
            )));
        }

        Ok(RowsEvent {
            table,
            action,
            rows,
        })
    }

    pub fn table(&self) -> &Arc<TableMetadata> {
        &self.table
    }

    pub fn action(&self) -> RowAction {
        self.action
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// update 이벤트의 `(변경 전, 변경 후)` 쌍
    pub fn update_pairs(&self) -> impl Iterator<Item = (&Row, &Row)> {
        self.rows.chunks_exact(2).map(|pair| (&pair[0], &pair[1]))
    }
}

impl fmt::Display for RowsEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({} rows)", self.table, self.action, self.rows.len())
    }
}

/// 한 행에서 기본 키 값들을 추출 (복합 키 지원)
///
/// 스키마에 컬럼이 추가된 뒤 캡처된 행처럼 현재 컬럼 수보다 짧은 행은 허용하지만,
/// 더 긴 행이나 PK 위치에 값이 없는 행은 에러입니다.
pub fn get_pk_values(table: &TableMetadata, row: &[RowValue]) -> Result<Vec<RowValue>> {
    if table.pk_columns.is_empty() {
        return Err(CdcError::PrimaryKey(format!("table {} has no PK", table)));
    }
    if row.len() > table.columns.len() {
        return Err(CdcError::PrimaryKey(format!(
            "table {} has {} columns, but row data {:?} len is {}",
            table,
            table.columns.len(),
            row,
            row.len()
        )));
    }

    let mut values = Vec::with_capacity(table.pk_columns.len());
    for &index in &table.pk_columns {
        let value = match row.get(index) {
            Some(v) if !v.is_null() && !v.to_string().is_empty() => v,
            _ => {
                return Err(CdcError::PrimaryKey(format!(
                    "row in {} has no PK at column {}: {:?}",
                    table, index, row
                )))
            }
        };
        values.push(value.clone());
    }

    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnType, TableColumn};

    fn table(pk: Vec<usize>) -> Arc<TableMetadata> {
        Arc::new(TableMetadata::new(
            "test",
            "t",
            vec![
                TableColumn::new("a", ColumnType::String),
                TableColumn::new("b", ColumnType::String),
                TableColumn::new("c", ColumnType::String),
                TableColumn::new("d", ColumnType::String),
            ],
            pk,
        ))
    }

    fn row(values: &[&str]) -> Row {
        values.iter().map(|v| RowValue::from(*v)).collect()
    }

    #[test]
    fn test_composite_pk() {
        let pk = get_pk_values(&table(vec![1, 3]), &row(&["a", "b", "c", "d"])).unwrap();
        assert_eq!(pk, vec![RowValue::from("b"), RowValue::from("d")]);
    }

    #[test]
    fn test_no_pk_columns_is_error() {
        let err = get_pk_values(&table(vec![]), &row(&["a", "b", "c", "d"])).unwrap_err();
        assert!(matches!(err, CdcError::PrimaryKey(_)));
    }

    #[test]
    fn test_shorter_row_is_tolerated() {
        let pk = get_pk_values(&table(vec![0]), &row(&["a", "b"])).unwrap();
        assert_eq!(pk, vec![RowValue::from("a")]);
    }

    #[test]
    fn test_longer_row_is_error() {
        let result = get_pk_values(&table(vec![0]), &row(&["a", "b", "c", "d", "e"]));
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_pk_value_is_error() {
        assert!(get_pk_values(&table(vec![3]), &row(&["a", "b"])).is_err());
        assert!(get_pk_values(&table(vec![0]), &row(&["", "b"])).is_err());

        let with_null = vec![RowValue::Null, RowValue::from("b")];
        assert!(get_pk_values(&table(vec![0]), &with_null).is_err());
    }

    #[test]
    fn test_update_event_requires_pairs() {
        let odd = RowsEvent::new(table(vec![0]), RowAction::Update, vec![row(&["1"])]);
        assert!(odd.is_err());

        let event = RowsEvent::new(
            table(vec![0]),
            RowAction::Update,
            vec![row(&["1", "x"]), row(&["1", "z"])],
        )
        .unwrap();
        let pairs: Vec<_> = event.update_pairs().collect();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0[1], RowValue::from("x"));
        assert_eq!(pairs[0].1[1], RowValue::from("z"));
    }

    #[test]
    fn test_row_value_json_shape() {
        let values = vec![
            RowValue::Null,
            RowValue::Integer(7),
            RowValue::Float(1.5),
            RowValue::from("hi"),
        ];
        let json = serde_json::to_string(&values).unwrap();
        assert_eq!(json, r#"[null,7,1.5,"hi"]"#);
    }
}
