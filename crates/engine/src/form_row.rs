//! Row-level change tracking for editable (form-bound) tables.
//!
//! A `FormRow` carries its own state tag; there is no separate tracker
//! object. Cell edits promote `Old` rows to `Changed`, and never touch rows
//! that are already `Added` or `Deleted`.

use serde::{Deserialize, Serialize};

use sheetsession_protocol::FormValue;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowState {
    /// Unchanged since load or last commit.
    Old,
    Changed,
    Added,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormRow {
    values: Vec<FormValue>,
    labels: Vec<Option<String>>,
    /// Index of the backing source row. `None` for rows with no source.
    base_row: Option<usize>,
    state: RowState,
}

impl FormRow {
    /// New empty row, not backed by a source row.
    pub fn new(width: usize) -> Self {
        Self {
            values: vec![FormValue::Null; width],
            labels: vec![None; width],
            base_row: None,
            state: RowState::Added,
        }
    }

    /// New empty row inserted at a known source position.
    pub fn with_base(width: usize, base_row: usize) -> Self {
        Self {
            base_row: Some(base_row),
            ..Self::new(width)
        }
    }

    /// Row loaded from the source data.
    pub fn from_existing(values: Vec<FormValue>, base_row: usize) -> Self {
        let width = values.len();
        Self {
            values,
            labels: vec![None; width],
            base_row: Some(base_row),
            state: RowState::Old,
        }
    }

    pub fn width(&self) -> usize {
        self.values.len()
    }

    pub fn state(&self) -> RowState {
        self.state
    }

    pub fn base_row(&self) -> Option<usize> {
        self.base_row
    }

    pub fn values(&self) -> &[FormValue] {
        &self.values
    }

    pub fn get(&self, col: usize) -> Result<&FormValue, EngineError> {
        self.check(col)?;
        Ok(&self.values[col])
    }

    pub fn set(&mut self, col: usize, value: FormValue) -> Result<(), EngineError> {
        self.check(col)?;
        self.values[col] = value;
        self.touch();
        Ok(())
    }

    pub fn label(&self, col: usize) -> Result<Option<&str>, EngineError> {
        self.check(col)?;
        Ok(self.labels[col].as_deref())
    }

    pub fn set_label(&mut self, col: usize, label: Option<String>) -> Result<(), EngineError> {
        self.check(col)?;
        self.labels[col] = label;
        self.touch();
        Ok(())
    }

    pub fn delete(&mut self) {
        self.state = RowState::Deleted;
    }

    /// Mark as saved.
    pub fn commit(&mut self) {
        self.state = RowState::Old;
    }

    fn touch(&mut self) {
        if self.state == RowState::Old {
            self.state = RowState::Changed;
        }
    }

    fn check(&self, col: usize) -> Result<(), EngineError> {
        if col >= self.values.len() {
            return Err(EngineError::OutOfRange {
                index: col,
                width: self.values.len(),
            });
        }
        Ok(())
    }
}

/// Buffer of form rows for one editable table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormTable {
    width: usize,
    rows: Vec<FormRow>,
}

impl FormTable {
    pub fn new(width: usize) -> Self {
        Self { width, rows: Vec::new() }
    }

    /// Load source rows; each becomes an `Old` row backed by its position.
    pub fn from_rows(width: usize, rows: Vec<Vec<FormValue>>) -> Self {
        let rows = rows
            .into_iter()
            .enumerate()
            .map(|(i, mut values)| {
                values.resize(width, FormValue::Null);
                FormRow::from_existing(values, i)
            })
            .collect();
        Self { width, rows }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[FormRow] {
        &self.rows
    }

    pub fn row(&self, row: usize) -> Result<&FormRow, EngineError> {
        let rows = self.rows.len();
        self.rows.get(row).ok_or(EngineError::RowOutOfRange { row, rows })
    }

    pub fn row_mut(&mut self, row: usize) -> Result<&mut FormRow, EngineError> {
        let rows = self.rows.len();
        self.rows.get_mut(row).ok_or(EngineError::RowOutOfRange { row, rows })
    }

    /// Append an added row and return its index.
    pub fn append_row(&mut self, base_row: Option<usize>) -> usize {
        self.rows.push(self.blank(base_row));
        self.rows.len() - 1
    }

    /// Insert an added row before `at` (`at == len` appends).
    pub fn insert_row(&mut self, at: usize, base_row: Option<usize>) -> Result<usize, EngineError> {
        if at > self.rows.len() {
            return Err(EngineError::RowOutOfRange { row: at, rows: self.rows.len() });
        }
        let row = self.blank(base_row);
        self.rows.insert(at, row);
        Ok(at)
    }

    /// Mark a row deleted. The row stays in the buffer until `commit`.
    pub fn delete_row(&mut self, row: usize) -> Result<(), EngineError> {
        self.row_mut(row)?.delete();
        Ok(())
    }

    pub fn changed_rows(&self) -> Vec<usize> {
        self.indices(RowState::Changed)
    }

    pub fn added_rows(&self) -> Vec<usize> {
        self.indices(RowState::Added)
    }

    pub fn deleted_rows(&self) -> Vec<usize> {
        self.indices(RowState::Deleted)
    }

    pub fn is_dirty(&self) -> bool {
        self.rows.iter().any(|r| r.state() != RowState::Old)
    }

    /// Drop deleted rows and mark everything else saved.
    pub fn commit(&mut self) {
        self.rows.retain(|r| r.state() != RowState::Deleted);
        for row in &mut self.rows {
            row.commit();
        }
    }

    fn blank(&self, base_row: Option<usize>) -> FormRow {
        match base_row {
            Some(base) => FormRow::with_base(self.width, base),
            None => FormRow::new(self.width),
        }
    }

    fn indices(&self, state: RowState) -> Vec<usize> {
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, r)| r.state() == state)
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn old_row() -> FormRow {
        FormRow::from_existing(vec!["east".into(), 10.0.into()], 0)
    }

    #[test]
    fn new_row_is_added_and_empty() {
        let row = FormRow::new(3);
        assert_eq!(row.state(), RowState::Added);
        assert_eq!(row.base_row(), None);
        assert!(row.values().iter().all(FormValue::is_null));
        assert_eq!(FormRow::with_base(2, 7).base_row(), Some(7));
    }

    #[test]
    fn set_promotes_old_to_changed() {
        let mut row = old_row();
        assert_eq!(row.state(), RowState::Old);
        row.set(1, 11.0.into()).unwrap();
        assert_eq!(row.state(), RowState::Changed);
        row.set(1, 12.0.into()).unwrap();
        assert_eq!(row.state(), RowState::Changed);
        assert_eq!(row.get(1).unwrap(), &FormValue::Number(12.0));
    }

    #[test]
    fn label_edit_promotes_too() {
        let mut row = old_row();
        row.set_label(0, Some("East".into())).unwrap();
        assert_eq!(row.state(), RowState::Changed);
        assert_eq!(row.label(0).unwrap(), Some("East"));
    }

    #[test]
    fn added_row_stays_added() {
        let mut row = FormRow::new(2);
        row.set(0, "x".into()).unwrap();
        row.set_label(1, Some("y".into())).unwrap();
        assert_eq!(row.state(), RowState::Added);
    }

    #[test]
    fn deleted_row_is_not_revived_by_edits() {
        let mut row = old_row();
        row.delete();
        row.set(0, "west".into()).unwrap();
        assert_eq!(row.state(), RowState::Deleted);
    }

    #[test]
    fn delete_and_commit_are_unconditional() {
        for mut row in [old_row(), FormRow::new(2)] {
            row.delete();
            assert_eq!(row.state(), RowState::Deleted);
            row.commit();
            assert_eq!(row.state(), RowState::Old);
        }
    }

    #[test]
    fn out_of_range_access_fails() {
        let mut row = old_row();
        assert_eq!(row.get(2), Err(EngineError::OutOfRange { index: 2, width: 2 }));
        assert!(row.set(5, FormValue::Null).is_err());
        assert!(row.label(2).is_err());
        assert!(row.set_label(2, None).is_err());
        // failed writes leave the state alone
        assert_eq!(row.state(), RowState::Old);
    }

    #[test]
    fn table_tracks_dirty_rows() {
        let mut table = FormTable::from_rows(
            2,
            vec![vec!["a".into(), 1.0.into()], vec!["b".into()], vec!["c".into(), 3.0.into()]],
        );
        assert!(!table.is_dirty());
        assert_eq!(table.row(1).unwrap().get(1).unwrap(), &FormValue::Null);

        table.row_mut(0).unwrap().set(1, 5.0.into()).unwrap();
        table.delete_row(2).unwrap();
        let added = table.append_row(None);

        assert_eq!(table.changed_rows(), vec![0]);
        assert_eq!(table.deleted_rows(), vec![2]);
        assert_eq!(table.added_rows(), vec![added]);
        assert!(table.is_dirty());

        table.commit();
        assert_eq!(table.len(), 3);
        assert!(!table.is_dirty());
    }

    #[test]
    fn insert_row_checks_position() {
        let mut table = FormTable::from_rows(1, vec![vec!["a".into()]]);
        assert_eq!(table.insert_row(0, Some(0)).unwrap(), 0);
        assert_eq!(table.row(0).unwrap().state(), RowState::Added);
        assert_eq!(table.row(1).unwrap().state(), RowState::Old);
        assert_eq!(table.insert_row(2, None).unwrap(), 2);
        assert_eq!(
            table.insert_row(9, None),
            Err(EngineError::RowOutOfRange { row: 9, rows: 3 })
        );
        assert!(table.delete_row(3).is_err());
    }
}
