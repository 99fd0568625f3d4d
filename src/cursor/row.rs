use crate::value::{ColumnInfo, Value};

/// One buffered row.
///
/// The memento holds the values last read from or committed to the backend.
/// It is taken lazily: a row that was never edited has none, and its current
/// values are its original values.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<Value>,
    memento: Option<Vec<Value>>,
    is_new: bool,
}

impl Row {
    /// Row as fetched from the backend.
    pub fn loaded(values: Vec<Value>) -> Self {
        Self {
            values,
            memento: None,
            is_new: false,
        }
    }

    /// Fresh in-memory row of type-appropriate blanks.
    pub fn blank(description: &[ColumnInfo]) -> Self {
        let values: Vec<Value> = description.iter().map(ColumnInfo::blank).collect();
        Self {
            memento: Some(values.clone()),
            values,
            is_new: true,
        }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Write a field, snapshotting the memento first if none exists.
    pub fn set(&mut self, idx: usize, value: Value) {
        if idx >= self.values.len() {
            return;
        }
        self.ensure_memento();
        self.values[idx] = value;
    }

    /// Write a field without touching the memento.
    pub(crate) fn set_raw(&mut self, idx: usize, value: Value) {
        if let Some(slot) = self.values.get_mut(idx) {
            *slot = value;
        }
    }

    pub fn memento(&self) -> Option<&[Value]> {
        self.memento.as_deref()
    }

    /// Value as last read from or committed to the backend.
    pub fn original(&self, idx: usize) -> Option<&Value> {
        match &self.memento {
            Some(memento) => memento.get(idx),
            None => self.values.get(idx),
        }
    }

    pub fn set_memento(&mut self) {
        self.memento = Some(self.values.clone());
    }

    pub fn ensure_memento(&mut self) {
        if self.memento.is_none() {
            self.set_memento();
        }
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn is_changed(&self) -> bool {
        self.is_new || self.memento.as_ref().is_some_and(|m| *m != self.values)
    }

    /// Indexes of fields that must be written.
    ///
    /// Existing rows write fields that differ from the memento. New rows also
    /// write every non-blank field.
    pub fn diff(&self) -> Vec<usize> {
        (0..self.values.len())
            .filter(|&idx| {
                let current = &self.values[idx];
                let differs = self.original(idx) != Some(current);
                differs || (self.is_new && !current.is_blank())
            })
            .collect()
    }

    /// Restore every field from the memento.
    pub fn revert(&mut self) {
        if let Some(memento) = &self.memento {
            self.values = memento.clone();
        }
    }

    /// Record a successful write: the current values become the originals.
    pub(crate) fn mark_saved(&mut self) {
        self.set_memento();
        self.is_new = false;
    }
}
