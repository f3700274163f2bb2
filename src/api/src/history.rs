//! In-memory per-patient feature history for the lifetime of the process.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::types::FeatureRow;

/// Outcome of recording a day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upsert {
    /// Days now held for the patient
    pub days: usize,
    /// An existing row for the same date was replaced
    pub replaced: bool,
}

/// Date-ordered histories keyed by patient id.
#[derive(Debug, Default)]
pub struct HistoryStore {
    inner: RwLock<HashMap<String, Vec<FeatureRow>>>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a day, replacing any row already recorded for that date.
    pub fn upsert_day(&self, patient_id: &str, row: FeatureRow) -> Upsert {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let rows = guard.entry(patient_id.to_string()).or_default();

        let replaced = match rows.binary_search_by_key(&row.date, |r| r.date) {
            Ok(idx) => {
                rows[idx] = row;
                true
            }
            Err(idx) => {
                rows.insert(idx, row);
                false
            }
        };

        Upsert {
            days: rows.len(),
            replaced,
        }
    }

    /// Copy of a patient's history, `None` for an unknown patient.
    pub fn history(&self, patient_id: &str) -> Option<Vec<FeatureRow>> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        guard.get(patient_id).cloned()
    }
}
