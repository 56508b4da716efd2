//! The sub-task ledger: ordered records plus every rule for mutating them.
//!
//! # Invariants
//! - Length is fixed between `initialize` calls
//! - Status only moves forward (see [`SubtaskStatus::can_transition_to`])
//! - Sources are deduplicated by uri in first-seen order
//!
//! Records are stored behind `Arc` so `snapshot()` is a shallow copy; the one
//! record being streamed into is copied on write.

use std::sync::Arc;

use super::{Source, SubtaskRecord, SubtaskStatus};
use crate::llm::Citation;

/// Errors from ledger mutations.
///
/// Every variant indicates a caller bug; the ledger is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("Cannot re-initialize the ledger while sub-task {0} is in progress")]
    RunInProgress(usize),

    #[error("Sub-task index {index} is out of range (ledger has {len} records)")]
    OutOfRange { index: usize, len: usize },

    #[error("Sub-task {index} cannot move from {from} to {to}")]
    InvalidTransition {
        index: usize,
        from: SubtaskStatus,
        to: SubtaskStatus,
    },

    #[error("Sub-task {index} is {status}, expected {expected}")]
    NotActive {
        index: usize,
        status: SubtaskStatus,
        expected: SubtaskStatus,
    },
}

/// Ordered, fixed-length collection of sub-task records.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    records: Vec<Arc<SubtaskRecord>>,
}

impl Ledger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the ledger with one pending record per description, in order.
    ///
    /// # Errors
    /// Returns `RunInProgress` if any current record is Reflecting or Executing.
    pub fn initialize<I, S>(&mut self, descriptions: I) -> Result<(), LedgerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(index) = self.records.iter().position(|r| r.status.is_in_progress()) {
            return Err(LedgerError::RunInProgress(index));
        }
        self.records = descriptions
            .into_iter()
            .map(|d| Arc::new(SubtaskRecord::new(d)))
            .collect();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SubtaskRecord> {
        self.records.get(index).map(|r| r.as_ref())
    }

    /// All records in plan order.
    pub fn records(&self) -> &[Arc<SubtaskRecord>] {
        &self.records
    }

    /// Number of records that reached `Completed`.
    pub fn completed_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.status == SubtaskStatus::Completed)
            .count()
    }

    /// Index of the record currently being worked on, if any.
    pub fn current_index(&self) -> Option<usize> {
        self.records.iter().position(|r| r.status.is_in_progress())
    }

    /// Move record `index` to `status`.
    ///
    /// # Errors
    /// Returns `InvalidTransition` for anything but a forward step; the
    /// record is left untouched.
    pub fn set_status(&mut self, index: usize, status: SubtaskStatus) -> Result<(), LedgerError> {
        let record = self.record_mut(index)?;
        if !record.status.can_transition_to(status) {
            return Err(LedgerError::InvalidTransition {
                index,
                from: record.status,
                to: status,
            });
        }
        Arc::make_mut(record).status = status;
        Ok(())
    }

    /// Append a reflection delta. Only valid while the record is Reflecting.
    pub fn append_reflection(&mut self, index: usize, delta: &str) -> Result<(), LedgerError> {
        let record = self.active_record(index, SubtaskStatus::Reflecting)?;
        record.reflection.push_str(delta);
        Ok(())
    }

    /// Append a result delta. Only valid while the record is Executing.
    pub fn append_result(&mut self, index: usize, delta: &str) -> Result<(), LedgerError> {
        let record = self.active_record(index, SubtaskStatus::Executing)?;
        record.result.push_str(delta);
        Ok(())
    }

    /// Merge citations into the record's sources, skipping citations without
    /// a uri and uris already recorded. Only valid while Executing.
    ///
    /// Returns the number of sources added.
    pub fn merge_sources(
        &mut self,
        index: usize,
        citations: &[Citation],
    ) -> Result<usize, LedgerError> {
        // Check first so a no-op merge doesn't copy a shared record.
        self.expect_status(index, SubtaskStatus::Executing)?;
        let fresh: Vec<Source> = {
            let existing = &self.records[index].sources;
            let mut fresh: Vec<Source> = Vec::new();
            for citation in citations {
                let Some(uri) = citation.uri.as_deref().filter(|u| !u.trim().is_empty()) else {
                    continue;
                };
                if existing.iter().chain(fresh.iter()).any(|s| s.uri == uri) {
                    continue;
                }
                fresh.push(Source {
                    uri: uri.to_string(),
                    title: citation.title.clone(),
                });
            }
            fresh
        };

        let added = fresh.len();
        if added > 0 {
            Arc::make_mut(&mut self.records[index]).sources.extend(fresh);
        }
        Ok(added)
    }

    /// Terminate record `index` as Failed, replacing its result with
    /// `message`.
    pub fn fail(&mut self, index: usize, message: impl Into<String>) -> Result<(), LedgerError> {
        self.set_status(index, SubtaskStatus::Failed)?;
        Arc::make_mut(&mut self.records[index]).result = message.into();
        Ok(())
    }

    /// Immutable copy of the ledger for presentation.
    pub fn snapshot(&self) -> Vec<Arc<SubtaskRecord>> {
        self.records.clone()
    }

    fn record_mut(&mut self, index: usize) -> Result<&mut Arc<SubtaskRecord>, LedgerError> {
        let len = self.records.len();
        self.records
            .get_mut(index)
            .ok_or(LedgerError::OutOfRange { index, len })
    }

    fn expect_status(&self, index: usize, expected: SubtaskStatus) -> Result<(), LedgerError> {
        let record = self.records.get(index).ok_or(LedgerError::OutOfRange {
            index,
            len: self.records.len(),
        })?;
        if record.status != expected {
            return Err(LedgerError::NotActive {
                index,
                status: record.status,
                expected,
            });
        }
        Ok(())
    }

    fn active_record(
        &mut self,
        index: usize,
        expected: SubtaskStatus,
    ) -> Result<&mut SubtaskRecord, LedgerError> {
        self.expect_status(index, expected)?;
        Ok(Arc::make_mut(&mut self.records[index]))
    }
}
