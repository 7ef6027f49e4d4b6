//! Live/deleted record partitions shared by the memory and file backends

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

use crate::error::{KnowledgeError, Result};
use crate::storage::evaluate;
use crate::storage::filter::Filter;
use crate::types::{LoadSummary, Record, RecordId};

/// Two disjoint maps: live records and soft-deleted records
#[derive(Debug, Clone, Default)]
pub struct Partitions {
    live: HashMap<RecordId, Record>,
    deleted: HashMap<RecordId, Record>,
}

impl Partitions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted maps. IDs present in both are rejected.
    pub fn from_maps(
        live: HashMap<RecordId, Record>,
        deleted: HashMap<RecordId, Record>,
    ) -> Result<Self> {
        if let Some(id) = live.keys().find(|id| deleted.contains_key(*id)) {
            return Err(KnowledgeError::Storage(format!(
                "Record {} is both live and deleted",
                id
            )));
        }
        Ok(Self { live, deleted })
    }

    pub fn live(&self) -> &HashMap<RecordId, Record> {
        &self.live
    }

    pub fn deleted(&self) -> &HashMap<RecordId, Record> {
        &self.deleted
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }

    pub fn clear(&mut self) {
        self.live.clear();
        self.deleted.clear();
    }

    fn exists(&self, id: &str) -> bool {
        self.live.contains_key(id) || self.deleted.contains_key(id)
    }

    pub fn add(&mut self, mut record: Record, now: DateTime<Utc>) -> Result<Record> {
        require_id(&record.id)?;
        if self.exists(&record.id) {
            return Err(KnowledgeError::AlreadyExists(record.id));
        }

        record.created_at.get_or_insert(now);
        record.updated_at.get_or_insert(now);
        self.live.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    pub fn get(&self, id: &str) -> Result<Record> {
        self.live
            .get(id)
            .cloned()
            .ok_or_else(|| KnowledgeError::NotFound(id.to_string()))
    }

    pub fn update(&mut self, mut record: Record, now: DateTime<Utc>) -> Result<Record> {
        require_id(&record.id)?;
        let stored = self
            .live
            .get_mut(&record.id)
            .ok_or_else(|| KnowledgeError::NotFound(record.id.clone()))?;

        if record.created_at.is_none() {
            record.created_at = stored.created_at;
        }
        record.updated_at = Some(now);
        *stored = record.clone();
        Ok(record)
    }

    pub fn delete(&mut self, id: &str, now: DateTime<Utc>) -> Result<()> {
        match self.live.remove(id) {
            Some(mut record) => {
                record.updated_at = Some(now);
                self.deleted.insert(id.to_string(), record);
                Ok(())
            }
            None if self.deleted.contains_key(id) => Err(KnowledgeError::InvalidStateTransition(
                format!("record {} is already deleted", id),
            )),
            None => Err(KnowledgeError::NotFound(id.to_string())),
        }
    }

    pub fn restore(&mut self, id: &str, now: DateTime<Utc>) -> Result<()> {
        match self.deleted.remove(id) {
            Some(mut record) => {
                record.updated_at = Some(now);
                self.live.insert(id.to_string(), record);
                Ok(())
            }
            None if self.live.contains_key(id) => Err(KnowledgeError::InvalidStateTransition(
                format!("record {} is not deleted", id),
            )),
            None => Err(KnowledgeError::NotFound(id.to_string())),
        }
    }

    pub fn purge(&mut self, id: &str) -> Result<()> {
        if self.live.remove(id).is_some() || self.deleted.remove(id).is_some() {
            Ok(())
        } else {
            Err(KnowledgeError::NotFound(id.to_string()))
        }
    }

    /// Upsert a batch. Nothing is mutated unless every ID is valid.
    pub fn load(&mut self, records: Vec<Record>, now: DateTime<Utc>) -> Result<LoadSummary> {
        validate_batch(&records)?;

        let mut summary = LoadSummary::default();
        for record in records {
            let target = if self.deleted.contains_key(&record.id) {
                &mut self.deleted
            } else {
                &mut self.live
            };

            match target.get_mut(&record.id) {
                Some(stored) => match merge_loaded(stored, record, now) {
                    Some(merged) => {
                        *stored = merged;
                        summary.updated += 1;
                    }
                    None => summary.unchanged += 1,
                },
                None => {
                    let mut record = record;
                    record.created_at.get_or_insert(now);
                    record.updated_at.get_or_insert(now);
                    target.insert(record.id.clone(), record);
                    summary.inserted += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Filter, sort and paginate the partitions the filter selects
    pub fn search(&self, filter: &Filter) -> Vec<Record> {
        let live = filter.scans_live().then(|| self.live.values());
        let deleted = filter.scans_deleted().then(|| self.deleted.values());
        let candidates = live.into_iter().flatten().chain(deleted.into_iter().flatten());

        let mut candidates: Vec<&Record> = candidates.collect();
        // HashMap order is arbitrary; start from ID order so unsorted results are stable
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        evaluate::run_query(candidates, filter)
    }
}

fn require_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(KnowledgeError::InvalidArgument(
            "record ID must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Every ID non-empty and unique within the batch
pub(crate) fn validate_batch(records: &[Record]) -> Result<()> {
    let mut seen = HashSet::with_capacity(records.len());
    for (index, record) in records.iter().enumerate() {
        require_id(&record.id).map_err(|e| e.in_batch(index, &record.id))?;
        if !seen.insert(record.id.as_str()) {
            return Err(KnowledgeError::InvalidArgument(format!(
                "duplicate record ID {} in batch",
                record.id
            ))
            .in_batch(index, &record.id));
        }
    }
    Ok(())
}

/// Apply a loaded record over the stored one. `None` when nothing changes.
pub(crate) fn merge_loaded(stored: &Record, mut incoming: Record, now: DateTime<Utc>) -> Option<Record> {
    let explicit_update = incoming.updated_at.is_some();
    if incoming.created_at.is_none() {
        incoming.created_at = stored.created_at;
    }
    if incoming.updated_at.is_none() {
        incoming.updated_at = stored.updated_at;
    }

    if incoming == *stored {
        return None;
    }
    if !explicit_update {
        incoming.updated_at = Some(now);
    }
    Some(incoming)
}
