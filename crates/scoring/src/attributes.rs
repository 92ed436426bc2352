//! Persisted scene attributes and the store boundary.

use std::collections::BTreeMap;
use std::sync::RwLock;

use cache::FrameId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ScoringError;

/// One classified or human-confirmed fact about a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneAttributeRecord {
    pub frame_id: FrameId,
    pub attribute: String,
    pub value: String,
    /// `None` for human-entered values without a score.
    pub confidence: Option<f32>,
    pub is_verified: bool,
    pub updated_at: DateTime<Utc>,
}

/// An automatic classification waiting to be persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub attribute: String,
    pub value: String,
    pub confidence: f32,
}

/// What [`AttributeStore::upsert_classified`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Written(SceneAttributeRecord),
    /// A verified record exists and was left as is.
    KeptVerified(SceneAttributeRecord),
}

impl UpsertOutcome {
    pub fn record(&self) -> &SceneAttributeRecord {
        match self {
            UpsertOutcome::Written(r) | UpsertOutcome::KeptVerified(r) => r,
        }
    }

    pub fn into_record(self) -> SceneAttributeRecord {
        match self {
            UpsertOutcome::Written(r) | UpsertOutcome::KeptVerified(r) => r,
        }
    }
}

/// Storage for scene attributes. At most one record per (frame, attribute).
pub trait AttributeStore: Send + Sync {
    fn get(
        &self,
        frame_id: FrameId,
        attribute: &str,
    ) -> Result<Option<SceneAttributeRecord>, ScoringError>;

    /// All records of a frame, sorted by attribute.
    fn for_frame(&self, frame_id: FrameId) -> Result<Vec<SceneAttributeRecord>, ScoringError>;

    /// Writes an automatic classification unless a verified record exists.
    fn upsert_classified(
        &self,
        frame_id: FrameId,
        classification: &Classification,
    ) -> Result<UpsertOutcome, ScoringError>;

    /// Persists several classifications of one frame. Implementations may
    /// override this to write them in one step.
    fn upsert_classified_many(
        &self,
        frame_id: FrameId,
        classifications: &[Classification],
    ) -> Result<Vec<UpsertOutcome>, ScoringError> {
        classifications
            .iter()
            .map(|c| self.upsert_classified(frame_id, c))
            .collect()
    }

    /// Human confirmation or correction of a value.
    fn verify(
        &self,
        frame_id: FrameId,
        attribute: &str,
        value: &str,
    ) -> Result<SceneAttributeRecord, ScoringError>;

    /// Every verified record across all frames.
    fn verified(&self) -> Result<Vec<SceneAttributeRecord>, ScoringError>;
}

#[derive(Default)]
pub struct InMemoryAttributeStore {
    records: RwLock<BTreeMap<(FrameId, String), SceneAttributeRecord>>,
}

impl InMemoryAttributeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(
        records: &mut BTreeMap<(FrameId, String), SceneAttributeRecord>,
        frame_id: FrameId,
        classification: &Classification,
    ) -> UpsertOutcome {
        let key = (frame_id, classification.attribute.clone());
        if let Some(existing) = records.get(&key) {
            if existing.is_verified {
                return UpsertOutcome::KeptVerified(existing.clone());
            }
        }
        let record = SceneAttributeRecord {
            frame_id,
            attribute: classification.attribute.clone(),
            value: classification.value.clone(),
            confidence: Some(classification.confidence),
            is_verified: false,
            updated_at: Utc::now(),
        };
        records.insert(key, record.clone());
        UpsertOutcome::Written(record)
    }
}

impl AttributeStore for InMemoryAttributeStore {
    fn get(
        &self,
        frame_id: FrameId,
        attribute: &str,
    ) -> Result<Option<SceneAttributeRecord>, ScoringError> {
        let guard = self
            .records
            .read()
            .map_err(|_| ScoringError::store("poisoned lock"))?;
        Ok(guard.get(&(frame_id, attribute.to_string())).cloned())
    }

    fn for_frame(&self, frame_id: FrameId) -> Result<Vec<SceneAttributeRecord>, ScoringError> {
        let guard = self
            .records
            .read()
            .map_err(|_| ScoringError::store("poisoned lock"))?;
        Ok(guard
            .range((frame_id, String::new())..)
            .take_while(|((id, _), _)| *id == frame_id)
            .map(|(_, record)| record.clone())
            .collect())
    }

    fn upsert_classified(
        &self,
        frame_id: FrameId,
        classification: &Classification,
    ) -> Result<UpsertOutcome, ScoringError> {
        let mut guard = self
            .records
            .write()
            .map_err(|_| ScoringError::store("poisoned lock"))?;
        Ok(Self::apply(&mut guard, frame_id, classification))
    }

    fn upsert_classified_many(
        &self,
        frame_id: FrameId,
        classifications: &[Classification],
    ) -> Result<Vec<UpsertOutcome>, ScoringError> {
        // One write guard, so readers never see half a pass.
        let mut guard = self
            .records
            .write()
            .map_err(|_| ScoringError::store("poisoned lock"))?;
        Ok(classifications
            .iter()
            .map(|c| Self::apply(&mut guard, frame_id, c))
            .collect())
    }

    fn verify(
        &self,
        frame_id: FrameId,
        attribute: &str,
        value: &str,
    ) -> Result<SceneAttributeRecord, ScoringError> {
        let mut guard = self
            .records
            .write()
            .map_err(|_| ScoringError::store("poisoned lock"))?;
        let key = (frame_id, attribute.to_string());
        // A confirmed value keeps its score; a corrected one has none.
        let confidence = guard
            .get(&key)
            .filter(|existing| existing.value == value)
            .and_then(|existing| existing.confidence);
        let record = SceneAttributeRecord {
            frame_id,
            attribute: attribute.to_string(),
            value: value.to_string(),
            confidence,
            is_verified: true,
            updated_at: Utc::now(),
        };
        guard.insert(key, record.clone());
        Ok(record)
    }

    fn verified(&self) -> Result<Vec<SceneAttributeRecord>, ScoringError> {
        let guard = self
            .records
            .read()
            .map_err(|_| ScoringError::store("poisoned lock"))?;
        Ok(guard.values().filter(|r| r.is_verified).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classified(attribute: &str, value: &str, confidence: f32) -> Classification {
        Classification {
            attribute: attribute.into(),
            value: value.into(),
            confidence,
        }
    }

    #[test]
    fn classification_overwrites_unverified() {
        let store = InMemoryAttributeStore::new();
        store
            .upsert_classified(1, &classified("time_of_day", "day", 0.7))
            .unwrap();
        let outcome = store
            .upsert_classified(1, &classified("time_of_day", "night", 0.8))
            .unwrap();
        assert!(matches!(outcome, UpsertOutcome::Written(_)));
        let record = store.get(1, "time_of_day").unwrap().unwrap();
        assert_eq!(record.value, "night");
        assert_eq!(record.confidence, Some(0.8));
    }

    #[test]
    fn classification_never_overwrites_verified() {
        let store = InMemoryAttributeStore::new();
        store.verify(1, "time_of_day", "dusk").unwrap();
        let outcome = store
            .upsert_classified(1, &classified("time_of_day", "day", 0.95))
            .unwrap();
        assert!(matches!(outcome, UpsertOutcome::KeptVerified(_)));
        let record = store.get(1, "time_of_day").unwrap().unwrap();
        assert_eq!(record.value, "dusk");
        assert!(record.is_verified);
        assert_eq!(record.confidence, None);
    }

    #[test]
    fn verify_keeps_confidence_of_confirmed_value() {
        let store = InMemoryAttributeStore::new();
        store
            .upsert_classified(2, &classified("environment", "exterior", 0.66))
            .unwrap();
        let confirmed = store.verify(2, "environment", "exterior").unwrap();
        assert_eq!(confirmed.confidence, Some(0.66));
        let corrected = store.verify(2, "environment", "interior").unwrap();
        assert_eq!(corrected.confidence, None);
    }

    #[test]
    fn for_frame_and_verified_views() {
        let store = InMemoryAttributeStore::new();
        store
            .upsert_classified_many(
                3,
                &[
                    classified("lighting", "low_key", 0.4),
                    classified("emotion", "calm", 0.5),
                ],
            )
            .unwrap();
        store
            .upsert_classified(30, &classified("lighting", "high_key", 0.4))
            .unwrap();
        store.verify(30, "lighting", "high_key").unwrap();

        let frame = store.for_frame(3).unwrap();
        let names: Vec<_> = frame.iter().map(|r| r.attribute.as_str()).collect();
        assert_eq!(names, vec!["emotion", "lighting"]);

        let verified = store.verified().unwrap();
        assert_eq!(verified.len(), 1);
        assert_eq!(verified[0].frame_id, 30);
    }
}
