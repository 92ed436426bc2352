//! Prototypes built from human-verified attributes.
//!
//! A prototype groups the cached embeddings of every frame whose attribute was
//! verified to a given value. Scoring a query against it is the mean cosine
//! similarity to those members. Nothing is persisted; groups are rebuilt from
//! the attribute store and the embedding cache on demand.

use std::collections::BTreeMap;
use std::sync::Arc;

use cache::{EmbeddingCache, FrameId};
use pipeline::cosine;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::attributes::AttributeStore;
use crate::ScoringError;

/// Verified examples of one (attribute, value) under one pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Prototype {
    pub pipeline_id: String,
    pub attribute: String,
    pub value: String,
    /// Frames whose embedding resolved, ascending.
    pub frame_ids: Vec<FrameId>,
    pub members: Vec<Vec<f32>>,
}

impl Prototype {
    pub fn count(&self) -> usize {
        self.members.len()
    }

    /// Mean cosine similarity of `query` to the members. Members of a different
    /// length are skipped.
    pub fn score(&self, query: &[f32]) -> PrototypeScore {
        let sims: Vec<f32> = self
            .members
            .iter()
            .filter(|m| m.len() == query.len())
            .map(|m| cosine(query, m))
            .collect();
        if sims.is_empty() {
            return PrototypeScore::default();
        }
        PrototypeScore {
            score: Some(sims.iter().sum::<f32>() / sims.len() as f32),
            supporting_count: sims.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PrototypeScore {
    /// `None` when no member supports the value.
    pub score: Option<f32>,
    pub supporting_count: usize,
}

/// Prototypes of one pipeline, built once and scored many times.
#[derive(Debug, Clone, Default)]
pub struct PrototypeSet {
    groups: BTreeMap<(String, String), Prototype>,
}

impl PrototypeSet {
    pub fn from_prototypes(prototypes: Vec<Prototype>) -> Self {
        Self {
            groups: prototypes
                .into_iter()
                .map(|p| ((p.attribute.clone(), p.value.clone()), p))
                .collect(),
        }
    }

    pub fn get(&self, attribute: &str, value: &str) -> Option<&Prototype> {
        self.groups.get(&(attribute.to_string(), value.to_string()))
    }

    pub fn score(&self, attribute: &str, value: &str, query: &[f32]) -> PrototypeScore {
        self.get(attribute, value)
            .map(|p| p.score(query))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// One row of the verified-attributes view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedSummary {
    pub attribute: String,
    pub value: String,
    pub count: usize,
    pub frame_ids: Vec<FrameId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedFilter {
    pub attribute: Option<String>,
    pub value: Option<String>,
}

impl VerifiedFilter {
    fn matches(&self, attribute: &str, value: &str) -> bool {
        self.attribute.as_deref().is_none_or(|a| a == attribute)
            && self.value.as_deref().is_none_or(|v| v == value)
    }
}

pub struct PrototypeStore {
    attributes: Arc<dyn AttributeStore>,
    cache: Arc<EmbeddingCache>,
}

impl PrototypeStore {
    pub fn new(attributes: Arc<dyn AttributeStore>, cache: Arc<EmbeddingCache>) -> Self {
        Self { attributes, cache }
    }

    /// Groups verified records by (attribute, value) and resolves each frame's
    /// embedding under `pipeline_id`. Groups without a single embedding are dropped.
    pub fn build(&self, pipeline_id: &str) -> Result<Vec<Prototype>, ScoringError> {
        let mut groups: BTreeMap<(String, String), Vec<FrameId>> = BTreeMap::new();
        for record in self.attributes.verified()? {
            groups
                .entry((record.attribute, record.value))
                .or_default()
                .push(record.frame_id);
        }

        let mut prototypes = Vec::with_capacity(groups.len());
        for ((attribute, value), mut frames) in groups {
            frames.sort_unstable();
            frames.dedup();
            let mut frame_ids = Vec::with_capacity(frames.len());
            let mut members = Vec::with_capacity(frames.len());
            for frame_id in frames {
                match self.cache.get(frame_id, pipeline_id) {
                    Ok(Some(record)) => {
                        frame_ids.push(frame_id);
                        members.push(record.embedding);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(frame_id, pipeline = pipeline_id, error = %err, "skipping unreadable prototype member");
                    }
                }
            }
            if members.is_empty() {
                continue;
            }
            prototypes.push(Prototype {
                pipeline_id: pipeline_id.to_string(),
                attribute,
                value,
                frame_ids,
                members,
            });
        }
        debug!(pipeline = pipeline_id, groups = prototypes.len(), "built prototypes");
        Ok(prototypes)
    }

    pub fn build_set(&self, pipeline_id: &str) -> Result<PrototypeSet, ScoringError> {
        Ok(PrototypeSet::from_prototypes(self.build(pipeline_id)?))
    }

    /// Scores one value. Prefer [`build_set`](Self::build_set) when scoring many.
    pub fn score(
        &self,
        pipeline_id: &str,
        attribute: &str,
        value: &str,
        query: &[f32],
    ) -> Result<PrototypeScore, ScoringError> {
        Ok(self.build_set(pipeline_id)?.score(attribute, value, query))
    }

    /// Verified values grouped by (attribute, value), independent of any pipeline.
    pub fn verified_summary(
        &self,
        filter: &VerifiedFilter,
    ) -> Result<Vec<VerifiedSummary>, ScoringError> {
        let mut groups: BTreeMap<(String, String), Vec<FrameId>> = BTreeMap::new();
        for record in self.attributes.verified()? {
            if filter.matches(&record.attribute, &record.value) {
                groups
                    .entry((record.attribute, record.value))
                    .or_default()
                    .push(record.frame_id);
            }
        }
        Ok(groups
            .into_iter()
            .map(|((attribute, value), mut frame_ids)| {
                frame_ids.sort_unstable();
                VerifiedSummary {
                    attribute,
                    value,
                    count: frame_ids.len(),
                    frame_ids,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{Classification, InMemoryAttributeStore};

    const PIPE: &str = "clip_vitb32";

    fn fixture() -> (Arc<InMemoryAttributeStore>, Arc<EmbeddingCache>, PrototypeStore) {
        let attributes = Arc::new(InMemoryAttributeStore::new());
        let cache = Arc::new(EmbeddingCache::in_memory());
        let store = PrototypeStore::new(attributes.clone(), cache.clone());
        (attributes, cache, store)
    }

    #[test]
    fn build_groups_verified_frames_with_embeddings() {
        let (attributes, cache, store) = fixture();
        cache.put(1, PIPE, vec![1.0, 0.0], "v").unwrap();
        cache.put(2, PIPE, vec![0.0, 1.0], "v").unwrap();
        attributes.verify(1, "time_of_day", "night").unwrap();
        attributes.verify(2, "time_of_day", "night").unwrap();
        attributes.verify(3, "time_of_day", "night").unwrap();
        attributes.verify(4, "time_of_day", "day").unwrap();
        attributes.verify(2, "environment", "interior").unwrap();
        attributes
            .upsert_classified(
                1,
                &Classification {
                    attribute: "lighting".into(),
                    value: "low_key".into(),
                    confidence: 0.5,
                },
            )
            .unwrap();

        let prototypes = store.build(PIPE).unwrap();
        let keys: Vec<_> = prototypes
            .iter()
            .map(|p| (p.attribute.as_str(), p.value.as_str(), p.count()))
            .collect();
        // "day" has no embedding and unverified "lighting" is ignored.
        assert_eq!(
            keys,
            vec![("environment", "interior", 1), ("time_of_day", "night", 2)]
        );
        assert_eq!(prototypes[1].frame_ids, vec![1, 2]);
        assert!(store.build("openclip_vitl14").unwrap().is_empty());
    }

    #[test]
    fn score_is_mean_cosine() {
        let (attributes, cache, store) = fixture();
        cache.put(1, PIPE, vec![1.0, 0.0], "v").unwrap();
        cache.put(2, PIPE, vec![0.0, 1.0], "v").unwrap();
        attributes.verify(1, "time_of_day", "night").unwrap();
        attributes.verify(2, "time_of_day", "night").unwrap();

        let score = store
            .score(PIPE, "time_of_day", "night", &[1.0, 0.0])
            .unwrap();
        assert_eq!(score.supporting_count, 2);
        assert!((score.score.unwrap() - 0.5).abs() < 1e-6);

        let none = store.score(PIPE, "time_of_day", "day", &[1.0, 0.0]).unwrap();
        assert_eq!(none, PrototypeScore::default());
    }

    #[test]
    fn mismatched_members_do_not_count() {
        let prototype = Prototype {
            pipeline_id: PIPE.into(),
            attribute: "time_of_day".into(),
            value: "day".into(),
            frame_ids: vec![1, 2],
            members: vec![vec![1.0, 0.0], vec![1.0, 0.0, 0.0]],
        };
        let score = prototype.score(&[1.0, 0.0]);
        assert_eq!(score.supporting_count, 1);
        assert!((score.score.unwrap() - 1.0).abs() < 1e-6);
        assert_eq!(prototype.score(&[1.0; 4]), PrototypeScore::default());
    }

    #[test]
    fn verified_summary_filters() {
        let (attributes, _cache, store) = fixture();
        attributes.verify(5, "time_of_day", "night").unwrap();
        attributes.verify(2, "time_of_day", "night").unwrap();
        attributes.verify(3, "time_of_day", "day").unwrap();
        attributes.verify(3, "lighting", "low_key").unwrap();

        let all = store.verified_summary(&VerifiedFilter::default()).unwrap();
        assert_eq!(all.len(), 3);

        let night = store
            .verified_summary(&VerifiedFilter {
                attribute: Some("time_of_day".into()),
                value: Some("night".into()),
            })
            .unwrap();
        assert_eq!(
            night,
            vec![VerifiedSummary {
                attribute: "time_of_day".into(),
                value: "night".into(),
                count: 2,
                frame_ids: vec![2, 5],
            }]
        );
    }
}
