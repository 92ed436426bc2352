//! Blended zero-shot and prototype scoring of scene attributes.
//!
//! For each candidate label of each attribute:
//!
//! ```text
//! final = w * clamp(clip, 0, 1) + (1 - w) * prototype    if a prototype exists
//! final = clamp(clip, 0, 1)                              otherwise
//! ```
//!
//! with `w = BlendPolicy::clip_weight` (0.6 by default). The label with the
//! highest final score wins and its final score becomes the confidence.

use std::collections::BTreeMap;

use cache::FrameId;
use pipeline::{ScoreInput, VisionPipeline};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::attributes::{AttributeStore, Classification, SceneAttributeRecord, UpsertOutcome};
use crate::prototype::PrototypeSet;
use crate::vocabulary::{AttributeDefinition, AttributeVocabulary};
use crate::ScoringError;

pub const DEFAULT_CLIP_WEIGHT: f32 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlendPolicy {
    /// Share of the zero-shot score in the blend, in `[0, 1]`.
    pub clip_weight: f32,
}

impl Default for BlendPolicy {
    fn default() -> Self {
        Self {
            clip_weight: DEFAULT_CLIP_WEIGHT,
        }
    }
}

impl BlendPolicy {
    pub fn new(clip_weight: f32) -> Self {
        Self { clip_weight }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.clip_weight) {
            return Err(format!(
                "clip_weight must be within [0, 1], got {}",
                self.clip_weight
            ));
        }
        Ok(())
    }

    /// Maps a raw cosine similarity onto `[0, 1]`.
    pub fn normalize(clip: f32) -> f32 {
        clip.clamp(0.0, 1.0)
    }

    pub fn blend(&self, clip: f32, prototype: Option<f32>) -> f32 {
        let clip = Self::normalize(clip);
        match prototype {
            Some(proto) => self.clip_weight * clip + (1.0 - self.clip_weight) * proto,
            None => clip,
        }
    }
}

/// Scoring record of one candidate label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateDebug {
    pub label: String,
    pub clip_score: Option<f32>,
    pub prototype_score: Option<f32>,
    pub prototype_count: usize,
    pub final_score: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Ranked scoring record of one attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDebug {
    pub selected: Option<CandidateDebug>,
    pub candidates: Vec<CandidateDebug>,
    /// A verified value exists, so the selection was not persisted.
    #[serde(default)]
    pub kept_verified: bool,
}

/// Unpersisted result for one attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeEvaluation {
    pub attribute: String,
    pub classification: Option<Classification>,
    pub debug: AttributeDebug,
}

/// Outcome of a full scoring pass over one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameScoring {
    pub frame_id: FrameId,
    pub pipeline_id: String,
    /// Persisted values after the pass, verified ones included.
    pub attributes: Vec<SceneAttributeRecord>,
    pub debug_log: BTreeMap<String, AttributeDebug>,
}

#[derive(Debug, Clone, Default)]
pub struct AttributeScorer {
    vocabulary: AttributeVocabulary,
    policy: BlendPolicy,
}

impl AttributeScorer {
    pub fn new(vocabulary: AttributeVocabulary, policy: BlendPolicy) -> Self {
        Self { vocabulary, policy }
    }

    pub fn vocabulary(&self) -> &AttributeVocabulary {
        &self.vocabulary
    }

    pub fn policy(&self) -> BlendPolicy {
        self.policy
    }

    /// Scores every attribute without touching any store.
    ///
    /// A pipeline-level failure aborts the whole pass. Failures of single
    /// candidates only end up in the debug record.
    pub fn evaluate(
        &self,
        pipeline: &dyn VisionPipeline,
        embedding: &[f32],
        prototypes: &PrototypeSet,
    ) -> Result<Vec<AttributeEvaluation>, ScoringError> {
        self.vocabulary
            .iter()
            .map(|definition| self.evaluate_attribute(pipeline, definition, embedding, prototypes))
            .collect()
    }

    fn evaluate_attribute(
        &self,
        pipeline: &dyn VisionPipeline,
        definition: &AttributeDefinition,
        embedding: &[f32],
        prototypes: &PrototypeSet,
    ) -> Result<AttributeEvaluation, ScoringError> {
        let similarities = pipeline
            .score_text_candidates(ScoreInput::Embedding(embedding), &definition.candidates)?;

        let candidates: Vec<CandidateDebug> = similarities
            .into_iter()
            .map(|sim| match sim.similarity {
                Ok(clip) => {
                    let proto = prototypes.score(&definition.name, &sim.label, embedding);
                    CandidateDebug {
                        final_score: Some(self.policy.blend(clip, proto.score)),
                        label: sim.label,
                        clip_score: Some(clip),
                        prototype_score: proto.score,
                        prototype_count: proto.supporting_count,
                        error: None,
                    }
                }
                Err(err) => {
                    warn!(attribute = %definition.name, label = %sim.label, error = %err, "candidate could not be scored");
                    CandidateDebug {
                        label: sim.label,
                        clip_score: None,
                        prototype_score: None,
                        prototype_count: 0,
                        final_score: None,
                        error: Some(err),
                    }
                }
            })
            .collect();

        // Strict comparison keeps the earliest candidate on ties.
        let mut selected: Option<&CandidateDebug> = None;
        for candidate in &candidates {
            let Some(score) = candidate.final_score else {
                continue;
            };
            if selected
                .and_then(|s| s.final_score)
                .is_none_or(|best| score > best)
            {
                selected = Some(candidate);
            }
        }
        let selected = selected.cloned();

        let classification = selected.as_ref().and_then(|s| {
            s.final_score.map(|confidence| Classification {
                attribute: definition.name.clone(),
                value: s.label.clone(),
                confidence,
            })
        });
        match &classification {
            Some(c) => debug!(attribute = %c.attribute, value = %c.value, confidence = c.confidence, "attribute selected"),
            None => warn!(attribute = %definition.name, "no candidate could be scored, attribute skipped"),
        }

        Ok(AttributeEvaluation {
            attribute: definition.name.clone(),
            classification,
            debug: AttributeDebug {
                selected,
                candidates,
                kept_verified: false,
            },
        })
    }

    /// Writes the selections, leaving verified values in place.
    pub fn persist(
        &self,
        frame_id: FrameId,
        pipeline_id: &str,
        evaluations: Vec<AttributeEvaluation>,
        store: &dyn AttributeStore,
    ) -> Result<FrameScoring, ScoringError> {
        let classifications: Vec<Classification> = evaluations
            .iter()
            .filter_map(|e| e.classification.clone())
            .collect();
        let outcomes = store.upsert_classified_many(frame_id, &classifications)?;

        let mut debug_log: BTreeMap<String, AttributeDebug> = evaluations
            .into_iter()
            .map(|e| (e.attribute, e.debug))
            .collect();
        let mut attributes = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            if let UpsertOutcome::KeptVerified(record) = &outcome {
                info!(
                    frame_id,
                    attribute = %record.attribute,
                    value = %record.value,
                    "verified value kept"
                );
                if let Some(entry) = debug_log.get_mut(&record.attribute) {
                    entry.kept_verified = true;
                }
            }
            attributes.push(outcome.into_record());
        }

        Ok(FrameScoring {
            frame_id,
            pipeline_id: pipeline_id.to_string(),
            attributes,
            debug_log,
        })
    }

    /// Evaluates then persists. Nothing is written if evaluation fails.
    pub fn score_frame(
        &self,
        frame_id: FrameId,
        pipeline: &dyn VisionPipeline,
        embedding: &[f32],
        prototypes: &PrototypeSet,
        store: &dyn AttributeStore,
    ) -> Result<FrameScoring, ScoringError> {
        let pipeline_id = pipeline.descriptor().id;
        let evaluations = self.evaluate(pipeline, embedding, prototypes)?;
        let scoring = self.persist(frame_id, &pipeline_id, evaluations, store)?;
        info!(
            frame_id,
            pipeline = %pipeline_id,
            attributes = scoring.attributes.len(),
            "scored frame"
        );
        Ok(scoring)
    }
}
