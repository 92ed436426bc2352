//! Frametag scene attribute scoring
//!
//! Turns a frame embedding into one classified value per scene attribute by
//! blending zero-shot text similarity with prototypes learned from verified
//! examples. Verified values are never overwritten by a scoring pass.
//!
//! ```
//! use scoring::BlendPolicy;
//!
//! let policy = BlendPolicy::default();
//! assert!((policy.blend(0.7, Some(0.9)) - 0.78).abs() < 1e-6);
//! assert_eq!(policy.blend(0.2, None), 0.2);
//! ```

pub mod attributes;
pub mod engine;
pub mod error;
pub mod prototype;
pub mod vocabulary;

pub use crate::attributes::{
    AttributeStore, Classification, InMemoryAttributeStore, SceneAttributeRecord, UpsertOutcome,
};
pub use crate::engine::{
    AttributeDebug, AttributeEvaluation, AttributeScorer, BlendPolicy, CandidateDebug,
    FrameScoring, DEFAULT_CLIP_WEIGHT,
};
pub use crate::error::ScoringError;
pub use crate::prototype::{
    Prototype, PrototypeScore, PrototypeSet, PrototypeStore, VerifiedFilter, VerifiedSummary,
};
pub use crate::vocabulary::{AttributeDefinition, AttributeVocabulary};
