//! Scene attributes and their candidate labels.

use pipeline::CandidatePrompt;
use serde::{Deserialize, Serialize};

/// One attribute and the closed set of labels it may take.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDefinition {
    pub name: String,
    /// Order matters: ties go to the earlier candidate.
    pub candidates: Vec<CandidatePrompt>,
}

impl AttributeDefinition {
    pub fn new(name: impl Into<String>, candidates: Vec<CandidatePrompt>) -> Self {
        Self {
            name: name.into(),
            candidates,
        }
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.candidates.iter().map(|c| c.label.as_str())
    }
}

/// Ordered attribute set scored on every pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeVocabulary {
    attributes: Vec<AttributeDefinition>,
}

fn define(name: &str, candidates: &[(&str, &str)]) -> AttributeDefinition {
    AttributeDefinition::new(
        name,
        candidates
            .iter()
            .map(|(label, prompt)| CandidatePrompt::new(*label, *prompt))
            .collect(),
    )
}

impl Default for AttributeVocabulary {
    fn default() -> Self {
        Self::new(vec![
            define(
                "time_of_day",
                &[
                    ("day", "a film still shot in bright daylight"),
                    ("night", "a film still shot at night in darkness"),
                    ("dusk", "a film still at dusk with an orange sunset sky"),
                    ("dawn", "a film still at dawn with soft early morning light"),
                ],
            ),
            define(
                "environment",
                &[
                    ("interior", "a scene inside a room or building"),
                    ("exterior", "an outdoor scene under the open sky"),
                    ("underwater", "an underwater scene beneath the surface"),
                ],
            ),
            define(
                "location_type",
                &[
                    ("urban", "a city street with buildings and traffic"),
                    ("natural", "a natural landscape with trees, hills or water"),
                    ("interior", "an indoor location with walls and furniture"),
                ],
            ),
            define(
                "lighting",
                &[
                    ("high_key", "a bright evenly lit high key shot"),
                    ("low_key", "a dark moody low key shot with deep shadows"),
                    ("backlit", "a backlit subject in silhouette against the light"),
                ],
            ),
            define(
                "emotion",
                &[
                    ("calm", "a calm and peaceful scene"),
                    ("intense", "a tense and intense dramatic scene"),
                    ("melancholic", "a sad and melancholic scene"),
                    ("joyful", "a happy and joyful scene"),
                ],
            ),
            define(
                "composition",
                &[
                    ("balanced_frame", "a balanced symmetrical composition"),
                    ("panoramic", "a wide panoramic shot of a vast space"),
                    ("portrait_frame", "a tight portrait framing of a face"),
                    ("rule_of_thirds", "a subject placed off center on the rule of thirds"),
                    ("centered", "a single subject centered in the frame"),
                ],
            ),
            define(
                "color_temperature",
                &[
                    ("warm", "warm golden orange color grading"),
                    ("cool", "cool blue teal color grading"),
                    ("neutral", "neutral natural color grading"),
                ],
            ),
            define(
                "saturation_level",
                &[
                    ("rich", "vivid richly saturated colors"),
                    ("muted", "muted desaturated washed out colors"),
                ],
            ),
            define(
                "vehicle_presence",
                &[
                    ("vehicle", "a car, truck or other vehicle in the scene"),
                    ("no_vehicle", "a scene with no vehicles"),
                ],
            ),
        ])
    }
}

impl AttributeVocabulary {
    pub fn new(attributes: Vec<AttributeDefinition>) -> Self {
        Self { attributes }
    }

    pub fn get(&self, name: &str) -> Option<&AttributeDefinition> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.attributes.iter().map(|a| a.name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &AttributeDefinition> {
        self.attributes.iter()
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Keeps only the named attributes, in vocabulary order.
    pub fn restricted_to(&self, names: &[String]) -> Self {
        Self {
            attributes: self
                .attributes
                .iter()
                .filter(|a| names.iter().any(|n| n == &a.name))
                .cloned()
                .collect(),
        }
    }
}
