//! Coping technique catalog.
//!
//! Static reference content owned by the content team. The engine loads it
//! once and only ever reads it: entries and favorites refer to techniques by
//! `id`, and those ids are checked against this list on the write path.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopingType {
    Breathing,
    Mindfulness,
    Affirmation,
    Movement,
    Journaling,
    Visualization,
}

impl CopingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CopingType::Breathing => "breathing",
            CopingType::Mindfulness => "mindfulness",
            CopingType::Affirmation => "affirmation",
            CopingType::Movement => "movement",
            CopingType::Journaling => "journaling",
            CopingType::Visualization => "visualization",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    #[default]
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopingMechanism {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: CopingType,
    /// Step-by-step instructions shown to the user.
    pub content: String,
    /// Minutes.
    pub duration: u32,
    #[serde(default)]
    pub difficulty: Difficulty,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_premium: bool,
}

/// Suggested trigger labels offered by the journal flow.
pub const COMMON_TRIGGERS: &[&str] = &[
    "Work stress",
    "Relationship issues",
    "Financial concerns",
    "Health worries",
    "Social situations",
    "Family dynamics",
    "Sleep issues",
    "Weather",
    "News/media",
    "Technology problems",
];

/// Ordered, immutable list of techniques.
#[derive(Debug, Clone, PartialEq)]
pub struct CopingCatalog {
    mechanisms: Vec<CopingMechanism>,
}

impl CopingCatalog {
    /// Build from a list. Fails on duplicate ids.
    pub fn new(mechanisms: Vec<CopingMechanism>) -> Result<Self> {
        let mut seen = HashSet::new();
        for m in &mechanisms {
            if !seen.insert(m.id.as_str()) {
                bail!("Duplicate coping mechanism id in catalog: {}", m.id);
            }
        }
        Ok(Self { mechanisms })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let mechanisms: Vec<CopingMechanism> =
            serde_json::from_str(json).context("Failed to parse coping catalog JSON")?;
        Self::new(mechanisms)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read coping catalog: {}", path.as_ref().display())
        })?;
        let catalog = Self::from_json(&content)?;
        tracing::info!(
            "Loaded {} coping mechanisms from {}",
            catalog.len(),
            path.as_ref().display()
        );
        Ok(catalog)
    }

    /// The default catalog shipped with the app.
    pub fn builtin() -> Self {
        #[allow(clippy::too_many_arguments)]
        fn item(
            id: &str,
            name: &str,
            description: &str,
            kind: CopingType,
            content: &str,
            duration: u32,
            difficulty: Difficulty,
            tags: &[&str],
            is_premium: bool,
        ) -> CopingMechanism {
            CopingMechanism {
                id: id.to_string(),
                name: name.to_string(),
                description: description.to_string(),
                kind,
                content: content.to_string(),
                duration,
                difficulty,
                tags: tags.iter().map(|t| t.to_string()).collect(),
                is_premium,
            }
        }

        Self {
            mechanisms: vec![
                item(
                    "1",
                    "4-7-8 Breathing",
                    "A calming breathing technique to reduce anxiety",
                    CopingType::Breathing,
                    "Inhale for 4 counts, hold for 7 counts, exhale for 8 counts. Repeat 3-4 times.",
                    2,
                    Difficulty::Easy,
                    &["anxiety", "quick"],
                    false,
                ),
                item(
                    "2",
                    "Gratitude Reflection",
                    "Focus on three things you're grateful for today",
                    CopingType::Mindfulness,
                    "Take a moment to think of three specific things you're grateful for today. Write them down or say them aloud.",
                    3,
                    Difficulty::Easy,
                    &["gratitude", "reflection"],
                    false,
                ),
                item(
                    "3",
                    "Positive Affirmation",
                    "Boost your confidence with self-affirming statements",
                    CopingType::Affirmation,
                    "Repeat: \"I am capable, I am strong, I can handle whatever comes my way.\" Say it with conviction.",
                    1,
                    Difficulty::Easy,
                    &["confidence", "quick"],
                    false,
                ),
                item(
                    "4",
                    "5-Minute Walk",
                    "Get moving to boost your mood naturally",
                    CopingType::Movement,
                    "Take a 5-minute walk, preferably outside. Focus on your surroundings and breathe deeply.",
                    5,
                    Difficulty::Easy,
                    &["energy", "outdoors"],
                    false,
                ),
                item(
                    "5",
                    "Creative Doodling",
                    "Express yourself through simple drawing",
                    CopingType::Journaling,
                    "Grab a pen and paper. Doodle whatever comes to mind for 5 minutes. Don't worry about making it perfect.",
                    5,
                    Difficulty::Easy,
                    &["creative", "expression"],
                    false,
                ),
                item(
                    "6",
                    "Body Scan Meditation",
                    "Release tension through mindful awareness",
                    CopingType::Mindfulness,
                    "Lie down and mentally scan your body from head to toe. Notice any tension and consciously relax those areas.",
                    10,
                    Difficulty::Medium,
                    &["tension", "sleep"],
                    true,
                ),
            ],
        }
    }

    pub fn get(&self, id: &str) -> Option<&CopingMechanism> {
        self.mechanisms.iter().find(|m| m.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Techniques visible to the user; premium ones only when unlocked.
    pub fn list(&self, include_premium: bool) -> Vec<&CopingMechanism> {
        self.mechanisms
            .iter()
            .filter(|m| include_premium || !m.is_premium)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CopingMechanism> {
        self.mechanisms.iter()
    }

    pub fn len(&self) -> usize {
        self.mechanisms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mechanisms.is_empty()
    }
}

impl Default for CopingCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
