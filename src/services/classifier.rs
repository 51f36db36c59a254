//! Deck classification.
//!
//! The pipeline only depends on the [`Classifier`] trait. [`SignatureClassifier`]
//! is a small table-driven model: each deck type is described by a set of
//! signature cards, and a player's deck is labeled with the type whose
//! signature it overlaps most.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::Deserialize;

use crate::error::Transience;
use crate::models::derived::{Classification, Label};

pub const UNKNOWN_DECK: &str = "Unknown";

/// Classification capability. Pure from the caller's perspective and safe to
/// share read-only across worker threads.
pub trait Classifier: Send + Sync {
    fn classify(&self, payload: &[u8]) -> Result<Vec<Classification>, ClassifyError>;
}

/// Stored replay document as read back from the object store.
#[derive(Debug, Deserialize)]
pub struct ReplayDocument {
    #[serde(default)]
    pub games: Vec<ReplayGame>,
}

#[derive(Debug, Deserialize)]
pub struct ReplayGame {
    pub game_number: i32,
    #[serde(default)]
    pub players: Vec<ReplayPlayer>,
}

#[derive(Debug, Deserialize)]
pub struct ReplayPlayer {
    pub name: String,
    #[serde(default)]
    pub cards: Vec<String>,
}

/// Model file: deck type -> signature cards.
#[derive(Debug, Deserialize)]
struct SignatureModel {
    decks: BTreeMap<String, Vec<String>>,
}

#[derive(Debug)]
pub struct SignatureClassifier {
    signatures: Vec<(String, HashSet<String>)>,
}

impl SignatureClassifier {
    pub fn new(decks: BTreeMap<String, Vec<String>>) -> Self {
        let signatures = decks
            .into_iter()
            .map(|(deck, cards)| (deck, cards.iter().map(|c| normalize(c)).collect()))
            .collect();
        Self { signatures }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ClassifyError> {
        let raw = std::fs::read(path.as_ref()).map_err(|e| ClassifyError::Model(e.to_string()))?;
        let model: SignatureModel =
            serde_json::from_slice(&raw).map_err(|e| ClassifyError::Model(e.to_string()))?;
        if model.decks.is_empty() {
            return Err(ClassifyError::Model("model defines no deck types".to_string()));
        }
        Ok(Self::new(model.decks))
    }

    /// Label one card list. Confidence is the winning deck's share of all
    /// signature hits, rounded to four decimals.
    pub fn label_cards(&self, cards: &[String]) -> (String, f64) {
        let seen: HashSet<String> = cards.iter().map(|c| normalize(c)).collect();

        let mut best: Option<(&str, usize)> = None;
        let mut total_hits = 0usize;
        for (deck, signature) in &self.signatures {
            let hits = signature.intersection(&seen).count();
            total_hits += hits;
            if hits > 0 && best.map_or(true, |(_, b)| hits > b) {
                best = Some((deck.as_str(), hits));
            }
        }

        match best {
            Some((deck, hits)) => {
                let confidence = hits as f64 / total_hits as f64;
                (deck.to_string(), (confidence * 10_000.0).round() / 10_000.0)
            }
            None => (UNKNOWN_DECK.to_string(), 0.0),
        }
    }
}

impl Classifier for SignatureClassifier {
    fn classify(&self, payload: &[u8]) -> Result<Vec<Classification>, ClassifyError> {
        let document: ReplayDocument =
            serde_json::from_slice(payload).map_err(|e| ClassifyError::Malformed(e.to_string()))?;

        document
            .games
            .into_iter()
            .map(|game| {
                if game.players.is_empty() {
                    return Err(ClassifyError::Malformed(format!(
                        "game {} has no players",
                        game.game_number
                    )));
                }
                let labels = game
                    .players
                    .iter()
                    .map(|player| {
                        let (label, confidence) = self.label_cards(&player.cards);
                        Label {
                            subject: player.name.clone(),
                            label,
                            confidence,
                        }
                    })
                    .collect();
                Ok(Classification {
                    sequence: game.game_number,
                    labels,
                })
            })
            .collect()
    }
}

fn normalize(card: &str) -> String {
    card.trim().to_lowercase()
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("Malformed replay payload: {0}")]
    Malformed(String),

    #[error("Classifier model error: {0}")]
    Model(String),

    #[error("Classifier panicked: {0}")]
    Panicked(String),

    #[error("Classifier temporarily unavailable: {0}")]
    Unavailable(String),
}

impl Transience for ClassifyError {
    fn is_transient(&self) -> bool {
        matches!(self, ClassifyError::Unavailable(_))
    }
}
