//! Test fixtures: replay payloads, league matches and a small deck model.

use std::collections::BTreeMap;

use replay_pipeline::models::league_match::{clean_replay_url, LeagueMatch};
use uuid::Uuid;

/// Signature cards per deck type used by the fixture classifier.
pub fn deck_model() -> BTreeMap<String, Vec<String>> {
    let mut decks = BTreeMap::new();
    decks.insert(
        "Chaos Turbo".to_string(),
        vec![
            "Black Luster Soldier - Envoy of the Beginning".to_string(),
            "Chaos Emperor Dragon - Envoy of the End".to_string(),
            "Chaos Sorcerer".to_string(),
        ],
    );
    decks.insert(
        "Warrior".to_string(),
        vec![
            "D.D. Warrior Lady".to_string(),
            "Exiled Force".to_string(),
            "Blade Knight".to_string(),
        ],
    );
    decks
}

/// A stored replay with two games between alice (Warrior) and bob (Chaos Turbo).
pub fn replay_payload() -> Vec<u8> {
    br#"{
        "games": [
            {"game_number": 1, "players": [
                {"name": "alice", "cards": ["Exiled Force", "D.D. Warrior Lady", "Blade Knight"]},
                {"name": "bob", "cards": ["Chaos Sorcerer", "Black Luster Soldier - Envoy of the Beginning"]}
            ]},
            {"game_number": 2, "players": [
                {"name": "alice", "cards": ["Blade Knight"]},
                {"name": "bob", "cards": ["Chaos Emperor Dragon - Envoy of the End"]}
            ]}
        ]
    }"#
    .to_vec()
}

/// A replay with a marker the fixture classifier reacts to.
pub fn marked_payload(marker: &str) -> Vec<u8> {
    format!(r#"{{"marker": "{}", "games": []}}"#, marker).into_bytes()
}

pub fn league_match(replay_id: Option<i64>, score: &str) -> LeagueMatch {
    LeagueMatch {
        id: Uuid::new_v4(),
        season: 4,
        week: 2,
        match_score: score.to_string(),
        replay_url: replay_id.map(clean_replay_url),
        replay_id,
    }
}
