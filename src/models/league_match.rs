use reqwest::Url;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const REPLAY_HOST: &str = "www.duelingbook.com";
const MAX_REPLAY_ID_DIGITS: usize = 15;

/// A league match as produced by the league data loaders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeagueMatch {
    pub id: Uuid,
    pub season: i32,
    pub week: i32,
    pub match_score: String,
    pub replay_url: Option<String>,
    pub replay_id: Option<i64>,
}

impl LeagueMatch {
    /// Replay id of the match, taken from the replay URL when the loader did
    /// not record one.
    pub fn resolved_replay_id(&self) -> Option<i64> {
        self.replay_id
            .or_else(|| self.replay_url.as_deref().and_then(extract_replay_id))
    }

    /// Only full-match replays get a job. A `*` or `(` in the score marks a
    /// match split across replays or one without a replay.
    pub fn is_eligible_for_job(&self) -> bool {
        if self.resolved_replay_id().is_none() {
            return false;
        }
        !(self.match_score.contains('*') || self.match_score.contains('('))
    }

    /// Locator the replay is fetched from.
    pub fn source_locator(&self) -> Option<String> {
        self.resolved_replay_id().map(clean_replay_url)
    }
}

/// Extract the numeric replay id from a replay URL, or `None` when the URL
/// is not a valid replay link.
pub fn extract_replay_id(replay_url: &str) -> Option<i64> {
    let url = Url::parse(replay_url).ok()?;
    if url.host_str() != Some(REPLAY_HOST) {
        return None;
    }

    let raw = url
        .query_pairs()
        .find(|(name, _)| name == "id")
        .map(|(_, value)| value.into_owned())?;

    let id = strip_user_prefix(&raw);
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if id.len() > MAX_REPLAY_ID_DIGITS {
        return None;
    }

    id.parse().ok()
}

/// Canonical replay URL for a replay id.
pub fn clean_replay_url(replay_id: i64) -> String {
    format!("https://duelingbook.com/replay?id={}", replay_id)
}

// Replay ids may carry a `<user id>-` prefix.
fn strip_user_prefix(raw: &str) -> &str {
    match raw.split_once('-') {
        Some((prefix, rest)) if !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_digit()) => {
            rest
        }
        _ => raw,
    }
}
