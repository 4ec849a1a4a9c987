//! Per-round result records.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

/// Winner value of a round nobody won.
pub const RESULT_TIE: &str = "Tie";

/// Validity and score of one player in one round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerStats {
    /// Why the submission was rejected. Empty for valid submissions.
    #[serde(default)]
    pub invalid_reason: String,
    /// Same value as the player's entry in [`RoundStats::scores`].
    #[serde(default)]
    pub score: f64,
    /// Whether the submission passed validation.
    #[serde(default)]
    pub valid_submit: bool,
}

/// Result of one round.
///
/// Created with an entry for every competitor. Serialization always writes a score for every
/// entry of `player_stats`, so a persisted record is complete even if a scorer skipped a player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "RoundRecord", from = "RoundRecord")]
pub struct RoundStats {
    /// Round number, 0 for the baseline.
    pub round_num: usize,
    /// A competitor name or [`RESULT_TIE`].
    pub winner: String,
    /// Aggregated score of each competitor.
    pub scores: BTreeMap<String, f64>,
    /// Per-competitor validity.
    pub player_stats: BTreeMap<String, PlayerStats>,
    /// Free-form human readable notes.
    pub details: Vec<String>,
}

impl RoundStats {
    /// A tied round with score 0 for everyone in `players`.
    pub fn new<S: AsRef<str>>(round_num: usize, players: &[S]) -> Self {
        let names = players.iter().map(|p| p.as_ref().to_string());
        Self {
            round_num,
            winner: RESULT_TIE.to_string(),
            scores: names.clone().map(|n| (n, 0.0)).collect(),
            player_stats: names.map(|n| (n, PlayerStats::default())).collect(),
            details: Vec::new(),
        }
    }

    /// Whether `name` takes part in this round.
    pub fn is_player(&self, name: &str) -> bool {
        self.player_stats.contains_key(name)
    }

    /// Competitor names, sorted.
    pub fn players(&self) -> impl Iterator<Item = &str> {
        self.player_stats.keys().map(String::as_str)
    }

    /// Whether nobody won.
    pub fn is_tie(&self) -> bool {
        self.winner == RESULT_TIE
    }

    /// Set the score of a competitor. Unknown names are ignored and reported as `false`.
    pub fn set_score(&mut self, name: &str, score: f64) -> bool {
        if !self.is_player(name) {
            return false;
        }
        self.scores.insert(name.to_string(), score);
        if let Some(stats) = self.player_stats.get_mut(name) {
            stats.score = score;
        }
        true
    }

    /// Winner is the unique holder of the highest score; ties and all-zero rounds are ties.
    pub fn decide_winner_by_score(&mut self) {
        let best = self.scores.values().copied().fold(f64::NEG_INFINITY, f64::max);
        let leaders: Vec<&String> = self
            .scores
            .iter()
            .filter(|(_, score)| **score == best)
            .map(|(name, _)| name)
            .collect();
        self.winner = match leaders.as_slice() {
            [only] if best > 0.0 => (*only).clone(),
            _ => RESULT_TIE.to_string(),
        };
    }

    /// Enforce the record invariants: the winner is a competitor or the tie sentinel, scores
    /// cover exactly the competitors, and each player's stats carry its score.
    pub fn normalize(&mut self) {
        if !self.is_tie() && !self.is_player(&self.winner) {
            self.details.push(format!(
                "Reported winner '{}' is not a player of this round; recorded as a tie",
                self.winner
            ));
            self.winner = RESULT_TIE.to_string();
        }
        let unknown: Vec<String> = self
            .scores
            .keys()
            .filter(|name| !self.player_stats.contains_key(*name))
            .cloned()
            .collect();
        for name in unknown {
            self.scores.remove(&name);
        }
        for (name, stats) in self.player_stats.iter_mut() {
            let score = *self.scores.entry(name.clone()).or_insert(0.0);
            stats.score = score;
        }
    }
}

impl fmt::Display for RoundStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "In round {}, the winner is {}.",
            self.round_num, self.winner
        )?;
        writeln!(f, "\nSummary of player performance:")?;
        for (player, stats) in &self.player_stats {
            let score = self.scores.get(player).copied().unwrap_or(0.0);
            if stats.valid_submit {
                writeln!(f, "- {player}: submission valid, score={score}")?;
            } else {
                writeln!(
                    f,
                    "- {player}: submission failed with error: {}",
                    stats.invalid_reason
                )?;
            }
        }
        if !self.details.is_empty() {
            writeln!(f, "Details:")?;
            for line in &self.details {
                writeln!(f, "- {line}")?;
            }
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct RoundRecord {
    round_num: usize,
    winner: String,
    #[serde(default)]
    details: Vec<String>,
    scores: BTreeMap<String, f64>,
    #[serde(default)]
    player_stats: BTreeMap<String, PlayerStats>,
}

impl From<RoundStats> for RoundRecord {
    fn from(stats: RoundStats) -> Self {
        let mut scores = stats.scores;
        let mut player_stats = stats.player_stats;
        for (name, entry) in player_stats.iter_mut() {
            entry.score = *scores.entry(name.clone()).or_insert(0.0);
        }
        RoundRecord {
            round_num: stats.round_num,
            winner: stats.winner,
            details: stats.details,
            scores,
            player_stats,
        }
    }
}

impl From<RoundRecord> for RoundStats {
    fn from(record: RoundRecord) -> Self {
        RoundStats {
            round_num: record.round_num,
            winner: record.winner,
            scores: record.scores,
            player_stats: record.player_stats,
            details: record.details,
        }
    }
}
