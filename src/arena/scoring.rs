//! Win counting shared by the built-in games.

use std::collections::BTreeMap;

use super::{ExecutionReport, RoundArtifacts};
use crate::round_stats::RoundStats;

/// Counts repetition outcomes and turns them into round scores.
///
/// Counting is commutative, so the completion order of repetitions never matters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WinTally {
    wins: BTreeMap<String, f64>,
    draws: usize,
    unreadable: usize,
}

impl WinTally {
    /// Empty tally.
    pub fn new() -> Self {
        Self::default()
    }

    /// One repetition won by `player`.
    pub fn win(&mut self, player: &str) {
        self.add(player, 1.0);
    }

    /// Add `points` to `player`.
    pub fn add(&mut self, player: &str, points: f64) {
        *self.wins.entry(player.to_string()).or_insert(0.0) += points;
    }

    /// One drawn repetition.
    pub fn draw(&mut self) {
        self.draws += 1;
    }

    /// One completed repetition whose result could not be read.
    pub fn unreadable(&mut self) {
        self.unreadable += 1;
    }

    /// Repetitions that produced a result.
    pub fn counted(&self) -> usize {
        self.wins.values().sum::<f64>() as usize + self.draws
    }

    /// Points of `player` so far.
    pub fn points(&self, player: &str) -> f64 {
        self.wins.get(player).copied().unwrap_or(0.0)
    }

    /// Write scores, winner and details into `stats`.
    ///
    /// - A lone player left after every other one forfeited wins the whole point pool.
    /// - With no counted repetition the round is a tie with every score at 0.
    /// - Otherwise the unique top scorer wins and shared maxima are ties.
    pub fn apply(self, players: &[&str], artifacts: &RoundArtifacts<'_>, stats: &mut RoundStats) {
        let report = artifacts.report;
        describe(report, stats);
        if self.draws > 0 {
            stats
                .details
                .push(format!("{} simulations ended in a draw", self.draws));
        }
        if self.unreadable > 0 {
            stats.details.push(format!(
                "{} simulation results could not be read",
                self.unreadable
            ));
        }

        let remaining: Vec<&str> = players
            .iter()
            .copied()
            .filter(|p| !report.forfeited(p))
            .collect();
        if !report.forfeits.is_empty() && remaining.len() == 1 {
            let winner = remaining[0];
            stats.set_score(winner, artifacts.sims_per_round as f64);
            stats.winner = winner.to_string();
            stats
                .details
                .push(format!("{winner} was the only player able to play"));
            return;
        }

        if self.wins.is_empty() && self.draws == 0 {
            stats
                .details
                .push("No simulation completed; the round is a tie".to_string());
            return;
        }
        for (player, points) in &self.wins {
            if !stats.set_score(player, *points) {
                stats
                    .details
                    .push(format!("Ignored {points} points for unknown player '{player}'"));
            }
        }
        stats.decide_winner_by_score();
    }
}

fn describe(report: &ExecutionReport, stats: &mut RoundStats) {
    for (player, reason) in &report.forfeits {
        stats.details.push(format!("{player} forfeited: {reason}"));
    }
    if !report.timed_out.is_empty() {
        stats.details.push(format!(
            "{} simulations timed out and were not counted",
            report.timed_out.len()
        ));
    }
    if !report.failed.is_empty() {
        stats.details.push(format!(
            "{} simulations failed and were not counted",
            report.failed.len()
        ));
    }
    stats.details.extend(report.notes.iter().cloned());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::round_stats::RESULT_TIE;
    use std::path::Path;

    fn artifacts(report: &ExecutionReport) -> RoundArtifacts<'_> {
        RoundArtifacts {
            report,
            log_dir: Path::new("/nonexistent"),
            sims_per_round: 100,
        }
    }

    #[test]
    fn sixty_forty() {
        let report = ExecutionReport::default();
        let mut tally = WinTally::new();
        for i in 0..100 {
            tally.win(if i % 5 < 3 { "A" } else { "B" });
        }
        let mut stats = RoundStats::new(1, &["A", "B"]);
        tally.apply(&["A", "B"], &artifacts(&report), &mut stats);
        assert_eq!(stats.winner, "A");
        assert_eq!(stats.scores["A"], 60.0);
        assert_eq!(stats.scores["B"], 40.0);
    }

    #[test]
    fn nothing_completed_is_a_tie() {
        let report = ExecutionReport {
            timed_out: vec![0, 1, 2],
            ..Default::default()
        };
        let mut stats = RoundStats::new(1, &["A", "B"]);
        WinTally::new().apply(&["A", "B"], &artifacts(&report), &mut stats);
        assert_eq!(stats.winner, RESULT_TIE);
        assert!(stats.scores.values().all(|s| *s == 0.0));
        assert!(stats.details.iter().any(|d| d.contains("timed out")));
    }

    #[test]
    fn lone_survivor_takes_the_pool() {
        let report = ExecutionReport {
            forfeits: vec![("B".into(), "server did not start".into())],
            ..Default::default()
        };
        let mut stats = RoundStats::new(1, &["A", "B"]);
        WinTally::new().apply(&["A", "B"], &artifacts(&report), &mut stats);
        assert_eq!(stats.winner, "A");
        assert_eq!(stats.scores["A"], 100.0);
        assert_eq!(stats.scores["B"], 0.0);
    }

    #[test]
    fn draws_stay_out_of_scores() {
        let report = ExecutionReport::default();
        let mut tally = WinTally::new();
        tally.win("A");
        tally.win("B");
        tally.draw();
        assert_eq!(tally.counted(), 3);
        let mut stats = RoundStats::new(1, &["A", "B"]);
        tally.apply(&["A", "B"], &artifacts(&report), &mut stats);
        assert_eq!(stats.winner, RESULT_TIE);
        assert_eq!(stats.scores.len(), 2);
        assert!(stats.details.iter().any(|d| d.contains("draw")));
    }
}
