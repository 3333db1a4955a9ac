//! Ranking and Race Summary
//!
//! Ranking is a pure function of the player list; ranks are derived,
//! never stored. Ordering: higher position first, then earlier finish
//! time, with any finish beating none. The sort is stable, so players
//! that compare equal keep their join order.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::core::clock::TimestampMs;
use crate::core::id::PlayerId;
use crate::game::player::Player;
use crate::game::race::RaceSession;

/// Ranking comparator. `Less` means "ranks ahead of".
pub fn compare(a: &Player, b: &Player) -> Ordering {
    b.position
        .partial_cmp(&a.position)
        .unwrap_or(Ordering::Equal)
        .then_with(|| match (a.finish_time, b.finish_time) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
}

/// Rank all non-spectators of a player list, 1-based, stably ordered.
/// Disconnected racers are retained; only spectators are excluded.
pub fn rank_players(players: &[Player]) -> Vec<(usize, &Player)> {
    let mut racers: Vec<&Player> = players.iter().filter(|p| !p.is_spectator).collect();
    racers.sort_by(|a, b| compare(a, b));
    racers
        .into_iter()
        .enumerate()
        .map(|(i, p)| (i + 1, p))
        .collect()
}

/// One row of the post-race rankings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingEntry {
    /// Player identifier.
    pub id: PlayerId,
    /// Display name.
    pub name: String,
    /// 1-based rank.
    pub rank: usize,
    /// Final words per minute.
    pub wpm: f64,
    /// Final accuracy percentage.
    pub accuracy: f64,
    /// Whether the player crossed the finish line.
    pub finished: bool,
}

/// Aggregate statistics over finished players.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryStats {
    /// Mean WPM over finished players, 0 when none finished.
    pub avg_wpm: f64,
    /// Mean accuracy over finished players, 0 when none finished.
    pub avg_accuracy: f64,
    /// Finished players over all racers, 0 when the session had none.
    pub finish_rate: f64,
}

/// Emitted with `game_finished`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceSummary {
    /// Race duration, `endTime - startTime`.
    pub total_time: TimestampMs,
    /// Ranked racers.
    pub rankings: Vec<RankingEntry>,
    /// Aggregates over finished racers.
    pub stats: SummaryStats,
    /// A replay was captured for this race.
    pub replay_available: bool,
}

/// Compute the post-race summary for a session.
pub fn summarize(session: &RaceSession) -> RaceSummary {
    let total_time = match (session.start_time, session.end_time) {
        (Some(start), Some(end)) => end.saturating_sub(start),
        _ => 0,
    };

    let rankings: Vec<RankingEntry> = rank_players(&session.players)
        .into_iter()
        .map(|(rank, p)| RankingEntry {
            id: p.id,
            name: p.name.clone(),
            rank,
            wpm: p.wpm,
            accuracy: p.accuracy,
            finished: p.position >= 100.0,
        })
        .collect();

    let finished: Vec<&RankingEntry> = rankings.iter().filter(|r| r.finished).collect();
    let stats = if finished.is_empty() {
        SummaryStats {
            avg_wpm: 0.0,
            avg_accuracy: 0.0,
            finish_rate: 0.0,
        }
    } else {
        let n = finished.len() as f64;
        SummaryStats {
            avg_wpm: finished.iter().map(|r| r.wpm).sum::<f64>() / n,
            avg_accuracy: finished.iter().map(|r| r.accuracy).sum::<f64>() / n,
            finish_rate: n / rankings.len() as f64,
        }
    };

    RaceSummary {
        total_time,
        rankings,
        stats,
        replay_available: true,
    }
}
