//! Aggregation store: durable log of round history and the leaderboard.
//!
//! Two tables keyed by `(execution_id, team_id, round_number)`:
//! `round_history` holds the opaque conversation payload and the per-member
//! submission record; `leader_board` holds scores, feedback, and the
//! synthesized submission used for ranking.
//!
//! Concurrency model: one `AggregationStore` (one SQLite connection) per
//! worker, never shared across teams. WAL mode lets independent teams write
//! without serializing on each other; a busy timeout plus the transient error
//! split is the safety net for the rare overlap.

use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode};
use std::path::Path;

use crate::engine::types::{LeaderboardEntry, MemberSubmission, MetricFeedback, RoundState};
use crate::error::{EngineError, EngineResult};
use crate::providers::TokenUsage;

pub struct AggregationStore {
    conn: Connection,
}

/// Excerpt length stored in leaderboard projections.
const SUBMISSION_EXCERPT_CHARS: usize = 200;

fn map_sqlite_error(context: &str, e: rusqlite::Error) -> EngineError {
    if let rusqlite::Error::SqliteFailure(inner, _) = &e {
        match inner.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                return EngineError::StoreTransient(format!("{context}: {e}"));
            }
            ErrorCode::ConstraintViolation => {
                // A duplicate (execution_id, team_id, round) is a programming
                // bug, not contention. Never retried.
                return EngineError::StorePermanent(format!("{context}: {e}"));
            }
            _ => {}
        }
    }
    EngineError::StorePermanent(format!("{context}: {e}"))
}

impl AggregationStore {
    /// Open or create the store at `db_path` and configure it for concurrent
    /// team writers.
    pub fn open(db_path: &Path) -> EngineResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::StorePermanent(format!(
                    "cannot create store directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let conn = Connection::open(db_path)
            .map_err(|e| map_sqlite_error("open aggregation store", e))?;
        Self::configure(conn)
    }

    /// In-memory store for tests. Each call returns an independent database.
    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| map_sqlite_error("open in-memory store", e))?;
        Self::configure(conn)
    }

    fn configure(conn: Connection) -> EngineResult<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| map_sqlite_error("set store pragmas", e))?;

        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> EngineResult<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS round_history (
                    id                        INTEGER PRIMARY KEY AUTOINCREMENT,
                    execution_id              TEXT NOT NULL,
                    team_id                   TEXT NOT NULL,
                    team_name                 TEXT NOT NULL,
                    round_number              INTEGER NOT NULL,
                    message_history           TEXT NOT NULL,
                    member_submissions_record TEXT NOT NULL,
                    created_at                TEXT NOT NULL
                );
                CREATE UNIQUE INDEX IF NOT EXISTS idx_round_history_key
                    ON round_history(execution_id, team_id, round_number);

                CREATE TABLE IF NOT EXISTS leader_board (
                    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                    execution_id        TEXT NOT NULL,
                    team_id             TEXT NOT NULL,
                    team_name           TEXT NOT NULL,
                    round_number        INTEGER NOT NULL,
                    evaluation_score    REAL NOT NULL,
                    evaluation_feedback TEXT NOT NULL,
                    submission_content  TEXT NOT NULL,
                    usage_info          TEXT NOT NULL,
                    created_at          TEXT NOT NULL
                );
                CREATE UNIQUE INDEX IF NOT EXISTS idx_leader_board_key
                    ON leader_board(execution_id, team_id, round_number);
                CREATE INDEX IF NOT EXISTS idx_leader_board_execution
                    ON leader_board(execution_id);",
            )
            .map_err(|e| map_sqlite_error("init store schema", e))
    }

    /// Append a round's conversation payload and member record.
    pub fn save_aggregation(&self, round: &RoundState) -> EngineResult<()> {
        let member_record = serde_json::to_string(&round.member_submissions)
            .map_err(|e| EngineError::StorePermanent(format!("encode member record: {e}")))?;
        let message_history = serde_json::to_string(&round.message_history)
            .map_err(|e| EngineError::StorePermanent(format!("encode message history: {e}")))?;

        self.conn
            .execute(
                "INSERT INTO round_history
                    (execution_id, team_id, team_name, round_number,
                     message_history, member_submissions_record, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    round.execution_id,
                    round.team_id,
                    round.team_name,
                    round.round_number,
                    message_history,
                    member_record,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| map_sqlite_error("insert round_history", e))?;
        Ok(())
    }

    /// Append the round's leaderboard row.
    pub fn save_leaderboard_entry(&self, round: &RoundState) -> EngineResult<()> {
        let feedback = serde_json::to_string(&round.evaluation_feedback)
            .map_err(|e| EngineError::StorePermanent(format!("encode feedback: {e}")))?;
        let usage = serde_json::to_string(&round.usage)
            .map_err(|e| EngineError::StorePermanent(format!("encode usage: {e}")))?;

        self.conn
            .execute(
                "INSERT INTO leader_board
                    (execution_id, team_id, team_name, round_number,
                     evaluation_score, evaluation_feedback, submission_content,
                     usage_info, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    round.execution_id,
                    round.team_id,
                    round.team_name,
                    round.round_number,
                    round.evaluation_score,
                    feedback,
                    round.submission_content,
                    usage,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| map_sqlite_error("insert leader_board", e))?;
        Ok(())
    }

    /// Reconstruct a team's persisted rounds for cold resume. Normal
    /// operation holds history in memory; this joins both tables so the
    /// rebuilt state carries content, members, and the stored score.
    pub fn load_round_history(
        &self,
        execution_id: &str,
        team_id: &str,
    ) -> EngineResult<Vec<RoundState>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT rh.round_number, rh.team_name, rh.message_history,
                        rh.member_submissions_record, rh.created_at,
                        lb.evaluation_score, lb.evaluation_feedback,
                        lb.submission_content, lb.usage_info
                 FROM round_history rh
                 JOIN leader_board lb
                   ON lb.execution_id = rh.execution_id
                  AND lb.team_id = rh.team_id
                  AND lb.round_number = rh.round_number
                 WHERE rh.execution_id = ?1 AND rh.team_id = ?2
                 ORDER BY rh.round_number ASC",
            )
            .map_err(|e| map_sqlite_error("prepare round history query", e))?;

        let rows = stmt
            .query_map(params![execution_id, team_id], |row| {
                let round_number: u32 = row.get(0)?;
                let team_name: String = row.get(1)?;
                let message_history: String = row.get(2)?;
                let member_record: String = row.get(3)?;
                let created_at: String = row.get(4)?;
                let evaluation_score: f64 = row.get(5)?;
                let feedback: String = row.get(6)?;
                let submission_content: String = row.get(7)?;
                let usage: String = row.get(8)?;
                Ok((
                    round_number,
                    team_name,
                    message_history,
                    member_record,
                    created_at,
                    evaluation_score,
                    feedback,
                    submission_content,
                    usage,
                ))
            })
            .map_err(|e| map_sqlite_error("query round history", e))?;

        let mut rounds = Vec::new();
        for row in rows {
            let (
                round_number,
                team_name,
                message_history,
                member_record,
                created_at,
                evaluation_score,
                feedback,
                submission_content,
                usage,
            ) = row.map_err(|e| map_sqlite_error("read round history row", e))?;

            let member_submissions: Vec<MemberSubmission> = serde_json::from_str(&member_record)
                .map_err(|e| EngineError::StorePermanent(format!("decode member record: {e}")))?;
            let message_history: serde_json::Value = serde_json::from_str(&message_history)
                .map_err(|e| EngineError::StorePermanent(format!("decode message history: {e}")))?;
            let evaluation_feedback: Vec<MetricFeedback> = serde_json::from_str(&feedback)
                .map_err(|e| EngineError::StorePermanent(format!("decode feedback: {e}")))?;
            let usage: TokenUsage = serde_json::from_str(&usage)
                .map_err(|e| EngineError::StorePermanent(format!("decode usage: {e}")))?;
            let completed_at = chrono::DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| EngineError::StorePermanent(format!("decode created_at: {e}")))?
                .with_timezone(&Utc);

            rounds.push(RoundState {
                execution_id: execution_id.to_string(),
                team_id: team_id.to_string(),
                team_name,
                round_number,
                submission_content,
                member_submissions,
                message_history,
                evaluation_score,
                evaluation_feedback,
                usage,
                execution_time: std::time::Duration::ZERO,
                completed_at,
            });
        }
        Ok(rounds)
    }

    /// Current ranking for an execution: each team's best round, ordered best
    /// first. Ties break by earlier round, then lower team id.
    pub fn leaderboard_ranking(&self, execution_id: &str) -> EngineResult<Vec<LeaderboardEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT team_id, team_name, round_number, evaluation_score, submission_content
                 FROM leader_board WHERE execution_id = ?1",
            )
            .map_err(|e| map_sqlite_error("prepare ranking query", e))?;

        let rows = stmt
            .query_map(params![execution_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(|e| map_sqlite_error("query leaderboard", e))?;

        let mut best: std::collections::HashMap<String, LeaderboardEntry> =
            std::collections::HashMap::new();
        for row in rows {
            let (team_id, team_name, round_number, score, submission) =
                row.map_err(|e| map_sqlite_error("read leaderboard row", e))?;
            let entry = LeaderboardEntry {
                execution_id: execution_id.to_string(),
                team_id: team_id.clone(),
                team_name,
                round_number,
                score,
                submission_excerpt: submission.chars().take(SUBMISSION_EXCERPT_CHARS).collect(),
            };
            match best.get(&team_id) {
                Some(current)
                    if !crate::engine::types::better_round(
                        entry.score,
                        entry.round_number,
                        &entry.team_id,
                        current.score,
                        current.round_number,
                        &current.team_id,
                    ) => {}
                _ => {
                    best.insert(team_id, entry);
                }
            }
        }

        let mut ranking: Vec<LeaderboardEntry> = best.into_values().collect();
        ranking.sort_by(|a, b| {
            if crate::engine::types::better_round(
                a.score,
                a.round_number,
                &a.team_id,
                b.score,
                b.round_number,
                &b.team_id,
            ) {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Greater
            }
        });
        Ok(ranking)
    }

    /// Round numbers already persisted for a team, ascending. Used by tests
    /// and the gap-free sequence invariant.
    pub fn persisted_rounds(&self, execution_id: &str, team_id: &str) -> EngineResult<Vec<u32>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT round_number FROM round_history
                 WHERE execution_id = ?1 AND team_id = ?2 ORDER BY round_number ASC",
            )
            .map_err(|e| map_sqlite_error("prepare rounds query", e))?;
        let rows = stmt
            .query_map(params![execution_id, team_id], |row| row.get::<_, u32>(0))
            .map_err(|e| map_sqlite_error("query rounds", e))?;
        let mut rounds = Vec::new();
        for row in rows {
            rounds.push(row.map_err(|e| map_sqlite_error("read round number", e))?);
        }
        Ok(rounds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::SubmissionStatus;
    use std::time::Duration;

    fn sample_round(team_id: &str, round_number: u32, score: f64) -> RoundState {
        RoundState {
            execution_id: "exec-1".into(),
            team_id: team_id.into(),
            team_name: format!("Team {team_id}"),
            round_number,
            submission_content: format!("submission from {team_id} round {round_number}"),
            member_submissions: vec![MemberSubmission {
                agent_name: "analyst".into(),
                agent_type: "plain".into(),
                content: "member output".into(),
                status: SubmissionStatus::Success,
                error_kind: None,
                error_message: None,
                usage: TokenUsage::single_request(10, 20),
                timestamp: Utc::now(),
            }],
            message_history: serde_json::json!({"version": 1, "messages": []}),
            evaluation_score: score,
            evaluation_feedback: vec![MetricFeedback {
                name: "Relevance".into(),
                score,
                comment: "on point".into(),
            }],
            usage: TokenUsage::single_request(30, 40),
            execution_time: Duration::from_secs(2),
            completed_at: Utc::now(),
        }
    }

    fn save_round(store: &AggregationStore, round: &RoundState) {
        store.save_aggregation(round).unwrap();
        store.save_leaderboard_entry(round).unwrap();
    }

    #[test]
    fn round_trip_preserves_content_and_score() {
        let store = AggregationStore::open_in_memory().unwrap();
        let round = sample_round("alpha", 1, 87.5);
        save_round(&store, &round);

        let loaded = store.load_round_history("exec-1", "alpha").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].submission_content, round.submission_content);
        assert_eq!(loaded[0].evaluation_score, 87.5);
        assert_eq!(loaded[0].member_submissions.len(), 1);
        assert_eq!(loaded[0].member_submissions[0].content, "member output");
        assert_eq!(loaded[0].message_history["version"], 1);
        assert_eq!(loaded[0].usage, round.usage);
    }

    #[test]
    fn duplicate_round_is_permanent_error() {
        let store = AggregationStore::open_in_memory().unwrap();
        let round = sample_round("alpha", 1, 50.0);
        store.save_aggregation(&round).unwrap();
        let err = store.save_aggregation(&round).unwrap_err();
        assert_eq!(err.kind(), "store_permanent");
        assert!(!err.is_transient());
    }

    #[test]
    fn ranking_takes_best_round_per_team() {
        let store = AggregationStore::open_in_memory().unwrap();
        save_round(&store, &sample_round("alpha", 1, 60.0));
        save_round(&store, &sample_round("alpha", 2, 85.0));
        save_round(&store, &sample_round("beta", 1, 70.0));

        let ranking = store.leaderboard_ranking("exec-1").unwrap();
        assert_eq!(ranking.len(), 2);
        assert_eq!(ranking[0].team_id, "alpha");
        assert_eq!(ranking[0].score, 85.0);
        assert_eq!(ranking[0].round_number, 2);
        assert_eq!(ranking[1].team_id, "beta");
    }

    #[test]
    fn ranking_tie_breaks_by_round_then_team_id() {
        let store = AggregationStore::open_in_memory().unwrap();
        save_round(&store, &sample_round("beta", 1, 80.0));
        save_round(&store, &sample_round("alpha", 1, 80.0));

        let ranking = store.leaderboard_ranking("exec-1").unwrap();
        assert_eq!(ranking[0].team_id, "alpha");
        assert_eq!(ranking[1].team_id, "beta");

        // Within one team, the earlier round wins an exact tie.
        save_round(&store, &sample_round("alpha", 2, 80.0));
        let ranking = store.leaderboard_ranking("exec-1").unwrap();
        assert_eq!(ranking[0].round_number, 1);
    }

    #[test]
    fn ranking_is_scoped_to_execution() {
        let store = AggregationStore::open_in_memory().unwrap();
        save_round(&store, &sample_round("alpha", 1, 90.0));
        let mut other = sample_round("gamma", 1, 99.0);
        other.execution_id = "exec-2".into();
        save_round(&store, &other);

        let ranking = store.leaderboard_ranking("exec-1").unwrap();
        assert_eq!(ranking.len(), 1);
        assert_eq!(ranking[0].team_id, "alpha");
    }

    #[test]
    fn persisted_rounds_are_consecutive() {
        let store = AggregationStore::open_in_memory().unwrap();
        for round_number in 1..=3 {
            save_round(&store, &sample_round("alpha", round_number, 50.0));
        }
        let rounds = store.persisted_rounds("exec-1", "alpha").unwrap();
        assert_eq!(rounds, vec![1, 2, 3]);
    }

    #[test]
    fn submission_excerpt_is_truncated() {
        let store = AggregationStore::open_in_memory().unwrap();
        let mut round = sample_round("alpha", 1, 75.0);
        round.submission_content = "x".repeat(1000);
        save_round(&store, &round);

        let ranking = store.leaderboard_ranking("exec-1").unwrap();
        assert_eq!(ranking[0].submission_excerpt.len(), SUBMISSION_EXCERPT_CHARS);
    }

    #[test]
    fn empty_execution_ranks_empty() {
        let store = AggregationStore::open_in_memory().unwrap();
        assert!(store.leaderboard_ranking("nope").unwrap().is_empty());
        assert!(store.load_round_history("nope", "alpha").unwrap().is_empty());
    }

    #[test]
    fn on_disk_store_shares_data_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("mixseek.db");

        let writer = AggregationStore::open(&db_path).unwrap();
        save_round(&writer, &sample_round("alpha", 1, 65.0));

        // A second connection (another worker) sees the committed row.
        let reader = AggregationStore::open(&db_path).unwrap();
        let ranking = reader.leaderboard_ranking("exec-1").unwrap();
        assert_eq!(ranking.len(), 1);
        assert_eq!(ranking[0].score, 65.0);
    }
}
