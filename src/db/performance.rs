//! Per-topic performance aggregates
//!
//! Every quiz submission adds to the counters of one
//! (external user, topic) row. The add happens in a single
//! `INSERT ... ON CONFLICT DO UPDATE ... RETURNING` statement, so two
//! submissions racing on the same key both land. Accuracy is always
//! recomputed from the summed counters, never averaged.

use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, info};

use super::Database;
use crate::clock::Clock;
use crate::error::StorageError;

const RECORD_COLUMNS: &str = "external_user_id, topic_name, total_questions, correct_answers, \
                              incorrect_answers, accuracy, last_activity_at, created_at";

const ACCUMULATE_SQL: &str = r#"
INSERT INTO topic_performance (
    external_user_id, topic_name, total_questions, correct_answers,
    incorrect_answers, accuracy, last_activity_at, created_at
)
VALUES (
    ?1, ?2, ?3, ?4, ?3 - ?4,
    CASE WHEN ?3 > 0 THEN (?4 * 100.0) / ?3 ELSE 0.0 END,
    ?5, ?5
)
ON CONFLICT (external_user_id, topic_name) DO UPDATE SET
    total_questions = total_questions + excluded.total_questions,
    correct_answers = correct_answers + excluded.correct_answers,
    incorrect_answers = incorrect_answers + excluded.incorrect_answers,
    accuracy = CASE
        WHEN total_questions + excluded.total_questions > 0
        THEN ((correct_answers + excluded.correct_answers) * 100.0)
             / (total_questions + excluded.total_questions)
        ELSE 0.0
    END,
    last_activity_at = excluded.last_activity_at
RETURNING external_user_id, topic_name, total_questions, correct_answers,
          incorrect_answers, accuracy, last_activity_at, created_at
"#;

/// Aggregate counters for one user and topic
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceRecord {
    pub external_user_id: String,
    pub topic_name: String,
    pub total_questions: u64,
    pub correct_answers: u64,
    pub incorrect_answers: u64,
    /// Percentage in [0, 100]
    pub accuracy: f64,
    pub last_activity_at: i64,
    pub created_at: i64,
}

impl PerformanceRecord {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            external_user_id: row.get("external_user_id")?,
            topic_name: row.get("topic_name")?,
            total_questions: row.get::<_, i64>("total_questions")? as u64,
            correct_answers: row.get::<_, i64>("correct_answers")? as u64,
            incorrect_answers: row.get::<_, i64>("incorrect_answers")? as u64,
            accuracy: row.get("accuracy")?,
            last_activity_at: row.get("last_activity_at")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Overall picture of one user across topics
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub external_user_id: String,
    pub topic_count: usize,
    pub total_questions: u64,
    pub correct_answers: u64,
    pub incorrect_answers: u64,
    /// From summed counters, not the mean of per-topic accuracies
    pub accuracy: f64,
    pub weakest_topic: Option<String>,
    pub strongest_topic: Option<String>,
    pub last_activity_at: Option<i64>,
}

/// Accuracy percentage, 0 when nothing was answered
pub fn accuracy_of(correct: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (correct as f64 * 100.0) / total as f64
    }
}

/// Persistence for performance aggregates
pub struct PerformanceStore {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl PerformanceStore {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Add answered/correct counts to the (user, topic) row, creating it if needed
    pub fn accumulate(
        &self,
        external_user_id: &str,
        topic_name: &str,
        questions: u32,
        correct: u32,
    ) -> Result<PerformanceRecord, StorageError> {
        if correct > questions {
            return Err(StorageError::InvalidInput(format!(
                "correct answers ({}) exceed questions answered ({})",
                correct, questions
            )));
        }

        let now = self.clock.now_secs();
        let record = self.db.with_conn(|conn| {
            conn.query_row(
                ACCUMULATE_SQL,
                params![external_user_id, topic_name, questions as i64, correct as i64, now],
                PerformanceRecord::from_row,
            )
            .map_err(|e| StorageError::db("Accumulate performance failed", e))
        })?;

        debug!(
            external_user_id,
            topic = topic_name,
            total = record.total_questions,
            correct = record.correct_answers,
            accuracy = record.accuracy,
            "Accumulated topic performance"
        );

        Ok(record)
    }

    /// Single record
    pub fn get(&self, external_user_id: &str, topic_name: &str) -> Result<Option<PerformanceRecord>, StorageError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM topic_performance WHERE external_user_id = ?1 AND topic_name = ?2",
                RECORD_COLUMNS
            );
            conn.query_row(&sql, params![external_user_id, topic_name], PerformanceRecord::from_row)
                .optional()
                .map_err(|e| StorageError::db("Performance query failed", e))
        })
    }

    /// All topics of a user, weakest first
    pub fn get_by_user(&self, external_user_id: &str) -> Result<Vec<PerformanceRecord>, StorageError> {
        self.db.with_conn(|conn| records_for_user(conn, external_user_id))
    }

    /// Totals across every topic of a user
    pub fn summary(&self, external_user_id: &str) -> Result<UserSummary, StorageError> {
        let records = self.get_by_user(external_user_id)?;

        let total_questions: u64 = records.iter().map(|r| r.total_questions).sum();
        let correct_answers: u64 = records.iter().map(|r| r.correct_answers).sum();
        let incorrect_answers: u64 = records.iter().map(|r| r.incorrect_answers).sum();

        Ok(UserSummary {
            external_user_id: external_user_id.to_string(),
            topic_count: records.len(),
            total_questions,
            correct_answers,
            incorrect_answers,
            accuracy: accuracy_of(correct_answers, total_questions),
            weakest_topic: records.first().map(|r| r.topic_name.clone()),
            strongest_topic: records.last().map(|r| r.topic_name.clone()),
            last_activity_at: records.iter().map(|r| r.last_activity_at).max(),
        })
    }

    /// Drop every record of a user (administrative reset)
    pub fn reset_user(&self, external_user_id: &str) -> Result<usize, StorageError> {
        let removed = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM topic_performance WHERE external_user_id = ?1",
                params![external_user_id],
            )
            .map_err(|e| StorageError::db("Reset performance failed", e))
        })?;

        info!(external_user_id, removed, "Reset topic performance");
        Ok(removed)
    }
}

fn records_for_user(conn: &Connection, external_user_id: &str) -> Result<Vec<PerformanceRecord>, StorageError> {
    let sql = format!(
        "SELECT {} FROM topic_performance WHERE external_user_id = ?1 \
         ORDER BY accuracy ASC, topic_name ASC",
        RECORD_COLUMNS
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| StorageError::db("Prepare failed", e))?;

    let rows = stmt
        .query_map(params![external_user_id], PerformanceRecord::from_row)
        .map_err(|e| StorageError::db("Query failed", e))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| StorageError::db("Row fetch failed", e))
}
