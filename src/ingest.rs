//! Ingest coordination
//!
//! Glue between the inbound signals and the stores:
//!
//! ```text
//! quiz submitted ─► link lookup ─► classify ─► accumulate ─► QuizCompleted
//!                      │
//!                      └─ unlinked: nothing to do
//! code redeemed  ─► LinkStore::redeem ─► Linked
//! ```
//!
//! Recording and notification are independent: a failed accumulate still
//! notifies, and a failed notification never undoes a write.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::classifier::TopicClassifier;
use crate::clock::Clock;
use crate::db::{Link, LinkStore, PerformanceRecord, PerformanceStore, VerificationCode};
use crate::error::{RedeemError, StorageError};
use crate::notifier::{Dispatcher, EventKind, OutboundEvent};

/// A single answered question
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizSubmission {
    pub platform_user_id: i64,
    pub activity_title: String,
    pub correct: bool,
    #[serde(default)]
    pub response_time_ms: u64,
}

/// A whole submitted attempt, one entry per question
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptSubmission {
    pub platform_user_id: i64,
    pub activity_title: String,
    pub question_results: Vec<bool>,
    #[serde(default)]
    pub duration_ms: u64,
}

/// What happened to an inbound submission
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum IngestOutcome {
    /// The platform user has no link; nothing was recorded
    Unlinked,
    /// Attempt without questions
    Empty,
    #[serde(rename_all = "camelCase")]
    Recorded {
        external_user_id: String,
        topic: String,
        record: PerformanceRecord,
    },
}

pub struct IngestCoordinator {
    links: Arc<LinkStore>,
    performance: Arc<PerformanceStore>,
    classifier: Arc<TopicClassifier>,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
}

impl IngestCoordinator {
    pub fn new(
        links: Arc<LinkStore>,
        performance: Arc<PerformanceStore>,
        classifier: Arc<TopicClassifier>,
        dispatcher: Dispatcher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            links,
            performance,
            classifier,
            dispatcher,
            clock,
        }
    }

    pub fn links(&self) -> &LinkStore {
        &self.links
    }

    pub fn performance(&self) -> &PerformanceStore {
        &self.performance
    }

    pub fn classifier(&self) -> &TopicClassifier {
        &self.classifier
    }

    /// Record one answered question for a linked user
    pub fn on_quiz_submitted(&self, submission: &QuizSubmission) -> Result<IngestOutcome, StorageError> {
        let link = match self.lookup_link(submission.platform_user_id)? {
            Some(link) => link,
            None => return Ok(IngestOutcome::Unlinked),
        };

        let topic = self.classifier.classify(&submission.activity_title);
        let recorded = self.performance.accumulate(
            &link.external_user_id,
            &topic,
            1,
            u32::from(submission.correct),
        );

        self.dispatcher.send(OutboundEvent {
            platform_user_id: link.platform_user_id,
            external_user_id: link.external_user_id.clone(),
            kind: EventKind::QuizCompleted {
                topic: topic.clone(),
                activity_title: submission.activity_title.clone(),
                correct: submission.correct,
                response_time_ms: submission.response_time_ms,
            },
            timestamp: self.clock.now_secs(),
        });

        self.finish(link, topic, recorded)
    }

    /// Record a whole attempt as one accumulate
    pub fn on_attempt_submitted(&self, attempt: &AttemptSubmission) -> Result<IngestOutcome, StorageError> {
        if attempt.question_results.is_empty() {
            return Ok(IngestOutcome::Empty);
        }

        let link = match self.lookup_link(attempt.platform_user_id)? {
            Some(link) => link,
            None => return Ok(IngestOutcome::Unlinked),
        };

        let questions = u32::try_from(attempt.question_results.len())
            .map_err(|_| StorageError::InvalidInput("attempt has too many questions".to_string()))?;
        let correct = attempt.question_results.iter().filter(|c| **c).count() as u32;

        let topic = self.classifier.classify(&attempt.activity_title);
        let recorded = self
            .performance
            .accumulate(&link.external_user_id, &topic, questions, correct);

        self.dispatcher.send(OutboundEvent {
            platform_user_id: link.platform_user_id,
            external_user_id: link.external_user_id.clone(),
            kind: EventKind::AttemptCompleted {
                topic: topic.clone(),
                activity_title: attempt.activity_title.clone(),
                total_questions: questions,
                correct_answers: correct,
                duration_ms: attempt.duration_ms,
            },
            timestamp: self.clock.now_secs(),
        });

        self.finish(link, topic, recorded)
    }

    /// Issue a fresh code for a platform user
    pub fn issue_code(&self, platform_user_id: i64) -> Result<VerificationCode, StorageError> {
        self.links.issue(platform_user_id).map_err(|e| {
            error!(platform_user_id, error = %e, "Failed to issue verification code");
            e
        })
    }

    /// Redeem a code and tell the bot once the link is committed
    pub fn redeem(
        &self,
        code: &str,
        external_user_id: &str,
        external_username: Option<&str>,
    ) -> Result<Link, RedeemError> {
        let link = self
            .links
            .redeem(code, external_user_id, external_username)
            .map_err(|e| {
                if let RedeemError::Storage(inner) = &e {
                    error!(external_user_id, error = %inner, "Code redemption failed");
                }
                e
            })?;

        self.dispatcher.send(OutboundEvent {
            platform_user_id: link.platform_user_id,
            external_user_id: link.external_user_id.clone(),
            kind: EventKind::Linked {
                external_username: link.external_username.clone(),
                code: link.code.clone(),
            },
            timestamp: self.clock.now_secs(),
        });

        Ok(link)
    }

    fn lookup_link(&self, platform_user_id: i64) -> Result<Option<Link>, StorageError> {
        let link = self
            .links
            .find_link_by_platform_user(platform_user_id)
            .map_err(|e| {
                error!(platform_user_id, error = %e, "Link lookup failed");
                e
            })?;

        if link.is_none() {
            debug!(platform_user_id, "Submission from unlinked user ignored");
        }
        Ok(link)
    }

    fn finish(
        &self,
        link: Link,
        topic: String,
        recorded: Result<PerformanceRecord, StorageError>,
    ) -> Result<IngestOutcome, StorageError> {
        match recorded {
            Ok(record) => Ok(IngestOutcome::Recorded {
                external_user_id: link.external_user_id,
                topic,
                record,
            }),
            Err(e) => {
                error!(
                    platform_user_id = link.platform_user_id,
                    external_user_id = %link.external_user_id,
                    topic = %topic,
                    error = %e,
                    "Failed to record performance"
                );
                Err(e)
            }
        }
    }
}
