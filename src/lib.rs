//! Quizlink - account linking and quiz performance for a learning platform and a chat bot
//!
//! A platform user asks for a six-digit verification code and types it into
//! the bot. Once redeemed, the two accounts are linked, and every quiz
//! answer submitted on the platform is classified into a syllabus topic and
//! added to that user's per-topic counters. The bot is told about new links
//! and completed quizzes over HTTP.
//!
//! ## Flow
//!
//! ```text
//! platform ── POST /link/code ──────────► LinkStore::issue
//! bot ─────── POST /link/redeem ────────► LinkStore::redeem ──► Notifier (/linked)
//! platform ── POST /events/quiz-submitted
//!               └► IngestCoordinator ──► TopicClassifier
//!                                    ├─► PerformanceStore::accumulate
//!                                    └─► Notifier (/quiz-completed)
//! ```
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/quizlink/
//! ├── quizlink.db            # SQLite: link_codes, topic_performance
//! └── config.toml            # Configuration
//! ```

pub mod classifier;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod ingest;
pub mod notifier;
pub mod sweeper;

// Re-exports
pub use classifier::{TopicClassifier, TopicRule};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use db::{Database, Link, LinkStatus, LinkStore, PerformanceRecord, PerformanceStore, UserSummary, VerificationCode};
pub use error::{DeliveryError, RedeemError, StorageError};
pub use http::HttpServer;
pub use ingest::{AttemptSubmission, IngestCoordinator, IngestOutcome, QuizSubmission};
pub use notifier::{Dispatcher, EventKind, HttpNotifier, NoopNotifier, Notifier, OutboundEvent};
pub use sweeper::Sweeper;
