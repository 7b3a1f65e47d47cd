//! Verification codes and account links
//!
//! ```text
//! Pending  --redeem (valid, unexpired)--> Verified    (the current link)
//! Pending  --sweep (expired)-----------> deleted
//! Verified --later redeem, either side--> Superseded  (history)
//! ```
//!
//! Issuing a new code replaces the user's pending one inside a single
//! IMMEDIATE transaction. Redemption runs in one as well: it is a
//! compare-and-set on `state = 'pending'`, so a retried or duplicated
//! redeem can never verify the same row twice.
//!
//! Links are one-to-one. When a redemption links platform user P to
//! external user E, any current link of P and any current link of E is
//! superseded in the same transaction, so the newest redemption wins on
//! both sides.

use std::sync::Arc;

use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::Database;
use crate::clock::Clock;
use crate::error::{RedeemError, StorageError};

/// Default code lifetime: 15 minutes
pub const DEFAULT_CODE_TTL_SECS: i64 = 15 * 60;

/// Attempts at finding an unused code before giving up
const MAX_CODE_ATTEMPTS: u32 = 64;

/// Produces candidate 6-digit codes
pub type CodeGenerator = Box<dyn Fn() -> String + Send + Sync>;

const CODE_COLUMNS: &str = "id, platform_user_id, code, state, created_at, expires_at, \
                            external_user_id, external_username, verified_at";

/// Lifecycle state of a verification code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeState {
    Pending,
    Verified,
    Superseded,
}

impl CodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeState::Pending => "pending",
            CodeState::Verified => "verified",
            CodeState::Superseded => "superseded",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CodeState::Pending),
            "verified" => Some(CodeState::Verified),
            "superseded" => Some(CodeState::Superseded),
            _ => None,
        }
    }
}

/// Verification code row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationCode {
    pub id: i64,
    pub platform_user_id: i64,
    pub code: String,
    pub state: CodeState,
    pub created_at: i64,
    pub expires_at: i64,
    pub external_user_id: Option<String>,
    pub external_username: Option<String>,
    pub verified_at: Option<i64>,
}

impl VerificationCode {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let state: String = row.get("state")?;
        Ok(Self {
            id: row.get("id")?,
            platform_user_id: row.get("platform_user_id")?,
            code: row.get("code")?,
            state: CodeState::parse(&state).ok_or_else(|| {
                rusqlite::Error::InvalidColumnType(3, "state".into(), rusqlite::types::Type::Text)
            })?,
            created_at: row.get("created_at")?,
            expires_at: row.get("expires_at")?,
            external_user_id: row.get("external_user_id")?,
            external_username: row.get("external_username")?,
            verified_at: row.get("verified_at")?,
        })
    }

    /// The link this code represents, if it has been redeemed
    pub fn as_link(&self) -> Option<Link> {
        match (self.state, &self.external_user_id, self.verified_at) {
            (CodeState::Verified, Some(external_user_id), Some(verified_at)) => Some(Link {
                platform_user_id: self.platform_user_id,
                external_user_id: external_user_id.clone(),
                external_username: self.external_username.clone(),
                code: self.code.clone(),
                verified_at,
            }),
            _ => None,
        }
    }
}

/// Confirmed association between a platform user and an external user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    pub platform_user_id: i64,
    pub external_user_id: String,
    pub external_username: Option<String>,
    pub code: String,
    pub verified_at: i64,
}

/// What a platform user sees on the settings page
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum LinkStatus {
    Linked { link: Link },
    #[serde(rename_all = "camelCase")]
    Pending { code: String, expires_at: i64 },
    Unlinked,
}

/// Persistence for verification codes and links
pub struct LinkStore {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    code_ttl_secs: i64,
    generator: CodeGenerator,
}

impl LinkStore {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            clock,
            code_ttl_secs: DEFAULT_CODE_TTL_SECS,
            generator: Box::new(random_code),
        }
    }

    /// Override the code lifetime
    pub fn with_code_ttl(mut self, secs: i64) -> Self {
        self.code_ttl_secs = secs;
        self
    }

    /// Override the candidate code source
    pub fn with_code_generator(mut self, generator: CodeGenerator) -> Self {
        self.generator = generator;
        self
    }

    pub fn code_ttl_secs(&self) -> i64 {
        self.code_ttl_secs
    }

    /// Issue a fresh code, replacing the user's pending one
    pub fn issue(&self, platform_user_id: i64) -> Result<VerificationCode, StorageError> {
        let now = self.clock.now_secs();
        let expires_at = now + self.code_ttl_secs;

        let (issued, replaced) = self.db.with_conn_mut(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| StorageError::db("Begin issue transaction failed", e))?;

            let replaced = tx
                .execute(
                    "DELETE FROM link_codes WHERE platform_user_id = ?1 AND state = 'pending'",
                    params![platform_user_id],
                )
                .map_err(|e| StorageError::db("Delete pending code failed", e))?;

            let code = self.pick_free_code(&tx, now)?;

            tx.execute(
                "INSERT INTO link_codes (platform_user_id, code, state, created_at, expires_at) \
                 VALUES (?1, ?2, 'pending', ?3, ?4)",
                params![platform_user_id, code, now, expires_at],
            )
            .map_err(|e| StorageError::db("Insert verification code failed", e))?;
            let id = tx.last_insert_rowid();

            tx.commit()
                .map_err(|e| StorageError::db("Commit issue transaction failed", e))?;

            Ok((
                VerificationCode {
                    id,
                    platform_user_id,
                    code,
                    state: CodeState::Pending,
                    created_at: now,
                    expires_at,
                    external_user_id: None,
                    external_username: None,
                    verified_at: None,
                },
                replaced,
            ))
        })?;

        info!(
            platform_user_id,
            expires_at,
            replaced_pending = replaced > 0,
            "Issued verification code"
        );

        Ok(issued)
    }

    /// Find a code no active pending row holds.
    ///
    /// An expired pending row still occupies its value in the unique index,
    /// so it is removed here instead of waiting for the sweep.
    fn pick_free_code(&self, conn: &Connection, now: i64) -> Result<String, StorageError> {
        for _ in 0..MAX_CODE_ATTEMPTS {
            let candidate = (self.generator)();

            let holder: Option<(i64, i64)> = conn
                .query_row(
                    "SELECT id, expires_at FROM link_codes WHERE code = ?1 AND state = 'pending'",
                    params![candidate],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(|e| StorageError::db("Code collision check failed", e))?;

            match holder {
                None => return Ok(candidate),
                Some((id, expires_at)) if expires_at < now => {
                    conn.execute("DELETE FROM link_codes WHERE id = ?1", params![id])
                        .map_err(|e| StorageError::db("Delete expired code failed", e))?;
                    return Ok(candidate);
                }
                Some(_) => debug!("Verification code collision, regenerating"),
            }
        }

        Err(StorageError::CodeSpaceExhausted(MAX_CODE_ATTEMPTS))
    }

    /// Redeem a pending code on behalf of an external user
    pub fn redeem(
        &self,
        code: &str,
        external_user_id: &str,
        external_username: Option<&str>,
    ) -> Result<Link, RedeemError> {
        let code = code.trim();
        let now = self.clock.now_secs();

        let outcome = self.db.with_conn_mut(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| StorageError::db("Begin redeem transaction failed", e))?;

            let outcome = redeem_on(&tx, code, external_user_id, external_username, now);
            if outcome.is_ok() {
                tx.commit()
                    .map_err(|e| StorageError::db("Commit redeem transaction failed", e))?;
            }
            Ok(outcome)
        })?;

        match &outcome {
            Ok(link) => info!(
                platform_user_id = link.platform_user_id,
                external_user_id = %link.external_user_id,
                "Linked accounts"
            ),
            Err(e) if e.is_expected() => debug!(error = %e, "Redemption refused"),
            Err(_) => {}
        }

        outcome
    }

    /// Current link of a platform user
    pub fn find_link_by_platform_user(&self, platform_user_id: i64) -> Result<Option<Link>, StorageError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM link_codes WHERE platform_user_id = ?1 AND state = 'verified' \
                 LIMIT 1",
                CODE_COLUMNS
            );
            query_code(conn, &sql, params![platform_user_id])
                .map(|row| row.and_then(|c| c.as_link()))
        })
    }

    /// Current link of an external user
    pub fn find_link_by_external_user(&self, external_user_id: &str) -> Result<Option<Link>, StorageError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM link_codes WHERE external_user_id = ?1 AND state = 'verified' \
                 LIMIT 1",
                CODE_COLUMNS
            );
            query_code(conn, &sql, params![external_user_id])
                .map(|row| row.and_then(|c| c.as_link()))
        })
    }

    /// Link state for a platform user
    pub fn status(&self, platform_user_id: i64) -> Result<LinkStatus, StorageError> {
        if let Some(link) = self.find_link_by_platform_user(platform_user_id)? {
            return Ok(LinkStatus::Linked { link });
        }

        let now = self.clock.now_secs();
        let pending = self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM link_codes WHERE platform_user_id = ?1 AND state = 'pending'",
                CODE_COLUMNS
            );
            query_code(conn, &sql, params![platform_user_id])
        })?;

        Ok(match pending {
            Some(code) if code.expires_at >= now => LinkStatus::Pending {
                code: code.code,
                expires_at: code.expires_at,
            },
            _ => LinkStatus::Unlinked,
        })
    }

    /// Delete expired pending codes. Returns the number removed.
    pub fn sweep_expired(&self) -> Result<usize, StorageError> {
        let now = self.clock.now_secs();
        let removed = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM link_codes WHERE state = 'pending' AND expires_at < ?1",
                params![now],
            )
            .map_err(|e| StorageError::db("Sweep expired codes failed", e))
        })?;

        if removed > 0 {
            info!(removed, "Swept expired verification codes");
        } else {
            debug!("No expired verification codes");
        }

        Ok(removed)
    }

    /// Remove every code and link row of a platform user (administrative)
    pub fn unlink(&self, platform_user_id: i64) -> Result<usize, StorageError> {
        let removed = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM link_codes WHERE platform_user_id = ?1",
                params![platform_user_id],
            )
            .map_err(|e| StorageError::db("Unlink failed", e))
        })?;

        info!(platform_user_id, removed, "Unlinked platform user");
        Ok(removed)
    }
}

fn redeem_on(
    conn: &Connection,
    code: &str,
    external_user_id: &str,
    external_username: Option<&str>,
    now: i64,
) -> Result<Link, RedeemError> {
    let sql = format!(
        "SELECT {} FROM link_codes WHERE code = ?1 AND state = 'pending'",
        CODE_COLUMNS
    );

    let pending = match query_code(conn, &sql, params![code])? {
        Some(pending) => pending,
        None => {
            return Err(if code_was_verified(conn, code)? {
                RedeemError::AlreadyVerified
            } else {
                RedeemError::NotFound
            });
        }
    };

    if now > pending.expires_at {
        return Err(RedeemError::Expired);
    }

    // Retire whatever either side is currently linked to
    let superseded = conn
        .execute(
            "UPDATE link_codes SET state = 'superseded' \
             WHERE state = 'verified' AND (platform_user_id = ?1 OR external_user_id = ?2)",
            params![pending.platform_user_id, external_user_id],
        )
        .map_err(|e| StorageError::db("Supersede previous links failed", e))?;

    let changed = conn
        .execute(
            "UPDATE link_codes SET state = 'verified', external_user_id = ?2, \
             external_username = ?3, verified_at = ?4 \
             WHERE id = ?1 AND state = 'pending'",
            params![pending.id, external_user_id, external_username, now],
        )
        .map_err(|e| StorageError::db("Verify code failed", e))?;

    if changed == 0 {
        // Lost the compare-and-set: either verified by a concurrent redeem
        // or replaced by a new issue.
        let state: Option<String> = conn
            .query_row(
                "SELECT state FROM link_codes WHERE id = ?1",
                params![pending.id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StorageError::db("Recheck code state failed", e))?;

        return Err(match state.as_deref() {
            Some("verified") | Some("superseded") => RedeemError::AlreadyVerified,
            _ => RedeemError::NotFound,
        });
    }

    if superseded > 0 {
        info!(
            platform_user_id = pending.platform_user_id,
            external_user_id,
            superseded,
            "Superseded previous links"
        );
    }

    Ok(Link {
        platform_user_id: pending.platform_user_id,
        external_user_id: external_user_id.to_string(),
        external_username: external_username.map(str::to_string),
        code: pending.code,
        verified_at: now,
    })
}

fn code_was_verified(conn: &Connection, code: &str) -> Result<bool, StorageError> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM link_codes WHERE code = ?1 AND state IN ('verified', 'superseded'))",
        params![code],
        |row| row.get(0),
    )
    .map_err(|e| StorageError::db("Verified code lookup failed", e))
}

fn query_code(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Option<VerificationCode>, StorageError> {
    conn.query_row(sql, params, VerificationCode::from_row)
        .optional()
        .map_err(|e| StorageError::db("Code query failed", e))
}

/// Uniform 6-digit code without a leading zero
pub fn random_code() -> String {
    rand::thread_rng().gen_range(100_000..=999_999).to_string()
}
