//! Access cache persistence (members, permission labels, links, devices) plus
//! the HTTP fetch utilities shared by directory clients.

mod devices;
mod http;

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use tagsync_core::{MemberId, MemberStatus, NormalizedMember, TagId};
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};

pub use devices::{DeviceAssignment, DeviceRecord, DeviceRegistry};
pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RequestAuth, RetryDisposition, SimpleTokenBucket,
    TokenBucketConfig,
};

pub const CRATE_NAME: &str = "tagsync-storage";

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("refusing to reconcile an empty member batch")]
    EmptyBatch,
    #[error("store transaction failed: {0}")]
    Transaction(#[from] sqlx::Error),
    #[error("applying migrations failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("invalid row in {table}: {reason}")]
    InvalidRow { table: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub members_upserted: usize,
    pub labels_seen: usize,
    pub links_written: u64,
    pub links_pruned: u64,
    pub members_pruned: u64,
    pub conflicts_dropped: usize,
    pub awaiting_onboarding: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SingleReconcileOutcome {
    Upserted { links_added: u64 },
    Removed { existed: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedMember {
    pub external_id: MemberId,
    pub tag_id: TagId,
    pub membership_level: i64,
    pub is_admin: bool,
    pub labels: Vec<String>,
}

/// Full table contents, ordered, for comparing store states.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheSnapshot {
    pub members: Vec<(MemberId, Option<i64>, i64, bool)>,
    pub labels: Vec<String>,
    pub links: Vec<(i64, String)>,
}

#[derive(Debug, Clone)]
pub struct ReconciliationStore {
    pool: SqlitePool,
}

impl ReconciliationStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Single-connection in-memory database with migrations applied.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn devices(&self) -> DeviceRegistry {
        DeviceRegistry::new(self.pool.clone())
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Authoritative pass: make the cache match `members` exactly.
    ///
    /// Upserts run before any pruning so a member that is both re-added and
    /// pruned in the same batch survives. Nothing is written if the batch has
    /// no member with a nonzero tag.
    pub async fn full_reconcile(
        &self,
        members: &[NormalizedMember],
    ) -> Result<ReconcileReport, StoreError> {
        let plan = ReconcilePlan::build(members);
        if plan.members.is_empty() {
            return Err(StoreError::EmptyBatch);
        }

        let span = info_span!("full_reconcile", input = members.len(), retained = plan.members.len());
        async move {
            let mut report = ReconcileReport {
                conflicts_dropped: plan.conflicts_dropped,
                awaiting_onboarding: plan.awaiting_onboarding,
                ..ReconcileReport::default()
            };

            let mut tx = self.pool.begin().await?;
            create_keep_tables(&mut tx).await?;

            for member in &plan.members {
                upsert_member(&mut tx, member).await?;
                sqlx::query("INSERT INTO temp.reconcile_keep_members (external_id) VALUES (?1)")
                    .bind(member.external_id)
                    .execute(&mut *tx)
                    .await?;
                report.members_upserted += 1;
            }

            let distinct_labels: BTreeSet<&str> = plan
                .members
                .iter()
                .flat_map(|m| m.labels.iter().map(String::as_str))
                .collect();
            for label in &distinct_labels {
                upsert_label(&mut tx, label).await?;
            }
            report.labels_seen = distinct_labels.len();

            for member in &plan.members {
                report.links_written += insert_links(&mut tx, member.tag_id, &member.labels).await?;
                for label in &member.labels {
                    sqlx::query("INSERT OR IGNORE INTO temp.reconcile_keep_links (tag_id, label) VALUES (?1, ?2)")
                        .bind(i64::from(member.tag_id))
                        .bind(label)
                        .execute(&mut *tx)
                        .await?;
                }
            }

            // Keep sets live in temp tables so batch size is not bounded by SQLite's bind limit.
            report.links_pruned = sqlx::query(
                "DELETE FROM member_permission_links
                 WHERE NOT EXISTS (
                     SELECT 1 FROM temp.reconcile_keep_links k
                     WHERE k.tag_id = member_permission_links.tag_id
                       AND k.label = member_permission_links.label
                 )",
            )
            .execute(&mut *tx)
            .await?
            .rows_affected();

            report.members_pruned = sqlx::query(
                "DELETE FROM members
                 WHERE external_id NOT IN (SELECT external_id FROM temp.reconcile_keep_members)",
            )
            .execute(&mut *tx)
            .await?
            .rows_affected();

            drop_keep_tables(&mut tx).await?;
            tx.commit().await?;
            info!(
                upserted = report.members_upserted,
                pruned = report.members_pruned,
                links_written = report.links_written,
                links_pruned = report.links_pruned,
                "full reconcile committed"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Incremental pass for one member. Never prunes labels on the active path.
    pub async fn single_member_reconcile(
        &self,
        member: &NormalizedMember,
        status: MemberStatus,
    ) -> Result<SingleReconcileOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let outcome = if status == MemberStatus::Lapsed || !member.has_tag() {
            sqlx::query(
                "DELETE FROM member_permission_links
                 WHERE tag_id IN (SELECT tag_id FROM members WHERE external_id = ?1)",
            )
            .bind(member.external_id)
            .execute(&mut *tx)
            .await?;
            let removed = sqlx::query("DELETE FROM members WHERE external_id = ?1")
                .bind(member.external_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            SingleReconcileOutcome::Removed { existed: removed > 0 }
        } else {
            upsert_member(&mut tx, member).await?;
            let labels = normalized_labels(&member.labels);
            for label in &labels {
                upsert_label(&mut tx, label).await?;
            }
            let links_added = insert_links(&mut tx, member.tag_id, &labels).await?;
            SingleReconcileOutcome::Upserted { links_added }
        };

        tx.commit().await?;
        debug!(member_id = member.external_id, ?status, ?outcome, "single member reconciled");
        Ok(outcome)
    }

    pub async fn all_active_tag_ids(&self) -> Result<Vec<TagId>, StoreError> {
        let rows: Vec<i64> = sqlx::query_scalar(
            "SELECT tag_id FROM members WHERE tag_id IS NOT NULL AND tag_id > 0 ORDER BY tag_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(tag_from_row).collect()
    }

    pub async fn tag_ids_for_label(&self, label: &str) -> Result<Vec<TagId>, StoreError> {
        let rows: Vec<i64> = sqlx::query_scalar(
            "SELECT l.tag_id
             FROM member_permission_links l
             JOIN members m ON m.tag_id = l.tag_id
             WHERE l.label = ?1 AND m.tag_id > 0
             ORDER BY l.tag_id",
        )
        .bind(label)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(tag_from_row).collect()
    }

    pub async fn tag_exists(&self, tag_id: TagId) -> Result<bool, StoreError> {
        if tag_id == 0 {
            return Ok(false);
        }
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM members WHERE tag_id = ?1")
            .bind(i64::from(tag_id))
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    pub async fn cached_member(&self, tag_id: TagId) -> Result<Option<CachedMember>, StoreError> {
        if tag_id == 0 {
            return Ok(None);
        }
        let row: Option<(i64, i64, bool)> = sqlx::query_as(
            "SELECT external_id, membership_level, is_admin FROM members WHERE tag_id = ?1",
        )
        .bind(i64::from(tag_id))
        .fetch_optional(&self.pool)
        .await?;
        let Some((external_id, membership_level, is_admin)) = row else {
            return Ok(None);
        };
        let labels: Vec<String> = sqlx::query_scalar(
            "SELECT label FROM member_permission_links WHERE tag_id = ?1 ORDER BY label",
        )
        .bind(i64::from(tag_id))
        .fetch_all(&self.pool)
        .await?;
        Ok(Some(CachedMember {
            external_id,
            tag_id,
            membership_level,
            is_admin,
            labels,
        }))
    }

    pub async fn permission_labels(&self) -> Result<Vec<String>, StoreError> {
        let names: Vec<String> = sqlx::query_scalar("SELECT name FROM permission_labels ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(names)
    }

    pub async fn snapshot(&self) -> Result<CacheSnapshot, StoreError> {
        let members: Vec<(MemberId, Option<i64>, i64, bool)> = sqlx::query_as(
            "SELECT external_id, tag_id, membership_level, is_admin FROM members ORDER BY external_id",
        )
        .fetch_all(&self.pool)
        .await?;
        let labels = self.permission_labels().await?;
        let links: Vec<(i64, String)> = sqlx::query_as(
            "SELECT tag_id, label FROM member_permission_links ORDER BY tag_id, label",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(CacheSnapshot {
            members,
            labels,
            links,
        })
    }
}

/// Input batch after collapsing duplicates. Later entries win, both for a
/// repeated member id and for two members claiming the same tag.
struct ReconcilePlan {
    members: Vec<NormalizedMember>,
    conflicts_dropped: usize,
    awaiting_onboarding: usize,
}

impl ReconcilePlan {
    fn build(input: &[NormalizedMember]) -> Self {
        let last_by_id: HashMap<MemberId, usize> = input
            .iter()
            .enumerate()
            .map(|(idx, m)| (m.external_id, idx))
            .collect();

        let mut awaiting_onboarding = 0usize;
        let mut candidates = Vec::new();
        for (idx, member) in input.iter().enumerate() {
            if last_by_id.get(&member.external_id) != Some(&idx) {
                continue;
            }
            if member.has_tag() {
                candidates.push(member);
            } else {
                awaiting_onboarding += 1;
            }
        }

        let tag_owner: HashMap<TagId, MemberId> = candidates
            .iter()
            .map(|m| (m.tag_id, m.external_id))
            .collect();

        let mut members = Vec::with_capacity(tag_owner.len());
        let mut conflicts_dropped = 0usize;
        for member in candidates {
            if tag_owner.get(&member.tag_id) == Some(&member.external_id) {
                let mut kept = member.clone();
                kept.labels = normalized_labels(&member.labels);
                members.push(kept);
            } else {
                debug!(
                    member_id = member.external_id,
                    tag_id = member.tag_id,
                    "tag claimed by a later member in the batch; dropping"
                );
                conflicts_dropped += 1;
            }
        }

        Self {
            members,
            conflicts_dropped,
            awaiting_onboarding,
        }
    }
}

fn normalized_labels(labels: &[String]) -> Vec<String> {
    labels
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn tag_from_row(raw: i64) -> Result<TagId, StoreError> {
    TagId::try_from(raw).map_err(|_| StoreError::InvalidRow {
        table: "members",
        reason: format!("tag_id {raw} does not fit a 32-bit tag"),
    })
}

async fn upsert_member(
    tx: &mut Transaction<'_, Sqlite>,
    member: &NormalizedMember,
) -> Result<(), StoreError> {
    // Last writer wins on the tag: evict whoever else holds it.
    sqlx::query("DELETE FROM members WHERE tag_id = ?1 AND external_id <> ?2")
        .bind(i64::from(member.tag_id))
        .bind(member.external_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query(
        "INSERT INTO members (external_id, tag_id, membership_level, is_admin)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (external_id) DO UPDATE SET
             tag_id = excluded.tag_id,
             membership_level = excluded.membership_level,
             is_admin = excluded.is_admin",
    )
    .bind(member.external_id)
    .bind(i64::from(member.tag_id))
    .bind(member.membership_level)
    .bind(member.is_admin)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_label(tx: &mut Transaction<'_, Sqlite>, label: &str) -> Result<(), StoreError> {
    sqlx::query("INSERT OR IGNORE INTO permission_labels (name) VALUES (?1)")
        .bind(label)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn insert_links(
    tx: &mut Transaction<'_, Sqlite>,
    tag_id: TagId,
    labels: &[String],
) -> Result<u64, StoreError> {
    let mut written = 0;
    for label in labels {
        written += sqlx::query(
            "INSERT OR IGNORE INTO member_permission_links (tag_id, label) VALUES (?1, ?2)",
        )
        .bind(i64::from(tag_id))
        .bind(label)
        .execute(&mut **tx)
        .await?
        .rows_affected();
    }
    Ok(written)
}

async fn create_keep_tables(tx: &mut Transaction<'_, Sqlite>) -> Result<(), StoreError> {
    sqlx::query("CREATE TEMP TABLE IF NOT EXISTS reconcile_keep_members (external_id INTEGER PRIMARY KEY)")
        .execute(&mut **tx)
        .await?;
    sqlx::query(
        "CREATE TEMP TABLE IF NOT EXISTS reconcile_keep_links (
             tag_id INTEGER NOT NULL,
             label TEXT NOT NULL,
             PRIMARY KEY (tag_id, label)
         )",
    )
    .execute(&mut **tx)
    .await?;
    sqlx::query("DELETE FROM temp.reconcile_keep_members").execute(&mut **tx).await?;
    sqlx::query("DELETE FROM temp.reconcile_keep_links").execute(&mut **tx).await?;
    Ok(())
}

async fn drop_keep_tables(tx: &mut Transaction<'_, Sqlite>) -> Result<(), StoreError> {
    sqlx::query("DROP TABLE temp.reconcile_keep_members").execute(&mut **tx).await?;
    sqlx::query("DROP TABLE temp.reconcile_keep_links").execute(&mut **tx).await?;
    Ok(())
}
