use std::sync::Arc;

use serde::Serialize;
use tagsync_adapters::{DirectoryClient, FieldExtractor};
use tagsync_core::{DirectoryEvent, MemberId, MemberStatus, NormalizedMember, ValidationError};
use tagsync_storage::{ReconciliationStore, SingleReconcileOutcome};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EventOutcome {
    Ignored { reason: &'static str },
    Reconciled(SingleReconcileOutcome),
}

/// Applies one directory event to the cache via a single-member reconcile.
///
/// Active paths are additive; only full passes prune labels. A refetched
/// record must carry an `Active` status to be granted a credential.
pub struct EventProcessor {
    directory: Arc<dyn DirectoryClient>,
    extractor: FieldExtractor,
    store: ReconciliationStore,
}

impl EventProcessor {
    pub fn new(directory: Arc<dyn DirectoryClient>, extractor: FieldExtractor, store: ReconciliationStore) -> Self {
        Self {
            directory,
            extractor,
            store,
        }
    }

    pub async fn process(&self, event: &DirectoryEvent) -> Result<EventOutcome, SyncError> {
        let member_id = event.member_id();
        if member_id <= 0 {
            return Err(ValidationError::InvalidMemberId(member_id.to_string()).into());
        }

        let span = info_span!("directory_event", member_id, kind = event.kind());
        async move {
            match event {
                DirectoryEvent::ProfileChanged {
                    profile_changed: false,
                    ..
                } => Ok(EventOutcome::Ignored {
                    reason: "profile fields unchanged",
                }),
                DirectoryEvent::ProfileChanged { .. } => self.refetch_and_reconcile(member_id).await,
                DirectoryEvent::MembershipStatusChanged { status, .. } => match status.as_member_status() {
                    Some(MemberStatus::Lapsed) => self.remove(member_id).await,
                    Some(MemberStatus::Active) => self.refetch_and_reconcile(member_id).await,
                    None => {
                        debug!(%status, "membership status needs no cache change");
                        Ok(EventOutcome::Ignored {
                            reason: "membership status is not actionable",
                        })
                    }
                },
            }
        }
        .instrument(span)
        .await
    }

    /// Process on a background task; failures are logged and the event dropped.
    pub fn spawn(self: &Arc<Self>, event: DirectoryEvent) -> JoinHandle<()> {
        let processor = Arc::clone(self);
        tokio::spawn(async move {
            match processor.process(&event).await {
                Ok(outcome) => info!(member_id = event.member_id(), ?outcome, "directory event applied"),
                Err(err) => warn!(member_id = event.member_id(), error = %err, "directory event dropped"),
            }
        })
    }

    async fn refetch_and_reconcile(&self, member_id: MemberId) -> Result<EventOutcome, SyncError> {
        let Some(record) = self.directory.get_member(member_id).await? else {
            info!("member no longer in directory; removing from cache");
            return self.remove(member_id).await;
        };
        if !record.is_active() {
            info!(
                status = record.status.as_deref().unwrap_or("missing"),
                "membership not active; removing from cache"
            );
            return self.remove(member_id).await;
        }

        let member = self.extractor.extract(&record)?;
        let outcome = self
            .store
            .single_member_reconcile(&member, MemberStatus::Active)
            .await?;
        Ok(EventOutcome::Reconciled(outcome))
    }

    async fn remove(&self, member_id: MemberId) -> Result<EventOutcome, SyncError> {
        let outcome = self
            .store
            .single_member_reconcile(&NormalizedMember::unassigned(member_id), MemberStatus::Lapsed)
            .await?;
        Ok(EventOutcome::Reconciled(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tagsync_adapters::SnapshotDirectory;
    use tagsync_core::{MemberRecord, MembershipStatus};

    fn record(id: i64, status: &str, tag: &str, labels: &[&str]) -> MemberRecord {
        let labels: Vec<_> = labels.iter().map(|l| json!({"Label": l})).collect();
        serde_json::from_value(json!({
            "Id": id,
            "Status": status,
            "FieldValues": [
                {"FieldName": "Tag ID", "Value": tag},
                {"FieldName": "Safety Training", "Value": labels}
            ]
        }))
        .unwrap()
    }

    async fn setup(records: Vec<MemberRecord>) -> (Arc<SnapshotDirectory>, ReconciliationStore, EventProcessor) {
        let directory = Arc::new(SnapshotDirectory::new(records));
        let store = ReconciliationStore::in_memory().await.unwrap();
        let processor = EventProcessor::new(directory.clone(), FieldExtractor::default(), store.clone());
        (directory, store, processor)
    }

    fn profile_changed(member_id: MemberId) -> DirectoryEvent {
        DirectoryEvent::ProfileChanged {
            member_id,
            profile_changed: true,
        }
    }

    fn membership(member_id: MemberId, status: MembershipStatus) -> DirectoryEvent {
        DirectoryEvent::MembershipStatusChanged { member_id, status }
    }

    #[tokio::test]
    async fn profile_change_refetches_and_adds_labels() {
        let (directory, store, processor) = setup(vec![record(42, "Active", "4242", &["CNC"])]).await;

        let outcome = processor.process(&profile_changed(42)).await.unwrap();
        assert_eq!(outcome, EventOutcome::Reconciled(SingleReconcileOutcome::Upserted { links_added: 1 }));
        assert_eq!(store.tag_ids_for_label("CNC").await.unwrap(), vec![4242]);

        directory.upsert(record(42, "Active", "4242", &["Laser"])).await;
        processor.process(&profile_changed(42)).await.unwrap();
        assert_eq!(store.tag_ids_for_label("CNC").await.unwrap(), vec![4242]);
        assert_eq!(store.tag_ids_for_label("Laser").await.unwrap(), vec![4242]);
    }

    #[tokio::test]
    async fn duplicate_events_are_idempotent() {
        let (_, store, processor) = setup(vec![record(42, "Active", "4242", &["CNC", "Laser"])]).await;
        processor.process(&profile_changed(42)).await.unwrap();
        let once = store.snapshot().await.unwrap();
        processor.process(&profile_changed(42)).await.unwrap();
        processor.process(&membership(42, MembershipStatus::Active)).await.unwrap();
        assert_eq!(store.snapshot().await.unwrap(), once);
    }

    #[tokio::test]
    async fn lapsed_event_removes_without_refetch() {
        let (directory, store, processor) = setup(vec![record(42, "Active", "4242", &["CNC"])]).await;
        processor.process(&profile_changed(42)).await.unwrap();

        directory.set_unavailable(true);
        let outcome = processor
            .process(&membership(42, MembershipStatus::Lapsed))
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::Reconciled(SingleReconcileOutcome::Removed { existed: true }));
        assert!(store.all_active_tag_ids().await.unwrap().is_empty());
        assert!(store.tag_ids_for_label("CNC").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn out_of_order_events_converge_on_removal() {
        let events = [profile_changed(42), membership(42, MembershipStatus::Lapsed)];

        let (_, forward_store, forward) = setup(vec![record(42, "Lapsed", "4242", &["CNC"])]).await;
        forward_store
            .full_reconcile(&[NormalizedMember::new(42, 4242).with_labels(["CNC"])])
            .await
            .unwrap();
        for event in &events {
            forward.process(event).await.unwrap();
        }

        let (_, reverse_store, reverse) = setup(vec![record(42, "Lapsed", "4242", &["CNC"])]).await;
        reverse_store
            .full_reconcile(&[NormalizedMember::new(42, 4242).with_labels(["CNC"])])
            .await
            .unwrap();
        for event in events.iter().rev() {
            reverse.process(event).await.unwrap();
        }

        assert_eq!(forward_store.snapshot().await.unwrap().members, Vec::new());
        assert_eq!(reverse_store.snapshot().await.unwrap().members, Vec::new());
        assert!(reverse_store.all_active_tag_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_member_and_cleared_tag_remove_from_cache() {
        let (directory, store, processor) = setup(vec![record(7, "Active", "7007", &[])]).await;
        processor.process(&membership(7, MembershipStatus::Active)).await.unwrap();
        assert_eq!(store.all_active_tag_ids().await.unwrap(), vec![7007]);

        directory.upsert(record(7, "Active", "", &[])).await;
        let outcome = processor.process(&profile_changed(7)).await.unwrap();
        assert_eq!(outcome, EventOutcome::Reconciled(SingleReconcileOutcome::Removed { existed: true }));

        directory.remove(7).await;
        let outcome = processor.process(&profile_changed(7)).await.unwrap();
        assert_eq!(outcome, EventOutcome::Reconciled(SingleReconcileOutcome::Removed { existed: false }));
    }

    #[tokio::test]
    async fn non_actionable_events_touch_nothing() {
        let (_, store, processor) = setup(vec![record(5, "Active", "5005", &[])]).await;
        let unchanged = DirectoryEvent::ProfileChanged {
            member_id: 5,
            profile_changed: false,
        };
        assert!(matches!(processor.process(&unchanged).await.unwrap(), EventOutcome::Ignored { .. }));
        assert!(matches!(
            processor
                .process(&membership(5, MembershipStatus::PendingRenewal))
                .await
                .unwrap(),
            EventOutcome::Ignored { .. }
        ));
        assert!(store.all_active_tag_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_member_id_is_rejected_before_the_store() {
        let (_, _, processor) = setup(Vec::new()).await;
        assert!(matches!(
            processor.process(&profile_changed(0)).await,
            Err(SyncError::Validation(ValidationError::InvalidMemberId(_)))
        ));
    }

    #[tokio::test]
    async fn malformed_refetched_record_is_dropped() {
        let (_, store, processor) = setup(vec![record(8, "Active", "x1", &[])]).await;
        assert!(matches!(
            processor.process(&profile_changed(8)).await,
            Err(SyncError::Extraction(_))
        ));
        assert!(store.all_active_tag_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pending_member_is_never_granted_access() {
        let (directory, store, processor) = setup(vec![record(77, "PendingNew", "7777", &["CNC"])]).await;

        let outcome = processor.process(&profile_changed(77)).await.unwrap();
        assert_eq!(outcome, EventOutcome::Reconciled(SingleReconcileOutcome::Removed { existed: false }));
        assert!(store.all_active_tag_ids().await.unwrap().is_empty());

        directory.upsert(record(77, "Active", "7777", &["CNC"])).await;
        processor.process(&membership(77, MembershipStatus::Active)).await.unwrap();
        assert_eq!(store.all_active_tag_ids().await.unwrap(), vec![7777]);

        directory.upsert(record(77, "PendingRenewal", "7777", &["CNC"])).await;
        processor.process(&profile_changed(77)).await.unwrap();
        assert!(store.all_active_tag_ids().await.unwrap().is_empty());
        assert!(store.tag_ids_for_label("CNC").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn spawned_processing_completes() {
        let (_, store, processor) = setup(vec![record(3, "Active", "3003", &["Lathe"])]).await;
        let processor = Arc::new(processor);
        processor.spawn(profile_changed(3)).await.unwrap();
        assert_eq!(store.tag_ids_for_label("Lathe").await.unwrap(), vec![3003]);
    }
}
