//! Integration tests for optimistic mutations against the in-memory store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{detach, fields, rendered_ids, Harness};
use grantsync_client::{
    Config, DeleteTarget, FileStorage, Notice, RecordStoreService, TombstoneStorage,
};
use grantsync_engine::{
    Collection, DeniedPolicy, Fields, MutationKind, MutationState, Namespace, RawSearchItem,
    RemoteError, Residency, SearchSource, PROVISIONAL_OFFSET,
};
use serde_json::json;

#[cfg(test)]
mod delete_tests {
    use super::*;

    #[tokio::test]
    async fn test_partial_failure_restores_only_failed_target() {
        let mut h = Harness::new();
        h.seed(Collection::Proposals, &[1, 2, 3]);
        h.store.fail_target(
            Collection::Proposals,
            2,
            RemoteError::network("upstream timed out"),
        );
        let session = h.registry.session(Collection::Proposals);
        session.refresh().await.unwrap();
        let original = session.cache().read().get(2).cloned().unwrap();

        let mut report = session.delete(&[1, 2, 3]).await.unwrap();
        detach(&mut report);

        assert_eq!(report.state, MutationState::RolledBackPartial);
        assert_eq!(report.outcome.succeeded, vec![1, 3]);
        assert_eq!(report.outcome.failed, vec![2]);

        assert_eq!(rendered_ids(&session), vec![2]);
        assert_eq!(session.cache().read().get(2), Some(&original));
        assert!(session.tombstones().contains(1));
        assert!(session.tombstones().contains(3));
        assert!(!session.tombstones().contains(2));

        assert!(!h.store.contains(Collection::Proposals, 1));
        assert!(h.store.contains(Collection::Proposals, 2));

        let notices = h.drain_notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].message(), "2 succeeded, 1 failed");
    }

    #[tokio::test]
    async fn test_total_failure_restores_prior_view() {
        let mut h = Harness::new();
        h.seed(Collection::Reports, &[1, 2]);
        for id in [1, 2] {
            h.store.fail_target(
                Collection::Reports,
                id,
                RemoteError::network("upstream timed out"),
            );
        }
        let session = h.registry.session(Collection::Reports);
        session.refresh().await.unwrap();
        let before = session.rendered();

        let mut report = session.delete(&[1, 2]).await.unwrap();
        detach(&mut report);

        assert_eq!(report.state, MutationState::RolledBackFull);
        assert_eq!(session.rendered(), before);
        assert!(session.tombstones().is_empty());

        let notices = h.drain_notices();
        assert_eq!(
            notices,
            vec![Notice::Failure {
                collection: Collection::Reports,
                kind: MutationKind::Delete,
                failed: 2,
                reason: "upstream timed out".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_failed_retry_keeps_earlier_tombstone() {
        let h = Harness::new();
        h.seed(Collection::Proposals, &[1, 2]);
        let session = h.registry.session(Collection::Proposals);
        session.refresh().await.unwrap();

        let mut first = session.delete(&[1]).await.unwrap();
        detach(&mut first);
        assert_eq!(first.state, MutationState::Confirmed);

        h.store
            .fail_target(Collection::Proposals, 1, RemoteError::network("offline"));
        let mut retry = session.delete(&[1]).await.unwrap();
        detach(&mut retry);

        assert_eq!(retry.state, MutationState::RolledBackFull);
        assert!(session.tombstones().contains(1));
        assert_eq!(rendered_ids(&session), vec![2]);
    }

    #[tokio::test]
    async fn test_delete_of_missing_row_counts_as_success() {
        let mut h = Harness::new();
        h.seed(Collection::Proposals, &[1, 2]);
        let session = h.registry.session(Collection::Proposals);
        session.refresh().await.unwrap();

        // Another client removed the row first
        h.store
            .delete(Collection::Proposals, DeleteTarget::Row(1))
            .await
            .into_result()
            .unwrap();

        let mut report = session.delete(&[1]).await.unwrap();
        detach(&mut report);

        assert_eq!(report.state, MutationState::Confirmed);
        assert_eq!(report.outcome.succeeded, vec![1]);
        assert_eq!(rendered_ids(&session), vec![2]);
        assert!(session.tombstones().contains(1));

        let notices = h.drain_notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].message(), "Delete succeeded");
    }

    #[tokio::test]
    async fn test_denied_delete_stays_removed_by_default() {
        let mut h = Harness::new();
        h.seed(Collection::Proposals, &[1, 2]);
        h.store
            .fail_target(Collection::Proposals, 2, RemoteError::denied("not the owner"));
        let session = h.registry.session(Collection::Proposals);
        session.refresh().await.unwrap();

        let mut report = session.delete(&[1, 2]).await.unwrap();
        detach(&mut report);

        assert_eq!(report.state, MutationState::Confirmed);
        assert_eq!(report.outcome.denied, vec![2]);
        assert!(session.rendered().is_empty());
        assert!(session.tombstones().contains(2));

        let notices = h.drain_notices();
        assert_eq!(
            notices,
            vec![
                Notice::Success {
                    collection: Collection::Proposals,
                    kind: MutationKind::Delete,
                    count: 1,
                },
                Notice::PermissionDenied {
                    collection: Collection::Proposals,
                    ids: vec![2],
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_denied_delete_rolls_back_under_rollback_policy() {
        let mut h = Harness::with_config(Config {
            denied_policy: DeniedPolicy::Rollback,
            ..Config::default()
        });
        h.seed(Collection::Proposals, &[1, 2]);
        h.store
            .fail_target(Collection::Proposals, 2, RemoteError::denied("not the owner"));
        let session = h.registry.session(Collection::Proposals);
        session.refresh().await.unwrap();

        let mut report = session.delete(&[1, 2]).await.unwrap();
        detach(&mut report);

        assert_eq!(report.state, MutationState::RolledBackPartial);
        assert_eq!(rendered_ids(&session), vec![2]);
        assert!(!session.tombstones().contains(2));

        let notices = h.drain_notices();
        assert_eq!(notices.len(), 2);
        assert_eq!(notices[0].message(), "1 succeeded, 1 failed");
        assert!(matches!(notices[1], Notice::PermissionDenied { ref ids, .. } if ids == &vec![2]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_create_does_not_restore_concurrently_deleted_row() {
        let h = Harness::new();
        h.seed(Collection::Proposals, &[1, 2]);
        let session = h.registry.session(Collection::Proposals);
        session.refresh().await.unwrap();

        h.store.set_latency(Duration::from_millis(20));
        h.store
            .fail_creates(Collection::Proposals, RemoteError::network("offline"));
        let (created, deleted) =
            tokio::join!(session.create(fields("Draft")), session.delete(&[1]));
        let (mut created, mut deleted) = (created.unwrap(), deleted.unwrap());
        detach(&mut created);
        detach(&mut deleted);

        assert_eq!(created.state, MutationState::RolledBackFull);
        assert_eq!(deleted.state, MutationState::Confirmed);
        assert!(!session.cache().read().contains(1));
        assert_eq!(rendered_ids(&session), vec![2]);

        // Two fetches without the row clear its tombstone
        for _ in 0..2 {
            session.refresh().await.unwrap();
            assert_eq!(rendered_ids(&session), vec![2]);
        }
        assert!(session.tombstones().is_empty());
        assert!(!session.cache().read().contains(1));

        session.refresh().await.unwrap();
        assert_eq!(rendered_ids(&session), vec![2]);
    }

    #[tokio::test]
    async fn test_tombstones_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FileStorage::new(dir.path()));
        let h = Harness::with(
            Config {
                tombstone_dir: dir.path().to_path_buf(),
                ..Config::default()
            },
            storage.clone(),
        );
        h.seed(Collection::Proposals, &[1, 2]);
        h.store.linger_deletes(10);

        let session = h.registry.session(Collection::Proposals);
        session.refresh().await.unwrap();
        let mut report = session.delete(&[1]).await.unwrap();
        detach(&mut report);

        let key = Collection::Proposals.tombstone_key();
        assert!(storage.path_for(&key).exists());
        assert_eq!(storage.load(&key).unwrap().as_deref(), Some("[1]"));

        // The lagging list still returns the deleted row after the restart
        let reopened = h.reopen();
        let session = reopened.session(Collection::Proposals);
        assert!(session.tombstones().contains(1));

        let merged = session.refresh().await.unwrap();
        assert_eq!(merged.suppressed, vec![1]);
        assert_eq!(rendered_ids(&session), vec![2]);
    }
}

#[cfg(test)]
mod write_tests {
    use super::*;

    #[tokio::test]
    async fn test_create_replaces_provisional_record() {
        let mut h = Harness::new();
        h.seed(Collection::Proposals, &[1, 2, 3]);
        let session = h.registry.session(Collection::Proposals);
        session.refresh().await.unwrap();

        let mut report = session.create(fields("Community garden")).await.unwrap();
        detach(&mut report);

        assert_eq!(report.state, MutationState::Confirmed);
        let created = report.record.unwrap();
        assert_eq!(created.id, 4);

        assert_eq!(rendered_ids(&session), vec![1, 2, 3, 4]);
        assert!(session.rendered().iter().all(|r| r.id < PROVISIONAL_OFFSET));
        assert_eq!(
            session.cache().read().get(4).unwrap().residency,
            Residency::Durable
        );
        assert_eq!(h.drain_notices()[0].message(), "Create succeeded");
    }

    #[tokio::test]
    async fn test_failed_create_leaves_no_trace() {
        let mut h = Harness::new();
        h.seed(Collection::Reports, &[1]);
        h.store
            .fail_creates(Collection::Reports, RemoteError::rejected("quota exceeded"));
        let session = h.registry.session(Collection::Reports);
        session.refresh().await.unwrap();

        let mut report = session.create(fields("Q2 report")).await.unwrap();
        detach(&mut report);

        assert_eq!(report.state, MutationState::RolledBackFull);
        assert!(report.record.is_none());
        assert_eq!(rendered_ids(&session), vec![1]);
        assert_eq!(
            h.drain_notices()[0].message(),
            "Create failed: quota exceeded"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleting_draft_in_flight_removes_server_row() {
        let h = Harness::new();
        h.store.set_latency(Duration::from_millis(20));
        let session = h.registry.session(Collection::Proposals);

        let (created, deleted) = tokio::join!(session.create(fields("Draft")), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            session.delete(&[PROVISIONAL_OFFSET]).await
        });
        let (mut created, mut deleted) = (created.unwrap(), deleted.unwrap());
        detach(&mut created);
        detach(&mut deleted);

        assert_eq!(deleted.state, MutationState::Confirmed);
        assert_eq!(created.state, MutationState::Confirmed);
        assert_eq!(created.record.unwrap().id, 1);

        // Only the create and the follow-up row delete reached the store
        assert_eq!(h.store.write_calls(), 2);
        assert_eq!(h.store.row_count(Collection::Proposals), 0);
        assert!(session.rendered().is_empty());
        assert!(session.tombstones().contains(1));
        assert!(!session.tombstones().contains(PROVISIONAL_OFFSET));

        session.refresh().await.unwrap();
        assert!(session.rendered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_draft_row_returns_when_cleanup_delete_fails() {
        let mut h = Harness::new();
        h.store.set_latency(Duration::from_millis(20));
        h.store
            .fail_target(Collection::Proposals, 1, RemoteError::network("offline"));
        let session = h.registry.session(Collection::Proposals);

        let (created, deleted) = tokio::join!(session.create(fields("Draft")), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            session.delete(&[PROVISIONAL_OFFSET]).await
        });
        let (mut created, mut deleted) = (created.unwrap(), deleted.unwrap());
        detach(&mut created);
        detach(&mut deleted);

        assert!(h.store.contains(Collection::Proposals, 1));
        assert_eq!(rendered_ids(&session), vec![1]);
        assert!(!session.tombstones().contains(1));
        assert_eq!(
            h.drain_notices().last().map(Notice::message),
            Some("Delete failed: offline".to_string())
        );
    }

    #[tokio::test]
    async fn test_update_reaches_store() {
        let h = Harness::new();
        h.seed(Collection::Proposals, &[1]);
        let session = h.registry.session(Collection::Proposals);
        session.refresh().await.unwrap();

        let mut report = session.update(1, fields("Renamed")).await.unwrap();
        detach(&mut report);

        assert_eq!(report.state, MutationState::Confirmed);
        assert_eq!(session.rendered()[0].fields["title"], "Renamed");
        let row = h.store.row(Collection::Proposals, 1).unwrap();
        assert_eq!(row.fields.unwrap()["title"], "Renamed");
    }

    #[tokio::test]
    async fn test_denied_update_rolls_back() {
        let mut h = Harness::new();
        h.seed(Collection::Proposals, &[1]);
        h.store
            .fail_target(Collection::Proposals, 1, RemoteError::denied("read only"));
        let session = h.registry.session(Collection::Proposals);
        session.refresh().await.unwrap();

        let mut report = session.update(1, fields("Renamed")).await.unwrap();
        detach(&mut report);

        assert_eq!(report.state, MutationState::RolledBackFull);
        assert_eq!(session.rendered()[0].fields["title"], "record 1");
        assert_eq!(
            h.drain_notices(),
            vec![Notice::PermissionDenied {
                collection: Collection::Proposals,
                ids: vec![1],
            }]
        );
    }
}

#[cfg(test)]
mod saved_grant_tests {
    use super::*;

    fn rural_batch() -> Vec<RawSearchItem> {
        vec![RawSearchItem::new(
            SearchSource::GrantSearch,
            fields("Rural broadband fund"),
        )
        .with_rank(5)]
    }

    #[tokio::test]
    async fn test_saved_search_result_unsaves_and_stays_gone() {
        let h = Harness::new();
        h.search
            .insert(SearchSource::GrantSearch, "rural", rural_batch());
        let saved = h.registry.session(Collection::SavedGrants);

        let results = saved.search(SearchSource::GrantSearch, "rural").await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, 10_005);
        assert_eq!(results[0].residency, Residency::Ephemeral);

        let mut report = saved.save(&results[0]).await.unwrap();
        detach(&mut report);
        assert_eq!(report.state, MutationState::Confirmed);

        let row = h.store.row(Collection::SavedGrants, 10_005).unwrap();
        assert_eq!(row.snapshot, Some(json!({ "title": "Rural broadband fund" })));
        let cached = saved.cache().read().get(10_005).cloned().unwrap();
        assert_eq!(cached.residency, Residency::Durable);

        // Read back through a fresh session's list
        let reader = h.reopen();
        let listed = reader.session(Collection::SavedGrants);
        listed.refresh().await.unwrap();
        let rendered = listed.rendered();
        assert_eq!(rendered.len(), 1);
        assert_eq!(rendered[0].id, 10_005);
        assert_eq!(rendered[0].namespace, Namespace::Virtual);
        assert_eq!(rendered[0].fields, fields("Rural broadband fund"));
        assert_eq!(rendered[0].residency, Residency::Durable);

        let mut report = saved.unsave(&[10_005]).await.unwrap();
        detach(&mut report);

        // A row-addressed delete of a virtual id is refused, so success means
        // the snapshot table was targeted.
        assert_eq!(report.state, MutationState::Confirmed);
        assert!(!h.store.contains(Collection::SavedGrants, 10_005));
        assert!(saved.rendered().is_empty());

        let reopened = h.reopen();
        let saved = reopened.session(Collection::SavedGrants);
        saved.refresh().await.unwrap();
        assert!(saved.rendered().is_empty());
    }

    #[tokio::test]
    async fn test_search_avoids_tombstoned_virtual_id() {
        let h = Harness::new();
        h.search
            .insert(SearchSource::GrantSearch, "rural", rural_batch());
        let saved = h.registry.session(Collection::SavedGrants);

        let results = saved.search(SearchSource::GrantSearch, "rural").await;
        let mut report = saved.save(&results[0]).await.unwrap();
        detach(&mut report);
        let mut report = saved.unsave(&[10_005]).await.unwrap();
        detach(&mut report);
        assert!(saved.tombstones().contains(10_005));

        let again = saved.search(SearchSource::GrantSearch, "rural").await;
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, 10_006);
        assert_eq!(rendered_ids(&saved), vec![10_006]);
    }

    #[tokio::test]
    async fn test_search_result_without_fields_avoids_tombstoned_id() {
        let h = Harness::new();
        h.search.insert(
            SearchSource::GrantSearch,
            "blank",
            vec![RawSearchItem::new(SearchSource::GrantSearch, Fields::new()).with_rank(5)],
        );
        let saved = h.registry.session(Collection::SavedGrants);

        let results = saved.search(SearchSource::GrantSearch, "blank").await;
        let mut report = saved.save(&results[0]).await.unwrap();
        detach(&mut report);
        let mut report = saved.unsave(&[10_005]).await.unwrap();
        detach(&mut report);

        let again = saved.search(SearchSource::GrantSearch, "blank").await;
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, 10_006);
        assert_eq!(rendered_ids(&saved), vec![10_006]);
    }

    #[tokio::test]
    async fn test_failed_save_keeps_result_unsaved() {
        let mut h = Harness::new();
        h.search
            .insert(SearchSource::GrantSearch, "rural", rural_batch());
        h.store.fail_target(
            Collection::SavedGrants,
            10_005,
            RemoteError::network("upstream timed out"),
        );
        let saved = h.registry.session(Collection::SavedGrants);

        let results = saved.search(SearchSource::GrantSearch, "rural").await;
        let mut report = saved.save(&results[0]).await.unwrap();
        detach(&mut report);

        assert_eq!(report.state, MutationState::RolledBackFull);
        assert_eq!(saved.rendered(), results);
        assert!(!h.store.contains(Collection::SavedGrants, 10_005));
        assert_eq!(
            h.drain_notices()[0].message(),
            "Create failed: upstream timed out"
        );
    }
}
