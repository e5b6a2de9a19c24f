//! Integration tests for delayed reconciliation against a lagging store.
//!
//! Timing tests run on a paused clock so the delay plans finish instantly.

mod common;

use std::time::Duration;

use common::{detach, fields, rendered_ids, Harness};
use grantsync_client::{ClientError, Notice, RunOutcome};
use grantsync_engine::{Collection, RawSearchItem, Residency, SearchSource};

#[cfg(test)]
mod lagging_list_tests {
    use super::*;

    #[tokio::test]
    async fn test_deleted_record_never_resurrects() {
        let h = Harness::new();
        h.seed(Collection::Proposals, &[1, 2]);
        let session = h.registry.session(Collection::Proposals);
        session.refresh().await.unwrap();

        h.store.linger_deletes(2);
        let mut report = session.delete(&[1]).await.unwrap();
        detach(&mut report);

        for _ in 0..2 {
            let merged = session.refresh().await.unwrap();
            assert_eq!(merged.suppressed, vec![1]);
            assert_eq!(rendered_ids(&session), vec![2]);
            assert!(!session.cache().read().contains(1));
        }

        // First fetch without the row
        session.refresh().await.unwrap();
        assert!(session.tombstones().contains(1));

        // Second consecutive absence confirms the delete
        let merged = session.refresh().await.unwrap();
        assert_eq!(merged.prunable, vec![1]);
        assert!(session.tombstones().is_empty());

        session.refresh().await.unwrap();
        assert_eq!(rendered_ids(&session), vec![2]);
    }

    #[tokio::test]
    async fn test_failed_refresh_surfaces_remote_error() {
        let h = Harness::new();
        h.seed(Collection::Reports, &[1]);
        h.store.fail_next_lists(1);
        let session = h.registry.session(Collection::Reports);

        let err = session.refresh().await.unwrap_err();
        assert!(matches!(err, ClientError::Remote(_)));
        assert!(session.rendered().is_empty());

        session.refresh().await.unwrap();
        assert_eq!(rendered_ids(&session), vec![1]);
    }

    #[tokio::test]
    async fn test_search_results_survive_merges() {
        let h = Harness::new();
        h.search.insert(
            SearchSource::Suggestions,
            "arts",
            vec![RawSearchItem::new(SearchSource::Suggestions, fields("Mural grant"))],
        );
        let saved = h.registry.session(Collection::SavedGrants);
        saved.search(SearchSource::Suggestions, "arts").await;

        for _ in 0..3 {
            saved.refresh().await.unwrap();
        }

        let rendered = saved.rendered();
        assert_eq!(rendered.len(), 1);
        assert_eq!(rendered[0].id, 20_000);
        assert_eq!(rendered[0].residency, Residency::Ephemeral);
    }

    #[tokio::test]
    async fn test_refresh_due_follows_sync_interval() {
        let h = Harness::new();
        h.seed(Collection::Proposals, &[1]);
        h.registry.session(Collection::Proposals);
        h.registry.session(Collection::Reports);

        let first = h.registry.refresh_due().await;
        assert_eq!(first.len(), 2);
        assert!(first
            .iter()
            .all(|(_, result)| matches!(result, Ok(Some(_)))));

        let second = h.registry.refresh_due().await;
        assert!(second.iter().all(|(_, result)| matches!(result, Ok(None))));
        assert_eq!(h.store.list_calls(), 2);

        h.clock.advance(Duration::from_secs(300));
        let third = h.registry.refresh_due().await;
        assert!(third.iter().all(|(_, result)| matches!(result, Ok(Some(_)))));
        assert_eq!(h.store.list_calls(), 4);
    }
}

#[cfg(test)]
mod scheduled_run_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_delete_prunes_tombstone() {
        let mut h = Harness::new();
        h.seed(Collection::Proposals, &[1, 2]);
        let session = h.registry.session(Collection::Proposals);
        session.refresh().await.unwrap();

        let report = session.delete(&[1]).await.unwrap();
        let outcome = report.reconciliation.unwrap().await.unwrap();

        assert_eq!(
            outcome,
            RunOutcome::Completed {
                merged: 4,
                failed: 0,
                stale: vec![],
            }
        );
        assert_eq!(h.store.list_calls(), 5);
        assert!(session.tombstones().is_empty());
        assert_eq!(rendered_ids(&session), vec![2]);
        assert!(h
            .drain_notices()
            .iter()
            .all(|n| !matches!(n, Notice::Stale { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lingering_delete_reports_stale() {
        let mut h = Harness::new();
        h.seed(Collection::Proposals, &[1, 2]);
        let session = h.registry.session(Collection::Proposals);
        session.refresh().await.unwrap();

        h.store.linger_deletes(100);
        let report = session.delete(&[1]).await.unwrap();
        let outcome = report.reconciliation.unwrap().await.unwrap();

        assert_eq!(
            outcome,
            RunOutcome::Completed {
                merged: 4,
                failed: 0,
                stale: vec![1],
            }
        );
        assert!(session.tombstones().contains(1));
        assert_eq!(rendered_ids(&session), vec![2]);

        let notices = h.drain_notices();
        assert_eq!(
            notices.last(),
            Some(&Notice::Stale {
                collection: Collection::Proposals,
                ids: vec![1],
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_store_reports_stale() {
        let mut h = Harness::new();
        h.seed(Collection::Reports, &[1, 2]);
        let session = h.registry.session(Collection::Reports);
        session.refresh().await.unwrap();

        h.store.fail_next_lists(4);
        let report = session.delete(&[1]).await.unwrap();
        let outcome = report.reconciliation.unwrap().await.unwrap();

        assert_eq!(
            outcome,
            RunOutcome::Completed {
                merged: 0,
                failed: 4,
                stale: vec![1],
            }
        );
        assert!(h
            .drain_notices()
            .iter()
            .any(|n| matches!(n, Notice::Stale { ids, .. } if ids == &vec![1])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_run_uses_create_plan() {
        let h = Harness::new();
        let session = h.registry.session(Collection::Reports);

        let report = session.create(fields("Q1 impact")).await.unwrap();
        let outcome = report.reconciliation.unwrap().await.unwrap();

        assert_eq!(
            outcome,
            RunOutcome::Completed {
                merged: 5,
                failed: 0,
                stale: vec![],
            }
        );
        assert_eq!(rendered_ids(&session), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_view_stops_runs() {
        let h = Harness::new();
        h.seed(Collection::Proposals, &[1, 2]);
        let session = h.registry.session(Collection::Proposals);
        session.refresh().await.unwrap();

        let report = session.delete(&[1]).await.unwrap();
        h.registry.close();
        let outcome = report.reconciliation.unwrap().await.unwrap();

        assert_eq!(outcome, RunOutcome::Cancelled { attempts: 0 });
        assert_eq!(h.store.list_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_registry_stops_runs() {
        let h = Harness::new();
        h.seed(Collection::Proposals, &[1, 2]);
        let session = h.registry.session(Collection::Proposals);
        session.refresh().await.unwrap();

        let report = session.delete(&[1]).await.unwrap();
        let store = h.store.clone();
        drop(h);
        let outcome = report.reconciliation.unwrap().await.unwrap();

        assert_eq!(outcome, RunOutcome::Cancelled { attempts: 0 });
        assert_eq!(store.list_calls(), 1);
        assert_eq!(rendered_ids(&session), vec![2]);
    }
}
