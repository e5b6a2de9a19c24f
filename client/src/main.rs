//! grantsync simulator.
//!
//! Drives the optimistic mutation and reconciliation runtime against an
//! in-memory record store that lags behind its writes and fails on demand,
//! printing every user notice as it is raised.

use std::sync::Arc;
use std::time::Duration;

use grantsync_client::{
    CannedSearch, Config, FileStorage, InMemoryRecordStore, NoticeSink, SessionDeps,
    SessionRegistry,
};
use grantsync_engine::{
    Collection, Fields, RawSearchItem, RemoteError, SearchSource, SystemClock,
};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn fields(value: serde_json::Value) -> Fields {
    value.as_object().cloned().unwrap_or_default()
}

/// Rows and search batches the simulated backend starts with.
fn seed(store: &InMemoryRecordStore, search: &CannedSearch) {
    for (id, title) in [(1, "Library refit"), (2, "Youth orchestra"), (3, "Solar co-op")] {
        store.seed_fields(Collection::Proposals, id, fields(json!({ "title": title })));
    }
    store.seed_fields(
        Collection::Reports,
        1,
        fields(json!({ "title": "Q1 impact report" })),
    );

    search.insert(
        SearchSource::GrantSearch,
        "rural",
        vec![
            RawSearchItem::new(
                SearchSource::GrantSearch,
                fields(json!({ "title": "Rural broadband fund", "amount": 50_000 })),
            ),
            RawSearchItem::new(
                SearchSource::GrantSearch,
                fields(json!({ "title": "Village hall grant", "amount": 8_000 })),
            ),
        ],
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "grantsync_client=debug,grantsync_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!(
        "Starting grantsync simulator, tombstones in {}",
        config.tombstone_dir.display()
    );

    // Simulated backend
    let store = InMemoryRecordStore::new_shared();
    let search = CannedSearch::new_shared();
    seed(&store, &search);
    store.set_latency(Duration::from_millis(40));
    store.linger_deletes(1);
    store.fail_target(
        Collection::Proposals,
        3,
        RemoteError::network("upstream timed out"),
    );

    // Notice printer
    let (notices, mut receiver) = NoticeSink::channel();
    let printer = tokio::spawn(async move {
        while let Some(stamped) = receiver.recv().await {
            println!("{} {}", stamped.at.format("%H:%M:%S%.3f"), stamped.notice);
        }
    });

    let registry = SessionRegistry::new(SessionDeps {
        service: store.clone(),
        generator: search,
        storage: Arc::new(FileStorage::new(&config.tombstone_dir)),
        clock: Arc::new(SystemClock),
        config: Arc::new(config),
        notices,
    });

    // Proposals: load, then a batch delete where one target fails
    let proposals = registry.session(Collection::Proposals);
    proposals.refresh().await?;
    let deleted = proposals.delete(&[1, 2, 3]).await?;
    let created = proposals
        .create(fields(json!({ "title": "Community garden" })))
        .await?;

    // Saved grants: search, then save the first result
    let saved = registry.session(Collection::SavedGrants);
    let results = saved.search(SearchSource::GrantSearch, "rural").await;
    let mut pending = vec![deleted.reconciliation, created.reconciliation];
    if let Some(first) = results.first() {
        pending.push(saved.save(first).await?.reconciliation);
    }

    for handle in pending.into_iter().flatten() {
        let outcome = handle.await?;
        tracing::info!(?outcome, "Reconciliation finished");
    }

    for session in [&proposals, &saved] {
        for record in session.rendered() {
            println!(
                "{:>13} #{:<8} {:?} {}",
                session.collection().name(),
                record.id,
                record.residency,
                serde_json::Value::Object(record.fields)
            );
        }
    }

    registry.close();
    drop((proposals, saved, registry));
    if tokio::time::timeout(Duration::from_millis(100), printer)
        .await
        .is_err()
    {
        tracing::debug!("Notice printer still running at shutdown");
    }

    Ok(())
}
