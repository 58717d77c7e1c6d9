//! Resource reclamation tests

mod mocks;

use std::sync::Arc;
use std::time::Duration;

use cloud_api::{InstanceInfo, InstanceState};
use tempfile::TempDir;

use spotforge::deploy::cleanup::{CleanupOutcome, KeyDeletion, ReclaimOptions, Reclaimer};
use spotforge::storage::instance::{InstanceDetail, InstanceStore};
use spotforge::storage::layout::StorageLayout;
use spotforge::storage::queue::CommandQueue;

use mocks::*;

struct Fixture {
    _dir: TempDir,
    layout: StorageLayout,
    instances: Arc<InstanceStore>,
    reclaimer: Reclaimer,
}

async fn fixture(cloud: Arc<MockCloud>) -> Fixture {
    let dir = TempDir::new().unwrap();
    let layout = StorageLayout::new(dir.path());
    layout.setup().await.unwrap();
    let instances = Arc::new(InstanceStore::new(layout.instance_details_file()));
    let reclaimer = Reclaimer::new(
        cloud,
        instances.clone(),
        layout.server_temp_dir(),
        ReclaimOptions {
            orphan_poll_interval: Duration::from_millis(10),
            key_delete_poll_interval: Duration::from_millis(10),
            settle_timeout: Duration::from_millis(300),
        },
    );
    Fixture {
        _dir: dir,
        layout,
        instances,
        reclaimer,
    }
}

#[tokio::test]
async fn test_clean_deploy_releases_everything() {
    let cloud = MockCloud::with_state(|s| {
        s.instances.push(running("ins-1"));
        s.instances.push(running("ins-orphan"));
        s.key_pairs
            .insert("key-1".to_string(), vec!["ins-1".to_string()]);
    });
    let fx = fixture(cloud.clone()).await;
    fx.instances
        .update(|d| {
            d.instance_id = Some("ins-1".to_string());
            d.key_pair_id = Some("key-1".to_string());
        })
        .await
        .unwrap();
    fx.layout.lock_file().write_string("Launched").await.unwrap();
    let queue = CommandQueue::new(fx.layout.command_queue_file());
    queue.push("say bye").await.unwrap();

    let outcome = fx.reclaimer.clean_deploy().await.unwrap();

    assert_eq!(outcome, CleanupOutcome::Cleaned);
    assert_eq!(
        cloud.terminated(),
        vec!["ins-1".to_string(), "ins-orphan".to_string()]
    );
    assert_eq!(cloud.deleted_keys(), vec!["key-1".to_string()]);
    assert!(!fx.layout.lock_file().exists().await);
    assert_eq!(fx.instances.load().await.unwrap(), InstanceDetail::default());
    // the queue outlives the deployment
    assert_eq!(queue.pending().await.unwrap(), vec!["say bye".to_string()]);
}

#[tokio::test]
async fn test_overlapping_cleanup_is_skipped() {
    let cloud = MockCloud::with_state(|s| {
        s.key_pairs.insert("key-1".to_string(), Vec::new());
        s.key_release_after = 5;
    });
    let fx = fixture(cloud.clone()).await;
    fx.instances
        .update(|d| d.key_pair_id = Some("key-1".to_string()))
        .await
        .unwrap();

    let (first, second) = tokio::join!(
        fx.reclaimer.clean_deploy(),
        async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            fx.reclaimer.clean_deploy().await
        }
    );

    assert_eq!(first.unwrap(), CleanupOutcome::Cleaned);
    assert_eq!(second.unwrap(), CleanupOutcome::AlreadyCleaning);
    assert!(!fx.reclaimer.is_cleaning());
    assert_eq!(cloud.deleted_keys(), vec!["key-1".to_string()]);
}

#[tokio::test]
async fn test_key_deletion_is_deduplicated() {
    let cloud = MockCloud::with_state(|s| {
        s.key_pairs.insert("key-1".to_string(), Vec::new());
        s.key_release_after = 3;
    });
    let fx = fixture(cloud.clone()).await;

    let (first, second) = tokio::join!(
        fx.reclaimer.delete_key_pair("key-1"),
        fx.reclaimer.delete_key_pair("key-1")
    );

    assert_eq!(first.unwrap(), KeyDeletion::Deleted);
    assert_eq!(second.unwrap(), KeyDeletion::AlreadyPending);
    assert_eq!(cloud.deleted_keys(), vec!["key-1".to_string()]);

    // already gone on the provider side
    assert_eq!(
        fx.reclaimer.delete_key_pair("key-1").await.unwrap(),
        KeyDeletion::AlreadyGone
    );
}

#[tokio::test]
async fn test_key_held_too_long_is_abandoned() {
    let cloud = MockCloud::with_state(|s| {
        s.key_pairs
            .insert("key-1".to_string(), vec!["ins-stuck".to_string()]);
    });
    let fx = fixture(cloud.clone()).await;

    assert_eq!(
        fx.reclaimer.delete_key_pair("key-1").await.unwrap(),
        KeyDeletion::Abandoned
    );
    assert!(cloud.deleted_keys().is_empty());
}

#[tokio::test]
async fn test_sweep_spares_the_tracked_instance() {
    let cloud = MockCloud::with_state(|s| {
        s.instances.push(running("ins-1"));
        s.instances.push(running("ins-2"));
        s.instances.push(running("ins-3"));
    });
    let fx = fixture(cloud.clone()).await;

    let swept = fx.reclaimer.sweep_orphans(Some("ins-2")).await.unwrap();

    assert_eq!(swept, vec!["ins-1".to_string(), "ins-3".to_string()]);
    assert_eq!(cloud.terminated(), swept);
}

#[tokio::test]
async fn test_sweep_waits_for_settled_instances() {
    let cloud = MockCloud::with_state(|s| {
        s.instances.push(InstanceInfo {
            instance_id: "ins-new".to_string(),
            instance_state: InstanceState::Pending,
            public_ip_addresses: Vec::new(),
        });
    });
    let fx = fixture(cloud.clone()).await;

    // never settles within the bound, nothing is touched
    let swept = fx.reclaimer.sweep_orphans(None).await.unwrap();
    assert!(swept.is_empty());
    assert!(cloud.terminated().is_empty());
}
