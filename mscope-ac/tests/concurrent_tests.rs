//! Concurrency tests: foreground operations racing reconciliation passes

mod helpers;

use helpers::{numbered_alignment, open_test_root};
use mscope_ac::store::owner_id;
use mscope_ac::Workspace;
use mscope_common::events::{ArtifactKind, MscopeEvent};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_submissions_survive_concurrent_reconciliation() {
    let root = Arc::new(open_test_root().await);

    let reconciler = {
        let root = Arc::clone(&root);
        tokio::spawn(async move {
            for _ in 0..10 {
                root.service.reconcile_now().await.unwrap();
            }
        })
    };

    let mut submitters = Vec::new();
    for n in 0..16 {
        let root = Arc::clone(&root);
        submitters.push(tokio::spawn(async move {
            root.service
                .submit_analysis(numbered_alignment(n), Workspace::Denv, "load", &format!("run {}", n))
                .await
                .unwrap()
        }));
    }

    let mut ids = HashSet::new();
    for handle in submitters {
        ids.insert(handle.await.unwrap());
    }
    reconciler.await.unwrap();

    assert_eq!(ids.len(), 16);
    for id in &ids {
        assert!(root.artifact_path(*id, ArtifactKind::Results).exists());
        assert!(root.backup_path(*id, ArtifactKind::Results).exists());
        assert!(root.artifact_path(*id, ArtifactKind::Source).exists());
        let view = root.service.fetch_record(*id, Some("load")).await.unwrap();
        assert_eq!(view.positions.len(), 12);
    }

    let report = root.service.reconcile_now().await.unwrap();
    assert_eq!(report.mutations(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deletes_racing_reconciliation_leave_no_orphans() {
    let root = Arc::new(open_test_root().await);

    let mut ids = Vec::new();
    for n in 0..8 {
        let id = root
            .service
            .submit_analysis(numbered_alignment(n), Workspace::Chikv, "k", "x")
            .await
            .unwrap();
        ids.push(id);
    }
    // Damage half so reconciliation has work to do while deletes run
    for id in ids.iter().step_by(2) {
        root.remove_artifact(*id, ArtifactKind::Results);
    }

    let reconciler = {
        let root = Arc::clone(&root);
        tokio::spawn(async move { root.service.reconcile_now().await.unwrap() })
    };

    let mut deleters = Vec::new();
    for id in ids.iter().take(4).copied() {
        let root = Arc::clone(&root);
        deleters.push(tokio::spawn(async move { root.service.delete_record(id).await.unwrap() }));
    }
    for handle in deleters {
        assert!(handle.await.unwrap() > 0);
    }
    reconciler.await.unwrap();

    // One more pass cleans up anything a racing restore left behind
    root.service.reconcile_now().await.unwrap();

    let live: HashSet<Uuid> = root.service.registry().ids().await.unwrap().into_iter().collect();
    assert_eq!(live, ids[4..].iter().copied().collect::<HashSet<_>>());
    for (name, _) in root.all_files() {
        let owner = owner_id(&name).unwrap();
        assert!(live.contains(&owner), "orphan left behind: {}", name);
    }
    assert!(root.service.verify().await.unwrap().is_consistent());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_fetches_repair_once() {
    let root = Arc::new(open_test_root().await);
    let id = root
        .service
        .submit_analysis(numbered_alignment(3), Workspace::Denv, "k", "x")
        .await
        .unwrap();
    root.remove_artifact(id, ArtifactKind::Results);
    root.remove_backup(id, ArtifactKind::Results);
    let mut rx = root.service.events().subscribe();

    let mut readers = Vec::new();
    for _ in 0..8 {
        let root = Arc::clone(&root);
        readers.push(tokio::spawn(async move { root.service.fetch_record(id, None).await }));
    }
    for handle in readers {
        let view = handle.await.unwrap().unwrap();
        assert_eq!(view.positions.len(), 12);
    }

    let mut regenerated = 0;
    while let Ok(event) = rx.try_recv() {
        if let MscopeEvent::ArtifactRegenerated {
            record_id,
            kind: ArtifactKind::Results,
            ..
        } = event
        {
            assert_eq!(record_id, id);
            regenerated += 1;
        }
    }
    assert_eq!(regenerated, 1);

    assert!(root.service.verify().await.unwrap().is_consistent());
}
