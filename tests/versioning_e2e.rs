//! Copy-on-write versioning through the public API: commit chains,
//! cross-commit dedup, and the lazy history stream.

use engram_core::{DatabaseConfig, NounType};
use engram_db::prelude::*;
use futures::{pin_mut, StreamExt};
use std::sync::Arc;

async fn open_db() -> Engram {
    Engram::init(DatabaseConfig::default(), Arc::new(HashEmbedder::new(64)))
        .await
        .expect("database init")
}

#[tokio::test]
async fn commit_then_stream_returns_it_first() {
    let db = open_db().await;
    db.add(AddRequest::text("state", NounType::Thing))
        .await
        .unwrap();

    let commit = db.commit("initial snapshot", "tester", true).await.unwrap();

    let stream = db.stream_history(HistoryFilter {
        limit: Some(1),
        ..Default::default()
    });
    pin_mut!(stream);
    let latest = stream.next().await.unwrap().unwrap();
    assert_eq!(latest, commit);
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn stream_history_on_empty_branch_completes_cleanly() {
    let db = open_db().await;
    let stream = db.stream_history(HistoryFilter::default());
    pin_mut!(stream);
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn stream_matches_eager_history_over_100_commits() {
    let db = open_db().await;
    db.add(AddRequest::text("base entity", NounType::Thing))
        .await
        .unwrap();

    for i in 0..100 {
        db.commit(format!("commit {i}"), "tester", true)
            .await
            .unwrap();
    }

    let filter = HistoryFilter {
        limit: Some(100),
        ..Default::default()
    };
    let eager = db.get_history(&filter).await.unwrap();
    assert_eq!(eager.len(), 100);

    let stream = db.stream_history(filter);
    pin_mut!(stream);
    let mut lazy = Vec::new();
    while let Some(commit) = stream.next().await {
        lazy.push(commit.unwrap());
    }
    assert_eq!(lazy, eager);

    // Newest first, strictly chained.
    for pair in lazy.windows(2) {
        assert_eq!(pair[0].parent.as_deref(), Some(pair[1].hash.as_str()));
        assert!(pair[0].timestamp >= pair[1].timestamp);
    }
}

#[tokio::test]
async fn unchanged_state_dedups_across_commits() {
    let db = open_db().await;
    for i in 0..20 {
        db.add(AddRequest::text(format!("stable entity {i}"), NounType::Document))
            .await
            .unwrap();
    }

    // 100 commits over one unchanged entity set.
    for i in 0..100 {
        db.commit(format!("tick {i}"), "cron", true).await.unwrap();
    }

    let stats = db.blobs().stats();
    // All 100 tree snapshots collapse onto one stored tree blob.
    assert_eq!(stats.total_blobs, 1, "identical trees must deduplicate");
    assert_eq!(stats.dedup_hits, 99);
    assert!(stats.dedup_savings > 0);
}

#[tokio::test]
async fn history_filters_by_author() {
    let db = open_db().await;
    for i in 0..10 {
        let author = if i % 2 == 0 { "alice" } else { "bob" };
        db.commit(format!("c{i}"), author, false).await.unwrap();
    }

    let filter = HistoryFilter {
        author: Some("alice".to_string()),
        ..Default::default()
    };
    let commits = db.get_history(&filter).await.unwrap();
    assert_eq!(commits.len(), 5);
    assert!(commits.iter().all(|c| c.author == "alice"));

    let stream = db.stream_history(filter);
    pin_mut!(stream);
    let mut streamed = 0;
    while let Some(commit) = stream.next().await {
        assert_eq!(commit.unwrap().author, "alice");
        streamed += 1;
    }
    assert_eq!(streamed, 5);
}

#[tokio::test]
async fn early_break_stops_the_walk() {
    let db = open_db().await;
    for i in 0..50 {
        db.commit(format!("c{i}"), "walker", false).await.unwrap();
    }

    let stream = db.stream_history(HistoryFilter::default());
    pin_mut!(stream);
    let mut taken = 0;
    while let Some(commit) = stream.next().await {
        commit.unwrap();
        taken += 1;
        if taken == 5 {
            break; // consumer walks away; no background prefetch survives
        }
    }
    assert_eq!(taken, 5);
}

#[tokio::test]
async fn capture_state_snapshots_live_ids() {
    let db = open_db().await;
    let keep = db
        .add(AddRequest::text("kept", NounType::Thing))
        .await
        .unwrap();
    let drop_me = db
        .add(AddRequest::text("dropped", NounType::Thing))
        .await
        .unwrap();

    let before = db.commit("before", "t", true).await.unwrap();
    db.delete(&drop_me, None).await.unwrap();
    let after = db.commit("after", "t", true).await.unwrap();

    let tree_before = db.versions().get_tree(&before).await.unwrap();
    let tree_after = db.versions().get_tree(&after).await.unwrap();
    assert_eq!(tree_before.noun_ids.len(), 2);
    assert_eq!(tree_after.noun_ids, vec![keep.to_string()]);
}
