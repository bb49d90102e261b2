//! Integration tests for submitting messages
//!
//! These tests verify:
//! - Sequential id allocation under load
//! - Deduplication by concurrency key
//! - Release of a key once its message finishes

mod common;

use atomic_queue::{MessageId, MessageRecord, MessageStatus, SubmitOutcome};
use common::{engine, key};

/// A thousand distinct submits produce ids 1..=1000 in submit order
#[tokio::test]
async fn test_thousand_submits_allocate_sequential_ids() {
    let (store, engine) = engine();
    let submitted = engine.config().topology.submitted.clone();

    for i in 1..=1000u64 {
        let outcome = engine
            .submit(&submitted, &key(&format!("job{}.test", i)), format!("{{\"n\":{}}}", i))
            .await
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::Created(MessageId::new(i)));
    }

    assert_eq!(engine.queue_length(&submitted).await.unwrap(), 1000);
    assert_eq!(store.set_members("message:received").unwrap().len(), 1000);

    // Oldest on the right
    let ids = store.list_range("queue:submitted").unwrap();
    assert_eq!(ids.first().map(String::as_str), Some("1000"));
    assert_eq!(ids.last().map(String::as_str), Some("1"));
}

/// Submitting code1.test twice stores one message
#[tokio::test]
async fn test_duplicate_concurrency_key() {
    let (store, engine) = engine();
    let submitted = engine.config().topology.submitted.clone();

    let first = engine.submit(&submitted, &key("code1.test"), "{}").await.unwrap();
    let second = engine.submit(&submitted, &key("code1.test"), "{}").await.unwrap();

    assert_eq!(first.id(), Some(MessageId::new(1)));
    assert!(second.is_duplicate());
    assert_eq!(engine.queue_length(&submitted).await.unwrap(), 1);
    assert!(store.hash_get_all("message:2").unwrap().is_empty());
}

/// A key stays blocked while received and is released by finish
#[tokio::test]
async fn test_key_blocked_until_finished() {
    let (store, engine) = engine();
    let topology = engine.config().topology.clone();
    let job = key("code1.test");

    let id = engine.submit(&topology.submitted, &job, "{}").await.unwrap().id().unwrap();
    engine
        .receive_now(&topology.submitted, &topology.received)
        .await
        .unwrap()
        .unwrap();

    assert!(engine
        .submit(&topology.submitted, &job, "{}")
        .await
        .unwrap()
        .is_duplicate());

    engine.finish_with_error(id).await.unwrap();
    let again = engine.submit(&topology.submitted, &job, "{}").await.unwrap();
    assert_eq!(again.id(), Some(MessageId::new(2)));

    // The first record keeps its final state
    let first = MessageRecord::from_pairs(store.hash_get_all("message:1").unwrap()).unwrap();
    assert_eq!(first.status, MessageStatus::FinishedWithError);
}

/// Concurrent submits of one key admit exactly one message
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_admit_one() {
    let (_, engine) = engine();
    let submitted = engine.config().topology.submitted.clone();

    let mut handles = Vec::new();
    for _ in 0..32 {
        let engine = engine.clone();
        let submitted = submitted.clone();
        handles.push(tokio::spawn(async move {
            engine.submit(&submitted, &key("shared.job"), "{}").await.unwrap()
        }));
    }

    let mut created = 0;
    for handle in handles {
        if !handle.await.unwrap().is_duplicate() {
            created += 1;
        }
    }

    assert_eq!(created, 1);
    assert_eq!(engine.queue_length(&submitted).await.unwrap(), 1);
}
