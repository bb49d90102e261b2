//! Tests for the raw list helper.

use super::*;
use crate::stores::MemoryStore;

fn queue(name: &str) -> (MemoryStore, RawQueue) {
    let store = MemoryStore::new();
    let raw = RawQueue::new(Arc::new(store.clone()), name.parse().unwrap());
    (store, raw)
}

#[tokio::test]
async fn test_push_then_pop_is_fifo() {
    let (_, raw) = queue("jobs");

    assert_eq!(raw.push("first").await.unwrap(), 1);
    assert_eq!(raw.push("second").await.unwrap(), 2);

    assert_eq!(raw.pop().await.unwrap().as_deref(), Some("first"));
    assert_eq!(raw.pop().await.unwrap().as_deref(), Some("second"));
    assert_eq!(raw.pop().await.unwrap(), None);
}

#[tokio::test]
async fn test_push_lands_on_the_left() {
    let (store, raw) = queue("jobs");
    raw.push("a").await.unwrap();
    raw.push("b").await.unwrap();

    assert_eq!(store.list_range("jobs").unwrap(), vec!["b", "a"]);
}

#[tokio::test]
async fn test_length_tracking() {
    let (_, raw) = queue("jobs");
    assert!(raw.is_empty().await.unwrap());

    raw.push("x").await.unwrap();
    assert_eq!(raw.len().await.unwrap(), 1);
    assert!(!raw.is_empty().await.unwrap());
}
