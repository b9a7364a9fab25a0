use shared::domain::{topics, LogDirection, LogEntry};

use super::*;

fn received(topic: &str, message: &str) -> LogEntry {
    LogEntry::local(topic, message, LogDirection::Received)
}

#[tokio::test]
async fn kv_roundtrip_on_sqlite() {
    let store = SqliteStore::new("sqlite::memory:").await.expect("db");

    assert!(store.get("missing").await.expect("get").is_none());

    store.put("greeting", "hello").await.expect("put");
    assert_eq!(
        store.get("greeting").await.expect("get").as_deref(),
        Some("hello")
    );

    store.put("greeting", "replaced").await.expect("overwrite");
    assert_eq!(
        store.get("greeting").await.expect("get").as_deref(),
        Some("replaced")
    );

    store.remove("greeting").await.expect("remove");
    assert!(store.get("greeting").await.expect("get").is_none());
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let store = SqliteStore::new("sqlite::memory:").await.expect("db");
    store.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("ledboard_storage_test_{suffix}"));
    let db_path = temp_root.join("nested").join("panel.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let store = SqliteStore::new(&database_url).await.expect("db");
    drop(store);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}

#[tokio::test]
async fn memory_store_forgets_removed_keys() {
    let store = MemoryStore::new();
    store.put("k", "v").await.expect("put");
    store.remove("k").await.expect("remove");
    assert!(store.get("k").await.expect("get").is_none());
}

#[tokio::test]
async fn journal_returns_entries_newest_first() {
    let journal = LogJournal::new(Arc::new(MemoryStore::new()));

    journal
        .append(received(topics::WEATHER_RAW, "first"))
        .await
        .expect("append");
    journal
        .append(received(topics::EXCHANGE_RAW, "second"))
        .await
        .expect("append");

    let entries = journal.recent(None).await.expect("recent");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].message, "second");
    assert_eq!(entries[1].message, "first");
}

#[tokio::test]
async fn journal_enforces_cap_evicting_oldest_first() {
    let journal = LogJournal::with_key_and_cap(Arc::new(MemoryStore::new()), "test_logs", 5);

    for n in 1..=7 {
        journal
            .append(received(topics::WEATHER_RAW, &format!("msg-{n}")))
            .await
            .expect("append");
    }

    let entries = journal.recent(None).await.expect("recent");
    assert_eq!(entries.len(), 5);
    assert_eq!(entries[0].message, "msg-7");
    assert_eq!(entries[4].message, "msg-3", "oldest two should be evicted");
    assert_eq!(journal.count().await.expect("count"), 5);
}

#[tokio::test]
async fn journal_recent_honors_limit() {
    let journal = LogJournal::new(Arc::new(MemoryStore::new()));
    for n in 0..4 {
        journal
            .append(received(topics::CUSTOM_MESSAGE, &format!("msg-{n}")))
            .await
            .expect("append");
    }

    let entries = journal.recent(Some(2)).await.expect("recent");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].message, "msg-3");
}

#[tokio::test]
async fn journal_filters_by_topic_substring_case_insensitively() {
    let journal = LogJournal::new(Arc::new(MemoryStore::new()));
    journal
        .append(received(topics::WEATHER_RAW, "w1"))
        .await
        .expect("append");
    journal
        .append(received(topics::EXCHANGE_RAW, "e1"))
        .await
        .expect("append");
    journal
        .append(received(topics::WEATHER_LED, "w2"))
        .await
        .expect("append");
    journal
        .append(received(topics::EXCHANGE_LED, "e2"))
        .await
        .expect("append");

    let weather = journal
        .filtered(Some("WEATHER"), 100)
        .await
        .expect("filtered");
    assert_eq!(weather.len(), 2);
    assert_eq!(weather[0].message, "w2");
    assert_eq!(weather[1].message, "w1");

    let capped = journal.filtered(None, 3).await.expect("filtered");
    assert_eq!(capped.len(), 3);
}

#[tokio::test]
async fn journal_recovers_from_corrupt_stored_payload() {
    let store = Arc::new(MemoryStore::new());
    store
        .put(LOG_JOURNAL_KEY, "not json at all")
        .await
        .expect("seed corrupt value");

    let journal = LogJournal::new(store);
    assert!(journal.recent(None).await.expect("recent").is_empty());

    journal
        .append(received(topics::LED_SETTINGS, "{\"speed\":50}"))
        .await
        .expect("append over corrupt value");
    assert_eq!(journal.count().await.expect("count"), 1);
}

#[tokio::test]
async fn journal_clear_removes_the_backing_key() {
    let store = Arc::new(MemoryStore::new());
    let journal = LogJournal::new(store.clone());

    journal
        .append(received(topics::WEATHER_RAW, "entry"))
        .await
        .expect("append");
    journal.clear().await.expect("clear");

    assert!(store.get(LOG_JOURNAL_KEY).await.expect("get").is_none());
    assert_eq!(journal.count().await.expect("count"), 0);
}
