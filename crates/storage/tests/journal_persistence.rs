use std::sync::Arc;

use shared::domain::{topics, LogDirection, LogEntry};
use storage::{LogJournal, SqliteStore};

#[tokio::test]
async fn journal_survives_reopening_the_backing_store() {
    let temp = tempfile::tempdir().expect("temp dir");
    let db_path = temp.path().join("panel.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    {
        let store = Arc::new(SqliteStore::new(&database_url).await.expect("open store"));
        let journal = LogJournal::new(store);
        journal
            .append(LogEntry::local(
                topics::WEATHER_RAW,
                "31.5",
                LogDirection::Received,
            ))
            .await
            .expect("append weather");
        journal
            .append(LogEntry::local(
                topics::EXCHANGE_RAW,
                "25400.12",
                LogDirection::Received,
            ))
            .await
            .expect("append exchange");
    }

    let reopened = Arc::new(SqliteStore::new(&database_url).await.expect("reopen store"));
    let journal = LogJournal::new(reopened);

    let entries = journal.recent(None).await.expect("recent");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].topic, topics::EXCHANGE_RAW);
    assert_eq!(entries[1].topic, topics::WEATHER_RAW);
    assert_eq!(entries[0].direction, LogDirection::Received);
}

#[tokio::test]
async fn cap_still_holds_after_reopening() {
    let temp = tempfile::tempdir().expect("temp dir");
    let db_path = temp.path().join("panel.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    {
        let store = Arc::new(SqliteStore::new(&database_url).await.expect("open store"));
        let journal = LogJournal::with_key_and_cap(store, "test_logs", 3);
        for n in 1..=5 {
            journal
                .append(LogEntry::local(
                    topics::CUSTOM_MESSAGE,
                    format!("msg-{n}"),
                    LogDirection::Sent,
                ))
                .await
                .expect("append");
        }
    }

    let reopened = Arc::new(SqliteStore::new(&database_url).await.expect("reopen store"));
    let journal = LogJournal::with_key_and_cap(reopened, "test_logs", 3);

    let entries = journal.recent(None).await.expect("recent");
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].message, "msg-5");
    assert_eq!(entries[2].message, "msg-3");
}
