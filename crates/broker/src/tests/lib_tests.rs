use storage::MemoryStore;

use super::*;

fn test_options(url: &str) -> BrokerOptions {
    BrokerOptions {
        url: url.to_string(),
        username: "panel".to_string(),
        password: "secret".to_string(),
        client_id_prefix: "ledboard".to_string(),
    }
}

fn test_journal() -> Arc<LogJournal> {
    Arc::new(LogJournal::new(Arc::new(MemoryStore::new())))
}

async fn wait_for_entry(journal: &LogJournal, needle: &str) -> LogEntry {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let found = journal
            .recent(None)
            .await
            .expect("journal read")
            .into_iter()
            .find(|entry| entry.message.contains(needle));
        if let Some(entry) = found {
            return entry;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "journal never saw an entry containing '{needle}'"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[test]
fn client_id_carries_prefix_and_random_suffix() {
    let options = test_options("mqtt://127.0.0.1");
    let first = options.client_id();
    let second = options.client_id();

    assert!(first.starts_with("ledboard_"));
    assert_eq!(first.len(), "ledboard".len() + 1 + 8);
    assert_ne!(first, second, "suffix should be random per session");
}

#[test]
fn builds_tcp_options_from_mqtt_url() {
    let mqtt_options = build_mqtt_options(&test_options("mqtt://10.0.0.7:1884")).expect("options");
    assert_eq!(mqtt_options.broker_address(), ("10.0.0.7".to_string(), 1884));
    assert!(matches!(mqtt_options.transport(), Transport::Tcp));
}

#[test]
fn websocket_url_is_kept_whole_for_the_transport() {
    let mqtt_options =
        build_mqtt_options(&test_options("ws://192.168.1.20:8083/mqtt")).expect("options");
    let (address, port) = mqtt_options.broker_address();
    assert_eq!(address, "ws://192.168.1.20:8083/mqtt");
    assert_eq!(port, 8083);
    assert!(matches!(mqtt_options.transport(), Transport::Ws));
}

#[test]
fn scheme_picks_the_default_port() {
    let wss = build_mqtt_options(&test_options("wss://broker.example.com/mqtt")).expect("options");
    assert_eq!(wss.broker_address().1, 8084);

    let tls = build_mqtt_options(&test_options("mqtts://broker.example.com")).expect("options");
    assert_eq!(tls.broker_address().1, 8883);
}

#[test]
fn rejects_unsupported_schemes() {
    let error = build_mqtt_options(&test_options("ftp://broker.example.com"))
        .expect_err("ftp should be rejected");
    assert!(error.to_string().contains("unsupported broker url scheme"));
}

#[test]
fn connect_timeout_rides_on_the_network_options() {
    let network_options = build_network_options();
    assert_eq!(
        network_options.connection_timeout(),
        CONNECT_TIMEOUT.as_secs()
    );
}

#[tokio::test]
async fn missing_link_refuses_to_publish() {
    let link = MissingBrokerLink::new();
    let error = link
        .publish(topics::CUSTOM_MESSAGE, "hello")
        .await
        .expect_err("publish must fail");
    assert!(error.to_string().contains("not configured"));
    assert_eq!(link.status(), LinkStatus::Disconnected);
}

#[tokio::test]
async fn publish_while_disconnected_mirrors_an_error_entry() {
    let journal = test_journal();
    // Port 1 refuses immediately; the link never reaches connected.
    let link = MqttBrokerLink::connect(&test_options("mqtt://127.0.0.1:1"), journal.clone())
        .await
        .expect("link");

    assert_ne!(link.status(), LinkStatus::Connected);

    let error = link
        .publish(topics::LED_SETTINGS, "{\"speed\":50}")
        .await
        .expect_err("publish must fail while disconnected");
    assert!(error.to_string().contains("cannot publish"));

    let entry = wait_for_entry(&journal, "Cannot publish: MQTT not connected").await;
    assert_eq!(entry.topic, topics::SYSTEM);
    assert_eq!(entry.direction, LogDirection::Error);

    link.shutdown().await;
    link.shutdown().await;
}

#[tokio::test]
async fn failed_connection_is_mirrored_and_status_drops() {
    let journal = test_journal();
    let link = MqttBrokerLink::connect(&test_options("mqtt://127.0.0.1:1"), journal.clone())
        .await
        .expect("link");

    let entry = wait_for_entry(&journal, "MQTT Error:").await;
    assert_eq!(entry.direction, LogDirection::Error);

    wait_for_entry(&journal, "Disconnected from MQTT broker").await;
    assert_eq!(link.status(), LinkStatus::Disconnected);

    link.shutdown().await;
}
