//! End-to-end runs of the integration manager over loopback feeds

use bytes::Bytes;
use feedlink_client::{ConnectionConfig, LoopbackConnection, StreamConnection};
use feedlink_core::alert::AlertType;
use feedlink_core::config::AppConfig;
use feedlink_core::types::{ConnectionState, StrategyKind, TrafficClass};
use feedlink_pool::IntegrationManager;
use std::sync::Arc;
use std::time::Duration;

async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

async fn add_feed(
    manager: &IntegrationManager,
    id: &str,
    class: TrafficClass,
) -> Arc<LoopbackConnection> {
    let config = ConnectionConfig::new(id, class)
        .with_endpoint(format!("loopback://{id}"))
        .connect_on_register(true);
    let conn = Arc::new(LoopbackConnection::new(config.clone()));
    assert!(manager.register_connection(conn.clone(), config).await);
    conn
}

#[tokio::test(flavor = "multi_thread")]
async fn test_feeds_flow_through_manager() {
    let manager = IntegrationManager::new(AppConfig::default()).unwrap();
    manager.start().unwrap();

    let md1 = add_feed(&manager, "md-1", TrafficClass::MarketData).await;
    let md2 = add_feed(&manager, "md-2", TrafficClass::MarketData).await;
    add_feed(&manager, "tr-1", TrafficClass::Trading).await;
    for id in ["md-1", "md-2", "tr-1"] {
        eventually(|| manager.store().state(id) == Some(ConnectionState::Connected)).await;
    }

    md1.set_latency(Some(12.0));
    md1.inject_message(Bytes::from_static(b"{\"bid\":1}"));
    md2.inject_message(Bytes::from_static(b"{\"bid\":2}"));
    eventually(|| {
        manager
            .store()
            .active_by_class(TrafficClass::MarketData)
            .iter()
            .all(|r| r.metrics.messages_received == 1)
    })
    .await;

    let conn = manager
        .get_connection(TrafficClass::MarketData, Some(StrategyKind::LeastLatency))
        .unwrap()
        .unwrap();
    assert_eq!(conn.id(), "md-1");

    let results = manager
        .broadcast_message(Bytes::from_static(b"heartbeat"), None)
        .await;
    assert_eq!(results.len(), 3);
    assert!(results.values().all(|sent| *sent));

    let overview = manager.get_system_overview();
    assert_eq!(overview.total_connections, 3);
    assert_eq!(overview.active_connections, 3);
    assert_eq!(overview.connection_success_rate, 1.0);
    let json = serde_json::to_value(&overview).unwrap();
    assert_eq!(json["node_id"], "node-1");

    manager.shutdown().await;
    assert!(!md1.is_connected());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_evicted_connection_is_released() {
    let mut config = AppConfig::default();
    config.store.max_connections = 1;
    let manager = IntegrationManager::new(config).unwrap();

    let idle = |id: &str| {
        let config = ConnectionConfig::new(id, TrafficClass::MarketData);
        (Arc::new(LoopbackConnection::new(config.clone())), config)
    };

    let (a, a_config) = idle("a");
    assert!(manager.register_connection(a, a_config).await);
    let (b, b_config) = idle("b");
    assert!(manager.register_connection(b, b_config).await);
    assert!(!manager.store().contains("a"));
    assert!(manager.get_connection_info("a").is_none());

    let results = manager
        .broadcast_message(Bytes::from_static(b"ping"), None)
        .await;
    assert_eq!(results.keys().map(String::as_str).collect::<Vec<_>>(), vec!["b"]);

    // The evicted id can come back and in turn displaces the idle one.
    let (a, a_config) = idle("a");
    assert!(manager.register_connection(a.clone(), a_config).await);
    assert!(manager.store().contains("a"));
    assert!(!manager.store().contains("b"));
    assert!(!manager.connect("b").await);

    assert!(manager.connect("a").await);
    eventually(|| manager.store().state("a") == Some(ConnectionState::Connected)).await;
    let results = manager
        .broadcast_message(Bytes::from_static(b"ping"), None)
        .await;
    assert_eq!(results.len(), 1);
    assert!(results["a"]);
    assert_eq!(a.sent_messages().len(), 1);
    assert_eq!(manager.get_system_overview().total_connections, 1);
    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unhealthy_transport_leaves_rotation() {
    let manager = IntegrationManager::new(AppConfig::default()).unwrap();
    let md1 = add_feed(&manager, "md-1", TrafficClass::MarketData).await;
    add_feed(&manager, "md-2", TrafficClass::MarketData).await;
    for id in ["md-1", "md-2"] {
        eventually(|| manager.store().state(id) == Some(ConnectionState::Connected)).await;
    }

    md1.set_unhealthy(true);
    for _ in 0..3 {
        manager.check_health().await;
    }
    for _ in 0..4 {
        let conn = manager
            .get_connection(TrafficClass::MarketData, Some(StrategyKind::RoundRobin))
            .unwrap()
            .unwrap();
        assert_eq!(conn.id(), "md-2");
    }
    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_connection_raises_alert() {
    let manager = IntegrationManager::new(AppConfig::default()).unwrap();
    let conn = add_feed(&manager, "ud-1", TrafficClass::UserData).await;
    eventually(|| manager.store().state("ud-1") == Some(ConnectionState::Connected)).await;

    conn.inject_error("session rejected");
    eventually(|| {
        manager
            .get_connection_info("ud-1")
            .is_some_and(|info| info.metrics.last_error.is_some())
    })
    .await;
    assert_eq!(manager.store().state("ud-1"), Some(ConnectionState::Error));

    let raised = manager.alerts().evaluate().await;
    let failure = raised
        .iter()
        .find(|a| a.alert_type == AlertType::ConnectionFailure)
        .expect("connection failure alert");
    assert_eq!(failure.connection_id.as_deref(), Some("ud-1"));
    assert!(failure.message.contains("session rejected"));

    assert!(manager.resolve_alert(&failure.id, Some("restarted gateway".to_string())));
    assert!(manager
        .get_active_alerts()
        .iter()
        .all(|a| a.id != failure.id));
    assert_eq!(manager.get_alert_history(1).len(), raised.len());
}
