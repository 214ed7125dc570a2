//! Stream Client Integration Tests
//!
//! Drives a full client against an in-memory exchange: subscribe on demand,
//! cache hits, idle eviction, reconnect, and private channel signing.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde_json::json;
use sha2::Sha256;

use common::{MemoryConnector, ticker_frame, test_config};
use ir_stream_client::infrastructure::independent_reserve::auth::Credentials;
use ir_stream_client::{ClientError, ErrorKind, StreamClient};

#[tokio::test]
async fn concurrent_first_queries_share_one_subscription() {
    let (connector, mut sessions) = MemoryConnector::new();
    let client = Arc::new(StreamClient::start(&test_config(), connector).unwrap());
    let mut server = sessions.next().await;

    let queries: Vec<_> = (0..8)
        .map(|_| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.get_ticker("xbt", "aud").await })
        })
        .collect();

    assert_eq!(
        server.next_control().await,
        json!({"m": "subscribe", "n": "ticker-xbtaud"})
    );
    server.send(&ticker_frame("ticker-xbtaud", "Xbt", "Aud", 95_000.0));

    for query in queries {
        let snapshot = query.await.unwrap().unwrap();
        assert_eq!(snapshot.data.last_price, Some(Decimal::from(95_000)));
    }

    assert!(server.try_control().is_none());
    assert_eq!(client.cache_stats().misses, 1);

    Arc::try_unwrap(client).unwrap().shutdown().await;
}

#[tokio::test]
async fn repeated_query_is_served_from_cache() {
    let (connector, mut sessions) = MemoryConnector::new();
    let client = StreamClient::start(&test_config(), connector).unwrap();
    let mut server = sessions.next().await;

    let (first, ()) = tokio::join!(client.get_ticker("btc", "usd"), async {
        server.next_control().await;
        server.send(&ticker_frame("ticker-xbtusd", "Xbt", "Usd", 60_000.0));
    });
    let first = first.unwrap();
    let second = client.get_ticker("BTC", "USD").await.unwrap();

    assert_eq!(first.channel, "ticker-xbtusd");
    assert_eq!(second.received_at, first.received_at);
    assert_eq!(second.data, first.data);
    assert!(server.try_control().is_none());
    assert_eq!(client.cache_stats().hits, 1);

    client.shutdown().await;
}

#[tokio::test]
async fn idle_channel_is_unsubscribed_then_resubscribed_on_demand() {
    let mut config = test_config();
    config.cache.first_message_timeout = Duration::from_millis(250);
    config.cache.idle_timeout = Duration::from_millis(300);
    config.cache.sweep_interval = Duration::from_millis(50);

    let (connector, mut sessions) = MemoryConnector::new();
    let client = StreamClient::start(&config, connector).unwrap();
    let mut server = sessions.next().await;

    let (result, ()) = tokio::join!(client.get_order_book("eth", "aud"), async {
        server.next_control().await;
        server.send(&json!({
            "n": "orderbook-ethaud",
            "o": {
                "PrimaryCurrencyCode": "Eth",
                "SecondaryCurrencyCode": "Aud",
                "BuyOrders": [{"Price": 3000, "Volume": 1}],
                "SellOrders": []
            }
        }));
    });
    result.unwrap();

    assert_eq!(
        server.next_control().await,
        json!({"m": "unsubscribe", "n": "orderbook-ethaud"})
    );
    assert!(client.subscriptions().is_empty());
    assert_eq!(client.cache_stats().evictions, 1);

    let (result, request) = tokio::join!(client.get_order_book("eth", "aud"), async {
        let request = server.next_control().await;
        server.send(&json!({
            "n": "orderbook-ethaud",
            "o": {
                "PrimaryCurrencyCode": "Eth",
                "SecondaryCurrencyCode": "Aud",
                "BuyOrders": [],
                "SellOrders": [{"Price": 3010, "Volume": 2}]
            }
        }));
        request
    });
    assert_eq!(request, json!({"m": "subscribe", "n": "orderbook-ethaud"}));
    assert_eq!(result.unwrap().data.sell_orders.len(), 1);

    client.shutdown().await;
}

#[tokio::test]
async fn reconnect_replays_subscriptions_and_keeps_cached_data() {
    let (connector, mut sessions) = MemoryConnector::new();
    let client = StreamClient::start(&test_config(), connector).unwrap();
    let mut server = sessions.next().await;

    let (before, ()) = tokio::join!(client.get_ticker("xbt", "aud"), async {
        server.next_control().await;
        server.send(&ticker_frame("ticker-xbtaud", "Xbt", "Aud", 95_000.0));
    });
    let before = before.unwrap();

    server.disconnect();

    // Stale data stays readable while the feed is down.
    let during = client.get_ticker("xbt", "aud").await.unwrap();
    assert_eq!(during.received_at, before.received_at);

    let mut server = sessions.next().await;
    assert_eq!(
        server.next_control().await,
        json!({"m": "subscribe", "n": "ticker-xbtaud"})
    );
    assert!(client.reconnect_count() >= 1);

    server.send(&ticker_frame("ticker-xbtaud", "Xbt", "Aud", 96_000.0));
    tokio::time::timeout(common::WAIT, async {
        loop {
            let snapshot = client.get_ticker("xbt", "aud").await.unwrap();
            if snapshot.data.last_price == Some(Decimal::from(96_000)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    client.shutdown().await;
}

#[tokio::test]
async fn balance_without_credentials_fails_without_touching_the_wire() {
    let (connector, mut sessions) = MemoryConnector::new();
    let client = StreamClient::start(&test_config(), connector).unwrap();
    let mut server = sessions.next().await;

    let err = client.get_balance("aud").await.unwrap_err();

    assert_eq!(err.kind, ErrorKind::AuthenticationFailure);
    assert!(server.try_control().is_none());
    assert!(client.subscriptions().is_empty());

    client.shutdown().await;
}

#[tokio::test]
async fn balance_subscription_is_signed() {
    let mut config = test_config();
    config.credentials = Some(Credentials::new("test-key", "test-secret").unwrap());

    let (connector, mut sessions) = MemoryConnector::new();
    let client = StreamClient::start(&config, connector).unwrap();
    let mut server = sessions.next().await;

    let (result, request) = tokio::join!(client.get_balance("AUD"), async {
        let request = server.next_control().await;
        server.send(&json!({
            "n": "balance-aud",
            "o": {"CurrencyCode": "Aud", "AvailableBalance": "100.5", "TotalBalance": "120"}
        }));
        request
    });

    assert_eq!(request["m"], "subscribe");
    assert_eq!(request["n"], "balance-aud");
    assert_eq!(request["apiKey"], "test-key");

    let nonce = request["nonce"].as_u64().unwrap();
    let mut mac = Hmac::<Sha256>::new_from_slice(b"test-secret").unwrap();
    mac.update(format!("{nonce}test-keybalance-aud").as_bytes());
    let expected = hex::encode_upper(mac.finalize().into_bytes());
    assert_eq!(request["signature"], expected.as_str());

    let snapshot = result.unwrap();
    assert_eq!(snapshot.data.available_balance, Some(Decimal::new(1005, 1)));

    client.shutdown().await;
}

#[tokio::test]
async fn refused_private_channel_is_authentication_failure() {
    let mut config = test_config();
    config.credentials = Some(Credentials::new("test-key", "wrong-secret").unwrap());

    let (connector, mut sessions) = MemoryConnector::new();
    let client = StreamClient::start(&config, connector).unwrap();
    let mut server = sessions.next().await;

    let (result, ()) = tokio::join!(client.get_balance("usd"), async {
        server.next_control().await;
        server.send(&json!({"e": "error", "n": "balance-usd", "o": "Invalid signature"}));
    });

    let err = result.unwrap_err();
    assert_eq!(err.kind, ErrorKind::AuthenticationFailure);
    assert!(err.message.contains("Invalid signature"));
    assert!(client.subscriptions().is_empty());

    client.shutdown().await;
}

#[tokio::test]
async fn silent_channel_times_out_but_stays_subscribed() {
    let mut config = test_config();
    config.cache.first_message_timeout = Duration::from_millis(100);

    let (connector, mut sessions) = MemoryConnector::new();
    let client = StreamClient::start(&config, connector).unwrap();
    let mut server = sessions.next().await;

    let err = client.get_recent_trades("sol", "usd").await.unwrap_err();

    assert_eq!(err.kind, ErrorKind::Timeout);
    assert_eq!(
        server.next_control().await,
        json!({"m": "subscribe", "n": "recenttrades-solusd"})
    );
    assert_eq!(
        client
            .subscriptions()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
        vec![client.symbols().recent_trades("sol", "usd").unwrap().to_string()]
    );

    client.shutdown().await;
}

#[tokio::test]
async fn unknown_currency_is_invalid_argument() {
    let (connector, _sessions) = MemoryConnector::new();
    let client = StreamClient::start(&test_config(), connector).unwrap();

    let err = client.get_ticker("xbt", "eur").await.unwrap_err();

    assert_eq!(err.kind, ErrorKind::InvalidArgument);
    assert!(client.subscriptions().is_empty());

    client.shutdown().await;
}

#[tokio::test]
async fn pinned_channels_subscribe_at_start() {
    let mut config = test_config();
    config.cache.pinned_channels = vec!["ticker-xbtaud".to_string()];

    let (connector, mut sessions) = MemoryConnector::new();
    let client = StreamClient::start(&config, connector).unwrap();
    let mut server = sessions.next().await;

    assert_eq!(
        server.next_control().await,
        json!({"m": "subscribe", "n": "ticker-xbtaud"})
    );

    client.shutdown().await;
}

#[tokio::test]
async fn pinned_private_channel_without_credentials_is_rejected() {
    let mut config = test_config();
    config.cache.pinned_channels = vec!["balance-aud".to_string()];
    let (connector, _sessions) = MemoryConnector::new();

    assert!(StreamClient::start(&config, connector).is_err());
}

#[tokio::test]
async fn idle_timeout_shorter_than_first_message_wait_is_rejected() {
    let mut config = test_config();
    config.cache.idle_timeout = Duration::from_millis(200);
    let (connector, _sessions) = MemoryConnector::new();

    assert!(matches!(
        StreamClient::start(&config, connector),
        Err(ClientError::Config(_))
    ));
}

#[tokio::test]
async fn shutdown_closes_the_socket() {
    let (connector, mut sessions) = MemoryConnector::new();
    let client = StreamClient::start(&test_config(), connector).unwrap();
    let mut server = sessions.next().await;

    client.shutdown().await;

    server.expect_close().await;
}
