use sb_config::{OutboundOptions, OutboundProviderOptions, SelectorOptions};
use sb_core::cache_store::JsonCacheStore;
use sb_core::outbound::{DialContext, Outbound, OutboundGroup, OutboundManager, Selector};
use sb_core::provider::{DefaultProvider, OutboundProvider};
use sb_core::ProviderError;
use sb_test_utils::{DialLog, MockOutbound, MockSource, MockTester};
use sb_types::Destination;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn options(json: &str) -> OutboundOptions {
    serde_json::from_str(json).unwrap()
}

fn provider_options(tag: &str) -> OutboundProviderOptions {
    OutboundProviderOptions {
        tag: tag.into(),
        ..Default::default()
    }
}

async fn provider(tag: &str, source: Arc<MockSource>) -> Arc<DefaultProvider> {
    DefaultProvider::create(&provider_options(tag), source, Arc::new(MockTester::new(&[])))
        .await
        .unwrap()
}

#[tokio::test]
async fn selector_filters_provider_outbounds_by_port() {
    let source = Arc::new(MockSource::new());
    source.push(vec![
        MockOutbound::new("a").with_port(80).into_arc(),
        MockOutbound::new("b").with_port(8080).into_arc(),
    ]);
    let manager = OutboundManager::new(None);
    manager.register_provider(provider("P", source).await).unwrap();
    manager
        .create(&options(r#"{"type": "selector", "tag": "sel", "uses": ["P"], "ports": ["80"]}"#), None)
        .unwrap();
    manager.start_all().await.unwrap();

    let sel = manager.outbound("sel").unwrap();
    let group = sel.as_group().unwrap();
    assert_eq!(group.all(), vec!["a"]);
    assert_eq!(group.now(), "a");
}

#[tokio::test]
async fn selection_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.json");
    let selector_options = SelectorOptions {
        tag: "sel".into(),
        group: serde_json::from_str(r#"{"outbounds": ["a", "b"]}"#).unwrap(),
        ..Default::default()
    };

    let start = |selected: Option<&'static str>| {
        let path = path.clone();
        let selector_options = selector_options.clone();
        async move {
            let store = Arc::new(JsonCacheStore::open(&path).unwrap());
            let manager = OutboundManager::new(Some(store));
            for tag in ["a", "b"] {
                manager.register(MockOutbound::new(tag).into_arc()).unwrap();
            }
            let selector = Arc::new(Selector::new(&selector_options, Arc::downgrade(&manager)).unwrap());
            manager.register(selector.clone()).unwrap();
            manager.start_all().await.unwrap();
            if let Some(tag) = selected {
                assert!(selector.select_outbound(tag));
            }
            selector.now()
        }
    };

    assert_eq!(start(None).await, "a");
    assert_eq!(start(Some("b")).await, "b");
    assert_eq!(start(None).await, "b");
}

#[tokio::test]
async fn relay_dials_through_every_hop() {
    let log = DialLog::default();
    let manager = OutboundManager::new(None);
    for tag in ["first", "middle", "last"] {
        manager
            .register(MockOutbound::new(tag).with_log(log.clone()).into_arc())
            .unwrap();
    }
    manager
        .create(&options(r#"{"type": "relay", "tag": "chain", "outbounds": ["first", "middle", "last"]}"#), None)
        .unwrap();
    manager.start_all().await.unwrap();

    let chain = manager.outbound("chain").unwrap();
    let mut conn = chain
        .dial(DialContext::default(), &Destination::domain("example.com", 443))
        .await
        .unwrap();
    assert_eq!(*log.lock(), vec!["first", "middle", "last"]);

    conn.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn relay_hop_can_be_a_selector() {
    let log = DialLog::default();
    let manager = OutboundManager::new(None);
    for tag in ["entry", "x", "y"] {
        manager
            .register(MockOutbound::new(tag).with_log(log.clone()).into_arc())
            .unwrap();
    }
    manager
        .create(&options(r#"{"type": "selector", "tag": "pick", "outbounds": ["x", "y"], "default": "y"}"#), None)
        .unwrap();
    manager
        .create(&options(r#"{"type": "relay", "tag": "chain", "outbounds": ["entry", "pick"]}"#), None)
        .unwrap();
    manager.start_all().await.unwrap();

    let chain = manager.outbound("chain").unwrap();
    chain
        .dial(DialContext::default(), &Destination::domain("example.com", 80))
        .await
        .unwrap();
    assert_eq!(*log.lock(), vec!["entry", "y"]);
}

#[tokio::test]
async fn failed_update_keeps_previous_outbounds() {
    let source = Arc::new(MockSource::new());
    source.push(vec![MockOutbound::new("a").into_arc()]);
    let provider = provider("P", source.clone()).await;
    let manager = OutboundManager::new(None);
    manager.register_provider(provider.clone()).unwrap();
    manager
        .create(&options(r#"{"type": "selector", "tag": "sel", "uses": ["P"]}"#), None)
        .unwrap();
    manager.start_all().await.unwrap();

    source.push_error("subscription unreachable");
    let err = provider.update_provider(&manager, true).await.unwrap_err();
    assert!(matches!(err, ProviderError::Fetch(_)));
    let tags: Vec<String> = provider.outbounds().await.iter().map(|o| o.tag()).collect();
    assert_eq!(tags, vec!["a"]);
    assert!(!provider.is_updating());

    source.push(vec![MockOutbound::new("b").into_arc(), MockOutbound::new("c").into_arc()]);
    provider.update_provider(&manager, true).await.unwrap();
    let sel = manager.outbound("sel").unwrap();
    assert_eq!(sel.as_group().unwrap().all(), vec!["b", "c"]);
    assert_eq!(sel.as_group().unwrap().now(), "b");
}
