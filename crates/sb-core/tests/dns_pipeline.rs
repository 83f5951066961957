use hickory_proto::rr::RecordType;
use sb_config::DnsOptions;
use sb_core::dns::{new_query, DnsQueryOptions, DnsRouter, DnsTransport};
use sb_core::router::RuleContext;
use sb_core::DnsError;
use sb_test_utils::MockDnsTransport;
use sb_types::{DomainStrategy, InboundContext, Network};
use std::net::IpAddr;
use std::sync::Arc;

fn ips(addrs: &[&str]) -> Vec<IpAddr> {
    addrs.iter().map(|a| a.parse().unwrap()).collect()
}

fn v4() -> DnsQueryOptions {
    DnsQueryOptions::with_strategy(DomainStrategy::Ipv4Only)
}

fn dns_router(json: &str, transports: &[&Arc<MockDnsTransport>]) -> DnsRouter {
    let options: DnsOptions = serde_json::from_str(json).unwrap();
    let transports: Vec<Arc<dyn DnsTransport>> = transports
        .iter()
        .map(|t| Arc::clone(t) as Arc<dyn DnsTransport>)
        .collect();
    DnsRouter::new(&options, transports, &RuleContext::default()).unwrap()
}

#[tokio::test]
async fn private_answer_falls_back_to_upstream() {
    let doh = Arc::new(MockDnsTransport::new("doh").answering(&["10.0.0.1"]));
    let upstream = Arc::new(MockDnsTransport::new("upstream").answering(&["93.184.216.34"]));
    let options: DnsOptions = serde_json::from_str(
        r#"{
            "servers": [{"tag": "doh"}, {"tag": "upstream"}],
            "rules": [{
                "domain": "internal.example",
                "server": "doh",
                "fallback_rules": [{"ip_is_private": true, "server": "upstream"}]
            }],
            "final": "upstream"
        }"#,
    )
    .unwrap();
    let transports: Vec<Arc<dyn DnsTransport>> = vec![doh.clone(), upstream.clone()];
    let router = DnsRouter::new(&options, transports, &RuleContext::default()).unwrap();

    let metadata = InboundContext::new("in", Network::Tcp);
    let addrs = router.lookup("internal.example", &metadata, v4()).await.unwrap();
    assert_eq!(addrs, ips(&["93.184.216.34"]));
    assert_eq!(doh.calls(), 1);
    assert_eq!(upstream.calls(), 1);
}

#[tokio::test]
async fn empty_answer_moves_to_next_rule() {
    let empty = Arc::new(MockDnsTransport::new("empty"));
    let full = Arc::new(MockDnsTransport::new("full").answering(&["192.0.2.10"]));
    let other = Arc::new(MockDnsTransport::new("other").answering(&["192.0.2.99"]));
    let options: DnsOptions = serde_json::from_str(
        r#"{
            "servers": [{"tag": "empty"}, {"tag": "full"}, {"tag": "other"}],
            "rules": [
                {"domain": "a.test", "server": "empty"},
                {"domain_suffix": "test", "server": "full"}
            ],
            "final": "other"
        }"#,
    )
    .unwrap();
    let transports: Vec<Arc<dyn DnsTransport>> = vec![empty.clone(), full, other.clone()];
    let router = DnsRouter::new(&options, transports, &RuleContext::default()).unwrap();

    let addrs = router.lookup("a.test", &InboundContext::default(), v4()).await.unwrap();
    assert_eq!(addrs, ips(&["192.0.2.10"]));
    assert_eq!(empty.calls(), 1);
    assert_eq!(other.calls(), 0);
}

#[tokio::test]
async fn default_transport_result_is_final() {
    let only = Arc::new(MockDnsTransport::new("only"));
    let options: DnsOptions = serde_json::from_str(r#"{"servers": [{"tag": "only"}]}"#).unwrap();
    let router = DnsRouter::new(&options, vec![only as Arc<dyn DnsTransport>], &RuleContext::default()).unwrap();
    assert!(router.lookup("nowhere.test", &InboundContext::default(), v4()).await.is_err());
}

#[tokio::test]
async fn fallback_answer_is_the_cached_answer() {
    let doh = Arc::new(MockDnsTransport::new("doh").answering(&["10.0.0.1"]));
    let upstream = Arc::new(MockDnsTransport::new("upstream").answering(&["93.184.216.34"]));
    let router = dns_router(
        r#"{
            "servers": [{"tag": "doh"}, {"tag": "upstream"}],
            "rules": [{
                "domain": "internal.example",
                "server": "doh",
                "fallback_rules": [{"ip_is_private": true, "server": "upstream"}]
            }]
        }"#,
        &[&doh, &upstream],
    );

    for _ in 0..2 {
        let addrs = router.lookup("internal.example", &InboundContext::default(), v4()).await.unwrap();
        assert_eq!(addrs, ips(&["93.184.216.34"]));
    }
    assert_eq!(doh.calls(), 1);
    assert_eq!(upstream.calls(), 1);

    let query = new_query("internal.example", RecordType::A).unwrap();
    let response = router.exchange(&query, &InboundContext::default(), v4()).await.unwrap();
    assert_eq!(sb_core::dns::message_addresses(&response), ips(&["93.184.216.34"]));
    assert_eq!(upstream.calls(), 1);
}

#[tokio::test]
async fn fallback_skips_unknown_server() {
    let doh = Arc::new(MockDnsTransport::new("doh").answering(&["10.0.0.1"]));
    let upstream = Arc::new(MockDnsTransport::new("upstream").answering(&["93.184.216.34"]));
    let router = dns_router(
        r#"{
            "servers": [{"tag": "doh"}, {"tag": "upstream"}],
            "rules": [{
                "domain": "internal.example",
                "server": "doh",
                "fallback_rules": [
                    {"ip_is_private": true, "server": "gone"},
                    {"match_all": true, "server": "upstream"}
                ]
            }],
            "final": "doh"
        }"#,
        &[&doh, &upstream],
    );

    let addrs = router.lookup("internal.example", &InboundContext::default(), v4()).await.unwrap();
    assert_eq!(addrs, ips(&["93.184.216.34"]));
    assert_eq!(upstream.calls(), 1);
}

#[tokio::test]
async fn answer_without_addresses_keeps_rule_server() {
    let doh = Arc::new(MockDnsTransport::new("doh").answering(&["10.0.0.1"]));
    let upstream = Arc::new(MockDnsTransport::new("upstream").answering(&["93.184.216.34"]));
    let router = dns_router(
        r#"{
            "servers": [{"tag": "doh"}, {"tag": "upstream"}],
            "rules": [{
                "domain": "internal.example",
                "server": "doh",
                "fallback_rules": [{"match_all": true, "server": "upstream"}]
            }]
        }"#,
        &[&doh, &upstream],
    );

    let query = new_query("internal.example", RecordType::TXT).unwrap();
    let response = router
        .exchange(&query, &InboundContext::default(), DnsQueryOptions::default())
        .await
        .unwrap();
    assert!(response.answers().is_empty());
    assert_eq!(doh.calls(), 1);
    assert_eq!(upstream.calls(), 0);
}

#[tokio::test]
async fn transport_failure_under_rule_is_final() {
    let broken = Arc::new(MockDnsTransport::new("broken").failing(DnsError::Transport("connection refused".into())));
    let backup = Arc::new(MockDnsTransport::new("backup").answering(&["192.0.2.5"]));
    let router = dns_router(
        r#"{
            "servers": [{"tag": "broken"}, {"tag": "backup"}],
            "rules": [
                {"domain": "a.test", "server": "broken"},
                {"domain_suffix": "test", "server": "backup"}
            ],
            "final": "backup"
        }"#,
        &[&broken, &backup],
    );

    let err = router.lookup("a.test", &InboundContext::default(), v4()).await.unwrap_err();
    assert_eq!(err, DnsError::Transport("connection refused".into()));
    assert_eq!(broken.calls(), 1);
    assert_eq!(backup.calls(), 0);
}
