use sb_config::{DnsOptions, InboundOptions, RouteRuleOptions};
use sb_core::dns::{DnsRouter, DnsTransport};
use sb_core::outbound::OutboundManager;
use sb_core::router::{Router, RuleContext};
use sb_test_utils::{MockDnsTransport, MockOutbound};
use sb_types::{Destination, InboundContext, Network};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn rules(json: &str) -> Vec<RouteRuleOptions> {
    serde_json::from_str(json).unwrap()
}

fn inbound(json: &str) -> InboundOptions {
    serde_json::from_str(json).unwrap()
}

fn manager(tags: &[&str]) -> Arc<OutboundManager> {
    let manager = OutboundManager::new(None);
    for tag in tags {
        manager.register(MockOutbound::new(tag).into_arc()).unwrap();
    }
    manager
}

#[tokio::test]
async fn resolved_private_address_takes_fallback_outbound() {
    let local: Arc<dyn DnsTransport> = Arc::new(MockDnsTransport::new("local").answering(&["10.0.0.5"]));
    let dns_options: DnsOptions = serde_json::from_str(r#"{"servers": [{"tag": "local"}]}"#).unwrap();
    let dns = Arc::new(DnsRouter::new(&dns_options, vec![local], &RuleContext::default()).unwrap());
    let router = Router::new(
        &rules(
            r#"[{"domain_suffix": "corp.test", "outbound": "proxy",
                 "fallback_rules": [{"ip_is_private": true, "outbound": "lan"}]}]"#,
        ),
        "proxy",
        &[inbound(r#"{"tag": "in", "type": "mixed", "domain_strategy": "ipv4_only"}"#)],
        manager(&["proxy", "lan"]),
        Some(dns),
        RuleContext::default(),
    )
    .unwrap();

    let mut metadata = InboundContext::new("in", Network::Tcp);
    metadata.destination = Some(Destination::domain("git.corp.test", 22));
    let result = router.route(&mut metadata).await;
    assert_eq!(result.outbound, "lan");
    assert_eq!(result.matched_rule, Some(0));
    assert_eq!(result.resolved_ips, vec!["10.0.0.5".parse::<IpAddr>().unwrap()]);
    assert_eq!(metadata.outbound, "lan");
}

#[tokio::test]
async fn skip_resolve_keeps_rule_outbound() {
    let local: Arc<dyn DnsTransport> = Arc::new(MockDnsTransport::new("local").answering(&["10.0.0.5"]));
    let dns_options: DnsOptions = serde_json::from_str(r#"{"servers": [{"tag": "local"}]}"#).unwrap();
    let dns = Arc::new(DnsRouter::new(&dns_options, vec![local], &RuleContext::default()).unwrap());
    let router = Router::new(
        &rules(
            r#"[{"domain_suffix": "corp.test", "outbound": "proxy", "skip_resolve": true,
                 "fallback_rules": [{"ip_is_private": true, "outbound": "lan"}]}]"#,
        ),
        "",
        &[],
        manager(&["proxy", "lan"]),
        Some(dns),
        RuleContext::default(),
    )
    .unwrap();

    let mut metadata = InboundContext::new("in", Network::Tcp);
    metadata.destination = Some(Destination::domain("git.corp.test", 22));
    let result = router.route(&mut metadata).await;
    assert_eq!(result.outbound, "proxy");
    assert!(result.resolved_ips.is_empty());
}

#[tokio::test]
async fn sniffed_connection_is_replayed_to_outbound() {
    let mock = Arc::new(MockOutbound::new("web"));
    let manager = manager(&["fin"]);
    manager.register(mock.clone()).unwrap();
    let router = Arc::new(
        Router::new(
            &rules(r#"[{"domain": "sniffed.test", "outbound": "web"}]"#),
            "fin",
            &[inbound(r#"{"tag": "in", "type": "mixed", "sniff": true, "sniff_override_destination": true}"#)],
            manager,
            None,
            RuleContext::default(),
        )
        .unwrap(),
    );

    let (client, mut peer) = tokio::io::duplex(4096);
    let mut metadata = InboundContext::new("in", Network::Tcp);
    metadata.destination = Some(Destination::ip("203.0.113.7".parse().unwrap(), 80));
    let routing = tokio::spawn({
        let router = router.clone();
        async move { router.route_connection(Box::new(client), metadata).await }
    });

    let request = b"GET / HTTP/1.1\r\nHost: sniffed.test\r\n\r\n";
    peer.write_all(request).await.unwrap();
    peer.shutdown().await.unwrap();
    let mut echoed = Vec::new();
    peer.read_to_end(&mut echoed).await.unwrap();
    assert_eq!(echoed, request);

    routing.await.unwrap().unwrap();
    assert_eq!(mock.dials(), 1);
}

#[tokio::test]
async fn rules_can_be_swapped_at_runtime() {
    let router = Router::new(
        &rules(r#"[{"port": 53, "outbound": "a"}]"#),
        "b",
        &[],
        manager(&["a", "b"]),
        None,
        RuleContext::default(),
    )
    .unwrap();
    let mut metadata = InboundContext::new("in", Network::Udp);
    metadata.destination = Some(Destination::ip("1.1.1.1".parse().unwrap(), 53));
    assert_eq!(router.route(&mut metadata.clone()).await.outbound, "a");

    router.update_rules(&rules(r#"[{"port": 53, "outbound": "b"}]"#)).unwrap();
    assert_eq!(router.route(&mut metadata.clone()).await.outbound, "b");

    assert!(router.update_rules(&rules(r#"[{"port": 53}]"#)).is_err());
    assert_eq!(router.rules().len(), 1);
    assert_eq!(router.route(&mut metadata).await.outbound, "b");
}
