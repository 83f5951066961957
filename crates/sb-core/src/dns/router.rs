//! DNS router: rule dispatch, transport racing and fallback re-query.
//! DNS 路由：规则分派、传输竞速与回退重查
//!
//! # Strategic Workflow / 战略工作流
//! ```text
//! query ─► cache ─► match rule (from index+1) ─► race transports ─► consolidate
//!                       ▲                                               │
//!                       └──────── rejected / empty (lookup) ◄───────────┤
//!                                                                       ▼
//!                                            fallback chain ─► re-query once
//! ```
//!
//! Every transport in a matched rule is queried concurrently, each call under
//! [`DEFAULT_TIMEOUT`]. The first outcome that is not a timeout decides; when
//! all calls time out the last timeout is reported. Remaining calls are
//! aborted and drained before the router moves on.
//!
//! Only the answer the loop settles on is committed to the shared cache.
//! FakeIP answers are never cached.

use super::{
    empty_response, fqdn_to_domain, is_address_query, message_addresses, DnsClient,
    DnsClientOptions, DnsQueryOptions, DnsTransport, ResponseChecker, ReverseMapping,
    DEFAULT_TIMEOUT,
};
use crate::error::{DnsError, RuleError};
use crate::router::rule::{DnsRule, RuleContext};
use anyhow::Context;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::rdata::PTR;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use parking_lot::RwLock;
use sb_config::{DnsOptions, DnsRuleOptions};
use sb_types::{DomainStrategy, InboundContext};
use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Transports picked for one attempt, with the rule that picked them.
struct Route<'a> {
    index: Option<usize>,
    rule: Option<&'a DnsRule>,
    transports: Vec<Arc<dyn DnsTransport>>,
}

pub struct DnsRouter {
    transports: HashMap<String, Arc<dyn DnsTransport>>,
    strategies: HashMap<String, DomainStrategy>,
    default_transport: Arc<dyn DnsTransport>,
    default_strategy: DomainStrategy,
    client_subnet: Option<IpAddr>,
    client: Arc<DnsClient>,
    rules: RwLock<Arc<Vec<DnsRule>>>,
    reverse: Option<ReverseMapping>,
}

impl DnsRouter {
    /// Build the router over externally constructed transports.
    ///
    /// The default transport is `final`, or the first configured server.
    pub fn new(
        options: &DnsOptions,
        transports: Vec<Arc<dyn DnsTransport>>,
        ctx: &RuleContext,
    ) -> anyhow::Result<Self> {
        let default_tag = if options.final_server.is_empty() {
            options
                .servers
                .first()
                .map(|s| s.tag.clone())
                .or_else(|| transports.first().map(|t| t.tag().to_string()))
                .unwrap_or_default()
        } else {
            options.final_server.clone()
        };
        let transports: HashMap<String, Arc<dyn DnsTransport>> = transports
            .into_iter()
            .map(|t| (t.tag().to_string(), t))
            .collect();
        let default_transport = transports
            .get(&default_tag)
            .cloned()
            .ok_or_else(|| DnsError::TransportNotFound(default_tag.clone()))
            .context("default dns server")?;
        let strategies = options
            .servers
            .iter()
            .map(|s| (s.tag.clone(), s.strategy.unwrap_or(options.strategy)))
            .collect();
        let rules = build_rules(&options.rules, ctx).context("dns rules")?;
        tracing::debug!(
            target: "sb_core::dns",
            transports = transports.len(),
            rules = rules.len(),
            default = %default_tag,
            "dns router initialized"
        );
        Ok(Self {
            transports,
            strategies,
            default_transport,
            default_strategy: options.strategy,
            client_subnet: options.client_subnet,
            client: Arc::new(DnsClient::new(DnsClientOptions::from(options))),
            rules: RwLock::new(Arc::new(rules)),
            reverse: options.reverse_mapping.then(ReverseMapping::default),
        })
    }

    pub fn transport(&self, tag: &str) -> Option<Arc<dyn DnsTransport>> {
        self.transports.get(tag).cloned()
    }

    pub fn default_transport(&self) -> &Arc<dyn DnsTransport> {
        &self.default_transport
    }

    /// Strategy for `tag`, or the global default for unconfigured transports.
    pub fn transport_strategy(&self, tag: &str) -> DomainStrategy {
        self.strategies.get(tag).copied().unwrap_or(self.default_strategy)
    }

    /// Replace the rule list. In-flight queries finish on the old list.
    pub fn update_rules(&self, options: &[DnsRuleOptions], ctx: &RuleContext) -> Result<(), RuleError> {
        let rules = build_rules(options, ctx)?;
        tracing::info!(target: "sb_core::dns", rules = rules.len(), "dns rules updated");
        *self.rules.write() = Arc::new(rules);
        Ok(())
    }

    pub fn clear_cache(&self) {
        self.client.clear_cache();
        tracing::info!(target: "sb_core::dns", "cleared cache");
    }

    pub fn lookup_reverse_mapping(&self, ip: IpAddr) -> Option<String> {
        self.reverse.as_ref()?.query(ip)
    }

    /// Find the next usable rule after `after`, or the default transport.
    fn select<'a>(
        &self,
        rules: &'a [DnsRule],
        m: &mut InboundContext,
        allow_fakeip: bool,
        after: Option<usize>,
    ) -> Route<'a> {
        let start = after.map_or(0, |i| i + 1);
        for (index, rule) in rules.iter().enumerate().skip(start) {
            if rule.rule().is_disabled() {
                continue;
            }
            m.reset_rule_cache();
            if !rule.matches(m) {
                continue;
            }
            let mut transports = Vec::with_capacity(rule.servers().len());
            for tag in rule.servers() {
                match self.transports.get(tag) {
                    Some(t) => transports.push(t.clone()),
                    None => {
                        tracing::error!(target: "sb_core::dns", %tag, "transport not found");
                        break;
                    }
                }
            }
            if transports.len() != rule.servers().len() {
                continue;
            }
            if !allow_fakeip && transports.iter().any(|t| t.is_fakeip()) {
                continue;
            }
            tracing::debug!(
                target: "sb_core::dns",
                rule_index = index,
                rule = %rule,
                servers = ?rule.servers(),
                "match rule"
            );
            return Route {
                index: Some(index),
                rule: Some(rule),
                transports,
            };
        }
        Route {
            index: None,
            rule: None,
            transports: vec![self.default_transport.clone()],
        }
    }

    /// Request options merged with rule overrides and the transport strategy.
    fn query_options(&self, request: DnsQueryOptions, route: &Route<'_>) -> DnsQueryOptions {
        let mut options = request;
        if options.strategy == DomainStrategy::AsIs {
            options.strategy = route
                .transports
                .first()
                .map(|t| self.transport_strategy(t.tag()))
                .unwrap_or(self.default_strategy);
        }
        if route.transports.iter().any(|t| t.is_fakeip()) {
            options.disable_cache = true;
        }
        if let Some(rule) = route.rule {
            options.disable_cache |= rule.disable_cache();
            if rule.rewrite_ttl().is_some() {
                options.rewrite_ttl = rule.rewrite_ttl();
            }
            if rule.client_subnet().is_some() {
                options.client_subnet = rule.client_subnet();
            }
        }
        if options.client_subnet.is_none() {
            options.client_subnet = self.client_subnet;
        }
        options
    }

    /// Answer validator for rules that limit accepted addresses.
    fn checker(
        rules: &Arc<Vec<DnsRule>>,
        route: &Route<'_>,
        m: &InboundContext,
    ) -> Option<ResponseChecker> {
        let index = route.index?;
        if !route.rule?.with_address_limit() {
            return None;
        }
        let rules = rules.clone();
        let base = m.clone();
        Some(Arc::new(move |addrs: &[IpAddr]| {
            let mut m = base.clone();
            m.destination_addresses = addrs.to_vec();
            rules.get(index).is_some_and(|rule| rule.match_address_limit(&mut m))
        }))
    }

    /// Run `call` on every transport and consolidate the outcomes.
    async fn race<T, F, Fut>(
        transports: &[Arc<dyn DnsTransport>],
        call: F,
    ) -> Result<(Arc<dyn DnsTransport>, T), DnsError>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn DnsTransport>) -> Fut,
        Fut: Future<Output = Result<T, DnsError>> + Send + 'static,
    {
        let mut set = JoinSet::new();
        for transport in transports {
            let fut = call(transport.clone());
            let transport = transport.clone();
            set.spawn(async move {
                let result = tokio::time::timeout(DEFAULT_TIMEOUT, fut)
                    .await
                    .unwrap_or(Err(DnsError::DeadlineExceeded));
                (transport, result)
            });
        }

        let mut decided = None;
        let mut last = Err(DnsError::DeadlineExceeded);
        while let Some(joined) = set.join_next().await {
            let (transport, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    last = Err(DnsError::Transport(e.to_string()));
                    continue;
                }
            };
            match result {
                Err(e) if e.is_timeout() => {
                    tracing::debug!(target: "sb_core::dns", transport = %transport.tag(), "exchange timeout");
                    last = Err(e);
                }
                Err(e) => {
                    decided = Some(Err(e));
                    break;
                }
                Ok(v) => {
                    decided = Some(Ok((transport, v)));
                    break;
                }
            }
        }
        set.abort_all();
        while set.join_next().await.is_some() {}
        decided.unwrap_or(last)
    }

    /// Route and exchange a raw message.
    ///
    /// FakeIP transports may answer. A rejected response moves on to the next
    /// rule; any other failure is final.
    pub async fn exchange(
        &self,
        message: &Message,
        metadata: &InboundContext,
        request: DnsQueryOptions,
    ) -> Result<Message, DnsError> {
        let question = message.queries().first().ok_or(DnsError::NoQuestion)?;
        if let Some(response) = self.answer_ptr(message) {
            return Ok(response);
        }
        if let Some(response) = self.client.exchange_cache(message) {
            return Ok(response);
        }

        let mut m = metadata.clone();
        m.domain = fqdn_to_domain(question.name());
        m.query_type = u16::from(question.query_type());
        m.ip_version = match question.query_type() {
            RecordType::A => 4,
            RecordType::AAAA => 6,
            _ => 0,
        };
        let rules = self.rules.read().clone();
        let mut after = None;
        let (transport, response, options) = loop {
            let route = self.select(&rules, &mut m, true, after);
            let options = self.query_options(request, &route);
            let checker = if is_address_query(message) {
                Self::checker(&rules, &route, &m)
            } else {
                None
            };
            let result = Self::race(&route.transports, |transport| {
                let client = self.client.clone();
                let message = message.clone();
                let checker = checker.clone();
                async move {
                    client
                        .exchange(transport.as_ref(), &message, &options, checker.as_deref())
                        .await
                }
            })
            .await;
            let (transport, response) = match result {
                Ok(answered) => answered,
                Err(e) if e.is_rejected() && route.index.is_some() => {
                    log_rejected(&e, &m.domain);
                    after = route.index;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(target: "sb_core::dns", domain = %m.domain, error = %e, "exchange failed");
                    return Err(e);
                }
            };
            let addrs = message_addresses(&response);
            if addrs.is_empty() {
                break (transport, response, options);
            }
            match self.follow_fallback(&route, &addrs) {
                Fallback::None => break (transport, response, options),
                Fallback::NextRule => {
                    after = route.index;
                    continue;
                }
                Fallback::Requery(fallback) => {
                    let options = self.query_options(request, &Route {
                        index: None,
                        rule: route.rule,
                        transports: vec![fallback.clone()],
                    });
                    let response = self.client.exchange(fallback.as_ref(), message, &options, None).await?;
                    break (fallback, response, options);
                }
            }
        };

        if !options.disable_cache {
            self.client.commit_exchange(transport.tag(), message);
        }
        if !transport.is_fakeip() && !response.answers().is_empty() {
            if let Some(reverse) = &self.reverse {
                reverse.save(&response);
            }
        }
        Ok(response)
    }

    /// Route and resolve `domain` to addresses.
    ///
    /// FakeIP transports are skipped. Under a matched rule, a rejected answer
    /// or a name error (an empty answer counts as one) moves on to the next
    /// rule; any other failure is returned. The default transport's outcome
    /// is final.
    pub async fn lookup(
        &self,
        domain: &str,
        metadata: &InboundContext,
        request: DnsQueryOptions,
    ) -> Result<Vec<IpAddr>, DnsError> {
        let domain = domain.trim_end_matches('.');
        if let Ok(ip) = domain.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let cache_strategy = if request.strategy == DomainStrategy::AsIs {
            self.default_strategy
        } else {
            request.strategy
        };
        if !request.disable_cache {
            if let Some(addrs) = self.client.lookup_cache(domain, cache_strategy) {
                if !addrs.is_empty() {
                    tracing::debug!(target: "sb_core::dns", %domain, "lookup cached");
                    return Ok(addrs);
                }
            }
        }

        let mut m = metadata.clone();
        m.domain = domain.to_string();
        m.query_type = 0;
        m.ip_version = 0;
        let rules = self.rules.read().clone();
        let mut after = None;
        loop {
            let route = self.select(&rules, &mut m, false, after);
            let options = self.query_options(request, &route);
            let checker = Self::checker(&rules, &route, &m);
            let result = Self::race(&route.transports, |transport| {
                let client = self.client.clone();
                let domain = domain.to_string();
                let checker = checker.clone();
                async move {
                    client
                        .lookup(transport.as_ref(), &domain, &options, checker.as_deref())
                        .await
                }
            })
            .await
            .and_then(|(transport, addrs)| non_empty(addrs).map(|addrs| (transport, addrs)));

            let (transport, addrs) = match result {
                Ok(answered) => answered,
                Err(e) if route.index.is_some() && e.is_rejected() => {
                    log_rejected(&e, domain);
                    after = route.index;
                    continue;
                }
                Err(DnsError::NameError) if route.index.is_some() => {
                    tracing::error!(target: "sb_core::dns", %domain, "lookup failed: empty result");
                    after = route.index;
                    continue;
                }
                Err(e) => {
                    tracing::error!(target: "sb_core::dns", %domain, error = %e, "lookup failed");
                    return Err(e);
                }
            };
            let (transport, addrs, options) = match self.follow_fallback(&route, &addrs) {
                Fallback::None => (transport, addrs, options),
                Fallback::NextRule => {
                    after = route.index;
                    continue;
                }
                Fallback::Requery(fallback) if fallback.is_fakeip() => (transport, addrs, options),
                Fallback::Requery(fallback) => {
                    let options = self.query_options(request, &Route {
                        index: None,
                        rule: route.rule,
                        transports: vec![fallback.clone()],
                    });
                    let addrs = self.client.lookup(fallback.as_ref(), domain, &options, None).await;
                    (fallback, non_empty(addrs?)?, options)
                }
            };
            if !options.disable_cache {
                self.client.commit_lookup(transport.tag(), domain, options.strategy);
            }
            tracing::info!(target: "sb_core::dns", %domain, addresses = ?addrs, "lookup succeed");
            return Ok(addrs);
        }
    }

    /// Lookup with the configured default strategy and empty metadata.
    pub async fn lookup_default(&self, domain: &str) -> Result<Vec<IpAddr>, DnsError> {
        self.lookup(domain, &InboundContext::default(), DnsQueryOptions::default())
            .await
    }

    fn follow_fallback(&self, route: &Route<'_>, addrs: &[IpAddr]) -> Fallback {
        let Some(rule) = route.rule.filter(|r| r.has_fallback()) else {
            return Fallback::None;
        };
        let mut m = InboundContext::for_dns_fallback(addrs.to_vec());
        let mut after = None;
        while let Some(hit) = rule.match_fallback(&mut m, after) {
            tracing::debug!(
                target: "sb_core::dns",
                fallback_index = hit.index,
                fallback = %hit.description,
                "match fallback rule"
            );
            if hit.server.is_empty() {
                return Fallback::NextRule;
            }
            if let Some(t) = self.transports.get(&hit.server) {
                return Fallback::Requery(t.clone());
            }
            tracing::error!(target: "sb_core::dns", tag = %hit.server, "fallback transport not found");
            after = Some(hit.index);
        }
        Fallback::None
    }

    /// PTR question answered from the reverse mapping.
    fn answer_ptr(&self, message: &Message) -> Option<Message> {
        let reverse = self.reverse.as_ref()?;
        let question = message.queries().first()?;
        if question.query_type() != RecordType::PTR {
            return None;
        }
        let ip = ptr_to_ip(&question.name().to_ascii())?;
        let domain = reverse.query(ip)?;
        let mut target = Name::from_str(&domain).ok()?;
        target.set_fqdn(true);
        let mut response = empty_response(message);
        response.set_response_code(ResponseCode::NoError);
        response.add_answer(Record::from_rdata(
            question.name().clone(),
            super::DEFAULT_TTL,
            RData::PTR(PTR(target)),
        ));
        Some(response)
    }
}

enum Fallback {
    None,
    NextRule,
    Requery(Arc<dyn DnsTransport>),
}

fn build_rules(options: &[DnsRuleOptions], ctx: &RuleContext) -> Result<Vec<DnsRule>, RuleError> {
    options.iter().map(|o| DnsRule::new(o, ctx)).collect()
}

fn non_empty(addrs: Vec<IpAddr>) -> Result<Vec<IpAddr>, DnsError> {
    if addrs.is_empty() {
        Err(DnsError::NameError)
    } else {
        Ok(addrs)
    }
}

fn log_rejected(e: &DnsError, domain: &str) {
    if *e == DnsError::ResponseRejectedCached {
        tracing::trace!(target: "sb_core::dns", %domain, "response rejected (cached)");
    } else {
        tracing::debug!(target: "sb_core::dns", %domain, "response rejected");
    }
}

/// Address encoded by an `in-addr.arpa` / `ip6.arpa` name.
fn ptr_to_ip(name: &str) -> Option<IpAddr> {
    let name = name.trim_end_matches('.').to_ascii_lowercase();
    if let Some(rest) = name.strip_suffix(".in-addr.arpa") {
        let mut octets = [0u8; 4];
        let labels: Vec<&str> = rest.split('.').collect();
        if labels.len() != 4 {
            return None;
        }
        for (i, label) in labels.iter().rev().enumerate() {
            octets[i] = label.parse().ok()?;
        }
        return Some(IpAddr::V4(Ipv4Addr::from(octets)));
    }
    let rest = name.strip_suffix(".ip6.arpa")?;
    let nibbles: Vec<&str> = rest.split('.').collect();
    if nibbles.len() != 32 {
        return None;
    }
    let mut value: u128 = 0;
    for nibble in nibbles.iter().rev() {
        if nibble.len() != 1 {
            return None;
        }
        value = (value << 4) | u128::from_str_radix(nibble, 16).ok()?;
    }
    Some(IpAddr::V6(Ipv6Addr::from(value)))
}
