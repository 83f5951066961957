//! Scripted provider source and URL tester
use async_trait::async_trait;
use parking_lot::Mutex;
use sb_core::outbound::Outbound;
use sb_core::provider::{ProviderContent, ProviderSource, SubscriptionInfo, UrlTester};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

type Fetch = Result<Vec<Arc<dyn Outbound>>, String>;

/// Returns queued fetch results in order; an empty queue yields no outbounds.
#[derive(Default)]
pub struct MockSource {
    queue: Mutex<VecDeque<Fetch>>,
    fetches: AtomicUsize,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, outbounds: Vec<Arc<dyn Outbound>>) -> &Self {
        self.queue.lock().push_back(Ok(outbounds));
        self
    }

    pub fn push_error(&self, message: &str) -> &Self {
        self.queue.lock().push_back(Err(message.to_string()));
        self
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderSource for MockSource {
    async fn fetch(&self, _force: bool) -> anyhow::Result<ProviderContent> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let next = self.queue.lock().pop_front();
        let outbounds = match next {
            Some(Ok(outbounds)) => outbounds,
            Some(Err(message)) => anyhow::bail!(message),
            None => Vec::new(),
        };
        Ok(ProviderContent {
            outbounds,
            info: SubscriptionInfo::default(),
            updated_at: SystemTime::now(),
        })
    }
}

/// Reports a fixed delay per outbound tag; unknown tags fail.
#[derive(Default)]
pub struct MockTester {
    delays: Mutex<HashMap<String, u16>>,
    calls: AtomicUsize,
}

impl MockTester {
    pub fn new(delays: &[(&str, u16)]) -> Self {
        Self {
            delays: Mutex::new(delays.iter().map(|(t, d)| (t.to_string(), *d)).collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UrlTester for MockTester {
    async fn url_test(&self, _link: &str, outbound: Arc<dyn Outbound>) -> anyhow::Result<u16> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let tag = outbound.tag();
        self.delays
            .lock()
            .get(&tag)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("{tag}: unreachable"))
    }
}
