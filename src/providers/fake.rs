//! 测试用的假提供方，不发网络请求

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{ImageInput, ProviderKind, VisionProvider};
use crate::error::ProviderError;
use crate::models::{DescriptionResult, Prompt};

#[derive(Debug)]
pub struct FakeProvider {
    kind: ProviderKind,
    available: bool,
    concurrency: usize,
    delays: HashMap<String, Duration>,
    failures: HashSet<String>,
    api_key: Mutex<Option<String>>,
    calls: AtomicUsize,
    reloads: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FakeProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            available: true,
            concurrency: kind.default_concurrency(),
            delays: HashMap::new(),
            failures: HashSet::new(),
            api_key: Mutex::new(None),
            calls: AtomicUsize::new(0),
            reloads: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, file_name: &str, delay: Duration) -> Self {
        self.delays.insert(file_name.to_string(), delay);
        self
    }

    pub fn failing_on(mut self, file_name: &str) -> Self {
        self.failures.insert(file_name.to_string());
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    pub fn with_api_key(self, key: &str) -> Self {
        *self.api_key.lock() = Some(key.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    /// 同时进行中的调用数的峰值
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn description_for(file_name: &str) -> String {
        format!("A fake description of {}.", file_name)
    }
}

#[async_trait]
impl VisionProvider for FakeProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    async fn describe(
        &self,
        image: &ImageInput,
        prompt: &Prompt,
        model: &str,
    ) -> Result<DescriptionResult, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.available {
            return Err(ProviderError::Unavailable {
                provider: self.kind.to_string(),
                reason: "fake provider is offline".into(),
            });
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = self
            .delays
            .get(&image.file_name)
            .copied()
            .unwrap_or(Duration::from_millis(5));
        tokio::time::sleep(delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.failures.contains(&image.file_name) {
            return Err(ProviderError::Api {
                status: 500,
                message: format!("fake failure for {}", image.file_name),
            });
        }
        Ok(DescriptionResult::new(
            self.name(),
            model,
            prompt,
            Self::description_for(&image.file_name),
        ))
    }

    fn current_api_key(&self) -> Option<String> {
        self.api_key.lock().clone()
    }

    fn reload_credentials(&self, api_key: Option<String>) {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        *self.api_key.lock() = api_key;
    }

    fn max_concurrency(&self) -> usize {
        self.concurrency
    }
}
