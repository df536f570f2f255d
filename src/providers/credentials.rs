use parking_lot::RwLock;
use std::time::Duration;
use tracing::{debug, warn};

use super::ProviderKind;
use crate::error::ProviderError;

/// 云端提供方的密钥与 HTTP 客户端，密钥变化时整体替换
#[derive(Debug)]
pub struct KeyedClient {
    provider: ProviderKind,
    timeout: Duration,
    state: RwLock<KeyedState>,
}

#[derive(Debug, Default)]
struct KeyedState {
    api_key: Option<String>,
    client: Option<reqwest::Client>,
    /// 客户端不可用的原因
    reason: Option<String>,
    reloads: u64,
}

impl KeyedClient {
    pub fn new(provider: ProviderKind, api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            provider,
            timeout,
            state: RwLock::new(build_state(provider, api_key, timeout)),
        }
    }

    /// 用新密钥重建客户端
    pub fn reload(&self, api_key: Option<String>) {
        let mut next = build_state(self.provider, api_key, self.timeout);
        let mut state = self.state.write();
        next.reloads = state.reloads + 1;
        *state = next;
        debug!("{} 客户端已重建（第 {} 次）", self.provider, state.reloads);
    }

    pub fn api_key(&self) -> Option<String> {
        self.state.read().api_key.clone()
    }

    pub fn reload_count(&self) -> u64 {
        self.state.read().reloads
    }

    pub fn is_ready(&self) -> bool {
        let state = self.state.read();
        state.api_key.is_some() && state.client.is_some()
    }

    /// 取出当前密钥和客户端；没有时返回 `Unavailable`
    pub fn ready_client(&self) -> Result<(String, reqwest::Client), ProviderError> {
        let state = self.state.read();
        match (&state.api_key, &state.client) {
            (Some(key), Some(client)) => Ok((key.clone(), client.clone())),
            _ => Err(ProviderError::Unavailable {
                provider: self.provider.to_string(),
                reason: state
                    .reason
                    .clone()
                    .unwrap_or_else(|| "客户端未初始化".to_string()),
            }),
        }
    }
}

fn build_state(provider: ProviderKind, api_key: Option<String>, timeout: Duration) -> KeyedState {
    let api_key = api_key
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty());
    let Some(key) = api_key else {
        return KeyedState {
            reason: Some("未配置 API 密钥".to_string()),
            ..Default::default()
        };
    };

    match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => KeyedState {
            api_key: Some(key),
            client: Some(client),
            ..Default::default()
        },
        Err(e) => {
            warn!("⚠️ 构造 {} 客户端失败: {}", provider, e);
            KeyedState {
                api_key: Some(key),
                reason: Some(format!("构造客户端失败: {}", e)),
                ..Default::default()
            }
        }
    }
}
