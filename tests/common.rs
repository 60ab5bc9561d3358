//! Test helper utilities for claude-relay tests
//!
//! This module provides reusable test fixtures and helper functions
//! that are shared across multiple test modules.
//!
//! IMPORTANT: These helpers are test-only and should NEVER be used in production code.

// Allow dead code in test utilities - functions are used across different test files
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use claude_relay::config::EndpointEntry;
use claude_relay::{
    ClientSink, MemoryStore, ProxyRequest, Relay, RelayConfig, RelayResult, RequestRecord,
    UsageStore,
};
use reqwest::header::HeaderMap;
use reqwest::Method;

/// Observable sink: cloneable handle over shared state so tests can watch
/// the response while `handle_request` is still running.
#[derive(Clone, Default)]
pub struct SharedSink {
    state: Arc<Mutex<SinkState>>,
}

#[derive(Default)]
pub struct SinkState {
    pub status: Option<u16>,
    pub headers: Option<HeaderMap>,
    pub body: Vec<u8>,
    pub flushes: usize,
}

impl SharedSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Option<u16> {
        self.state.lock().unwrap().status
    }

    pub fn body(&self) -> Vec<u8> {
        self.state.lock().unwrap().body.clone()
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body()).into_owned()
    }

    pub fn flushes(&self) -> usize {
        self.state.lock().unwrap().flushes
    }
}

#[async_trait]
impl ClientSink for SharedSink {
    async fn start_response(&mut self, status: u16, headers: &HeaderMap) -> RelayResult<()> {
        let mut state = self.state.lock().unwrap();
        state.status = Some(status);
        state.headers = Some(headers.clone());
        Ok(())
    }

    async fn write_chunk(&mut self, chunk: Bytes) -> RelayResult<()> {
        self.state.lock().unwrap().body.extend_from_slice(&chunk);
        Ok(())
    }

    async fn flush(&mut self) -> RelayResult<()> {
        self.state.lock().unwrap().flushes += 1;
        Ok(())
    }
}

/// Endpoint entry pointing at a test server.
pub fn endpoint(name: &str, url: &str, group: &str, group_priority: u32) -> EndpointEntry {
    EndpointEntry {
        name: name.to_string(),
        url: url.to_string(),
        group: Some(group.to_string()),
        group_priority: Some(group_priority),
        ..Default::default()
    }
}

/// Config with fast timings suitable for tests: 3 attempts, 10ms base
/// delay, 20ms tracker flush.
pub fn test_config(endpoints: Vec<EndpointEntry>) -> RelayConfig {
    let mut config = RelayConfig {
        endpoints,
        ..Default::default()
    };
    config.retry.max_attempts = 3;
    config.retry.base_delay = Duration::from_millis(10);
    config.retry.max_delay = Duration::from_millis(100);
    config.retry.multiplier = 2.0;
    config.usage_tracking.flush_interval = Duration::from_millis(20);
    // Keep the background health sweep out of short tests' way.
    config.health.check_interval = Duration::from_secs(3600);
    config.group.cooldown = Duration::from_secs(60);
    config.global_timeout = Duration::from_secs(30);
    config.apply_inheritance();
    config
}

/// Relay over an in-memory store.
pub fn build_relay(config: RelayConfig) -> (Arc<Relay>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let relay = Relay::new(config, store.clone()).expect("relay should start");
    (Arc::new(relay), store)
}

/// POST with a JSON body, the way a messages request arrives.
pub fn post_request(path: &str, body: &str) -> ProxyRequest {
    ProxyRequest {
        method: Method::POST,
        path: path.to_string(),
        query: None,
        headers: HeaderMap::new(),
        body: Bytes::from(body.to_string()),
        client_ip: "10.1.2.3".to_string(),
        user_agent: "relay-tests/1.0".to_string(),
    }
}

/// Poll the store until the record satisfies the predicate (tracker writes
/// are asynchronous). Panics after two seconds.
pub async fn wait_for_record<F>(
    store: &MemoryStore,
    request_id: &str,
    mut predicate: F,
) -> RequestRecord
where
    F: FnMut(&RequestRecord) -> bool,
{
    for _ in 0..200 {
        if let Ok(Some(record)) = store.fetch(request_id).await {
            if predicate(&record) {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("record for {request_id} did not reach the expected state in time");
}
