//! Scripted in-memory collaborators for unit tests.

use std::{
    cell::Cell,
    collections::VecDeque,
    rc::Rc,
    time::Duration,
};

use crate::{
    platform::{
        Clock, Endpoint, PersistentStore, PubSub, PublishError, StoreError, Transport,
        TransportError,
    },
    types::{InboundCommand, TelemetryValue},
};

/// Replays queued responses in order. An exhausted script behaves like an
/// unreachable host.
#[derive(Default)]
pub struct ScriptedTransport {
    responses: VecDeque<Result<Vec<u8>, TransportError>>,
    pub requests: Vec<(Endpoint, String)>,
}

impl ScriptedTransport {
    pub fn push_response(&mut self, raw: impl Into<Vec<u8>>) {
        self.responses.push_back(Ok(raw.into()));
    }

    pub fn push_error(&mut self, err: TransportError) {
        self.responses.push_back(Err(err));
    }

    pub fn remaining(&self) -> usize {
        self.responses.len()
    }

    pub fn requests_containing(&self, fragment: &str) -> usize {
        self.requests
            .iter()
            .filter(|(_, request)| request.contains(fragment))
            .count()
    }
}

impl Transport for ScriptedTransport {
    fn exchange(
        &mut self,
        endpoint: &Endpoint,
        request: &[u8],
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.requests.push((
            endpoint.clone(),
            String::from_utf8_lossy(request).into_owned(),
        ));
        self.responses.pop_front().unwrap_or_else(|| {
            Err(TransportError::Connect {
                host: endpoint.host.clone(),
                port: endpoint.port,
                reason: "script exhausted".to_string(),
            })
        })
    }
}

pub fn ok_json(body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

pub fn status_only(status: u16) -> Vec<u8> {
    format!("HTTP/1.1 {status} Status\r\nContent-Length: 0\r\n\r\n").into_bytes()
}

/// `value` is inserted verbatim, so pass `"\"12\""` for a string value.
pub fn sample_body(value: &str, timestamp: &str) -> Vec<u8> {
    ok_json(&format!(
        r#"{{"v":{value},"ts":"{timestamp}","unit":"s","device_type":"esp32"}}"#
    ))
}

pub fn grant_body(access: &str, refresh: &str) -> Vec<u8> {
    ok_json(&format!(
        r#"{{"access_token":"{access}","refresh_token":"{refresh}","expires_in":86400}}"#
    ))
}

#[derive(Default)]
pub struct RecordingPubSub {
    pub published: Vec<TelemetryValue>,
    pub inbound: VecDeque<InboundCommand>,
    pub fail_publish: bool,
}

impl RecordingPubSub {
    pub fn values(&self, channel: u8) -> Vec<f64> {
        self.published
            .iter()
            .filter(|value| value.channel == channel)
            .map(|value| value.value)
            .collect()
    }
}

impl PubSub for RecordingPubSub {
    fn publish(&mut self, value: &TelemetryValue) -> Result<(), PublishError> {
        if self.fail_publish {
            return Err(PublishError {
                channel: value.channel,
                reason: "broker offline".to_string(),
            });
        }
        self.published.push(value.clone());
        Ok(())
    }

    fn next_command(&mut self) -> Option<InboundCommand> {
        self.inbound.pop_front()
    }
}

/// Clock whose time only moves when a test moves it. Clones share state.
#[derive(Clone, Default)]
pub struct ManualClock {
    wall: Rc<Cell<i64>>,
    mono: Rc<Cell<u64>>,
}

impl ManualClock {
    pub fn new(wall_secs: i64, mono_ms: u64) -> Self {
        Self {
            wall: Rc::new(Cell::new(wall_secs)),
            mono: Rc::new(Cell::new(mono_ms)),
        }
    }

    /// Moves both clocks forward by `ms`.
    pub fn advance_ms(&self, ms: u64) {
        self.mono.set(self.mono.get() + ms);
        self.wall.set(self.wall.get() + i64::try_from(ms / 1_000).unwrap());
    }
}

impl Clock for ManualClock {
    fn wall_clock_secs(&self) -> i64 {
        self.wall.get()
    }

    fn monotonic_ms(&self) -> u64 {
        self.mono.get()
    }
}

/// Store that accepts reads of zeroes and fails every write.
pub struct BrokenStore;

impl PersistentStore for BrokenStore {
    fn get(&mut self, _offset: usize, buf: &mut [u8]) -> Result<(), StoreError> {
        buf.fill(0);
        Ok(())
    }

    fn put(&mut self, _offset: usize, _data: &[u8]) -> Result<(), StoreError> {
        Err(StoreError::Backend("flash worn out".to_string()))
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        Err(StoreError::Backend("flash worn out".to_string()))
    }
}
