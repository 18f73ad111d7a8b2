//! Ingestion lag and REST round-trip measurement.
//!
//! Each transport writes the current wall-clock second to its own channel
//! and, one cycle later, reads back what the service stored. The gap
//! between the local send time and the service's ingestion timestamp is
//! the lag. Only the time of day is compared, so sends and samples on
//! either side of midnight need folding back together.

use chrono::{DateTime, NaiveDateTime, NaiveTime, Timelike};
use log::{debug, info, warn};

use crate::{
    api::{ApiClient, ApiError},
    channels::{CH_PUBSUB_LAG, CH_PUBSUB_TIME, CH_REST_LAG, CH_REST_ROUNDTRIP, CH_REST_TIME},
    platform::{publish_or_warn, Clock, PubSub, Transport},
    types::{LagTransport, RemoteSample, SendRecord, TelemetryValue},
};

pub const SECONDS_PER_DAY: i64 = 86_400;
const WRAP_THRESHOLD_SECS: f64 = 50_000.0;

/// Seconds since midnight of an ingestion timestamp, to the centisecond.
pub fn time_of_day_secs(timestamp: &str) -> Option<f64> {
    let timestamp = timestamp.trim();
    let time = match DateTime::parse_from_rfc3339(timestamp) {
        Ok(parsed) => parsed.naive_utc().time(),
        Err(_) => parse_naive(timestamp)?,
    };

    let centis = (time.nanosecond() / 10_000_000).min(99);
    Some(f64::from(time.num_seconds_from_midnight()) + f64::from(centis) / 100.0)
}

fn parse_naive(timestamp: &str) -> Option<NaiveTime> {
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(timestamp, format).ok())
        .map(|parsed| parsed.time())
}

/// Returns the lag in seconds and whether its sign was flipped.
///
/// The result is never positive. A positive raw difference means the
/// service stamped the value before it was sent, which only happens with
/// a stale echo or clock skew; it is negated and flagged.
pub fn compute_lag(sent_wallclock_secs: i64, remote_time_of_day: f64) -> (f64, bool) {
    let sent_time_of_day = sent_wallclock_secs.rem_euclid(SECONDS_PER_DAY) as f64;
    let mut raw = sent_time_of_day - remote_time_of_day;
    if raw > WRAP_THRESHOLD_SECS {
        raw -= SECONDS_PER_DAY as f64;
    } else if raw < -WRAP_THRESHOLD_SECS {
        // Also fold forward so a stamp from just before midnight stays continuous
        // with a send just after it, rather than only subtracting a day.
        raw += SECONDS_PER_DAY as f64;
    }

    if raw > 0.0 {
        (-raw, true)
    } else {
        (raw, false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    /// Stored value differs from what was sent; the sample predates the send.
    ValueMismatch,
    /// Value differs and the sign had to be flipped.
    StaleEcho,
    /// Value matches but the service clock is behind ours.
    ClockSkew,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LagReading {
    pub seconds: f64,
    pub freshness: Freshness,
}

/// Compares a sample against the send it should reflect. `None` when the
/// sample timestamp cannot be parsed.
pub fn evaluate(record: &SendRecord, sample: &RemoteSample) -> Option<LagReading> {
    let remote = time_of_day_secs(&sample.timestamp)?;
    let (seconds, negated) = compute_lag(record.wallclock_secs, remote);
    let matches = same_value(record.value, sample.value);

    let freshness = match (matches, negated) {
        (true, false) => Freshness::Fresh,
        (false, false) => Freshness::ValueMismatch,
        (false, true) => Freshness::StaleEcho,
        (true, true) => Freshness::ClockSkew,
    };
    Some(LagReading { seconds, freshness })
}

// Sent values are whole wall-clock seconds.
fn same_value(sent: f64, stored: f64) -> bool {
    (sent - stored).abs() < 0.5
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CycleOutcome {
    pub lag: Option<LagReading>,
    pub sent: bool,
    /// Some API call in the cycle got through to the service.
    pub api_reached: bool,
    pub credential_rejected: bool,
}

impl CycleOutcome {
    fn note_api_error(&mut self, err: &ApiError) {
        if matches!(err, ApiError::CredentialExpired(_)) {
            self.credential_rejected = true;
        }
    }
}

/// Everything a lag cycle borrows from the agent.
pub struct LagCycle<'a, T, P, C> {
    pub api: &'a mut ApiClient<T>,
    pub pubsub: &'a mut P,
    pub clock: &'a C,
    pub access_token: &'a str,
    pub device_id: &'a str,
}

#[derive(Debug, Clone, Default)]
struct TransportLag {
    record: Option<SendRecord>,
    roundtrip_armed: bool,
}

pub struct LagController {
    pubsub: TransportLag,
    rest: TransportLag,
    pubsub_sensor: String,
    rest_sensor: String,
}

impl LagController {
    pub fn new(pubsub_sensor: impl Into<String>, rest_sensor: impl Into<String>) -> Self {
        Self {
            pubsub: TransportLag::default(),
            rest: TransportLag::default(),
            pubsub_sensor: pubsub_sensor.into(),
            rest_sensor: rest_sensor.into(),
        }
    }

    pub fn last_send(&self, transport: LagTransport) -> Option<SendRecord> {
        self.state(transport).record
    }

    pub fn roundtrip_armed(&self) -> bool {
        self.rest.roundtrip_armed
    }

    /// Query, compare, publish the lag, then send a fresh value.
    pub fn run_cycle<T, P, C>(
        &mut self,
        transport: LagTransport,
        cx: &mut LagCycle<'_, T, P, C>,
    ) -> CycleOutcome
    where
        T: Transport,
        P: PubSub,
        C: Clock,
    {
        let mut outcome = CycleOutcome::default();
        let sensor = match transport {
            LagTransport::PubSub => self.pubsub_sensor.as_str(),
            LagTransport::Rest => self.rest_sensor.as_str(),
        };

        let sample = match cx.api.query(cx.access_token, cx.device_id, sensor) {
            Ok(sample) => {
                outcome.api_reached = true;
                Some(sample)
            }
            Err(err) => {
                outcome.note_api_error(&err);
                warn!("{} echo query failed: {err}", transport.as_str());
                None
            }
        };

        match (self.state(transport).record, sample) {
            (None, _) => debug!("{} lag skipped, nothing sent yet", transport.as_str()),
            (Some(_), None) => {}
            (Some(record), Some(sample)) => match evaluate(&record, &sample) {
                Some(reading) => {
                    log_reading(transport, &record, &sample, reading);
                    let channel = match transport {
                        LagTransport::PubSub => CH_PUBSUB_LAG,
                        LagTransport::Rest => CH_REST_LAG,
                    };
                    publish_or_warn(
                        cx.pubsub,
                        TelemetryValue::new(channel, reading.seconds, "s", cx.clock.wall_clock_secs()),
                    );
                    outcome.lag = Some(reading);
                }
                None => warn!(
                    "{} sample timestamp {:?} is unparsable",
                    transport.as_str(),
                    sample.timestamp
                ),
            },
        }

        let now = cx.clock.wall_clock_secs();
        let value = now as f64;
        let record = match transport {
            LagTransport::PubSub => {
                match cx
                    .pubsub
                    .publish(&TelemetryValue::new(CH_PUBSUB_TIME, value, "s", now))
                {
                    Ok(()) => Some(SendRecord {
                        value,
                        wallclock_secs: now,
                        monotonic_ms: None,
                    }),
                    Err(err) => {
                        warn!("{err}");
                        None
                    }
                }
            }
            LagTransport::Rest => {
                let sent_ms = cx.clock.monotonic_ms();
                match cx
                    .api
                    .update(cx.access_token, cx.device_id, CH_REST_TIME, value, "num", "s")
                {
                    Ok(()) => {
                        outcome.api_reached = true;
                        Some(SendRecord {
                            value,
                            wallclock_secs: now,
                            monotonic_ms: Some(sent_ms),
                        })
                    }
                    Err(err) => {
                        outcome.note_api_error(&err);
                        warn!("rest time update failed: {err}");
                        None
                    }
                }
            }
        };

        if let Some(record) = record {
            let state = self.state_mut(transport);
            state.record = Some(record);
            state.roundtrip_armed = transport == LagTransport::Rest;
            outcome.sent = true;
        }
        outcome
    }

    /// Handles the service echoing a REST time write back over pub/sub.
    /// Publishes and returns the round-trip time when the echo matches the
    /// armed send.
    pub fn on_rest_echo<P: PubSub, C: Clock>(
        &mut self,
        pubsub: &mut P,
        clock: &C,
        echoed: Option<f64>,
    ) -> Option<u64> {
        if !self.rest.roundtrip_armed {
            debug!("rest echo with no send in flight");
            return None;
        }
        let record = self.rest.record?;
        let sent_ms = record.monotonic_ms?;

        match echoed {
            Some(value) if same_value(record.value, value) => {}
            Some(value) => {
                warn!(
                    "rest echo {value} does not match sent {}, ignoring",
                    record.value
                );
                return None;
            }
            None => {
                warn!("rest echo payload is not numeric, ignoring");
                return None;
            }
        }

        self.rest.roundtrip_armed = false;
        let roundtrip_ms = clock.monotonic_ms().saturating_sub(sent_ms);
        info!("rest round trip {roundtrip_ms} ms");
        publish_or_warn(
            pubsub,
            TelemetryValue::new(
                CH_REST_ROUNDTRIP,
                roundtrip_ms as f64,
                "ms",
                clock.wall_clock_secs(),
            ),
        );
        Some(roundtrip_ms)
    }

    fn state(&self, transport: LagTransport) -> &TransportLag {
        match transport {
            LagTransport::PubSub => &self.pubsub,
            LagTransport::Rest => &self.rest,
        }
    }

    fn state_mut(&mut self, transport: LagTransport) -> &mut TransportLag {
        match transport {
            LagTransport::PubSub => &mut self.pubsub,
            LagTransport::Rest => &mut self.rest,
        }
    }
}

fn log_reading(
    transport: LagTransport,
    record: &SendRecord,
    sample: &RemoteSample,
    reading: LagReading,
) {
    let name = transport.as_str();
    match reading.freshness {
        Freshness::Fresh => info!("{name} lag {:.2} s", reading.seconds),
        Freshness::ValueMismatch => warn!(
            "{name} sample {} is stale (sent {}), lag {:.2} s",
            sample.value, record.value, reading.seconds
        ),
        Freshness::StaleEcho => warn!(
            "{name} sample {} is stale and stamped before the send, lag negated to {:.2} s",
            sample.value, reading.seconds
        ),
        Freshness::ClockSkew => warn!(
            "{name} service clock is behind by {:.2} s, lag negated",
            -reading.seconds
        ),
    }
}
