use log::{info, warn};

use crate::{
    api::{ApiClient, ApiError},
    channels::{CH_BUILD_MARKER, CH_DOWNTIME, CH_MACHINE_STATE, CH_REBOOT_COUNT},
    config::{CredentialConfig, SensorIds},
    machine::MachineState,
    platform::{publish_or_warn, Clock, PubSub, Transport},
    types::TelemetryValue,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootInfo {
    pub reboot_count: u32,
    /// Unknown when the last-known time is missing or implausible.
    pub downtime_secs: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootOutcome {
    pub machine: MachineState,
    pub info: BootInfo,
    pub api_reached: bool,
    pub credential_rejected: bool,
}

pub struct BootContext<'a, T, P, C> {
    pub api: &'a mut ApiClient<T>,
    pub pubsub: &'a mut P,
    pub clock: &'a C,
    pub access_token: &'a str,
    pub device_id: &'a str,
    pub sensors: &'a SensorIds,
    pub credential: &'a CredentialConfig,
    pub build_marker: f64,
}

/// Restores what the previous run left on the service and announces the boot.
///
/// Every read has a fallback, so this always completes: downtime unknown,
/// reboot counter 0, machine on at the default cycle rate.
pub fn reconcile<T, P, C>(cx: &mut BootContext<'_, T, P, C>) -> BootOutcome
where
    T: Transport,
    P: PubSub,
    C: Clock,
{
    let mut tally = CallTally::default();
    let sensors = cx.sensors;
    let last_known = fetch(cx, &mut tally, "last-known time", &sensors.pubsub_time);
    let previous_count = fetch(cx, &mut tally, "reboot counter", &sensors.reboot_count);
    let enabled = fetch(cx, &mut tally, "machine state", &sensors.machine_enabled);
    let cycle_rate = fetch(cx, &mut tally, "cycle rate", &sensors.cycle_rate);

    let now = cx.clock.wall_clock_secs();
    let downtime_secs = last_known
        .filter(|value| value.is_finite())
        .map(|value| value as i64)
        .filter(|last| cx.credential.is_sane_epoch(*last) && *last <= now)
        .map(|last| now - last);
    let reboot_count = previous_count
        .filter(|value| value.is_finite() && *value >= 0.0)
        .map_or(0, |value| (value as u32).saturating_add(1));
    let machine = MachineState::restored(enabled, cycle_rate);
    let info = BootInfo {
        reboot_count,
        downtime_secs,
    };

    info!(
        "boot #{reboot_count}, downtime {downtime_secs:?} s, machine {} at rate {}",
        if machine.enabled { "on" } else { "off" },
        machine.cycle_rate
    );

    publish_or_warn(
        cx.pubsub,
        TelemetryValue::new(CH_BUILD_MARKER, cx.build_marker, "", now),
    );
    if let Some(downtime) = downtime_secs {
        publish_or_warn(
            cx.pubsub,
            TelemetryValue::new(CH_DOWNTIME, downtime as f64, "s", now),
        );
    }
    publish_or_warn(
        cx.pubsub,
        TelemetryValue::new(CH_REBOOT_COUNT, f64::from(reboot_count), "count", now),
    );
    let stored = cx.api.update(
        cx.access_token,
        cx.device_id,
        CH_REBOOT_COUNT,
        f64::from(reboot_count),
        "num",
        "count",
    );
    if let Err(err) = tally.record(stored) {
        warn!("storing reboot counter failed: {err}");
    }
    publish_or_warn(
        cx.pubsub,
        TelemetryValue::new(
            CH_MACHINE_STATE,
            if machine.enabled { 1.0 } else { 0.0 },
            "bool",
            now,
        ),
    );

    BootOutcome {
        machine,
        info,
        api_reached: tally.api_reached,
        credential_rejected: tally.credential_rejected,
    }
}

#[derive(Default)]
struct CallTally {
    api_reached: bool,
    credential_rejected: bool,
}

impl CallTally {
    fn record<R>(&mut self, result: Result<R, ApiError>) -> Result<R, ApiError> {
        match &result {
            Ok(_) => self.api_reached = true,
            Err(ApiError::CredentialExpired(_)) => self.credential_rejected = true,
            Err(_) => {}
        }
        result
    }
}

fn fetch<T: Transport, P, C>(
    cx: &mut BootContext<'_, T, P, C>,
    tally: &mut CallTally,
    what: &str,
    sensor_id: &str,
) -> Option<f64> {
    let result = cx.api.query(cx.access_token, cx.device_id, sensor_id);
    match tally.record(result) {
        Ok(sample) => Some(sample.value),
        Err(err) => {
            warn!("boot read of {what} failed, using fallback: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config::ApiConfig,
        testing::{ok_json, sample_body, status_only, ManualClock, RecordingPubSub, ScriptedTransport},
    };

    const NOW: i64 = 1_700_000_000;

    fn run(
        transport: ScriptedTransport,
        now: i64,
    ) -> (BootOutcome, RecordingPubSub, ApiClient<ScriptedTransport>) {
        let mut api = ApiClient::new(transport, ApiConfig::default());
        let mut pubsub = RecordingPubSub::default();
        let clock = ManualClock::new(now, 0);
        let sensors = SensorIds::default();
        let credential = CredentialConfig::default();

        let outcome = reconcile(&mut BootContext {
            api: &mut api,
            pubsub: &mut pubsub,
            clock: &clock,
            access_token: "acc",
            device_id: "dev1",
            sensors: &sensors,
            credential: &credential,
            build_marker: 3.0,
        });
        (outcome, pubsub, api)
    }

    fn not_found_three_times(transport: &mut ScriptedTransport) {
        for _ in 0..3 {
            transport.push_response(status_only(404));
        }
    }

    #[test]
    fn first_boot_uses_fallbacks() {
        let (outcome, pubsub, api) = run(ScriptedTransport::default(), NOW);

        assert_eq!(
            outcome.info,
            BootInfo {
                reboot_count: 0,
                downtime_secs: None,
            }
        );
        assert_eq!(outcome.machine, MachineState::default());
        assert!(!outcome.api_reached);
        assert_eq!(pubsub.values(CH_BUILD_MARKER), vec![3.0]);
        assert!(pubsub.values(CH_DOWNTIME).is_empty());
        assert_eq!(pubsub.values(CH_REBOOT_COUNT), vec![0.0]);
        assert_eq!(pubsub.values(CH_MACHINE_STATE), vec![1.0]);
        // Four reads and one write, three attempts each.
        assert_eq!(api.transport().requests.len(), 15);
    }

    #[test]
    fn restores_previous_run() {
        let mut transport = ScriptedTransport::default();
        transport.push_response(sample_body(&(NOW - 120).to_string(), "2023-11-14T22:11:20Z"));
        transport.push_response(sample_body("\"4\"", "2023-11-14T22:00:00Z"));
        transport.push_response(sample_body("0", "2023-11-14T22:00:00Z"));
        transport.push_response(sample_body("3", "2023-11-14T22:00:00Z"));
        transport.push_response(ok_json("{}"));

        let (outcome, pubsub, api) = run(transport, NOW);

        assert_eq!(
            outcome.info,
            BootInfo {
                reboot_count: 5,
                downtime_secs: Some(120),
            }
        );
        assert_eq!(
            outcome.machine,
            MachineState {
                enabled: false,
                cycle_rate: 3,
            }
        );
        assert_eq!(pubsub.values(CH_DOWNTIME), vec![120.0]);
        assert_eq!(pubsub.values(CH_REBOOT_COUNT), vec![5.0]);
        assert_eq!(pubsub.values(CH_MACHINE_STATE), vec![0.0]);
        assert_eq!(api.transport().requests_containing("\"channel\":4"), 1);
        assert_eq!(api.transport().requests_containing("\"value\":5.0"), 1);
    }

    #[test]
    fn implausible_last_known_time_hides_downtime() {
        let mut transport = ScriptedTransport::default();
        transport.push_response(sample_body(&(NOW + 600).to_string(), "2023-11-14T22:00:00Z"));
        not_found_three_times(&mut transport);
        not_found_three_times(&mut transport);
        transport.push_response(sample_body("42", "2023-11-14T22:00:00Z"));

        let (outcome, pubsub, _) = run(transport, NOW);

        assert_eq!(outcome.info.downtime_secs, None);
        assert!(pubsub.values(CH_DOWNTIME).is_empty());
        assert_eq!(outcome.machine, MachineState::default());

        let mut transport = ScriptedTransport::default();
        transport.push_response(sample_body("1000", "2023-11-14T22:00:00Z"));
        let (outcome, _, _) = run(transport, NOW);
        assert_eq!(outcome.info.downtime_secs, None);
    }

    #[test]
    fn rejected_credential_is_reported() {
        let mut transport = ScriptedTransport::default();
        for _ in 0..5 {
            transport.push_response(status_only(401));
        }

        let (outcome, _, api) = run(transport, NOW);

        assert!(outcome.credential_rejected);
        assert!(!outcome.api_reached);
        assert_eq!(api.transport().requests.len(), 5);
    }
}
