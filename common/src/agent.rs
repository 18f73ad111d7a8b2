use chrono_tz::Tz;
use log::{debug, info, warn};

use crate::{
    api::ApiClient,
    boot::{self, BootContext, BootInfo},
    channels::{
        CH_MACHINE_STATE, CH_SIGNAL_A, CH_SIGNAL_B, CH_TOKEN_REFRESHED, CMD_CYCLE_RATE,
        CMD_MACHINE_ENABLE, CMD_REBOOT, CMD_REFRESH_TOKEN, CMD_REST_ECHO,
    },
    config::AgentConfig,
    lag::{LagController, LagCycle},
    machine::{InvalidCycleRate, MachineState},
    platform::{publish_or_warn, Clock, PersistentStore, PubSub, Transport},
    token::{local_minute_of_day, TokenManager, TokenState},
    types::{InboundCommand, LagTransport, TelemetryValue},
};

/// Side effects the agent cannot perform itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentAction {
    Restart { delay_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub index: u64,
    pub run_lag: bool,
}

/// Fixed-interval tick source on the monotonic clock. Late polls produce
/// one tick, not a burst of catch-up ticks.
#[derive(Debug, Clone)]
pub struct TickScheduler {
    interval_ms: u64,
    lag_every: u64,
    last_tick_ms: Option<u64>,
    ticks: u64,
}

impl TickScheduler {
    pub fn new(interval_ms: u64, lag_every_ticks: u32) -> Self {
        Self {
            interval_ms,
            lag_every: u64::from(lag_every_ticks.max(1)),
            last_tick_ms: None,
            ticks: 0,
        }
    }

    pub fn start(&mut self, now_ms: u64) {
        self.last_tick_ms = Some(now_ms);
    }

    pub fn poll(&mut self, now_ms: u64) -> Option<Tick> {
        let Some(last) = self.last_tick_ms else {
            self.start(now_ms);
            return None;
        };
        if now_ms.saturating_sub(last) < self.interval_ms {
            return None;
        }

        self.last_tick_ms = Some(now_ms);
        self.ticks += 1;
        Some(Tick {
            index: self.ticks,
            run_lag: self.ticks % self.lag_every == 0,
        })
    }
}

/// Single owner of all agent state. The platform calls [`Agent::poll`] in a
/// loop from one thread and executes the returned actions.
pub struct Agent<T, P, S, C> {
    config: AgentConfig,
    api: ApiClient<T>,
    pubsub: P,
    store: S,
    clock: C,
    tokens: TokenManager,
    machine: MachineState,
    lag: LagController,
    scheduler: TickScheduler,
    timezone: Tz,
    auth_failures: u32,
    booted: bool,
}

impl<T, P, S, C> Agent<T, P, S, C>
where
    T: Transport,
    P: PubSub,
    S: PersistentStore,
    C: Clock,
{
    pub fn new(config: AgentConfig, transport: T, pubsub: P, store: S, clock: C) -> Self {
        let timezone = config.timezone.parse::<Tz>().unwrap_or_else(|err| {
            warn!("unknown timezone {:?} ({err}), using UTC", config.timezone);
            Tz::UTC
        });

        Self {
            api: ApiClient::new(transport, config.api.clone()),
            tokens: TokenManager::new(&config.credential),
            lag: LagController::new(
                config.sensors.pubsub_time.clone(),
                config.sensors.rest_time.clone(),
            ),
            scheduler: TickScheduler::new(
                config.schedule.tick_interval_ms,
                config.schedule.lag_every_ticks,
            ),
            machine: MachineState::default(),
            timezone,
            auth_failures: 0,
            booted: false,
            config,
            pubsub,
            store,
            clock,
        }
    }

    pub fn machine(&self) -> MachineState {
        self.machine
    }

    pub fn token_state(&self) -> TokenState {
        self.tokens.state()
    }

    pub fn is_booted(&self) -> bool {
        self.booted
    }

    /// First credential fetch followed by boot reconciliation. Must finish
    /// before the first tick.
    pub fn boot(&mut self) -> BootInfo {
        self.tokens.load_persisted(&mut self.store);
        self.refresh_credential("boot");

        let outcome = boot::reconcile(&mut BootContext {
            api: &mut self.api,
            pubsub: &mut self.pubsub,
            clock: &self.clock,
            access_token: self.tokens.access_token(),
            device_id: &self.config.device_id,
            sensors: &self.config.sensors,
            credential: &self.config.credential,
            build_marker: self.config.build_marker,
        });
        self.machine = outcome.machine;
        self.note_api_health(outcome.api_reached, outcome.credential_rejected);

        self.scheduler.start(self.clock.monotonic_ms());
        self.booted = true;
        outcome.info
    }

    /// Drains inbound commands, then runs a tick if one is due.
    pub fn poll(&mut self) -> Option<AgentAction> {
        if !self.booted {
            self.boot();
        }

        while let Some(command) = self.pubsub.next_command() {
            if let Some(action) = self.handle_command(command) {
                return Some(action);
            }
        }

        if let Some(tick) = self.scheduler.poll(self.clock.monotonic_ms()) {
            self.run_tick(tick);
        }
        None
    }

    fn handle_command(&mut self, command: InboundCommand) -> Option<AgentAction> {
        match command.channel {
            CMD_MACHINE_ENABLE => match command.as_bool() {
                Some(enabled) => {
                    if self.machine.set_enabled(enabled) {
                        info!("machine switched {}", if enabled { "on" } else { "off" });
                    }
                    self.publish(CH_MACHINE_STATE, if enabled { 1.0 } else { 0.0 }, "bool");
                }
                None => warn!(
                    "machine enable payload {:?} is not a boolean",
                    command.payload
                ),
            },
            CMD_CYCLE_RATE => {
                let result = command
                    .as_f64()
                    .ok_or(InvalidCycleRate(f64::NAN))
                    .and_then(|rate| self.machine.set_cycle_rate(rate));
                match result {
                    Ok(true) => info!("cycle rate set to {}", self.machine.cycle_rate),
                    Ok(false) => debug!("cycle rate unchanged"),
                    Err(err) => warn!("rejected cycle rate {:?}: {err}", command.payload),
                }
            }
            CMD_REFRESH_TOKEN => self.refresh_credential("requested"),
            CMD_REBOOT => {
                info!("reboot requested");
                return Some(AgentAction::Restart {
                    delay_ms: self.config.schedule.restart_delay_ms,
                });
            }
            CMD_REST_ECHO => {
                self.lag
                    .on_rest_echo(&mut self.pubsub, &self.clock, command.as_f64());
            }
            other => debug!("ignoring command on channel {other}"),
        }
        None
    }

    fn run_tick(&mut self, tick: Tick) {
        let started_ms = self.clock.monotonic_ms();

        if tick.run_lag {
            for transport in [LagTransport::PubSub, LagTransport::Rest] {
                let outcome = self.lag.run_cycle(
                    transport,
                    &mut LagCycle {
                        api: &mut self.api,
                        pubsub: &mut self.pubsub,
                        clock: &self.clock,
                        access_token: self.tokens.access_token(),
                        device_id: &self.config.device_id,
                    },
                );
                self.note_api_health(outcome.api_reached, outcome.credential_rejected);
            }
        }

        let now = self.clock.wall_clock_secs();
        if self.machine.enabled {
            match self.machine.signals(now) {
                Some(signals) => {
                    self.publish(CH_SIGNAL_A, signals.a, "");
                    self.publish(CH_SIGNAL_B, signals.b, "");
                }
                None => warn!(
                    "cycle rate {} is out of range, skipping signals",
                    self.machine.cycle_rate
                ),
            }
        }

        if let Some(minute) = local_minute_of_day(now, &self.timezone) {
            if self.tokens.poll_daily_window(minute) {
                self.refresh_credential("daily window");
            }
        }

        let elapsed_ms = self.clock.monotonic_ms().saturating_sub(started_ms);
        let budget_ms = self.config.schedule.tick_budget_ms;
        if elapsed_ms > budget_ms {
            warn!(
                "tick {} took {elapsed_ms} ms, over the {budget_ms} ms budget",
                tick.index
            );
        }
    }

    fn refresh_credential(&mut self, reason: &str) {
        let now = self.clock.wall_clock_secs();
        match self.tokens.refresh(&mut self.api, &mut self.store, now) {
            Ok(refreshed_at) => {
                self.auth_failures = 0;
                self.publish(CH_TOKEN_REFRESHED, refreshed_at as f64, "s");
            }
            Err(err) => warn!("credential refresh ({reason}) failed: {err}"),
        }
    }

    fn note_api_health(&mut self, api_reached: bool, credential_rejected: bool) {
        if credential_rejected {
            self.auth_failures += 1;
            if self.auth_failures >= self.config.credential.auth_failure_threshold {
                warn!(
                    "credential rejected {} times in a row, refreshing early",
                    self.auth_failures
                );
                self.auth_failures = 0;
                self.refresh_credential("credential rejected");
            }
        } else if api_reached {
            self.auth_failures = 0;
        }
    }

    fn publish(&mut self, channel: u8, value: f64, unit: &'static str) {
        let now = self.clock.wall_clock_secs();
        publish_or_warn(&mut self.pubsub, TelemetryValue::new(channel, value, unit, now));
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        channels::{CH_PUBSUB_TIME, CH_REST_ROUNDTRIP},
        config::CredentialConfig,
        platform::MemoryRegion,
        testing::{
            grant_body, ok_json, sample_body, status_only, ManualClock, RecordingPubSub,
            ScriptedTransport,
        },
        token::SNAPSHOT_LEN,
    };

    // 2023-11-14T22:13:20Z
    const NOW: i64 = 1_700_000_000;

    type TestAgent = Agent<ScriptedTransport, RecordingPubSub, MemoryRegion, ManualClock>;

    fn config() -> AgentConfig {
        AgentConfig {
            device_id: "dev1".to_string(),
            credential: CredentialConfig {
                bootstrap_refresh_token: "rt-0".to_string(),
                ..CredentialConfig::default()
            },
            ..AgentConfig::default()
        }
    }

    fn push_boot_script(transport: &mut ScriptedTransport, now: i64, machine_enabled: &str) {
        transport.push_response(grant_body("acc-1", "rt-1"));
        transport.push_response(sample_body(&(now - 30).to_string(), "2023-11-14T22:12:50Z"));
        transport.push_response(sample_body("2", "2023-11-14T22:00:00Z"));
        transport.push_response(sample_body(machine_enabled, "2023-11-14T22:00:00Z"));
        transport.push_response(sample_body("6", "2023-11-14T22:00:00Z"));
        transport.push_response(ok_json("{}"));
    }

    fn booted_agent(now: i64, machine_enabled: &str) -> (TestAgent, ManualClock) {
        let mut transport = ScriptedTransport::default();
        push_boot_script(&mut transport, now, machine_enabled);
        let clock = ManualClock::new(now, 0);
        let mut agent = Agent::new(
            config(),
            transport,
            RecordingPubSub::default(),
            MemoryRegion::new(SNAPSHOT_LEN),
            clock.clone(),
        );

        let info = agent.boot();
        assert_eq!(info.reboot_count, 3);
        assert_eq!(agent.token_state(), TokenState::Valid);
        assert_eq!(agent.api.transport().remaining(), 0);
        (agent, clock)
    }

    fn tick(agent: &mut TestAgent, clock: &ManualClock) -> Option<AgentAction> {
        clock.advance_ms(15_000);
        agent.poll()
    }

    #[test]
    fn boot_publishes_refresh_and_reconciles() {
        let (agent, _) = booted_agent(NOW, "1");

        assert_eq!(agent.pubsub.values(CH_TOKEN_REFRESHED), vec![NOW as f64]);
        assert_eq!(agent.machine(), MachineState::default());
        assert!(agent.is_booted());
    }

    #[test]
    fn lag_runs_every_fourth_tick() {
        let (mut agent, clock) = booted_agent(NOW, "1");

        for _ in 0..3 {
            assert_eq!(tick(&mut agent, &clock), None);
        }
        assert!(agent.pubsub.values(CH_PUBSUB_TIME).is_empty());
        assert_eq!(agent.pubsub.values(CH_SIGNAL_A).len(), 3);

        // Polling again without time passing does nothing.
        agent.poll();
        assert_eq!(agent.pubsub.values(CH_SIGNAL_A).len(), 3);

        tick(&mut agent, &clock);
        assert_eq!(agent.pubsub.values(CH_PUBSUB_TIME), vec![(NOW + 60) as f64]);
        assert_eq!(agent.pubsub.values(CH_SIGNAL_B).len(), 4);
    }

    #[test]
    fn machine_enable_command_starts_signals() {
        let (mut agent, clock) = booted_agent(NOW, "0");
        assert!(!agent.machine().enabled);

        tick(&mut agent, &clock);
        assert!(agent.pubsub.values(CH_SIGNAL_A).is_empty());

        agent
            .pubsub
            .inbound
            .push_back(InboundCommand::new(CMD_MACHINE_ENABLE, "1"));
        agent.poll();
        assert!(agent.machine().enabled);
        assert_eq!(agent.pubsub.values(CH_MACHINE_STATE), vec![0.0, 1.0]);

        tick(&mut agent, &clock);
        assert_eq!(agent.pubsub.values(CH_SIGNAL_A).len(), 1);
        assert_eq!(agent.pubsub.values(CH_SIGNAL_B).len(), 1);
    }

    #[test]
    fn cycle_rate_command_validates_range() {
        let (mut agent, _) = booted_agent(NOW, "1");

        agent.pubsub.inbound.extend([
            InboundCommand::new(CMD_CYCLE_RATE, "9"),
            InboundCommand::new(CMD_CYCLE_RATE, "fast"),
            InboundCommand::new(CMD_CYCLE_RATE, "2"),
        ]);
        agent.poll();

        assert_eq!(agent.machine().cycle_rate, 2);
    }

    #[test]
    fn reboot_command_requests_restart() {
        let (mut agent, _) = booted_agent(NOW, "1");
        agent
            .pubsub
            .inbound
            .push_back(InboundCommand::new(CMD_REBOOT, "1"));

        assert_eq!(
            agent.poll(),
            Some(AgentAction::Restart { delay_ms: 1_000 })
        );
    }

    #[test]
    fn rest_echo_reports_roundtrip() {
        let (mut agent, clock) = booted_agent(NOW, "1");
        // Both echo queries fail, the REST time write succeeds.
        for _ in 0..6 {
            agent.api.transport_mut().push_response(status_only(404));
        }
        agent.api.transport_mut().push_response(ok_json("{}"));

        for _ in 0..4 {
            tick(&mut agent, &clock);
        }
        assert!(agent.lag.roundtrip_armed());

        let sent = (NOW + 60).to_string();
        agent
            .pubsub
            .inbound
            .push_back(InboundCommand::new(CMD_REST_ECHO, sent));
        clock.advance_ms(1_800);
        agent.poll();

        assert_eq!(agent.pubsub.values(CH_REST_ROUNDTRIP), vec![1_800.0]);
    }

    #[test]
    fn force_refresh_command_exchanges_token() {
        let (mut agent, clock) = booted_agent(NOW, "1");
        agent
            .api
            .transport_mut()
            .push_response(grant_body("acc-2", "rt-2"));
        clock.advance_ms(5_000);
        agent
            .pubsub
            .inbound
            .push_back(InboundCommand::new(CMD_REFRESH_TOKEN, ""));

        agent.poll();

        assert_eq!(agent.tokens.access_token(), "acc-2");
        assert_eq!(
            agent.pubsub.values(CH_TOKEN_REFRESHED),
            vec![NOW as f64, (NOW + 5) as f64]
        );
    }

    #[test]
    fn daily_window_refreshes_once() {
        // 2024-01-15T02:59:50Z
        let before_window = 1_705_287_590;
        let (mut agent, clock) = booted_agent(before_window, "0");
        agent
            .api
            .transport_mut()
            .push_response(grant_body("acc-2", "rt-2"));

        tick(&mut agent, &clock);
        tick(&mut agent, &clock);
        tick(&mut agent, &clock);

        assert_eq!(agent.api.transport().requests_containing("POST /oauth/token"), 2);
        assert_eq!(agent.pubsub.values(CH_TOKEN_REFRESHED).len(), 2);
        assert_eq!(agent.tokens.credential().refresh_token, "rt-2");
    }

    #[test]
    fn repeated_rejections_trigger_refresh() {
        let (mut agent, clock) = booted_agent(NOW, "1");
        // Tick 4: both cycles rejected.
        for _ in 0..3 {
            agent.api.transport_mut().push_response(status_only(401));
        }
        // Tick 8: third rejection, then the early refresh.
        agent.api.transport_mut().push_response(status_only(401));
        agent
            .api
            .transport_mut()
            .push_response(grant_body("acc-2", "rt-2"));

        for _ in 0..8 {
            tick(&mut agent, &clock);
        }

        assert_eq!(agent.tokens.access_token(), "acc-2");
        assert_eq!(agent.api.transport().requests_containing("POST /oauth/token"), 2);
        assert!(agent.api.transport().requests_containing("Bearer acc-2") > 0);
        assert_eq!(agent.auth_failures, 0);
    }

    #[test]
    fn failed_boot_refresh_still_reconciles() {
        let clock = ManualClock::new(NOW, 0);
        let mut agent = Agent::new(
            config(),
            ScriptedTransport::default(),
            RecordingPubSub::default(),
            MemoryRegion::new(SNAPSHOT_LEN),
            clock.clone(),
        );

        assert_eq!(agent.poll(), None);
        assert!(agent.is_booted());
        assert_eq!(agent.token_state(), TokenState::NoCredential);
        assert_eq!(agent.pubsub.values(CH_MACHINE_STATE), vec![1.0]);
        assert!(agent.pubsub.values(CH_TOKEN_REFRESHED).is_empty());
    }

    #[test]
    fn scheduler_ticks_on_interval() {
        let mut scheduler = TickScheduler::new(15_000, 4);
        assert_eq!(scheduler.poll(1_000), None);
        assert_eq!(scheduler.poll(15_999), None);

        let ticks: Vec<Tick> = [16_000, 31_000, 46_000, 61_000, 76_000]
            .into_iter()
            .filter_map(|now| scheduler.poll(now))
            .collect();
        assert_eq!(
            ticks.iter().map(|tick| tick.run_lag).collect::<Vec<_>>(),
            vec![false, false, false, true, false]
        );

        // A stalled loop yields one late tick, not a burst.
        assert!(scheduler.poll(200_000).is_some());
        assert_eq!(scheduler.poll(200_001), None);
    }
}
