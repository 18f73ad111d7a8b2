use core::convert::TryInto;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{gpio::AnyOutputPin, modem::Modem, prelude::Peripherals},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::{EspSntp, SyncStatus},
    tls::{Config as TlsConfig, EspTls},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};

use lagwatch_common::{
    command_filter, decode_command, telemetry_topic, Agent, AgentAction, AgentConfig, Clock,
    Endpoint, InboundCommand, MemoryRegion, NetworkConfig, PersistentStore, PubSub, PublishError,
    StoreError, SystemClock, TelemetryValue, Transport, TransportError, SNAPSHOT_LEN,
};

const NVS_NAMESPACE: &str = "lagwatch";
const NVS_CONFIG_KEY: &str = "config_json";
const NVS_CREDENTIAL_KEY: &str = "credential";
// A single remote call can block for up to three 15 s attempts.
const WATCHDOG_TIMEOUT_SEC: u32 = 300;
const WIFI_RESTART_GRACE_MS: u64 = 300_000;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const SNTP_SYNC_TIMEOUT: Duration = Duration::from_secs(60);
const STATUS_LED_PIN: i32 = 48;
const LED_FAST_BLINK_MS: u64 = 200;
const LED_SLOW_BLINK_MS: u64 = 900;
const AGENT_IDLE_MS: u64 = 100;
const SUPERVISOR_PERIOD_MS: u64 = 200;
const MAX_RESPONSE_BYTES: usize = 16 * 1024;

type DeviceAgent = Agent<EspTlsTransport, MqttPubSub, NvsRegion, SystemClock>;

struct StatusLed {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    lit: bool,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

#[derive(Clone)]
struct CommandRoute {
    prefix: String,
    device_id: String,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut config = nvs_store.load_config().unwrap_or_else(|err| {
        warn!("failed to load config from NVS: {err:#}");
        AgentConfig::default()
    });
    ensure_build_defaults(&mut config);
    config.sanitize();

    info!(
        "NVS config loaded: device `{}`, ssid `{}`, mqtt `{}:{}`, api `{}:{}`",
        config.device_id,
        config.network.wifi_ssid,
        config.network.mqtt_host,
        config.network.mqtt_port,
        config.api.host,
        config.api.port,
    );

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = match connect_wifi(modem, sys_loop, nvs_partition, &config.network) {
        Ok(wifi) => wifi,
        Err(err) => {
            warn!("wifi startup failed ({err:#}); restarting device");
            restart_after(Duration::from_secs(10));
        }
    };
    disable_wifi_power_save();

    let sntp = EspSntp::new_default().context("failed to start SNTP")?;
    wait_for_time_sync(&sntp, config.credential.min_valid_epoch);

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let mqtt_connected = Arc::new(AtomicBool::new(false));
    let route = CommandRoute {
        prefix: config.network.topic_prefix.clone(),
        device_id: config.device_id.clone(),
    };
    let (mqtt_client, mqtt_conn) = create_mqtt_client(&config)?;
    let mqtt_client = Arc::new(Mutex::new(mqtt_client));
    let (command_tx, command_rx) = mpsc::channel();
    spawn_mqtt_receiver(
        mqtt_conn,
        mqtt_client.clone(),
        route.clone(),
        command_tx,
        mqtt_connected.clone(),
    )?;

    let region = NvsRegion::open(nvs_store, SNAPSHOT_LEN)?;
    let pubsub = MqttPubSub {
        client: mqtt_client,
        route,
        commands: command_rx,
    };
    let agent = Agent::new(config, EspTlsTransport, pubsub, region, SystemClock);
    spawn_agent_loop(agent)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _sntp = sntp;

    supervise(&mqtt_connected)
}

fn ensure_build_defaults(config: &mut AgentConfig) {
    if config.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            config.network.wifi_ssid = ssid.to_string();
        }
    }

    if config.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            config.network.wifi_pass = pass.to_string();
        }
    }

    if config.credential.bootstrap_refresh_token.is_empty() {
        if let Some(token) = option_env!("LAGWATCH_REFRESH_TOKEN") {
            config.credential.bootstrap_refresh_token = token.to_string();
        }
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    if network.wifi_ssid.is_empty() {
        return Err(anyhow!("wifi ssid is not configured"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if let Some(err) = last_err {
        let _ = wifi.disconnect();
        let _ = wifi.stop();
        return Err(anyhow!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err:#}"
        ));
    }

    drop(wifi);
    Ok(esp_wifi)
}

/// Blocks until SNTP has set a plausible wall clock, or gives up after a
/// bounded wait. Boot reads downtime from the wall clock, so it should not
/// run on the 1970 epoch.
fn wait_for_time_sync(sntp: &EspSntp<'static>, min_valid_epoch: i64) {
    let started = Instant::now();
    loop {
        let now = SystemClock.wall_clock_secs();
        if sntp.get_sync_status() == SyncStatus::Completed && now >= min_valid_epoch {
            info!("time synced: {}", Utc::now().to_rfc3339());
            return;
        }
        if started.elapsed() >= SNTP_SYNC_TIMEOUT {
            warn!(
                "SNTP not synced after {}s; continuing with epoch {now}",
                SNTP_SYNC_TIMEOUT.as_secs()
            );
            return;
        }
        thread::sleep(Duration::from_millis(500));
    }
}

fn create_mqtt_client(
    config: &AgentConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let network = &config.network;
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);
    let client_id = format!("lagwatch-{}", config.device_id);

    let conf = MqttClientConfiguration {
        client_id: Some(client_id.as_str()),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
    route: CommandRoute,
    commands: mpsc::Sender<InboundCommand>,
    connected: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let filter = command_filter(&route.prefix, &route.device_id);
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            // The event borrows the client's internal buffer; subscribing
            // while it is alive would block the MQTT task.
            let subscribe = match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("mqtt connected");
                        connected.store(true, Ordering::Relaxed);
                        true
                    }
                    EventPayload::Disconnected => {
                        warn!("mqtt disconnected");
                        connected.store(false, Ordering::Relaxed);
                        false
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } => {
                        // Only complete MQTT payloads are processed.
                        if matches!(details, Details::Complete) {
                            forward_command(&route, topic, data, &commands);
                        }
                        false
                    }
                    _ => false,
                },
                Err(err) => {
                    connected.store(false, Ordering::Relaxed);
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                    false
                }
            };

            if subscribe {
                let mut client = mqtt.lock().unwrap_or_else(PoisonError::into_inner);
                if let Err(err) = client.subscribe(&filter, QoS::AtMostOnce) {
                    warn!("mqtt subscribe to {filter} failed: {err:?}");
                }
            }
        })
        .context("failed to spawn mqtt receiver thread")?;
    Ok(())
}

fn forward_command(
    route: &CommandRoute,
    topic: &str,
    data: &[u8],
    commands: &mpsc::Sender<InboundCommand>,
) {
    match decode_command(&route.prefix, &route.device_id, topic, data) {
        Ok(Some(command)) => {
            if commands.send(command).is_err() {
                warn!("agent loop gone, dropping command from {topic}");
            }
        }
        Ok(None) => debug!("ignoring publish on {topic}"),
        Err(err) => warn!("dropping command on {topic}: {err}"),
    }
}

fn spawn_agent_loop(mut agent: DeviceAgent) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("agent".into())
        .stack_size(16 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register agent loop with watchdog: {err:#}");
            }

            feed_watchdog();
            let info = agent.boot();
            info!(
                "agent booted: reboot #{}, downtime {:?} s",
                info.reboot_count, info.downtime_secs
            );

            loop {
                feed_watchdog();
                match agent.poll() {
                    Some(AgentAction::Restart { delay_ms }) => {
                        info!("restart requested, rebooting in {delay_ms} ms");
                        restart_after(Duration::from_millis(delay_ms));
                    }
                    None => thread::sleep(Duration::from_millis(AGENT_IDLE_MS)),
                }
            }
        })
        .context("failed to spawn agent thread")?;
    Ok(())
}

/// Drives the status LED and restarts the device after a long WiFi outage.
fn supervise(mqtt_connected: &AtomicBool) -> anyhow::Result<()> {
    if let Err(err) = add_current_task_to_watchdog() {
        warn!("failed to register supervisor with watchdog: {err:#}");
    }

    let mut status_led = init_status_led(STATUS_LED_PIN);
    let mut wifi_disconnected_since_ms: Option<u64> = None;

    loop {
        feed_watchdog();
        let now_ms = SystemClock.monotonic_ms();
        let wifi_connected = is_wifi_station_connected();
        update_status_led(
            &mut status_led,
            wifi_connected,
            mqtt_connected.load(Ordering::Relaxed),
            now_ms,
        );

        if wifi_connected {
            wifi_disconnected_since_ms = None;
        } else if let Some(disconnected_since_ms) = wifi_disconnected_since_ms {
            if now_ms.saturating_sub(disconnected_since_ms) >= WIFI_RESTART_GRACE_MS {
                warn!(
                    "wifi disconnected for {}s; restarting device for recovery",
                    WIFI_RESTART_GRACE_MS / 1000
                );
                restart_after(Duration::from_millis(100));
            }
        } else {
            wifi_disconnected_since_ms = Some(now_ms);
        }

        thread::sleep(Duration::from_millis(SUPERVISOR_PERIOD_MS));
    }
}

#[allow(unreachable_code)]
fn restart_after(delay: Duration) -> ! {
    thread::sleep(delay);
    unsafe { esp_idf_svc::sys::esp_restart() };
    loop {
        thread::sleep(Duration::from_secs(1));
    }
}

struct MqttPubSub {
    client: Arc<Mutex<EspMqttClient<'static>>>,
    route: CommandRoute,
    commands: mpsc::Receiver<InboundCommand>,
}

impl PubSub for MqttPubSub {
    fn publish(&mut self, value: &TelemetryValue) -> Result<(), PublishError> {
        let failed = |reason: String| PublishError {
            channel: value.channel,
            reason,
        };
        let topic = telemetry_topic(&self.route.prefix, &self.route.device_id, value.channel);
        let payload = serde_json::to_vec(value).map_err(|err| failed(err.to_string()))?;

        let mut client = self.client.lock().unwrap_or_else(PoisonError::into_inner);
        // Enqueue instead of publish so a dead broker never stalls a tick.
        client
            .enqueue(&topic, QoS::AtMostOnce, false, &payload)
            .map(|_| ())
            .map_err(|err| failed(format!("{err:?}")))
    }

    fn next_command(&mut self) -> Option<InboundCommand> {
        self.commands.try_recv().ok()
    }
}

/// HTTP transport over esp-tls, with certificates from the IDF bundle.
struct EspTlsTransport;

impl Transport for EspTlsTransport {
    fn exchange(
        &mut self,
        endpoint: &Endpoint,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let connect_error = |reason: String| TransportError::Connect {
            host: endpoint.host.clone(),
            port: endpoint.port,
            reason,
        };
        let started = Instant::now();
        let io_error = |reason: String| {
            if started.elapsed() >= timeout {
                TransportError::Timeout(timeout)
            } else {
                TransportError::Io(reason)
            }
        };

        let mut tls = EspTls::new().map_err(|err| connect_error(format!("{err:?}")))?;
        let config = TlsConfig {
            common_name: Some(endpoint.host.as_str()),
            use_crt_bundle_attach: true,
            timeout_ms: timeout.as_millis().try_into().unwrap_or(u32::MAX),
            is_plain_tcp: !endpoint.tls,
            ..Default::default()
        };
        tls.connect(&endpoint.host, endpoint.port, &config)
            .map_err(|err| connect_error(format!("{err:?}")))?;

        tls.write_all(request)
            .map_err(|err| io_error(format!("write failed: {err:?}")))?;

        let mut response = Vec::new();
        let mut chunk = [0_u8; 512];
        loop {
            // esp-tls applies `timeout_ms` per read, so a trickling peer is cut off here.
            if started.elapsed() >= timeout {
                return Err(TransportError::Timeout(timeout));
            }
            match tls.read(&mut chunk) {
                Ok(0) => break,
                Ok(read) => {
                    response.extend_from_slice(&chunk[..read]);
                    if response.len() > MAX_RESPONSE_BYTES {
                        return Err(TransportError::Io(format!(
                            "response exceeds {MAX_RESPONSE_BYTES} bytes"
                        )));
                    }
                }
                Err(err) if !response.is_empty() && started.elapsed() < timeout => {
                    debug!("treating read error after {} bytes as close: {err:?}", response.len());
                    break;
                }
                Err(err) => return Err(io_error(format!("read failed: {err:?}"))),
            }
        }
        Ok(response)
    }
}

impl NvsStore {
    fn load_config(&self) -> anyhow::Result<AgentConfig> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_CONFIG_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<AgentConfig>(value)?),
            None => Ok(AgentConfig::default()),
        }
    }

    fn load_blob(&self, key: &str, len: usize) -> anyhow::Result<Vec<u8>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; len];

        Ok(nvs
            .get_raw(key, &mut buffer)?
            .map(<[u8]>::to_vec)
            .unwrap_or_default())
    }

    fn save_blob(&self, key: &str, data: &[u8]) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        nvs.set_raw(key, data)?;
        Ok(())
    }
}

/// Credential region stored as one NVS blob.
struct NvsRegion {
    store: NvsStore,
    region: MemoryRegion,
}

impl NvsRegion {
    fn open(store: NvsStore, len: usize) -> anyhow::Result<Self> {
        let bytes = store
            .load_blob(NVS_CREDENTIAL_KEY, len)
            .context("failed to read credential blob")?;
        Ok(Self {
            store,
            region: MemoryRegion::from_bytes(bytes, len),
        })
    }
}

impl PersistentStore for NvsRegion {
    fn get(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), StoreError> {
        self.region.get(offset, buf)
    }

    fn put(&mut self, offset: usize, data: &[u8]) -> Result<(), StoreError> {
        self.region.put(offset, data)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if !self.region.is_dirty() {
            return Ok(());
        }
        self.store
            .save_blob(NVS_CREDENTIAL_KEY, self.region.as_bytes())
            .map_err(|err| StoreError::Backend(format!("{err:#}")))?;
        self.region.mark_clean();
        Ok(())
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK {
        return Ok(());
    }
    if rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        // Already initialised by the IDF with its own timeout.
        let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_reconfigure(&config) };
        if rc == esp_idf_svc::sys::ESP_OK {
            return Ok(());
        }
        return Err(anyhow!("esp_task_wdt_reconfigure failed with code {}", rc));
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn init_status_led(pin: i32) -> Option<StatusLed> {
    let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) };
    match driver {
        Ok(mut pin) => {
            let _ = pin.set_low();
            Some(StatusLed { pin, lit: false })
        }
        Err(err) => {
            warn!("status LED unavailable on GPIO{pin}: {err}");
            None
        }
    }
}

/// Fast blink without WiFi, slow blink without MQTT, solid when healthy.
fn update_status_led(
    status_led: &mut Option<StatusLed>,
    wifi_connected: bool,
    mqtt_connected: bool,
    now_ms: u64,
) {
    let desired_on = if !wifi_connected {
        ((now_ms / LED_FAST_BLINK_MS) % 2) == 0
    } else if !mqtt_connected {
        ((now_ms / LED_SLOW_BLINK_MS) % 2) == 0
    } else {
        true
    };

    let Some(led) = status_led.as_mut() else {
        return;
    };

    if desired_on == led.lit {
        return;
    }

    let result = if desired_on {
        led.pin.set_high()
    } else {
        led.pin.set_low()
    };

    if let Err(err) = result {
        warn!("failed to drive status LED: {err}");
    } else {
        led.lit = desired_on;
    }
}
