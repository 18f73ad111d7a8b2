use std::{
    io::{ErrorKind, Read, Write},
    net::{TcpStream, ToSocketAddrs},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use rustls::{pki_types::ServerName, ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use tracing::{debug, info, warn};

use lagwatch_common::{
    command_filter, decode_command, telemetry_topic, Agent, AgentAction, AgentConfig, Endpoint,
    InboundCommand, MemoryRegion, PersistentStore, PubSub, PublishError, StoreError, SystemClock,
    TelemetryValue, Transport, TransportError, SNAPSHOT_LEN,
};

const IDLE_POLL: Duration = Duration::from_millis(100);
const MAX_RESPONSE_BYTES: usize = 64 * 1024;

type HostAgent = Agent<TcpTransport, MqttPubSub, FileRegion, SystemClock>;

#[derive(Clone)]
struct AppStore {
    config_path: PathBuf,
    credential_path: PathBuf,
}

/// Routing data the broker loop needs to turn publishes into commands.
#[derive(Clone)]
struct CommandRoute {
    prefix: String,
    device_id: String,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut config = store.load_config().await.unwrap_or_else(|err| {
        warn!("failed to load config from store: {err:#}");
        AgentConfig::default()
    });
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.sanitize();

    info!(
        "config loaded: device `{}`, api `{}:{}` (tls {}), mqtt `{}:{}`",
        config.device_id,
        config.api.host,
        config.api.port,
        config.api.use_tls,
        config.network.mqtt_host,
        config.network.mqtt_port,
    );
    if config.credential.bootstrap_refresh_token.is_empty() {
        warn!("no bootstrap refresh token configured; remote calls will fail until one is persisted");
    }

    let mut mqtt_options = MqttOptions::new(
        format!("lagwatch-{}", config.device_id),
        config.network.mqtt_host.clone(),
        config.network.mqtt_port,
    );
    if !config.network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(
            config.network.mqtt_user.clone(),
            config.network.mqtt_pass.clone(),
        );
    }
    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let route = CommandRoute {
        prefix: config.network.topic_prefix.clone(),
        device_id: config.device_id.clone(),
    };
    let (command_tx, command_rx) = mpsc::channel();
    spawn_mqtt_loop(eventloop, mqtt.clone(), route.clone(), command_tx);

    let transport = TcpTransport::new()?;
    let region = store
        .open_credential_region()
        .context("failed to open credential store")?;
    let pubsub = MqttPubSub {
        client: mqtt,
        route,
        commands: command_rx,
    };
    let agent = Agent::new(config, transport, pubsub, region, SystemClock);

    let running = Arc::new(AtomicBool::new(true));
    let mut worker = tokio::task::spawn_blocking({
        let running = running.clone();
        move || run_agent(agent, &running)
    });

    let action = tokio::select! {
        joined = &mut worker => joined.context("agent thread panicked")?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("ctrl-c received, stopping after the current step");
            running.store(false, Ordering::Relaxed);
            worker.await.context("agent thread panicked")?
        }
    };

    match action {
        Some(action) => execute_action(action).await,
        None => Ok(()),
    }
}

fn run_agent(mut agent: HostAgent, running: &AtomicBool) -> Option<AgentAction> {
    let info = agent.boot();
    info!(
        "agent booted: reboot #{}, downtime {:?} s",
        info.reboot_count, info.downtime_secs
    );

    while running.load(Ordering::Relaxed) {
        if let Some(action) = agent.poll() {
            return Some(action);
        }
        std::thread::sleep(IDLE_POLL);
    }
    None
}

async fn execute_action(action: AgentAction) -> anyhow::Result<()> {
    match action {
        AgentAction::Restart { delay_ms } => {
            info!("restarting in {delay_ms} ms");
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            restart_process()
        }
    }
}

/// Replaces this process with a fresh copy started with the same arguments.
fn restart_process() -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("failed to locate agent executable")?;
    let child = std::process::Command::new(&exe)
        .args(std::env::args_os().skip(1))
        .spawn()
        .with_context(|| format!("failed to re-spawn {}", exe.display()))?;
    info!("handed over to pid {}", child.id());
    Ok(())
}

fn apply_env_overrides(config: &mut AgentConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(host) = lookup("MQTT_HOST") {
        config.network.mqtt_host = host;
    }
    if let Some(port) = lookup("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
        config.network.mqtt_port = port;
    }
    if let Some(user) = lookup("MQTT_USER") {
        config.network.mqtt_user = user;
    }
    if let Some(pass) = lookup("MQTT_PASS") {
        config.network.mqtt_pass = pass;
    }
    if let Some(host) = lookup("LAGWATCH_API_HOST") {
        config.api.auth_host = host.clone();
        config.api.host = host;
    }
    if let Some(token) = lookup("LAGWATCH_REFRESH_TOKEN") {
        config.credential.bootstrap_refresh_token = token;
    }
}

fn spawn_mqtt_loop(
    mut eventloop: EventLoop,
    mqtt: AsyncClient,
    route: CommandRoute,
    commands: mpsc::Sender<InboundCommand>,
) {
    let filter = command_filter(&route.prefix, &route.device_id);
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    match decode_command(
                        &route.prefix,
                        &route.device_id,
                        &message.topic,
                        &message.payload,
                    ) {
                        Ok(Some(command)) => {
                            if commands.send(command).is_err() {
                                debug!("agent stopped, dropping command from {}", message.topic);
                            }
                        }
                        Ok(None) => debug!("ignoring publish on {}", message.topic),
                        Err(err) => warn!("dropping command on {}: {err}", message.topic),
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    // Queued without awaiting; the request is sent by this same loop.
                    if let Err(err) = mqtt.try_subscribe(filter.clone(), QoS::AtMostOnce) {
                        warn!("mqtt subscribe to {filter} failed: {err}");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

struct MqttPubSub {
    client: AsyncClient,
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
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|err| failed(err.to_string()))
    }

    fn next_command(&mut self) -> Option<InboundCommand> {
        self.commands.try_recv().ok()
    }
}

/// Blocking HTTP transport: plain TCP or rustls over TCP, one connection
/// per exchange.
struct TcpTransport {
    tls: Arc<ClientConfig>,
}

impl TcpTransport {
    fn new() -> anyhow::Result<Self> {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .context("failed to select tls protocol versions")?
        .with_root_certificates(roots)
        .with_no_client_auth();

        Ok(Self {
            tls: Arc::new(config),
        })
    }
}

impl Transport for TcpTransport {
    fn exchange(
        &mut self,
        endpoint: &Endpoint,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let stream = connect(endpoint, timeout)?;
        if !endpoint.tls {
            return round_trip(stream, request, deadline, timeout);
        }

        let server_name = ServerName::try_from(endpoint.host.clone())
            .map_err(|err| connect_error(endpoint, err))?;
        let connection = ClientConnection::new(self.tls.clone(), server_name)
            .map_err(|err| connect_error(endpoint, err))?;
        round_trip(StreamOwned::new(connection, stream), request, deadline, timeout)
    }
}

fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<TcpStream, TransportError> {
    let addrs = (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()
        .map_err(|err| connect_error(endpoint, err))?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) if err.kind() == ErrorKind::TimedOut => {
                return Err(TransportError::Timeout(timeout));
            }
            Err(err) => last_err = Some(err),
        }
    }

    Err(match last_err {
        Some(err) => connect_error(endpoint, err),
        None => connect_error(endpoint, "host resolved to no addresses"),
    })
}

fn connect_error(endpoint: &Endpoint, reason: impl std::fmt::Display) -> TransportError {
    TransportError::Connect {
        host: endpoint.host.clone(),
        port: endpoint.port,
        reason: reason.to_string(),
    }
}

/// A byte stream whose socket timeouts can be narrowed between reads.
trait DeadlineStream: Read + Write {
    fn set_io_timeout(&mut self, timeout: Duration) -> std::io::Result<()>;
}

impl DeadlineStream for TcpStream {
    fn set_io_timeout(&mut self, timeout: Duration) -> std::io::Result<()> {
        self.set_read_timeout(Some(timeout))?;
        self.set_write_timeout(Some(timeout))
    }
}

impl DeadlineStream for StreamOwned<ClientConnection, TcpStream> {
    fn set_io_timeout(&mut self, timeout: Duration) -> std::io::Result<()> {
        self.sock.set_io_timeout(timeout)
    }
}

/// Writes the request and reads until the peer closes the connection.
///
/// The whole exchange must finish before `deadline`; every socket operation
/// only gets the time that is left.
fn round_trip<S: DeadlineStream>(
    mut stream: S,
    request: &[u8],
    deadline: Instant,
    timeout: Duration,
) -> Result<Vec<u8>, TransportError> {
    arm(&mut stream, deadline, timeout)?;
    stream
        .write_all(request)
        .and_then(|()| stream.flush())
        .map_err(|err| io_error(err, timeout))?;

    let mut response = Vec::new();
    let mut chunk = [0_u8; 1024];
    loop {
        arm(&mut stream, deadline, timeout)?;
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => {
                response.extend_from_slice(&chunk[..read]);
                if response.len() > MAX_RESPONSE_BYTES {
                    return Err(TransportError::Io(format!(
                        "response exceeds {MAX_RESPONSE_BYTES} bytes"
                    )));
                }
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            // Servers that close without a TLS close_notify still sent a full response.
            Err(err) if err.kind() == ErrorKind::UnexpectedEof && !response.is_empty() => break,
            Err(err) => return Err(io_error(err, timeout)),
        }
    }
    Ok(response)
}

fn arm<S: DeadlineStream>(
    stream: &mut S,
    deadline: Instant,
    timeout: Duration,
) -> Result<(), TransportError> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(TransportError::Timeout(timeout));
    }
    stream
        .set_io_timeout(left)
        .map_err(|err| io_error(err, timeout))
}

fn io_error(err: std::io::Error, timeout: Duration) -> TransportError {
    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => TransportError::Timeout(timeout),
        _ => TransportError::Io(err.to_string()),
    }
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("LAGWATCH_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.lagwatch"));

        Self {
            config_path: data_dir.join("config.json"),
            credential_path: data_dir.join("credential.bin"),
        }
    }

    async fn load_config(&self) -> anyhow::Result<AgentConfig> {
        match tokio::fs::read(&self.config_path).await {
            Ok(raw) => Ok(serde_json::from_slice::<AgentConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(AgentConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn open_credential_region(&self) -> anyhow::Result<FileRegion> {
        FileRegion::open(self.credential_path.clone(), SNAPSHOT_LEN)
    }
}

/// Persistent region kept in a single file, rewritten whole on commit.
struct FileRegion {
    path: PathBuf,
    region: MemoryRegion,
}

impl FileRegion {
    fn open(path: PathBuf, len: usize) -> anyhow::Result<Self> {
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };

        Ok(Self {
            path,
            region: MemoryRegion::from_bytes(bytes, len),
        })
    }

    fn flush(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let staging = self.path.with_extension("tmp");
        std::fs::write(&staging, self.region.as_bytes())?;
        std::fs::rename(&staging, &self.path)
    }
}

impl PersistentStore for FileRegion {
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
        self.flush()
            .map_err(|err| StoreError::Backend(format!("{}: {err}", self.path.display())))?;
        self.region.mark_clean();
        Ok(())
    }
}
