//! Lifecycle of the local proxy client.
//!
//! The supervisor owns at most one client process. It never blocks: process
//! output, exit notifications, health probes, traffic samples and delayed
//! restarts all arrive as [`Event`]s and are applied by the single owner that
//! holds the supervisor. Every process-related event carries the session id it
//! was produced for, so anything from a previous session is ignored.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex, mpsc::Sender},
    time::{Duration, Instant},
};

use crate::{
    configuration::{ProxyMode, runtime_directory, write_proxy_configuration},
    connection_state::ConnectionState,
    error::{ProbeError, ProcessError, SupervisorError},
    event::{Event, ProbeKind, SessionId},
    installation::InstallationState,
    process_log::{LogLineEvent, OutputStream, ProcessLog},
    prober::{CancelToken, LatencyProbe, ProbeRegistry},
    profile::{ProfileId, ServerProfile},
    repository::ProfileRepository,
    system::{ProcessHandle, ProcessRunner, SpawnRequest, proxy::SystemProxy},
    traffic::{TRAFFIC_WINDOW, TrafficHistory, TrafficSample, TrafficSampler},
};

const POLL_SLICE: Duration = Duration::from_millis(20);

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub grace_period: Duration,
    pub restart_delay: Duration,
    pub health_interval: Duration,
    pub traffic_interval: Duration,
    pub fatal_latency_ms: u32,
    pub max_retries: u32,
    pub traffic_window: usize,
    /// Where per-profile client configurations are written.
    pub runtime_directory: PathBuf,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(2),
            restart_delay: Duration::from_secs(1),
            health_interval: Duration::from_secs(10),
            traffic_interval: Duration::from_secs(1),
            fatal_latency_ms: 1000,
            max_retries: 3,
            traffic_window: TRAFFIC_WINDOW,
            runtime_directory: runtime_directory(),
        }
    }
}

/// Sleeps for `duration` unless `token` is cancelled first. Returns false
/// when cancelled.
fn sleep_unless_cancelled(duration: Duration, token: &CancelToken) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if token.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(POLL_SLICE.min(deadline - now));
    }
}

/// A repeating background task. `tick` runs once per interval until the
/// ticker is cancelled or `tick` returns false.
pub struct Ticker {
    token: CancelToken,
}

impl Ticker {
    pub fn start(
        name: &'static str,
        interval: Duration,
        mut tick: impl FnMut(&CancelToken) -> bool + Send + 'static,
    ) -> Self {
        let token = CancelToken::new();
        let thread_token = token.clone();
        std::thread::spawn(move || {
            log::debug!("[{name}] loop started ({}ms)", interval.as_millis());
            while sleep_unless_cancelled(interval, &thread_token) {
                if !tick(&thread_token) {
                    break;
                }
            }
            log::debug!("[{name}] loop stopped");
        });
        Self { token }
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

struct Session {
    id: SessionId,
    profile: ProfileId,
    address: String,
    local_port: u32,
    handle: Box<dyn ProcessHandle>,
    configuration: PathBuf,
    health: Option<Ticker>,
    traffic: Option<Ticker>,
}

impl Session {
    fn cancel_loops(&mut self) {
        if let Some(ticker) = self.health.take() {
            ticker.cancel();
        }
        if let Some(ticker) = self.traffic.take() {
            ticker.cancel();
        }
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    runner: Arc<dyn ProcessRunner>,
    proxy: Box<dyn SystemProxy>,
    latency_probe: Arc<dyn LatencyProbe>,
    probes: ProbeRegistry,
    sampler: Arc<Mutex<Box<dyn TrafficSampler>>>,
    events: Sender<Event>,
    state: ConnectionState,
    proxy_mode: ProxyMode,
    session: Option<Session>,
    last_session: SessionId,
    retries: u32,
    restart_token: u64,
    pending_restart: Option<u64>,
    traffic: TrafficHistory,
    log: ProcessLog,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        runner: Arc<dyn ProcessRunner>,
        proxy: Box<dyn SystemProxy>,
        latency_probe: Arc<dyn LatencyProbe>,
        probes: ProbeRegistry,
        sampler: Box<dyn TrafficSampler>,
        events: Sender<Event>,
    ) -> Self {
        let traffic = TrafficHistory::new(config.traffic_window);
        Self {
            config,
            runner,
            proxy,
            latency_probe,
            probes,
            sampler: Arc::new(Mutex::new(sampler)),
            events,
            state: ConnectionState::Disconnected,
            proxy_mode: ProxyMode::default(),
            session: None,
            last_session: 0,
            retries: 0,
            restart_token: 0,
            pending_restart: None,
            traffic,
            log: ProcessLog::new(),
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn traffic(&self) -> &TrafficHistory {
        &self.traffic
    }

    pub fn process_log(&self) -> &ProcessLog {
        &self.log
    }

    pub fn proxy_mode(&self) -> ProxyMode {
        self.proxy_mode
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    pub fn has_pending_restart(&self) -> bool {
        self.pending_restart.is_some()
    }

    /// The profile bound to the live session and its local SOCKS port, when
    /// that session is connected.
    pub fn connected_profile(&self) -> Option<(&ProfileId, u32)> {
        if !self.state.is_connected() {
            return None;
        }
        self.session
            .as_ref()
            .map(|session| (&session.profile, session.local_port))
    }

    pub fn session_profile(&self) -> Option<&ProfileId> {
        self.session.as_ref().map(|session| &session.profile)
    }

    fn is_current(&self, session: SessionId) -> bool {
        self.session
            .as_ref()
            .is_some_and(|live| live.id == session)
    }

    pub fn start(
        &mut self,
        repository: &mut ProfileRepository,
        installation: &InstallationState,
    ) -> Result<(), SupervisorError> {
        let Some(executable) = installation.executable() else {
            log::warn!("[connect] start refused: client is not installed");
            return Err(SupervisorError::NotInstalled);
        };
        if self.session.is_some() {
            log::warn!("[connect] start refused: a session is already running");
            return Err(SupervisorError::AlreadyRunning);
        }
        let profile: ServerProfile = repository
            .current_profile()
            .cloned()
            .ok_or(SupervisorError::NoCurrentProfile)?;
        profile.validate()?;

        let password = repository.resolve_credential(&profile.id).inspect_err(|error| {
            log::error!("[connect] failed to resolve credential: {error}");
        })?;

        let configuration =
            match write_proxy_configuration(&self.config.runtime_directory, &profile, &password) {
                Ok(path) => path,
                Err(error) => {
                    log::error!("[connect] {error}");
                    self.state = ConnectionState::Error(error.clone());
                    return Err(SupervisorError::Configuration(error));
                }
            };

        if !executable.exists() {
            let error = ProcessError::NotFound(executable.to_path_buf());
            log::error!("[connect] {error}");
            self.state = ConnectionState::Error(error.to_string());
            remove_configuration(&configuration);
            return Err(error.into());
        }

        self.last_session += 1;
        let session = self.last_session;
        let configuration_argument = configuration.display().to_string();
        let request = SpawnRequest::new(executable, &["-c", configuration_argument.as_str(), "-v"]);

        let handle = match self.runner.spawn(&request, session, self.events.clone()) {
            Ok(handle) => handle,
            Err(error) => {
                log::error!("[connect] {error}");
                self.state = ConnectionState::Error(error.to_string());
                remove_configuration(&configuration);
                return Err(error.into());
            }
        };

        self.log.reset();
        self.traffic.clear();
        if let Ok(mut sampler) = self.sampler.lock() {
            sampler.reset();
        }

        log::info!(
            "[connect] session {session} started for {} ({}:{})",
            profile.name,
            profile.address,
            profile.port
        );
        self.session = Some(Session {
            id: session,
            profile: profile.id,
            address: profile.address,
            local_port: profile.local_port,
            handle,
            configuration,
            health: None,
            traffic: None,
        });
        self.state = ConnectionState::Connecting;
        Ok(())
    }

    pub fn handle_output(&mut self, session: SessionId, stream: OutputStream, line: &str) {
        if !self.is_current(session) {
            log::trace!("[supervisor] output from stale session {session} ignored");
            return;
        }

        match self.log.push_line(stream, line) {
            LogLineEvent::Ready => {
                if self.state == ConnectionState::Connecting {
                    self.on_ready();
                }
            }
            LogLineEvent::Failure => {
                log::error!("[supervisor] client reported failure: {line}");
                self.state = ConnectionState::Error(line.trim().to_string());
                if let Some(live) = self.session.as_mut() {
                    live.cancel_loops();
                }
            }
            LogLineEvent::Normal => {}
        }
    }

    fn on_ready(&mut self) {
        let Some(live) = self.session.as_mut() else {
            return;
        };
        log::info!("[connect] client is listening on port {}", live.local_port);
        self.state = ConnectionState::Connected;

        let session = live.id;
        let probe = self.latency_probe.clone();
        let probes = self.probes.clone();
        let events = self.events.clone();
        let profile = live.profile.clone();
        let address = live.address.clone();
        live.health = Some(Ticker::start(
            "health",
            self.config.health_interval,
            move |cancel| {
                let (ticket, token) = probes.begin_within(&profile, ProbeKind::Latency, cancel);
                let result = probe.measure(&address, &token);
                if !probes.finish(&profile, ProbeKind::Latency, ticket) {
                    log::debug!("[health] probe of {address} superseded, skipping this round");
                    return !cancel.is_cancelled();
                }
                let latency = match result {
                    Ok(latency) => Some(latency),
                    Err(ProbeError::Cancelled) => return !cancel.is_cancelled(),
                    Err(error) => {
                        log::warn!("[health] probe of {address} failed: {error}");
                        None
                    }
                };
                events
                    .send(Event::HealthProbed { session, latency })
                    .is_ok()
            },
        ));

        let sampler = self.sampler.clone();
        let events = self.events.clone();
        live.traffic = Some(Ticker::start(
            "traffic",
            self.config.traffic_interval,
            move |_| {
                let sample = match sampler.lock() {
                    Ok(mut sampler) => sampler.sample(),
                    Err(_) => {
                        log::warn!("[traffic] sampler lock poisoned");
                        return false;
                    }
                };
                match sample {
                    Some(sample) => events
                        .send(Event::TrafficSampled { session, sample })
                        .is_ok(),
                    None => true,
                }
            },
        ));

        let local_port = live.local_port;
        match self.proxy.enable(self.proxy_mode, local_port) {
            Ok(detail) => log::info!("[proxy] {} mode: {detail}", self.proxy_mode.label()),
            Err(error) => log::error!("[proxy] failed to enable system proxy: {error}"),
        }
    }

    pub fn handle_exit(&mut self, session: SessionId, code: Option<i32>) {
        if !self.is_current(session) {
            log::debug!("[supervisor] exit of stale session {session} ignored");
            return;
        }
        let Some(mut live) = self.session.take() else {
            return;
        };

        live.cancel_loops();
        self.proxy.disable();
        remove_configuration(&live.configuration);

        self.state = match code {
            Some(0) => {
                log::info!("[supervisor] client exited cleanly");
                ConnectionState::Disconnected
            }
            Some(code) => {
                log::error!("[supervisor] client exited with code {code}");
                ConnectionState::Error(format!("client exited with code {code}"))
            }
            None => {
                log::error!("[supervisor] client terminated by signal");
                ConnectionState::Error("client terminated by signal".into())
            }
        };
    }

    /// Stops the session and resets the retry counter. Does nothing when no
    /// session is running.
    pub fn stop(&mut self) {
        self.pending_restart = None;
        self.retries = 0;
        self.shutdown();
    }

    fn shutdown(&mut self) -> bool {
        let Some(mut live) = self.session.take() else {
            log::info!("[supervisor] stop requested with no running session");
            return false;
        };

        live.cancel_loops();
        self.proxy.disable();
        self.state = ConnectionState::Disconnected;

        remove_configuration(&live.configuration);
        live.handle.interrupt();
        let grace = self.config.grace_period;
        let mut handle = live.handle;
        let session = live.id;
        std::thread::spawn(move || {
            let deadline = Instant::now() + grace;
            while handle.is_alive() && Instant::now() < deadline {
                std::thread::sleep(POLL_SLICE);
            }
            if handle.is_alive() {
                log::warn!("[terminate] session {session} ignored interrupt, killing");
                handle.terminate();
            }
        });
        log::info!("[supervisor] session {session} stopped");
        true
    }

    /// Stops now and starts again after the restart delay. Only the most
    /// recently scheduled restart fires.
    pub fn restart(&mut self) {
        self.shutdown();

        self.restart_token += 1;
        let token = self.restart_token;
        self.pending_restart = Some(token);

        let delay = self.config.restart_delay;
        let events = self.events.clone();
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            let _ = events.send(Event::RestartDue { token });
        });
        log::info!(
            "[supervisor] restart #{token} scheduled in {}ms",
            delay.as_millis()
        );
    }

    pub fn handle_restart_due(
        &mut self,
        token: u64,
        repository: &mut ProfileRepository,
        installation: &InstallationState,
    ) {
        if self.pending_restart != Some(token) {
            log::debug!("[supervisor] restart #{token} was superseded");
            return;
        }
        self.pending_restart = None;
        if let Err(error) = self.start(repository, installation) {
            log::error!("[supervisor] restart failed: {error}");
        }
    }

    /// Applies one health probe result. Unmeasurable or fatal latency
    /// triggers a restart until the retry budget is spent, then a stop.
    pub fn handle_health(
        &mut self,
        session: SessionId,
        latency: Option<u32>,
        repository: &mut ProfileRepository,
    ) {
        if !self.is_current(session) || !self.state.is_connected() {
            return;
        }
        if let Some(live) = &self.session {
            repository.record_latency(&live.profile, latency);
        }

        let healthy = latency.is_some_and(|latency| latency <= self.config.fatal_latency_ms);
        if healthy {
            if self.retries > 0 {
                log::info!("[health] connection recovered");
            }
            self.retries = 0;
            return;
        }

        self.retries += 1;
        if self.retries <= self.config.max_retries {
            log::warn!(
                "[health] unhealthy ({}), restart {}/{}",
                latency.map_or("unreachable".to_string(), |ms| format!("{ms}ms")),
                self.retries,
                self.config.max_retries
            );
            self.restart();
        } else {
            log::error!("[health] retries exhausted, stopping");
            self.stop();
        }
    }

    pub fn handle_traffic(&mut self, session: SessionId, sample: TrafficSample) {
        if !self.is_current(session) || !self.state.is_connected() {
            return;
        }
        self.traffic.push(sample);
    }

    /// Re-applies the system proxy when the mode changes mid-session.
    pub fn set_proxy_mode(&mut self, mode: ProxyMode) {
        if self.proxy_mode == mode {
            return;
        }
        self.proxy_mode = mode;
        log::info!("[proxy] mode set to {}", mode.label());

        let Some((_, local_port)) = self.connected_profile() else {
            return;
        };
        self.proxy.disable();
        match self.proxy.enable(mode, local_port) {
            Ok(detail) => log::info!("[proxy] {} mode: {detail}", mode.label()),
            Err(error) => log::error!("[proxy] failed to enable system proxy: {error}"),
        }
    }
}

fn remove_configuration(path: &std::path::Path) {
    if let Err(error) = std::fs::remove_file(path)
        && error.kind() != std::io::ErrorKind::NotFound
    {
        log::warn!(
            "[connect] failed to remove configuration {}: {error}",
            path.display()
        );
    }
}
