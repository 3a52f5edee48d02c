//! The single owner of all mutable application state.
//!
//! Background threads (client output readers, timers, probes, installers,
//! import fetches) never touch state directly. They post [`Event`]s to the
//! channel drained here, and each event is applied to completion before the
//! next one is read.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
    },
    time::{Duration, Instant},
};

use crate::{
    app_state::AppState,
    configuration::{LOCAL_LISTEN_HOST, configuration_directory},
    connection_state::ConnectionState,
    error::{ImportError, ProbeError},
    event::{Command, Event, ImportSource, ProbeKind},
    http::{HttpClient, ReqwestClient},
    installation::{InstallationChecker, InstallationState, start_check, start_install},
    prober::{DownloadProbe, LatencyProbe, PingProbe, ProbeRegistry, Prober, ThroughputProbe},
    profile::{ProfileId, ServerProfile},
    repository::{ImportReport, ProfileRepository, SERVERS_FILE},
    secret_store::{FileSecretStore, SecretStore},
    supervisor::{Supervisor, SupervisorConfig},
    system::{ProcessRunner, SystemRunner, proxy::DesktopProxy, proxy::SystemProxy},
    traffic::{InterfaceCounters, TrafficSample, TrafficSampler},
};

pub const SECRETS_FILE: &str = "secrets.json";
pub const IMPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// The external collaborators the core is wired to.
pub struct Collaborators {
    pub runner: Arc<dyn ProcessRunner>,
    pub proxy: Box<dyn SystemProxy>,
    pub latency: Arc<dyn LatencyProbe>,
    pub throughput: Arc<dyn ThroughputProbe>,
    pub sampler: Box<dyn TrafficSampler>,
    pub http: Arc<dyn HttpClient>,
    pub secrets: Arc<dyn SecretStore>,
    pub checker: Arc<InstallationChecker>,
}

impl Collaborators {
    pub fn system(settings: &AppState, directory: &Path) -> Self {
        let http: Arc<dyn HttpClient> = Arc::new(ReqwestClient);
        Self {
            runner: Arc::new(SystemRunner),
            proxy: Box::new(DesktopProxy::new(
                settings.pac_url.clone(),
                directory.to_path_buf(),
            )),
            latency: Arc::new(PingProbe::default()),
            throughput: Arc::new(DownloadProbe::new(http.clone())),
            sampler: Box::new(InterfaceCounters::new()),
            http,
            secrets: Arc::new(FileSecretStore::new(directory.join(SECRETS_FILE))),
            checker: Arc::new(
                InstallationChecker::new().with_executable(settings.executable_path.clone()),
            ),
        }
    }
}

/// A read-only copy of everything a front end renders.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub connection: ConnectionState,
    pub installation: InstallationState,
    pub profiles: Vec<ServerProfile>,
    pub current: Option<ProfileId>,
    pub testing: bool,
    pub retries: u32,
    pub traffic: Vec<TrafficSample>,
    pub traffic_totals: (u64, u64),
    pub log: Vec<String>,
    pub last_import: Option<ImportReport>,
    pub last_error: Option<String>,
}

pub struct ShadowsocksApp {
    settings: AppState,
    settings_path: Option<PathBuf>,
    repository: ProfileRepository,
    supervisor: Supervisor,
    prober: Prober,
    checker: Arc<InstallationChecker>,
    installation: InstallationState,
    http: Arc<dyn HttpClient>,
    events: Sender<Event>,
    receiver: Receiver<Event>,
    last_import: Option<ImportReport>,
    last_error: Option<String>,
    quitting: bool,
}

impl ShadowsocksApp {
    /// Wires the app to the real system using the on-disk settings.
    pub fn open() -> Self {
        let directory = configuration_directory();
        let settings = AppState::load();
        let collaborators = Collaborators::system(&settings, &directory);
        Self::new(
            settings,
            Some(AppState::state_file_path()),
            directory.join(SERVERS_FILE),
            SupervisorConfig::default(),
            collaborators,
        )
    }

    /// `settings_path` of `None` keeps settings in memory only.
    pub fn new(
        settings: AppState,
        settings_path: Option<PathBuf>,
        servers_path: PathBuf,
        config: SupervisorConfig,
        collaborators: Collaborators,
    ) -> Self {
        let (events, receiver) = mpsc::channel();
        let registry = ProbeRegistry::new();
        let repository =
            ProfileRepository::load(servers_path, collaborators.secrets, registry.clone());

        let mut supervisor = Supervisor::new(
            config,
            collaborators.runner,
            collaborators.proxy,
            collaborators.latency.clone(),
            registry.clone(),
            collaborators.sampler,
            events.clone(),
        );
        supervisor.set_proxy_mode(settings.proxy_mode);

        let prober = Prober::new(
            collaborators.latency,
            collaborators.throughput,
            registry,
            events.clone(),
        );

        Self {
            settings,
            settings_path,
            repository,
            supervisor,
            prober,
            checker: collaborators.checker,
            installation: InstallationState::Checking,
            http: collaborators.http,
            events,
            receiver,
            last_import: None,
            last_error: None,
            quitting: false,
        }
    }

    pub fn sender(&self) -> Sender<Event> {
        self.events.clone()
    }

    pub fn send(&self, command: Command) {
        let _ = self.events.send(command.into());
    }

    pub fn repository(&self) -> &ProfileRepository {
        &self.repository
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn settings(&self) -> &AppState {
        &self.settings
    }

    pub fn installation(&self) -> &InstallationState {
        &self.installation
    }

    pub fn is_testing(&self) -> bool {
        self.prober.is_testing()
    }

    pub fn is_quitting(&self) -> bool {
        self.quitting
    }

    pub fn last_import(&self) -> Option<ImportReport> {
        self.last_import
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn snapshot(&self) -> Snapshot {
        let profiles = self
            .repository
            .list()
            .iter()
            .cloned()
            .map(|mut profile| {
                profile.password = None;
                profile
            })
            .collect();
        Snapshot {
            connection: self.supervisor.state().clone(),
            installation: self.installation.clone(),
            profiles,
            current: self.repository.current_id().cloned(),
            testing: self.prober.is_testing(),
            retries: self.supervisor.retries(),
            traffic: self.supervisor.traffic().samples().copied().collect(),
            traffic_totals: self.supervisor.traffic().totals(),
            log: self
                .supervisor
                .process_log()
                .lines()
                .map(str::to_string)
                .collect(),
            last_import: self.last_import,
            last_error: self.last_error.clone(),
        }
    }

    /// Resolves the current profile's credential and encodes it as a link.
    pub fn current_share_link(&mut self) -> Result<String, String> {
        let id = self
            .repository
            .current_id()
            .cloned()
            .ok_or_else(|| "no server selected".to_string())?;
        self.repository
            .resolve_credential(&id)
            .map_err(|error| error.to_string())?;
        self.repository
            .get(&id)
            .map(ServerProfile::share_link)
            .ok_or_else(|| format!("profile not found: {id}"))
    }

    /// Applies events until `Quit` is handled.
    pub fn run(&mut self) {
        while !self.quitting {
            match self.receiver.recv() {
                Ok(event) => self.dispatch(event),
                Err(_) => break,
            }
        }
    }

    /// Applies events until `done` holds or `timeout` passes. Returns
    /// whether `done` holds.
    pub fn pump_until(&mut self, timeout: Duration, done: impl Fn(&Self) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if done(self) {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.receiver.recv_timeout(remaining) {
                Ok(event) => self.dispatch(event),
                Err(RecvTimeoutError::Timeout) => return done(self),
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
    }

    pub fn dispatch(&mut self, event: Event) {
        match event {
            Event::Command(command) => self.handle_command(command),
            Event::ProcessOutput {
                session,
                stream,
                line,
            } => self.supervisor.handle_output(session, stream, &line),
            Event::ProcessExited { session, code } => self.supervisor.handle_exit(session, code),
            Event::HealthProbed { session, latency } => {
                self.supervisor
                    .handle_health(session, latency, &mut self.repository)
            }
            Event::TrafficSampled { session, sample } => {
                self.supervisor.handle_traffic(session, sample)
            }
            Event::RestartDue { token } => {
                self.supervisor
                    .handle_restart_due(token, &mut self.repository, &self.installation)
            }
            Event::LatencyMeasured {
                profile,
                ticket,
                result,
            } => {
                if !self.prober.accept(&profile, ProbeKind::Latency, ticket) {
                    return;
                }
                match result {
                    Ok(latency) => {
                        log::info!("[probe] {profile}: {latency}ms");
                        self.repository.record_latency(&profile, Some(latency));
                    }
                    Err(ProbeError::Cancelled) => {}
                    Err(error) => {
                        log::warn!("[probe] latency for {profile} failed: {error}");
                        self.repository.record_latency(&profile, None);
                    }
                }
            }
            Event::ThroughputMeasured {
                profile,
                ticket,
                result,
            } => {
                if !self.prober.accept(&profile, ProbeKind::Throughput, ticket) {
                    return;
                }
                match result {
                    Ok(speed) => {
                        log::info!("[probe] {profile}: {speed:.2} MB/s");
                        self.repository.record_throughput(&profile, speed);
                    }
                    Err(ProbeError::Cancelled) => {}
                    Err(error) => {
                        log::warn!("[probe] throughput for {profile} failed: {error}");
                    }
                }
            }
            Event::TestAllFinished => {
                log::info!("[probe] test finished");
                self.prober.finish_test_all();
            }
            Event::Installation(state) => {
                log::info!("[install] state: {}", state.label());
                if let InstallationState::Error(message) = &state {
                    self.last_error = Some(message.clone());
                }
                self.installation = state;
            }
            Event::ImportFetched { source, result } => self.apply_import(source, result),
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start => {
                let result = self
                    .supervisor
                    .start(&mut self.repository, &self.installation);
                self.report(result);
            }
            Command::Stop => self.supervisor.stop(),
            Command::Restart => self.supervisor.restart(),
            Command::AddProfile(profile) => {
                let result = self.repository.add(profile);
                self.report(result);
            }
            Command::UpdateProfile(profile) => {
                let result = self.repository.update(profile);
                self.report(result);
            }
            Command::RemoveProfile(id) => {
                if self.supervisor.session_profile() == Some(&id) {
                    self.supervisor.stop();
                }
                let result = self.repository.remove(&id);
                self.report(result);
            }
            Command::SelectProfile(id) => {
                let result = self.repository.select_current(&id);
                self.report(result);
            }
            Command::Reorder { from, to } => {
                let result = self.repository.reorder(&from, to);
                self.report(result);
            }
            Command::RankBest => {
                let result = self.repository.rank_best().map(|_| ());
                self.report(result);
            }
            Command::TestProfile(id) => {
                let Some(profile) = self.repository.get(&id).cloned() else {
                    self.report(Err(format!("profile not found: {id}")));
                    return;
                };
                let proxy = self.probe_proxy(&profile.id);
                self.prober.probe_latency(&profile);
                self.prober.probe_throughput(&profile, proxy);
            }
            Command::TestAll => {
                let targets = self
                    .repository
                    .list()
                    .iter()
                    .map(|profile| (profile.clone(), self.probe_proxy(&profile.id)))
                    .collect();
                self.prober.test_all(targets);
            }
            Command::Import(source) => self.fetch_import(source),
            Command::SetProxyMode(mode) => {
                self.supervisor.set_proxy_mode(mode);
                self.settings.set_proxy_mode(mode);
                self.save_settings();
            }
            Command::CheckInstallation => start_check(self.checker.clone(), self.events.clone()),
            Command::Install => start_install(self.checker.clone(), self.events.clone()),
            Command::Quit => {
                log::info!("[app] quitting");
                self.supervisor.stop();
                self.quitting = true;
            }
        }
    }

    fn report<E: std::fmt::Display>(&mut self, result: Result<(), E>) {
        match result {
            Ok(()) => self.last_error = None,
            Err(error) => {
                log::error!("[app] {error}");
                self.last_error = Some(error.to_string());
            }
        }
    }

    /// Throughput of the live connected profile is measured through its
    /// own local SOCKS port.
    fn probe_proxy(&self, id: &ProfileId) -> Option<String> {
        let (connected, port) = self.supervisor.connected_profile()?;
        (connected == id).then(|| format!("socks5h://{LOCAL_LISTEN_HOST}:{port}"))
    }

    fn fetch_import(&self, source: ImportSource) {
        let events = self.events.clone();
        let http = self.http.clone();
        let free_nodes_url = self.settings.free_nodes_url().to_string();

        std::thread::spawn(move || {
            let result = match &source {
                ImportSource::File(path) => {
                    std::fs::read(path).map_err(|error| ImportError::Read {
                        path: path.clone(),
                        reason: error.to_string(),
                    })
                }
                ImportSource::Subscription(url) => http
                    .get(url, None, IMPORT_TIMEOUT)
                    .map_err(ImportError::Fetch),
                ImportSource::FreeNodes => http
                    .get(&free_nodes_url, None, IMPORT_TIMEOUT)
                    .map_err(ImportError::Fetch),
                ImportSource::Link(link) => Ok(link.clone().into_bytes()),
            };
            let _ = events.send(Event::ImportFetched { source, result });
        });
    }

    fn apply_import(&mut self, source: ImportSource, result: Result<Vec<u8>, ImportError>) {
        let imported = result.and_then(|bytes| match &source {
            ImportSource::Subscription(_) => self.repository.import_subscription(&bytes),
            ImportSource::File(_) | ImportSource::FreeNodes => self.repository.import_json(&bytes),
            ImportSource::Link(_) => {
                let link = String::from_utf8_lossy(&bytes);
                self.repository.import_link(&link).map(|_| ImportReport {
                    imported: 1,
                    failed: 0,
                })
            }
        });

        match imported {
            Ok(report) => {
                if let ImportSource::Subscription(url) = &source
                    && self.settings.subscription_url.as_deref() != Some(url.as_str())
                {
                    self.settings.subscription_url = Some(url.clone());
                    self.save_settings();
                }
                self.last_import = Some(report);
                self.last_error = None;
            }
            Err(error) => {
                log::error!("[import] {source} failed: {error}");
                self.last_error = Some(error.to_string());
            }
        }
    }

    fn save_settings(&self) {
        if let Some(path) = &self.settings_path {
            self.settings.save_to(path);
        }
    }

    /// Stops the client and restores the system proxy.
    pub fn shutdown(&mut self) {
        self.supervisor.stop();
    }
}

impl Drop for ShadowsocksApp {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        configuration::ProxyMode,
        prober::tests::{FixedLatency, FixedThroughput},
        secret_store::MemorySecretStore,
    };

    struct StubHttp(Mutex<Vec<String>>, Result<Vec<u8>, String>);

    impl HttpClient for StubHttp {
        fn get(&self, url: &str, _proxy: Option<&str>, _timeout: Duration) -> Result<Vec<u8>, String> {
            self.0.lock().unwrap().push(url.to_string());
            self.1.clone()
        }
    }

    struct NullProxy;

    impl SystemProxy for NullProxy {
        fn enable(&mut self, _mode: ProxyMode, _local_port: u32) -> Result<String, String> {
            Ok(String::new())
        }

        fn disable(&mut self) {}
    }

    struct Idle;

    impl TrafficSampler for Idle {
        fn sample(&mut self) -> Option<TrafficSample> {
            None
        }
    }

    fn app(directory: &Path, http: Arc<StubHttp>) -> ShadowsocksApp {
        let collaborators = Collaborators {
            runner: Arc::new(SystemRunner),
            proxy: Box::new(NullProxy),
            latency: Arc::new(FixedLatency(Some(40))),
            throughput: Arc::new(FixedThroughput(Ok(4.0))),
            sampler: Box::new(Idle),
            http,
            secrets: Arc::new(MemorySecretStore::new()),
            checker: Arc::new(
                InstallationChecker::new()
                    .with_search_paths(Vec::new())
                    .with_path_lookup(false)
                    .with_package_manager(None),
            ),
        };
        let config = SupervisorConfig {
            runtime_directory: directory.join("run"),
            ..SupervisorConfig::default()
        };
        ShadowsocksApp::new(
            AppState::default(),
            Some(directory.join("settings.toml")),
            directory.join(SERVERS_FILE),
            config,
            collaborators,
        )
    }

    fn stub(body: &[u8]) -> Arc<StubHttp> {
        Arc::new(StubHttp(Mutex::new(Vec::new()), Ok(body.to_vec())))
    }

    const WAIT: Duration = Duration::from_secs(10);

    #[test]
    fn test_start_refused_until_installed() {
        let directory = tempfile::tempdir().unwrap();
        let mut app = app(directory.path(), stub(b""));
        app.dispatch(Command::Start.into());
        assert_eq!(app.last_error(), Some("shadowsocks client is not installed"));
        assert_eq!(app.snapshot().connection, ConnectionState::Disconnected);
    }

    #[test]
    fn test_installation_check_reports_not_installed() {
        let directory = tempfile::tempdir().unwrap();
        let mut app = app(directory.path(), stub(b""));
        app.send(Command::CheckInstallation);
        assert!(app.pump_until(WAIT, |app| *app.installation() == InstallationState::NotInstalled));
    }

    #[test]
    fn test_all_then_rank_best() {
        let directory = tempfile::tempdir().unwrap();
        let mut app = app(directory.path(), stub(b""));
        app.dispatch(
            Command::AddProfile(ServerProfile::new("b", "b.example.com", 8388, "aes-256-gcm"))
                .into(),
        );

        app.send(Command::TestAll);
        assert!(app.pump_until(WAIT, |app| app.is_testing()));
        assert!(app.pump_until(WAIT, |app| !app.is_testing()));

        for profile in app.snapshot().profiles {
            assert_eq!(profile.last_ping, Some(40));
            assert_eq!(profile.last_speed, Some(4.0));
            assert!(profile.last_update.is_some());
        }

        app.dispatch(Command::RankBest.into());
        assert_eq!(app.snapshot().current, Some(app.repository().list()[0].id.clone()));
    }

    #[test]
    fn test_import_file_strips_credentials() {
        let directory = tempfile::tempdir().unwrap();
        let file = directory.path().join("export.json");
        std::fs::write(
            &file,
            r#"[{"name":"imported","address":"i.example.com","port":8388,"method":"aes-256-gcm","password":"p"}]"#,
        )
        .unwrap();
        let mut app = app(directory.path(), stub(b""));

        app.send(Command::Import(ImportSource::File(file)));
        assert!(app.pump_until(WAIT, |app| app.last_import().is_some()));
        assert_eq!(app.last_import().unwrap().imported, 1);

        let snapshot = app.snapshot();
        assert_eq!(snapshot.profiles.len(), 2);
        assert_eq!(snapshot.profiles[1].name, "imported");
        assert_eq!(app.repository().list()[1].password.as_deref(), Some(""));
    }

    #[test]
    fn test_subscription_import_remembers_url() {
        use base64::{Engine, engine::general_purpose::STANDARD};

        let directory = tempfile::tempdir().unwrap();
        let body = STANDARD.encode(
            r#"[{"name":"s1","address":"1.example.com","port":1,"method":"aes-128-gcm"},
                {"name":"s2","address":"2.example.com","port":2,"method":"aes-128-gcm"}]"#,
        );
        let http = stub(body.as_bytes());
        let mut app = app(directory.path(), http.clone());

        let url = "https://example.com/sub".to_string();
        app.send(Command::Import(ImportSource::Subscription(url.clone())));
        assert!(app.pump_until(WAIT, |app| app.last_import().is_some()));
        assert_eq!(app.last_import().unwrap().imported, 2);
        assert_eq!(app.settings().subscription_url.as_deref(), Some(url.as_str()));
        assert_eq!(*http.0.lock().unwrap(), vec![url]);
    }

    #[test]
    fn test_failed_fetch_is_reported() {
        let directory = tempfile::tempdir().unwrap();
        let http = Arc::new(StubHttp(Mutex::new(Vec::new()), Err("timed out".into())));
        let mut app = app(directory.path(), http.clone());

        app.send(Command::Import(ImportSource::FreeNodes));
        assert!(app.pump_until(WAIT, |app| app.last_error().is_some()));
        assert!(app.last_error().unwrap().contains("timed out"));
        assert_eq!(app.repository().len(), 1);
        assert_eq!(
            http.0.lock().unwrap()[0],
            crate::app_state::FREE_NODES_URL
        );
    }

    #[test]
    fn test_link_import_keeps_password() {
        let directory = tempfile::tempdir().unwrap();
        let mut app = app(directory.path(), stub(b""));
        let mut source = ServerProfile::new("x", "x.example.com", 443, "aes-256-gcm");
        source.password = Some("pw".into());

        app.send(Command::Import(ImportSource::Link(format!(
            "{}#Linked",
            source.share_link()
        ))));
        assert!(app.pump_until(WAIT, |app| app.last_import().is_some()));

        let linked = app.repository().list()[1].clone();
        assert_eq!(linked.name, "Linked");
        assert_eq!(linked.password.as_deref(), Some("pw"));
        assert!(app.snapshot().profiles[1].password.is_none());
    }

    #[test]
    fn test_proxy_mode_is_persisted() {
        let directory = tempfile::tempdir().unwrap();
        let mut app = app(directory.path(), stub(b""));
        app.dispatch(Command::SetProxyMode(ProxyMode::Manual).into());
        assert_eq!(app.supervisor().proxy_mode(), ProxyMode::Manual);

        let saved = AppState::load_from(&directory.path().join("settings.toml"));
        assert_eq!(saved.proxy_mode, ProxyMode::Manual);
    }

    #[test]
    fn test_quit_ends_run_loop() {
        let directory = tempfile::tempdir().unwrap();
        let mut app = app(directory.path(), stub(b""));
        app.send(Command::Quit);
        app.run();
        assert!(app.is_quitting());
    }
}
