//! Latency and throughput probes.
//!
//! Probes run on their own threads and report back through the event channel.
//! At most one probe of each kind is live per profile: starting a new one
//! cancels the previous one, and results carrying a superseded ticket are
//! dropped by the owner.

use std::{
    collections::HashMap,
    io::Read,
    process::{Command, Stdio},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::Sender,
    },
    time::{Duration, Instant},
};

use futures::channel::oneshot;

use crate::{
    error::ProbeError,
    event::{Event, ProbeKind},
    http::HttpClient,
    profile::{ProfileId, ServerProfile},
};

pub const PING_COUNT: u32 = 3;
pub const PING_TIMEOUT_SECONDS: u64 = 2;
pub const THROUGHPUT_URL: &str = "https://speed.cloudflare.com/__down?bytes=10000000";
pub const THROUGHPUT_TIMEOUT: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    /// Flags of the enclosing tokens; any of them cancels this one too.
    scopes: Vec<Arc<AtomicBool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that is cancelled on its own or together with `self`.
    pub fn child(&self) -> Self {
        let mut scopes = self.scopes.clone();
        scopes.push(self.flag.clone());
        Self {
            flag: Arc::default(),
            scopes,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.scopes.iter().any(|scope| scope.load(Ordering::SeqCst))
    }
}

pub trait LatencyProbe: Send + Sync {
    fn measure(&self, address: &str, cancel: &CancelToken) -> Result<u32, ProbeError>;
}

pub trait ThroughputProbe: Send + Sync {
    /// Returns MB/s.
    fn measure(
        &self,
        profile: &ServerProfile,
        proxy: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<f64, ProbeError>;
}

pub struct PingProbe {
    pub count: u32,
    pub timeout_seconds: u64,
}

impl Default for PingProbe {
    fn default() -> Self {
        Self {
            count: PING_COUNT,
            timeout_seconds: PING_TIMEOUT_SECONDS,
        }
    }
}

impl PingProbe {
    fn arguments(&self, address: &str) -> Vec<String> {
        // macOS ping -W takes milliseconds; Linux ping -W takes seconds
        #[cfg(target_os = "macos")]
        let timeout = (self.timeout_seconds * 1000).to_string();
        #[cfg(not(target_os = "macos"))]
        let timeout = self.timeout_seconds.to_string();

        vec![
            "-c".into(),
            self.count.to_string(),
            "-W".into(),
            timeout,
            address.to_string(),
        ]
    }
}

impl LatencyProbe for PingProbe {
    fn measure(&self, address: &str, cancel: &CancelToken) -> Result<u32, ProbeError> {
        let arguments = self.arguments(address);
        log::debug!("[probe] ping {}", arguments.join(" "));

        let mut child = Command::new("ping")
            .args(&arguments)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|error| ProbeError::TransportFailure(format!("Failed to run ping: {error}")))?;

        loop {
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ProbeError::Cancelled);
            }
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(error) => {
                    return Err(ProbeError::TransportFailure(format!(
                        "ping wait failed: {error}"
                    )));
                }
            }
        }

        let mut output = String::new();
        if let Some(mut stdout) = child.stdout.take()
            && let Err(error) = stdout.read_to_string(&mut output)
        {
            return Err(ProbeError::TransportFailure(format!(
                "Failed to read ping output: {error}"
            )));
        }

        parse_ping_average(&output)
            .map(|average| average.round().max(0.0) as u32)
            .ok_or_else(|| {
                ProbeError::Unparseable(
                    output
                        .lines()
                        .last()
                        .unwrap_or("(no output)")
                        .trim()
                        .to_string(),
                )
            })
    }
}

/// Extracts the average from a `min/avg/max/...` round-trip summary
/// (Linux `rtt` and macOS `round-trip` flavours).
pub fn parse_ping_average(output: &str) -> Option<f64> {
    let line = output.lines().find(|line| line.contains("min/avg/max"))?;
    let (_, values) = line.split_once('=')?;
    let values: Vec<&str> = values.trim().split('/').collect();
    if values.len() < 3 {
        return None;
    }
    values[1].trim().parse::<f64>().ok()
}

pub struct DownloadProbe {
    http: Arc<dyn HttpClient>,
    url: String,
    timeout: Duration,
}

impl DownloadProbe {
    pub fn new(http: Arc<dyn HttpClient>) -> Self {
        Self {
            http,
            url: THROUGHPUT_URL.into(),
            timeout: THROUGHPUT_TIMEOUT,
        }
    }
}

impl ThroughputProbe for DownloadProbe {
    fn measure(
        &self,
        profile: &ServerProfile,
        proxy: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<f64, ProbeError> {
        log::debug!("[probe] throughput for {} via {:?}", profile.name, proxy);

        let started = Instant::now();
        let body = self
            .http
            .get(&self.url, proxy, self.timeout)
            .map_err(ProbeError::TransportFailure)?;
        let elapsed = started.elapsed().as_secs_f64();

        if cancel.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }
        if body.is_empty() {
            return Err(ProbeError::TransportFailure("empty response body".into()));
        }

        Ok(body.len() as f64 / 1_000_000.0 / elapsed.max(0.001))
    }
}

#[derive(Clone, Default)]
pub struct ProbeRegistry {
    in_flight: Arc<Mutex<HashMap<(ProfileId, ProbeKind), (u64, CancelToken)>>>,
    next_ticket: Arc<AtomicU64>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new probe, cancelling any live probe of the same kind.
    pub fn begin(&self, profile: &ProfileId, kind: ProbeKind) -> (u64, CancelToken) {
        self.begin_within(profile, kind, &CancelToken::new())
    }

    /// Like [`Self::begin`], but the returned token is also cancelled with `scope`.
    pub fn begin_within(
        &self,
        profile: &ProfileId,
        kind: ProbeKind,
        scope: &CancelToken,
    ) -> (u64, CancelToken) {
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst) + 1;
        let token = scope.child();
        let Ok(mut in_flight) = self.in_flight.lock() else {
            log::warn!("[probe] registry lock poisoned");
            return (ticket, token);
        };
        if let Some((previous, cancel)) =
            in_flight.insert((profile.clone(), kind), (ticket, token.clone()))
        {
            log::debug!("[probe] superseding {kind:?} probe #{previous} for {profile}");
            cancel.cancel();
        }
        (ticket, token)
    }

    /// True when `ticket` is still the live probe; it is then retired.
    pub fn finish(&self, profile: &ProfileId, kind: ProbeKind, ticket: u64) -> bool {
        let Ok(mut in_flight) = self.in_flight.lock() else {
            return false;
        };
        let key = (profile.clone(), kind);
        match in_flight.get(&key) {
            Some((live, _)) if *live == ticket => {
                in_flight.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&self, profile: &ProfileId) {
        let Ok(mut in_flight) = self.in_flight.lock() else {
            return;
        };
        in_flight.retain(|(id, kind), (ticket, cancel)| {
            if id == profile {
                log::debug!("[probe] cancelling {kind:?} probe #{ticket} for {profile}");
                cancel.cancel();
                false
            } else {
                true
            }
        });
    }

    pub fn is_live(&self, profile: &ProfileId, kind: ProbeKind) -> bool {
        self.in_flight
            .lock()
            .map(|in_flight| in_flight.contains_key(&(profile.clone(), kind)))
            .unwrap_or(false)
    }
}

pub struct Prober {
    latency: Arc<dyn LatencyProbe>,
    throughput: Arc<dyn ThroughputProbe>,
    registry: ProbeRegistry,
    events: Sender<Event>,
    testing: bool,
}

impl Prober {
    pub fn new(
        latency: Arc<dyn LatencyProbe>,
        throughput: Arc<dyn ThroughputProbe>,
        registry: ProbeRegistry,
        events: Sender<Event>,
    ) -> Self {
        Self {
            latency,
            throughput,
            registry,
            events,
            testing: false,
        }
    }

    pub fn is_testing(&self) -> bool {
        self.testing
    }

    pub fn probe_latency(&self, profile: &ServerProfile) -> u64 {
        self.dispatch_latency(profile, None)
    }

    pub fn probe_throughput(&self, profile: &ServerProfile, proxy: Option<String>) -> u64 {
        self.dispatch_throughput(profile, proxy, None)
    }

    /// Probes every target concurrently. The testing flag stays set until
    /// every dispatched probe has reported, then `TestAllFinished` is posted.
    pub fn test_all(&mut self, targets: Vec<(ServerProfile, Option<String>)>) -> bool {
        if self.testing {
            log::info!("[probe] test already in progress");
            return false;
        }
        self.testing = true;
        log::info!("[probe] testing {} servers", targets.len());

        let mut pending = Vec::with_capacity(targets.len() * 2);
        for (profile, proxy) in targets {
            let (done, waiter) = oneshot::channel();
            self.dispatch_latency(&profile, Some(done));
            pending.push(waiter);

            let (done, waiter) = oneshot::channel();
            self.dispatch_throughput(&profile, proxy, Some(done));
            pending.push(waiter);
        }

        let events = self.events.clone();
        std::thread::spawn(move || {
            futures::executor::block_on(futures::future::join_all(pending));
            log::info!("[probe] all probes completed");
            let _ = events.send(Event::TestAllFinished);
        });
        true
    }

    pub fn finish_test_all(&mut self) {
        self.testing = false;
    }

    /// True when the result for `ticket` should be applied.
    pub fn accept(&self, profile: &ProfileId, kind: ProbeKind, ticket: u64) -> bool {
        let accepted = self.registry.finish(profile, kind, ticket);
        if !accepted {
            log::debug!("[probe] dropping superseded {kind:?} result #{ticket} for {profile}");
        }
        accepted
    }

    pub fn cancel(&self, profile: &ProfileId) {
        self.registry.cancel(profile);
    }

    fn dispatch_latency(&self, profile: &ServerProfile, done: Option<oneshot::Sender<()>>) -> u64 {
        let (ticket, cancel) = self.registry.begin(&profile.id, ProbeKind::Latency);
        let probe = self.latency.clone();
        let events = self.events.clone();
        let address = profile.address.clone();
        let id = profile.id.clone();

        std::thread::spawn(move || {
            let result = probe.measure(&address, &cancel);
            let _ = events.send(Event::LatencyMeasured {
                profile: id,
                ticket,
                result,
            });
            if let Some(done) = done {
                let _ = done.send(());
            }
        });
        ticket
    }

    fn dispatch_throughput(
        &self,
        profile: &ServerProfile,
        proxy: Option<String>,
        done: Option<oneshot::Sender<()>>,
    ) -> u64 {
        let (ticket, cancel) = self.registry.begin(&profile.id, ProbeKind::Throughput);
        let probe = self.throughput.clone();
        let events = self.events.clone();
        let profile = profile.clone();

        std::thread::spawn(move || {
            let result = probe.measure(&profile, proxy.as_deref(), &cancel);
            let _ = events.send(Event::ThroughputMeasured {
                profile: profile.id,
                ticket,
                result,
            });
            if let Some(done) = done {
                let _ = done.send(());
            }
        });
        ticket
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::mpsc;

    use super::*;

    pub struct FixedLatency(pub Option<u32>);

    impl LatencyProbe for FixedLatency {
        fn measure(&self, _address: &str, _cancel: &CancelToken) -> Result<u32, ProbeError> {
            self.0
                .ok_or_else(|| ProbeError::Unparseable("100% packet loss".into()))
        }
    }

    pub struct FixedThroughput(pub Result<f64, ProbeError>);

    impl ThroughputProbe for FixedThroughput {
        fn measure(
            &self,
            _profile: &ServerProfile,
            _proxy: Option<&str>,
            _cancel: &CancelToken,
        ) -> Result<f64, ProbeError> {
            self.0.clone()
        }
    }

    /// Blocks until cancelled.
    struct StallingLatency;

    impl LatencyProbe for StallingLatency {
        fn measure(&self, _address: &str, cancel: &CancelToken) -> Result<u32, ProbeError> {
            let deadline = Instant::now() + Duration::from_secs(10);
            while !cancel.is_cancelled() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(ProbeError::Cancelled)
        }
    }

    struct StubHttp(Result<Vec<u8>, String>);

    impl HttpClient for StubHttp {
        fn get(
            &self,
            _url: &str,
            _proxy: Option<&str>,
            _timeout: Duration,
        ) -> Result<Vec<u8>, String> {
            self.0.clone()
        }
    }

    fn profile(name: &str) -> ServerProfile {
        ServerProfile::new(name, "198.51.100.7", 8388, "aes-256-gcm")
    }

    #[test]
    fn test_parse_ping_average_linux() {
        let output = "\
PING 1.1.1.1 (1.1.1.1) 56(84) bytes of data.
64 bytes from 1.1.1.1: icmp_seq=1 ttl=57 time=11.2 ms

--- 1.1.1.1 ping statistics ---
3 packets transmitted, 3 received, 0% packet loss, time 2003ms
rtt min/avg/max/mdev = 10.812/11.514/12.301/0.611 ms";
        assert_eq!(parse_ping_average(output), Some(11.514));
    }

    #[test]
    fn test_parse_ping_average_macos() {
        let output = "\
--- example.com ping statistics ---
3 packets transmitted, 3 packets received, 0.0% packet loss
round-trip min/avg/max/stddev = 20.100/25.400/30.700/4.300 ms";
        assert_eq!(parse_ping_average(output), Some(25.4));
    }

    #[test]
    fn test_parse_ping_average_unreachable() {
        let output = "\
--- 10.255.255.1 ping statistics ---
3 packets transmitted, 0 received, 100% packet loss, time 2040ms";
        assert_eq!(parse_ping_average(output), None);
    }

    #[test]
    fn test_download_probe_computes_rate() {
        let probe = DownloadProbe::new(Arc::new(StubHttp(Ok(vec![0u8; 1_000_000]))));
        let rate = probe
            .measure(&profile("a"), None, &CancelToken::new())
            .unwrap();
        assert!(rate > 0.0);
    }

    #[test]
    fn test_download_probe_transport_failure() {
        let probe = DownloadProbe::new(Arc::new(StubHttp(Err("connection reset".into()))));
        assert_eq!(
            probe.measure(&profile("a"), None, &CancelToken::new()),
            Err(ProbeError::TransportFailure("connection reset".into()))
        );
    }

    #[test]
    fn test_registry_supersedes_previous_probe() {
        let registry = ProbeRegistry::new();
        let id = ProfileId::from("p");
        let (first, first_cancel) = registry.begin(&id, ProbeKind::Latency);
        let (second, second_cancel) = registry.begin(&id, ProbeKind::Latency);

        assert!(first_cancel.is_cancelled());
        assert!(!second_cancel.is_cancelled());
        assert!(!registry.finish(&id, ProbeKind::Latency, first));
        assert!(registry.finish(&id, ProbeKind::Latency, second));
        assert!(!registry.is_live(&id, ProbeKind::Latency));
    }

    #[test]
    fn test_child_token_follows_scope() {
        let scope = CancelToken::new();
        let child = scope.child();
        let grandchild = child.child();

        grandchild.cancel();
        assert!(!child.is_cancelled());
        assert!(!scope.is_cancelled());

        let sibling = child.child();
        scope.cancel();
        assert!(child.is_cancelled());
        assert!(sibling.is_cancelled());
    }

    #[test]
    fn test_registry_scoped_probe_is_superseded_by_plain_probe() {
        let registry = ProbeRegistry::new();
        let id = ProfileId::from("p");
        let scope = CancelToken::new();
        let (scoped, scoped_cancel) = registry.begin_within(&id, ProbeKind::Latency, &scope);
        let (_, plain_cancel) = registry.begin(&id, ProbeKind::Latency);

        assert!(scoped_cancel.is_cancelled());
        assert!(!plain_cancel.is_cancelled());
        assert!(!registry.finish(&id, ProbeKind::Latency, scoped));

        scope.cancel();
        assert!(!plain_cancel.is_cancelled());
    }

    #[test]
    fn test_registry_kinds_are_independent() {
        let registry = ProbeRegistry::new();
        let id = ProfileId::from("p");
        let (_, latency) = registry.begin(&id, ProbeKind::Latency);
        let (_, throughput) = registry.begin(&id, ProbeKind::Throughput);
        assert!(!latency.is_cancelled());

        registry.cancel(&id);
        assert!(latency.is_cancelled());
        assert!(throughput.is_cancelled());
        assert!(!registry.is_live(&id, ProbeKind::Throughput));
    }

    #[test]
    fn test_superseded_probe_is_cancelled_and_dropped() {
        let (sender, receiver) = mpsc::channel();
        let prober = Prober::new(
            Arc::new(StallingLatency),
            Arc::new(FixedThroughput(Ok(1.0))),
            ProbeRegistry::new(),
            sender,
        );
        let target = profile("a");
        let first = prober.probe_latency(&target);
        let second = prober.probe_latency(&target);
        assert_ne!(first, second);

        match receiver.recv_timeout(Duration::from_secs(5)).unwrap() {
            Event::LatencyMeasured {
                ticket, result, ..
            } => {
                assert_eq!(ticket, first);
                assert_eq!(result, Err(ProbeError::Cancelled));
                assert!(!prober.accept(&target.id, ProbeKind::Latency, ticket));
            }
            other => panic!("unexpected event {other:?}"),
        }
        prober.cancel(&target.id);
    }

    #[test]
    fn test_all_reports_every_probe_before_finishing() {
        let (sender, receiver) = mpsc::channel();
        let mut prober = Prober::new(
            Arc::new(FixedLatency(Some(42))),
            Arc::new(FixedThroughput(Ok(3.0))),
            ProbeRegistry::new(),
            sender,
        );
        let targets = vec![(profile("a"), None), (profile("b"), None), (profile("c"), None)];

        assert!(prober.test_all(targets));
        assert!(prober.is_testing());
        assert!(!prober.test_all(Vec::new()));

        let mut latencies = 0;
        let mut throughputs = 0;
        loop {
            match receiver.recv_timeout(Duration::from_secs(5)).unwrap() {
                Event::LatencyMeasured { result, .. } => {
                    assert_eq!(result, Ok(42));
                    latencies += 1;
                }
                Event::ThroughputMeasured { result, .. } => {
                    assert_eq!(result, Ok(3.0));
                    throughputs += 1;
                }
                Event::TestAllFinished => break,
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!((latencies, throughputs), (3, 3));
        assert!(prober.is_testing());
        prober.finish_test_all();
        assert!(!prober.is_testing());
    }

    #[test]
    fn test_all_with_no_targets_finishes() {
        let (sender, receiver) = mpsc::channel();
        let mut prober = Prober::new(
            Arc::new(FixedLatency(None)),
            Arc::new(FixedThroughput(Ok(1.0))),
            ProbeRegistry::new(),
            sender,
        );
        assert!(prober.test_all(Vec::new()));
        assert!(matches!(
            receiver.recv_timeout(Duration::from_secs(5)).unwrap(),
            Event::TestAllFinished
        ));
    }
}
