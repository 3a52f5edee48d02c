use std::collections::VecDeque;

pub const TRAFFIC_WINDOW: usize = 60;

/// Bytes moved during one sampling interval.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TrafficSample {
    pub download: u64,
    pub upload: u64,
}

/// Produces one sample per call. Returning `None` skips the interval.
pub trait TrafficSampler: Send {
    fn sample(&mut self) -> Option<TrafficSample>;

    /// Forget previous counters so the next sample starts a fresh delta.
    fn reset(&mut self) {}
}

#[derive(Clone, Debug)]
pub struct TrafficHistory {
    window: VecDeque<TrafficSample>,
    capacity: usize,
    total_download: u64,
    total_upload: u64,
}

impl TrafficHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            total_download: 0,
            total_upload: 0,
        }
    }

    pub fn push(&mut self, sample: TrafficSample) {
        if self.capacity == 0 {
            return;
        }
        while self.window.len() >= self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(sample);
        self.total_download = self.total_download.saturating_add(sample.download);
        self.total_upload = self.total_upload.saturating_add(sample.upload);
    }

    pub fn samples(&self) -> impl Iterator<Item = &TrafficSample> {
        self.window.iter()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn totals(&self) -> (u64, u64) {
        (self.total_download, self.total_upload)
    }

    pub fn clear(&mut self) {
        self.window.clear();
        self.total_download = 0;
        self.total_upload = 0;
    }
}

impl Default for TrafficHistory {
    fn default() -> Self {
        Self::new(TRAFFIC_WINDOW)
    }
}

/// Deltas of the host's non-loopback interface byte counters.
#[derive(Default)]
pub struct InterfaceCounters {
    previous: Option<(u64, u64)>,
}

impl InterfaceCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn delta(&mut self, current: (u64, u64)) -> Option<TrafficSample> {
        let (previous_in, previous_out) = self.previous.replace(current)?;
        Some(TrafficSample {
            download: current.0.saturating_sub(previous_in),
            upload: current.1.saturating_sub(previous_out),
        })
    }
}

impl TrafficSampler for InterfaceCounters {
    fn sample(&mut self) -> Option<TrafficSample> {
        let counters = read_interface_counters()?;
        self.delta(counters)
    }

    fn reset(&mut self) {
        self.previous = None;
    }
}

#[cfg(target_os = "linux")]
fn read_interface_counters() -> Option<(u64, u64)> {
    match std::fs::read_to_string("/proc/net/dev") {
        Ok(content) => Some(parse_proc_net_dev(&content)),
        Err(error) => {
            log::debug!("[traffic] failed to read /proc/net/dev: {error}");
            None
        }
    }
}

#[cfg(target_os = "macos")]
fn read_interface_counters() -> Option<(u64, u64)> {
    let (success, output) = crate::system::run_silent_with_output("netstat", &["-ib"]);
    success.then(|| parse_netstat_ib(&output))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn read_interface_counters() -> Option<(u64, u64)> {
    None
}

/// Returns `(rx_bytes, tx_bytes)` summed over every interface except `lo`.
pub fn parse_proc_net_dev(content: &str) -> (u64, u64) {
    let mut total_in: u64 = 0;
    let mut total_out: u64 = 0;

    for line in content.lines().skip(2) {
        let Some((interface, stats)) = line.trim().split_once(':') else {
            continue;
        };
        if interface.trim() == "lo" {
            continue;
        }

        let stats: Vec<&str> = stats.split_whitespace().collect();
        if stats.len() >= 10 {
            if let Ok(rx) = stats[0].parse::<u64>() {
                total_in += rx;
            }
            if let Ok(tx) = stats[8].parse::<u64>() {
                total_out += tx;
            }
        }
    }

    (total_in, total_out)
}

/// Only `<Link#N>` rows are counted; address rows repeat the same counters.
pub fn parse_netstat_ib(content: &str) -> (u64, u64) {
    let mut lines = content.lines();
    let Some(header) = lines.next() else {
        return (0, 0);
    };
    let headers: Vec<&str> = header.split_whitespace().collect();
    let position = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));
    let (Some(ibytes), Some(obytes)) = (position("ibytes"), position("obytes")) else {
        return (0, 0);
    };

    let mut total_in: u64 = 0;
    let mut total_out: u64 = 0;
    for line in lines {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != headers.len() {
            continue;
        }
        if parts[0].starts_with("lo") || !parts[2].starts_with("<Link#") {
            continue;
        }
        if let (Ok(rx), Ok(tx)) = (parts[ibytes].parse::<u64>(), parts[obytes].parse::<u64>()) {
            total_in += rx;
            total_out += tx;
        }
    }
    (total_in, total_out)
}
