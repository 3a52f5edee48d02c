use std::path::PathBuf;

#[cfg(any(target_os = "linux", target_os = "macos"))]
use super::{run_silent, run_silent_with_output};
use crate::configuration::{LOCAL_LISTEN_HOST, ProxyMode, write_pac_file};

/// What the OS is told while a session is connected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProxyTarget {
    Socks { host: String, port: u32 },
    AutoConfig { url: String },
}

pub trait ProxyBackend: Send {
    fn name(&self) -> &str;
    fn set(&mut self, target: &ProxyTarget) -> Result<String, String>;
    fn clear(&mut self);
}

/// The system-level proxy side effect driven by the supervisor.
pub trait SystemProxy: Send {
    fn enable(&mut self, mode: ProxyMode, local_port: u32) -> Result<String, String>;

    /// Safe to call when nothing is enabled.
    fn disable(&mut self);
}

pub struct DesktopProxy {
    pac_url: Option<String>,
    pac_directory: PathBuf,
    active: Vec<Box<dyn ProxyBackend>>,
}

impl DesktopProxy {
    pub fn new(pac_url: Option<String>, pac_directory: PathBuf) -> Self {
        Self {
            pac_url,
            pac_directory,
            active: Vec::new(),
        }
    }

    fn target(&self, mode: ProxyMode, local_port: u32) -> Result<Option<ProxyTarget>, String> {
        match mode {
            ProxyMode::Manual => Ok(None),
            ProxyMode::Global => Ok(Some(ProxyTarget::Socks {
                host: LOCAL_LISTEN_HOST.into(),
                port: local_port,
            })),
            ProxyMode::Pac => {
                let url = match &self.pac_url {
                    Some(url) => url.clone(),
                    None => {
                        let path = write_pac_file(&self.pac_directory, local_port)?;
                        format!("file://{}", path.display())
                    }
                };
                Ok(Some(ProxyTarget::AutoConfig { url }))
            }
        }
    }
}

impl SystemProxy for DesktopProxy {
    fn enable(&mut self, mode: ProxyMode, local_port: u32) -> Result<String, String> {
        self.disable();

        let Some(target) = self.target(mode, local_port)? else {
            log::info!("[proxy] manual mode, leaving system proxy untouched");
            return Ok(format!(
                "SOCKS5 on {LOCAL_LISTEN_HOST}:{local_port} (manual mode)"
            ));
        };

        let (backends, detail) = set_all(&target);
        self.active = backends;
        if self.active.is_empty() {
            Err(detail)
        } else {
            Ok(detail)
        }
    }

    fn disable(&mut self) {
        if self.active.is_empty() {
            return;
        }
        clear_all(&mut self.active);
        self.active.clear();
    }
}

/// Multiple backends may be returned (e.g. both GSettings and KDE KIO).
#[cfg(target_os = "linux")]
pub fn detect() -> Vec<Box<dyn ProxyBackend>> {
    let mut backends: Vec<Box<dyn ProxyBackend>> = Vec::new();

    if GnomeProxy::is_available() {
        log::info!("[proxy] detected backend: GSettings (GNOME-based)");
        backends.push(Box::new(GnomeProxy));
    }

    if KdeProxy::is_available() {
        log::info!("[proxy] detected backend: KDE KIO");
        backends.push(Box::new(KdeProxy));
    }

    if backends.is_empty() {
        let desktop = std::env::var("XDG_CURRENT_DESKTOP").unwrap_or_default();
        log::warn!(
            "[proxy] no proxy backend detected for desktop '{}'",
            if desktop.is_empty() {
                "unknown"
            } else {
                &desktop
            },
        );
    }

    backends
}

#[cfg(target_os = "macos")]
pub fn detect() -> Vec<Box<dyn ProxyBackend>> {
    let services = NetworkSetupProxy::network_services();
    if services.is_empty() {
        log::warn!("[proxy] networksetup reported no enabled network services");
        return Vec::new();
    }
    vec![Box::new(NetworkSetupProxy { services })]
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn detect() -> Vec<Box<dyn ProxyBackend>> {
    log::warn!("[proxy] system proxy is not supported on this platform");
    Vec::new()
}

/// Returns the backends that accepted the setting, plus a combined detail line.
pub fn set_all(target: &ProxyTarget) -> (Vec<Box<dyn ProxyBackend>>, String) {
    let mut applied: Vec<Box<dyn ProxyBackend>> = Vec::new();
    let mut details: Vec<String> = Vec::new();

    for mut backend in detect() {
        match backend.set(target) {
            Ok(detail) => {
                log::info!("[proxy] {} set OK: {detail}", backend.name());
                details.push(detail);
                applied.push(backend);
            }
            Err(detail) => {
                log::warn!("[proxy] {} set FAILED: {detail}", backend.name());
                details.push(detail);
            }
        }
    }

    let combined = if details.is_empty() {
        "No proxy backend available".to_string()
    } else {
        details.join("; ")
    };

    (applied, combined)
}

pub fn clear_all(backends: &mut [Box<dyn ProxyBackend>]) {
    for backend in backends {
        log::info!("[proxy] clearing proxy via {}", backend.name());
        backend.clear();
    }
}

#[cfg(target_os = "linux")]
fn desktop_session_has(names: &[&str]) -> bool {
    std::env::var("XDG_CURRENT_DESKTOP")
        .unwrap_or_default()
        .split(':')
        .any(|session| names.contains(&session))
}

#[cfg(target_os = "linux")]
pub struct GnomeProxy;

#[cfg(target_os = "linux")]
impl GnomeProxy {
    const DESKTOPS: [&'static str; 7] = [
        "GNOME",
        "Unity",
        "Cinnamon",
        "X-Cinnamon",
        "MATE",
        "Budgie",
        "Pantheon",
    ];

    pub fn is_available() -> bool {
        desktop_session_has(&Self::DESKTOPS)
    }

    /// Applies `(schema, key, value)` triples in order, stopping at the first rejection.
    fn apply(settings: &[(&str, &str, &str)]) -> Result<(), String> {
        for &(schema, key, value) in settings {
            if !run_silent("gsettings", &["set", schema, key, value]) {
                return Err(format!("gsettings rejected {schema} {key}={value}"));
            }
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
impl ProxyBackend for GnomeProxy {
    fn name(&self) -> &str {
        "GSettings"
    }

    fn set(&mut self, target: &ProxyTarget) -> Result<String, String> {
        log::info!("[proxy] GSettings: applying {}", describe(target));
        match target {
            ProxyTarget::Socks { host, port } => {
                let port = port.to_string();
                Self::apply(&[
                    ("org.gnome.system.proxy.socks", "host", host.as_str()),
                    ("org.gnome.system.proxy.socks", "port", port.as_str()),
                    ("org.gnome.system.proxy", "mode", "manual"),
                ])?;
            }
            ProxyTarget::AutoConfig { url } => {
                Self::apply(&[
                    ("org.gnome.system.proxy", "autoconfig-url", url.as_str()),
                    ("org.gnome.system.proxy", "mode", "auto"),
                ])?;
            }
        }

        let (_, mode) =
            run_silent_with_output("gsettings", &["get", "org.gnome.system.proxy", "mode"]);
        log::debug!("[proxy] GSettings mode is now {}", mode.trim());

        Ok(format!("System proxy configured via GSettings ({})", describe(target)))
    }

    fn clear(&mut self) {
        log::info!("[proxy] GSettings: resetting mode to none");
        if let Err(error) = Self::apply(&[("org.gnome.system.proxy", "mode", "none")]) {
            log::warn!("[proxy] {error}");
        }
    }
}

#[cfg(target_os = "linux")]
pub struct KdeProxy;

#[cfg(target_os = "linux")]
impl KdeProxy {
    const LOCAL_NETWORKS: &'static str =
        "localhost,127.0.0.0/8,::1,10.0.0.0/8,172.16.0.0/12,192.168.0.0/16";

    pub fn is_available() -> bool {
        desktop_session_has(&["KDE", "Trinity"])
    }

    /// Writes `[Proxy Settings]` keys of kioslaverc, then asks KIO to reload.
    fn write(entries: &[(&str, &str)]) -> Result<(), String> {
        let tool = match std::env::var("KDE_SESSION_VERSION").as_deref() {
            Ok("5") => "kwriteconfig5",
            _ => "kwriteconfig6",
        };
        let file = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kioslaverc");
        let file = file.to_string_lossy();

        for &(key, value) in entries {
            let args: [&str; 7] = [
                "--file",
                &file,
                "--group",
                "Proxy Settings",
                "--key",
                key,
                value,
            ];
            if !run_silent(tool, &args) {
                return Err(format!("{tool} could not write {key}"));
            }
        }

        run_silent(
            "dbus-send",
            &[
                "--type=signal",
                "/KIO/Scheduler",
                "org.kde.KIO.Scheduler.reparseSlaveConfiguration",
                "string:''",
            ],
        );
        Ok(())
    }
}

#[cfg(target_os = "linux")]
impl ProxyBackend for KdeProxy {
    fn name(&self) -> &str {
        "KDE KIO"
    }

    fn set(&mut self, target: &ProxyTarget) -> Result<String, String> {
        log::info!("[proxy] KDE: applying {}", describe(target));
        match target {
            ProxyTarget::Socks { host, port } => {
                let url = format!("socks5://{host}:{port}");
                Self::write(&[
                    ("ProxyType", "1"),
                    ("socksProxy", url.as_str()),
                    ("NoProxyFor", Self::LOCAL_NETWORKS),
                ])?;
            }
            ProxyTarget::AutoConfig { url } => {
                Self::write(&[("ProxyType", "2"), ("Proxy Config Script", url.as_str())])?;
            }
        }
        Ok(format!("System proxy configured via KDE KIO ({})", describe(target)))
    }

    fn clear(&mut self) {
        log::info!("[proxy] KDE: switching ProxyType off");
        if let Err(error) = Self::write(&[("ProxyType", "0")]) {
            log::warn!("[proxy] {error}");
        }
    }
}

#[cfg(target_os = "macos")]
pub struct NetworkSetupProxy {
    services: Vec<String>,
}

#[cfg(target_os = "macos")]
impl NetworkSetupProxy {
    fn network_services() -> Vec<String> {
        let (success, output) =
            run_silent_with_output("networksetup", &["-listallnetworkservices"]);
        if !success {
            return Vec::new();
        }
        output
            .lines()
            .skip(1)
            .filter(|line| !line.starts_with('*') && !line.trim().is_empty())
            .map(|line| line.trim().to_string())
            .collect()
    }
}

#[cfg(target_os = "macos")]
impl ProxyBackend for NetworkSetupProxy {
    fn name(&self) -> &str {
        "networksetup"
    }

    fn set(&mut self, target: &ProxyTarget) -> Result<String, String> {
        let mut failed = Vec::new();
        for service in &self.services {
            let applied = match target {
                ProxyTarget::Socks { host, port } => {
                    run_silent(
                        "networksetup",
                        &["-setsocksfirewallproxy", service, host, &port.to_string()],
                    ) && run_silent(
                        "networksetup",
                        &["-setsocksfirewallproxystate", service, "on"],
                    )
                }
                ProxyTarget::AutoConfig { url } => {
                    run_silent("networksetup", &["-setautoproxyurl", service, url])
                        && run_silent("networksetup", &["-setautoproxystate", service, "on"])
                }
            };
            if !applied {
                failed.push(service.clone());
            }
        }

        if failed.len() == self.services.len() {
            return Err(format!(
                "networksetup failed for every service ({})",
                failed.join(", ")
            ));
        }
        Ok(format!("System proxy configured via networksetup ({})", describe(target)))
    }

    fn clear(&mut self) {
        for service in &self.services {
            log::info!("[proxy] networksetup: clearing proxy for {service}");
            run_silent(
                "networksetup",
                &["-setsocksfirewallproxystate", service, "off"],
            );
            run_silent("networksetup", &["-setautoproxystate", service, "off"]);
        }
    }
}

fn describe(target: &ProxyTarget) -> String {
    match target {
        ProxyTarget::Socks { host, port } => format!("SOCKS5 {host}:{port}"),
        ProxyTarget::AutoConfig { url } => format!("PAC {url}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_mode_changes_nothing() {
        let directory = tempfile::tempdir().unwrap();
        let mut proxy = DesktopProxy::new(None, directory.path().to_path_buf());
        let detail = proxy.enable(ProxyMode::Manual, 1080).unwrap();
        assert!(detail.contains("manual"));
        assert!(proxy.active.is_empty());
        proxy.disable();
        proxy.disable();
    }

    #[test]
    fn test_pac_target_generates_file() {
        let directory = tempfile::tempdir().unwrap();
        let proxy = DesktopProxy::new(None, directory.path().to_path_buf());
        let target = proxy.target(ProxyMode::Pac, 1086).unwrap();
        match target {
            Some(ProxyTarget::AutoConfig { url }) => {
                assert!(url.starts_with("file://"));
                assert!(directory.path().join("proxy.pac").exists());
            }
            other => panic!("unexpected target {other:?}"),
        }
    }

    #[test]
    fn test_pac_target_prefers_configured_url() {
        let directory = tempfile::tempdir().unwrap();
        let proxy = DesktopProxy::new(
            Some("http://127.0.0.1:8090/proxy.pac".into()),
            directory.path().to_path_buf(),
        );
        assert_eq!(
            proxy.target(ProxyMode::Pac, 1086).unwrap(),
            Some(ProxyTarget::AutoConfig {
                url: "http://127.0.0.1:8090/proxy.pac".into()
            })
        );
        assert!(!directory.path().join("proxy.pac").exists());
    }

    #[test]
    fn test_global_target_is_local_socks() {
        let directory = tempfile::tempdir().unwrap();
        let proxy = DesktopProxy::new(None, directory.path().to_path_buf());
        assert_eq!(
            proxy.target(ProxyMode::Global, 1086).unwrap(),
            Some(ProxyTarget::Socks {
                host: "127.0.0.1".into(),
                port: 1086
            })
        );
    }
}
