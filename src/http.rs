use std::time::Duration;

pub const USER_AGENT: &str = concat!("shadowsocks-ui/", env!("CARGO_PKG_VERSION"));

pub trait HttpClient: Send + Sync {
    /// Fetches `url`, optionally through `proxy` (e.g. `socks5h://127.0.0.1:1080`).
    fn get(&self, url: &str, proxy: Option<&str>, timeout: Duration) -> Result<Vec<u8>, String>;
}

pub struct ReqwestClient;

impl HttpClient for ReqwestClient {
    fn get(&self, url: &str, proxy: Option<&str>, timeout: Duration) -> Result<Vec<u8>, String> {
        log::debug!("[http] GET {url} (proxy={})", proxy.unwrap_or("none"));

        let mut builder = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout);
        if let Some(proxy) = proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|error| format!("Invalid proxy {proxy}: {error}"))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|error| format!("Failed to build HTTP client: {error}"))?;

        let response = client
            .get(url)
            .send()
            .map_err(|error| format!("HTTP request failed: {error}"))?;

        let status = response.status();
        let body = response
            .bytes()
            .map_err(|error| format!("Failed to read response body: {error}"))?;

        if !status.is_success() {
            let text = String::from_utf8_lossy(&body);
            return Err(format!(
                "{url} returned status {}: {}",
                status.as_u16(),
                text.chars().take(200).collect::<String>()
            ));
        }

        Ok(body.to_vec())
    }
}
