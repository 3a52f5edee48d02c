use std::collections::VecDeque;

const MAX_LOG_LINES: usize = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn label(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLineEvent {
    Ready,
    Failure,
    Normal,
}

/// Readiness wins when a line carries both markers.
pub fn classify_log_line(line: &str) -> LogLineEvent {
    let lower = line.to_lowercase();

    if lower.contains("listening") {
        return LogLineEvent::Ready;
    }

    if lower.contains("error") || lower.contains("failed") {
        return LogLineEvent::Failure;
    }

    LogLineEvent::Normal
}

#[derive(Default)]
pub struct ProcessLog {
    lines: VecDeque<String>,
}

impl ProcessLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.lines.clear();
    }

    pub fn push_line(&mut self, stream: OutputStream, line: &str) -> LogLineEvent {
        let event = classify_log_line(line);
        log::debug!("[client {}] {line}", stream.label());

        self.lines.push_back(line.to_string());
        if self.lines.len() > MAX_LOG_LINES {
            self.lines.pop_front();
        }
        event
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_ready() {
        assert_eq!(
            classify_log_line(" 2024-01-01 INFO: listening at 127.0.0.1:1080"),
            LogLineEvent::Ready
        );
        assert_eq!(
            classify_log_line("shadowsocks socks TCP LISTENING on 127.0.0.1:1080"),
            LogLineEvent::Ready
        );
    }

    #[test]
    fn test_classify_failure() {
        assert_eq!(
            classify_log_line("ERROR: bind() error: Address already in use"),
            LogLineEvent::Failure
        );
        assert_eq!(
            classify_log_line("connect to server Failed"),
            LogLineEvent::Failure
        );
    }

    #[test]
    fn test_classify_normal() {
        assert_eq!(
            classify_log_line("INFO: initializing ciphers... aes-256-gcm"),
            LogLineEvent::Normal
        );
    }

    #[test]
    fn test_log_is_bounded() {
        let mut log = ProcessLog::new();
        for index in 0..(MAX_LOG_LINES + 10) {
            log.push_line(OutputStream::Stdout, &format!("line {index}"));
        }
        assert_eq!(log.len(), MAX_LOG_LINES);
        assert_eq!(log.lines().next(), Some("line 10"));
    }
}
