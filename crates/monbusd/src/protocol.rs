//! Message codes of the demo protocol

pub const ECHO: u32 = 1;
pub const ECHO_REPLY: u32 = 2;
pub const STATS: u32 = 3;
pub const STATS_REPLY: u32 = 4;
pub const SHUTDOWN: u32 = 5;
pub const ACK: u32 = 6;
pub const ERROR: u32 = 255;

/// A request as understood by the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Reply with the same payload
    Echo,
    /// Reply with client and message counters
    Stats,
    /// Acknowledge and stop serving
    Shutdown,
    Unknown(u32),
}

impl Request {
    pub fn from_code(code: u32) -> Self {
        match code {
            ECHO => Self::Echo,
            STATS => Self::Stats,
            SHUTDOWN => Self::Shutdown,
            other => Self::Unknown(other),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::Echo => ECHO,
            Self::Stats => STATS,
            Self::Shutdown => SHUTDOWN,
            Self::Unknown(code) => *code,
        }
    }
}

/// Human-readable name of a code, for CLI output
pub fn code_name(code: u32) -> &'static str {
    match code {
        ECHO => "ECHO",
        ECHO_REPLY => "ECHO_REPLY",
        STATS => "STATS",
        STATS_REPLY => "STATS_REPLY",
        SHUTDOWN => "SHUTDOWN",
        ACK => "ACK",
        ERROR => "ERROR",
        _ => "UNKNOWN",
    }
}

/// Counters reported in a `STATS_REPLY` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub clients: usize,
    pub messages: u64,
}

impl Stats {
    pub fn to_text(&self) -> String {
        format!("clients={} messages={}", self.clients, self.messages)
    }

    pub fn parse(text: &str) -> Option<Self> {
        let mut clients = None;
        let mut messages = None;

        for field in text.split_whitespace() {
            match field.split_once('=')? {
                ("clients", value) => clients = value.parse().ok(),
                ("messages", value) => messages = value.parse().ok(),
                _ => {}
            }
        }

        Some(Self {
            clients: clients?,
            messages: messages?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_codes() {
        for request in [Request::Echo, Request::Stats, Request::Shutdown, Request::Unknown(42)] {
            assert_eq!(Request::from_code(request.code()), request);
        }
        assert_eq!(Request::from_code(ECHO_REPLY), Request::Unknown(ECHO_REPLY));
    }

    #[test]
    fn stats_text() {
        let stats = Stats {
            clients: 3,
            messages: 17,
        };
        assert_eq!(stats.to_text(), "clients=3 messages=17");
        assert_eq!(Stats::parse(&stats.to_text()), Some(stats));
        assert_eq!(Stats::parse("clients=3"), None);
        assert_eq!(Stats::parse("garbage"), None);
    }
}
