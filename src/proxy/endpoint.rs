//! Proxy endpoint model
//!
//! An endpoint is identified by `(protocol, host, port)`. Its serialized
//! view is one line of the rotator's endpoint file,
//! `{scheme}://{host}:{port}`, whose line order is the stable routing index.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upstream protocol the rotator speaks to a forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Socks4,
    Socks5,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Socks4 => "socks4",
            Self::Socks5 => "socks5",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            "socks4" => Ok(Self::Socks4),
            "socks5" => Ok(Self::Socks5),
            other => Err(format!("unknown proxy protocol: {other}")),
        }
    }
}

/// How much the forward reveals about the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Anonymity {
    /// Real IP visible to the target
    Transparent,
    /// Real IP hidden, proxy headers present
    Anonymous,
    /// No trace of proxying
    Elite,
}

/// One upstream forward
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_alive: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anonymity: Option<Anonymity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

impl ProxyEndpoint {
    #[must_use]
    pub fn new(protocol: Protocol, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            host: host.into(),
            port,
            last_alive: None,
            latency: None,
            anonymity: None,
            country: None,
        }
    }

    /// Stable identity used by the score map: `host:port`
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The endpoint-file line form, `{scheme}://{host}:{port}`
    #[must_use]
    pub fn to_line(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    /// Parse one endpoint-file line
    pub fn from_line(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (scheme, rest) = line
            .split_once("://")
            .ok_or_else(|| format!("missing scheme in endpoint line: {line}"))?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| format!("missing port in endpoint line: {line}"))?;
        if host.is_empty() {
            return Err(format!("empty host in endpoint line: {line}"));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| format!("invalid port in endpoint line: {line}"))?;
        Ok(Self::new(scheme.parse()?, host, port))
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_line())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_roundtrip() {
        let ep = ProxyEndpoint::new(Protocol::Http, "203.0.113.10", 8080);
        assert_eq!(ep.to_line(), "http://203.0.113.10:8080");
        let parsed = ProxyEndpoint::from_line("http://203.0.113.10:8080").expect("parse");
        assert_eq!(parsed.protocol, Protocol::Http);
        assert_eq!(parsed.host, "203.0.113.10");
        assert_eq!(parsed.port, 8080);
        assert_eq!(parsed.key(), "203.0.113.10:8080");
    }

    #[test]
    fn test_socks_line() {
        let parsed = ProxyEndpoint::from_line("socks5://10.0.0.1:1080").expect("parse");
        assert_eq!(parsed.protocol, Protocol::Socks5);
    }

    #[test]
    fn test_bad_lines_rejected() {
        assert!(ProxyEndpoint::from_line("203.0.113.10:8080").is_err());
        assert!(ProxyEndpoint::from_line("http://203.0.113.10").is_err());
        assert!(ProxyEndpoint::from_line("http://:8080").is_err());
        assert!(ProxyEndpoint::from_line("gopher://h:1").is_err());
        assert!(ProxyEndpoint::from_line("http://h:notaport").is_err());
    }
}
