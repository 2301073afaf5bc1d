//! NGINX log line parsers (spec §4.1, §6).
//!
//! Three line shapes, tried in order; regexes are precompiled once at
//! startup. A line matching none is dropped silently — no state
//! mutation, per spec.

use regex::Regex;
use std::sync::LazyLock;

#[derive(Debug, Clone, PartialEq)]
pub struct AccessRecord {
    pub ip: String,
    pub http_code: u16,
    pub domain: String,
    pub method: String,
    pub url: String,
    pub user_agent: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    pub ip: String,
    pub level: String,
    pub domain: String,
    pub url: String,
    pub upstream: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Access(AccessRecord),
    Error(ErrorRecord),
}

static PROXY_ACCESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^\[(?P<ts>[^\]]+)\]\s+-\s+-\s+(?P<code>\d+)\s+-\s+(?P<method>\S+)\s+(?P<proto>\S+)\s+(?P<domain>\S+)\s+"(?P<url>[^"]*)"\s+\[Client\s+(?P<ip>[^\]]+)\].*?"(?P<ua>[^"]*)"\s+"(?P<ref>[^"]*)"\s*$"#,
    )
    .expect("proxy access regex is valid")
});

static DEFAULT_HOST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^(?P<ip>\S+)\s+\S+\s+\S+\s+\[(?P<ts>[^\]]+)\]\s+"(?P<method>\S+)\s+(?P<url>\S+)[^"]*"\s+(?P<code>\d+)\s+\S+\s+"[^"]*"\s+"(?P<ua>[^"]*)"\s*$"#,
    )
    .expect("default host regex is valid")
});

static PROXY_ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^\d{4}/\d{2}/\d{2}\s+\d{2}:\d{2}:\d{2}\s+\[(?P<level>\w+)\].*?client:\s*(?P<ip>[^,]+),\s*server:\s*(?P<domain>[^,]+),\s*request:\s*"(?P<method>\S+)\s+(?P<url>\S+)[^"]*"(?:.*?upstream:\s*"(?P<upstream>[^"]*)")?"#,
    )
    .expect("proxy error regex is valid")
});

const SYNTHETIC_DOMAIN: &str = "_default_";

/// Dispatch across the three recognized shapes; returns `None` if none
/// match (the line is dropped silently, per spec §4.1).
pub fn parse_line(line: &str) -> Option<ParsedLine> {
    if let Some(caps) = PROXY_ACCESS_RE.captures(line) {
        return Some(ParsedLine::Access(AccessRecord {
            ip: caps["ip"].trim().to_string(),
            http_code: caps["code"].parse().ok()?,
            domain: caps["domain"].to_string(),
            method: caps["method"].to_string(),
            url: caps["url"].to_string(),
            user_agent: caps["ua"].to_string(),
        }));
    }
    if let Some(caps) = DEFAULT_HOST_RE.captures(line) {
        return Some(ParsedLine::Access(AccessRecord {
            ip: caps["ip"].to_string(),
            http_code: caps["code"].parse().ok()?,
            domain: SYNTHETIC_DOMAIN.to_string(),
            method: caps["method"].to_string(),
            url: caps["url"].to_string(),
            user_agent: caps["ua"].to_string(),
        }));
    }
    if let Some(caps) = PROXY_ERROR_RE.captures(line) {
        return Some(ParsedLine::Error(ErrorRecord {
            ip: caps["ip"].trim().to_string(),
            level: caps["level"].to_string(),
            domain: caps["domain"].trim().to_string(),
            url: caps["url"].to_string(),
            upstream: caps.name("upstream").map(|m| m.as_str().to_string()).unwrap_or_default(),
        }));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proxy_access_line() {
        let line = r#"[01/Jan/2025:00:00:00 +0000] - - 200 - GET https example.com "/" [Client 203.0.113.10] [Length 123] [Gzip -] [Sent-to 10.0.0.1] "sqlmap/1.5" "-""#;
        let parsed = parse_line(line).expect("should parse");
        match parsed {
            ParsedLine::Access(rec) => {
                assert_eq!(rec.ip, "203.0.113.10");
                assert_eq!(rec.http_code, 200);
                assert_eq!(rec.domain, "example.com");
                assert_eq!(rec.user_agent, "sqlmap/1.5");
            }
            _ => panic!("expected access record"),
        }
    }

    #[test]
    fn parses_default_host_line() {
        let line = r#"203.0.113.10 - - [01/Jan/2025:00:00:00 +0000] "GET /index.html HTTP/1.1" 404 1234 "-" "Mozilla/5.0""#;
        let parsed = parse_line(line).expect("should parse");
        match parsed {
            ParsedLine::Access(rec) => {
                assert_eq!(rec.ip, "203.0.113.10");
                assert_eq!(rec.http_code, 404);
                assert_eq!(rec.url, "/index.html");
            }
            _ => panic!("expected access record"),
        }
    }

    #[test]
    fn parses_proxy_error_line() {
        let line = r#"2025/01/01 00:00:00 [error] 1234#0: *1 connect() failed while connecting to upstream, client: 203.0.113.10, server: example.com, request: "GET /foo HTTP/1.1", upstream: "http://10.0.0.1:80/foo""#;
        let parsed = parse_line(line).expect("should parse");
        match parsed {
            ParsedLine::Error(rec) => {
                assert_eq!(rec.ip, "203.0.113.10");
                assert_eq!(rec.level, "error");
                assert_eq!(rec.domain, "example.com");
                assert_eq!(rec.upstream, "http://10.0.0.1:80/foo");
            }
            _ => panic!("expected error record"),
        }
    }

    #[test]
    fn unrecognized_line_is_dropped() {
        assert!(parse_line("not a log line at all").is_none());
    }
}
