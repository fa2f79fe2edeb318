use geotrace_model::HopFact;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Both executables print round-trip times in milliseconds.
const LATENCY_UNIT: &str = "ms";

/// Output flavour of the path-discovery executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `traceroute -n`: numeric table, one hop per line.
    Unix,
    /// `tracert -d`: narrative banner, per-probe latency columns.
    Windows,
}

impl Dialect {
    pub fn host() -> Self {
        if cfg!(windows) {
            Dialect::Windows
        } else {
            Dialect::Unix
        }
    }

    pub fn program(self) -> &'static str {
        match self {
            Dialect::Unix => "traceroute",
            Dialect::Windows => "tracert",
        }
    }

    /// Flags placed before the target: numeric output plus the hop limit.
    pub fn default_args(self, max_hops: u32, wait_secs: u64) -> Vec<String> {
        match self {
            Dialect::Unix => vec![
                "-n".to_string(),
                "-m".to_string(),
                max_hops.to_string(),
                "-w".to_string(),
                wait_secs.to_string(),
            ],
            Dialect::Windows => vec![
                "-d".to_string(),
                "-h".to_string(),
                max_hops.to_string(),
                "-w".to_string(),
                (wait_secs * 1000).to_string(),
            ],
        }
    }

    /// Lowercased prefixes of announcement, header and footer lines.
    fn banner_prefixes(self) -> &'static [&'static str] {
        match self {
            Dialect::Unix => &["traceroute to", "traceroute6 to", "traceroute:"],
            Dialect::Windows => &[
                "tracing route to",
                "over a maximum of",
                "trace complete",
                "unable to resolve",
            ],
        }
    }

    fn is_banner(self, line: &str) -> bool {
        let lower = line.to_ascii_lowercase();
        self.banner_prefixes()
            .iter()
            .any(|prefix| lower.starts_with(prefix))
    }
}

impl Default for Dialect {
    fn default() -> Self {
        Dialect::host()
    }
}

impl FromStr for Dialect {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "unix" | "linux" | "macos" => Ok(Dialect::Unix),
            "windows" | "tracert" => Ok(Dialect::Windows),
            "auto" | "" => Ok(Dialect::host()),
            other => Err(format!("unknown output dialect: {other}")),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Unix => f.write_str("unix"),
            Dialect::Windows => f.write_str("windows"),
        }
    }
}

/// What one line of output turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    Banner,
    Hop(HopFact),
    /// A hop slot that answered no probe.
    Timeout { hop_number: u32 },
    /// A hop inside a private range; never reported.
    Private { hop_number: u32, ip: String },
    Unparsed,
}

impl LineKind {
    pub fn into_fact(self) -> Option<HopFact> {
        match self {
            LineKind::Hop(fact) => Some(fact),
            _ => None,
        }
    }
}

pub fn parse_hop_line(line: &str, dialect: Dialect) -> Option<HopFact> {
    classify_line(line, dialect).into_fact()
}

pub fn parse_output(text: &str, dialect: Dialect) -> Vec<HopFact> {
    text.lines()
        .filter_map(|line| parse_hop_line(line, dialect))
        .collect()
}

pub fn classify_line(line: &str, dialect: Dialect) -> LineKind {
    let line = line.trim();
    if line.is_empty() {
        return LineKind::Unparsed;
    }
    if dialect.is_banner(line) {
        return LineKind::Banner;
    }

    let tokens: Vec<&str> = line.split_whitespace().collect();
    let hop_number = match tokens[0].parse::<u32>() {
        Ok(value) if value >= 1 => value,
        _ => return LineKind::Unparsed,
    };
    let rest = &tokens[1..];

    let Some((ip_index, ip)) = find_ipv4(rest) else {
        return LineKind::Timeout { hop_number };
    };

    if ip.is_private() {
        return LineKind::Private {
            hop_number,
            ip: ip.to_string(),
        };
    }

    let ip = ip.to_string();
    let hostname = hostname_before(rest, ip_index).unwrap_or_else(|| ip.clone());
    let latency_ms = first_latency(rest, LATENCY_UNIT).unwrap_or(0);

    LineKind::Hop(HopFact {
        hop_number,
        ip,
        hostname,
        latency_ms,
    })
}

fn find_ipv4(tokens: &[&str]) -> Option<(usize, Ipv4Addr)> {
    tokens.iter().enumerate().find_map(|(index, token)| {
        let bare = trim_to_address(token);
        if is_ipv4(bare) {
            bare.parse::<Ipv4Addr>().ok().map(|ip| (index, ip))
        } else {
            None
        }
    })
}

/// A name printed as `name (ip)` or `name [ip]`.
fn hostname_before(tokens: &[&str], ip_index: usize) -> Option<String> {
    let ip_token = tokens[ip_index];
    let bracketed = ip_token.starts_with('(') || ip_token.starts_with('[');
    if !bracketed || ip_index == 0 {
        return None;
    }

    let candidate = tokens[ip_index - 1];
    let looks_like_name = candidate != "*"
        && !candidate.starts_with('<')
        && candidate.chars().any(|c| c.is_ascii_alphabetic())
        && !candidate.eq_ignore_ascii_case("ms");
    looks_like_name.then(|| candidate.to_string())
}

/// Drops punctuation glued to either end, as in `(8.8.8.8)` or `8.8.8.8:`.
fn trim_to_address(token: &str) -> &str {
    token.trim_matches(|c: char| !(c.is_ascii_digit() || c == '.'))
}

fn is_ipv4(token: &str) -> bool {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 4 {
        return false;
    }

    parts.iter().all(|part| {
        !part.is_empty()
            && part.len() <= 3
            && part.chars().all(|c| c.is_ascii_digit())
            && part.parse::<u8>().is_ok()
    })
}

fn first_latency(tokens: &[&str], unit: &str) -> Option<u64> {
    tokens.iter().enumerate().find_map(|(index, token)| {
        let next = tokens.get(index + 1).copied();
        parse_latency(token, next, unit)
    })
}

/// Reads `12.3 ms`, `12.3ms` or `<1 ms`, rounding to whole milliseconds.
fn parse_latency(token: &str, next: Option<&str>, unit: &str) -> Option<u64> {
    let (number, glued) = match token.strip_suffix(unit) {
        Some(number) if !number.is_empty() => (number, true),
        _ => (token, false),
    };
    if !glued && next != Some(unit) {
        return None;
    }

    if let Some(bound) = number.strip_prefix('<') {
        return bound.parse::<f64>().ok().map(|_| 0);
    }

    let value = number.parse::<f64>().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some(value.round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_integer_is_required() {
        assert_eq!(classify_line("  * * *", Dialect::Unix), LineKind::Unparsed);
        assert_eq!(classify_line("abc 8.8.8.8 1 ms", Dialect::Unix), LineKind::Unparsed);
        assert_eq!(classify_line("0  8.8.8.8  1 ms", Dialect::Unix), LineKind::Unparsed);
        assert_eq!(classify_line("", Dialect::Windows), LineKind::Unparsed);
    }

    #[test]
    fn unix_banner_is_discarded() {
        let line = "traceroute to 8.8.8.8 (8.8.8.8), 30 hops max, 60 byte packets";
        assert_eq!(classify_line(line, Dialect::Unix), LineKind::Banner);
    }

    #[test]
    fn windows_footer_is_discarded() {
        assert_eq!(classify_line("Trace complete.", Dialect::Windows), LineKind::Banner);
        assert_eq!(
            classify_line("over a maximum of 30 hops:", Dialect::Windows),
            LineKind::Banner
        );
    }

    #[test]
    fn address_glued_to_punctuation_is_found() {
        let fact = parse_hop_line(" 6  8.8.8.8:  12 ms", Dialect::Unix).unwrap();
        assert_eq!(fact.ip, "8.8.8.8");
        let fact = parse_hop_line(" 7  from=1.1.1.1;  3 ms", Dialect::Unix).unwrap();
        assert_eq!(fact.ip, "1.1.1.1");
        assert_eq!(fact.latency_ms, 3);
    }

    #[test]
    fn fractional_latency_rounds() {
        let fact = parse_hop_line(" 2  8.8.8.8  24.6 ms  25.1 ms  23.9 ms", Dialect::Unix).unwrap();
        assert_eq!(fact.latency_ms, 25);
    }

    #[test]
    fn glued_unit_is_accepted() {
        assert_eq!(parse_latency("3.4ms", None, "ms"), Some(3));
        assert_eq!(parse_latency("3.4", Some("ms"), "ms"), Some(3));
        assert_eq!(parse_latency("3.4", Some("8.8.8.8"), "ms"), None);
        assert_eq!(parse_latency("<1", Some("ms"), "ms"), Some(0));
    }

    #[test]
    fn missing_latency_defaults_to_zero() {
        let fact = parse_hop_line("4  1.1.1.1", Dialect::Unix).unwrap();
        assert_eq!(fact.latency_ms, 0);
    }

    #[test]
    fn timeout_slot_is_classified() {
        assert_eq!(
            classify_line(" 5  * * *", Dialect::Unix),
            LineKind::Timeout { hop_number: 5 }
        );
        assert_eq!(
            classify_line("  7     *        *        *     Request timed out.", Dialect::Windows),
            LineKind::Timeout { hop_number: 7 }
        );
    }

    #[test]
    fn private_ranges_are_filtered() {
        for ip in ["10.1.2.3", "172.16.0.1", "172.31.255.254", "192.168.1.1"] {
            let line = format!("1  {ip}  1 ms");
            assert!(matches!(
                classify_line(&line, Dialect::Unix),
                LineKind::Private { hop_number: 1, .. }
            ));
        }
        assert!(parse_hop_line("1  172.32.0.1  1 ms", Dialect::Unix).is_some());
    }

    #[test]
    fn hostname_is_taken_from_named_line() {
        let fact = parse_hop_line(
            " 3  ae-1.r01.example.net (203.0.113.9)  9.812 ms",
            Dialect::Unix,
        )
        .unwrap();
        assert_eq!(fact.hostname, "ae-1.r01.example.net");
        assert_eq!(fact.ip, "203.0.113.9");

        let fact = parse_hop_line("  9    14 ms    13 ms    14 ms  dns.google [8.8.8.8]", Dialect::Windows)
            .unwrap();
        assert_eq!(fact.hostname, "dns.google");
        assert_eq!(fact.latency_ms, 14);
    }

    #[test]
    fn dialect_parses_from_config_strings() {
        assert_eq!("unix".parse::<Dialect>().unwrap(), Dialect::Unix);
        assert_eq!("Windows".parse::<Dialect>().unwrap(), Dialect::Windows);
        assert_eq!("auto".parse::<Dialect>().unwrap(), Dialect::host());
        assert!("plan9".parse::<Dialect>().is_err());
    }
}
