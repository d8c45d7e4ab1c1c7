use regex::Regex;
use std::net::IpAddr;
use std::sync::LazyLock;

static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-zA-Z0-9\*]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?\.)+[a-zA-Z]{2,6}$")
        .expect("domain regex is valid")
});

/// True when `s` parses as an IPv4 or IPv6 literal.
pub fn is_ip(s: &str) -> bool {
    s.parse::<IpAddr>().is_ok()
}

/// Strict domain check: at least one dot, a 2-6 letter TLD, and no IP literals.
pub fn is_domain(s: &str) -> bool {
    if is_ip(s) {
        return false;
    }
    DOMAIN_RE.is_match(s)
}

/// Strip the trailing dot from a fully-qualified name.
pub fn unfqdn(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}
