//! CONNECT authority parsing and host/port splitting

/// Host and port extracted from a CONNECT authority or Host header
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HostPort {
  pub(crate) host: String,
  pub(crate) port: u16,
}

/// Strip an optional `:port` suffix from an authority string.
///
/// Bracketed IPv6 literals lose their brackets (`[::1]:8080` becomes `::1`).
/// A string that does not split cleanly into host and port — no colon, or
/// several colons without brackets (a bare IPv6 literal) — is returned whole.
pub fn strip_port(authority: &str) -> String {
  if let Some(rest) = authority.strip_prefix('[') {
    if let Some(end) = rest.find(']') {
      return rest[..end].to_string();
    }
  }
  match authority.rfind(':') {
    Some(idx) if !authority[..idx].contains(':') => authority[..idx].to_string(),
    _ => authority.to_string(),
  }
}

/// Split an authority into host and port, falling back to `default_port`
/// when the port is absent or unparseable.
pub(crate) fn parse_authority(authority: &str, default_port: u16) -> HostPort {
  if let Some(rest) = authority.strip_prefix('[') {
    if let Some(end) = rest.find(']') {
      let host = rest[..end].to_string();
      let port = rest[end + 1..]
        .strip_prefix(':')
        .and_then(|p| p.parse().ok())
        .unwrap_or(default_port);
      return HostPort { host, port };
    }
  }
  match authority.rfind(':') {
    Some(idx) if !authority[..idx].contains(':') => {
      let port = authority[idx + 1..].parse().unwrap_or(default_port);
      HostPort {
        host: authority[..idx].to_string(),
        port,
      }
    }
    _ => HostPort {
      host: authority.to_string(),
      port: default_port,
    },
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn strip_port_hostnames_and_ips() {
    assert_eq!(strip_port("example.com:443"), "example.com");
    assert_eq!(strip_port("localhost:8080"), "localhost");
    assert_eq!(strip_port("192.168.1.1:80"), "192.168.1.1");
    assert_eq!(strip_port("example.com"), "example.com");
  }

  #[test]
  fn strip_port_ipv6() {
    assert_eq!(strip_port("[::1]:8080"), "::1");
    assert_eq!(strip_port("[2001:db8::1]:443"), "2001:db8::1");
    // bare IPv6 literal stays whole
    assert_eq!(strip_port("2001:db8::1"), "2001:db8::1");
  }

  #[test]
  fn parse_authority_defaults() {
    assert_eq!(
      parse_authority("example.com:8443", 443),
      HostPort {
        host: "example.com".into(),
        port: 8443
      }
    );
    assert_eq!(
      parse_authority("example.com", 443),
      HostPort {
        host: "example.com".into(),
        port: 443
      }
    );
    assert_eq!(
      parse_authority("[2001:db8::1]:444", 443),
      HostPort {
        host: "2001:db8::1".into(),
        port: 444
      }
    );
    assert_eq!(
      parse_authority("[::1]", 443),
      HostPort {
        host: "::1".into(),
        port: 443
      }
    );
  }
}
