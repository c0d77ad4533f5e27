//! Target-address validation for dynamic service registration: a service
//! pointed at a loopback/link-local/multicast address, or a hostname
//! already claimed statically, is rejected.

use std::net::{IpAddr, SocketAddr};

use ipnet::{Ipv4Net, Ipv6Net};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("target {0} is not a valid host:port address")]
    NotASocketAddr(String),

    #[error("target {0} resolves to a blocked address (loopback/link-local/multicast)")]
    BlockedAddress(String),

    #[error("hostname {0} is not a valid DNS hostname")]
    InvalidHostname(String),
}

/// Reject loopback, link-local, and multicast targets. Agents registering
/// a genuinely local dependency should use the static config instead,
/// where the operator has reviewed it.
pub fn validate_target(target: &str) -> Result<(), ValidationError> {
    let addr: SocketAddr = target
        .parse()
        .map_err(|_| ValidationError::NotASocketAddr(target.to_string()))?;

    if is_blocked(addr.ip()) {
        return Err(ValidationError::BlockedAddress(target.to_string()));
    }
    Ok(())
}

fn is_blocked(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
                || Ipv4Net::new(v4, 32).map(|n| n.addr().is_loopback()).unwrap_or(false)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                || Ipv6Net::new(v6, 128).map(|n| n.addr().is_loopback()).unwrap_or(false)
        }
    }
}

/// Hostnames must be non-empty, lowercase-able DNS labels joined by dots,
/// with no whitespace or path characters.
pub fn validate_hostname(hostname: &str) -> Result<(), ValidationError> {
    if hostname.is_empty()
        || hostname.len() > 253
        || hostname.contains(['/', ' ', '\t', '\n'])
        || hostname.split('.').any(|label| label.is_empty())
    {
        return Err(ValidationError::InvalidHostname(hostname.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_loopback_target() {
        assert_eq!(
            validate_target("127.0.0.1:9000"),
            Err(ValidationError::BlockedAddress("127.0.0.1:9000".to_string()))
        );
    }

    #[test]
    fn rejects_link_local_target() {
        assert!(validate_target("169.254.1.1:80").is_err());
    }

    #[test]
    fn accepts_routable_target() {
        assert!(validate_target("10.0.5.2:9000").is_ok());
    }

    #[test]
    fn rejects_malformed_target() {
        assert!(validate_target("not-an-address").is_err());
    }

    #[test]
    fn rejects_empty_hostname_label() {
        assert!(validate_hostname("foo..bar.com").is_err());
        assert!(validate_hostname("").is_err());
    }

    #[test]
    fn accepts_normal_hostname() {
        assert!(validate_hostname("notebook.example.com").is_ok());
    }
}
