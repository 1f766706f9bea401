//! Channel address-literal parsing: `address[#port[#secret]]`.
//!
//! A full `channel.conf`-style name lookup is out of scope here; callers
//! supply an implementation of [`ChannelResolver`] for their own
//! configuration format. This module only handles the literal form.

use std::net::IpAddr;

use crate::error::ProtoError;

/// A resolved endpoint: address family, socket address, and optional
/// shared secret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelSpec {
    pub addr: IpAddr,
    pub port: u16,
    /// IPv6 scope id, if the literal carried a `%scope` suffix.
    pub scope_id: Option<u32>,
    pub secret: Option<String>,
}

impl ChannelSpec {
    /// Parse an `address[#port[#secret]]` literal.
    ///
    /// A bare numeric string (no `.`, `:`, or `#`) is taken as a port on
    /// `127.0.0.1`. A secret of `"*"` means "no secret".
    pub fn parse(literal: &str) -> Result<Self, ProtoError> {
        if literal.chars().all(|c| c.is_ascii_digit()) && !literal.is_empty() {
            let port = literal
                .parse::<u16>()
                .map_err(|_| ProtoError::BadChannelValue(literal.to_string()))?;
            return Ok(ChannelSpec {
                addr: IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
                port,
                scope_id: None,
                secret: None,
            });
        }

        let mut parts = literal.splitn(3, '#');
        let addrscope = parts
            .next()
            .ok_or_else(|| ProtoError::BadChannelValue(literal.to_string()))?;
        let port_part = parts.next();
        let secret_part = parts.next();

        let port = match port_part {
            Some(p) if !p.is_empty() => p
                .parse::<u16>()
                .map_err(|_| ProtoError::BadChannelValue(literal.to_string()))?,
            _ => 0,
        };

        let secret = match secret_part {
            Some("*") | None => None,
            Some(s) => Some(s.to_string()),
        };

        let (addr_text, scope_id) = match addrscope.find('%') {
            Some(idx) => {
                let scope = addrscope[idx + 1..]
                    .parse::<u32>()
                    .map_err(|_| ProtoError::BadChannelValue(literal.to_string()))?;
                (&addrscope[..idx], Some(scope))
            }
            None => (addrscope, None),
        };

        let addr: IpAddr = addr_text
            .parse()
            .map_err(|_| ProtoError::BadChannelValue(literal.to_string()))?;

        if scope_id.is_some() && !matches!(addr, IpAddr::V6(_)) {
            return Err(ProtoError::UnsupportedAddressFamily);
        }

        Ok(ChannelSpec {
            addr,
            port,
            scope_id,
            secret,
        })
    }

    /// The socket address to connect to. `0.0.0.0`/`::` are rewritten to
    /// their loopback equivalent, matching the reference client's
    /// `sending_sockaddr` convention (a channel literal naming "any
    /// address" is a listening convention, not something one dials).
    pub fn sending_addr(&self) -> IpAddr {
        match self.addr {
            IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
            other => other,
        }
    }
}

/// A pluggable lookup from channel name to [`ChannelSpec`], for callers
/// who have their own channel-configuration format (the core only
/// understands address literals, not names).
pub trait ChannelResolver {
    fn resolve(&self, name: &str) -> Option<ChannelSpec>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn bare_port_defaults_to_loopback() {
        let spec = ChannelSpec::parse("6000").unwrap();
        assert_eq!(spec.addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(spec.port, 6000);
        assert_eq!(spec.secret, None);
    }

    #[test]
    fn ipv4_with_port_and_secret() {
        let spec = ChannelSpec::parse("127.0.0.1#6000#s3cret").unwrap();
        assert_eq!(spec.port, 6000);
        assert_eq!(spec.secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn star_secret_means_no_secret() {
        let spec = ChannelSpec::parse("127.0.0.1#6000#*").unwrap();
        assert_eq!(spec.secret, None);
    }

    #[test]
    fn ipv6_with_scope_and_port() {
        let spec = ChannelSpec::parse("fe80::1%3#6000").unwrap();
        assert_eq!(spec.scope_id, Some(3));
        assert_eq!(spec.port, 6000);
    }

    #[test]
    fn port_defaults_to_zero_when_omitted() {
        let spec = ChannelSpec::parse("10.0.0.1").unwrap();
        assert_eq!(spec.port, 0);
    }

    #[test]
    fn garbage_literal_is_bad_channel_value() {
        assert!(matches!(
            ChannelSpec::parse("not an address"),
            Err(ProtoError::BadChannelValue(_))
        ));
    }
}
