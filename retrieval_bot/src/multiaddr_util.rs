use color_eyre::{eyre::eyre, Result};
use multiaddr::{Multiaddr, Protocol};
use tracing::debug;

use crate::errors::RequestError;

/// Decoded form of a strict two-component dialable address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub is_hostname: bool,
    pub port: u16,
}

/// Decodes a multiaddr of exactly the shape `<ip|dns>/tcp/<port>`.
/// Anything else is rejected without network I/O.
pub fn decode_host_port(addr: &Multiaddr) -> Result<HostPort, RequestError> {
    let mut components = addr.iter();

    let (host, is_hostname) = match components.next() {
        Some(Protocol::Ip4(ip)) => (ip.to_string(), false),
        Some(Protocol::Ip6(ip)) => (ip.to_string(), false),
        Some(Protocol::Dns(host))
        | Some(Protocol::Dns4(host))
        | Some(Protocol::Dns6(host))
        | Some(Protocol::Dnsaddr(host)) => (host.to_string(), true),
        _ => return Err(RequestError::NoValidMultiAddr),
    };

    let port = match components.next() {
        Some(Protocol::Tcp(port)) => port,
        _ => return Err(RequestError::NoValidMultiAddr),
    };

    if components.next().is_some() {
        return Err(RequestError::NoValidMultiAddr);
    }

    Ok(HostPort {
        host,
        is_hostname,
        port,
    })
}

/// Decodes raw multiaddr bytes, skipping entries that do not parse.
pub fn bytes_to_multiaddrs(addrs: &[Vec<u8>]) -> Vec<Multiaddr> {
    addrs
        .iter()
        .filter_map(|bytes| match Multiaddr::try_from(bytes.clone()) {
            Ok(addr) => Some(addr),
            Err(err) => {
                debug!("failed to decode multiaddr bytes: {err}");
                None
            }
        })
        .collect()
}

pub fn bytes_to_multiaddr_strings(addrs: &[Vec<u8>]) -> Vec<String> {
    bytes_to_multiaddrs(addrs)
        .iter()
        .map(ToString::to_string)
        .collect()
}

/// Splits a trailing `/p2p/<peer>` component off an endpoint address.
pub fn split_peer_id(addr: Multiaddr) -> (Multiaddr, Option<libp2p::PeerId>) {
    let mut remain = Multiaddr::empty();
    let mut peer = None;
    for component in addr.iter() {
        match component {
            Protocol::P2p(id) => peer = Some(id),
            other => remain.push(other),
        }
    }
    (remain, peer)
}

/// Converts an HTTP(S) endpoint multiaddr to a URL string. The scheme is
/// taken from the explicit http/https component; `/tls/http` counts as
/// https, and a bare host+tcp pair defaults to http.
pub fn multiaddr_to_url(addr: &Multiaddr) -> Result<String> {
    let mut host: Option<String> = None;
    let mut port: Option<u16> = None;
    let mut scheme: Option<&str> = None;
    let mut tls = false;

    for component in addr.iter() {
        match component {
            Protocol::Dns(name) | Protocol::Dns4(name) | Protocol::Dns6(name) => {
                host = Some(name.to_string());
            }
            Protocol::Ip4(ip) => host = Some(ip.to_string()),
            Protocol::Ip6(ip) => host = Some(format!("[{ip}]")),
            Protocol::Tcp(p) => port = Some(p),
            Protocol::Tls => tls = true,
            Protocol::Http => scheme = Some("http"),
            Protocol::Https => scheme = Some("https"),
            _ => {}
        }
    }

    let host = host.ok_or_else(|| eyre!("multiaddr has no host component: {addr}"))?;
    let port = port.ok_or_else(|| eyre!("multiaddr has no tcp port: {addr}"))?;
    let scheme = match scheme {
        Some("http") if tls => "https",
        Some(explicit) => explicit,
        None => "http",
    };

    Ok(format!("{scheme}://{host}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn decodes_ip4_tcp() {
        let addr: Multiaddr = "/ip4/1.2.3.4/tcp/1234".parse().unwrap();
        assert_eq!(
            decode_host_port(&addr).unwrap(),
            HostPort {
                host: "1.2.3.4".to_string(),
                is_hostname: false,
                port: 1234,
            }
        );
    }

    #[test]
    fn decodes_dns4_tcp_as_hostname() {
        let addr: Multiaddr = "/dns4/example.com/tcp/80".parse().unwrap();
        let decoded = decode_host_port(&addr).unwrap();
        assert!(decoded.is_hostname);
        assert_eq!(decoded.host, "example.com");
        assert_eq!(decoded.port, 80);
    }

    #[test]
    fn rejects_udp() {
        let addr: Multiaddr = "/ip4/1.2.3.4/udp/1234".parse().unwrap();
        assert!(matches!(
            decode_host_port(&addr),
            Err(RequestError::NoValidMultiAddr)
        ));
    }

    #[test]
    fn rejects_extra_components() {
        let addr: Multiaddr = "/ip4/1.2.3.4/tcp/1234/http".parse().unwrap();
        assert!(decode_host_port(&addr).is_err());
    }

    #[test]
    fn skips_undecodable_multiaddr_bytes() {
        let good: Multiaddr = "/ip4/1.2.3.4/tcp/1".parse().unwrap();
        let decoded = bytes_to_multiaddrs(&[good.to_vec(), vec![0xff, 0xff, 0xff]]);
        assert_eq!(decoded, vec![good]);
    }

    #[test]
    fn url_conversion_handles_schemes() {
        let cases = [
            ("/ip4/1.2.3.4/tcp/8080/http", "http://1.2.3.4:8080"),
            ("/dns/example.com/tcp/443/https", "https://example.com:443"),
            ("/dns/example.com/tcp/443/tls/http", "https://example.com:443"),
            ("/ip4/1.2.3.4/tcp/8080", "http://1.2.3.4:8080"),
        ];
        for (input, expected) in cases {
            let addr: Multiaddr = input.parse().unwrap();
            assert_eq!(multiaddr_to_url(&addr).unwrap(), expected);
        }
    }

    #[test]
    fn splits_trailing_peer_component() {
        let addr: Multiaddr =
            "/ip4/1.2.3.4/tcp/1234/p2p/12D3KooWD3eckifWpRn9wQpMG9R9hX3sD158z7EqHWmweQAJU5SA"
                .parse()
                .unwrap();
        let (remain, peer) = split_peer_id(addr);
        assert_eq!(remain.to_string(), "/ip4/1.2.3.4/tcp/1234");
        assert!(peer.is_some());
    }
}
