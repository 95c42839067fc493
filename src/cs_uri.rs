// URI grammar shared by registry addresses and acceptor advertisements:
//   tcp://host:port, silkit://host:port[/simulation], local:///absolute/path

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

use crate::cs_error::{CsError, Result};
use crate::cs_interface::DEFAULT_REGISTRY_PORT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UriKind {
    Tcp,
    Local,
    /// Registry alias, carried over TCP
    SilKit,
}

impl UriKind {
    fn scheme(self) -> &'static str {
        match self {
            UriKind::Tcp => "tcp",
            UriKind::Local => "local",
            UriKind::SilKit => "silkit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uri {
    kind: UriKind,
    /// As written, IPv6 hosts keep their brackets
    host: String,
    port: u16,
    path: String,
}

/// Address classification used when deciding which acceptor URIs to try or forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UriInfo {
    pub ip4: bool,
    pub ip6: bool,
    pub catchall_ip: bool,
    pub loopback_ip: bool,
    /// Local-domain socket or tcp loopback
    pub local: bool,
}

impl Uri {
    pub fn parse(raw: &str) -> Result<Uri> {
        let (scheme, rest) = raw.split_once("://").ok_or_else(|| {
            CsError::configuration(format!("could not find scheme separator in uri '{}'", raw))
        })?;

        let kind = match scheme {
            "tcp" => UriKind::Tcp,
            "silkit" => UriKind::SilKit,
            "local" => UriKind::Local,
            other => {
                return Err(CsError::configuration(format!(
                    "unknown uri scheme '{}' in '{}'",
                    other, raw
                )))
            }
        };

        if kind == UriKind::Local {
            // may contain ':' and is taken verbatim
            if rest.is_empty() {
                return Err(CsError::configuration(format!("local uri '{}' has no path", raw)));
            }
            return Ok(Uri {
                kind,
                host: String::new(),
                port: 0,
                path: rest.to_string(),
            });
        }

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], validate_simulation_name(&rest[idx..])?),
            None => (rest, String::new()),
        };

        let (host, port_str) = if authority.starts_with('[') {
            let close = authority.find(']').ok_or_else(|| {
                CsError::configuration(format!("unterminated ipv6 host in '{}'", raw))
            })?;
            let host = &authority[..=close];
            let tail = &authority[close + 1..];
            match tail.strip_prefix(':') {
                Some(p) => (host, Some(p)),
                None if tail.is_empty() => (host, None),
                None => {
                    return Err(CsError::configuration(format!(
                        "unexpected characters after ipv6 host in '{}'",
                        raw
                    )))
                }
            }
        } else {
            match authority.rsplit_once(':') {
                Some((h, p)) => (h, Some(p)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(CsError::configuration(format!("uri '{}' has no host", raw)));
        }

        let port = match port_str {
            None => DEFAULT_REGISTRY_PORT,
            Some("") => {
                return Err(CsError::configuration(format!(
                    "uri '{}' has a port separator but no port",
                    raw
                )))
            }
            Some(p) => p.parse::<u16>().map_err(|_| {
                CsError::configuration(format!("failed to parse port number '{}' in '{}'", p, raw))
            })?,
        };

        Ok(Uri {
            kind,
            host: host.to_string(),
            port,
            path,
        })
    }

    pub fn tcp(host: &str, port: u16) -> Uri {
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]", host)
        } else {
            host.to_string()
        };
        Uri {
            kind: UriKind::Tcp,
            host,
            port,
            path: String::new(),
        }
    }

    pub fn local(path: impl Into<PathBuf>) -> Uri {
        Uri {
            kind: UriKind::Local,
            host: String::new(),
            port: 0,
            path: path.into().to_string_lossy().into_owned(),
        }
    }

    pub fn kind(&self) -> UriKind {
        self.kind
    }

    /// Host as written in the uri (IPv6 in brackets).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Host suitable for resolution, brackets removed.
    pub fn bare_host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_local(&self) -> bool {
        self.kind == UriKind::Local
    }

    /// Tcp and silkit uris are both connected over TCP.
    pub fn is_tcp(&self) -> bool {
        matches!(self.kind, UriKind::Tcp | UriKind::SilKit)
    }

    pub fn info(&self) -> UriInfo {
        if self.is_local() {
            return UriInfo {
                local: true,
                ..UriInfo::default()
            };
        }
        match self.bare_host().parse::<IpAddr>() {
            Ok(addr) => UriInfo {
                ip4: addr.is_ipv4(),
                ip6: addr.is_ipv6(),
                catchall_ip: addr.is_unspecified(),
                loopback_ip: addr.is_loopback(),
                local: addr.is_loopback(),
            },
            // host names carry no address information
            Err(_) => UriInfo::default(),
        }
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            UriKind::Local => write!(f, "local://{}", self.path),
            kind => write!(f, "{}://{}:{}{}", kind.scheme(), self.host, self.port, self.path),
        }
    }
}

impl std::str::FromStr for Uri {
    type Err = CsError;

    fn from_str(s: &str) -> Result<Uri> {
        Uri::parse(s)
    }
}

/// Socket path for a local-domain acceptor.
///
/// Unix socket paths are limited to roughly 100 bytes, so the path lives in the temp
/// directory with a bounded name prefix and a hash of the distinguishing values.
pub fn local_socket_path(participant_name: &str, unique: &str) -> PathBuf {
    let prefix: String = participant_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(10)
        .collect();

    let mut hasher = blake3::Hasher::new();
    hasher.update(participant_name.as_bytes());
    hasher.update(unique.as_bytes());
    if let Ok(cwd) = std::env::current_dir() {
        hasher.update(cwd.to_string_lossy().as_bytes());
    }
    let digest = hasher.finalize();
    let mut id = [0u8; 8];
    id.copy_from_slice(&digest.as_bytes()[..8]);

    std::env::temp_dir().join(format!("{}{:016x}.cslink", prefix, u64::from_le_bytes(id)))
}

// the root path corresponds to the default (empty) simulation name
fn validate_simulation_name(path: &str) -> Result<String> {
    let mut out = String::new();
    let chars: Vec<char> = path.chars().collect();
    for (pos, &ch) in chars.iter().enumerate() {
        if ch == '/' {
            if chars.get(pos + 1) == Some(&'/') {
                return Err(CsError::configuration(
                    "simulation name may not contain multiple consecutive slashes",
                ));
            }
            if pos == 0 {
                continue;
            }
        } else if !(ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.' | '~')) {
            return Err(CsError::configuration(
                "simulation name may only contain a-z, A-Z, 0-9, _, -, ., ~, and / characters",
            ));
        }
        out.push(ch);
    }
    if out.is_empty() {
        Ok(String::new())
    } else {
        Ok(format!("/{}", out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_socket_path_is_short_and_distinct() {
        let a = local_socket_path("A participant with a long name", "1");
        let b = local_socket_path("A participant with a long name", "2");
        assert_ne!(a, b);
        assert_eq!(a, local_socket_path("A participant with a long name", "1"));
        let file = a.file_name().unwrap().to_string_lossy().into_owned();
        assert!(file.starts_with("Aparticipa"));
        assert!(file.ends_with(".cslink"));
        assert_eq!(file.len(), 10 + 16 + ".cslink".len());
    }

    #[test]
    fn test_parse_tcp_with_port() {
        let uri = Uri::parse("tcp://192.168.0.10:41234").unwrap();
        assert_eq!(uri.kind(), UriKind::Tcp);
        assert_eq!(uri.host(), "192.168.0.10");
        assert_eq!(uri.port(), 41234);
        assert_eq!(uri.to_string(), "tcp://192.168.0.10:41234");
    }

    #[test]
    fn test_silkit_defaults_to_registry_port() {
        let uri = Uri::parse("silkit://localhost").unwrap();
        assert_eq!(uri.kind(), UriKind::SilKit);
        assert!(uri.is_tcp());
        assert_eq!(uri.port(), 8500);
        assert_eq!(uri.to_string(), "silkit://localhost:8500");
    }

    #[test]
    fn test_silkit_with_simulation_name() {
        let uri = Uri::parse("silkit://localhost:8501/sim-a").unwrap();
        assert_eq!(uri.path(), "/sim-a");
        assert!(Uri::parse("silkit://localhost:8501/a//b").is_err());
        assert!(Uri::parse("silkit://localhost:8501/a b").is_err());
    }

    #[test]
    fn test_ipv6_hosts() {
        let uri = Uri::parse("tcp://[::1]:9000").unwrap();
        assert_eq!(uri.host(), "[::1]");
        assert_eq!(uri.bare_host(), "::1");
        assert_eq!(uri.port(), 9000);
        assert!(uri.info().ip6);
        assert!(uri.info().loopback_ip);

        let uri = Uri::parse("tcp://[::]").unwrap();
        assert_eq!(uri.port(), 8500);
        assert!(uri.info().catchall_ip);

        assert_eq!(Uri::tcp("::1", 5).to_string(), "tcp://[::1]:5");
    }

    #[test]
    fn test_local_path_kept_verbatim() {
        let uri = Uri::parse("local:///tmp/silkit/p1:a.sock").unwrap();
        assert!(uri.is_local());
        assert_eq!(uri.path(), "/tmp/silkit/p1:a.sock");
        assert_eq!(uri.to_string(), "local:///tmp/silkit/p1:a.sock");
        assert!(uri.info().local);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(Uri::parse("localhost:8500"), Err(CsError::Configuration(_))));
        assert!(matches!(Uri::parse("udp://host:1"), Err(CsError::Configuration(_))));
        assert!(matches!(Uri::parse("tcp://host:"), Err(CsError::Configuration(_))));
        assert!(matches!(Uri::parse("tcp://host:70000"), Err(CsError::Configuration(_))));
        assert!(matches!(Uri::parse("tcp://:80"), Err(CsError::Configuration(_))));
        assert!(matches!(Uri::parse("local://"), Err(CsError::Configuration(_))));
    }

    #[test]
    fn test_uri_info_classification() {
        let catchall = Uri::parse("tcp://0.0.0.0:1").unwrap().info();
        assert!(catchall.ip4 && catchall.catchall_ip && !catchall.loopback_ip);

        let loopback = Uri::parse("tcp://127.0.0.1:1").unwrap().info();
        assert!(loopback.loopback_ip && loopback.local);

        let named = Uri::parse("tcp://registry.example:1").unwrap().info();
        assert_eq!(named, UriInfo::default());
    }
}
