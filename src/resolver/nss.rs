//! The local hosts-file name source.
//!
//! The resolver consults `/etc/hosts` only when the system's name-service
//! switch configuration lists the `files` source for the `hosts`
//! database. When a name maps to several addresses, one is picked
//! uniformly at random.

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::path::Path;

use rand::Rng;
use tracing::debug;

const NSSWITCH_PATH: &str = "/etc/nsswitch.conf";
const HOSTS_PATH: &str = "/etc/hosts";

/// Static host entries, keyed by normalized (lowercase, no trailing dot)
/// name.
#[derive(Debug, Clone, Default)]
pub struct HostsSource {
    enabled: bool,
    table: HashMap<String, Vec<IpAddr>>,
}

fn normalize(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Whether the `hosts` database of an nsswitch configuration lists the
/// `files` source.
fn hosts_uses_files(nsswitch: &str) -> bool {
    for line in nsswitch.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        let Some(sources) = line.strip_prefix("hosts:") else {
            continue;
        };
        return sources.split_whitespace().any(|s| s == "files");
    }
    false
}

fn parse_hosts(content: &str) -> HashMap<String, Vec<IpAddr>> {
    let mut table: HashMap<String, Vec<IpAddr>> = HashMap::new();
    for line in content.lines() {
        let line = line.split('#').next().unwrap_or("");
        let mut fields = line.split_whitespace();
        let Some(addr) = fields.next() else { continue };
        let Ok(ip) = addr.parse::<IpAddr>() else {
            continue;
        };
        for name in fields {
            table.entry(normalize(name)).or_default().push(ip);
        }
    }
    table
}

impl HostsSource {
    /// Reads the running system's configuration. Unreadable files mean
    /// the source is simply disabled.
    pub fn system() -> Self {
        Self::from_paths(Path::new(NSSWITCH_PATH), Path::new(HOSTS_PATH))
            .unwrap_or_else(|err| {
                debug!(error = %err, "local hosts source unavailable");
                Self::disabled()
            })
    }

    pub fn from_paths(nsswitch: &Path, hosts: &Path) -> io::Result<Self> {
        let nsswitch = std::fs::read_to_string(nsswitch)?;
        if !hosts_uses_files(&nsswitch) {
            return Ok(Self::disabled());
        }
        let hosts = std::fs::read_to_string(hosts)?;
        Ok(HostsSource {
            enabled: true,
            table: parse_hosts(&hosts),
        })
    }

    pub fn disabled() -> Self {
        HostsSource::default()
    }

    /// An in-memory source; useful for tests and script-level overrides.
    pub fn from_entries<N, I>(entries: I) -> Self
    where
        N: Into<String>,
        I: IntoIterator<Item = (N, IpAddr)>,
    {
        let mut table: HashMap<String, Vec<IpAddr>> = HashMap::new();
        for (name, ip) in entries {
            table.entry(normalize(&name.into())).or_default().push(ip);
        }
        HostsSource {
            enabled: true,
            table,
        }
    }

    pub fn lookup(&self, host: &str) -> Option<&[IpAddr]> {
        if !self.enabled {
            return None;
        }
        self.table.get(&normalize(host)).map(|ips| ips.as_slice())
    }

    /// One address for `host`, picked uniformly when several are listed.
    pub(crate) fn lookup_random(&self, host: &str) -> Option<IpAddr> {
        let ips = self.lookup(host)?;
        match ips.len() {
            0 => None,
            1 => Some(ips[0]),
            n => Some(ips[rand::thread_rng().gen_range(0..n)]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn nsswitch_gates_the_source() {
        assert!(hosts_uses_files("hosts: files dns\n"));
        assert!(hosts_uses_files("passwd: compat\nhosts:\tfiles mdns4_minimal dns\n"));
        assert!(!hosts_uses_files("hosts: dns\n"));
        assert!(!hosts_uses_files("# hosts: files\n"));
        assert!(!hosts_uses_files(""));
    }

    #[test]
    fn hosts_parsing_skips_comments_and_junk() {
        let table = parse_hosts(
            "127.0.0.1 localhost localhost.localdomain\n\
             # a comment\n\
             ::1 localhost\n\
             not-an-ip some.host\n\
             10.0.0.7 app.internal # trailing comment\n",
        );
        assert_eq!(table["localhost"].len(), 2);
        assert_eq!(
            table["app.internal"],
            vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))]
        );
        assert!(!table.contains_key("some.host"));
    }

    #[test]
    fn lookup_normalizes_case_and_trailing_dot() {
        let source = HostsSource::from_entries([
            ("App.Internal", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))),
            ("v6.internal", IpAddr::V6(Ipv6Addr::LOCALHOST)),
        ]);
        assert!(source.lookup("app.internal.").is_some());
        assert!(source.lookup("APP.INTERNAL").is_some());
        assert!(source.lookup("missing.internal").is_none());
    }

    #[test]
    fn random_pick_stays_within_the_entry_set() {
        let ips = [
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)),
        ];
        let source =
            HostsSource::from_entries(ips.iter().map(|ip| ("multi.internal", *ip)));
        for _ in 0..50 {
            let picked = source.lookup_random("multi.internal").unwrap();
            assert!(ips.contains(&picked));
        }
    }

    #[test]
    fn disabled_source_answers_nothing() {
        let source = HostsSource::disabled();
        assert!(source.lookup("localhost").is_none());
        assert!(source.lookup_random("localhost").is_none());
    }

    #[test]
    fn file_backed_source_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let nsswitch = dir.path().join("nsswitch.conf");
        let hosts = dir.path().join("hosts");
        std::fs::write(&nsswitch, "hosts: files dns\n").unwrap();
        std::fs::write(&hosts, "192.0.2.10 fixture.test\n").unwrap();
        let source = HostsSource::from_paths(&nsswitch, &hosts).unwrap();
        assert_eq!(
            source.lookup_random("fixture.test"),
            Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)))
        );

        std::fs::write(&nsswitch, "hosts: dns\n").unwrap();
        let source = HostsSource::from_paths(&nsswitch, &hosts).unwrap();
        assert!(source.lookup("fixture.test").is_none());
    }
}
