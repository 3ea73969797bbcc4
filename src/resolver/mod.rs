//! The caching DNS resolver feeding every outbound connection.
//!
//! Resolution is layered: IP literals pass through verbatim, the local
//! hosts source answers next, and everything else goes through a
//! TTL-aware answer cache in front of the underlying [`BaseResolver`].
//! CNAME links are chased iteratively up to a depth bound, each link
//! cached with its record's TTL, and cycles detected with an observed
//! set. A per-host family-preference map remembers whether the last
//! successful resolution was IPv4 so the cheaper family is tried first
//! next time.
//!
//! All caches are per-resolver-instance and safe under concurrent
//! callers.

pub mod nss;

pub use nss::HostsSource;

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Query;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tracing::trace;

/// Default per-query timeout against the base resolver.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(2);
/// Default bound on CNAME chain length.
pub const DEFAULT_MAX_DEPTH: u8 = 30;
/// Cache lifetime of an answer that carried no records.
const NEGATIVE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("unable to resolve host address `{0}`")]
    Unresolvable(String),
    #[error("CNAME chain too long for `{0}`")]
    ChainTooLong(String),
    #[error("cycle in CNAME chain for `{0}`")]
    Cycle(String),
    #[error("no usable IP network is available")]
    NoNetwork,
    #[error("DNS query for `{0}` timed out")]
    Timeout(String),
    #[error("`{0}` is not a valid host name")]
    InvalidName(String),
    #[error("DNS transport failure while resolving `{name}`")]
    Transport {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// The low-level recursive resolution interface the cache sits on.
#[async_trait]
pub trait BaseResolver: Send + Sync {
    async fn resolve(&self, query: &Query) -> Result<Vec<Record>, ResolverError>;
}

/// Which IP families this machine can actually use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpFamilies {
    pub v4: bool,
    pub v6: bool,
}

impl IpFamilies {
    pub const fn new(v4: bool, v6: bool) -> Self {
        IpFamilies { v4, v6 }
    }

    pub const fn both() -> Self {
        IpFamilies { v4: true, v6: true }
    }

    /// Probes the machine once at startup. A UDP connect performs no I/O
    /// but fails when the address family is unsupported or unrouted.
    pub fn detect() -> Self {
        fn probe(bind: &str, target: &str) -> bool {
            std::net::UdpSocket::bind(bind)
                .and_then(|socket| socket.connect(target))
                .is_ok()
        }
        IpFamilies {
            v4: probe("0.0.0.0:0", "192.0.2.1:53"),
            v6: probe("[::]:0", "[2001:db8::1]:53"),
        }
    }
}

/// An expiring CNAME link.
#[derive(Debug, Clone)]
struct CanonicalName {
    target: Name,
    #[allow(dead_code)]
    ttl: Duration,
    expiry: Instant,
}

struct CachedAnswer {
    records: Vec<Record>,
    expiry: Instant,
}

/// TTL/CNAME-aware caching resolver with family-preference memory.
pub struct CachingResolver {
    base: Arc<dyn BaseResolver>,
    families: IpFamilies,
    hosts: HostsSource,
    query_timeout: Duration,
    answers: Mutex<HashMap<(Name, RecordType), CachedAnswer>>,
    cname: Mutex<HashMap<Name, CanonicalName>>,
    prefer_v4: Mutex<HashMap<Name, bool>>,
}

impl CachingResolver {
    pub fn new(base: Arc<dyn BaseResolver>) -> Self {
        CachingResolver {
            base,
            families: IpFamilies::detect(),
            hosts: HostsSource::system(),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            answers: Mutex::new(HashMap::new()),
            cname: Mutex::new(HashMap::new()),
            prefer_v4: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_families(mut self, families: IpFamilies) -> Self {
        self.families = families;
        self
    }

    pub fn with_hosts(mut self, hosts: HostsSource) -> Self {
        self.hosts = hosts;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Maps a host string to an IP address, following CNAME chains up to
    /// `max_depth` links.
    pub async fn resolve(&self, host: &str, max_depth: u8) -> Result<IpAddr, ResolverError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        if let Some(ip) = self.hosts.lookup_random(host) {
            trace!(host, %ip, "resolved from the local hosts source");
            return Ok(ip);
        }
        let name = normal_name(host)?;
        let name = self.canonical_name(name, max_depth, host)?;
        self.resolve_name(host, name, max_depth).await
    }

    /// Iteratively resolves `name`, chasing and caching CNAME links.
    async fn resolve_name(
        &self,
        requested: &str,
        mut name: Name,
        mut depth: u8,
    ) -> Result<IpAddr, ResolverError> {
        let mut observed = HashSet::new();
        observed.insert(name.clone());
        loop {
            let (ip, cname) = self.lookup(&name).await?;
            if let Some(ip) = ip {
                return Ok(ip);
            }
            let Some(cname) = cname else {
                return Err(ResolverError::Unresolvable(requested.to_string()));
            };
            if depth == 0 {
                return Err(ResolverError::ChainTooLong(requested.to_string()));
            }
            let Some(RData::CNAME(target)) = cname.data() else {
                return Err(ResolverError::Unresolvable(requested.to_string()));
            };
            let target = target.0.to_lowercase();
            if !observed.insert(target.clone()) {
                return Err(ResolverError::Cycle(requested.to_string()));
            }
            let ttl = Duration::from_secs(u64::from(cname.ttl()));
            self.cname.lock().insert(
                name.clone(),
                CanonicalName {
                    target: target.clone(),
                    ttl,
                    expiry: Instant::now() + ttl,
                },
            );
            name = target;
            depth -= 1;
        }
    }

    /// The best current knowledge about `name`'s canonical name, from the
    /// CNAME cache alone. Purges expired links, detects cycles.
    fn canonical_name(
        &self,
        name: Name,
        mut depth: u8,
        requested: &str,
    ) -> Result<Name, ResolverError> {
        let mut cache = self.cname.lock();
        let mut observed = HashSet::new();
        observed.insert(name.clone());
        let now = Instant::now();
        let mut current = name;
        while let Some(entry) = cache.get(&current) {
            if now >= entry.expiry {
                cache.remove(&current);
                return Ok(current);
            }
            if depth == 0 {
                return Err(ResolverError::ChainTooLong(requested.to_string()));
            }
            let next = entry.target.clone();
            if !observed.insert(next.clone()) {
                return Err(ResolverError::Cycle(requested.to_string()));
            }
            current = next;
            depth -= 1;
        }
        Ok(current)
    }

    /// One lookup round for `name`, trying record types in the most
    /// promising order for this host and machine.
    async fn lookup(
        &self,
        name: &Name,
    ) -> Result<(Option<IpAddr>, Option<Record>), ResolverError> {
        match (self.families.v4, self.families.v6) {
            (true, true) => {
                let prefer_v4 = self.prefer_v4.lock().get(name).copied().unwrap_or(false);
                if prefer_v4 {
                    self.lookup_v4_first(name).await
                } else {
                    self.lookup_v6_first(name).await
                }
            }
            (true, false) => self.lookup_single(name, RecordType::A).await,
            (false, true) => self.lookup_single(name, RecordType::AAAA).await,
            (false, false) => Err(ResolverError::NoNetwork),
        }
    }

    /// AAAA before A: the first resolution, and any host whose last
    /// answer was IPv6.
    async fn lookup_v6_first(
        &self,
        name: &Name,
    ) -> Result<(Option<IpAddr>, Option<Record>), ResolverError> {
        let (ip, cname) = self.lookup_family(name, RecordType::AAAA).await?;
        if ip.is_some() {
            return Ok((ip, None));
        }
        if cname.is_some() {
            return Ok((None, cname));
        }
        let (ip, cname) = self.lookup_family(name, RecordType::A).await?;
        if ip.is_some() {
            self.prefer_v4.lock().insert(name.clone(), true);
            return Ok((ip, None));
        }
        if cname.is_some() {
            return Ok((None, cname));
        }
        Err(ResolverError::Unresolvable(name.to_string()))
    }

    /// A before AAAA: hosts whose last answer was IPv4, sparing the
    /// network a doomed AAAA query for v4-only names.
    async fn lookup_v4_first(
        &self,
        name: &Name,
    ) -> Result<(Option<IpAddr>, Option<Record>), ResolverError> {
        let (ip, cname) = self.lookup_family(name, RecordType::A).await?;
        if ip.is_some() {
            return Ok((ip, None));
        }
        if cname.is_some() {
            return Ok((None, cname));
        }
        self.prefer_v4.lock().insert(name.clone(), false);
        let (ip, cname) = self.lookup_family(name, RecordType::AAAA).await?;
        if ip.is_some() {
            return Ok((ip, None));
        }
        if cname.is_some() {
            return Ok((None, cname));
        }
        Err(ResolverError::Unresolvable(name.to_string()))
    }

    async fn lookup_single(
        &self,
        name: &Name,
        rtype: RecordType,
    ) -> Result<(Option<IpAddr>, Option<Record>), ResolverError> {
        let (ip, cname) = self.lookup_family(name, rtype).await?;
        if ip.is_some() || cname.is_some() {
            return Ok((ip, cname));
        }
        Err(ResolverError::Unresolvable(name.to_string()))
    }

    /// A single-type lookup through the answer cache.
    async fn lookup_family(
        &self,
        name: &Name,
        rtype: RecordType,
    ) -> Result<(Option<IpAddr>, Option<Record>), ResolverError> {
        let records = self.cached_query(name, rtype).await?;
        let mut cname = None;
        for record in &records {
            match record.data() {
                Some(RData::A(a)) if rtype == RecordType::A => {
                    return Ok((Some(IpAddr::V4(a.0)), None));
                }
                Some(RData::AAAA(aaaa)) if rtype == RecordType::AAAA => {
                    return Ok((Some(IpAddr::V6(aaaa.0)), None));
                }
                Some(RData::CNAME(_)) => cname = Some(record.clone()),
                _ => {}
            }
        }
        Ok((None, cname))
    }

    /// Answer-cache read with lazy expiry purge; misses query the base
    /// resolver under the per-query timeout and cache whatever comes
    /// back, keyed by `(name, record type)`.
    async fn cached_query(
        &self,
        name: &Name,
        rtype: RecordType,
    ) -> Result<Vec<Record>, ResolverError> {
        let key = (name.clone(), rtype);
        {
            let mut cache = self.answers.lock();
            if let Some(entry) = cache.get(&key) {
                if Instant::now() < entry.expiry {
                    return Ok(entry.records.clone());
                }
                cache.remove(&key);
            }
        }

        let query = Query::query(name.clone(), rtype);
        let records = tokio::time::timeout(self.query_timeout, self.base.resolve(&query))
            .await
            .map_err(|_| ResolverError::Timeout(name.to_string()))??;

        let ttl = records
            .iter()
            .map(|r| Duration::from_secs(u64::from(r.ttl())))
            .min()
            .unwrap_or(NEGATIVE_TTL);
        self.answers.lock().insert(
            key,
            CachedAnswer {
                records: records.clone(),
                expiry: Instant::now() + ttl,
            },
        );
        Ok(records)
    }

    #[cfg(test)]
    fn cached_canonical(&self, name: &Name) -> Option<Name> {
        self.cname.lock().get(name).map(|entry| entry.target.clone())
    }

    #[cfg(test)]
    fn prefers_v4(&self, name: &Name) -> bool {
        self.prefer_v4.lock().get(name).copied().unwrap_or(false)
    }
}

/// Lowercased, fully-qualified form of a host string.
fn normal_name(host: &str) -> Result<Name, ResolverError> {
    let mut name = Name::from_utf8(host)
        .map_err(|_| ResolverError::InvalidName(host.to_string()))?
        .to_lowercase();
    if !name.is_fqdn() {
        name.set_fqdn(true);
    }
    Ok(name)
}
