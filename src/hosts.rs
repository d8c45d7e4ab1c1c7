use crate::config::{HostsSettings, RedisSettings};
use crate::error::MimirError;
use crate::util::{is_domain, is_ip};
use parking_lot::RwLock;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Address family a hosts lookup resolves for. Drives literal parsing:
/// values that do not parse for the requested family are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

fn parse_for_family(raw: &str, family: IpFamily) -> Option<IpAddr> {
    match family {
        IpFamily::V4 => raw.parse::<Ipv4Addr>().ok().map(IpAddr::V4),
        IpFamily::V6 => raw.parse::<Ipv6Addr>().ok().map(IpAddr::V6),
    }
}

/// Parse `/etc/hosts`-style content: `ip name [name...]`, `#` comments,
/// tabs treated as spaces. Names are stored lowercased; one name may
/// accumulate addresses from several lines.
fn parse_hosts(content: &str) -> HashMap<String, Vec<String>> {
    let mut table: HashMap<String, Vec<String>> = HashMap::new();

    for line in content.lines() {
        let line = line.replace('\t', " ");
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split_whitespace();
        let Some(ip) = fields.next() else { continue };
        if !is_ip(ip) {
            continue;
        }

        for name in fields {
            if name.starts_with('#') {
                break;
            }
            if !is_domain(name) {
                continue;
            }
            table
                .entry(name.to_ascii_lowercase())
                .or_default()
                .push(ip.to_string());
        }
    }

    table
}

/// Match `name` against wildcard keys of the form `*.<parent>`: the
/// wildcard applies when both sides share the same effective TLD+1.
fn wildcard_match<'a>(table: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    let name_root = psl::domain_str(name)?;
    for (key, value) in table {
        let Some(parent) = key.strip_prefix("*.") else {
            continue;
        };
        if psl::domain_str(parent) == Some(name_root) {
            return Some(value.as_str());
        }
    }
    None
}

/// Hosts table backed by a local file, reloaded on every refresh tick.
pub struct FileHosts {
    path: PathBuf,
    table: RwLock<HashMap<String, Vec<String>>>,
}

impl FileHosts {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let hosts = Self {
            path: path.into(),
            table: RwLock::new(HashMap::new()),
        };
        hosts.refresh();
        hosts
    }

    /// Re-read the file and swap in the new snapshot. On failure the
    /// previous snapshot stays.
    pub fn refresh(&self) {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => {
                let table = parse_hosts(&content);
                debug!("hosts file {} loaded, {} names", self.path.display(), table.len());
                *self.table.write() = table;
            }
            Err(e) => warn!("failed to read hosts file {}: {}", self.path.display(), e),
        }
    }

    fn get(&self, name: &str, family: IpFamily) -> Vec<IpAddr> {
        let table = self.table.read();
        let Some(values) = table.get(name) else {
            return Vec::new();
        };
        values
            .iter()
            .filter_map(|raw| parse_for_family(raw, family))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }
}

/// Hosts table mirrored from a Redis hash. Values are comma-separated
/// IP literals; quoted elements are an unfinished TXT extension in the
/// data format and are skipped.
pub struct RedisHosts {
    conn: ConnectionManager,
    key: String,
    table: RwLock<HashMap<String, String>>,
}

impl RedisHosts {
    pub async fn connect(settings: &RedisSettings, key: &str) -> Result<Self, MimirError> {
        let client = redis::Client::open(settings.url())
            .map_err(|e| MimirError::Redis(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| MimirError::Redis(format!("failed to connect: {e}")))?;
        info!("connected to redis hosts backend at {}", settings.addr());

        let hosts = Self {
            conn,
            key: key.to_string(),
            table: RwLock::new(HashMap::new()),
        };
        hosts.refresh().await;
        Ok(hosts)
    }

    /// Re-fetch the whole hash and swap in the new snapshot. On failure
    /// the previous snapshot stays.
    pub async fn refresh(&self) {
        let mut conn = self.conn.clone();
        match conn
            .hgetall::<_, HashMap<String, String>>(&self.key)
            .await
        {
            Ok(raw) => {
                let table: HashMap<String, String> = raw
                    .into_iter()
                    .map(|(k, v)| (k.to_ascii_lowercase(), v))
                    .collect();
                debug!("redis hosts key {} loaded, {} names", self.key, table.len());
                *self.table.write() = table;
            }
            Err(e) => warn!("failed to fetch redis hosts key {}: {}", self.key, e),
        }
    }

    fn get(&self, name: &str, family: IpFamily) -> Vec<IpAddr> {
        let table = self.table.read();
        let value = match table.get(name) {
            Some(value) => value.as_str(),
            None => match wildcard_match(&table, name) {
                Some(value) => value,
                None => return Vec::new(),
            },
        };

        value
            .split(',')
            .map(str::trim)
            .filter(|element| !element.starts_with('"'))
            .filter_map(|element| parse_for_family(element, family))
            .collect()
    }
}

/// The hosts overlay: local file first, then the remote table. A single
/// background task refreshes both snapshots; the overlay owns its
/// cancellation handle so shutdown stops the ticker deterministically.
pub struct Hosts {
    file: Option<FileHosts>,
    remote: Option<RedisHosts>,
    shutdown: broadcast::Sender<()>,
}

impl Hosts {
    pub async fn new(
        settings: &HostsSettings,
        redis: &RedisSettings,
    ) -> Result<Arc<Self>, MimirError> {
        let file = (!settings.host_file.is_empty())
            .then(|| FileHosts::new(settings.host_file.clone()));

        let remote = if settings.redis_enable {
            Some(RedisHosts::connect(redis, &settings.redis_key).await?)
        } else {
            None
        };

        let (shutdown, _) = broadcast::channel(1);
        let hosts = Arc::new(Self {
            file,
            remote,
            shutdown,
        });

        hosts
            .clone()
            .spawn_refresher(Duration::from_secs(settings.refresh_interval.max(1)));
        Ok(hosts)
    }

    fn spawn_refresher(self: Arc<Self>, every: Duration) {
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // the initial snapshot was taken at construction
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("hosts refresher stopping");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Some(file) = &self.file {
                            file.refresh();
                        }
                        if let Some(remote) = &self.remote {
                            remote.refresh().await;
                        }
                    }
                }
            }
        });
    }

    /// Stop the background refresher.
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }

    /// Look `name` up for the given family. The file table wins; the
    /// remote table is consulted only when the file yields nothing.
    pub fn get(&self, name: &str, family: IpFamily) -> Option<Vec<IpAddr>> {
        let name = name.to_ascii_lowercase();

        if let Some(file) = &self.file {
            let ips = file.get(&name, family);
            if !ips.is_empty() {
                return Some(ips);
            }
        }

        if let Some(remote) = &self.remote {
            let ips = remote.get(&name, family);
            if !ips.is_empty() {
                return Some(ips);
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosts_lines_parse() {
        let content = "\
# comment
10.0.0.5 foo.local
10.0.0.6\tbar.local baz.local
2001:db8::1 foo.local
300.1.1.1 broken.local
10.0.0.7 UPPER.Example.COM
";
        let table = parse_hosts(content);
        assert_eq!(table["foo.local"], vec!["10.0.0.5", "2001:db8::1"]);
        assert_eq!(table["bar.local"], vec!["10.0.0.6"]);
        assert_eq!(table["baz.local"], vec!["10.0.0.6"]);
        assert_eq!(table["upper.example.com"], vec!["10.0.0.7"]);
        assert!(!table.contains_key("broken.local"));
    }

    #[test]
    fn single_label_names_are_skipped() {
        let table = parse_hosts("127.0.0.1 localhost\n10.0.0.5 foo.local\n");
        assert!(!table.contains_key("localhost"));
        assert!(table.contains_key("foo.local"));
    }

    #[test]
    fn family_filters_values() {
        let content = "10.0.0.5 dual.local\n2001:db8::1 dual.local\n";
        let table = parse_hosts(content);
        let values = &table["dual.local"];

        let v4: Vec<IpAddr> = values
            .iter()
            .filter_map(|raw| parse_for_family(raw, IpFamily::V4))
            .collect();
        let v6: Vec<IpAddr> = values
            .iter()
            .filter_map(|raw| parse_for_family(raw, IpFamily::V6))
            .collect();

        assert_eq!(v4, vec!["10.0.0.5".parse::<IpAddr>().unwrap()]);
        assert_eq!(v6, vec!["2001:db8::1".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn wildcard_matches_on_effective_tld_plus_one() {
        let mut table = HashMap::new();
        table.insert("*.example.com".to_string(), "10.1.1.1".to_string());
        table.insert("*.sample.co.uk".to_string(), "10.2.2.2".to_string());

        assert_eq!(wildcard_match(&table, "www.example.com"), Some("10.1.1.1"));
        assert_eq!(
            wildcard_match(&table, "deep.a.b.example.com"),
            Some("10.1.1.1")
        );
        assert_eq!(
            wildcard_match(&table, "api.sample.co.uk"),
            Some("10.2.2.2")
        );
        assert_eq!(wildcard_match(&table, "example.org"), None);
        // same parent label under a different registrable domain
        assert_eq!(wildcard_match(&table, "www.example.net"), None);
    }
}
