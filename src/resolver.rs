use crate::config::ResolvSettings;
use crate::error::MimirError;
use crate::suffix_tree::SuffixTree;
use crate::util::{is_ip, unfqdn};
use hickory_proto::op::{Edns, Message, ResponseCode};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Largest UDP payload we advertise via EDNS0 and accept from upstreams.
pub const MAX_UDP_PAYLOAD: u16 = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
        }
    }
}

/// Every candidate upstream failed: timeout, socket error, or SERVFAIL.
#[derive(Debug, Clone, Error)]
#[error("{} via {} resolv failed on {}", qname, net, nameservers.join("; "))]
pub struct ResolveError {
    pub qname: String,
    pub net: &'static str,
    pub nameservers: Vec<String>,
}

/// Forwarding resolver: selects candidate upstreams for a name and races
/// them with a staggered fan-out. The upstream list and the per-domain
/// routing tree are immutable after construction.
pub struct Resolver {
    servers: Vec<String>,
    domain_servers: SuffixTree,
    timeout: Duration,
    interval: Duration,
    set_edns0: bool,
}

impl Resolver {
    pub fn new(settings: &ResolvSettings) -> Result<Self, MimirError> {
        let mut servers = Vec::new();
        let mut domain_servers = SuffixTree::new();

        if !settings.resolv_file.is_empty() {
            let content = std::fs::read_to_string(&settings.resolv_file).map_err(|e| {
                MimirError::Config(format!(
                    "{} is not a valid resolv file: {}",
                    settings.resolv_file, e
                ))
            })?;
            parse_resolv_conf(&content, &mut servers);
        }

        if !settings.server_list_file.is_empty() {
            for path in settings.server_list_file.split(';') {
                let path = path.trim();
                if path.is_empty() {
                    continue;
                }
                let content = std::fs::read_to_string(path).map_err(|e| {
                    MimirError::Config(format!("{path} is not a valid server list file: {e}"))
                })?;
                parse_server_list(&content, &mut servers, &mut domain_servers);
            }
        }

        if servers.is_empty() && domain_servers.is_empty() {
            return Err(MimirError::Config(
                "no upstream nameservers configured".to_string(),
            ));
        }

        Ok(Self::from_parts(
            servers,
            domain_servers,
            Duration::from_secs(settings.timeout),
            Duration::from_millis(settings.interval),
            settings.set_edns0,
        ))
    }

    pub fn from_parts(
        servers: Vec<String>,
        domain_servers: SuffixTree,
        timeout: Duration,
        interval: Duration,
        set_edns0: bool,
    ) -> Self {
        Self {
            servers,
            domain_servers,
            timeout,
            interval,
            set_edns0,
        }
    }

    /// Candidate upstreams for `qname`, most specific routing first, then
    /// the general list in file order. Earlier entries get a head start.
    pub fn nameservers(&self, qname: &str) -> Vec<String> {
        let mut candidates = Vec::with_capacity(self.servers.len() + 1);
        if let Some(ip) = self.domain_servers.search_name(qname) {
            debug!("{} routed to {} by server list", qname, ip);
            candidates.push(with_port(ip, 53));
        }
        candidates.extend(self.servers.iter().cloned());
        candidates
    }

    /// Race the candidates: one exchange task per upstream, spawned
    /// `interval` apart, first usable answer wins. SERVFAIL means try
    /// another; any other rcode ends the race. Losing tasks are never
    /// cancelled, they drain against their own deadlines.
    pub async fn lookup(&self, net: Transport, request: &Message) -> Result<Message, ResolveError> {
        let qname = request
            .queries()
            .first()
            .map(|q| unfqdn(&q.name().to_ascii()).to_ascii_lowercase())
            .unwrap_or_default();
        let nameservers = self.nameservers(&qname);

        let fail = |qname: String, nameservers: Vec<String>| ResolveError {
            qname,
            net: net.as_str(),
            nameservers,
        };

        let mut request = request.clone();
        if net == Transport::Udp && self.set_edns0 {
            let mut edns = Edns::new();
            edns.set_version(0);
            edns.set_max_payload(MAX_UDP_PAYLOAD);
            request.extensions_mut().replace(edns);
        }

        let payload = match request.to_vec() {
            Ok(payload) => Arc::new(payload),
            Err(e) => {
                warn!("{} failed to serialize: {}", qname, e);
                return Err(fail(qname, nameservers));
            }
        };

        // capacity-1 plus try_send picks exactly one winner
        let (tx, mut rx) = mpsc::channel::<Message>(1);
        let mut tasks = Vec::with_capacity(nameservers.len());

        for server in &nameservers {
            let tx = tx.clone();
            let payload = payload.clone();
            let server_c = server.clone();
            let qname_c = qname.clone();
            let io_timeout = self.timeout;

            tasks.push(tokio::spawn(async move {
                match exchange(net, &server_c, &payload, io_timeout).await {
                    Ok(response) => {
                        if response.response_code() == ResponseCode::ServFail {
                            debug!("{} got SERVFAIL on {}, trying next", qname_c, server_c);
                            return;
                        }
                        let _ = tx.try_send(response);
                    }
                    Err(e) => warn!("{} exchange on {} failed: {}", qname_c, server_c, e),
                }
            }));

            match timeout(self.interval, rx.recv()).await {
                Ok(Some(response)) => {
                    debug!("{} resolved on {} ({})", qname, server, net.as_str());
                    return Ok(response);
                }
                Ok(None) => break,
                Err(_) => {} // stagger elapsed, fan out to the next candidate
            }
        }
        drop(tx);

        // everyone is in flight; accept a late usable answer
        for task in tasks {
            let _ = task.await;
        }
        if let Ok(response) = rx.try_recv() {
            debug!("{} resolved by a late answer", qname);
            return Ok(response);
        }

        Err(fail(qname, nameservers))
    }
}

/// One wire exchange against a single upstream. Read and write deadlines
/// both equal the configured timeout.
async fn exchange(
    net: Transport,
    server: &str,
    payload: &[u8],
    io_timeout: Duration,
) -> Result<Message, MimirError> {
    match net {
        Transport::Udp => {
            let bind_addr = if server.starts_with('[') {
                "[::]:0"
            } else {
                "0.0.0.0:0"
            };
            let socket = UdpSocket::bind(bind_addr).await?;
            socket.connect(server).await?;
            timeout(io_timeout, socket.send(payload))
                .await
                .map_err(|_| MimirError::Timeout)??;

            let mut buf = vec![0u8; MAX_UDP_PAYLOAD as usize];
            let len = timeout(io_timeout, socket.recv(&mut buf))
                .await
                .map_err(|_| MimirError::Timeout)??;
            Ok(Message::from_vec(&buf[..len])?)
        }
        Transport::Tcp => {
            let mut stream = timeout(io_timeout, TcpStream::connect(server))
                .await
                .map_err(|_| MimirError::Timeout)??;

            timeout(io_timeout, async {
                stream
                    .write_all(&(payload.len() as u16).to_be_bytes())
                    .await?;
                stream.write_all(payload).await
            })
            .await
            .map_err(|_| MimirError::Timeout)??;

            let mut len_buf = [0u8; 2];
            let body = timeout(io_timeout, async {
                stream.read_exact(&mut len_buf).await?;
                let mut body = vec![0u8; u16::from_be_bytes(len_buf) as usize];
                stream.read_exact(&mut body).await?;
                Ok::<_, std::io::Error>(body)
            })
            .await
            .map_err(|_| MimirError::Timeout)??;
            Ok(Message::from_vec(&body)?)
        }
    }
}

/// IPv6 literals need brackets before a port can be appended.
fn with_port(ip: &str, port: u16) -> String {
    if ip.contains(':') {
        format!("[{ip}]:{port}")
    } else {
        format!("{ip}:{port}")
    }
}

fn parse_resolv_conf(content: &str, servers: &mut Vec<String>) {
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let mut fields = line.split_whitespace();
        if fields.next() != Some("nameserver") {
            continue;
        }
        match fields.next() {
            Some(ip) if is_ip(ip) => servers.push(with_port(ip, 53)),
            Some(other) => warn!("skipping invalid nameserver entry: {}", other),
            None => {}
        }
    }
}

/// dnsmasq-style entries: `server=/domain/ip` binds a routing suffix,
/// `server=ip[#port]` appends to the general upstream list.
fn parse_server_list(content: &str, servers: &mut Vec<String>, tree: &mut SuffixTree) {
    for line in content.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix("server=") else {
            continue;
        };

        if let Some(body) = rest.strip_prefix('/') {
            match body.split_once('/') {
                Some((domain, ip)) if !domain.is_empty() && is_ip(ip) => {
                    tree.insert_name(domain, ip);
                }
                _ => warn!("skipping invalid server list entry: {}", line),
            }
        } else {
            let (ip, port) = match rest.split_once('#') {
                Some((ip, port)) => (ip, port.parse::<u16>().unwrap_or(53)),
                None => (rest, 53),
            };
            if is_ip(ip) {
                servers.push(with_port(ip, port));
            } else {
                warn!("skipping invalid server list entry: {}", line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolv_conf_entries_append_in_order() {
        let mut servers = Vec::new();
        parse_resolv_conf(
            "# local stub\nnameserver 8.8.8.8\nnameserver 1.1.1.1\noptions ndots:1\n",
            &mut servers,
        );
        assert_eq!(servers, vec!["8.8.8.8:53", "1.1.1.1:53"]);
    }

    #[test]
    fn server_list_splits_routing_and_general() {
        let mut servers = Vec::new();
        let mut tree = SuffixTree::new();
        parse_server_list(
            "server=/office.example.com/10.0.0.2\nserver=9.9.9.9\nserver=8.8.4.4#5353\nbogus\n",
            &mut servers,
            &mut tree,
        );
        assert_eq!(servers, vec!["9.9.9.9:53", "8.8.4.4:5353"]);
        assert_eq!(
            tree.search_name("printer.office.example.com"),
            Some("10.0.0.2")
        );
        assert_eq!(tree.search_name("example.com"), None);
    }

    #[test]
    fn routed_domain_comes_first() {
        let mut tree = SuffixTree::new();
        tree.insert_name("internal.example.com", "10.0.0.2");
        let resolver = Resolver::from_parts(
            vec!["8.8.8.8:53".to_string()],
            tree,
            Duration::from_secs(5),
            Duration::from_millis(200),
            false,
        );

        assert_eq!(
            resolver.nameservers("db.internal.example.com"),
            vec!["10.0.0.2:53", "8.8.8.8:53"]
        );
        assert_eq!(resolver.nameservers("example.org"), vec!["8.8.8.8:53"]);
    }
}
