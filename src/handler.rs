use crate::cache::{
    Entry, MemcachedCache, MemoryCache, Question, RedisCache, ResponseCache, key_gen,
};
use crate::config::Settings;
use crate::error::MimirError;
use crate::hosts::{Hosts, IpFamily};
use crate::resolver::{Resolver, Transport};
use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, RData, Record, RecordType};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-query state machine: hosts, positive cache, negative cache,
/// upstream, in that order.
pub struct Handler {
    resolver: Resolver,
    cache: Arc<dyn ResponseCache>,
    negcache: Arc<dyn ResponseCache>,
    hosts: Option<Arc<Hosts>>,
    hosts_ttl: u32,
}

impl Handler {
    pub async fn new(settings: &Settings) -> Result<Arc<Self>, MimirError> {
        let resolver = Resolver::new(&settings.resolv)?;

        let expire = settings.cache.expire;
        let negative_expire = expire / 2;
        let (cache, negcache): (Arc<dyn ResponseCache>, Arc<dyn ResponseCache>) =
            match settings.cache.backend.as_str() {
                "memory" => (
                    Arc::new(MemoryCache::new(
                        Duration::from_secs(expire),
                        settings.cache.maxcount,
                    )),
                    Arc::new(MemoryCache::new(
                        Duration::from_secs(negative_expire),
                        settings.cache.maxcount,
                    )),
                ),
                "redis" => {
                    let url = settings.redis.url();
                    (
                        Arc::new(RedisCache::connect(&url, "mimir:cache", expire).await?),
                        Arc::new(
                            RedisCache::connect(&url, "mimir:negcache", negative_expire).await?,
                        ),
                    )
                }
                "memcache" => (
                    Arc::new(MemcachedCache::connect(
                        &settings.memcache.servers,
                        "mimir:cache",
                        expire as u32,
                    )?),
                    Arc::new(MemcachedCache::connect(
                        &settings.memcache.servers,
                        "mimir:negcache",
                        negative_expire as u32,
                    )?),
                ),
                other => {
                    return Err(MimirError::Config(format!(
                        "invalid cache backend: {other}"
                    )));
                }
            };

        let hosts = if settings.hosts.enable {
            Some(Hosts::new(&settings.hosts, &settings.redis).await?)
        } else {
            None
        };

        Ok(Arc::new(Self {
            resolver,
            cache,
            negcache,
            hosts,
            hosts_ttl: settings.hosts.ttl,
        }))
    }

    pub fn from_parts(
        resolver: Resolver,
        cache: Arc<dyn ResponseCache>,
        negcache: Arc<dyn ResponseCache>,
        hosts: Option<Arc<Hosts>>,
        hosts_ttl: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            resolver,
            cache,
            negcache,
            hosts,
            hosts_ttl,
        })
    }

    pub fn hosts(&self) -> Option<&Arc<Hosts>> {
        self.hosts.as_ref()
    }

    pub async fn handle_udp(&self, request: Message) -> Message {
        self.process(Transport::Udp, request).await
    }

    pub async fn handle_tcp(&self, request: Message) -> Message {
        self.process(Transport::Tcp, request).await
    }

    async fn process(&self, net: Transport, request: Message) -> Message {
        let Some(query) = request.queries().first().cloned() else {
            return reply_with_code(&request, ResponseCode::FormErr);
        };

        let question = Question::from_query(&query);
        let family = classify(&query);
        debug!("question: {} ({})", question, net.as_str());

        if let (Some(hosts), Some(family)) = (&self.hosts, family) {
            if let Some(ips) = hosts.get(&question.qname, family) {
                debug!("{} found in hosts", question.qname);
                return self.hosts_reply(&request, &query, &ips);
            }
            debug!("{} not found in hosts", question.qname);
        }

        // only A/IN and AAAA/IN go through the caches
        let key = family.map(|_| key_gen(&question));
        if let Some(key) = &key {
            match self.cache.get(key).await {
                Ok(Entry::Positive(mut cached)) => {
                    debug!("{} hit cache", question);
                    // `get` hands back a private copy, so restamping the
                    // transaction id cannot race other readers
                    cached.set_id(request.id());
                    return cached;
                }
                Ok(Entry::Negative) => {}
                Err(e) => debug!("{} missed cache: {}", question, e),
            }

            if self.negcache.get(key).await.is_ok() {
                debug!("{} hit negative cache", question);
                return reply_with_code(&request, ResponseCode::ServFail);
            }
        }

        match self.resolver.lookup(net, &request).await {
            Ok(response) => {
                if let Some(key) = key {
                    if !response.answers().is_empty() {
                        let cache = self.cache.clone();
                        let entry = Entry::Positive(response.clone());
                        let question = question.clone();
                        tokio::spawn(async move {
                            if let Err(e) = cache.set(&key, entry).await {
                                warn!("insert {} into cache failed: {}", question, e);
                            } else {
                                debug!("insert {} into cache", question);
                            }
                        });
                    }
                }
                response
            }
            Err(e) => {
                warn!("{}", e);
                if let Some(key) = key {
                    let negcache = self.negcache.clone();
                    tokio::spawn(async move {
                        let _ = negcache.set(&key, Entry::Negative).await;
                    });
                }
                reply_with_code(&request, ResponseCode::ServFail)
            }
        }
    }

    /// Synthesize a reply from the hosts overlay: one record per address,
    /// with the configured TTL.
    fn hosts_reply(&self, request: &Message, query: &Query, ips: &[IpAddr]) -> Message {
        let mut reply = reply_with_code(request, ResponseCode::NoError);
        for ip in ips {
            let rdata = match ip {
                IpAddr::V4(v4) => RData::A((*v4).into()),
                IpAddr::V6(v6) => RData::AAAA((*v6).into()),
            };
            reply.add_answer(Record::from_rdata(
                query.name().clone(),
                self.hosts_ttl,
                rdata,
            ));
        }
        reply
    }
}

/// A/IN and AAAA/IN are the only fast-path families; everything else
/// passes through to upstream uncached.
fn classify(query: &Query) -> Option<IpFamily> {
    if query.query_class() != DNSClass::IN {
        return None;
    }
    match query.query_type() {
        RecordType::A => Some(IpFamily::V4),
        RecordType::AAAA => Some(IpFamily::V6),
        _ => None,
    }
}

/// Reply skeleton mirroring the request: same id, opcode, and questions.
fn reply_with_code(request: &Message, code: ResponseCode) -> Message {
    let mut reply = Message::new();
    reply
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(code);
    for query in request.queries() {
        reply.add_query(query.clone());
    }
    reply
}
