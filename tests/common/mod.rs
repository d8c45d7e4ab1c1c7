#![allow(dead_code)]

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use parking_lot::Mutex;
use std::future::Future;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;

pub fn query_message(id: u16, name: &str, rtype: RecordType) -> Message {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    message.add_query(Query::query(Name::from_str(name).unwrap(), rtype));
    message
}

pub fn answer_message(request: &Message, ip: Ipv4Addr, ttl: u32) -> Message {
    let mut reply = Message::new();
    reply
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(ResponseCode::NoError);
    for query in request.queries() {
        reply.add_query(query.clone());
        reply.add_answer(Record::from_rdata(
            query.name().clone(),
            ttl,
            RData::A(ip.into()),
        ));
    }
    reply
}

pub fn first_a_record(message: &Message) -> Option<Ipv4Addr> {
    message.answers().iter().find_map(|record| match record.data() {
        RData::A(a) => Some(a.0),
        _ => None,
    })
}

/// How a mock upstream responds to each query it receives.
#[derive(Debug, Clone, Copy)]
pub enum UpstreamMode {
    Answer(Ipv4Addr),
    AnswerAfter(Ipv4Addr, Duration),
    ServFail,
    NxDomain,
    Silent,
}

pub struct MockUpstream {
    pub addr: String,
    pub hits: Arc<AtomicUsize>,
    pub last_request: Arc<Mutex<Option<Message>>>,
}

impl MockUpstream {
    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Bind a mock UDP upstream on an ephemeral port and serve queries
/// according to `mode` until the test ends.
pub async fn spawn_upstream(mode: UpstreamMode) -> MockUpstream {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap().to_string();
    let hits = Arc::new(AtomicUsize::new(0));
    let last_request = Arc::new(Mutex::new(None));

    let task_hits = hits.clone();
    let task_last = last_request.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        loop {
            let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                return;
            };
            task_hits.fetch_add(1, Ordering::SeqCst);
            let Ok(request) = Message::from_vec(&buf[..len]) else {
                continue;
            };
            *task_last.lock() = Some(request.clone());

            let reply = match mode {
                UpstreamMode::Answer(ip) => answer_message(&request, ip, 60),
                UpstreamMode::AnswerAfter(ip, delay) => {
                    tokio::time::sleep(delay).await;
                    answer_message(&request, ip, 60)
                }
                UpstreamMode::ServFail => rcode_reply(&request, ResponseCode::ServFail),
                UpstreamMode::NxDomain => rcode_reply(&request, ResponseCode::NXDomain),
                UpstreamMode::Silent => continue,
            };
            let _ = socket.send_to(&reply.to_vec().unwrap(), peer).await;
        }
    });

    MockUpstream {
        addr,
        hits,
        last_request,
    }
}

fn rcode_reply(request: &Message, code: ResponseCode) -> Message {
    let mut reply = Message::new();
    reply
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_response_code(code);
    for query in request.queries() {
        reply.add_query(query.clone());
    }
    reply
}

/// Poll `cond` every 20ms until it holds or roughly a second passes.
pub async fn eventually<F, Fut>(mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..50 {
        if cond().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
