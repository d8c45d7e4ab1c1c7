mod common;

use common::{UpstreamMode, first_a_record, query_message, spawn_upstream};
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::RecordType;
use mimir::resolver::{Resolver, Transport};
use mimir::suffix_tree::SuffixTree;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

fn racing_resolver(servers: Vec<String>, interval_ms: u64, timeout_secs: u64) -> Resolver {
    Resolver::from_parts(
        servers,
        SuffixTree::new(),
        Duration::from_secs(timeout_secs),
        Duration::from_millis(interval_ms),
        false,
    )
}

#[tokio::test]
async fn servfail_upstream_loses_the_race() {
    let bad = spawn_upstream(UpstreamMode::ServFail).await;
    let good = spawn_upstream(UpstreamMode::Answer(Ipv4Addr::new(1, 2, 3, 4))).await;

    // whichever order they are listed, the SERVFAIL answer never wins
    for servers in [
        vec![bad.addr.clone(), good.addr.clone()],
        vec![good.addr.clone(), bad.addr.clone()],
    ] {
        let resolver = racing_resolver(servers, 50, 2);
        let request = query_message(0x2222, "www.example.com.", RecordType::A);
        let response = resolver.lookup(Transport::Udp, &request).await.unwrap();

        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(first_a_record(&response), Some(Ipv4Addr::new(1, 2, 3, 4)));
    }
}

#[tokio::test]
async fn fast_second_upstream_beats_stalled_first() {
    let slow = spawn_upstream(UpstreamMode::AnswerAfter(
        Ipv4Addr::new(10, 0, 0, 1),
        Duration::from_millis(2000),
    ))
    .await;
    let fast = spawn_upstream(UpstreamMode::AnswerAfter(
        Ipv4Addr::new(10, 0, 0, 2),
        Duration::from_millis(100),
    ))
    .await;

    let resolver = racing_resolver(vec![slow.addr.clone(), fast.addr.clone()], 1000, 5);
    let request = query_message(0x3333, "race.example.com.", RecordType::A);

    let started = Instant::now();
    let response = resolver.lookup(Transport::Udp, &request).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(first_a_record(&response), Some(Ipv4Addr::new(10, 0, 0, 2)));
    // the fast answer lands about one stagger interval in
    assert!(elapsed < Duration::from_millis(1700), "took {elapsed:?}");
}

#[tokio::test]
async fn nxdomain_ends_the_race() {
    let nx = spawn_upstream(UpstreamMode::NxDomain).await;
    let answer = spawn_upstream(UpstreamMode::Answer(Ipv4Addr::new(9, 9, 9, 9))).await;

    let resolver = racing_resolver(vec![nx.addr.clone(), answer.addr.clone()], 200, 2);
    let request = query_message(0x4444, "nosuch.example.com.", RecordType::A);
    let response = resolver.lookup(Transport::Udp, &request).await.unwrap();

    assert_eq!(response.response_code(), ResponseCode::NXDomain);
}

#[tokio::test]
async fn late_answer_is_still_accepted() {
    let slow = spawn_upstream(UpstreamMode::AnswerAfter(
        Ipv4Addr::new(7, 7, 7, 7),
        Duration::from_millis(300),
    ))
    .await;

    // the stagger interval expires long before the answer arrives
    let resolver = racing_resolver(vec![slow.addr.clone()], 50, 2);
    let request = query_message(0x5555, "late.example.com.", RecordType::A);
    let response = resolver.lookup(Transport::Udp, &request).await.unwrap();

    assert_eq!(first_a_record(&response), Some(Ipv4Addr::new(7, 7, 7, 7)));
}

#[tokio::test]
async fn all_failures_surface_as_resolve_error() {
    let servfail = spawn_upstream(UpstreamMode::ServFail).await;
    let silent = spawn_upstream(UpstreamMode::Silent).await;

    let resolver = Resolver::from_parts(
        vec![servfail.addr.clone(), silent.addr.clone()],
        SuffixTree::new(),
        Duration::from_millis(100),
        Duration::from_millis(50),
        false,
    );
    let request = query_message(0x6666, "dead.example.com.", RecordType::A);
    let err = resolver.lookup(Transport::Udp, &request).await.unwrap_err();

    assert_eq!(err.qname, "dead.example.com");
    assert_eq!(err.net, "udp");
    assert_eq!(err.nameservers.len(), 2);
}

#[tokio::test]
async fn edns0_advertises_large_udp_payload() {
    let upstream = spawn_upstream(UpstreamMode::Answer(Ipv4Addr::new(5, 5, 5, 5))).await;

    let resolver = Resolver::from_parts(
        vec![upstream.addr.clone()],
        SuffixTree::new(),
        Duration::from_secs(2),
        Duration::from_millis(100),
        true,
    );
    let request = query_message(0x7777, "edns.example.com.", RecordType::A);
    resolver.lookup(Transport::Udp, &request).await.unwrap();

    let seen = upstream.last_request.lock().clone().unwrap();
    let max_payload = seen.extensions().as_ref().map(|edns| edns.max_payload());
    assert_eq!(max_payload, Some(65535));
}

#[tokio::test]
async fn tcp_exchange_round_trips() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await.unwrap();
        let mut body = vec![0u8; u16::from_be_bytes(len_buf) as usize];
        stream.read_exact(&mut body).await.unwrap();

        let request = hickory_proto::op::Message::from_vec(&body).unwrap();
        let reply = common::answer_message(&request, Ipv4Addr::new(6, 6, 6, 6), 60);
        let bytes = reply.to_vec().unwrap();
        stream
            .write_all(&(bytes.len() as u16).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(&bytes).await.unwrap();
    });

    let resolver = racing_resolver(vec![addr], 200, 2);
    let request = query_message(0x8888, "tcp.example.com.", RecordType::A);
    let response = resolver.lookup(Transport::Tcp, &request).await.unwrap();

    assert_eq!(first_a_record(&response), Some(Ipv4Addr::new(6, 6, 6, 6)));
}
