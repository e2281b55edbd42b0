use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::acceptor::NetAcceptor;
use super::codec::*;
use super::deliverer::{AddrFamily, Deliverer, NetDeliverer, RouteTarget};
use super::io_channel::IoChannel;
use crate::broker::Router;
use crate::broker::channel::Channel;
use crate::broker::message::*;
use crate::utils::error::CodecError;

const SITE: u32 = 14;
const WAIT: Duration = Duration::from_secs(3);

fn ep(site: u32, aid: u32, eid: u32) -> EndPoint {
    EndPoint {
        site,
        aid,
        eid,
        pid: 0,
    }
}

fn sample(text: &str) -> Message {
    let mut msg = Message::new(
        vec![ep(SITE, APP_DATABASE, 0)],
        Body::Unknown(TypedPayload::new("demo.Text", text.as_bytes().to_vec())),
    );
    msg.source = Some(ep(SITE, APP_WEB, 1));
    msg.notify_sent = 9;
    msg.command_sequence = Some(4);
    msg
}

fn registry(source: EndPoint, entries: Vec<Listener>) -> Message {
    let mut msg = Message::new(
        Vec::new(),
        Body::Registry(Registry {
            source_service: Some(source),
            entries,
        }),
    );
    msg.source = Some(source);
    msg
}

/// A message with random fields and a random body, which zlib cannot shrink.
fn incompressible() -> Message {
    let noise: Vec<u8> = (0..256).map(|_| rand::random::<u8>()).collect();
    let mut msg = Message::new(
        vec![ep(rand::random(), rand::random(), rand::random())],
        Body::Unknown(TypedPayload::new("demo.Noise", noise)),
    );
    msg.source = Some(ep(rand::random(), rand::random(), rand::random()));
    msg.write_time = rand::random();
    msg.send_time = rand::random();
    msg.request_time = rand::random();
    msg.notify_sent = rand::random();
    msg.command_sequence = Some(rand::random());
    msg
}

/// Decode everything in `buf`, asserting every error is recoverable.
fn decode_all(buf: &mut BytesMut) -> Vec<Frame> {
    let mut decoder = FrameDecoder::new();
    let mut frames = Vec::new();
    loop {
        match decoder.decode(buf) {
            Ok(Some(frame)) => frames.push(frame),
            Ok(None) => return frames,
            Err(e) => assert!(e.is_recoverable(), "unexpected fatal error {e}"),
        }
    }
}

#[test]
fn test_codec_round_trip() {
    let msg = sample("hello");
    for compress in [false, true] {
        let mut buf = encode_frame(&msg, EncodeOptions { id: 77, compress }).unwrap();
        let frames = decode_all(&mut buf);
        assert_eq!(frames, vec![Frame { id: 77, message: msg.clone() }]);
        assert!(buf.is_empty());
    }
}

#[test]
fn test_codec_compresses_only_when_smaller() {
    let big = sample(&"abc".repeat(2000));
    let plain = encode_frame(&big, EncodeOptions { id: 1, compress: false }).unwrap();
    let packed = encode_frame(&big, EncodeOptions { id: 1, compress: true }).unwrap();
    assert!(packed.len() < plain.len());
    assert_eq!(u64::from_be_bytes(packed[..8].try_into().unwrap()), FRAME_MAGIC_DEFLATE);

    // A bare ACK is mostly zero fields and still shrinks.
    let ack = Message::with_status(Status::Ack);
    let packed = encode_frame(&ack, EncodeOptions { id: 1, compress: true }).unwrap();
    assert_eq!(u64::from_be_bytes(packed[..8].try_into().unwrap()), FRAME_MAGIC_DEFLATE);

    let noise = incompressible();
    let plain = encode_frame(&noise, EncodeOptions { id: 2, compress: false }).unwrap();
    let packed = encode_frame(&noise, EncodeOptions { id: 2, compress: true }).unwrap();
    assert_eq!(u64::from_be_bytes(packed[..8].try_into().unwrap()), FRAME_MAGIC);
    assert_eq!(packed, plain);

    let mut buf = encode_frame(&big, EncodeOptions { id: 5, compress: true }).unwrap();
    assert_eq!(decode_all(&mut buf)[0].message, big);
}

#[test]
fn test_codec_waits_for_partial_frame() {
    let full = encode_frame(&sample("partial"), EncodeOptions { id: 3, compress: false }).unwrap();
    let mut decoder = FrameDecoder::new();
    let mut buf = BytesMut::from(&full[..full.len() - 1]);
    assert!(decoder.decode(&mut buf).unwrap().is_none());
    buf.extend_from_slice(&full[full.len() - 1..]);
    assert_eq!(decoder.decode(&mut buf).unwrap().unwrap().id, 3);
}

#[test]
fn test_codec_survives_single_byte_corruption() {
    let bad = encode_frame(&sample("first"), EncodeOptions { id: 11, compress: false }).unwrap();
    let good = encode_frame(&sample("second"), EncodeOptions { id: 22, compress: false }).unwrap();

    for i in 0..bad.len() {
        // A flipped low size byte can declare a larger in-range frame, which
        // waits for more input. See test_codec_grown_size_recovers_with_more_input.
        if (17..HEADER_SIZE).contains(&i) {
            continue;
        }
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&bad);
        buf[i] ^= 0xff;
        buf.extend_from_slice(&good);

        let frames = decode_all(&mut buf);
        assert_eq!(frames.len(), 1, "byte {i}");
        assert_eq!(frames[0].id, 22, "byte {i}");
        assert!(buf.is_empty(), "byte {i}");
    }
}

#[test]
fn test_codec_grown_size_recovers_with_more_input() {
    let bad = encode_frame(&sample("first"), EncodeOptions { id: 11, compress: false }).unwrap();
    let good = encode_frame(&sample("second"), EncodeOptions { id: 22, compress: false }).unwrap();

    let mut buf = BytesMut::new();
    buf.extend_from_slice(&bad);
    let size = u64::from_be_bytes(buf[16..24].try_into().unwrap());
    buf[22] ^= 0xff;
    let grown = u64::from_be_bytes(buf[16..24].try_into().unwrap());
    assert!(grown > size);
    buf.extend_from_slice(&good);

    // The bogus size swallows the next frame until enough bytes arrive.
    assert!(decode_all(&mut buf).is_empty());

    let needed = HEADER_SIZE + grown as usize + FOOTER_SIZE;
    buf.resize(needed.max(buf.len()), 0);
    let frames = decode_all(&mut buf);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].id, 22);
}

#[test]
fn test_codec_shrunken_size_resyncs() {
    let bad = encode_frame(&sample("first"), EncodeOptions { id: 11, compress: false }).unwrap();
    let good = encode_frame(&sample("second"), EncodeOptions { id: 22, compress: false }).unwrap();
    let size = u64::from_be_bytes(bad[16..24].try_into().unwrap());

    let mut buf = BytesMut::new();
    buf.extend_from_slice(&bad);
    buf[16..24].copy_from_slice(&(size - 3).to_be_bytes());
    buf.extend_from_slice(&good);

    let frames = decode_all(&mut buf);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].id, 22);
}

#[test]
fn test_codec_oversized_and_bad_magic() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&FRAME_MAGIC.to_be_bytes());
    buf.extend_from_slice(&1u64.to_be_bytes());
    buf.extend_from_slice(&(MAX_FRAME_SIZE as u64).to_be_bytes());
    buf.extend_from_slice(&[0u8; 8]);

    let mut decoder = FrameDecoder::new();
    assert!(matches!(decoder.decode(&mut buf), Err(CodecError::Oversized { .. })));
    assert!(matches!(decoder.decode(&mut buf), Err(CodecError::BadMagic(_))));
}

#[test]
fn test_codec_hash_mismatch_drops_frame() {
    let mut buf = encode_frame(&sample("x"), EncodeOptions { id: 8, compress: false }).unwrap();
    let last = buf.len() - 1;
    buf[last] ^= 0x01;
    let mut decoder = FrameDecoder::new();
    assert!(matches!(decoder.decode(&mut buf), Err(CodecError::HashMismatch)));
    assert!(buf.is_empty());
}

#[test]
fn test_codec_rejects_too_large() {
    let msg = Message::new(
        Vec::new(),
        Body::Unknown(TypedPayload::new("demo.Blob", vec![0u8; MAX_FRAME_SIZE])),
    );
    let err = encode_frame(&msg, EncodeOptions::random()).unwrap_err();
    assert!(matches!(err, CodecError::TooLarge(_)));
    assert!(!err.is_recoverable());
}

#[tokio::test]
async fn test_frame_reader_and_writer() {
    let (client, server) = tokio::io::duplex(4096);
    let mut writer = FrameWriter::new(client);
    let mut reader = FrameReader::new(server);

    let first = sample("one");
    let second = sample(&"two".repeat(1000));
    writer.write_frame(&first, EncodeOptions { id: 1, compress: false }).await.unwrap();
    writer.write_frame(&second, EncodeOptions { id: 2, compress: true }).await.unwrap();
    writer.shutdown().await.unwrap();
    drop(writer);

    assert_eq!(reader.next_frame().await.unwrap().message, first);
    assert_eq!(reader.next_frame().await.unwrap().message, second);
    assert!(matches!(reader.next_frame().await, Err(CodecError::Closed)));
}

struct Peer {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: FrameWriter<WriteHalf<DuplexStream>>,
}

impl Peer {
    async fn send(&mut self, msg: &Message, id: u64) {
        self.writer
            .write_frame(msg, EncodeOptions { id, compress: false })
            .await
            .unwrap();
    }

    async fn next(&mut self) -> Frame {
        tokio::time::timeout(WAIT, self.reader.next_frame())
            .await
            .unwrap()
            .unwrap()
    }
}

fn attach() -> (Arc<IoChannel>, Peer) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let channel = IoChannel::spawn(server, "test-peer", SITE, CancellationToken::new());
    let (r, w) = tokio::io::split(client);
    (
        channel,
        Peer {
            reader: FrameReader::new(r),
            writer: FrameWriter::new(w),
        },
    )
}

#[tokio::test]
async fn test_io_channel_registry_is_consumed_and_acked() {
    let (channel, mut peer) = attach();
    let mut inbound = channel.recv().unwrap();
    assert!(channel.recv().is_none());

    let listener = Listener {
        destination: Some(ep(0, APP_DATABASE, 0)),
        ..Listener::default()
    };
    peer.send(&registry(ep(SITE, APP_DATABASE, 3), vec![listener]), 41).await;

    let ack = peer.next().await;
    assert_eq!(ack.id, 41);
    assert_eq!(ack.message.status, Status::Ack);
    assert!(ack.message.body.is_none());

    assert!(inbound.try_recv().is_err());
    assert!(channel.listening_for(&sample("for db")));
    assert_eq!(channel.name(), "database-3");
    assert_eq!(channel.endpoint(), Some(ep(SITE, APP_DATABASE, 3)));
    assert_eq!(channel.peer_site(), None);
}

#[tokio::test]
async fn test_io_channel_forwards_and_acks_messages() {
    let (channel, mut peer) = attach();
    let mut inbound = channel.recv().unwrap();
    assert!(!channel.listening_for(&sample("nobody registered")));
    assert_eq!(channel.name(), "test-peer");

    let msg = sample("payload");
    peer.send(&msg, 5).await;
    let got = tokio::time::timeout(WAIT, inbound.recv()).await.unwrap().unwrap();
    assert_eq!(got, msg);
    assert_eq!(peer.next().await.id, 5);

    peer.send(&Message::with_status(Status::Keepalive), 6).await;
    assert_eq!(peer.next().await.id, 6);

    // ACKs from the peer are dropped without a reply.
    peer.send(&Message::with_status(Status::Ack), 7).await;
    peer.send(&Message::with_status(Status::Keepalive), 8).await;
    assert_eq!(peer.next().await.id, 8);
    assert!(inbound.try_recv().is_err());

    let json = channel.debug_json();
    assert_eq!(json["received"], 4);
    for _ in 0..50 {
        if channel.debug_json()["written"] == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(channel.debug_json()["written"], 3);
}

#[tokio::test]
async fn test_io_channel_writes_outbound_queue() {
    let (channel, mut peer) = attach();
    let mut msg = sample("outbound");
    msg.send_time = 0;
    channel.send_queue().send(msg.clone()).await.unwrap();

    let frame = peer.next().await;
    assert_eq!(frame.message.body, msg.body);
    assert!(frame.message.send_time > 0);
}

#[tokio::test]
async fn test_io_channel_peer_gateway_status() {
    let (channel, mut peer) = attach();
    let mut inbound = channel.recv().unwrap();

    peer.send(&registry(ep(HQ_SITE, APP_GATEWAY, 0), Vec::new()), 1).await;
    let notice = tokio::time::timeout(WAIT, inbound.recv()).await.unwrap().unwrap();
    assert_eq!(notice.destination, vec![EndPoint::site(SITE)]);
    assert_eq!(
        notice.body,
        Some(Body::SiteStatus(SiteStatus {
            site_id: HQ_SITE,
            connection: ConnectionStatus::Ok
        }))
    );
    assert_eq!(peer.next().await.id, 1);
    assert_eq!(channel.peer_site(), Some(HQ_SITE));
    assert_eq!(channel.name(), "Remote Site (2)");
}

#[tokio::test]
async fn test_io_channel_unknown_app_name() {
    let (channel, mut peer) = attach();
    peer.send(&registry(ep(SITE, 0x99, 2), Vec::new()), 1).await;
    peer.next().await;
    assert_eq!(channel.name(), "0x99-2");
}

#[tokio::test]
async fn test_io_channel_close_is_idempotent() {
    let (channel, mut peer) = attach();
    let mut inbound = channel.recv().unwrap();
    channel.close();
    channel.close();
    assert!(channel.is_closed());

    let end = tokio::time::timeout(WAIT, peer.reader.next_frame()).await.unwrap();
    assert!(matches!(end, Err(CodecError::Closed)));
    assert!(tokio::time::timeout(WAIT, inbound.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_io_channel_closes_when_peer_hangs_up() {
    let (channel, peer) = attach();
    let mut inbound = channel.recv().unwrap();
    drop(peer);
    assert!(tokio::time::timeout(WAIT, inbound.recv()).await.unwrap().is_none());
    assert!(channel.is_closed());
}

#[test]
fn test_route_target_parse() {
    let t = RouteTarget::parse("tcp:127.0.0.1:9000").unwrap();
    assert!(!t.secure);
    assert_eq!(t.family, AddrFamily::Any);
    assert_eq!(t.addr, "127.0.0.1:9000");

    let t = RouteTarget::parse("TCPS://hq.example:443").unwrap();
    assert!(t.secure);
    assert_eq!(t.addr, "hq.example:443");

    assert_eq!(RouteTarget::parse("tcp6:[::1]:1").unwrap().family, AddrFamily::V6);
    assert_eq!(RouteTarget::parse("tcp4:host:1").unwrap().family, AddrFamily::V4);
    assert!(RouteTarget::parse("udp:host:1").is_err());
    assert!(RouteTarget::parse("tcp:").is_err());
    assert!(RouteTarget::parse("nonsense").is_err());
}

#[test]
fn test_secure_route_requires_tls() {
    assert!(NetDeliverer::new("tcps:127.0.0.1:1", SITE, None, CancellationToken::new()).is_err());
}

#[tokio::test]
async fn test_deliverer_without_connection_fails() {
    let d = NetDeliverer::new("tcp:127.0.0.1:1", SITE, None, CancellationToken::new()).unwrap();
    assert_eq!(d.url(), "tcp:127.0.0.1:1");
    assert!(!d.deliver(&sample("nowhere")).await);
}

#[tokio::test]
async fn test_deliverer_end_to_end_through_gateway() {
    let cancel = CancellationToken::new();
    let router = Router::start(HQ_SITE, "hq", cancel.clone());
    let acceptor = NetAcceptor::bind("127.0.0.1:0", router.clone(), cancel.clone())
        .await
        .unwrap();
    let addr = acceptor.local_addr().unwrap();
    tokio::spawn(acceptor.run());

    // Application A listens for the database app.
    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let (r, w) = tokio::io::split(stream);
    let mut app_reader = FrameReader::new(r);
    let mut app_writer = FrameWriter::new(w);
    let target = ep(HQ_SITE, APP_DATABASE, 1);
    let listener = Listener {
        destination: Some(target),
        ..Listener::default()
    };
    app_writer
        .write_frame(&registry(target, vec![listener]), EncodeOptions::random())
        .await
        .unwrap();

    // ServiceInfo and the registry ACK, in either order.
    let mut saw_info = false;
    let mut saw_ack = false;
    while !(saw_info && saw_ack) {
        let frame = tokio::time::timeout(WAIT, app_reader.next_frame()).await.unwrap().unwrap();
        match frame.message.body {
            Some(Body::ServiceInfo(_)) => saw_info = true,
            None if frame.message.status == Status::Ack => saw_ack = true,
            other => panic!("unexpected frame {other:?}"),
        }
    }

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let seen = statuses.clone();
    let d = NetDeliverer::new(&format!("tcp:{addr}"), SITE, None, cancel.clone()).unwrap();
    d.set_status_callback(Box::new(move |s| seen.lock().unwrap().push(s)));
    assert!(d.try_connect().await);
    assert_eq!(statuses.lock().unwrap().as_slice(), &[RouteStatus::Up]);

    let mut msg = Message::new(
        vec![target],
        Body::Unknown(TypedPayload::new("demo.Text", b"over the link".to_vec())),
    );
    msg.source = Some(ep(SITE, APP_WEB, 1));
    assert!(d.deliver(&msg).await);

    let frame = tokio::time::timeout(WAIT, app_reader.next_frame()).await.unwrap().unwrap();
    assert_eq!(frame.message.body, msg.body);
    assert_eq!(frame.message.source, msg.source);

    assert!(d.deliver(&Message::with_status(Status::Keepalive)).await);
    assert!(router
        .channel_table()
        .iter()
        .any(|c| c["name"] == format!("Remote Site ({SITE})")));
    cancel.cancel();
}

#[tokio::test]
async fn test_deliverer_drops_connection_on_wrong_ack() {
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = server.accept().await.unwrap();
        let (r, w) = tokio::io::split(stream);
        let mut reader = FrameReader::new(r);
        let mut writer = FrameWriter::new(w);
        let ack = Message::with_status(Status::Ack);

        let hello = reader.next_frame().await.unwrap();
        assert!(matches!(hello.message.body, Some(Body::Registry(_))));
        writer
            .write_frame(&ack, EncodeOptions { id: hello.id, compress: false })
            .await
            .unwrap();

        let next = reader.next_frame().await.unwrap();
        writer
            .write_frame(&ack, EncodeOptions { id: next.id.wrapping_add(1), compress: false })
            .await
            .unwrap();
        // Hold the socket open until the client goes away.
        let _ = reader.next_frame().await;
    });

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let seen = statuses.clone();
    let d = NetDeliverer::new(&format!("tcp:{addr}"), SITE, None, CancellationToken::new()).unwrap();
    d.set_status_callback(Box::new(move |s| seen.lock().unwrap().push(s)));
    assert!(d.try_connect().await);
    assert!(!d.deliver(&sample("rejected")).await);
    assert!(!d.is_connected().await);
    assert_eq!(
        statuses.lock().unwrap().as_slice(),
        &[RouteStatus::Up, RouteStatus::Down]
    );
}
