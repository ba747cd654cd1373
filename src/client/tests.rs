// Copyright (C) 2024 the macula authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end scenarios against a scripted in-process server.

use std::time::Duration;

use bytes::Bytes;

use super::parse::get_cseq;
use super::*;
use crate::message::{headers, Method, StatusCode};
use crate::testutil::{bind_server, client_ports, ok_response, response_to, ServerConn};
use crate::ErrorKind;

const SDP_ONE_VIDEO_TRACK: &[u8] = b"v=0\r\n\
    o=- 0 0 IN IP4 127.0.0.1\r\n\
    s=Stream\r\n\
    t=0 0\r\n\
    m=video 0 RTP/AVP 96\r\n\
    a=rtpmap:96 H264/90000\r\n\
    a=control:trackID=0\r\n";

const PUBLIC_METHODS: &str = "OPTIONS, DESCRIBE, ANNOUNCE, SETUP, PLAY, RECORD, PAUSE, \
                              GET_PARAMETER, TEARDOWN";

/// A syntactically valid RTP packet: V=2, PT=96, seq=1.
const RTP_PACKET: &[u8] = &[
    0x80, 0x60, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x12, 0x34, 0x56, 0x78, 0xde, 0xad, 0xbe,
    0xef,
];

async fn expect_ladder_step(conn: &mut ServerConn, method: Method) -> crate::message::Request {
    let req = conn.next_request().await;
    assert_eq!(req.method, method);
    req
}

#[tokio::test]
async fn happy_read_over_udp() {
    let (listener, url) = bind_server("/stream").await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let client = Client::new(SessionOptions::default().on_rtp(move |track_id, pkt| {
        tx.send((track_id, pkt)).unwrap();
    }));

    let server = tokio::spawn(async move {
        let mut conn = ServerConn::accept(&listener).await;
        let mut cseqs = Vec::new();

        let req = expect_ladder_step(&mut conn, Method::Options).await;
        cseqs.push(get_cseq(&req.headers).unwrap());
        conn.send_response(ok_response(&req).header(headers::PUBLIC, PUBLIC_METHODS))
            .await;

        let req = expect_ladder_step(&mut conn, Method::Describe).await;
        cseqs.push(get_cseq(&req.headers).unwrap());
        conn.send_response(
            ok_response(&req)
                .header(headers::CONTENT_TYPE, "application/sdp")
                .body(Bytes::from_static(SDP_ONE_VIDEO_TRACK)),
        )
        .await;

        let req = expect_ladder_step(&mut conn, Method::Setup).await;
        cseqs.push(get_cseq(&req.headers).unwrap());
        let transport = req.headers.get(headers::TRANSPORT).unwrap().to_owned();
        assert!(transport.contains("RTP/AVP;unicast"));
        assert!(transport.contains("mode=play"));
        let (client_rtp, client_rtcp) = client_ports(&transport);
        assert_eq!(client_rtp % 2, 0);
        assert_eq!(client_rtcp, client_rtp + 1);
        let server_rtp = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_port = server_rtp.local_addr().unwrap().port();
        conn.send_response(
            ok_response(&req)
                .header(headers::SESSION, "abc123;timeout=60")
                .header(
                    headers::TRANSPORT,
                    format!(
                        "RTP/AVP;unicast;client_port={client_rtp}-{client_rtcp};\
                         server_port={server_port}-{}",
                        server_port + 1
                    ),
                ),
        )
        .await;

        let req = expect_ladder_step(&mut conn, Method::Play).await;
        cseqs.push(get_cseq(&req.headers).unwrap());
        assert_eq!(req.headers.get(headers::SESSION), Some("abc123"));
        conn.send_response(ok_response(&req).header(headers::SESSION, "abc123"))
            .await;

        assert!(
            cseqs.windows(2).all(|w| w[0] < w[1]),
            "CSeq not strictly increasing: {cseqs:?}"
        );

        server_rtp
            .send_to(RTP_PACKET, ("127.0.0.1", client_rtp))
            .await
            .unwrap();

        let req = expect_ladder_step(&mut conn, Method::Teardown).await;
        conn.send_response(ok_response(&req)).await;
    });

    client.start(&url).await.unwrap();
    client.options(&url).await.unwrap();
    let (tracks, base_url, _) = client.describe(&url).await.unwrap();
    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks[0].id, 0);
    client
        .setup(TransportMode::Play, &tracks[0], &base_url, 0, 0)
        .await
        .unwrap();
    client.play(None).await.unwrap();

    let (track_id, pkt) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for the RTP callback")
        .unwrap();
    assert_eq!(track_id, 0);
    assert_eq!(&pkt[..], RTP_PACKET);

    client.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn redirect_then_success() {
    let (listener_a, url_a) = bind_server("/stream").await;
    let (listener_b, url_b) = bind_server("/elsewhere").await;

    let redirect_target = url_b.to_string();
    let server_a = tokio::spawn(async move {
        let mut conn = ServerConn::accept(&listener_a).await;
        let req = expect_ladder_step(&mut conn, Method::Options).await;
        conn.send_response(ok_response(&req).header(headers::PUBLIC, PUBLIC_METHODS))
            .await;
        let req = expect_ladder_step(&mut conn, Method::Describe).await;
        conn.send_response(
            response_to(&req, StatusCode::FOUND, "Found")
                .header(headers::LOCATION, redirect_target),
        )
        .await;
    });

    let server_b = tokio::spawn(async move {
        let mut conn = ServerConn::accept(&listener_b).await;
        let req = expect_ladder_step(&mut conn, Method::Options).await;
        conn.send_response(ok_response(&req).header(headers::PUBLIC, PUBLIC_METHODS))
            .await;
        let req = expect_ladder_step(&mut conn, Method::Describe).await;
        conn.send_response(
            ok_response(&req)
                .header(headers::CONTENT_TYPE, "application/sdp")
                .body(Bytes::from_static(SDP_ONE_VIDEO_TRACK)),
        )
        .await;
        let req = expect_ladder_step(&mut conn, Method::Setup).await;
        assert!(req
            .headers
            .get(headers::TRANSPORT)
            .unwrap()
            .contains("interleaved=0-1"));
        conn.send_response(
            ok_response(&req)
                .header(headers::SESSION, "xyz789")
                .header(
                    headers::TRANSPORT,
                    "RTP/AVP/TCP;unicast;interleaved=0-1",
                ),
        )
        .await;
        let req = expect_ladder_step(&mut conn, Method::Play).await;
        conn.send_response(ok_response(&req).header(headers::SESSION, "xyz789"))
            .await;
        let req = expect_ladder_step(&mut conn, Method::Teardown).await;
        conn.send_response(ok_response(&req)).await;
    });

    let client = Client::new(SessionOptions::default().transport(Transport::Tcp));
    client.start(&url_a).await.unwrap();
    client.options(&url_a).await.unwrap();
    let (tracks, base_url, _) = client.describe(&url_a).await.unwrap();
    assert_eq!(tracks.len(), 1);
    // The session followed the redirect: everything now points at server B.
    assert_eq!(base_url.port(), url_b.port());
    client
        .setup(TransportMode::Play, &tracks[0], &base_url, 0, 0)
        .await
        .unwrap();
    client.play(None).await.unwrap();

    client.close().await;
    server_a.await.unwrap();
    server_b.await.unwrap();
}

#[tokio::test]
async fn digest_auth_retry_then_failure() {
    let (listener, url) = bind_server("/stream").await;

    let server = tokio::spawn(async move {
        let mut conn = ServerConn::accept(&listener).await;
        let req = expect_ladder_step(&mut conn, Method::Options).await;
        assert!(req.headers.get(headers::AUTHORIZATION).is_none());
        conn.send_response(
            response_to(&req, StatusCode::UNAUTHORIZED, "Unauthorized").header(
                headers::WWW_AUTHENTICATE,
                "Digest realm=\"r\", nonce=\"n\"",
            ),
        )
        .await;

        let retry = expect_ladder_step(&mut conn, Method::Options).await;
        let authorization = retry
            .headers
            .get(headers::AUTHORIZATION)
            .expect("retry carries Authorization")
            .to_owned();
        assert!(authorization.starts_with("Digest"));
        assert!(authorization.contains("username=\"u\""));
        assert!(authorization.contains("realm=\"r\""));
        assert!(authorization.contains("nonce=\"n\""));
        assert!(authorization.contains("uri="));
        assert!(authorization.contains("response="));
        assert!(get_cseq(&retry.headers) > get_cseq(&req.headers));
        conn.send_response(
            response_to(&retry, StatusCode::UNAUTHORIZED, "Unauthorized").header(
                headers::WWW_AUTHENTICATE,
                "Digest realm=\"r\", nonce=\"n\"",
            ),
        )
        .await;
    });

    let client = Client::new(SessionOptions::default().creds(Some(Credentials {
        username: "u".to_owned(),
        password: "p".to_owned(),
    })));
    client.start(&url).await.unwrap();
    let e = client.options(&url).await.unwrap_err();
    assert_eq!(e.kind(), ErrorKind::AuthFailed);

    // The failure is latched; every subsequent operation reports it.
    let e = client.describe(&url).await.unwrap_err();
    assert_eq!(e.kind(), ErrorKind::AuthFailed);
    let e = client.wait().await;
    assert_eq!(e.kind(), ErrorKind::AuthFailed);

    server.await.unwrap();
    client.close().await;
}

#[tokio::test]
async fn interleaved_dispatch_order() {
    let (listener, url) = bind_server("/stream").await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let rtp_tx = tx.clone();
    let options = SessionOptions::default()
        .transport(Transport::Tcp)
        .on_rtp(move |track_id, pkt| {
            rtp_tx.send(("rtp", track_id, pkt)).unwrap();
        })
        .on_rtcp(move |track_id, pkt| {
            tx.send(("rtcp", track_id, pkt)).unwrap();
        });
    let client = Client::new(options);

    let server = tokio::spawn(async move {
        let mut conn = ServerConn::accept(&listener).await;
        let req = expect_ladder_step(&mut conn, Method::Options).await;
        conn.send_response(ok_response(&req).header(headers::PUBLIC, PUBLIC_METHODS))
            .await;
        let req = expect_ladder_step(&mut conn, Method::Describe).await;
        conn.send_response(
            ok_response(&req)
                .header(headers::CONTENT_TYPE, "application/sdp")
                .body(Bytes::from_static(SDP_ONE_VIDEO_TRACK)),
        )
        .await;
        let req = expect_ladder_step(&mut conn, Method::Setup).await;
        conn.send_response(
            ok_response(&req)
                .header(headers::SESSION, "abc123")
                .header(headers::TRANSPORT, "RTP/AVP/TCP;unicast;interleaved=0-1"),
        )
        .await;
        let req = expect_ladder_step(&mut conn, Method::Play).await;
        conn.send_response(ok_response(&req).header(headers::SESSION, "abc123"))
            .await;

        // Two interleaved frames: RTP on channel 0, RTCP on channel 1.
        conn.send_raw(b"$\x00\x00\x04\xaa\xbb\xcc\xdd$\x01\x00\x02\xee\xff")
            .await;

        // A request arriving mid-stream is answered by the reader task.
        let req = expect_ladder_step(&mut conn, Method::Options).await;
        conn.send_response(ok_response(&req)).await;

        let req = expect_ladder_step(&mut conn, Method::Teardown).await;
        conn.send_response(ok_response(&req)).await;
    });

    client.start(&url).await.unwrap();
    client.options(&url).await.unwrap();
    let (tracks, base_url, _) = client.describe(&url).await.unwrap();
    client
        .setup(TransportMode::Play, &tracks[0], &base_url, 0, 0)
        .await
        .unwrap();
    client.play(None).await.unwrap();

    let (kind, track_id, pkt) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!((kind, track_id, &pkt[..]), ("rtp", 0, &b"\xaa\xbb\xcc\xdd"[..]));
    let (kind, track_id, pkt) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!((kind, track_id, &pkt[..]), ("rtcp", 0, &b"\xee\xff"[..]));

    // With the reader task running, a response still reaches its request.
    let resp = client.options(&url).await.unwrap();
    assert_eq!(resp.status, StatusCode::OK);

    client.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn state_violation_leaves_state_unchanged() {
    let client = Client::new(SessionOptions::default());

    let e = client.play(None).await.unwrap_err();
    assert_eq!(e.kind(), ErrorKind::StateViolation);
    assert_eq!(
        e.state_violation(),
        Some((Method::Play, SessionPhase::Initial))
    );

    // The session is still Initial, not poisoned: the same violation
    // reproduces and no error is latched.
    let e = client.record().await.unwrap_err();
    assert_eq!(
        e.state_violation(),
        Some((Method::Record, SessionPhase::Initial))
    );
    let e = client.pause().await.unwrap_err();
    assert_eq!(
        e.state_violation(),
        Some((Method::Pause, SessionPhase::Initial))
    );
}

#[tokio::test]
async fn publish_over_tcp() {
    let (listener, url) = bind_server("/publish").await;

    let server = tokio::spawn(async move {
        let mut conn = ServerConn::accept(&listener).await;
        let req = expect_ladder_step(&mut conn, Method::Options).await;
        conn.send_response(ok_response(&req).header(headers::PUBLIC, PUBLIC_METHODS))
            .await;

        let req = expect_ladder_step(&mut conn, Method::Announce).await;
        assert_eq!(req.headers.get(headers::CONTENT_TYPE), Some("application/sdp"));
        let body = String::from_utf8(req.body.to_vec()).unwrap();
        assert!(body.contains("m=video"));
        assert!(body.contains("a=control:trackID=0"));
        conn.send_response(ok_response(&req)).await;

        let req = expect_ladder_step(&mut conn, Method::Setup).await;
        let transport = req.headers.get(headers::TRANSPORT).unwrap().to_owned();
        assert!(transport.contains("RTP/AVP/TCP"));
        assert!(transport.contains("interleaved=0-1"));
        assert!(transport.contains("mode=record"));
        conn.send_response(
            ok_response(&req)
                .header(headers::SESSION, "pub42")
                .header(headers::TRANSPORT, "RTP/AVP/TCP;unicast;interleaved=0-1"),
        )
        .await;

        let req = expect_ladder_step(&mut conn, Method::Record).await;
        assert_eq!(req.headers.get(headers::SESSION), Some("pub42"));
        conn.send_response(ok_response(&req).header(headers::SESSION, "pub42"))
            .await;

        // The published packet arrives framed as `$ <ch> <len> <payload>`.
        match conn.next_message().await {
            crate::message::Message::Data(d) => {
                assert_eq!(d.channel_id, 0);
                assert_eq!(&d.payload[..], RTP_PACKET);
            }
            o => panic!("expected interleaved data, got {o:?}"),
        }
        match conn.next_message().await {
            crate::message::Message::Data(d) => {
                assert_eq!(d.channel_id, 1);
                assert_eq!(&d.payload[..], b"\x80\xc8\x00\x00");
            }
            o => panic!("expected interleaved data, got {o:?}"),
        }

        let req = expect_ladder_step(&mut conn, Method::Teardown).await;
        conn.send_response(ok_response(&req)).await;
    });

    let client = Client::new(SessionOptions::default().transport(Transport::Tcp));
    client.start(&url).await.unwrap();
    client.options(&url).await.unwrap();

    let sdp = sdp_types::Session::parse(SDP_ONE_VIDEO_TRACK).unwrap();
    let mut media = sdp.medias[0].clone();
    media.attributes.retain(|a| a.attribute != "control");
    let track = Track::new(0, media);
    client.announce(&url, vec![track]).await.unwrap();

    let announced = client.tracks();
    assert_eq!(announced.len(), 1);
    client
        .setup(TransportMode::Record, &announced[0], &url, 0, 0)
        .await
        .unwrap();
    client.record().await.unwrap();

    client
        .write_packet_rtp(0, Bytes::from_static(RTP_PACKET))
        .await
        .unwrap();
    client
        .write_packet_rtcp(0, Bytes::from_static(b"\x80\xc8\x00\x00"))
        .await
        .unwrap();

    client.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn keep_alive_cadence() {
    let (listener, url) = bind_server("/stream").await;

    let server = tokio::spawn(async move {
        let mut conn = ServerConn::accept(&listener).await;
        let req = expect_ladder_step(&mut conn, Method::Options).await;
        conn.send_response(ok_response(&req).header(headers::PUBLIC, PUBLIC_METHODS))
            .await;
        let req = expect_ladder_step(&mut conn, Method::Describe).await;
        conn.send_response(
            ok_response(&req)
                .header(headers::CONTENT_TYPE, "application/sdp")
                .body(Bytes::from_static(SDP_ONE_VIDEO_TRACK)),
        )
        .await;
        let req = expect_ladder_step(&mut conn, Method::Setup).await;
        conn.send_response(
            ok_response(&req)
                .header(headers::SESSION, "ka1")
                .header(headers::TRANSPORT, "RTP/AVP/TCP;unicast;interleaved=0-1"),
        )
        .await;
        let req = expect_ladder_step(&mut conn, Method::Play).await;
        conn.send_response(ok_response(&req).header(headers::SESSION, "ka1"))
            .await;

        // Count keep-alives for a bit over a second, then serve until
        // TEARDOWN.
        let deadline = tokio::time::Instant::now() + Duration::from_millis(1100);
        let mut keepalives = 0u32;
        loop {
            let req = match tokio::time::timeout_at(deadline, conn.next_request()).await {
                Ok(req) => req,
                Err(_) => break,
            };
            assert_eq!(req.method, Method::GetParameter);
            assert_eq!(req.headers.get(headers::SESSION), Some("ka1"));
            keepalives += 1;
            conn.send_response(ok_response(&req)).await;
        }
        assert!(
            (3..=8).contains(&keepalives),
            "expected ~5 keep-alives in 1.1s at a 200ms period, got {keepalives}"
        );
        loop {
            let req = conn.next_request().await;
            let is_teardown = req.method == Method::Teardown;
            conn.send_response(ok_response(&req)).await;
            if is_teardown {
                break;
            }
        }
    });

    let client = Client::new(
        SessionOptions::default()
            .transport(Transport::Tcp)
            .keep_alive_period(Some(Duration::from_millis(200))),
    );
    client.start(&url).await.unwrap();
    client.options(&url).await.unwrap();
    let (tracks, base_url, _) = client.describe(&url).await.unwrap();
    client
        .setup(TransportMode::Play, &tracks[0], &base_url, 0, 0)
        .await
        .unwrap();
    client.play(None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1300)).await;
    client.close().await;
    server.await.unwrap();
}

#[test]
fn phase_table() {
    use Method::*;
    use SessionPhase::{Closed, Initial, PrePlay, PreRecord, PreSetup};
    assert!(Initial.allows(Options));
    assert!(Initial.allows(Describe));
    assert!(Initial.allows(Announce));
    assert!(!Initial.allows(Setup));
    assert!(!Initial.allows(Play));

    assert!(PreSetup.allows(Setup));
    assert!(!PreSetup.allows(Play));

    assert!(PrePlay.allows(Setup));
    assert!(PrePlay.allows(Play));
    assert!(PrePlay.allows(Teardown));
    assert!(!PrePlay.allows(Record));
    assert!(!PrePlay.allows(GetParameter));

    assert!(PreRecord.allows(Record));
    assert!(!PreRecord.allows(Play));

    for phase in [SessionPhase::Play, SessionPhase::Record] {
        assert!(phase.allows(Options));
        assert!(phase.allows(Pause));
        assert!(phase.allows(GetParameter));
        assert!(phase.allows(Teardown));
        assert!(!phase.allows(Setup));
        assert!(!phase.allows(Describe));
    }

    for method in [
        Options,
        Describe,
        Announce,
        Setup,
        Play,
        Record,
        Pause,
        Teardown,
        GetParameter,
        SetParameter,
    ] {
        assert!(!Closed.allows(method));
    }
}
