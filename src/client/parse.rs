// Copyright (C) 2024 the macula authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interpretation of response headers and SDP bodies.
//!
//! Errors from this module are `String` descriptions; callers pack them
//! into a crate [`crate::Error`] with connection context attached.

use std::net::IpAddr;

use bytes::Bytes;
use url::Url;

use crate::message::{headers, HeaderMap, Method, Response};

use super::Track;

/// Returns the `CSeq` header as a `u32`, or `None` if missing/unparseable.
pub(crate) fn get_cseq(headers: &HeaderMap) -> Option<u32> {
    headers
        .get(headers::CSEQ)
        .and_then(|cseq| u32::from_str_radix(cseq.trim(), 10).ok())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SessionHeader {
    pub(crate) id: Box<str>,
    /// `None` when the server did not advertise a timeout. RFC 2326's
    /// default is 60 seconds, but keep-alive derivation distinguishes an
    /// explicit value from the default.
    pub(crate) timeout_sec: Option<u32>,
}

/// Parses a `Session` header: `id[;timeout=sec]`.
/// [RFC 2326 section 12.37](https://datatracker.ietf.org/doc/html/rfc2326#section-12.37).
pub(crate) fn parse_session(value: &str) -> Result<SessionHeader, String> {
    match value.split_once(';') {
        None => Ok(SessionHeader {
            id: value.trim().into(),
            timeout_sec: None,
        }),
        Some((id, params)) => {
            if let Some(v) = params.trim().strip_prefix("timeout=") {
                let timeout_sec =
                    u32::from_str_radix(v.trim(), 10).map_err(|_| format!("unparseable timeout {v}"))?;
                Ok(SessionHeader {
                    id: id.trim().into(),
                    timeout_sec: Some(timeout_sec),
                })
            } else {
                Err(format!("unparseable Session header {value:?}"))
            }
        }
    }
}

/// Server-supplied parameters from a `SETUP` response's `Transport` header.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct TransportParams {
    pub(crate) channel_id: Option<u8>,
    pub(crate) server_port: Option<(u16, u16)>,
    pub(crate) ssrc: Option<u32>,
    pub(crate) source: Option<IpAddr>,
    pub(crate) destination: Option<IpAddr>,
}

pub(crate) fn parse_transport(value: &str) -> Result<TransportParams, String> {
    let mut params = TransportParams::default();
    for part in value.split(';') {
        let part = part.trim();
        if let Some(v) = part.strip_prefix("ssrc=") {
            let v = u32::from_str_radix(v, 16).map_err(|_| format!("unparseable ssrc {v}"))?;
            params.ssrc = Some(v);
        } else if let Some(interleaved) = part.strip_prefix("interleaved=") {
            let mut channels = interleaved.splitn(2, '-');
            let n = channels.next().expect("splitn returns at least one part");
            let n = u8::from_str_radix(n, 10).map_err(|_| format!("bad channel number {n}"))?;
            if let Some(m) = channels.next() {
                let m =
                    u8::from_str_radix(m, 10).map_err(|_| format!("bad second channel number {m}"))?;
                if n.checked_add(1) != Some(m) {
                    return Err(format!("expected adjacent channels; got {n}-{m}"));
                }
            }
            params.channel_id = Some(n);
        } else if let Some(s) = part.strip_prefix("source=") {
            params.source = Some(
                s.parse()
                    .map_err(|_| format!("Transport header has unparseable source {s:?}"))?,
            );
        } else if let Some(s) = part.strip_prefix("destination=") {
            // Only IP-literal destinations are honored; hostname forms are
            // ignored in favor of the control connection's peer address.
            if let Ok(ip) = s.parse() {
                params.destination = Some(ip);
            }
        } else if let Some(s) = part.strip_prefix("server_port=") {
            let mut ports = s.splitn(2, '-');
            let n = ports.next().expect("splitn returns at least one part");
            let n = u16::from_str_radix(n, 10).map_err(|_| format!("bad port in Transport: {value}"))?;
            let m = match ports.next() {
                Some(m) => u16::from_str_radix(m, 10).map_err(|_| format!("bad second port {m}"))?,
                // RFC 2326's grammar allows a single port; RTCP is implied
                // to be the next one up.
                None => n + 1,
            };
            params.server_port = Some((n, m));
        }
    }
    Ok(params)
}

/// Parses a `Public` header into the advertised method set.
pub(crate) fn parse_public(response: &Response) -> Vec<Method> {
    let mut methods = Vec::new();
    for value in response.headers.get_all(headers::PUBLIC) {
        for name in value.split(',') {
            if let Some(m) = Method::parse_token(name.trim()) {
                methods.push(m);
            }
        }
    }
    methods
}

/// Joins a control URL to a base URL in a non-RFC-compliant but common way.
/// This matches what live555 and ffmpeg do.
pub(crate) fn join_control(base_url: &Url, control: &str) -> Result<Url, String> {
    if control == "*" {
        return Ok(base_url.clone());
    }
    if let Ok(absolute_url) = Url::parse(control) {
        return Ok(absolute_url);
    }

    Url::parse(&format!(
        "{}{}{}",
        base_url.as_str(),
        if base_url.as_str().ends_with('/') {
            ""
        } else {
            "/"
        },
        control
    ))
    .map_err(|e| format!("unable to join base url {base_url} with control url {control:?}: {e}"))
}

/// Extracts the RTP clock rate from a media description's `rtpmap`
/// attribute for the first listed payload type, falling back to the common
/// defaults when absent (static audio types run at 8 kHz, video at 90 kHz).
pub(crate) fn clock_rate(media: &sdp_types::Media) -> u32 {
    let fmt = media.fmt.split_ascii_whitespace().next().unwrap_or("");
    for a in &media.attributes {
        if a.attribute != "rtpmap" {
            continue;
        }
        let v = match a.value.as_deref() {
            Some(v) => v,
            None => continue,
        };
        // rtpmap-value = payload-type SP encoding-name "/" clock-rate ["/" channels]
        let (payload_type, v) = match v.split_once(' ') {
            Some(p) => p,
            None => continue,
        };
        if payload_type != fmt {
            continue;
        }
        let mut fields = v.split('/');
        let _encoding = fields.next();
        if let Some(rate) = fields.next().and_then(|r| u32::from_str_radix(r, 10).ok()) {
            return rate;
        }
    }
    if media.media == "audio" {
        8_000
    } else {
        90_000
    }
}

/// Parses a `DESCRIBE` response into the track list, the base URL used to
/// resolve controls, and the aggregate control URL.
pub(crate) fn parse_describe(
    request_url: &Url,
    response: &Response,
) -> Result<(Vec<Track>, Url, Url), String> {
    if !matches!(response.headers.get(headers::CONTENT_TYPE),
                 Some(v) if v.split(';').next() == Some("application/sdp"))
    {
        return Err(format!(
            "DESCRIBE response not of expected application/sdp content type: {:?}",
            response.headers.get(headers::CONTENT_TYPE),
        ));
    }

    let sdp = sdp_types::Session::parse(&response.body[..]).map_err(|e| {
        format!(
            "unable to parse SDP: {}\n\n{:#?}",
            e,
            crate::hex::LimitedHex::new(&response.body[..], 128),
        )
    })?;

    // https://tools.ietf.org/html/rfc2326#appendix-C.1.1
    let base_url = response
        .headers
        .get(headers::CONTENT_BASE)
        .map(|v| (headers::CONTENT_BASE, v))
        .or_else(|| {
            response
                .headers
                .get(headers::CONTENT_LOCATION)
                .map(|v| (headers::CONTENT_LOCATION, v))
        })
        .map(|(h, v)| Url::parse(v).map_err(|e| format!("bad {h} {v:?}: {e}")))
        .unwrap_or_else(|| Ok(request_url.clone()))?;

    let mut control = None;
    for a in &sdp.attributes {
        if a.attribute == "control" {
            control = a
                .value
                .as_deref()
                .map(|c| join_control(&base_url, c))
                .transpose()?;
            break;
        }
    }
    let control = control.unwrap_or_else(|| request_url.clone());

    let tracks = sdp
        .medias
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let track_control = m
                .attributes
                .iter()
                .find(|a| a.attribute == "control")
                .and_then(|a| a.value.as_deref())
                .map(|c| join_control(&base_url, c))
                .transpose()
                .map_err(|e| format!("unable to parse track {i}: {e}"))?;
            Ok(Track {
                id: i,
                media: m.clone(),
                control: track_control,
                clock_rate: clock_rate(m),
            })
        })
        .collect::<Result<Vec<Track>, String>>()?;

    if tracks.is_empty() {
        return Err("no media sections in SDP".to_owned());
    }

    Ok((tracks, base_url, control))
}

/// Serializes tracks into an `ANNOUNCE` body.
///
/// Session-level boilerplate comes from a parsed template so that only the
/// media sections vary; each media gets a `control` attribute of
/// `trackID=<id>` unless it already carries one.
pub(crate) fn encode_announce(tracks: &[Track]) -> Result<Bytes, String> {
    let mut session = sdp_types::Session::parse(
        b"v=0\r\n\
          o=- 0 0 IN IP4 127.0.0.1\r\n\
          s=Stream\r\n\
          t=0 0\r\n",
    )
    .map_err(|e| format!("internal SDP template error: {e}"))?;

    for track in tracks {
        let mut media = track.media.clone();
        if !media.attributes.iter().any(|a| a.attribute == "control") {
            media.attributes.push(sdp_types::Attribute {
                attribute: "control".to_owned(),
                value: Some(format!("trackID={}", track.id)),
            });
        }
        session.medias.push(media);
    }

    let mut out = Vec::new();
    session
        .write(&mut out)
        .map_err(|e| format!("unable to serialize SDP: {e}"))?;
    Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::StatusCode;

    fn describe_response(body: &'static [u8]) -> Response {
        Response::new(StatusCode::OK, "OK")
            .header(headers::CSEQ, "2")
            .header(headers::CONTENT_TYPE, "application/sdp")
            .body(Bytes::from_static(body))
    }

    #[test]
    fn session_header_with_timeout() {
        assert_eq!(
            parse_session("ABC123;timeout=30").unwrap(),
            SessionHeader {
                id: "ABC123".into(),
                timeout_sec: Some(30),
            }
        );
    }

    #[test]
    fn session_header_without_timeout() {
        assert_eq!(parse_session("ABC123").unwrap().timeout_sec, None);
    }

    #[test]
    fn transport_udp() {
        let params =
            parse_transport("RTP/AVP;unicast;client_port=8000-8001;server_port=9000-9001;ssrc=1A2B3C4D")
                .unwrap();
        assert_eq!(params.server_port, Some((9000, 9001)));
        assert_eq!(params.ssrc, Some(0x1a2b_3c4d));
        assert_eq!(params.channel_id, None);
    }

    #[test]
    fn transport_single_server_port_implies_pair() {
        let params = parse_transport("RTP/AVP;unicast;server_port=9000").unwrap();
        assert_eq!(params.server_port, Some((9000, 9001)));
    }

    #[test]
    fn transport_interleaved() {
        let params = parse_transport("RTP/AVP/TCP;unicast;interleaved=4-5").unwrap();
        assert_eq!(params.channel_id, Some(4));
        parse_transport("RTP/AVP/TCP;unicast;interleaved=4-6").unwrap_err();
    }

    #[test]
    fn transport_source_address() {
        let params =
            parse_transport("RTP/AVP;unicast;source=192.168.1.10;server_port=9000-9001").unwrap();
        assert_eq!(params.source, Some("192.168.1.10".parse().unwrap()));
    }

    #[test]
    fn describe_single_track() {
        let url = Url::parse("rtsp://127.0.0.1/stream").unwrap();
        let response = describe_response(
            b"v=0\r\n\
              o=- 0 0 IN IP4 127.0.0.1\r\n\
              s=Stream\r\n\
              t=0 0\r\n\
              m=video 0 RTP/AVP 96\r\n\
              a=rtpmap:96 H264/90000\r\n\
              a=control:trackID=0\r\n",
        );
        let (tracks, base, control) = parse_describe(&url, &response).unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].id, 0);
        assert_eq!(tracks[0].clock_rate, 90_000);
        assert_eq!(
            tracks[0].control.as_ref().unwrap().as_str(),
            "rtsp://127.0.0.1/stream/trackID=0"
        );
        assert_eq!(base, url);
        assert_eq!(control, url);
    }

    #[test]
    fn describe_content_base_wins() {
        let url = Url::parse("rtsp://127.0.0.1/stream").unwrap();
        let mut response = describe_response(
            b"v=0\r\n\
              o=- 0 0 IN IP4 127.0.0.1\r\n\
              s=Stream\r\n\
              t=0 0\r\n\
              m=audio 0 RTP/AVP 0\r\n\
              a=control:trackID=1\r\n",
        );
        response
            .headers
            .add(headers::CONTENT_BASE, "rtsp://other/base/");
        let (tracks, base, _) = parse_describe(&url, &response).unwrap();
        assert_eq!(base.as_str(), "rtsp://other/base/");
        assert_eq!(
            tracks[0].control.as_ref().unwrap().as_str(),
            "rtsp://other/base/trackID=1"
        );
        // Static audio payload type without rtpmap: 8 kHz.
        assert_eq!(tracks[0].clock_rate, 8_000);
    }

    #[test]
    fn describe_rejects_non_sdp() {
        let url = Url::parse("rtsp://127.0.0.1/stream").unwrap();
        let response = Response::new(StatusCode::OK, "OK").body(Bytes::from_static(b"v=0\r\n"));
        parse_describe(&url, &response).unwrap_err();
    }

    #[test]
    fn announce_body_has_controls() {
        let response = describe_response(
            b"v=0\r\n\
              o=- 0 0 IN IP4 127.0.0.1\r\n\
              s=Stream\r\n\
              t=0 0\r\n\
              m=video 0 RTP/AVP 96\r\n\
              a=rtpmap:96 H264/90000\r\n",
        );
        let url = Url::parse("rtsp://127.0.0.1/stream").unwrap();
        let (tracks, _, _) = parse_describe(&url, &response).unwrap();
        let body = encode_announce(&tracks).unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("m=video"));
        assert!(text.contains("a=control:trackID=0"));
        // Round-trips through the SDP parser.
        sdp_types::Session::parse(text.as_bytes()).unwrap();
    }

    #[test]
    fn public_methods() {
        let response = Response::new(StatusCode::OK, "OK")
            .header("Public", "OPTIONS, DESCRIBE, SETUP, PLAY, GET_PARAMETER");
        let methods = parse_public(&response);
        assert!(methods.contains(&Method::GetParameter));
        assert!(methods.contains(&Method::Play));
        assert!(!methods.contains(&Method::Record));
    }
}
