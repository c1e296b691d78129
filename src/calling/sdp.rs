//! Minimal SDP offer/answer handling for audio-only calls.
//!
//! Parses enough of a remote session description to find the media address,
//! the offered payload types and the direction attribute, and generates local
//! offers and answers for G.711 with RFC 4733 telephone events.

use std::net::{IpAddr, SocketAddr};

use anyhow::{bail, Context, Result};

use super::rtp::{PT_PCMA, PT_PCMU};

/// Dynamic payload type we offer for telephone-event.
pub const PT_TELEPHONE_EVENT: u8 = 101;

/// Media direction attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    fn as_attr(self) -> &'static str {
        match self {
            MediaDirection::SendRecv => "a=sendrecv",
            MediaDirection::SendOnly => "a=sendonly",
            MediaDirection::RecvOnly => "a=recvonly",
            MediaDirection::Inactive => "a=inactive",
        }
    }
}

/// Fields extracted from a remote session description.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDescription {
    pub connection_ip: Option<IpAddr>,
    pub audio_port: u16,
    /// Payload types listed on the `m=audio` line, in preference order.
    pub payload_types: Vec<u8>,
    pub telephone_event: Option<u8>,
    pub direction: MediaDirection,
}

impl SessionDescription {
    /// First offered G.711 payload type we can speak.
    pub fn audio_codec(&self) -> Option<u8> {
        self.payload_types
            .iter()
            .copied()
            .find(|pt| *pt == PT_PCMU || *pt == PT_PCMA)
    }

    /// Where to send RTP, if the description names a usable address.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        let ip = self.connection_ip?;
        if self.audio_port == 0 || ip.is_unspecified() {
            return None;
        }
        Some(SocketAddr::new(ip, self.audio_port))
    }
}

/// Parse a remote SDP blob.
pub fn parse(blob: &str) -> Result<SessionDescription> {
    let mut session_ip: Option<IpAddr> = None;
    let mut media_ip: Option<IpAddr> = None;
    let mut audio_port: Option<u16> = None;
    let mut payload_types = Vec::new();
    let mut telephone_event = None;
    let mut direction = MediaDirection::SendRecv;
    let mut in_audio = false;

    for line in blob.lines() {
        let line = line.trim();

        if let Some(rest) = line.strip_prefix("m=") {
            in_audio = rest.starts_with("audio ");
            if in_audio && audio_port.is_none() {
                let parts: Vec<&str> = rest.split_whitespace().collect();
                if parts.len() < 4 {
                    bail!("Malformed m= line: {}", line);
                }
                audio_port = Some(
                    parts[1]
                        .parse()
                        .with_context(|| format!("Bad audio port in {}", line))?,
                );
                payload_types = parts[3..].iter().filter_map(|p| p.parse().ok()).collect();
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("c=IN ") {
            let addr = rest
                .split_whitespace()
                .nth(1)
                .and_then(|a| a.parse::<IpAddr>().ok());
            if in_audio {
                media_ip = addr;
            } else if audio_port.is_none() {
                session_ip = addr;
            }
            continue;
        }

        if in_audio {
            if let Some(rest) = line.strip_prefix("a=rtpmap:") {
                let mut it = rest.splitn(2, ' ');
                let pt = it.next().and_then(|p| p.parse::<u8>().ok());
                let name = it.next().unwrap_or_default();
                if let Some(pt) = pt {
                    if name.to_ascii_lowercase().starts_with("telephone-event/") {
                        telephone_event = Some(pt);
                    }
                }
            }
            direction = match line {
                "a=sendrecv" => MediaDirection::SendRecv,
                "a=sendonly" => MediaDirection::SendOnly,
                "a=recvonly" => MediaDirection::RecvOnly,
                "a=inactive" => MediaDirection::Inactive,
                _ => direction,
            };
        }
    }

    let audio_port = audio_port.context("No m=audio section in SDP")?;

    Ok(SessionDescription {
        connection_ip: media_ip.or(session_ip),
        audio_port,
        payload_types,
        telephone_event,
        direction,
    })
}

fn write_body(
    local_ip: &str,
    local_port: u16,
    session_version: u64,
    codecs: &[u8],
    event_pt: Option<u8>,
    direction: MediaDirection,
) -> String {
    let mut pts: Vec<String> = codecs.iter().map(|pt| pt.to_string()).collect();
    if let Some(pt) = event_pt {
        pts.push(pt.to_string());
    }

    let mut sdp = String::new();
    sdp.push_str("v=0\r\n");
    sdp.push_str(&format!(
        "o=- {} {} IN IP4 {}\r\n",
        session_version, session_version, local_ip
    ));
    sdp.push_str("s=agent-desk\r\n");
    sdp.push_str(&format!("c=IN IP4 {}\r\n", local_ip));
    sdp.push_str("t=0 0\r\n");
    sdp.push_str(&format!("m=audio {} RTP/AVP {}\r\n", local_port, pts.join(" ")));
    for pt in codecs {
        match *pt {
            PT_PCMU => sdp.push_str("a=rtpmap:0 PCMU/8000\r\n"),
            PT_PCMA => sdp.push_str("a=rtpmap:8 PCMA/8000\r\n"),
            _ => {}
        }
    }
    if let Some(pt) = event_pt {
        sdp.push_str(&format!("a=rtpmap:{} telephone-event/8000\r\n", pt));
        sdp.push_str(&format!("a=fmtp:{} 0-16\r\n", pt));
    }
    sdp.push_str("a=ptime:20\r\n");
    sdp.push_str(direction.as_attr());
    sdp.push_str("\r\n");
    sdp
}

/// Generate an SDP offer for an outgoing call (PCMU, PCMA, telephone-event).
pub fn generate_offer(local_ip: &str, local_port: u16, session_version: u64) -> String {
    write_body(
        local_ip,
        local_port,
        session_version,
        &[PT_PCMU, PT_PCMA],
        Some(PT_TELEPHONE_EVENT),
        MediaDirection::SendRecv,
    )
}

/// Generate an answer to a remote offer, choosing the first G.711 codec offered.
pub fn generate_answer(
    local_ip: &str,
    local_port: u16,
    session_version: u64,
    offer: &SessionDescription,
) -> Result<String> {
    let codec = offer
        .audio_codec()
        .context("Offer contains no supported audio codec (PCMU/PCMA)")?;
    let direction = match offer.direction {
        MediaDirection::SendOnly => MediaDirection::RecvOnly,
        MediaDirection::RecvOnly => MediaDirection::SendOnly,
        other => other,
    };
    Ok(write_body(
        local_ip,
        local_port,
        session_version,
        &[codec],
        offer.telephone_event,
        direction,
    ))
}

/// Local IP address of the default route, or 127.0.0.1.
pub fn get_local_ip() -> String {
    // Connecting a UDP socket sends nothing; it only makes the OS pick the
    // outbound interface.
    if let Ok(socket) = std::net::UdpSocket::bind("0.0.0.0:0") {
        if socket.connect("8.8.8.8:80").is_ok() {
            if let Ok(addr) = socket.local_addr() {
                return addr.ip().to_string();
            }
        }
    }
    "127.0.0.1".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "\
v=0\r\n\
o=- 1 1 IN IP4 10.0.0.1\r\n\
s=pbx\r\n\
c=IN IP4 10.0.0.1\r\n\
t=0 0\r\n\
m=audio 21730 RTP/AVP 8 0 101\r\n\
a=rtpmap:8 PCMA/8000\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:101 telephone-event/8000\r\n\
a=sendrecv\r\n";

    #[test]
    fn test_parse_offer() {
        let sd = parse(OFFER).unwrap();
        assert_eq!(sd.audio_port, 21730);
        assert_eq!(sd.payload_types, vec![8, 0, 101]);
        assert_eq!(sd.audio_codec(), Some(PT_PCMA));
        assert_eq!(sd.telephone_event, Some(101));
        assert_eq!(sd.remote_addr().unwrap().to_string(), "10.0.0.1:21730");
    }

    #[test]
    fn test_media_level_connection_overrides_session() {
        let sdp = "v=0\r\nc=IN IP4 10.0.0.1\r\nm=audio 4000 RTP/AVP 0\r\nc=IN IP4 10.0.0.9\r\na=recvonly\r\n";
        let sd = parse(sdp).unwrap();
        assert_eq!(sd.remote_addr().unwrap().to_string(), "10.0.0.9:4000");
        assert_eq!(sd.direction, MediaDirection::RecvOnly);
    }

    #[test]
    fn test_parse_rejects_missing_audio() {
        assert!(parse("v=0\r\ns=x\r\n").is_err());
    }

    #[test]
    fn test_answer_mirrors_codec_and_direction() {
        let mut offer = parse(OFFER).unwrap();
        offer.direction = MediaDirection::SendOnly;
        let answer = generate_answer("192.168.1.5", 5000, 7, &offer).unwrap();
        assert!(answer.contains("m=audio 5000 RTP/AVP 8 101\r\n"));
        assert!(answer.contains("a=recvonly"));

        let parsed = parse(&answer).unwrap();
        assert_eq!(parsed.audio_codec(), Some(PT_PCMA));
    }

    #[test]
    fn test_answer_without_common_codec_fails() {
        let sdp = "v=0\r\nc=IN IP4 10.0.0.1\r\nm=audio 4000 RTP/AVP 9 18\r\n";
        let offer = parse(sdp).unwrap();
        assert!(generate_answer("127.0.0.1", 5000, 1, &offer).is_err());
    }

    #[test]
    fn test_offer_round_trips_through_parser() {
        let offer = generate_offer("192.168.1.5", 6000, 1);
        let sd = parse(&offer).unwrap();
        assert_eq!(sd.payload_types, vec![PT_PCMU, PT_PCMA, PT_TELEPHONE_EVENT]);
        assert_eq!(sd.direction, MediaDirection::SendRecv);
    }
}
