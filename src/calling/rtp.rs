//! RTP framing for the G.711 audio channel (RFC 3550).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           synchronization source (SSRC) identifier            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use anyhow::{bail, Result};

pub const RTP_HEADER_SIZE: usize = 12;

/// G.711 mu-law.
pub const PT_PCMU: u8 = 0;
/// G.711 A-law.
pub const PT_PCMA: u8 = 8;

/// Samples per 20ms packet at 8000 Hz.
pub const SAMPLES_PER_PACKET: usize = 160;

pub const PACKET_INTERVAL_MS: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

pub fn encode(header: &RtpHeader, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RTP_HEADER_SIZE + payload.len());
    // V=2, no padding, no extension, no CSRCs
    buf.push(0x80);
    buf.push(((header.marker as u8) << 7) | (header.payload_type & 0x7F));
    buf.extend_from_slice(&header.sequence_number.to_be_bytes());
    buf.extend_from_slice(&header.timestamp.to_be_bytes());
    buf.extend_from_slice(&header.ssrc.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Decode a packet, returning the header and the payload slice.
///
/// CSRC lists, header extensions and padding are skipped.
pub fn decode(data: &[u8]) -> Result<(RtpHeader, &[u8])> {
    if data.len() < RTP_HEADER_SIZE {
        bail!("RTP packet too short: {} bytes", data.len());
    }
    let version = data[0] >> 6;
    if version != 2 {
        bail!("Unsupported RTP version: {}", version);
    }

    let padding = data[0] & 0x20 != 0;
    let extension = data[0] & 0x10 != 0;
    let csrc_count = (data[0] & 0x0F) as usize;

    let mut offset = RTP_HEADER_SIZE + csrc_count * 4;
    if extension {
        if data.len() < offset + 4 {
            bail!("RTP extension header truncated");
        }
        let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4 + words * 4;
    }
    let mut end = data.len();
    if padding && end > offset {
        let pad = data[end - 1] as usize;
        if pad == 0 || pad > end - offset {
            bail!("RTP padding length {} invalid", pad);
        }
        end -= pad;
    }
    if offset > end {
        bail!("RTP header longer than packet ({} > {})", offset, end);
    }

    let header = RtpHeader {
        marker: data[1] & 0x80 != 0,
        payload_type: data[1] & 0x7F,
        sequence_number: u16::from_be_bytes([data[2], data[3]]),
        timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
    };
    Ok((header, &data[offset..end]))
}

/// One 20ms frame of silence for the given G.711 payload type.
pub fn silence(payload_type: u8) -> Vec<u8> {
    let byte = if payload_type == PT_PCMA { 0xD5 } else { 0xFF };
    vec![byte; SAMPLES_PER_PACKET]
}

/// Sequence/timestamp state for one outbound stream.
#[derive(Debug)]
pub struct RtpStream {
    pub ssrc: u32,
    pub payload_type: u8,
    sequence_number: u16,
    timestamp: u32,
    first: bool,
}

impl RtpStream {
    pub fn new(payload_type: u8) -> Self {
        let id = uuid::Uuid::new_v4();
        let b = id.as_bytes();
        Self {
            ssrc: u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
            payload_type,
            sequence_number: u16::from_be_bytes([b[4], b[5]]),
            timestamp: u32::from_be_bytes([b[6], b[7], b[8], b[9]]),
            first: true,
        }
    }

    /// Frame `payload` as the next packet of the stream.
    pub fn next_packet(&mut self, payload: &[u8]) -> Vec<u8> {
        let header = RtpHeader {
            marker: self.first,
            payload_type: self.payload_type,
            sequence_number: self.sequence_number,
            timestamp: self.timestamp,
            ssrc: self.ssrc,
        };
        self.first = false;
        self.sequence_number = self.sequence_number.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(SAMPLES_PER_PACKET as u32);
        encode(&header, payload)
    }

    /// Advance the clock without sending, so the next packet stays in sync.
    pub fn skip_frame(&mut self) {
        self.timestamp = self.timestamp.wrapping_add(SAMPLES_PER_PACKET as u32);
        self.first = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_skips_csrc_and_padding() {
        let mut pkt = vec![0xA2, 0x08, 0x00, 0x01, 0, 0, 0, 160, 0, 0, 0, 7];
        pkt.extend_from_slice(&[0u8; 8]); // two CSRCs
        pkt.extend_from_slice(&[1, 2, 3]);
        pkt.extend_from_slice(&[0, 0, 3]); // 3 bytes of padding
        let (header, payload) = decode(&pkt).unwrap();
        assert_eq!(header.payload_type, PT_PCMA);
        assert_eq!(header.ssrc, 7);
        assert_eq!(payload, &[1, 2, 3]);
    }

    #[test]
    fn test_decode_rejects_short_or_wrong_version() {
        assert!(decode(&[0x80, 0x00]).is_err());
        assert!(decode(&[0u8; 12]).is_err());
    }

    #[test]
    fn test_decode_rejects_bad_padding_length() {
        let mut pkt = vec![0xA0, 0x00, 0x00, 0x01, 0, 0, 0, 160, 0, 0, 0, 7];
        pkt.push(200);
        assert!(decode(&pkt).is_err());

        let last = pkt.len() - 1;
        pkt[last] = 0;
        assert!(decode(&pkt).is_err());

        pkt[last] = 1;
        let (_, payload) = decode(&pkt).unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn test_stream_advances_sequence_and_timestamp() {
        let mut stream = RtpStream::new(PT_PCMU);
        let a = stream.next_packet(&silence(PT_PCMU));
        let b = stream.next_packet(&silence(PT_PCMU));
        let (ha, pa) = decode(&a).unwrap();
        let (hb, _) = decode(&b).unwrap();

        assert!(ha.marker);
        assert!(!hb.marker);
        assert_eq!(hb.sequence_number, ha.sequence_number.wrapping_add(1));
        assert_eq!(hb.timestamp, ha.timestamp.wrapping_add(160));
        assert_eq!(pa.len(), SAMPLES_PER_PACKET);
    }

    #[test]
    fn test_skip_frame_keeps_clock_running() {
        let mut stream = RtpStream::new(PT_PCMU);
        let p1 = stream.next_packet(&[]);
        stream.skip_frame();
        stream.skip_frame();
        let p2 = stream.next_packet(&[]);
        let (h1, _) = decode(&p1).unwrap();
        let (h2, _) = decode(&p2).unwrap();
        assert_eq!(h2.timestamp, h1.timestamp.wrapping_add(3 * 160));
        assert_eq!(h2.sequence_number, h1.sequence_number.wrapping_add(1));
        assert!(h2.marker);
    }

    #[test]
    fn test_silence_bytes() {
        assert!(silence(PT_PCMU).iter().all(|&b| b == 0xFF));
        assert!(silence(PT_PCMA).iter().all(|&b| b == 0xD5));
    }
}
