//! ICMP Echo request/reply wire codec.
//!
//! Encodes and decodes the 64-octet Echo packets the rest of the engine
//! sends and receives, and computes the RFC 1071 ones'-complement checksum
//! that both ICMPv4 and ICMPv6 echo messages use over the ICMP message
//! itself (ICMPv6 additionally folds in a pseudo-header at the kernel level,
//! which is out of scope here: the kernel/stack computes the real wire
//! checksum for raw ICMPv6 sockets, so this codec's checksum is only
//! authoritative for the ICMPv4 path and for round-trip validation).

use std::time::Duration;

/// Total length in octets of an Echo request/reply payload, header included.
pub const REQUEST_LEN: usize = 64;
/// Length of the fixed ICMP header: type, code, checksum, id, sequence.
pub const HEADER_LEN: usize = 8;
/// Length of the monotonic-clock timestamp payload.
pub const TIME_LEN: usize = 8;
/// Length of the trailing 'Q' padding.
pub const PADDING_LEN: usize = REQUEST_LEN - HEADER_LEN - TIME_LEN;
/// Length of an IPv4 header some kernels prepend to received ICMP datagrams.
pub const IP_HEADER_LEN: usize = 20;

const PADDING_BYTE: u8 = b'Q';

const ICMPV4_ECHO_REQUEST: u8 = 8;
const ICMPV4_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;
const ICMPV4_DEST_UNREACHABLE: u8 = 3;

/// Address family an Echo request/reply belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    fn request_type(self) -> u8 {
        match self {
            Family::V4 => ICMPV4_ECHO_REQUEST,
            Family::V6 => ICMPV6_ECHO_REQUEST,
        }
    }
}

/// A decoded Echo reply (or Destination Unreachable notification).
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub kind: u8,
    pub code: u8,
    pub id: u16,
    pub sequence: u16,
    /// Monotonic-clock reading the sender recorded at send time, seconds.
    /// Absent for Destination Unreachable replies, which carry no echo
    /// timestamp of their own.
    pub time_sent: Option<f64>,
    pub size: usize,
}

impl Reply {
    pub fn is_echo_reply(&self) -> bool {
        self.kind == ICMPV4_ECHO_REPLY || self.kind == ICMPV6_ECHO_REPLY
    }

    pub fn is_destination_unreachable(&self) -> bool {
        self.kind == ICMPV4_DEST_UNREACHABLE
    }
}

/// Errors produced while decoding a received datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// The buffer was shorter than the header it was expected to contain.
    Truncated,
    /// The ICMP type was neither an echo reply nor Destination Unreachable.
    WrongType(u8),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Truncated => write!(f, "reply shorter than the ICMP header"),
            CodecError::WrongType(kind) => write!(f, "wrong type: {kind}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// RFC 792 Destination Unreachable code table. Only used for reporting.
pub fn unreachable_reason(code: u8) -> Option<&'static str> {
    let reason = match code {
        0 => "Destination network unreachable",
        1 => "Destination host unreachable",
        2 => "Destination protocol unreachable",
        3 => "Destination port unreachable",
        4 => "Fragmentation required",
        5 => "Source route failed",
        6 => "Destination network unknown",
        7 => "Destination host unknown",
        8 => "Source host isolated",
        9 => "Network administratively prohibited",
        10 => "Host administratively prohibited",
        11 => "Network unreachable for ToS",
        12 => "Host unreachable for ToS",
        13 => "Communication administratively prohibited",
        14 => "Host Precedence Violation",
        15 => "Precedence cutoff in effect",
        _ => return None,
    };
    Some(reason)
}

/// RFC 1071 16-bit ones'-complement checksum.
///
/// Sums the buffer as 16-bit big-endian words, folding carries back into
/// the low 16 bits, then returns the bitwise complement. An odd-length
/// buffer is treated as though padded with a trailing zero byte.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Encode an Echo request. `time_sent` must come from a monotonic clock
/// (seconds as an `f64`); it is stored verbatim and read back unmodified by
/// `decode_reply` for RTT computation in the same process.
pub fn encode_request(family: Family, id: u16, sequence: u16, time_sent: f64) -> [u8; REQUEST_LEN] {
    let mut packet = [0u8; REQUEST_LEN];
    packet[0] = family.request_type();
    packet[1] = 0; // code
    // packet[2..4] checksum, patched below
    packet[4..6].copy_from_slice(&id.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    packet[HEADER_LEN..HEADER_LEN + TIME_LEN].copy_from_slice(&time_sent.to_le_bytes());
    packet[HEADER_LEN + TIME_LEN..].fill(PADDING_BYTE);

    let csum = checksum(&packet);
    packet[2..4].copy_from_slice(&csum.to_be_bytes());
    packet
}

/// Decode a received ICMP datagram into a `Reply`.
///
/// `has_outer_ip_header` must reflect whether the kernel prepended a
/// 20-octet IPv4 header to `data` (see `Endpoint::has_outer_ip_header`).
/// Succeeds for echo replies and for Destination Unreachable notifications
/// (whose `time_sent` is `None`); any other type is `WrongType`.
pub fn decode_reply(data: &[u8], has_outer_ip_header: bool) -> Result<Reply, CodecError> {
    let offset = if has_outer_ip_header { IP_HEADER_LEN } else { 0 };
    let header = data.get(offset..offset + HEADER_LEN).ok_or(CodecError::Truncated)?;

    let kind = header[0];
    let code = header[1];
    let id = u16::from_be_bytes([header[4], header[5]]);
    let sequence = u16::from_be_bytes([header[6], header[7]]);

    let is_echo_reply = kind == ICMPV4_ECHO_REPLY || kind == ICMPV6_ECHO_REPLY;
    let is_unreachable = kind == ICMPV4_DEST_UNREACHABLE;
    if !is_echo_reply && !is_unreachable {
        return Err(CodecError::WrongType(kind));
    }

    let time_sent = if is_echo_reply {
        let time_bytes = data
            .get(offset + HEADER_LEN..offset + HEADER_LEN + TIME_LEN)
            .ok_or(CodecError::Truncated)?;
        let bytes: [u8; 8] = time_bytes.try_into().map_err(|_| CodecError::Truncated)?;
        Some(f64::from_le_bytes(bytes))
    } else {
        None
    };

    Ok(Reply {
        kind,
        code,
        id,
        sequence,
        time_sent,
        size: data.len() - offset,
    })
}

/// Convert a wall/monotonic `Duration` since some epoch into the `f64`
/// seconds representation the wire format stores.
pub fn duration_to_wire(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_reference_vector() {
        // type=8 code=0 checksum=0 id=1 seq=1 -> big-endian words 0x0800, 0x0000, 0x0001, 0x0001
        let data = [0x08, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01];
        // sum = 0x0800 + 0x0000 + 0x0001 + 0x0001 = 0x0802; ~0x0802 & 0xffff = 0xf7fd
        assert_eq!(checksum(&data), 0xf7fd);
    }

    #[test]
    fn checksum_odd_length_pads_with_zero() {
        let with_zero = checksum(&[0x08, 0x00, 0x00]);
        let padded = checksum(&[0x08, 0x00, 0x00, 0x00]);
        assert_eq!(with_zero, padded);
    }

    #[test]
    fn encode_request_produces_zero_checksum() {
        let packet = encode_request(Family::V4, 0x1234, 0x5678, 12.5);
        assert_eq!(packet.len(), REQUEST_LEN);
        assert_eq!(checksum(&packet), 0);
    }

    #[test]
    fn encode_request_layout() {
        let packet = encode_request(Family::V4, 0x1234, 0x5678, 0.0);
        assert_eq!(packet[0], ICMPV4_ECHO_REQUEST);
        assert_eq!(packet[1], 0);
        assert_eq!(u16::from_be_bytes([packet[4], packet[5]]), 0x1234);
        assert_eq!(u16::from_be_bytes([packet[6], packet[7]]), 0x5678);
        assert!(packet[HEADER_LEN + TIME_LEN..].iter().all(|&b| b == PADDING_BYTE));
    }

    #[test]
    fn encode_request_v6_uses_128() {
        let packet = encode_request(Family::V6, 1, 1, 0.0);
        assert_eq!(packet[0], ICMPV6_ECHO_REQUEST);
    }

    #[test]
    fn round_trip_without_outer_header() {
        let time_sent = 42.125;
        let packet = encode_request(Family::V4, 0xabcd, 7, time_sent);
        // An echo reply has the same layout but type 0 instead of 8.
        let mut reply = packet;
        reply[0] = ICMPV4_ECHO_REPLY;
        let csum = checksum(&{
            let mut zeroed = reply;
            zeroed[2] = 0;
            zeroed[3] = 0;
            zeroed
        });
        reply[2..4].copy_from_slice(&csum.to_be_bytes());

        let decoded = decode_reply(&reply, false).unwrap();
        assert_eq!(decoded.id, 0xabcd);
        assert_eq!(decoded.sequence, 7);
        assert_eq!(decoded.time_sent, Some(time_sent));
        assert_eq!(decoded.size, REQUEST_LEN);
    }

    #[test]
    fn round_trip_with_outer_ip_header() {
        let packet = encode_request(Family::V4, 1, 1, 1.0);
        let mut reply = packet;
        reply[0] = ICMPV4_ECHO_REPLY;
        let mut buffer = vec![0u8; IP_HEADER_LEN];
        buffer.extend_from_slice(&reply);
        let decoded = decode_reply(&buffer, true).unwrap();
        assert_eq!(decoded.sequence, 1);
        assert_eq!(decoded.time_sent, Some(1.0));
    }

    #[test]
    fn decode_reply_rejects_wrong_type() {
        let mut packet = encode_request(Family::V4, 1, 1, 0.0);
        packet[0] = ICMPV4_ECHO_REQUEST; // still a request, not a reply
        let err = decode_reply(&packet, false).unwrap_err();
        assert_eq!(err, CodecError::WrongType(ICMPV4_ECHO_REQUEST));
    }

    #[test]
    fn decode_reply_truncated() {
        let err = decode_reply(&[0, 0, 0], false).unwrap_err();
        assert_eq!(err, CodecError::Truncated);
    }

    #[test]
    fn decode_destination_unreachable_has_no_timestamp() {
        let mut packet = [0u8; HEADER_LEN];
        packet[0] = ICMPV4_DEST_UNREACHABLE;
        packet[1] = 1; // host unreachable
        let decoded = decode_reply(&packet, false).unwrap();
        assert!(decoded.is_destination_unreachable());
        assert_eq!(decoded.time_sent, None);
        assert_eq!(unreachable_reason(decoded.code), Some("Destination host unreachable"));
    }

    #[test]
    fn unreachable_reason_table_bounds() {
        assert!(unreachable_reason(0).is_some());
        assert!(unreachable_reason(15).is_some());
        assert!(unreachable_reason(16).is_none());
    }
}
