// TERN STACK — TRANSPORT: SEGMENT MODULE
// TCP wire format. A segment is checksummed together with a 12-byte pseudo
// header the same way an IP header is; the pseudo header never travels.
//
//  0                   1                   2                   3
//  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |          Source Port          |       Destination Port        |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                        Sequence Number                        |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                    Acknowledgment Number                      |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |  Data |           |U|A|P|R|S|F|                               |
// | Offset| Reserved  |R|C|S|S|Y|I|            Window             |
// |       |           |G|K|H|T|N|N|                               |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |           Checksum            |         Urgent Pointer        |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+

use std::mem;

use bytemuck::{Pod, Zeroable};

use crate::net::packet::{fold_checksum, PROTO_TCP};

pub const SIZE_TCP: usize = 20;
pub const SIZE_PSEUDO: usize = 12;

// Control bits
pub const CTL_URG: u8 = 0x20;
pub const CTL_ACK: u8 = 0x10;
pub const CTL_PSH: u8 = 0x08;
pub const CTL_RST: u8 = 0x04;
pub const CTL_SYN: u8 = 0x02;
pub const CTL_FIN: u8 = 0x01;

// Option kinds. Only maximum-segment-size is interpreted.
pub const OPT_END: u8 = 0;
pub const OPT_NOP: u8 = 1;
pub const OPT_MSS: u8 = 2;

/// Our advertised maximum segment size, carried on SYN and SYN|ACK.
pub const DEFAULT_MSS: u16 = 1460;

/// 20 bytes on wire, options after. Fields hold wire byte order.
#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub data_off: u8,
    pub ctl: u8,
    pub window: u16,
    pub checksum: u16,
    pub urgent: u16,
}
const _: () = assert!(mem::size_of::<TcpHeader>() == SIZE_TCP);

// ============================================================================
// BUILD
// ============================================================================

/// Serialize one segment: header, optional MSS option, payload, checksum
/// computed over the pseudo header plus the whole segment.
#[allow(clippy::too_many_arguments)]
pub fn build_segment(
    src: (u32, u16),
    dst: (u32, u16),
    seq: u32,
    ack: u32,
    ctl: u8,
    window: u16,
    mss: Option<u16>,
    payload: &[u8],
) -> Vec<u8> {
    let options_len = if mss.is_some() { 4 } else { 0 };
    let header_len = SIZE_TCP + options_len;
    let mut seg = vec![0u8; header_len + payload.len()];

    let hdr = TcpHeader {
        src_port: src.1.to_be(),
        dst_port: dst.1.to_be(),
        seq: seq.to_be(),
        ack: ack.to_be(),
        data_off: (((header_len / 4) as u8) << 4),
        ctl,
        window: window.to_be(),
        checksum: 0,
        urgent: 0,
    };
    seg[..SIZE_TCP].copy_from_slice(bytemuck::bytes_of(&hdr));
    if let Some(mss) = mss {
        seg[SIZE_TCP] = OPT_MSS;
        seg[SIZE_TCP + 1] = 4;
        seg[SIZE_TCP + 2..SIZE_TCP + 4].copy_from_slice(&mss.to_be_bytes());
    }
    seg[header_len..].copy_from_slice(payload);

    let sum = checksum_segment(src.0, dst.0, &seg);
    seg[16..18].copy_from_slice(&sum.to_be_bytes());
    seg
}

/// Pseudo header: src(4) dst(4) zero(1) protocol(1) tcp-length(2).
pub fn checksum_segment(src_addr: u32, dst_addr: u32, segment: &[u8]) -> u16 {
    let mut buf = Vec::with_capacity(SIZE_PSEUDO + segment.len());
    buf.extend_from_slice(&src_addr.to_be_bytes());
    buf.extend_from_slice(&dst_addr.to_be_bytes());
    buf.push(0);
    buf.push(PROTO_TCP);
    buf.extend_from_slice(&(segment.len() as u16).to_be_bytes());
    buf.extend_from_slice(segment);
    fold_checksum(&buf)
}

pub fn verify_segment(src_addr: u32, dst_addr: u32, segment: &[u8]) -> bool {
    checksum_segment(src_addr, dst_addr, segment) == 0
}

// ============================================================================
// PARSE
// ============================================================================

#[derive(Debug, Clone)]
pub struct SegmentView<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub ctl: u8,
    pub window: u16,
    /// From option kind 2, when present.
    pub mss: Option<u16>,
    pub payload: &'a [u8],
}

impl SegmentView<'_> {
    pub fn has(&self, bit: u8) -> bool {
        self.ctl & bit != 0
    }
}

pub fn parse_segment(buf: &[u8]) -> Option<SegmentView<'_>> {
    if buf.len() < SIZE_TCP {
        return None;
    }
    let hdr: TcpHeader = *bytemuck::from_bytes(&buf[..SIZE_TCP]);
    let header_len = ((hdr.data_off >> 4) as usize) * 4;
    if header_len < SIZE_TCP || header_len > buf.len() {
        return None;
    }

    // Walk the options area for kind 2; skip everything else.
    let mut mss = None;
    let mut off = SIZE_TCP;
    while off < header_len {
        match buf[off] {
            OPT_END => break,
            OPT_NOP => off += 1,
            kind => {
                if off + 1 >= header_len {
                    break;
                }
                let len = buf[off + 1] as usize;
                if len < 2 || off + len > header_len {
                    break;
                }
                if kind == OPT_MSS && len == 4 {
                    mss = Some(u16::from_be_bytes([buf[off + 2], buf[off + 3]]));
                }
                off += len;
            }
        }
    }

    Some(SegmentView {
        src_port: u16::from_be(hdr.src_port),
        dst_port: u16::from_be(hdr.dst_port),
        seq: u32::from_be(hdr.seq),
        ack: u32::from_be(hdr.ack),
        ctl: hdr.ctl,
        window: u16::from_be(hdr.window),
        mss,
        payload: &buf[header_len..],
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: (u32, u16) = (0x0a640101, 49152);
    const DST: (u32, u16) = (0x0a640203, 2345);

    #[test]
    fn segment_round_trip() {
        let seg = build_segment(SRC, DST, 1000, 2000, CTL_ACK | CTL_PSH, 512, None, b"payload");
        assert!(verify_segment(SRC.0, DST.0, &seg));
        let view = parse_segment(&seg).unwrap();
        assert_eq!(view.src_port, 49152);
        assert_eq!(view.dst_port, 2345);
        assert_eq!(view.seq, 1000);
        assert_eq!(view.ack, 2000);
        assert!(view.has(CTL_ACK));
        assert!(view.has(CTL_PSH));
        assert!(!view.has(CTL_SYN));
        assert_eq!(view.window, 512);
        assert_eq!(view.payload, b"payload");
        assert_eq!(view.mss, None);
    }

    #[test]
    fn syn_carries_mss_option() {
        let seg = build_segment(SRC, DST, 77, 0, CTL_SYN, 1024, Some(DEFAULT_MSS), &[]);
        assert!(verify_segment(SRC.0, DST.0, &seg));
        assert_eq!(seg.len(), SIZE_TCP + 4);
        let view = parse_segment(&seg).unwrap();
        assert_eq!(view.mss, Some(DEFAULT_MSS));
        assert!(view.payload.is_empty());
    }

    #[test]
    fn corruption_fails_verification() {
        let mut seg = build_segment(SRC, DST, 1, 2, CTL_ACK, 64, None, b"abcd");
        seg[21] ^= 0x01; // flip one payload bit
        assert!(!verify_segment(SRC.0, DST.0, &seg));
        // Checksumming binds the addresses too.
        let clean = build_segment(SRC, DST, 1, 2, CTL_ACK, 64, None, b"abcd");
        assert!(!verify_segment(SRC.0, 0x0a640204, &clean));
    }

    #[test]
    fn unknown_options_are_skipped() {
        let mut seg = build_segment(SRC, DST, 5, 6, CTL_SYN, 64, Some(1400), &[]);
        // Rewrite the option area: NOP, NOP, then the MSS option would not
        // fit, so the parser must stop cleanly.
        seg[SIZE_TCP] = OPT_NOP;
        seg[SIZE_TCP + 1] = OPT_NOP;
        seg[SIZE_TCP + 2] = 8; // unknown kind
        seg[SIZE_TCP + 3] = 2; // its length covers exactly itself
        let view = parse_segment(&seg).unwrap();
        assert_eq!(view.mss, None);
    }

    #[test]
    fn zero_payload_is_legal() {
        let seg = build_segment(SRC, DST, 9, 9, CTL_ACK, 128, None, &[]);
        assert_eq!(seg.len(), SIZE_TCP);
        assert!(verify_segment(SRC.0, DST.0, &seg));
        assert!(parse_segment(&seg).unwrap().payload.is_empty());
    }

    #[test]
    fn truncated_header_is_rejected() {
        let seg = build_segment(SRC, DST, 9, 9, CTL_ACK, 128, None, &[]);
        assert!(parse_segment(&seg[..SIZE_TCP - 1]).is_none());
    }
}
