//! IEEE 1722 AVTP frame codec
//!
//! Parsing works on borrowed Ethernet frames: [`AvtpPacket`] is a view that
//! records where the AVTP header starts (tagged or untagged frame), the
//! classified [`Subtype`] and the stream id. Payload placement is decided by
//! one dispatch table ([`layout_for`]) keyed on the subtype, so every caller
//! (listener, clock recovery, tests) shares the same bounds-checked rules.
//!
//! Construction lives in [`builder`], per-format parameter blocks in
//! [`params`].

pub mod builder;
pub mod params;

use crate::error::AvtpError;

pub use builder::{PacketTemplate, TalkerFormat};
pub use params::{AafFormat, AafParams, CipHeader, CrfParams, CrfPull, CrfType};

/// Ethernet header without 802.1Q tag
pub const ETH_HEADER_LEN: usize = 14;

/// 802.1Q tag length
pub const VLAN_TAG_LEN: usize = 4;

/// IEEE 1722 ethertype
pub const ETHERTYPE_AVTP: u16 = 0x22F0;

/// 802.1Q tag protocol identifier
pub const ETHERTYPE_VLAN: u16 = 0x8100;

/// Common header up to and including the stream id
pub const AVTP_COMMON_LEN: usize = 12;

/// Stream header for 61883, AAF and CVF
pub const STREAM_HEADER_LEN: usize = 24;

/// CRF header
pub const CRF_HEADER_LEN: usize = 20;

/// CIP header carried by IEC 61883 payloads
pub const CIP_HEADER_LEN: usize = 8;

/// CVF H.264 timestamp that precedes the NAL data
pub const H264_TIMESTAMP_LEN: usize = 4;

/// MPEG transport stream packet
pub const TS_PACKET_SIZE: usize = 188;

/// 61883-4 source packet (source packet header + TS packet)
pub const SOURCE_PACKET_SIZE: usize = 192;

/// Raw subtype codes on the wire
pub mod subtype_code {
    pub const IEC61883: u8 = 0x00;
    pub const AAF: u8 = 0x02;
    pub const CVF: u8 = 0x03;
    pub const CRF: u8 = 0x04;
}

/// CIP FMT values inside a 61883 subtype
pub mod cip_fmt {
    pub const AUDIO_61883_6: u8 = 0x10;
    pub const MPEGTS_61883_4: u8 = 0x20;
}

/// CVF format field values
pub mod cvf_format {
    pub const RFC: u8 = 0x02;
    pub const MJPEG: u8 = 0x00;
    pub const H264: u8 = 0x01;
    pub const JPEG2000: u8 = 0x02;
}

/// Classified AVTP payload kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subtype {
    /// IEC 61883-6 uncompressed audio (AM824)
    Audio61883_6,
    /// IEC 61883-4 MPEG2 transport stream
    Mpegts61883_4,
    /// 1722 AVTP Audio Format
    Aaf,
    /// 1722 Clock Reference Format
    Crf,
    /// 1722 Compressed Video Format
    Cvf,
    /// Anything else, carrying the raw subtype byte
    Unknown(u8),
}

impl Subtype {
    /// Raw subtype byte for this kind
    pub fn code(&self) -> u8 {
        match self {
            Subtype::Audio61883_6 | Subtype::Mpegts61883_4 => subtype_code::IEC61883,
            Subtype::Aaf => subtype_code::AAF,
            Subtype::Cvf => subtype_code::CVF,
            Subtype::Crf => subtype_code::CRF,
            Subtype::Unknown(code) => *code,
        }
    }

    /// Header length (relative to the AVTP start) needed before the payload
    /// layout can be read.
    pub fn header_len(&self) -> usize {
        match self {
            Subtype::Audio61883_6 | Subtype::Mpegts61883_4 => STREAM_HEADER_LEN + CIP_HEADER_LEN,
            Subtype::Aaf | Subtype::Cvf => STREAM_HEADER_LEN,
            Subtype::Crf => CRF_HEADER_LEN,
            Subtype::Unknown(_) => AVTP_COMMON_LEN,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Subtype::Unknown(_))
    }
}

impl std::fmt::Display for Subtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subtype::Audio61883_6 => write!(f, "IEC 61883-6 audio"),
            Subtype::Mpegts61883_4 => write!(f, "IEC 61883-4 MPEG-TS"),
            Subtype::Aaf => write!(f, "AAF"),
            Subtype::Crf => write!(f, "CRF"),
            Subtype::Cvf => write!(f, "CVF"),
            Subtype::Unknown(code) => write!(f, "unknown (0x{:02x})", code),
        }
    }
}

/// Payload position relative to the start of the AVTP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadSpan {
    pub offset: usize,
    pub len: usize,
}

type LayoutFn = fn(&[u8]) -> Option<PayloadSpan>;

/// Subtype → payload layout dispatch table
pub fn layout_for(subtype: Subtype) -> Option<LayoutFn> {
    match subtype {
        Subtype::Mpegts61883_4 => Some(mpegts_layout),
        Subtype::Audio61883_6 => Some(audio_layout),
        Subtype::Aaf => Some(aaf_layout),
        Subtype::Cvf => Some(cvf_layout),
        Subtype::Crf => Some(crf_layout),
        Subtype::Unknown(_) => None,
    }
}

pub(crate) fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

pub(crate) fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

pub(crate) fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(bytes)
}

fn stream_data_length(avtp: &[u8]) -> usize {
    read_u16(avtp, 20) as usize
}

fn mpegts_layout(avtp: &[u8]) -> Option<PayloadSpan> {
    if avtp.len() < STREAM_HEADER_LEN + CIP_HEADER_LEN {
        return None;
    }
    let len = stream_data_length(avtp).checked_sub(CIP_HEADER_LEN)?;
    Some(PayloadSpan { offset: STREAM_HEADER_LEN + CIP_HEADER_LEN, len })
}

fn audio_layout(avtp: &[u8]) -> Option<PayloadSpan> {
    if avtp.len() < STREAM_HEADER_LEN + CIP_HEADER_LEN {
        return None;
    }
    let block_bytes = avtp[STREAM_HEADER_LEN + 1] as usize * 4;
    if block_bytes == 0 {
        return None;
    }
    let data = stream_data_length(avtp).checked_sub(CIP_HEADER_LEN)?;
    // Whole data blocks only; a trailing partial block is not a sample
    let blocks = data / block_bytes;
    Some(PayloadSpan {
        offset: STREAM_HEADER_LEN + CIP_HEADER_LEN,
        len: blocks * block_bytes,
    })
}

fn aaf_layout(avtp: &[u8]) -> Option<PayloadSpan> {
    if avtp.len() < STREAM_HEADER_LEN {
        return None;
    }
    Some(PayloadSpan { offset: STREAM_HEADER_LEN, len: stream_data_length(avtp) })
}

fn cvf_layout(avtp: &[u8]) -> Option<PayloadSpan> {
    if avtp.len() < STREAM_HEADER_LEN {
        return None;
    }
    let length = stream_data_length(avtp);
    if avtp[16] == cvf_format::RFC && avtp[17] == cvf_format::H264 {
        let len = length.checked_sub(H264_TIMESTAMP_LEN)?;
        return Some(PayloadSpan { offset: STREAM_HEADER_LEN + H264_TIMESTAMP_LEN, len });
    }
    Some(PayloadSpan { offset: STREAM_HEADER_LEN, len: length })
}

fn crf_layout(avtp: &[u8]) -> Option<PayloadSpan> {
    if avtp.len() < CRF_HEADER_LEN {
        return None;
    }
    Some(PayloadSpan { offset: CRF_HEADER_LEN, len: read_u16(avtp, 16) as usize })
}

/// Offset of the AVTP header inside an Ethernet frame, if the frame is AVTP
fn avtp_offset(frame: &[u8]) -> Option<usize> {
    if frame.len() < ETH_HEADER_LEN {
        return None;
    }
    match read_u16(frame, 12) {
        ETHERTYPE_AVTP => Some(ETH_HEADER_LEN),
        ETHERTYPE_VLAN => {
            let tagged = ETH_HEADER_LEN + VLAN_TAG_LEN;
            if frame.len() >= tagged && read_u16(frame, 16) == ETHERTYPE_AVTP {
                Some(tagged)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Check the 1722 ethertype marker. Fails closed on short buffers.
pub fn is_avtp_packet(frame: &[u8]) -> bool {
    avtp_offset(frame).is_some()
}

/// Classify the AVTP header bytes
fn classify(avtp: &[u8]) -> Subtype {
    match avtp[0] {
        subtype_code::IEC61883 => {
            if avtp.len() < STREAM_HEADER_LEN + CIP_HEADER_LEN {
                return Subtype::Unknown(subtype_code::IEC61883);
            }
            // FMT is the low six bits of the fifth CIP byte
            match avtp[STREAM_HEADER_LEN + 4] & 0x3F {
                cip_fmt::MPEGTS_61883_4 => Subtype::Mpegts61883_4,
                cip_fmt::AUDIO_61883_6 => Subtype::Audio61883_6,
                _ => Subtype::Unknown(subtype_code::IEC61883),
            }
        }
        subtype_code::AAF => Subtype::Aaf,
        subtype_code::CVF => Subtype::Cvf,
        subtype_code::CRF => Subtype::Crf,
        other => Subtype::Unknown(other),
    }
}

/// Borrowed view over one received AVTP frame
#[derive(Debug, Clone, Copy)]
pub struct AvtpPacket<'a> {
    frame: &'a [u8],
    offset: usize,
    subtype: Subtype,
    stream_id: u64,
}

impl<'a> AvtpPacket<'a> {
    /// Parse the Ethernet + AVTP common header.
    ///
    /// Unknown subtypes parse successfully (the stream id is still readable);
    /// they simply have no payload.
    pub fn parse(frame: &'a [u8]) -> Result<Self, AvtpError> {
        let offset = avtp_offset(frame).ok_or(AvtpError::NotAvtp)?;
        let avtp = &frame[offset..];
        if avtp.len() < AVTP_COMMON_LEN {
            return Err(AvtpError::Truncated {
                needed: offset + AVTP_COMMON_LEN,
                have: frame.len(),
            });
        }

        let subtype = classify(avtp);
        let needed = subtype.header_len();
        if avtp.len() < needed {
            return Err(AvtpError::Truncated {
                needed: offset + needed,
                have: frame.len(),
            });
        }

        Ok(Self {
            frame,
            offset,
            subtype,
            stream_id: read_u64(avtp, 4),
        })
    }

    pub fn subtype(&self) -> Subtype {
        self.subtype
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    /// Whole captured frame
    pub fn frame(&self) -> &'a [u8] {
        self.frame
    }

    /// Bytes from the AVTP subtype field onwards
    pub fn avtp(&self) -> &'a [u8] {
        &self.frame[self.offset..]
    }

    pub fn is_vlan_tagged(&self) -> bool {
        self.offset != ETH_HEADER_LEN
    }

    pub fn stream_id_valid(&self) -> bool {
        self.avtp()[1] & 0x80 != 0
    }

    pub fn sequence_num(&self) -> u8 {
        self.avtp()[2]
    }

    /// AVTP presentation time, when the timestamp-valid bit is set
    pub fn avtp_timestamp(&self) -> Option<u32> {
        match self.subtype {
            Subtype::Crf | Subtype::Unknown(_) => None,
            _ if self.avtp()[1] & 0x01 != 0 => Some(read_u32(self.avtp(), 12)),
            _ => None,
        }
    }

    /// Payload span relative to the frame start, bounds-checked against the
    /// captured length.
    pub fn payload_span(&self) -> Option<PayloadSpan> {
        let layout = layout_for(self.subtype)?;
        let span = layout(self.avtp())?;
        let offset = self.offset + span.offset;
        if offset.checked_add(span.len)? > self.frame.len() {
            return None;
        }
        Some(PayloadSpan { offset, len: span.len })
    }

    /// Payload size in bytes; 0 when the packet is unconsumable
    pub fn payload_size(&self) -> u32 {
        self.payload_span().map(|span| span.len as u32).unwrap_or(0)
    }

    pub fn payload(&self) -> Option<&'a [u8]> {
        self.payload_span()
            .map(|span| &self.frame[span.offset..span.offset + span.len])
    }

    /// Copy exactly `payload_size()` bytes into `out`
    pub fn extract_payload(&self, out: &mut [u8]) -> Result<usize, AvtpError> {
        let payload = self
            .payload()
            .ok_or(AvtpError::UnsupportedSubtype(self.subtype.code()))?;
        if out.len() < payload.len() {
            return Err(AvtpError::Truncated { needed: payload.len(), have: out.len() });
        }
        out[..payload.len()].copy_from_slice(payload);
        Ok(payload.len())
    }

    /// CIP header of a 61883 packet
    pub fn cip_header(&self) -> Option<CipHeader> {
        match self.subtype {
            Subtype::Audio61883_6 | Subtype::Mpegts61883_4 => {
                CipHeader::parse(&self.avtp()[STREAM_HEADER_LEN..])
            }
            _ => None,
        }
    }

    pub fn aaf_params(&self) -> Option<AafParams> {
        match self.subtype {
            Subtype::Aaf => Some(AafParams::parse(self.avtp())),
            _ => None,
        }
    }

    pub fn crf_params(&self) -> Option<CrfParams> {
        match self.subtype {
            Subtype::Crf => Some(CrfParams::parse(self.avtp())),
            _ => None,
        }
    }

    /// CRF timestamps carried in the payload (big-endian u64 each)
    pub fn crf_timestamps(&self) -> impl Iterator<Item = u64> + 'a {
        let payload = match self.subtype {
            Subtype::Crf => self.payload().unwrap_or(&[]),
            _ => &[],
        };
        payload.chunks_exact(8).map(|chunk| read_u64(chunk, 0))
    }
}

/// Parse subtype and stream id in one call
pub fn parse_header(frame: &[u8]) -> Result<(Subtype, u64), AvtpError> {
    let packet = AvtpPacket::parse(frame)?;
    Ok((packet.subtype(), packet.stream_id()))
}

/// Payload size for a frame whose subtype the caller already classified.
/// Returns 0 for anything unconsumable.
pub fn payload_size(frame: &[u8], subtype: Subtype) -> u32 {
    match AvtpPacket::parse(frame) {
        Ok(packet) if packet.subtype() == subtype => packet.payload_size(),
        _ => 0,
    }
}

/// Copy the payload of `frame` into `out`
pub fn extract_payload(frame: &[u8], out: &mut [u8]) -> Result<usize, AvtpError> {
    AvtpPacket::parse(frame)?.extract_payload(out)
}
