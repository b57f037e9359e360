//! Talker-side AVTP frame construction
//!
//! A [`PacketTemplate`] is configured once per talker session (static header,
//! addresses, VLAN tag, stream id, packet size) and then reused for every
//! outgoing frame: [`PacketTemplate::set_dynamic_header`] and
//! [`PacketTemplate::fill_payload`] only touch the per-packet fields.

use super::params::{rate_to_nsr, AafFormat, CipHeader, CrfPull, CrfType, CIP_OFFSET};
use super::{
    cip_fmt, cvf_format, Subtype, CIP_HEADER_LEN, CRF_HEADER_LEN, ETHERTYPE_AVTP, ETHERTYPE_VLAN,
    ETH_HEADER_LEN, H264_TIMESTAMP_LEN, SOURCE_PACKET_SIZE, STREAM_HEADER_LEN, TS_PACKET_SIZE,
    VLAN_TAG_LEN,
};
use crate::error::AvtpError;

/// Frames are always 802.1Q tagged on the talker side
const AVTP_START: usize = ETH_HEADER_LEN + VLAN_TAG_LEN;

/// SR class A priority
pub const DEFAULT_VLAN_PRIORITY: u8 = 3;

/// Default SR class VLAN
pub const DEFAULT_VLAN_ID: u16 = 2;

/// Smallest Ethernet frame without FCS
pub const MIN_FRAME_LEN: usize = 60;

/// Largest AVTPDU a standard Ethernet MTU carries
pub const MAX_AVTPDU_LEN: usize = 1500;

/// 1722 MAAP-range multicast destination used by default
pub const DEFAULT_DEST_ADDR: [u8; 6] = [0x91, 0xE0, 0xF0, 0x00, 0x0E, 0x80];

/// Data blocks in one 61883-4 source packet (FN = 3)
const MPEGTS_BLOCKS_PER_SOURCE_PACKET: u8 = 8;

/// What the talker sends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TalkerFormat {
    /// 61883-4 transport stream; units are 188-byte TS packets
    Mpegts,
    /// 61883-6 AM824 audio; units are data blocks of `channels` quadlets
    Audio { channels: u8 },
    /// AAF PCM; units are interleaved sample frames
    Aaf {
        format: AafFormat,
        sample_rate: u32,
        channels: u16,
        bit_depth: u8,
    },
    /// CVF; units are bytes of compressed video
    Cvf { format_subtype: u8 },
    /// CRF; units are 64-bit timestamps
    Crf {
        crf_type: CrfType,
        pull: CrfPull,
        base_frequency: u32,
        timestamp_interval: u16,
    },
}

impl TalkerFormat {
    pub fn subtype(&self) -> Subtype {
        match self {
            TalkerFormat::Mpegts => Subtype::Mpegts61883_4,
            TalkerFormat::Audio { .. } => Subtype::Audio61883_6,
            TalkerFormat::Aaf { .. } => Subtype::Aaf,
            TalkerFormat::Cvf { .. } => Subtype::Cvf,
            TalkerFormat::Crf { .. } => Subtype::Crf,
        }
    }

    fn is_h264(&self) -> bool {
        matches!(self, TalkerFormat::Cvf { format_subtype } if *format_subtype == cvf_format::H264)
    }

    /// Header bytes counted in `stream_data_length` ahead of the payload
    fn data_length_header(&self) -> usize {
        match self {
            TalkerFormat::Mpegts | TalkerFormat::Audio { .. } => CIP_HEADER_LEN,
            TalkerFormat::Cvf { .. } if self.is_h264() => H264_TIMESTAMP_LEN,
            _ => 0,
        }
    }

    /// `stream_data_length` for `wire_len` payload bytes
    fn stream_data_length(&self, wire_len: usize) -> Result<u16, AvtpError> {
        let len = self.data_length_header().saturating_add(wire_len);
        u16::try_from(len).map_err(|_| AvtpError::FrameTooLarge {
            len,
            max: u16::MAX as usize,
        })
    }

    /// AVTP header length including CIP header / H.264 timestamp
    pub fn header_len(&self) -> usize {
        match self {
            TalkerFormat::Mpegts | TalkerFormat::Audio { .. } => STREAM_HEADER_LEN + CIP_HEADER_LEN,
            TalkerFormat::Aaf { .. } => STREAM_HEADER_LEN,
            TalkerFormat::Cvf { .. } if self.is_h264() => STREAM_HEADER_LEN + H264_TIMESTAMP_LEN,
            TalkerFormat::Cvf { .. } => STREAM_HEADER_LEN,
            TalkerFormat::Crf { .. } => CRF_HEADER_LEN,
        }
    }

    /// Bytes one unit occupies on the wire
    pub fn wire_unit_size(&self) -> usize {
        match self {
            TalkerFormat::Mpegts => SOURCE_PACKET_SIZE,
            TalkerFormat::Audio { channels } => *channels as usize * 4,
            TalkerFormat::Aaf { format, channels, .. } => *channels as usize * format.container_bytes(),
            TalkerFormat::Cvf { .. } => 1,
            TalkerFormat::Crf { .. } => 8,
        }
    }

    /// Bytes one unit occupies in the caller's source buffer
    pub fn source_unit_size(&self) -> usize {
        match self {
            TalkerFormat::Mpegts => TS_PACKET_SIZE,
            _ => self.wire_unit_size(),
        }
    }
}

/// Reusable outgoing frame
#[derive(Debug, Clone)]
pub struct PacketTemplate {
    format: TalkerFormat,
    buf: Vec<u8>,
    /// Bytes of `buf` that make up the current frame
    len: usize,
    units_per_packet: usize,
    sequence: u8,
    dbc: u8,
    presentation_time: u32,
}

impl PacketTemplate {
    pub fn new(format: TalkerFormat) -> Self {
        let header = AVTP_START + format.header_len();
        Self {
            format,
            buf: vec![0u8; header],
            len: header,
            units_per_packet: 0,
            sequence: 0,
            dbc: 0,
            presentation_time: 0,
        }
    }

    pub fn format(&self) -> TalkerFormat {
        self.format
    }

    fn avtp_mut(&mut self) -> &mut [u8] {
        &mut self.buf[AVTP_START..]
    }

    fn payload_start(&self) -> usize {
        AVTP_START + self.format.header_len()
    }

    /// Write the fields that never change during a session
    pub fn write_static_header(&mut self) {
        self.buf[12..14].copy_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
        self.buf[16..18].copy_from_slice(&ETHERTYPE_AVTP.to_be_bytes());
        self.set_vlan_tag(DEFAULT_VLAN_PRIORITY, DEFAULT_VLAN_ID);

        let format = self.format;
        let avtp = self.avtp_mut();
        avtp[0] = format.subtype().code();
        avtp[1] = 0; // sv = 0, version 0, tv = 0

        match format {
            TalkerFormat::Mpegts | TalkerFormat::Audio { .. } => {
                // tag = 1 (CIP present), channel 31, tcode 0xA
                avtp[22] = 0x40 | 31;
                avtp[23] = 0xA0;
                let cip = match format {
                    TalkerFormat::Audio { channels } => CipHeader {
                        sid: 63,
                        dbs: channels,
                        fraction_number: 0,
                        quadlet_padding: 0,
                        source_packet_header: false,
                        dbc: 0,
                        fmt: cip_fmt::AUDIO_61883_6,
                        fdf: 0x02,
                        syt: 0xFFFF,
                    },
                    _ => CipHeader {
                        sid: 63,
                        dbs: 6,
                        fraction_number: 3,
                        quadlet_padding: 0,
                        source_packet_header: true,
                        dbc: 0,
                        fmt: cip_fmt::MPEGTS_61883_4,
                        fdf: 0,
                        syt: 0,
                    },
                };
                avtp[CIP_OFFSET..CIP_OFFSET + CipHeader::LEN].copy_from_slice(&cip.encode());
            }
            TalkerFormat::Aaf {
                format,
                sample_rate,
                channels,
                bit_depth,
            } => {
                avtp[16] = format.code();
                avtp[17] = (rate_to_nsr(sample_rate) << 4) | ((channels >> 8) as u8 & 0x03);
                avtp[18] = (channels & 0xFF) as u8;
                avtp[19] = bit_depth;
                avtp[22] = 0;
            }
            TalkerFormat::Cvf { format_subtype } => {
                avtp[16] = cvf_format::RFC;
                avtp[17] = format_subtype;
            }
            TalkerFormat::Crf {
                crf_type,
                pull,
                base_frequency,
                timestamp_interval,
            } => {
                avtp[3] = crf_type.code();
                let word = ((pull.code() as u32 & 0x07) << 29) | (base_frequency & 0x1FFF_FFFF);
                avtp[12..16].copy_from_slice(&word.to_be_bytes());
                avtp[18..20].copy_from_slice(&timestamp_interval.to_be_bytes());
            }
        }
    }

    pub fn set_dest_addr(&mut self, mac: [u8; 6]) {
        self.buf[0..6].copy_from_slice(&mac);
    }

    pub fn set_src_addr(&mut self, mac: [u8; 6]) {
        self.buf[6..12].copy_from_slice(&mac);
    }

    /// 802.1Q priority code point and VLAN id
    pub fn set_vlan_tag(&mut self, priority: u8, vid: u16) {
        let tci = ((priority as u16 & 0x07) << 13) | (vid & 0x0FFF);
        self.buf[14..16].copy_from_slice(&tci.to_be_bytes());
    }

    pub fn set_stream_id_valid(&mut self, valid: bool) {
        let avtp = self.avtp_mut();
        if valid {
            avtp[1] |= 0x80;
        } else {
            avtp[1] &= !0x80;
        }
    }

    pub fn set_stream_id(&mut self, stream_id: u64) {
        self.avtp_mut()[4..12].copy_from_slice(&stream_id.to_be_bytes());
    }

    /// Maximum units carried by one frame; sizes the template buffer.
    /// Returns the full frame length.
    pub fn set_packet_size(&mut self, units: usize) -> Result<usize, AvtpError> {
        let wire_len = units.saturating_mul(self.format.wire_unit_size());
        self.format.stream_data_length(wire_len)?;
        let avtpdu = self.format.header_len().saturating_add(wire_len);
        if avtpdu > MAX_AVTPDU_LEN {
            return Err(AvtpError::FrameTooLarge {
                len: avtpdu,
                max: MAX_AVTPDU_LEN,
            });
        }

        self.units_per_packet = units;
        let full = self.payload_start() + wire_len;
        self.buf.resize(full, 0);
        self.len = full;
        Ok(full)
    }

    /// Frame length with a full payload
    pub fn packet_size(&self) -> usize {
        self.buf.len()
    }

    pub fn units_per_packet(&self) -> usize {
        self.units_per_packet
    }

    /// Per-packet header fields: sequence number and presentation time
    pub fn set_dynamic_header(&mut self, presentation_time: u32) {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        self.presentation_time = presentation_time;

        let format = self.format;
        let avtp = self.avtp_mut();
        avtp[2] = sequence;
        if !matches!(format, TalkerFormat::Crf { .. }) {
            avtp[1] |= 0x01;
            avtp[12..16].copy_from_slice(&presentation_time.to_be_bytes());
        }
    }

    /// Copy `units` units from `source` into the payload and update the
    /// length fields. Returns the frame length.
    pub fn fill_payload(&mut self, source: &[u8], units: usize) -> Result<usize, AvtpError> {
        if units > self.units_per_packet {
            return Err(AvtpError::PayloadTooLarge {
                units,
                max: self.units_per_packet,
            });
        }
        let needed = units * self.format.source_unit_size();
        if source.len() < needed {
            return Err(AvtpError::Truncated {
                needed,
                have: source.len(),
            });
        }

        let start = self.payload_start();
        let wire_len = units * self.format.wire_unit_size();
        match self.format {
            TalkerFormat::Mpegts => {
                let header = self.presentation_time.to_be_bytes();
                let packets = source[..needed].chunks_exact(TS_PACKET_SIZE);
                for (slot, ts) in self.buf[start..start + wire_len]
                    .chunks_exact_mut(SOURCE_PACKET_SIZE)
                    .zip(packets)
                {
                    slot[..4].copy_from_slice(&header);
                    slot[4..].copy_from_slice(ts);
                }
            }
            _ => self.buf[start..start + wire_len].copy_from_slice(&source[..needed]),
        }

        let format = self.format;
        let length = format.stream_data_length(wire_len)?.to_be_bytes();
        let dbc = self.dbc;
        let presentation_time = self.presentation_time;
        let avtp = self.avtp_mut();
        match format {
            TalkerFormat::Mpegts | TalkerFormat::Audio { .. } => {
                avtp[20..22].copy_from_slice(&length);
                avtp[CIP_OFFSET + 3] = dbc;
                let blocks = match format {
                    TalkerFormat::Mpegts => (units as u8).wrapping_mul(MPEGTS_BLOCKS_PER_SOURCE_PACKET),
                    _ => units as u8,
                };
                self.dbc = dbc.wrapping_add(blocks);
            }
            TalkerFormat::Cvf { .. } if format.is_h264() => {
                avtp[20..22].copy_from_slice(&length);
                avtp[24..28].copy_from_slice(&presentation_time.to_be_bytes());
            }
            TalkerFormat::Aaf { .. } | TalkerFormat::Cvf { .. } => {
                avtp[20..22].copy_from_slice(&length);
            }
            TalkerFormat::Crf { .. } => {
                avtp[16..18].copy_from_slice(&length);
            }
        }

        self.len = start + wire_len;
        Ok(self.len)
    }

    /// Current frame bytes
    pub fn as_frame(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Sequence number the next dynamic header will carry
    pub fn next_sequence(&self) -> u8 {
        self.sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avtp::{AvtpPacket, CRF_HEADER_LEN};
    use proptest::prelude::*;

    fn all_formats() -> Vec<TalkerFormat> {
        vec![
            TalkerFormat::Mpegts,
            TalkerFormat::Audio { channels: 8 },
            TalkerFormat::Aaf {
                format: AafFormat::Int16,
                sample_rate: 48_000,
                channels: 2,
                bit_depth: 16,
            },
            TalkerFormat::Cvf { format_subtype: cvf_format::H264 },
            TalkerFormat::Crf {
                crf_type: CrfType::AudioSample,
                pull: CrfPull::One,
                base_frequency: 48_000,
                timestamp_interval: 160,
            },
        ]
    }

    fn template(format: TalkerFormat, stream_id: u64, units: usize) -> PacketTemplate {
        let mut template = PacketTemplate::new(format);
        template.write_static_header();
        template.set_dest_addr(DEFAULT_DEST_ADDR);
        template.set_src_addr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
        template.set_vlan_tag(3, 200);
        template.set_stream_id_valid(true);
        template.set_stream_id(stream_id);
        template.set_packet_size(units).unwrap();
        template
    }

    #[test]
    fn test_vlan_tag_encoding() {
        let template = template(TalkerFormat::Mpegts, 1, 7);
        let frame = template.as_frame();
        assert_eq!(&frame[12..14], &[0x81, 0x00]);
        assert_eq!(u16::from_be_bytes([frame[14], frame[15]]), (3 << 13) | 200);
        assert_eq!(&frame[16..18], &[0x22, 0xF0]);
    }

    #[test]
    fn test_mpegts_source_packets() {
        let mut template = template(TalkerFormat::Mpegts, 0xAB, 7);
        let source: Vec<u8> = (0..TS_PACKET_SIZE * 2).map(|i| (i % 251) as u8).collect();

        template.set_dynamic_header(0x0102_0304);
        let len = template.fill_payload(&source, 2).unwrap();
        assert_eq!(len, AVTP_START + 32 + 2 * SOURCE_PACKET_SIZE);

        let packet = AvtpPacket::parse(template.as_frame()).unwrap();
        assert_eq!(packet.subtype(), Subtype::Mpegts61883_4);
        assert_eq!(packet.avtp_timestamp(), Some(0x0102_0304));
        let payload = packet.payload().unwrap();
        assert_eq!(payload.len(), 2 * SOURCE_PACKET_SIZE);
        assert_eq!(&payload[..4], &[1, 2, 3, 4]);
        assert_eq!(&payload[4..192], &source[..188]);
        assert_eq!(&payload[196..], &source[188..]);
    }

    #[test]
    fn test_dbc_and_sequence_advance() {
        let mut template = template(TalkerFormat::Audio { channels: 2 }, 5, 6);
        let source = vec![0u8; 6 * 8];
        for expected in 0..3u8 {
            template.set_dynamic_header(0);
            template.fill_payload(&source, 6).unwrap();
            let packet = AvtpPacket::parse(template.as_frame()).unwrap();
            assert_eq!(packet.sequence_num(), expected);
            assert_eq!(packet.cip_header().unwrap().dbc, expected * 6);
        }
    }

    #[test]
    fn test_sequence_wraps() {
        let mut template = template(TalkerFormat::Cvf { format_subtype: cvf_format::MJPEG }, 1, 64);
        for _ in 0..256 {
            template.set_dynamic_header(0);
        }
        assert_eq!(template.next_sequence(), 0);
    }

    #[test]
    fn test_payload_too_large() {
        let mut template = template(TalkerFormat::Mpegts, 1, 7);
        let source = vec![0u8; TS_PACKET_SIZE * 8];
        assert_eq!(
            template.fill_payload(&source, 8),
            Err(AvtpError::PayloadTooLarge { units: 8, max: 7 })
        );
    }

    #[test]
    fn test_short_source() {
        let mut template = template(TalkerFormat::Mpegts, 1, 7);
        assert_eq!(
            template.fill_payload(&[0u8; 100], 1),
            Err(AvtpError::Truncated { needed: 188, have: 100 })
        );
    }

    #[test]
    fn test_crf_frame_layout() {
        let mut template = template(all_formats()[4], 9, 6);
        let timestamps: Vec<u8> = (0..6u64).flat_map(|t| (t * 1_000).to_be_bytes()).collect();
        template.set_dynamic_header(0);
        let len = template.fill_payload(&timestamps, 6).unwrap();
        assert_eq!(len, AVTP_START + CRF_HEADER_LEN + 48);

        let packet = AvtpPacket::parse(template.as_frame()).unwrap();
        let params = packet.crf_params().unwrap();
        assert_eq!(params.timestamp_interval, 160);
        assert_eq!(params.base_frequency, 48_000);
        assert_eq!(
            packet.crf_timestamps().collect::<Vec<_>>(),
            vec![0, 1_000, 2_000, 3_000, 4_000, 5_000]
        );
    }

    #[test]
    fn test_aaf_params_survive_build() {
        let mut template = template(all_formats()[2], 3, 6);
        template.set_dynamic_header(0);
        template.fill_payload(&[0u8; 24], 6).unwrap();
        let params = AvtpPacket::parse(template.as_frame()).unwrap().aaf_params().unwrap();
        assert_eq!(params.format, AafFormat::Int16);
        assert_eq!(params.sampling_rate, 48_000);
        assert_eq!(params.channels_per_frame, 2);
        assert_eq!(params.data_length, 24);
    }

    #[test]
    fn test_packet_size_limited_to_mtu() {
        let mut template = PacketTemplate::new(TalkerFormat::Cvf { format_subtype: cvf_format::MJPEG });
        template.write_static_header();
        let full = template.set_packet_size(MAX_AVTPDU_LEN - STREAM_HEADER_LEN).unwrap();
        assert_eq!(full, AVTP_START + MAX_AVTPDU_LEN);

        assert!(matches!(
            template.set_packet_size(MAX_AVTPDU_LEN - STREAM_HEADER_LEN + 1),
            Err(AvtpError::FrameTooLarge { len: 1501, max: MAX_AVTPDU_LEN })
        ));
        // a rejected size leaves the template as it was
        assert_eq!(template.units_per_packet(), MAX_AVTPDU_LEN - STREAM_HEADER_LEN);
        assert_eq!(template.packet_size(), full);

        let mut mpegts = PacketTemplate::new(TalkerFormat::Mpegts);
        assert!(mpegts.set_packet_size(7).is_ok());
        assert!(mpegts.set_packet_size(8).is_err());
    }

    #[test]
    fn test_packet_size_beyond_length_field() {
        let mut template = PacketTemplate::new(TalkerFormat::Audio { channels: 8 });
        assert!(matches!(
            template.set_packet_size(usize::MAX),
            Err(AvtpError::FrameTooLarge { max, .. }) if max == u16::MAX as usize
        ));
        assert!(matches!(
            template.set_packet_size(70_000 / 32),
            Err(AvtpError::FrameTooLarge { max, .. }) if max == u16::MAX as usize
        ));
    }

    proptest! {
        #[test]
        fn test_build_parse_roundtrip(stream_id in any::<u64>(), index in 0usize..5, units in 1usize..6) {
            let format = all_formats()[index];
            let mut template = template(format, stream_id, units);
            let source = vec![0x5Au8; units * format.source_unit_size()];
            template.set_dynamic_header(42);
            template.fill_payload(&source, units).unwrap();

            let packet = AvtpPacket::parse(template.as_frame()).unwrap();
            prop_assert_eq!(packet.subtype(), format.subtype());
            prop_assert_eq!(packet.stream_id(), stream_id);
            prop_assert!(packet.stream_id_valid());
            prop_assert_eq!(packet.payload_size() as usize, units * format.wire_unit_size());
        }
    }
}
