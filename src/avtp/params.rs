//! Format parameter blocks decoded from AAF, CRF and 61883 headers
//!
//! These are captured once, on the first accepted packet of a stream, and
//! cached by the listener until the stream resets.

use serde::Serialize;

use super::{read_u16, read_u32, STREAM_HEADER_LEN};

/// AAF sample format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AafFormat {
    User,
    Float32,
    Int32,
    Int24,
    Int16,
    Aes3_32,
    Reserved(u8),
}

impl AafFormat {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => AafFormat::User,
            0x01 => AafFormat::Float32,
            0x02 => AafFormat::Int32,
            0x03 => AafFormat::Int24,
            0x04 => AafFormat::Int16,
            0x05 => AafFormat::Aes3_32,
            other => AafFormat::Reserved(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            AafFormat::User => 0x00,
            AafFormat::Float32 => 0x01,
            AafFormat::Int32 => 0x02,
            AafFormat::Int24 => 0x03,
            AafFormat::Int16 => 0x04,
            AafFormat::Aes3_32 => 0x05,
            AafFormat::Reserved(code) => *code,
        }
    }

    /// Bytes one sample occupies on the wire
    pub fn container_bytes(&self) -> usize {
        match self {
            AafFormat::Int16 => 2,
            AafFormat::Int24 => 3,
            AafFormat::Float32 | AafFormat::Int32 | AafFormat::Aes3_32 => 4,
            AafFormat::User | AafFormat::Reserved(_) => 1,
        }
    }
}

/// AAF nominal sample rate codes
const NSR_TABLE: [(u8, u32); 10] = [
    (0x1, 8_000),
    (0x2, 16_000),
    (0x3, 32_000),
    (0x4, 44_100),
    (0x5, 48_000),
    (0x6, 88_200),
    (0x7, 96_000),
    (0x8, 176_400),
    (0x9, 192_000),
    (0xA, 24_000),
];

/// Sample rate for an AAF nsr code; 0 for user-specified or reserved
pub fn nsr_to_rate(nsr: u8) -> u32 {
    NSR_TABLE
        .iter()
        .find(|(code, _)| *code == nsr)
        .map(|(_, rate)| *rate)
        .unwrap_or(0)
}

/// nsr code for a sample rate; 0 (user) when the rate has no code
pub fn rate_to_nsr(rate: u32) -> u8 {
    NSR_TABLE
        .iter()
        .find(|(_, r)| *r == rate)
        .map(|(code, _)| *code)
        .unwrap_or(0)
}

/// Parameters of an AAF stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AafParams {
    pub format: AafFormat,
    pub channels_per_frame: u16,
    /// Decoded nominal sample rate in Hz (0 = user specified)
    pub sampling_rate: u32,
    pub bit_depth: u8,
    pub sparse_timestamp: bool,
    /// stream_data_length of the packet the parameters came from
    pub data_length: u16,
}

impl AafParams {
    /// Decode from AVTP header bytes (at least `STREAM_HEADER_LEN` long)
    pub(crate) fn parse(avtp: &[u8]) -> Self {
        Self {
            format: AafFormat::from_code(avtp[16]),
            channels_per_frame: (((avtp[17] & 0x03) as u16) << 8) | avtp[18] as u16,
            sampling_rate: nsr_to_rate(avtp[17] >> 4),
            bit_depth: avtp[19],
            sparse_timestamp: avtp[22] & 0x10 != 0,
            data_length: read_u16(avtp, 20),
        }
    }

    /// Bytes per interleaved sample frame
    pub fn frame_bytes(&self) -> usize {
        self.channels_per_frame as usize * self.format.container_bytes()
    }
}

/// CRF timestamp kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CrfType {
    User,
    AudioSample,
    VideoFrame,
    VideoLine,
    MachineCycle,
    Reserved(u8),
}

impl CrfType {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => CrfType::User,
            1 => CrfType::AudioSample,
            2 => CrfType::VideoFrame,
            3 => CrfType::VideoLine,
            4 => CrfType::MachineCycle,
            other => CrfType::Reserved(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            CrfType::User => 0,
            CrfType::AudioSample => 1,
            CrfType::VideoFrame => 2,
            CrfType::VideoLine => 3,
            CrfType::MachineCycle => 4,
            CrfType::Reserved(code) => *code,
        }
    }
}

/// Pull-up/down multiplier applied to the CRF base frequency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CrfPull {
    One,
    /// 1/1.001
    DownNtsc,
    /// 1.001
    UpNtsc,
    /// 24/25
    Down24_25,
    /// 25/24
    Up25_24,
    /// 1/8
    Eighth,
    Reserved(u8),
}

impl CrfPull {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => CrfPull::One,
            1 => CrfPull::DownNtsc,
            2 => CrfPull::UpNtsc,
            3 => CrfPull::Down24_25,
            4 => CrfPull::Up25_24,
            5 => CrfPull::Eighth,
            other => CrfPull::Reserved(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            CrfPull::One => 0,
            CrfPull::DownNtsc => 1,
            CrfPull::UpNtsc => 2,
            CrfPull::Down24_25 => 3,
            CrfPull::Up25_24 => 4,
            CrfPull::Eighth => 5,
            CrfPull::Reserved(code) => *code,
        }
    }

    pub fn multiplier(&self) -> f64 {
        match self {
            CrfPull::One | CrfPull::Reserved(_) => 1.0,
            CrfPull::DownNtsc => 1.0 / 1.001,
            CrfPull::UpNtsc => 1.001,
            CrfPull::Down24_25 => 24.0 / 25.0,
            CrfPull::Up25_24 => 25.0 / 24.0,
            CrfPull::Eighth => 1.0 / 8.0,
        }
    }
}

/// Parameters of a CRF stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CrfParams {
    pub crf_type: CrfType,
    pub pull: CrfPull,
    /// 29-bit base frequency in Hz
    pub base_frequency: u32,
    /// Samples between two consecutive timestamps
    pub timestamp_interval: u16,
    /// crf_data_length in bytes
    pub data_length: u16,
    pub media_clock_restart: bool,
}

impl CrfParams {
    /// Decode from AVTP header bytes (at least `CRF_HEADER_LEN` long)
    pub(crate) fn parse(avtp: &[u8]) -> Self {
        let word = read_u32(avtp, 12);
        Self {
            crf_type: CrfType::from_code(avtp[3]),
            pull: CrfPull::from_code((word >> 29) as u8),
            base_frequency: word & 0x1FFF_FFFF,
            timestamp_interval: read_u16(avtp, 18),
            data_length: read_u16(avtp, 16),
            media_clock_restart: avtp[1] & 0x08 != 0,
        }
    }

    /// Nominal media clock frequency advertised by the talker
    pub fn nominal_frequency(&self) -> f64 {
        self.base_frequency as f64 * self.pull.multiplier()
    }

    pub fn timestamps_per_packet(&self) -> usize {
        self.data_length as usize / 8
    }
}

/// Common Isochronous Packet header of a 61883 payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CipHeader {
    pub sid: u8,
    /// Data block size in quadlets
    pub dbs: u8,
    pub fraction_number: u8,
    pub quadlet_padding: u8,
    pub source_packet_header: bool,
    pub dbc: u8,
    pub fmt: u8,
    pub fdf: u8,
    pub syt: u16,
}

impl CipHeader {
    pub const LEN: usize = 8;

    /// Decode from the eight bytes that follow the stream header
    pub fn parse(cip: &[u8]) -> Option<Self> {
        if cip.len() < Self::LEN {
            return None;
        }
        Some(Self {
            sid: cip[0] & 0x3F,
            dbs: cip[1],
            fraction_number: cip[2] >> 6,
            quadlet_padding: (cip[2] >> 3) & 0x07,
            source_packet_header: cip[2] & 0x04 != 0,
            dbc: cip[3],
            fmt: cip[4] & 0x3F,
            fdf: cip[5],
            syt: read_u16(cip, 6),
        })
    }

    pub fn encode(&self) -> [u8; 8] {
        let syt = self.syt.to_be_bytes();
        [
            self.sid & 0x3F,
            self.dbs,
            (self.fraction_number << 6)
                | ((self.quadlet_padding & 0x07) << 3)
                | (u8::from(self.source_packet_header) << 2),
            self.dbc,
            0x80 | (self.fmt & 0x3F),
            self.fdf,
            syt[0],
            syt[1],
        ]
    }
}

/// Byte offset of the CIP header inside the AVTP header
pub const CIP_OFFSET: usize = STREAM_HEADER_LEN;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nsr_table() {
        assert_eq!(nsr_to_rate(0x5), 48_000);
        assert_eq!(rate_to_nsr(48_000), 0x5);
        assert_eq!(nsr_to_rate(0xF), 0);
        assert_eq!(rate_to_nsr(12_345), 0);
    }

    #[test]
    fn test_aaf_params() {
        let mut avtp = [0u8; 24];
        avtp[16] = AafFormat::Int16.code();
        avtp[17] = (0x5 << 4) | 0x01; // 48 kHz, channel count high bits = 1
        avtp[18] = 0x02;
        avtp[19] = 16;
        avtp[20..22].copy_from_slice(&192u16.to_be_bytes());
        avtp[22] = 0x10;

        let params = AafParams::parse(&avtp);
        assert_eq!(params.format, AafFormat::Int16);
        assert_eq!(params.channels_per_frame, 258);
        assert_eq!(params.sampling_rate, 48_000);
        assert_eq!(params.bit_depth, 16);
        assert!(params.sparse_timestamp);
        assert_eq!(params.data_length, 192);
        assert_eq!(params.frame_bytes(), 516);
    }

    #[test]
    fn test_crf_params() {
        let mut avtp = [0u8; 20];
        avtp[3] = CrfType::AudioSample.code();
        let word = ((CrfPull::DownNtsc.code() as u32) << 29) | 48_000;
        avtp[12..16].copy_from_slice(&word.to_be_bytes());
        avtp[16..18].copy_from_slice(&48u16.to_be_bytes());
        avtp[18..20].copy_from_slice(&160u16.to_be_bytes());

        let params = CrfParams::parse(&avtp);
        assert_eq!(params.crf_type, CrfType::AudioSample);
        assert_eq!(params.pull, CrfPull::DownNtsc);
        assert_eq!(params.base_frequency, 48_000);
        assert_eq!(params.timestamp_interval, 160);
        assert_eq!(params.timestamps_per_packet(), 6);
        assert!((params.nominal_frequency() - 47_952.047_952).abs() < 1e-3);
    }

    #[test]
    fn test_cip_encode_parse() {
        let cip = CipHeader {
            sid: 63,
            dbs: 6,
            fraction_number: 3,
            quadlet_padding: 0,
            source_packet_header: true,
            dbc: 0x20,
            fmt: 0x20,
            fdf: 0,
            syt: 0,
        };
        let bytes = cip.encode();
        assert_eq!(bytes[2], 0xC4);
        assert_eq!(CipHeader::parse(&bytes), Some(cip));
        assert_eq!(CipHeader::parse(&bytes[..7]), None);
    }
}
