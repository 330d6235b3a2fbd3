//! H.264 access unit handling.
//!
//! H.264 video arrives from RTMP/FLV in **AVCC** form: every NAL unit is
//! preceded by a big-endian length (usually 4 bytes) and the parameter sets
//! travel separately in an AVC Decoder Configuration Record (the "sequence
//! header"). The WebRTC packetizer expects **Annex B** instead, where NAL
//! units are separated by start codes (0x00000001).
//!
//! This module parses the configuration record and converts access units
//! between the two layouts.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::error::MediaError;
use crate::MediaResult;

/// Annex B start code used when writing samples.
const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// NAL unit types relevant for H.264.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NalUnitType {
    /// Non-IDR slice (P/B frame).
    NonIdrSlice = 1,
    /// IDR slice (keyframe).
    IdrSlice = 5,
    /// Supplemental Enhancement Information.
    Sei = 6,
    /// Sequence Parameter Set.
    Sps = 7,
    /// Picture Parameter Set.
    Pps = 8,
    /// Access Unit Delimiter.
    Aud = 9,
    /// Other/unknown NAL type.
    Other = 0,
}

impl From<u8> for NalUnitType {
    fn from(byte: u8) -> Self {
        match byte & 0x1F {
            1 => NalUnitType::NonIdrSlice,
            5 => NalUnitType::IdrSlice,
            6 => NalUnitType::Sei,
            7 => NalUnitType::Sps,
            8 => NalUnitType::Pps,
            9 => NalUnitType::Aud,
            _ => NalUnitType::Other,
        }
    }
}

/// A single NAL unit (header byte included, no prefix).
#[derive(Debug, Clone)]
pub struct NalUnit {
    /// The NAL unit type.
    pub nal_type: NalUnitType,
    /// The NAL unit data.
    pub data: Bytes,
}

impl NalUnit {
    fn new(data: Bytes) -> Self {
        let nal_type = NalUnitType::from(data[0]);
        Self { nal_type, data }
    }
}

/// Parsed AVC Decoder Configuration Record (ISO 14496-15).
///
/// Layout:
/// - configurationVersion: 1 byte (always 0x01)
/// - AVCProfileIndication, profile_compatibility, AVCLevelIndication: 3 bytes
/// - lengthSizeMinusOne: low 2 bits of 1 byte
/// - numOfSequenceParameterSets: low 5 bits of 1 byte, then (u16 length, SPS)*
/// - numOfPictureParameterSets: 1 byte, then (u16 length, PPS)*
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcDecoderConfig {
    pub profile_idc: u8,
    pub profile_compatibility: u8,
    pub level_idc: u8,
    /// Size in bytes of the NAL length prefix used by access units.
    pub nal_length_size: u8,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

impl AvcDecoderConfig {
    /// Parse a configuration record.
    pub fn parse(data: &[u8]) -> MediaResult<Self> {
        if data.len() < 7 {
            return Err(MediaError::InvalidDecoderConfig(format!(
                "record too short: {} bytes",
                data.len()
            )));
        }
        if data[0] != 0x01 {
            return Err(MediaError::InvalidDecoderConfig(format!(
                "unsupported configuration version {}",
                data[0]
            )));
        }

        let nal_length_size = (data[4] & 0x03) + 1;
        let mut cursor = 5;

        let sps_count = (data[cursor] & 0x1F) as usize;
        cursor += 1;
        let sps = read_parameter_sets(data, &mut cursor, sps_count, "SPS")?;

        if cursor >= data.len() {
            return Err(MediaError::InvalidDecoderConfig(
                "missing PPS count".to_string(),
            ));
        }
        let pps_count = data[cursor] as usize;
        cursor += 1;
        let pps = read_parameter_sets(data, &mut cursor, pps_count, "PPS")?;

        if sps.is_empty() || pps.is_empty() {
            return Err(MediaError::InvalidDecoderConfig(
                "record carries no SPS or no PPS".to_string(),
            ));
        }

        debug!(
            profile = data[1],
            level = data[3],
            nal_length_size,
            sps = sps.len(),
            pps = pps.len(),
            "Parsed AVC decoder configuration record"
        );

        Ok(Self {
            profile_idc: data[1],
            profile_compatibility: data[2],
            level_idc: data[3],
            nal_length_size,
            sps,
            pps,
        })
    }

    /// The `profile-level-id` fmtp value for this stream, e.g. `42e01f`.
    pub fn profile_level_id(&self) -> String {
        format!(
            "{:02x}{:02x}{:02x}",
            self.profile_idc, self.profile_compatibility, self.level_idc
        )
    }

    /// Parameter sets as NAL units, SPS first.
    pub fn parameter_sets(&self) -> Vec<NalUnit> {
        self.sps
            .iter()
            .chain(self.pps.iter())
            .filter(|p| !p.is_empty())
            .map(|p| NalUnit::new(p.clone()))
            .collect()
    }
}

fn read_parameter_sets(
    data: &[u8],
    cursor: &mut usize,
    count: usize,
    what: &str,
) -> MediaResult<Vec<Bytes>> {
    let mut sets = Vec::with_capacity(count);
    for _ in 0..count {
        if *cursor + 2 > data.len() {
            return Err(MediaError::InvalidDecoderConfig(format!(
                "truncated {} length",
                what
            )));
        }
        let len = u16::from_be_bytes([data[*cursor], data[*cursor + 1]]) as usize;
        *cursor += 2;
        if *cursor + len > data.len() {
            return Err(MediaError::InvalidDecoderConfig(format!(
                "truncated {} ({} bytes declared)",
                what, len
            )));
        }
        sets.push(Bytes::copy_from_slice(&data[*cursor..*cursor + len]));
        *cursor += len;
    }
    Ok(sets)
}

/// Split a length-prefixed (AVCC) access unit into NAL units.
pub fn parse_avcc(data: &Bytes, length_size: u8) -> MediaResult<Vec<NalUnit>> {
    let length_size = length_size as usize;
    if !(1..=4).contains(&length_size) {
        return Err(MediaError::InvalidAvcc(format!(
            "unsupported length size {}",
            length_size
        )));
    }

    let mut nals = Vec::new();
    let mut i = 0;
    while i < data.len() {
        if i + length_size > data.len() {
            return Err(MediaError::InvalidAvcc(format!(
                "truncated length prefix at offset {}",
                i
            )));
        }
        let len = data[i..i + length_size]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        i += length_size;

        if i + len > data.len() {
            return Err(MediaError::InvalidAvcc(format!(
                "NAL unit of {} bytes overruns payload at offset {}",
                len, i
            )));
        }
        if len > 0 {
            nals.push(NalUnit::new(data.slice(i..i + len)));
        }
        i += len;
    }

    Ok(nals)
}

/// Join NAL units into an Annex B byte stream with 4-byte start codes.
pub fn nals_to_annex_b(nals: &[NalUnit]) -> Bytes {
    let total: usize = nals.iter().map(|n| n.data.len() + START_CODE.len()).sum();
    let mut buf = BytesMut::with_capacity(total);

    for nal in nals {
        buf.put_slice(&START_CODE);
        buf.put_slice(&nal.data);
    }

    buf.freeze()
}

/// Whether the access unit contains an IDR slice.
pub fn contains_idr(nals: &[NalUnit]) -> bool {
    nals.iter().any(|n| n.nal_type == NalUnitType::IdrSlice)
}

/// Filter NAL units, removing SPS/PPS/AUD.
///
/// In-band parameter sets are replaced by the ones from the decoder
/// configuration record when a keyframe is prepared for delivery.
pub fn filter_parameter_sets(nals: Vec<NalUnit>) -> Vec<NalUnit> {
    nals.into_iter()
        .filter(|nal| {
            !matches!(
                nal.nal_type,
                NalUnitType::Sps | NalUnitType::Pps | NalUnitType::Aud
            )
        })
        .collect()
}

/// Convert an AVCC access unit to an Annex B sample.
///
/// IDR access units get the configuration's SPS/PPS in front so a decoder
/// that joins mid-stream can start at any keyframe. Returns the sample and
/// whether it is decodable on its own.
pub fn access_unit_to_annex_b(
    data: &Bytes,
    config: &AvcDecoderConfig,
) -> MediaResult<(Bytes, bool)> {
    let nals = parse_avcc(data, config.nal_length_size)?;
    let keyframe = contains_idr(&nals);

    if !keyframe {
        return Ok((nals_to_annex_b(&filter_parameter_sets(nals)), false));
    }

    let mut with_params = config.parameter_sets();
    with_params.extend(filter_parameter_sets(nals));
    Ok((nals_to_annex_b(&with_params), true))
}
