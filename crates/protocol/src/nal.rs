// Copyright 2024 Soft KVM Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Annex-B start code scanning and NAL unit classification

use devcap_core::VideoCodec;

/// 4-byte Annex-B start code used when re-emitting NAL units
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Keyframe detection only looks at start codes within this many leading bytes
pub const MAX_SCAN_BYTES: usize = 1_000;

/// H.265 NAL unit types
pub mod hevc {
    pub const TRAIL_R: u8 = 1;
    pub const IDR_W_RADL: u8 = 19;
    pub const IDR_N_LP: u8 = 20;
    pub const CRA: u8 = 21;
    pub const VPS: u8 = 32;
    pub const SPS: u8 = 33;
    pub const PPS: u8 = 34;
}

/// H.264 NAL unit types
pub mod avc {
    pub const NON_IDR: u8 = 1;
    pub const IDR: u8 = 5;
    pub const SPS: u8 = 7;
    pub const PPS: u8 = 8;
}

/// A NAL unit located inside a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalUnit {
    pub nal_type: u8,
    /// Position of the NAL header byte, just past the start code
    pub offset: usize,
    /// Length of the unit without start code and trailing zero bytes
    pub length: usize,
}

impl NalUnit {
    /// Borrow the unit's bytes (header included) from the packet it was found in
    pub fn payload<'a>(&self, packet: &'a [u8]) -> &'a [u8] {
        &packet[self.offset..self.offset + self.length]
    }
}

/// Extract the NAL unit type from the first header byte
pub fn nal_type(codec: VideoCodec, header: u8) -> u8 {
    match codec {
        VideoCodec::H265 => (header >> 1) & 0x3F,
        VideoCodec::H264 => header & 0x1F,
    }
}

/// Whether a NAL type means the packet can seed a standalone decode
pub fn is_keyframe_nal_type(codec: VideoCodec, nal_type: u8) -> bool {
    match codec {
        VideoCodec::H265 => matches!(
            nal_type,
            hevc::IDR_W_RADL | hevc::IDR_N_LP | hevc::CRA | hevc::VPS | hevc::SPS | hevc::PPS
        ),
        VideoCodec::H264 => matches!(nal_type, avc::IDR | avc::SPS | avc::PPS),
    }
}

/// Find the next start code at or after `from`.
///
/// Returns the position of its first byte and its length (3 or 4).
pub fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0x00 && data[i + 1] == 0x00 {
            if data[i + 2] == 0x01 {
                return Some((i, 3));
            }
            if data[i + 2] == 0x00 && data.get(i + 3) == Some(&0x01) {
                return Some((i, 4));
            }
        }
        i += 1;
    }
    None
}

/// Iterator over the NAL units of an Annex-B packet
pub struct NalUnits<'a> {
    data: &'a [u8],
    codec: VideoCodec,
    next_start: Option<(usize, usize)>,
}

impl<'a> Iterator for NalUnits<'a> {
    type Item = NalUnit;

    fn next(&mut self) -> Option<NalUnit> {
        loop {
            let (position, code_len) = self.next_start.take()?;
            let offset = position + code_len;
            self.next_start = find_start_code(self.data, offset + 1);

            let end = self
                .next_start
                .map(|(next, _)| next)
                .unwrap_or(self.data.len());
            if offset >= end {
                continue;
            }

            let mut trimmed = end;
            while trimmed > offset + 1 && self.data[trimmed - 1] == 0x00 {
                trimmed -= 1;
            }

            return Some(NalUnit {
                nal_type: nal_type(self.codec, self.data[offset]),
                offset,
                length: trimmed - offset,
            });
        }
    }
}

/// Walk every NAL unit in `data`
pub fn nal_units(data: &[u8], codec: VideoCodec) -> NalUnits<'_> {
    NalUnits {
        data,
        codec,
        next_start: find_start_code(data, 0),
    }
}

/// Whether a NAL type is a random-access picture slice
pub fn is_irap_picture_nal_type(codec: VideoCodec, nal_type: u8) -> bool {
    match codec {
        VideoCodec::H265 => matches!(nal_type, hevc::IDR_W_RADL | hevc::IDR_N_LP | hevc::CRA),
        VideoCodec::H264 => nal_type == avc::IDR,
    }
}

/// Decide whether a packet carries a decodable keyframe.
///
/// Parameter sets and slice headers sit at the front of a packet, so only
/// start codes beginning in the first [`MAX_SCAN_BYTES`] are inspected.
pub fn detect_keyframe(data: &[u8], codec: VideoCodec) -> bool {
    any_leading_nal(data, codec, is_keyframe_nal_type)
}

/// Like [`detect_keyframe`], but parameter sets alone do not count.
///
/// A config-only packet seeds the parameter-set header but has no picture
/// that could be decoded into a still.
pub fn contains_irap_picture(data: &[u8], codec: VideoCodec) -> bool {
    any_leading_nal(data, codec, is_irap_picture_nal_type)
}

fn any_leading_nal(data: &[u8], codec: VideoCodec, matches: fn(VideoCodec, u8) -> bool) -> bool {
    let window = &data[..data.len().min(MAX_SCAN_BYTES + START_CODE.len() + 1)];
    let mut from = 0;

    while let Some((position, code_len)) = find_start_code(window, from) {
        if position >= MAX_SCAN_BYTES {
            break;
        }
        let Some(&header) = window.get(position + code_len) else {
            break;
        };
        if matches(codec, nal_type(codec, header)) {
            return true;
        }
        from = position + code_len;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hevc_header(nal_type: u8) -> [u8; 2] {
        [nal_type << 1, 0x01]
    }

    #[test]
    fn test_hevc_idr_is_keyframe() {
        let mut packet = vec![0x00, 0x00, 0x00, 0x01];
        packet.extend_from_slice(&hevc_header(hevc::IDR_W_RADL));
        packet.extend_from_slice(&[0xAF, 0x12, 0x34]);

        assert!(detect_keyframe(&packet, VideoCodec::H265));
    }

    #[test]
    fn test_hevc_trailing_slice_is_not_keyframe() {
        let mut packet = vec![0x00, 0x00, 0x00, 0x01];
        packet.extend_from_slice(&hevc_header(hevc::TRAIL_R));
        packet.extend_from_slice(&[0xAF, 0x12, 0x34]);

        assert!(!detect_keyframe(&packet, VideoCodec::H265));
    }

    #[test]
    fn test_three_byte_start_code() {
        let mut packet = vec![0x00, 0x00, 0x01];
        packet.extend_from_slice(&hevc_header(hevc::CRA));
        packet.push(0x55);

        assert!(detect_keyframe(&packet, VideoCodec::H265));
    }

    #[test]
    fn test_keyframe_after_non_key_unit() {
        let mut packet = vec![0x00, 0x00, 0x00, 0x01];
        packet.extend_from_slice(&hevc_header(hevc::TRAIL_R));
        packet.extend_from_slice(&[0x11, 0x22]);
        packet.extend_from_slice(&[0x00, 0x00, 0x01]);
        packet.extend_from_slice(&hevc_header(hevc::IDR_N_LP));
        packet.push(0x33);

        assert!(detect_keyframe(&packet, VideoCodec::H265));
    }

    #[test]
    fn test_scan_is_bounded() {
        let mut packet = vec![0x00, 0x00, 0x00, 0x01];
        packet.extend_from_slice(&hevc_header(hevc::TRAIL_R));
        packet.extend(std::iter::repeat(0xFF).take(MAX_SCAN_BYTES + 10));
        packet.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
        packet.extend_from_slice(&hevc_header(hevc::IDR_W_RADL));

        assert!(!detect_keyframe(&packet, VideoCodec::H265));
    }

    #[test]
    fn test_avc_classification() {
        let idr = [0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84];
        let non_idr = [0x00, 0x00, 0x00, 0x01, 0x41, 0x9A, 0x02];

        assert!(detect_keyframe(&idr, VideoCodec::H264));
        assert!(!detect_keyframe(&non_idr, VideoCodec::H264));
        // 0x65 read as H.265 is type 50, not a keyframe there
        assert!(!detect_keyframe(&idr, VideoCodec::H265));
    }

    #[test]
    fn test_short_and_empty_packets() {
        assert!(!detect_keyframe(&[], VideoCodec::H265));
        assert!(!detect_keyframe(&[0x00, 0x00, 0x01], VideoCodec::H265));
        assert!(!detect_keyframe(&[0x00, 0x00, 0x00, 0x01], VideoCodec::H265));
    }

    #[test]
    fn test_nal_unit_iteration() {
        let packet = [
            0x00, 0x00, 0x00, 0x01, 0x40, 0x01, 0xAA, // VPS
            0x00, 0x00, 0x01, 0x42, 0x01, 0xBB, 0xCC, 0x00, // SPS + trailing zero
            0x00, 0x00, 0x00, 0x01, 0x26, 0x01, 0xDD, // IDR
        ];

        let units: Vec<NalUnit> = nal_units(&packet, VideoCodec::H265).collect();
        assert_eq!(units.len(), 3);

        assert_eq!(units[0], NalUnit { nal_type: hevc::VPS, offset: 4, length: 3 });
        assert_eq!(units[1].nal_type, hevc::SPS);
        assert_eq!(units[1].payload(&packet), &[0x42, 0x01, 0xBB, 0xCC]);
        assert_eq!(units[2].nal_type, hevc::IDR_W_RADL);
        assert_eq!(units[2].payload(&packet), &[0x26, 0x01, 0xDD]);
    }

    #[test]
    fn test_irap_picture_ignores_config_only_packets() {
        let config_only = [
            0x00, 0x00, 0x00, 0x01, 0x40, 0x01, 0xAA, // VPS
            0x00, 0x00, 0x00, 0x01, 0x42, 0x01, 0xBB, // SPS
            0x00, 0x00, 0x00, 0x01, 0x44, 0x01, 0xCC, // PPS
        ];
        let mut full = config_only.to_vec();
        full.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x2A, 0x01, 0xDD]); // CRA

        assert!(detect_keyframe(&config_only, VideoCodec::H265));
        assert!(!contains_irap_picture(&config_only, VideoCodec::H265));
        assert!(contains_irap_picture(&full, VideoCodec::H265));

        let avc_config = [0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x00, 0x00, 0x01, 0x68, 0xCE];
        assert!(!contains_irap_picture(&avc_config, VideoCodec::H264));
        assert!(contains_irap_picture(&[0x00, 0x00, 0x01, 0x65, 0x88], VideoCodec::H264));
    }

    #[test]
    fn test_find_start_code_positions() {
        let data = [0xFF, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x02];
        assert_eq!(find_start_code(&data, 0), Some((1, 3)));
        assert_eq!(find_start_code(&data, 2), Some((4, 4)));
        assert_eq!(find_start_code(&data, 5), Some((5, 3)));
        assert_eq!(find_start_code(&data, 6), None);
    }
}
