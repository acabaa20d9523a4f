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

//! Parameter set extraction from keyframe packets

use crate::nal::{avc, hevc, nal_units, START_CODE};
use crate::{ProtocolError, ProtocolResult};
use bytes::{BufMut, Bytes, BytesMut};
use devcap_core::VideoCodec;

/// Parameter sets a standalone decode needs, in emission order
fn required_parameter_sets(codec: VideoCodec) -> &'static [(u8, &'static str)] {
    match codec {
        VideoCodec::H265 => &[(hevc::VPS, "VPS"), (hevc::SPS, "SPS"), (hevc::PPS, "PPS")],
        VideoCodec::H264 => &[(avc::SPS, "SPS"), (avc::PPS, "PPS")],
    }
}

/// Build the parameter set header from a keyframe packet.
///
/// The first unit of each required type is kept and re-prefixed with a
/// 4-byte start code. Fails if any of them is absent from the packet.
pub fn extract_parameter_sets(packet: &[u8], codec: VideoCodec) -> ProtocolResult<Bytes> {
    let required = required_parameter_sets(codec);
    let mut found: Vec<Option<&[u8]>> = vec![None; required.len()];

    for unit in nal_units(packet, codec) {
        if let Some(index) = required.iter().position(|(nal_type, _)| *nal_type == unit.nal_type) {
            if found[index].is_none() {
                found[index] = Some(unit.payload(packet));
            }
        }
        if found.iter().all(Option::is_some) {
            break;
        }
    }

    let mut header = BytesMut::new();
    for ((_, name), payload) in required.iter().zip(&found) {
        let payload = (*payload).ok_or(ProtocolError::MissingParameterSet(*name))?;
        header.put_slice(&START_CODE);
        header.put_slice(payload);
    }

    Ok(header.freeze())
}

/// Concatenate a parameter set header and a frame into one decodable buffer
pub fn with_parameter_sets(header: &[u8], frame: &[u8]) -> Bytes {
    let mut combined = BytesMut::with_capacity(header.len() + frame.len());
    combined.put_slice(header);
    combined.put_slice(frame);
    combined.freeze()
}
