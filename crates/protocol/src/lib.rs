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

//! # Devcap Protocol
//!
//! Annex-B bitstream parsing and the transport contracts a device stream must satisfy

pub mod nal;
pub mod parameter_sets;
pub mod transport;

pub use nal::{contains_irap_picture, detect_keyframe, nal_units, NalUnit, NalUnits};
pub use parameter_sets::{extract_parameter_sets, with_parameter_sets};
pub use transport::*;

/// Protocol result type
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Protocol errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Stream negotiation failed: {0}")]
    Negotiation(String),

    #[error("Device session did not provide a video stream")]
    StreamUnavailable,

    #[error("Keyframe is missing parameter set: {0}")]
    MissingParameterSet(&'static str),
}
