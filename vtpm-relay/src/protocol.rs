// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! JSON packets exchanged between guests and the host
//!
//! Every packet names the channel it belongs to, the channel decides how the rest of the packet
//! is interpreted. A request that cannot be served is answered with [`MALFORMED_PACKET`], no
//! matter why.

use vtpm_attest::tpm::Connect;

/// vsock port of the host
pub const HOST_PORT: u32 = 2000;
/// Largest packet read from a connection
pub const MAX_PACKET_SIZE: usize = 4096;

pub const CHANNEL_TPM: u32 = 2;
pub const REQUEST_TPM_GET_EK: u32 = 1;

pub const MALFORMED_PACKET: &str = "received malformed packet";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("malformed packet: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown channel {0}")]
    UnknownChannel(u32),
    #[error("unknown request {request} on channel {channel}")]
    UnknownRequest { channel: u32, request: u32 },
    #[error("error response: {0}")]
    ErrorResponse(String),
    #[error(transparent)]
    Tpm(#[from] vtpm_attest::tpm::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BasePacket {
    pub channel: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TpmRequest {
    #[serde(flatten)]
    pub base: BasePacket,
    pub request: u32,
}

impl TpmRequest {
    pub fn get_endorsement_key() -> Self {
        Self {
            base: BasePacket {
                channel: CHANNEL_TPM,
            },
            request: REQUEST_TPM_GET_EK,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Response to [`REQUEST_TPM_GET_EK`]
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TpmEndorsementKeyResponse {
    /// Base64 of the marshalled `TPMT_PUBLIC`
    pub ek: String,
}

/// Answers one packet, never fails
pub fn handle_packet<C: Connect>(packet: &[u8], connect: &C) -> Vec<u8> {
    match dispatch(packet, connect) {
        Ok(response) => response,
        Err(error) => {
            log::error!("Failed to handle packet: {error}");

            malformed_packet_response()
        }
    }
}

fn dispatch<C: Connect>(packet: &[u8], connect: &C) -> Result<Vec<u8>, Error> {
    let base: BasePacket = serde_json::from_slice(packet)?;

    match base.channel {
        CHANNEL_TPM => crate::tpm::handle_request(packet, connect),
        channel => Err(Error::UnknownChannel(channel)),
    }
}

pub fn malformed_packet_response() -> Vec<u8> {
    let response = ErrorResponse {
        error: MALFORMED_PACKET.to_string(),
    };

    // Serializing a struct of one string does not fail
    serde_json::to_vec(&response).unwrap_or_default()
}
