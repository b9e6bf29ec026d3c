// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

mod command_buffer;
mod response_buffer;

use crate::tpm::{KeyTemplate, PublicKeyBlob};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid TPM request")]
    InvalidTpmRequest,
    #[error("invalid TPM response")]
    InvalidTpmResponse,
    #[error("TPM error response: {0}")]
    TpmErrorResponse(tss_esapi::constants::response_code::Tss2ResponseCode),
    #[error(transparent)]
    Tpm(#[from] crate::tpm::Error),
    #[error(transparent)]
    Tss(#[from] tss_esapi::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Largest response accepted from the other end
const MAX_RESPONSE_SIZE: usize = 4096;

/// TPM reached through a byte stream carrying one command and one response at a time
pub struct Tpm<S> {
    stream: S,
}

impl<S: std::io::Read + std::io::Write> Tpm<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// `TPM2_Startup(TPM_SU_CLEAR)`, succeeds if the TPM has been started already
    pub fn startup(&mut self) -> Result<(), Error> {
        let command_buffer = command_buffer::Builder::new(
            tss_esapi::constants::tss::TPM2_ST_NO_SESSIONS,
            tss_esapi::constants::tss::TPM2_CC_Startup,
        )
        // Parameters
        .add_u16(tss_esapi::constants::tss::TPM2_SU_CLEAR)
        .build();

        response_buffer::Parser::from_startup(&self.send_command_buffer(&command_buffer)?)?;

        Ok(())
    }

    /// `TPM2_CreatePrimary` with empty authorization, returns the object handle and its
    /// marshalled `TPMT_PUBLIC`
    pub fn create_primary(
        &mut self,
        primary_handle: u32,
        template: &KeyTemplate,
    ) -> Result<(u32, PublicKeyBlob), Error> {
        let command_buffer = command_buffer::Builder::new(
            tss_esapi::constants::tss::TPM2_ST_SESSIONS,
            tss_esapi::constants::tss::TPM2_CC_CreatePrimary,
        )
        // Handles
        .add_u32(primary_handle)
        // Auth area
        .add_auth_area(&password_auth_area())
        // Parameters
        .add_sized_buffer(&[0x00, 0x00, 0x00, 0x00])? // in sensitive: empty auth and data
        .add_sized_buffer(&tss_esapi::traits::Marshall::marshall(template.public())?)?
        .add_sized_buffer(&[])? // outside info
        .add_u32(0u32) // creation PCR selection count
        .build();

        let response = self.send_command_buffer(&command_buffer)?;
        let mut response_parser = response_buffer::Parser::from(&response)?;

        let object_handle = response_parser.read_u32()?;
        let _parameter_size = response_parser.read_u32()?;
        let public = response_parser.read_sized_buffer()?;

        Ok((object_handle, PublicKeyBlob::new(public.to_vec())))
    }

    pub fn flush_context(&mut self, flush_handle: u32) -> Result<(), Error> {
        let command_buffer = command_buffer::Builder::new(
            tss_esapi::constants::tss::TPM2_ST_NO_SESSIONS,
            tss_esapi::constants::tss::TPM2_CC_FlushContext,
        )
        // Handles
        .add_u32(flush_handle)
        .build();

        response_buffer::Parser::from(&self.send_command_buffer(&command_buffer)?)?;

        Ok(())
    }

    /// Public area of the EK derived from the default RSA-2048 template
    pub fn read_endorsement_key(&mut self) -> Result<PublicKeyBlob, Error> {
        let (object_handle, public) = self.create_primary(
            tss_esapi::constants::tss::TPM2_RH_ENDORSEMENT,
            &KeyTemplate::endorsement_key()?,
        )?;

        self.flush_context(object_handle)?;

        Ok(public)
    }

    /// Responses are framed by the size field of their header
    fn send_command_buffer(&mut self, command_buffer: &[u8]) -> Result<Vec<u8>, Error> {
        self.stream.write_all(command_buffer)?;
        self.stream.flush()?;

        let mut header = [0u8; response_buffer::TPM_HEADER_SIZE];
        self.stream.read_exact(&mut header)?;

        let response_size = response_buffer::response_size(&header);
        if !(response_buffer::TPM_HEADER_SIZE..=MAX_RESPONSE_SIZE).contains(&response_size) {
            return Err(Error::InvalidTpmResponse);
        }

        let mut response = header.to_vec();
        response.resize(response_size, 0);
        self.stream
            .read_exact(&mut response[response_buffer::TPM_HEADER_SIZE..])?;

        Ok(response)
    }
}

/// Password session with an empty password
fn password_auth_area() -> Vec<u8> {
    [
        &tss_esapi::constants::tss::TPM2_RS_PW.to_be_bytes()[..],
        &0u16.to_be_bytes(), // nonce
        &[0x00],             // session attributes
        &0u16.to_be_bytes(), // hmac
    ]
    .concat()
}
