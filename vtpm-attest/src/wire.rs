// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Big-endian TPM wire primitives shared by the public area codec, the credential framing and the
//! raw command channel

use crate::tpm::Error;

/// Size of the length prefix of every TPM2B structure
pub const TPM2B_SIZE_PREFIX: usize = std::mem::size_of::<u16>();

pub(crate) struct Reader<'a> {
    data: &'a [u8],
    context: &'static str,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8], context: &'static str) -> Self {
        Self { data, context }
    }

    fn take(&mut self, size: usize) -> Result<&'a [u8], Error> {
        let (value, rest) = self
            .data
            .split_at_checked(size)
            .ok_or_else(|| Error::Protocol(format!("truncated {}", self.context)))?;

        self.data = rest;

        Ok(value)
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16, Error> {
        let value = self.take(std::mem::size_of::<u16>())?;

        Ok(u16::from_be_bytes([value[0], value[1]]))
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, Error> {
        let value = self.take(std::mem::size_of::<u32>())?;

        Ok(u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
    }

    pub(crate) fn read_sized_buffer(&mut self) -> Result<&'a [u8], Error> {
        let size = self.read_u16()?;

        self.take(size.into())
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.data)
    }

    /// Fails if there is data left that the structure does not account for
    pub(crate) fn finish(self) -> Result<(), Error> {
        if self.data.is_empty() {
            Ok(())
        } else {
            Err(Error::Protocol(format!(
                "{} trailing bytes after {}",
                self.data.len(),
                self.context
            )))
        }
    }
}

fn put_u16(buffer: &mut Vec<u8>, value: u16) {
    buffer.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn put_sized(buffer: &mut Vec<u8>, data: &[u8]) -> Result<(), Error> {
    let size = u16::try_from(data.len())
        .map_err(|_| Error::Protocol(format!("{} bytes exceed a TPM2B", data.len())))?;

    put_u16(buffer, size);
    buffer.extend_from_slice(data);

    Ok(())
}

/// Wraps `data` into a TPM2B structure
pub fn tpm2b(data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut buffer = Vec::with_capacity(TPM2B_SIZE_PREFIX + data.len());

    put_sized(&mut buffer, data)?;

    Ok(buffer)
}

/// Strips the size prefix of a TPM2B structure, requiring it to cover exactly the remaining bytes
pub fn strip_tpm2b(data: &[u8]) -> Result<&[u8], Error> {
    let mut reader = Reader::new(data, "TPM2B buffer");
    let value = reader.read_sized_buffer()?;

    reader.finish()?;

    Ok(value)
}
