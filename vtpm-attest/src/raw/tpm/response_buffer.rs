use super::Error;

pub(super) const TPM_HEADER_SIZE: usize = 10;
const TPM_RESPONSE_CODE_OFFSET: usize = 6;

/// Response code of a TPM that has already been started
const TPM_RC_INITIALIZE: u32 = 0x0000_0100;

pub(super) struct Parser<'a> {
    reader: crate::wire::Reader<'a>,
}

impl<'a> Parser<'a> {
    pub(super) fn from(data: &'a [u8]) -> Result<Self, Error> {
        let (header, data) = data
            .split_at_checked(TPM_HEADER_SIZE)
            .ok_or(Error::InvalidTpmResponse)?;

        match response_code(header)? {
            0 => Ok(Self {
                reader: crate::wire::Reader::new(data, "TPM response"),
            }),
            response_code => Err(Error::TpmErrorResponse(
                tss_esapi::constants::response_code::Tss2ResponseCode::from(response_code),
            )),
        }
    }

    /// Like [`Parser::from`], but accepts a TPM that was started already
    pub(super) fn from_startup(data: &'a [u8]) -> Result<Self, Error> {
        let header = data
            .get(..TPM_HEADER_SIZE)
            .ok_or(Error::InvalidTpmResponse)?;

        if response_code(header)? == TPM_RC_INITIALIZE {
            return Ok(Self {
                reader: crate::wire::Reader::new(&[], "TPM response"),
            });
        }

        Self::from(data)
    }

    pub(super) fn read_sized_buffer(&mut self) -> Result<&'a [u8], Error> {
        self.reader
            .read_sized_buffer()
            .map_err(|_| Error::InvalidTpmResponse)
    }

    pub(super) fn read_u32(&mut self) -> Result<u32, Error> {
        self.reader.read_u32().map_err(|_| Error::InvalidTpmResponse)
    }
}

fn response_code(header: &[u8]) -> Result<u32, Error> {
    header
        .get(TPM_RESPONSE_CODE_OFFSET..TPM_RESPONSE_CODE_OFFSET + std::mem::size_of::<u32>())
        .ok_or(Error::InvalidTpmResponse)?
        .try_into()
        .map(u32::from_be_bytes)
        .map_err(|_| Error::InvalidTpmResponse)
}

/// Total response size announced by a response header
pub(super) fn response_size(header: &[u8; TPM_HEADER_SIZE]) -> usize {
    u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize
}
