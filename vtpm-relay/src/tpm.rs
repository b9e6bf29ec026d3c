//! Requests of the TPM channel

use crate::protocol::{Error, TpmEndorsementKeyResponse, TpmRequest, CHANNEL_TPM, REQUEST_TPM_GET_EK};
use vtpm_attest::tpm::{Connect, PersistentHandle, Tpm as _};

pub(crate) fn handle_request<C: Connect>(packet: &[u8], connect: &C) -> Result<Vec<u8>, Error> {
    let request: TpmRequest = serde_json::from_slice(packet)?;

    match request.request {
        REQUEST_TPM_GET_EK => endorsement_key(connect),
        request => Err(Error::UnknownRequest {
            channel: CHANNEL_TPM,
            request,
        }),
    }
}

fn endorsement_key<C: Connect>(connect: &C) -> Result<Vec<u8>, Error> {
    let mut tpm = connect.connect()?;
    let endorsement_key = tpm.read_public(PersistentHandle::EK)?;

    let response = TpmEndorsementKeyResponse {
        ek: <base64ct::Base64 as base64ct::Encoding>::encode_string(
            endorsement_key.public.as_bytes(),
        ),
    };

    Ok(serde_json::to_vec(&response)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vtpm_attest::testing::SoftTpm;

    #[test]
    fn rejects_unknown_request() {
        let tpm = SoftTpm::new();

        assert!(matches!(
            handle_request(br#"{"channel":2,"request":9}"#, &tpm),
            Err(Error::UnknownRequest { request: 9, .. })
        ));
        assert!(matches!(
            handle_request(br#"{"channel":2}"#, &tpm),
            Err(Error::Malformed(_))
        ));
        assert_eq!(tpm.connections(), 0);
    }

    #[test]
    fn reports_missing_tpm() {
        let tpm = SoftTpm::new();
        tpm.set_available(false);

        assert!(matches!(
            handle_request(br#"{"channel":2,"request":1}"#, &tpm),
            Err(Error::Tpm(vtpm_attest::tpm::Error::Connection(_)))
        ));
    }

    #[test]
    fn reports_missing_endorsement_key() {
        let mut tpm = SoftTpm::new();
        tpm.remove(PersistentHandle::EK);

        assert!(matches!(
            handle_request(br#"{"channel":2,"request":1}"#, &tpm),
            Err(Error::Tpm(vtpm_attest::tpm::Error::NotFound(_)))
        ));
        assert_eq!(tpm.connections(), 1);
    }
}
