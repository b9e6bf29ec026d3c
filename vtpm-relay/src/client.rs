//! Guest side of the relay

use crate::protocol::{
    Error, ErrorResponse, TpmEndorsementKeyResponse, TpmRequest, MAX_PACKET_SIZE,
};

/// Asks the host for its EK, returns the marshalled `TPMT_PUBLIC`
pub fn request_endorsement_key<S>(mut stream: S) -> Result<Vec<u8>, Error>
where
    S: std::io::Read + std::io::Write,
{
    let request = serde_json::to_vec(&TpmRequest::get_endorsement_key())?;

    let response = exchange(&mut stream, &request)?;

    if let Ok(ErrorResponse { error }) = serde_json::from_slice(&response) {
        return Err(Error::ErrorResponse(error));
    }

    let response: TpmEndorsementKeyResponse = serde_json::from_slice(&response)?;

    <base64ct::Base64 as base64ct::Encoding>::decode_vec(&response.ek)
        .map_err(|error| Error::ErrorResponse(format!("invalid EK encoding: {error}")))
}

fn exchange<S>(stream: &mut S, request: &[u8]) -> std::io::Result<Vec<u8>>
where
    S: std::io::Read + std::io::Write,
{
    stream.write_all(request)?;
    stream.flush()?;

    // The host answers with a single write
    let mut response = vec![0u8; MAX_PACKET_SIZE];
    let size = stream.read(&mut response)?;
    response.truncate(size);

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vtpm_attest::testing::SoftTpm;

    fn serve_once(tpm: SoftTpm) -> (std::os::unix::net::UnixStream, std::thread::JoinHandle<()>) {
        let (client, server) = std::os::unix::net::UnixStream::pair().unwrap();

        let server = std::thread::spawn(move || {
            crate::server::handle_connection(server, &tpm).unwrap();
        });

        (client, server)
    }

    #[test]
    fn receives_endorsement_key() {
        let tpm = SoftTpm::new();
        let (client, server) = serve_once(tpm.clone());

        assert_eq!(
            request_endorsement_key(client).unwrap(),
            tpm.public(vtpm_attest::PersistentHandle::EK).as_bytes()
        );

        server.join().unwrap();
    }

    #[test]
    fn reports_error_response() {
        let tpm = SoftTpm::new();
        tpm.set_available(false);
        let (client, server) = serve_once(tpm);

        assert!(matches!(
            request_endorsement_key(client),
            Err(Error::ErrorResponse(message)) if message == crate::protocol::MALFORMED_PACKET
        ));

        server.join().unwrap();
    }
}
