//! One request and one response per connection, each connection on its own thread

use crate::listener::Listener;
use crate::protocol::{self, MAX_PACKET_SIZE};
use vtpm_attest::tpm::Connect;

/// Reads a single packet of at most [`MAX_PACKET_SIZE`] bytes and answers it
pub fn handle_connection<S, C>(mut stream: S, connect: &C) -> std::io::Result<()>
where
    S: std::io::Read + std::io::Write,
    C: Connect,
{
    let mut packet = [0u8; MAX_PACKET_SIZE];
    let size = stream.read(&mut packet)?;

    let response = protocol::handle_packet(&packet[..size], connect);

    stream.write_all(&response)?;
    stream.flush()
}

/// Accepts connections until accepting fails for good
pub fn serve<L, C>(listener: L, connect: std::sync::Arc<C>)
where
    L: Listener,
    C: Connect + 'static,
{
    loop {
        let stream = match listener.accept() {
            Ok(stream) => stream,
            Err(error) => {
                log::error!("Failed to accept connection: {error}");
                continue;
            }
        };

        let connect = std::sync::Arc::clone(&connect);
        std::thread::spawn(move || {
            if let Err(error) = handle_connection(stream, connect.as_ref()) {
                log::error!("Failed to serve connection: {error}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use vtpm_attest::testing::SoftTpm;

    fn start(tpm: &SoftTpm) -> (tempfile::TempDir, std::path::PathBuf) {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("vcomlink.sock");
        let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();

        let connect = std::sync::Arc::new(tpm.clone());
        std::thread::spawn(move || serve(listener, connect));

        (directory, path)
    }

    fn exchange(path: &std::path::Path, packet: &[u8]) -> Vec<u8> {
        let mut stream = std::os::unix::net::UnixStream::connect(path).unwrap();
        stream.write_all(packet).unwrap();
        stream.shutdown(std::net::Shutdown::Write).unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();

        response
    }

    #[test]
    fn relays_endorsement_key() {
        let tpm = SoftTpm::new();
        let (_directory, path) = start(&tpm);

        let response = exchange(&path, br#"{"channel":2,"request":1}"#);

        let response: protocol::TpmEndorsementKeyResponse =
            serde_json::from_slice(&response).unwrap();
        assert_eq!(
            response.ek,
            <base64ct::Base64 as base64ct::Encoding>::encode_string(
                tpm.public(vtpm_attest::PersistentHandle::EK).as_bytes()
            )
        );
    }

    #[test]
    fn answers_truncated_packet_with_error() {
        let tpm = SoftTpm::new();
        let (_directory, path) = start(&tpm);

        assert_eq!(
            exchange(&path, br#"{"channel":2,"requ"#),
            br#"{"error":"received malformed packet"}"#
        );
        assert_eq!(tpm.connections(), 0);
    }

    #[test]
    fn reads_at_most_one_packet() {
        let tpm = SoftTpm::new();
        let (_directory, path) = start(&tpm);

        // Valid JSON, but longer than a packet
        let padding = " ".repeat(MAX_PACKET_SIZE);
        let packet = format!(r#"{{"channel":2,{padding}"request":1}}"#);

        assert_eq!(
            exchange(&path, packet.as_bytes()),
            br#"{"error":"received malformed packet"}"#
        );
    }

    #[test]
    fn serves_connections_independently() {
        let tpm = SoftTpm::new();
        let (_directory, path) = start(&tpm);

        let clients: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || exchange(&path, br#"{"channel":2,"request":1}"#))
            })
            .collect();

        for client in clients {
            let response = client.join().unwrap();
            assert!(response.starts_with(br#"{"ek":""#));
        }
        assert_eq!(tpm.connections(), 4);
    }
}
