//! Health check of a running emulator, reading its EK through the TPM server socket

use vtpm_attest::tpm::PublicKeyBlob;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no connection to {path} within {timeout:?}: {source}")]
    Unreachable {
        path: std::path::PathBuf,
        timeout: std::time::Duration,
        source: std::io::Error,
    },
    #[error(transparent)]
    Raw(#[from] vtpm_attest::raw::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub trait EkProbe: Send + Sync {
    fn read_endorsement_key(&self, server_socket: &std::path::Path)
        -> Result<PublicKeyBlob, Error>;
}

/// Talks raw TPM commands over the server socket
#[derive(Debug, Clone)]
pub struct SocketEkProbe {
    timeout: std::time::Duration,
}

impl SocketEkProbe {
    const RETRY_INTERVAL: std::time::Duration = std::time::Duration::from_millis(50);

    pub fn new(timeout: std::time::Duration) -> Self {
        Self { timeout }
    }

    /// The emulator creates its socket some time after it was started
    fn connect(
        &self,
        server_socket: &std::path::Path,
    ) -> Result<std::os::unix::net::UnixStream, Error> {
        let deadline = std::time::Instant::now() + self.timeout;

        loop {
            match std::os::unix::net::UnixStream::connect(server_socket) {
                Ok(stream) => return Ok(stream),
                Err(error) if std::time::Instant::now() >= deadline => {
                    return Err(Error::Unreachable {
                        path: server_socket.to_path_buf(),
                        timeout: self.timeout,
                        source: error,
                    })
                }
                Err(error) => {
                    log::trace!("{} not reachable yet: {error}", server_socket.display());

                    std::thread::sleep(Self::RETRY_INTERVAL);
                }
            }
        }
    }
}

impl EkProbe for SocketEkProbe {
    fn read_endorsement_key(
        &self,
        server_socket: &std::path::Path,
    ) -> Result<PublicKeyBlob, Error> {
        let stream = self.connect(server_socket)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        let mut tpm = vtpm_attest::raw::Tpm::new(stream);
        tpm.startup()?;

        Ok(tpm.read_endorsement_key()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};

    /// Answers startup, CreatePrimary and FlushContext like a started TPM
    fn serve_endorsement_key(
        listener: std::os::unix::net::UnixListener,
        public: Vec<u8>,
    ) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();

            let read_command = |stream: &mut std::os::unix::net::UnixStream| {
                let mut header = [0u8; 10];
                stream.read_exact(&mut header).unwrap();
                let size = u32::from_be_bytes(header[2..6].try_into().unwrap()) as usize;
                let mut rest = vec![0u8; size - 10];
                stream.read_exact(&mut rest).unwrap();

                u32::from_be_bytes(header[6..10].try_into().unwrap())
            };

            let response = |tag: u16, code: u32, body: &[u8]| {
                [
                    &tag.to_be_bytes()[..],
                    &((10 + body.len()) as u32).to_be_bytes(),
                    &code.to_be_bytes(),
                    body,
                ]
                .concat()
            };

            // TPM2_Startup on a started TPM
            assert_eq!(read_command(&mut stream), 0x144);
            stream.write_all(&response(0x8001, 0x100, &[])).unwrap();

            assert_eq!(read_command(&mut stream), 0x131);
            let mut parameters = (public.len() as u16).to_be_bytes().to_vec();
            parameters.extend_from_slice(&public);
            let mut body = 0x8000_0000u32.to_be_bytes().to_vec();
            body.extend_from_slice(&(parameters.len() as u32).to_be_bytes());
            body.extend_from_slice(&parameters);
            stream.write_all(&response(0x8002, 0, &body)).unwrap();

            assert_eq!(read_command(&mut stream), 0x165);
            stream.write_all(&response(0x8001, 0, &[])).unwrap();
        })
    }

    #[test]
    fn reads_endorsement_key_over_socket() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("vm.srv.sock");
        let public = vtpm_attest::testing::SoftTpm::new()
            .public(vtpm_attest::PersistentHandle::EK);

        let server = serve_endorsement_key(
            std::os::unix::net::UnixListener::bind(&path).unwrap(),
            public.as_bytes().to_vec(),
        );

        let probe = SocketEkProbe::new(std::time::Duration::from_secs(5));
        assert_eq!(probe.read_endorsement_key(&path).unwrap(), public);

        server.join().unwrap();
    }

    #[test]
    fn gives_up_on_missing_socket() {
        let directory = tempfile::tempdir().unwrap();
        let probe = SocketEkProbe::new(std::time::Duration::from_millis(120));

        assert!(matches!(
            probe.read_endorsement_key(&directory.path().join("missing.srv.sock")),
            Err(Error::Unreachable { .. })
        ));
    }
}
