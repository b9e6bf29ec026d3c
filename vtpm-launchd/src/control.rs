//! Unix socket taking instance launch requests
//!
//! A client connects, writes the instance id terminated by a newline, and the connection is
//! closed once the instance is running or failed. Nothing is sent back.

use crate::instance::{self, Manager};
use crate::key_source::StateKeySource;
use crate::probe::EkProbe;
use std::io::BufRead as _;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("request exceeds {} bytes", instance::MAX_ID_LENGTH + 1)]
    TooLong,
    #[error("request is not terminated by a newline")]
    Unterminated,
    #[error("request is not UTF-8")]
    Encoding,
    #[error(transparent)]
    Instance(#[from] instance::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reads one newline-terminated instance id
pub fn read_id<R: std::io::Read>(reader: R) -> Result<String, Error> {
    // Id plus newline, one more byte tells an overlong request from a complete one
    let limit = instance::MAX_ID_LENGTH + 2;

    let mut request = Vec::new();
    std::io::BufReader::new(reader.take(limit as u64)).read_until(b'\n', &mut request)?;

    if request.last() != Some(&b'\n') {
        return Err(if request.len() >= limit {
            Error::TooLong
        } else {
            Error::Unterminated
        });
    }

    let id = String::from_utf8(request).map_err(|_| Error::Encoding)?;

    Ok(id.trim().to_string())
}

/// Handles one connection
pub fn handle_connection<S, K, P>(stream: S, manager: &Manager<K, P>) -> Result<String, Error>
where
    S: std::io::Read,
    K: StateKeySource,
    P: EkProbe,
{
    let id = read_id(stream)?;

    log::info!("Launching instance {id}");

    manager.create_instance(&id)?;

    log::info!("Instance {id} is running");

    Ok(id)
}

/// Listening control socket, removed again on drop
pub struct ControlServer {
    listener: std::os::unix::net::UnixListener,
    path: std::path::PathBuf,
}

impl ControlServer {
    /// Binds `path`, replacing a socket left behind by an earlier run
    pub fn bind(path: impl Into<std::path::PathBuf>) -> std::io::Result<Self> {
        let path = path.into();

        match std::fs::symlink_metadata(&path) {
            Ok(metadata) if std::os::unix::fs::FileTypeExt::is_socket(&metadata.file_type()) => {
                log::warn!("Removing stale control socket {}", path.display());

                std::fs::remove_file(&path)?;
            }
            _ => {}
        }

        let listener = std::os::unix::net::UnixListener::bind(&path)?;

        log::info!("Listening on {}", path.display());

        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Accepts connections forever, each handled on its own thread
    pub fn serve<K, P>(&self, manager: std::sync::Arc<Manager<K, P>>)
    where
        K: StateKeySource + 'static,
        P: EkProbe + 'static,
    {
        for stream in self.listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(error) => {
                    log::error!("Failed to accept control connection: {error}");
                    continue;
                }
            };

            let manager = std::sync::Arc::clone(&manager);
            std::thread::spawn(move || {
                if let Err(error) = handle_connection(stream, &manager) {
                    log::error!("Failed to launch instance: {error}");
                }
            });
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if let Err(error) = std::fs::remove_file(&self.path) {
            log::warn!("Failed to remove {}: {error}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn reads_terminated_id() {
        assert_eq!(read_id(&b"vm1\n"[..]).unwrap(), "vm1");
        assert_eq!(read_id(&b" vm1 \r\n"[..]).unwrap(), "vm1");
        assert_eq!(read_id(&b"vm1\nvm2\n"[..]).unwrap(), "vm1");
    }

    #[test]
    fn rejects_bad_requests() {
        assert!(matches!(read_id(&b"vm1"[..]), Err(Error::Unterminated)));
        assert!(matches!(read_id(&b""[..]), Err(Error::Unterminated)));
        assert!(matches!(read_id(&b"\xff\n"[..]), Err(Error::Encoding)));

        let longest = format!("{}\n", "a".repeat(instance::MAX_ID_LENGTH));
        assert_eq!(read_id(longest.as_bytes()).unwrap().len(), instance::MAX_ID_LENGTH);

        let endless = std::io::repeat(b'a');
        assert!(matches!(read_id(endless), Err(Error::TooLong)));
    }

    #[test]
    fn replaces_stale_socket_and_cleans_up() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("tpmlaunchd");

        // Left behind by a crashed run
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let server = ControlServer::bind(&path).unwrap();
        std::os::unix::net::UnixStream::connect(server.path()).unwrap();

        drop(server);
        assert!(!path.exists());
    }

    #[test]
    fn keeps_other_files() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("tpmlaunchd");
        std::fs::write(&path, b"").unwrap();

        assert!(ControlServer::bind(&path).is_err());
        assert!(path.exists());
    }

    #[test]
    fn launches_requested_instance() {
        let directory = tempfile::tempdir().unwrap();
        let config = crate::config::Config {
            run_directory: directory.path().to_path_buf(),
            state_directory: directory.path().to_path_buf(),
            // Fails to launch, but only after the id was accepted
            swtpm_path: directory.path().join("missing"),
            ..Default::default()
        };
        let manager = std::sync::Arc::new(Manager::new(
            config,
            crate::key_source::Unencrypted,
            crate::probe::SocketEkProbe::new(std::time::Duration::ZERO),
        ));

        let server = ControlServer::bind(directory.path().join("tpmlaunchd")).unwrap();
        let mut client = std::os::unix::net::UnixStream::connect(server.path()).unwrap();
        client.write_all(b"vm1\n").unwrap();

        let (stream, _) = server.listener.accept().unwrap();
        assert!(matches!(
            handle_connection(stream, &manager),
            Err(Error::Instance(instance::Error::Spawn { .. }))
        ));
        assert_eq!(manager.instances()[0].id, "vm1");

        let mut client = std::os::unix::net::UnixStream::connect(server.path()).unwrap();
        client.write_all(b"../escape\n").unwrap();
        let (stream, _) = server.listener.accept().unwrap();
        assert!(matches!(
            handle_connection(stream, &manager),
            Err(Error::Instance(instance::Error::InvalidId(_)))
        ));
    }
}
