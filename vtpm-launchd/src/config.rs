//! Paths and limits of the launcher

use std::path::PathBuf;

pub const DEFAULT_SWTPM_PATH: &str = "/usr/bin/swtpm";
pub const DEFAULT_CONTROL_SOCKET: &str = "/run/swtpm/tpmlaunchd";
pub const DEFAULT_RUN_DIRECTORY: &str = "/run/swtpm";
pub const DEFAULT_STATE_DIRECTORY: &str = "/persist/swtpm";
pub const DEFAULT_MAX_INSTANCES: usize = 10;
pub const DEFAULT_LOG_LEVEL: u8 = 20;

#[derive(Debug, Clone)]
pub struct Config {
    /// Software TPM emulator binary
    pub swtpm_path: PathBuf,
    /// Sockets, logs, pid files, EKs and the key file
    pub run_directory: PathBuf,
    /// Parent of the per-instance state directories
    pub state_directory: PathBuf,
    /// Single-use file handing the state key to the emulator
    pub key_file: PathBuf,
    pub max_instances: usize,
    /// Log level of the emulator
    pub log_level: u8,
    /// Time given to a new emulator before its EK is read
    pub startup_delay: std::time::Duration,
    /// Time after which an emulator that does not answer is considered failed
    pub health_timeout: std::time::Duration,
}

impl Default for Config {
    fn default() -> Self {
        let run_directory = PathBuf::from(DEFAULT_RUN_DIRECTORY);

        Self {
            swtpm_path: DEFAULT_SWTPM_PATH.into(),
            key_file: run_directory.join("binkey"),
            run_directory,
            state_directory: DEFAULT_STATE_DIRECTORY.into(),
            max_instances: DEFAULT_MAX_INSTANCES,
            log_level: DEFAULT_LOG_LEVEL,
            startup_delay: std::time::Duration::from_millis(100),
            health_timeout: std::time::Duration::from_secs(5),
        }
    }
}

impl Config {
    pub fn paths(&self, id: &str) -> InstancePaths {
        let run_file = |suffix: &str| self.run_directory.join(format!("{id}{suffix}"));

        InstancePaths {
            state: self.state_directory.join(format!("tpm-state-{id}")),
            control_socket: run_file(".sock"),
            server_socket: run_file(".srv.sock"),
            pid_file: run_file(".pid"),
            log: run_file(".log"),
            endorsement_key: run_file(".ek"),
        }
    }
}

/// Files of one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstancePaths {
    pub state: PathBuf,
    /// Control channel, used by the hypervisor
    pub control_socket: PathBuf,
    /// TPM command channel, used for health checks
    pub server_socket: PathBuf,
    pub pid_file: PathBuf,
    pub log: PathBuf,
    /// Marshalled `TPMT_PUBLIC` of the instance EK, written once the instance is healthy
    pub endorsement_key: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn default_layout() {
        let paths = Config::default().paths("vm1");

        assert_eq!(paths.state, Path::new("/persist/swtpm/tpm-state-vm1"));
        assert_eq!(paths.control_socket, Path::new("/run/swtpm/vm1.sock"));
        assert_eq!(paths.server_socket, Path::new("/run/swtpm/vm1.srv.sock"));
        assert_eq!(paths.pid_file, Path::new("/run/swtpm/vm1.pid"));
        assert_eq!(paths.log, Path::new("/run/swtpm/vm1.log"));
        assert_eq!(paths.endorsement_key, Path::new("/run/swtpm/vm1.ek"));
        assert_eq!(Config::default().key_file, Path::new("/run/swtpm/binkey"));
    }
}
