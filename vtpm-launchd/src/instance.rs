// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle of software TPM instances
//!
//! An instance moves through
//! `Requested -> DirectoryPrepared -> EncryptionConfigured | Unencrypted -> ProcessLaunched ->
//! HealthVerified -> Running`. A running instance whose emulator exits becomes `Exited`. An
//! instance failing before its emulator was started becomes `Aborted`. One failing afterwards
//! becomes `Failed`, and `Killed` once its emulator was reaped. `Aborted`, `Killed` and `Exited`
//! are final and free the `max_instances` slot of the instance, every other state holds it.

use crate::config::{Config, InstancePaths};
use crate::key_source::StateKeySource;
use crate::launcher;
use crate::probe::{self, EkProbe};

/// Longest accepted instance id
pub const MAX_ID_LENGTH: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Requested,
    DirectoryPrepared,
    EncryptionConfigured,
    Unencrypted,
    ProcessLaunched,
    HealthVerified,
    Running,
    Aborted,
    Failed,
    Killed,
    Exited,
}

impl State {
    /// Whether an instance in this state holds a slot
    ///
    /// A `Failed` emulator may still be running until it is reaped.
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Aborted | Self::Killed | Self::Exited)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualTpmInstance {
    pub id: String,
    pub paths: InstancePaths,
    pub encrypted: bool,
    pub pid: Option<u32>,
    pub state: State,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("all {0} instance slots are in use")]
    ResourceExhausted(usize),
    #[error("instance {0} exists already")]
    AlreadyExists(String),
    #[error("invalid instance id {0:?}")]
    InvalidId(String),
    #[error("failed to start emulator: {source}{}", teardown_summary(.teardown))]
    Spawn {
        source: std::io::Error,
        teardown: Vec<std::io::Error>,
    },
    #[error("health check failed: {source}{}", teardown_summary(.teardown))]
    HealthCheck {
        source: probe::Error,
        teardown: Vec<std::io::Error>,
    },
    #[error(transparent)]
    Sealing(#[from] vtpm_attest::sealing::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn teardown_summary(teardown: &[std::io::Error]) -> String {
    teardown
        .iter()
        .map(|error| format!(", teardown failed: {error}"))
        .collect()
}

/// Ids end up in file names, so they are limited to a conservative character set
pub fn validate_id(id: &str) -> Result<(), Error> {
    let valid = !id.is_empty()
        && id.len() <= MAX_ID_LENGTH
        && !id.starts_with('.')
        && id
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.'));

    if !valid {
        return Err(Error::InvalidId(id.to_string()));
    }

    Ok(())
}

#[derive(Default)]
struct Table {
    instances: std::collections::HashMap<String, VirtualTpmInstance>,
}

impl Table {
    fn live(&self) -> usize {
        self.instances
            .values()
            .filter(|instance| instance.state.is_live())
            .count()
    }

    fn update(&mut self, id: &str, update: impl FnOnce(&mut VirtualTpmInstance)) {
        if let Some(instance) = self.instances.get_mut(id) {
            update(instance);

            log::debug!("Instance {id} is {:?}", instance.state);
        }
    }
}

type SharedTable = std::sync::Arc<std::sync::Mutex<Table>>;

fn lock(table: &SharedTable) -> std::sync::MutexGuard<'_, Table> {
    table.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

pub struct Manager<K, P> {
    config: Config,
    key_source: K,
    probe: P,
    table: SharedTable,
    /// Held from writing the key file until the emulator has consumed it
    key_file: std::sync::Mutex<()>,
}

impl<K: StateKeySource, P: EkProbe> Manager<K, P> {
    pub fn new(config: Config, key_source: K, probe: P) -> Self {
        Self {
            config,
            key_source,
            probe,
            table: Default::default(),
            key_file: Default::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Launches an emulator for `id` and returns once it answers TPM commands
    pub fn create_instance(&self, id: &str) -> Result<(), Error> {
        validate_id(id)?;

        let paths = self.reserve(id)?;

        self.launch(id, &paths).inspect_err(|_| {
            lock(&self.table).update(id, |instance| {
                if instance.pid.is_none() {
                    instance.state = State::Aborted;
                }
            })
        })
    }

    /// Sends SIGTERM to every emulator still running
    pub fn shutdown(&self) {
        let pids: Vec<_> = lock(&self.table)
            .instances
            .values()
            .filter(|instance| instance.state.is_live())
            .filter_map(|instance| Some((instance.id.clone(), instance.pid?)))
            .collect();

        for (id, pid) in pids {
            log::info!("Terminating instance {id} with pid {pid}");

            let result = i32::try_from(pid)
                .map_err(|_| nix::errno::Errno::EINVAL)
                .and_then(|pid| {
                    nix::sys::signal::kill(
                        nix::unistd::Pid::from_raw(pid),
                        nix::sys::signal::Signal::SIGTERM,
                    )
                });

            if let Err(error) = result {
                log::error!("Failed to terminate instance {id} with pid {pid}: {error}");
            }
        }
    }

    /// Snapshot of all instances, ordered by id
    pub fn instances(&self) -> Vec<VirtualTpmInstance> {
        let mut instances: Vec<_> = lock(&self.table).instances.values().cloned().collect();
        instances.sort_by(|a, b| a.id.cmp(&b.id));

        instances
    }

    fn reserve(&self, id: &str) -> Result<InstancePaths, Error> {
        let mut table = lock(&self.table);

        if table
            .instances
            .get(id)
            .is_some_and(|instance| instance.state.is_live())
        {
            return Err(Error::AlreadyExists(id.to_string()));
        }

        if table.live() >= self.config.max_instances {
            return Err(Error::ResourceExhausted(self.config.max_instances));
        }

        let paths = self.config.paths(id);

        // Replaces the record of a previous instance with the same id
        table.instances.insert(
            id.to_string(),
            VirtualTpmInstance {
                id: id.to_string(),
                paths: paths.clone(),
                encrypted: false,
                pid: None,
                state: State::Requested,
            },
        );

        Ok(paths)
    }

    fn set_state(&self, id: &str, state: State) {
        lock(&self.table).update(id, |instance| instance.state = state);
    }

    fn launch(&self, id: &str, paths: &InstancePaths) -> Result<(), Error> {
        prepare_directory(&paths.state)?;
        self.set_state(id, State::DirectoryPrepared);

        let key = self.key_source.state_key()?;
        let encrypted = key.is_some();
        lock(&self.table).update(id, |instance| {
            instance.encrypted = encrypted;
            instance.state = if encrypted {
                State::EncryptionConfigured
            } else {
                State::Unencrypted
            };
        });

        // Nothing may fail between writing the key file and spawning the emulator
        remove_if_exists(&paths.server_socket)?;

        let _key_file_guard = match key {
            Some(key) => {
                let guard = self
                    .key_file
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);

                key.write_key_file(&self.config.key_file)?;

                Some(guard)
            }
            None => None,
        };

        let mut child = match launcher::command(&self.config, paths, encrypted).spawn() {
            Ok(child) => child,
            Err(source) => {
                return Err(Error::Spawn {
                    source,
                    teardown: self.remove_key_file(encrypted).err().into_iter().collect(),
                })
            }
        };

        let pid = child.id();
        log::info!("Started emulator of instance {id} with pid {pid}");

        lock(&self.table).update(id, |instance| {
            instance.pid = Some(pid);
            instance.state = State::ProcessLaunched;
        });

        std::thread::sleep(self.config.startup_delay);

        if let Err(source) = self.verify_health(paths) {
            log::error!("Instance {id} is unhealthy, stopping it");
            self.set_state(id, State::Failed);

            let mut teardown = Vec::new();
            if let Err(error) = child.kill() {
                teardown.push(error);
            }
            match child.wait() {
                Ok(_) => self.set_state(id, State::Killed),
                Err(error) => teardown.push(error),
            }
            if let Err(error) = self.remove_key_file(encrypted) {
                teardown.push(error);
            }

            return Err(Error::HealthCheck { source, teardown });
        }

        self.set_state(id, State::HealthVerified);

        // The emulator removes the key file once it read it
        if let Err(error) = self.remove_key_file(encrypted) {
            log::error!("Failed to remove key file left by instance {id}: {error}");
        }

        self.set_state(id, State::Running);

        let table = std::sync::Arc::clone(&self.table);
        let id = id.to_string();
        std::thread::spawn(move || supervise(table, id, child));

        Ok(())
    }

    fn verify_health(&self, paths: &InstancePaths) -> Result<(), probe::Error> {
        let endorsement_key = self.probe.read_endorsement_key(&paths.server_socket)?;

        vtpm_attest::files::write_atomic(
            &paths.endorsement_key,
            endorsement_key.as_bytes(),
            0o644,
        )?;

        Ok(())
    }

    fn remove_key_file(&self, encrypted: bool) -> std::io::Result<()> {
        if !encrypted {
            return Ok(());
        }

        remove_if_exists(&self.config.key_file)
    }
}

/// Waits for the emulator to exit, which frees the slot of its instance
fn supervise(table: SharedTable, id: String, mut child: std::process::Child) {
    match child.wait() {
        Ok(status) => log::info!("Emulator of instance {id} exited with {status}"),
        Err(error) => log::error!("Failed to wait for emulator of instance {id}: {error}"),
    }

    lock(&table).update(&id, |instance| instance.state = State::Exited);
}

fn prepare_directory(path: &std::path::Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)?;

    std::fs::set_permissions(
        path,
        std::os::unix::fs::PermissionsExt::from_mode(0o755),
    )
}

fn remove_if_exists(path: &std::path::Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(error) if error.kind() != std::io::ErrorKind::NotFound => Err(error),
        _ => Ok(()),
    }
}
