// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use vtpm_launchd::config;

/// Launch software TPM instances requested over a control socket
#[derive(clap::Parser)]
struct Arguments {
    /// Control socket taking newline-terminated instance ids
    #[arg(long, env = "VTPM_CONTROL_SOCKET", default_value = config::DEFAULT_CONTROL_SOCKET)]
    control_socket: std::path::PathBuf,
    /// Software TPM emulator binary
    #[arg(long, env = "SWTPM_PATH", default_value = config::DEFAULT_SWTPM_PATH)]
    swtpm: std::path::PathBuf,
    /// Directory of instance sockets, logs, pid files and EKs
    #[arg(long, env = "VTPM_RUN_DIR", default_value = config::DEFAULT_RUN_DIRECTORY)]
    run_dir: std::path::PathBuf,
    /// Directory of persistent instance state
    #[arg(long, env = "VTPM_STATE_DIR", default_value = config::DEFAULT_STATE_DIRECTORY)]
    state_dir: std::path::PathBuf,
    /// Sealed key encrypting instance state
    #[arg(long, env = "VTPM_SEALED_BLOB", default_value = vtpm_attest::sealing::DEFAULT_BLOB_PATH)]
    sealed_blob: std::path::PathBuf,
    /// Hardware TPM, state is not encrypted if it does not exist
    #[arg(long, env = "TPM_DEVICE", default_value = vtpm_attest::device::DEFAULT_DEVICE_PATH)]
    device: std::path::PathBuf,
    /// Maximum number of concurrently running instances
    #[arg(long, env = "VTPM_MAX_INSTANCES", default_value_t = config::DEFAULT_MAX_INSTANCES)]
    max_instances: usize,
    /// Log level of the emulator
    #[arg(long, env = "SWTPM_LOG_LEVEL", default_value_t = config::DEFAULT_LOG_LEVEL)]
    log_level: u8,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let arguments: Arguments = clap::Parser::parse();

    let config = vtpm_launchd::Config {
        swtpm_path: arguments.swtpm,
        key_file: arguments.run_dir.join("binkey"),
        run_directory: arguments.run_dir,
        state_directory: arguments.state_dir,
        max_instances: arguments.max_instances,
        log_level: arguments.log_level,
        ..Default::default()
    };

    std::fs::create_dir_all(&config.run_directory)?;

    let key_source = vtpm_launchd::key_source::SealedKeySource::new(
        vtpm_attest::TpmDevice::new(arguments.device),
        vtpm_attest::sealing::SealedStateCodec::new(arguments.sealed_blob),
    );
    let probe = vtpm_launchd::probe::SocketEkProbe::new(config.health_timeout);
    let manager = std::sync::Arc::new(vtpm_launchd::Manager::new(config, key_source, probe));

    let server = vtpm_launchd::control::ControlServer::bind(arguments.control_socket)?;

    ctrlc::set_handler({
        let manager = std::sync::Arc::clone(&manager);
        let path = server.path().to_path_buf();

        move || {
            log::info!("Terminating");

            manager.shutdown();

            if let Err(error) = std::fs::remove_file(&path) {
                log::warn!("Failed to remove {}: {error}", path.display());
            }

            std::process::exit(0);
        }
    })?;

    server.serve(manager);

    Ok(())
}
