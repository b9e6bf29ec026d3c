// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use vtpm_relay::listener::{self, VsockListener};

/// Serve TPM key material of the host to guests
#[derive(clap::Parser)]
struct Arguments {
    /// vsock port to listen on
    #[arg(long, env = "VCOMLINK_PORT", default_value_t = vtpm_relay::protocol::HOST_PORT)]
    port: u32,
    /// vsock CID to bind
    #[arg(long, default_value_t = listener::VMADDR_CID_HOST)]
    cid: u32,
    /// Listen on a TCP address instead of vsock
    #[arg(long, conflicts_with = "unix")]
    tcp: Option<std::net::SocketAddr>,
    /// Listen on a Unix socket instead of vsock
    #[arg(long)]
    unix: Option<std::path::PathBuf>,
    /// Hardware TPM
    #[arg(long, env = "TPM_DEVICE", default_value = vtpm_attest::device::DEFAULT_DEVICE_PATH)]
    device: std::path::PathBuf,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let arguments: Arguments = clap::Parser::parse();
    let device = std::sync::Arc::new(vtpm_attest::TpmDevice::new(arguments.device));

    if let Some(address) = arguments.tcp {
        log::info!("Listening on {address}");

        vtpm_relay::server::serve(std::net::TcpListener::bind(address)?, device);
    } else if let Some(path) = arguments.unix {
        log::info!("Listening on {}", path.display());

        vtpm_relay::server::serve(std::os::unix::net::UnixListener::bind(path)?, device);
    } else {
        vtpm_relay::server::serve(VsockListener::bind(arguments.cid, arguments.port)?, device);
    }

    Ok(())
}
