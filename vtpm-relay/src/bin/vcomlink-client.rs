// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use vtpm_relay::listener::{self, VsockStream};

/// Query the host from inside a guest
#[derive(clap::Parser)]
struct Arguments {
    /// Get the TPM endorsement key of the host
    #[arg(long)]
    tpmek: bool,
    /// Write the marshalled TPMT_PUBLIC to this path instead of printing it as base64
    #[arg(short, long, requires = "tpmek")]
    output: Option<std::path::PathBuf>,
    /// vsock CID of the host
    #[arg(long, default_value_t = listener::VMADDR_CID_HOST)]
    cid: u32,
    /// vsock port of the host
    #[arg(long, env = "VCOMLINK_PORT", default_value_t = vtpm_relay::protocol::HOST_PORT)]
    port: u32,
    /// Connect to a TCP address instead of vsock
    #[arg(long)]
    tcp: Option<std::net::SocketAddr>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let arguments: Arguments = clap::Parser::parse();

    if !arguments.tpmek {
        anyhow::bail!("No request specified");
    }

    let endorsement_key = match arguments.tcp {
        Some(address) => vtpm_relay::client::request_endorsement_key(
            std::net::TcpStream::connect(address)?,
        )?,
        None => vtpm_relay::client::request_endorsement_key(VsockStream::connect(
            arguments.cid,
            arguments.port,
        )?)?,
    };

    match arguments.output {
        Some(path) => std::fs::write(path, &endorsement_key)?,
        None => println!(
            "{}",
            <base64ct::Base64 as base64ct::Encoding>::encode_string(&endorsement_key)
        ),
    }

    Ok(())
}
