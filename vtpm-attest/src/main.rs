// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use vtpm_attest::tpm::{provision_key, KeyTemplate, PersistentHandle};
use vtpm_attest::{Connect as _, TpmDevice};

/// Provision and exercise TPM attestation keys
#[derive(clap::Parser)]
struct Arguments {
    /// TPM device to open
    #[arg(long, env = "TPM_DEVICE", default_value = vtpm_attest::device::DEFAULT_DEVICE_PATH)]
    device: std::path::PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Persist a restricted signing AIK unless a matching one exists
    ProvisionAik,
    /// Seal a fresh key for software TPM state unless a sealed key exists
    ProvisionSeal {
        /// File holding the sealed key
        #[arg(long, env = "VTPM_SEALED_BLOB", default_value = vtpm_attest::sealing::DEFAULT_BLOB_PATH)]
        blob: std::path::PathBuf,
    },
    /// Print the EK and AIK as served to attestors
    Params,
    /// Run credential activation against this TPM and verify the result
    SelfTest {
        /// Path of the data to sign, random data if not given
        #[arg(short, long)]
        data: Option<std::path::PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let arguments: Arguments = clap::Parser::parse();
    let device = TpmDevice::new(arguments.device);

    if !device.is_available() {
        anyhow::bail!("No TPM at {}", device.device_path().display());
    }

    let mut tpm = device.connect()?;

    match arguments.command {
        Command::ProvisionAik => {
            let provisioned = provision_key(
                &mut tpm,
                PersistentHandle::AIK,
                &KeyTemplate::attestation_key()?,
            )?;

            println!("AIK at {}: {provisioned:?}", PersistentHandle::AIK);
        }
        Command::ProvisionSeal { blob } => {
            provision_key(
                &mut tpm,
                PersistentHandle::SRK,
                &KeyTemplate::storage_root_key()?,
            )?;

            let codec = vtpm_attest::sealing::SealedStateCodec::new(blob);
            if codec.ensure_provisioned(&mut tpm)? {
                println!("Sealed a new state key at {}", codec.blob_path().display());
            } else {
                println!("Keeping sealed state key at {}", codec.blob_path().display());
            }
        }
        Command::Params => {
            let parameters = vtpm_attest::handlers::credential_parameters(&mut tpm)?;

            serde_json::to_writer_pretty(std::io::stdout(), &parameters)?;
            println!();
        }
        Command::SelfTest { data } => {
            let data = match data {
                Some(path) => std::fs::read(path)?,
                None => {
                    let mut data = vec![0u8; 32];
                    aws_lc_rs::rand::fill(&mut data)?;
                    data
                }
            };

            provision_key(
                &mut tpm,
                PersistentHandle::AIK,
                &KeyTemplate::attestation_key()?,
            )?;

            let name = vtpm_attest::attestor::self_test(&mut tpm, &data)?;

            println!("Credential activation succeeded for AIK {name:02x?}");
        }
    }

    Ok(())
}
