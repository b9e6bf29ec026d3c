// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! TPM2 remote attestation building blocks
//!
//! Binds an attestation identity key (AIK) to the endorsement key (EK) of a hardware TPM through
//! credential activation, seals the key protecting software TPM state to PCR values, and exposes
//! the raw command channel used to talk to software TPM instances.

pub mod attestor;
pub mod credential;
pub mod device;
pub mod files;
pub mod handlers;
pub mod raw;
pub mod sealing;
pub mod tpm;
pub mod tss;
pub mod wire;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use device::TpmDevice;
pub use tpm::{Connect, PersistentHandle, Tpm};
