// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Launcher of per-guest software TPM instances
//!
//! Instances are requested over a control socket. Their state is encrypted with a key sealed to
//! the PCRs of the hardware TPM whenever one is present.

pub mod config;
pub mod control;
pub mod instance;
pub mod key_source;
pub mod launcher;
pub mod probe;

pub use config::Config;
pub use instance::Manager;
