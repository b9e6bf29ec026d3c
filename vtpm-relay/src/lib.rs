// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Host and guest ends of a JSON relay over vsock, serving TPM key material of the host

pub mod client;
pub mod listener;
pub mod protocol;
pub mod server;
mod tpm;
