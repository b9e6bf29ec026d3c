// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

fn main() {
    // Policy session handling and the response codes mapped by the TSS backend differ between
    // major versions of the TPM2 Software Stack
    let tss_version_requirement =
        semver::VersionReq::parse(">=3.0.0").expect("Failed to parse version requirement");

    let tss_version_string =
        std::env::var("DEP_TSS2_ESYS_VERSION").expect("DEP_TSS2_ESYS_VERSION not set");
    let tss_version =
        semver::Version::parse(&tss_version_string).expect("Failed to parse DEP_TSS2_ESYS_VERSION");

    assert!(
        tss_version_requirement.matches(&tss_version),
        "TPM2 Software Stack (TSS) version {tss_version} not supported, version requirement: {tss_version_requirement}",
    );

    println!("cargo:rerun-if-env-changed=DEP_TSS2_ESYS_VERSION");

    // Allow static linking
    println!("cargo:rustc-link-arg=-ltss2-tcti-device");
}
