// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub(super) struct Pcr {
    algorithm: &'static aws_lc_rs::digest::Algorithm,
    value: Vec<u8>,
}

impl Pcr {
    /// PCR in its reset state
    pub(super) fn new(algorithm: &'static aws_lc_rs::digest::Algorithm) -> Self {
        Self {
            algorithm,
            value: vec![0u8; algorithm.output_len],
        }
    }

    pub(super) fn extend(&mut self, measurement: &[u8]) -> &[u8] {
        let measurement = aws_lc_rs::digest::digest(self.algorithm, measurement);

        self.value = aws_lc_rs::digest::digest(
            self.algorithm,
            &[self.value.as_slice(), measurement.as_ref()].concat(),
        )
        .as_ref()
        .to_vec();

        &self.value
    }

    pub(super) fn value(&self) -> &[u8] {
        &self.value
    }
}
