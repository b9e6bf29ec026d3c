// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Key protecting the persistent state of software TPM instances
//!
//! The key is sealed to the hardware TPM under a PCR policy and stored as a blob on disk. It is
//! unsealed for every launch of an encrypted instance and handed to the emulator through a
//! single-use key file.

use crate::tpm::{self, PcrPolicy, PersistentHandle, SealedBlob, Tpm};

/// swtpm `aes-256-cbc` key size
pub const STATE_KEY_SIZE: usize = 256 / 8;

pub const DEFAULT_BLOB_PATH: &str = "/persist/vtpm/sealed-state.key";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no sealed state key at {0}")]
    Missing(std::path::PathBuf),
    #[error("unsealed state key has {0} bytes")]
    KeySize(usize),
    #[error(transparent)]
    Tpm(#[from] tpm::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    AwsLc(#[from] aws_lc_rs::error::Unspecified),
}

impl Error {
    /// The platform state differs from the one the key was sealed to
    pub fn is_policy_failure(&self) -> bool {
        matches!(self, Self::Tpm(tpm::Error::Policy))
    }
}

pub struct SealedStateKey(zeroize::Zeroizing<[u8; STATE_KEY_SIZE]>);

impl SealedStateKey {
    pub fn generate() -> Result<Self, Error> {
        let mut key = zeroize::Zeroizing::new([0u8; STATE_KEY_SIZE]);

        aws_lc_rs::rand::fill(key.as_mut())?;

        Ok(Self(key))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        let key = <[u8; STATE_KEY_SIZE]>::try_from(data).map_err(|_| Error::KeySize(data.len()))?;

        Ok(Self(zeroize::Zeroizing::new(key)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_ref()
    }

    /// Writes the raw key to a file only the owner can read
    ///
    /// The file is meant to be consumed and removed by the emulator. Removing it when the
    /// emulator does not is up to the caller.
    pub fn write_key_file(&self, path: &std::path::Path) -> Result<(), Error> {
        crate::files::write_atomic(path, self.as_bytes(), 0o600)?;

        Ok(())
    }
}

impl std::fmt::Debug for SealedStateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SealedStateKey(..)")
    }
}

#[derive(Debug, Clone)]
pub struct SealedStateCodec {
    parent: PersistentHandle,
    pcr_policy: PcrPolicy,
    blob_path: std::path::PathBuf,
}

impl SealedStateCodec {
    /// Seals under the storage root key to the default PCR policy
    pub fn new(blob_path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            parent: PersistentHandle::SRK,
            pcr_policy: PcrPolicy::default(),
            blob_path: blob_path.into(),
        }
    }

    pub fn with_parent(mut self, parent: PersistentHandle) -> Self {
        self.parent = parent;
        self
    }

    pub fn with_pcr_policy(mut self, pcr_policy: PcrPolicy) -> Self {
        self.pcr_policy = pcr_policy;
        self
    }

    pub fn blob_path(&self) -> &std::path::Path {
        &self.blob_path
    }

    pub fn seal<T: Tpm + ?Sized>(&self, tpm: &mut T, key: &SealedStateKey) -> Result<(), Error> {
        let blob = tpm.seal(self.parent, key.as_bytes(), &self.pcr_policy)?;

        crate::files::write_atomic(&self.blob_path, &blob.to_bytes()?, 0o600)?;

        log::info!(
            "Sealed state key to PCRs {:?} at {}",
            self.pcr_policy.slots,
            self.blob_path.display()
        );

        Ok(())
    }

    /// Seals a fresh key unless a blob exists already, returns whether a key was sealed
    pub fn ensure_provisioned<T: Tpm + ?Sized>(&self, tpm: &mut T) -> Result<bool, Error> {
        if self.blob_path.try_exists()? {
            log::debug!("Sealed state key exists at {}", self.blob_path.display());

            return Ok(false);
        }

        self.seal(tpm, &SealedStateKey::generate()?)?;

        Ok(true)
    }

    pub fn unseal<T: Tpm + ?Sized>(&self, tpm: &mut T) -> Result<SealedStateKey, Error> {
        let data = match std::fs::read(&self.blob_path) {
            Ok(data) => data,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::Missing(self.blob_path.clone()))
            }
            Err(error) => return Err(error.into()),
        };

        let blob = SealedBlob::from_bytes(&data)?;
        let key = tpm.unseal(self.parent, &blob, &self.pcr_policy)?;

        SealedStateKey::from_bytes(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SoftTpm;
    use std::os::unix::fs::PermissionsExt as _;

    fn codec(directory: &tempfile::TempDir) -> SealedStateCodec {
        SealedStateCodec::new(directory.path().join("sealed-state.key"))
    }

    #[test]
    fn unseals_what_was_sealed() {
        let directory = tempfile::tempdir().unwrap();
        let codec = codec(&directory);
        let mut tpm = SoftTpm::new();
        let key = SealedStateKey::generate().unwrap();

        codec.seal(&mut tpm, &key).unwrap();

        assert_eq!(codec.unseal(&mut tpm).unwrap().as_bytes(), key.as_bytes());
    }

    #[test]
    fn changed_pcr_fails_policy() {
        let directory = tempfile::tempdir().unwrap();
        let codec = codec(&directory);
        let mut tpm = SoftTpm::new();

        codec.ensure_provisioned(&mut tpm).unwrap();
        tpm.extend_pcr(7, b"secure boot disabled");

        let error = codec.unseal(&mut tpm).unwrap_err();

        assert!(error.is_policy_failure(), "{error}");
    }

    #[test]
    fn pcr_outside_policy_does_not_matter() {
        let directory = tempfile::tempdir().unwrap();
        let codec = codec(&directory);
        let mut tpm = SoftTpm::new();

        codec.ensure_provisioned(&mut tpm).unwrap();
        tpm.extend_pcr(5, b"boot partition table");

        codec.unseal(&mut tpm).unwrap();
    }

    #[test]
    fn provisioning_keeps_existing_blob() {
        let directory = tempfile::tempdir().unwrap();
        let codec = codec(&directory);
        let mut tpm = SoftTpm::new();

        assert!(codec.ensure_provisioned(&mut tpm).unwrap());

        let key = codec.unseal(&mut tpm).unwrap();

        assert!(!codec.ensure_provisioned(&mut tpm).unwrap());
        assert_eq!(codec.unseal(&mut tpm).unwrap().as_bytes(), key.as_bytes());
    }

    #[test]
    fn missing_blob() {
        let directory = tempfile::tempdir().unwrap();

        assert!(matches!(
            codec(&directory).unseal(&mut SoftTpm::new()),
            Err(Error::Missing(_))
        ));
    }

    #[test]
    fn key_file_is_private() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("binkey");
        let key = SealedStateKey::generate().unwrap();

        key.write_key_file(&path).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), key.as_bytes());
        assert_eq!(
            std::fs::metadata(&path).unwrap().permissions().mode() & 0o777,
            0o600
        );
        assert_eq!(format!("{key:?}"), "SealedStateKey(..)");
    }
}
