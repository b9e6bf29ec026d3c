//! Keys encrypting emulator state

use vtpm_attest::sealing::{SealedStateCodec, SealedStateKey};
use vtpm_attest::tpm::Connect;

pub trait StateKeySource: Send + Sync {
    /// Key for one launch, `None` if state is kept unencrypted
    fn state_key(&self) -> Result<Option<SealedStateKey>, vtpm_attest::sealing::Error>;
}

/// Unseals the key sealed to the PCRs of the hardware TPM, if there is one
pub struct SealedKeySource<C> {
    connect: C,
    codec: SealedStateCodec,
}

impl<C: Connect> SealedKeySource<C> {
    pub fn new(connect: C, codec: SealedStateCodec) -> Self {
        Self { connect, codec }
    }
}

impl<C: Connect> StateKeySource for SealedKeySource<C> {
    fn state_key(&self) -> Result<Option<SealedStateKey>, vtpm_attest::sealing::Error> {
        if !self.connect.is_available() {
            log::warn!("No hardware TPM, emulator state is not encrypted");

            return Ok(None);
        }

        let mut tpm = self.connect.connect()?;

        self.codec.unseal(&mut tpm).map(Some)
    }
}

/// Always launches unencrypted
#[derive(Debug, Clone, Copy, Default)]
pub struct Unencrypted;

impl StateKeySource for Unencrypted {
    fn state_key(&self) -> Result<Option<SealedStateKey>, vtpm_attest::sealing::Error> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vtpm_attest::testing::SoftTpm;

    #[test]
    fn unseals_with_hardware_tpm() {
        let directory = tempfile::tempdir().unwrap();
        let codec = SealedStateCodec::new(directory.path().join("sealed"));
        let mut tpm = SoftTpm::new();
        codec.ensure_provisioned(&mut tpm).unwrap();
        let expected = codec.unseal(&mut tpm).unwrap();

        let source = SealedKeySource::new(tpm.clone(), codec);

        assert_eq!(
            source.state_key().unwrap().unwrap().as_bytes(),
            expected.as_bytes()
        );
        assert_eq!(tpm.connections(), 1);
    }

    #[test]
    fn unencrypted_without_hardware_tpm() {
        let directory = tempfile::tempdir().unwrap();
        let tpm = SoftTpm::new();
        tpm.set_available(false);

        let source = SealedKeySource::new(
            tpm.clone(),
            SealedStateCodec::new(directory.path().join("sealed")),
        );

        assert!(source.state_key().unwrap().is_none());
        assert_eq!(tpm.connections(), 0);
    }

    #[test]
    fn missing_blob_is_an_error() {
        let directory = tempfile::tempdir().unwrap();
        let source = SealedKeySource::new(
            SoftTpm::new(),
            SealedStateCodec::new(directory.path().join("sealed")),
        );

        assert!(matches!(
            source.state_key(),
            Err(vtpm_attest::sealing::Error::Missing(_))
        ));
    }
}
