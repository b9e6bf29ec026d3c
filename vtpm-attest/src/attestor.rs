// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Verifier side of credential activation
//!
//! The attestor checks that the AIK it was given is a restricted signing key whose name matches
//! its public area, challenges the TPM with a credential for that name under the EK, and accepts
//! the answer only if the recovered secret and the AIK signature both check out.

use crate::credential::{self, CredentialBundle};
use crate::handlers::{self, ActivatedCredential, CredentialParameters, GeneratedCredential};
use crate::tpm::{
    self, HashingAlgorithm, HashingAlgorithmExtension as _, ObjectName, Public,
    PublicExtension as _, PublicKeyBlob, Tpm,
};

/// Size of the challenge secret, the digest size of the AIK name algorithm
pub const DEFAULT_SECRET_SIZE: usize = 32;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("AIK name does not match its public area")]
    NameMismatch,
    #[error("AIK is not a restricted signing key, attributes {0:?}")]
    NotRestrictedSigningKey(tpm::ObjectAttributes),
    #[error("activated secret does not match the challenge")]
    SecretMismatch,
    #[error("signed digest does not match the data")]
    DigestMismatch,
    #[error("AIK signature is invalid")]
    InvalidSignature,
    #[error(transparent)]
    Credential(#[from] credential::Error),
    #[error(transparent)]
    Handlers(#[from] handlers::Error),
    #[error(transparent)]
    Tpm(#[from] tpm::Error),
    #[error(transparent)]
    AwsLc(#[from] aws_lc_rs::error::Unspecified),
}

/// EK and AIK of a TPM after the AIK passed its checks
#[derive(Debug, Clone)]
pub struct VerifiedKeys {
    endorsement_key: Public,
    attestation_key: Public,
    attestation_key_name: ObjectName,
}

/// Credential sent to the TPM together with the secret it protects
pub struct Challenge {
    secret: zeroize::Zeroizing<Vec<u8>>,
    bundle: CredentialBundle,
}

impl Challenge {
    pub fn bundle(&self) -> &CredentialBundle {
        &self.bundle
    }
}

impl VerifiedKeys {
    pub fn verify(parameters: &CredentialParameters) -> Result<Self, Error> {
        let attestation_key = PublicKeyBlob::new(parameters.attestation_key.clone());
        let attestation_key_name = ObjectName::from_tpm2b(&parameters.attestation_key_name)?;

        if attestation_key.name()? != attestation_key_name {
            return Err(Error::NameMismatch);
        }

        let attestation_key = attestation_key.parse()?;
        if !attestation_key.is_restricted_signing_key() {
            return Err(Error::NotRestrictedSigningKey(
                attestation_key.object_attributes(),
            ));
        }

        Ok(Self {
            endorsement_key: PublicKeyBlob::new(parameters.endorsement_key.clone()).parse()?,
            attestation_key,
            attestation_key_name,
        })
    }

    pub fn attestation_key_name(&self) -> &ObjectName {
        &self.attestation_key_name
    }

    /// Fresh credential for the AIK, only activatable by the TPM holding the EK
    pub fn challenge(&self, secret_size: usize) -> Result<Challenge, Error> {
        let mut secret = zeroize::Zeroizing::new(vec![0u8; secret_size]);
        aws_lc_rs::rand::fill(&mut secret)?;

        let bundle = credential::generate(
            &self.attestation_key_name,
            &self.endorsement_key.public_encrypting_key()?,
            self.endorsement_key.symmetric_block_size()?,
            &secret,
        )?;

        Ok(Challenge { secret, bundle })
    }

    /// Accepts the answer to `challenge` if it proves possession of both keys
    pub fn check_answer(
        &self,
        challenge: &Challenge,
        answer: &ActivatedCredential,
        signed_data: &[u8],
    ) -> Result<(), Error> {
        aws_lc_rs::constant_time::verify_slices_are_equal(&challenge.secret, &answer.secret)
            .map_err(|_| Error::SecretMismatch)?;

        if answer.digest != HashingAlgorithm::Sha256.digest(signed_data)? {
            return Err(Error::DigestMismatch);
        }

        self.attestation_key
            .verify_signature(signed_data, &answer.signature)
            .map_err(|_| Error::InvalidSignature)
    }
}

/// Runs the whole protocol against `tpm`, including the JSON encoding of both exchanges
pub fn self_test<T: Tpm + ?Sized>(tpm: &mut T, signed_data: &[u8]) -> Result<ObjectName, Error> {
    let parameters = handlers::credential_parameters(tpm)?;
    let keys = VerifiedKeys::verify(&parameters)?;

    log::info!("AIK name {:02x?} matches its public area", keys.attestation_key_name.digest());

    let challenge = keys.challenge(DEFAULT_SECRET_SIZE)?;
    let request = serde_json::to_vec(&GeneratedCredential::from(challenge.bundle()))
        .map_err(|error| handlers::Error::MalformedRequest(error.to_string()))?;

    let answer = handlers::activate_credential(tpm, &request, signed_data)?;
    keys.check_answer(&challenge, &answer, signed_data)?;

    log::info!("Credential activated and AIK signature verified");

    Ok(keys.attestation_key_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SoftTpm;
    use crate::tpm::PersistentHandle;

    #[test]
    fn full_round_trip() {
        let mut tpm = SoftTpm::new();

        let name = self_test(&mut tpm, b"some data to sign").unwrap();

        assert_eq!(name, tpm.public(PersistentHandle::AIK).name().unwrap());
    }

    #[test]
    fn rejects_name_of_other_key() {
        let mut parameters = handlers::credential_parameters(&mut SoftTpm::new()).unwrap();
        let endorsement_key_name = PublicKeyBlob::new(parameters.endorsement_key.clone())
            .name()
            .unwrap();
        parameters.attestation_key_name = endorsement_key_name.to_tpm2b();

        assert!(matches!(
            VerifiedKeys::verify(&parameters),
            Err(Error::NameMismatch)
        ));
    }

    #[test]
    fn rejects_unrestricted_key() {
        let mut parameters = handlers::credential_parameters(&mut SoftTpm::new()).unwrap();
        // Present the EK, a decryption key, as AIK
        parameters.attestation_key = parameters.endorsement_key.clone();
        parameters.attestation_key_name = PublicKeyBlob::new(parameters.endorsement_key.clone())
            .name()
            .unwrap()
            .to_tpm2b();

        assert!(matches!(
            VerifiedKeys::verify(&parameters),
            Err(Error::NotRestrictedSigningKey(_))
        ));
    }

    #[test]
    fn rejects_wrong_answers() {
        let mut tpm = SoftTpm::new();
        let keys = VerifiedKeys::verify(&handlers::credential_parameters(&mut tpm).unwrap()).unwrap();
        let challenge = keys.challenge(DEFAULT_SECRET_SIZE).unwrap();
        let request = serde_json::to_vec(&GeneratedCredential::from(challenge.bundle())).unwrap();

        let answer = handlers::activate_credential(&mut tpm, &request, b"data").unwrap();
        keys.check_answer(&challenge, &answer, b"data").unwrap();

        assert!(matches!(
            keys.check_answer(&challenge, &answer, b"other data"),
            Err(Error::DigestMismatch)
        ));

        let mut forged = answer.clone();
        forged.secret[0] ^= 0x01;
        assert!(matches!(
            keys.check_answer(&challenge, &forged, b"data"),
            Err(Error::SecretMismatch)
        ));

        let mut forged = answer.clone();
        let last = forged.signature.len() - 1;
        forged.signature[last] ^= 0x01;
        assert!(matches!(
            keys.check_answer(&challenge, &forged, b"data"),
            Err(Error::InvalidSignature)
        ));
    }

    #[test]
    fn answer_of_other_tpm_fails_activation() {
        let mut tpm = SoftTpm::new();
        let mut parameters = handlers::credential_parameters(&mut tpm).unwrap();
        parameters.endorsement_key = crate::testing::other_endorsement_key().into_bytes();

        let keys = VerifiedKeys::verify(&parameters).unwrap();
        let challenge = keys.challenge(DEFAULT_SECRET_SIZE).unwrap();
        let request = serde_json::to_vec(&GeneratedCredential::from(challenge.bundle())).unwrap();

        assert!(matches!(
            handlers::activate_credential(&mut tpm, &request, b"data"),
            Err(handlers::Error::Credential(credential::Error::Tpm(
                tpm::Error::Activation(_)
            )))
        ));
    }
}
