// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Credential activation
//!
//! A credential binds a secret to the name of one key (the subject, usually the AIK) and to the
//! storage key able to decrypt its seed (the key provider, usually the EK). Only a TPM holding
//! both keys recovers the secret, see TPM2 Part 1, 24 "Credential Protection".

use crate::tpm::{
    self, HashingAlgorithm, HashingAlgorithmExtension as _, Hierarchy, ObjectName,
    PersistentHandle, Tpm,
};
use crate::wire::{strip_tpm2b, tpm2b};

/// OAEP label of the seed of a credential
pub const IDENTITY_LABEL: &[u8] = b"IDENTITY\0";
const STORAGE_LABEL: &[u8] = b"STORAGE";
const INTEGRITY_LABEL: &[u8] = b"INTEGRITY";

const AES_BLOCK_SIZE: usize = 16;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("secret must have between 1 and {max} bytes, got {len}")]
    InvalidSecretLength { len: usize, max: usize },
    #[error("unsupported symmetric block size {0}")]
    UnsupportedBlockSize(usize),
    #[error("unsupported name algorithm {0:?}")]
    UnsupportedNameAlgorithm(HashingAlgorithm),
    #[error("malformed credential: {0}")]
    Malformed(&'static str),
    #[error("credential integrity check failed")]
    Integrity,
    #[error(transparent)]
    Tpm(#[from] tpm::Error),
    #[error(transparent)]
    AwsLc(#[from] aws_lc_rs::error::Unspecified),
}

/// Encrypted credential and seed, both in their size prefixed wire form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialBundle {
    encrypted_credential: Vec<u8>,
    encrypted_seed: Vec<u8>,
}

impl CredentialBundle {
    /// Takes a `TPM2B_ID_OBJECT` and a `TPM2B_ENCRYPTED_SECRET` as sent by the attestor
    pub fn from_wire(encrypted_credential: Vec<u8>, encrypted_seed: Vec<u8>) -> Result<Self, Error> {
        strip_tpm2b(&encrypted_credential).map_err(|_| Error::Malformed("credential framing"))?;
        strip_tpm2b(&encrypted_seed).map_err(|_| Error::Malformed("seed framing"))?;

        Ok(Self {
            encrypted_credential,
            encrypted_seed,
        })
    }

    /// `TPM2B_ID_OBJECT`
    pub fn encrypted_credential(&self) -> &[u8] {
        &self.encrypted_credential
    }

    /// `TPM2B_ENCRYPTED_SECRET`
    pub fn encrypted_seed(&self) -> &[u8] {
        &self.encrypted_seed
    }

    /// Payload of the `TPM2B_ID_OBJECT`, as passed to the TPM
    pub fn id_object(&self) -> &[u8] {
        &self.encrypted_credential[crate::wire::TPM2B_SIZE_PREFIX..]
    }

    /// Payload of the `TPM2B_ENCRYPTED_SECRET`, as passed to the TPM
    pub fn seed_ciphertext(&self) -> &[u8] {
        &self.encrypted_seed[crate::wire::TPM2B_SIZE_PREFIX..]
    }
}

/// Creates a credential for `secret` that only activates against the key named `target_name`
/// in the TPM holding the private part of `target_public_key`
pub fn generate(
    target_name: &ObjectName,
    target_public_key: &aws_lc_rs::rsa::PublicEncryptingKey,
    sym_block_size: usize,
    secret: &[u8],
) -> Result<CredentialBundle, Error> {
    if !matches!(sym_block_size, 16 | 32) {
        return Err(Error::UnsupportedBlockSize(sym_block_size));
    }

    let mut seed = zeroize::Zeroizing::new(vec![0u8; sym_block_size]);
    aws_lc_rs::rand::fill(&mut seed)?;

    let id_object = protect_credential(target_name, &seed, secret)?;
    let encrypted_seed = encrypt_seed(target_public_key, &seed)?;

    Ok(CredentialBundle {
        encrypted_credential: tpm2b(&id_object)?,
        encrypted_seed: tpm2b(&encrypted_seed)?,
    })
}

fn encrypt_seed(
    public_key: &aws_lc_rs::rsa::PublicEncryptingKey,
    seed: &[u8],
) -> Result<Vec<u8>, Error> {
    let oaep_public_key = aws_lc_rs::rsa::OaepPublicEncryptingKey::new(public_key.clone())?;
    let mut ciphertext = vec![0; oaep_public_key.ciphertext_size()];

    let size = oaep_public_key
        .encrypt(
            &aws_lc_rs::rsa::OAEP_SHA256_MGF1SHA256,
            seed,
            &mut ciphertext,
            Some(IDENTITY_LABEL),
        )?
        .len();
    ciphertext.truncate(size);

    Ok(ciphertext)
}

/// Builds the unprefixed `TPM2B_ID_OBJECT` payload: `TPM2B(outer HMAC) || encIdentity`
pub(crate) fn protect_credential(
    name: &ObjectName,
    seed: &[u8],
    secret: &[u8],
) -> Result<Vec<u8>, Error> {
    let algorithm = name.algorithm();
    let digest_len = algorithm.digest_len()?;

    if secret.is_empty() || secret.len() > digest_len {
        return Err(Error::InvalidSecretLength {
            len: secret.len(),
            max: digest_len,
        });
    }

    let name = name.to_bytes();

    let symmetric_key = kdfa(algorithm, seed, STORAGE_LABEL, &name, &[], seed.len() * 8)?;
    let mut encrypted_identity = tpm2b(secret)?;
    aes_cfb_encrypt(&symmetric_key, &mut encrypted_identity)?;

    let hmac_key = kdfa(algorithm, seed, INTEGRITY_LABEL, &[], &[], digest_len * 8)?;
    let outer_hmac = hmac(algorithm, &hmac_key, &[&encrypted_identity, &name])?;

    Ok([tpm2b(&outer_hmac)?, encrypted_identity].concat())
}

/// Inverse of [`protect_credential`], as performed by `TPM2_ActivateCredential`
#[cfg(any(test, feature = "testing"))]
pub(crate) fn unprotect_credential(
    name: &ObjectName,
    seed: &[u8],
    id_object: &[u8],
) -> Result<zeroize::Zeroizing<Vec<u8>>, Error> {
    let algorithm = name.algorithm();
    let name = name.to_bytes();

    let mut reader = crate::wire::Reader::new(id_object, "TPM2B_ID_OBJECT");
    let outer_hmac = reader
        .read_sized_buffer()
        .map_err(|_| Error::Malformed("integrity"))?;
    let encrypted_identity = reader.rest();

    let hmac_key = kdfa(
        algorithm,
        seed,
        INTEGRITY_LABEL,
        &[],
        &[],
        algorithm.digest_len()? * 8,
    )?;
    let key = aws_lc_rs::hmac::Key::new(hmac_algorithm(algorithm)?, &hmac_key);
    aws_lc_rs::hmac::verify(&key, &[encrypted_identity, &name].concat(), outer_hmac)
        .map_err(|_| Error::Integrity)?;

    let symmetric_key = kdfa(algorithm, seed, STORAGE_LABEL, &name, &[], seed.len() * 8)?;
    let mut identity = zeroize::Zeroizing::new(encrypted_identity.to_vec());
    aes_cfb_decrypt(&symmetric_key, &mut identity)?;

    let secret = strip_tpm2b(&identity).map_err(|_| Error::Malformed("identity"))?;

    Ok(zeroize::Zeroizing::new(secret.to_vec()))
}

/// TPM2 Part 1, 11.4.10.2 KDFa, SP800-108 in counter mode with HMAC
pub fn kdfa(
    algorithm: HashingAlgorithm,
    key: &[u8],
    label: &[u8],
    context_u: &[u8],
    context_v: &[u8],
    bits: usize,
) -> Result<zeroize::Zeroizing<Vec<u8>>, Error> {
    let algorithm_id = match algorithm {
        HashingAlgorithm::Sha256 => aws_lc_rs::kdf::KbkdfCtrHmacAlgorithmId::Sha256,
        HashingAlgorithm::Sha384 => aws_lc_rs::kdf::KbkdfCtrHmacAlgorithmId::Sha384,
        HashingAlgorithm::Sha512 => aws_lc_rs::kdf::KbkdfCtrHmacAlgorithmId::Sha512,
        _ => return Err(Error::UnsupportedNameAlgorithm(algorithm)),
    };
    let kbkdf_algorithm = aws_lc_rs::kdf::get_kbkdf_ctr_hmac_algorithm(algorithm_id)
        .ok_or(Error::UnsupportedNameAlgorithm(algorithm))?;

    let bits_field = u32::try_from(bits)
        .map_err(|_| Error::Malformed("derived key size"))?
        .to_be_bytes();
    let info = [label, &[0u8], context_u, context_v, &bits_field].concat();

    let mut output = zeroize::Zeroizing::new(vec![0u8; bits.div_ceil(8)]);
    aws_lc_rs::kdf::kbkdf_ctr_hmac(kbkdf_algorithm, key, &info, &mut output)?;

    Ok(output)
}

fn hmac_algorithm(algorithm: HashingAlgorithm) -> Result<aws_lc_rs::hmac::Algorithm, Error> {
    match algorithm {
        HashingAlgorithm::Sha256 => Ok(aws_lc_rs::hmac::HMAC_SHA256),
        HashingAlgorithm::Sha384 => Ok(aws_lc_rs::hmac::HMAC_SHA384),
        HashingAlgorithm::Sha512 => Ok(aws_lc_rs::hmac::HMAC_SHA512),
        _ => Err(Error::UnsupportedNameAlgorithm(algorithm)),
    }
}

fn hmac(algorithm: HashingAlgorithm, key: &[u8], data: &[&[u8]]) -> Result<Vec<u8>, Error> {
    let key = aws_lc_rs::hmac::Key::new(hmac_algorithm(algorithm)?, key);
    let mut context = aws_lc_rs::hmac::Context::with_key(&key);

    for chunk in data {
        context.update(chunk);
    }

    Ok(context.sign().as_ref().to_vec())
}

fn cipher_key(key: &[u8]) -> Result<aws_lc_rs::cipher::UnboundCipherKey, Error> {
    let algorithm = match key.len() {
        16 => &aws_lc_rs::cipher::AES_128,
        32 => &aws_lc_rs::cipher::AES_256,
        size => return Err(Error::UnsupportedBlockSize(size)),
    };

    Ok(aws_lc_rs::cipher::UnboundCipherKey::new(algorithm, key)?)
}

/// AES-CFB with an all-zero IV
fn aes_cfb_encrypt(key: &[u8], data: &mut [u8]) -> Result<(), Error> {
    let key = aws_lc_rs::cipher::EncryptingKey::cfb128(cipher_key(key)?)?;
    let context = aws_lc_rs::cipher::EncryptionContext::Iv128(
        aws_lc_rs::iv::FixedLength::from([0u8; AES_BLOCK_SIZE]),
    );

    key.less_safe_encrypt(data, context)?;

    Ok(())
}

#[cfg(any(test, feature = "testing"))]
fn aes_cfb_decrypt(key: &[u8], data: &mut [u8]) -> Result<(), Error> {
    let key = aws_lc_rs::cipher::DecryptingKey::cfb128(cipher_key(key)?)?;
    let context = aws_lc_rs::cipher::DecryptionContext::Iv128(
        aws_lc_rs::iv::FixedLength::from([0u8; AES_BLOCK_SIZE]),
    );

    key.decrypt(data, context)?;

    Ok(())
}

/// Secret recovered from a credential, and the signature proving possession of the subject key
#[derive(Debug)]
pub struct ActivationProof {
    pub secret: zeroize::Zeroizing<Vec<u8>>,
    pub digest: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Recovers the secret of `bundle` with the subject key and the key provider
pub fn activate_credential<T: Tpm + ?Sized>(
    tpm: &mut T,
    subject: PersistentHandle,
    key_provider: PersistentHandle,
    bundle: &CredentialBundle,
) -> Result<zeroize::Zeroizing<Vec<u8>>, Error> {
    Ok(tpm.activate_credential(
        subject,
        key_provider,
        bundle.id_object(),
        bundle.seed_ciphertext(),
    )?)
}

/// Activates `bundle`, then has the subject key sign a TPM computed digest of `data`
pub fn activate<T: Tpm + ?Sized>(
    tpm: &mut T,
    subject: PersistentHandle,
    key_provider: PersistentHandle,
    bundle: &CredentialBundle,
    data: &[u8],
) -> Result<ActivationProof, Error> {
    let secret = activate_credential(tpm, subject, key_provider, bundle)?;

    log::debug!("Activated credential for {subject}");

    let (digest, ticket) = tpm.hash(HashingAlgorithm::Sha256, data, Hierarchy::Owner)?;
    let signature = tpm.sign(subject, &digest, &ticket)?;

    Ok(ActivationProof {
        secret,
        digest,
        signature,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SoftTpm;
    use crate::tpm::PublicExtension as _;

    fn fixed_name() -> ObjectName {
        let name =
            hex::decode("000b43ddd1f8964818c1a65b137cc1af440a796d88a9936ff9ae90edbb327f7c66eb")
                .unwrap();

        ObjectName::from_bytes(&name).unwrap()
    }

    fn fixed_seed() -> Vec<u8> {
        (0..16).collect()
    }

    #[test]
    fn kdfa_known_answer() {
        let name = fixed_name().to_bytes();

        assert_eq!(
            *kdfa(HashingAlgorithm::Sha256, &fixed_seed(), STORAGE_LABEL, &name, &[], 128).unwrap(),
            hex::decode("a32e4f152511473b2c828a8cdb44c1f5").unwrap()
        );
        assert_eq!(
            *kdfa(HashingAlgorithm::Sha256, &fixed_seed(), INTEGRITY_LABEL, &[], &[], 256).unwrap(),
            hex::decode("9d0eee85ba906b4eb5a28628d1406fc399e7de87d400e0bc42d7c44617498077")
                .unwrap()
        );
    }

    #[test]
    fn id_object_known_answer() {
        let id_object =
            protect_credential(&fixed_name(), &fixed_seed(), b"0123456789abcdef").unwrap();

        assert_eq!(
            id_object,
            hex::decode(
                "0020758f22b0ef01e6720a332c43dbe37ff459886761180bea22bcb68c6fe0495a1a\
                 1b791d94ad1e55e6ea786fc976418fa2d8bb"
            )
            .unwrap()
        );
        assert_eq!(
            *unprotect_credential(&fixed_name(), &fixed_seed(), &id_object).unwrap(),
            b"0123456789abcdef"
        );
    }

    #[test]
    fn tampered_id_object_fails_integrity() {
        let mut id_object =
            protect_credential(&fixed_name(), &fixed_seed(), b"0123456789abcdef").unwrap();
        let last = id_object.len() - 1;
        id_object[last] ^= 0x01;

        assert!(matches!(
            unprotect_credential(&fixed_name(), &fixed_seed(), &id_object),
            Err(Error::Integrity)
        ));
    }

    #[test]
    fn secret_length_is_bounded_by_name_algorithm() {
        let name = fixed_name();

        assert!(matches!(
            protect_credential(&name, &fixed_seed(), &[]),
            Err(Error::InvalidSecretLength { len: 0, max: 32 })
        ));
        assert!(matches!(
            protect_credential(&name, &fixed_seed(), &[0; 33]),
            Err(Error::InvalidSecretLength { len: 33, max: 32 })
        ));
        assert!(protect_credential(&name, &fixed_seed(), &[0; 32]).is_ok());
    }

    #[test]
    fn bundle_framing() {
        let tpm = SoftTpm::new();
        let public = tpm.public(PersistentHandle::EK).parse().unwrap();
        let key = public.public_encrypting_key().unwrap();

        let bundle = generate(&fixed_name(), &key, 16, b"secret").unwrap();

        assert_eq!(
            usize::from(u16::from_be_bytes([
                bundle.encrypted_seed()[0],
                bundle.encrypted_seed()[1]
            ])),
            256
        );
        assert_eq!(bundle.seed_ciphertext().len(), 256);
        // Outer HMAC (2 + 32) followed by the encrypted TPM2B secret (2 + 6)
        assert_eq!(bundle.id_object().len(), 42);

        assert!(matches!(
            generate(&fixed_name(), &key, 24, b"secret"),
            Err(Error::UnsupportedBlockSize(24))
        ));
    }

    #[test]
    fn bundle_rejects_inconsistent_framing() {
        assert!(CredentialBundle::from_wire(vec![0x00, 0x02, 0x01, 0x02], vec![0x00, 0x01, 0x01])
            .is_ok());
        assert!(matches!(
            CredentialBundle::from_wire(vec![0x00, 0x05, 0x01], vec![0x00, 0x01, 0x01]),
            Err(Error::Malformed(_))
        ));
        assert!(matches!(
            CredentialBundle::from_wire(vec![0x00, 0x00], vec![0x01]),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn activation_round_trip() {
        let mut tpm = SoftTpm::new();
        let aik = tpm.read_public(PersistentHandle::AIK).unwrap();
        let ek = tpm.public(PersistentHandle::EK).parse().unwrap();

        let bundle = generate(
            &aik.name,
            &ek.public_encrypting_key().unwrap(),
            ek.symmetric_block_size().unwrap(),
            b"attestation secret",
        )
        .unwrap();

        let proof = activate(
            &mut tpm,
            PersistentHandle::AIK,
            PersistentHandle::EK,
            &bundle,
            b"data to sign",
        )
        .unwrap();

        assert_eq!(*proof.secret, b"attestation secret");
        assert_eq!(proof.digest, HashingAlgorithm::Sha256.digest(b"data to sign").unwrap());
        aik.public
            .parse()
            .unwrap()
            .verify_signature(b"data to sign", &proof.signature)
            .unwrap();
    }

    #[test]
    fn credential_for_other_name_is_rejected() {
        let mut tpm = SoftTpm::new();
        let ek_blob = tpm.public(PersistentHandle::EK);
        let ek = ek_blob.parse().unwrap();

        // Generated for the EK's name, presented against the AIK
        let bundle = generate(
            &ek_blob.name().unwrap(),
            &ek.public_encrypting_key().unwrap(),
            16,
            b"attestation secret",
        )
        .unwrap();

        assert!(matches!(
            activate(
                &mut tpm,
                PersistentHandle::AIK,
                PersistentHandle::EK,
                &bundle,
                b"data"
            ),
            Err(Error::Tpm(tpm::Error::Activation(_)))
        ));
    }

    #[test]
    fn credential_for_other_endorsement_key_is_rejected() {
        let mut tpm = SoftTpm::new();
        let aik = tpm.read_public(PersistentHandle::AIK).unwrap();
        let other_ek = crate::testing::other_endorsement_key()
            .parse()
            .unwrap();

        let bundle = generate(
            &aik.name,
            &other_ek.public_encrypting_key().unwrap(),
            16,
            b"attestation secret",
        )
        .unwrap();

        assert!(matches!(
            activate_credential(&mut tpm, PersistentHandle::AIK, PersistentHandle::EK, &bundle),
            Err(Error::Tpm(tpm::Error::Activation(_)))
        ));
    }
}
