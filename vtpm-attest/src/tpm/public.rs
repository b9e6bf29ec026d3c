// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Key operations on the public area of a TPM object

use super::Error;
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::structures::{Public, PublicKeyRsa, PublicRsaParameters, RsaScheme};

pub trait PublicExtension {
    fn rsa(&self) -> Result<(&PublicRsaParameters, &PublicKeyRsa), Error>;

    /// A key the TPM only uses to sign digests it computed itself
    fn is_restricted_signing_key(&self) -> bool;

    /// Size of the credential seed for a storage key with this public area
    fn symmetric_block_size(&self) -> Result<usize, Error>;

    /// RSA-OAEP key for encrypting secrets to this key
    fn public_encrypting_key(&self) -> Result<aws_lc_rs::rsa::PublicEncryptingKey, Error>;

    /// Verifies an RSASSA-PKCS1-v1_5 signature made with this key over `message`
    fn verify_signature(&self, message: &[u8], signature: &[u8]) -> Result<(), Error>;
}

impl PublicExtension for Public {
    fn rsa(&self) -> Result<(&PublicRsaParameters, &PublicKeyRsa), Error> {
        match self {
            Public::Rsa {
                parameters, unique, ..
            } => Ok((parameters, unique)),
            _ => Err(Error::Protocol("object is not an RSA key".into())),
        }
    }

    fn is_restricted_signing_key(&self) -> bool {
        let attributes = self.object_attributes();

        attributes.restricted() && attributes.sign_encrypt() && !attributes.decrypt()
    }

    fn symmetric_block_size(&self) -> Result<usize, Error> {
        let (parameters, _) = self.rsa()?;

        match parameters.symmetric_definition_object() {
            tss_esapi::structures::SymmetricDefinitionObject::Aes { key_bits, .. } => {
                Ok(match key_bits {
                    tss_esapi::interface_types::key_bits::AesKeyBits::Aes128 => 16,
                    tss_esapi::interface_types::key_bits::AesKeyBits::Aes192 => 24,
                    tss_esapi::interface_types::key_bits::AesKeyBits::Aes256 => 32,
                })
            }
            symmetric => Err(Error::Protocol(format!(
                "storage key with unsupported symmetric definition {symmetric:?}"
            ))),
        }
    }

    fn public_encrypting_key(&self) -> Result<aws_lc_rs::rsa::PublicEncryptingKey, Error> {
        self.rsa()?;

        Ok(aws_lc_rs::rsa::PublicEncryptingKey::from_der(
            &picky_asn1_der::to_vec(&picky_asn1_x509::SubjectPublicKeyInfo::try_from(
                self.clone(),
            )?)?,
        )?)
    }

    fn verify_signature(&self, message: &[u8], signature: &[u8]) -> Result<(), Error> {
        let (parameters, unique) = self.rsa()?;

        let algorithm: &aws_lc_rs::signature::RsaParameters = match parameters.rsa_scheme() {
            RsaScheme::RsaSsa(hash_scheme) => match hash_scheme.hashing_algorithm() {
                HashingAlgorithm::Sha256 => &aws_lc_rs::signature::RSA_PKCS1_2048_8192_SHA256,
                HashingAlgorithm::Sha384 => &aws_lc_rs::signature::RSA_PKCS1_2048_8192_SHA384,
                HashingAlgorithm::Sha512 => &aws_lc_rs::signature::RSA_PKCS1_2048_8192_SHA512,
                algorithm => {
                    return Err(Error::Protocol(format!(
                        "{algorithm:?} signatures are not accepted"
                    )))
                }
            },
            _ => return Err(Error::Protocol("key has no RSASSA signing scheme".into())),
        };

        // A zero exponent stands for the default one
        let exponent = match parameters.exponent().value() {
            0 => 65537u32,
            exponent => exponent,
        }
        .to_be_bytes();

        aws_lc_rs::signature::RsaPublicKeyComponents {
            n: trim_leading_zeros(unique.value()),
            e: trim_leading_zeros(&exponent),
        }
        .verify(algorithm, message, signature)
        .map_err(|_| Error::Protocol("signature verification failed".into()))
    }
}

fn trim_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|&byte| byte != 0)
        .unwrap_or(bytes.len());

    &bytes[start..]
}
