// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Payloads and operations behind the activate-credential endpoint of the metadata server
//!
//! `GET` returns the public parts of the EK and AIK. `POST` takes a credential generated for
//! them, activates it and proves possession of the AIK by signing caller supplied data. Routing
//! and request accounting are up to the embedding server.

use crate::credential::{self, CredentialBundle};
use crate::tpm::{self, PersistentHandle, Tpm};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error(transparent)]
    Credential(#[from] credential::Error),
    #[error(transparent)]
    Tpm(#[from] tpm::Error),
}

/// Response of `GET`
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CredentialParameters {
    /// `TPMT_PUBLIC` of the EK
    #[serde(rename = "ek", with = "base64")]
    pub endorsement_key: Vec<u8>,
    /// `TPMT_PUBLIC` of the AIK
    #[serde(rename = "aikpub", with = "base64")]
    pub attestation_key: Vec<u8>,
    /// `TPM2B_NAME` of the AIK
    #[serde(rename = "aikname", with = "base64")]
    pub attestation_key_name: Vec<u8>,
}

/// Request body of `POST`
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GeneratedCredential {
    /// `TPM2B_ID_OBJECT`
    #[serde(rename = "cred", with = "base64")]
    pub credential: Vec<u8>,
    /// `TPM2B_ENCRYPTED_SECRET`
    #[serde(rename = "secret", with = "base64")]
    pub encrypted_seed: Vec<u8>,
}

impl From<&CredentialBundle> for GeneratedCredential {
    fn from(bundle: &CredentialBundle) -> Self {
        Self {
            credential: bundle.encrypted_credential().to_vec(),
            encrypted_seed: bundle.encrypted_seed().to_vec(),
        }
    }
}

/// Response of `POST`
#[derive(Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ActivatedCredential {
    #[serde(with = "base64")]
    pub secret: Vec<u8>,
    #[serde(with = "base64")]
    pub digest: Vec<u8>,
    #[serde(rename = "sig", with = "base64")]
    pub signature: Vec<u8>,
}

impl std::fmt::Debug for ActivatedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivatedCredential")
            .field("digest", &self.digest)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

impl Drop for ActivatedCredential {
    fn drop(&mut self) {
        zeroize::Zeroize::zeroize(&mut self.secret);
    }
}

/// `GET`
pub fn credential_parameters<T: Tpm + ?Sized>(tpm: &mut T) -> Result<CredentialParameters, Error> {
    let endorsement_key = tpm.read_public(PersistentHandle::EK)?;
    let attestation_key = tpm.read_public(PersistentHandle::AIK)?;

    Ok(CredentialParameters {
        endorsement_key: endorsement_key.public.into_bytes(),
        attestation_key_name: attestation_key.name.to_tpm2b(),
        attestation_key: attestation_key.public.into_bytes(),
    })
}

/// `POST`, `body` is a JSON encoded [`GeneratedCredential`]
pub fn activate_credential<T: Tpm + ?Sized>(
    tpm: &mut T,
    body: &[u8],
    data: &[u8],
) -> Result<ActivatedCredential, Error> {
    // The error message of serde_json may quote parts of the input
    let generated: GeneratedCredential = serde_json::from_slice(body).map_err(|error| {
        Error::MalformedRequest(format!(
            "invalid credential at line {} column {}",
            error.line(),
            error.column()
        ))
    })?;

    let bundle = CredentialBundle::from_wire(generated.credential, generated.encrypted_seed)?;

    let proof = credential::activate(
        tpm,
        PersistentHandle::AIK,
        PersistentHandle::EK,
        &bundle,
        data,
    )?;

    Ok(ActivatedCredential {
        secret: proof.secret.to_vec(),
        digest: proof.digest,
        signature: proof.signature,
    })
}

/// Standard base64 for binary JSON fields
mod base64 {
    use base64ct::Encoding as _;

    pub(super) fn serialize<S: serde::Serializer>(
        data: &[u8],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64ct::Base64::encode_string(data))
    }

    pub(super) fn deserialize<'de, D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<u8>, D::Error> {
        let encoded = <String as serde::Deserialize>::deserialize(deserializer)?;

        base64ct::Base64::decode_vec(&encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SoftTpm;

    #[test]
    fn parameters_wire_format() {
        let mut tpm = SoftTpm::new();
        let parameters = credential_parameters(&mut tpm).unwrap();
        let json = serde_json::to_value(&parameters).unwrap();

        let object = json.as_object().unwrap();
        assert_eq!(object.len(), 3);
        assert_eq!(
            object["ek"].as_str().unwrap(),
            <base64ct::Base64 as base64ct::Encoding>::encode_string(
                tpm.public(PersistentHandle::EK).as_bytes()
            )
        );

        assert_eq!(&parameters.attestation_key_name[..2], &[0x00, 0x22]);
        assert_eq!(
            tpm::ObjectName::from_tpm2b(&parameters.attestation_key_name).unwrap(),
            tpm::PublicKeyBlob::new(parameters.attestation_key.clone())
                .name()
                .unwrap()
        );
    }

    #[test]
    fn rejects_malformed_body() {
        let mut tpm = SoftTpm::new();

        assert!(matches!(
            activate_credential(&mut tpm, b"{\"cred\":", b"data"),
            Err(Error::MalformedRequest(_))
        ));
        assert!(matches!(
            activate_credential(&mut tpm, br#"{"cred":"!!","secret":"AAA="}"#, b"data"),
            Err(Error::MalformedRequest(_))
        ));
    }

    #[test]
    fn rejects_short_fields() {
        let mut tpm = SoftTpm::new();

        // Base64 of a single byte, too short for a TPM2B size field
        assert!(matches!(
            activate_credential(&mut tpm, br#"{"cred":"AA==","secret":"AA=="}"#, b"data"),
            Err(Error::Credential(credential::Error::Malformed(_)))
        ));
    }

    #[test]
    fn activated_credential_wire_format() {
        let activated = ActivatedCredential {
            secret: b"secret".to_vec(),
            digest: vec![0x01],
            signature: vec![0x02],
        };

        assert_eq!(
            serde_json::to_string(&activated).unwrap(),
            r#"{"secret":"c2VjcmV0","digest":"AQ==","sig":"Ag=="}"#
        );
        assert!(!format!("{activated:?}").contains("secret: "));
    }
}
