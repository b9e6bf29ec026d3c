// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Software TPM used to test code written against [`crate::tpm::Tpm`]
//!
//! The simulator starts with an EK, a storage root key and an AIK persisted at their well-known
//! handles. Keys are fixed RSA-2048 test keys, so activation, signing and signature verification
//! use real cryptography. Sealing binds data to a snapshot of the simulated SHA-256 PCR bank.

mod pcr;

use crate::credential;
use crate::tpm::{
    Connect, Error, HashTicket, HashingAlgorithm, HashingAlgorithmExtension as _, Hierarchy,
    KeyTemplate, Object, PcrPolicy, PersistentHandle, Public, PublicExtension as _, PublicKeyBlob,
    ReadPublic, SealedBlob, Tpm, TransientHandle,
};
use tss_esapi::traits::Marshall as _;

const EK_PKCS8: &[u8] = include_bytes!("ek.pk8");
const EK_MODULUS: &[u8] = include_bytes!("ek.modulus");
const AIK_PKCS8: &[u8] = include_bytes!("aik.pk8");
const AIK_MODULUS: &[u8] = include_bytes!("aik.modulus");
const OTHER_PKCS8: &[u8] = include_bytes!("other_ek.pk8");
const OTHER_MODULUS: &[u8] = include_bytes!("other_ek.modulus");

const TPM_ST_HASHCHECK: u16 = 0x8024;
const TPM_RH_OWNER: u32 = 0x4000_0001;
const TPM_RH_ENDORSEMENT: u32 = 0x4000_000B;
const TPM_RH_NULL: u32 = 0x4000_0007;
const FIRST_TRANSIENT: u32 = 0x8000_0000;
const PCR_COUNT: u8 = PcrPolicy::MAX_SLOT + 1;

#[derive(Clone)]
struct SoftObject {
    public: PublicKeyBlob,
    pkcs8: &'static [u8],
}

impl SoftObject {
    fn new(template: &KeyTemplate, modulus: &[u8], pkcs8: &'static [u8]) -> Self {
        let Public::Rsa {
            object_attributes,
            name_hashing_algorithm,
            auth_policy,
            parameters,
            ..
        } = template.public().clone()
        else {
            panic!("simulated keys are RSA keys");
        };

        let public = Public::Rsa {
            object_attributes,
            name_hashing_algorithm,
            auth_policy,
            parameters,
            unique: tss_esapi::structures::PublicKeyRsa::try_from(modulus.to_vec())
                .expect("modulus fits a 2048 bit key"),
        };

        Self {
            public: PublicKeyBlob::new(
                public
                    .marshall()
                    .expect("template marshals to a valid public area"),
            ),
            pkcs8,
        }
    }

    fn signing_key(&self) -> Result<aws_lc_rs::signature::RsaKeyPair, Error> {
        aws_lc_rs::signature::RsaKeyPair::from_pkcs8(self.pkcs8)
            .map_err(|error| Error::Protocol(error.to_string()))
    }
}

struct State {
    available: bool,
    persistent: std::collections::BTreeMap<PersistentHandle, SoftObject>,
    transient: std::collections::BTreeMap<u32, SoftObject>,
    next_transient: u32,
    primary_keys_created: usize,
    connections: usize,
    pcrs: Vec<pcr::Pcr>,
    /// Data hashed by `hash`, keyed by digest, so that `sign` can produce a real signature
    hashed: std::collections::HashMap<Vec<u8>, Vec<u8>>,
}

impl State {
    fn persistent(&self, handle: PersistentHandle) -> Result<&SoftObject, Error> {
        self.persistent.get(&handle).ok_or(Error::NotFound(handle))
    }

    fn pcr_digest(&self, pcrs: &PcrPolicy) -> Result<Vec<u8>, Error> {
        if pcrs.bank != HashingAlgorithm::Sha256 {
            return Err(Error::Protocol(format!(
                "simulated PCR bank is SHA-256, not {:?}",
                pcrs.bank
            )));
        }

        let values = pcrs
            .slots
            .iter()
            .map(|&slot| self.pcrs[usize::from(slot)].value())
            .collect::<Vec<_>>()
            .concat();

        HashingAlgorithm::Sha256.digest(&values)
    }
}

/// Cloning yields another transport to the same simulated TPM
#[derive(Clone)]
pub struct SoftTpm {
    state: std::sync::Arc<std::sync::Mutex<State>>,
}

impl Default for SoftTpm {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftTpm {
    pub fn new() -> Self {
        let persistent = [
            (
                PersistentHandle::EK,
                SoftObject::new(&template(KeyTemplate::endorsement_key), EK_MODULUS, EK_PKCS8),
            ),
            (
                PersistentHandle::SRK,
                SoftObject::new(
                    &template(KeyTemplate::storage_root_key),
                    OTHER_MODULUS,
                    OTHER_PKCS8,
                ),
            ),
            (
                PersistentHandle::AIK,
                SoftObject::new(&template(KeyTemplate::attestation_key), AIK_MODULUS, AIK_PKCS8),
            ),
        ]
        .into_iter()
        .collect();

        Self {
            state: std::sync::Arc::new(std::sync::Mutex::new(State {
                available: true,
                persistent,
                transient: Default::default(),
                next_transient: FIRST_TRANSIENT,
                primary_keys_created: 0,
                connections: 0,
                pcrs: (0..PCR_COUNT)
                    .map(|_| pcr::Pcr::new(&aws_lc_rs::digest::SHA256))
                    .collect(),
                hashed: Default::default(),
            })),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Public area of a persisted object
    pub fn public(&self, handle: PersistentHandle) -> PublicKeyBlob {
        self.state()
            .persistent(handle)
            .map(|object| object.public.clone())
            .unwrap_or_else(|_| panic!("{handle} is not defined"))
    }

    /// Drops a persisted object without going through `evict_control`
    pub fn remove(&mut self, handle: PersistentHandle) {
        self.state().persistent.remove(&handle);
    }

    pub fn primary_keys_created(&self) -> usize {
        self.state().primary_keys_created
    }

    /// Number of transports opened through [`Connect`]
    pub fn connections(&self) -> usize {
        self.state().connections
    }

    /// Makes [`Connect`] report the TPM as absent
    pub fn set_available(&self, available: bool) {
        self.state().available = available;
    }

    pub fn extend_pcr(&self, slot: u8, measurement: &[u8]) {
        self.state().pcrs[usize::from(slot)].extend(measurement);
    }
}

impl Tpm for SoftTpm {
    fn read_public(&mut self, handle: PersistentHandle) -> Result<ReadPublic, Error> {
        let public = self.state().persistent(handle)?.public.clone();
        let name = public.name()?;

        Ok(ReadPublic {
            qualified_name: name.to_bytes(),
            public,
            name,
        })
    }

    fn create_primary(
        &mut self,
        _hierarchy: Hierarchy,
        template: &KeyTemplate,
    ) -> Result<TransientHandle, Error> {
        // Primary keys derive from the hierarchy seed and the template, so equal templates yield
        // equal keys
        let object = if template.attributes().sign_encrypt() {
            SoftObject::new(template, AIK_MODULUS, AIK_PKCS8)
        } else {
            SoftObject::new(template, OTHER_MODULUS, OTHER_PKCS8)
        };

        let mut state = self.state();
        let handle = state.next_transient;

        state.next_transient += 1;
        state.primary_keys_created += 1;
        state.transient.insert(handle, object);

        Ok(TransientHandle::from_raw(handle))
    }

    fn evict_control(&mut self, object: Object, persistent: PersistentHandle) -> Result<(), Error> {
        let mut state = self.state();

        match object {
            Object::Transient(handle) => {
                if state.persistent.contains_key(&persistent) {
                    return Err(Error::Protocol(format!("{persistent} is already defined")));
                }

                let object = state.transient.remove(&handle.raw()).ok_or_else(|| {
                    Error::Protocol(format!("0x{:08X} is not loaded", handle.raw()))
                })?;

                state.persistent.insert(persistent, object);
            }
            Object::Persistent(handle) => {
                state
                    .persistent
                    .remove(&handle)
                    .ok_or(Error::NotFound(handle))?;
            }
        }

        Ok(())
    }

    fn hash(
        &mut self,
        algorithm: HashingAlgorithm,
        data: &[u8],
        hierarchy: Hierarchy,
    ) -> Result<(Vec<u8>, HashTicket), Error> {
        let digest = algorithm.digest(data)?;

        self.state().hashed.insert(digest.clone(), data.to_vec());

        Ok((
            digest.clone(),
            HashTicket {
                tag: TPM_ST_HASHCHECK,
                hierarchy: match hierarchy {
                    Hierarchy::Owner => TPM_RH_OWNER,
                    Hierarchy::Endorsement => TPM_RH_ENDORSEMENT,
                    Hierarchy::Null => TPM_RH_NULL,
                },
                digest,
            },
        ))
    }

    fn sign(
        &mut self,
        key: PersistentHandle,
        digest: &[u8],
        ticket: &HashTicket,
    ) -> Result<Vec<u8>, Error> {
        let state = self.state();
        let object = state.persistent(key)?;

        if object.public.parse()?.is_restricted_signing_key()
            && (ticket.tag != TPM_ST_HASHCHECK || ticket.digest != digest)
        {
            return Err(Error::Protocol(
                "restricted key requires a valid hash ticket".into(),
            ));
        }

        let data = state
            .hashed
            .get(digest)
            .ok_or_else(|| Error::Protocol("digest was not computed by this TPM".into()))?;

        let key_pair = object.signing_key()?;
        let mut signature = vec![0; key_pair.public_modulus_len()];

        key_pair
            .sign(
                &aws_lc_rs::signature::RSA_PKCS1_SHA256,
                &aws_lc_rs::rand::SystemRandom::new(),
                data,
                &mut signature,
            )
            .map_err(|_| Error::Protocol("signing failed".into()))?;

        Ok(signature)
    }

    fn activate_credential(
        &mut self,
        subject: PersistentHandle,
        key_provider: PersistentHandle,
        id_object: &[u8],
        encrypted_seed: &[u8],
    ) -> Result<zeroize::Zeroizing<Vec<u8>>, Error> {
        let state = self.state();
        let subject_name = state.persistent(subject)?.public.name()?;
        let key_provider = state.persistent(key_provider)?;

        let private_key = aws_lc_rs::rsa::PrivateDecryptingKey::from_pkcs8(key_provider.pkcs8)
            .map_err(|error| Error::Protocol(error.to_string()))?;
        let private_key = aws_lc_rs::rsa::OaepPrivateDecryptingKey::new(private_key)
            .map_err(|_| Error::Protocol("not an OAEP key".into()))?;

        let mut seed = zeroize::Zeroizing::new(vec![0u8; encrypted_seed.len()]);
        let seed_size = private_key
            .decrypt(
                &aws_lc_rs::rsa::OAEP_SHA256_MGF1SHA256,
                encrypted_seed,
                &mut seed,
                Some(credential::IDENTITY_LABEL),
            )
            .map_err(|_| Error::Activation("seed decryption failed".into()))?
            .len();
        seed.truncate(seed_size);

        credential::unprotect_credential(&subject_name, &seed, id_object)
            .map_err(|error| Error::Activation(error.to_string()))
    }

    fn seal(
        &mut self,
        parent: PersistentHandle,
        data: &[u8],
        pcrs: &PcrPolicy,
    ) -> Result<SealedBlob, Error> {
        let state = self.state();
        state.persistent(parent)?;

        Ok(SealedBlob {
            private: data.to_vec(),
            public: [&parent.value().to_be_bytes()[..], &state.pcr_digest(pcrs)?].concat(),
        })
    }

    fn unseal(
        &mut self,
        parent: PersistentHandle,
        blob: &SealedBlob,
        pcrs: &PcrPolicy,
    ) -> Result<zeroize::Zeroizing<Vec<u8>>, Error> {
        let state = self.state();
        state.persistent(parent)?;

        let (sealed_parent, policy) = blob
            .public
            .split_first_chunk::<4>()
            .ok_or_else(|| Error::Protocol("sealed object public area too short".into()))?;

        if u32::from_be_bytes(*sealed_parent) != parent.value() {
            return Err(Error::Protocol(format!(
                "sealed object does not belong to {parent}"
            )));
        }

        if policy != state.pcr_digest(pcrs)? {
            return Err(Error::Policy);
        }

        Ok(zeroize::Zeroizing::new(blob.private.clone()))
    }
}

impl Connect for SoftTpm {
    type Tpm = SoftTpm;

    fn is_available(&self) -> bool {
        self.state().available
    }

    fn connect(&self) -> Result<Self::Tpm, Error> {
        let mut state = self.state();

        if !state.available {
            return Err(Error::Connection("simulated TPM is absent".into()));
        }

        state.connections += 1;

        Ok(self.clone())
    }
}

/// Endorsement key of a TPM other than the simulated one
pub fn other_endorsement_key() -> PublicKeyBlob {
    SoftObject::new(&template(KeyTemplate::endorsement_key), OTHER_MODULUS, OTHER_PKCS8).public
}

fn template(build: fn() -> Result<KeyTemplate, Error>) -> KeyTemplate {
    build().expect("key templates are valid")
}
