// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transport independent view of a TPM
//!
//! Everything above the transport talks to the TPM through the [`Tpm`] trait, using the domain
//! types of this module. [`crate::tss::TssTpm`] implements it for a hardware TPM on top of the
//! TSS. A transport is held exclusively for one logical operation sequence and closed by dropping
//! it; [`Connect`] opens a fresh one per operation.

mod digest;
pub mod public;

pub use digest::HashingAlgorithmExtension;
pub use public::PublicExtension;
pub use tss_esapi::attributes::ObjectAttributes;
pub use tss_esapi::interface_types::algorithm::HashingAlgorithm;
pub use tss_esapi::structures::Public;

use tss_esapi::traits::UnMarshall as _;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not connect to TPM: {0}")]
    Connection(String),
    #[error("object {0} is not defined")]
    NotFound(PersistentHandle),
    #[error("malformed TPM data: {0}")]
    Protocol(String),
    #[error("PCR policy does not match the current platform state")]
    Policy,
    #[error("credential activation rejected: {0}")]
    Activation(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Tss(#[from] tss_esapi::Error),
    #[error(transparent)]
    KeyRejected(#[from] aws_lc_rs::error::KeyRejected),
    #[error(transparent)]
    Asn1Der(#[from] picky_asn1_der::Asn1DerError),
}

/// Handle in the persistent range of the owner hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PersistentHandle(u32);

impl PersistentHandle {
    pub const EK: Self = Self(0x8100_0001);
    pub const SRK: Self = Self(0x8100_0002);
    pub const AIK: Self = Self(0x8100_0003);
    pub const QUOTE: Self = Self(0x8100_0004);
    pub const ECDH: Self = Self(0x8100_0005);

    const FIRST: u32 = 0x8100_0000;
    const LAST: u32 = 0x81FF_FFFF;

    pub fn new(value: u32) -> Result<Self, Error> {
        if (Self::FIRST..=Self::LAST).contains(&value) {
            Ok(Self(value))
        } else {
            Err(Error::Protocol(format!(
                "0x{value:08X} is not a persistent handle"
            )))
        }
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for PersistentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// Handle of a loaded object, only meaningful to the transport that returned it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransientHandle(u32);

impl TransientHandle {
    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Object {
    Transient(TransientHandle),
    Persistent(PersistentHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hierarchy {
    Owner,
    Endorsement,
    Null,
}

/// Marshalled `TPMT_PUBLIC`, without the TPM2B size prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyBlob(Vec<u8>);

impl PublicKeyBlob {
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn parse(&self) -> Result<Public, Error> {
        Ok(Public::unmarshall(&self.0)?)
    }

    /// Name of the object this blob describes
    pub fn name(&self) -> Result<ObjectName, Error> {
        let algorithm = self.parse()?.name_hashing_algorithm();

        Ok(ObjectName {
            algorithm,
            digest: algorithm.digest(&self.0)?,
        })
    }
}

/// `nameAlg || H_nameAlg(TPMT_PUBLIC)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectName {
    algorithm: HashingAlgorithm,
    digest: Vec<u8>,
}

impl ObjectName {
    /// Parses the unprefixed `TPM2B_NAME` payload
    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        let (id, digest) = data
            .split_first_chunk::<2>()
            .ok_or_else(|| Error::Protocol("name too short".into()))?;
        let id = u16::from_be_bytes(*id);
        let algorithm = HashingAlgorithm::try_from(id)
            .map_err(|_| Error::Protocol(format!("unsupported name algorithm 0x{id:04X}")))?;
        let digest_len = algorithm.digest_len()?;

        if digest.len() != digest_len {
            return Err(Error::Protocol(format!(
                "name digest has {} bytes, expected {digest_len}",
                digest.len()
            )));
        }

        Ok(Self {
            algorithm,
            digest: digest.to_vec(),
        })
    }

    /// Parses a size prefixed `TPM2B_NAME`
    pub fn from_tpm2b(data: &[u8]) -> Result<Self, Error> {
        Self::from_bytes(crate::wire::strip_tpm2b(data)?)
    }

    pub fn algorithm(&self) -> HashingAlgorithm {
        self.algorithm
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        [&u16::from(self.algorithm).to_be_bytes()[..], &self.digest].concat()
    }

    pub fn to_tpm2b(&self) -> Vec<u8> {
        let name = self.to_bytes();

        // A name is at most 66 bytes
        [&(name.len() as u16).to_be_bytes()[..], &name].concat()
    }
}

/// Result of `TPM2_ReadPublic`
#[derive(Debug, Clone)]
pub struct ReadPublic {
    pub public: PublicKeyBlob,
    pub name: ObjectName,
    pub qualified_name: Vec<u8>,
}

/// `TPMT_TK_HASHCHECK`, proof that the TPM computed a digest itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashTicket {
    pub tag: u16,
    pub hierarchy: u32,
    pub digest: Vec<u8>,
}

/// Digest bank and PCR indices a sealed object is bound to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrPolicy {
    pub bank: HashingAlgorithm,
    pub slots: Vec<u8>,
}

impl PcrPolicy {
    /// Highest PCR index of a standard bank
    pub const MAX_SLOT: u8 = 23;

    pub fn new(bank: HashingAlgorithm, mut slots: Vec<u8>) -> Result<Self, Error> {
        if let Some(slot) = slots.iter().find(|&&slot| slot > Self::MAX_SLOT) {
            return Err(Error::Protocol(format!("PCR {slot} is out of range")));
        }

        slots.sort_unstable();
        slots.dedup();

        Ok(Self { bank, slots })
    }
}

impl Default for PcrPolicy {
    fn default() -> Self {
        Self {
            bank: HashingAlgorithm::Sha256,
            slots: vec![0, 1, 2, 3, 4, 6, 7, 8, 9, 13],
        }
    }
}

/// Sealed data object as returned by `TPM2_Create`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBlob {
    pub private: Vec<u8>,
    pub public: Vec<u8>,
}

impl SealedBlob {
    /// `TPM2B_PRIVATE || TPM2B_PUBLIC`
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut buffer = Vec::with_capacity(self.private.len() + self.public.len() + 4);

        crate::wire::put_sized(&mut buffer, &self.private)?;
        crate::wire::put_sized(&mut buffer, &self.public)?;

        Ok(buffer)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        let mut reader = crate::wire::Reader::new(data, "sealed blob");
        let private = reader.read_sized_buffer()?.to_vec();
        let public = reader.read_sized_buffer()?.to_vec();

        reader.finish()?;

        Ok(Self { private, public })
    }
}

/// Public area a primary key is created from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTemplate(Public);

impl KeyTemplate {
    pub fn new(public: Public) -> Self {
        Self(public)
    }

    /// Restricted RSA-2048 signing key used as attestation identity key
    pub fn attestation_key() -> Result<Self, Error> {
        Ok(Self(
            tss_esapi::structures::PublicBuilder::new()
                .with_public_algorithm(tss_esapi::interface_types::algorithm::PublicAlgorithm::Rsa)
                .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
                .with_object_attributes(
                    tss_esapi::attributes::ObjectAttributesBuilder::new()
                        .with_fixed_tpm(true)
                        .with_fixed_parent(true)
                        .with_sensitive_data_origin(true)
                        .with_user_with_auth(true)
                        .with_restricted(true)
                        .with_sign_encrypt(true)
                        .with_no_da(true)
                        .build()?,
                )
                .with_rsa_parameters(tss_esapi::structures::PublicRsaParameters::new(
                    tss_esapi::structures::SymmetricDefinitionObject::Null,
                    tss_esapi::structures::RsaScheme::RsaSsa(tss_esapi::structures::HashScheme::new(
                        HashingAlgorithm::Sha256,
                    )),
                    tss_esapi::interface_types::key_bits::RsaKeyBits::Rsa2048,
                    tss_esapi::structures::RsaExponent::default(),
                ))
                .with_rsa_unique_identifier(tss_esapi::structures::PublicKeyRsa::new_empty_with_size(
                    tss_esapi::interface_types::key_bits::RsaKeyBits::Rsa2048,
                ))
                .build()?,
        ))
    }

    /// Restricted RSA-2048 decryption key parenting sealed objects
    pub fn storage_root_key() -> Result<Self, Error> {
        Ok(Self(
            tss_esapi::structures::PublicBuilder::new()
                .with_public_algorithm(tss_esapi::interface_types::algorithm::PublicAlgorithm::Rsa)
                .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
                .with_object_attributes(
                    tss_esapi::attributes::ObjectAttributesBuilder::new()
                        .with_fixed_tpm(true)
                        .with_fixed_parent(true)
                        .with_sensitive_data_origin(true)
                        .with_user_with_auth(true)
                        .with_no_da(true)
                        .with_restricted(true)
                        .with_decrypt(true)
                        .build()?,
                )
                .with_rsa_parameters(tss_esapi::structures::PublicRsaParameters::new(
                    tss_esapi::structures::SymmetricDefinitionObject::AES_128_CFB,
                    tss_esapi::structures::RsaScheme::Null,
                    tss_esapi::interface_types::key_bits::RsaKeyBits::Rsa2048,
                    tss_esapi::structures::RsaExponent::default(),
                ))
                .with_rsa_unique_identifier(tss_esapi::structures::PublicKeyRsa::new_empty_with_size(
                    tss_esapi::interface_types::key_bits::RsaKeyBits::Rsa2048,
                ))
                .build()?,
        ))
    }

    /// Default TCG RSA-2048 endorsement key template (L-1)
    pub fn endorsement_key() -> Result<Self, Error> {
        Ok(Self(
            tss_esapi::abstraction::ek::create_ek_public_from_default_template_2(
                tss_esapi::abstraction::AsymmetricAlgorithmSelection::Rsa(
                    tss_esapi::interface_types::key_bits::RsaKeyBits::Rsa2048,
                ),
                None,
            )?,
        ))
    }

    pub fn public(&self) -> &Public {
        &self.0
    }

    pub fn attributes(&self) -> ObjectAttributes {
        self.0.object_attributes()
    }
}

/// Blocking TPM operations
pub trait Tpm {
    fn read_public(&mut self, handle: PersistentHandle) -> Result<ReadPublic, Error>;

    fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        template: &KeyTemplate,
    ) -> Result<TransientHandle, Error>;

    /// Persists a transient object at `persistent`, or evicts the persistent object if `object`
    /// refers to it
    fn evict_control(&mut self, object: Object, persistent: PersistentHandle) -> Result<(), Error>;

    fn hash(
        &mut self,
        algorithm: HashingAlgorithm,
        data: &[u8],
        hierarchy: Hierarchy,
    ) -> Result<(Vec<u8>, HashTicket), Error>;

    /// Signs with the scheme of `key`
    fn sign(
        &mut self,
        key: PersistentHandle,
        digest: &[u8],
        ticket: &HashTicket,
    ) -> Result<Vec<u8>, Error>;

    /// `id_object` and `encrypted_seed` come without TPM2B size prefixes
    fn activate_credential(
        &mut self,
        subject: PersistentHandle,
        key_provider: PersistentHandle,
        id_object: &[u8],
        encrypted_seed: &[u8],
    ) -> Result<zeroize::Zeroizing<Vec<u8>>, Error>;

    fn seal(
        &mut self,
        parent: PersistentHandle,
        data: &[u8],
        pcrs: &PcrPolicy,
    ) -> Result<SealedBlob, Error>;

    fn unseal(
        &mut self,
        parent: PersistentHandle,
        blob: &SealedBlob,
        pcrs: &PcrPolicy,
    ) -> Result<zeroize::Zeroizing<Vec<u8>>, Error>;
}

/// Opens transports to one TPM
pub trait Connect: Send + Sync {
    type Tpm: Tpm;

    /// Whether the TPM exists at all
    fn is_available(&self) -> bool;

    fn connect(&self) -> Result<Self::Tpm, Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    Unchanged,
    Created,
    Replaced,
}

/// Makes sure a primary key created from `template` is persisted at `handle`
///
/// An existing key is kept if its attributes match the template. Otherwise it is evicted and
/// replaced by a new primary key of the owner hierarchy.
pub fn provision_key<T: Tpm + ?Sized>(
    tpm: &mut T,
    handle: PersistentHandle,
    template: &KeyTemplate,
) -> Result<Provisioned, Error> {
    let replace = match tpm.read_public(handle) {
        Ok(existing) => {
            let attributes = existing.public.parse()?.object_attributes();

            if attributes == template.attributes() {
                log::info!("Key {handle} matches its template, keeping it");

                return Ok(Provisioned::Unchanged);
            }

            log::warn!(
                "Key {handle} has attributes {attributes:?}, expected {:?}, replacing it",
                template.attributes()
            );

            true
        }
        Err(Error::NotFound(_)) => {
            log::info!("Key {handle} is not defined, creating it");

            false
        }
        Err(error) => return Err(error),
    };

    let transient = tpm.create_primary(Hierarchy::Owner, template)?;

    if replace {
        tpm.evict_control(Object::Persistent(handle), handle)?;
    }

    tpm.evict_control(Object::Transient(transient), handle)?;

    Ok(if replace {
        Provisioned::Replaced
    } else {
        Provisioned::Created
    })
}
