// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! [`Tpm`] on top of the TSS enhanced system API

mod context_extension;
mod session;

use crate::tpm::{
    Error, HashTicket, Hierarchy, KeyTemplate, Object, ObjectName, PcrPolicy,
    HashingAlgorithm, PersistentHandle, PublicKeyBlob, ReadPublic, SealedBlob, Tpm, TransientHandle,
};
use context_extension::ContextExtension as _;
use tss_esapi::traits::{Marshall as _, UnMarshall as _};

pub struct TssTpm {
    context: tss_esapi::Context,
}

impl TssTpm {
    /// Opens the TPM through the device TCTI
    pub fn open(device_path: &std::path::Path) -> Result<Self, Error> {
        let device_path = device_path.to_str().ok_or_else(|| {
            Error::Connection(format!("invalid TPM device path {}", device_path.display()))
        })?;

        Self::with_tcti(tss_esapi::TctiNameConf::Device(
            std::str::FromStr::from_str(device_path)?,
        ))
    }

    pub fn with_tcti(tcti_name_conf: tss_esapi::TctiNameConf) -> Result<Self, Error> {
        let description = format!("{tcti_name_conf:?}");

        let context = tss_esapi::Context::new(tcti_name_conf)
            .map_err(|error| Error::Connection(format!("{description}: {error}")))?;

        Ok(Self { context })
    }

    fn key_handle(
        &mut self,
        handle: PersistentHandle,
    ) -> Result<tss_esapi::handles::KeyHandle, Error> {
        Ok(self.context.persistent_object(handle)?.into())
    }
}

impl Tpm for TssTpm {
    fn read_public(&mut self, handle: PersistentHandle) -> Result<ReadPublic, Error> {
        let key_handle = self.key_handle(handle)?;

        let (public, name, qualified_name) = self
            .context
            .execute_without_session(|context| context.read_public(key_handle))?;

        Ok(ReadPublic {
            public: PublicKeyBlob::new(public.marshall()?),
            name: ObjectName::from_bytes(name.value())?,
            qualified_name: qualified_name.value().to_vec(),
        })
    }

    fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        template: &KeyTemplate,
    ) -> Result<TransientHandle, Error> {
        let public = template.public().clone();

        let result = self.context.execute_with_nullauth_session(|context| {
            context.create_primary(
                tss_esapi_hierarchy(hierarchy),
                public,
                None,
                None,
                None,
                None,
            )
        })?;

        Ok(TransientHandle::from_raw(
            tss_esapi::tss2_esys::ESYS_TR::from(result.key_handle),
        ))
    }

    fn evict_control(&mut self, object: Object, persistent: PersistentHandle) -> Result<(), Error> {
        let persistent_tpm_handle = tss_esapi::interface_types::dynamic_handles::Persistent::Persistent(
            tss_esapi::handles::PersistentTpmHandle::new(persistent.value())?,
        );

        let object_handle = match object {
            Object::Transient(handle) => tss_esapi::handles::ObjectHandle::from(handle.raw()),
            Object::Persistent(handle) => self.context.persistent_object(handle)?,
        };

        self.context.execute_with_nullauth_session(|context| {
            context.evict_control(
                tss_esapi::interface_types::resource_handles::Provision::Owner,
                object_handle,
                persistent_tpm_handle,
            )
        })?;

        // The persisted copy is independent of the transient object
        if let Object::Transient(_) = object {
            self.context.flush_context(object_handle)?;
        }

        Ok(())
    }

    fn hash(
        &mut self,
        algorithm: HashingAlgorithm,
        data: &[u8],
        hierarchy: Hierarchy,
    ) -> Result<(Vec<u8>, HashTicket), Error> {
        let data = tss_esapi::structures::MaxBuffer::try_from(data.to_vec())?;

        let (digest, ticket) = self.context.execute_without_session(|context| {
            context.hash(
                data,
                algorithm,
                tss_esapi_hierarchy(hierarchy),
            )
        })?;

        let ticket = tss_esapi::tss2_esys::TPMT_TK_HASHCHECK::try_from(ticket)?;
        let ticket_digest = ticket
            .digest
            .buffer
            .get(..usize::from(ticket.digest.size))
            .ok_or_else(|| Error::Protocol("oversized hash ticket digest".into()))?;

        Ok((
            digest.value().to_vec(),
            HashTicket {
                tag: ticket.tag,
                hierarchy: ticket.hierarchy,
                digest: ticket_digest.to_vec(),
            },
        ))
    }

    fn sign(
        &mut self,
        key: PersistentHandle,
        digest: &[u8],
        ticket: &HashTicket,
    ) -> Result<Vec<u8>, Error> {
        let key_handle = self.key_handle(key)?;
        let digest = tss_esapi::structures::Digest::try_from(digest.to_vec())?;
        let validation = hashcheck_ticket(ticket)?;

        let signature = self.context.execute_with_nullauth_session(|context| {
            context.sign(
                key_handle,
                digest,
                tss_esapi::structures::SignatureScheme::Null,
                validation,
            )
        })?;

        match signature {
            tss_esapi::structures::Signature::RsaSsa(signature)
            | tss_esapi::structures::Signature::RsaPss(signature) => {
                Ok(signature.signature().value().to_vec())
            }
            _ => Err(Error::Protocol("key produced a non-RSA signature".into())),
        }
    }

    fn activate_credential(
        &mut self,
        subject: PersistentHandle,
        key_provider: PersistentHandle,
        id_object: &[u8],
        encrypted_seed: &[u8],
    ) -> Result<zeroize::Zeroizing<Vec<u8>>, Error> {
        let subject = self.key_handle(subject)?;
        let key_provider = self.key_handle(key_provider)?;
        let id_object = tss_esapi::structures::IdObject::try_from(id_object.to_vec())?;
        let encrypted_seed = tss_esapi::structures::EncryptedSecret::try_from(encrypted_seed.to_vec())?;

        let policy_session = session::endorsement_policy_session(&mut self.context)?;

        let result = self.context.execute_with_sessions(
            (
                Some(tss_esapi::interface_types::session_handles::AuthSession::Password),
                Some(policy_session),
                None,
            ),
            |context| context.activate_credential(subject, key_provider, id_object, encrypted_seed),
        );

        self.context.clear_sessions();
        session::flush_session(&mut self.context, policy_session);

        match result {
            Ok(secret) => Ok(zeroize::Zeroizing::new(secret.value().to_vec())),
            // The TPM rejects credentials for another name or another key provider
            Err(tss_esapi::Error::Tss2Error(response_code)) => {
                Err(Error::Activation(response_code.to_string()))
            }
            Err(error) => Err(error.into()),
        }
    }

    fn seal(
        &mut self,
        parent: PersistentHandle,
        data: &[u8],
        pcrs: &PcrPolicy,
    ) -> Result<SealedBlob, Error> {
        let parent = self.key_handle(parent)?;
        let sensitive_data = tss_esapi::structures::SensitiveData::try_from(data.to_vec())?;

        let trial_session = session::pcr_policy_session(
            &mut self.context,
            pcrs,
            tss_esapi::constants::SessionType::Trial,
        )?;
        let policy_digest = self.context.policy_get_digest(trial_session);
        session::flush_session(&mut self.context, trial_session.into());

        let public = tss_esapi::structures::PublicBuilder::new()
            .with_public_algorithm(tss_esapi::interface_types::algorithm::PublicAlgorithm::KeyedHash)
            .with_keyed_hash_parameters(tss_esapi::structures::PublicKeyedHashParameters::new(
                tss_esapi::structures::KeyedHashScheme::Null,
            ))
            .with_keyed_hash_unique_identifier(tss_esapi::structures::Digest::default())
            .with_name_hashing_algorithm(
                tss_esapi::interface_types::algorithm::HashingAlgorithm::Sha256,
            )
            .with_object_attributes(
                tss_esapi::attributes::ObjectAttributesBuilder::new()
                    .with_fixed_tpm(true)
                    .with_fixed_parent(true)
                    .with_no_da(true)
                    .build()?,
            )
            .with_auth_policy(policy_digest?)
            .build()?;

        let sealed_object = self.context.execute_with_nullauth_session(|context| {
            context.create(parent, public, None, Some(sensitive_data), None, None)
        })?;

        Ok(SealedBlob {
            private: sealed_object.out_private.value().to_vec(),
            public: sealed_object.out_public.marshall()?,
        })
    }

    fn unseal(
        &mut self,
        parent: PersistentHandle,
        blob: &SealedBlob,
        pcrs: &PcrPolicy,
    ) -> Result<zeroize::Zeroizing<Vec<u8>>, Error> {
        let parent = self.key_handle(parent)?;
        let private = tss_esapi::structures::Private::try_from(blob.private.clone())?;
        let public = tss_esapi::structures::Public::unmarshall(&blob.public)?;

        let sealed_object = self
            .context
            .execute_with_nullauth_session(|context| context.load(parent, private, public))?;

        let result = session::pcr_policy_session(
            &mut self.context,
            pcrs,
            tss_esapi::constants::SessionType::Policy,
        )
        .and_then(|policy_session| {
            let result = self
                .context
                .execute_with_session(Some(policy_session.into()), |context| {
                    context.unseal(sealed_object.into())
                });

            session::flush_session(&mut self.context, policy_session.into());

            result.map_err(policy_error)
        });

        if let Err(error) = self.context.flush_context(sealed_object.into()) {
            log::warn!("Could not flush sealed object: {error}");
        }

        Ok(zeroize::Zeroizing::new(result?.value().to_vec()))
    }
}

/// Maps failed policy checks to [`Error::Policy`]
fn policy_error(error: tss_esapi::Error) -> Error {
    match error {
        tss_esapi::Error::Tss2Error(response_code)
            if matches!(
                response_code.kind(),
                Some(tss_esapi::constants::response_code::Tss2ResponseCodeKind::PolicyFail)
                    | Some(tss_esapi::constants::response_code::Tss2ResponseCodeKind::PcrChanged)
            ) =>
        {
            Error::Policy
        }
        error => error.into(),
    }
}

fn tss_esapi_hierarchy(
    hierarchy: Hierarchy,
) -> tss_esapi::interface_types::resource_handles::Hierarchy {
    match hierarchy {
        Hierarchy::Owner => tss_esapi::interface_types::resource_handles::Hierarchy::Owner,
        Hierarchy::Endorsement => {
            tss_esapi::interface_types::resource_handles::Hierarchy::Endorsement
        }
        Hierarchy::Null => tss_esapi::interface_types::resource_handles::Hierarchy::Null,
    }
}

fn hashcheck_ticket(ticket: &HashTicket) -> Result<tss_esapi::structures::HashcheckTicket, Error> {
    // TPMU_HA holds the largest supported digest
    let mut buffer = [0u8; 64];

    buffer
        .get_mut(..ticket.digest.len())
        .ok_or_else(|| Error::Protocol("oversized hash ticket digest".into()))?
        .copy_from_slice(&ticket.digest);

    Ok(tss_esapi::structures::HashcheckTicket::try_from(
        tss_esapi::tss2_esys::TPMT_TK_HASHCHECK {
            tag: ticket.tag,
            hierarchy: ticket.hierarchy,
            digest: tss_esapi::tss2_esys::TPM2B_DIGEST {
                size: ticket.digest.len() as u16,
                buffer,
            },
        },
    )?)
}
