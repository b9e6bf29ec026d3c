//! Policy sessions authorizing use of the EK and of sealed objects

use crate::tpm::{Error, PcrPolicy};

/// Policy session satisfying the default EK policy, `PolicySecret(TPM_RH_ENDORSEMENT)`
pub(super) fn endorsement_policy_session(
    context: &mut tss_esapi::Context,
) -> Result<tss_esapi::interface_types::session_handles::AuthSession, Error> {
    let session = start_policy_session(context, tss_esapi::constants::SessionType::Policy)?;

    let result = context.execute_with_nullauth_session(|context| {
        context.policy_secret(
            tss_esapi::interface_types::session_handles::PolicySession::try_from(session)?,
            tss_esapi::handles::AuthHandle::Endorsement,
            Default::default(),
            Default::default(),
            Default::default(),
            None,
        )
    });

    if let Err(error) = result {
        flush_session(context, session);

        return Err(error.into());
    }

    Ok(session)
}

/// Session bound to the current values of the policy's PCRs
///
/// A trial session only computes the policy digest, a policy session authorizes an unseal.
pub(super) fn pcr_policy_session(
    context: &mut tss_esapi::Context,
    pcrs: &PcrPolicy,
    session_type: tss_esapi::constants::SessionType,
) -> Result<tss_esapi::interface_types::session_handles::PolicySession, Error> {
    let session = start_policy_session(context, session_type)?;

    let result = pcr_selection_list(pcrs).and_then(|pcr_selection_list| {
        let policy_session =
            tss_esapi::interface_types::session_handles::PolicySession::try_from(session)?;

        // An empty digest makes the TPM use the current PCR values
        context.policy_pcr(
            policy_session,
            tss_esapi::structures::Digest::default(),
            pcr_selection_list,
        )?;

        Ok(policy_session)
    });

    result.map_err(|error| {
        flush_session(context, session);

        error.into()
    })
}

pub(super) fn flush_session(
    context: &mut tss_esapi::Context,
    session: tss_esapi::interface_types::session_handles::AuthSession,
) {
    let session_handle = tss_esapi::handles::SessionHandle::from(session);

    if let Err(error) = context.flush_context(session_handle.into()) {
        log::warn!("Could not flush policy session: {error}");
    }
}

fn start_policy_session(
    context: &mut tss_esapi::Context,
    session_type: tss_esapi::constants::SessionType,
) -> Result<tss_esapi::interface_types::session_handles::AuthSession, Error> {
    context
        .start_auth_session(
            None,
            None,
            None,
            session_type,
            tss_esapi::structures::SymmetricDefinition::AES_128_CFB,
            tss_esapi::interface_types::algorithm::HashingAlgorithm::Sha256,
        )?
        .ok_or_else(|| Error::Protocol("TPM returned no session handle".into()))
}

fn pcr_selection_list(
    pcrs: &PcrPolicy,
) -> tss_esapi::Result<tss_esapi::structures::PcrSelectionList> {
    let pcr_slots = pcrs
        .slots
        .iter()
        .map(|&slot| tss_esapi::structures::PcrSlot::try_from(1u32 << slot))
        .collect::<tss_esapi::Result<Vec<_>>>()?;

    tss_esapi::structures::PcrSelectionList::builder()
        .with_selection(pcrs.bank, &pcr_slots)
        .build()
}
