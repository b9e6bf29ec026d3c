//! Custom functions for the TSS context

pub(super) trait ContextExtension {
    /// Handles in the given range that are currently defined
    fn defined_handles(
        &mut self,
        first_handle: u32,
        last_handle: u32,
    ) -> tss_esapi::Result<std::collections::HashSet<u32>>;

    /// ESYS object of a persistent handle, fails with `NotFound` if nothing is persisted there
    fn persistent_object(
        &mut self,
        handle: crate::tpm::PersistentHandle,
    ) -> Result<tss_esapi::handles::ObjectHandle, crate::tpm::Error>;
}

impl ContextExtension for tss_esapi::Context {
    fn defined_handles(
        &mut self,
        first_handle: u32,
        last_handle: u32,
    ) -> tss_esapi::Result<std::collections::HashSet<u32>> {
        Ok(self
            .execute_without_session(|context| {
                context.get_capability(
                    tss_esapi::constants::CapabilityType::Handles,
                    first_handle,
                    last_handle - first_handle + 1,
                )
            })
            .and_then(|(capability_data, _)| match capability_data {
                tss_esapi::structures::CapabilityData::Handles(tpm_handles) => Ok(tpm_handles),
                _ => Err(tss_esapi::Error::WrapperError(
                    tss_esapi::WrapperErrorKind::WrongValueFromTpm,
                )),
            })?
            .into_inner()
            .into_iter()
            .map(u32::from)
            .collect())
    }

    fn persistent_object(
        &mut self,
        handle: crate::tpm::PersistentHandle,
    ) -> Result<tss_esapi::handles::ObjectHandle, crate::tpm::Error> {
        // Checked up front, tr_from_tpm_public reports a missing object as a generic TPM error
        if !self
            .defined_handles(handle.value(), handle.value())?
            .contains(&handle.value())
        {
            return Err(crate::tpm::Error::NotFound(handle));
        }

        let tpm_handle = tss_esapi::handles::TpmHandle::Persistent(
            tss_esapi::handles::PersistentTpmHandle::new(handle.value())?,
        );

        Ok(self.execute_without_session(|context| context.tr_from_tpm_public(tpm_handle))?)
    }
}
