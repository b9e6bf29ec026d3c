//! Opens the hardware TPM. Every logical operation gets its own TSS context, which keeps the
//! device open until it is dropped.

/// Default resource-managed TPM device
pub const DEFAULT_DEVICE_PATH: &str = "/dev/tpmrm0";

#[derive(Debug, Clone)]
pub struct TpmDevice {
    device_path: std::path::PathBuf,
}

impl TpmDevice {
    pub fn new(device_path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            device_path: device_path.into(),
        }
    }

    /// Device named by `TPM_DEVICE`, falling back to [`DEFAULT_DEVICE_PATH`]
    pub fn from_env() -> Self {
        Self::new(std::env::var_os("TPM_DEVICE").unwrap_or(DEFAULT_DEVICE_PATH.into()))
    }

    pub fn device_path(&self) -> &std::path::Path {
        &self.device_path
    }
}

impl crate::tpm::Connect for TpmDevice {
    type Tpm = crate::tss::TssTpm;

    fn is_available(&self) -> bool {
        self.device_path.exists()
    }

    fn connect(&self) -> Result<Self::Tpm, crate::tpm::Error> {
        log::debug!("Opening TPM at {}", self.device_path.display());

        crate::tss::TssTpm::open(&self.device_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tpm::Connect as _;

    #[test]
    fn missing_device_is_unavailable() {
        let directory = tempfile::tempdir().unwrap();
        let device = TpmDevice::new(directory.path().join("tpmrm0"));

        assert!(!device.is_available());

        std::fs::write(device.device_path(), b"").unwrap();

        assert!(device.is_available());
    }
}
