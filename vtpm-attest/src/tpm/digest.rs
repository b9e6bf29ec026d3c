//! Software digests for the hash algorithms of the TPM

use super::Error;
use tss_esapi::interface_types::algorithm::HashingAlgorithm;

pub trait HashingAlgorithmExtension {
    fn digest_algorithm(self) -> Result<&'static aws_lc_rs::digest::Algorithm, Error>;

    fn digest_len(self) -> Result<usize, Error>;

    fn digest(self, data: &[u8]) -> Result<Vec<u8>, Error>;
}

impl HashingAlgorithmExtension for HashingAlgorithm {
    fn digest_algorithm(self) -> Result<&'static aws_lc_rs::digest::Algorithm, Error> {
        match self {
            HashingAlgorithm::Sha1 => Ok(&aws_lc_rs::digest::SHA1_FOR_LEGACY_USE_ONLY),
            HashingAlgorithm::Sha256 => Ok(&aws_lc_rs::digest::SHA256),
            HashingAlgorithm::Sha384 => Ok(&aws_lc_rs::digest::SHA384),
            HashingAlgorithm::Sha512 => Ok(&aws_lc_rs::digest::SHA512),
            algorithm => Err(Error::Protocol(format!(
                "unsupported hash algorithm {algorithm:?}"
            ))),
        }
    }

    fn digest_len(self) -> Result<usize, Error> {
        Ok(self.digest_algorithm()?.output_len)
    }

    fn digest(self, data: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(aws_lc_rs::digest::digest(self.digest_algorithm()?, data)
            .as_ref()
            .to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_sizes() {
        assert_eq!(HashingAlgorithm::Sha1.digest_len().unwrap(), 20);
        assert_eq!(HashingAlgorithm::Sha256.digest_len().unwrap(), 32);
        assert_eq!(HashingAlgorithm::Sha512.digest(b"").unwrap().len(), 64);
        assert!(matches!(
            HashingAlgorithm::Null.digest(b""),
            Err(Error::Protocol(_))
        ));
        assert!(HashingAlgorithm::Sm3_256.digest_len().is_err());
    }
}
