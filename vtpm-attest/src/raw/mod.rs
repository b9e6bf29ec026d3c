//! Raw TPM commands over a byte stream
//!
//! Used where no TSS transport exists, such as the server socket of a software TPM instance.

pub mod tpm;

pub use tpm::{Error, Tpm};
