//! Argon2id key derivation for PIN-based wallet keys.
//!
//! Stretches a low-entropy PIN into 32 bytes of key material. Argon2id
//! is memory-hard and side-channel-resistant; parameters are tunable so
//! products can calibrate for their device class.

use argon2::{Algorithm, Argon2, Params, Version};
use rand::{rngs::OsRng, RngCore};

use super::CryptoError;

/// Length of derived key material in bytes.
pub const DERIVED_KEY_SIZE: usize = 32;

/// Minimum accepted salt length in bytes.
pub const MIN_SALT_LEN: usize = 12;

/// Length of salts produced by [`generate_salt`].
const SALT_LEN: usize = 16;

/// Argon2id cost parameters.
///
/// Defaults are calibrated for a mid-range mobile device: 64 MiB
/// memory, 3 iterations, 4 lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Iteration count.
    pub iterations: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 65_536,
            iterations: 3,
            parallelism: 4,
        }
    }
}

impl KdfParams {
    /// Reduced-cost parameters for tests. Fast but insecure.
    #[must_use]
    pub const fn test_preset() -> Self {
        Self {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        }
    }
}

/// Generates a random salt suitable for [`KdfEngine::derive`].
#[must_use]
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Derives symmetric key material from a PIN and salt.
///
/// Stateless and deterministic: the same `(pin, salt, params)` always
/// yields the same output. The PIN is never cached.
#[derive(Debug, Clone, Copy)]
pub struct KdfEngine {
    params: KdfParams,
}

impl KdfEngine {
    /// Creates an engine with the given cost parameters.
    #[must_use]
    pub const fn new(params: KdfParams) -> Self {
        Self { params }
    }

    /// The configured cost parameters.
    #[must_use]
    pub const fn params(&self) -> KdfParams {
        self.params
    }

    /// Derives a 32-byte key from `pin` and `salt`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KdfInput`] if `pin` is empty or `salt` is
    /// shorter than [`MIN_SALT_LEN`] bytes, and
    /// [`CryptoError::KeyDerivation`] if the Argon2 backend rejects the
    /// parameters. Never partially succeeds.
    pub fn derive(&self, pin: &[u8], salt: &[u8]) -> Result<[u8; DERIVED_KEY_SIZE], CryptoError> {
        if pin.is_empty() {
            return Err(CryptoError::KdfInput("pin must not be empty".into()));
        }
        if salt.len() < MIN_SALT_LEN {
            return Err(CryptoError::KdfInput(format!(
                "salt too short: {} bytes (minimum {MIN_SALT_LEN})",
                salt.len()
            )));
        }

        let params = Params::new(
            self.params.memory_kib,
            self.params.iterations,
            self.params.parallelism,
            Some(DERIVED_KEY_SIZE),
        )
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut output = [0u8; DERIVED_KEY_SIZE];
        argon2
            .hash_password_into(pin, salt, &mut output)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> KdfEngine {
        KdfEngine::new(KdfParams::test_preset())
    }

    #[test]
    fn test_derive_deterministic() {
        // Reference inputs: a 6-digit PIN and a 12-byte salt of 0x0a.
        let salt = [0x0au8; 12];
        let first = engine().derive(b"276536", &salt).unwrap();
        let second = engine().derive(b"276536", &salt).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), DERIVED_KEY_SIZE);
    }

    #[test]
    fn test_derive_different_pin() {
        let salt = [0x0au8; 12];
        let a = engine().derive(b"276536", &salt).unwrap();
        let b = engine().derive(b"276537", &salt).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_derive_different_salt() {
        let a = engine().derive(b"276536", &[0x0a; 12]).unwrap();
        let b = engine().derive(b"276536", &[0x0b; 12]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_pin_rejected() {
        let result = engine().derive(b"", &[0x0a; 12]);
        assert!(matches!(result, Err(CryptoError::KdfInput(_))));
    }

    #[test]
    fn test_short_salt_rejected() {
        let result = engine().derive(b"276536", &[0x0a; 8]);
        assert!(matches!(result, Err(CryptoError::KdfInput(_))));
    }

    #[test]
    fn test_generate_salt_length_and_uniqueness() {
        let a = generate_salt();
        let b = generate_salt();
        assert_eq!(a.len(), 16);
        assert!(a.len() >= MIN_SALT_LEN);
        assert_ne!(a, b);
    }
}
