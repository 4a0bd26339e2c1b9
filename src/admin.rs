//! Privileged (service-role) client path.
//!
//! Tenant creation/deletion and backup import/export go through an
//! [`AdminClient`]. Building one fails when the daemon has no service key
//! configured; every call then requires the caller to present the same key.

use crate::config::{AcademydConfig, ConfigError};
use sha2::{Digest, Sha256};

pub struct AdminClient {
    key_digest: [u8; 32],
}

#[derive(Debug, PartialEq, Eq)]
pub enum AdminDenied {
    MissingKey,
    WrongKey,
}

impl AdminClient {
    pub fn from_config(config: &AcademydConfig) -> Result<Self, ConfigError> {
        let key = config.require_service_key()?;
        Ok(Self {
            key_digest: digest(key),
        })
    }

    pub fn authorize(&self, presented: Option<&str>) -> Result<(), AdminDenied> {
        let Some(presented) = presented else {
            return Err(AdminDenied::MissingKey);
        };
        // Digests have fixed length, so the comparison does not leak the key length.
        let given = digest(presented);
        let diff = given
            .iter()
            .zip(self.key_digest.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff == 0 {
            Ok(())
        } else {
            Err(AdminDenied::WrongKey)
        }
    }
}

fn digest(s: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(s.as_bytes()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_key(key: Option<&str>) -> AcademydConfig {
        AcademydConfig {
            service_key: key.map(|k| k.to_string()),
            ..AcademydConfig::default()
        }
    }

    #[test]
    fn missing_service_key_is_fatal_for_admin_path() {
        let result = AdminClient::from_config(&config_with_key(None));
        assert!(matches!(result, Err(ConfigError::MissingServiceKey)));
    }

    #[test]
    fn authorize_compares_presented_key() {
        let admin = AdminClient::from_config(&config_with_key(Some("s3cret"))).expect("admin");
        assert_eq!(admin.authorize(Some("s3cret")), Ok(()));
        assert_eq!(admin.authorize(Some("s3cret ")), Err(AdminDenied::WrongKey));
        assert_eq!(admin.authorize(None), Err(AdminDenied::MissingKey));
    }
}
