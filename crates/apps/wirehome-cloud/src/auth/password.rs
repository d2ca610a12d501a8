use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};

pub use argon2::password_hash::Error as PasswordHashError;
pub use argon2::Params as HashParams;

/// Hash `password` into a PHC string with the default Argon2id parameters.
pub fn hash_password(password: &str) -> Result<String, PasswordHashError> {
    hash_password_with(password, Params::default())
}

pub fn hash_password_with(password: &str, params: Params) -> Result<String, PasswordHashError> {
    let salt = SaltString::generate(&mut OsRng);
    let hasher = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    Ok(hasher.hash_password(password.as_bytes(), &salt)?.to_string())
}

/// Check `password` against a stored PHC string. Malformed hashes never verify.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok(),
        Err(err) => {
            log::warn!("auth: stored password hash is unreadable: {err}");
            false
        }
    }
}

/// Cheap parameters so tests do not spend seconds per hash.
#[cfg(test)]
pub(crate) fn test_hash(password: &str) -> String {
    let params = Params::new(1024, 1, 1, None).expect("valid argon2 params");
    hash_password_with(password, params).expect("hash")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_verifies_only_the_original_password() {
        let hash = test_hash("correct horse");
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("battery staple", &hash));
    }

    #[test]
    fn same_password_gets_a_fresh_salt() {
        assert_ne!(test_hash("pw"), test_hash("pw"));
    }

    #[test]
    fn garbage_hash_never_verifies() {
        assert!(!verify_password("pw", "not-a-phc-string"));
        assert!(!verify_password("", ""));
    }
}
