/// Credential hashing and placeholder detection for the seeded account
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use mongodb::bson::{Bson, Document};

use crate::error::{VigiaError, VigiaResult};

/// Literal written by seeding scripts that expect the application to hash it
pub const PLACEHOLDER_PASSWORD: &str = "admin_temp_will_be_hashed_by_app";

/// Hash a password as an Argon2id PHC string
pub fn hash_password(password: &str) -> VigiaResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| VigiaError::internal(format!("password hashing failed: {}", e)))
}

/// Check a password against a stored PHC string. Unparseable hashes never match.
pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Whether an account document still carries a temporary credential
pub fn is_placeholder(account: &Document) -> bool {
    let marked = match account.get("temp_password") {
        None | Some(Bson::Null) => false,
        Some(Bson::Boolean(flag)) => *flag,
        Some(Bson::String(value)) => !value.is_empty(),
        Some(_) => true,
    };
    if marked {
        return true;
    }

    match account.get_str("password") {
        Ok(password) => password.is_empty() || password == PLACEHOLDER_PASSWORD,
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("s3cret").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("s3cret", &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn test_hashes_are_salted() {
        let first = hash_password("same").unwrap();
        let second = hash_password("same").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_verify_rejects_garbage_hash() {
        assert!(!verify_password("anything", "not-a-phc-string"));
    }

    #[test]
    fn test_placeholder_markers() {
        assert!(is_placeholder(&doc! { "username": "admin", "password": PLACEHOLDER_PASSWORD }));
        assert!(is_placeholder(&doc! { "username": "admin", "password": "x", "temp_password": true }));
        assert!(is_placeholder(&doc! { "username": "admin", "password": "x", "temp_password": "admin" }));
        assert!(is_placeholder(&doc! { "username": "admin", "password": "" }));
        assert!(is_placeholder(&doc! { "username": "admin" }));

        let hash = hash_password("admin").unwrap();
        assert!(!is_placeholder(&doc! { "username": "admin", "password": hash.clone() }));
        assert!(!is_placeholder(&doc! { "username": "admin", "password": hash, "temp_password": false }));
    }
}
