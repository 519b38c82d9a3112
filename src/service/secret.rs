use crate::types::{ConnectionParams, CredentialRecord, RequestKey, SecretKey};
use chrono::Utc;
use rand::Rng;
use rand::rngs::OsRng;

/// Characters that never need quoting in SQL literals, URLs or shell env files.
const PASSWORD_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const MIN_PASSWORD_LEN: usize = 16;

pub fn generate_password(len: usize) -> String {
    let mut rng = OsRng;
    (0..len.max(MIN_PASSWORD_LEN))
        .map(|_| PASSWORD_ALPHABET[rng.gen_range(0..PASSWORD_ALPHABET.len())] as char)
        .collect()
}

/// Build the record that should be stored for `params`.
///
/// A new password is generated when `reset` is set or nothing was stored yet;
/// otherwise the stored password and rotation marker are carried over.
pub fn materialize(
    key: &SecretKey,
    owner: &RequestKey,
    params: &ConnectionParams,
    existing: Option<&CredentialRecord>,
    reset: bool,
    password_length: usize,
) -> CredentialRecord {
    let base = CredentialRecord {
        key: key.clone(),
        owner: owner.clone(),
        host: params.host.clone(),
        port: params.port,
        database: params.database.clone(),
        username: params.username.clone(),
        password: String::new(),
        generation: 0,
        rotated_at: Utc::now(),
        rotate_requested: false,
    };

    match existing {
        Some(prev) if !reset => CredentialRecord {
            password: prev.password.clone(),
            generation: prev.generation,
            rotated_at: prev.rotated_at,
            rotate_requested: prev.rotate_requested,
            ..base
        },
        prev => CredentialRecord {
            password: generate_password(password_length),
            generation: prev.map_or(0, |p| p.generation) + 1,
            ..base
        },
    }
}
