//! Canonical naming for the server-side objects and the credential record of a request.
//!
//! The role and the database share one identity. It must stay injective over
//! distinct requests and fit PostgreSQL's 63-byte identifier limit.

use crate::error::ProvisionerError;
use crate::types::{RequestKey, SecretKey};
use sha2::{Digest, Sha256};

/// PostgreSQL `NAMEDATALEN - 1`.
pub const MAX_IDENTIFIER_LEN: usize = 63;

const SECRET_PREFIX: &str = "database-creds-";
const HASH_HEX_LEN: usize = 16;
const TRUNCATION_MARK: char = '~';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedNames {
    pub role_name: String,
    pub database_name: String,
    pub secret_key: SecretKey,
}

/// Derive role, database and secret names for `key`.
pub fn derive(key: &RequestKey) -> Result<DerivedNames, ProvisionerError> {
    validate(key)?;

    let identity = fit_identifier(canonical(key), key);
    Ok(DerivedNames {
        role_name: identity.clone(),
        database_name: identity,
        secret_key: SecretKey {
            namespace: key.namespace.clone(),
            name: format!("{SECRET_PREFIX}{}", key.name),
        },
    })
}

pub fn validate(key: &RequestKey) -> Result<(), ProvisionerError> {
    if !is_dns_label(&key.namespace) {
        return Err(ProvisionerError::InvalidIdentity(format!(
            "namespace `{}` is not a DNS-1123 label",
            key.namespace
        )));
    }
    if !is_dns_subdomain(&key.name) {
        return Err(ProvisionerError::InvalidIdentity(format!(
            "name `{}` is not a DNS-1123 subdomain",
            key.name
        )));
    }
    Ok(())
}

/// `ns-name` when `name` has no `-` (the last `-` is then the separator),
/// otherwise `ns_name`. `_` is never valid inside either part, so the two
/// shapes cannot produce the same string.
fn canonical(key: &RequestKey) -> String {
    if key.name.contains('-') {
        format!("{}_{}", key.namespace, key.name)
    } else {
        format!("{}-{}", key.namespace, key.name)
    }
}

fn fit_identifier(canonical: String, key: &RequestKey) -> String {
    if canonical.len() <= MAX_IDENTIFIER_LEN {
        return canonical;
    }

    let mut hasher = Sha256::new();
    hasher.update(key.namespace.as_bytes());
    hasher.update([0u8]);
    hasher.update(key.name.as_bytes());
    let digest = hasher.finalize();
    let hash: String = digest
        .iter()
        .flat_map(|b| [b >> 4, b & 0x0f])
        .take(HASH_HEX_LEN)
        .map(|nibble| char::from_digit(nibble as u32, 16).unwrap_or('0'))
        .collect();

    // canonical is ASCII, byte slicing is safe
    let prefix_len = MAX_IDENTIFIER_LEN - HASH_HEX_LEN - TRUNCATION_MARK.len_utf8();
    format!("{}{TRUNCATION_MARK}{hash}", &canonical[..prefix_len])
}

fn is_dns_label(s: &str) -> bool {
    (1..=63).contains(&s.len())
        && s.bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && alnum_ends(s)
}

fn is_dns_subdomain(s: &str) -> bool {
    (1..=253).contains(&s.len())
        && s.split('.').all(is_dns_label)
}

fn alnum_ends(s: &str) -> bool {
    let ok = |b: Option<&u8>| b.is_some_and(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
    let bytes = s.as_bytes();
    ok(bytes.first()) && ok(bytes.last())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;

    fn names(ns: &str, name: &str) -> DerivedNames {
        derive(&RequestKey::new(ns, name)).unwrap()
    }

    #[test]
    fn example_request_derives_readable_names() {
        let derived = names("team-a", "orders");
        assert_eq!(derived.role_name, "team-a-orders");
        assert_eq!(derived.database_name, "team-a-orders");
        assert_eq!(derived.secret_key.name, "database-creds-orders");
        assert_eq!(derived.secret_key.namespace, "team-a");
    }

    #[test]
    fn derivation_is_deterministic() {
        assert_eq!(names("ns", "db"), names("ns", "db"));
        let long = format!("{}.{}", "x".repeat(60), "y".repeat(60));
        assert_eq!(names("ns", &long), names("ns", &long));
    }

    #[test]
    fn naive_concatenation_collisions_are_separated() {
        let a = names("team-a", "orders");
        let b = names("team", "a-orders");
        assert_ne!(a.role_name, b.role_name);
        assert_eq!(b.role_name, "team_a-orders");

        let c = names("a-b", "c");
        let d = names("a", "b-c");
        assert_ne!(c.role_name, d.role_name);
    }

    #[test]
    fn exhaustive_small_alphabet_is_injective() {
        let parts = ["a", "b", "a-b", "b-a", "ab", "a-a", "a.b", "a-b.c", "a--b", "0"];
        let mut seen: HashMap<String, (String, String)> = HashMap::new();
        for ns in parts.iter().filter(|p| !p.contains('.')) {
            for name in parts {
                let derived = names(ns, name);
                if let Some(prev) = seen.insert(
                    derived.role_name.clone(),
                    (ns.to_string(), name.to_string()),
                ) {
                    panic!(
                        "{} collides: ({ns}, {name}) vs {:?}",
                        derived.role_name, prev
                    );
                }
            }
        }
    }

    #[test]
    fn random_pairs_never_collide() {
        const ALPHABET: &[u8] = b"ab-";
        let mut rng = StdRng::seed_from_u64(0x5eed);
        fn gen_part(rng: &mut StdRng, max: usize) -> String {
            loop {
                let len = rng.gen_range(1..=max);
                let s: String = (0..len)
                    .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
                    .collect();
                if alnum_ends(&s) {
                    return s;
                }
            }
        }

        let mut seen: HashMap<String, RequestKey> = HashMap::new();
        for _ in 0..5_000 {
            let key = RequestKey::new(gen_part(&mut rng, 12), gen_part(&mut rng, 63));
            let derived = derive(&key).unwrap();
            assert!(derived.role_name.len() <= MAX_IDENTIFIER_LEN);
            if let Some(prev) = seen.insert(derived.role_name.clone(), key.clone()) {
                assert_eq!(prev, key, "{} derived twice", derived.role_name);
            }
        }
    }

    #[test]
    fn long_identities_are_truncated_with_hash() {
        let long = format!("{}.{}", "a".repeat(50), "b".repeat(50));
        let derived = names("team-a", &long);
        assert_eq!(derived.role_name.len(), MAX_IDENTIFIER_LEN);
        assert!(derived.role_name.starts_with("team-a-aaaa"));
        assert_eq!(
            derived.role_name.chars().nth(MAX_IDENTIFIER_LEN - HASH_HEX_LEN - 1),
            Some(TRUNCATION_MARK)
        );

        let other = names("team-a", &format!("{long}b"));
        assert_ne!(derived.role_name, other.role_name);
    }

    #[test]
    fn boundary_length_is_kept_verbatim() {
        let name = "a".repeat(MAX_IDENTIFIER_LEN - "ns-".len());
        let derived = names("ns", &name);
        assert_eq!(derived.role_name, format!("ns-{name}"));
    }

    #[test]
    fn rejects_invalid_identities() {
        for (ns, name) in [
            ("", "db"),
            ("Team", "db"),
            ("team_a", "db"),
            ("-team", "db"),
            ("team", ""),
            ("team", "db-"),
            ("team", "a..b"),
            ("team", "we\"ird"),
            ("team", "drop table"),
        ] {
            let err = derive(&RequestKey::new(ns, name)).unwrap_err();
            assert!(
                matches!(err, ProvisionerError::InvalidIdentity(_)),
                "({ns}, {name}) should be rejected"
            );
        }
    }
}
