//! Threshold signature verification.
//!
//! Verification is a pure function of a digest, the signatures
//! attached to a document and the key set authorised for the role.
//! Signatures that do not verify, name a key outside the set or use
//! an unsupported method are ignored rather than treated as fatal,
//! so a document carrying stray signatures next to enough good ones
//! still passes.  A key that signs twice is counted once.

use std::collections::BTreeSet;

use ed25519_dalek::Verifier;

use crate::tuf::{AuthorizedKeys, Digest, KeyId, Signature};

/// Count distinct authorised keys with a valid signature over
/// `digest`.
pub fn count_valid_signatures(
    digest: &Digest,
    signatures: &[Signature],
    authorized: &AuthorizedKeys,
) -> usize {
    let mut valid: BTreeSet<&KeyId> = BTreeSet::new();
    for sig in signatures {
        if valid.contains(&sig.keyid) {
            continue;
        }
        let Some(public) = authorized.keys.get(&sig.keyid) else {
            continue;
        };
        let (Some(key), Some(signature)) = (public.verifying_key(), sig.as_ed25519()) else {
            continue;
        };
        if key.verify(digest, &signature).is_ok() {
            valid.insert(&sig.keyid);
        }
    }
    valid.len()
}

/// Whether `signatures` meet the threshold of `authorized`.  A
/// misconfigured role (no keys, or a threshold of zero) never
/// verifies.
pub fn verify(digest: &Digest, signatures: &[Signature], authorized: &AuthorizedKeys) -> bool {
    if authorized.keys.is_empty() || authorized.threshold == 0 {
        return false;
    }
    count_valid_signatures(digest, signatures, authorized) >= authorized.threshold as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuf::canonical::sha256;
    use crate::tuf::PublicKey;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    struct Fixture {
        keys: Vec<SigningKey>,
        digest: Digest,
    }

    impl Fixture {
        fn new(n: usize) -> Self {
            Self {
                keys: (0..n).map(|_| SigningKey::generate(&mut OsRng)).collect(),
                digest: sha256(b"payload"),
            }
        }

        fn id(&self, i: usize) -> KeyId {
            PublicKey::from_ed25519(&self.keys[i].verifying_key()).key_id()
        }

        fn authorized(&self, threshold: u32) -> AuthorizedKeys {
            AuthorizedKeys {
                keys: self
                    .keys
                    .iter()
                    .map(|k| {
                        let public = PublicKey::from_ed25519(&k.verifying_key());
                        (public.key_id(), public)
                    })
                    .collect(),
                threshold,
            }
        }

        fn sign(&self, i: usize) -> Signature {
            Signature::from_ed25519(self.id(i), &self.keys[i].sign(&self.digest))
        }
    }

    #[test]
    fn meets_threshold_with_distinct_keys() {
        let f = Fixture::new(3);
        let sigs = vec![f.sign(0), f.sign(2)];
        assert!(verify(&f.digest, &sigs, &f.authorized(2)));
        assert!(!verify(&f.digest, &sigs, &f.authorized(3)));
    }

    #[test]
    fn duplicate_signatures_count_once() {
        let f = Fixture::new(2);
        let sigs = vec![f.sign(0), f.sign(0), f.sign(0)];
        assert_eq!(count_valid_signatures(&f.digest, &sigs, &f.authorized(2)), 1);
        assert!(!verify(&f.digest, &sigs, &f.authorized(2)));
    }

    #[test]
    fn garbage_signatures_are_ignored() {
        let f = Fixture::new(2);
        let outsider = SigningKey::generate(&mut OsRng);
        let outsider_id = PublicKey::from_ed25519(&outsider.verifying_key()).key_id();
        let mut forged = f.sign(1);
        forged.sig = f.sign(0).sig;
        let sigs = vec![
            Signature::from_ed25519(outsider_id, &outsider.sign(&f.digest)),
            forged,
            Signature {
                keyid: f.id(1),
                method: "ed25519".into(),
                sig: "%%%".into(),
            },
            f.sign(0),
        ];
        assert_eq!(count_valid_signatures(&f.digest, &sigs, &f.authorized(1)), 1);
        assert!(verify(&f.digest, &sigs, &f.authorized(1)));
    }

    #[test]
    fn signature_over_other_digest_is_invalid() {
        let f = Fixture::new(1);
        let sig = Signature::from_ed25519(f.id(0), &f.keys[0].sign(&sha256(b"other")));
        assert!(!verify(&f.digest, &[sig], &f.authorized(1)));
    }

    #[test]
    fn misconfigured_roles_never_verify() {
        let f = Fixture::new(1);
        let sigs = vec![f.sign(0)];
        assert!(!verify(&f.digest, &sigs, &f.authorized(0)));
        assert!(!verify(&f.digest, &sigs, &AuthorizedKeys::default()));
    }
}
