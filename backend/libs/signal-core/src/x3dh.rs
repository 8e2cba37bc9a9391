//! X3DH key agreement
//!
//! ```text
//! DH1 = DH(IK_A, SPK_B)
//! DH2 = DH(EK_A, IK_B)
//! DH3 = DH(EK_A, SPK_B)
//! DH4 = DH(EK_A, OPK_B)        only when a one-time prekey was claimed
//! SK  = HKDF(0xFF * 32 || DH1 || DH2 || DH3 [|| DH4], "Signal_X3DH")
//! AD  = IK_A || IK_B
//! ```

use zeroize::Zeroize;

use crate::kdf::{derive_secret, X3DH_INFO};
use crate::keys::{IdentityKey, IdentityKeyPair, KeyPair, Prekey, PrekeyBundle};
use crate::SignalError;

const DOMAIN_PREFIX: [u8; 32] = [0xFF; 32];

/// Initiator's result: the shared secret plus what the responder needs
/// to reproduce it
pub struct InitiatorHandshake {
    pub shared_secret: [u8; 32],
    pub ephemeral_public: [u8; 32],
    pub signed_prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
}

impl Drop for InitiatorHandshake {
    fn drop(&mut self) {
        self.shared_secret.zeroize();
    }
}

impl std::fmt::Debug for InitiatorHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitiatorHandshake")
            .field("ephemeral_public", &self.ephemeral_public)
            .field("signed_prekey_id", &self.signed_prekey_id)
            .field("one_time_prekey_id", &self.one_time_prekey_id)
            .finish_non_exhaustive()
    }
}

/// Run the initiator half against a recipient's bundle
///
/// Every prekey in the bundle must carry a valid signature from the
/// bundle's identity key.
pub fn initiate(
    identity: &IdentityKeyPair,
    bundle: &PrekeyBundle,
) -> Result<InitiatorHandshake, SignalError> {
    bundle.signed_prekey.verify(&bundle.identity_key)?;
    if let Some(one_time) = &bundle.one_time_prekey {
        one_time.verify(&bundle.identity_key)?;
    }

    let ephemeral = KeyPair::generate()?;
    let recipient_identity = &bundle.identity_key.dh_public;
    let signed_prekey = &bundle.signed_prekey.public_key;

    let mut outputs = vec![
        identity.dh().diffie_hellman(signed_prekey),
        ephemeral.diffie_hellman(recipient_identity),
        ephemeral.diffie_hellman(signed_prekey),
    ];
    if let Some(one_time) = &bundle.one_time_prekey {
        outputs.push(ephemeral.diffie_hellman(&one_time.public_key));
    }

    let shared_secret = combine(&mut outputs)?;

    Ok(InitiatorHandshake {
        shared_secret,
        ephemeral_public: *ephemeral.public(),
        signed_prekey_id: bundle.signed_prekey.key_id,
        one_time_prekey_id: bundle.one_time_prekey.as_ref().map(|p| p.key_id),
    })
}

/// Reproduce the initiator's shared secret from the responder's private keys
pub fn respond(
    identity: &IdentityKeyPair,
    signed_prekey: &Prekey,
    one_time_prekey: Option<&Prekey>,
    their_identity: &IdentityKey,
    their_ephemeral: &[u8; 32],
) -> Result<[u8; 32], SignalError> {
    let mut outputs = vec![
        signed_prekey
            .key_pair
            .diffie_hellman(&their_identity.dh_public),
        identity.dh().diffie_hellman(their_ephemeral),
        signed_prekey.key_pair.diffie_hellman(their_ephemeral),
    ];
    if let Some(one_time) = one_time_prekey {
        outputs.push(one_time.key_pair.diffie_hellman(their_ephemeral));
    }

    combine(&mut outputs)
}

/// Associated data both peers bind into the chain started by a handshake:
/// the initiator's identity DH key followed by the responder's
pub fn associated_data(initiator: &IdentityKey, responder: &IdentityKey) -> [u8; 64] {
    let mut ad = [0u8; 64];
    ad[..32].copy_from_slice(&initiator.dh_public);
    ad[32..].copy_from_slice(&responder.dh_public);
    ad
}

fn combine(outputs: &mut [[u8; 32]]) -> Result<[u8; 32], SignalError> {
    // low-order points produce an all-zero shared value
    let result = if outputs.iter().any(|dh| dh.iter().all(|b| *b == 0)) {
        Err(SignalError::InvalidKey)
    } else {
        let mut parts: Vec<&[u8]> = Vec::with_capacity(outputs.len() + 1);
        parts.push(&DOMAIN_PREFIX);
        parts.extend(outputs.iter().map(|dh| dh.as_slice()));
        derive_secret(&parts, X3DH_INFO)
    };

    for dh in outputs.iter_mut() {
        dh.zeroize();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recipient {
        identity: IdentityKeyPair,
        signed: Prekey,
        one_time: Prekey,
    }

    fn recipient() -> Recipient {
        let identity = IdentityKeyPair::generate().unwrap();
        let signed = Prekey::generate(1, &identity).unwrap();
        let one_time = Prekey::generate(100, &identity).unwrap();
        Recipient {
            identity,
            signed,
            one_time,
        }
    }

    fn bundle(r: &Recipient, with_one_time: bool) -> PrekeyBundle {
        PrekeyBundle {
            identity_key: r.identity.public(),
            signed_prekey: r.signed.public(),
            one_time_prekey: with_one_time.then(|| r.one_time.public()),
        }
    }

    #[test]
    fn test_both_sides_agree_with_one_time_prekey() {
        let alice = IdentityKeyPair::generate().unwrap();
        let bob = recipient();

        let handshake = initiate(&alice, &bundle(&bob, true)).unwrap();
        assert_eq!(handshake.one_time_prekey_id, Some(100));

        let secret = respond(
            &bob.identity,
            &bob.signed,
            Some(&bob.one_time),
            &alice.public(),
            &handshake.ephemeral_public,
        )
        .unwrap();
        assert_eq!(secret, handshake.shared_secret);
    }

    #[test]
    fn test_both_sides_agree_without_one_time_prekey() {
        let alice = IdentityKeyPair::generate().unwrap();
        let bob = recipient();

        let handshake = initiate(&alice, &bundle(&bob, false)).unwrap();
        assert_eq!(handshake.one_time_prekey_id, None);

        let secret = respond(
            &bob.identity,
            &bob.signed,
            None,
            &alice.public(),
            &handshake.ephemeral_public,
        )
        .unwrap();
        assert_eq!(secret, handshake.shared_secret);
    }

    #[test]
    fn test_fresh_ephemeral_per_handshake() {
        let alice = IdentityKeyPair::generate().unwrap();
        let bob = recipient();
        let first = initiate(&alice, &bundle(&bob, false)).unwrap();
        let second = initiate(&alice, &bundle(&bob, false)).unwrap();
        assert_ne!(first.shared_secret, second.shared_secret);
    }

    #[test]
    fn test_identity_bytes_are_not_the_secret() {
        let alice = IdentityKeyPair::generate().unwrap();
        let bob = recipient();
        let handshake = initiate(&alice, &bundle(&bob, true)).unwrap();
        assert_ne!(handshake.shared_secret, bob.identity.public().dh_public);
    }

    #[test]
    fn test_forged_signed_prekey_rejected() {
        let alice = IdentityKeyPair::generate().unwrap();
        let bob = recipient();
        let mallory = IdentityKeyPair::generate().unwrap();

        let mut forged = bundle(&bob, false);
        forged.signed_prekey = Prekey::generate(1, &mallory).unwrap().public();
        assert_eq!(
            initiate(&alice, &forged).err(),
            Some(SignalError::InvalidSignature)
        );
    }

    #[test]
    fn test_low_order_point_rejected() {
        let alice = IdentityKeyPair::generate().unwrap();
        let bob = recipient();
        let result = respond(
            &bob.identity,
            &bob.signed,
            None,
            &alice.public(),
            &[0u8; 32],
        );
        assert_eq!(result, Err(SignalError::InvalidKey));
    }

    #[test]
    fn test_associated_data_is_ordered() {
        let alice = IdentityKeyPair::generate().unwrap().public();
        let bob = IdentityKeyPair::generate().unwrap().public();

        let ad = associated_data(&alice, &bob);
        assert_eq!(&ad[..32], &alice.dh_public);
        assert_eq!(&ad[32..], &bob.dh_public);
        assert_ne!(ad, associated_data(&bob, &alice));
    }
}
