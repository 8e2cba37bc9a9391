use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::SignalError;

type HmacSha256 = Hmac<Sha256>;

pub const ROOT_LABEL: &[u8] = b"Signal_Root";
pub const CHAIN_LABEL: &[u8] = b"Signal_Chain";
pub const X3DH_INFO: &[u8] = b"Signal_X3DH";

const MESSAGE_KEY_SEED: [u8; 1] = [0x01];
const CHAIN_KEY_SEED: [u8; 1] = [0x02];

/// HKDF-SHA256 over the concatenation of `dh_outputs` with a fixed `info`
///
/// Deterministic: the same inputs always yield the same 32 bytes.
pub fn derive_secret(dh_outputs: &[&[u8]], info: &[u8]) -> Result<[u8; 32], SignalError> {
    let mut ikm: Vec<u8> = dh_outputs.iter().flat_map(|o| o.iter().copied()).collect();

    let hk = Hkdf::<Sha256>::new(None, &ikm);
    let mut okm = [0u8; 32];
    let result = hk.expand(info, &mut okm).map_err(|_| SignalError::Kdf);
    ikm.zeroize();
    result?;

    Ok(okm)
}

pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], SignalError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| SignalError::InvalidKey)?;
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Constant-time MAC check
pub(crate) fn verify_hmac_sha256(key: &[u8], data: &[u8], tag: &[u8]) -> Result<(), SignalError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| SignalError::InvalidKey)?;
    mac.update(data);
    mac.verify_slice(tag).map_err(|_| SignalError::Authentication)
}

/// One step of the symmetric chain: `(message_key, next_chain_key)`
///
/// The previous chain key cannot be recovered from either output.
pub(crate) fn chain_step(chain_key: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), SignalError> {
    let message_key = hmac_sha256(chain_key, &MESSAGE_KEY_SEED)?;
    let next_chain_key = hmac_sha256(chain_key, &CHAIN_KEY_SEED)?;
    Ok((message_key, next_chain_key))
}
