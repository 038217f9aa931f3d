//! Identifier helpers: uuid7 values rendered as bech32m strings

use bech32::Bech32m;
use uuid7::uuid7;

/// Fresh uuid7 encoded as bech32m under `hrp`, e.g. `pending1...`.
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encoded = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encoded)
}

/// Like [`new_uuid_to_bech32`], falling back to the plain uuid7 text when
/// `hrp` is not a valid human-readable part.
pub fn new_prefixed_id(hrp: &str) -> String {
    new_uuid_to_bech32(hrp).unwrap_or_else(|_| uuid7().to_string())
}

/// Whether `id` is a bech32m string minted under `hrp`.
pub fn has_prefix(id: &str, hrp: &str) -> bool {
    match bech32::decode(id) {
        Ok((decoded, _)) => decoded.as_str() == hrp,
        Err(_) => false,
    }
}
