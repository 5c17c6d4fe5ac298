//! URL-safe base64 used for every payload in both directions.
//!
//! Encoding uses the `-`/`_` alphabet with padding stripped, so the output can
//! be dropped into a query string untouched. Decoding accepts padded or
//! unpadded input and ignores stray bits in the final symbol. This is
//! framing, not confidentiality.

use base64::{
    Engine,
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};

use crate::error::MalformedEncoding;

const WEBSAFE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Encode raw bytes as unpadded URL-safe base64.
#[must_use]
pub fn encode(bytes: &[u8]) -> String {
    WEBSAFE.encode(bytes)
}

/// Decode URL-safe base64, with or without trailing `=`.
///
/// # Errors
///
/// Returns [`MalformedEncoding`] if the input contains characters outside the
/// URL-safe alphabet or has a length of 1 (mod 4) once padding is removed.
pub fn decode(s: &str) -> Result<Vec<u8>, MalformedEncoding> {
    Ok(WEBSAFE.decode(s)?)
}
