//! Decoder for the opaque payload Fragment attaches to a buy-link response.
//!
//! The payload is a base64 blob wrapping a BOC cell; the human-readable
//! transfer comment is embedded in its printable bytes. The decoded comment
//! is cosmetic only, so every failure mode degrades to an empty memo instead
//! of failing the purchase.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;

/// Pad a base64 string to a multiple of four with `=`.
///
/// Fragment strips trailing padding from the payload it returns; the decoder
/// below requires canonical padding.
pub fn fix_base64_padding(value: &str) -> String {
    let remainder = value.len() % 4;
    if remainder == 0 {
        return value.to_string();
    }
    let mut padded = String::with_capacity(value.len() + (4 - remainder));
    padded.push_str(value);
    for _ in 0..(4 - remainder) {
        padded.push('=');
    }
    padded
}

/// Extract the transfer comment from an encoded payload.
///
/// Bytes in the printable ASCII range [32, 126] map to their character,
/// everything else becomes a space; whitespace runs collapse to single
/// spaces. When the comment contains the `"<quantity> Telegram Stars"`
/// marker the text from that marker onward is returned, otherwise the whole
/// cleaned text.
pub fn decode_memo(encoded: &str, quantity: u32) -> String {
    let decoded = match BASE64_STANDARD.decode(fix_base64_padding(encoded)) {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!("Failed to decode payment payload: {err}");
            return String::new();
        }
    };

    let text: String = decoded
        .iter()
        .map(|&b| if (32..=126).contains(&b) { b as char } else { ' ' })
        .collect();
    let clean = text.split_whitespace().collect::<Vec<_>>().join(" ");

    let marker = format!("{quantity} Telegram Stars");
    match clean.find(&marker) {
        Some(index) => clean[index..].to_string(),
        None => clean,
    }
}
