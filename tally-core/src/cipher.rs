//! Keyed shift transform applied to datagram text.
//!
//! Obscures wire bytes only; it is trivially breakable. Shift = number of
//! characters in the key. Characters outside [`ALPHABET`] pass through, so the
//! transform is a bijection on any text and `decrypt(encrypt(t, k), k) == t`.

pub const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789 .,!?";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    #[error("transform key is empty")]
    EmptyKey,
}

pub fn encrypt(plain: &str, key: &str) -> Result<String, CipherError> {
    Ok(shift_text(plain, shift_for(key)?))
}

pub fn decrypt(cipher: &str, key: &str) -> Result<String, CipherError> {
    Ok(shift_text(cipher, -shift_for(key)?))
}

fn shift_for(key: &str) -> Result<i64, CipherError> {
    match key.chars().count() {
        0 => Err(CipherError::EmptyKey),
        n => Ok(n as i64),
    }
}

fn shift_text(text: &str, shift: i64) -> String {
    let len = ALPHABET.len() as i64;
    text.chars()
        .map(|c| {
            if !c.is_ascii() {
                return c;
            }
            match ALPHABET.iter().position(|&b| b == c as u8) {
                Some(idx) => ALPHABET[(idx as i64 + shift).rem_euclid(len) as usize] as char,
                None => c,
            }
        })
        .collect()
}
