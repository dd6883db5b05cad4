use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::{Error, Result};

type HmacSha1 = Hmac<Sha1>;

const TIME_STEP_SECS: u64 = 30;
const DIGITS: u32 = 6;

/// Generates the RFC 6238 one-time code (SHA-1, 30 s step, 6 digits) for `unix_time`.
///
/// `secret` is the base32 string shown when the authenticator app was enrolled.
/// Spaces, lowercase letters and `=` padding are accepted.
pub fn generate_totp(secret: &str, unix_time: u64) -> Result<String> {
    let key = decode_secret(secret)?;
    let counter = unix_time / TIME_STEP_SECS;

    let mut mac = HmacSha1::new_from_slice(&key).map_err(|e| Error::TotpError(e.to_string()))?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = usize::from(digest[digest.len() - 1] & 0x0f);
    let binary = (u32::from(digest[offset]) & 0x7f) << 24
        | u32::from(digest[offset + 1]) << 16
        | u32::from(digest[offset + 2]) << 8
        | u32::from(digest[offset + 3]);

    Ok(format!("{:0width$}", binary % 10u32.pow(DIGITS), width = DIGITS as usize))
}

fn decode_secret(secret: &str) -> Result<Vec<u8>> {
    let cleaned: String = secret.chars().filter(|c| !c.is_whitespace() && *c != '=').map(|c| c.to_ascii_uppercase()).collect();

    if cleaned.is_empty() {
        return Err(Error::TotpError("TOTP secret is empty".to_string()));
    }

    base32::decode(base32::Alphabet::RFC4648 { padding: false }, &cleaned)
        .filter(|key| !key.is_empty())
        .ok_or_else(|| Error::TotpError("TOTP secret is not valid base32".to_string()))
}
