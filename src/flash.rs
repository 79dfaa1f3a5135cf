//! One-shot user messages carried across the post/redirect/get round trip in a
//! signed cookie.
//!
//! The message is base64url-encoded before signing so that `;`, `%` and non-ASCII
//! text survive the Set-Cookie / Cookie round trip byte for byte.

use actix_web::cookie::{Cookie, CookieJar, Key, SameSite};
use actix_web::HttpRequest;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

pub const FLASH_COOKIE: &str = "flash";

/// Longest message (in bytes) kept; the encoded cookie stays well under 4 KB.
pub const MAX_MESSAGE_BYTES: usize = 2048;

pub fn key_from_secret(secret: Option<&str>) -> Key {
    match secret {
        Some(s) => Key::derive_from(s.as_bytes()),
        None => {
            log::warn!("[FLASH] No secret_key configured; using a random signing key");
            Key::generate()
        }
    }
}

pub fn signed(key: &Key, message: &str) -> Option<Cookie<'static>> {
    let encoded = URL_SAFE_NO_PAD.encode(truncate(message, MAX_MESSAGE_BYTES));
    let mut jar = CookieJar::new();
    jar.signed_mut(key).add(
        Cookie::build(FLASH_COOKIE, encoded)
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax)
            .finish(),
    );
    jar.get(FLASH_COOKIE).cloned()
}

/// The pending message, if the request carries a flash cookie with a valid signature.
pub fn read(req: &HttpRequest, key: &Key) -> Option<String> {
    let raw = req.cookie(FLASH_COOKIE)?;
    let mut jar = CookieJar::new();
    jar.add_original(raw);
    let verified = jar.signed(key).get(FLASH_COOKIE)?;
    let bytes = URL_SAFE_NO_PAD.decode(verified.value()).ok()?;
    String::from_utf8(bytes).ok()
}

pub fn removal() -> Cookie<'static> {
    let mut c = Cookie::build(FLASH_COOKIE, "").path("/").finish();
    c.make_removal();
    c
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
