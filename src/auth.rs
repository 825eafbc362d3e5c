//! Relay authentication token.
//!
//! The relay accepts a connection when `X-Auth-Token` equals the base64
//! HMAC-SHA256 of the device id keyed with the shared relay secret.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the relay auth token.
pub const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";

/// Compute the relay auth token for `device_id`. `None` only if the key is
/// rejected, which HMAC-SHA256 never does.
pub fn relay_auth_token(secret: &str, device_id: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(device_id.as_bytes());
    Some(BASE64.encode(mac.finalize().into_bytes()))
}

/// Check a presented token in constant time.
pub fn verify_relay_auth_token(secret: &str, device_id: &str, token: &str) -> bool {
    let Ok(presented) = BASE64.decode(token) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(device_id.as_bytes());
    mac.verify_slice(&presented).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_is_deterministic() {
        let a = relay_auth_token("test-secret", "550e8400-e29b-41d4-a716-446655440000").unwrap();
        let b = relay_auth_token("test-secret", "550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(a, b);
        // 32-byte digest in padded base64
        assert_eq!(a.len(), 44);
    }

    #[test]
    fn test_token_depends_on_secret_and_device() {
        let base = relay_auth_token("secret", "device-a").unwrap();
        assert_ne!(Some(&base), relay_auth_token("other", "device-a").as_ref());
        assert_ne!(Some(&base), relay_auth_token("secret", "device-b").as_ref());
    }

    #[test]
    fn test_verify() {
        let token = relay_auth_token("secret", "device-a").unwrap();
        assert!(verify_relay_auth_token("secret", "device-a", &token));
        assert!(!verify_relay_auth_token("secret", "device-b", &token));
        assert!(!verify_relay_auth_token("secret", "device-a", "not base64!"));
    }
}
