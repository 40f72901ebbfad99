use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};

/// Fixed GUID appended to the client key before hashing (RFC 6455 4.2.2).
pub const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Length of every `Sec-WebSocket-Accept` value: Base64 of a 20-byte digest.
pub const ACCEPT_KEY_LEN: usize = 28;

/// SHA-1 over `client_key || GUID`, Base64 encoded.
pub fn accept_key(client_key: &[u8]) -> String {
    let mut ctx = digest::Context::new(&digest::SHA1_FOR_LEGACY_USE_ONLY);
    ctx.update(client_key);
    ctx.update(WS_GUID);
    BASE64.encode(ctx.finish().as_ref())
}

/// Produces `Sec-WebSocket-Key` values from the system CSPRNG.
pub struct KeyGenerator {
    rng: SystemRandom,
}

impl KeyGenerator {
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
        }
    }

    /// Base64 of a fresh 16-byte nonce. `None` if the OS RNG is unavailable.
    pub fn generate(&self) -> Option<String> {
        let mut nonce = [0u8; 16];
        self.rng.fill(&mut nonce).ok()?;
        Some(BASE64.encode(nonce))
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc_sample_vector() {
        assert_eq!(
            accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn generated_keys_are_fresh_and_well_formed() {
        let keys = KeyGenerator::new();
        let a = keys.generate().unwrap();
        let b = keys.generate().unwrap();
        assert_ne!(a, b);
        assert_eq!(BASE64.decode(&a).unwrap().len(), 16);
        assert_eq!(accept_key(a.as_bytes()).len(), ACCEPT_KEY_LEN);
    }
}
