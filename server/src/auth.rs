//! Auth tokens that let a returning browser resume its user record.
//!
//! A token is `base64url(user id) "." hex(hmac_sha256(secret, user id))`. It
//! carries no expiry: it is a bearer credential for one user id and nothing
//! more.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use shared::UserId;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct TokenIssuer {
    /// Keyed but never fed; cloned for every signature.
    mac: HmacSha256,
}

impl TokenIssuer {
    /// Without a configured secret, tokens only survive as long as the process.
    pub fn new(secret: Option<&str>) -> Self {
        let secret = match secret {
            Some(secret) if !secret.is_empty() => secret.as_bytes().to_vec(),
            _ => {
                let mut bytes = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                bytes
            }
        };
        let mac = HmacSha256::new_from_slice(&secret).expect("HMAC can take a key of any size");
        Self { mac }
    }

    fn mac(&self, user: &str) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(user.as_bytes());
        mac
    }

    pub fn issue(&self, user: &UserId) -> String {
        let tag = self.mac(user.as_str()).finalize().into_bytes();
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(user.as_str()),
            hex::encode(tag)
        )
    }

    /// Returns the user id a token was issued for, if the signature checks out.
    /// The comparison runs in constant time.
    pub fn verify(&self, token: &str) -> Option<UserId> {
        let (encoded, signature) = token.split_once('.')?;
        let bytes = URL_SAFE_NO_PAD.decode(encoded).ok()?;
        let user = String::from_utf8(bytes).ok()?;
        if user.is_empty() {
            return None;
        }
        let signature = hex::decode(signature).ok()?;
        self.mac(&user).verify_slice(&signature).ok()?;
        Some(UserId::from(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issued_token_verifies() {
        let issuer = TokenIssuer::new(Some("secret"));
        let user = UserId::from("3f2a");
        let token = issuer.issue(&user);
        assert_eq!(issuer.verify(&token), Some(user));
    }

    #[test]
    fn test_signature_is_hmac_sha256() {
        // RFC 4231, test case 2
        let issuer = TokenIssuer::new(Some("Jefe"));
        let token = issuer.issue(&UserId::from("what do ya want for nothing?"));
        let (_, signature) = token.split_once('.').unwrap();
        assert_eq!(
            signature,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_token_from_other_secret_is_rejected() {
        let ours = TokenIssuer::new(Some("secret"));
        let theirs = TokenIssuer::new(Some("other"));
        let token = theirs.issue(&UserId::from("3f2a"));
        assert_eq!(ours.verify(&token), None);
    }

    #[test]
    fn test_tampered_token_is_rejected() {
        let issuer = TokenIssuer::new(None);
        let token = issuer.issue(&UserId::from("alice"));
        let (encoded, signature) = token.split_once('.').unwrap();
        let forged = format!("{}.{}", URL_SAFE_NO_PAD.encode("mallory"), signature);
        let truncated = format!("{}.{}", encoded, &signature[..62]);
        let flipped = format!(
            "{}.{}{}",
            encoded,
            &signature[..63],
            if signature.ends_with('0') { '1' } else { '0' }
        );

        assert_eq!(issuer.verify(&forged), None);
        assert_eq!(issuer.verify(&truncated), None);
        assert_eq!(issuer.verify(&flipped), None);
        assert_eq!(issuer.verify("not-a-token"), None);
        assert_eq!(issuer.verify(""), None);
    }
}
