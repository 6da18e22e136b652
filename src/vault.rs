// 应用层加解密：账户凭据与会话数据密文入库，明文只在内存中使用。
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use anyhow::{anyhow, Result};
use argon2::password_hash::rand_core::{OsRng, RngCore};
use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::{Digest, Sha256};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

const IV_LEN: usize = 16;
const TAG_LEN: usize = 32;

/// Symmetric vault for small credential/session blobs.
///
/// Ciphertext layout is `base64(iv || aes-256-cbc(body) || hmac-sha256 tag)`;
/// the tag covers `iv || body`. Encryption and MAC keys are both derived from
/// the configured secret with distinct labels.
pub struct SecretVault {
    enc_key: [u8; 32],
    mac_key: [u8; 32],
}

impl SecretVault {
    pub fn new(secret_key: &str) -> Self {
        let secret = secret_key.trim();
        Self {
            enc_key: derive_key(secret, "enc"),
            mac_key: derive_key(secret, "mac"),
        }
    }

    pub fn encrypt_json(&self, value: &Value) -> Result<String> {
        let plain = serde_json::to_vec(value)?;
        let message_len = plain.len();
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        // In-place padding buffer: PKCS#7 adds at most one block.
        let mut buffer = plain;
        buffer.resize(message_len + IV_LEN, 0);
        let cipher_len = Aes256CbcEnc::new((&self.enc_key).into(), (&iv).into())
            .encrypt_padded_mut::<Pkcs7>(&mut buffer, message_len)
            .map_err(|_| anyhow!("failed to encrypt payload"))?
            .len();
        buffer.truncate(cipher_len);

        let mut output = Vec::with_capacity(IV_LEN + buffer.len() + TAG_LEN);
        output.extend_from_slice(&iv);
        output.extend_from_slice(&buffer);
        let mut mac = HmacSha256::new_from_slice(&self.mac_key)
            .map_err(|_| anyhow!("invalid mac key length"))?;
        mac.update(&output);
        output.extend_from_slice(&mac.finalize().into_bytes());
        Ok(base64::engine::general_purpose::STANDARD.encode(output))
    }

    pub fn decrypt_json(&self, encoded: &str) -> Result<Value> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|_| anyhow!("encrypted payload is not base64"))?;
        if raw.len() < IV_LEN + TAG_LEN {
            return Err(anyhow!("encrypted payload too short"));
        }
        let (body, tag) = raw.split_at(raw.len() - TAG_LEN);
        let mut mac = HmacSha256::new_from_slice(&self.mac_key)
            .map_err(|_| anyhow!("invalid mac key length"))?;
        mac.update(body);
        mac.verify_slice(tag)
            .map_err(|_| anyhow!("encrypted payload failed authentication"))?;

        let iv = &body[..IV_LEN];
        let mut cipher_text = body[IV_LEN..].to_vec();
        let plain = Aes256CbcDec::new((&self.enc_key).into(), iv.into())
            .decrypt_padded_mut::<Pkcs7>(&mut cipher_text)
            .map_err(|_| anyhow!("failed to decrypt payload"))?;
        serde_json::from_slice(plain).map_err(|_| anyhow!("decrypted payload is not valid json"))
    }
}

fn derive_key(secret: &str, label: &str) -> [u8; 32] {
    Sha256::digest(format!("{secret}:{label}").as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let vault = SecretVault::new("unit-test-secret");
        let value = json!({ "password": "hunter2", "note": "第三方站点凭据" });
        let encoded = vault.encrypt_json(&value).unwrap();
        assert_ne!(encoded, value.to_string());
        assert_eq!(vault.decrypt_json(&encoded).unwrap(), value);
    }

    #[test]
    fn fresh_iv_per_encryption() {
        let vault = SecretVault::new("unit-test-secret");
        let value = json!({ "token": "abc" });
        let first = vault.encrypt_json(&value).unwrap();
        let second = vault.encrypt_json(&value).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let vault = SecretVault::new("unit-test-secret");
        let encoded = vault.encrypt_json(&json!({ "token": "abc" })).unwrap();
        let mut raw = base64::engine::general_purpose::STANDARD
            .decode(&encoded)
            .unwrap();
        raw[IV_LEN] ^= 0x01;
        let tampered = base64::engine::general_purpose::STANDARD.encode(raw);
        let err = vault.decrypt_json(&tampered).unwrap_err();
        assert!(err.to_string().contains("authentication"));
    }

    #[test]
    fn wrong_key_is_rejected() {
        let vault = SecretVault::new("unit-test-secret");
        let other = SecretVault::new("another-secret");
        let encoded = vault.encrypt_json(&json!({ "token": "abc" })).unwrap();
        assert!(other.decrypt_json(&encoded).is_err());
    }

    #[test]
    fn garbage_input_is_rejected() {
        let vault = SecretVault::new("unit-test-secret");
        assert!(vault.decrypt_json("not base64 at all!").is_err());
        assert!(vault.decrypt_json("AAAA").is_err());
    }
}
