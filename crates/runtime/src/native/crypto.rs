//! Native cryptographic primitives backing the `crypto` global.
//!
//! Grounded in `hyperlight-js-runtime::modules::crypto` — the `Hmac` class
//! there is exposed to JS as a stateful, incremental handle; localflare
//! instead exposes one-shot `hmacSign`/`hmacVerify` functions matching the
//! WebCrypto `subtle.sign`/`subtle.verify` shape, but keeps the same
//! per-algorithm dispatch-by-match idiom the teacher uses in `Hmac::new`.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit as _, Nonce};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use hmac::digest::KeyInit as _;
use hmac::Mac;
use rand::RngCore;
use rquickjs::{Ctx, Exception, Result};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::BigUint;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

fn type_err<T>(ctx: &Ctx<'_>, msg: impl AsRef<str>) -> Result<T> {
    Err(Exception::throw_type(ctx, msg.as_ref()))
}

macro_rules! hmac_sign_with {
    ($hash:ty, $key:expr, $data:expr, $ctx:expr) => {{
        let mut mac = <hmac::Hmac<$hash> as hmac::digest::KeyInit>::new_from_slice($key)
            .map_err(|e| Exception::throw_type($ctx, &format!("Invalid HMAC key: {e}")))?;
        Mac::update(&mut mac, $data);
        Mac::finalize(mac).into_bytes().to_vec()
    }};
}

fn hmac_sign_dispatch(ctx: &Ctx<'_>, algorithm: &str, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    use sha2::{Sha256, Sha384, Sha512};
    Ok(match algorithm.to_ascii_lowercase().as_str() {
        "sha256" => hmac_sign_with!(Sha256, key, data, ctx),
        "sha384" => hmac_sign_with!(Sha384, key, data, ctx),
        "sha512" => hmac_sign_with!(Sha512, key, data, ctx),
        other => return type_err(ctx, format!("Unsupported HMAC algorithm: {other}")),
    })
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn biguint_to_b64url(n: &BigUint) -> String {
    URL_SAFE_NO_PAD.encode(n.to_bytes_be())
}

fn biguint_from_b64url(ctx: &Ctx<'_>, s: &str) -> Result<BigUint> {
    let bytes = URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|e| Exception::throw_type(ctx, &format!("invalid base64url in JWK: {e}")))?;
    Ok(BigUint::from_bytes_be(&bytes))
}

macro_rules! rsa_sign_with {
    ($hash:ty, $priv_key:expr, $data:expr) => {{
        use rsa::pkcs1v15::SigningKey;
        use rsa::signature::{SignatureEncoding, Signer};
        SigningKey::<$hash>::new($priv_key).sign($data.as_slice()).to_vec()
    }};
}

macro_rules! rsa_verify_with {
    ($hash:ty, $pub_key:expr, $data:expr, $sig:expr, $ctx:expr) => {{
        use rsa::pkcs1v15::{Signature, VerifyingKey};
        use rsa::signature::Verifier;
        let signature = Signature::try_from($sig.as_slice())
            .map_err(|e| Exception::throw_type($ctx, &format!("invalid RSA signature: {e}")))?;
        VerifyingKey::<$hash>::new($pub_key).verify($data, &signature).is_ok()
    }};
}

#[rquickjs::module(rename_vars = "camelCase")]
#[allow(clippy::module_inception)]
pub mod native_crypto {
    use super::*;

    /// SHA-1/256/384/512 or MD5 digest of `data`, returned as raw bytes.
    #[rquickjs::function]
    pub fn digest(ctx: Ctx<'_>, algorithm: String, data: rquickjs::Value<'_>) -> Result<Vec<u8>> {
        let bytes = super::as_bytes(&ctx, data)?;
        match algorithm.to_ascii_uppercase().as_str() {
            "SHA-1" | "SHA1" => {
                use sha1::Digest as _;
                Ok(sha1::Sha1::digest(&bytes).to_vec())
            }
            "SHA-256" | "SHA256" => {
                use sha2::Digest as _;
                Ok(sha2::Sha256::digest(&bytes).to_vec())
            }
            "SHA-384" | "SHA384" => {
                use sha2::Digest as _;
                Ok(sha2::Sha384::digest(&bytes).to_vec())
            }
            "SHA-512" | "SHA512" => {
                use sha2::Digest as _;
                Ok(sha2::Sha512::digest(&bytes).to_vec())
            }
            "MD5" => {
                use md5::Digest as _;
                Ok(md5::Md5::digest(&bytes).to_vec())
            }
            other => type_err(&ctx, format!("Unsupported digest algorithm: {other}")),
        }
    }

    /// HMAC-sign `data` with `key` using the named hash algorithm.
    #[rquickjs::function]
    pub fn hmac_sign(
        ctx: Ctx<'_>,
        algorithm: String,
        key: Vec<u8>,
        data: rquickjs::Value<'_>,
    ) -> Result<Vec<u8>> {
        let data = super::as_bytes(&ctx, data)?;
        hmac_sign_dispatch(&ctx, &algorithm, &key, &data)
    }

    /// HMAC-verify `signature` over `data` with `key`, constant-time.
    #[rquickjs::function]
    pub fn hmac_verify(
        ctx: Ctx<'_>,
        algorithm: String,
        key: Vec<u8>,
        data: rquickjs::Value<'_>,
        signature: Vec<u8>,
    ) -> Result<bool> {
        let data = super::as_bytes(&ctx, data)?;
        let actual = hmac_sign_dispatch(&ctx, &algorithm, &key, &data)?;
        Ok(constant_time_eq(&actual, &signature))
    }

    /// AES-GCM encrypt. Returns ciphertext with the 16-byte auth tag
    /// appended, matching the WebCrypto `AES-GCM` convention.
    #[rquickjs::function]
    pub fn aes_gcm_encrypt(
        ctx: Ctx<'_>,
        key: Vec<u8>,
        iv: Vec<u8>,
        additional_data: Option<Vec<u8>>,
        plaintext: rquickjs::Value<'_>,
    ) -> Result<Vec<u8>> {
        let plaintext = super::as_bytes(&ctx, plaintext)?;
        let cipher = aes_gcm_cipher(&ctx, &key)?;
        let nonce = Nonce::from_slice(&iv);
        let aad = additional_data.unwrap_or_default();
        cipher
            .encrypt(
                nonce,
                Payload {
                    msg: &plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| Exception::throw_internal(&ctx, "AES-GCM encryption failed"))
    }

    #[rquickjs::function]
    pub fn aes_gcm_decrypt(
        ctx: Ctx<'_>,
        key: Vec<u8>,
        iv: Vec<u8>,
        additional_data: Option<Vec<u8>>,
        ciphertext: rquickjs::Value<'_>,
    ) -> Result<Vec<u8>> {
        let ciphertext = super::as_bytes(&ctx, ciphertext)?;
        let cipher = aes_gcm_cipher(&ctx, &key)?;
        let nonce = Nonce::from_slice(&iv);
        let aad = additional_data.unwrap_or_default();
        cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| Exception::throw_type(&ctx, "AES-GCM decryption failed"))
    }

    #[rquickjs::function]
    pub fn aes_cbc_encrypt(
        ctx: Ctx<'_>,
        key: Vec<u8>,
        iv: Vec<u8>,
        plaintext: rquickjs::Value<'_>,
    ) -> Result<Vec<u8>> {
        let plaintext = super::as_bytes(&ctx, plaintext)?;
        if key.len() != 32 || iv.len() != 16 {
            return type_err(&ctx, "AES-CBC requires a 32-byte key and 16-byte iv");
        }
        let enc = Aes256CbcEnc::new(key.as_slice().into(), iv.as_slice().into());
        Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(&plaintext))
    }

    #[rquickjs::function]
    pub fn aes_cbc_decrypt(
        ctx: Ctx<'_>,
        key: Vec<u8>,
        iv: Vec<u8>,
        ciphertext: rquickjs::Value<'_>,
    ) -> Result<Vec<u8>> {
        let ciphertext = super::as_bytes(&ctx, ciphertext)?;
        if key.len() != 32 || iv.len() != 16 {
            return type_err(&ctx, "AES-CBC requires a 32-byte key and 16-byte iv");
        }
        let dec = Aes256CbcDec::new(key.as_slice().into(), iv.as_slice().into());
        dec.decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| Exception::throw_type(&ctx, "AES-CBC decryption failed"))
    }

    /// Generate `length_bytes` of cryptographically random key material
    /// (backs both `crypto.subtle.generateKey` and `crypto.getRandomValues`).
    #[rquickjs::function]
    pub fn generate_random_bytes(length_bytes: u32) -> Vec<u8> {
        let mut buf = vec![0u8; length_bytes as usize];
        rand::thread_rng().fill_bytes(&mut buf);
        buf
    }

    /// RFC-4122 version 4 UUID, lowercase hyphenated.
    #[rquickjs::function]
    pub fn random_uuid() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    #[rquickjs::function]
    pub fn base64_encode(data: Vec<u8>) -> String {
        STANDARD.encode(data)
    }

    #[rquickjs::function]
    pub fn base64_decode(ctx: Ctx<'_>, data: String) -> Result<Vec<u8>> {
        STANDARD
            .decode(data)
            .map_err(|e| Exception::throw_type(&ctx, &e.to_string()))
    }

    /// Generates an RSA key pair of `modulus_bits` bits. Returns
    /// `[spkiDer, pkcs8Der]` (public, private), the two DER encodings
    /// `crypto.subtle.exportKey("spki"/"pkcs8", ...)` hands back unchanged.
    #[rquickjs::function]
    pub fn rsa_generate_key_pair(ctx: Ctx<'_>, modulus_bits: u32) -> Result<Vec<Vec<u8>>> {
        use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey};
        let private = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), modulus_bits as usize)
            .map_err(|e| Exception::throw_internal(&ctx, &format!("RSA key generation failed: {e}")))?;
        let public = private.to_public_key();
        let pkcs8 = private
            .to_pkcs8_der()
            .map_err(|e| Exception::throw_internal(&ctx, &format!("RSA pkcs8 encode failed: {e}")))?;
        let spki = public
            .to_public_key_der()
            .map_err(|e| Exception::throw_internal(&ctx, &format!("RSA spki encode failed: {e}")))?;
        Ok(vec![spki.as_bytes().to_vec(), pkcs8.as_bytes().to_vec()])
    }

    /// RSASSA-PKCS1-v1_5 sign `data` with a PKCS#8-encoded private key.
    #[rquickjs::function]
    pub fn rsa_sign(ctx: Ctx<'_>, hash: String, pkcs8_der: Vec<u8>, data: Vec<u8>) -> Result<Vec<u8>> {
        use rsa::pkcs8::DecodePrivateKey;
        let private = rsa::RsaPrivateKey::from_pkcs8_der(&pkcs8_der)
            .map_err(|e| Exception::throw_type(&ctx, &format!("invalid RSA pkcs8 key: {e}")))?;
        Ok(match hash.to_ascii_lowercase().as_str() {
            "sha256" => rsa_sign_with!(sha2::Sha256, private, &data),
            "sha384" => rsa_sign_with!(sha2::Sha384, private, &data),
            "sha512" => rsa_sign_with!(sha2::Sha512, private, &data),
            other => return type_err(&ctx, format!("Unsupported RSA hash: {other}")),
        })
    }

    /// RSASSA-PKCS1-v1_5 verify `signature` over `data` with an SPKI-encoded
    /// public key.
    #[rquickjs::function]
    pub fn rsa_verify(
        ctx: Ctx<'_>,
        hash: String,
        spki_der: Vec<u8>,
        data: Vec<u8>,
        signature: Vec<u8>,
    ) -> Result<bool> {
        use rsa::pkcs8::DecodePublicKey;
        let public = rsa::RsaPublicKey::from_public_key_der(&spki_der)
            .map_err(|e| Exception::throw_type(&ctx, &format!("invalid RSA spki key: {e}")))?;
        Ok(match hash.to_ascii_lowercase().as_str() {
            "sha256" => rsa_verify_with!(sha2::Sha256, public, &data, &signature, &ctx),
            "sha384" => rsa_verify_with!(sha2::Sha384, public, &data, &signature, &ctx),
            "sha512" => rsa_verify_with!(sha2::Sha512, public, &data, &signature, &ctx),
            other => return type_err(&ctx, format!("Unsupported RSA hash: {other}")),
        })
    }

    /// Exports a public JWK (`{kty, n, e}`, JSON) from an SPKI-encoded key.
    #[rquickjs::function]
    pub fn rsa_jwk_from_spki(ctx: Ctx<'_>, spki_der: Vec<u8>) -> Result<String> {
        use rsa::pkcs8::DecodePublicKey;
        let public = rsa::RsaPublicKey::from_public_key_der(&spki_der)
            .map_err(|e| Exception::throw_type(&ctx, &format!("invalid RSA spki key: {e}")))?;
        Ok(format!(
            r#"{{"kty":"RSA","n":"{}","e":"{}"}}"#,
            super::biguint_to_b64url(public.n()),
            super::biguint_to_b64url(public.e()),
        ))
    }

    /// Exports a private JWK (`{kty, n, e, d, p, q}`, JSON) from a
    /// PKCS#8-encoded key. `dp`/`dq`/`qi` are optional per RFC 7518 and
    /// omitted here.
    #[rquickjs::function]
    pub fn rsa_jwk_from_pkcs8(ctx: Ctx<'_>, pkcs8_der: Vec<u8>) -> Result<String> {
        use rsa::pkcs8::DecodePrivateKey;
        let private = rsa::RsaPrivateKey::from_pkcs8_der(&pkcs8_der)
            .map_err(|e| Exception::throw_type(&ctx, &format!("invalid RSA pkcs8 key: {e}")))?;
        let primes = private.primes();
        if primes.len() < 2 {
            return type_err(&ctx, "RSA key is missing its prime factors");
        }
        Ok(format!(
            r#"{{"kty":"RSA","n":"{}","e":"{}","d":"{}","p":"{}","q":"{}"}}"#,
            super::biguint_to_b64url(private.n()),
            super::biguint_to_b64url(private.e()),
            super::biguint_to_b64url(private.d()),
            super::biguint_to_b64url(&primes[0]),
            super::biguint_to_b64url(&primes[1]),
        ))
    }

    /// Imports a public JWK (parsed on the JS side into its field strings)
    /// back into SPKI DER.
    #[rquickjs::function]
    pub fn rsa_spki_from_jwk(ctx: Ctx<'_>, n: String, e: String) -> Result<Vec<u8>> {
        use rsa::pkcs8::EncodePublicKey;
        let n = super::biguint_from_b64url(&ctx, &n)?;
        let e = super::biguint_from_b64url(&ctx, &e)?;
        let public = rsa::RsaPublicKey::new(n, e)
            .map_err(|e| Exception::throw_type(&ctx, &format!("invalid RSA JWK: {e}")))?;
        let spki = public
            .to_public_key_der()
            .map_err(|e| Exception::throw_internal(&ctx, &format!("RSA spki encode failed: {e}")))?;
        Ok(spki.as_bytes().to_vec())
    }

    /// Imports a private JWK (`n, e, d, p, q` field strings) back into
    /// PKCS#8 DER.
    #[rquickjs::function]
    pub fn rsa_pkcs8_from_jwk(
        ctx: Ctx<'_>,
        n: String,
        e: String,
        d: String,
        p: String,
        q: String,
    ) -> Result<Vec<u8>> {
        use rsa::pkcs8::EncodePrivateKey;
        let n = super::biguint_from_b64url(&ctx, &n)?;
        let e = super::biguint_from_b64url(&ctx, &e)?;
        let d = super::biguint_from_b64url(&ctx, &d)?;
        let p = super::biguint_from_b64url(&ctx, &p)?;
        let q = super::biguint_from_b64url(&ctx, &q)?;
        let private = rsa::RsaPrivateKey::from_components(n, e, d, vec![p, q])
            .map_err(|e| Exception::throw_type(&ctx, &format!("invalid RSA JWK: {e}")))?;
        let pkcs8 = private
            .to_pkcs8_der()
            .map_err(|e| Exception::throw_internal(&ctx, &format!("RSA pkcs8 encode failed: {e}")))?;
        Ok(pkcs8.as_bytes().to_vec())
    }

    /// Generates an ECDSA P-256 key pair. Returns `[rawPoint, pkcs8Der]`:
    /// the public key as an uncompressed SEC1 point (WebCrypto's `raw`
    /// format for EC public keys) and the private key as PKCS#8 DER.
    #[rquickjs::function]
    pub fn ecdsa_p256_generate_key_pair(ctx: Ctx<'_>) -> Result<Vec<Vec<u8>>> {
        use p256::pkcs8::EncodePrivateKey;
        let secret = p256::SecretKey::random(&mut rand::thread_rng());
        let raw_point = secret.public_key().to_encoded_point(false);
        let pkcs8 = secret
            .to_pkcs8_der()
            .map_err(|e| Exception::throw_internal(&ctx, &format!("P-256 pkcs8 encode failed: {e}")))?;
        Ok(vec![raw_point.as_bytes().to_vec(), pkcs8.as_bytes().to_vec()])
    }

    /// ECDSA-sign `data` (already hashed with the curve's digest, SHA-256
    /// for P-256) with a PKCS#8-encoded private key.
    #[rquickjs::function]
    pub fn ecdsa_p256_sign(ctx: Ctx<'_>, pkcs8_der: Vec<u8>, data: Vec<u8>) -> Result<Vec<u8>> {
        use p256::ecdsa::signature::{SignatureEncoding, Signer};
        use p256::pkcs8::DecodePrivateKey;
        let secret = p256::SecretKey::from_pkcs8_der(&pkcs8_der)
            .map_err(|e| Exception::throw_type(&ctx, &format!("invalid P-256 pkcs8 key: {e}")))?;
        let signing_key = p256::ecdsa::SigningKey::from(secret);
        let signature: p256::ecdsa::Signature = signing_key.sign(&data);
        Ok(signature.to_vec())
    }

    /// ECDSA-verify `signature` over `data` with a raw (uncompressed SEC1
    /// point) public key.
    #[rquickjs::function]
    pub fn ecdsa_p256_verify(ctx: Ctx<'_>, raw_point: Vec<u8>, data: Vec<u8>, signature: Vec<u8>) -> Result<bool> {
        use p256::ecdsa::signature::Verifier;
        let public = p256::PublicKey::from_sec1_bytes(&raw_point)
            .map_err(|e| Exception::throw_type(&ctx, &format!("invalid P-256 public point: {e}")))?;
        let verifying_key = p256::ecdsa::VerifyingKey::from(public);
        let signature = p256::ecdsa::Signature::from_slice(&signature)
            .map_err(|e| Exception::throw_type(&ctx, &format!("invalid P-256 signature: {e}")))?;
        Ok(verifying_key.verify(&data, &signature).is_ok())
    }

    /// Exports a public JWK (JSON) from a raw (uncompressed SEC1) point.
    #[rquickjs::function]
    pub fn ecdsa_p256_jwk_from_raw(ctx: Ctx<'_>, raw_point: Vec<u8>) -> Result<String> {
        let public = p256::PublicKey::from_sec1_bytes(&raw_point)
            .map_err(|e| Exception::throw_type(&ctx, &format!("invalid P-256 public point: {e}")))?;
        Ok(public.to_jwk_string())
    }

    /// Exports a private JWK (JSON) from a PKCS#8-encoded key.
    #[rquickjs::function]
    pub fn ecdsa_p256_jwk_from_pkcs8(ctx: Ctx<'_>, pkcs8_der: Vec<u8>) -> Result<String> {
        use p256::pkcs8::DecodePrivateKey;
        let secret = p256::SecretKey::from_pkcs8_der(&pkcs8_der)
            .map_err(|e| Exception::throw_type(&ctx, &format!("invalid P-256 pkcs8 key: {e}")))?;
        Ok(secret.to_jwk_string().to_string())
    }

    /// Imports a public JWK (JSON) into a raw (uncompressed SEC1) point.
    #[rquickjs::function]
    pub fn ecdsa_p256_raw_from_jwk(ctx: Ctx<'_>, jwk: String) -> Result<Vec<u8>> {
        let public = p256::PublicKey::from_jwk_str(&jwk)
            .map_err(|e| Exception::throw_type(&ctx, &format!("invalid P-256 JWK: {e}")))?;
        Ok(public.to_encoded_point(false).as_bytes().to_vec())
    }

    /// Imports a private JWK (JSON) into PKCS#8 DER.
    #[rquickjs::function]
    pub fn ecdsa_p256_pkcs8_from_jwk(ctx: Ctx<'_>, jwk: String) -> Result<Vec<u8>> {
        use p256::pkcs8::EncodePrivateKey;
        let secret = p256::SecretKey::from_jwk_str(&jwk)
            .map_err(|e| Exception::throw_type(&ctx, &format!("invalid P-256 JWK: {e}")))?;
        let pkcs8 = secret
            .to_pkcs8_der()
            .map_err(|e| Exception::throw_internal(&ctx, &format!("P-256 pkcs8 encode failed: {e}")))?;
        Ok(pkcs8.as_bytes().to_vec())
    }
}

fn aes_gcm_cipher(ctx: &Ctx<'_>, key: &[u8]) -> Result<Aes256Gcm> {
    if key.len() != 32 {
        return type_err(ctx, "AES-GCM-256 requires a 32-byte key");
    }
    Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)))
}

/// Converts a JavaScript value to a byte vector. The value can be a String
/// or a Uint8Array. Grounded directly in `hyperlight-js-runtime::utils::as_bytes`.
pub(super) fn as_bytes(ctx: &Ctx<'_>, value: rquickjs::Value<'_>) -> Result<Vec<u8>> {
    if let Some(s) = value.as_string() {
        return Ok(s.to_string()?.into_bytes());
    }
    if let Some(obj) = value.as_object() {
        if let Some(array) = obj.as_typed_array::<u8>() {
            return Ok(array.as_bytes().unwrap_or_default().to_vec());
        }
    }
    type_err(ctx, "Expected a String or Uint8Array")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_detects_mismatch() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
