//! Streaming authenticated encryption/decryption for a single blob's byte
//! stream (spec §4.1).
//!
//! Every blob is wrapped in a self-describing preamble, bound into AES-256-GCM
//! as additional authenticated data, followed by ciphertext and a trailing
//! 16-byte tag: `preamble || ciphertext || tag`. The same bytes can also be
//! carried as `base64url(preamble) " " base64url(ciphertext || tag)` when
//! embedded in a JSON envelope; see [`encode_text_form`]/[`decode_text_form`].
//!
//! Per-blob keys are derived from a 96-byte master secret via HKDF-SHA256,
//! using the blob id as the HKDF `info` parameter, so the same `(secret,
//! doc_id)` pair always yields the same key on both ends.

#![deny(unsafe_code)]

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use soledad_core::SoledadError;

/// Size in bytes of the GCM authentication tag.
pub const TAG_LEN: usize = 16;
/// Size in bytes of the GCM nonce actually used (the preamble field pads to 16).
pub const IV_LEN: usize = 12;

const MAGIC: [u8; 4] = *b"SLB1";
/// Scheme byte for symmetric (master-secret-derived) encryption.
pub const SCHEME_SYMMETRIC: u8 = 1;
/// Method byte for AES-256-GCM.
pub const METHOD_AES_256_GCM: u8 = 1;

const FIXED_HEADER_LEN: usize = 4 + 1 + 1 + 8 + 16; // magic, scheme, method, timestamp, iv

/// A 96-byte master secret. Per-blob keys are derived from it; it is never
/// logged or displayed.
#[derive(Clone)]
pub struct MasterSecret([u8; 96]);

impl MasterSecret {
    /// Wrap exactly 96 bytes of key material.
    pub fn new(bytes: [u8; 96]) -> Self {
        Self(bytes)
    }

    /// Wrap a slice, failing if it is not exactly 96 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SoledadError> {
        let arr: [u8; 96] = bytes
            .try_into()
            .map_err(|_| SoledadError::Server("master secret must be 96 bytes".into()))?;
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterSecret(..)")
    }
}

fn derive_key(secret: &MasterSecret, doc_id: &str) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, &secret.0);
    let mut okm = [0u8; 32];
    hk.expand(doc_id.as_bytes(), &mut okm).expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

/// Fixed-shape binary header emitted before ciphertext and bound into GCM as AAD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preamble {
    /// `1` for symmetric encryption.
    pub scheme: u8,
    /// Encryption method, e.g. [`METHOD_AES_256_GCM`].
    pub method: u8,
    /// Creation time, seconds since epoch.
    pub timestamp: u64,
    /// GCM IV; the first 12 bytes are used, the rest is zero padding.
    pub iv: [u8; 16],
    /// Blob id, UTF-8.
    pub doc_id: String,
    /// Always [`soledad_core::FIXED_REV`].
    pub rev: String,
}

impl Preamble {
    /// Build a fresh preamble for encryption with a random IV.
    pub fn generate(doc_id: impl Into<String>, rev: impl Into<String>) -> Self {
        let mut iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut iv[..IV_LEN]);
        Self {
            scheme: SCHEME_SYMMETRIC,
            method: METHOD_AES_256_GCM,
            timestamp: soledad_core::ids::now_secs(),
            iv,
            doc_id: doc_id.into(),
            rev: rev.into(),
        }
    }

    /// The 12-byte GCM nonce.
    pub fn nonce(&self) -> &[u8] {
        &self.iv[..IV_LEN]
    }

    /// Encode to the fixed-shape binary form; this is also used verbatim as GCM AAD.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FIXED_HEADER_LEN + 8 + self.doc_id.len() + self.rev.len());
        out.extend_from_slice(&MAGIC);
        out.push(self.scheme);
        out.push(self.method);
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&(self.doc_id.len() as u32).to_be_bytes());
        out.extend_from_slice(self.doc_id.as_bytes());
        out.extend_from_slice(&(self.rev.len() as u32).to_be_bytes());
        out.extend_from_slice(self.rev.as_bytes());
        out
    }

    /// Try to decode a preamble from the front of `buf`.
    ///
    /// Returns `Ok(None)` if `buf` does not yet hold a complete preamble (the
    /// caller should accumulate more bytes and retry); `Ok(Some((preamble,
    /// consumed)))` on success; `Err` if the bytes present are structurally
    /// invalid (bad magic, or a declared length that could never fit).
    pub fn try_decode(buf: &[u8]) -> Result<Option<(Self, usize)>, SoledadError> {
        if buf.len() < FIXED_HEADER_LEN {
            return Ok(None);
        }
        if buf[0..4] != MAGIC {
            return Err(SoledadError::InvalidBlob);
        }
        let scheme = buf[4];
        let method = buf[5];
        let timestamp = u64::from_be_bytes(buf[6..14].try_into().unwrap());
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&buf[14..30]);

        let pos = FIXED_HEADER_LEN;
        let (doc_id, pos) = match read_length_prefixed(buf, pos)? {
            Some(v) => v,
            None => return Ok(None),
        };
        let (rev, pos) = match read_length_prefixed(buf, pos)? {
            Some(v) => v,
            None => return Ok(None),
        };

        let doc_id = String::from_utf8(doc_id).map_err(|_| SoledadError::InvalidBlob)?;
        let rev = String::from_utf8(rev).map_err(|_| SoledadError::InvalidBlob)?;

        Ok(Some((Self { scheme, method, timestamp, iv, doc_id, rev }, pos)))
    }
}

/// Reads a `u32`-length-prefixed byte string starting at `pos`. Returns
/// `Ok(None)` if `buf` doesn't yet hold the full field.
fn read_length_prefixed(buf: &[u8], pos: usize) -> Result<Option<(Vec<u8>, usize)>, SoledadError> {
    if buf.len() < pos + 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
    if len > 16 * 1024 * 1024 {
        return Err(SoledadError::InvalidBlob);
    }
    let end = pos + 4 + len;
    if buf.len() < end {
        return Ok(None);
    }
    Ok(Some((buf[pos + 4..end].to_vec(), end)))
}

fn scheme_supported(preamble: &Preamble) -> bool {
    preamble.scheme == SCHEME_SYMMETRIC && preamble.method == METHOD_AES_256_GCM
}

/// Incremental encryptor: accepts plaintext chunks, produces
/// `preamble || ciphertext || tag` on [`finish`](Self::finish).
///
/// `aes-gcm`'s [`Aead`] API is one-shot, so chunks are buffered in memory
/// until `finish` runs the single GCM encryption over the whole plaintext;
/// the chunked `write` API is kept so callers can still feed data
/// incrementally as it becomes available.
pub struct BlobEncryptor {
    preamble: Preamble,
    key: [u8; 32],
    buffer: Vec<u8>,
}

impl BlobEncryptor {
    /// Start encrypting a new blob, deriving its key from `secret`.
    #[tracing::instrument(skip(secret), fields(doc_id))]
    pub fn new(doc_id: &str, rev: &str, secret: &MasterSecret) -> Self {
        let preamble = Preamble::generate(doc_id.to_string(), rev.to_string());
        let key = derive_key(secret, doc_id);
        Self { preamble, key, buffer: Vec::new() }
    }

    /// The preamble that will be emitted ahead of the ciphertext.
    pub fn preamble(&self) -> &Preamble {
        &self.preamble
    }

    /// Feed a chunk of plaintext.
    pub fn write(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Finish encryption, returning `preamble || ciphertext || tag`.
    #[tracing::instrument(skip(self), fields(doc_id = %self.preamble.doc_id))]
    pub fn finish(self) -> Result<Vec<u8>, SoledadError> {
        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|_| SoledadError::InvalidBlob)?;
        let nonce = Nonce::from_slice(self.preamble.nonce());
        let aad = self.preamble.encode();
        let ct = cipher
            .encrypt(nonce, Payload { msg: &self.buffer, aad: &aad })
            .map_err(|_| SoledadError::InvalidBlob)?;
        let mut out = aad;
        out.extend_from_slice(&ct);
        Ok(out)
    }
}

/// Encrypt a complete in-memory plaintext in one call.
pub fn encrypt(doc_id: &str, rev: &str, secret: &MasterSecret, plaintext: &[u8]) -> Result<Vec<u8>, SoledadError> {
    let mut enc = BlobEncryptor::new(doc_id, rev, secret);
    enc.write(plaintext);
    enc.finish()
}

/// Incremental decryptor for a blob whose preamble has already been parsed
/// and whose scheme is known to be supported.
///
/// Ciphertext (including the trailing tag) is buffered until [`finish`]
/// because `aes-gcm` must see the whole tag before it will release any
/// plaintext.
pub struct BlobDecryptor {
    preamble: Preamble,
    key: [u8; 32],
    buffer: Vec<u8>,
}

impl BlobDecryptor {
    /// Construct a decryptor for an already-parsed preamble.
    ///
    /// Fails with [`SoledadError::EncryptionSchemeNotImplemented`] if the
    /// preamble names a scheme or method this codec does not implement.
    pub fn new(preamble: Preamble, secret: &MasterSecret) -> Result<Self, SoledadError> {
        if !scheme_supported(&preamble) {
            return Err(SoledadError::EncryptionSchemeNotImplemented(preamble.scheme));
        }
        let key = derive_key(secret, &preamble.doc_id);
        Ok(Self { preamble, key, buffer: Vec::new() })
    }

    /// Feed a chunk of ciphertext (the tail 16 bytes of which are the tag).
    pub fn write(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Finish decryption: verify the tag and return `(plaintext, size)`.
    #[tracing::instrument(skip(self), fields(doc_id = %self.preamble.doc_id))]
    pub fn finish(self) -> Result<(Vec<u8>, usize), SoledadError> {
        if self.buffer.len() < TAG_LEN {
            return Err(SoledadError::InvalidBlob);
        }
        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|_| SoledadError::InvalidBlob)?;
        let nonce = Nonce::from_slice(self.preamble.nonce());
        let aad = self.preamble.encode();
        let pt = cipher
            .decrypt(nonce, Payload { msg: &self.buffer, aad: &aad })
            .map_err(|_| SoledadError::InvalidBlob)?;
        let size = pt.len();
        Ok((pt, size))
    }
}

/// Either a known-scheme decryptor or a raw passthrough for schemes this
/// codec doesn't implement (e.g. asymmetric envelopes handled elsewhere).
enum DispatchSink {
    Decrypt(BlobDecryptor),
    Raw(Vec<u8>),
}

/// Receive-side staging buffer: absorbs arbitrary initial byte chunks and,
/// once a full preamble has accumulated, picks a decryptor (or a raw
/// passthrough) and forwards the rest of the stream to it.
pub struct PreambleDispatcher {
    secret: MasterSecret,
    pending: Vec<u8>,
    sink: Option<DispatchSink>,
}

impl PreambleDispatcher {
    /// Create a dispatcher that will derive keys from `secret` once a
    /// preamble is available.
    pub fn new(secret: MasterSecret) -> Self {
        Self { secret, pending: Vec::new(), sink: None }
    }

    /// Feed the next chunk of the incoming byte stream.
    pub fn write(&mut self, chunk: &[u8]) -> Result<(), SoledadError> {
        if let Some(sink) = &mut self.sink {
            write_sink(sink, chunk);
            return Ok(());
        }
        self.pending.extend_from_slice(chunk);
        let Some((preamble, consumed)) = Preamble::try_decode(&self.pending)? else {
            return Ok(());
        };
        let remainder = self.pending.split_off(consumed);
        let sink = if scheme_supported(&preamble) {
            DispatchSink::Decrypt(BlobDecryptor::new(preamble, &self.secret)?)
        } else {
            DispatchSink::Raw(Vec::new())
        };
        self.sink = Some(sink);
        if let Some(sink) = &mut self.sink {
            write_sink(sink, &remainder);
        }
        Ok(())
    }

    /// Finish the stream: verify the tag (known scheme) or return the raw
    /// bytes accumulated (unsupported scheme).
    pub fn finish(self) -> Result<(Vec<u8>, usize), SoledadError> {
        match self.sink {
            Some(DispatchSink::Decrypt(d)) => d.finish(),
            Some(DispatchSink::Raw(buf)) => {
                let len = buf.len();
                Ok((buf, len))
            }
            None => Err(SoledadError::InvalidBlob),
        }
    }
}

fn write_sink(sink: &mut DispatchSink, chunk: &[u8]) {
    match sink {
        DispatchSink::Decrypt(d) => d.write(chunk),
        DispatchSink::Raw(buf) => buf.extend_from_slice(chunk),
    }
}

/// Decrypt a complete in-memory wire blob (`preamble || ciphertext || tag`).
pub fn decrypt(secret: &MasterSecret, wire: &[u8]) -> Result<(Vec<u8>, usize), SoledadError> {
    let mut dispatcher = PreambleDispatcher::new(secret.clone());
    dispatcher.write(wire)?;
    dispatcher.finish()
}

/// Encode `preamble || ciphertext || tag` into the alternate text form used
/// when a blob is embedded in a JSON envelope.
pub fn encode_text_form(wire: &[u8], preamble_len: usize) -> String {
    let (preamble_bytes, ct_and_tag) = wire.split_at(preamble_len);
    format!("{} {}", URL_SAFE_NO_PAD.encode(preamble_bytes), URL_SAFE_NO_PAD.encode(ct_and_tag))
}

/// Decode the alternate text form back into `preamble || ciphertext || tag`.
pub fn decode_text_form(text: &str) -> Result<Vec<u8>, SoledadError> {
    let mut parts = text.splitn(2, ' ');
    let preamble_part = parts.next().ok_or(SoledadError::InvalidBlob)?;
    let body_part = parts.next().ok_or(SoledadError::InvalidBlob)?;
    let mut out =
        URL_SAFE_NO_PAD.decode(preamble_part).map_err(|_| SoledadError::InvalidBlob)?;
    out.extend(URL_SAFE_NO_PAD.decode(body_part).map_err(|_| SoledadError::InvalidBlob)?);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> MasterSecret {
        MasterSecret::new([7u8; 96])
    }

    #[test]
    fn round_trip() {
        let wire = encrypt("doc1", soledad_core::FIXED_REV, &secret(), b"save me").unwrap();
        let (pt, size) = decrypt(&secret(), &wire).unwrap();
        assert_eq!(pt, b"save me");
        assert_eq!(size, 7);
    }

    #[test]
    fn round_trip_empty_plaintext() {
        let wire = encrypt("doc-empty", soledad_core::FIXED_REV, &secret(), b"").unwrap();
        let (pt, size) = decrypt(&secret(), &wire).unwrap();
        assert!(pt.is_empty());
        assert_eq!(size, 0);
    }

    #[test]
    fn flipping_a_tag_bit_invalidates() {
        let mut wire = encrypt("doc1", soledad_core::FIXED_REV, &secret(), b"save me").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        let err = decrypt(&secret(), &wire).unwrap_err();
        assert!(matches!(err, SoledadError::InvalidBlob));
    }

    #[test]
    fn flipping_doc_id_in_preamble_invalidates() {
        let wire = encrypt("doc1", soledad_core::FIXED_REV, &secret(), b"save me").unwrap();
        let (preamble, consumed) = Preamble::try_decode(&wire).unwrap().unwrap();
        let mut tampered = preamble.clone();
        tampered.doc_id.push('x');
        let mut new_wire = tampered.encode();
        new_wire.extend_from_slice(&wire[consumed..]);
        let err = decrypt(&secret(), &new_wire).unwrap_err();
        assert!(matches!(err, SoledadError::InvalidBlob));
    }

    #[test]
    fn different_secret_fails_to_decrypt() {
        let wire = encrypt("doc1", soledad_core::FIXED_REV, &secret(), b"save me").unwrap();
        let other = MasterSecret::new([9u8; 96]);
        let err = decrypt(&other, &wire).unwrap_err();
        assert!(matches!(err, SoledadError::InvalidBlob));
    }

    #[test]
    fn unknown_scheme_is_reported() {
        let mut preamble = Preamble::generate("doc1", soledad_core::FIXED_REV);
        preamble.scheme = 9;
        let err = BlobDecryptor::new(preamble, &secret()).unwrap_err();
        assert!(matches!(err, SoledadError::EncryptionSchemeNotImplemented(9)));
    }

    #[test]
    fn dispatcher_falls_back_to_raw_for_unsupported_scheme() {
        let mut preamble = Preamble::generate("doc1", soledad_core::FIXED_REV);
        preamble.scheme = 2;
        let mut wire = preamble.encode();
        wire.extend_from_slice(b"opaque-asymmetric-envelope");

        let mut dispatcher = PreambleDispatcher::new(secret());
        // Feed byte-by-byte to exercise the "not enough bytes yet" path.
        for b in &wire {
            dispatcher.write(std::slice::from_ref(b)).unwrap();
        }
        let (raw, size) = dispatcher.finish().unwrap();
        assert_eq!(raw, b"opaque-asymmetric-envelope");
        assert_eq!(size, raw.len());
    }

    #[test]
    fn text_form_round_trips() {
        let wire = encrypt("doc1", soledad_core::FIXED_REV, &secret(), b"save me").unwrap();
        let (_, consumed) = Preamble::try_decode(&wire).unwrap().unwrap();
        let text = encode_text_form(&wire, consumed);
        assert!(text.contains(' '));
        let back = decode_text_form(&text).unwrap();
        assert_eq!(back, wire);
    }

    proptest::proptest! {
        #[test]
        fn round_trip_arbitrary_bytes(data: Vec<u8>) {
            let wire = encrypt("doc-prop", soledad_core::FIXED_REV, &secret(), &data).unwrap();
            let (pt, _) = decrypt(&secret(), &wire).unwrap();
            proptest::prop_assert_eq!(pt, data);
        }
    }
}
