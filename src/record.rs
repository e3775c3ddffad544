//! # Signed Records
//!
//! A [`SignedRecord`] is a set of string properties plus a signature over
//! their canonical serialization and the fingerprint of the key that made
//! it. Identities, certificates, handshake nonce proofs and events are all
//! signed records.
//!
//! The canonical (signable) form is a JSON array of single-entry objects in
//! key order: `[{"a":"1"},{"b":"2"}]`.
//!
//! Records travel in two encodings:
//! - binary: `u16` signature length, signature, `u32` data length, data,
//!   `u16`-prefixed signer fingerprint
//! - text armor, used for exporting identities to files:
//!
//! ```text
//! ### BEGIN SLYMESH SIGNED DATA
//! [{"fullname":"Alice Example"},...]
//! ### END SLYMESH SIGNED DATA
//! <signer fingerprint>
//! <hex signature>
//! ```

use bytes::{BufMut, BytesMut};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::identity::KeyPair;
use crate::wire::{put_str, WireReader};

const TXT_HEAD: &str = "### BEGIN SLYMESH SIGNED DATA\n";
const TXT_FOOT: &str = "\n### END SLYMESH SIGNED DATA\n";

/// Key/value record with a detached signature.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SignedRecord {
    props: BTreeMap<String, String>,
    signature: Vec<u8>,
    signer: String,
}

impl SignedRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_props<K, V>(props: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            props: props.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            ..Self::default()
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }

    /// Like [`get`](Self::get) but a missing property is an error.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| Error::malformed(format!("record has no '{}' property", key)))
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.props.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.props.remove(key)
    }

    pub fn props(&self) -> &BTreeMap<String, String> {
        &self.props
    }

    /// Fingerprint of the key that signed this record, empty if unsigned.
    pub fn signer_id(&self) -> &str {
        &self.signer
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }

    /// Canonical serialization the signature covers.
    pub fn signable_data(&self) -> Vec<u8> {
        let entries: Vec<serde_json::Value> = self
            .props
            .iter()
            .map(|(k, v)| {
                let mut entry = serde_json::Map::new();
                entry.insert(k.clone(), serde_json::Value::String(v.clone()));
                serde_json::Value::Object(entry)
            })
            .collect();
        serde_json::Value::Array(entries).to_string().into_bytes()
    }

    fn props_from_data(data: &[u8]) -> Result<BTreeMap<String, String>> {
        let entries: Vec<BTreeMap<String, String>> = serde_json::from_slice(data)?;
        let mut props = BTreeMap::new();
        for entry in entries {
            props.extend(entry);
        }
        Ok(props)
    }

    pub fn sign(&mut self, keys: &KeyPair) {
        let data = self.signable_data();
        self.signature = keys.sign(&data).to_bytes().to_vec();
        self.signer = keys.key_id();
    }

    /// Check the signature against `key`. The caller is responsible for
    /// `key` belonging to [`signer_id`](Self::signer_id).
    pub fn verify_with(&self, key: &VerifyingKey) -> bool {
        let Ok(sig_bytes) = <[u8; 64]>::try_from(self.signature.as_slice()) else {
            return false;
        };
        let signature = Signature::from_bytes(&sig_bytes);
        key.verify(&self.signable_data(), &signature).is_ok()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let data = self.signable_data();
        let sig_len = u16::try_from(self.signature.len())
            .map_err(|_| Error::malformed("signature too long"))?;
        let data_len =
            u32::try_from(data.len()).map_err(|_| Error::malformed("record too large"))?;

        let mut buf = BytesMut::with_capacity(self.signature.len() + data.len() + 64);
        buf.put_u16(sig_len);
        buf.put_slice(&self.signature);
        buf.put_u32(data_len);
        buf.put_slice(&data);
        put_str(&mut buf, &self.signer)?;
        Ok(buf.to_vec())
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(raw);
        let sig_len = r.read_u16()? as usize;
        let signature = r.read_bytes(sig_len)?.to_vec();
        let data_len = r.read_u32()? as usize;
        let data = r.read_bytes(data_len)?;
        let signer = r.read_str()?;
        Ok(Self {
            props: Self::props_from_data(data)?,
            signature,
            signer,
        })
    }

    pub fn to_armored(&self) -> String {
        let data = String::from_utf8_lossy(&self.signable_data()).into_owned();
        format!(
            "{}{}{}{}\n{}\n",
            TXT_HEAD,
            data,
            TXT_FOOT,
            self.signer,
            hex::encode(&self.signature)
        )
    }

    pub fn from_armored(text: &str) -> Result<Self> {
        let start = text
            .find(TXT_HEAD)
            .ok_or_else(|| Error::malformed("missing signed data header"))?;
        let body = &text[start + TXT_HEAD.len()..];
        let end = body
            .find(TXT_FOOT)
            .ok_or_else(|| Error::malformed("missing signed data footer"))?;
        let data = &body[..end];
        let mut trailer = body[end + TXT_FOOT.len()..].lines().map(str::trim);
        let signer = trailer.next().unwrap_or_default().to_string();
        let signature = hex::decode(trailer.next().unwrap_or_default())?;
        Ok(Self {
            props: Self::props_from_data(data.as_bytes())?,
            signature,
            signer,
        })
    }

    /// Parse either encoding, trying the text armor first.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if let Ok(text) = std::str::from_utf8(raw) {
            if text.contains(TXT_HEAD) {
                return Self::from_armored(text);
            }
        }
        Self::from_bytes(raw)
    }
}
