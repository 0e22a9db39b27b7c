//! Record keys and their content-addressed digests.

use ripemd::{Digest, Ripemd160};

use crate::error::{AerokvError, Result};
use crate::value::ParticleType;

/// Number of partitions per namespace.
pub const PARTITIONS: u16 = 4096;

/// The user-visible part of a key. The digest is derived from the set
/// name and this value; the namespace never participates in hashing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UserKey {
    /// 64-bit integer key.
    Int(i64),
    /// UTF-8 string key.
    String(String),
    /// Opaque byte key.
    Blob(Vec<u8>),
}

impl UserKey {
    fn particle_type(&self) -> ParticleType {
        match self {
            UserKey::Int(_) => ParticleType::Integer,
            UserKey::String(_) => ParticleType::String,
            UserKey::Blob(_) => ParticleType::Blob,
        }
    }

    /// The bytes hashed after the set name and particle-type byte.
    fn digest_bytes(&self) -> Vec<u8> {
        match self {
            UserKey::Int(v) => v.to_be_bytes().to_vec(),
            UserKey::String(v) => v.as_bytes().to_vec(),
            UserKey::Blob(v) => v.clone(),
        }
    }
}

impl From<i64> for UserKey {
    fn from(v: i64) -> Self {
        UserKey::Int(v)
    }
}

impl From<&str> for UserKey {
    fn from(v: &str) -> Self {
        UserKey::String(v.to_string())
    }
}

impl From<String> for UserKey {
    fn from(v: String) -> Self {
        UserKey::String(v)
    }
}

impl From<Vec<u8>> for UserKey {
    fn from(v: Vec<u8>) -> Self {
        UserKey::Blob(v)
    }
}

/// A record's identity: namespace, set, optional user key and the
/// 20-byte digest that is the sole routing identity on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    /// Namespace the record lives in.
    pub namespace: String,
    /// Set inside the namespace; may be empty.
    pub set_name: String,
    /// The caller-supplied key, if it is to be sent or displayed.
    pub user_key: Option<UserKey>,
    /// RIPEMD-160 of (set, user-key); deterministic for a given pair.
    pub digest: [u8; 20],
}

impl Key {
    /// Builds a key and computes its digest.
    pub fn new(namespace: impl Into<String>, set_name: impl Into<String>, user_key: impl Into<UserKey>) -> Result<Self> {
        let namespace = namespace.into();
        let set_name = set_name.into();
        let user_key = user_key.into();
        let digest = Self::compute_digest(&set_name, &user_key)?;
        Ok(Key {
            namespace,
            set_name,
            user_key: Some(user_key),
            digest,
        })
    }

    /// Builds a key from a digest alone, as batch responses do.
    pub fn from_digest(
        namespace: impl Into<String>,
        set_name: impl Into<String>,
        digest: [u8; 20],
    ) -> Self {
        Key {
            namespace: namespace.into(),
            set_name: set_name.into(),
            user_key: None,
            digest,
        }
    }

    /// RIPEMD-160 over set name, particle-type byte and encoded user key.
    pub fn compute_digest(set_name: &str, user_key: &UserKey) -> Result<[u8; 20]> {
        if let UserKey::String(s) = user_key {
            if s.is_empty() {
                return Err(AerokvError::Param("empty string user key".to_string()));
            }
        }
        let mut hasher = Ripemd160::new();
        hasher.update(set_name.as_bytes());
        hasher.update([user_key.particle_type() as u8]);
        hasher.update(user_key.digest_bytes());
        Ok(hasher.finalize().into())
    }

    /// The partition this key hashes to: the low 12 bits of the
    /// little-endian u16 formed by the first two digest bytes.
    pub fn partition_id(&self) -> u16 {
        u16::from_le_bytes([self.digest[0], self.digest[1]]) & (PARTITIONS - 1)
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:", self.namespace, self.set_name)?;
        match &self.user_key {
            Some(UserKey::Int(v)) => write!(f, "{}", v),
            Some(UserKey::String(v)) => write!(f, "{}", v),
            Some(UserKey::Blob(v)) => write!(f, "blob[{}]", v.len()),
            None => {
                for b in &self.digest {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(digest: &[u8; 20]) -> String {
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    #[test]
    fn integer_key_reference_digest() {
        let key = Key::new("test", "demo", 1i64).unwrap();
        assert_eq!(hex(&key.digest), "b7f4b83889e2da67de683e1df6919a1eacc446c8");
    }

    #[test]
    fn digest_is_deterministic() {
        let a = Key::new("ns-a", "demo", "user").unwrap();
        let b = Key::new("ns-b", "demo", "user").unwrap();
        // Namespace does not participate in the digest.
        assert_eq!(a.digest, b.digest);

        let c = Key::new("ns-a", "other", "user").unwrap();
        assert_ne!(a.digest, c.digest);
    }

    #[test]
    fn key_types_hash_differently() {
        let s = Key::new("test", "demo", "1").unwrap();
        let i = Key::new("test", "demo", 1i64).unwrap();
        let b = Key::new("test", "demo", b"1".to_vec()).unwrap();
        assert_ne!(s.digest, i.digest);
        assert_ne!(s.digest, b.digest);
    }

    #[test]
    fn partition_id_in_range() {
        for user in 0..200i64 {
            let key = Key::new("test", "demo", user).unwrap();
            assert!(key.partition_id() < PARTITIONS);
        }
    }

    #[test]
    fn partition_id_uses_low_twelve_bits() {
        let key = Key::new("test", "demo", 1i64).unwrap();
        // digest starts b7 f4: LE u16 = 0xf4b7, & 0xfff = 0x4b7.
        assert_eq!(key.partition_id(), 0x4b7);
    }

    #[test]
    fn empty_string_key_rejected() {
        assert!(matches!(
            Key::new("test", "demo", ""),
            Err(AerokvError::Param(_))
        ));
    }

    #[test]
    fn display_formats() {
        let key = Key::new("test", "demo", 42i64).unwrap();
        assert_eq!(key.to_string(), "test:demo:42");

        let anon = Key::from_digest("test", "demo", [0xab; 20]);
        assert!(anon.to_string().starts_with("test:demo:abab"));
    }
}
