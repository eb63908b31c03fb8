use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Error;

type HmacSha256 = Hmac<Sha256>;

pub const KEY_LEN: usize = 32;
const SIGNATURE_PREFIX: &str = "sha256=";

/// Shared secret of an agent. The master stores it at registration and both
/// sides sign request bodies with it. Shown as lowercase hex.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Key(pub [u8; KEY_LEN]);

impl Key {
    pub fn generate() -> Self {
        Key(rand::random())
    }

    /// Reads the key stored at `path`, or creates one there. A new key file
    /// is only readable by its owner.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        if path.exists() {
            log::debug!("load key from {}", path.display());
            let contents = std::fs::read_to_string(path)?;
            return contents.trim().parse();
        }

        log::info!("generate a new key into {}", path.display());
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let key = Key::generate();
        let mut opts = OpenOptions::new();
        opts.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o400);
        }
        let mut fd = opts.open(path)?;
        fd.write_all(key.to_string().as_bytes())?;
        Ok(key)
    }

    /// Signs `body`, producing the value of the signature header.
    pub fn sign(&self, body: &[u8]) -> Result<String, Error> {
        let mut mac = self.mac()?;
        mac.update(body);
        Ok(format!("{SIGNATURE_PREFIX}{:x}", mac.finalize().into_bytes()))
    }

    /// Checks a signature produced by [`Key::sign`]. The comparison runs in
    /// constant time.
    pub fn verify(&self, body: &[u8], signature: &str) -> bool {
        let Some(digest) = signature
            .strip_prefix(SIGNATURE_PREFIX)
            .and_then(|s| hex::decode(s).ok())
        else {
            return false;
        };
        let Ok(mut mac) = self.mac() else {
            return false;
        };
        mac.update(body);
        mac.verify_slice(&digest).is_ok()
    }

    /// Short digest of the key, safe to log. The key itself is the secret
    /// both sides sign with.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        format!("SHA256:{}", hex::encode(&digest[..8]))
    }

    fn mac(&self) -> Result<HmacSha256, Error> {
        HmacSha256::new_from_slice(&self.0)
            .map_err(|e| Error::from(format!("Could not create HMAC: {e:?}")))
    }
}

impl FromStr for Key {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let buf = hex::decode(s).map_err(|e| Error::from(format!("Invalid key: {e}")))?;
        let key: [u8; KEY_LEN] = buf.try_into().map_err(|b: Vec<u8>| {
            Error::from(format!("Invalid key length {}, expected {KEY_LEN}", b.len()))
        })?;
        Ok(Key(key))
    }
}

impl TryFrom<String> for Key {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Error> {
        s.parse()
    }
}

impl From<Key> for String {
    fn from(k: Key) -> Self {
        k.to_string()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

// Keep secrets out of debug logs.
impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Key({})", self.fingerprint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asserting::prelude::*;

    #[test]
    fn test_parse_and_display() {
        let key = Key::generate();
        let text = key.to_string();
        assert_that!(text.len()).is_equal_to(64);
        assert_that!(text.parse::<Key>().unwrap() == key).is_true();
    }

    #[test]
    fn test_wrong_length() {
        assert_that!("abcd".parse::<Key>()).is_err();
        assert_that!("not hex".parse::<Key>()).is_err();
    }

    #[test]
    fn test_sign_verify() {
        let key = Key::generate();
        let body = br#"{"poll":{"host":"web-01"}}"#;
        let sig = key.sign(body).unwrap();
        assert_that!(sig.as_str()).starts_with("sha256=");
        assert_that!(key.verify(body, &sig)).is_true();
        assert_that!(key.verify(b"tampered", &sig)).is_false();
        assert_that!(Key::generate().verify(body, &sig)).is_false();
        assert_that!(key.verify(body, "sha256=zz")).is_false();
    }

    #[test]
    fn test_load_or_create() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("agent.key");
        let created = Key::load_or_create(&path).unwrap();
        let loaded = Key::load_or_create(&path).unwrap();
        assert_that!(created == loaded).is_true();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_that!(mode & 0o777).is_equal_to(0o400);
        }
    }

    #[test]
    fn test_fingerprint_hides_key() {
        let key = Key([7u8; KEY_LEN]);
        let secret = key.to_string();
        let fingerprint = key.fingerprint();
        assert_that!(fingerprint.len()).is_equal_to("SHA256:".len() + 16);
        assert_that!(fingerprint.contains(&secret[..8])).is_false();
        assert_that!(fingerprint == Key([7u8; KEY_LEN]).fingerprint()).is_true();
        assert_that!(fingerprint == Key::generate().fingerprint()).is_false();

        let debug = format!("{key:?}");
        assert_that!(debug.contains(&secret[..8])).is_false();
        assert_that!(debug.contains(&fingerprint)).is_true();
    }

    #[test]
    fn test_serde_as_hex() {
        let key = Key([7u8; KEY_LEN]);
        let json = serde_json::to_string(&key).unwrap();
        assert_that!(&json).is_equal_to(&format!("\"{}\"", "07".repeat(KEY_LEN)));
        let back: Key = serde_json::from_str(&json).unwrap();
        assert_that!(back == key).is_true();
    }
}
