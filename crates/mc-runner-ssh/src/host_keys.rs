use anyhow::{Context, Result, anyhow};
use p384::pkcs8::EncodePrivateKey as _;
use pem::Pem;
use rand::rngs::OsRng;
use rsa::RsaPrivateKey;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use mc_runner_protocol::paths::{host_key_path, legacy_host_key_path};

pub const RSA_KEY_BITS: usize = 4096;

const RSA_PEM_TAG: &str = "RSA PRIVATE KEY";
const EC_PEM_TAG: &str = "EC PRIVATE KEY";

/// The server's RSA and EC P-384 host keys.
pub struct HostKeys {
    pub rsa: RsaPrivateKey,
    pub ec: p384::SecretKey,
}

#[derive(Default)]
struct StoredKeys {
    rsa: Option<RsaPrivateKey>,
    ec: Option<p384::SecretKey>,
}

/// Loads, generates and persists host keys in a directory (normally `$HOME`).
pub struct HostKeyStore {
    dir: PathBuf,
    rsa_bits: usize,
}

impl HostKeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            rsa_bits: RSA_KEY_BITS,
        }
    }

    pub fn with_rsa_bits(mut self, bits: usize) -> Self {
        self.rsa_bits = bits;
        self
    }

    pub fn path(&self) -> PathBuf {
        host_key_path(&self.dir)
    }

    pub fn legacy_path(&self) -> PathBuf {
        legacy_host_key_path(&self.dir)
    }

    /// Returns both host keys, generating whichever is missing. Keys read
    /// from the legacy file are rewritten to the hidden file and the legacy
    /// file is removed.
    pub fn ensure(&self) -> Result<HostKeys> {
        let source = self.pick_source();
        let mut stored = if source.exists() {
            read_keys(&source)?
        } else {
            StoredKeys::default()
        };

        let mut changed = source != self.path();
        let rsa = match stored.rsa.take() {
            Some(key) => key,
            None => {
                info!(bits = self.rsa_bits, "generating RSA host key");
                changed = true;
                RsaPrivateKey::new(&mut OsRng, self.rsa_bits)
                    .context("failed to generate RSA host key")?
            }
        };
        let ec = match stored.ec.take() {
            Some(key) => key,
            None => {
                info!("generating EC P-384 host key");
                changed = true;
                p384::SecretKey::random(&mut OsRng)
            }
        };

        let keys = HostKeys { rsa, ec };
        if changed {
            write_keys(&self.path(), &keys)?;
            info!(path = %self.path().display(), "wrote host keys");
        }
        self.cleanup_legacy();
        Ok(keys)
    }

    fn pick_source(&self) -> PathBuf {
        let current = self.path();
        if current.exists() {
            return current;
        }
        let legacy = self.legacy_path();
        if legacy.exists() {
            return legacy;
        }
        current
    }

    fn cleanup_legacy(&self) {
        let legacy = self.legacy_path();
        if legacy.exists() && self.path().exists() {
            match fs::remove_file(&legacy) {
                Ok(()) => info!(path = %legacy.display(), "removed legacy host key file"),
                Err(err) => warn!(path = %legacy.display(), "failed to remove legacy host key file: {err}"),
            }
        }
    }
}

impl HostKeys {
    /// Convert to the key type the SSH server is configured with.
    pub fn to_russh_keys(&self) -> Result<Vec<russh::keys::PrivateKey>> {
        let rsa_pem = self
            .rsa
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|err| anyhow!("failed to encode RSA host key: {err}"))?;
        let ec_pem = self
            .ec
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|err| anyhow!("failed to encode EC host key: {err}"))?;

        let mut keys = Vec::with_capacity(2);
        for pem in [rsa_pem.as_str(), ec_pem.as_str()] {
            keys.push(
                russh::keys::decode_secret_key(pem, None)
                    .context("failed to load host key into ssh server")?,
            );
        }
        Ok(keys)
    }

    fn to_pem(&self) -> Result<String> {
        let rsa_der = self
            .rsa
            .to_pkcs1_der()
            .map_err(|err| anyhow!("failed to encode RSA host key: {err}"))?;
        let ec_der = self
            .ec
            .to_sec1_der()
            .map_err(|err| anyhow!("failed to encode EC host key: {err}"))?;
        Ok(pem::encode_many(&[
            Pem::new(RSA_PEM_TAG, rsa_der.as_bytes().to_vec()),
            Pem::new(EC_PEM_TAG, ec_der.to_vec()),
        ]))
    }
}

fn read_keys(path: &Path) -> Result<StoredKeys> {
    let content =
        fs::read(path).with_context(|| format!("failed to read host keys {}", path.display()))?;
    let blocks = pem::parse_many(&content)
        .with_context(|| format!("invalid PEM in {}", path.display()))?;

    let mut keys = StoredKeys::default();
    for block in blocks {
        match block.tag() {
            RSA_PEM_TAG => {
                let key = RsaPrivateKey::from_pkcs1_der(block.contents())
                    .map_err(|err| anyhow!("invalid RSA host key in {}: {err}", path.display()))?;
                keys.rsa = Some(key);
            }
            EC_PEM_TAG => {
                let key = p384::SecretKey::from_sec1_der(block.contents())
                    .map_err(|err| anyhow!("invalid EC host key in {}: {err}", path.display()))?;
                keys.ec = Some(key);
            }
            other => warn!(path = %path.display(), tag = other, "ignoring unknown PEM block"),
        }
    }
    Ok(keys)
}

fn write_keys(path: &Path, keys: &HostKeys) -> Result<()> {
    let pem = keys.to_pem()?;
    let mut options = fs::OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(pem.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{EC_PEM_TAG, HostKeyStore, RSA_PEM_TAG};
    use pem::Pem;
    use rand::rngs::OsRng;
    use rsa::RsaPrivateKey;
    use rsa::pkcs1::EncodeRsaPrivateKey;
    use std::fs;

    const TEST_BITS: usize = 2048;

    fn tags(path: &std::path::Path) -> Vec<String> {
        let content = fs::read(path).expect("read key file");
        pem::parse_many(content)
            .expect("parse pem")
            .iter()
            .map(|p| p.tag().to_string())
            .collect()
    }

    #[test]
    fn generates_and_reloads_both_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = HostKeyStore::new(dir.path()).with_rsa_bits(TEST_BITS);

        let first = store.ensure().expect("ensure");
        assert_eq!(tags(&store.path()), vec![RSA_PEM_TAG, EC_PEM_TAG]);

        let second = store.ensure().expect("ensure again");
        assert_eq!(
            first.rsa.to_pkcs1_der().unwrap().as_bytes(),
            second.rsa.to_pkcs1_der().unwrap().as_bytes()
        );
        assert_eq!(first.ec.to_bytes(), second.ec.to_bytes());
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let store = HostKeyStore::new(dir.path()).with_rsa_bits(TEST_BITS);
        store.ensure().expect("ensure");

        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn legacy_rsa_only_file_is_migrated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = HostKeyStore::new(dir.path()).with_rsa_bits(TEST_BITS);

        let legacy_key = RsaPrivateKey::new(&mut OsRng, TEST_BITS).expect("rsa");
        let der = legacy_key.to_pkcs1_der().expect("der");
        fs::write(
            store.legacy_path(),
            pem::encode(&Pem::new(RSA_PEM_TAG, der.as_bytes().to_vec())),
        )
        .expect("write legacy");

        let keys = store.ensure().expect("ensure");

        assert_eq!(
            keys.rsa.to_pkcs1_der().unwrap().as_bytes(),
            der.as_bytes()
        );
        assert!(!store.legacy_path().exists());
        assert_eq!(tags(&store.path()), vec![RSA_PEM_TAG, EC_PEM_TAG]);
    }

    #[test]
    fn keys_convert_for_ssh_server() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keys = HostKeyStore::new(dir.path())
            .with_rsa_bits(TEST_BITS)
            .ensure()
            .expect("ensure");
        let converted = keys.to_russh_keys().expect("convert");
        assert_eq!(converted.len(), 2);
    }

    #[test]
    fn corrupt_key_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = HostKeyStore::new(dir.path()).with_rsa_bits(TEST_BITS);
        fs::write(
            store.path(),
            pem::encode(&Pem::new(RSA_PEM_TAG, b"not der".to_vec())),
        )
        .unwrap();
        assert!(store.ensure().is_err());
    }
}
