// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! A collection of known OpenPGP public keys. */

use {
    crate::{OpenPgp, Result, Signature, SignatureError, ValidSignature},
    log::{debug, warn},
    pgp::{
        packet::{Packet, PacketParser},
        types::KeyTrait,
        Deserializable, SignedPublicKey,
    },
    std::{
        io::Cursor,
        path::{Path, PathBuf},
        sync::RwLock,
    },
};

const ARMOR_HEADER: &[u8] = b"-----BEGIN PGP PUBLIC KEY BLOCK-----";

/// Render a key id as 16 uppercase hex characters.
fn format_key_id(key_id: &impl AsRef<[u8]>) -> String {
    hex::encode_upper(key_id.as_ref())
}

/// Public keys used to check feed signatures.
///
/// Keyrings opened from a directory persist imported keys there as
/// `<FINGERPRINT>.asc` files.
pub struct Keyring {
    directory: Option<PathBuf>,
    keys: RwLock<Vec<SignedPublicKey>>,
}

impl Keyring {
    /// A keyring that only lives in memory.
    pub fn in_memory() -> Self {
        Self {
            directory: None,
            keys: RwLock::new(vec![]),
        }
    }

    /// Open a keyring backed by a directory, loading keys already there.
    ///
    /// Files that do not parse as public keys are skipped.
    pub fn open(directory: impl AsRef<Path>) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        let mut keys = vec![];

        if directory.is_dir() {
            let mut paths = std::fs::read_dir(&directory)
                .map_err(|e| SignatureError::IoPath(format!("{}", directory.display()), e))?
                .map(|entry| entry.map(|e| e.path()))
                .collect::<std::io::Result<Vec<_>>>()?;
            paths.sort();

            for path in paths {
                if path.extension().and_then(|x| x.to_str()) != Some("asc") {
                    continue;
                }

                let data = std::fs::read(&path)
                    .map_err(|e| SignatureError::IoPath(format!("{}", path.display()), e))?;
                match parse_public_key(&data) {
                    Ok(key) => keys.push(key),
                    Err(e) => warn!("ignoring unreadable key {}: {}", path.display(), e),
                }
            }
        }

        debug!("loaded {} keys from {}", keys.len(), directory.display());

        Ok(Self {
            directory: Some(directory),
            keys: RwLock::new(keys),
        })
    }

    /// Fingerprints of all known keys, as uppercase hex.
    pub fn fingerprints(&self) -> Vec<String> {
        self.keys
            .read()
            .map(|keys| {
                keys.iter()
                    .map(|k| hex::encode_upper(k.fingerprint()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Add a parsed key.
    ///
    /// Keys already present are replaced.
    pub fn add_key(&self, key: SignedPublicKey) -> Result<()> {
        let fingerprint = hex::encode_upper(key.fingerprint());

        if let Some(directory) = &self.directory {
            std::fs::create_dir_all(directory)
                .map_err(|e| SignatureError::IoPath(format!("{}", directory.display()), e))?;
            let path = directory.join(format!("{}.asc", fingerprint));
            std::fs::write(&path, key.to_armored_string(None)?)
                .map_err(|e| SignatureError::IoPath(format!("{}", path.display()), e))?;
        }

        let mut keys = self
            .keys
            .write()
            .map_err(|_| SignatureError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "keyring lock poisoned",
            )))?;
        keys.retain(|k| k.fingerprint() != key.fingerprint());
        keys.push(key);

        debug!("imported key {}", fingerprint);

        Ok(())
    }

    fn check(&self, data: &[u8], sig: &pgp::Signature) -> Signature {
        let issuer = match sig.issuer() {
            Some(issuer) => issuer.clone(),
            None => {
                return Signature::Unknown {
                    key_id: None,
                    reason: "signature has no issuer".to_string(),
                }
            }
        };
        let key_id = format_key_id(&issuer);

        let keys = match self.keys.read() {
            Ok(keys) => keys,
            Err(_) => {
                return Signature::Unknown {
                    key_id: Some(key_id),
                    reason: "keyring lock poisoned".to_string(),
                }
            }
        };

        for key in keys.iter() {
            let result = if key.key_id() == issuer {
                Some(sig.verify(key, data))
            } else {
                key.public_subkeys
                    .iter()
                    .find(|subkey| subkey.key_id() == issuer)
                    .map(|subkey| sig.verify(subkey, data))
            };

            match result {
                Some(Ok(())) => {
                    return match sig.created() {
                        Some(created) => Signature::Valid(ValidSignature {
                            fingerprint: hex::encode_upper(key.fingerprint()),
                            timestamp: *created,
                        }),
                        None => Signature::Unknown {
                            key_id: Some(key_id),
                            reason: "signature has no creation time".to_string(),
                        },
                    };
                }
                Some(Err(e)) => {
                    debug!("signature from {} failed verification: {:?}", key_id, e);
                    return Signature::Bad { key_id };
                }
                None => {}
            }
        }

        Signature::MissingKey { key_id }
    }
}

/// Parse a public key in armored or binary form.
fn parse_public_key(data: &[u8]) -> Result<SignedPublicKey> {
    let key = if data
        .windows(ARMOR_HEADER.len())
        .any(|window| window == ARMOR_HEADER)
    {
        SignedPublicKey::from_armor_single(Cursor::new(data))?.0
    } else {
        SignedPublicKey::from_bytes(Cursor::new(data))?
    };

    key.verify()?;

    Ok(key)
}

impl OpenPgp for Keyring {
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<Vec<Signature>> {
        let mut signatures = vec![];

        for packet in PacketParser::new(Cursor::new(signature)) {
            match packet {
                Ok(Packet::Signature(sig)) => signatures.push(self.check(data, &sig)),
                Ok(packet) => {
                    debug!("ignoring non-signature packet {:?}", packet.tag());
                }
                Err(e) => signatures.push(Signature::Unknown {
                    key_id: None,
                    reason: format!("{:?}", e),
                }),
            }
        }

        Ok(signatures)
    }

    fn import_key(&self, data: &[u8]) -> Result<()> {
        let key = parse_public_key(data).map_err(|e| match e {
            SignatureError::Pgp(_) => SignatureError::NoPublicKey,
            e => e,
        })?;

        self.add_key(key)
    }
}
