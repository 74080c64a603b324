// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! OpenPGP signatures embedded in feed documents.

Feeds carry a detached OpenPGP signature in an XML comment appended to the
document. The comment holds the Base64 encoded signature packets and covers
every byte of the document preceding the comment:

```text
<?xml version="1.0" ?>
<interface uri="https://example.org/app.xml" ...>
  ...
</interface>
<!-- Base64 Signature
iQEzBAABCAAdFiEE...
...
-->
```

[split_signature()] separates a document into its signed content and the
decoded signature bytes. An [OpenPgp] implementation (such as [Keyring])
turns those into [Signature] values describing each signature found.
*/

pub mod error;
pub mod keyring;
pub mod signing_key;

pub use {
    error::{Result, SignatureError},
    keyring::Keyring,
};

use {
    chrono::{DateTime, Utc},
    std::fmt,
};

/// Marker beginning the signature block.
pub const SIGNATURE_BLOCK_START: &str = "<!-- Base64 Signature\n";

/// Marker ending the signature block.
pub const SIGNATURE_BLOCK_END: &str = "\n-->\n";

/// Characters per line of Base64 in emitted signature blocks.
const BASE64_LINE_LENGTH: usize = 76;

/// A signature that was verified against a known key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValidSignature {
    /// Fingerprint of the signing key, as uppercase hex.
    pub fingerprint: String,
    /// When the signature was made.
    pub timestamp: DateTime<Utc>,
}

/// The outcome of checking one signature in a document.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Signature {
    /// The signature is good.
    Valid(ValidSignature),
    /// The signature does not match the content.
    Bad { key_id: String },
    /// The key that made the signature is not known.
    MissingKey { key_id: String },
    /// The signature could not be checked for another reason.
    Unknown {
        key_id: Option<String>,
        reason: String,
    },
}

impl Signature {
    /// The key id of the signing key, where known.
    pub fn key_id(&self) -> Option<&str> {
        match self {
            Self::Valid(_) => None,
            Self::Bad { key_id } | Self::MissingKey { key_id } => Some(key_id),
            Self::Unknown { key_id, .. } => key_id.as_deref(),
        }
    }

    pub fn as_valid(&self) -> Option<&ValidSignature> {
        match self {
            Self::Valid(sig) => Some(sig),
            _ => None,
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Valid(sig) => {
                write!(f, "valid signature: {} ({})", sig.fingerprint, sig.timestamp)
            }
            Self::Bad { key_id } => write!(f, "bad signature: {}", key_id),
            Self::MissingKey { key_id } => write!(f, "missing key: {}", key_id),
            Self::Unknown { key_id, reason } => write!(
                f,
                "unverifiable signature: {} ({})",
                key_id.as_deref().unwrap_or("unknown key"),
                reason
            ),
        }
    }
}

/// An OpenPGP implementation able to check signatures and learn keys.
pub trait OpenPgp {
    /// Check detached signature packets over some data.
    ///
    /// One [Signature] is returned per signature packet.
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<Vec<Signature>>;

    /// Add public key material to the set of known keys.
    fn import_key(&self, data: &[u8]) -> Result<()>;
}

fn find_last(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }

    (0..=haystack.len() - needle.len())
        .rev()
        .find(|i| &haystack[*i..*i + needle.len()] == needle)
}

/// Separate a feed document into signed content and signature bytes.
///
/// The last occurrence of [SIGNATURE_BLOCK_START] begins the signature block.
/// Documents without a block yield `None` for the signature.
pub fn split_signature(data: &[u8]) -> Result<(&[u8], Option<Vec<u8>>)> {
    let start = match find_last(data, SIGNATURE_BLOCK_START.as_bytes()) {
        Some(start) => start,
        None => return Ok((data, None)),
    };

    if start == 0 || data[start - 1] != b'\n' {
        return Err(SignatureError::MissingNewline);
    }

    let block = &data[start..];
    if !block.ends_with(SIGNATURE_BLOCK_END.as_bytes())
        || block.len() < SIGNATURE_BLOCK_START.len() + SIGNATURE_BLOCK_END.len()
    {
        return Err(SignatureError::InvalidEnd);
    }

    let encoded = block
        [SIGNATURE_BLOCK_START.len()..block.len() - SIGNATURE_BLOCK_END.len()]
        .iter()
        .copied()
        .filter(|b| *b != b'\n')
        .collect::<Vec<_>>();

    Ok((&data[..start], Some(base64::decode(&encoded)?)))
}

/// Obtain the signatures of a feed document.
///
/// Documents without a signature block have no signatures.
pub fn signatures(openpgp: &dyn OpenPgp, data: &[u8]) -> Result<Vec<Signature>> {
    match split_signature(data)? {
        (content, Some(signature)) => openpgp.verify(content, &signature),
        (_, None) => Ok(vec![]),
    }
}

/// Append a signature block holding `signature` to a document.
pub fn append_signature_block(data: &[u8], signature: &[u8]) -> Result<Vec<u8>> {
    if find_last(data, SIGNATURE_BLOCK_START.as_bytes()).is_some() {
        return Err(SignatureError::AlreadySigned);
    }

    let mut result = data.to_vec();
    if !result.ends_with(b"\n") {
        result.push(b'\n');
    }

    result.extend_from_slice(SIGNATURE_BLOCK_START.as_bytes());
    let encoded = base64::encode(signature);
    let lines = encoded
        .as_bytes()
        .chunks(BASE64_LINE_LENGTH)
        .collect::<Vec<_>>()
        .join(&b'\n');
    result.extend_from_slice(&lines);
    result.extend_from_slice(SIGNATURE_BLOCK_END.as_bytes());

    Ok(result)
}
