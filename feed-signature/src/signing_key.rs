// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Feed signing keys and signing feed documents. */

use {
    crate::{append_signature_block, Result},
    chrono::SubsecRound,
    pgp::{
        crypto::{HashAlgorithm, SymmetricKeyAlgorithm},
        packet::{Packet, SignatureConfig, SignatureType, Subpacket},
        ser::Serialize,
        types::{CompressionAlgorithm, KeyVersion, SecretKeyTrait},
        KeyType, SecretKeyParams, SecretKeyParamsBuilder, SignedPublicKey, SignedSecretKey,
    },
    smallvec::{smallvec, SmallVec},
    std::io::Cursor,
};

/// Obtain a [SecretKeyParamsBuilder] defining how to generate a feed signing key.
///
/// The `primary_user_id` has a format like `Name <email>`. e.g. `John Smith <someone@example.com>`.
pub fn signing_secret_key_params_builder(primary_user_id: impl ToString) -> SecretKeyParamsBuilder {
    let mut key_params = SecretKeyParamsBuilder::default();
    key_params
        .key_type(KeyType::Rsa(2048))
        .preferred_symmetric_algorithms(smallvec![SymmetricKeyAlgorithm::AES256])
        .preferred_hash_algorithms(smallvec![
            HashAlgorithm::SHA2_256,
            HashAlgorithm::SHA2_384,
            HashAlgorithm::SHA2_512
        ])
        .preferred_compression_algorithms(smallvec![CompressionAlgorithm::ZLIB])
        .can_create_certificates(false)
        .can_sign(true)
        .primary_user_id(primary_user_id.to_string());

    key_params
}

/// Create a self-signed PGP key pair.
///
/// `key_passphrase` defines a function that will return the passphrase used to
/// lock the private key.
pub fn create_self_signed_key<PW>(
    params: SecretKeyParams,
    key_passphrase: PW,
) -> pgp::errors::Result<(SignedSecretKey, SignedPublicKey)>
where
    PW: (FnOnce() -> String) + Clone,
{
    let secret_key = params.generate()?;
    let secret_key_signed = secret_key.sign(key_passphrase.clone())?;

    let public_key = secret_key_signed.public_key();
    let public_key_signed = public_key.sign(&secret_key_signed, key_passphrase)?;

    Ok((secret_key_signed, public_key_signed))
}

/// Produce a binary detached signature over `data`.
pub fn sign_detached<PW>(
    key: &impl SecretKeyTrait,
    key_pw: PW,
    data: &[u8],
) -> pgp::errors::Result<Vec<u8>>
where
    PW: FnOnce() -> String,
{
    let hashed_subpackets = vec![
        Subpacket::IssuerFingerprint(KeyVersion::V4, SmallVec::from_slice(&key.fingerprint())),
        Subpacket::SignatureCreationTime(chrono::Utc::now().trunc_subsecs(0)),
    ];
    let unhashed_subpackets = vec![Subpacket::Issuer(key.key_id())];

    let config = SignatureConfig::new_v4(
        Default::default(),
        SignatureType::Binary,
        key.algorithm(),
        HashAlgorithm::SHA2_256,
        hashed_subpackets,
        unhashed_subpackets,
    );

    let signature = config.sign(key, key_pw, Cursor::new(data))?;

    Packet::Signature(signature).to_bytes()
}

/// Sign a feed document, returning it with a signature block appended.
///
/// Documents are normalized to end with a newline before signing, since the
/// signature block must start on a line of its own.
pub fn sign_feed<PW>(key: &impl SecretKeyTrait, key_pw: PW, data: &[u8]) -> Result<Vec<u8>>
where
    PW: FnOnce() -> String,
{
    let mut content = data.to_vec();
    if !content.ends_with(b"\n") {
        content.push(b'\n');
    }

    let signature = sign_detached(key, key_pw, &content)?;

    append_signature_block(&content, &signature)
}

#[cfg(test)]
pub(crate) fn test_key_pair() -> pgp::errors::Result<(SignedSecretKey, SignedPublicKey)> {
    let params = signing_secret_key_params_builder("Feed Signer <signer@example.com>").build()?;

    create_self_signed_key(params, String::new)
}
