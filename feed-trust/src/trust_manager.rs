// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Deciding whether a signed document comes from a trusted key.

[TrustManager::check_trust()] accepts a document once one of its valid
signatures was made by a key trusted for the domain of the document's URI.
Keys the user has not decided on yet are put to the [TaskHandler], unless
the key information server vouches for them and the feed is new. Keys that
are missing from the keyring are downloaded and imported, after which the
signatures are checked again.
*/

use {
    crate::{
        config::Config, feed_cache::FeedCache, fetch::Fetcher, handler::TaskHandler, key_info,
        trust_db::TrustDb, uri::{with_trailing_slash, FeedUri}, FeedError, Result,
    },
    feed_signature::{OpenPgp, Signature, ValidSignature},
    log::{debug, info, warn},
    std::{
        collections::BTreeSet,
        path::{Path, PathBuf},
    },
    url::Url,
};

/// Checks signatures against the trust database.
pub struct TrustManager<'a> {
    config: &'a Config,
    trust_db_path: PathBuf,
    openpgp: &'a dyn OpenPgp,
    feed_cache: &'a FeedCache,
    fetcher: &'a dyn Fetcher,
    handler: &'a dyn TaskHandler,
}

impl<'a> TrustManager<'a> {
    pub fn new(
        config: &'a Config,
        trust_db_path: impl AsRef<Path>,
        openpgp: &'a dyn OpenPgp,
        feed_cache: &'a FeedCache,
        fetcher: &'a dyn Fetcher,
        handler: &'a dyn TaskHandler,
    ) -> Self {
        Self {
            config,
            trust_db_path: trust_db_path.as_ref().to_path_buf(),
            openpgp,
            feed_cache,
            fetcher,
            handler,
        }
    }

    pub fn trust_db_path(&self) -> &Path {
        &self.trust_db_path
    }

    pub fn openpgp(&self) -> &dyn OpenPgp {
        self.openpgp
    }

    /// Find a trusted signature on `data`, which was obtained from `uri`.
    ///
    /// Missing keys are looked for next to `key_source` (a mirror URL or a
    /// local directory as `file:` URL) when given, otherwise next to `uri`,
    /// then on the feed mirror.
    pub fn check_trust(
        &self,
        data: &[u8],
        uri: &FeedUri,
        key_source: Option<&Url>,
    ) -> Result<ValidSignature> {
        if uri.is_file() {
            return Err(FeedError::InvalidOperation(uri.to_string()));
        }
        let domain = uri
            .domain()
            .ok_or_else(|| FeedError::InvalidFeedUri(uri.to_string()))?;

        let mut attempted_keys = BTreeSet::new();
        let mut asked = BTreeSet::new();

        loop {
            let trust_db = TrustDb::load_safe(&self.trust_db_path);
            let signatures = feed_signature::signatures(self.openpgp, data)?;
            let valid = signatures
                .iter()
                .filter_map(|s| s.as_valid())
                .collect::<Vec<_>>();

            if let Some(sig) = valid
                .iter()
                .find(|sig| trust_db.is_trusted(&sig.fingerprint, domain))
            {
                debug!("{} signed by trusted key {}", uri, sig.fingerprint);
                return Ok((*sig).clone());
            }

            for sig in valid {
                if !asked.insert(sig.fingerprint.clone()) {
                    continue;
                }

                if self.ask_key_approval(uri, sig, domain)? {
                    TrustDb::modify(&self.trust_db_path, |db| {
                        db.trust_key(&sig.fingerprint, domain)
                    })?;
                    warn!("trusting key {} for {}", sig.fingerprint, domain);

                    return Ok(sig.clone());
                }
            }

            let missing = signatures.iter().find_map(|s| match s {
                Signature::MissingKey { key_id } if !attempted_keys.contains(key_id) => {
                    Some(key_id.clone())
                }
                _ => None,
            });

            match missing {
                Some(key_id) => {
                    attempted_keys.insert(key_id.clone());
                    self.download_missing_key(uri, key_source, &key_id)?;
                }
                None => break,
            }
        }

        Err(FeedError::NoTrustedSignatures(uri.to_string()))
    }

    fn ask_key_approval(&self, uri: &FeedUri, sig: &ValidSignature, domain: &str) -> Result<bool> {
        let cancel = self.handler.cancellation();
        cancel.check()?;

        let info = match self.config.key_info_server()? {
            Some(server) => key_info::lookup(self.fetcher, &server, &sig.fingerprint, cancel)?,
            None => key_info::KeyInformation::default(),
        };

        if self.config.auto_approve_keys && info.good_vote && !self.feed_cache.contains(uri) {
            info!("automatically approving key {} for new feed {}", sig.fingerprint, uri);
            return Ok(true);
        }

        let question = format!(
            "New keys need to be trusted before {} can be used:\n\n{}\n{}\n\nDo you want to trust this key to sign feeds from '{}'?",
            uri,
            sig.fingerprint,
            info.description
                .as_deref()
                .unwrap_or("No information about this key is available."),
            domain
        );
        let answer = self
            .handler
            .ask_question(&question, Some("Untrusted keys found"))?;
        cancel.check()?;

        Ok(answer)
    }

    fn download_missing_key(
        &self,
        uri: &FeedUri,
        key_source: Option<&Url>,
        key_id: &str,
    ) -> Result<()> {
        let file_name = format!("{}.gpg", key_id);
        let key_url = key_source.unwrap_or_else(|| uri.as_url()).join(&file_name)?;

        let data = if key_url.scheme() == "file" {
            let path = key_url
                .to_file_path()
                .map_err(|_| FeedError::InvalidFeedUri(key_url.to_string()))?;
            std::fs::read(&path).map_err(|e| FeedError::KeyDownload {
                key_id: key_id.to_string(),
                source: Box::new(FeedError::IoPath(format!("{}", path.display()), e)),
            })?
        } else {
            info!("downloading key {} from {}", key_id, key_url);
            self.fetch_key(&key_url, key_id)?
        };

        self.openpgp.import_key(&data)?;
        info!("imported key {}", key_id);

        Ok(())
    }

    fn fetch_key(&self, url: &Url, key_id: &str) -> Result<Vec<u8>> {
        let cancel = self.handler.cancellation();

        let err = match self.fetcher.fetch(url, cancel) {
            Ok(data) => return Ok(data),
            Err(e) if e.is_download() => e,
            Err(e) => return Err(e),
        };
        warn!("unable to download key {}: {}", key_id, err);

        if let Some(mirror) = self.config.feed_mirror()? {
            let mirror_url = with_trailing_slash(&mirror).join(&format!("keys/{}.gpg", key_id))?;
            info!("trying feed mirror for key {}: {}", key_id, mirror_url);

            match self.fetcher.fetch(&mirror_url, cancel) {
                Ok(data) => return Ok(data),
                Err(e) if e.is_download() => {
                    debug!("mirror failed for key {}: {}", key_id, e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(FeedError::KeyDownload {
            key_id: key_id.to_string(),
            source: Box::new(err),
        })
    }
}
