// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Obtaining feeds from the cache or the network. */

use {
    crate::{
        config::{Config, NetworkLevel},
        feed::Feed,
        feed_cache::FeedCache,
        fetch::Fetcher,
        handler::TaskHandler,
        locations::Locations,
        preferences::{CheckAttempts, FeedPreferences},
        trust_manager::TrustManager,
        uri::FeedUri,
        FeedError, Result,
    },
    chrono::{Duration, Utc},
    log::{debug, info, warn},
    std::path::PathBuf,
    url::Url,
};

/// Minimum time between attempts to update a stale feed.
pub const FAILED_CHECK_DELAY_SECONDS: i64 = 60 * 60;

/// Provides feeds, downloading and verifying them as needed.
pub struct FeedManager<'a> {
    config: &'a Config,
    feed_cache: &'a FeedCache,
    trust_manager: &'a TrustManager<'a>,
    fetcher: &'a dyn Fetcher,
    handler: &'a dyn TaskHandler,
    preferences_dir: PathBuf,
    attempts: CheckAttempts,
    refresh: bool,
    stale: bool,
}

impl<'a> FeedManager<'a> {
    pub fn new(
        config: &'a Config,
        locations: &Locations,
        feed_cache: &'a FeedCache,
        trust_manager: &'a TrustManager<'a>,
        fetcher: &'a dyn Fetcher,
        handler: &'a dyn TaskHandler,
    ) -> Self {
        Self {
            config,
            feed_cache,
            trust_manager,
            fetcher,
            handler,
            preferences_dir: locations.feed_preferences_dir(),
            attempts: CheckAttempts::new(locations.last_check_attempt_dir()),
            refresh: false,
            stale: false,
        }
    }

    /// Always download remote feeds, even when cached.
    pub fn set_refresh(&mut self, refresh: bool) {
        self.refresh = refresh;
    }

    pub fn refresh(&self) -> bool {
        self.refresh
    }

    /// Whether any feed served from the cache so far was stale.
    pub fn stale(&self) -> bool {
        self.stale
    }

    pub fn set_stale(&mut self, stale: bool) {
        self.stale = stale;
    }

    /// Whether stale feeds were seen and may be refreshed.
    pub fn should_refresh(&self) -> bool {
        self.stale && self.config.network_use == NetworkLevel::Full
    }

    /// Obtain a feed.
    pub fn get_feed(&mut self, uri: &FeedUri) -> Result<Feed> {
        if let Some(path) = uri.local_path() {
            if !path.is_file() {
                return Err(FeedError::FileNotFound(format!("{}", path.display())));
            }

            return self.feed_cache.get_feed(uri);
        }

        if self.refresh {
            self.download(uri)?;
        } else if !self.feed_cache.contains(uri) {
            if self.config.network_use == NetworkLevel::Offline {
                return Err(FeedError::NotCachedOffline(uri.to_string()));
            }

            self.download(uri)?;
        }

        let feed = self.feed_cache.get_feed(uri)?;
        self.stale |= self.is_stale(uri);

        Ok(feed)
    }

    /// Whether a cached feed should be checked for updates.
    ///
    /// Feeds are stale once not checked within the freshness period, unless a
    /// download was attempted within the last hour.
    pub fn is_stale(&self, uri: &FeedUri) -> bool {
        let now = Utc::now();
        let preferences = FeedPreferences::load_for_safe(&self.preferences_dir, uri);

        now - preferences.last_checked() > self.config.freshness()
            && now - self.attempts.get(uri) > Duration::seconds(FAILED_CHECK_DELAY_SECONDS)
    }

    /// Download a feed into the cache, falling back to the feed mirror.
    ///
    /// When the mirror fails too, the error from the original location is
    /// returned.
    pub fn download(&self, uri: &FeedUri) -> Result<()> {
        if let Err(e) = self.attempts.touch(uri) {
            warn!("unable to record check attempt for {}: {}", uri, e);
        }

        let err = match self.fetch_and_import(uri.as_url(), uri, None) {
            Ok(()) => return Ok(()),
            Err(e) if e.is_download() => e,
            Err(e) => return Err(e),
        };
        warn!("error downloading feed {}: {}", uri, err);

        if uri.is_loopback() {
            return Err(err);
        }
        let mirror = match self.config.feed_mirror()? {
            Some(mirror) => mirror,
            None => return Err(err),
        };

        let mirror_url = uri.mirror_url(&mirror)?;
        info!("trying feed mirror {}", mirror_url);

        match self.fetch_and_import(&mirror_url, uri, Some(&mirror_url)) {
            Ok(()) => Ok(()),
            Err(e) if e.is_download() => {
                debug!("feed mirror failed: {}", e);
                Err(err)
            }
            Err(e) => Err(e),
        }
    }

    fn fetch_and_import(&self, url: &Url, uri: &FeedUri, key_source: Option<&Url>) -> Result<()> {
        let mut temp = tempfile::Builder::new().prefix("0install-feed").tempfile()?;
        self.fetcher
            .fetch_to(url, temp.as_file_mut(), self.handler.cancellation())?;

        let data = std::fs::read(temp.path())?;
        self.import_feed(&data, uri, key_source)
    }

    /// Verify a feed document and add it to the cache.
    ///
    /// `key_source` is where missing keys are looked for first.
    pub fn import_feed(&self, data: &[u8], uri: &FeedUri, key_source: Option<&Url>) -> Result<()> {
        if uri.is_file() {
            return Err(FeedError::InvalidOperation(uri.to_string()));
        }

        let feed = Feed::from_xml(data)?;
        let declared = feed
            .uri
            .ok_or_else(|| FeedError::FeedUriMissing(uri.to_string()))?;
        if FeedUri::parse(&declared).ok().as_ref() != Some(uri) {
            return Err(FeedError::FeedUriMismatch {
                expected: uri.to_string(),
                actual: declared,
            });
        }

        let signature = self.trust_manager.check_trust(data, uri, key_source)?;

        if self.feed_cache.contains(uri) {
            match self.feed_cache.signatures(uri, self.trust_manager.openpgp()) {
                Ok(signatures) => {
                    if let Some(old) = signatures.iter().find_map(|s| s.as_valid()) {
                        if signature.timestamp < old.timestamp {
                            return Err(FeedError::ReplayAttack {
                                uri: uri.to_string(),
                                old: old.timestamp,
                                new: signature.timestamp,
                            });
                        }
                    }
                }
                Err(e) => warn!("unable to read signatures of cached {}: {}", uri, e),
            }
        }

        self.feed_cache.add(uri, data)?;

        let mut preferences = FeedPreferences::load_for_safe(&self.preferences_dir, uri);
        preferences.set_last_checked(Utc::now());
        preferences.save_for(&self.preferences_dir, uri)?;

        info!("imported feed {} signed by {}", uri, signature.fingerprint);

        Ok(())
    }

    /// Forget feeds parsed in memory.
    pub fn flush(&self) {
        self.feed_cache.flush();
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{testutil::*, trust_db::TrustDb},
        chrono::TimeZone,
    };

    const APP: &str = "https://example.org/app.xml";
    const MIRROR_APP: &str =
        "https://mirror.example.net/0mirror/feeds/https/example.org/app.xml/latest.xml";

    struct Fixture {
        _temp_dir: tempfile::TempDir,
        locations: Locations,
        config: Config,
        feed_cache: FeedCache,
        openpgp: FakeOpenPgp,
        fetcher: FakeFetcher,
        handler: RecordingHandler,
    }

    impl Fixture {
        fn new() -> Result<Self> {
            let (temp_dir, locations) = temp_locations()?;
            TrustDb::modify(locations.trust_db(), |db| {
                db.trust_key(FINGERPRINT, "example.org");
                db.trust_key(FINGERPRINT, "localhost");
            })?;

            Ok(Self {
                _temp_dir: temp_dir,
                feed_cache: FeedCache::new(locations.feed_cache_dir()),
                locations,
                config: Config {
                    key_info_server: String::new(),
                    feed_mirror: "https://mirror.example.net/0mirror".into(),
                    ..Config::default()
                },
                openpgp: FakeOpenPgp::with_key(KEY_ID, FINGERPRINT),
                fetcher: FakeFetcher::default(),
                handler: RecordingHandler::new(false),
            })
        }

        fn trust_manager(&self) -> TrustManager<'_> {
            TrustManager::new(
                &self.config,
                self.locations.trust_db(),
                &self.openpgp,
                &self.feed_cache,
                &self.fetcher,
                &self.handler,
            )
        }

        fn feed_manager<'a>(&'a self, trust_manager: &'a TrustManager<'a>) -> FeedManager<'a> {
            FeedManager::new(
                &self.config,
                &self.locations,
                &self.feed_cache,
                trust_manager,
                &self.fetcher,
                &self.handler,
            )
        }

        fn serve_feed(&self, url: &str, uri: &str, name: &str, unix_time: i64) -> Result<Vec<u8>> {
            let data = signed_document(
                &feed_document(&FeedUri::parse(uri)?, name),
                &[fake_signature(KEY_ID, FINGERPRINT, unix_time)],
            )?;
            self.fetcher.serve(url, &data);

            Ok(data)
        }
    }

    #[test]
    fn cached_after_first_download() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.serve_feed(APP, APP, "App", 1_600_000_000)?;
        let trust = fixture.trust_manager();
        let mut feeds = fixture.feed_manager(&trust);
        let uri = FeedUri::parse(APP)?;

        let feed = feeds.get_feed(&uri)?;
        assert_eq!(feed.name.as_deref(), Some("App"));
        assert_eq!(feed.uri.as_deref(), Some(APP));
        assert!(fixture.feed_cache.contains(&uri));

        let again = feeds.get_feed(&uri)?;
        assert_eq!(again, feed);
        assert_eq!(fixture.fetcher.requests(), vec![APP.to_string()]);
        assert!(!feeds.stale());
        assert!(!feeds.should_refresh());

        Ok(())
    }

    #[test]
    fn replay_rejected() -> Result<()> {
        let fixture = Fixture::new()?;
        let original = fixture.serve_feed(APP, APP, "App", 1_600_000_000)?;
        let trust = fixture.trust_manager();
        let mut feeds = fixture.feed_manager(&trust);
        let uri = FeedUri::parse(APP)?;
        feeds.get_feed(&uri)?;

        fixture.serve_feed(APP, APP, "Old App", 1_500_000_000)?;
        feeds.set_refresh(true);
        match feeds.get_feed(&uri) {
            Err(FeedError::ReplayAttack { old, new, .. }) => {
                assert_eq!(old, Utc.timestamp_opt(1_600_000_000, 0).unwrap());
                assert_eq!(new, Utc.timestamp_opt(1_500_000_000, 0).unwrap());
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(fixture.feed_cache.get_data(&uri)?, original);

        fixture.serve_feed(APP, APP, "New App", 1_700_000_000)?;
        assert_eq!(feeds.get_feed(&uri)?.name.as_deref(), Some("New App"));

        Ok(())
    }

    #[test]
    fn feed_substitution_rejected() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.serve_feed(APP, "https://example.org/other.xml", "Other", 1_600_000_000)?;
        let trust = fixture.trust_manager();
        let mut feeds = fixture.feed_manager(&trust);
        let uri = FeedUri::parse(APP)?;

        assert!(matches!(
            feeds.get_feed(&uri),
            Err(FeedError::FeedUriMismatch { .. })
        ));
        assert!(!fixture.feed_cache.contains(&uri));

        let unnamed = signed_document(
            b"<interface><name>App</name></interface>\n",
            &[fake_signature(KEY_ID, FINGERPRINT, 1_600_000_000)],
        )?;
        assert!(matches!(
            feeds.import_feed(&unnamed, &uri, None),
            Err(FeedError::FeedUriMissing(_))
        ));

        Ok(())
    }

    #[test]
    fn offline_not_cached() -> Result<()> {
        let mut fixture = Fixture::new()?;
        fixture.config.network_use = NetworkLevel::Offline;
        let trust = fixture.trust_manager();
        let mut feeds = fixture.feed_manager(&trust);

        assert!(matches!(
            feeds.get_feed(&FeedUri::parse(APP)?),
            Err(FeedError::NotCachedOffline(_))
        ));
        assert!(fixture.fetcher.requests().is_empty());

        Ok(())
    }

    #[test]
    fn mirror_fallback() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.serve_feed(MIRROR_APP, APP, "App", 1_600_000_000)?;
        let trust = fixture.trust_manager();
        let mut feeds = fixture.feed_manager(&trust);

        assert_eq!(
            feeds.get_feed(&FeedUri::parse(APP)?)?.name.as_deref(),
            Some("App")
        );
        assert_eq!(
            fixture.fetcher.requests(),
            vec![APP.to_string(), MIRROR_APP.to_string()]
        );

        Ok(())
    }

    #[test]
    fn mirror_failure_reports_original_error() -> Result<()> {
        let fixture = Fixture::new()?;
        let trust = fixture.trust_manager();
        let mut feeds = fixture.feed_manager(&trust);

        match feeds.get_feed(&FeedUri::parse(APP)?) {
            Err(FeedError::Download { url, .. }) => assert_eq!(url, APP),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(fixture.fetcher.requests().len(), 2);

        Ok(())
    }

    #[test]
    fn loopback_skips_mirror() -> Result<()> {
        let fixture = Fixture::new()?;
        let trust = fixture.trust_manager();
        let mut feeds = fixture.feed_manager(&trust);

        assert!(matches!(
            feeds.get_feed(&FeedUri::parse("http://localhost:8080/app.xml")?),
            Err(FeedError::Download { .. })
        ));
        assert_eq!(
            fixture.fetcher.requests(),
            vec!["http://localhost:8080/app.xml".to_string()]
        );

        Ok(())
    }

    #[test]
    fn staleness_throttled() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.serve_feed(APP, APP, "App", 1_600_000_000)?;
        let trust = fixture.trust_manager();
        let mut feeds = fixture.feed_manager(&trust);
        let uri = FeedUri::parse(APP)?;
        feeds.get_feed(&uri)?;
        assert!(!feeds.is_stale(&uri));

        let prefs_dir = fixture.locations.feed_preferences_dir();
        let mut prefs = FeedPreferences::load_for(&prefs_dir, &uri)?;
        prefs.set_last_checked(Utc.timestamp_opt(0, 0).unwrap());
        prefs.save_for(&prefs_dir, &uri)?;

        // Attempted moments ago.
        assert!(!feeds.is_stale(&uri));

        CheckAttempts::new(fixture.locations.last_check_attempt_dir())
            .set(&uri, Utc::now() - Duration::hours(2))?;
        assert!(feeds.is_stale(&uri));

        feeds.get_feed(&uri)?;
        assert!(feeds.stale());
        assert!(feeds.should_refresh());
        assert_eq!(fixture.fetcher.requests().len(), 1);

        Ok(())
    }

    #[test]
    fn local_feeds() -> Result<()> {
        let fixture = Fixture::new()?;
        let trust = fixture.trust_manager();
        let mut feeds = fixture.feed_manager(&trust);

        let path = fixture.locations.config_dir().join("local.xml");
        let uri = FeedUri::from_file_path(&path)?;
        assert!(matches!(
            feeds.get_feed(&uri),
            Err(FeedError::FileNotFound(_))
        ));

        std::fs::create_dir_all(fixture.locations.config_dir())?;
        std::fs::write(&path, feed_document(&uri, "Local"))?;
        assert_eq!(feeds.get_feed(&uri)?.name.as_deref(), Some("Local"));
        assert!(matches!(
            feeds.import_feed(&feed_document(&uri, "Local"), &uri, None),
            Err(FeedError::InvalidOperation(_))
        ));
        assert!(fixture.fetcher.requests().is_empty());

        Ok(())
    }
}
