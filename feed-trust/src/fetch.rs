// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Retrieving remote content. */

use {
    crate::{FeedError, Result},
    implementation_store::CancellationToken,
    log::debug,
    std::{
        io::{Read, Write},
        time::Duration,
    },
    url::Url,
};

const CHUNK_SIZE: usize = 32768;

/// Something able to fetch the content behind a URL.
///
/// Network failures are reported as [FeedError::Download].
pub trait Fetcher {
    fn fetch_to(&self, url: &Url, writer: &mut dyn Write, cancel: &CancellationToken)
        -> Result<()>;

    fn fetch(&self, url: &Url, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let mut data = vec![];
        self.fetch_to(url, &mut data, cancel)?;

        Ok(data)
    }
}

const USER_AGENT: &str = concat!("feed-trust/", env!("CARGO_PKG_VERSION"));

/// Obtain the HTTP client used for feed, key and catalog downloads.
///
/// Proxies come from the `*_proxy` environment variables, which reqwest
/// reads on its own. There is no overall timeout since downloads are
/// bounded by cancellation instead.
pub fn get_http_client() -> reqwest::Result<reqwest::blocking::Client> {
    reqwest::blocking::ClientBuilder::new()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(30))
        .timeout(None::<Duration>)
        .build()
}

fn download_error(url: &Url, e: impl std::error::Error + Send + Sync + 'static) -> FeedError {
    FeedError::Download {
        url: url.to_string(),
        source: Box::new(e),
    }
}

/// A [Fetcher] speaking HTTP(S).
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: get_http_client()?,
        })
    }

    pub fn with_client(client: reqwest::blocking::Client) -> Self {
        Self { client }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch_to(
        &self,
        url: &Url,
        writer: &mut dyn Write,
        cancel: &CancellationToken,
    ) -> Result<()> {
        cancel.check()?;
        debug!("fetching {}", url);

        let mut response = self
            .client
            .get(url.clone())
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| download_error(url, e))?;

        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            cancel.check()?;

            let count = response
                .read(&mut buffer)
                .map_err(|e| download_error(url, e))?;
            if count == 0 {
                break;
            }

            writer.write_all(&buffer[..count])?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cancelled_before_request() -> Result<()> {
        let fetcher = HttpFetcher::new()?;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let url = Url::parse("http://127.0.0.1:9/feed.xml")?;
        let res = fetcher.fetch(&url, &cancel);
        assert!(matches!(res, Err(ref e) if e.is_cancelled()));

        Ok(())
    }
}
