// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::{
        fetch::Fetcher, handler::TaskHandler, locations::Locations, uri::FeedUri, FeedError,
        Result,
    },
    chrono::{TimeZone, Utc},
    feed_signature::{OpenPgp, Signature, SignatureError, ValidSignature},
    implementation_store::CancellationToken,
    std::{collections::HashMap, io::Write, sync::Mutex},
    url::Url,
};

pub const FINGERPRINT: &str = "88C8A1F375928691D7365C0259AA3927C24E4E1E";
pub const KEY_ID: &str = "59AA3927C24E4E1E";

/// Serves canned responses and records requests.
#[derive(Default)]
pub struct FakeFetcher {
    responses: Mutex<HashMap<String, Vec<u8>>>,
    requests: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn serve(&self, url: &str, data: impl AsRef<[u8]>) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.insert(url.to_string(), data.as_ref().to_vec());
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl Fetcher for FakeFetcher {
    fn fetch_to(
        &self,
        url: &Url,
        writer: &mut dyn Write,
        cancel: &CancellationToken,
    ) -> Result<()> {
        cancel.check()?;

        if let Ok(mut requests) = self.requests.lock() {
            requests.push(url.to_string());
        }

        let data = self
            .responses
            .lock()
            .ok()
            .and_then(|r| r.get(url.as_str()).cloned());

        match data {
            Some(data) => {
                writer.write_all(&data)?;
                Ok(())
            }
            None => Err(FeedError::Download {
                url: url.to_string(),
                source: Box::new(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "404 Not Found",
                )),
            }),
        }
    }
}

/// Treats signature blocks as lines of `<KEYID> <FINGERPRINT> <UNIX TIME>`
/// or `bad <KEYID>`. Keys are imported as `<KEYID> <FINGERPRINT>`.
#[derive(Default)]
pub struct FakeOpenPgp {
    keys: Mutex<HashMap<String, String>>,
}

impl FakeOpenPgp {
    pub fn with_key(key_id: &str, fingerprint: &str) -> Self {
        let openpgp = Self::default();
        if let Ok(mut keys) = openpgp.keys.lock() {
            keys.insert(key_id.to_string(), fingerprint.to_string());
        }

        openpgp
    }
}

impl OpenPgp for FakeOpenPgp {
    fn verify(
        &self,
        _data: &[u8],
        signature: &[u8],
    ) -> feed_signature::Result<Vec<Signature>> {
        let keys = self.keys.lock().map(|k| k.clone()).unwrap_or_default();

        Ok(String::from_utf8_lossy(signature)
            .lines()
            .map(|line| {
                let parts = line.split(' ').collect::<Vec<_>>();
                match parts.as_slice() {
                    ["bad", key_id] => Signature::Bad {
                        key_id: key_id.to_string(),
                    },
                    [key_id, fingerprint, time] => match keys.get(*key_id) {
                        Some(known) if known == fingerprint => {
                            let seconds = time.parse().unwrap_or(0);
                            Signature::Valid(ValidSignature {
                                fingerprint: fingerprint.to_string(),
                                timestamp: Utc.timestamp_opt(seconds, 0).unwrap(),
                            })
                        }
                        _ => Signature::MissingKey {
                            key_id: key_id.to_string(),
                        },
                    },
                    _ => Signature::Unknown {
                        key_id: None,
                        reason: line.to_string(),
                    },
                }
            })
            .collect())
    }

    fn import_key(&self, data: &[u8]) -> feed_signature::Result<()> {
        let text = String::from_utf8_lossy(data).to_string();
        let parts = text.split_whitespace().collect::<Vec<_>>();

        match (parts.as_slice(), self.keys.lock()) {
            ([key_id, fingerprint], Ok(mut keys)) => {
                keys.insert(key_id.to_string(), fingerprint.to_string());
                Ok(())
            }
            _ => Err(SignatureError::NoPublicKey),
        }
    }
}

/// Answers every question the same way and records them.
pub struct RecordingHandler {
    cancel: CancellationToken,
    answer: bool,
    questions: Mutex<Vec<String>>,
}

impl RecordingHandler {
    pub fn new(answer: bool) -> Self {
        Self {
            cancel: CancellationToken::new(),
            answer,
            questions: Mutex::new(vec![]),
        }
    }

    pub fn questions(&self) -> Vec<String> {
        self.questions
            .lock()
            .map(|q| q.clone())
            .unwrap_or_default()
    }
}

impl TaskHandler for RecordingHandler {
    fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    fn ask_question(&self, question: &str, _batch_information: Option<&str>) -> Result<bool> {
        self.cancel.check()?;
        if let Ok(mut questions) = self.questions.lock() {
            questions.push(question.to_string());
        }

        Ok(self.answer)
    }
}

pub fn temp_locations() -> Result<(tempfile::TempDir, Locations)> {
    let temp_dir = tempfile::Builder::new()
        .prefix("feed-trust-test")
        .tempdir()?;
    let locations = Locations::new(temp_dir.path().join("config"), temp_dir.path().join("cache"));

    Ok((temp_dir, locations))
}

/// An unsigned feed document declaring `uri`.
pub fn feed_document(uri: &FeedUri, name: &str) -> Vec<u8> {
    format!(
        "<?xml version=\"1.0\" ?>\n<interface uri=\"{}\" xmlns=\"{}\">\n  <name>{}</name>\n</interface>\n",
        uri,
        crate::feed::FEED_NAMESPACE,
        name
    )
    .into_bytes()
}

/// A fake signature line as understood by [FakeOpenPgp].
pub fn fake_signature(key_id: &str, fingerprint: &str, unix_time: i64) -> String {
    format!("{} {} {}", key_id, fingerprint, unix_time)
}

/// A document with a signature block holding `signatures`.
pub fn signed_document(document: &[u8], signatures: &[String]) -> Result<Vec<u8>> {
    Ok(feed_signature::append_signature_block(
        document,
        signatures.join("\n").as_bytes(),
    )?)
}
