//! Keyed fetch: the `"tor:" + url` entry point and its serialisable outcome.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::fetch::{FetchError, Fetcher};
use crate::pool::ResourceFactory;
use crate::transport::Circuit;

pub const CACHE_KEY_PREFIX: &str = "tor:";

/// Key under which `url` is fetched.
pub fn cache_key(url: &str) -> String {
    format!("{CACHE_KEY_PREFIX}{url}")
}

/// URL carried by a fetch key, if it is one.
pub fn url_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(CACHE_KEY_PREFIX)
}

/// Wire shape of a keyed fetch: `{"data": …}` or `{"error": …}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FetchOutcome {
    Data { data: String },
    Error { error: String },
}

impl FetchOutcome {
    pub fn is_data(&self) -> bool {
        matches!(self, FetchOutcome::Data { .. })
    }
}

impl From<Result<String, FetchError>> for FetchOutcome {
    fn from(result: Result<String, FetchError>) -> Self {
        match result {
            Ok(data) => FetchOutcome::Data { data },
            Err(e) => FetchOutcome::Error {
                error: e.to_string(),
            },
        }
    }
}

impl<F> Fetcher<F>
where
    F: ResourceFactory,
    F::Resource: Circuit,
{
    /// Fetch the URL named by `key`. Keys without the prefix never lease a circuit.
    pub async fn fetch_keyed(&self, key: &str, cancel: &CancellationToken) -> FetchOutcome {
        let result = match url_from_key(key) {
            Some(url) => self.fetch(url, cancel).await,
            None => Err(FetchError::InvalidKey(key.to_string())),
        };
        FetchOutcome::from(result)
    }
}
