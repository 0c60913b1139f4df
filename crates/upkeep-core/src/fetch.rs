//! Asset bundle retrieval.
//!
//! Downloads always land in a staging directory outside the live asset tree,
//! under a `.part` name that is renamed only once the body is complete. A
//! failed or interrupted download therefore never touches what is served.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Result, UpkeepError};
use crate::io;

/// Object-storage capability: copy the object at `locator` into `dest`.
/// Returns the number of bytes written.
pub trait ObjectStore: Send + Sync {
    fn get(&self, locator: &str, dest: &Path) -> Result<u64>;
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

/// Plain HTTP(S) GET, e.g. a public or pre-signed bucket URL.
pub struct HttpStore {
    client: reqwest::blocking::Client,
}

impl HttpStore {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("upkeep/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| UpkeepError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl ObjectStore for HttpStore {
    fn get(&self, locator: &str, dest: &Path) -> Result<u64> {
        let fetch_err = |cause: String| UpkeepError::Fetch {
            locator: locator.to_string(),
            cause,
        };
        let mut resp = self
            .client
            .get(locator)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| fetch_err(e.to_string()))?;
        let mut file = File::create(dest)?;
        let bytes = resp
            .copy_to(&mut file)
            .map_err(|e| fetch_err(e.to_string()))?;
        file.sync_all()?;
        Ok(bytes)
    }
}

/// Local filesystem or mounted storage: `file:///path` or a bare path.
pub struct FileStore;

impl ObjectStore for FileStore {
    fn get(&self, locator: &str, dest: &Path) -> Result<u64> {
        let source = locator.strip_prefix("file://").unwrap_or(locator);
        Ok(std::fs::copy(source, dest)?)
    }
}

/// Dispatches on the locator scheme.
pub struct RoutingStore {
    http: HttpStore,
    file: FileStore,
}

impl RoutingStore {
    pub fn new(http_timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: HttpStore::new(http_timeout)?,
            file: FileStore,
        })
    }
}

impl ObjectStore for RoutingStore {
    fn get(&self, locator: &str, dest: &Path) -> Result<u64> {
        if locator.starts_with("http://") || locator.starts_with("https://") {
            self.http.get(locator, dest)
        } else if locator.starts_with("file://") || !locator.contains("://") {
            self.file.get(locator, dest)
        } else {
            Err(UpkeepError::Fetch {
                locator: locator.to_string(),
                cause: "unsupported locator scheme".into(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// AssetFetcher
// ---------------------------------------------------------------------------

pub struct AssetFetcher {
    store: Box<dyn ObjectStore>,
    download_dir: PathBuf,
}

impl AssetFetcher {
    pub fn new(store: Box<dyn ObjectStore>, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            download_dir: download_dir.into(),
        }
    }

    /// Fetch the bundle at `locator` into the download directory and return
    /// its local path. Every failure is reported as [`UpkeepError::Fetch`].
    pub fn fetch(&self, locator: &str) -> Result<PathBuf> {
        let fetch_err = |cause: String| UpkeepError::Fetch {
            locator: locator.to_string(),
            cause,
        };
        io::ensure_dir(&self.download_dir).map_err(|e| fetch_err(e.to_string()))?;

        let name = download_name(locator);
        let dest = self.download_dir.join(&name);
        let part = self.download_dir.join(format!("{name}.part"));
        let _ = std::fs::remove_file(&part);

        debug!(locator, part = %part.display(), "fetching asset bundle");
        let bytes = match self.store.get(locator, &part) {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = std::fs::remove_file(&part);
                return Err(match e {
                    UpkeepError::Fetch { .. } => e,
                    other => fetch_err(other.to_string()),
                });
            }
        };
        std::fs::rename(&part, &dest).map_err(|e| {
            let _ = std::fs::remove_file(&part);
            fetch_err(e.to_string())
        })?;
        info!(locator, bytes, "asset bundle downloaded");
        Ok(dest)
    }

    /// Remove a downloaded bundle once it has been installed (or rejected).
    pub fn discard(&self, bundle: &Path) {
        if let Err(e) = std::fs::remove_file(bundle) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %bundle.display(), error = %e, "failed to remove downloaded bundle");
            }
        }
    }
}

/// Local file name for a locator: its last path segment without query or
/// fragment, restricted to a safe character set.
fn download_name(locator: &str) -> String {
    let without_query = locator.split(['?', '#']).next().unwrap_or(locator);
    let segment = without_query.rsplit('/').next().unwrap_or("");
    let cleaned: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "bundle.zip".to_string()
    } else {
        cleaned.to_string()
    }
}
