use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::LocalBoxFuture;
use thiserror::Error;
use tokio::sync::RwLock;
use url::Url;

/// Source of external script bodies for the sequencer.
///
/// The returned future owns everything it needs so the sequencer can keep
/// several fetches in flight while it waits on the one at its cursor.
pub trait FetchScript {
    fn fetch(&self, src: &str) -> LocalBoxFuture<'static, Result<String, FetchError>>;
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid script URL {src}: {source}")]
    InvalidUrl {
        src: String,
        #[source]
        source: url::ParseError,
    },
    #[error("network error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("script at {0} is not valid UTF-8")]
    Encoding(String),
    #[error("unsupported script URL scheme: {0}")]
    UnsupportedScheme(String),
    #[error("fetching {url} timed out after {waited_ms}ms")]
    Timeout { url: String, waited_ms: u64 },
}

/// Cache key for scripts: origin plus path.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct ScriptCacheKey {
    origin: String,
    path: String,
}

impl ScriptCacheKey {
    fn for_url(url: &Url) -> Self {
        Self {
            origin: format!("{}://{}", url.scheme(), url.host_str().unwrap_or("")),
            path: url.path().to_string(),
        }
    }
}

struct FetcherInner {
    client: reqwest::Client,
    base_url: Url,
    timeout: Duration,
    overlay: HashMap<String, String>,
    cache: RwLock<HashMap<ScriptCacheKey, String>>,
}

/// Fetches and caches external scripts referenced by content.
///
/// `http(s)` goes through reqwest, `file:` reads from disk, and an optional
/// in-memory overlay serves files extracted from a content bundle.
#[derive(Clone)]
pub struct ScriptFetcher {
    inner: Arc<FetcherInner>,
}

impl ScriptFetcher {
    pub fn new(base_url: Url, timeout: Duration) -> Self {
        Self::with_overlay(base_url, timeout, HashMap::new())
    }

    /// Serve `files` (paths relative to `base_url`) without touching the
    /// network or disk.
    pub fn with_overlay(
        base_url: Url,
        timeout: Duration,
        files: HashMap<String, String>,
    ) -> Self {
        let overlay = files
            .into_iter()
            .filter_map(|(path, body)| match resolve_url(&path, &base_url) {
                Ok(url) => Some((url.to_string(), body)),
                Err(err) => {
                    tracing::warn!(target: "script_fetch", path = %path, error = %err, "skipping overlay entry");
                    None
                }
            })
            .collect();

        Self {
            inner: Arc::new(FetcherInner {
                client: reqwest::Client::new(),
                base_url,
                timeout,
                overlay,
                cache: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Fetch a script, using the cache if available.
    pub async fn fetch_script(&self, script_url: &str) -> Result<String, FetchError> {
        let url = resolve_url(script_url, &self.inner.base_url)?;

        if let Some(body) = self.inner.overlay.get(url.as_str()) {
            tracing::debug!(target: "script_fetch", url = %url, "overlay hit");
            return Ok(body.clone());
        }

        let cache_key = ScriptCacheKey::for_url(&url);
        {
            let cache_read = self.inner.cache.read().await;
            if let Some(cached) = cache_read.get(&cache_key) {
                tracing::debug!(target: "script_fetch", url = %url, "cache hit");
                return Ok(cached.clone());
            }
        }

        tracing::debug!(target: "script_fetch", url = %url, "fetching");
        let content = match tokio::time::timeout(self.inner.timeout, self.load(&url)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(FetchError::Timeout {
                    url: url.to_string(),
                    waited_ms: self.inner.timeout.as_millis() as u64,
                })
            }
        };

        self.inner
            .cache
            .write()
            .await
            .insert(cache_key, content.clone());

        Ok(content)
    }

    async fn load(&self, url: &Url) -> Result<String, FetchError> {
        match url.scheme() {
            "http" | "https" => {
                let response = self.inner.client.get(url.clone()).send().await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(FetchError::Status {
                        url: url.to_string(),
                        status: status.as_u16(),
                    });
                }
                let bytes = response.bytes().await?;
                String::from_utf8(bytes.to_vec()).map_err(|_| FetchError::Encoding(url.to_string()))
            }
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| FetchError::UnsupportedScheme(url.to_string()))?;
                let bytes = tokio::fs::read(&path).await.map_err(|source| FetchError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                String::from_utf8(bytes).map_err(|_| FetchError::Encoding(url.to_string()))
            }
            other => Err(FetchError::UnsupportedScheme(other.to_string())),
        }
    }
}

impl FetchScript for ScriptFetcher {
    fn fetch(&self, src: &str) -> LocalBoxFuture<'static, Result<String, FetchError>> {
        let fetcher = self.clone();
        let src = src.to_string();
        Box::pin(async move { fetcher.fetch_script(&src).await })
    }
}

pub(crate) fn resolve_url(script_url: &str, base_url: &Url) -> Result<Url, FetchError> {
    let invalid = |source| FetchError::InvalidUrl {
        src: script_url.to_string(),
        source,
    };

    // Already absolute: use it as-is
    if script_url.starts_with("http://")
        || script_url.starts_with("https://")
        || script_url.starts_with("file://")
    {
        return Url::parse(script_url).map_err(invalid);
    }

    base_url.join(script_url).map_err(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(url: &str) -> Url {
        Url::parse(url).unwrap()
    }

    #[test]
    fn test_resolve_url_absolute() {
        let result = resolve_url(
            "https://example.com/script.js",
            &base("https://base.com/page.html"),
        );
        assert_eq!(result.unwrap().as_str(), "https://example.com/script.js");
    }

    #[test]
    fn test_resolve_url_relative() {
        let result = resolve_url("script.js", &base("https://base.com/page.html"));
        assert_eq!(result.unwrap().as_str(), "https://base.com/script.js");
    }

    #[test]
    fn test_resolve_url_relative_path() {
        let result = resolve_url("../lib/script.js", &base("https://base.com/app/page.html"));
        assert_eq!(result.unwrap().as_str(), "https://base.com/lib/script.js");
    }

    #[test]
    fn test_resolve_url_absolute_path() {
        let result = resolve_url("/assets/script.js", &base("https://base.com/app/page.html"));
        assert_eq!(result.unwrap().as_str(), "https://base.com/assets/script.js");
    }

    #[tokio::test]
    async fn overlay_serves_bundle_files() {
        let mut files = HashMap::new();
        files.insert("js/api.js".to_string(), "var api = 1;".to_string());
        let fetcher = ScriptFetcher::with_overlay(
            base("https://lessons.invalid/unit-1/index.html"),
            Duration::from_secs(1),
            files,
        );
        let body = fetcher.fetch_script("./js/api.js").await.unwrap();
        assert_eq!(body, "var api = 1;");
    }

    #[tokio::test]
    async fn reads_file_urls_from_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("lesson.js"), "var lesson = true;").unwrap();
        let base_url = Url::from_directory_path(dir.path()).unwrap();
        let fetcher = ScriptFetcher::new(base_url, Duration::from_secs(1));

        assert_eq!(
            fetcher.fetch_script("lesson.js").await.unwrap(),
            "var lesson = true;"
        );
        assert!(matches!(
            fetcher.fetch_script("missing.js").await,
            Err(FetchError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn rejects_unsupported_schemes() {
        let fetcher = ScriptFetcher::new(base("https://base.com/"), Duration::from_secs(1));
        assert!(matches!(
            fetcher.fetch_script("ftp://files.invalid/a.js").await,
            Err(FetchError::UnsupportedScheme(_))
        ));
    }
}
