//! Where source images come from
//!
//! A source is fetched once; there is no retry. Downloads are bounded by a
//! timeout and a byte limit.

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use url::Url;

use crate::error::{MapError, Result};
use crate::settings::Settings;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageSource {
    Url(Url),
    File(PathBuf),
    Bytes(Arc<[u8]>),
}

impl ImageSource {
    /// Interpret user input: `http(s)://` and `file://` URLs, anything else is
    /// a local path
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(MapError::InvalidSource("empty image location".to_string()));
        }

        match Url::parse(input) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(ImageSource::Url(url)),
            Ok(url) if url.scheme() == "file" => url
                .to_file_path()
                .map(ImageSource::File)
                .map_err(|()| MapError::InvalidSource(format!("invalid file URL: {input}"))),
            // Single letters are Windows drive prefixes, not schemes.
            Ok(url) if url.scheme().len() > 1 => Err(MapError::InvalidSource(format!(
                "unsupported URL scheme: {}",
                url.scheme()
            ))),
            _ => Ok(ImageSource::File(PathBuf::from(input))),
        }
    }

    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>) -> Self {
        ImageSource::Bytes(bytes.into())
    }

    pub fn from_path(path: impl AsRef<Path>) -> Self {
        ImageSource::File(path.as_ref().to_path_buf())
    }

    /// Name suggested for a map made from this source
    pub fn suggested_name(&self) -> Option<String> {
        let stem = match self {
            ImageSource::Url(url) => url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .filter(|s| !s.is_empty())
                .map(|s| s.rsplit_once('.').map_or(s, |(stem, _)| stem).to_string()),
            ImageSource::File(path) => path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(str::to_string),
            ImageSource::Bytes(_) => None,
        }?;
        let name: String = stem
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
            .collect();
        (!name.is_empty()).then_some(name)
    }
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Url(url) => write!(f, "{url}"),
            ImageSource::File(path) => write!(f, "{}", path.display()),
            ImageSource::Bytes(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FetchLimits {
    pub timeout: Duration,
    pub max_bytes: u64,
}

impl FetchLimits {
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            timeout: settings.fetch_timeout(),
            max_bytes: settings.max_source_bytes,
        }
    }
}

impl Default for FetchLimits {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Downloads the bytes behind a URL
pub trait SourceFetcher: Send + Sync {
    fn fetch_url(&self, url: &Url, limits: FetchLimits) -> Result<Vec<u8>>;
}

/// Fetcher over plain HTTP(S)
#[derive(Clone, Copy, Debug, Default)]
pub struct HttpFetcher;

#[cfg(feature = "http")]
impl SourceFetcher for HttpFetcher {
    fn fetch_url(&self, url: &Url, limits: FetchLimits) -> Result<Vec<u8>> {
        let agent = ureq::AgentBuilder::new().timeout(limits.timeout).build();
        let response = agent.get(url.as_str()).call().map_err(|e| match e {
            ureq::Error::Status(code, _) => {
                MapError::InvalidSource(format!("{url} answered with HTTP {code}"))
            }
            ureq::Error::Transport(transport) => {
                MapError::InvalidSource(format!("cannot download {url}: {transport}"))
            }
        })?;

        if let Some(length) = response
            .header("Content-Length")
            .and_then(|v| v.parse::<u64>().ok())
        {
            if length > limits.max_bytes {
                return Err(too_large(limits.max_bytes));
            }
        }

        let bytes = read_limited(response.into_reader(), limits.max_bytes)
            .map_err(|e| MapError::InvalidSource(format!("download of {url} failed: {e}")))?;
        check_size(bytes, limits.max_bytes)
    }
}

#[cfg(not(feature = "http"))]
impl SourceFetcher for HttpFetcher {
    fn fetch_url(&self, url: &Url, _limits: FetchLimits) -> Result<Vec<u8>> {
        Err(MapError::InvalidSource(format!(
            "cannot download {url}: built without HTTP support"
        )))
    }
}

/// Read the raw bytes of `source`
pub fn fetch(source: &ImageSource, fetcher: &dyn SourceFetcher, limits: FetchLimits) -> Result<Vec<u8>> {
    let bytes = match source {
        ImageSource::Url(url) => fetcher.fetch_url(url, limits)?,
        ImageSource::File(path) => {
            let file = std::fs::File::open(path).map_err(|e| {
                MapError::InvalidSource(format!("cannot open {}: {e}", path.display()))
            })?;
            let bytes = read_limited(file, limits.max_bytes).map_err(|e| {
                MapError::InvalidSource(format!("cannot read {}: {e}", path.display()))
            })?;
            check_size(bytes, limits.max_bytes)?
        }
        ImageSource::Bytes(bytes) => {
            if bytes.len() as u64 > limits.max_bytes {
                return Err(too_large(limits.max_bytes));
            }
            bytes.to_vec()
        }
    };

    if bytes.is_empty() {
        return Err(MapError::InvalidSource(format!("{source} is empty")));
    }
    debug!("Fetched {} bytes from {source}", bytes.len());
    Ok(bytes)
}

/// Read at most one byte past `max_bytes`, enough for [`check_size`] to tell
fn read_limited(reader: impl Read, max_bytes: u64) -> std::io::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    reader
        .take(max_bytes.saturating_add(1))
        .read_to_end(&mut bytes)?;
    Ok(bytes)
}

fn check_size(bytes: Vec<u8>, max_bytes: u64) -> Result<Vec<u8>> {
    if bytes.len() as u64 > max_bytes {
        return Err(too_large(max_bytes));
    }
    Ok(bytes)
}

fn too_large(max_bytes: u64) -> MapError {
    MapError::InvalidSource(format!("image is larger than {max_bytes} bytes"))
}
