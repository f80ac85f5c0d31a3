//! Image fetchers: download over HTTP(S) or copy a local file into staging.
//!
//! Both stream the image through a SHA-256 hasher while copying, so an
//! expected checksum can be validated without a second pass over the file.
use crate::collaborators::ImageFetcher;
use crate::device::ImageInfo;
use anyhow::{Context, Result, bail};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB
const MIB: f64 = 1024.0 * 1024.0;
const DEFAULT_FILE_NAME: &str = "image.img";

/// Picks a fetcher for `source`: HTTP(S) URLs are downloaded, anything else is
/// treated as a local path.
pub fn fetcher_for(source: &str, expected_sha256: Option<String>) -> Result<Arc<dyn ImageFetcher>> {
    if source.starts_with("http://") || source.starts_with("https://") {
        Ok(Arc::new(HttpFetcher::new(source, expected_sha256)?))
    } else {
        Ok(Arc::new(LocalFetcher::new(source, expected_sha256)))
    }
}

/// Downloads the image with a blocking HTTP client.
pub struct HttpFetcher {
    url: reqwest::Url,
    expected_sha256: Option<String>,
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(url: &str, expected_sha256: Option<String>) -> Result<Self> {
        let url = reqwest::Url::parse(url).with_context(|| format!("invalid image URL '{url}'"))?;
        // Images are large; only the connection attempt gets a deadline.
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(None::<Duration>)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            url,
            expected_sha256,
            client,
        })
    }

    fn file_name(&self) -> String {
        self.url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_FILE_NAME)
            .to_string()
    }
}

impl ImageFetcher for HttpFetcher {
    fn fetch(&self, dest_dir: &Path, on_progress: &mut dyn FnMut(u8, &str)) -> Result<ImageInfo> {
        tracing::info!(url = %self.url, "downloading image");
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .with_context(|| format!("requesting {}", self.url))?
            .error_for_status()
            .with_context(|| format!("downloading {}", self.url))?;
        let total = response.content_length();

        let dest = dest_dir.join(self.file_name());
        stage_stream(response, &dest, total, self.expected_sha256.as_deref(), on_progress)
            .with_context(|| format!("downloading {}", self.url))
    }
}

/// Copies an image that is already on local disk into staging.
pub struct LocalFetcher {
    source: PathBuf,
    expected_sha256: Option<String>,
}

impl LocalFetcher {
    pub fn new(source: impl Into<PathBuf>, expected_sha256: Option<String>) -> Self {
        Self {
            source: source.into(),
            expected_sha256,
        }
    }
}

impl ImageFetcher for LocalFetcher {
    fn fetch(&self, dest_dir: &Path, on_progress: &mut dyn FnMut(u8, &str)) -> Result<ImageInfo> {
        tracing::info!(source = %self.source.display(), "staging local image");
        let file = File::open(&self.source)
            .with_context(|| format!("opening {}", self.source.display()))?;
        let total = file.metadata()?.len();
        let name = self
            .source
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| DEFAULT_FILE_NAME.into());

        stage_stream(
            file,
            &dest_dir.join(name),
            Some(total),
            self.expected_sha256.as_deref(),
            on_progress,
        )
        .with_context(|| format!("copying {}", self.source.display()))
    }
}

/// Streams `reader` into `dest`, reporting progress against `total` when it
/// is known, and validates the checksum if one is expected.
fn stage_stream<R: Read>(
    mut reader: R,
    dest: &Path,
    total: Option<u64>,
    expected_sha256: Option<&str>,
    on_progress: &mut dyn FnMut(u8, &str),
) -> Result<ImageInfo> {
    let mut writer = BufWriter::new(
        File::create(dest).with_context(|| format!("creating {}", dest.display()))?,
    );
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut copied: u64 = 0;

    on_progress(0, "Starting transfer");
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n])?;
        hasher.update(&buffer[..n]);
        copied += n as u64;
        on_progress(percent_of(copied, total), &describe(copied, total));
    }
    writer.flush()?;

    if let Some(total) = total
        && copied != total
    {
        bail!("image truncated: received {copied} of {total} bytes");
    }

    let actual = format!("{:x}", hasher.finalize());
    if let Some(expected) = expected_sha256
        && !expected.trim().eq_ignore_ascii_case(&actual)
    {
        bail!("checksum mismatch: expected {}, got {actual}", expected.trim());
    }
    on_progress(100, "Image staged");

    Ok(ImageInfo {
        local_path: dest.to_path_buf(),
        size_bytes: copied,
        sha256: Some(actual),
    })
}

fn percent_of(done: u64, total: Option<u64>) -> u8 {
    match total {
        Some(total) if total > 0 => ((done.min(total) * 100) / total) as u8,
        _ => 0,
    }
}

fn describe(done: u64, total: Option<u64>) -> String {
    match total {
        Some(total) => format!("{:.1} of {:.1} MiB", done as f64 / MIB, total as f64 / MIB),
        None => format!("{:.1} MiB", done as f64 / MIB),
    }
}
