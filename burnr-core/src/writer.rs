//! Writes a staged image onto a block device.
//!
//! The work happens in up to three phases, all reported on one 0–100 scale:
//! 1.  Decompressing the staged image into the staging directory if it is
//!     compressed (`.gz`, `.xz`, `.zst`). Reported at 0% with a byte count.
//! 2.  Writing the raw image to the device.
//! 3.  Optionally verifying the device contents against the image.
use crate::collaborators::ImageWriter;
use crate::device::ImageInfo;
use anyhow::{Context, Result, bail};
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempPath};
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

const BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB
const BLOCK_SIZE: usize = 512;
const MIB: f64 = 1024.0 * 1024.0;

/// A raw image ready to be written. If it had to be decompressed, the
/// temporary file lives in the staging directory and is deleted on drop.
struct RawImage {
    path: PathBuf,
    _temp_handle: Option<TempPath>,
}

impl AsRef<Path> for RawImage {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

fn is_compressed(path: &Path) -> bool {
    compression_of(path).is_some()
}

fn compression_of(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    match ext.as_str() {
        "gz" | "gzip" => Some("gz"),
        "xz" => Some("xz"),
        "zst" | "zstd" => Some("zst"),
        _ => None,
    }
}

/// Decompresses `image` into `staging_dir` if necessary.
fn decompress_image(
    image: &Path,
    staging_dir: &Path,
    on_progress: &mut dyn FnMut(u64),
) -> io::Result<RawImage> {
    let Some(kind) = compression_of(image) else {
        return Ok(RawImage {
            path: image.to_path_buf(),
            _temp_handle: None,
        });
    };

    let input = BufReader::new(File::open(image)?);
    let mut reader: Box<dyn Read> = match kind {
        "gz" => Box::new(GzDecoder::new(input)),
        "xz" => Box::new(XzDecoder::new(input)),
        _ => Box::new(ZstdDecoder::new(input)?),
    };

    let mut temp_file = NamedTempFile::new_in(staging_dir)?;
    {
        let mut writer = BufWriter::new(&mut temp_file);
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut total: u64 = 0;
        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n])?;
            total += n as u64;
            on_progress(total);
        }
        writer.flush()?;
    }

    let temp_path = temp_file.into_temp_path();
    Ok(RawImage {
        path: temp_path.to_path_buf(),
        _temp_handle: Some(temp_path),
    })
}

/// Opens the target for writing, bypassing the page cache when asked to.
fn open_target(device: &Path, direct_io: bool) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true);
    #[cfg(target_os = "linux")]
    if direct_io {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(libc::O_DIRECT);
    }
    #[cfg(not(target_os = "linux"))]
    let _ = direct_io;
    options.open(device)
}

/// Maps phase progress onto the stage's single percentage scale.
#[derive(Clone, Copy)]
struct Scale {
    start: u8,
    span: u8,
    total: u64,
}

impl Scale {
    fn percent(&self, done: u64) -> u8 {
        if self.total == 0 {
            return self.start + self.span;
        }
        let frac = done.min(self.total) as f64 / self.total as f64;
        self.start + (frac * self.span as f64) as u8
    }
}

/// Writes images with aligned, unbuffered I/O and optional read-back
/// verification.
pub struct RawImageWriter {
    verify: bool,
    direct_io: bool,
}

impl RawImageWriter {
    pub fn new(verify: bool) -> Self {
        Self {
            verify,
            direct_io: true,
        }
    }

    /// Uses ordinary buffered writes. Needed for targets that reject
    /// `O_DIRECT`, such as files on tmpfs.
    pub fn buffered(mut self) -> Self {
        self.direct_io = false;
        self
    }

    fn write_raw(
        &self,
        image: &Path,
        device: &Path,
        scale: Scale,
        on_progress: &mut dyn FnMut(u8, &str),
    ) -> Result<()> {
        let mut image_file = File::open(image)?;
        let image_len = scale.total;
        let mut device_file = open_target(device, self.direct_io)
            .with_context(|| format!("opening {} for writing", device.display()))?;

        // O_DIRECT requires buffers aligned to the logical block size.
        let mut buf = vec![0u8; BUFFER_SIZE + BLOCK_SIZE];
        let offset = buf.as_ptr().align_offset(BLOCK_SIZE);
        let buffer = &mut buf[offset..offset + BUFFER_SIZE];

        let mut written: u64 = 0;
        while written < image_len {
            let to_read = std::cmp::min(BUFFER_SIZE as u64, image_len - written) as usize;
            image_file.read_exact(&mut buffer[..to_read])?;

            // The tail may not fill a whole block; pad it with zeros.
            let padded_size = if self.direct_io && to_read % BLOCK_SIZE != 0 {
                let pad = to_read.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
                buffer[to_read..pad].fill(0);
                pad
            } else {
                to_read
            };

            device_file
                .write_all(&buffer[..padded_size])
                .with_context(|| format!("writing to {} at offset {written}", device.display()))?;
            written += to_read as u64;
            on_progress(
                scale.percent(written),
                &format!("Written {:.1} of {:.1} MiB", written as f64 / MIB, image_len as f64 / MIB),
            );
        }

        device_file
            .sync_all()
            .with_context(|| format!("syncing {}", device.display()))?;
        Ok(())
    }

    fn verify_raw(
        &self,
        image: &Path,
        device: &Path,
        scale: Scale,
        on_progress: &mut dyn FnMut(u8, &str),
    ) -> Result<()> {
        let image_len = scale.total;
        let mut image_file = File::open(image)?;
        let mut device_file = File::open(device)
            .with_context(|| format!("opening {} for verification", device.display()))?;

        let mut image_hasher = Sha256::new();
        let mut device_hasher = Sha256::new();
        let mut image_buf = vec![0u8; BUFFER_SIZE];
        let mut device_buf = vec![0u8; BUFFER_SIZE];

        let mut remaining = image_len;
        while remaining > 0 {
            let chunk = std::cmp::min(BUFFER_SIZE as u64, remaining) as usize;
            image_file.read_exact(&mut image_buf[..chunk])?;
            device_file.read_exact(&mut device_buf[..chunk])?;

            image_hasher.update(&image_buf[..chunk]);
            device_hasher.update(&device_buf[..chunk]);

            remaining -= chunk as u64;
            let verified = image_len - remaining;
            on_progress(
                scale.percent(verified),
                &format!("Verified {:.1} of {:.1} MiB", verified as f64 / MIB, image_len as f64 / MIB),
            );
        }

        if image_hasher.finalize() != device_hasher.finalize() {
            bail!("verification failed: device contents do not match the image");
        }
        Ok(())
    }
}

impl ImageWriter for RawImageWriter {
    fn write(
        &self,
        staging_dir: &Path,
        image: &ImageInfo,
        device_id: &str,
        on_progress: &mut dyn FnMut(u8, &str),
    ) -> Result<()> {
        let device = Path::new(device_id);

        if is_compressed(&image.local_path) {
            on_progress(0, "Decompressing image");
        }
        let raw = decompress_image(&image.local_path, staging_dir, &mut |bytes: u64| {
            on_progress(0, &format!("Decompressed {:.1} MiB", bytes as f64 / MIB));
        })
        .with_context(|| format!("decompressing {}", image.local_path.display()))?;

        let image_len = File::open(&raw)?.metadata()?.len();
        let write_span = if self.verify { 50 } else { 100 };
        tracing::info!(device = %device_id, bytes = image_len, verify = self.verify, "writing image");

        self.write_raw(
            raw.as_ref(),
            device,
            Scale {
                start: 0,
                span: write_span,
                total: image_len,
            },
            on_progress,
        )?;

        if self.verify {
            tracing::info!(device = %device_id, "verifying image");
            self.verify_raw(
                raw.as_ref(),
                device,
                Scale {
                    start: write_span,
                    span: 100 - write_span,
                    total: image_len,
                },
                on_progress,
            )?;
        }

        on_progress(100, "Write complete");
        Ok(())
    }
}
