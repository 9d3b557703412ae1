//! Filling the image cache slot.
//!
//! [`fetch_image`] downloads from the image catalog. [`import_local_image`]
//! fills the same slot from a local file, decompressing it on the fly if it
//! is compressed (`.gz`, `.xz`, `.zst`).
use crate::error::{Error, Result};
use crate::progress::{ProgressReporter, ProgressTracker};
use crate::services::ImageCatalog;
use flate2::read::GzDecoder;
use log::{debug, info};
use std::cell::Cell;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::rc::Rc;
use std::thread;
use std::time::Duration;
use tempfile::NamedTempFile;
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

const BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB

/// How the cache slot came to be filled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    /// An image was already cached; nothing was downloaded.
    Cached,
    Downloaded { bytes: u64 },
}

/// Makes sure an image for `device_type`/`version` sits at `cache_path`.
///
/// An existing file at `cache_path` is trusted as-is, without asking the
/// catalog anything. Otherwise the download stream and its expected size are
/// requested together, and the stream is copied into the cache while
/// `reporter` is updated at most once per `interval`.
///
/// A failed download leaves whatever was written in place.
pub fn fetch_image(
    catalog: &dyn ImageCatalog,
    cache_path: &Path,
    device_type: &str,
    version: &str,
    interval: Duration,
    reporter: &mut dyn ProgressReporter,
) -> Result<FetchOutcome> {
    if cache_path.try_exists()? {
        info!(
            "Image found at {}, skipping download",
            cache_path.display()
        );
        return Ok(FetchOutcome::Cached);
    }

    info!("Downloading {device_type} {version}");
    let (stream, size) = thread::scope(|s| {
        let size = s.spawn(|| catalog.download_size(device_type, version));
        let stream = catalog.download(device_type, version);
        let size = size
            .join()
            .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
        (stream, size)
    });
    let mut stream = stream.map_err(Error::Catalog)?;
    let size = size.map_err(Error::Catalog)?;
    debug!("Expecting {size} bytes");

    if let Some(parent) = cache_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut output = BufWriter::with_capacity(BUFFER_SIZE, File::create(cache_path)?);

    let mut tracker = ProgressTracker::start(reporter, size, interval);
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let n = match stream.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Download(e)),
        };
        output.write_all(&buffer[..n])?;
        tracker.advance(n as u64);
    }
    output.flush()?;

    let bytes = tracker.position();
    tracker.complete();
    info!("Downloaded {bytes} bytes to {}", cache_path.display());
    Ok(FetchOutcome::Downloaded { bytes })
}

/// Counts the bytes pulled through it, so progress can follow the
/// compressed input while the decoder produces more output.
struct CountingReader<R> {
    inner: R,
    count: Rc<Cell<u64>>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.set(self.count.get() + n as u64);
        Ok(n)
    }
}

/// Replaces the cache slot with the (decompressed) contents of `source`.
///
/// The image is staged in a temporary file next to the cache slot and moved
/// into place only once complete. Progress follows the bytes read from
/// `source`. Returns the size of the cached image.
pub fn import_local_image(
    source: &Path,
    cache_path: &Path,
    reporter: &mut dyn ProgressReporter,
) -> Result<u64> {
    let ext = source
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    let input = File::open(source)?;
    let input_len = input.metadata()?.len();
    let count = Rc::new(Cell::new(0));
    let counted = BufReader::new(CountingReader {
        inner: input,
        count: count.clone(),
    });

    let mut reader: Box<dyn Read> = match ext.as_str() {
        "gz" | "gzip" => Box::new(GzDecoder::new(counted)),
        "xz" => Box::new(XzDecoder::new(counted)),
        "zst" | "zstd" => Box::new(ZstdDecoder::with_buffer(counted)?),
        _ => Box::new(counted),
    };

    let cache_dir = cache_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(cache_dir)?;
    let mut staged = NamedTempFile::new_in(cache_dir)?;

    let mut tracker = ProgressTracker::start(reporter, input_len, Duration::ZERO);
    let mut total: u64 = 0;
    {
        let mut writer = BufWriter::new(&mut staged);
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut seen = 0;
        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n])?;
            total += n as u64;

            tracker.advance(count.get() - seen);
            seen = count.get();
        }
        writer.flush()?;
    }

    staged.persist(cache_path).map_err(|e| e.error)?;
    tracker.complete();
    info!(
        "Imported {} into {} ({total} bytes)",
        source.display(),
        cache_path.display()
    );
    Ok(total)
}
