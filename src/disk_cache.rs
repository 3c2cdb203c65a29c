//! The disk tier: a directory of encoded images, one per cache key.
use std::fs;
use std::io::{Cursor, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use image::buffer::ConvertBuffer;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, RgbImage};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::*;

const PNG_EXTENSION: &str = "png";
const JPEG_EXTENSION: &str = "jpg";

/// When trimming, we remove entries until we are at this fraction of the budget so that every put near the limit
/// doesn't rescan the directory.
const TRIM_TARGET: f64 = 0.9;

/// How the disk tier encodes its entries.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DiskEncoding {
    /// Lossless and keeps alpha.
    Png,
    /// Lossy and drops alpha.  `quality` runs from 1 to 100.
    Jpeg { quality: u8 },
}

impl DiskEncoding {
    pub const HIGH_QUALITY: DiskEncoding = DiskEncoding::Png;
    pub const FAST: DiskEncoding = DiskEncoding::Jpeg { quality: 70 };

    fn extension(&self) -> &'static str {
        match self {
            DiskEncoding::Png => PNG_EXTENSION,
            DiskEncoding::Jpeg { .. } => JPEG_EXTENSION,
        }
    }

    fn encode(&self, bitmap: &Bitmap) -> Result<Vec<u8>, LoadError> {
        let mut encoded = Cursor::new(Vec::new());
        match *self {
            DiskEncoding::Png => bitmap.as_rgba().write_to(&mut encoded, ImageFormat::Png)?,
            DiskEncoding::Jpeg { quality } => {
                let rgb: RgbImage = bitmap.as_rgba().convert();
                rgb.write_with_encoder(JpegEncoder::new_with_quality(
                    &mut encoded,
                    quality.clamp(1, 100),
                ))?;
            }
        }
        Ok(encoded.into_inner())
    }
}

impl Default for DiskEncoding {
    fn default() -> DiskEncoding {
        DiskEncoding::FAST
    }
}

/// A cache backed by a given root directory.
///
/// Keys map to `<root>/<key>.<ext>`, with the extension picked by the [DiskEncoding].  Keys which would resolve outside of the root (`../x`, absolute paths) are
/// rejected, primarily as a measure to detect bugs.  Writes go through a temporary file in the same directory and are
/// renamed into place, so a reader never sees half an entry.
#[derive(Debug)]
pub struct DiskCache {
    root_path: PathBuf,
    max_bytes: u64,
    encoding: DiskEncoding,
    /// Bytes currently on disk.  Also serializes writers against trimming.
    current_bytes: Mutex<u64>,
}

fn conv_key(key: &str, extension: &str) -> std::io::Result<relative_path::RelativePathBuf> {
    relative_path::RelativePathBuf::from_path(format!("{}.{}", key, extension))
        .map_err(|_| std::io::Error::new(ErrorKind::Other, "Invalid cache key"))
}

fn modified_at(meta: &fs::Metadata) -> SystemTime {
    meta.modified().unwrap_or(SystemTime::UNIX_EPOCH)
}

impl DiskCache {
    /// Open (creating if needed) a cache rooted at `root_path` which holds up to `max_bytes` of encoded images,
    /// using [DiskEncoding::FAST].
    pub fn open(root_path: &Path, max_bytes: u64) -> std::io::Result<DiskCache> {
        DiskCache::open_with_encoding(root_path, max_bytes, DiskEncoding::default())
    }

    pub fn open_with_encoding(
        root_path: &Path,
        max_bytes: u64,
        encoding: DiskEncoding,
    ) -> std::io::Result<DiskCache> {
        fs::create_dir_all(root_path)?;
        let cache = DiskCache {
            root_path: root_path.to_path_buf(),
            max_bytes,
            encoding,
            current_bytes: Mutex::new(0),
        };
        let total = cache.entries()?.iter().map(|(_, len, _)| len).sum();
        *cache.current_bytes.lock() = total;
        debug!(root = %root_path.display(), bytes = total, "opened disk cache");
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root_path
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn size_bytes(&self) -> u64 {
        *self.current_bytes.lock()
    }

    pub fn encoding(&self) -> DiskEncoding {
        self.encoding
    }

    fn entry_path(&self, key: &str) -> std::io::Result<PathBuf> {
        let relative = conv_key(key, self.encoding.extension())?;
        if relative.components().count() != 1 {
            return Err(std::io::Error::new(
                ErrorKind::Other,
                "cache key resolves outside the cache directory",
            ));
        }
        let absolute = relative.to_logical_path(&self.root_path);
        if !absolute.starts_with(&self.root_path) {
            return Err(std::io::Error::new(
                ErrorKind::Other,
                "cache key resolves outside the cache directory",
            ));
        }
        Ok(absolute)
    }

    /// All entries as `(path, length, modified)`.
    fn entries(&self) -> std::io::Result<Vec<(PathBuf, u64, SystemTime)>> {
        let mut out = vec![];
        for entry in fs::read_dir(&self.root_path)? {
            let entry = entry?;
            let path = entry.path();
            // Entries written under another encoding still count against the budget.
            if path
                .extension()
                .map_or(true, |e| e != PNG_EXTENSION && e != JPEG_EXTENSION)
            {
                continue;
            }
            if let Ok(meta) = entry.metadata() {
                out.push((path, meta.len(), modified_at(&meta)));
            }
        }
        Ok(out)
    }

    fn read_entry(&self, path: &Path) -> Result<Option<Bitmap>, LoadError> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let decoded = image::load_from_memory(&bytes)?;
        // Keep recently read entries away from the trimmer.
        if let Ok(file) = fs::File::options().write(true).open(path) {
            let _ = file.set_modified(SystemTime::now());
        }
        Ok(Some(Bitmap::new(decoded.into_rgba8())))
    }

    fn write_entry(&self, path: &Path, bitmap: &Bitmap) -> Result<u64, LoadError> {
        let encoded = self.encoding.encode(bitmap)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.root_path)?;
        tmp.write_all(&encoded)?;
        tmp.persist(path).map_err(|e| LoadError::from(e.error))?;
        Ok(encoded.len() as u64)
    }

    /// Remove a corrupt entry unless a writer replaced it since `seen` was taken.
    fn remove_if_unchanged(&self, path: &Path, seen: &fs::Metadata) -> bool {
        let mut current = self.current_bytes.lock();
        let now = match fs::metadata(path) {
            Ok(m) => m,
            Err(_) => return false,
        };
        if now.len() != seen.len() || modified_at(&now) != modified_at(seen) {
            debug!(path = %path.display(), "disk cache entry was replaced while reading; keeping it");
            return false;
        }
        match fs::remove_file(path) {
            Ok(()) => {
                *current = current.saturating_sub(now.len());
                true
            }
            Err(_) => false,
        }
    }

    /// Remove the oldest entries until we are back under budget.  Must be called with `current_bytes` locked.
    fn trim(&self, current: &mut u64) {
        let target = (self.max_bytes as f64 * TRIM_TARGET) as u64;
        let mut entries = match self.entries() {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "failed to scan disk cache for trimming");
                return;
            }
        };
        entries.sort_by_key(|(_, _, modified)| *modified);

        *current = entries.iter().map(|(_, len, _)| len).sum();
        for (path, len, _) in entries {
            if *current <= target {
                break;
            }
            match fs::remove_file(&path) {
                Ok(()) => *current -= len,
                Err(e) => warn!(path = %path.display(), error = %e, "failed to trim disk cache entry"),
            }
        }
        debug!(bytes = *current, "trimmed disk cache");
    }
}

impl BitmapCache for DiskCache {
    fn get(&self, key: &str) -> Result<Option<Arc<Bitmap>>, LoadError> {
        let path = match self.entry_path(key) {
            Ok(p) => p,
            Err(e) => {
                warn!(key, error = %e, "rejected disk cache key");
                return Ok(None);
            }
        };

        let seen = fs::metadata(&path).ok();
        match self.read_entry(&path) {
            Ok(found) => {
                trace!(key, hit = found.is_some(), "disk tier lookup");
                Ok(found.map(Arc::new))
            }
            Err(e) if e.is_exhaustion() => Err(e),
            Err(e @ LoadError::Io(_)) => {
                warn!(key, error = %e, "failed to read disk cache entry");
                Ok(None)
            }
            Err(e) => {
                warn!(key, error = %e, "dropping unreadable disk cache entry");
                if let Some(seen) = seen {
                    self.remove_if_unchanged(&path, &seen);
                }
                Ok(None)
            }
        }
    }

    fn put(&self, key: &str, bitmap: Arc<Bitmap>) {
        let path = match self.entry_path(key) {
            Ok(p) => p,
            Err(e) => {
                warn!(key, error = %e, "rejected disk cache key");
                return;
            }
        };

        let mut current = self.current_bytes.lock();
        let replaced = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        match self.write_entry(&path, &bitmap) {
            Ok(written) => {
                *current = current.saturating_sub(replaced) + written;
                trace!(key, bytes = written, "wrote disk cache entry");
            }
            Err(e) => {
                warn!(key, error = %e, "failed to put bitmap on disk");
                return;
            }
        }

        if *current > self.max_bytes {
            self.trim(&mut current);
        }
    }

    fn clear(&self) {
        let mut current = self.current_bytes.lock();
        let entries = match self.entries() {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "failed to list disk cache for clearing");
                return;
            }
        };
        for (path, len, _) in entries {
            match fs::remove_file(&path) {
                Ok(()) => *current = current.saturating_sub(len),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove disk cache entry"),
            }
        }
        debug!(root = %self.root_path.display(), "cleared disk cache");
    }

    fn contains(&self, key: &str) -> bool {
        self.entry_path(key).map(|p| p.is_file()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::solid;

    fn open_cache(max_bytes: u64) -> (tempfile::TempDir, DiskCache) {
        let tmp_dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open_with_encoding(
            &tmp_dir.path().join("bitmaps"),
            max_bytes,
            DiskEncoding::HIGH_QUALITY,
        )
        .unwrap();
        (tmp_dir, cache)
    }

    #[test]
    fn round_trips_pixels() {
        let (_dir, cache) = open_cache(1 << 20);
        let bitmap = Arc::new(solid(3, 2, [10, 20, 30, 255]));

        assert!(!cache.contains("abc"));
        cache.put("abc", bitmap.clone());
        assert!(cache.contains("abc"));

        let back = cache.get("abc").unwrap().unwrap();
        assert_eq!(*back, *bitmap);
        assert!(cache.size_bytes() > 0);
        assert!(cache.get("def").unwrap().is_none());
    }

    #[test]
    fn fast_preset_writes_lossy_jpeg() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(tmp_dir.path(), 1 << 20).unwrap();
        assert_eq!(cache.encoding(), DiskEncoding::Jpeg { quality: 70 });

        cache.put("photo", Arc::new(solid(16, 8, [200, 40, 90, 128])));
        assert!(cache.root().join("photo.jpg").is_file());

        let back = cache.get("photo").unwrap().unwrap();
        assert_eq!(back.dimensions(), Dimensions { width: 16, height: 8 });
        let [r, g, b, a] = back.as_rgba().get_pixel(8, 4).0;
        assert!((r as i32 - 200).abs() <= 8);
        assert!((g as i32 - 40).abs() <= 8);
        assert!((b as i32 - 90).abs() <= 8);
        // No alpha channel in JPEG.
        assert_eq!(a, 255);
    }

    #[test]
    fn jpeg_quality_trades_size() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let mut noisy = solid(64, 64, [0, 0, 0, 255]);
        for (x, y, px) in noisy.as_rgba_mut().enumerate_pixels_mut() {
            px.0 = [(x * 37 % 256) as u8, (y * 91 % 256) as u8, ((x * y) % 256) as u8, 255];
        }
        let noisy = Arc::new(noisy);

        let low = DiskCache::open_with_encoding(
            &tmp_dir.path().join("low"),
            1 << 24,
            DiskEncoding::Jpeg { quality: 10 },
        )
        .unwrap();
        let high = DiskCache::open_with_encoding(
            &tmp_dir.path().join("high"),
            1 << 24,
            DiskEncoding::Jpeg { quality: 100 },
        )
        .unwrap();
        low.put("n", noisy.clone());
        high.put("n", noisy);
        assert!(low.size_bytes() < high.size_bytes());
        assert!(low.get("n").unwrap().is_some());
    }

    #[test]
    fn high_quality_preset_is_lossless() {
        let (_dir, cache) = open_cache(1 << 20);
        assert_eq!(cache.encoding(), DiskEncoding::Png);
        let bitmap = Arc::new(solid(5, 5, [1, 2, 3, 4]));
        cache.put("exact", bitmap.clone());
        assert!(cache.root().join("exact.png").is_file());
        assert_eq!(*cache.get("exact").unwrap().unwrap(), *bitmap);
    }

    #[test]
    fn rejects_keys_outside_root() {
        let (dir, cache) = open_cache(1 << 20);
        let bitmap = Arc::new(solid(1, 1, [0, 0, 0, 255]));

        cache.put("../escape", bitmap.clone());
        cache.put("nested/key", bitmap);
        assert!(!dir.path().join("escape.png").exists());
        assert!(!cache.contains("../escape"));
        assert!(cache.get("../escape").unwrap().is_none());
        assert!(!cache.contains("nested/key"));
    }

    #[test]
    fn corrupt_entries_are_misses_and_removed() {
        let (_dir, cache) = open_cache(1 << 20);
        let path = cache.root().join("broken.png");
        fs::write(&path, b"definitely not a png").unwrap();

        assert!(cache.contains("broken"));
        assert!(cache.get("broken").unwrap().is_none());
        assert!(!path.exists());
    }

    #[test]
    fn replaced_entries_survive_corrupt_cleanup() {
        let (_dir, cache) = open_cache(1 << 20);
        let path = cache.root().join("raced.png");
        fs::write(&path, b"half written").unwrap();
        let seen = fs::metadata(&path).unwrap();

        // A writer replaces the entry between our read and our cleanup.
        cache.put("raced", Arc::new(solid(3, 3, [4, 4, 4, 255])));
        assert!(!cache.remove_if_unchanged(&path, &seen));
        assert!(cache.get("raced").unwrap().is_some());

        let before = cache.size_bytes();
        fs::write(&path, b"still garbage").unwrap();
        let seen = fs::metadata(&path).unwrap();
        assert!(cache.remove_if_unchanged(&path, &seen));
        assert!(!path.exists());
        assert!(cache.size_bytes() < before);
    }

    #[test]
    fn clear_removes_everything() {
        let (_dir, cache) = open_cache(1 << 20);
        for key in ["a", "b", "c"] {
            cache.put(key, Arc::new(solid(2, 2, [1, 1, 1, 255])));
        }
        cache.clear();
        for key in ["a", "b", "c"] {
            assert!(!cache.contains(key));
        }
        assert_eq!(cache.size_bytes(), 0);
    }

    #[test]
    fn trims_oldest_entries_over_budget() {
        let (_dir, sizing) = open_cache(u64::MAX);
        sizing.put("sizing", Arc::new(solid(8, 8, [5, 5, 5, 255])));
        let entry_size = sizing.size_bytes();

        // Room for two entries but not three.
        let (_dir, cache) = open_cache(entry_size * 2 + entry_size / 2);
        cache.put("first", Arc::new(solid(8, 8, [5, 5, 5, 255])));
        std::thread::sleep(std::time::Duration::from_millis(20));
        cache.put("second", Arc::new(solid(8, 8, [5, 5, 5, 255])));
        std::thread::sleep(std::time::Duration::from_millis(20));
        cache.put("third", Arc::new(solid(8, 8, [5, 5, 5, 255])));

        assert!(!cache.contains("first"));
        assert!(cache.contains("third"));
        assert!(cache.size_bytes() <= cache.max_bytes());
    }

    #[test]
    fn reopening_counts_existing_entries() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let root = tmp_dir.path().join("bitmaps");
        {
            let cache = DiskCache::open(&root, 1 << 20).unwrap();
            cache.put("kept", Arc::new(solid(4, 4, [7, 7, 7, 255])));
        }
        // Entries from another encoding still count but aren't served.
        let cache = DiskCache::open_with_encoding(&root, 1 << 20, DiskEncoding::Png).unwrap();
        assert!(cache.size_bytes() > 0);
        assert!(!cache.contains("kept"));

        let cache = DiskCache::open(&root, 1 << 20).unwrap();
        assert!(cache.size_bytes() > 0);
        assert!(cache.get("kept").unwrap().is_some());
    }
}
