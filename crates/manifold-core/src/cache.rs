//! On-disk cache for JIT-compiled kernel binaries
//!
//! Compiling kernel source through a vendor JIT costs tens to hundreds of
//! milliseconds per program; the binary cache memoises the result across
//! runs. Records are keyed by a device fingerprint (vendor, name, driver
//! version, repeated per sub-unit) combined with the compile input, and are
//! integrity-checked on the way back in, so a stale driver, a changed
//! option string, or a truncated file all land as plain misses.
//!
//! # Record layout
//!
//! ```text
//! [20 bytes] identity digest   (device fingerprint only)
//! [20 bytes] payload digest    (hash of the concatenated binaries)
//! [ 8 bytes] N                 (binary count = device sub-unit count)
//! [8N bytes] sizes[i]
//! [Σ sizes ] binaries, concatenated
//! ```
//!
//! The filename is the 40-hex file-key digest (fingerprint + options +
//! source), directly inside the configured directory. Two processes saving
//! the same key race benignly: writes go to a temporary file renamed into
//! place, so the last writer wins and readers always see a whole record.

use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use tracing::debug;

use crate::backend::{DeviceAttributeId, DeviceImpl};
use crate::digest::{Digest, DIGEST_LENGTH};

/// Identity of a device for cache-keying purposes
///
/// The triple (vendor, name, driver version) stamped once per sub-unit.
/// Built from live device attributes, or directly for tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFingerprint {
    pub vendor: String,
    pub name: String,
    pub driver_version: String,
    /// Sub-unit count; also the number of binaries a record holds
    pub units: usize,
}

impl DeviceFingerprint {
    pub fn from_device(dev: &dyn DeviceImpl) -> Self {
        let units = dev.get_attribute(DeviceAttributeId::SubUnitCount).as_i32();
        Self {
            vendor: dev.get_attribute(DeviceAttributeId::Vendor).as_str().to_owned(),
            name: dev.get_attribute(DeviceAttributeId::Name).as_str().to_owned(),
            driver_version: dev
                .get_attribute(DeviceAttributeId::DriverVersion)
                .as_str()
                .to_owned(),
            units: units.max(0) as usize,
        }
    }

    /// Stamp the fingerprint into a running digest, once per sub-unit.
    /// An empty driver version is omitted.
    fn stamp(&self, d: &mut Digest) {
        for _ in 0..self.units {
            d.update(&self.vendor);
            d.update(&self.name);
            if !self.driver_version.is_empty() {
                d.update(&self.driver_version);
            }
        }
    }
}

/// Process-wide cache of compiled kernel binaries
///
/// Disabled until a directory is configured with [`set_path`]. Backends hold
/// an `Arc<BinaryCache>`; the default construction path hands every device
/// the shared [`global`] instance so one configuration covers the process.
///
/// [`set_path`]: BinaryCache::set_path
/// [`global`]: BinaryCache::global
pub struct BinaryCache {
    path: RwLock<Option<PathBuf>>,
}

impl BinaryCache {
    pub fn new() -> Self {
        Self {
            path: RwLock::new(None),
        }
    }

    /// The process-wide default instance
    pub fn global() -> Arc<BinaryCache> {
        static GLOBAL: OnceLock<Arc<BinaryCache>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(BinaryCache::new())))
    }

    /// Configure the cache directory, enabling the cache
    pub fn set_path(&self, path: impl Into<PathBuf>) {
        *self.path.write() = Some(path.into());
    }

    /// Remove the configured directory, disabling the cache
    pub fn clear_path(&self) {
        *self.path.write() = None;
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.path.read().clone()
    }

    /// Whether a cache directory is configured
    pub fn is_enabled(&self) -> bool {
        self.path.read().is_some()
    }

    fn identity_digest(fingerprint: &DeviceFingerprint) -> [u8; DIGEST_LENGTH] {
        let mut d = Digest::new();
        fingerprint.stamp(&mut d);
        d.finalize()
    }

    /// Cache filename for a compile input: fingerprint, then options, then
    /// source bytes
    fn file_key(fingerprint: &DeviceFingerprint, data: &[u8], options: &str) -> String {
        let mut d = Digest::new();
        fingerprint.stamp(&mut d);
        if !options.is_empty() {
            d.update(options);
        }
        if !data.is_empty() {
            d.update(data);
        }
        d.finalize_hex()
    }

    fn payload_digest(binaries: &[Vec<u8>]) -> [u8; DIGEST_LENGTH] {
        let mut d = Digest::new();
        for b in binaries {
            if !b.is_empty() {
                d.update(b);
            }
        }
        d.finalize()
    }

    /// Look up the binaries compiled for `(fingerprint, data, options)`
    ///
    /// Returns `None` on any mismatch or I/O problem; a damaged record is
    /// indistinguishable from a missing one.
    pub fn load(
        &self,
        fingerprint: &DeviceFingerprint,
        data: &[u8],
        options: &str,
    ) -> Option<Vec<Vec<u8>>> {
        let dir = self.path()?;
        let key = Self::file_key(fingerprint, data, options);
        match self.try_load(&dir, &key, fingerprint) {
            Ok(Some(binaries)) => {
                debug!(key = %key, count = binaries.len(), "binary cache hit");
                Some(binaries)
            }
            Ok(None) => {
                debug!(key = %key, "binary cache miss");
                None
            }
            Err(err) => {
                debug!(key = %key, error = %err, "binary cache read failed; treating as miss");
                None
            }
        }
    }

    fn try_load(
        &self,
        dir: &std::path::Path,
        key: &str,
        fingerprint: &DeviceFingerprint,
    ) -> std::io::Result<Option<Vec<Vec<u8>>>> {
        let mut file = match fs::File::open(dir.join(key)) {
            Ok(f) => f,
            Err(_) => return Ok(None),
        };

        let mut stored_identity = [0u8; DIGEST_LENGTH];
        file.read_exact(&mut stored_identity)?;
        if stored_identity != Self::identity_digest(fingerprint) {
            return Ok(None);
        }

        let mut stored_payload = [0u8; DIGEST_LENGTH];
        file.read_exact(&mut stored_payload)?;

        let mut word = [0u8; 8];
        file.read_exact(&mut word)?;
        let count = u64::from_ne_bytes(word) as usize;
        if count == 0 || count != fingerprint.units {
            return Ok(None);
        }

        let mut sizes = Vec::with_capacity(count);
        for _ in 0..count {
            file.read_exact(&mut word)?;
            sizes.push(u64::from_ne_bytes(word) as usize);
        }

        let mut binaries = Vec::with_capacity(count);
        for size in sizes {
            let mut binary = vec![0u8; size];
            if size > 0 {
                file.read_exact(&mut binary)?;
            }
            binaries.push(binary);
        }

        if Self::payload_digest(&binaries) != stored_payload {
            return Ok(None);
        }
        Ok(Some(binaries))
    }

    /// Store the binaries compiled for `(fingerprint, data, options)`
    ///
    /// Best-effort: the caller must not rely on persistence. Failures are
    /// logged and swallowed.
    pub fn save(&self, fingerprint: &DeviceFingerprint, binaries: &[&[u8]], data: &[u8], options: &str) {
        let Some(dir) = self.path() else { return };
        let key = Self::file_key(fingerprint, data, options);
        if let Err(err) = self.try_save(&dir, &key, fingerprint, binaries) {
            debug!(key = %key, error = %err, "binary cache write failed; dropped");
        } else {
            debug!(key = %key, count = binaries.len(), "binary cache record written");
        }
    }

    fn try_save(
        &self,
        dir: &std::path::Path,
        key: &str,
        fingerprint: &DeviceFingerprint,
        binaries: &[&[u8]],
    ) -> std::io::Result<()> {
        let final_path = dir.join(key);
        let tmp_path = dir.join(format!("{key}.tmp"));

        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&Self::identity_digest(fingerprint))?;

            let mut payload = Digest::new();
            for b in binaries {
                if !b.is_empty() {
                    payload.update(b);
                }
            }
            file.write_all(&payload.finalize())?;

            file.write_all(&(binaries.len() as u64).to_ne_bytes())?;
            for b in binaries {
                file.write_all(&(b.len() as u64).to_ne_bytes())?;
            }
            for b in binaries {
                file.write_all(b)?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    /// Unlink cache entries older than `days` days
    ///
    /// Non-recursive and best-effort: unreadable entries and unlink failures
    /// are skipped.
    pub fn purge(&self, days: u32) {
        let Some(dir) = self.path() else { return };
        let oldest = SystemTime::now() - Duration::from_secs(60 * 60 * 24 * u64::from(days));
        let Ok(entries) = fs::read_dir(&dir) else { return };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let stamp = meta.created().or_else(|_| meta.modified());
            if let Ok(stamp) = stamp {
                if stamp < oldest {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
    }
}

impl Default for BinaryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_fingerprint() -> DeviceFingerprint {
        DeviceFingerprint {
            vendor: "X".into(),
            name: "Y".into(),
            driver_version: "Z".into(),
            units: 2,
        }
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BinaryCache::new();
        cache.set_path(dir.path());

        let fp = fake_fingerprint();
        cache.save(&fp, &[&[0x01, 0x02], &[0x03]], b"code", "-O2");

        let loaded = cache.load(&fp, b"code", "-O2").expect("expected a hit");
        assert_eq!(loaded, vec![vec![0x01, 0x02], vec![0x03]]);
    }

    #[test]
    fn test_different_options_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BinaryCache::new();
        cache.set_path(dir.path());

        let fp = fake_fingerprint();
        cache.save(&fp, &[&[0x01, 0x02], &[0x03]], b"code", "-O2");

        assert!(cache.load(&fp, b"code", "-O1").is_none());
        assert!(cache.load(&fp, b"other", "-O2").is_none());
    }

    #[test]
    fn test_different_fingerprint_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BinaryCache::new();
        cache.set_path(dir.path());

        let fp = fake_fingerprint();
        cache.save(&fp, &[&[0x01], &[0x02]], b"code", "");

        let mut other = fake_fingerprint();
        other.driver_version = "Z2".into();
        assert!(cache.load(&other, b"code", "").is_none());

        let mut fewer_units = fake_fingerprint();
        fewer_units.units = 1;
        assert!(cache.load(&fewer_units, b"code", "").is_none());
    }

    #[test]
    fn test_corrupted_payload_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BinaryCache::new();
        cache.set_path(dir.path());

        let fp = fake_fingerprint();
        cache.save(&fp, &[&[0x01, 0x02], &[0x03]], b"code", "-O2");

        // flip the final payload byte on disk
        let entry = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .next()
            .expect("record file");
        let mut bytes = fs::read(entry.path()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(entry.path(), bytes).unwrap();

        assert!(cache.load(&fp, b"code", "-O2").is_none());
    }

    #[test]
    fn test_truncated_record_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BinaryCache::new();
        cache.set_path(dir.path());

        let fp = fake_fingerprint();
        cache.save(&fp, &[&[0x01, 0x02], &[0x03]], b"code", "");

        let entry = fs::read_dir(dir.path()).unwrap().flatten().next().unwrap();
        let bytes = fs::read(entry.path()).unwrap();
        fs::write(entry.path(), &bytes[..bytes.len() - 2]).unwrap();

        assert!(cache.load(&fp, b"code", "").is_none());
    }

    #[test]
    fn test_disabled_cache_is_inert() {
        let cache = BinaryCache::new();
        assert!(!cache.is_enabled());

        let fp = fake_fingerprint();
        cache.save(&fp, &[&[0x01], &[0x02]], b"code", "");
        assert!(cache.load(&fp, b"code", "").is_none());
        cache.purge(30);
    }

    #[test]
    fn test_purge_keeps_fresh_records() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BinaryCache::new();
        cache.set_path(dir.path());

        let fp = fake_fingerprint();
        cache.save(&fp, &[&[0x01], &[0x02]], b"code", "");
        cache.purge(30);

        assert!(cache.load(&fp, b"code", "").is_some());
    }

    #[test]
    fn test_global_is_shared() {
        let a = BinaryCache::global();
        let b = BinaryCache::global();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
