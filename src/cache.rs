// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! On-disk cache for downloads, repository indexes and file payloads.

Layout under the cache root:

```text
downloads/   fetched artifacts keyed by URL, with JSON sidecar metadata
indexes/     decompressed Packages indices keyed by repo/suite/component/arch
blobs/       content-addressed (SHA-256) regular-file payloads
staging/     per-build staging directories (transient)
```

Every entry is self-describing: a `.meta.json` sidecar records the origin URL
(or index key), the content SHA-256 and the fetch time. Writes follow a
tempfile plus atomic-rename discipline so concurrent workers never observe a
partially written entry.
*/

use {
    crate::error::Result,
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
    std::{
        fs,
        io::Write,
        path::{Path, PathBuf},
        time::{SystemTime, UNIX_EPOCH},
    },
    url::Url,
};

/// Cached index entries are refreshed after this many seconds.
const INDEX_TTL_SECS: u64 = 24 * 60 * 60;

/// Sidecar metadata describing a cache entry.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CacheEntryMeta {
    /// Origin URL or index key the entry was produced from.
    pub origin: String,
    /// Lowercase hex SHA-256 of the entry content.
    pub sha256: String,
    /// Unix timestamp of the fetch.
    pub fetched_at: u64,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Compute the lowercase hex SHA-256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compute the lowercase hex SHA-256 of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut file = fs::File::open(path)?;

    std::io::copy(&mut file, &mut hasher)?;

    Ok(hex::encode(hasher.finalize()))
}

/// Key of a cached, decompressed `Packages` index.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct IndexKey {
    pub repo_id: String,
    pub suite: String,
    pub component: String,
    pub architecture: String,
}

impl IndexKey {
    fn file_stem(&self) -> String {
        let raw = format!(
            "{}_{}_{}_{}",
            self.repo_id, self.suite, self.component, self.architecture
        );

        // Mirrors can serve different content for the same logical index, so
        // the key alone is not sufficient to address the content; the
        // caller additionally pins the expected SHA-256 from the release
        // file. The stem only needs to be filesystem-safe and collision-free.
        format!("{}_{}", sanitize(&raw), &sha256_hex(raw.as_bytes())[..12])
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Process-external on-disk store shared by all workers of a build.
#[derive(Clone, Debug)]
pub struct Cache {
    root: PathBuf,
}

impl Cache {
    /// Open (creating if necessary) a cache rooted at the given directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();

        for sub in ["downloads", "indexes", "blobs", "staging"] {
            fs::create_dir_all(root.join(sub))?;
        }

        Ok(Self { root })
    }

    /// Open the default per-user cache (`$HOME/.cache/debian-image-builder`).
    pub fn open_default() -> Result<Self> {
        let home = std::env::var_os("HOME").unwrap_or_else(|| ".".into());

        Self::open(PathBuf::from(home).join(".cache").join("debian-image-builder"))
    }

    /// The cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Remove all cached state.
    pub fn purge(&self) -> Result<()> {
        for sub in ["downloads", "indexes", "blobs", "staging"] {
            let dir = self.root.join(sub);
            fs::remove_dir_all(&dir)?;
            fs::create_dir_all(&dir)?;
        }

        Ok(())
    }

    /// Allocate a staging directory for a build.
    pub fn staging_dir(&self, build_id: &str) -> Result<PathBuf> {
        let dir = self.root.join("staging").join(sanitize(build_id));
        fs::create_dir_all(&dir)?;

        Ok(dir)
    }

    fn meta_path(path: &Path) -> PathBuf {
        let mut s = path.as_os_str().to_os_string();
        s.push(".meta.json");

        PathBuf::from(s)
    }

    fn read_meta(path: &Path) -> Option<CacheEntryMeta> {
        let data = fs::read(Self::meta_path(path)).ok()?;

        serde_json::from_slice(&data).ok()
    }

    fn write_entry(&self, path: &Path, data: &[u8], meta: &CacheEntryMeta) -> Result<()> {
        let dir = path.parent().expect("cache entries always have a parent");

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| e.error)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer(&mut tmp, meta)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        tmp.flush()?;
        tmp.persist(Self::meta_path(path)).map_err(|e| e.error)?;

        Ok(())
    }

    // Downloads.

    /// The cache path an URL downloads into.
    pub fn download_path(&self, url: &Url) -> PathBuf {
        let name = format!(
            "{}{}",
            url.host_str().unwrap_or(""),
            url.path().replace('/', "_")
        );

        self.root.join("downloads").join(format!(
            "{}_{}",
            sanitize(&name),
            &sha256_hex(url.as_str().as_bytes())[..12]
        ))
    }

    /// Look up a downloaded artifact by URL and expected digest.
    ///
    /// Returns the path only when the sidecar digest matches; a mismatching
    /// entry is left in place for [crate::fetch::Fetcher] to invalidate.
    pub fn lookup_download(&self, url: &Url, expected_sha256: &str) -> Option<PathBuf> {
        let path = self.download_path(url);

        if !path.is_file() {
            return None;
        }

        let meta = Self::read_meta(&path)?;

        if meta.sha256.eq_ignore_ascii_case(expected_sha256) {
            Some(path)
        } else {
            None
        }
    }

    /// Look up a downloaded artifact by URL alone, subject to a maximum age.
    ///
    /// Used for release files, whose content digest is not known up front.
    pub fn lookup_download_fresh(&self, url: &Url, max_age_secs: u64) -> Option<PathBuf> {
        let path = self.download_path(url);

        if !path.is_file() {
            return None;
        }

        let meta = Self::read_meta(&path)?;

        if unix_now().saturating_sub(meta.fetched_at) > max_age_secs {
            None
        } else {
            Some(path)
        }
    }

    /// Remove a downloaded artifact and its sidecar.
    pub fn invalidate_download(&self, url: &Url) -> Result<()> {
        let path = self.download_path(url);

        if path.is_file() {
            fs::remove_file(&path)?;
        }

        let meta = Self::meta_path(&path);
        if meta.is_file() {
            fs::remove_file(&meta)?;
        }

        Ok(())
    }

    /// Publish a fully downloaded, verified file into the cache.
    ///
    /// `source` is atomically renamed into place.
    pub fn publish_download(&self, url: &Url, source: &Path, sha256: &str) -> Result<PathBuf> {
        let path = self.download_path(url);

        fs::rename(source, &path)?;

        let meta = CacheEntryMeta {
            origin: url.to_string(),
            sha256: sha256.to_ascii_lowercase(),
            fetched_at: unix_now(),
        };

        let dir = path.parent().expect("download path always has a parent");
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer(&mut tmp, &meta)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        tmp.flush()?;
        tmp.persist(Self::meta_path(&path)).map_err(|e| e.error)?;

        Ok(path)
    }

    // Indexes.

    fn index_path(&self, key: &IndexKey) -> PathBuf {
        self.root.join("indexes").join(key.file_stem())
    }

    /// Look up a decompressed index by key and release-file digest.
    ///
    /// The digest is part of the lookup because mirrors can diverge; an entry
    /// cached from one mirror must not satisfy a release file advertising
    /// different content. Entries older than 24 hours are discarded.
    pub fn lookup_index(&self, key: &IndexKey, sha256: &str) -> Option<Vec<u8>> {
        let path = self.index_path(key);
        let meta = Self::read_meta(&path)?;

        if !meta.sha256.eq_ignore_ascii_case(sha256) {
            return None;
        }

        if unix_now().saturating_sub(meta.fetched_at) > INDEX_TTL_SECS {
            let _ = fs::remove_file(&path);
            let _ = fs::remove_file(Self::meta_path(&path));
            return None;
        }

        fs::read(&path).ok()
    }

    /// Store a decompressed index.
    ///
    /// `sha256` is the digest the release file advertised for the fetched
    /// (still compressed) index; it forms the composite cache key.
    pub fn store_index(&self, key: &IndexKey, data: &[u8], sha256: &str) -> Result<()> {
        let meta = CacheEntryMeta {
            origin: format!(
                "{}/{}/{}/{}",
                key.repo_id, key.suite, key.component, key.architecture
            ),
            sha256: sha256.to_ascii_lowercase(),
            fetched_at: unix_now(),
        };

        self.write_entry(&self.index_path(key), data, &meta)
    }

    // Blobs.

    /// Path of a content-addressed blob.
    pub fn blob_path(&self, sha256: &str) -> PathBuf {
        self.root.join("blobs").join(&sha256[..2]).join(sha256)
    }

    /// Whether a blob is present.
    pub fn has_blob(&self, sha256: &str) -> bool {
        self.blob_path(sha256).is_file()
    }

    /// Store a payload into the blob store, returning its digest.
    pub fn store_blob(&self, data: &[u8]) -> Result<String> {
        let digest = sha256_hex(data);
        let path = self.blob_path(&digest);

        if !path.is_file() {
            let dir = path.parent().expect("blob path always has a parent");
            fs::create_dir_all(dir)?;

            let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
            tmp.write_all(data)?;
            tmp.flush()?;
            tmp.persist(&path).map_err(|e| e.error)?;
        }

        Ok(digest)
    }

    /// Read a blob's content.
    pub fn read_blob(&self, sha256: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.blob_path(sha256))?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn cache() -> (tempfile::TempDir, Cache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path().join("cache")).unwrap();

        (dir, cache)
    }

    #[test]
    fn download_round_trip() -> Result<()> {
        let (_dir, cache) = cache();
        let url = Url::parse("http://example.com/pool/a/a_1.0_arm64.deb").unwrap();

        assert!(cache.lookup_download(&url, "ab").is_none());

        let digest = sha256_hex(b"payload");
        let tmp = cache.root().join("incoming");
        std::fs::write(&tmp, b"payload")?;
        cache.publish_download(&url, &tmp, &digest)?;

        let path = cache.lookup_download(&url, &digest).unwrap();
        assert_eq!(std::fs::read(path)?, b"payload");

        // A different expected digest misses.
        assert!(cache.lookup_download(&url, &sha256_hex(b"other")).is_none());

        cache.invalidate_download(&url)?;
        assert!(cache.lookup_download(&url, &digest).is_none());

        Ok(())
    }

    #[test]
    fn index_keyed_by_digest() -> Result<()> {
        let (_dir, cache) = cache();

        let key = IndexKey {
            repo_id: "http://example.com_stable".into(),
            suite: "stable".into(),
            component: "main".into(),
            architecture: "arm64".into(),
        };

        cache.store_index(&key, b"Package: a\n", "cafe01")?;

        assert_eq!(cache.lookup_index(&key, "cafe01").unwrap(), b"Package: a\n");
        assert_eq!(cache.lookup_index(&key, "CAFE01").unwrap(), b"Package: a\n");
        // Divergent mirror digest misses.
        assert!(cache.lookup_index(&key, "beef02").is_none());

        Ok(())
    }

    #[test]
    fn blob_store_dedupes() -> Result<()> {
        let (_dir, cache) = cache();

        let a = cache.store_blob(b"content")?;
        let b = cache.store_blob(b"content")?;
        assert_eq!(a, b);
        assert!(cache.has_blob(&a));
        assert_eq!(cache.read_blob(&a)?, b"content");

        Ok(())
    }

    #[test]
    fn purge_clears_everything() -> Result<()> {
        let (_dir, cache) = cache();

        let digest = cache.store_blob(b"x")?;
        cache.purge()?;
        assert!(!cache.has_blob(&digest));

        Ok(())
    }
}
