// download.rs — Model file download and local cache.
//
// Fetches model files from the hub on first use and caches them under the model cache dir.
// A manifest records the SHA256 and size of every fetched file, and which optional files
// the repo does not have, so later runs neither re-download nor re-request them.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{self, Settings};
use crate::embeddings::pooling::Pipeline;
use crate::embeddings::resolve::hub_repo_id;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Weights {
    Safetensors(PathBuf),
    Pytorch(PathBuf),
}

/// Local paths of everything needed to build an `EmbeddingEngine`.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub dir: PathBuf,
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: Weights,
    pub modules: Option<PathBuf>,
    pub sentence_bert_config: Option<PathBuf>,
    pub pooling_config: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum ManifestEntry {
    Present { sha256: String, bytes: u64 },
    Absent,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    files: BTreeMap<String, ManifestEntry>,
}

/// Fetch (or find in the cache) all files for `model_name`. Returns their local paths.
pub fn ensure_model_files(settings: &Settings, model_name: &str) -> anyhow::Result<ModelFiles> {
    let repo_id = hub_repo_id(model_name);
    let mut cache = ModelCache::open(settings, &repo_id)?;
    log::info!("Resolving model {} in {}", repo_id, cache.dir.display());

    let config = cache.fetch_required(config::files::CONFIG)?;
    let tokenizer = cache.fetch_required(config::files::TOKENIZER)?;
    let weights = match cache.fetch(config::files::SAFETENSORS)? {
        Some(path) => Weights::Safetensors(path),
        None => Weights::Pytorch(cache.fetch_required(config::files::PYTORCH_WEIGHTS)?),
    };
    let modules = cache.fetch(config::files::MODULES)?;
    let sentence_bert_config = cache.fetch(config::files::SENTENCE_BERT_CONFIG)?;

    let pipeline = Pipeline::load(modules.as_deref())?;
    let pooling_config = match pipeline.pooling_dir.as_deref() {
        Some(dir) => cache.fetch(&pooling_config_name(dir))?,
        None => None,
    };

    Ok(ModelFiles {
        dir: cache.dir,
        config,
        tokenizer,
        weights,
        modules,
        sentence_bert_config,
        pooling_config,
    })
}

fn pooling_config_name(pooling_dir: &str) -> String {
    let dir = pooling_dir.trim_matches('/');
    if dir.is_empty() {
        config::files::POOLING_CONFIG.to_string()
    } else {
        format!("{dir}/{}", config::files::POOLING_CONFIG)
    }
}

/// Hub download URL for one file of a repo.
pub fn file_url(endpoint: &str, repo_id: &str, file: &str) -> String {
    format!("{endpoint}/{repo_id}/resolve/{}/{file}", config::hub::REVISION)
}

struct ModelCache<'a> {
    settings: &'a Settings,
    repo_id: String,
    dir: PathBuf,
    manifest: Manifest,
}

impl<'a> ModelCache<'a> {
    fn open(settings: &'a Settings, repo_id: &str) -> anyhow::Result<Self> {
        let dir = settings.cache_dir.join(repo_id);
        let manifest_path = dir.join(config::files::MANIFEST);
        let manifest = if manifest_path.exists() {
            let raw = fs::read_to_string(&manifest_path)
                .with_context(|| format!("read {}", manifest_path.display()))?;
            match serde_json::from_str(&raw) {
                Ok(m) => m,
                Err(e) => {
                    log::warn!("Ignoring unreadable manifest {}: {}", manifest_path.display(), e);
                    Manifest::default()
                }
            }
        } else {
            Manifest::default()
        };

        Ok(Self {
            settings,
            repo_id: repo_id.to_string(),
            dir,
            manifest,
        })
    }

    fn fetch_required(&mut self, file: &str) -> anyhow::Result<PathBuf> {
        match self.fetch(file)? {
            Some(path) => Ok(path),
            None => bail!("model {} has no {}", self.repo_id, file),
        }
    }

    /// Returns the cached path of `file`, downloading it if needed, or None if the repo
    /// does not have it.
    fn fetch(&mut self, file: &str) -> anyhow::Result<Option<PathBuf>> {
        let dest = self.dir.join(file);
        let on_disk = fs::metadata(&dest).ok().map(|m| m.len());

        match (self.manifest.files.get(file), on_disk) {
            (Some(ManifestEntry::Absent), _) => return Ok(None),
            (Some(ManifestEntry::Present { bytes, .. }), Some(len)) if *bytes == len => {
                log::debug!("Cache hit for {} ({} bytes)", file, len);
                return Ok(Some(dest));
            }
            (Some(ManifestEntry::Present { bytes, .. }), on_disk) => {
                if self.settings.offline {
                    bail!(
                        "cached {} for {} is damaged (expected {} bytes, found {:?}) and offline mode is on",
                        file,
                        self.repo_id,
                        bytes,
                        on_disk
                    );
                }
                log::warn!("Cached {} does not match manifest, downloading again", dest.display());
            }
            // Placed in the cache by hand.
            (None, Some(_)) => return Ok(Some(dest)),
            (None, None) => {}
        }

        if self.settings.offline {
            log::info!("{} for {} is not in the model cache (offline)", file, self.repo_id);
            return Ok(None);
        }

        let url = file_url(&self.settings.hub_endpoint, &self.repo_id, file);
        let entry = match download_to(&url, &dest)? {
            Some(entry) => entry,
            None => {
                log::info!("{} has no {}", self.repo_id, file);
                ManifestEntry::Absent
            }
        };
        let present = matches!(entry, ManifestEntry::Present { .. });
        self.manifest.files.insert(file.to_string(), entry);
        self.save_manifest()?;

        Ok(present.then_some(dest))
    }

    fn save_manifest(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir).with_context(|| format!("failed to create model dir {}", self.dir.display()))?;
        let path = self.dir.join(config::files::MANIFEST);
        let json = serde_json::to_vec_pretty(&self.manifest).context("failed serializing manifest")?;
        fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))
    }
}

/// Stream `url` into `dest`, hashing as we go. Returns None on HTTP 404.
fn download_to(url: &str, dest: &Path) -> anyhow::Result<Option<ManifestEntry>> {
    log::info!("Downloading {}", url);

    let resp = match ureq::get(url)
        .timeout(Duration::from_secs(config::hub::DOWNLOAD_TIMEOUT_SECS))
        .call()
    {
        Ok(resp) => resp,
        Err(ureq::Error::Status(404, _)) => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("failed to download {url}")),
    };

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let (sha256, bytes) = stream_to_file(&mut resp.into_reader(), dest)
        .with_context(|| format!("failed to save {url}"))?;

    log::info!("Saved {} ({} bytes, sha256 {})", dest.display(), bytes, &sha256[..12]);
    Ok(Some(ManifestEntry::Present { sha256, bytes }))
}

/// Temporary sibling of `dest` used while a download is in flight (`<file>.tmp`).
fn tmp_path_for(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Copy `reader` into `dest` atomically: write `<file>.tmp`, then rename.
/// The temporary file is removed if anything fails.
fn stream_to_file(reader: &mut dyn Read, dest: &Path) -> anyhow::Result<(String, u64)> {
    let tmp_path = tmp_path_for(dest);
    let result = write_then_rename(reader, &tmp_path, dest);
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

fn write_then_rename(reader: &mut dyn Read, tmp_path: &Path, dest: &Path) -> anyhow::Result<(String, u64)> {
    let file = fs::File::create(tmp_path).with_context(|| format!("failed to create {}", tmp_path.display()))?;
    let mut writer = HashingWriter::new(BufWriter::new(file));
    io::copy(reader, &mut writer).context("failed to read response body")?;
    let (sha256, bytes) = writer.finish()?;
    fs::rename(tmp_path, dest)
        .with_context(|| format!("failed to rename {} -> {}", tmp_path.display(), dest.display()))?;
    Ok((sha256, bytes))
}

struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    bytes: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    /// Flush and return the hex SHA256 and byte count of everything written.
    fn finish(mut self) -> anyhow::Result<(String, u64)> {
        self.inner.flush()?;
        Ok((hex::encode(self.hasher.finalize()), self.bytes))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_settings(cache_dir: &Path) -> Settings {
        Settings {
            cache_dir: cache_dir.to_path_buf(),
            hub_endpoint: config::hub::DEFAULT_ENDPOINT.to_string(),
            offline: true,
            log_spec: "warn".to_string(),
            log_dir: None,
        }
    }

    fn write_file(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_file_url() {
        assert_eq!(
            file_url("https://huggingface.co", "sentence-transformers/all-mpnet-base-v2", "1_Pooling/config.json"),
            "https://huggingface.co/sentence-transformers/all-mpnet-base-v2/resolve/main/1_Pooling/config.json"
        );
    }

    #[test]
    fn test_pooling_config_name() {
        assert_eq!(pooling_config_name("1_Pooling"), "1_Pooling/config.json");
        assert_eq!(pooling_config_name(""), "config.json");
    }

    #[test]
    fn test_hashing_writer() {
        let mut w = HashingWriter::new(Vec::new());
        w.write_all(b"abc").unwrap();
        let (sha, bytes) = w.finish().unwrap();
        assert_eq!(bytes, 3);
        assert_eq!(sha, "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
    }

    #[test]
    fn test_tmp_path_keeps_full_file_name() {
        assert_eq!(tmp_path_for(Path::new("/m/config.json")), PathBuf::from("/m/config.json.tmp"));
        assert_eq!(tmp_path_for(Path::new("/m/model.safetensors")), PathBuf::from("/m/model.safetensors.tmp"));
        assert_ne!(
            tmp_path_for(Path::new("/m/config.json")),
            tmp_path_for(Path::new("/m/config.safetensors"))
        );
    }

    #[test]
    fn test_stream_to_file_renames_into_place() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("tokenizer.json");
        let (sha, bytes) = stream_to_file(&mut &b"abc"[..], &dest).unwrap();
        assert_eq!(bytes, 3);
        assert_eq!(sha, "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
        assert_eq!(fs::read(&dest).unwrap(), b"abc");
        assert!(!tmp_path_for(&dest).exists());
    }

    struct BrokenBody;

    impl Read for BrokenBody {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"))
        }
    }

    #[test]
    fn test_stream_to_file_cleans_up_on_read_error() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("model.safetensors");
        let err = stream_to_file(&mut BrokenBody, &dest).unwrap_err();
        assert!(format!("{err:#}").contains("connection reset"));
        assert!(!dest.exists());
        assert!(!tmp_path_for(&dest).exists());
    }

    #[test]
    fn test_offline_uses_cached_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("sentence-transformers/tiny");
        write_file(&dir.join("config.json"), "{}");
        write_file(&dir.join("tokenizer.json"), "{}");
        write_file(&dir.join("model.safetensors"), "weights");
        write_file(
            &dir.join("modules.json"),
            r#"[{"path": "1_Pooling", "type": "sentence_transformers.models.Pooling"}]"#,
        );
        write_file(&dir.join("1_Pooling/config.json"), r#"{"pooling_mode_cls_token": true}"#);

        let files = ensure_model_files(&offline_settings(tmp.path()), "tiny").unwrap();
        assert_eq!(files.dir, dir);
        assert_eq!(files.weights, Weights::Safetensors(dir.join("model.safetensors")));
        assert_eq!(files.pooling_config, Some(dir.join("1_Pooling/config.json")));
        assert!(files.sentence_bert_config.is_none());
    }

    #[test]
    fn test_offline_falls_back_to_pytorch_weights() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("sentence-transformers/old");
        write_file(&dir.join("config.json"), "{}");
        write_file(&dir.join("tokenizer.json"), "{}");
        write_file(&dir.join("pytorch_model.bin"), "weights");

        let files = ensure_model_files(&offline_settings(tmp.path()), "old").unwrap();
        assert_eq!(files.weights, Weights::Pytorch(dir.join("pytorch_model.bin")));
        assert!(files.modules.is_none());
        assert!(files.pooling_config.is_none());
    }

    #[test]
    fn test_offline_missing_required_file() {
        let tmp = tempfile::tempdir().unwrap();
        let err = ensure_model_files(&offline_settings(tmp.path()), "nope").unwrap_err();
        assert!(err.to_string().contains("has no config.json"));
    }

    #[test]
    fn test_manifest_absent_entry_skips_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut settings = offline_settings(tmp.path());
        settings.offline = false;
        let mut cache = ModelCache::open(&settings, "sentence-transformers/tiny").unwrap();
        cache.manifest.files.insert("modules.json".to_string(), ManifestEntry::Absent);
        assert_eq!(cache.fetch("modules.json").unwrap(), None);
    }

    #[test]
    fn test_offline_size_mismatch_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = offline_settings(tmp.path());
        let mut cache = ModelCache::open(&settings, "sentence-transformers/tiny").unwrap();
        write_file(&cache.dir.join("config.json"), "{}");
        cache.manifest.files.insert(
            "config.json".to_string(),
            ManifestEntry::Present {
                sha256: "00".to_string(),
                bytes: 999,
            },
        );
        let err = cache.fetch("config.json").unwrap_err();
        assert!(err.to_string().contains("damaged"));
    }

    #[test]
    fn test_manifest_is_reloaded() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = offline_settings(tmp.path());
        {
            let mut cache = ModelCache::open(&settings, "sentence-transformers/tiny").unwrap();
            write_file(&cache.dir.join("tokenizer.json"), "{}");
            cache.manifest.files.insert(
                "tokenizer.json".to_string(),
                ManifestEntry::Present {
                    sha256: "ab".to_string(),
                    bytes: 2,
                },
            );
            cache.manifest.files.insert("modules.json".to_string(), ManifestEntry::Absent);
            cache.save_manifest().unwrap();
        }
        let mut cache = ModelCache::open(&settings, "sentence-transformers/tiny").unwrap();
        assert_eq!(cache.fetch("tokenizer.json").unwrap(), Some(cache.dir.join("tokenizer.json")));
        assert_eq!(cache.fetch("modules.json").unwrap(), None);
    }
}
