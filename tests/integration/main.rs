//! Integration tests for pkgcache

use std::fs;
use std::path::Path;
use uuid::Uuid;

/// Place one content file for a resource version in a directory repository
fn publish(repo: &Path, resource: Uuid, version: u32, name: &str, bytes: &[u8]) {
    let dir = repo.join(resource.hyphenated().to_string()).join(version.to_string());
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(name), bytes).unwrap();
}

fn sample_package() -> Vec<u8> {
    pkgcache::source::TarPackage::pack(&[
        ("imsmanifest.xml", b"<manifest/>".as_slice()),
        ("content/index.html", b"<html/>".as_slice()),
    ])
    .unwrap()
}

mod cli_tests {
    use super::*;
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use filetime::FileTime;
    use predicates::prelude::*;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    /// Command isolated from the user's config and environment
    fn pkgcache(temp: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("pkgcache");
        cmd.env_remove("PKGCACHE_PATH")
            .env("PKGCACHE_CONFIG", temp.path().join("config.toml"));
        cmd
    }

    struct Workspace {
        temp: TempDir,
    }

    impl Workspace {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            fs::create_dir(temp.path().join("cache")).unwrap();
            fs::create_dir(temp.path().join("repo")).unwrap();
            Self { temp }
        }

        fn cache(&self) -> std::path::PathBuf {
            self.temp.path().join("cache")
        }

        fn repo(&self) -> std::path::PathBuf {
            self.temp.path().join("repo")
        }

        fn cmd(&self) -> Command {
            let mut cmd = pkgcache(&self.temp);
            cmd.arg("--cache-path").arg(self.cache());
            cmd
        }

        fn acquire(&self, resource: Uuid, extra: &[&str]) -> Command {
            let mut cmd = self.cmd();
            cmd.arg("acquire")
                .arg(resource.to_string())
                .arg("1")
                .arg("--repository")
                .arg(self.repo())
                .args(extra);
            cmd
        }
    }

    #[test]
    fn help_displays() {
        let temp = TempDir::new().unwrap();
        pkgcache(&temp)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("disk cache"));
    }

    #[test]
    fn version_displays() {
        let temp = TempDir::new().unwrap();
        pkgcache(&temp)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("pkgcache"));
    }

    #[test]
    fn key_prints_fixed_length_name() {
        let temp = TempDir::new().unwrap();
        pkgcache(&temp)
            .args(["key", "6f9619ff-8b86-d011-b42d-00c04fc964ff", "12"])
            .assert()
            .success()
            .stdout(predicate::str::is_match("^[A-Z1-6]{26}_[A-Z1-6]{7}\n$").unwrap());
    }

    #[test]
    fn config_path() {
        let temp = TempDir::new().unwrap();
        pkgcache(&temp)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let temp = TempDir::new().unwrap();
        pkgcache(&temp)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[cache]"));
    }

    #[test]
    fn config_init_writes_file() {
        let temp = TempDir::new().unwrap();
        pkgcache(&temp).args(["config", "init"]).assert().success();

        let written = fs::read_to_string(temp.path().join("config.toml")).unwrap();
        assert!(written.contains("acquire_timeout_secs = 120"));
    }

    #[test]
    fn list_requires_cache_path() {
        let temp = TempDir::new().unwrap();
        pkgcache(&temp)
            .arg("list")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Cache path is not configured"));
    }

    #[test]
    fn list_empty() {
        let ws = Workspace::new();
        ws.cmd()
            .args(["list", "--format", "json"])
            .assert()
            .success()
            .stdout("[]\n");
    }

    #[test]
    fn acquire_as_file() {
        let ws = Workspace::new();
        let resource = Uuid::new_v4();
        publish(&ws.repo(), resource, 1, "notes.txt", b"plain notes");

        let output = ws
            .acquire(resource, &["--as-file", "--format", "plain"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();

        let path = String::from_utf8(output).unwrap();
        assert_eq!(fs::read(path.trim()).unwrap(), b"plain notes");
    }

    #[test]
    fn acquire_package_then_list() {
        let ws = Workspace::new();
        let resource = Uuid::new_v4();
        publish(&ws.repo(), resource, 1, "course.tar", &sample_package());

        ws.acquire(resource, &["--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"WrittenAsPackage\""));

        let name = pkgcache::cache::encode(resource, 1);
        assert!(ws.cache().join(&name).join("content/index.html").is_file());

        ws.cmd()
            .args(["list", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::contains(name));
    }

    #[test]
    fn acquire_invalid_package_warns() {
        let ws = Workspace::new();
        let resource = Uuid::new_v4();
        publish(&ws.repo(), resource, 1, "readme.txt", b"not an archive");

        ws.acquire(resource, &[])
            .assert()
            .success()
            .stdout(predicate::str::contains("InvalidPackageWrittenAsFile"));
    }

    #[test]
    fn acquire_missing_resource_fails() {
        let ws = Workspace::new();
        ws.acquire(Uuid::new_v4(), &[])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));
    }

    #[test]
    fn sweep_evicts_idle_entry() {
        let ws = Workspace::new();
        let resource = Uuid::new_v4();
        publish(&ws.repo(), resource, 1, "notes.txt", b"x");
        ws.acquire(resource, &["--as-file"]).assert().success();

        let lock = ws
            .cache()
            .join(format!("{}.lock", pkgcache::cache::encode(resource, 1)));
        let old = FileTime::from_system_time(SystemTime::now() - Duration::from_secs(3600));
        filetime::set_file_atime(&lock, old).unwrap();

        ws.cmd()
            .args(["sweep", "--older-than", "60", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"evicted\": 1"));
        assert!(!lock.exists());
    }

    #[test]
    fn sweep_without_expiration_does_nothing() {
        let ws = Workspace::new();
        ws.cmd()
            .arg("sweep")
            .assert()
            .success()
            .stdout(predicate::str::contains("No expiration configured"));
    }

    #[test]
    fn concurrent_processes_share_one_entry() {
        let ws = Workspace::new();
        let resource = Uuid::new_v4();
        publish(&ws.repo(), resource, 1, "course.tar", &sample_package());

        let children: Vec<_> = (0..4)
            .map(|_| {
                std::process::Command::new(env!("CARGO_BIN_EXE_pkgcache"))
                    .env_remove("PKGCACHE_PATH")
                    .env("PKGCACHE_CONFIG", ws.temp.path().join("config.toml"))
                    .arg("--cache-path")
                    .arg(ws.cache())
                    .args(["acquire", &resource.to_string(), "1", "--hold", "1"])
                    .arg("--repository")
                    .arg(ws.repo())
                    .args(["--format", "plain"])
                    .stdout(std::process::Stdio::piped())
                    .stderr(std::process::Stdio::piped())
                    .spawn()
                    .unwrap()
            })
            .collect();

        for child in children {
            let output = child.wait_with_output().unwrap();
            assert!(output.status.success(), "{:?}", output);
        }

        let names: Vec<_> = fs::read_dir(ws.cache())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2, "{:?}", names);
    }
}

mod cache_tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use filetime::FileTime;
    use pkgcache::cache::lockfile::{try_claim_exclusive, Attempt};
    use pkgcache::cache::{
        CacheKey, CacheSettings, PackageCache, RequestedFormat, SourceMetadata, StorageFormat,
    };
    use pkgcache::source::{FetchContext, FetchedResource, ResourceSource};
    use pkgcache::{CacheError, CacheResult};
    use std::io::{self, Read};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Barrier, Mutex};
    use std::time::{Duration, Instant, SystemTime};
    use tempfile::TempDir;

    /// In-memory source counting every call
    struct TestSource {
        content: Mutex<(Vec<u8>, DateTime<Utc>)>,
        fetch_delay: Duration,
        fetches: AtomicUsize,
        metadata_calls: AtomicUsize,
    }

    impl TestSource {
        fn new(bytes: &[u8]) -> Self {
            Self {
                content: Mutex::new((bytes.to_vec(), Utc::now())),
                fetch_delay: Duration::ZERO,
                fetches: AtomicUsize::new(0),
                metadata_calls: AtomicUsize::new(0),
            }
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.fetch_delay = delay;
            self
        }

        fn replace(&self, bytes: &[u8]) {
            let mut content = self.content.lock().unwrap();
            *content = (bytes.to_vec(), content.1 + chrono::Duration::seconds(10));
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }

        fn current(&self) -> (Vec<u8>, SourceMetadata) {
            let content = self.content.lock().unwrap();
            let metadata = SourceMetadata::new(content.1, content.0.len() as u64);
            (content.0.clone(), metadata)
        }
    }

    impl ResourceSource for TestSource {
        fn metadata(&self, _key: &CacheKey, _ctx: &FetchContext) -> CacheResult<SourceMetadata> {
            self.metadata_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.current().1)
        }

        fn fetch(&self, _key: &CacheKey, _ctx: &FetchContext) -> CacheResult<FetchedResource> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.fetch_delay);
            let (bytes, metadata) = self.current();
            Ok(FetchedResource {
                reader: Box::new(io::Cursor::new(bytes)),
                metadata,
                filename: "content.bin".to_string(),
            })
        }
    }

    /// Source whose stream breaks after a few bytes
    struct BrokenSource;

    struct BrokenReader(usize);

    impl Read for BrokenReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.0 == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection dropped"));
            }
            self.0 -= 1;
            buf[0] = 0;
            Ok(1)
        }
    }

    impl ResourceSource for BrokenSource {
        fn metadata(&self, _key: &CacheKey, _ctx: &FetchContext) -> CacheResult<SourceMetadata> {
            Ok(SourceMetadata::new(Utc::now(), 1000))
        }

        fn fetch(&self, key: &CacheKey, ctx: &FetchContext) -> CacheResult<FetchedResource> {
            Ok(FetchedResource {
                reader: Box::new(BrokenReader(64)),
                metadata: self.metadata(key, ctx)?,
                filename: "content.bin".to_string(),
            })
        }
    }

    fn settings(temp: &TempDir) -> CacheSettings {
        let mut settings = CacheSettings::new(temp.path());
        settings.acquire_timeout = Duration::from_secs(10);
        settings.poll_interval = Duration::from_millis(20);
        settings
    }

    fn cache(temp: &TempDir) -> PackageCache {
        PackageCache::new(settings(temp)).unwrap()
    }

    fn backdate(lock: &Path, by: Duration) {
        let old = FileTime::from_system_time(SystemTime::now() - by);
        filetime::set_file_atime(lock, old).unwrap();
    }

    fn key() -> CacheKey {
        CacheKey::for_resource(Uuid::new_v4(), 1)
    }

    #[test]
    fn concurrent_acquirers_fetch_once() {
        let temp = TempDir::new().unwrap();
        let cache = cache(&temp);
        let source = TestSource::new(&sample_package()).slow(Duration::from_millis(300));
        let key = key();
        let threads = 8;
        let barrier = Barrier::new(threads);

        let records: Vec<_> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..threads)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        let handle = cache.acquire(&key, &source).unwrap();
                        assert!(handle.path().join("content/index.html").is_file());
                        let record = *handle.record();
                        record
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(source.fetches(), 1);
        assert!(records.iter().all(|r| *r == records[0]));
        assert_eq!(records[0].format, StorageFormat::WrittenAsPackage);
    }

    #[test]
    fn recent_use_skips_freshness_check() {
        let temp = TempDir::new().unwrap();
        let cache = cache(&temp);
        let source = TestSource::new(b"first");
        let key = key();

        cache.acquire_with(&key, &source, RequestedFormat::AsFile).unwrap().release();
        source.replace(b"second version");
        let handle = cache.acquire_with(&key, &source, RequestedFormat::AsFile).unwrap();

        assert_eq!(source.metadata_calls.load(Ordering::SeqCst), 0);
        assert_eq!(source.fetches(), 1);
        let file = handle.content_file().unwrap().unwrap();
        assert_eq!(fs::read(file).unwrap(), b"first");
    }

    #[test]
    fn changed_source_rebuilds_once() {
        let temp = TempDir::new().unwrap();
        let cache = cache(&temp);
        let source = TestSource::new(b"first");
        let key = key();
        let lock = key.paths(temp.path()).lock;

        cache.acquire_with(&key, &source, RequestedFormat::AsFile).unwrap().release();
        source.replace(b"second version");
        backdate(&lock, Duration::from_secs(3600));

        let handle = cache.acquire_with(&key, &source, RequestedFormat::AsFile).unwrap();
        let file = handle.content_file().unwrap().unwrap();
        assert_eq!(fs::read(file).unwrap(), b"second version");
        handle.release();
        assert_eq!(source.fetches(), 2);

        backdate(&lock, Duration::from_secs(3600));
        cache.acquire_with(&key, &source, RequestedFormat::AsFile).unwrap().release();
        assert_eq!(source.fetches(), 2);
    }

    #[test]
    fn format_switch_rebuilds_once() {
        let temp = TempDir::new().unwrap();
        let source = TestSource::new(&sample_package());
        let key = key();

        let extracting = cache(&temp);
        let handle = extracting.acquire(&key, &source).unwrap();
        assert_eq!(handle.format(), StorageFormat::WrittenAsPackage);
        handle.release();

        let mut file_settings = settings(&temp);
        file_settings.always_cache_as_file = true;
        let as_file = PackageCache::new(file_settings).unwrap();

        let handle = as_file.acquire(&key, &source).unwrap();
        assert_eq!(handle.format(), StorageFormat::WrittenAsFile);
        handle.release();
        as_file.acquire(&key, &source).unwrap().release();

        assert_eq!(source.fetches(), 2);
    }

    #[test]
    fn invalid_package_is_terminal() {
        let temp = TempDir::new().unwrap();
        let cache = cache(&temp);
        let source = TestSource::new(b"just a document");
        let key = key();
        let lock = key.paths(temp.path()).lock;

        let handle = cache.acquire(&key, &source).unwrap();
        assert!(handle.is_invalid_package());
        handle.release();

        for requested in [
            RequestedFormat::AsPackage,
            RequestedFormat::AsFile,
            RequestedFormat::AsPackage,
        ] {
            backdate(&lock, Duration::from_secs(3600));
            let handle = cache.acquire_with(&key, &source, requested).unwrap();
            assert_eq!(handle.format(), StorageFormat::InvalidPackageWrittenAsFile);
        }

        assert_eq!(source.fetches(), 1);
    }

    #[test]
    fn invalid_package_without_fallback_fails() {
        let temp = TempDir::new().unwrap();
        let mut settings = settings(&temp);
        settings.cache_invalid_package_as_file = false;
        let cache = PackageCache::new(settings).unwrap();
        let source = TestSource::new(b"just a document");
        let key = key();

        let err = cache.acquire(&key, &source).err().unwrap();

        assert!(matches!(err, CacheError::InvalidPackage { .. }));
        let paths = key.paths(temp.path());
        assert!(!paths.dir.exists());
        assert!(!paths.lock.exists());
    }

    #[test]
    fn sweep_spares_held_entries() {
        let temp = TempDir::new().unwrap();
        let mut settings = settings(&temp);
        settings.expiration = Some(Duration::from_secs(3600));
        let cache = PackageCache::new(settings).unwrap();
        let source = TestSource::new(b"data");
        let (held_key, idle_key) = (key(), key());

        cache.acquire_with(&idle_key, &source, RequestedFormat::AsFile).unwrap().release();
        let held = cache.acquire_with(&held_key, &source, RequestedFormat::AsFile).unwrap();

        backdate(&held_key.paths(temp.path()).lock, Duration::from_secs(7200));
        backdate(&idle_key.paths(temp.path()).lock, Duration::from_secs(7200));

        let report = cache.sweep();

        assert_eq!(report.evicted, 1);
        assert!(held.path().exists());
        assert!(!idle_key.paths(temp.path()).dir.exists());
        assert!(!idle_key.paths(temp.path()).lock.exists());
    }

    #[test]
    fn sweep_is_bounded() {
        let temp = TempDir::new().unwrap();
        let mut settings = settings(&temp);
        settings.expiration = Some(Duration::from_secs(3600));
        settings.max_evictions_per_sweep = 3;
        let cache = PackageCache::new(settings).unwrap();
        let source = TestSource::new(b"data");

        let keys: Vec<_> = (0..5).map(|_| key()).collect();
        for key in &keys {
            cache.acquire_with(key, &source, RequestedFormat::AsFile).unwrap().release();
        }
        for key in &keys {
            backdate(&key.paths(temp.path()).lock, Duration::from_secs(7200));
        }

        let first = cache.sweep();
        assert_eq!(first.evicted, 3);
        assert!(!first.complete);

        let second = cache.sweep();
        assert_eq!(second.evicted, 2);
        assert!(second.complete);
    }

    #[test]
    fn every_release_sweeps_other_idle_entries() {
        let temp = TempDir::new().unwrap();
        let mut settings = settings(&temp);
        settings.expiration = Some(Duration::from_secs(3600));
        let cache = PackageCache::new(settings).unwrap();
        let source = TestSource::new(b"data");
        let active = key();

        cache.acquire_with(&active, &source, RequestedFormat::AsFile).unwrap().release();

        for _ in 0..2 {
            let idle = key();
            cache.acquire_with(&idle, &source, RequestedFormat::AsFile).unwrap().release();
            let idle_paths = idle.paths(temp.path());
            backdate(&idle_paths.lock, Duration::from_secs(7200));

            cache.acquire_with(&active, &source, RequestedFormat::AsFile).unwrap().release();

            assert!(!idle_paths.dir.exists());
            assert!(!idle_paths.lock.exists());
        }
        assert!(active.paths(temp.path()).dir.exists());
    }

    #[cfg(unix)]
    #[test]
    fn timeout_carries_first_io_error() {
        let temp = TempDir::new().unwrap();
        let mut settings = settings(&temp);
        settings.acquire_timeout = Duration::from_secs(1);
        settings.poll_interval = Duration::from_millis(50);
        let cache = PackageCache::new(settings).unwrap();
        let source = TestSource::new(b"data");
        let key = key();

        // A directory squatting on the lock path can be locked but never read
        fs::create_dir(key.paths(temp.path()).lock).unwrap();

        let err = cache
            .acquire_with(&key, &source, RequestedFormat::AsFile)
            .err()
            .unwrap();

        let CacheError::LockTimeout { source: cause, .. } = &err else {
            panic!("expected a timeout, got {}", err);
        };
        assert!(cause.is_some());
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(source.fetches(), 0);
    }

    #[test]
    fn busy_lock_times_out() {
        let temp = TempDir::new().unwrap();
        let mut settings = settings(&temp);
        settings.acquire_timeout = Duration::from_secs(2);
        settings.poll_interval = Duration::from_millis(100);
        let cache = PackageCache::new(settings).unwrap();
        let source = TestSource::new(b"data");
        let key = key();

        let Attempt::Acquired(_stuck_builder) = try_claim_exclusive(&key.paths(temp.path())).unwrap()
        else {
            panic!("fresh lock must be claimable");
        };

        let started = Instant::now();
        let err = cache.acquire(&key, &source).err().unwrap();
        let elapsed = started.elapsed();

        assert!(matches!(err, CacheError::LockTimeout { .. }), "{}", err);
        assert!(err.is_retryable());
        assert!(elapsed >= Duration::from_secs(2), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(4), "{:?}", elapsed);
        assert_eq!(source.fetches(), 0);
    }

    #[test]
    fn broken_fetch_leaves_nothing_behind() {
        let temp = TempDir::new().unwrap();
        let cache = cache(&temp);
        let key = key();

        let err = cache
            .acquire_with(&key, &BrokenSource, RequestedFormat::AsFile)
            .err()
            .unwrap();

        assert!(matches!(err, CacheError::Io { .. }), "{}", err);
        let paths = key.paths(temp.path());
        assert!(!paths.dir.exists());
        assert!(!paths.lock.exists());
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn crashed_builder_is_recovered() {
        let temp = TempDir::new().unwrap();
        let cache = cache(&temp);
        let source = TestSource::new(b"data");
        let key = key();

        // A builder that died after claiming leaves an empty lock file
        let Attempt::Acquired(claim) = try_claim_exclusive(&key.paths(temp.path())).unwrap() else {
            panic!("fresh lock must be claimable");
        };
        fs::create_dir(key.paths(temp.path()).dir).unwrap();
        drop(claim);

        let handle = cache.acquire_with(&key, &source, RequestedFormat::AsFile).unwrap();
        assert_eq!(handle.format(), StorageFormat::WrittenAsFile);
        assert_eq!(source.fetches(), 1);
    }
}
