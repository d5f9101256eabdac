//! nginx configuration collector
//!
//! The configuration grammar lives behind [`ConfigInspector`]. The collector only decides when
//! to parse (file/directory inventory changed), what to report, and when a changed checksum
//! means the entity has to be rebuilt.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, error, info};

use super::{Collector, guard};
use crate::entity::sinks::EventLevel;
use crate::entity::{ConfigBaseline, Entity};

/// Files and directories making up a configuration, with their size and mtime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConfigStructure {
    pub files: BTreeMap<String, FileStamp>,
    pub dirs: BTreeMap<String, FileStamp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileStamp {
    pub size: u64,
    pub mtime: u64,
}

impl ConfigStructure {
    pub fn digest(&self) -> String {
        let serialized = serde_json::to_string(self).unwrap_or_default();
        format!("{:x}", Sha256::digest(serialized.as_bytes()))
    }

    pub fn total_size(&self) -> u64 {
        self.files.values().map(|stamp| stamp.size).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedConfig {
    pub root: String,
    pub tree: Value,
    pub checksum: String,
    pub errors: Vec<String>,
}

/// Outcome of `nginx -t`
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigTest {
    pub took: Duration,
    pub errors: Vec<String>,
}

#[async_trait]
pub trait ConfigInspector: Send + Sync {
    fn collect_structure(&self) -> anyhow::Result<ConfigStructure>;

    fn full_parse(&self) -> anyhow::Result<ParsedConfig>;

    async fn run_test(&self) -> anyhow::Result<ConfigTest>;
}

fn stamp(path: &Path) -> anyhow::Result<FileStamp> {
    let metadata =
        std::fs::metadata(path).with_context(|| format!("failed to stat {}", path.display()))?;
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |since| since.as_secs());

    Ok(FileStamp {
        size: metadata.len(),
        mtime,
    })
}

/// Inventory of the main config file and the `*.conf` files next to it
///
/// Stands in for a full grammar parser: the checksum covers file contents, the only error it
/// detects is unbalanced braces.
pub struct FsConfigInspector {
    bin_path: PathBuf,
    conf_path: PathBuf,
    test_timeout: Duration,
}

impl FsConfigInspector {
    pub fn new(bin_path: impl Into<PathBuf>, conf_path: impl Into<PathBuf>, test_timeout: Duration) -> Self {
        Self {
            bin_path: bin_path.into(),
            conf_path: conf_path.into(),
            test_timeout,
        }
    }

    fn config_files(&self) -> anyhow::Result<Vec<PathBuf>> {
        let mut files = vec![self.conf_path.clone()];

        for dir in self.config_dirs() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "conf") && path != self.conf_path {
                    files.push(path);
                }
            }
        }

        files.sort();
        files.dedup();
        Ok(files)
    }

    fn config_dirs(&self) -> Vec<PathBuf> {
        let Some(root) = self.conf_path.parent() else {
            return Vec::new();
        };
        [root.to_path_buf(), root.join("conf.d")]
            .into_iter()
            .filter(|dir| dir.is_dir())
            .collect()
    }
}

fn brace_errors(path: &Path, content: &str) -> Vec<String> {
    let mut depth: i64 = 0;
    for (number, line) in content.lines().enumerate() {
        let line = line.split('#').next().unwrap_or_default();
        for c in line.chars() {
            match c {
                '{' => depth += 1,
                '}' => depth -= 1,
                _ => {}
            }
            if depth < 0 {
                return vec![format!(
                    "unexpected \"}}\" in {}:{}",
                    path.display(),
                    number + 1
                )];
            }
        }
    }

    if depth > 0 {
        vec![format!("unexpected end of file, expecting \"}}\" in {}", path.display())]
    } else {
        Vec::new()
    }
}

#[async_trait]
impl ConfigInspector for FsConfigInspector {
    fn collect_structure(&self) -> anyhow::Result<ConfigStructure> {
        let mut structure = ConfigStructure::default();

        for file in self.config_files()? {
            structure
                .files
                .insert(file.display().to_string(), stamp(&file)?);
        }
        for dir in self.config_dirs() {
            structure.dirs.insert(dir.display().to_string(), stamp(&dir)?);
        }

        Ok(structure)
    }

    fn full_parse(&self) -> anyhow::Result<ParsedConfig> {
        let mut hasher = Sha256::new();
        let mut errors = Vec::new();
        let mut files = serde_json::Map::new();

        for file in self.config_files()? {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            hasher.update(file.display().to_string().as_bytes());
            hasher.update(content.as_bytes());
            errors.extend(brace_errors(&file, &content));
            files.insert(
                file.display().to_string(),
                json!({ "lines": content.lines().count() }),
            );
        }

        Ok(ParsedConfig {
            root: self.conf_path.display().to_string(),
            tree: json!({ "files": files }),
            checksum: format!("{:x}", hasher.finalize()),
            errors,
        })
    }

    async fn run_test(&self) -> anyhow::Result<ConfigTest> {
        let start = Instant::now();
        let output = tokio::time::timeout(
            self.test_timeout,
            Command::new(&self.bin_path)
                .arg("-t")
                .arg("-c")
                .arg(&self.conf_path)
                .output(),
        )
        .await
        .context("config test timed out")?
        .with_context(|| format!("failed to run {} -t", self.bin_path.display()))?;

        let errors = String::from_utf8_lossy(&output.stderr)
            .lines()
            .filter(|line| line.contains("[emerg]") || line.contains("[error]"))
            .map(str::to_string)
            .collect();

        Ok(ConfigTest {
            took: start.elapsed(),
            errors,
        })
    }
}

/// Largest config (in bytes) we still run `nginx -t` against
const MAX_TEST_SIZE: u64 = 20 * 1024 * 1024;

pub struct NginxConfigCollector {
    inspector: Box<dyn ConfigInspector>,
    interval: Duration,
    upload_config: bool,
    run_test: bool,
    max_test_duration: Duration,
}

impl NginxConfigCollector {
    pub fn new(inspector: Box<dyn ConfigInspector>, interval: Duration) -> Self {
        Self {
            inspector,
            interval,
            upload_config: false,
            run_test: false,
            max_test_duration: Duration::from_secs(30),
        }
    }

    pub fn upload_config(mut self, upload: bool) -> Self {
        self.upload_config = upload;
        self
    }

    pub fn run_test(mut self, run_test: bool, max_duration: Duration) -> Self {
        self.run_test = run_test;
        self.max_test_duration = max_duration;
        self
    }

    async fn test(&mut self, entity: &Entity, structure: &ConfigStructure) {
        if !self.run_test || structure.total_size() >= MAX_TEST_SIZE {
            return;
        }

        let result = self.inspector.run_test().await;
        let Some(test) = guard(entity, "config test", result, None) else {
            return;
        };

        if test.errors.is_empty() {
            entity.event(EventLevel::Info, "nginx config tested ok");
        } else {
            entity.event(EventLevel::Warning, "nginx config test failed");
            for error in test.errors {
                entity.event(EventLevel::Critical, error);
            }
        }

        if test.took > self.max_test_duration {
            self.run_test = false;
            entity.event(
                EventLevel::Warning,
                format!(
                    "nginx config test took {:.1} seconds, disabled until agent restart",
                    test.took.as_secs_f64()
                ),
            );
        }
    }

    fn parse_failed(entity: &Entity, error: anyhow::Error) {
        let conf_path = entity
            .nginx_details()
            .map(|details| details.conf_path.clone())
            .unwrap_or_default();
        error!(
            "failed to parse config for {}: {error:#}",
            entity.definition_hash().short()
        );
        entity.onetime_event(
            EventLevel::Info,
            format!("nginx config parser failed, path {conf_path}"),
        );
    }
}

#[async_trait]
impl Collector for NginxConfigCollector {
    fn short_name(&self) -> &'static str {
        "nginx_config"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn collect(&mut self, entity: &Entity) {
        let structure = match self.inspector.collect_structure() {
            Ok(structure) => structure,
            Err(e) => return Self::parse_failed(entity, e),
        };
        let digest = structure.digest();

        let baseline = entity.config_baseline().unwrap_or_default();
        if baseline.structure.as_deref() == Some(digest.as_str()) {
            return;
        }

        let parsed = match self.inspector.full_parse() {
            Ok(parsed) => parsed,
            Err(e) => return Self::parse_failed(entity, e),
        };

        entity.event(
            EventLevel::Info,
            format!("nginx config parsed, read from {}", parsed.root),
        );
        for error in &parsed.errors {
            entity.event(EventLevel::Warning, error.clone());
        }

        if self.upload_config {
            let payload = json!({
                "root": parsed.root,
                "tree": parsed.tree,
                "files": structure.files,
                "directories": structure.dirs,
                "errors": { "parser": parsed.errors.len() },
            });
            entity.config(payload, parsed.checksum.clone());
        }

        match &baseline.checksum {
            Some(previous) if *previous != parsed.checksum => {
                info!(
                    "config of {} changed, object restart needed",
                    entity.definition_hash().short()
                );
                entity.set_need_restart();
            }
            Some(_) => debug!("config structure changed, content did not"),
            None => self.test(entity, &structure).await,
        }

        entity.set_config_baseline(ConfigBaseline {
            structure: Some(digest),
            checksum: Some(parsed.checksum),
        });
    }
}
