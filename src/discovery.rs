//! nginx process discovery
//!
//! Discovery is split into a process table source and a binary resolver so that reconciliation
//! can be driven from fixtures. A daemonized master shows up as
//! `nginx: master process /usr/sbin/nginx -c /etc/nginx/nginx.conf` with parent pid 1, its
//! workers as children of that master.
//!
//! Paths the command line leaves out come from `<bin> -V`. A master whose paths still cannot be
//! resolved is skipped for this cycle; the other candidates are unaffected.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tokio::process::Command;
use tracing::{debug, error, trace};

use crate::entity::NginxInfo;

/// Timeout of `nginx -V`
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(2);

const DEFAULT_PREFIX: &str = "/usr/local/nginx";
const DEFAULT_CONF_PATH: &str = "conf/nginx.conf";

const MASTER_MARKER: &str = "nginx: master process";
const WORKER_MARKERS: [&str; 2] = ["nginx: worker process", "nginx: cache manager process"];

/// One row of the process table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRow {
    pub pid: u32,
    pub ppid: u32,
    pub cmd: String,
}

#[async_trait]
pub trait ProcessSource: Send + Sync {
    async fn scan(&self) -> anyhow::Result<Vec<ProcessRow>>;
}

/// `nginx -V` output for a binary
#[async_trait]
pub trait BinaryResolver: Send + Sync {
    async fn build_info(&self, bin_path: &str) -> anyhow::Result<String>;
}

#[derive(Debug, Default)]
pub struct SysinfoSource;

#[async_trait]
impl ProcessSource for SysinfoSource {
    async fn scan(&self) -> anyhow::Result<Vec<ProcessRow>> {
        tokio::task::spawn_blocking(|| {
            let mut system = System::new();
            system.refresh_processes_specifics(
                ProcessesToUpdate::All,
                true,
                ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
            );

            system
                .processes()
                .values()
                .filter(|process| process.thread_kind().is_none())
                .map(|process| ProcessRow {
                    pid: process.pid().as_u32(),
                    ppid: process.parent().map_or(0, |pid| pid.as_u32()),
                    cmd: process
                        .cmd()
                        .iter()
                        .map(|arg| arg.to_string_lossy())
                        .collect::<Vec<_>>()
                        .join(" "),
                })
                .collect()
        })
        .await
        .context("process table scan did not complete")
    }
}

/// Runs the binary with `-V` under [`RESOLVE_TIMEOUT`]
#[derive(Debug, Default)]
pub struct CommandResolver;

#[async_trait]
impl BinaryResolver for CommandResolver {
    async fn build_info(&self, bin_path: &str) -> anyhow::Result<String> {
        let output = tokio::time::timeout(RESOLVE_TIMEOUT, Command::new(bin_path).arg("-V").output())
            .await
            .with_context(|| format!("{bin_path} -V timed out"))?
            .with_context(|| format!("failed to run {bin_path} -V"))?;

        // nginx prints its build info on stderr
        let mut text = String::from_utf8_lossy(&output.stderr).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stdout));
        Ok(text)
    }
}

/// Master process command line, as far as it goes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MasterCommand {
    pub bin_path: String,
    pub conf_path: Option<String>,
    pub prefix: Option<String>,
}

pub fn parse_master_cmd(cmd: &str) -> Option<MasterCommand> {
    let rest = cmd.split_once(MASTER_MARKER)?.1;
    let mut args = rest.split_whitespace();

    let mut command = MasterCommand {
        bin_path: args.next()?.to_string(),
        ..Default::default()
    };

    while let Some(arg) = args.next() {
        match arg {
            "-c" => command.conf_path = args.next().map(str::to_string),
            "-p" => command.prefix = args.next().map(str::to_string),
            _ => {}
        }
    }

    Some(command)
}

/// Fields of interest from `nginx -V`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildInfo {
    pub version: Option<String>,
    pub prefix: Option<String>,
    pub conf_path: Option<String>,
}

pub fn parse_build_info(text: &str) -> anyhow::Result<BuildInfo> {
    let version = Regex::new(r"nginx version: nginx/(\S+)")?;
    let prefix = Regex::new(r"--prefix=(\S+)")?;
    let conf_path = Regex::new(r"--conf-path=(\S+)")?;

    let capture = |re: &Regex| {
        re.captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    };

    Ok(BuildInfo {
        version: capture(&version),
        prefix: capture(&prefix),
        conf_path: capture(&conf_path),
    })
}

/// Combine command line and build info into absolute paths
pub fn resolve_paths(command: &MasterCommand, build: &BuildInfo) -> anyhow::Result<(String, String)> {
    if !Path::new(&command.bin_path).is_absolute() {
        anyhow::bail!("binary path {} is not absolute", command.bin_path);
    }

    let prefix = command
        .prefix
        .clone()
        .or_else(|| build.prefix.clone())
        .unwrap_or_else(|| DEFAULT_PREFIX.to_string());
    let prefix = prefix.trim_end_matches('/').to_string();

    let conf_path = command
        .conf_path
        .clone()
        .or_else(|| build.conf_path.clone())
        .unwrap_or_else(|| DEFAULT_CONF_PATH.to_string());

    let conf_path = if Path::new(&conf_path).is_absolute() {
        conf_path
    } else {
        format!("{prefix}/{conf_path}")
    };

    Ok((prefix, conf_path))
}

/// Master rows with their worker pids; workers of unknown masters are dropped
pub fn group_masters(rows: &[ProcessRow]) -> BTreeMap<u32, (String, Vec<u32>)> {
    let mut masters: BTreeMap<u32, (String, Vec<u32>)> = rows
        .iter()
        .filter(|row| row.ppid == 1 && row.cmd.contains(MASTER_MARKER))
        .map(|row| (row.pid, (row.cmd.clone(), Vec::new())))
        .collect();

    for row in rows {
        if !WORKER_MARKERS.iter().any(|marker| row.cmd.contains(marker)) {
            continue;
        }
        if let Some((_, workers)) = masters.get_mut(&row.ppid) {
            workers.push(row.pid);
        }
    }

    for (_, workers) in masters.values_mut() {
        workers.sort_unstable();
    }

    masters
}

pub struct NginxDiscovery {
    source: Box<dyn ProcessSource>,
    resolver: Box<dyn BinaryResolver>,
}

impl Default for NginxDiscovery {
    fn default() -> Self {
        Self::new(Box::new(SysinfoSource), Box::new(CommandResolver))
    }
}

impl NginxDiscovery {
    pub fn new(source: Box<dyn ProcessSource>, resolver: Box<dyn BinaryResolver>) -> Self {
        Self { source, resolver }
    }

    async fn resolve(&self, pid: u32, cmd: &str, workers: Vec<u32>) -> anyhow::Result<NginxInfo> {
        let command =
            parse_master_cmd(cmd).with_context(|| format!("unexpected master command \"{cmd}\""))?;

        let build = match self.resolver.build_info(&command.bin_path).await {
            Ok(text) => parse_build_info(&text)?,
            Err(e) if command.conf_path.is_some() && command.prefix.is_some() => {
                debug!("no build info for {}: {e:#}", command.bin_path);
                BuildInfo::default()
            }
            Err(e) => return Err(e),
        };

        let (prefix, conf_path) = resolve_paths(&command, &build)?;

        Ok(NginxInfo {
            pid,
            workers,
            version: build.version,
            bin_path: command.bin_path,
            conf_path,
            prefix,
        })
    }

    /// Every resolvable master currently running
    ///
    /// Fails only when the process table itself cannot be read.
    pub async fn discover(&self) -> anyhow::Result<Vec<NginxInfo>> {
        let rows = self.source.scan().await?;
        let masters = group_masters(&rows);
        trace!("found {} nginx master processes", masters.len());

        let mut found = Vec::with_capacity(masters.len());
        for (pid, (cmd, workers)) in masters {
            match self.resolve(pid, &cmd, workers).await {
                Ok(info) => found.push(info),
                Err(e) => error!("failed to find bin_path, prefix and conf_path for {cmd}: {e:#}"),
            }
        }

        Ok(found)
    }
}
