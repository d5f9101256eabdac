//! Application context
//!
//! Everything the managers and collectors share, built once in a fixed order:
//! config → logging → host details → http client → registry → cache. Logging is initialised by
//! the binary before the context is built, since it needs the config's log level.

use std::sync::Arc;

use anyhow::Context as _;
use sysinfo::System;
use tracing::debug;

use crate::AGENT_VERSION;
use crate::cache::{DEFAULT_CAPACITY, SharedCache, SnapshotCache};
use crate::config::AgentConfig;
use crate::entity::HostInfo;
use crate::identity;
use crate::registry::{Registry, SharedRegistry};
use crate::util;

#[derive(Clone)]
pub struct AppContext {
    pub config: AgentConfig,
    pub host: HostInfo,
    pub client: reqwest::Client,
    pub registry: SharedRegistry,
    pub cache: SharedCache,
    pub environment: String,
}

impl AppContext {
    pub fn new(config: AgentConfig) -> anyhow::Result<Self> {
        let host = host_info(&config);
        debug!("running on {} ({})", host.hostname, host.uuid);

        let client = reqwest::Client::builder()
            .user_agent(format!("lookout-agent/{AGENT_VERSION}"))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            config,
            host,
            client,
            registry: Registry::shared(),
            cache: Arc::new(SnapshotCache::new(DEFAULT_CAPACITY)),
            environment: util::get_environment(),
        })
    }

    pub fn in_container(&self) -> bool {
        self.host.imagename.is_some()
    }
}

/// Host identity from credentials, the environment and the OS, in that order
pub fn host_info(config: &AgentConfig) -> HostInfo {
    let credentials = &config.credentials;

    let imagename = credentials
        .imagename
        .clone()
        .filter(|name| !name.is_empty())
        .or_else(util::get_imagename);

    let hostname = credentials
        .hostname
        .clone()
        .filter(|name| !name.is_empty())
        .or_else(System::host_name)
        .unwrap_or_else(|| "localhost".to_string());

    let uuid = credentials
        .uuid
        .clone()
        .filter(|uuid| !uuid.is_empty())
        .unwrap_or_else(|| {
            identity::hash_local("host", &hostname, imagename.as_deref().unwrap_or_default())
                .as_str()
                .to_string()
        });

    HostInfo {
        uuid,
        hostname,
        imagename,
    }
}
