use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::http_client::ClientFactory;
use crate::metrics::Metrics;
use crate::pushkin::PushkinInstance;

/// An `apps` key: an exact app id, or a prefix glob ending in `*`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppPattern {
    Exact(String),
    Prefix(String),
}

impl AppPattern {
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some(prefix) => Self::Prefix(prefix.to_owned()),
            None => Self::Exact(pattern.to_owned()),
        }
    }

    /// Case-sensitive match against an app id.
    pub fn matches(&self, app_id: &str) -> bool {
        match self {
            Self::Exact(exact) => app_id == exact,
            Self::Prefix(prefix) => app_id.starts_with(prefix),
        }
    }

    fn is_exact(&self) -> bool {
        matches!(self, Self::Exact(_))
    }
}

/// Routes app ids to pushkin instances.
///
/// Selection is deterministic: patterns are tried in configuration order,
/// and an exact entry beats any glob regardless of where it appears.
pub struct Registry {
    entries: Vec<(AppPattern, Arc<PushkinInstance>)>,
}

impl Registry {
    /// Builds every configured pushkin. Bad credentials or key material
    /// fail here, at startup, rather than on the first notification.
    pub fn from_config(
        config: &Config,
        factory: &ClientFactory,
        metrics: &Arc<Metrics>,
    ) -> Result<Self> {
        let mut entries = Vec::with_capacity(config.apps.len());
        for (pattern, app_config) in &config.apps {
            let instance = PushkinInstance::build(pattern, app_config, factory, metrics)?;
            info!(app = %pattern, kind = instance.kind(), "configured pushkin");
            entries.push((AppPattern::parse(pattern), Arc::new(instance)));
        }
        Ok(Self { entries })
    }

    pub fn lookup(&self, app_id: &str) -> Option<&Arc<PushkinInstance>> {
        self.entries
            .iter()
            .filter(|(pattern, _)| pattern.is_exact())
            .chain(self.entries.iter().filter(|(pattern, _)| !pattern.is_exact()))
            .find(|(pattern, _)| pattern.matches(app_id))
            .map(|(_, instance)| instance)
    }

    pub fn instances(&self) -> impl Iterator<Item = &Arc<PushkinInstance>> {
        self.entries.iter().map(|(_, instance)| instance)
    }
}
