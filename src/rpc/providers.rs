//! RPC provider configuration
//!
//! Loaded from a YAML file (default `rpc-providers.yml`):
//!
//! ```yaml
//! providers:
//!   - name: helius
//!     chain: solana
//!     url: https://mainnet.helius-rpc.com/?api-key={{api_key}}
//!     interval: 1000
//!     require:
//!       api_key: HELIUS_API_KEY
//! defaults:
//!   max_calls_per_provider: 10
//!   max_calls_per_provider_interval: 5
//!   target_chain: solana
//! ```
//!
//! `{{var}}` placeholders are filled from the environment variable named in
//! `require`. A provider whose variables are missing is dropped with a warning;
//! only an empty active set for the target chain is an error.

use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Lowest accepted polling interval for a provider.
pub const MIN_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEntry {
    pub name: String,
    pub chain: String,
    pub url: String,
    /// Polling interval in milliseconds.
    pub interval: u64,
    #[serde(default)]
    pub require: BTreeMap<String, String>,
    /// Minimum spacing between two calls to this provider, in milliseconds.
    /// Falls back to the limiter default when absent.
    #[serde(default)]
    pub spacing_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderDefaults {
    /// Number of polling cycles each provider runs per invocation.
    pub max_calls_per_provider: u32,
    /// Calls pulled from the ledger per cycle.
    pub max_calls_per_provider_interval: usize,
    pub target_chain: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderFile {
    pub providers: Vec<ProviderEntry>,
    pub defaults: ProviderDefaults,
}

/// A validated provider with its URL fully resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Provider {
    pub name: String,
    pub chain: String,
    pub url: String,
    pub interval: Duration,
    pub max_cycles: u32,
    pub max_calls_per_cycle: usize,
    pub spacing: Option<Duration>,
}

impl ProviderFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let file: ProviderFile = serde_yaml::from_str(yaml)?;
        file.validate()?;
        Ok(file)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            return Err(ConfigError::InvalidValue(
                "at least one RPC provider must be configured".to_string(),
            ));
        }

        for provider in &self.providers {
            if provider.name.is_empty() || provider.chain.is_empty() || provider.url.is_empty() {
                return Err(ConfigError::InvalidValue(format!(
                    "provider missing required fields: {:?}",
                    provider
                )));
            }
            if provider.interval < MIN_INTERVAL_MS {
                return Err(ConfigError::InvalidValue(format!(
                    "provider interval too low (minimum {}ms): {}",
                    MIN_INTERVAL_MS, provider.name
                )));
            }
        }

        if self.defaults.target_chain.is_empty() {
            return Err(ConfigError::InvalidValue(
                "defaults.target_chain must be specified".to_string(),
            ));
        }

        Ok(())
    }

    /// Resolve the providers for `chain`, reading template values through `lookup`.
    ///
    /// `max_cycles` / `max_calls_per_cycle` override the file defaults when given.
    pub fn active_providers<F>(
        &self,
        chain: &str,
        max_cycles: Option<u32>,
        max_calls_per_cycle: Option<usize>,
        lookup: F,
    ) -> Result<Vec<Provider>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let max_cycles = max_cycles.unwrap_or(self.defaults.max_calls_per_provider);
        let max_calls_per_cycle =
            max_calls_per_cycle.unwrap_or(self.defaults.max_calls_per_provider_interval);

        let active: Vec<Provider> = self
            .providers
            .iter()
            .filter(|p| p.chain == chain)
            .filter_map(|p| {
                let url = resolve_url(p, &lookup)?;
                Some(Provider {
                    name: p.name.clone(),
                    chain: p.chain.clone(),
                    url,
                    interval: Duration::from_millis(p.interval),
                    max_cycles,
                    max_calls_per_cycle,
                    spacing: p.spacing_ms.map(Duration::from_millis),
                })
            })
            .collect();

        if active.is_empty() {
            return Err(ConfigError::NoActiveProviders(chain.to_string()));
        }
        Ok(active)
    }
}

/// Substitute `{{var}}` placeholders. Returns None (after logging) when the
/// provider has to be skipped.
fn resolve_url<F>(provider: &ProviderEntry, lookup: &F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut url = provider.url.clone();
    let mut missing = Vec::new();

    for (template_var, env_name) in &provider.require {
        match lookup(env_name) {
            Some(value) if !value.is_empty() => {
                url = url.replace(&format!("{{{{{}}}}}", template_var), &value);
            }
            _ => missing.push(format!("{} ({})", template_var, env_name)),
        }
    }

    if !missing.is_empty() {
        log::warn!(
            "⚠️  Skipping provider '{}' due to missing environment variables: {}",
            provider.name,
            missing.join(", ")
        );
        return None;
    }

    if let Some(start) = url.find("{{") {
        let unresolved = url[start..].split("}}").next().unwrap_or_default();
        log::warn!(
            "⚠️  Skipping provider '{}' due to unresolved template variable: {}}}}}",
            provider.name,
            unresolved
        );
        return None;
    }

    Some(url)
}
