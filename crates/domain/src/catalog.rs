use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use config::{Config, File, FileFormat};
use evalhub_shared::error::DomainError;
use evalhub_shared::providers::{BenchmarkResource, EnvVar, ProviderResource};

/// Provider definitions loaded once at startup.
///
/// Shared behind an `Arc` by every request handler; nothing mutates it after
/// construction, so reads need no locking.
#[derive(Debug, Default)]
pub struct ProviderCatalog {
    providers: Vec<Arc<ProviderResource>>,
    index: HashMap<String, usize>,
}

impl ProviderCatalog {
    pub fn new(providers: Vec<ProviderResource>) -> Result<Self, DomainError> {
        let mut index = HashMap::with_capacity(providers.len());
        for (position, provider) in providers.iter().enumerate() {
            validate(provider)?;
            if index.insert(provider.provider_id.clone(), position).is_some() {
                return Err(DomainError::Validation(format!(
                    "duplicate provider id {}",
                    provider.provider_id
                )));
            }
        }

        Ok(Self {
            providers: providers.into_iter().map(Arc::new).collect(),
            index,
        })
    }

    /// Loads every `*.yaml`/`*.yml` file in `dir`, one provider per file.
    /// Catalog order follows file names.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, DomainError> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir).map_err(|err| {
            DomainError::Validation(format!(
                "cannot read provider config dir {}: {err}",
                dir.display()
            ))
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some("yaml" | "yml")
                )
            })
            .collect();
        paths.sort();

        let providers = paths
            .iter()
            .map(|path| load_file(path))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(
            dir = %dir.display(),
            count = providers.len(),
            "loaded provider catalog"
        );
        let catalog = Self::new(providers)?;
        if catalog.is_empty() {
            tracing::warn!(
                dir = %dir.display(),
                "no provider definitions found, every run request will be rejected"
            );
        }
        Ok(catalog)
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<ProviderResource>> {
        self.index
            .get(provider_id)
            .map(|position| self.providers[*position].clone())
    }

    pub fn list(&self) -> &[Arc<ProviderResource>] {
        &self.providers
    }

    /// Known provider ids in catalog order. Linear in catalog size, which is
    /// fine for the handful of providers a deployment declares.
    pub fn ids(&self) -> Vec<String> {
        self.providers
            .iter()
            .map(|provider| provider.provider_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Looks up a benchmark offered by a provider, reporting the valid ids on a miss.
    pub fn resolve_benchmark(
        &self,
        provider_id: &str,
        benchmark_id: &str,
    ) -> Result<(Arc<ProviderResource>, BenchmarkResource), DomainError> {
        let provider = self
            .get(provider_id)
            .ok_or_else(|| DomainError::ProviderNotFound {
                provider_id: provider_id.to_string(),
                supported_providers: self.ids(),
            })?;

        let benchmark = provider
            .benchmark(benchmark_id)
            .cloned()
            .ok_or_else(|| DomainError::BenchmarkNotFound {
                provider_id: provider_id.to_string(),
                benchmark_id: benchmark_id.to_string(),
                supported_benchmarks: provider.benchmark_ids(),
            })?;

        Ok((provider, benchmark))
    }
}

fn load_file(path: &Path) -> Result<ProviderResource, DomainError> {
    Config::builder()
        .add_source(File::from(path).format(FileFormat::Yaml))
        .build()
        .and_then(|config| config.try_deserialize())
        .map_err(|err| DomainError::Validation(format!("{}: {err}", path.display())))
}

fn validate(provider: &ProviderResource) -> Result<(), DomainError> {
    let id = provider.provider_id.trim();
    if id.is_empty() {
        return Err(DomainError::Validation("provider_id must not be empty".into()));
    }
    if provider.runtime.image.trim().is_empty() {
        return Err(DomainError::Validation(format!(
            "provider {id}: runtime.image must not be empty"
        )));
    }
    ensure_unique_env(&provider.runtime.env, &format!("provider {id} runtime"))?;

    let mut seen = HashSet::new();
    for benchmark in &provider.benchmarks {
        if benchmark.benchmark_id.trim().is_empty() {
            return Err(DomainError::Validation(format!(
                "provider {id}: benchmark_id must not be empty"
            )));
        }
        if !seen.insert(benchmark.benchmark_id.as_str()) {
            return Err(DomainError::Validation(format!(
                "provider {id}: duplicate benchmark {}",
                benchmark.benchmark_id
            )));
        }
        ensure_unique_env(
            &benchmark.env,
            &format!("provider {id} benchmark {}", benchmark.benchmark_id),
        )?;
    }
    Ok(())
}

fn ensure_unique_env(env: &[EnvVar], context: &str) -> Result<(), DomainError> {
    let mut names = HashSet::new();
    for var in env {
        if var.name.is_empty() {
            return Err(DomainError::Validation(format!(
                "{context}: env var with empty name"
            )));
        }
        if !names.insert(var.name.as_str()) {
            return Err(DomainError::Validation(format!(
                "{context}: duplicate env var {}",
                var.name
            )));
        }
    }
    Ok(())
}
