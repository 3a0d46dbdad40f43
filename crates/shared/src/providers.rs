use serde::{Deserialize, Serialize};

/// An evaluation provider as declared in its YAML config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResource {
    pub provider_id: String,
    pub provider_name: String,
    #[serde(default)]
    pub description: String,
    pub provider_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub benchmarks: Vec<BenchmarkResource>,
    /// Job template; internal only, never returned to API clients.
    #[serde(skip_serializing)]
    pub runtime: ProviderRuntime,
}

impl ProviderResource {
    pub fn benchmark(&self, benchmark_id: &str) -> Option<&BenchmarkResource> {
        self.benchmarks
            .iter()
            .find(|benchmark| benchmark.benchmark_id == benchmark_id)
    }

    pub fn benchmark_ids(&self) -> Vec<String> {
        self.benchmarks
            .iter()
            .map(|benchmark| benchmark.benchmark_id.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResource {
    pub benchmark_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<String>,
    /// Overrides applied on top of the provider runtime's env.
    #[serde(default, skip_serializing)]
    pub env: Vec<EnvVar>,
}

/// Container template used to build every job a provider runs.
///
/// Resource quantities are kept as opaque strings (`"250m"`, `"2Gi"`); the
/// backend decides how to interpret them.
///
/// ```yaml
/// runtime:
///   image: "quay.io/eval-hub/adapter:latest"
///   entrypoint: "/path/to/program"
///   cpu_request: "250m"
///   memory_request: "512Mi"
///   cpu_limit: "1"
///   memory_limit: "2Gi"
///   env:
///     - name: FOO
///       value: "bar"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderRuntime {
    pub image: String,
    #[serde(default)]
    pub entrypoint: String,
    #[serde(default)]
    pub cpu_request: String,
    #[serde(default)]
    pub memory_request: String,
    #[serde(default)]
    pub cpu_limit: String,
    #[serde(default)]
    pub memory_limit: String,
    #[serde(default, alias = "default_env")]
    pub env: Vec<EnvVar>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderResourceList {
    pub total_count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<ProviderResource>,
}
