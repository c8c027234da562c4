//! Concurrent resolver with TTL caches.
//!
//! Script generation, image lookup and sizing run as separate blocking tasks
//! in a [`JoinSet`]. The whole resolution is bounded by one timeout; when it
//! fires, or any task fails, the set is dropped. Tasks that have not started
//! are aborted; running ones finish and their results are discarded.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::error::{TemplateError, TemplateResult};
use crate::manifest::{
    Architecture, ImageMap, PackageDefinitions, ServiceConfig, Template, UserConfig,
};
use crate::package_manager::PackageManager;
use crate::resolver::{
    assemble, costs, instance_types, ports, ResolveOptions, ResolvedConfiguration,
    TemplateResolver,
};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(120);

/// Results the collector waits for: script, images, sizing.
const EXPECTED_RESULTS: usize = 3;

/// Template name and a fingerprint of everything the script is built from.
type ScriptKey = (String, u64);
type ImageKey = (String, String, Architecture);

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    inserted: Instant,
}

impl<T: Clone> CacheEntry<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            inserted: Instant::now(),
        }
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.inserted.elapsed() < ttl
    }
}

type Cache<K, V> = Arc<DashMap<K, CacheEntry<V>>>;

fn cached<K, V>(
    cache: &DashMap<K, CacheEntry<V>>,
    key: K,
    ttl: Duration,
    compute: impl FnOnce() -> TemplateResult<V>,
) -> TemplateResult<V>
where
    K: std::hash::Hash + Eq,
    V: Clone,
{
    if let Some(entry) = cache.get(&key) {
        if entry.is_fresh(ttl) {
            return Ok(entry.value.clone());
        }
    }
    let value = compute()?;
    cache.insert(key, CacheEntry::new(value.clone()));
    Ok(value)
}

#[derive(Serialize)]
struct ScriptInputs<'a> {
    name: &'a str,
    manager: PackageManager,
    packages: &'a PackageDefinitions,
    users: &'a [UserConfig],
    services: &'a [ServiceConfig],
    post_install: &'a str,
    user_data: &'a str,
}

/// Cache key for a template's script, or `None` when it cannot be
/// fingerprinted.
fn script_key(template: &Template, manager: PackageManager) -> Option<ScriptKey> {
    let inputs = ScriptInputs {
        name: &template.name,
        manager,
        packages: &template.packages,
        users: &template.users,
        services: &template.services,
        post_install: &template.post_install,
        user_data: &template.user_data,
    };
    let bytes = serde_json::to_vec(&inputs).ok()?;
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    Some((template.name.clone(), hasher.finish()))
}

/// Entry counts of the caches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub scripts: usize,
    pub images: usize,
}

enum Partial {
    Script(String),
    Images(ImageMap),
    Sizing {
        instance_type: BTreeMap<String, String>,
        ports: Vec<u16>,
        costs: BTreeMap<String, f64>,
    },
}

#[derive(Default)]
struct Collected {
    script: Option<String>,
    images: Option<ImageMap>,
    sizing: Option<(BTreeMap<String, String>, Vec<u16>, BTreeMap<String, f64>)>,
}

/// Resolver running independent steps concurrently.
#[derive(Clone)]
pub struct OptimizedResolver {
    resolver: TemplateResolver,
    scripts: Cache<ScriptKey, String>,
    images: Cache<ImageKey, ImageMap>,
    ttl: Duration,
    timeout: Duration,
}

impl OptimizedResolver {
    pub fn new(resolver: TemplateResolver) -> Self {
        Self {
            resolver,
            scripts: Arc::new(DashMap::new()),
            images: Arc::new(DashMap::new()),
            ttl: DEFAULT_CACHE_TTL,
            timeout: DEFAULT_RESOLVE_TIMEOUT,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn resolver(&self) -> &TemplateResolver {
        &self.resolver
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolve a template, running the independent steps concurrently.
    pub async fn resolve(
        &self,
        template: &Template,
        region: &str,
        arch: Architecture,
        options: &ResolveOptions,
    ) -> TemplateResult<ResolvedConfiguration> {
        let started = Instant::now();
        let (prepared, manager) = self.resolver.prepare(template, options)?;
        let prepared = Arc::new(prepared);

        let mut tasks: JoinSet<TemplateResult<Partial>> = JoinSet::new();

        {
            let resolver = self.resolver.clone();
            let cache = Arc::clone(&self.scripts);
            let template = Arc::clone(&prepared);
            let ttl = self.ttl;
            tasks.spawn_blocking(move || {
                let script = match script_key(&template, manager) {
                    Some(key) => cached(&cache, key, ttl, || {
                        resolver.provisioning_script(&template, manager)
                    })?,
                    None => resolver.provisioning_script(&template, manager)?,
                };
                Ok(Partial::Script(script))
            });
        }

        {
            let resolver = self.resolver.clone();
            let cache = Arc::clone(&self.images);
            let template = Arc::clone(&prepared);
            let region = region.to_string();
            let os_version = options.os_version.clone();
            let ttl = self.ttl;
            tasks.spawn_blocking(move || {
                if let Some(map) = resolver.direct_image_map(&template, &region, arch)? {
                    return Ok(Partial::Images(map));
                }
                let base = resolver.base_image(&template, &region, arch, os_version.as_deref())?;
                let key = (format!("{}-{}", base.distro, base.version), region, arch);
                let map = cached(&cache, key, ttl, || resolver.catalog_images(&base))?;
                Ok(Partial::Images(map))
            });
        }

        {
            let template = Arc::clone(&prepared);
            let size = options.size();
            tasks.spawn_blocking(move || {
                let instance_type = instance_types(&template, size);
                let ports = ports(&template);
                let costs = costs(&template, &instance_type);
                Ok(Partial::Sizing {
                    instance_type,
                    ports,
                    costs,
                })
            });
        }

        let collected = tokio::time::timeout(self.timeout, collect(&mut tasks))
            .await
            .map_err(|_| TemplateError::Timeout(self.timeout))??;
        drop(tasks);

        let script = collected
            .script
            .ok_or_else(|| TemplateError::TaskFailed("script task produced no result".into()))?;
        let images = collected
            .images
            .ok_or_else(|| TemplateError::TaskFailed("image task produced no result".into()))?;
        let (instance_type, ports, costs) = collected
            .sizing
            .ok_or_else(|| TemplateError::TaskFailed("sizing task produced no result".into()))?;

        info!(
            "Resolved template '{}' for {}/{} in {:?}",
            template.name,
            region,
            arch,
            started.elapsed()
        );
        Ok(assemble(
            &prepared,
            manager,
            script,
            images,
            instance_type,
            ports,
            costs,
        ))
    }

    /// Drop every cached script and image map.
    pub fn clear_cache(&self) {
        self.scripts.clear();
        self.images.clear();
        debug!("Cleared resolver caches");
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            scripts: self.scripts.len(),
            images: self.images.len(),
        }
    }

    /// Remove entries older than the TTL. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.scripts.len() + self.images.len();
        self.scripts.retain(|_, entry| entry.is_fresh(self.ttl));
        self.images.retain(|_, entry| entry.is_fresh(self.ttl));
        before - (self.scripts.len() + self.images.len())
    }
}

async fn collect(tasks: &mut JoinSet<TemplateResult<Partial>>) -> TemplateResult<Collected> {
    let mut collected = Collected::default();
    let mut received = 0;
    while received < EXPECTED_RESULTS {
        let Some(joined) = tasks.join_next().await else {
            break;
        };
        let partial = joined.map_err(|e| TemplateError::TaskFailed(e.to_string()))??;
        match partial {
            Partial::Script(script) => collected.script = Some(script),
            Partial::Images(images) => collected.images = Some(images),
            Partial::Sizing {
                instance_type,
                ports,
                costs,
            } => collected.sizing = Some((instance_type, ports, costs)),
        }
        received += 1;
    }
    Ok(collected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::{ImageCatalog, MockPrebuiltImageSource};
    use crate::manifest::{ServiceConfig, UserConfig};

    fn optimized() -> OptimizedResolver {
        OptimizedResolver::new(TemplateResolver::new(Arc::new(
            ImageCatalog::builtin().unwrap(),
        )))
    }

    fn template() -> Template {
        let mut t = Template {
            name: "Test".into(),
            slug: "test".into(),
            description: "test".into(),
            base: "ubuntu-22.04".into(),
            package_manager: Some("apt".into()),
            ..Default::default()
        };
        t.packages.system = vec!["git".into()];
        t.services.push(ServiceConfig {
            name: "nginx".into(),
            port: 80,
            enable: Some(true),
            ..Default::default()
        });
        t.instance_defaults.ports = vec![8080];
        t.users.push(UserConfig {
            name: "researcher".into(),
            ..Default::default()
        });
        t
    }

    #[tokio::test]
    async fn test_matches_sequential_resolution() {
        let optimized = optimized();
        let t = template();
        let concurrent = optimized
            .resolve(&t, "us-east-1", Architecture::X86_64, &ResolveOptions::new())
            .await
            .unwrap();
        let sequential = optimized
            .resolver()
            .resolve(&t, "us-east-1", Architecture::X86_64, &ResolveOptions::new())
            .unwrap();

        assert_eq!(concurrent.ports, vec![22, 80, 8080]);
        assert_eq!(concurrent.ports, sequential.ports);
        assert_eq!(concurrent.ami, sequential.ami);
        assert_eq!(concurrent.instance_type, sequential.instance_type);
        assert_eq!(concurrent.estimated_cost_per_hour, sequential.estimated_cost_per_hour);
        assert_eq!(concurrent.idle_detection, sequential.idle_detection);
        assert!(concurrent.user_data.contains("apt-get install -y git"));
    }

    #[tokio::test]
    async fn test_cache_reused_until_cleared() {
        let optimized = optimized();
        let t = template();
        let opts = ResolveOptions::new();

        let first = optimized
            .resolve(&t, "us-east-1", Architecture::X86_64, &opts)
            .await
            .unwrap();
        assert_eq!(optimized.cache_stats(), CacheStats { scripts: 1, images: 1 });

        // Generated passwords differ per generation, so equal scripts mean a
        // cache hit.
        let second = optimized
            .resolve(&t, "us-east-1", Architecture::X86_64, &opts)
            .await
            .unwrap();
        assert_eq!(first.user_data, second.user_data);

        optimized.clear_cache();
        assert_eq!(optimized.cache_stats(), CacheStats::default());
        let third = optimized
            .resolve(&t, "us-east-1", Architecture::X86_64, &opts)
            .await
            .unwrap();
        assert_ne!(first.user_data, third.user_data);
    }

    #[tokio::test]
    async fn test_expired_entries_recomputed_and_purged() {
        let optimized = optimized().with_ttl(Duration::ZERO);
        let t = template();
        let opts = ResolveOptions::new();

        let first = optimized
            .resolve(&t, "us-east-1", Architecture::X86_64, &opts)
            .await
            .unwrap();
        let second = optimized
            .resolve(&t, "us-east-1", Architecture::X86_64, &opts)
            .await
            .unwrap();
        assert_ne!(first.user_data, second.user_data);

        assert_eq!(optimized.purge_expired(), 2);
        assert_eq!(optimized.cache_stats(), CacheStats::default());
    }

    #[tokio::test]
    async fn test_parameter_values_get_separate_scripts() {
        let optimized = optimized();
        let mut t = template();
        t.packages.system = vec!["python{{py}}".into()];
        t.parameters.insert("py".into(), Default::default());

        for (value, expected) in [("3.11", "python3.11"), ("3.12", "python3.12")] {
            let config = optimized
                .resolve(
                    &t,
                    "us-east-1",
                    Architecture::X86_64,
                    &ResolveOptions::new().with_parameter("py", value),
                )
                .await
                .unwrap();
            assert!(config.user_data.contains(expected));
        }
        assert_eq!(optimized.cache_stats().scripts, 2);
        assert_eq!(optimized.cache_stats().images, 1);
    }

    #[tokio::test]
    async fn test_templates_sharing_a_slug_keep_their_own_scripts() {
        let optimized = optimized();
        let mut ubuntu = template();
        ubuntu.name = "Ubuntu".into();
        ubuntu.slug = "ubuntu".into();
        let mut basic = template();
        basic.name = "Basic Ubuntu".into();
        basic.slug = "ubuntu".into();
        basic.packages.system = vec!["htop".into()];

        let opts = ResolveOptions::new();
        let first = optimized
            .resolve(&ubuntu, "us-east-1", Architecture::X86_64, &opts)
            .await
            .unwrap();
        let second = optimized
            .resolve(&basic, "us-east-1", Architecture::X86_64, &opts)
            .await
            .unwrap();

        assert!(first.user_data.contains("apt-get install -y git"));
        assert!(second.user_data.contains("apt-get install -y htop"));
        assert!(!second.user_data.contains("apt-get install -y git"));
        assert_eq!(optimized.cache_stats().scripts, 2);
    }

    #[test]
    fn test_script_key_tracks_script_inputs() {
        let t = template();
        let key = script_key(&t, PackageManager::Apt).unwrap();
        assert_eq!(key, script_key(&t, PackageManager::Apt).unwrap());
        assert_ne!(key, script_key(&t, PackageManager::Dnf).unwrap());

        let mut changed = t.clone();
        changed.post_install = "echo hi".into();
        assert_ne!(key, script_key(&changed, PackageManager::Apt).unwrap());

        let mut described = t.clone();
        described.description = "other".into();
        assert_eq!(key, script_key(&described, PackageManager::Apt).unwrap());
    }

    #[tokio::test]
    async fn test_failed_step_aborts_resolution() {
        let err = optimized()
            .resolve(&template(), "mars-north-1", Architecture::X86_64, &ResolveOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TemplateError::UnsupportedRegion { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeout() {
        let mut source = MockPrebuiltImageSource::new();
        source.expect_images_for().returning(|_| {
            std::thread::sleep(Duration::from_millis(1000));
            None
        });
        let resolver = TemplateResolver::new(Arc::new(ImageCatalog::builtin().unwrap()))
            .with_prebuilt(Arc::new(source));
        let optimized = OptimizedResolver::new(resolver).with_timeout(Duration::from_millis(50));

        let err = optimized
            .resolve(&template(), "us-east-1", Architecture::X86_64, &ResolveOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TemplateError::Timeout(d) if d == Duration::from_millis(50)));
    }
}
