//! Template usage statistics.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{TemplateError, TemplateResult};

/// Launch counters for one template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateUsage {
    pub launch_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_launched: Option<DateTime<Utc>>,
    #[serde(default)]
    pub regions: BTreeMap<String, u64>,
    #[serde(default)]
    pub instance_types: BTreeMap<String, u64>,
}

/// Records template launches. Shared by handle; persisted only on
/// [`save`](StatsCollector::save).
#[derive(Debug, Default)]
pub struct StatsCollector {
    usage: Mutex<BTreeMap<String, TemplateUsage>>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_launch(&self, template: &str, region: &str, instance_type: &str) {
        self.record_launch_at(template, region, instance_type, Utc::now());
    }

    pub fn record_launch_at(
        &self,
        template: &str,
        region: &str,
        instance_type: &str,
        at: DateTime<Utc>,
    ) {
        let mut usage = self.usage.lock();
        let entry = usage.entry(template.to_string()).or_default();
        entry.launch_count += 1;
        entry.last_launched = Some(at);
        *entry.regions.entry(region.to_string()).or_default() += 1;
        *entry
            .instance_types
            .entry(instance_type.to_string())
            .or_default() += 1;
        debug!("Recorded launch #{} of {}", entry.launch_count, template);
    }

    pub fn usage(&self, template: &str) -> Option<TemplateUsage> {
        self.usage.lock().get(template).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, TemplateUsage> {
        self.usage.lock().clone()
    }

    /// Templates ordered by launch count, most used first.
    pub fn most_used(&self, limit: usize) -> Vec<(String, u64)> {
        let mut ranked: Vec<(String, u64)> = self
            .usage
            .lock()
            .iter()
            .map(|(name, usage)| (name.clone(), usage.launch_count))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(limit);
        ranked
    }

    pub fn total_launches(&self) -> u64 {
        self.usage.lock().values().map(|u| u.launch_count).sum()
    }

    pub fn reset(&self) {
        self.usage.lock().clear();
    }

    /// Load from a JSON file. A missing file yields an empty collector.
    pub fn load(path: &Path) -> TemplateResult<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = fs::read_to_string(path).map_err(|e| TemplateError::from(e).at_path(path))?;
        let usage: BTreeMap<String, TemplateUsage> =
            serde_json::from_str(&content).map_err(|e| TemplateError::from(e).at_path(path))?;
        Ok(Self {
            usage: Mutex::new(usage),
        })
    }

    /// Write to a JSON file, creating parent directories.
    pub fn save(&self, path: &Path) -> TemplateResult<()> {
        let content = serde_json::to_string_pretty(&self.snapshot())?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| TemplateError::from(e).at_path(parent))?;
        }
        fs::write(path, content).map_err(|e| TemplateError::from(e).at_path(path))?;
        debug!("Saved usage statistics to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_record_launch() {
        let stats = StatsCollector::new();
        stats.record_launch("python-ml", "us-east-1", "g4dn.xlarge");
        stats.record_launch("python-ml", "us-west-2", "g4dn.xlarge");
        stats.record_launch("r-env", "us-east-1", "r5.large");

        let usage = stats.usage("python-ml").unwrap();
        assert_eq!(usage.launch_count, 2);
        assert_eq!(usage.regions["us-east-1"], 1);
        assert_eq!(usage.instance_types["g4dn.xlarge"], 2);
        assert!(usage.last_launched.is_some());
        assert_eq!(stats.total_launches(), 3);
        assert_eq!(
            stats.most_used(1),
            vec![("python-ml".to_string(), 2)]
        );
        assert!(stats.usage("unknown").is_none());
    }

    #[test]
    fn test_shared_across_threads() {
        let stats = Arc::new(StatsCollector::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        stats.record_launch("t", "us-east-1", "t3.medium");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.usage("t").unwrap().launch_count, 100);
    }

    #[test]
    fn test_save_and_load() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested").join("stats.json");

        let stats = StatsCollector::new();
        stats.record_launch("python-ml", "us-east-1", "t3.large");
        stats.save(&path).unwrap();

        let loaded = StatsCollector::load(&path).unwrap();
        assert_eq!(loaded.snapshot(), stats.snapshot());

        loaded.reset();
        assert_eq!(loaded.total_launches(), 0);
    }

    #[test]
    fn test_load_missing_and_corrupt() {
        let temp = tempdir().unwrap();
        let missing = StatsCollector::load(&temp.path().join("none.json")).unwrap();
        assert_eq!(missing.total_launches(), 0);

        let corrupt = temp.path().join("bad.json");
        fs::write(&corrupt, "{not json").unwrap();
        assert!(matches!(
            StatsCollector::load(&corrupt),
            Err(TemplateError::Load { .. })
        ));
    }
}
