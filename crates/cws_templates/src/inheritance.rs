//! Multi-parent inheritance resolution.
//!
//! Parents are merged in declaration order, each fully resolved first, and
//! the child is merged last so its values win. Templates are always read from
//! an unresolved snapshot, so the result does not depend on resolution order.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{TemplateError, TemplateResult};
use crate::manifest::Template;

/// Resolve the template called `name` against a snapshot of unresolved
/// templates keyed by name.
pub fn resolve(name: &str, snapshot: &BTreeMap<String, Template>) -> TemplateResult<Template> {
    let mut stack = Vec::new();
    resolve_with_stack(name, snapshot, &mut stack)
}

fn resolve_with_stack(
    name: &str,
    snapshot: &BTreeMap<String, Template>,
    stack: &mut Vec<String>,
) -> TemplateResult<Template> {
    if let Some(pos) = stack.iter().position(|n| n == name) {
        let mut chain = stack[pos..].to_vec();
        chain.push(name.to_string());
        return Err(TemplateError::InheritanceCycle { chain });
    }

    let template = snapshot
        .get(name)
        .ok_or_else(|| TemplateError::NotFound(name.to_string()))?;
    if !template.has_inheritance() {
        return Ok(template.clone());
    }

    stack.push(name.to_string());
    let mut merged = seed(template);
    for parent_name in &template.inherits {
        let parent = snapshot
            .get(parent_name)
            .ok_or_else(|| TemplateError::MissingParent {
                template: name.to_string(),
                parent: parent_name.clone(),
            })?;
        if parent.has_inheritance() {
            let resolved = resolve_with_stack(parent_name, snapshot, stack)?;
            merge_into(&mut merged, &resolved);
        } else {
            merge_into(&mut merged, parent);
        }
    }
    merge_into(&mut merged, template);
    stack.pop();

    debug!(
        "Resolved inheritance for {} from {:?}",
        name, template.inherits
    );
    Ok(merged)
}

/// Empty accumulator carrying the child's identity fields.
fn seed(child: &Template) -> Template {
    Template {
        name: child.name.clone(),
        slug: child.slug.clone(),
        description: child.description.clone(),
        long_description: child.long_description.clone(),
        category: child.category.clone(),
        domain: child.domain.clone(),
        base: child.base.clone(),
        inherits: child.inherits.clone(),
        version: child.version.clone(),
        maintainer: child.maintainer.clone(),
        last_updated: child.last_updated.clone(),
        ..Default::default()
    }
}

/// Merge `source` into `target`; `source` wins wherever values override.
pub fn merge_into(target: &mut Template, source: &Template) {
    if source.package_manager.as_deref().is_some_and(|pm| !pm.is_empty()) {
        target.package_manager = source.package_manager.clone();
    }
    if target.base.is_empty() && !source.base.is_empty() {
        target.base = source.base.clone();
    }

    target.packages.append(&source.packages);
    target.users.extend(source.users.iter().cloned());
    target.services.extend(source.services.iter().cloned());
    target.dependencies.extend(source.dependencies.iter().cloned());

    for (k, v) in &source.tags {
        target.tags.insert(k.clone(), v.clone());
    }
    for (k, v) in &source.variables {
        target.variables.insert(k.clone(), v.clone());
    }
    for (k, v) in &source.parameters {
        target.parameters.insert(k.clone(), v.clone());
    }

    if source.ami_config.has_mappings() {
        target.ami_config = source.ami_config.clone();
    }

    if !source.post_install.is_empty() {
        if target.post_install.is_empty() {
            target.post_install = source.post_install.clone();
        } else {
            target.post_install = format!(
                "{}\n\n# --- post-install from {} ---\n{}",
                target.post_install, source.name, source.post_install
            );
        }
    }
    if !source.user_data.is_empty() {
        target.user_data = source.user_data.clone();
    }
    if source.idle_detection.is_some() {
        target.idle_detection = source.idle_detection;
    }

    let defaults = &source.instance_defaults;
    if defaults.instance_type.as_deref().is_some_and(|t| !t.is_empty()) {
        target.instance_defaults.instance_type = defaults.instance_type.clone();
    }
    for port in &defaults.ports {
        if !target.instance_defaults.ports.contains(port) {
            target.instance_defaults.ports.push(*port);
        }
    }
    for (arch, cost) in &defaults.estimated_cost_per_hour {
        target
            .instance_defaults
            .estimated_cost_per_hour
            .insert(arch.clone(), *cost);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{IdleDetectionConfig, ServiceConfig};

    fn template(name: &str, inherits: &[&str]) -> Template {
        Template {
            name: name.into(),
            description: format!("{} template", name),
            inherits: inherits.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn snapshot(templates: Vec<Template>) -> BTreeMap<String, Template> {
        templates.into_iter().map(|t| (t.name.clone(), t)).collect()
    }

    #[test]
    fn test_packages_concatenate_in_order() {
        let mut base = template("base", &[]);
        base.base = "ubuntu-22.04".into();
        base.package_manager = Some("apt".into());
        base.packages.system = vec!["a".into(), "b".into()];
        let mut child = template("child", &["base"]);
        child.packages.system = vec!["c".into(), "a".into()];

        let merged = resolve("child", &snapshot(vec![base, child])).unwrap();
        assert_eq!(merged.packages.system, vec!["a", "b", "c", "a"]);
        assert_eq!(merged.base, "ubuntu-22.04");
        assert_eq!(merged.package_manager.as_deref(), Some("apt"));
        assert_eq!(merged.description, "child template");
    }

    #[test]
    fn test_override_rules() {
        let mut base = template("base", &[]);
        base.base = "ubuntu-22.04".into();
        base.package_manager = Some("apt".into());
        base.tags.insert("tier".into(), "base".into());
        base.tags.insert("os".into(), "ubuntu".into());
        base.instance_defaults.instance_type = Some("t3.medium".into());
        base.instance_defaults.ports = vec![8080, 443];
        base.instance_defaults
            .estimated_cost_per_hour
            .insert("x86_64".into(), 0.04);
        base.post_install = "echo base".into();
        base.services.push(ServiceConfig {
            name: "nginx".into(),
            port: 80,
            ..Default::default()
        });

        let mut child = template("child", &["base"]);
        child.package_manager = Some("conda".into());
        child.tags.insert("tier".into(), "child".into());
        child.instance_defaults.instance_type = Some("r5.large".into());
        child.instance_defaults.ports = vec![443, 8888];
        child.instance_defaults
            .estimated_cost_per_hour
            .insert("arm64".into(), 0.1);
        child.post_install = "echo child".into();
        child.services.push(ServiceConfig {
            name: "nginx".into(),
            port: 8081,
            ..Default::default()
        });
        child.idle_detection = Some(IdleDetectionConfig::disabled());

        let merged = resolve("child", &snapshot(vec![base, child])).unwrap();
        assert_eq!(merged.package_manager.as_deref(), Some("conda"));
        assert_eq!(merged.tags["tier"], "child");
        assert_eq!(merged.tags["os"], "ubuntu");
        assert_eq!(merged.instance_defaults.instance_type.as_deref(), Some("r5.large"));
        assert_eq!(merged.instance_defaults.ports, vec![8080, 443, 8888]);
        assert_eq!(merged.instance_defaults.estimated_cost_per_hour.len(), 2);
        assert_eq!(merged.services.len(), 2);
        assert!(merged.post_install.starts_with("echo base"));
        assert!(merged.post_install.ends_with("echo child"));
        assert!(merged.post_install.contains("# --- post-install from child ---"));
        assert!(merged.idle_detection.is_some());
    }

    #[test]
    fn test_ami_config_replaced_wholesale() {
        let mut base = template("base", &[]);
        base.ami_config
            .amis
            .entry("us-east-1".into())
            .or_default()
            .insert("x86_64".into(), "ami-parent".into());
        base.ami_config
            .instance_types
            .insert("x86_64".into(), "g5.xlarge".into());
        let mut child = template("child", &["base"]);
        child
            .ami_config
            .amis
            .entry("us-west-2".into())
            .or_default()
            .insert("arm64".into(), "ami-child".into());

        let merged = resolve("child", &snapshot(vec![base, child])).unwrap();
        assert!(!merged.ami_config.amis.contains_key("us-east-1"));
        assert!(merged.ami_config.instance_types.is_empty());
        assert_eq!(merged.ami_config.amis["us-west-2"]["arm64"], "ami-child");
    }

    #[test]
    fn test_multi_level_and_multi_parent() {
        let mut os = template("os", &[]);
        os.base = "rocky-9".into();
        os.packages.system = vec!["git".into()];
        let mut py = template("py", &["os"]);
        py.packages.pip = vec!["numpy".into()];
        let mut r = template("r", &["os"]);
        r.packages.system = vec!["r-base".into()];
        let mut both = template("both", &["py", "r"]);
        both.packages.pip = vec!["rpy2".into()];

        let merged = resolve("both", &snapshot(vec![os, py, r, both])).unwrap();
        assert_eq!(merged.packages.system, vec!["git", "git", "r-base"]);
        assert_eq!(merged.packages.pip, vec!["numpy", "rpy2"]);
        assert_eq!(merged.base, "rocky-9");
    }

    #[test]
    fn test_missing_parent() {
        let child = template("child", &["ghost"]);
        let err = resolve("child", &snapshot(vec![child])).unwrap_err();
        assert!(matches!(
            err,
            TemplateError::MissingParent { ref parent, .. } if parent == "ghost"
        ));
    }

    #[test]
    fn test_multi_hop_cycle_detected() {
        let a = template("a", &["b"]);
        let b = template("b", &["c"]);
        let c = template("c", &["a"]);
        let err = resolve("a", &snapshot(vec![a, b, c])).unwrap_err();
        match err {
            TemplateError::InheritanceCycle { chain } => {
                assert_eq!(chain, vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let mut base = template("base", &[]);
        base.base = "ubuntu-22.04".into();
        base.packages.system = vec!["git".into()];
        base.tags.insert("a".into(), "1".into());
        let mut child = template("child", &["base"]);
        child.tags.insert("b".into(), "2".into());
        let snap = snapshot(vec![base, child]);

        let first = serde_yaml::to_string(&resolve("child", &snap).unwrap()).unwrap();
        let second = serde_yaml::to_string(&resolve("child", &snap).unwrap()).unwrap();
        assert_eq!(first, second);
    }
}
