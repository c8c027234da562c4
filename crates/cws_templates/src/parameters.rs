//! Template parameters: typed value checks and `{{name}}` substitution.

use std::collections::BTreeMap;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::error::{TemplateError, TemplateResult, ValidationError};
use crate::manifest::{Ecosystem, ParameterType, Template, TemplateParameter};
use crate::renderer::TemplateRenderer;

fn invalid(name: &str, message: impl Into<String>) -> TemplateError {
    TemplateError::InvalidParameter {
        parameter: name.to_string(),
        message: message.into(),
    }
}

/// String form of a YAML/JSON scalar.
fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Check a raw value against a parameter definition and return its
/// normalised form.
pub fn coerce(name: &str, param: &TemplateParameter, raw: &str) -> TemplateResult<String> {
    match param.kind {
        ParameterType::Int => {
            let n: i64 = raw
                .trim()
                .parse()
                .map_err(|_| invalid(name, format!("'{}' is not an integer", raw)))?;
            if let Some(min) = param.min {
                if n < min {
                    return Err(invalid(name, format!("{} is below the minimum {}", n, min)));
                }
            }
            if let Some(max) = param.max {
                if n > max {
                    return Err(invalid(name, format!("{} is above the maximum {}", n, max)));
                }
            }
            Ok(n.to_string())
        }
        ParameterType::Bool => match raw.trim().to_ascii_lowercase().as_str() {
            "true" => Ok("true".to_string()),
            "false" => Ok("false".to_string()),
            _ => Err(invalid(name, format!("'{}' is not a boolean", raw))),
        },
        ParameterType::Choice => {
            if param.choices.iter().any(|c| c == raw) {
                Ok(raw.to_string())
            } else {
                Err(invalid(
                    name,
                    format!("'{}' is not one of: {}", raw, param.choices.join(", ")),
                ))
            }
        }
        ParameterType::String => {
            if let Some(pattern) = &param.pattern {
                let re = Regex::new(&format!("^(?:{})$", pattern))
                    .map_err(|e| invalid(name, format!("invalid pattern: {}", e)))?;
                if !re.is_match(raw) {
                    return Err(invalid(
                        name,
                        format!("'{}' does not match pattern: {}", raw, pattern),
                    ));
                }
            }
            Ok(raw.to_string())
        }
    }
}

/// Check that a parameter definition is internally consistent.
pub fn check_definition(name: &str, param: &TemplateParameter) -> Result<(), ValidationError> {
    let field = format!("parameters.{}", name);

    if param.kind == ParameterType::Choice && param.choices.is_empty() {
        return Err(ValidationError::new(field, "choice parameter requires choices"));
    }
    if let (Some(min), Some(max)) = (param.min, param.max) {
        if min > max {
            return Err(ValidationError::new(
                field,
                format!("minimum {} is greater than maximum {}", min, max),
            ));
        }
    }
    if let Some(pattern) = &param.pattern {
        if let Err(e) = Regex::new(pattern) {
            return Err(ValidationError::new(field, format!("invalid pattern: {}", e)));
        }
    }
    if let Some(default) = &param.default {
        let raw = scalar_to_string(default).ok_or_else(|| {
            ValidationError::new(field.clone(), "default must be a scalar value")
        })?;
        if let Err(e) = coerce(name, param, &raw) {
            let message = match e {
                TemplateError::InvalidParameter { message, .. } => message,
                other => other.to_string(),
            };
            return Err(ValidationError::new(field, format!("invalid default: {}", message)));
        }
    }
    Ok(())
}

/// Compute the substitution values for a template: its `variables`, then its
/// parameters (provided value, else default). Unknown provided names and
/// missing required parameters are errors.
pub fn resolve_values(
    template: &Template,
    provided: &BTreeMap<String, String>,
) -> TemplateResult<BTreeMap<String, String>> {
    if let Some(unknown) = provided.keys().find(|k| !template.parameters.contains_key(*k)) {
        return Err(invalid(unknown, "unknown parameter"));
    }

    let mut values = template.variables.clone();
    for (name, param) in &template.parameters {
        let value = match (provided.get(name), &param.default) {
            (Some(raw), _) => coerce(name, param, raw)?,
            (None, Some(default)) => {
                let raw = scalar_to_string(default)
                    .ok_or_else(|| invalid(name, "default must be a scalar value"))?;
                coerce(name, param, &raw)?
            }
            (None, None) if param.required => {
                return Err(TemplateError::MissingParameter(name.clone()))
            }
            (None, None) => continue,
        };
        values.insert(name.clone(), value);
    }
    Ok(values)
}

/// Substitute values into the text-bearing fields of a template.
pub fn apply(template: &Template, values: &BTreeMap<String, String>) -> TemplateResult<Template> {
    let mut out = template.clone();
    if values.is_empty() {
        return Ok(out);
    }

    let renderer = TemplateRenderer::new();
    out.description = renderer.render_content(&out.description, values)?;
    for ecosystem in Ecosystem::ALL {
        renderer.render_all(out.packages.list_mut(ecosystem), values)?;
    }
    for service in &mut out.services {
        renderer.render_all(&mut service.config, values)?;
    }
    out.post_install = renderer.render_content(&out.post_install, values)?;
    out.user_data = renderer.render_content(&out.user_data, values)?;

    debug!(
        "Applied {} parameter values to template {}",
        values.len(),
        template.name
    );
    Ok(out)
}
