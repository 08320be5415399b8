//! Variable interpolation for pipeline runs.
//!
//! Two kinds of variables are supported:
//! - Exported action variables, `#{namespace.name}`, published by build
//!   actions and read by later actions (e.g. `#{app_build.imageTag}`).
//! - Process values:
//!   - `${pipeline.name}` - Pipeline name
//!   - `${run.id}` - Run ID
//!   - `${run.trigger}` - What started the run
//!   - `${stage.name}` - Current stage name
//!   - `${stage.index}` - Current stage index
//!   - `${secrets.SECRET_NAME}` - Secret value

use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;
use tradestore_core::pipeline::{ParameterValue, VariableRef};

use crate::{ConfigError, ConfigResult};

const MASK: &str = "****";

/// Variable context for one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub pipeline: PipelineContext,
    pub run: RunContext,
    pub stage: StageContext,
    /// Secrets (will be masked in logs)
    pub secrets: HashMap<String, String>,
    /// Exported action variables by namespace
    pub exports: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineContext {
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub id: String,
    pub trigger: String,
}

#[derive(Debug, Clone, Default)]
pub struct StageContext {
    pub name: String,
    pub index: usize,
}

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}")
        .expect("valid regex")
});

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the variables an action exported.
    pub fn set_exports(&mut self, namespace: &str, variables: BTreeMap<String, String>) {
        self.exports
            .entry(namespace.to_string())
            .or_default()
            .extend(variables);
    }

    pub fn set_stage(&mut self, name: &str, index: usize) {
        self.stage.name = name.to_string();
        self.stage.index = index;
    }

    /// Resolve a process value name such as `run.id` or `stage.name`.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["pipeline", "name"] => Some(self.pipeline.name.clone()),

            ["run", "id"] => Some(self.run.id.clone()),
            ["run", "trigger"] => Some(self.run.trigger.clone()),

            ["stage", "name"] => Some(self.stage.name.clone()),
            ["stage", "index"] => Some(self.stage.index.to_string()),

            ["secrets", name] => self.secrets.get(*name).cloned(),

            _ => None,
        }
    }

    /// Value of an exported action variable.
    pub fn resolve_ref(&self, reference: &VariableRef) -> Option<&str> {
        self.exports
            .get(&reference.namespace)
            .and_then(|vars| vars.get(&reference.name))
            .map(String::as_str)
    }

    /// Interpolate all variables in a string. Unknown variables are left as
    /// written.
    pub fn interpolate(&self, input: &str) -> String {
        let with_process = VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string();

        VariableRef::substitute(&with_process, |r| {
            Some(
                self.resolve_ref(r)
                    .map(str::to_string)
                    .unwrap_or_else(|| r.to_string()),
            )
        })
        .unwrap_or(with_process)
    }

    pub fn interpolate_map(&self, map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect()
    }

    /// Resolve a deploy parameter value. Every referenced action variable
    /// must have been exported.
    pub fn resolve_parameter(&self, name: &str, value: &ParameterValue) -> ConfigResult<String> {
        let unresolved = |reference: &VariableRef| ConfigError::UnresolvedVariable {
            variable: reference.to_string(),
            context: format!("parameter '{}'", name),
        };

        match value {
            ParameterValue::Literal(literal) => Ok(literal.clone()),
            ParameterValue::Variable(reference) => self
                .resolve_ref(reference)
                .map(str::to_string)
                .ok_or_else(|| unresolved(reference)),
            ParameterValue::Template(template) => {
                VariableRef::substitute(template, |r| self.resolve_ref(r).map(str::to_string))
                    .map_err(|missing| unresolved(&missing))
            }
        }
    }

    /// Resolve every parameter of a deploy action.
    pub fn resolve_parameters(
        &self,
        overrides: &BTreeMap<String, ParameterValue>,
    ) -> ConfigResult<BTreeMap<String, String>> {
        overrides
            .iter()
            .map(|(name, value)| -> ConfigResult<(String, String)> {
                Ok((name.clone(), self.resolve_parameter(name, value)?))
            })
            .collect()
    }

    /// Get all secret values that should be masked in logs.
    pub fn secret_values(&self) -> Vec<&str> {
        self.secrets
            .values()
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Replace every secret value in `line`.
    pub fn mask(&self, line: &str) -> String {
        self.secret_values()
            .into_iter()
            .fold(line.to_string(), |acc, secret| acc.replace(secret, MASK))
    }
}

/// Builder for creating VariableContext.
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self {
            ctx: VariableContext::new(),
        }
    }

    pub fn with_pipeline(mut self, name: impl Into<String>) -> Self {
        self.ctx.pipeline.name = name.into();
        self
    }

    pub fn with_run(mut self, id: impl Into<String>, trigger: impl Into<String>) -> Self {
        self.ctx.run.id = id.into();
        self.ctx.run.trigger = trigger.into();
        self
    }

    pub fn with_stage(mut self, name: impl Into<String>, index: usize) -> Self {
        self.ctx.stage.name = name.into();
        self.ctx.stage.index = index;
        self
    }

    pub fn with_secret(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.secrets.insert(key.into(), value.into());
        self
    }

    pub fn with_export(
        mut self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.ctx
            .exports
            .entry(namespace.into())
            .or_default()
            .insert(name.into(), value.into());
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

impl Default for VariableContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
