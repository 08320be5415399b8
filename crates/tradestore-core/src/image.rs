//! Container image references, including images whose tag is only known once
//! the application build has run.
//!
//! A [`DeferredImage`] is bound in two phases:
//! 1. Definition time: the stack template declares a string parameter named
//!    [`DeferredImage::tag_parameter_name`] and builds the image URI from it.
//! 2. Run time: the deploy action overrides that parameter with a pipeline
//!    variable exported by the build (for example `#{app_build.imageTag}`).

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::pipeline::{ParameterValue, VariableRef};

/// The image a container service runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerImage {
    /// A fully qualified image reference.
    Registry(String),
    /// An image from a repository with the tag supplied at deploy time.
    TagParameter(DeferredImage),
}

impl ContainerImage {
    /// Template value for the container's `Image` property.
    pub fn template_value(&self) -> serde_json::Value {
        match self {
            ContainerImage::Registry(image) => json!(image),
            ContainerImage::TagParameter(deferred) => deferred.template_value(),
        }
    }

    /// Template parameters the image needs, as `(name, definition)`.
    pub fn template_parameters(&self) -> Vec<(String, serde_json::Value)> {
        match self {
            ContainerImage::Registry(_) => Vec::new(),
            ContainerImage::TagParameter(deferred) => vec![(
                deferred.tag_parameter_name.clone(),
                json!({
                    "Type": "String",
                    "Description": format!("Image tag for {}", deferred.repository_uri),
                }),
            )],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredImage {
    pub repository_uri: String,
    pub tag_parameter_name: String,
}

impl DeferredImage {
    pub fn new(repository_uri: impl Into<String>, tag_parameter_name: impl Into<String>) -> Self {
        Self {
            repository_uri: repository_uri.into(),
            tag_parameter_name: tag_parameter_name.into(),
        }
    }

    /// Human-readable placeholder for the unresolved image.
    pub fn placeholder(&self) -> String {
        format!("{}:${{{}}}", self.repository_uri, self.tag_parameter_name)
    }

    pub fn resolve(&self, tag: &str) -> String {
        format!("{}:{}", self.repository_uri, tag)
    }

    fn template_value(&self) -> serde_json::Value {
        json!({
            "Fn::Join": ["", [
                format!("{}:", self.repository_uri),
                { "Ref": self.tag_parameter_name },
            ]]
        })
    }

    /// The deploy-action parameter override that feeds `variable` into the tag.
    pub fn parameter_override(&self, variable: VariableRef) -> (String, ParameterValue) {
        (
            self.tag_parameter_name.clone(),
            ParameterValue::Variable(variable),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deferred() -> DeferredImage {
        DeferredImage::new(
            "111111111111.dkr.ecr.us-east-1.amazonaws.com/trade-store-app",
            "TradeStoreAppImageTag",
        )
    }

    #[test]
    fn test_resolve_and_placeholder() {
        let image = deferred();
        assert_eq!(
            image.resolve("latest"),
            "111111111111.dkr.ecr.us-east-1.amazonaws.com/trade-store-app:latest"
        );
        assert!(image.placeholder().ends_with(":${TradeStoreAppImageTag}"));
    }

    #[test]
    fn test_template_declares_parameter() {
        let image = ContainerImage::TagParameter(deferred());
        let params = image.template_parameters();
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].0, "TradeStoreAppImageTag");
        assert_eq!(
            image.template_value()["Fn::Join"][1][1]["Ref"],
            "TradeStoreAppImageTag"
        );
    }

    #[test]
    fn test_registry_image_needs_no_parameter() {
        let image = ContainerImage::Registry("amazon/amazon-ecs-example".to_string());
        assert!(image.template_parameters().is_empty());
        assert_eq!(image.template_value(), json!("amazon/amazon-ecs-example"));
    }

    #[test]
    fn test_parameter_override_binds_variable() {
        let (name, value) = deferred().parameter_override(VariableRef::new("app_build", "imageTag"));
        assert_eq!(name, "TradeStoreAppImageTag");
        assert_eq!(
            value,
            ParameterValue::Variable(VariableRef::new("app_build", "imageTag"))
        );
    }
}
