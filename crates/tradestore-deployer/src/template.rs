//! Template checking and intrinsic function resolution.
//!
//! Supports the intrinsics synthesized stacks use: `Ref` (parameters,
//! resources and the `AWS::` pseudo parameters), `Fn::GetAtt` (`Arn`,
//! `DNSName`, `Name`, `AllocationId`, `RepositoryUri`), `Fn::Join` and
//! `Fn::Sub`.

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tradestore_core::environment::Environment;
use tradestore_core::stack::PHYSICAL_NAME_PROPERTIES;
use tradestore_core::{Error, Result};

static SUB_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z0-9_:]+)(?:\.([A-Za-z0-9_]+))?\}").expect("valid regex")
});

/// A resource as created by the local deployer.
#[derive(Debug, Clone)]
struct PhysicalResource {
    resource_type: String,
    physical_id: String,
}

/// A template with its parameters bound for one stack and environment.
pub struct BoundTemplate<'a> {
    stack_name: &'a str,
    environment: &'a Environment,
    parameters: BTreeMap<String, String>,
    resources: BTreeMap<String, PhysicalResource>,
}

impl<'a> BoundTemplate<'a> {
    /// Bind parameter values to a template.
    ///
    /// Fails when a parameter without a default has no value, when a value is
    /// given for a parameter the template does not declare, or when the
    /// template has no resources.
    pub fn bind(
        stack_name: &'a str,
        environment: &'a Environment,
        template: &Value,
        values: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let declared = template
            .get("Parameters")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        for name in values.keys() {
            if !declared.contains_key(name) {
                return Err(Error::InvalidInput(format!(
                    "stack {}: parameter '{}' is not declared by the template",
                    stack_name, name
                )));
            }
        }

        let mut parameters = BTreeMap::new();
        for (name, definition) in &declared {
            let value = match values.get(name) {
                Some(value) => value.clone(),
                None => match definition.get("Default") {
                    Some(default) => scalar_string(default),
                    None => {
                        return Err(Error::InvalidInput(format!(
                            "stack {}: parameter '{}' has no value",
                            stack_name, name
                        )));
                    }
                },
            };
            parameters.insert(name.clone(), value);
        }

        let declared_resources = template
            .get("Resources")
            .and_then(Value::as_object)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| {
                Error::InvalidInput(format!("stack {}: template has no resources", stack_name))
            })?;

        let resources = declared_resources
            .iter()
            .map(|(logical_id, resource)| {
                let resource_type = resource
                    .get("Type")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        Error::InvalidInput(format!(
                            "stack {}: resource '{}' has no type",
                            stack_name, logical_id
                        ))
                    })?
                    .to_string();
                let physical_id = physical_name(resource)
                    .unwrap_or_else(|| format!("{}-{}", stack_name, logical_id));
                Ok((
                    logical_id.clone(),
                    PhysicalResource {
                        resource_type,
                        physical_id,
                    },
                ))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(Self {
            stack_name,
            environment,
            parameters,
            resources,
        })
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    /// Resolve every intrinsic in `value`.
    pub fn resolve(&self, value: &Value) -> Result<Value> {
        match value {
            Value::Object(map) => {
                if map.len() == 1 {
                    if let Some((key, arg)) = map.iter().next() {
                        match key.as_str() {
                            "Ref" => return self.resolve_ref(arg).map(Value::String),
                            "Fn::GetAtt" => return self.resolve_get_att(arg).map(Value::String),
                            "Fn::Join" => return self.resolve_join(arg).map(Value::String),
                            "Fn::Sub" => return self.resolve_sub(arg).map(Value::String),
                            _ => {}
                        }
                    }
                }
                self.resolve_object(map)
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve(item))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            other => Ok(other.clone()),
        }
    }

    /// Resolved resource section of the template.
    pub fn resources(&self, template: &Value) -> Result<Value> {
        self.resolve(template.get("Resources").unwrap_or(&Value::Null))
    }

    /// Resolved stack outputs as strings.
    pub fn outputs(&self, template: &Value) -> Result<BTreeMap<String, String>> {
        let Some(outputs) = template.get("Outputs").and_then(Value::as_object) else {
            return Ok(BTreeMap::new());
        };
        outputs
            .iter()
            .map(|(name, output)| {
                let value = output.get("Value").ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "stack {}: output '{}' has no value",
                        self.stack_name, name
                    ))
                })?;
                Ok((name.clone(), scalar_string(&self.resolve(value)?)))
            })
            .collect()
    }

    fn resolve_object(&self, map: &Map<String, Value>) -> Result<Value> {
        map.iter()
            .map(|(k, v)| Ok((k.clone(), self.resolve(v)?)))
            .collect::<Result<Map<_, _>>>()
            .map(Value::Object)
    }

    fn resolve_ref(&self, arg: &Value) -> Result<String> {
        let name = arg.as_str().ok_or_else(|| self.malformed("Ref", arg))?;
        self.lookup(name)
    }

    fn lookup(&self, name: &str) -> Result<String> {
        match name {
            "AWS::Region" => return Ok(self.environment.region.clone()),
            "AWS::AccountId" => return Ok(self.environment.account.clone()),
            "AWS::StackName" => return Ok(self.stack_name.to_string()),
            _ => {}
        }
        if let Some(value) = self.parameters.get(name) {
            return Ok(value.clone());
        }
        if let Some(resource) = self.resources.get(name) {
            return Ok(resource.physical_id.clone());
        }
        Err(Error::InvalidInput(format!(
            "stack {}: unresolved reference '{}'",
            self.stack_name, name
        )))
    }

    fn resolve_get_att(&self, arg: &Value) -> Result<String> {
        let (logical_id, attribute) = match arg.as_array().map(Vec::as_slice) {
            Some([Value::String(id), Value::String(attr)]) => (id.as_str(), attr.as_str()),
            _ => return Err(self.malformed("Fn::GetAtt", arg)),
        };
        self.attribute(logical_id, attribute)
    }

    fn attribute(&self, logical_id: &str, attribute: &str) -> Result<String> {
        let resource = self.resources.get(logical_id).ok_or_else(|| {
            Error::InvalidInput(format!(
                "stack {}: attribute of unknown resource '{}'",
                self.stack_name, logical_id
            ))
        })?;

        match attribute {
            "Arn" => Ok(self.arn(resource)),
            "Name" | "AllocationId" => Ok(resource.physical_id.clone()),
            "RepositoryUri" => Ok(format!(
                "{}.dkr.ecr.{}.amazonaws.com/{}",
                self.environment.account, self.environment.region, resource.physical_id
            )),
            "DNSName" => Ok(format!(
                "{}.{}.elb.amazonaws.com",
                resource.physical_id.to_lowercase(),
                self.environment.region
            )),
            other => Err(Error::InvalidInput(format!(
                "stack {}: unsupported attribute '{}.{}'",
                self.stack_name, logical_id, other
            ))),
        }
    }

    fn arn(&self, resource: &PhysicalResource) -> String {
        let mut parts = resource.resource_type.split("::").skip(1);
        let service = parts.next().unwrap_or_default().to_lowercase();
        let kind = parts.next().unwrap_or_default().to_lowercase();
        let service = match service.as_str() {
            "elasticloadbalancingv2" => "elasticloadbalancing",
            other => other,
        };
        if service == "lambda" {
            return format!(
                "arn:aws:lambda:{}:{}:function:{}",
                self.environment.region, self.environment.account, resource.physical_id
            );
        }
        if service == "iam" {
            return format!(
                "arn:aws:iam::{}:{}/{}",
                self.environment.account, kind, resource.physical_id
            );
        }
        format!(
            "arn:aws:{}:{}:{}:{}/{}",
            service,
            self.environment.region,
            self.environment.account,
            kind,
            resource.physical_id
        )
    }

    fn resolve_join(&self, arg: &Value) -> Result<String> {
        let (separator, items) = match arg.as_array().map(Vec::as_slice) {
            Some([Value::String(sep), Value::Array(items)]) => (sep, items),
            _ => return Err(self.malformed("Fn::Join", arg)),
        };
        let parts = items
            .iter()
            .map(|item| self.resolve(item).map(|v| scalar_string(&v)))
            .collect::<Result<Vec<_>>>()?;
        Ok(parts.join(separator))
    }

    fn resolve_sub(&self, arg: &Value) -> Result<String> {
        let input = arg.as_str().ok_or_else(|| self.malformed("Fn::Sub", arg))?;
        let mut output = String::with_capacity(input.len());
        let mut last = 0;
        for caps in SUB_REGEX.captures_iter(input) {
            let Some(whole) = caps.get(0) else { continue };
            output.push_str(&input[last..whole.start()]);
            let value = match caps.get(2) {
                Some(attribute) => self.attribute(&caps[1], attribute.as_str())?,
                None => self.lookup(&caps[1])?,
            };
            output.push_str(&value);
            last = whole.end();
        }
        output.push_str(&input[last..]);
        Ok(output)
    }

    fn malformed(&self, function: &str, arg: &Value) -> Error {
        Error::InvalidInput(format!(
            "stack {}: malformed {} argument {}",
            self.stack_name, function, arg
        ))
    }
}

fn physical_name(resource: &Value) -> Option<String> {
    let properties = resource.get("Properties")?.as_object()?;
    PHYSICAL_NAME_PROPERTIES
        .iter()
        .find_map(|key| properties.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template() -> Value {
        json!({
            "Parameters": {
                "ImageTag": { "Type": "String" },
                "Stage": { "Type": "String", "Default": "devo" },
            },
            "Resources": {
                "Table": {
                    "Type": "AWS::DynamoDB::Table",
                    "Properties": { "TableName": "Records-us-east-1" },
                },
                "TaskRole": { "Type": "AWS::IAM::Role", "Properties": {} },
                "WebLoadBalancer": {
                    "Type": "AWS::ElasticLoadBalancingV2::LoadBalancer",
                    "Properties": { "Name": "WebLb" },
                },
                "Task": {
                    "Type": "AWS::ECS::TaskDefinition",
                    "Properties": {
                        "Image": { "Fn::Join": ["", ["repo:", { "Ref": "ImageTag" }]] },
                        "Role": { "Fn::GetAtt": ["TaskRole", "Arn"] },
                        "Table": { "Fn::Sub": "${Table} in ${AWS::Region} (${Stage})" },
                    },
                },
            },
            "Outputs": {
                "loadBalancerUrl": { "Value": { "Fn::GetAtt": ["WebLoadBalancer", "DNSName"] } },
            },
        })
    }

    fn params(tag: &str) -> BTreeMap<String, String> {
        BTreeMap::from([("ImageTag".to_string(), tag.to_string())])
    }

    #[test]
    fn test_resolve_intrinsics() {
        let env = Environment::new("111111111111", "us-east-1");
        let template = template();
        let bound = BoundTemplate::bind("Web", &env, &template, &params("latest")).unwrap();

        assert_eq!(bound.parameters()["Stage"], "devo");

        let resources = bound.resources(&template).unwrap();
        let task = &resources["Task"]["Properties"];
        assert_eq!(task["Image"], "repo:latest");
        assert_eq!(task["Role"], "arn:aws:iam::111111111111:role/Web-TaskRole");
        assert_eq!(task["Table"], "Records-us-east-1 in us-east-1 (devo)");

        let outputs = bound.outputs(&template).unwrap();
        assert_eq!(outputs["loadBalancerUrl"], "weblb.us-east-1.elb.amazonaws.com");
    }

    #[test]
    fn test_repository_and_function_attributes() {
        let env = Environment::new("111111111111", "us-east-1");
        let template = json!({
            "Resources": {
                "Repo": {
                    "Type": "AWS::ECR::Repository",
                    "Properties": { "RepositoryName": "trade-store-app" },
                },
                "Lambda": {
                    "Type": "AWS::Lambda::Function",
                    "Properties": { "FunctionName": "handler" },
                },
            },
            "Outputs": {
                "image": {
                    "Value": {
                        "Fn::Join": ["", [{ "Fn::GetAtt": ["Repo", "RepositoryUri"] }, ":latest"]]
                    }
                },
                "lambdaArn": { "Value": { "Fn::GetAtt": ["Lambda", "Arn"] } },
            },
        });
        let bound = BoundTemplate::bind("Build", &env, &template, &BTreeMap::new()).unwrap();
        let outputs = bound.outputs(&template).unwrap();

        assert_eq!(
            outputs["image"],
            "111111111111.dkr.ecr.us-east-1.amazonaws.com/trade-store-app:latest"
        );
        assert_eq!(
            outputs["lambdaArn"],
            "arn:aws:lambda:us-east-1:111111111111:function:handler"
        );
    }

    #[test]
    fn test_missing_parameter_value() {
        let env = Environment::new("111111111111", "us-east-1");
        let err = BoundTemplate::bind("Web", &env, &template(), &BTreeMap::new());
        assert!(matches!(err, Err(Error::InvalidInput(m)) if m.contains("ImageTag")));
    }

    #[test]
    fn test_undeclared_parameter() {
        let env = Environment::new("111111111111", "us-east-1");
        let mut values = params("latest");
        values.insert("Unknown".to_string(), "x".to_string());
        assert!(BoundTemplate::bind("Web", &env, &template(), &values).is_err());
    }

    #[test]
    fn test_unresolved_reference() {
        let env = Environment::new("111111111111", "us-east-1");
        let template = json!({
            "Resources": {
                "Queue": { "Type": "AWS::SQS::Queue", "Properties": { "Dlq": { "Ref": "Missing" } } },
            },
        });
        let bound = BoundTemplate::bind("Web", &env, &template, &BTreeMap::new()).unwrap();
        assert!(bound.resources(&template).is_err());
    }
}
