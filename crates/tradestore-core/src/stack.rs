//! The environment stack resource model.
//!
//! An [`EnvironmentStack`] declares the runtime resources of one environment
//! (queues, tables, functions, image repositories, networking, load-balanced
//! container services, scaling and access grants) and synthesizes them into a
//! CloudFormation-shaped template. Every physical name is qualified with the
//! stack name, region and account, so two instances of the same stack never
//! share an identifier. Names longer than AWS accepts for their property are
//! shortened and suffixed with a hash of the full name.
//!
//! Image repository names are the exception: they are registry-wide and used
//! as given.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

use crate::environment::{DeploymentTarget, Environment};
use crate::image::ContainerImage;
use crate::{Error, Result};

/// Path probed by the load balancer and by post-deploy validation.
pub const HEALTH_CHECK_PATH: &str = "/health";

/// Output carrying the public load balancer address.
pub const LOAD_BALANCER_URL_OUTPUT: &str = "loadBalancerUrl";

const TEMPLATE_FORMAT_VERSION: &str = "2010-09-09";

/// Most availability zones a network may span.
pub const MAX_AZS: u8 = 6;

/// Hex digits of the hash suffix on shortened names.
const NAME_HASH_LEN: usize = 8;

/// Resource properties holding names that must be unique per account and
/// region.
pub const PHYSICAL_NAME_PROPERTIES: &[&str] = &[
    "QueueName",
    "TableName",
    "ClusterName",
    "Family",
    "RoleName",
    "PolicyName",
    "ServiceName",
    "FunctionName",
    "RepositoryName",
    "Name",
];

/// Longest value AWS accepts for a physical name property.
///
/// `Name` is the load balancer name, the tightest of the resources using it.
pub fn name_limit(property: &str) -> usize {
    match property {
        "Name" => 32,
        "RoleName" | "FunctionName" => 64,
        "QueueName" => 80,
        "PolicyName" => 128,
        _ => 255,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub logical_id: String,
    pub visibility_timeout_secs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeType {
    String,
    Number,
}

impl AttributeType {
    fn code(self) -> &'static str {
        match self {
            AttributeType::String => "S",
            AttributeType::Number => "N",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySpec {
    pub name: String,
    pub attribute_type: AttributeType,
}

impl KeySpec {
    pub fn new(name: impl Into<String>, attribute_type: AttributeType) -> Self {
        Self {
            name: name.into(),
            attribute_type,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingMode {
    PayPerRequest,
    Provisioned { read: u32, write: u32 },
}

/// What happens to a resource when it leaves the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemovalPolicy {
    Destroy,
    Retain,
}

impl RemovalPolicy {
    fn deletion_policy(self) -> &'static str {
        match self {
            RemovalPolicy::Destroy => "Delete",
            RemovalPolicy::Retain => "Retain",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub logical_id: String,
    /// Base table name; qualified per environment at synthesis.
    pub table_name: String,
    pub partition_key: KeySpec,
    pub sort_key: Option<KeySpec>,
    pub billing: BillingMode,
    pub removal: RemovalPolicy,
}

/// An image repository in the environment's registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySpec {
    pub logical_id: String,
    pub repository_name: String,
    pub removal: RemovalPolicy,
}

/// A function with its own execution role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub logical_id: String,
    /// e.g. `nodejs14.x`
    pub runtime: String,
    /// `file.export` inside the code.
    pub handler: String,
    /// Directory packaged and uploaded to the environment's asset bucket.
    pub code_asset: String,
}

/// The service role a build project runs as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRoleSpec {
    /// Name of the build project.
    pub project: String,
}

impl BuildRoleSpec {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
        }
    }

    fn role_id(&self) -> String {
        format!("{}Role", self.project)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub logical_id: String,
    pub max_azs: u8,
    pub nat_gateways: u8,
}

/// A load-balanced Fargate service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub logical_id: String,
    pub container_name: String,
    pub container_port: u16,
    /// CPU units.
    pub cpu: u32,
    pub memory_mib: u32,
    pub desired_count: u32,
    pub listener_port: u16,
    pub public_load_balancer: bool,
    pub environment: BTreeMap<String, String>,
    pub image: ContainerImage,
    pub health_check_path: String,
    /// AWS managed policies attached to the task execution role.
    pub execution_role_policies: Vec<String>,
    pub scaling: Option<ScalingSpec>,
}

/// CPU-utilization target tracking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingSpec {
    pub min_capacity: u32,
    pub max_capacity: u32,
    pub target_cpu_percent: u32,
    pub scale_in_cooldown_secs: u32,
    pub scale_out_cooldown_secs: u32,
}

/// The identity a grant is given to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Principal {
    /// The task role of a service (what the application runs as).
    TaskRole(String),
    /// The execution role of a service (what pulls images and writes logs).
    ExecutionRole(String),
    /// The service role of a build project.
    BuildProject(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    ReadData,
    ReadWriteData,
    SendMessages,
    /// Pull and push images of a repository.
    PullPush,
}

impl Access {
    fn actions(self) -> &'static [&'static str] {
        match self {
            Access::ReadData => &[
                "dynamodb:BatchGetItem",
                "dynamodb:GetItem",
                "dynamodb:Query",
                "dynamodb:Scan",
                "dynamodb:DescribeTable",
            ],
            Access::ReadWriteData => &[
                "dynamodb:BatchGetItem",
                "dynamodb:GetItem",
                "dynamodb:Query",
                "dynamodb:Scan",
                "dynamodb:DescribeTable",
                "dynamodb:BatchWriteItem",
                "dynamodb:PutItem",
                "dynamodb:UpdateItem",
                "dynamodb:DeleteItem",
            ],
            Access::SendMessages => &["sqs:SendMessage", "sqs:GetQueueAttributes", "sqs:GetQueueUrl"],
            Access::PullPush => &[
                "ecr:BatchCheckLayerAvailability",
                "ecr:GetDownloadUrlForLayer",
                "ecr:BatchGetImage",
                "ecr:PutImage",
                "ecr:InitiateLayerUpload",
                "ecr:UploadLayerPart",
                "ecr:CompleteLayerUpload",
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub principal: Principal,
    /// Logical id of the table or queue.
    pub resource: String,
    pub access: Access,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputValue {
    /// DNS name of a service's load balancer.
    LoadBalancerDns { service: String },
    /// ARN of a function.
    FunctionArn { function: String },
    /// `<repository uri>:<tag>`
    RepositoryImage { repository: String, tag: String },
    Literal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackOutput {
    pub name: String,
    /// Base export name; qualified like a physical name at synthesis.
    pub export_name: Option<String>,
    pub value: OutputValue,
}

/// One environment's resource set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentStack {
    pub name: String,
    pub environment: Environment,
    pub queues: Vec<QueueSpec>,
    pub tables: Vec<TableSpec>,
    pub functions: Vec<FunctionSpec>,
    pub repositories: Vec<RepositorySpec>,
    pub build_roles: Vec<BuildRoleSpec>,
    pub network: Option<NetworkSpec>,
    pub services: Vec<ServiceSpec>,
    pub grants: Vec<Grant>,
    pub outputs: Vec<StackOutput>,
}

impl EnvironmentStack {
    pub fn new(name: impl Into<String>, environment: Environment) -> Self {
        Self {
            name: name.into(),
            environment,
            queues: Vec::new(),
            tables: Vec::new(),
            functions: Vec::new(),
            repositories: Vec::new(),
            build_roles: Vec::new(),
            network: None,
            services: Vec::new(),
            grants: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_queue(mut self, queue: QueueSpec) -> Self {
        self.queues.push(queue);
        self
    }

    pub fn with_table(mut self, table: TableSpec) -> Self {
        self.tables.push(table);
        self
    }

    pub fn with_function(mut self, function: FunctionSpec) -> Self {
        self.functions.push(function);
        self
    }

    pub fn with_repository(mut self, repository: RepositorySpec) -> Self {
        self.repositories.push(repository);
        self
    }

    pub fn with_build_role(mut self, role: BuildRoleSpec) -> Self {
        self.build_roles.push(role);
        self
    }

    pub fn with_network(mut self, network: NetworkSpec) -> Self {
        self.network = Some(network);
        self
    }

    pub fn with_service(mut self, service: ServiceSpec) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_grant(mut self, grant: Grant) -> Self {
        self.grants.push(grant);
        self
    }

    pub fn with_output(mut self, output: StackOutput) -> Self {
        self.outputs.push(output);
        self
    }

    /// Environment-qualified physical name for a resource.
    pub fn physical_name(&self, base: &str) -> String {
        format!("{}-{}-{}", self.name, base, self.environment.qualifier())
    }

    /// [`physical_name`](Self::physical_name) fitted into `max_len`
    /// characters.
    ///
    /// A name that is too long keeps its leading characters and ends with a
    /// hash of the full name, so shortened names stay distinct.
    pub fn bounded_physical_name(&self, base: &str, max_len: usize) -> String {
        let full = self.physical_name(base);
        if full.len() <= max_len {
            return full;
        }
        let digest = hex::encode(Sha256::digest(full.as_bytes()));
        let keep = max_len.saturating_sub(NAME_HASH_LEN + 1);
        let prefix: String = full.chars().take(keep).collect();
        format!(
            "{}-{}",
            prefix.trim_end_matches('-'),
            &digest[..NAME_HASH_LEN]
        )
    }

    /// Physical name for `property` of a resource, within its length limit.
    fn name_for(&self, property: &str, base: &str) -> String {
        self.bounded_physical_name(base, name_limit(property))
    }

    /// Template parameters every service image needs.
    pub fn parameters(&self) -> BTreeMap<String, Value> {
        self.services
            .iter()
            .flat_map(|s| s.image.template_parameters())
            .collect()
    }

    /// Synthesize the stack into a template.
    pub fn synthesize(&self) -> Result<Value> {
        let mut resources = Map::new();

        for queue in &self.queues {
            resources.insert(
                queue.logical_id.clone(),
                json!({
                    "Type": "AWS::SQS::Queue",
                    "Properties": {
                        "QueueName": self.name_for("QueueName", &queue.logical_id),
                        "VisibilityTimeout": queue.visibility_timeout_secs,
                    },
                    "DeletionPolicy": "Delete",
                }),
            );
        }

        for table in &self.tables {
            resources.insert(table.logical_id.clone(), self.table_resource(table));
        }

        for function in &self.functions {
            self.function_resources(function, &mut resources);
        }

        for repository in &self.repositories {
            let policy = repository.removal.deletion_policy();
            resources.insert(
                repository.logical_id.clone(),
                json!({
                    "Type": "AWS::ECR::Repository",
                    "Properties": { "RepositoryName": repository.repository_name },
                    "UpdateReplacePolicy": policy,
                    "DeletionPolicy": policy,
                }),
            );
        }

        for role in &self.build_roles {
            resources.insert(
                role.role_id(),
                json!({
                    "Type": "AWS::IAM::Role",
                    "Properties": {
                        "RoleName": self.name_for("RoleName", &role.role_id()),
                        "AssumeRolePolicyDocument": assume_role("codebuild.amazonaws.com"),
                    },
                }),
            );
        }

        if let Some(network) = &self.network {
            if network.max_azs == 0 || network.max_azs > MAX_AZS {
                return Err(Error::InvalidInput(format!(
                    "stack {}: network spans {} availability zones, expected 1 to {}",
                    self.name, network.max_azs, MAX_AZS
                )));
            }
            self.network_resources(network, &mut resources);
        }

        for service in &self.services {
            let network = self.network.as_ref().ok_or_else(|| {
                Error::InvalidInput(format!(
                    "stack {}: service '{}' needs a network",
                    self.name, service.logical_id
                ))
            })?;
            self.service_resources(service, network, &mut resources);
        }

        for grant in &self.grants {
            let (logical_id, policy) = self.grant_resource(grant)?;
            resources.insert(logical_id, policy);
        }

        let mut outputs = Map::new();
        for output in &self.outputs {
            let unknown = |kind: &str, id: &str| {
                Error::InvalidInput(format!(
                    "stack {}: output '{}' references unknown {} '{}'",
                    self.name, output.name, kind, id
                ))
            };
            let value = match &output.value {
                OutputValue::LoadBalancerDns { service } => {
                    if !self.services.iter().any(|s| &s.logical_id == service) {
                        return Err(unknown("service", service));
                    }
                    json!({ "Fn::GetAtt": [format!("{}LoadBalancer", service), "DNSName"] })
                }
                OutputValue::FunctionArn { function } => {
                    if !self.functions.iter().any(|f| &f.logical_id == function) {
                        return Err(unknown("function", function));
                    }
                    json!({ "Fn::GetAtt": [function, "Arn"] })
                }
                OutputValue::RepositoryImage { repository, tag } => {
                    if !self.repositories.iter().any(|r| &r.logical_id == repository) {
                        return Err(unknown("repository", repository));
                    }
                    json!({
                        "Fn::Join": ["", [
                            { "Fn::GetAtt": [repository, "RepositoryUri"] },
                            format!(":{}", tag),
                        ]]
                    })
                }
                OutputValue::Literal(value) => json!(value),
            };
            let mut entry = json!({ "Value": value });
            if let Some(export) = &output.export_name {
                entry["Export"] = json!({ "Name": self.bounded_physical_name(export, 255) });
            }
            outputs.insert(output.name.clone(), entry);
        }

        Ok(json!({
            "AWSTemplateFormatVersion": TEMPLATE_FORMAT_VERSION,
            "Description": format!("{} ({})", self.name, self.environment),
            "Metadata": {
                "Environment": {
                    "Account": self.environment.account,
                    "Region": self.environment.region,
                }
            },
            "Parameters": self.parameters(),
            "Resources": resources,
            "Outputs": outputs,
        }))
    }

    /// Every physical identifier the synthesized stack claims, including
    /// export names.
    pub fn resource_ids(&self) -> Result<BTreeSet<String>> {
        let template = self.synthesize()?;
        let mut ids = BTreeSet::new();

        if let Some(resources) = template["Resources"].as_object() {
            for resource in resources.values() {
                let Some(props) = resource["Properties"].as_object() else {
                    continue;
                };
                for key in PHYSICAL_NAME_PROPERTIES {
                    if let Some(name) = props.get(*key).and_then(Value::as_str) {
                        ids.insert(name.to_string());
                    }
                }
            }
        }
        if let Some(outputs) = template["Outputs"].as_object() {
            for output in outputs.values() {
                if let Some(name) = output["Export"]["Name"].as_str() {
                    ids.insert(name.to_string());
                }
            }
        }
        Ok(ids)
    }

    fn table_resource(&self, table: &TableSpec) -> Value {
        let mut key_schema = vec![json!({
            "AttributeName": table.partition_key.name,
            "KeyType": "HASH",
        })];
        let mut attributes = vec![json!({
            "AttributeName": table.partition_key.name,
            "AttributeType": table.partition_key.attribute_type.code(),
        })];
        if let Some(sort) = &table.sort_key {
            key_schema.push(json!({ "AttributeName": sort.name, "KeyType": "RANGE" }));
            attributes.push(json!({
                "AttributeName": sort.name,
                "AttributeType": sort.attribute_type.code(),
            }));
        }

        let mut properties = json!({
            "TableName": self.name_for("TableName", &table.table_name),
            "KeySchema": key_schema,
            "AttributeDefinitions": attributes,
        });
        match table.billing {
            BillingMode::PayPerRequest => {
                properties["BillingMode"] = json!("PAY_PER_REQUEST");
            }
            BillingMode::Provisioned { read, write } => {
                properties["BillingMode"] = json!("PROVISIONED");
                properties["ProvisionedThroughput"] = json!({
                    "ReadCapacityUnits": read,
                    "WriteCapacityUnits": write,
                });
            }
        }

        let policy = table.removal.deletion_policy();
        json!({
            "Type": "AWS::DynamoDB::Table",
            "Properties": properties,
            "UpdateReplacePolicy": policy,
            "DeletionPolicy": policy,
        })
    }

    fn network_resources(&self, network: &NetworkSpec, resources: &mut Map<String, Value>) {
        let vpc = &network.logical_id;
        let tagged = |id: &str| json!([{ "Key": "Name", "Value": self.physical_name(id) }]);
        resources.insert(
            vpc.clone(),
            json!({
                "Type": "AWS::EC2::VPC",
                "Properties": {
                    "CidrBlock": "10.0.0.0/16",
                    "EnableDnsHostnames": true,
                    "EnableDnsSupport": true,
                    "Tags": tagged(vpc),
                },
            }),
        );

        let gateway = format!("{}InternetGateway", vpc);
        let attachment = format!("{}GatewayAttachment", vpc);
        let public_routes = format!("{}PublicRouteTable", vpc);
        resources.insert(
            gateway.clone(),
            json!({
                "Type": "AWS::EC2::InternetGateway",
                "Properties": { "Tags": tagged(&gateway) },
            }),
        );
        resources.insert(
            attachment.clone(),
            json!({
                "Type": "AWS::EC2::VPCGatewayAttachment",
                "Properties": {
                    "VpcId": { "Ref": vpc },
                    "InternetGatewayId": { "Ref": gateway },
                },
            }),
        );
        resources.insert(
            public_routes.clone(),
            json!({
                "Type": "AWS::EC2::RouteTable",
                "Properties": { "VpcId": { "Ref": vpc } },
            }),
        );
        resources.insert(
            format!("{}PublicDefaultRoute", vpc),
            json!({
                "Type": "AWS::EC2::Route",
                "Properties": {
                    "RouteTableId": { "Ref": public_routes },
                    "DestinationCidrBlock": "0.0.0.0/0",
                    "GatewayId": { "Ref": gateway },
                },
                "DependsOn": attachment,
            }),
        );

        let nats = network.nat_gateways.min(network.max_azs);
        for nat in 1..=nats {
            let eip = format!("{}NatEip{}", vpc, nat);
            resources.insert(
                eip.clone(),
                json!({
                    "Type": "AWS::EC2::EIP",
                    "Properties": { "Domain": "vpc" },
                    "DependsOn": attachment,
                }),
            );
            resources.insert(
                format!("{}NatGateway{}", vpc, nat),
                json!({
                    "Type": "AWS::EC2::NatGateway",
                    "Properties": {
                        "AllocationId": { "Fn::GetAtt": [eip, "AllocationId"] },
                        "SubnetId": { "Ref": format!("{}PublicSubnet{}", vpc, nat) },
                    },
                }),
            );
        }

        // synthesize() bounds max_azs to MAX_AZS, so the zone letter stays in a..=f.
        for az in 0..network.max_azs {
            let zone = format!("{}{}", self.environment.region, char::from(b'a' + az));
            for (tier, offset, public) in [("Public", 0u32, true), ("Private", 128u32, false)] {
                let subnet = format!("{}{}Subnet{}", vpc, tier, az + 1);
                resources.insert(
                    subnet.clone(),
                    json!({
                        "Type": "AWS::EC2::Subnet",
                        "Properties": {
                            "VpcId": { "Ref": vpc },
                            "AvailabilityZone": zone,
                            "CidrBlock": format!("10.0.{}.0/24", offset + u32::from(az)),
                            "MapPublicIpOnLaunch": public,
                        },
                    }),
                );

                let route_table = if public {
                    public_routes.clone()
                } else {
                    let table = format!("{}RouteTable", subnet);
                    resources.insert(
                        table.clone(),
                        json!({
                            "Type": "AWS::EC2::RouteTable",
                            "Properties": { "VpcId": { "Ref": vpc } },
                        }),
                    );
                    if nats > 0 {
                        let nat = az % nats + 1;
                        resources.insert(
                            format!("{}DefaultRoute", subnet),
                            json!({
                                "Type": "AWS::EC2::Route",
                                "Properties": {
                                    "RouteTableId": { "Ref": table },
                                    "DestinationCidrBlock": "0.0.0.0/0",
                                    "NatGatewayId": { "Ref": format!("{}NatGateway{}", vpc, nat) },
                                },
                            }),
                        );
                    }
                    table
                };
                resources.insert(
                    format!("{}RouteTableAssociation", subnet),
                    json!({
                        "Type": "AWS::EC2::SubnetRouteTableAssociation",
                        "Properties": {
                            "SubnetId": { "Ref": subnet },
                            "RouteTableId": { "Ref": route_table },
                        },
                    }),
                );
            }
        }
    }

    fn function_resources(&self, function: &FunctionSpec, resources: &mut Map<String, Value>) {
        let id = &function.logical_id;
        let role = format!("{}ServiceRole", id);
        resources.insert(
            role.clone(),
            json!({
                "Type": "AWS::IAM::Role",
                "Properties": {
                    "RoleName": self.name_for("RoleName", &role),
                    "AssumeRolePolicyDocument": assume_role("lambda.amazonaws.com"),
                    "ManagedPolicyArns": [
                        "arn:aws:iam::aws:policy/service-role/AWSLambdaBasicExecutionRole"
                    ],
                },
            }),
        );

        let code = json!({
            "S3Bucket": { "Fn::Sub": "tradestore-assets-${AWS::AccountId}-${AWS::Region}" },
            "S3Key": format!("{}.zip", function.code_asset.trim_matches('/')),
        });
        resources.insert(
            id.clone(),
            json!({
                "Type": "AWS::Lambda::Function",
                "Properties": {
                    "FunctionName": self.name_for("FunctionName", id),
                    "Runtime": function.runtime,
                    "Handler": function.handler,
                    "Role": { "Fn::GetAtt": [role, "Arn"] },
                    "Code": code,
                },
                "DependsOn": role,
            }),
        );
    }

    fn subnet_refs(network: &NetworkSpec, tier: &str) -> Vec<Value> {
        (1..=network.max_azs)
            .map(|az| json!({ "Ref": format!("{}{}Subnet{}", network.logical_id, tier, az) }))
            .collect()
    }

    fn service_resources(
        &self,
        service: &ServiceSpec,
        network: &NetworkSpec,
        resources: &mut Map<String, Value>,
    ) {
        let id = &service.logical_id;
        let cluster = format!("{}Cluster", id);
        let task_definition = format!("{}TaskDefinition", id);
        let execution_role = format!("{}ExecutionRole", id);
        let task_role = format!("{}TaskRole", id);
        let load_balancer = format!("{}LoadBalancer", id);
        let target_group = format!("{}TargetGroup", id);
        let listener = format!("{}Listener", id);

        let assume_ecs_tasks = assume_role("ecs-tasks.amazonaws.com");
        let managed_policies: Vec<String> = service
            .execution_role_policies
            .iter()
            .map(|p| format!("arn:aws:iam::aws:policy/{}", p))
            .collect();

        resources.insert(
            cluster.clone(),
            json!({
                "Type": "AWS::ECS::Cluster",
                "Properties": { "ClusterName": self.name_for("ClusterName", &cluster) },
            }),
        );
        resources.insert(
            execution_role.clone(),
            json!({
                "Type": "AWS::IAM::Role",
                "Properties": {
                    "RoleName": self.name_for("RoleName", &execution_role),
                    "AssumeRolePolicyDocument": assume_ecs_tasks,
                    "ManagedPolicyArns": managed_policies,
                },
            }),
        );
        resources.insert(
            task_role.clone(),
            json!({
                "Type": "AWS::IAM::Role",
                "Properties": {
                    "RoleName": self.name_for("RoleName", &task_role),
                    "AssumeRolePolicyDocument": assume_ecs_tasks,
                },
            }),
        );

        let environment: Vec<Value> = service
            .environment
            .iter()
            .map(|(name, value)| json!({ "Name": name, "Value": value }))
            .collect();
        resources.insert(
            task_definition.clone(),
            json!({
                "Type": "AWS::ECS::TaskDefinition",
                "Properties": {
                    "Family": self.name_for("Family", &task_definition),
                    "Cpu": service.cpu.to_string(),
                    "Memory": service.memory_mib.to_string(),
                    "NetworkMode": "awsvpc",
                    "RequiresCompatibilities": ["FARGATE"],
                    "ExecutionRoleArn": { "Fn::GetAtt": [execution_role, "Arn"] },
                    "TaskRoleArn": { "Fn::GetAtt": [task_role, "Arn"] },
                    "ContainerDefinitions": [{
                        "Name": service.container_name,
                        "Image": service.image.template_value(),
                        "Essential": true,
                        "PortMappings": [{ "ContainerPort": service.container_port, "Protocol": "tcp" }],
                        "Environment": environment,
                    }],
                },
            }),
        );

        let (scheme, lb_subnets) = if service.public_load_balancer {
            ("internet-facing", Self::subnet_refs(network, "Public"))
        } else {
            ("internal", Self::subnet_refs(network, "Private"))
        };
        resources.insert(
            load_balancer.clone(),
            json!({
                "Type": "AWS::ElasticLoadBalancingV2::LoadBalancer",
                "Properties": {
                    "Name": self.name_for("Name", &load_balancer),
                    "Scheme": scheme,
                    "Type": "application",
                    "Subnets": lb_subnets,
                },
            }),
        );
        resources.insert(
            target_group.clone(),
            json!({
                "Type": "AWS::ElasticLoadBalancingV2::TargetGroup",
                "Properties": {
                    "Port": service.listener_port,
                    "Protocol": "HTTP",
                    "TargetType": "ip",
                    "VpcId": { "Ref": network.logical_id },
                    "HealthCheckPath": service.health_check_path,
                },
            }),
        );
        resources.insert(
            listener,
            json!({
                "Type": "AWS::ElasticLoadBalancingV2::Listener",
                "Properties": {
                    "LoadBalancerArn": { "Ref": load_balancer },
                    "Port": service.listener_port,
                    "Protocol": "HTTP",
                    "DefaultActions": [{ "Type": "forward", "TargetGroupArn": { "Ref": target_group } }],
                },
            }),
        );
        resources.insert(
            id.clone(),
            json!({
                "Type": "AWS::ECS::Service",
                "Properties": {
                    "ServiceName": self.name_for("ServiceName", id),
                    "Cluster": { "Ref": cluster },
                    "LaunchType": "FARGATE",
                    "DesiredCount": service.desired_count,
                    "TaskDefinition": { "Ref": task_definition },
                    "LoadBalancers": [{
                        "ContainerName": service.container_name,
                        "ContainerPort": service.container_port,
                        "TargetGroupArn": { "Ref": target_group },
                    }],
                    "NetworkConfiguration": {
                        "AwsvpcConfiguration": {
                            "Subnets": Self::subnet_refs(network, "Private"),
                        }
                    },
                },
            }),
        );

        if let Some(scaling) = &service.scaling {
            let scalable_target = format!("{}ScalableTarget", id);
            resources.insert(
                scalable_target.clone(),
                json!({
                    "Type": "AWS::ApplicationAutoScaling::ScalableTarget",
                    "Properties": {
                        "MinCapacity": scaling.min_capacity,
                        "MaxCapacity": scaling.max_capacity,
                        "ResourceId": {
                            "Fn::Join": ["/", ["service", { "Ref": cluster }, { "Fn::GetAtt": [id, "Name"] }]]
                        },
                        "ScalableDimension": "ecs:service:DesiredCount",
                        "ServiceNamespace": "ecs",
                    },
                }),
            );
            resources.insert(
                format!("{}CpuScaling", id),
                json!({
                    "Type": "AWS::ApplicationAutoScaling::ScalingPolicy",
                    "Properties": {
                        "PolicyName": self.name_for("PolicyName", &format!("{}CpuScaling", id)),
                        "PolicyType": "TargetTrackingScaling",
                        "ScalingTargetId": { "Ref": scalable_target },
                        "TargetTrackingScalingPolicyConfiguration": {
                            "PredefinedMetricSpecification": {
                                "PredefinedMetricType": "ECSServiceAverageCPUUtilization"
                            },
                            "TargetValue": scaling.target_cpu_percent,
                            "ScaleInCooldown": scaling.scale_in_cooldown_secs,
                            "ScaleOutCooldown": scaling.scale_out_cooldown_secs,
                        },
                    },
                }),
            );
        }
    }

    fn grant_resource(&self, grant: &Grant) -> Result<(String, Value)> {
        let (owner, known_owner, role) = match &grant.principal {
            Principal::TaskRole(service) => (
                service,
                self.services.iter().any(|s| &s.logical_id == service),
                format!("{}TaskRole", service),
            ),
            Principal::ExecutionRole(service) => (
                service,
                self.services.iter().any(|s| &s.logical_id == service),
                format!("{}ExecutionRole", service),
            ),
            Principal::BuildProject(project) => (
                project,
                self.build_roles.iter().any(|r| &r.project == project),
                BuildRoleSpec::new(project.as_str()).role_id(),
            ),
        };
        if !known_owner {
            return Err(Error::InvalidInput(format!(
                "stack {}: grant names unknown principal '{}'",
                self.name, owner
            )));
        }
        let known = self.tables.iter().any(|t| t.logical_id == grant.resource)
            || self.queues.iter().any(|q| q.logical_id == grant.resource)
            || self.repositories.iter().any(|r| r.logical_id == grant.resource);
        if !known {
            return Err(Error::InvalidInput(format!(
                "stack {}: grant names unknown resource '{}'",
                self.name, grant.resource
            )));
        }

        let mut statements = vec![json!({
            "Effect": "Allow",
            "Action": grant.access.actions(),
            "Resource": [{ "Fn::GetAtt": [grant.resource, "Arn"] }],
        })];
        // Registry logins are not scoped to a repository.
        if grant.access == Access::PullPush {
            statements.push(json!({
                "Effect": "Allow",
                "Action": ["ecr:GetAuthorizationToken"],
                "Resource": "*",
            }));
        }

        let logical_id = format!("{}{}Policy", role, grant.resource);
        let policy = json!({
            "Type": "AWS::IAM::Policy",
            "Properties": {
                "PolicyName": self.name_for("PolicyName", &logical_id),
                "Roles": [{ "Ref": role }],
                "PolicyDocument": {
                    "Version": "2012-10-17",
                    "Statement": statements,
                },
            },
        });
        Ok((logical_id, policy))
    }
}

fn assume_role(service: &str) -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": service },
            "Action": "sts:AssumeRole",
        }],
    })
}

/// A reusable unit instantiated once per deployment target.
pub trait DeployableUnit: Send + Sync {
    fn name(&self) -> &str;

    /// The stacks making up one instance of this unit for `target`.
    fn instantiate(&self, target: &DeploymentTarget) -> Vec<EnvironmentStack>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack(env: Environment) -> EnvironmentStack {
        EnvironmentStack::new("Devo-WebService", env)
            .with_queue(QueueSpec {
                logical_id: "Queue".into(),
                visibility_timeout_secs: 300,
            })
            .with_table(TableSpec {
                logical_id: "Table".into(),
                table_name: "Records".into(),
                partition_key: KeySpec::new("Id", AttributeType::String),
                sort_key: Some(KeySpec::new("Version", AttributeType::Number)),
                billing: BillingMode::PayPerRequest,
                removal: RemovalPolicy::Destroy,
            })
            .with_network(NetworkSpec {
                logical_id: "Vpc".into(),
                max_azs: 2,
                nat_gateways: 1,
            })
            .with_service(ServiceSpec {
                logical_id: "Web".into(),
                container_name: "web".into(),
                container_port: 8080,
                cpu: 256,
                memory_mib: 512,
                desired_count: 1,
                listener_port: 80,
                public_load_balancer: true,
                environment: BTreeMap::new(),
                image: ContainerImage::Registry("nginx".into()),
                health_check_path: HEALTH_CHECK_PATH.into(),
                execution_role_policies: vec!["AmazonEC2ContainerRegistryPowerUser".into()],
                scaling: Some(ScalingSpec {
                    min_capacity: 1,
                    max_capacity: 2,
                    target_cpu_percent: 50,
                    scale_in_cooldown_secs: 60,
                    scale_out_cooldown_secs: 60,
                }),
            })
            .with_grant(Grant {
                principal: Principal::TaskRole("Web".into()),
                resource: "Table".into(),
                access: Access::ReadWriteData,
            })
            .with_output(StackOutput {
                name: LOAD_BALANCER_URL_OUTPUT.into(),
                export_name: Some(LOAD_BALANCER_URL_OUTPUT.into()),
                value: OutputValue::LoadBalancerDns {
                    service: "Web".into(),
                },
            })
    }

    #[test]
    fn test_synthesize_resources() {
        let template = stack(Environment::new("111111111111", "us-east-1"))
            .synthesize()
            .unwrap();
        let resources = &template["Resources"];

        assert_eq!(resources["Queue"]["Properties"]["VisibilityTimeout"], 300);
        assert_eq!(
            resources["Table"]["Properties"]["KeySchema"][1]["KeyType"],
            "RANGE"
        );
        assert_eq!(
            resources["Table"]["Properties"]["AttributeDefinitions"][1]["AttributeType"],
            "N"
        );
        assert_eq!(resources["Table"]["DeletionPolicy"], "Delete");
        assert!(resources.get("VpcNatGateway1").is_some());
        assert!(resources.get("VpcNatGateway2").is_none());
        assert_eq!(
            resources["WebTargetGroup"]["Properties"]["HealthCheckPath"],
            "/health"
        );
        assert_eq!(
            resources["WebExecutionRole"]["Properties"]["ManagedPolicyArns"][0],
            "arn:aws:iam::aws:policy/AmazonEC2ContainerRegistryPowerUser"
        );
        assert_eq!(
            resources["WebCpuScaling"]["Properties"]["TargetTrackingScalingPolicyConfiguration"]
                ["TargetValue"],
            50
        );
        assert_eq!(
            resources["WebTaskRoleTablePolicy"]["Properties"]["Roles"][0]["Ref"],
            "WebTaskRole"
        );
        assert_eq!(
            template["Outputs"]["loadBalancerUrl"]["Export"]["Name"],
            "Devo-WebService-loadBalancerUrl-us-east-1-111111111111"
        );
    }

    #[test]
    fn test_two_environments_share_no_identifiers() {
        let a = stack(Environment::new("111111111111", "us-west-2"))
            .resource_ids()
            .unwrap();
        let b = stack(Environment::new("111111111111", "us-east-1"))
            .resource_ids()
            .unwrap();
        assert!(!a.is_empty());
        let shared: Vec<_> = a.intersection(&b).collect();
        assert!(shared.is_empty(), "shared identifiers: {:?}", shared);
    }

    #[test]
    fn test_service_requires_network() {
        let mut s = stack(Environment::new("111111111111", "us-east-1"));
        s.network = None;
        assert!(s.synthesize().is_err());
    }

    #[test]
    fn test_names_within_aws_limits() {
        let template = stack(Environment::new("111111111111", "us-east-1"))
            .synthesize()
            .unwrap();
        for (id, resource) in template["Resources"].as_object().unwrap() {
            for key in PHYSICAL_NAME_PROPERTIES {
                if let Some(name) = resource["Properties"][*key].as_str() {
                    assert!(
                        name.len() <= name_limit(key),
                        "{}.{} is {} characters: {}",
                        id,
                        key,
                        name.len(),
                        name
                    );
                }
            }
        }

        let lb_name = template["Resources"]["WebLoadBalancer"]["Properties"]["Name"]
            .as_str()
            .unwrap();
        assert!(lb_name.starts_with("Devo-WebService-WebLoad"));
        assert!(!lb_name.contains("--"));
    }

    #[test]
    fn test_shortened_names_stay_distinct() {
        let west = stack(Environment::new("111111111111", "us-west-2"));
        let east = stack(Environment::new("111111111111", "us-east-1"));
        let a = west.bounded_physical_name("WebLoadBalancer", 32);
        let b = east.bounded_physical_name("WebLoadBalancer", 32);
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert_eq!(a, west.bounded_physical_name("WebLoadBalancer", 32));
        assert_eq!(west.bounded_physical_name("Queue", 255), west.physical_name("Queue"));
    }

    #[test]
    fn test_network_has_internet_and_nat_routes() {
        let template = stack(Environment::new("111111111111", "us-east-1"))
            .synthesize()
            .unwrap();
        let resources = &template["Resources"];

        assert_eq!(resources["VpcInternetGateway"]["Type"], "AWS::EC2::InternetGateway");
        assert_eq!(
            resources["VpcGatewayAttachment"]["Properties"]["InternetGatewayId"]["Ref"],
            "VpcInternetGateway"
        );
        assert_eq!(
            resources["VpcPublicDefaultRoute"]["Properties"]["GatewayId"]["Ref"],
            "VpcInternetGateway"
        );
        assert_eq!(
            resources["VpcNatGateway1"]["Properties"]["AllocationId"]["Fn::GetAtt"][0],
            "VpcNatEip1"
        );
        assert_eq!(resources["VpcNatEip1"]["Properties"]["Domain"], "vpc");

        // One NAT gateway serves both private subnets.
        for az in 1..=2 {
            let route = &resources[format!("VpcPrivateSubnet{}DefaultRoute", az)];
            assert_eq!(route["Properties"]["NatGatewayId"]["Ref"], "VpcNatGateway1");
            let association = &resources[format!("VpcPublicSubnet{}RouteTableAssociation", az)];
            assert_eq!(
                association["Properties"]["RouteTableId"]["Ref"],
                "VpcPublicRouteTable"
            );
        }
        assert_eq!(resources["VpcPrivateSubnet2"]["Properties"]["AvailabilityZone"], "us-east-1b");
    }

    #[test]
    fn test_availability_zones_bounded() {
        for max_azs in [0, MAX_AZS + 1, u8::MAX] {
            let mut s = stack(Environment::new("111111111111", "us-east-1"));
            if let Some(network) = s.network.as_mut() {
                network.max_azs = max_azs;
            }
            assert!(matches!(s.synthesize(), Err(Error::InvalidInput(_))));
        }
    }

    #[test]
    fn test_function_with_role_and_output() {
        let template = stack(Environment::new("111111111111", "us-east-1"))
            .with_function(FunctionSpec {
                logical_id: "Lambda".into(),
                runtime: "nodejs14.x".into(),
                handler: "handler.handler".into(),
                code_asset: "lambda".into(),
            })
            .with_output(StackOutput {
                name: "lambdaArn".into(),
                export_name: None,
                value: OutputValue::FunctionArn {
                    function: "Lambda".into(),
                },
            })
            .synthesize()
            .unwrap();
        let function = &template["Resources"]["Lambda"];

        assert_eq!(function["Properties"]["Handler"], "handler.handler");
        assert_eq!(function["Properties"]["Role"]["Fn::GetAtt"][0], "LambdaServiceRole");
        assert_eq!(function["Properties"]["Code"]["S3Key"], "lambda.zip");
        assert_eq!(
            template["Resources"]["LambdaServiceRole"]["Properties"]["AssumeRolePolicyDocument"]
                ["Statement"][0]["Principal"]["Service"],
            "lambda.amazonaws.com"
        );
        assert_eq!(template["Outputs"]["lambdaArn"]["Value"]["Fn::GetAtt"][0], "Lambda");
    }

    #[test]
    fn test_repository_grant_to_build_project() {
        let env = Environment::new("111111111111", "us-east-1");
        let template = EnvironmentStack::new("TradeStoreBuildStack", env)
            .with_repository(RepositorySpec {
                logical_id: "Repo".into(),
                repository_name: "trade-store-app".into(),
                removal: RemovalPolicy::Retain,
            })
            .with_build_role(BuildRoleSpec::new("AppBuild"))
            .with_grant(Grant {
                principal: Principal::BuildProject("AppBuild".into()),
                resource: "Repo".into(),
                access: Access::PullPush,
            })
            .with_output(StackOutput {
                name: "image".into(),
                export_name: None,
                value: OutputValue::RepositoryImage {
                    repository: "Repo".into(),
                    tag: "latest".into(),
                },
            })
            .synthesize()
            .unwrap();
        let resources = &template["Resources"];

        assert_eq!(resources["Repo"]["Properties"]["RepositoryName"], "trade-store-app");
        assert_eq!(resources["Repo"]["DeletionPolicy"], "Retain");
        let policy = &resources["AppBuildRoleRepoPolicy"]["Properties"];
        assert_eq!(policy["Roles"][0]["Ref"], "AppBuildRole");
        let statements = policy["PolicyDocument"]["Statement"].as_array().unwrap();
        assert!(statements[0]["Action"].as_array().unwrap().contains(&json!("ecr:PutImage")));
        assert_eq!(statements[1]["Action"][0], "ecr:GetAuthorizationToken");
        assert_eq!(
            template["Outputs"]["image"]["Value"]["Fn::Join"][1][1],
            ":latest"
        );
    }

    #[test]
    fn test_grant_to_unknown_build_project() {
        let s = stack(Environment::new("111111111111", "us-east-1")).with_grant(Grant {
            principal: Principal::BuildProject("Missing".into()),
            resource: "Table".into(),
            access: Access::ReadData,
        });
        assert!(matches!(s.synthesize(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_grant_to_unknown_resource() {
        let s = stack(Environment::new("111111111111", "us-east-1")).with_grant(Grant {
            principal: Principal::TaskRole("Web".into()),
            resource: "Missing".into(),
            access: Access::ReadData,
        });
        assert!(matches!(s.synthesize(), Err(Error::InvalidInput(_))));
    }
}
