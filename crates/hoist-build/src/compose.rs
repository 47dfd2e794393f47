use std::collections::BTreeMap;

use hoist_core::template::section;
use hoist_core::{Node, NodeMap, Placement, StackIdentity, StackTemplate, WorkloadConfig};

use crate::addons::AddonBundle;

/// Logical ID of the nested addons stack in the composed template.
pub const ADDONS_STACK_ID: &str = "AddonsStack";
/// Project-relative location of the bundled addons template.
pub const ADDONS_TEMPLATE_PATH: &str = ".hoist/build/addons.yml";

pub const LOG_GROUP_ID: &str = "LogGroup";
pub const EXECUTION_ROLE_ID: &str = "ExecutionRole";
pub const TASK_ROLE_ID: &str = "TaskRole";
pub const TASK_DEFINITION_ID: &str = "TaskDefinition";
pub const SERVICE_ID: &str = "Service";
pub const SCALABLE_TARGET_ID: &str = "ScalableTarget";
pub const SCALING_POLICY_ID: &str = "ScalingPolicy";

const EXECUTION_POLICY: &str =
    "arn:${AWS::Partition}:iam::aws:policy/service-role/AmazonECSTaskExecutionRolePolicy";
const AUTOSCALING_ROLE: &str = "arn:${AWS::Partition}:iam::${AWS::AccountId}:role/aws-service-role/ecs.application-autoscaling.amazonaws.com/AWSServiceRoleForApplicationAutoScaling_ECSService";

/// Builds the workload stack template from configuration and an addon bundle.
pub struct StackComposer<'a> {
    identity: &'a StackIdentity,
    workload: &'a WorkloadConfig,
}

impl<'a> StackComposer<'a> {
    pub fn new(identity: &'a StackIdentity, workload: &'a WorkloadConfig) -> Self {
        Self { identity, workload }
    }

    pub fn compose(&self, bundle: &AddonBundle) -> StackTemplate {
        let mut resources = NodeMap::new();
        resources.insert(LOG_GROUP_ID.to_owned(), self.log_group());
        resources.insert(EXECUTION_ROLE_ID.to_owned(), self.execution_role(bundle));
        resources.insert(TASK_ROLE_ID.to_owned(), task_role());
        resources.insert(TASK_DEFINITION_ID.to_owned(), self.task_definition(bundle));
        resources.insert(SERVICE_ID.to_owned(), self.service());

        if let Some(scaling) = &self.workload.scaling {
            resources.insert(
                SCALABLE_TARGET_ID.to_owned(),
                resource(
                    "AWS::ApplicationAutoScaling::ScalableTarget",
                    Node::map([
                        ("MinCapacity", scaling.min.into()),
                        ("MaxCapacity", scaling.max.into()),
                        (
                            "ResourceId",
                            join(
                                "/",
                                vec![
                                    "service".into(),
                                    cluster(),
                                    Node::get_att(SERVICE_ID, "Name"),
                                ],
                            ),
                        ),
                        ("ScalableDimension", "ecs:service:DesiredCount".into()),
                        ("ServiceNamespace", "ecs".into()),
                        ("RoleARN", Node::sub(AUTOSCALING_ROLE)),
                    ]),
                ),
            );
            resources.insert(
                SCALING_POLICY_ID.to_owned(),
                resource(
                    "AWS::ApplicationAutoScaling::ScalingPolicy",
                    Node::map([
                        (
                            "PolicyName",
                            join("-", vec![Node::reference("WorkloadName"), "cpu".into()]),
                        ),
                        ("PolicyType", "TargetTrackingScaling".into()),
                        ("ScalingTargetId", Node::reference(SCALABLE_TARGET_ID)),
                        (
                            "TargetTrackingScalingPolicyConfiguration",
                            Node::map([
                                (
                                    "PredefinedMetricSpecification",
                                    Node::map([(
                                        "PredefinedMetricType",
                                        "ECSServiceAverageCPUUtilization".into(),
                                    )]),
                                ),
                                ("TargetValue", scaling.cpu_percentage.into()),
                                ("ScaleInCooldown", 120u32.into()),
                                ("ScaleOutCooldown", 60u32.into()),
                            ]),
                        ),
                    ]),
                ),
            );
        }

        if !bundle.is_empty() {
            resources.insert(ADDONS_STACK_ID.to_owned(), addons_stack(bundle));
        }

        let mut template = StackTemplate::new();
        template.set(section::FORMAT_VERSION, "2010-09-09");
        template.set(
            section::DESCRIPTION,
            format!(
                "hoist workload {} in {}/{}",
                self.identity.workload, self.identity.app, self.identity.env
            ),
        );
        template.set(
            section::METADATA,
            Node::map([("hoist:version", env!("CARGO_PKG_VERSION").into())]),
        );
        template.set(section::PARAMETERS, parameter_declarations());
        template.set(section::RESOURCES, resources);
        template.set(
            section::OUTPUTS,
            Node::map([
                (
                    "ServiceName",
                    Node::map([("Value", Node::get_att(SERVICE_ID, "Name"))]),
                ),
                (
                    "TaskDefinitionArn",
                    Node::map([("Value", Node::reference(TASK_DEFINITION_ID))]),
                ),
            ]),
        );
        template
    }

    /// Stack identity, `<app>-<env>-<workload>`.
    pub fn stack_name(&self) -> String {
        self.identity.stack_name()
    }

    /// Values for the template's parameters, in the shape the control plane
    /// accepts.
    pub fn parameters(&self, image: &str) -> BTreeMap<String, String> {
        let count = match &self.workload.scaling {
            Some(scaling) => scaling.min,
            None => self.workload.count,
        };
        BTreeMap::from([
            ("AppName".to_owned(), self.identity.app.clone()),
            ("EnvName".to_owned(), self.identity.env.clone()),
            ("WorkloadName".to_owned(), self.identity.workload.clone()),
            ("ContainerImage".to_owned(), image.to_owned()),
            ("ContainerPort".to_owned(), self.workload.port.to_string()),
            ("TaskCPU".to_owned(), self.workload.cpu.to_string()),
            ("TaskMemory".to_owned(), self.workload.memory.to_string()),
            ("TaskCount".to_owned(), count.to_string()),
            (
                "LogRetention".to_owned(),
                self.workload.log_retention_days.to_string(),
            ),
        ])
    }

    fn log_group(&self) -> Node {
        resource(
            "AWS::Logs::LogGroup",
            Node::map([
                (
                    "LogGroupName",
                    Node::sub("/hoist/${AppName}-${EnvName}-${WorkloadName}"),
                ),
                ("RetentionInDays", Node::reference("LogRetention")),
            ]),
        )
    }

    fn execution_role(&self, bundle: &AddonBundle) -> Node {
        let mut managed = vec![Node::sub(EXECUTION_POLICY)];
        managed.extend(
            bundle
                .policy_outputs
                .iter()
                .map(|name| addon_output(name)),
        );

        let mut properties = NodeMap::from([
            (
                "AssumeRolePolicyDocument".to_owned(),
                assume_role("ecs-tasks.amazonaws.com"),
            ),
            ("ManagedPolicyArns".to_owned(), Node::List(managed)),
        ]);

        let mut secret_arns: Vec<Node> = self
            .workload
            .secrets
            .values()
            .map(|arn| Node::string(arn.as_str()))
            .collect();
        secret_arns.extend(bundle.secret_outputs.iter().map(|name| addon_output(name)));
        if !secret_arns.is_empty() {
            properties.insert(
                "Policies".to_owned(),
                Node::list([Node::map([
                    ("PolicyName", "SecretsAccess".into()),
                    (
                        "PolicyDocument",
                        Node::map([
                            ("Version", "2012-10-17".into()),
                            (
                                "Statement",
                                Node::list([Node::map([
                                    ("Effect", "Allow".into()),
                                    (
                                        "Action",
                                        Node::list([
                                            Node::string("ssm:GetParameters"),
                                            Node::string("secretsmanager:GetSecretValue"),
                                        ]),
                                    ),
                                    ("Resource", Node::List(secret_arns)),
                                ])]),
                            ),
                        ]),
                    ),
                ])]),
            );
        }

        resource("AWS::IAM::Role", Node::Map(properties))
    }

    fn task_definition(&self, bundle: &AddonBundle) -> Node {
        let mut environment: BTreeMap<String, Node> = BTreeMap::from([
            (
                "HOIST_APPLICATION_NAME".to_owned(),
                Node::reference("AppName"),
            ),
            (
                "HOIST_ENVIRONMENT_NAME".to_owned(),
                Node::reference("EnvName"),
            ),
            ("HOIST_SERVICE_NAME".to_owned(), Node::reference("WorkloadName")),
        ]);
        for name in &bundle.variable_outputs {
            environment.insert(upper_snake(name), addon_output(name));
        }
        for (name, value) in &self.workload.variables {
            environment.insert(name.clone(), Node::string(value.as_str()));
        }

        let mut secrets: BTreeMap<String, Node> = self
            .workload
            .secrets
            .iter()
            .map(|(name, arn)| (name.clone(), Node::string(arn.as_str())))
            .collect();
        for name in &bundle.secret_outputs {
            secrets.insert(upper_snake(name), addon_output(name));
        }

        let mut container = NodeMap::from([
            (
                "Name".to_owned(),
                Node::string(self.identity.workload.as_str()),
            ),
            ("Image".to_owned(), Node::reference("ContainerImage")),
            ("Essential".to_owned(), true.into()),
            (
                "PortMappings".to_owned(),
                Node::list([Node::map([(
                    "ContainerPort",
                    Node::reference("ContainerPort"),
                )])]),
            ),
            ("Environment".to_owned(), name_value_list(environment, "Value")),
            (
                "LogConfiguration".to_owned(),
                Node::map([
                    ("LogDriver", "awslogs".into()),
                    (
                        "Options",
                        Node::map([
                            ("awslogs-region", Node::reference("AWS::Region")),
                            ("awslogs-group", Node::reference(LOG_GROUP_ID)),
                            ("awslogs-stream-prefix", "hoist".into()),
                        ]),
                    ),
                ]),
            ),
        ]);
        if !secrets.is_empty() {
            container.insert("Secrets".to_owned(), name_value_list(secrets, "ValueFrom"));
        }
        if let Some(hc) = &self.workload.health_check {
            container.insert(
                "HealthCheck".to_owned(),
                Node::map([
                    (
                        "Command",
                        Node::list(hc.command.iter().map(|c| Node::string(c.as_str()))),
                    ),
                    ("Interval", hc.interval_secs.into()),
                    ("Retries", hc.retries.into()),
                    ("Timeout", hc.timeout_secs.into()),
                    ("StartPeriod", hc.start_period_secs.into()),
                ]),
            );
        }

        resource(
            "AWS::ECS::TaskDefinition",
            Node::map([
                (
                    "Family",
                    Node::sub("${AppName}-${EnvName}-${WorkloadName}"),
                ),
                ("Cpu", Node::reference("TaskCPU")),
                ("Memory", Node::reference("TaskMemory")),
                ("NetworkMode", "awsvpc".into()),
                ("RequiresCompatibilities", Node::list([Node::string("FARGATE")])),
                ("ExecutionRoleArn", Node::get_att(EXECUTION_ROLE_ID, "Arn")),
                ("TaskRoleArn", Node::get_att(TASK_ROLE_ID, "Arn")),
                ("ContainerDefinitions", Node::list([Node::Map(container)])),
            ]),
        )
    }

    fn service(&self) -> Node {
        let (subnets, public_ip) = match self.workload.placement {
            Placement::Public => ("PublicSubnets", "ENABLED"),
            Placement::Private => ("PrivateSubnets", "DISABLED"),
        };

        resource(
            "AWS::ECS::Service",
            Node::map([
                ("Cluster", cluster()),
                ("TaskDefinition", Node::reference(TASK_DEFINITION_ID)),
                ("DesiredCount", Node::reference("TaskCount")),
                ("LaunchType", "FARGATE".into()),
                ("PlatformVersion", "LATEST".into()),
                (
                    "DeploymentConfiguration",
                    Node::map([
                        ("MinimumHealthyPercent", 100u32.into()),
                        ("MaximumPercent", 200u32.into()),
                        (
                            "DeploymentCircuitBreaker",
                            Node::map([("Enable", true.into()), ("Rollback", true.into())]),
                        ),
                    ]),
                ),
                (
                    "NetworkConfiguration",
                    Node::map([(
                        "AwsvpcConfiguration",
                        Node::map([
                            ("AssignPublicIp", public_ip.into()),
                            ("Subnets", Node::split(",", environment_export(subnets))),
                            (
                                "SecurityGroups",
                                Node::list([environment_export("EnvironmentSecurityGroup")]),
                            ),
                        ]),
                    )]),
                ),
            ]),
        )
    }
}

/// Convert an output name to an environment variable name:
/// `TableName` becomes `TABLE_NAME`, `DDBTableName` becomes `DDB_TABLE_NAME`.
pub fn upper_snake(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if matches!(c, '-' | '_' | '.' | ' ') {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            continue;
        }
        if c.is_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            let boundary = prev.is_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_uppercase() && next_is_lower);
            if boundary && !out.ends_with('_') {
                out.push('_');
            }
        }
        out.extend(c.to_uppercase());
    }

    out
}

fn parameter_declarations() -> NodeMap {
    let declare = |kind: &str| Node::map([("Type", kind.into())]);
    NodeMap::from([
        ("AppName".to_owned(), declare("String")),
        ("EnvName".to_owned(), declare("String")),
        ("WorkloadName".to_owned(), declare("String")),
        ("ContainerImage".to_owned(), declare("String")),
        ("ContainerPort".to_owned(), declare("Number")),
        ("TaskCPU".to_owned(), declare("String")),
        ("TaskMemory".to_owned(), declare("String")),
        ("TaskCount".to_owned(), declare("Number")),
        ("LogRetention".to_owned(), declare("Number")),
    ])
}

fn addons_stack(bundle: &AddonBundle) -> Node {
    let mut parameters = NodeMap::from([
        ("App".to_owned(), Node::reference("AppName")),
        ("Env".to_owned(), Node::reference("EnvName")),
        ("Name".to_owned(), Node::reference("WorkloadName")),
    ]);
    for (name, value) in &bundle.parameter_values {
        parameters.insert(name.clone(), value.clone());
    }

    resource(
        "AWS::CloudFormation::Stack",
        Node::map([
            ("Parameters", Node::Map(parameters)),
            ("TemplateURL", ADDONS_TEMPLATE_PATH.into()),
        ]),
    )
}

fn task_role() -> Node {
    resource(
        "AWS::IAM::Role",
        Node::map([(
            "AssumeRolePolicyDocument",
            assume_role("ecs-tasks.amazonaws.com"),
        )]),
    )
}

fn resource(type_name: &str, properties: Node) -> Node {
    Node::map([("Type", type_name.into()), ("Properties", properties)])
}

fn addon_output(name: &str) -> Node {
    Node::get_att(ADDONS_STACK_ID, &format!("Outputs.{name}"))
}

fn cluster() -> Node {
    environment_export("ClusterId")
}

/// Value exported by the environment stack as `<app>-<env>-<suffix>`.
fn environment_export(suffix: &str) -> Node {
    Node::import_value(Node::sub(&format!("${{AppName}}-${{EnvName}}-{suffix}")))
}

fn join(delimiter: &str, parts: Vec<Node>) -> Node {
    Node::map([(
        "Fn::Join",
        Node::list([Node::string(delimiter), Node::List(parts)]),
    )])
}

fn assume_role(service: &str) -> Node {
    Node::map([
        ("Version", "2012-10-17".into()),
        (
            "Statement",
            Node::list([Node::map([
                ("Effect", "Allow".into()),
                (
                    "Principal",
                    Node::map([("Service", service.into())]),
                ),
                ("Action", "sts:AssumeRole".into()),
            ])]),
        ),
    ])
}

fn name_value_list(entries: BTreeMap<String, Node>, value_key: &str) -> Node {
    Node::list(entries.into_iter().map(|(name, value)| {
        Node::Map(NodeMap::from([
            ("Name".to_owned(), Node::string(name)),
            (value_key.to_owned(), value),
        ]))
    }))
}
