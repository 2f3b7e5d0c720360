//! Cloud instance requests.
//!
//! The launcher turns each planned script into an [`InstanceRequest`] and
//! hands the whole batch to a [`CloudApi`]. [`CliCloudApi`] submits through
//! the `aws` and `gcloud` command line tools.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use base64::Engine;
use serde::Serialize;

use super::backend::{Ec2Backend, GceBackend, LaunchOptions};
use crate::error::TransportError;
use crate::runner::job_name;
use crate::shell::{quote, CommandRunner, ShellCommand};

/// GCE instance names are at most this long.
const MAX_GCE_NAME: usize = 63;

/// OAuth scopes given to GCE instances: storage for mounts, logging, and
/// compute for self-termination.
const GCE_SCOPES: &str = "https://www.googleapis.com/auth/devstorage.read_write,https://www.googleapis.com/auth/logging.write,https://www.googleapis.com/auth/compute";

/// Submits instance requests and returns one identifier per request, in
/// order.
pub trait CloudApi: Send + Sync {
    fn submit(&self, requests: &[InstanceRequest]) -> Result<Vec<String>, TransportError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceRequest {
    Ec2(Ec2Request),
    Gce(GceRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Tag {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TagSpecification {
    pub resource_type: String,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct IamInstanceProfile {
    pub arn: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Placement {
    pub availability_zone: String,
}

/// Instance settings shared by on-demand and spot requests.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LaunchSpecification {
    pub image_id: String,
    pub instance_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub security_groups: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iam_instance_profile: Option<IamInstanceProfile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placement: Option<Placement>,
    /// Base64 of the launch script.
    pub user_data: String,
}

/// `aws ec2 run-instances` input.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunInstancesInput {
    #[serde(flatten)]
    pub spec: LaunchSpecification,
    pub min_count: u32,
    pub max_count: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tag_specifications: Vec<TagSpecification>,
    pub dry_run: bool,
}

/// `aws ec2 request-spot-instances` input.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SpotRequestInput {
    pub instance_count: u32,
    pub spot_price: String,
    pub launch_specification: LaunchSpecification,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tag_specifications: Vec<TagSpecification>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Ec2Request {
    OnDemand {
        region: Option<String>,
        input: RunInstancesInput,
    },
    Spot {
        region: Option<String>,
        input: SpotRequestInput,
    },
}

/// `my_tag` -> `MyTag`
fn snake_to_camel(key: &str) -> String {
    key.split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

impl Ec2Request {
    pub fn new(backend: &Ec2Backend, options: &LaunchOptions, script: &str) -> Self {
        let spec = LaunchSpecification {
            image_id: backend.image_id.clone(),
            instance_type: backend.instance_type.clone(),
            key_name: backend.key_name.clone(),
            security_groups: backend.security_group.iter().cloned().collect(),
            iam_instance_profile: backend
                .iam_instance_profile_arn
                .as_ref()
                .map(|arn| IamInstanceProfile { arn: arn.clone() }),
            placement: backend
                .availability_zone
                .as_ref()
                .map(|zone| Placement {
                    availability_zone: zone.clone(),
                }),
            user_data: base64::engine::general_purpose::STANDARD.encode(script),
        };

        let mut tags: BTreeMap<String, String> = backend
            .tags
            .iter()
            .map(|(key, value)| (snake_to_camel(key), value.clone()))
            .collect();
        if let Some(ref name) = options.instance_name {
            tags.insert("Name".to_string(), name.clone());
        }
        let tags: Vec<Tag> = tags
            .into_iter()
            .map(|(key, value)| Tag { key, value })
            .collect();
        let tag_spec = |resource_type: &str| {
            if tags.is_empty() {
                Vec::new()
            } else {
                vec![TagSpecification {
                    resource_type: resource_type.to_string(),
                    tags: tags.clone(),
                }]
            }
        };

        match backend.spot_price {
            Some(price) => Self::Spot {
                region: backend.region.clone(),
                input: SpotRequestInput {
                    instance_count: 1,
                    spot_price: price.to_string(),
                    launch_specification: spec,
                    tag_specifications: tag_spec("spot-instances-request"),
                    dry_run: backend.dry_run,
                },
            },
            None => Self::OnDemand {
                region: backend.region.clone(),
                input: RunInstancesInput {
                    spec,
                    min_count: 1,
                    max_count: 1,
                    tag_specifications: tag_spec("instance"),
                    dry_run: backend.dry_run,
                },
            },
        }
    }

    /// The launch script this request boots with.
    pub fn user_data(&self) -> &str {
        match self {
            Self::OnDemand { input, .. } => &input.spec.user_data,
            Self::Spot { input, .. } => &input.launch_specification.user_data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Accelerator {
    pub kind: String,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum GceImage {
    Image(String),
    Family { project: String, family: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GceRequest {
    pub project: String,
    pub zone: String,
    pub name: String,
    pub machine_type: String,
    pub image: GceImage,
    pub boot_size_gb: u32,
    pub preemptible: bool,
    pub accelerator: Option<Accelerator>,
    /// Runs at boot from the `startup-script` metadata key.
    pub startup_script: String,
    pub metadata: BTreeMap<String, String>,
}

/// Squash `raw` into a GCE name: runs of characters outside `[a-z0-9]`
/// become one `-`, and only the last 63 characters are kept.
pub fn gce_instance_name(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !(c.is_ascii_lowercase() || c.is_ascii_digit()))
        .filter(|word| !word.is_empty())
        .collect();
    let name = words.join("-");
    let start = name.len().saturating_sub(MAX_GCE_NAME);
    name[start..].trim_start_matches('-').to_string()
}

impl GceRequest {
    pub fn new(backend: &GceBackend, options: &LaunchOptions, script: &str) -> Self {
        let raw_name = options.instance_name.clone().unwrap_or_else(job_name);
        let image = match backend.image {
            Some(ref image) => GceImage::Image(image.clone()),
            None => GceImage::Family {
                project: backend.image_project.clone(),
                family: backend.image_family.clone(),
            },
        };
        Self {
            project: backend.project_id.clone(),
            zone: backend.zone.clone(),
            name: gce_instance_name(&raw_name),
            machine_type: backend.instance_type.clone(),
            image,
            boot_size_gb: backend.boot_size,
            preemptible: backend.preemptible,
            accelerator: backend.accelerator_type.as_ref().map(|kind| Accelerator {
                kind: kind.clone(),
                count: backend.accelerator_count,
            }),
            startup_script: script.to_string(),
            metadata: backend.tags.clone(),
        }
    }
}

/// Submits requests with the `aws` and `gcloud` CLIs.
pub struct CliCloudApi {
    shell: Arc<dyn CommandRunner>,
}

impl CliCloudApi {
    pub fn new(shell: Arc<dyn CommandRunner>) -> Self {
        Self { shell }
    }

    fn run(&self, script: String) -> Result<String, TransportError> {
        let output = self.shell.run_checked(&ShellCommand::new(script).captured())?;
        let id = output.stdout.trim().to_string();
        if id.is_empty() {
            return Err(TransportError::Cloud(
                "instance request returned no identifier".to_string(),
            ));
        }
        Ok(id)
    }

    fn submit_ec2(&self, request: &Ec2Request) -> Result<String, TransportError> {
        let (operation, query, region, input) = match request {
            Ec2Request::OnDemand { region, input } => (
                "run-instances",
                "Instances[0].InstanceId",
                region,
                serde_json::to_string(input)?,
            ),
            Ec2Request::Spot { region, input } => (
                "request-spot-instances",
                "SpotInstanceRequests[0].SpotInstanceRequestId",
                region,
                serde_json::to_string(input)?,
            ),
        };
        let input_file = write_temp(".json", &input)?;
        let mut script = format!(
            "aws ec2 {} --cli-input-json {} --query {} --output text",
            operation,
            quote(&format!("file://{}", input_file.path().display())),
            quote(query)
        );
        if let Some(region) = region {
            script.push_str(&format!(" --region {}", quote(region)));
        }
        let id = self.run(script)?;
        tracing::info!(%id, operation, "ec2 request submitted");
        Ok(id)
    }

    fn submit_gce(&self, request: &GceRequest) -> Result<String, TransportError> {
        let startup = write_temp(".sh", &request.startup_script)?;
        let mut args = vec![
            "gcloud compute instances create".to_string(),
            quote(&request.name),
            format!("--project={}", quote(&request.project)),
            format!("--zone={}", quote(&request.zone)),
            format!("--machine-type={}", quote(&request.machine_type)),
        ];
        match request.image {
            GceImage::Image(ref image) => args.push(format!("--image={}", quote(image))),
            GceImage::Family {
                ref project,
                ref family,
            } => {
                args.push(format!("--image-project={}", quote(project)));
                args.push(format!("--image-family={}", quote(family)));
            }
        }
        args.push(format!("--boot-disk-size={}GB", request.boot_size_gb));
        args.push("--boot-disk-auto-delete".to_string());
        // Accelerator instances cannot live-migrate.
        args.push("--maintenance-policy=TERMINATE".to_string());
        args.push("--no-restart-on-failure".to_string());
        if request.preemptible {
            args.push("--preemptible".to_string());
        }
        if let Some(ref accelerator) = request.accelerator {
            args.push(format!(
                "--accelerator={}",
                quote(&format!("type={},count={}", accelerator.kind, accelerator.count))
            ));
        }
        args.push(format!("--scopes={}", GCE_SCOPES));
        args.push(format!(
            "--metadata-from-file={}",
            quote(&format!("startup-script={}", startup.path().display()))
        ));
        if !request.metadata.is_empty() {
            let pairs: Vec<String> = request
                .metadata
                .iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .collect();
            args.push(format!("--metadata={}", quote(&pairs.join(","))));
        }
        args.push("--format='value(id)'".to_string());

        let id = self.run(args.join(" "))?;
        tracing::info!(%id, name = %request.name, "gce instance created");
        Ok(id)
    }
}

fn write_temp(suffix: &str, contents: &str) -> Result<tempfile::NamedTempFile, TransportError> {
    let mut file = tempfile::Builder::new()
        .prefix("remlaunch-")
        .suffix(suffix)
        .tempfile()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file)
}

impl CloudApi for CliCloudApi {
    fn submit(&self, requests: &[InstanceRequest]) -> Result<Vec<String>, TransportError> {
        requests
            .iter()
            .map(|request| match request {
                InstanceRequest::Ec2(ec2) => self.submit_ec2(ec2),
                InstanceRequest::Gce(gce) => self.submit_gce(gce),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RecordingShell;
    use crate::shell::CommandOutput;

    fn options(name: &str) -> LaunchOptions {
        LaunchOptions {
            instance_name: Some(name.to_string()),
            ..LaunchOptions::default()
        }
    }

    #[test]
    fn test_gce_names_are_normalized() {
        assert_eq!(gce_instance_name("My Job_01 (retry)"), "my-job-01-retry");
        let long = gce_instance_name(&format!("prefix-{}", "a".repeat(80)));
        assert_eq!(long.len(), 63);
        assert!(long.chars().all(|c| c == 'a'));
    }

    #[test]
    fn test_snake_to_camel() {
        assert_eq!(snake_to_camel("exp_prefix"), "ExpPrefix");
        assert_eq!(snake_to_camel("owner"), "Owner");
    }

    #[test]
    fn test_on_demand_request_shape() {
        let mut backend = Ec2Backend::new("ami-123", "g4dn.xlarge");
        backend.security_group = Some("default".to_string());
        backend.tags.insert("exp_prefix".to_string(), "sweep".to_string());

        let request = Ec2Request::new(&backend, &options("trial-1"), "#!/bin/bash\necho hi");
        let json = match request {
            Ec2Request::OnDemand { ref input, .. } => serde_json::to_value(input).unwrap(),
            Ec2Request::Spot { .. } => panic!("expected on-demand"),
        };

        assert_eq!(json["ImageId"], "ami-123");
        assert_eq!(json["MinCount"], 1);
        assert_eq!(json["SecurityGroups"][0], "default");
        assert_eq!(json["TagSpecifications"][0]["ResourceType"], "instance");
        let tags = json["TagSpecifications"][0]["Tags"].as_array().unwrap();
        assert!(tags.iter().any(|t| t["Key"] == "Name" && t["Value"] == "trial-1"));
        assert!(tags.iter().any(|t| t["Key"] == "ExpPrefix"));
        assert!(json.get("KeyName").is_none());

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(request.user_data())
            .unwrap();
        assert_eq!(decoded, b"#!/bin/bash\necho hi");
    }

    #[test]
    fn test_spot_request_carries_price() {
        let mut backend = Ec2Backend::new("ami-123", "p3.2xlarge");
        backend.spot_price = Some(0.9);
        let request = Ec2Request::new(&backend, &LaunchOptions::default(), "true");
        match request {
            Ec2Request::Spot { input, .. } => {
                assert_eq!(input.spot_price, "0.9");
                assert_eq!(input.instance_count, 1);
                assert!(input.tag_specifications.is_empty());
            }
            Ec2Request::OnDemand { .. } => panic!("expected spot"),
        }
    }

    #[test]
    fn test_cli_api_drives_aws_and_gcloud() {
        let shell = Arc::new(
            RecordingShell::new()
                .respond("aws ec2 run-instances", CommandOutput::ok("i-0abc\n"))
                .respond("gcloud compute instances create", CommandOutput::ok("4242\n")),
        );
        let api = CliCloudApi::new(shell.clone());

        let ec2 = InstanceRequest::Ec2(Ec2Request::new(
            &Ec2Backend::new("ami-1", "t3.micro"),
            &LaunchOptions::default(),
            "true",
        ));
        let mut gce_backend = GceBackend::new("proj", "us-east1-b", "n1-standard-4");
        gce_backend.preemptible = true;
        gce_backend.accelerator_type = Some("nvidia-tesla-t4".to_string());
        let gce = InstanceRequest::Gce(GceRequest::new(&gce_backend, &options("Sweep 7"), "true"));

        let ids = api.submit(&[ec2, gce]).unwrap();
        assert_eq!(ids, ["i-0abc", "4242"]);

        let scripts = shell.scripts();
        assert!(scripts[0].starts_with("aws ec2 run-instances --cli-input-json "));
        assert!(scripts[0].contains("file://"));
        assert!(scripts[1].starts_with("gcloud compute instances create sweep-7 "));
        assert!(scripts[1].contains("--preemptible"));
        assert!(scripts[1].contains("--accelerator=type=nvidia-tesla-t4,count=1"));
        assert!(scripts[1].contains("--image-family=pytorch-latest-gpu"));
    }

    #[test]
    fn test_empty_identifier_is_an_error() {
        let api = CliCloudApi::new(Arc::new(RecordingShell::new()));
        let request = InstanceRequest::Ec2(Ec2Request::new(
            &Ec2Backend::new("ami-1", "t3.micro"),
            &LaunchOptions::default(),
            "true",
        ));
        assert!(matches!(api.submit(&[request]), Err(TransportError::Cloud(_))));
    }
}
