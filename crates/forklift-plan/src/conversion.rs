//! Guest conversion workers
//!
//! The guest converter runs virt-v2v against the target volumes. It either
//! converts disks a populator already copied (in place) or copies and
//! converts in one pass when the source is an image archive. Progress is
//! scraped from its `v2v_disk_transfers` gauge.
//!
//! OpenStack images are downloaded into a scratch volume and rewritten to
//! raw by a separate image converter pod per disk.

use std::collections::BTreeMap;

use forklift_common::crd::{DiskStatus, ProviderType};
use forklift_common::CONVERSION_LABEL;
use forklift_populator::progress::disk_transfers;
use forklift_populator::{dns_name, METRICS_PORT, SECRET_PATH};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PersistentVolumeClaimVolumeSource, Pod, PodSpec,
    SecretVolumeSource, Volume, VolumeDevice, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Name of a VM's guest conversion pod
pub fn conversion_pod_name(migration: &str, vm: &str) -> String {
    dns_name(&format!("conv-{migration}-{vm}"))
}

/// Name of the image converter pod for one disk
pub fn image_converter_name(migration: &str, vm: &str, disk: &str) -> String {
    dns_name(&format!("imgconv-{migration}-{vm}-{disk}"))
}

/// Name of the scratch volume an image is downloaded into
pub fn scratch_volume_name(data_volume: &str) -> String {
    dns_name(&format!("{data_volume}-scratch"))
}

/// Inputs for the guest conversion pod
pub struct ConversionRequest<'a> {
    /// Pod name
    pub name: String,
    /// Namespace
    pub namespace: &'a str,
    /// virt-v2v image
    pub image: &'a str,
    /// Source platform
    pub source_type: ProviderType,
    /// Source VM name
    pub vm_name: &'a str,
    /// Source endpoint
    pub source_url: &'a str,
    /// Credentials secret in the target namespace
    pub secret: &'a str,
    /// Target volumes, in disk order
    pub volumes: &'a [String],
    /// The converter copies the disks itself
    pub copy_disks: bool,
    /// Owner labels
    pub labels: BTreeMap<String, String>,
}

/// Guest conversion pod manifest
pub fn conversion_pod(request: &ConversionRequest<'_>) -> Pod {
    let mut labels = request.labels.clone();
    labels.insert(CONVERSION_LABEL.to_string(), "true".to_string());

    let mut env = vec![
        env_var("V2V_vmName", request.vm_name),
        env_var("V2V_source", &request.source_type.to_string()),
        env_var("V2V_libvirtURL", request.source_url),
        env_var("V2V_secretKey", SECRET_PATH),
    ];
    if !request.copy_disks {
        env.push(env_var("V2V_inPlace", "1"));
    }

    let mut volumes = vec![Volume {
        name: "secret".to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(request.secret.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }];
    let mut devices = Vec::with_capacity(request.volumes.len());
    for (i, claim) in request.volumes.iter().enumerate() {
        let name = format!("disk{i}");
        devices.push(VolumeDevice {
            name: name.clone(),
            device_path: format!("/dev/block{i}"),
        });
        volumes.push(claim_volume(name, claim));
    }

    Pod {
        metadata: ObjectMeta {
            name: Some(request.name.clone()),
            namespace: Some(request.namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: "virt-v2v".to_string(),
                image: Some(request.image.to_string()),
                env: Some(env),
                ports: Some(vec![ContainerPort {
                    name: Some("metrics".to_string()),
                    container_port: i32::from(METRICS_PORT),
                    ..Default::default()
                }]),
                volume_mounts: Some(vec![VolumeMount {
                    name: "secret".to_string(),
                    mount_path: SECRET_PATH.to_string(),
                    read_only: Some(true),
                    ..Default::default()
                }]),
                volume_devices: Some(devices),
                ..Default::default()
            }],
            volumes: Some(volumes),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Image converter pod rewriting `source` into `target` as raw
pub fn image_converter_pod(
    name: &str,
    namespace: &str,
    image: &str,
    source: &str,
    target: &str,
    labels: BTreeMap<String, String>,
) -> Pod {
    let args = [
        "-src-path",
        "/dev/block",
        "-dst-path",
        "/dev/target",
        "-src-format",
        "qcow2",
        "-dst-format",
        "raw",
        "-volume-mode",
        "Block",
    ];
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: "convert".to_string(),
                image: Some(image.to_string()),
                command: Some(vec!["/usr/local/bin/image-converter".to_string()]),
                args: Some(args.iter().map(|a| a.to_string()).collect()),
                volume_devices: Some(vec![
                    VolumeDevice {
                        name: "source".to_string(),
                        device_path: "/dev/block".to_string(),
                    },
                    VolumeDevice {
                        name: "target".to_string(),
                        device_path: "/dev/target".to_string(),
                    },
                ]),
                ..Default::default()
            }],
            volumes: Some(vec![
                claim_volume("source".to_string(), source),
                claim_volume("target".to_string(), target),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn claim_volume(name: String, claim: &str) -> Volume {
    Volume {
        name,
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim.to_string(),
            read_only: Some(false),
        }),
        ..Default::default()
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

/// Apply scraped converter progress to the VM's disks
///
/// `disk_id` is 1-based in disk order. Disk numbers above the disk count
/// are ignored, percentages are capped at 100, and progress never goes
/// backwards. Returns whether any disk reports progress.
pub fn apply_progress(disks: &mut [DiskStatus], metrics: &str) -> bool {
    let mut any = false;
    for (id, percent) in disk_transfers(metrics) {
        let Ok(number) = id.parse::<usize>() else {
            continue;
        };
        let Some(disk) = number.checked_sub(1).and_then(|i| disks.get_mut(i)) else {
            continue;
        };
        let percent = percent.clamp(0.0, 100.0);
        let percent_u32 = percent as u32;
        if percent_u32 > disk.percent {
            disk.percent = percent_u32;
            disk.total = disk.capacity;
            disk.transferred = disk.capacity.saturating_mul(u64::from(percent_u32)) / 100;
        }
        if percent > 0.0 {
            any = true;
        }
        if percent_u32 >= 100 {
            disk.done = true;
        }
    }
    any
}
