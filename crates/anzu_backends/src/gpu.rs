//! Dual-GPU router.
//!
//! Routes each task to exactly one of two physical accelerators via the
//! static table in `anzu_protocol::GpuTask`. Generation-accelerator tasks
//! pass an admission check (backend idle, enough free VRAM, one
//! free-memory mitigation attempt); inference-accelerator tasks always
//! admit, since the local inference service manages its own memory.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{info, warn};

use anzu_protocol::defaults::{MIN_FREE_VRAM_MB, VRAM_RECHECK_DELAY_SECS};
use anzu_protocol::types::{GpuTarget, GpuTask};

use crate::error::BackendResult;
use crate::image::ImageBackend;
use crate::vision::VisionService;

/// VRAM snapshot for one accelerator.
#[derive(Debug, Clone, Serialize)]
pub struct GpuInfo {
    pub total_mb: i64,
    pub used_mb: i64,
    pub free_mb: i64,
    pub gpu_name: String,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Serialize)]
pub struct Admission {
    pub admitted: bool,
    pub reason: String,
}

impl Admission {
    fn admit(reason: impl Into<String>) -> Self {
        Admission {
            admitted: true,
            reason: reason.into(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Admission {
            admitted: false,
            reason: reason.into(),
        }
    }
}

pub struct GpuRouter {
    image_backend: Arc<ImageBackend>,
    vision: Arc<VisionService>,
    min_free_vram_mb: i64,
    recheck_delay: Duration,
}

impl GpuRouter {
    pub fn new(image_backend: Arc<ImageBackend>, vision: Arc<VisionService>) -> Self {
        GpuRouter {
            image_backend,
            vision,
            min_free_vram_mb: MIN_FREE_VRAM_MB,
            recheck_delay: Duration::from_secs(VRAM_RECHECK_DELAY_SECS),
        }
    }

    /// Full pre-task gate. Generation tasks are serialized against the
    /// image backend; everything routed to the inference accelerator
    /// admits immediately.
    pub async fn ensure_ready(&self, task: GpuTask) -> Admission {
        match task.target() {
            GpuTarget::GpuB => {
                Admission::admit("inference accelerator manages its own memory")
            }
            GpuTarget::GpuA => {
                match self.image_backend.is_busy().await {
                    Ok(true) => return Admission::deny("backend busy"),
                    Ok(false) => {}
                    Err(e) => {
                        // Unreachable backend: deny rather than pile work on.
                        return Admission::deny(format!("cannot query backend queue: {}", e));
                    }
                }

                match self.check_vram().await {
                    Some(admission) if admission.admitted => admission,
                    first_check => {
                        info!("Insufficient VRAM, requesting model unload before retry");
                        if let Err(e) = self.image_backend.free_memory().await {
                            warn!("free_memory mitigation failed: {}", e);
                        }
                        tokio::time::sleep(self.recheck_delay).await;
                        match self.check_vram().await {
                            Some(admission) => admission,
                            None => first_check.unwrap_or_else(|| {
                                Admission::deny("cannot query generation accelerator VRAM")
                            }),
                        }
                    }
                }
            }
        }
    }

    async fn check_vram(&self) -> Option<Admission> {
        let info = generation_gpu_info().await?;
        if info.free_mb >= self.min_free_vram_mb {
            Some(Admission::admit(format!(
                "{}MB free on {}",
                info.free_mb, info.gpu_name
            )))
        } else {
            Some(Admission::deny(format!(
                "insufficient VRAM: {}MB free, need {}MB ({}: {}MB total, {}MB used)",
                info.free_mb, self.min_free_vram_mb, info.gpu_name, info.total_mb, info.used_mb
            )))
        }
    }

    /// Full GPU snapshot for the operator surface: both accelerators, the
    /// backend queue, loaded inference models and breaker states.
    pub async fn system_status(&self) -> Value {
        let generation = generation_gpu_info().await;
        let inference = inference_gpu_info().await;
        let queue = self.image_backend.queue_counts().await.ok();
        let models = self.vision.loaded_models().await.unwrap_or_default();
        let total_model_vram: i64 = models
            .iter()
            .filter_map(|m| m.get("vram_mb").and_then(Value::as_i64))
            .sum();

        json!({
            "gpu_a": generation,
            "gpu_b": inference,
            "image_backend": {
                "queue": queue,
                "breaker": self.image_backend.breaker_snapshot(),
            },
            "inference": {
                "loaded_models": models,
                "total_vram_mb": total_model_vram,
                "breaker": self.vision.breaker_snapshot(),
            },
        })
    }
}

/// Query the generation accelerator via nvidia-smi.
pub async fn generation_gpu_info() -> Option<GpuInfo> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=memory.total,memory.used,memory.free,name",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        warn!("nvidia-smi exited non-zero");
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_smi_line(stdout.lines().next()?)
}

fn parse_smi_line(line: &str) -> Option<GpuInfo> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 4 {
        return None;
    }
    Some(GpuInfo {
        total_mb: fields[0].parse().ok()?,
        used_mb: fields[1].parse().ok()?,
        free_mb: fields[2].parse().ok()?,
        gpu_name: fields[3].to_string(),
    })
}

/// Query the inference accelerator from sysfs
/// (`/sys/class/drm/card*/device/mem_info_vram_*`).
pub async fn inference_gpu_info() -> Option<GpuInfo> {
    sysfs_gpu_info(Path::new("/sys/class/drm"), "0x1002")
}

fn sysfs_gpu_info(drm_root: &Path, vendor_id: &str) -> Option<GpuInfo> {
    let entries = std::fs::read_dir(drm_root).ok()?;
    let mut cards: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("card") && n[4..].chars().all(|c| c.is_ascii_digit()))
                .unwrap_or(false)
        })
        .collect();
    cards.sort();

    for card in cards {
        let device = card.join("device");
        let vendor = std::fs::read_to_string(device.join("vendor")).ok();
        if let Some(vendor) = vendor {
            if vendor.trim() != vendor_id {
                continue;
            }
        }
        let total: i64 = std::fs::read_to_string(device.join("mem_info_vram_total"))
            .ok()?
            .trim()
            .parse()
            .ok()?;
        let used: i64 = std::fs::read_to_string(device.join("mem_info_vram_used"))
            .ok()?
            .trim()
            .parse()
            .ok()?;
        return Some(GpuInfo {
            total_mb: total / (1024 * 1024),
            used_mb: used / (1024 * 1024),
            free_mb: (total - used) / (1024 * 1024),
            gpu_name: "inference accelerator".to_string(),
        });
    }
    None
}
