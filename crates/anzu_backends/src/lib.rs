//! Resilient adapters for Anzu's external services.
//!
//! Each backend client is wrapped by a circuit breaker and a retry
//! manager; the dual-GPU router serializes generation work against
//! inference work. Nothing in here touches the database.

pub mod circuit;
pub mod error;
pub mod gpu;
pub mod image;
pub mod llm;
pub mod retry;
pub mod vision;

pub use circuit::{BreakerSnapshot, BreakerState, CircuitBreaker};
pub use error::{BackendError, BackendResult};
pub use gpu::{Admission, GpuInfo, GpuRouter};
pub use image::{
    build_image_workflow, build_video_workflow, render_negative, render_prompt, ImageBackend,
    QueueCounts,
};
pub use llm::{LlmConfig, LlmResponse, LlmService};
pub use retry::RetryPolicy;
pub use vision::VisionService;
