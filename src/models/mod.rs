// Domain models

mod execution;
mod image;
mod snapshot;

pub use execution::{ExecutionStatus, ProgressEvent, UpdateExecution};
pub use image::{ImageReference, TempTag};
pub use snapshot::{
    AnonymousVolume, COMPOSE_PROJECT_LABEL, COMPOSE_SERVICE_LABEL, ContainerSnapshot, DeviceSpec,
    HealthCheckSpec, NetworkAttachment, PortBinding, ResourceLimits, RestartPolicySpec,
    StackMembership,
};
