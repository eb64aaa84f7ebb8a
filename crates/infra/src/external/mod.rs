//! Adapters for the systems this service consumes but does not own.

pub mod gateway;
pub mod memory;
pub mod notifier;
pub mod platform;

pub use gateway::{
    CreateOrder, GatewayError, GatewayOrder, NormalizedEvent, PaymentGateway, RazorpayConfig,
    RazorpayGateway,
};
pub use memory::{InMemoryPlatform, PlatformOperation};
pub use notifier::{LogNotifier, Notifier, NotifyError, RecordingNotifier, SetupLink};
pub use platform::{
    DeploymentPlatform, NamedResource, PlatformError, ProjectTopology, RailwayClient,
    RailwayConfig, ServiceTarget, TemplateDeployment, WorkflowStatus,
};
