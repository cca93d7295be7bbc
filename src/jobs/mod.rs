//! Job types: descriptors, settings, cancellation and the registry.

pub mod builtin;
pub mod cancel;
pub mod descriptor;
pub mod registry;
pub mod settings;

pub use cancel::CancelSignal;
pub use descriptor::{BatchOutcome, JobDescriptor};
pub use registry::JobRegistry;
pub use settings::{FieldKind, SettingField, Settings, ValidatedSettings};
