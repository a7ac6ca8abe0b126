pub mod graph;
pub mod triage_net;

pub use graph::{Endpoint, EndpointRole, GraphBindings, GraphManifest};
pub use triage_net::{ParamSlot, TriageNet, TriageNetConfig, TriageOutput};
