pub mod event_system;
pub mod resource_monitor;

pub use event_system::{EventSystem, EventSystemDeps, SystemStatus};
pub use resource_monitor::{
    HysteresisGate, LoadLevel, ResourceMonitor, ResourceSampler, ResourceState, ScriptedSampler,
    SysinfoSampler,
};
