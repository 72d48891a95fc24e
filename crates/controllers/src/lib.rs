//! Stateful controllers bound to channels, and the registry that routes
//! inbound connections to them.

pub mod controller;
pub mod kinds;
pub mod registry;
pub mod services;

pub use controller::{
    start, Controller, ControllerContext, ControllerCore, ControllerHandle, HandlerTable, Inbound,
    Lifecycle, PortId,
};
pub use registry::{DuplicatePolicy, Factory, Registry, WeakRegistry};
pub use services::{Services, DEFAULT_PASSWORD_TTL};
