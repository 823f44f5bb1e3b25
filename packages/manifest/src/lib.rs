// ABOUTME: Manifest package: decodes YAML uploads into a validated desired-state model
// ABOUTME: Pure functions only, no runtime or storage access

pub mod error;
pub mod parser;
pub mod spec;

pub use error::{ParseError, Result, ValidationReason};
pub use parser::parse;
pub use spec::{
    ContainerSpec, EnvVar, Generation, Manifest, PortMapping, Protocol, RestartPolicy,
    VolumeMount,
};
