mod client;
mod codec;
mod connector;
mod target;
pub mod types;

pub use client::{ClientOptions, EventModifier, JdwpClient, INVOKE_SINGLE_THREADED};
pub use connector::JdwpConnector;
pub use target::JdwpTarget;
pub use types::{JdwpError, JdwpEvent, JdwpEventSet, JdwpIdSizes, JdwpValue};
