//! Init, Invocation and Shutdown Builders: the three places a function
//! author registers delegates before the orchestrator takes over.

mod init;
mod invocation;
mod shutdown;

pub use init::{CompiledInit, InitBuilder, InitDelegate};
pub use invocation::{CompiledInvocation, InvocationBuildError, InvocationBuilder};
pub use shutdown::{CompiledShutdown, ShutdownBuilder, ShutdownDelegate};
