//! Types shared between the voldrive core and the `voldrive-executor` process.

pub mod errors;
pub mod executor;

pub use errors::{VoldriveError, VoldriveResult};
pub use executor::{
    DeviceScanType, ExecutorInvocation, ExecutorOp, ExecutorResponse, ExecutorStatus, InstanceId,
    InvocationContext, LocalDevices, WireError,
};
