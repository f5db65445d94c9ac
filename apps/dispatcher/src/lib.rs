pub mod config;
mod dispatcher;
pub mod gateway;
mod runtime;

pub use dispatcher::{BusMessage, DispatchError, Dispatcher, DropReason, Outcome};
pub use iotv_bus::{BusClient, BusError, InMemoryBusClient, JetStreamBusClient};
pub use runtime::{build_dispatcher, run};
