// Card protocol, shared registry and error modeling.
pub mod atr;
pub mod block;
pub mod device;
pub mod error;
pub mod handle;
pub mod reader;
pub mod registry;
pub(crate) mod semaphore;
pub mod session;
pub mod t1;
