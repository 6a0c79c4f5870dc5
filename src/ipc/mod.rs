//! Synchronisation and call primitives shared by the registry and the buses.

mod async_value;
mod callback;
mod lock;

pub use async_value::AsyncValue;
pub use callback::{Callback, CallbackData, RequiredSignature};
#[cfg(target_has_atomic = "8")]
pub use lock::AtomicLock;
pub use lock::{LockGuard, RawLock, SpinLock};

pub(crate) use lock::Backoff;
