//! Subscription state: who wants which document, how badly, and what is
//! waiting to be delivered to them.

pub mod admission;
pub mod registry;
pub mod throttle;

pub use admission::{Admission, AdmissionController};
pub use registry::{
    AttachKind, Attached, CallbackId, Detached, DocCallback, DocEvent, Priority, Registry,
    ReplayPlan, Subscription, SubscriptionState,
};
pub use throttle::{TimerId, UpdateThrottler};
