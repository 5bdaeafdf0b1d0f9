//! Service discovery.
//!
//! A [`RegistryObserver`] polls a [`DiscoveryBackend`] on a fixed interval and publishes each full
//! [`RegistrySnapshot`] to any number of [`RegistrySubscription`]s. Subscribers only ever see the latest snapshot.
#![deny(warnings)]

mod backend;
pub use self::backend::{DiscoveryBackend, DiscoveryError};

pub mod consul;

mod observer;
pub use self::observer::RegistryObserver;

mod publisher;
pub use self::publisher::{RegistrySubscription, SnapshotPublisher};

mod record;
pub use self::record::{NodeIdentity, RegistrySnapshot, ServiceRecord};
