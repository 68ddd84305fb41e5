// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The promise engine: settlement core,
//! combinators, the scavenged registry, and unhandled-rejection
//! tracking.

pub mod combinators;
pub mod core;
pub mod registry;
pub mod unhandled;

pub use combinators::{all, all_settled, any, passthrough, race, SettledResult};
pub use core::{Promise, PromiseState, Settlement, ThenOutcome};
pub use registry::PromiseRegistry;
pub use unhandled::{UnhandledRejectionDebugInfo, UnhandledTracker};
