// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Thread rendezvous primitives and rate gates.
//!
//! [`Barrier`] and [`BlockingCounter`] let cooperating threads meet at a
//! known point, each with a "last one out may free me" contract built on a
//! mutex and condition variable. Neither supports cancellation or timeouts;
//! callers that need those build them a layer up.
//!
//! The rate gates ([`EveryN`], [`FirstN`], [`EverySecond`]) are one-word
//! atomics answering "should this event pass?" - the workhorses of
//! throttled logging.

mod barrier;
mod blocking_counter;
mod rate;

pub use barrier::Barrier;
pub use blocking_counter::BlockingCounter;
pub use rate::{EveryN, EverySecond, FirstN};
