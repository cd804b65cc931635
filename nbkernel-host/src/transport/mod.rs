//! Wire transport implementations
//!
//! The production transport (ZeroMQ framing, HMAC signing) lives outside
//! this crate behind `nbkernel_core::WireTransport`. This module provides
//! the in-process transport used by embedders and the test suites.

mod inprocess;

pub use inprocess::{InProcessKernel, InProcessKernelBehavior, InProcessTransport, KernelFactory};
