//! Mock implementations for testing

pub mod invoker;

pub use invoker::{MockInvoker, MockInvokerBuilder};
