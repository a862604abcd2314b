//! Test suites for the forwarder bootstrap and supervision.

mod behaviour;
pub(crate) mod support;
