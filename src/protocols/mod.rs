//! Wire-level protocols. Each sub-module owns exactly one physical link.

pub mod pyro_wire;
