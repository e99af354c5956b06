//! Projects that ship with the engine.

pub mod prelude;
