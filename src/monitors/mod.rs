//! Host readings and limit evaluation used by the sensors

pub mod node;
pub mod resources;
