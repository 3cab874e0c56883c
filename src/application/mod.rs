//! Application services layer: the render core and the state handlers share.

pub mod error;
pub mod render;
pub mod state;
