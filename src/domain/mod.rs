//! Domain types shared by the render pipeline and the serving layer.

pub mod locale;
pub mod payload;
pub mod session;
