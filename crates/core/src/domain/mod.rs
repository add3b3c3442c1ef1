pub mod pending;
pub mod reference;
pub mod session;
pub mod tool;
