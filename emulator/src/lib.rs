pub mod bus;
pub mod constants;
pub mod cpu;
pub mod devices;
pub mod net;
pub mod programs;
pub mod system;

pub use self::system::{Halt, System};
