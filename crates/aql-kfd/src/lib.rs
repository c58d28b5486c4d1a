//! Boundary to the amdkfd kernel driver.
//!
//! [`ioctl`] pins the argument layouts of the driver ABI. [`KfdDriver`] is the seam the runtime
//! talks through; [`KfdDevice`] issues the real ioctls and [`SimulatedKfd`] answers them in
//! process.

pub mod device;
pub mod driver;
pub mod ioctl;
pub mod sim;

pub use device::KfdDevice;
pub use driver::{KfdDriver, KfdError, KfdVersion};
pub use sim::{SimQueue, SimulatedKfd};
