//! # tuyaswitch
//!
//! Local control of Tuya smart switches (protocol 3.1 to 3.5) without the
//! cloud: read the data points, flip the power data point, or poll
//! continuously.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tuyaswitch::{DeviceConfig, SwitchTransport, TuyaDevice, Version};
//!
//! # async fn run() -> tuyaswitch::Result<()> {
//! let config = DeviceConfig::new("DEVICE_ID", "192.168.1.2", "0123456789abcdef")
//!     .version(Version::V3_4);
//! let mut device = TuyaDevice::connect(config)?;
//! device.set_value("1", true.into()).await?;
//! println!("{}", device.status().await?);
//! # Ok(())
//! # }
//! ```
//!
#[macro_use]
mod macros;
pub mod cli;
pub mod crypto;
pub mod device;
pub mod driver;
pub mod error;
pub mod protocol;
pub mod transport;

pub use device::TuyaDevice;
pub use driver::{Action, Driver};
pub use error::{Result, TuyaError};
pub use protocol::{CommandType, Version};
pub use transport::{DeviceConfig, StatusSnapshot, SwitchTransport};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
