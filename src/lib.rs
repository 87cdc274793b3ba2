//! # LWLA RS
//!
//! A Rust library for driving SysClk LWLA1016 and LWLA1034 USB logic analyzers.
//!
//! The library configures channels and triggers, arms the device and turns the
//! sample stream coming back over USB into masked per-sample words, handed to
//! a [`SampleSink`] in order.
//!
//! ## Features
//!
//! - **USB backend**: Uses `nusb` to find devices and keep several bulk reads in flight
//! - **Trigger configuration**: Per-channel level and edge triggers, as strings or with a builder
//! - **Cooperative event loop**: Everything runs on the caller's thread, no background workers
//! - **Clean shutdown**: The device is only told to stop once every transfer has come back
//! - **DataFrame output**: [`CaptureBuffer`] converts a capture into a `polars` DataFrame or CSV
//! - **Simulated device**: [`SimulatedDevice`] runs the whole engine without hardware
//!
//! ## Examples
//!
//! ### Capturing from hardware
//!
//! ```rust,no_run
//! use lwla_rs::{AcquisitionController, CaptureBuffer, DeviceModel, DeviceSession, LwlaDriver};
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut driver = LwlaDriver::new();
//! let transport = driver.open_first()?;
//!
//! let session = DeviceSession::new(transport, DeviceModel::LWLA1034);
//! let mut controller = AcquisitionController::new(session, CaptureBuffer::new());
//! controller.open()?;
//! controller.session_mut().set_sample_rate(1_000_000)?;
//! controller.session_mut().set_sample_limit(10_000);
//!
//! controller.start_acquisition()?;
//! let trailer = controller.run(Duration::from_millis(100))?;
//! println!("Captured {} samples", trailer.samples);
//!
//! let (_transport, capture) = controller.close();
//! capture.write_csv("capture.csv")?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Triggers
//!
//! ```rust
//! use lwla_rs::trigger_config::{ChannelSpec, ChannelTriggerBuilder, TriggerMatch, masks_from_specs};
//!
//! // Channel 1 high, channel 2 on a rising edge, channel 3 enabled without trigger
//! let specs = [
//!     ChannelSpec::new(true, "1"),
//!     ChannelSpec::new(true, "r"),
//!     ChannelSpec::new(true, ""),
//! ];
//! let masks = masks_from_specs(&specs, 16).unwrap();
//!
//! let built = ChannelTriggerBuilder::new(16)
//!     .enable(0)
//!     .enable(1)
//!     .enable(2)
//!     .trigger(0, TriggerMatch::High)
//!     .trigger(1, TriggerMatch::Rising)
//!     .build()
//!     .unwrap();
//! assert_eq!(masks, built);
//! ```
//!
//! ### Without hardware
//!
//! ```rust
//! use lwla_rs::{AcquisitionController, CaptureBuffer, DeviceModel, DeviceSession, EndReason, SimulatedDevice};
//! use std::time::Duration;
//!
//! let model = DeviceModel::LWLA1016;
//! let mut device = SimulatedDevice::new(model);
//! device.queue_samples(&[0x0001, 0x0003, 0x0007]);
//! device.queue_capture_done();
//!
//! let mut controller = AcquisitionController::new(DeviceSession::new(device, model), CaptureBuffer::new());
//! controller.open().unwrap();
//! controller.start_acquisition().unwrap();
//! let trailer = controller.run(Duration::ZERO).unwrap();
//! assert_eq!(trailer.end, EndReason::DeviceDone);
//! assert_eq!(controller.sink().samples, vec![0x0001, 0x0003, 0x0007]);
//! ```

pub mod acquisition;
pub mod channels;
pub mod config;
pub mod decoder;
pub mod error;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod simulator;
pub mod sink;
pub mod transport;
pub mod trigger_config;
pub mod usb;

// Re-export the main types for convenience
pub use acquisition::{AcquisitionController, Progress, DEFAULT_POLL_TIMEOUT};

pub use channels::{ChannelSet, DeviceModel};

pub use config::{config_list, ConfigError, ConfigKey, ConfigValue};

pub use error::{LwlaError, Result};

pub use protocol::{ClockSource, ProtocolError, TriggerMasks, SAMPLE_RATES};

pub use session::{DeviceSession, SessionError, Status};

pub use simulator::SimulatedDevice;

pub use sink::{
    AbortReason, CaptureBuffer, EndReason, SampleBatch, SampleSink, StreamHeader, StreamTrailer,
};

pub use transport::{TransferError, TransferEvent, Transport};

pub use trigger_config::{ChannelSpec, ChannelTriggerBuilder, TriggerConfigError, TriggerMatch};

pub use usb::{LwlaDeviceInfo, LwlaDriver, UsbError, UsbTransport};
