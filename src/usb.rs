//! Talking to real hardware through `nusb`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use futures_lite::future::{block_on, poll_once};
use nusb::transfer::{Queue, RequestBuffer};
use nusb::{DeviceInfo, Interface};

use crate::protocol::Frame;
use crate::transport::{SlotId, TransferError, TransferEvent, Transport};

pub const USB_VENDOR_ID: u16 = 0x2961;
pub const USB_PRODUCT_ID: u16 = 0x6689;
pub const USB_INTERFACE: u8 = 0;
pub const EP_COMMAND: u8 = 0x02;
pub const EP_REPLY: u8 = 0x86;

/// Sleep between completion checks while waiting with a timeout.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, thiserror::Error)]
pub enum UsbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No LWLA device found on bus {bus} address {address}")]
    DeviceNotFound { bus: u8, address: u8 },

    #[error("No LWLA device connected")]
    NoDevices,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LwlaDeviceInfo {
    pub bus: u8,
    pub address: u8,
    pub serial: Option<String>,
    pub product: Option<String>,
}

impl LwlaDeviceInfo {
    fn from_nusb(info: &DeviceInfo) -> Self {
        Self {
            bus: info.bus_number(),
            address: info.device_address(),
            serial: info.serial_number().map(str::to_owned),
            product: info.product_string().map(str::to_owned),
        }
    }

    fn matches(&self, info: &DeviceInfo) -> bool {
        info.bus_number() == self.bus && info.device_address() == self.address
    }
}

impl std::fmt::Display for LwlaDeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at {}.{}",
            self.product.as_deref().unwrap_or("LWLA"),
            self.bus,
            self.address
        )?;
        if let Some(serial) = &self.serial {
            write!(f, " (serial {})", serial)?;
        }
        Ok(())
    }
}

fn is_lwla(info: &DeviceInfo) -> bool {
    info.vendor_id() == USB_VENDOR_ID && info.product_id() == USB_PRODUCT_ID
}

/// Driver context. Holds whatever the driver has found so far; there is no
/// process-wide state, so several contexts can coexist.
#[derive(Debug, Default)]
pub struct LwlaDriver {
    devices: Vec<LwlaDeviceInfo>,
}

impl LwlaDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Devices found by the last [`Self::scan`].
    pub fn devices(&self) -> &[LwlaDeviceInfo] {
        &self.devices
    }

    /// Lists every connected LWLA.
    pub fn scan(&mut self) -> Result<&[LwlaDeviceInfo], UsbError> {
        self.devices = nusb::list_devices()?
            .filter(is_lwla)
            .map(|info| LwlaDeviceInfo::from_nusb(&info))
            .collect();
        log::debug!("Found {} LWLA devices", self.devices.len());
        Ok(&self.devices)
    }

    /// Opens the device and claims its interface.
    pub fn open(&self, device: &LwlaDeviceInfo) -> Result<UsbTransport, UsbError> {
        let info = nusb::list_devices()?
            .find(|info| is_lwla(info) && device.matches(info))
            .ok_or(UsbError::DeviceNotFound {
                bus: device.bus,
                address: device.address,
            })?;
        log::debug!("Opening {}", device);
        let handle = info.open()?;
        let interface = handle.detach_and_claim_interface(USB_INTERFACE)?;
        log::info!("Claimed interface {} of {}", USB_INTERFACE, device);
        Ok(UsbTransport::new(interface))
    }

    /// Scans and opens the first device found.
    pub fn open_first(&mut self) -> Result<UsbTransport, UsbError> {
        let first = self.scan()?.first().cloned().ok_or(UsbError::NoDevices)?;
        self.open(&first)
    }
}

impl From<nusb::transfer::TransferError> for TransferError {
    fn from(error: nusb::transfer::TransferError) -> Self {
        use nusb::transfer::TransferError as Nusb;
        match error {
            Nusb::Cancelled => TransferError::Cancelled,
            Nusb::Stall => TransferError::Stall,
            Nusb::Disconnected => TransferError::Disconnected,
            Nusb::Fault => TransferError::Fault,
            other => TransferError::Usb(other.to_string()),
        }
    }
}

/// Bulk endpoints of a claimed LWLA interface.
///
/// Read completions come back in submission order, so the slot of each one
/// is whatever sits at the front of `in_flight`, once the `stale`
/// completions of forgotten reads have been skipped.
pub struct UsbTransport {
    interface: Interface,
    reply_queue: Queue<RequestBuffer>,
    in_flight: VecDeque<SlotId>,
    stale: usize,
}

impl UsbTransport {
    pub fn new(interface: Interface) -> Self {
        let reply_queue = interface.bulk_in_queue(EP_REPLY);
        Self {
            interface,
            reply_queue,
            in_flight: VecDeque::new(),
            stale: 0,
        }
    }

    pub fn interface(&self) -> &Interface {
        &self.interface
    }
}

impl Transport for UsbTransport {
    fn send_command(&mut self, frame: &Frame) -> Result<(), TransferError> {
        log::trace!("Sending command {:#06x}", frame.opcode());
        block_on(self.interface.bulk_out(EP_COMMAND, frame.as_bytes().to_vec())).into_result()?;
        Ok(())
    }

    fn submit_read(&mut self, slot: SlotId, buffer: Vec<u8>) -> Result<(), TransferError> {
        let len = buffer.capacity();
        self.reply_queue.submit(RequestBuffer::reuse(buffer, len));
        self.in_flight.push_back(slot);
        Ok(())
    }

    fn cancel_all(&mut self) {
        self.reply_queue.cancel_all();
    }

    fn wait_event(&mut self, timeout: Duration) -> Option<TransferEvent> {
        let deadline = Instant::now() + timeout;
        let completion = loop {
            if self.reply_queue.pending() == 0 {
                return None;
            }
            if let Some(completion) = block_on(poll_once(self.reply_queue.next_complete())) {
                if self.stale > 0 {
                    self.stale -= 1;
                    log::debug!("Dropping completion of a forgotten transfer");
                    continue;
                }
                break completion;
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        let Some(slot) = self.in_flight.pop_front() else {
            log::warn!("Completion with no transfer in flight");
            return None;
        };
        let event = match completion.status {
            Err(nusb::transfer::TransferError::Cancelled) => TransferEvent::CancellationConfirmed {
                slot,
                data: completion.data,
            },
            status => TransferEvent::Completed {
                slot,
                data: completion.data,
                status: status.map_err(TransferError::from),
            },
        };
        Some(event)
    }

    fn forget_in_flight(&mut self) {
        self.stale += self.in_flight.len();
        self.in_flight.clear();
    }
}
