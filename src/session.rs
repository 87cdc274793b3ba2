use crate::channels::DeviceModel;
use crate::error::Result;
use crate::protocol::{
    encode_set_clock_source, validate_sample_rate, ClockSource, TriggerMasks, DEFAULT_SAMPLE_RATE,
};
use crate::trigger_config::{masks_from_specs, ChannelSpec};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Inactive,
    Initializing,
    Active,
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Device is not active (status {0:?})")]
    NotActive(Status),

    #[error("Cannot {action} while the device is {status:?}")]
    InvalidState { action: &'static str, status: Status },

    #[error("Acquisition still in progress")]
    AcquisitionInProgress,

    #[error("No acquisition running")]
    NoAcquisition,

    #[error("Clock source None is reserved for shutdown")]
    ReservedClockSource,
}

/// One claimed analyzer and its configuration.
///
/// The session owns the transport. The acquisition controller is the only
/// code that moves `status` between states.
pub struct DeviceSession<T: Transport> {
    transport: T,
    model: DeviceModel,
    status: Status,
    sample_rate: Option<u64>,
    sample_limit: u64,
    clock_source: ClockSource,
    masks: TriggerMasks,
}

impl<T: Transport> DeviceSession<T> {
    /// Wraps a transport whose USB interface has already been claimed.
    /// All channels start enabled with no trigger.
    pub fn new(transport: T, model: DeviceModel) -> Self {
        Self {
            transport,
            model,
            status: Status::Inactive,
            sample_rate: None,
            sample_limit: 0,
            clock_source: ClockSource::Internal,
            masks: TriggerMasks {
                channel_mask: model.all_channels(),
                ..TriggerMasks::default()
            },
        }
    }

    pub fn model(&self) -> DeviceModel {
        self.model
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn sample_rate(&self) -> Option<u64> {
        self.sample_rate
    }

    pub fn sample_limit(&self) -> u64 {
        self.sample_limit
    }

    pub fn clock_source(&self) -> ClockSource {
        self.clock_source
    }

    pub fn trigger_masks(&self) -> &TriggerMasks {
        &self.masks
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Brings the device up: Inactive → Initializing → Active.
    ///
    /// On failure the session drops back to Inactive and the caller is
    /// expected to release the interface.
    pub fn open(&mut self) -> Result<()> {
        if self.status != Status::Inactive {
            return Err(SessionError::InvalidState {
                action: "open",
                status: self.status,
            }
            .into());
        }
        self.status = Status::Initializing;

        if self.sample_rate.is_none() {
            self.sample_rate = Some(DEFAULT_SAMPLE_RATE);
        }

        log::debug!(
            "Initializing {} with clock source {:?}",
            self.model.name,
            self.clock_source
        );
        match self.transport.send_command(&encode_set_clock_source(self.clock_source)) {
            Ok(()) => {
                self.status = Status::Active;
                log::info!("{} initialized", self.model.name);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to initialize {}: {}", self.model.name, e);
                self.status = Status::Inactive;
                Err(e.into())
            }
        }
    }

    /// Shuts the device down and hands back the transport for release.
    ///
    /// Nothing is sent while Inactive: the device was either never brought
    /// up or already shut down by the end of an acquisition. Otherwise the
    /// shutdown is best effort: a failure is logged and the session is
    /// closed regardless.
    pub fn close(mut self) -> T {
        if self.status != Status::Inactive {
            self.clock_source = ClockSource::None;
            if let Err(e) = self.transport.send_command(&encode_set_clock_source(ClockSource::None)) {
                log::error!("Unable to shut down device: {}", e);
            }
        }
        self.status = Status::Inactive;
        log::debug!("{} closed", self.model.name);
        self.transport
    }

    /// Only exact entries of the rate table are accepted. A rejected rate
    /// leaves the stored one untouched.
    pub fn set_sample_rate(&mut self, rate: u64) -> Result<()> {
        log::info!("Setting samplerate {}", rate);
        validate_sample_rate(rate)?;
        self.sample_rate = Some(rate);
        Ok(())
    }

    /// 0 means no limit. Takes effect on the next acquisition.
    pub fn set_sample_limit(&mut self, limit: u64) {
        self.sample_limit = limit;
    }

    /// Pushed to the device right away when it is active.
    pub fn set_clock_source(&mut self, source: ClockSource) -> Result<()> {
        if source == ClockSource::None {
            return Err(SessionError::ReservedClockSource.into());
        }
        let previous = std::mem::replace(&mut self.clock_source, source);
        log::info!("Selecting clock source {:?}", source);

        if self.status == Status::Active {
            if let Err(e) = self.transport.send_command(&encode_set_clock_source(source)) {
                self.clock_source = previous;
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Applies per-channel enablement and triggers. Nothing changes on error.
    pub fn configure_channels_and_triggers(&mut self, specs: &[ChannelSpec<'_>]) -> Result<()> {
        self.ensure_settled("configure channels")?;
        let masks = masks_from_specs(specs, self.model.channel_count)?;
        log::debug!("Configured channels and triggers: {:?}", masks);
        self.masks = masks;
        Ok(())
    }

    /// Applies raw masks after validating them. Nothing changes on error.
    pub fn configure_trigger_masks(&mut self, masks: TriggerMasks) -> Result<()> {
        self.ensure_settled("configure triggers")?;
        masks.validate(self.model.channel_count)?;
        self.masks = masks;
        Ok(())
    }

    fn ensure_settled(&self, action: &'static str) -> std::result::Result<(), SessionError> {
        match self.status {
            Status::Inactive | Status::Active => Ok(()),
            status => Err(SessionError::InvalidState { action, status }),
        }
    }

    pub(crate) fn begin_stop(&mut self) -> std::result::Result<(), SessionError> {
        if self.status != Status::Active {
            return Err(SessionError::NotActive(self.status));
        }
        self.status = Status::Stopping;
        Ok(())
    }

    pub(crate) fn finish_stop(&mut self) {
        self.status = Status::Inactive;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LwlaError;
    use crate::protocol::{ProtocolError, CMD_SET_CLOCK_SOURCE, SAMPLE_RATES};
    use crate::simulator::SimulatedDevice;
    use crate::transport::TransferError;

    fn session() -> DeviceSession<SimulatedDevice> {
        DeviceSession::new(SimulatedDevice::new(DeviceModel::LWLA1016), DeviceModel::LWLA1016)
    }

    #[test]
    fn test_open_applies_default_rate() {
        let mut session = session();
        assert_eq!(session.sample_rate(), None);
        session.open().unwrap();
        assert_eq!(session.status(), Status::Active);
        assert_eq!(session.sample_rate(), Some(DEFAULT_SAMPLE_RATE));
        assert_eq!(session.transport().commands()[0].payload(), &[1]);
    }

    #[test]
    fn test_open_failure_returns_to_inactive() {
        let mut session = session();
        session
            .transport_mut()
            .fail_command(CMD_SET_CLOCK_SOURCE, TransferError::Disconnected);
        assert!(matches!(
            session.open(),
            Err(LwlaError::Transfer(TransferError::Disconnected))
        ));
        assert_eq!(session.status(), Status::Inactive);
    }

    #[test]
    fn test_sample_rate_table() {
        let mut session = session();
        for rate in SAMPLE_RATES {
            session.set_sample_rate(rate).unwrap();
            assert_eq!(session.sample_rate(), Some(rate));
        }
        for bad in [0, 1, 99, 125_000_001, u64::MAX, 3_000_000] {
            assert!(matches!(
                session.set_sample_rate(bad),
                Err(LwlaError::Protocol(ProtocolError::UnsupportedRate(r))) if r == bad
            ));
            assert_eq!(session.sample_rate(), Some(100));
        }
    }

    #[test]
    fn test_clock_source_pushed_only_when_active() {
        let mut session = session();
        session.set_clock_source(ClockSource::ExternalRisingEdge).unwrap();
        assert!(session.transport().commands().is_empty());

        session.open().unwrap();
        session.set_clock_source(ClockSource::ExternalFallingEdge).unwrap();
        let commands = session.transport().commands();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].payload(), &[2]);
        assert_eq!(commands[1].payload(), &[3]);
    }

    #[test]
    fn test_clock_source_rolled_back_on_send_failure() {
        let mut session = session();
        session.open().unwrap();
        session
            .transport_mut()
            .fail_command(CMD_SET_CLOCK_SOURCE, TransferError::Stall);
        assert!(session.set_clock_source(ClockSource::ExternalRisingEdge).is_err());
        assert_eq!(session.clock_source(), ClockSource::Internal);
        assert!(matches!(
            session.set_clock_source(ClockSource::None),
            Err(LwlaError::Session(SessionError::ReservedClockSource))
        ));
    }

    #[test]
    fn test_bad_trigger_masks_leave_config_untouched() {
        let mut session = session();
        let good = TriggerMasks::from_raw(0b11, 0b01, 0b01, 0, 16).unwrap();
        session.configure_trigger_masks(good).unwrap();

        let bad = TriggerMasks {
            trigger_edge_mask: crate::channels::ChannelSet::from_bits(0b10),
            ..good
        };
        assert!(session.configure_trigger_masks(bad).is_err());
        assert_eq!(session.trigger_masks(), &good);

        assert!(session
            .configure_channels_and_triggers(&[ChannelSpec::new(true, "x")])
            .is_err());
        assert_eq!(session.trigger_masks(), &good);
    }

    #[test]
    fn test_stop_requires_active() {
        let mut session = session();
        assert_eq!(
            session.begin_stop(),
            Err(SessionError::NotActive(Status::Inactive))
        );
        session.open().unwrap();
        session.begin_stop().unwrap();
        assert_eq!(session.status(), Status::Stopping);
        assert_eq!(
            session.begin_stop(),
            Err(SessionError::NotActive(Status::Stopping))
        );
        assert!(session
            .configure_channels_and_triggers(&[ChannelSpec::new(true, "")])
            .is_err());
        session.finish_stop();
        assert_eq!(session.status(), Status::Inactive);
    }

    #[test]
    fn test_close_sends_shutdown_even_if_it_fails() {
        let mut session = session();
        session.open().unwrap();
        session
            .transport_mut()
            .fail_command(CMD_SET_CLOCK_SOURCE, TransferError::Disconnected);
        let device = session.close();
        assert_eq!(device.commands().len(), 1);
        assert_eq!(device.failed_commands(), 1);
    }

    #[test]
    fn test_close_without_open_sends_nothing() {
        let device = session().close();
        assert!(device.commands().is_empty());
        assert_eq!(device.failed_commands(), 0);
    }
}
