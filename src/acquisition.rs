//! Drives one device through arm, stream and stop.
//!
//! Everything runs on the caller's thread: [`AcquisitionController::poll`]
//! waits for one transfer completion and hands it to
//! [`AcquisitionController::dispatch`], which is the only place acquisition
//! state changes while data flows.

use std::time::Duration;

use crate::channels::ChannelSet;
use crate::decoder::{Decoded, SampleDecoder};
use crate::error::Result;
use crate::protocol::{
    encode_arm, encode_configure_triggers, encode_set_clock_source, ClockSource, ProtocolError,
    TriggerMasks, DEFAULT_SAMPLE_RATE,
};
use crate::scheduler::{Delivery, TransferScheduler, TRANSFER_BUFFER_SIZE, TRANSFER_POOL_SIZE};
use crate::session::{DeviceSession, SessionError, Status};
use crate::sink::{AbortReason, EndReason, SampleBatch, SampleSink, StreamHeader, StreamTrailer};
use crate::transport::{TransferEvent, Transport};
use crate::trigger_config::ChannelSpec;

/// How long a single poll waits for a completion.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Idle polls `close` tolerates while waiting for cancellations.
const MAX_IDLE_CLOSE_POLLS: usize = 50;

/// State of the running acquisition. Dropped as a whole once the stop
/// sequence is complete, or never created if the start fails.
#[derive(Debug)]
struct Acquisition {
    scheduler: TransferScheduler,
    decoder: SampleDecoder,
    channel_mask: ChannelSet,
    stopping_in_progress: bool,
    transfer_error: bool,
    end: Option<EndReason>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// No acquisition is running.
    Idle,
    Running,
    /// The stop sequence just completed.
    Finished(StreamTrailer),
}

pub struct AcquisitionController<T: Transport, S: SampleSink> {
    session: DeviceSession<T>,
    sink: S,
    acquisition: Option<Acquisition>,
    last_trailer: Option<StreamTrailer>,
    pool_size: usize,
    buffer_size: usize,
}

impl<T: Transport, S: SampleSink> AcquisitionController<T, S> {
    pub fn new(session: DeviceSession<T>, sink: S) -> Self {
        Self {
            session,
            sink,
            acquisition: None,
            last_trailer: None,
            pool_size: TRANSFER_POOL_SIZE,
            buffer_size: TRANSFER_BUFFER_SIZE,
        }
    }

    /// Overrides the number and size of read transfers kept in flight.
    pub fn with_transfer_pool(mut self, pool_size: usize, buffer_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self.buffer_size = buffer_size;
        self
    }

    pub fn session(&self) -> &DeviceSession<T> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut DeviceSession<T> {
        &mut self.session
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn is_acquiring(&self) -> bool {
        self.acquisition.is_some()
    }

    /// Whether stop has been requested but transfers are still draining.
    pub fn is_stopping(&self) -> bool {
        self.acquisition
            .as_ref()
            .is_some_and(|acq| acq.stopping_in_progress)
    }

    /// Transfers currently in flight.
    pub fn outstanding_transfers(&self) -> usize {
        self.acquisition
            .as_ref()
            .map_or(0, |acq| acq.scheduler.outstanding())
    }

    pub fn last_trailer(&self) -> Option<&StreamTrailer> {
        self.last_trailer.as_ref()
    }

    pub fn open(&mut self) -> Result<()> {
        self.session.open()
    }

    pub fn configure_channels_and_triggers(&mut self, specs: &[ChannelSpec<'_>]) -> Result<()> {
        self.session.configure_channels_and_triggers(specs)
    }

    pub fn configure_trigger_masks(&mut self, masks: TriggerMasks) -> Result<()> {
        self.session.configure_trigger_masks(masks)
    }

    /// Arms the device and starts streaming.
    ///
    /// Fails without leaving anything behind: the session stays Active and
    /// no acquisition state is kept.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn start_acquisition(&mut self) -> Result<()> {
        let status = self.session.status();
        if status != Status::Active {
            return Err(SessionError::NotActive(status).into());
        }
        if self.acquisition.is_some() {
            log::error!("Acquisition still in progress?");
            return Err(SessionError::AcquisitionInProgress.into());
        }

        let model = self.session.model();
        let masks = *self.session.trigger_masks();
        let sample_rate = self.session.sample_rate().unwrap_or(DEFAULT_SAMPLE_RATE);
        let sample_limit = self.session.sample_limit();

        let mut scheduler = TransferScheduler::new(self.pool_size, self.buffer_size)?;
        let trigger_frame = encode_configure_triggers(&masks, model.channel_count)?;
        let arm_frame = encode_arm(sample_rate, sample_limit)?;

        log::info!("Starting acquisition.");
        let transport = self.session.transport_mut();
        transport.send_command(&trigger_frame).inspect_err(|e| {
            log::error!("Failed to set up acquisition: {}", e);
        })?;
        transport.send_command(&arm_frame).inspect_err(|e| {
            log::error!("Failed to start acquisition: {}", e);
        })?;
        if let Err(e) = scheduler.submit_all(transport) {
            log::error!("Failed to submit transfers: {}", e);
            scheduler.abandon(transport);
            return Err(e.into());
        }

        self.acquisition = Some(Acquisition {
            scheduler,
            decoder: SampleDecoder::new(model.record_width(), masks.channel_mask, sample_limit),
            channel_mask: masks.channel_mask,
            stopping_in_progress: false,
            transfer_error: false,
            end: None,
        });
        self.last_trailer = None;

        log::info!("Waiting for data.");
        self.sink.header(&StreamHeader {
            model,
            sample_rate,
            sample_limit,
            channel_mask: masks.channel_mask,
        });
        Ok(())
    }

    /// Begins the stop sequence. The acquisition only ends once every
    /// outstanding transfer has reported back, see [`Self::poll`].
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn request_stop(&mut self) -> Result<()> {
        let status = self.session.status();
        if status != Status::Active {
            return Err(SessionError::NotActive(status).into());
        }
        if self.acquisition.is_none() {
            return Err(SessionError::NoAcquisition.into());
        }
        log::debug!("Stopping acquisition.");
        self.begin_stop(EndReason::Stopped);
        self.finish_if_drained();
        Ok(())
    }

    fn begin_stop(&mut self, reason: EndReason) {
        let Some(acq) = self.acquisition.as_mut() else {
            return;
        };
        if acq.stopping_in_progress {
            return;
        }
        if let Err(e) = self.session.begin_stop() {
            log::warn!("Stopping from unexpected state: {}", e);
        }
        acq.stopping_in_progress = true;
        acq.end = Some(reason);
        acq.scheduler.cancel_all(self.session.transport_mut());
    }

    fn abort(&mut self, reason: AbortReason) {
        let Some(acq) = self.acquisition.as_mut() else {
            return;
        };
        if acq.transfer_error || acq.stopping_in_progress {
            log::debug!("Ignoring further failure while stopping: {:?}", reason);
            return;
        }
        log::error!("Aborting acquisition: {:?}", reason);
        acq.transfer_error = true;
        self.begin_stop(EndReason::Aborted(reason));
    }

    /// Handles one transfer event. Events must be passed in the order the
    /// transport reported them.
    pub fn dispatch(&mut self, event: TransferEvent) -> Progress {
        let _span = tracing::trace_span!("dispatch", slot = event.slot()).entered();

        let Some(acq) = self.acquisition.as_mut() else {
            log::warn!("Transfer event for slot {} with no acquisition", event.slot());
            return Progress::Idle;
        };

        match acq.scheduler.complete(event) {
            None => {}
            Some(Delivery::Cancelled { slot, buffer }) => acq.scheduler.park(slot, buffer),
            Some(Delivery::Failed { slot, buffer, error }) => {
                acq.scheduler.park(slot, buffer);
                self.abort(AbortReason::Transfer(error));
            }
            Some(Delivery::Data { slot, buffer }) => {
                if acq.stopping_in_progress || acq.transfer_error {
                    acq.scheduler.park(slot, buffer);
                } else {
                    let decoded = acq.decoder.feed(&buffer);
                    let first_index = acq.decoder.samples_emitted() - decoded.samples.len() as u64;
                    let channel_mask = acq.channel_mask;
                    let (limit_reached, capture_done) = (decoded.limit_reached, decoded.capture_done);
                    let error = emit(&mut self.sink, decoded, first_index, channel_mask);

                    if let Some(e) = error {
                        acq.scheduler.park(slot, buffer);
                        self.abort(AbortReason::Protocol(e));
                    } else if limit_reached {
                        log::info!("Sample limit reached.");
                        acq.scheduler.park(slot, buffer);
                        self.begin_stop(EndReason::LimitReached);
                    } else if capture_done {
                        log::info!("Device finished the capture.");
                        acq.scheduler.park(slot, buffer);
                        self.begin_stop(EndReason::DeviceDone);
                    } else if let Err(e) =
                        acq.scheduler.resubmit(slot, buffer, self.session.transport_mut())
                    {
                        self.abort(AbortReason::Transfer(e));
                    }
                }
            }
        }

        self.finish_if_drained()
    }

    /// Waits up to `timeout` for one completion and dispatches it.
    pub fn poll(&mut self, timeout: Duration) -> Progress {
        if self.acquisition.is_none() {
            return Progress::Idle;
        }
        match self.session.transport_mut().wait_event(timeout) {
            Some(event) => self.dispatch(event),
            None => self.finish_if_drained(),
        }
    }

    /// Polls until the running acquisition has finished.
    ///
    /// Without a sample limit this only returns once the device reports the
    /// capture done or a transfer fails.
    pub fn run(&mut self, timeout: Duration) -> Result<StreamTrailer> {
        loop {
            match self.poll(timeout) {
                Progress::Running => {}
                Progress::Finished(trailer) => return Ok(trailer),
                Progress::Idle => {
                    return self
                        .last_trailer
                        .clone()
                        .ok_or_else(|| SessionError::NoAcquisition.into())
                }
            }
        }
    }

    fn finish_if_drained(&mut self) -> Progress {
        let drained = match &self.acquisition {
            Some(acq) => acq.stopping_in_progress && acq.scheduler.is_drained(),
            None => return Progress::Idle,
        };
        if drained {
            Progress::Finished(self.finish())
        } else {
            Progress::Running
        }
    }

    /// Runs once every transfer is back: shutdown command, state teardown, trailer.
    fn finish(&mut self) -> StreamTrailer {
        let acq = self.acquisition.take();
        let (samples, end) = acq.map_or((0, EndReason::Stopped), |acq| {
            (
                acq.decoder.samples_emitted(),
                acq.end.unwrap_or(EndReason::Stopped),
            )
        });

        if let Err(e) = self
            .session
            .transport_mut()
            .send_command(&encode_set_clock_source(ClockSource::None))
        {
            log::error!("Unable to shut down device: {}", e);
        }
        self.session.finish_stop();

        let trailer = StreamTrailer { samples, end };
        log::info!("Acquisition finished after {} samples: {:?}", samples, trailer.end);
        self.sink.trailer(&trailer);
        self.last_trailer = Some(trailer.clone());
        trailer
    }

    /// Stops any running acquisition, shuts the device down and returns the
    /// transport and sink.
    pub fn close(mut self) -> (T, S) {
        if self.acquisition.is_some() {
            self.begin_stop(EndReason::Stopped);
            let mut idle_polls = 0;
            loop {
                match self.poll(DEFAULT_POLL_TIMEOUT) {
                    Progress::Finished(_) | Progress::Idle => break,
                    Progress::Running => {
                        idle_polls += 1;
                        if idle_polls >= MAX_IDLE_CLOSE_POLLS {
                            log::error!(
                                "Closing with {} transfers still outstanding",
                                self.outstanding_transfers()
                            );
                            break;
                        }
                    }
                }
            }
        }
        let transport = self.session.close();
        (transport, self.sink)
    }
}

/// Forwards decoded samples, cutting batches where triggers fired. Hands
/// back the decode error, if any, once everything before it is delivered.
fn emit<S: SampleSink>(
    sink: &mut S,
    decoded: Decoded,
    first_index: u64,
    channel_mask: ChannelSet,
) -> Option<ProtocolError> {
    let Decoded {
        samples,
        triggers,
        error,
        ..
    } = decoded;

    if triggers.is_empty() {
        if !samples.is_empty() {
            sink.samples(&SampleBatch {
                first_index,
                channel_mask,
                samples,
            });
        }
        return error;
    }

    let mut start = 0;
    for trigger in triggers {
        let cut = usize::try_from(trigger.saturating_sub(first_index))
            .unwrap_or(usize::MAX)
            .clamp(start, samples.len());
        if cut > start {
            sink.samples(&SampleBatch {
                first_index: first_index + start as u64,
                channel_mask,
                samples: samples[start..cut].to_vec(),
            });
        }
        sink.trigger(trigger);
        start = cut;
    }
    if start < samples.len() {
        sink.samples(&SampleBatch {
            first_index: first_index + start as u64,
            channel_mask,
            samples: samples[start..].to_vec(),
        });
    }
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::DeviceModel;
    use crate::error::LwlaError;
    use crate::protocol::{Frame, ProtocolError, CMD_ARM, CMD_CONFIGURE_TRIGGERS, CMD_SET_CLOCK_SOURCE};
    use crate::simulator::SimulatedDevice;
    use crate::sink::CaptureBuffer;
    use crate::transport::TransferError;

    type Controller = AcquisitionController<SimulatedDevice, CaptureBuffer>;

    fn controller() -> Controller {
        let model = DeviceModel::LWLA1016;
        let session = DeviceSession::new(SimulatedDevice::new(model), model);
        let mut controller = AcquisitionController::new(session, CaptureBuffer::new()).with_transfer_pool(4, 64);
        controller.open().unwrap();
        controller
    }

    fn device(controller: &mut Controller) -> &mut SimulatedDevice {
        controller.session_mut().transport_mut()
    }

    fn shutdowns(controller: &Controller) -> usize {
        controller
            .session()
            .transport()
            .commands()
            .iter()
            .filter(|c| c.opcode() == CMD_SET_CLOCK_SOURCE && c.payload() == [0])
            .count()
    }

    #[test]
    fn test_start_sends_triggers_then_arm() {
        let mut controller = controller();
        controller.start_acquisition().unwrap();
        let opcodes: Vec<u16> = controller
            .session()
            .transport()
            .commands()
            .iter()
            .map(Frame::opcode)
            .collect();
        assert_eq!(opcodes, vec![CMD_SET_CLOCK_SOURCE, CMD_CONFIGURE_TRIGGERS, CMD_ARM]);
        assert_eq!(controller.outstanding_transfers(), 4);
        assert!(controller.sink().header.is_some());
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let mut controller = controller();
        controller.start_acquisition().unwrap();
        assert_eq!(
            controller.start_acquisition(),
            Err(LwlaError::Session(SessionError::AcquisitionInProgress))
        );
        assert_eq!(controller.outstanding_transfers(), 4);
    }

    #[test]
    fn test_start_requires_open_device() {
        let model = DeviceModel::LWLA1034;
        let session = DeviceSession::new(SimulatedDevice::new(model), model);
        let mut controller = AcquisitionController::new(session, CaptureBuffer::new());
        assert_eq!(
            controller.start_acquisition(),
            Err(LwlaError::Session(SessionError::NotActive(Status::Inactive)))
        );
        assert_eq!(
            controller.request_stop(),
            Err(LwlaError::Session(SessionError::NotActive(Status::Inactive)))
        );
    }

    #[test]
    fn test_stop_without_acquisition() {
        let mut controller = controller();
        assert_eq!(
            controller.request_stop(),
            Err(LwlaError::Session(SessionError::NoAcquisition))
        );
        assert_eq!(controller.poll(Duration::ZERO), Progress::Idle);
    }

    #[test]
    fn test_shutdown_waits_for_every_cancellation() {
        let mut controller = controller();
        controller.start_acquisition().unwrap();
        controller.request_stop().unwrap();
        assert_eq!(controller.session().status(), Status::Stopping);
        assert!(controller.is_stopping());
        assert_eq!(device(&mut controller).cancel_requests(), 1);

        for remaining in (1..4).rev() {
            assert_eq!(controller.poll(Duration::ZERO), Progress::Running);
            assert_eq!(controller.outstanding_transfers(), remaining);
            assert_eq!(shutdowns(&controller), 0);
        }

        let Progress::Finished(trailer) = controller.poll(Duration::ZERO) else {
            panic!("acquisition should have finished");
        };
        assert_eq!(trailer.end, EndReason::Stopped);
        assert_eq!(shutdowns(&controller), 1);
        assert_eq!(controller.session().status(), Status::Inactive);
        assert!(!controller.is_acquiring());
        assert_eq!(controller.sink().trailer, Some(trailer));

        // A second stop request has nothing left to cancel.
        assert!(controller.request_stop().is_err());
        assert_eq!(device(&mut controller).cancel_requests(), 1);
    }

    #[test]
    fn test_sample_limit_is_exact() {
        let mut controller = controller();
        controller.session_mut().set_sample_limit(17);
        controller.start_acquisition().unwrap();
        let records: Vec<u64> = (0..40).map(|i| 0xffff - i).collect();
        device(&mut controller).queue_samples(&records);

        let trailer = controller.run(Duration::ZERO).unwrap();
        assert_eq!(trailer.end, EndReason::LimitReached);
        assert_eq!(trailer.samples, 17);
        assert_eq!(controller.sink().samples, records[..17].to_vec());
        assert_eq!(shutdowns(&controller), 1);
        assert_eq!(device(&mut controller).pending_reads(), 0);
    }

    #[test]
    fn test_trigger_splits_batches_and_capture_done_ends() {
        let mut controller = controller();
        controller.start_acquisition().unwrap();
        let device = device(&mut controller);
        device.queue_samples(&[1, 2, 3, 4, 5]);
        device.queue_trigger();
        device.queue_samples(&[6, 7, 8, 9, 10]);
        device.queue_capture_done();

        let trailer = controller.run(Duration::ZERO).unwrap();
        assert_eq!(trailer.end, EndReason::DeviceDone);
        assert_eq!(trailer.samples, 10);
        let capture = controller.sink();
        assert_eq!(capture.triggers, vec![5]);
        assert_eq!(capture.batches, 2);
        assert_eq!(capture.samples, (1..=10).collect::<Vec<u64>>());
    }

    #[test]
    fn test_transfer_error_is_reported_once() {
        let mut controller = controller();
        device(&mut controller).fail_completion(0, TransferError::Stall);
        controller.start_acquisition().unwrap();

        assert_eq!(controller.poll(Duration::ZERO), Progress::Running);
        assert!(controller.is_stopping());

        // A second failure while cancelling must not replace the first.
        let progress = controller.dispatch(TransferEvent::Completed {
            slot: 1,
            data: Vec::new(),
            status: Err(TransferError::Fault),
        });
        assert_eq!(progress, Progress::Running);

        let trailer = controller.run(Duration::ZERO).unwrap();
        assert_eq!(
            trailer.end,
            EndReason::Aborted(AbortReason::Transfer(TransferError::Stall))
        );
        assert_eq!(shutdowns(&controller), 1);
        assert_eq!(controller.session().status(), Status::Inactive);
    }

    #[test]
    fn test_protocol_error_aborts() {
        let mut controller = controller();
        controller.start_acquisition().unwrap();
        let device = device(&mut controller);
        device.queue_samples(&[1, 2, 3]);
        device.queue_bytes(&[0x99, 0x00, 0x00, 0x00]);

        let trailer = controller.run(Duration::ZERO).unwrap();
        assert_eq!(
            trailer.end,
            EndReason::Aborted(AbortReason::Protocol(ProtocolError::UnknownOpcode(0x0099)))
        );
        // Samples decoded ahead of the bad frame still reach the sink.
        assert_eq!(controller.sink().samples, vec![1, 2, 3]);
        assert_eq!(trailer.samples, controller.sink().samples.len() as u64);
    }

    #[test]
    fn test_failed_arm_leaves_nothing_behind() {
        let mut controller = controller();
        device(&mut controller).fail_command(CMD_ARM, TransferError::Stall);
        assert_eq!(
            controller.start_acquisition(),
            Err(LwlaError::Transfer(TransferError::Stall))
        );
        assert!(!controller.is_acquiring());
        assert_eq!(controller.session().status(), Status::Active);
        assert_eq!(device(&mut controller).pending_reads(), 0);
        assert!(controller.sink().header.is_none());
    }

    #[test]
    fn test_failed_submission_drains_and_allows_retry() {
        let mut controller = controller();
        device(&mut controller).fail_submission(2);
        assert_eq!(
            controller.start_acquisition(),
            Err(LwlaError::Transfer(TransferError::Fault))
        );
        assert!(!controller.is_acquiring());
        assert_eq!(controller.session().status(), Status::Active);
        assert_eq!(device(&mut controller).pending_reads(), 0);

        device(&mut controller).clear_failures();
        controller.start_acquisition().unwrap();
        assert_eq!(controller.outstanding_transfers(), 4);
    }

    #[test]
    fn test_failed_start_writes_off_unconfirmed_transfers() {
        let mut controller = controller();
        let sim = device(&mut controller);
        sim.fail_submission(2);
        sim.hold_cancellations(true);
        assert!(controller.start_acquisition().is_err());
        assert!(!controller.is_acquiring());
        assert_eq!(device(&mut controller).forgotten_reads(), 2);

        let sim = device(&mut controller);
        sim.clear_failures();
        sim.hold_cancellations(false);
        sim.queue_samples(&[7, 8]);
        sim.queue_capture_done();
        controller.start_acquisition().unwrap();
        let trailer = controller.run(Duration::ZERO).unwrap();
        assert_eq!(trailer.end, EndReason::DeviceDone);
        assert_eq!(controller.sink().samples, vec![7, 8]);
    }

    #[test]
    fn test_close_drains_running_acquisition() {
        let mut controller = controller();
        controller.start_acquisition().unwrap();
        let (device, capture) = controller.close();
        assert_eq!(device.pending_reads(), 0);
        assert_eq!(capture.trailer.map(|t| t.end), Some(EndReason::Stopped));
        let shutdowns: Vec<&Frame> = device
            .commands()
            .iter()
            .filter(|c| c.opcode() == CMD_SET_CLOCK_SOURCE && c.payload() == [0])
            .collect();
        assert_eq!(shutdowns.len(), 1);
        assert_eq!(device.commands().last(), shutdowns.last().copied());
    }

    #[test]
    fn test_close_after_finished_capture_shuts_down_once() {
        let mut controller = controller();
        controller.start_acquisition().unwrap();
        controller.request_stop().unwrap();
        controller.run(Duration::ZERO).unwrap();
        assert_eq!(shutdowns(&controller), 1);

        let (device, _) = controller.close();
        let count = device
            .commands()
            .iter()
            .filter(|c| c.opcode() == CMD_SET_CLOCK_SOURCE && c.payload() == [0])
            .count();
        assert_eq!(count, 1);
    }
}
