//! TestController -- the DTM session state machine.
//!
//! The controller holds the stored test parameters, drives the setup, start
//! and end command sequences through the serial session, and runs the
//! single-channel and sweep procedures.
//!
//! # Termination
//!
//! A running test is bounded by up to two clocks:
//!
//! - the *main* clock (`timeout`) bounds the whole test call,
//! - the *step* clock (`sweep_time`) bounds one channel of a sweep.
//!
//! Each clock is a spawned task that sleeps and then sets its flag. The
//! flags guard the End command: whichever clock runs first issues End for
//! the current channel and the other one only records that it fired. An
//! explicit [`TestController::end_test`] behaves like an early main clock.
//!
//! Clocks never interrupt an exchange. If the main clock fires while a sweep
//! is between channels, End is sent as soon as the next start succeeds.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dtmlib_core::error::Result;
use dtmlib_core::events::DtmEvent;
use dtmlib_core::transport::Transport;
use dtmlib_core::types::{ModulationIndex, PacketType, Phy, SupportedParameter, TestKind};

use crate::codec::{self, Command, Report, Response, SetupControl};
use crate::io::DtmLink;

/// Dwell time per channel when a sweep does not specify one.
pub const DEFAULT_SWEEP_TIME: Duration = Duration::from_millis(1000);

const MSG_BUSY: &str = "A test is already running.";
const MSG_INVALID_RANGE: &str = "Invalid channel range.";
const MSG_TX_START_FAILED: &str = "Could not start transmission.";
const MSG_RX_START_FAILED: &str = "Could not start receiver.";
const MSG_TX_END_FAILED: &str = "Failed to send transmission end event.";
const MSG_RX_END_FAILED: &str = "Failed to send receive end event.";

/// Stored test parameters.
///
/// Every setter on [`TestController`] updates the matching field; test
/// procedures read the current values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestConfiguration {
    /// Payload length in octets.
    pub length: u8,
    pub phy: Phy,
    pub modulation: ModulationIndex,
    /// Transmit power in dBm. Truncated to 6 bits on the wire.
    pub tx_power_dbm: i8,
    pub timer: u8,
}

impl Default for TestConfiguration {
    fn default() -> Self {
        TestConfiguration {
            length: 1,
            phy: Phy::Le1M,
            modulation: ModulationIndex::Standard,
            tx_power_dbm: 0,
            timer: 0,
        }
    }
}

/// Primary state of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestState {
    #[default]
    Idle,
    Transmitting,
    Receiving,
}

impl fmt::Display for TestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestState::Idle => write!(f, "idle"),
            TestState::Transmitting => write!(f, "transmitting"),
            TestState::Receiving => write!(f, "receiving"),
        }
    }
}

/// Channel range and timing of a sweep test.
///
/// ```
/// use dtmlib::Sweep;
/// use std::time::Duration;
///
/// let sweep = Sweep::new(0, 39)
///     .sweep_time(Duration::from_millis(250))
///     .timeout(Duration::from_secs(10))
///     .random(true);
/// assert_eq!(sweep.width(), 40);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sweep {
    pub channel_low: u8,
    pub channel_high: u8,
    /// Dwell time per channel. Zero disables the step clock.
    pub sweep_time: Duration,
    /// Bound on the whole sweep. Zero disables the main clock, leaving
    /// [`TestController::end_test`] as the only way out.
    pub timeout: Duration,
    /// Pick each next channel uniformly at random instead of in order.
    pub random: bool,
}

impl Sweep {
    pub fn new(channel_low: u8, channel_high: u8) -> Self {
        Sweep {
            channel_low,
            channel_high,
            sweep_time: DEFAULT_SWEEP_TIME,
            timeout: Duration::ZERO,
            random: false,
        }
    }

    pub fn sweep_time(mut self, sweep_time: Duration) -> Self {
        self.sweep_time = sweep_time;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn random(mut self, random: bool) -> Self {
        self.random = random;
        self
    }

    /// Number of channels in the range, 0 when the range is inverted.
    pub fn width(&self) -> usize {
        if self.channel_high < self.channel_low {
            0
        } else {
            (self.channel_high - self.channel_low) as usize + 1
        }
    }
}

/// Result of a test call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOutcome {
    pub success: bool,
    /// Packets counted by the device (receiver tests).
    pub received: u32,
    /// Packets per channel of a receiver sweep, indexed from `channel_low`.
    pub received_per_channel: Option<Vec<u32>>,
    pub message: Option<String>,
}

impl TestOutcome {
    fn failure(message: &str) -> Self {
        TestOutcome {
            success: false,
            received: 0,
            received_per_channel: None,
            message: Some(message.to_string()),
        }
    }
}

/// Identifies a registered listener for [`TestController::remove_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&DtmEvent) + Send + Sync>;

/// End-of-step result delivered to the waiting test procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StepOutcome {
    success: bool,
    received: u32,
}

impl StepOutcome {
    const FAILED: StepOutcome = StepOutcome {
        success: false,
        received: 0,
    };

    fn from_end_response(response: Response) -> Self {
        match response.report() {
            Report::PacketReport { packets } => StepOutcome {
                success: true,
                received: packets as u32,
            },
            Report::Status { .. } => StepOutcome {
                success: true,
                received: 0,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Clock {
    Main,
    Step,
}

/// State of the test call in progress.
#[derive(Default)]
struct Session {
    state: TestState,
    sweeping: bool,
    running: bool,
    main_timed_out: bool,
    step_timed_out: bool,
    end_waiter: Option<oneshot::Sender<StepOutcome>>,
    main_clock: Option<CancellationToken>,
    step_clock: Option<CancellationToken>,
}

impl Session {
    fn is_active(&self) -> bool {
        self.state != TestState::Idle
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct Inner {
    link: DtmLink,
    io_task: Mutex<Option<JoinHandle<()>>>,
    session: Mutex<Session>,
    config: Mutex<TestConfiguration>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
    event_tx: broadcast::Sender<DtmEvent>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.link.cancel();
        let task = self
            .io_task
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, Session> {
        lock(&self.session)
    }

    fn emit(&self, event: DtmEvent) {
        debug!(?event, "DTM event");
        // Snapshot so listeners may register or remove listeners.
        let listeners: Vec<Listener> = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(&event);
        }
        let _ = self.event_tx.send(event);
    }

    /// Claim the controller for one test call.
    fn begin_test(&self, sweeping: bool) -> Option<RunGuard<'_>> {
        let mut s = self.session();
        if s.running {
            return None;
        }
        *s = Session {
            running: true,
            sweeping,
            ..Session::default()
        };
        Some(RunGuard { inner: self })
    }

    fn arm_clock(self: &Arc<Self>, clock: Clock, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let token = CancellationToken::new();
        {
            let mut s = self.session();
            let slot = match clock {
                Clock::Main => &mut s.main_clock,
                Clock::Step => &mut s.step_clock,
            };
            if let Some(previous) = slot.replace(token.clone()) {
                previous.cancel();
            }
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(duration) => {}
            }
            inner.clock_fired(clock, &token).await;
        });
    }

    async fn clock_fired(&self, clock: Clock, token: &CancellationToken) {
        let issue_end = {
            let mut s = self.session();
            // Cancelled between waking up and taking the lock.
            if token.is_cancelled() {
                return;
            }
            match clock {
                Clock::Main => {
                    debug!("test timeout elapsed");
                    s.main_clock = None;
                    s.main_timed_out = true;
                    s.is_active() && !s.step_timed_out
                }
                Clock::Step => {
                    debug!("sweep step time elapsed");
                    s.step_clock = None;
                    s.step_timed_out = true;
                    s.is_active() && !s.main_timed_out
                }
            }
        };
        if issue_end {
            self.end_current_test().await;
        }
    }

    async fn end_test(&self) {
        let issue_end = {
            let mut s = self.session();
            if s.main_timed_out {
                return;
            }
            s.main_timed_out = true;
            if let Some(clock) = s.main_clock.take() {
                clock.cancel();
            }
            s.is_active() && !s.step_timed_out
        };
        if issue_end {
            self.end_current_test().await;
        }
    }

    /// Send End and hand the outcome to the waiting test procedure.
    async fn end_current_test(&self) {
        let outcome = match self.link.send(codec::encode_end()).await {
            Ok(Some(response)) => StepOutcome::from_end_response(response),
            Ok(None) => {
                warn!("no response to test end command");
                StepOutcome::FAILED
            }
            Err(e) => {
                warn!(error = %e, "failed to send test end command");
                StepOutcome::FAILED
            }
        };

        let waiter = self.session().end_waiter.take();
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(outcome);
            }
            None => debug!("test end response with nobody waiting"),
        }
    }

    fn install_waiter(&self) -> oneshot::Receiver<StepOutcome> {
        let (tx, rx) = oneshot::channel();
        self.session().end_waiter = Some(tx);
        rx
    }

    /// Mark the test active; returns `true` when End is already due.
    fn activate(&self, kind: TestKind) -> bool {
        let mut s = self.session();
        s.state = match kind {
            TestKind::Transmitter => TestState::Transmitting,
            TestKind::Receiver => TestState::Receiving,
        };
        s.main_timed_out && !s.step_timed_out
    }

    fn begin_step(&self) {
        let mut s = self.session();
        s.state = TestState::Idle;
        s.step_timed_out = false;
    }

    fn end_step(&self) {
        let mut s = self.session();
        if let Some(clock) = s.step_clock.take() {
            clock.cancel();
        }
        s.state = TestState::Idle;
    }

    fn main_timed_out(&self) -> bool {
        self.session().main_timed_out
    }

    async fn exchange(&self, command: Command) -> Result<Option<Response>> {
        let response = self.link.send(command).await?;
        match response {
            Some(r) if r.report().failed() => {
                warn!(command = ?command.to_bytes(), "device reported failure");
            }
            None => warn!(command = ?command.to_bytes(), "no response"),
            Some(_) => {}
        }
        Ok(response)
    }
}

/// Releases the controller when a test call returns or is dropped.
struct RunGuard<'a> {
    inner: &'a Inner,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut s = self.inner.session();
        if let Some(clock) = s.main_clock.take() {
            clock.cancel();
        }
        if let Some(clock) = s.step_clock.take() {
            clock.cancel();
        }
        s.state = TestState::Idle;
        s.sweeping = false;
        s.running = false;
        s.end_waiter = None;
    }
}

/// Wait for the end-of-step outcome; a dropped sender counts as failure.
async fn await_end(waiter: oneshot::Receiver<StepOutcome>) -> StepOutcome {
    waiter.await.unwrap_or(StepOutcome::FAILED)
}

/// Index of the next channel of a sweep, relative to `channel_low`.
pub fn next_channel_index<R: Rng + ?Sized>(
    current: usize,
    width: usize,
    random: bool,
    rng: &mut R,
) -> usize {
    if width == 0 {
        return 0;
    }
    if random {
        rng.gen_range(0..width)
    } else {
        (current + 1) % width
    }
}

/// Controller for a DTM device.
///
/// Constructed via [`DtmBuilder`](crate::builder::DtmBuilder). Cloning is
/// cheap and all clones drive the same device, so one clone can call
/// [`end_test`](Self::end_test) while another awaits a running test.
#[derive(Clone)]
pub struct TestController {
    inner: Arc<Inner>,
}

impl TestController {
    pub(crate) fn new(
        link: DtmLink,
        io_task: JoinHandle<()>,
        configuration: TestConfiguration,
        event_capacity: usize,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(event_capacity.max(1));
        TestController {
            inner: Arc::new(Inner {
                link,
                io_task: Mutex::new(Some(io_task)),
                session: Mutex::new(Session::default()),
                config: Mutex::new(configuration),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
                event_tx,
            }),
        }
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<DtmEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Register a callback invoked synchronously on every lifecycle event.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&DtmEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        lock(&self.inner.listeners).push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.inner.listeners);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn state(&self) -> TestState {
        self.inner.session().state
    }

    pub fn is_sweeping(&self) -> bool {
        self.inner.session().sweeping
    }

    /// A copy of the stored test parameters.
    pub fn configuration(&self) -> TestConfiguration {
        lock(&self.inner.config).clone()
    }

    // ---------------------------------------------------------------
    // Setup commands
    // ---------------------------------------------------------------

    pub async fn setup_reset(&self) -> Result<Option<Response>> {
        self.inner
            .exchange(codec::encode_setup(SetupControl::Reset, 0, 0))
            .await
    }

    /// Send the upper two bits of the payload length.
    ///
    /// The low six bits travel in the transmitter command itself.
    pub async fn setup_length(&self, length: Option<u8>) -> Result<Option<Response>> {
        let length = {
            let mut config = lock(&self.inner.config);
            if let Some(length) = length {
                config.length = length;
            }
            config.length
        };
        self.inner
            .exchange(codec::encode_setup(SetupControl::EnableLength, length >> 6, 0))
            .await
    }

    pub async fn setup_phy(&self, phy: Option<Phy>) -> Result<Option<Response>> {
        let phy = {
            let mut config = lock(&self.inner.config);
            if let Some(phy) = phy {
                config.phy = phy;
            }
            config.phy
        };
        self.inner
            .exchange(codec::encode_setup(SetupControl::SetPhy, phy.wire_value(), 0))
            .await
    }

    pub async fn setup_modulation(
        &self,
        modulation: Option<ModulationIndex>,
    ) -> Result<Option<Response>> {
        let modulation = {
            let mut config = lock(&self.inner.config);
            if let Some(modulation) = modulation {
                config.modulation = modulation;
            }
            config.modulation
        };
        self.inner
            .exchange(codec::encode_setup(
                SetupControl::SetModulation,
                modulation.wire_value(),
                0,
            ))
            .await
    }

    pub async fn setup_read_features(&self) -> Result<Option<Response>> {
        self.inner
            .exchange(codec::encode_setup(SetupControl::ReadFeatures, 0, 0))
            .await
    }

    pub async fn setup_read_supported_rx_tx(
        &self,
        parameter: SupportedParameter,
    ) -> Result<Option<Response>> {
        self.inner
            .exchange(codec::encode_setup(
                SetupControl::ReadSupportedRxTx,
                parameter.wire_value(),
                0,
            ))
            .await
    }

    pub async fn set_tx_power(&self, dbm: Option<i8>) -> Result<Option<Response>> {
        let dbm = {
            let mut config = lock(&self.inner.config);
            if let Some(dbm) = dbm {
                config.tx_power_dbm = dbm;
            }
            config.tx_power_dbm
        };
        self.inner.exchange(codec::encode_tx_power(dbm)).await
    }

    pub async fn select_timer(&self, timer: Option<u8>) -> Result<Option<Response>> {
        let timer = {
            let mut config = lock(&self.inner.config);
            if let Some(timer) = timer {
                config.timer = timer;
            }
            config.timer
        };
        self.inner.exchange(codec::encode_select_timer(timer)).await
    }

    async fn setup_for(&self, kind: TestKind) -> Result<()> {
        self.setup_reset().await?;
        self.select_timer(None).await?;
        if kind == TestKind::Transmitter {
            self.set_tx_power(None).await?;
            self.setup_length(None).await?;
        }
        self.setup_modulation(None).await?;
        self.setup_phy(None).await?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Test procedures
    // ---------------------------------------------------------------

    /// Transmit on one channel until `timeout` elapses or
    /// [`end_test`](Self::end_test) is called.
    ///
    /// With a zero `timeout` the call only returns after `end_test`.
    /// Call `end_test` before dropping the future: a dropped test releases
    /// the controller but sends no End, so the device keeps transmitting.
    pub async fn single_channel_transmitter_test(
        &self,
        bit_pattern: PacketType,
        length: u8,
        channel: u8,
        timeout: Duration,
    ) -> Result<TestOutcome> {
        let start = codec::encode_carrier(channel, length, bit_pattern);
        self.single_channel_test(TestKind::Transmitter, start, channel, timeout)
            .await
    }

    /// Receive on one channel until `timeout` elapses or
    /// [`end_test`](Self::end_test) is called. Call `end_test` before
    /// dropping the future; a dropped test leaves the device receiving.
    pub async fn single_channel_receiver_test(
        &self,
        channel: u8,
        timeout: Duration,
    ) -> Result<TestOutcome> {
        let start = codec::encode_receiver(channel, 0, PacketType::Prbs9);
        self.single_channel_test(TestKind::Receiver, start, channel, timeout)
            .await
    }

    async fn single_channel_test(
        &self,
        kind: TestKind,
        start: Command,
        channel: u8,
        timeout: Duration,
    ) -> Result<TestOutcome> {
        let inner = &self.inner;
        let Some(_run) = inner.begin_test(false) else {
            return Ok(TestOutcome::failure(MSG_BUSY));
        };
        inner.emit(DtmEvent::Reset);
        info!(%kind, channel, ?timeout, "starting single channel test");

        inner.arm_clock(Clock::Main, timeout);
        let waiter = inner.install_waiter();

        let started = inner.exchange(start).await?;
        if !started.is_some_and(|r| r.is_success()) {
            return Ok(TestOutcome::failure(start_failed_message(kind)));
        }

        let end_due = inner.activate(kind);
        inner.emit(DtmEvent::Started { kind, channel });
        if end_due {
            inner.end_current_test().await;
        }

        let outcome = await_end(waiter).await;
        inner.emit(DtmEvent::Ended {
            kind,
            channel,
            packets: reported_packets(kind, outcome.received),
        });
        info!(%kind, channel, success = outcome.success, received = outcome.received, "test ended");

        Ok(TestOutcome {
            success: outcome.success,
            received: outcome.received,
            received_per_channel: None,
            message: (!outcome.success).then(|| end_failed_message(kind).to_string()),
        })
    }

    /// Transmit across a channel range until the sweep timeout elapses or
    /// [`end_test`](Self::end_test) is called. As with the single-channel
    /// tests, call `end_test` before dropping the future.
    pub async fn sweep_transmitter_test(
        &self,
        bit_pattern: PacketType,
        length: u8,
        sweep: &Sweep,
    ) -> Result<TestOutcome> {
        self.sweep_test(TestKind::Transmitter, bit_pattern, length, sweep)
            .await
    }

    /// Receive across a channel range, counting packets per channel.
    /// Call [`end_test`](Self::end_test) before dropping the future.
    pub async fn sweep_receiver_test(&self, sweep: &Sweep) -> Result<TestOutcome> {
        self.sweep_test(TestKind::Receiver, PacketType::Prbs9, 0, sweep)
            .await
    }

    async fn sweep_test(
        &self,
        kind: TestKind,
        bit_pattern: PacketType,
        length: u8,
        sweep: &Sweep,
    ) -> Result<TestOutcome> {
        let width = sweep.width();
        if width == 0 {
            return Ok(TestOutcome::failure(MSG_INVALID_RANGE));
        }

        let inner = &self.inner;
        let Some(_run) = inner.begin_test(true) else {
            return Ok(TestOutcome::failure(MSG_BUSY));
        };
        inner.emit(DtmEvent::Reset);
        info!(
            %kind,
            low = sweep.channel_low,
            high = sweep.channel_high,
            sweep_time = ?sweep.sweep_time,
            timeout = ?sweep.timeout,
            random = sweep.random,
            "starting sweep"
        );

        inner.arm_clock(Clock::Main, sweep.timeout);

        let mut per_channel = vec![0u32; width];
        let mut index = 0usize;

        while !inner.main_timed_out() {
            let channel = sweep.channel_low + index as u8;
            inner.begin_step();
            self.setup_for(kind).await?;

            let start = match kind {
                TestKind::Transmitter => codec::encode_carrier(channel, length, bit_pattern),
                TestKind::Receiver => codec::encode_receiver(channel, 0, PacketType::Prbs9),
            };
            let waiter = inner.install_waiter();
            let started = inner.exchange(start).await?;
            if !started.is_some_and(|r| r.is_success()) {
                return Ok(TestOutcome::failure(start_failed_message(kind)));
            }

            let end_due = inner.activate(kind);
            inner.emit(DtmEvent::Started { kind, channel });
            if end_due {
                inner.end_current_test().await;
            } else {
                inner.arm_clock(Clock::Step, sweep.sweep_time);
            }

            let outcome = await_end(waiter).await;
            inner.end_step();
            if !outcome.success {
                return Ok(TestOutcome::failure(end_failed_message(kind)));
            }

            inner.emit(DtmEvent::Ended {
                kind,
                channel,
                packets: reported_packets(kind, outcome.received),
            });
            if kind == TestKind::Receiver {
                per_channel[index] += outcome.received;
            }

            index = next_channel_index(index, width, sweep.random, &mut rand::thread_rng());
        }

        info!(%kind, "sweep finished");
        Ok(match kind {
            TestKind::Transmitter => TestOutcome {
                success: true,
                received: 0,
                received_per_channel: None,
                message: None,
            },
            TestKind::Receiver => TestOutcome {
                success: true,
                received: per_channel.iter().sum(),
                received_per_channel: Some(per_channel),
                message: None,
            },
        })
    }

    /// End the running test.
    ///
    /// Idempotent: once the test has been told to end, further calls do
    /// nothing until the next test starts.
    pub async fn end_test(&self) {
        self.inner.end_test().await;
    }

    /// Close the serial port. The next command reopens it.
    pub async fn close(&self) -> Result<()> {
        self.inner.link.close().await
    }

    /// Stop the IO task and recover the transport.
    pub async fn shutdown(&self) -> Result<Box<dyn Transport>> {
        let transport = self.inner.link.shutdown().await?;
        let task = lock(&self.inner.io_task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(transport)
    }
}

fn start_failed_message(kind: TestKind) -> &'static str {
    match kind {
        TestKind::Transmitter => MSG_TX_START_FAILED,
        TestKind::Receiver => MSG_RX_START_FAILED,
    }
}

fn end_failed_message(kind: TestKind) -> &'static str {
    match kind {
        TestKind::Transmitter => MSG_TX_END_FAILED,
        TestKind::Receiver => MSG_RX_END_FAILED,
    }
}

fn reported_packets(kind: TestKind, received: u32) -> Option<u32> {
    match kind {
        TestKind::Transmitter => None,
        TestKind::Receiver => Some(received),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::DtmBuilder;
    use dtmlib_core::error::Error;
    use dtmlib_test_harness::MockTransport;
    use rand::SeedableRng;

    const OK: [u8; 2] = [0x00, 0x00];
    const FAILED: [u8; 2] = [0x01, 0x00];
    const RESET: [u8; 2] = [0x00, 0x00];
    const TIMER_0: [u8; 2] = [0x80, 0x0F];
    const TX_POWER_0: [u8; 2] = [0x80, 0x0B];
    const LENGTH_1: [u8; 2] = [0x01, 0x00];
    const MODULATION_STANDARD: [u8; 2] = [0x03, 0x00];
    const PHY_1M: [u8; 2] = [0x02, 0x04];
    const END: [u8; 2] = [0xC0, 0x00];

    fn packets(n: u16) -> [u8; 2] {
        [0x80 | (n >> 8) as u8, n as u8]
    }

    fn receiver_start(channel: u8) -> [u8; 2] {
        [0x40 | channel, 0x00]
    }

    /// Carrier command for a 1-octet PRBS9 payload.
    fn transmitter_start(channel: u8) -> [u8; 2] {
        [0x80 | channel, 0x04]
    }

    fn expect_rx_setup(mock: &MockTransport) {
        for cmd in [RESET, TIMER_0, MODULATION_STANDARD, PHY_1M] {
            mock.expect(&cmd, &OK);
        }
    }

    fn expect_tx_setup(mock: &MockTransport) {
        for cmd in [RESET, TIMER_0, TX_POWER_0, LENGTH_1, MODULATION_STANDARD, PHY_1M] {
            mock.expect(&cmd, &OK);
        }
    }

    async fn controller(mock: &MockTransport) -> TestController {
        DtmBuilder::new()
            .build_with_transport(Box::new(mock.clone()))
            .await
            .unwrap()
    }

    fn record(dtm: &TestController) -> Arc<Mutex<Vec<DtmEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        dtm.add_listener(move |event| sink.lock().unwrap().push(event.clone()));
        events
    }

    // ---------------------------------------------------------------
    // Setup commands
    // ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn setters_store_values_and_send() {
        let mock = MockTransport::new();
        mock.expect(&[0xBC, 0x0B], &OK); // -4 dBm
        mock.expect(&[0x01, 0x0C], &OK); // length 200, upper bits 3
        mock.expect(&[0x01, 0x0C], &OK); // stored length reused
        mock.expect(&[0x02, 0x08], &OK); // LE 2M
        mock.expect(&[0x03, 0x04], &OK); // stable modulation
        mock.expect(&[0x82, 0x0F], &OK); // timer 2
        let dtm = controller(&mock).await;

        let response = dtm.set_tx_power(Some(-4)).await.unwrap();
        assert_eq!(response, Some(Response::new(OK)));
        dtm.setup_length(Some(200)).await.unwrap();
        dtm.setup_length(None).await.unwrap();
        dtm.setup_phy(Some(Phy::Le2M)).await.unwrap();
        dtm.setup_modulation(Some(ModulationIndex::Stable)).await.unwrap();
        dtm.select_timer(Some(2)).await.unwrap();

        assert_eq!(
            dtm.configuration(),
            TestConfiguration {
                length: 200,
                phy: Phy::Le2M,
                modulation: ModulationIndex::Stable,
                tx_power_dbm: -4,
                timer: 2,
            }
        );
        assert_eq!(mock.remaining_expectations(), 0);
        assert_eq!(dtm.state(), TestState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn read_commands_return_raw_response() {
        let mock = MockTransport::new();
        mock.expect(&[0x04, 0x00], &[0x00, 0x0C]);
        mock.expect(&[0x05, 0x0C], &[0x00, 0x52]);
        let dtm = controller(&mock).await;

        let features = dtm.setup_read_features().await.unwrap().unwrap();
        assert_eq!(features.bytes(), [0x00, 0x0C]);

        let max = dtm
            .setup_read_supported_rx_tx(SupportedParameter::MaxRxTime)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(max.bytes(), [0x00, 0x52]);
        assert_eq!(dtm.configuration(), TestConfiguration::default());
    }

    #[tokio::test(start_paused = true)]
    async fn setter_without_response_is_none() {
        let mock = MockTransport::new();
        mock.expect_silence(&RESET);
        let dtm = controller(&mock).await;

        assert_eq!(dtm.setup_reset().await.unwrap(), None);
    }

    // ---------------------------------------------------------------
    // Single-channel tests
    // ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn single_receiver_test_ends_on_timeout() {
        let mock = MockTransport::new();
        mock.expect(&receiver_start(5), &OK);
        mock.expect(&END, &packets(42));
        let dtm = controller(&mock).await;
        let events = record(&dtm);
        let mut rx = dtm.subscribe();

        let outcome = dtm
            .single_channel_receiver_test(5, Duration::from_millis(1000))
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.received, 42);
        assert_eq!(outcome.received_per_channel, None);
        assert_eq!(outcome.message, None);
        assert_eq!(dtm.state(), TestState::Idle);
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                DtmEvent::Reset,
                DtmEvent::Started {
                    kind: TestKind::Receiver,
                    channel: 5
                },
                DtmEvent::Ended {
                    kind: TestKind::Receiver,
                    channel: 5,
                    packets: Some(42)
                },
            ]
        );
        assert_eq!(rx.recv().await.unwrap(), DtmEvent::Reset);
    }

    #[tokio::test(start_paused = true)]
    async fn single_transmitter_start_failure() {
        let mock = MockTransport::new();
        mock.expect(&[0x8A, 0x96], &FAILED); // ch 10, 37 octets, 10101010
        let dtm = controller(&mock).await;

        let outcome = dtm
            .single_channel_transmitter_test(
                PacketType::Pattern10101010,
                37,
                10,
                Duration::from_millis(500),
            )
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.message.as_deref(), Some(MSG_TX_START_FAILED));
        assert_eq!(dtm.state(), TestState::Idle);

        // The main clock was cancelled with the test.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(mock.sent_count(&END), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn single_receiver_start_without_response_fails() {
        let mock = MockTransport::new();
        mock.expect_silence(&receiver_start(0));
        let dtm = controller(&mock).await;

        let outcome = dtm
            .single_channel_receiver_test(0, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.message.as_deref(), Some(MSG_RX_START_FAILED));
    }

    #[tokio::test(start_paused = true)]
    async fn carrier_test_sends_zero_length() {
        let mock = MockTransport::new();
        mock.expect(&[0x83, 0x03], &OK); // ch 3, vendor, length dropped
        mock.expect(&END, &OK);
        let dtm = controller(&mock).await;

        let outcome = dtm
            .single_channel_transmitter_test(
                PacketType::Vendor,
                37,
                3,
                Duration::from_millis(100),
            )
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.received, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn end_test_is_idempotent() {
        let mock = MockTransport::new();
        mock.expect(&transmitter_start(3), &OK);
        mock.expect(&END, &OK);
        let dtm = controller(&mock).await;

        let runner = dtm.clone();
        let test = tokio::spawn(async move {
            runner
                .single_channel_transmitter_test(PacketType::Prbs9, 1, 3, Duration::ZERO)
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dtm.state(), TestState::Transmitting);

        dtm.end_test().await;
        dtm.end_test().await;

        let outcome = test.await.unwrap().unwrap();
        assert!(outcome.success);
        assert_eq!(mock.sent_count(&END), 1);
        assert_eq!(dtm.state(), TestState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_test_is_rejected() {
        let mock = MockTransport::new();
        mock.expect(&receiver_start(1), &OK);
        mock.expect(&END, &packets(3));
        let dtm = controller(&mock).await;

        let runner = dtm.clone();
        let test = tokio::spawn(async move {
            runner.single_channel_receiver_test(1, Duration::ZERO).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let rejected = dtm
            .single_channel_transmitter_test(PacketType::Prbs9, 1, 2, Duration::ZERO)
            .await
            .unwrap();
        assert!(!rejected.success);
        assert_eq!(rejected.message.as_deref(), Some(MSG_BUSY));
        assert_eq!(dtm.state(), TestState::Receiving);

        dtm.end_test().await;
        let outcome = test.await.unwrap().unwrap();
        assert_eq!(outcome.received, 3);
        assert_eq!(mock.sent_data().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn port_unavailable_is_surfaced() {
        let mock = MockTransport::new();
        mock.fail_open("device busy");
        let dtm = controller(&mock).await;

        let result = dtm
            .single_channel_receiver_test(0, Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(Error::PortUnavailable(_))));

        // The controller is free again for a retry.
        let result = dtm
            .single_channel_receiver_test(0, Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(Error::PortUnavailable(_))));
        assert_eq!(dtm.state(), TestState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn single_receiver_end_unanswered_reports_message() {
        let mock = MockTransport::new();
        mock.expect(&receiver_start(7), &OK);
        mock.expect_silence(&END);
        let dtm = controller(&mock).await;

        let outcome = dtm
            .single_channel_receiver_test(7, Duration::from_millis(100))
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.received, 0);
        assert_eq!(outcome.message.as_deref(), Some(MSG_RX_END_FAILED));
        assert_eq!(dtm.state(), TestState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_test_releases_controller() {
        let mock = MockTransport::new();
        mock.expect(&receiver_start(4), &OK);
        mock.expect(&receiver_start(4), &OK);
        mock.expect(&END, &packets(3));
        let dtm = controller(&mock).await;

        let runner = dtm.clone();
        let test = tokio::spawn(async move {
            runner
                .single_channel_receiver_test(4, Duration::from_millis(500))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dtm.state(), TestState::Receiving);

        test.abort();
        assert!(test.await.unwrap_err().is_cancelled());
        assert_eq!(dtm.state(), TestState::Idle);

        // The main clock went down with the test.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(mock.sent_count(&END), 0);

        let outcome = dtm
            .single_channel_receiver_test(4, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.received, 3);
        assert_eq!(mock.remaining_expectations(), 0);
    }

    // ---------------------------------------------------------------
    // Sweeps
    // ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn receiver_sweep_aggregates_per_channel() {
        let mock = MockTransport::new();
        let counts = [10u16, 0, 5, 0, 20, 0];
        for (i, count) in counts.iter().enumerate() {
            expect_rx_setup(&mock);
            mock.expect(&receiver_start(18 + i as u8), &OK);
            mock.expect(&END, &packets(*count));
        }
        let dtm = controller(&mock).await;
        let events = record(&dtm);

        let sweep = Sweep::new(18, 23)
            .sweep_time(Duration::from_millis(100))
            .timeout(Duration::from_millis(550));
        let outcome = dtm.sweep_receiver_test(&sweep).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.received, 35);
        assert_eq!(outcome.received_per_channel, Some(vec![10, 0, 5, 0, 20, 0]));
        assert_eq!(mock.sent_count(&END), 6);
        assert_eq!(mock.remaining_expectations(), 0);
        assert!(!dtm.is_sweeping());

        let events = events.lock().unwrap();
        assert_eq!(events[0], DtmEvent::Reset);
        assert_eq!(
            events.last(),
            Some(&DtmEvent::Ended {
                kind: TestKind::Receiver,
                channel: 23,
                packets: Some(0)
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn simultaneous_clocks_send_one_end() {
        let mock = MockTransport::new();
        for channel in 0..2 {
            expect_tx_setup(&mock);
            mock.expect(&transmitter_start(channel), &OK);
            mock.expect(&END, &OK);
        }
        let dtm = controller(&mock).await;

        // The second step and the whole sweep expire at the same instant.
        let sweep = Sweep::new(0, 39)
            .sweep_time(Duration::from_millis(100))
            .timeout(Duration::from_millis(200));
        let outcome = dtm
            .sweep_transmitter_test(PacketType::Prbs9, 1, &sweep)
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.received, 0);
        assert_eq!(outcome.received_per_channel, None);
        assert_eq!(mock.sent_count(&END), 2);
        assert_eq!(mock.remaining_expectations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn random_sweep_stays_in_range() {
        let mock = MockTransport::new();
        for count in [1u16, 2, 3] {
            expect_rx_setup(&mock);
            mock.expect(&receiver_start(7), &OK);
            mock.expect(&END, &packets(count));
        }
        let dtm = controller(&mock).await;

        let sweep = Sweep::new(7, 7)
            .sweep_time(Duration::from_millis(100))
            .timeout(Duration::from_millis(250))
            .random(true);
        let outcome = dtm.sweep_receiver_test(&sweep).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.received, 6);
        assert_eq!(outcome.received_per_channel, Some(vec![6]));
    }

    #[tokio::test(start_paused = true)]
    async fn transmitter_sweep_fails_when_end_unanswered() {
        let mock = MockTransport::new();
        expect_tx_setup(&mock);
        mock.expect(&transmitter_start(2), &OK);
        mock.expect_silence(&END);
        let dtm = controller(&mock).await;

        let sweep = Sweep::new(2, 2).sweep_time(Duration::from_millis(100));
        let outcome = dtm
            .sweep_transmitter_test(PacketType::Prbs9, 1, &sweep)
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.message.as_deref(), Some(MSG_TX_END_FAILED));
        assert_eq!(dtm.state(), TestState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_start_failure_aborts() {
        let mock = MockTransport::new();
        expect_rx_setup(&mock);
        mock.expect(&receiver_start(30), &FAILED);
        let dtm = controller(&mock).await;

        let sweep = Sweep::new(30, 32).timeout(Duration::from_secs(10));
        let outcome = dtm.sweep_receiver_test(&sweep).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.message.as_deref(), Some(MSG_RX_START_FAILED));
        assert_eq!(mock.sent_count(&END), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_during_setup_ends_after_start() {
        let mock = MockTransport::new();
        mock.expect_silence(&RESET);
        for cmd in [TIMER_0, MODULATION_STANDARD, PHY_1M] {
            mock.expect(&cmd, &OK);
        }
        mock.expect(&receiver_start(4), &OK);
        mock.expect(&END, &packets(9));
        let dtm = controller(&mock).await;

        // The main clock fires while the reset is still waiting for its
        // response, before any channel is active.
        let sweep = Sweep::new(4, 4)
            .sweep_time(Duration::from_secs(5))
            .timeout(Duration::from_millis(500));
        let outcome = dtm.sweep_receiver_test(&sweep).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.received, 9);
        assert_eq!(mock.sent_count(&END), 1);
        assert_eq!(mock.remaining_expectations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn end_test_stops_sweep() {
        let mock = MockTransport::new();
        expect_rx_setup(&mock);
        mock.expect(&receiver_start(12), &OK);
        mock.expect(&END, &packets(4));
        let dtm = controller(&mock).await;

        let runner = dtm.clone();
        let test = tokio::spawn(async move {
            let sweep = Sweep::new(12, 14).sweep_time(Duration::from_secs(1));
            runner.sweep_receiver_test(&sweep).await
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(dtm.is_sweeping());

        dtm.end_test().await;
        let outcome = test.await.unwrap().unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.received_per_channel, Some(vec![4, 0, 0]));
        assert_eq!(mock.sent_count(&END), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn inverted_range_is_rejected() {
        let mock = MockTransport::new();
        let dtm = controller(&mock).await;

        let outcome = dtm.sweep_receiver_test(&Sweep::new(10, 5)).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.message.as_deref(), Some(MSG_INVALID_RANGE));
        assert!(mock.sent_data().is_empty());
    }

    // ---------------------------------------------------------------
    // Listeners, lifecycle
    // ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn removed_listener_gets_nothing() {
        let mock = MockTransport::new();
        mock.expect(&receiver_start(0), &FAILED);
        let dtm = controller(&mock).await;

        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        let id = dtm.add_listener(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        assert!(dtm.remove_listener(id));
        assert!(!dtm.remove_listener(id));

        dtm.single_channel_receiver_test(0, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn close_and_reopen() {
        let mock = MockTransport::new();
        mock.expect(&RESET, &OK);
        mock.expect(&RESET, &OK);
        mock.expect(&RESET, &OK);
        let dtm = controller(&mock).await;

        dtm.setup_reset().await.unwrap();
        dtm.close().await.unwrap();
        assert_eq!(mock.close_calls(), 1);
        dtm.setup_reset().await.unwrap();
        assert_eq!(mock.open_calls(), 2);

        mock.fail_next_close("driver error");
        assert!(matches!(dtm.close().await, Err(Error::PortCloseFailed(_))));

        // A failed close does not block the next command.
        assert_eq!(dtm.setup_reset().await.unwrap(), Some(Response::new(OK)));
        assert_eq!(mock.remaining_expectations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_returns_transport() {
        let mock = MockTransport::new();
        mock.expect(&RESET, &OK);
        let dtm = controller(&mock).await;

        dtm.setup_reset().await.unwrap();
        let transport = dtm.shutdown().await.unwrap();
        assert!(transport.is_connected());
    }

    #[test]
    fn sequential_advance_wraps() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        assert_eq!(next_channel_index(0, 6, false, &mut rng), 1);
        assert_eq!(next_channel_index(4, 6, false, &mut rng), 5);
        assert_eq!(next_channel_index(5, 6, false, &mut rng), 0);
        assert_eq!(next_channel_index(0, 1, false, &mut rng), 0);
    }

    #[test]
    fn random_advance_covers_range() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut seen = [false; 4];
        for _ in 0..200 {
            let next = next_channel_index(2, 4, true, &mut rng);
            assert!(next < 4);
            seen[next] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn sweep_width() {
        assert_eq!(Sweep::new(18, 23).width(), 6);
        assert_eq!(Sweep::new(0, 39).width(), 40);
        assert_eq!(Sweep::new(5, 5).width(), 1);
        assert_eq!(Sweep::new(6, 5).width(), 0);
    }

    #[test]
    fn end_response_decoding() {
        assert_eq!(
            StepOutcome::from_end_response(Response::new([0x80, 0x05])),
            StepOutcome {
                success: true,
                received: 5
            }
        );
        assert_eq!(
            StepOutcome::from_end_response(Response::new(OK)),
            StepOutcome {
                success: true,
                received: 0
            }
        );
    }
}
