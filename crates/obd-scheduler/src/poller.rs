//! Adaptive PID Poller
//!
//! A [`Poller`] drives the request/response cycle for one PID. In continuous
//! mode it aims for a fixed *send* cadence: the delay before the next request
//! is the target interval minus the latency of the last round trip, so slow
//! adapter responses do not stretch the polling period.

use obd_protocol::{ObdError, PidDescriptor, Session, Signal};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for a poller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Target time between successive requests in milliseconds (default: 200, i.e. 5Hz)
    pub target_interval_ms: u64,
    /// Fail a request with no matching response after this many milliseconds
    pub response_timeout_ms: u64,
    /// Capacity of the poller's event channel
    pub event_capacity: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            target_interval_ms: 200,
            response_timeout_ms: 2000,
            event_capacity: 32,
        }
    }
}

impl PollerConfig {
    pub fn target_interval(&self) -> Duration {
        Duration::from_millis(self.target_interval_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Events published by a poller
#[derive(Debug, Clone, PartialEq)]
pub enum PollerEvent {
    /// A response for this poller's PID
    Data(Signal),
    /// A poll failed
    Error(ObdError),
}

/// Delay before the next request.
///
/// Zero if nothing was sent yet or the last round trip already took at least
/// `target`; otherwise whatever remains of `target` after that round trip.
pub fn next_poll_delay(
    last_poll: Option<Instant>,
    last_response: Option<Instant>,
    target: Duration,
) -> Duration {
    let Some(last_poll) = last_poll else {
        return Duration::ZERO;
    };
    let latency = last_response
        .map(|response| response.saturating_duration_since(last_poll))
        .unwrap_or(Duration::ZERO);
    target.saturating_sub(latency)
}

#[derive(Debug, Default)]
struct PollerState {
    last_poll: Option<Instant>,
    last_response: Option<Instant>,
    polling: bool,
    in_flight: bool,
    timer: Option<JoinHandle<()>>,
}

struct PollerInner {
    session: Session,
    pid: PidDescriptor,
    config: PollerConfig,
    state: Mutex<PollerState>,
    events: broadcast::Sender<PollerEvent>,
}

impl PollerInner {
    fn state(&self) -> MutexGuard<'_, PollerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn ends_polling(e: &ObdError) -> bool {
    e.is_transport() || matches!(e, ObdError::NotConfigured)
}

/// Clears `in_flight` if a poll is abandoned before it completes
struct InFlight<'a> {
    inner: &'a PollerInner,
    armed: bool,
}

impl InFlight<'_> {
    /// Finish the request. Returns whether continuous polling should go on.
    fn complete(mut self, result: &Result<Signal, ObdError>) -> bool {
        self.armed = false;
        let mut state = self.inner.state();
        state.in_flight = false;
        match result {
            Ok(_) => state.last_response = Some(Instant::now()),
            // Without a usable link there is nothing left to poll
            Err(e) if ends_polling(e) => state.polling = false,
            // A missed reply keeps its slot in the schedule; it is not retried
            Err(_) => {}
        }
        state.polling
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.state().in_flight = false;
        }
    }
}

/// Requests one PID on demand or on a latency-adapted schedule.
///
/// Cheap to clone; clones share state. A continuously polling poller keeps
/// itself alive until [`stop_polling`](Self::stop_polling) is called.
#[derive(Clone)]
pub struct Poller {
    inner: Arc<PollerInner>,
}

impl Poller {
    /// Create a poller targeting one request per `target_interval`
    pub fn new(session: Session, pid: PidDescriptor, target_interval: Duration) -> Self {
        let config = PollerConfig {
            target_interval_ms: u64::try_from(target_interval.as_millis()).unwrap_or(u64::MAX),
            ..PollerConfig::default()
        };
        Self::with_config(session, pid, config)
    }

    pub fn with_config(session: Session, pid: PidDescriptor, config: PollerConfig) -> Self {
        info!("Created poller for {} ({:?})", pid.name(), config);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(PollerInner {
                session,
                pid,
                config,
                state: Mutex::new(PollerState::default()),
                events,
            }),
        }
    }

    /// Create a poller for a PID code known to the session's registry
    pub fn for_code(session: Session, code: &str, target_interval: Duration) -> Result<Self, ObdError> {
        let pid = *session.registry().get(code)?;
        Ok(Self::new(session, pid, target_interval))
    }

    pub fn pid(&self) -> &PidDescriptor {
        &self.inner.pid
    }

    pub fn config(&self) -> &PollerConfig {
        &self.inner.config
    }

    /// Receive this poller's data and error events
    pub fn subscribe(&self) -> broadcast::Receiver<PollerEvent> {
        self.inner.events.subscribe()
    }

    /// True while a request is awaiting its response
    pub fn is_locked(&self) -> bool {
        self.inner.state().in_flight
    }

    /// True while continuous polling is enabled
    pub fn is_polling(&self) -> bool {
        self.inner.state().polling
    }

    /// Delay before the next scheduled request
    pub fn next_poll_delay(&self) -> Duration {
        let state = self.inner.state();
        next_poll_delay(
            state.last_poll,
            state.last_response,
            self.inner.config.target_interval(),
        )
    }

    /// Request the PID once and wait for its response.
    ///
    /// Fails with [`ObdError::Busy`] if a request is already in flight.
    /// The result is also published to subscribers.
    pub async fn poll(&self) -> Result<Signal, ObdError> {
        let name = self.inner.pid.name();
        let guard = {
            let mut state = self.inner.state();
            if state.in_flight {
                warn!("poll() was called for {}, but it was locked", name);
                return Err(ObdError::Busy(name.to_string()));
            }
            state.in_flight = true;
            InFlight {
                inner: &self.inner,
                armed: true,
            }
        };

        let result = self.request().await;
        let keep_polling = guard.complete(&result);

        match result {
            Ok(signal) => {
                debug!("Received response for {} ({})", name, signal.bytes);
                let _ = self.inner.events.send(PollerEvent::Data(signal.clone()));
                if keep_polling {
                    self.schedule();
                }
                Ok(signal)
            }
            Err(e) => {
                warn!("Failed to poll for {}: {}", name, e);
                let _ = self.inner.events.send(PollerEvent::Error(e.clone()));
                if keep_polling {
                    self.schedule();
                }
                Err(e)
            }
        }
    }

    /// Start polling continuously. No-op if already polling.
    pub fn start_polling(&self) {
        {
            let mut state = self.inner.state();
            if state.polling {
                return;
            }
            info!(
                "Start polling {} every {}ms",
                self.inner.pid.name(),
                self.inner.config.target_interval_ms
            );
            state.polling = true;
            // The request on the wire reschedules when it completes
            if state.in_flight {
                return;
            }
        }
        self.schedule();
    }

    /// Stop polling and cancel the pending timer. A request already on the
    /// wire still completes. Safe to call repeatedly.
    pub fn stop_polling(&self) {
        let mut state = self.inner.state();
        if state.polling {
            info!("Cancelling poll interval for {}", self.inner.pid.name());
        }
        state.polling = false;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    async fn request(&self) -> Result<Signal, ObdError> {
        let connection = self.inner.session.connection().await?;
        let code = self.inner.pid.code();
        let watch = connection.watch(move |signal: &Signal| signal.matches_pid(code));

        let command = self.inner.pid.write_string();
        debug!("Performing poll for {}, command is {}", self.inner.pid.name(), command);
        self.inner.state().last_poll = Some(Instant::now());
        connection.write(command.clone())?;

        // The response timeout runs from the write to the adapter, not from
        // queueing behind other commands
        watch
            .recv_after_send(&command, self.inner.config.response_timeout())
            .await
    }

    fn schedule(&self) {
        let mut state = self.inner.state();
        if !state.polling {
            return;
        }
        let delay = next_poll_delay(
            state.last_poll,
            state.last_response,
            self.inner.config.target_interval(),
        );
        debug!("Next poll for {} in {:?}", self.inner.pid.name(), delay);

        let poller = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Detached so stop_polling() cannot cancel a request mid-flight
            tokio::spawn(async move {
                let _ = poller.poll().await;
            });
        });
        if let Some(previous) = state.timer.replace(timer) {
            previous.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::mock::MockAdapter;
    use obd_protocol::pid::codes;
    use obd_protocol::{PidRegistry, PidValue, SessionConfig};
    use proptest::prelude::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    async fn session_with(adapter: MockAdapter) -> Session {
        let session = Session::new(SessionConfig::default());
        session.set_connector(adapter.connector());
        session
    }

    fn rpm_poller(session: Session, config: PollerConfig) -> Poller {
        let pid = *session.registry().get(codes::RPM).unwrap();
        Poller::with_config(session, pid, config)
    }

    async fn next_event(rx: &mut broadcast::Receiver<PollerEvent>) -> PollerEvent {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("no poller event")
            .unwrap()
    }

    #[test]
    fn test_first_poll_fires_immediately() {
        assert_eq!(next_poll_delay(None, None, ms(200)), Duration::ZERO);
    }

    #[test]
    fn test_delay_compensates_for_latency() {
        let t0 = Instant::now();
        assert_eq!(next_poll_delay(Some(t0), Some(t0 + ms(50)), ms(200)), ms(150));
        assert_eq!(next_poll_delay(Some(t0), Some(t0 + ms(200)), ms(200)), Duration::ZERO);
        assert_eq!(next_poll_delay(Some(t0), Some(t0 + ms(350)), ms(200)), Duration::ZERO);
    }

    #[test]
    fn test_delay_without_response_is_full_interval() {
        let t0 = Instant::now();
        assert_eq!(next_poll_delay(Some(t0), None, ms(200)), ms(200));
    }

    proptest! {
        #[test]
        fn prop_delay_matches_formula(latency in 0u64..5000, target in 1u64..5000) {
            let t0 = Instant::now();
            let delay = next_poll_delay(Some(t0), Some(t0 + ms(latency)), ms(target));
            if latency >= target {
                prop_assert_eq!(delay, Duration::ZERO);
            } else {
                prop_assert_eq!(delay, ms(target - latency));
            }
        }
    }

    #[tokio::test]
    async fn test_poll_decodes_response() {
        let adapter = MockAdapter::new(PidRegistry::standard()).respond("010C", "410C1B58\r\r>");
        let poller = rpm_poller(session_with(adapter).await, PollerConfig::default());
        let mut events = poller.subscribe();

        let signal = poller.poll().await.unwrap();
        assert_eq!(signal.pid.as_deref(), Some("0C"));
        assert_eq!(signal.value, Some(PidValue::Number(1750.0)));
        assert!(!poller.is_locked());
        assert_eq!(next_event(&mut events).await, PollerEvent::Data(signal));
    }

    #[tokio::test]
    async fn test_second_poll_while_in_flight_is_busy() {
        let adapter = MockAdapter::new(PidRegistry::standard()).silent("010C");
        let poller = rpm_poller(
            session_with(adapter).await,
            PollerConfig {
                response_timeout_ms: 200,
                ..PollerConfig::default()
            },
        );

        let first = {
            let poller = poller.clone();
            tokio::spawn(async move { poller.poll().await })
        };
        while !poller.is_locked() {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            poller.poll().await.unwrap_err(),
            ObdError::Busy("Engine RPM".to_string())
        );
        // The first request is unaffected and eventually times out
        assert_eq!(first.await.unwrap().unwrap_err(), ObdError::Timeout(200));
        assert!(!poller.is_locked());
    }

    #[tokio::test]
    async fn test_timeout_unlocks_and_reports() {
        let adapter = MockAdapter::new(PidRegistry::standard()).silent("010C");
        let poller = rpm_poller(
            session_with(adapter).await,
            PollerConfig {
                response_timeout_ms: 50,
                ..PollerConfig::default()
            },
        );
        let mut events = poller.subscribe();

        assert_eq!(poller.poll().await.unwrap_err(), ObdError::Timeout(50));
        assert!(!poller.is_locked());
        assert_eq!(
            next_event(&mut events).await,
            PollerEvent::Error(ObdError::Timeout(50))
        );
    }

    #[tokio::test]
    async fn test_poll_without_connector_fails() {
        let session = Session::new(SessionConfig::default());
        let poller = rpm_poller(session, PollerConfig::default());
        assert_eq!(poller.poll().await.unwrap_err(), ObdError::NotConfigured);
        assert!(!poller.is_locked());
    }

    #[tokio::test]
    async fn test_for_code_rejects_unknown_pid() {
        let session = Session::new(SessionConfig::default());
        let err = Poller::for_code(session, "FF", ms(100)).err().unwrap();
        assert_eq!(err, ObdError::UnknownPid("FF".to_string()));
    }

    #[tokio::test]
    async fn test_continuous_polling_and_stop() {
        let adapter = MockAdapter::new(PidRegistry::standard());
        let log = adapter.log();
        let session = session_with(adapter).await;
        let poller = Poller::for_code(session, codes::SPEED, ms(10)).unwrap();
        let mut events = poller.subscribe();

        poller.start_polling();
        poller.start_polling();
        assert!(poller.is_polling());
        for _ in 0..3 {
            match next_event(&mut events).await {
                PollerEvent::Data(signal) => assert_eq!(signal.pid.as_deref(), Some("0D")),
                other => panic!("unexpected event {:?}", other),
            }
        }

        poller.stop_polling();
        poller.stop_polling();
        assert!(!poller.is_polling());

        // At most the request already on the wire completes after stopping
        tokio::time::sleep(ms(100)).await;
        let sent = log.commands().iter().filter(|c| *c == "010D1").count();
        tokio::time::sleep(ms(100)).await;
        assert_eq!(log.commands().iter().filter(|c| *c == "010D1").count(), sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_adapter_polls_through_handshake() {
        let adapter = MockAdapter::new(PidRegistry::standard()).with_latency(ms(300));
        let log = adapter.log();
        let session = session_with(adapter).await;
        let poller = Poller::for_code(session, codes::SPEED, ms(200)).unwrap();
        let mut events = poller.subscribe();

        // The first request waits 2.1s behind the handshake before it is sent
        poller.start_polling();
        for _ in 0..3 {
            match next_event(&mut events).await {
                PollerEvent::Data(signal) => assert!(signal.matches_pid("0D")),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(poller.is_polling());
        poller.stop_polling();

        let commands = log.commands();
        assert_eq!(commands[6], "ATSP00");
        assert_eq!(commands[7], "010D1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_reply_keeps_schedule() {
        let adapter = MockAdapter::new(PidRegistry::standard()).silent("010D");
        let session = Session::new(SessionConfig {
            command_timeout_ms: 100,
            ..SessionConfig::default()
        });
        session.set_connector(adapter.connector());
        let speed = *session.registry().get(codes::SPEED).unwrap();
        let poller = Poller::with_config(
            session,
            speed,
            PollerConfig {
                target_interval_ms: 100,
                response_timeout_ms: 50,
                ..PollerConfig::default()
            },
        );
        let mut events = poller.subscribe();

        poller.start_polling();
        for _ in 0..2 {
            assert_eq!(
                next_event(&mut events).await,
                PollerEvent::Error(ObdError::Timeout(50))
            );
            assert!(poller.is_polling());
        }
        poller.stop_polling();
    }

    #[tokio::test]
    async fn test_lost_link_stops_polling() {
        let poller = rpm_poller(Session::new(SessionConfig::default()), PollerConfig::default());
        let mut events = poller.subscribe();

        poller.start_polling();
        assert_eq!(
            next_event(&mut events).await,
            PollerEvent::Error(ObdError::NotConfigured)
        );
        assert!(!poller.is_polling());
    }

    #[test]
    fn test_interval_beyond_u64_millis_saturates() {
        let session = Session::new(SessionConfig::default());
        let poller = Poller::for_code(session, codes::RPM, Duration::MAX).unwrap();
        assert_eq!(poller.config().target_interval_ms, u64::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cadence_holds_target_interval() {
        let adapter = MockAdapter::new(PidRegistry::standard()).with_latency(ms(30));
        let poller = rpm_poller(
            session_with(adapter).await,
            PollerConfig {
                target_interval_ms: 100,
                ..PollerConfig::default()
            },
        );
        let mut events = poller.subscribe();
        poller.start_polling();

        let mut arrivals = Vec::new();
        for _ in 0..4 {
            assert!(matches!(next_event(&mut events).await, PollerEvent::Data(_)));
            arrivals.push(Instant::now());
        }
        poller.stop_polling();

        // The first response waits behind the handshake; from then on each
        // request is sent one target interval after the previous one
        for pair in arrivals[1..].windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= ms(99) && gap <= ms(101), "gap was {:?}", gap);
        }
    }

    #[tokio::test]
    async fn test_pollers_share_one_gate() {
        let adapter = MockAdapter::new(PidRegistry::standard()).with_latency(ms(2));
        let session = session_with(adapter).await;
        let rpm = Poller::for_code(session.clone(), codes::RPM, ms(5)).unwrap();
        let speed = Poller::for_code(session.clone(), codes::SPEED, ms(5)).unwrap();
        let mut rpm_events = rpm.subscribe();
        let mut speed_events = speed.subscribe();

        rpm.start_polling();
        speed.start_polling();
        for _ in 0..3 {
            match next_event(&mut rpm_events).await {
                PollerEvent::Data(signal) => assert!(signal.matches_pid("0C")),
                other => panic!("unexpected event {:?}", other),
            }
            match next_event(&mut speed_events).await {
                PollerEvent::Data(signal) => assert!(signal.matches_pid("0D")),
                other => panic!("unexpected event {:?}", other),
            }
        }
        rpm.stop_polling();
        speed.stop_polling();
    }
}
