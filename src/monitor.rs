//! Connection lifecycle and the transport pump.
//!
//! [`BmsMonitor`] is the exclusive owner of the active link. It walks the
//! `Disconnected → Connecting → Configuring → Monitoring` state machine,
//! runs the adapter configuration sequence, and then hands the link to a
//! single pump task that routes every incoming frame: telemetry to the
//! aggregator, everything else to the command session matcher. Diagnostic
//! commands reach the pump over a channel and resolve through one-shot
//! replies, so cancellation on disconnect can never leave a listener or
//! timer behind.

use crate::aggregate::VoltageAggregator;
use crate::config::MonitorConfig;
use crate::error::{Error, Result};
use crate::frame::{Decoded, FrameParser};
use crate::session::{CommandSession, DiagnosticRequest};
use crate::state::{ConnectionState, MonitorEvent, PackSnapshot};
use crate::transport::{Adapter, Link};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

enum PumpRequest {
    Diagnostic {
        request: DiagnosticRequest,
        reply: oneshot::Sender<Result<String>>,
    },
}

struct ActiveLink {
    cmd_tx: mpsc::Sender<PumpRequest>,
    cancel: CancellationToken,
    pump: JoinHandle<()>,
}

/// Owns the connection to one BMS and publishes everything presentation
/// code needs: pack snapshots, the connection state, and fault strings.
pub struct BmsMonitor {
    config: MonitorConfig,
    aggregator: Arc<Mutex<VoltageAggregator>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    event_tx: broadcast::Sender<MonitorEvent>,
    active: Option<ActiveLink>,
}

impl BmsMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (event_tx, _) = broadcast::channel(32);
        Self {
            config,
            aggregator: Arc::new(Mutex::new(VoltageAggregator::new())),
            state_tx: Arc::new(state_tx),
            event_tx,
            active: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn snapshot(&self) -> PackSnapshot {
        self.aggregator.lock().unwrap().snapshot()
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<PackSnapshot> {
        self.aggregator.lock().unwrap().subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MonitorEvent> {
        self.event_tx.subscribe()
    }

    /// Connect to `target` through `adapter` and start monitoring.
    ///
    /// Any existing connection is torn down first. On a transport failure
    /// this returns [`Error::ConnectionFailed`]; a failure while the
    /// configuration sequence runs returns [`Error::SetupFailed`]. Both
    /// leave the monitor back in `Disconnected`.
    pub async fn connect(&mut self, adapter: &dyn Adapter, target: &str) -> Result<()> {
        self.disconnect().await;

        self.publish_state(ConnectionState::Connecting);
        info!(target, "connecting");

        let mut link = match adapter.connect(target).await {
            Ok(link) => link,
            Err(e) => {
                let err = Error::ConnectionFailed(e.to_string());
                self.fail_connect(&err);
                return Err(err);
            }
        };

        self.publish_state(ConnectionState::Configuring);
        if let Err(e) = self.run_configuration(link.as_mut()).await {
            link.close().await;
            let err = Error::SetupFailed(e.to_string());
            self.fail_connect(&err);
            return Err(err);
        }

        let parser = FrameParser::new(link.codec(), self.config.module_base);
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(pump_task(
            link,
            parser,
            self.config.line_terminator.clone().into_bytes(),
            cmd_rx,
            cancel.clone(),
            Arc::clone(&self.aggregator),
            Arc::clone(&self.state_tx),
            self.event_tx.clone(),
        ));
        self.active = Some(ActiveLink {
            cmd_tx,
            cancel,
            pump,
        });

        self.publish_state(ConnectionState::Monitoring);
        info!(target, "monitoring");
        Ok(())
    }

    /// Tear down the connection, releasing the link, any pending command
    /// and its timer, and the accumulated pack state. Safe to call at any
    /// time; a second call is a no-op.
    pub async fn disconnect(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.cancel.cancel();
        let _ = active.pump.await;
        self.aggregator.lock().unwrap().reset();
        self.publish_state(ConnectionState::Disconnected);
        info!("disconnected");
    }

    /// Issue the configured stored-fault clear exchange.
    ///
    /// Resolves with the raw positive response, or [`Error::DeviceRejected`]
    /// carrying the raw negative response, or [`Error::Timeout`] after the
    /// configured window. Retrying is an explicit re-invocation.
    pub async fn clear_faults(&self) -> Result<String> {
        let cf = &self.config.clear_fault;
        self.send_diagnostic(DiagnosticRequest {
            select_command: format!("ATSH{}", cf.target_header),
            payload: cf.payload.clone(),
            positive_pattern: cf.positive_response.clone(),
            negative_pattern: cf.negative_response.clone(),
            timeout: self.config.response_timeout(),
        })
        .await
    }

    /// Run an arbitrary diagnostic exchange: address-select, payload,
    /// then single-flight response correlation.
    pub async fn send_diagnostic(&self, request: DiagnosticRequest) -> Result<String> {
        let active = self.active.as_ref().ok_or(Error::NotConnected)?;
        if self.state() != ConnectionState::Monitoring {
            return Err(Error::NotConnected);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        active
            .cmd_tx
            .send(PumpRequest::Diagnostic {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::NotConnected)?;
        reply_rx.await.map_err(|_| Error::Cancelled)?
    }

    async fn run_configuration(&self, link: &mut dyn Link) -> Result<()> {
        let terminator = self.config.line_terminator.clone().into_bytes();
        for (i, command) in self.config.init_commands.iter().enumerate() {
            debug!(command, "sending configuration command");
            send_line(link, command, &terminator).await?;
            if i == 0 {
                // Let the adapter come back up after the reset.
                tokio::time::sleep(self.config.settle_delay()).await;
            }
        }
        Ok(())
    }

    fn fail_connect(&self, err: &Error) {
        warn!(error = %err, "connection attempt failed");
        let _ = self.event_tx.send(MonitorEvent::Fault(err.to_string()));
        self.publish_state(ConnectionState::Disconnected);
    }

    fn publish_state(&self, state: ConnectionState) {
        publish_state(&self.state_tx, &self.event_tx, state);
    }
}

impl Drop for BmsMonitor {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            active.cancel.cancel();
        }
    }
}

fn publish_state(
    state_tx: &watch::Sender<ConnectionState>,
    event_tx: &broadcast::Sender<MonitorEvent>,
    state: ConnectionState,
) {
    let changed = state_tx.send_if_modified(|current| {
        if *current != state {
            *current = state;
            true
        } else {
            false
        }
    });
    if changed {
        let _ = event_tx.send(MonitorEvent::StateChanged(state));
    }
}

async fn send_line(link: &mut dyn Link, text: &str, terminator: &[u8]) -> Result<()> {
    let mut bytes = Vec::with_capacity(text.len() + terminator.len());
    bytes.extend_from_slice(text.as_bytes());
    bytes.extend_from_slice(terminator);
    link.send(&bytes).await
}

#[derive(PartialEq)]
enum PumpExit {
    /// Cancelled from the monitor side; the monitor finishes the teardown.
    Requested,
    /// The link died underneath us.
    Lost,
}

async fn pump_task(
    mut link: Box<dyn Link>,
    parser: FrameParser,
    terminator: Vec<u8>,
    mut cmd_rx: mpsc::Receiver<PumpRequest>,
    cancel: CancellationToken,
    aggregator: Arc<Mutex<VoltageAggregator>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    event_tx: broadcast::Sender<MonitorEvent>,
) {
    let mut session = CommandSession::new();

    let exit = loop {
        let deadline = session.deadline();

        tokio::select! {
            biased;

            _ = cancel.cancelled() => break PumpExit::Requested,

            req = cmd_rx.recv() => match req {
                Some(PumpRequest::Diagnostic { request, reply }) => {
                    if session.is_busy() {
                        let _ = reply.send(Err(Error::Busy));
                        continue;
                    }
                    let sent = async {
                        send_line(link.as_mut(), &request.select_command, &terminator).await?;
                        send_line(link.as_mut(), &request.payload, &terminator).await
                    }
                    .await;
                    match sent {
                        Ok(()) => session.arm(&request, reply),
                        Err(e) => {
                            let _ = reply.send(Err(e));
                        }
                    }
                }
                // The monitor went away; nothing left to pump for.
                None => break PumpExit::Requested,
            },

            _ = tokio::time::sleep_until(
                deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(86400))
            ), if deadline.is_some() => {
                session.on_timeout();
            }

            frame = link.recv() => match frame {
                Some(Ok(bytes)) => match parser.decode(&bytes) {
                    Decoded::Telemetry(module) => {
                        aggregator.lock().unwrap().apply(module);
                    }
                    Decoded::Unrecognized(text) => {
                        session.on_frame(&text);
                    }
                    Decoded::Malformed => {}
                },
                Some(Err(e)) => {
                    warn!(error = %e, "link receive error");
                    break PumpExit::Lost;
                }
                None => break PumpExit::Lost,
            },
        }
    };

    // Every exit path releases the pending command and the link.
    session.cancel();
    link.close().await;

    if exit == PumpExit::Lost {
        warn!("link dropped while monitoring");
        aggregator.lock().unwrap().reset();
        publish_state(&state_tx, &event_tx, ConnectionState::Disconnected);
        let _ = event_tx.send(MonitorEvent::Fault(Error::UnexpectedDisconnect.to_string()));
    }
}
