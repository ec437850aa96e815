use std::sync::Arc;
use std::time::Duration;
use anyhow::anyhow;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::{select, time};
use tracing::{debug, trace};
use crate::channel::{Channel, ChannelAction, ChannelState};
use crate::config::ChannelConfig;
use crate::error::{ChannelError, DisconnectReason};
use crate::stats::ChannelStats;
use crate::timer::{TimerKind, TimerToken};
use crate::transmit_window::SduId;
use crate::transport::Transport;
use crate::upper_layer::UpperLayer;

const EVENT_QUEUE_SIZE: usize = 1024;

/// Everything that can happen to a channel from the outside. Timer expiries are not in here:
///  they arrive through the driver's own queue.
#[derive(Debug)]
pub enum ChannelEvent {
    PduReceived(Bytes),
    SendSdu { sdu: Bytes, reply: oneshot::Sender<Result<SduId, ChannelError>> },
    SetLocalBusy(bool),
    /// the transport's write budget grew after it was exhausted
    TransmitReady,
    GetStats(oneshot::Sender<ChannelStats>),
    Disconnect,
}

/// The application's and the transport's way to talk to a running channel. Dropping all
///  handles disconnects the channel.
#[derive(Clone, Debug)]
pub struct ChannelHandle {
    events: mpsc::Sender<ChannelEvent>,
}

impl ChannelHandle {
    pub async fn send_sdu(&self, sdu: Bytes) -> anyhow::Result<SduId> {
        let (reply, result) = oneshot::channel();
        self.send_event(ChannelEvent::SendSdu { sdu, reply }).await?;
        let id = result.await
            .map_err(|_| anyhow!("channel terminated before accepting the SDU"))??;
        Ok(id)
    }

    pub async fn on_pdu_received(&self, pdu: Bytes) -> anyhow::Result<()> {
        self.send_event(ChannelEvent::PduReceived(pdu)).await
    }

    pub async fn set_local_busy(&self, busy: bool) -> anyhow::Result<()> {
        self.send_event(ChannelEvent::SetLocalBusy(busy)).await
    }

    /// Called by the transport when it can accept PDUs again after reporting a write budget
    ///  of zero
    pub async fn on_transport_ready(&self) -> anyhow::Result<()> {
        self.send_event(ChannelEvent::TransmitReady).await
    }

    pub async fn stats(&self) -> anyhow::Result<ChannelStats> {
        let (reply, result) = oneshot::channel();
        self.send_event(ChannelEvent::GetStats(reply)).await?;
        Ok(result.await?)
    }

    pub async fn disconnect(&self) -> anyhow::Result<()> {
        self.send_event(ChannelEvent::Disconnect).await
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    async fn send_event(&self, event: ChannelEvent) -> anyhow::Result<()> {
        self.events.send(event).await
            .map_err(|_| anyhow!("channel is closed"))
    }
}

/// Opens a channel with a negotiated configuration and runs it on its own task until it is
///  disconnected.
pub fn spawn_channel<T: Transport, U: UpperLayer>(config: ChannelConfig, transport: Arc<T>, upper_layer: Arc<U>) -> anyhow::Result<(ChannelHandle, JoinHandle<()>)> {
    let channel = Channel::new(config)?;

    let (send, recv) = mpsc::channel(EVENT_QUEUE_SIZE);
    let (timer_send, timer_recv) = mpsc::channel(4);

    let driver = ChannelDriver {
        channel,
        transport,
        upper_layer,
        timer_send,
        running_timer: None,
    };
    let join_handle = tokio::spawn(driver.run(recv, timer_recv));

    Ok((ChannelHandle { events: send }, join_handle))
}

struct ChannelDriver<T: Transport, U: UpperLayer> {
    channel: Channel,
    transport: Arc<T>,
    upper_layer: Arc<U>,
    timer_send: mpsc::Sender<(TimerKind, TimerToken)>,
    running_timer: Option<(TimerToken, JoinHandle<()>)>,
}

impl<T: Transport, U: UpperLayer> ChannelDriver<T, U> {
    async fn run(mut self, mut events: mpsc::Receiver<ChannelEvent>, mut timer_events: mpsc::Receiver<(TimerKind, TimerToken)>) {
        loop {
            select! {
                evt = events.recv() => {
                    match evt {
                        Some(evt) => self.on_event(evt),
                        None => {
                            debug!("all handles of channel {:#06x} were dropped", self.channel.config().local_cid);
                            self.channel.close(DisconnectReason::LocalRequest);
                        }
                    }
                }
                expired = timer_events.recv() => {
                    let (kind, token) = expired.expect("the driver holds a timer sender - this is a bug");
                    trace!("{:?} timer expired", kind);
                    self.channel.on_timer_expired(kind, token);
                }
            }

            if self.transmit().await {
                break;
            }
        }

        if let Some((_, handle)) = self.running_timer.take() {
            handle.abort();
        }
        debug!("channel driver for {:#06x} terminated", self.channel.config().local_cid);
    }

    fn on_event(&mut self, evt: ChannelEvent) {
        match evt {
            ChannelEvent::PduReceived(pdu) => self.channel.on_pdu_received(&pdu),
            ChannelEvent::SendSdu { sdu, reply } => {
                let result = self.channel.send_sdu(sdu);
                if reply.send(result).is_err() {
                    debug!("sender of SDU went away before the reply");
                }
            }
            ChannelEvent::SetLocalBusy(busy) => self.channel.set_local_busy(busy),
            ChannelEvent::TransmitReady => trace!("transport is ready"),
            ChannelEvent::GetStats(reply) => {
                let _ = reply.send(self.channel.stats().clone());
            }
            ChannelEvent::Disconnect => self.channel.close(DisconnectReason::LocalRequest),
        }
    }

    /// Sends as much as the transport accepts. The budget is queried again after each batch,
    ///  because the transport may have drained while the batch was handed to it. Returns
    ///  `true` once the channel is disconnected.
    async fn transmit(&mut self) -> bool {
        loop {
            let (budget, num_sent) = if self.channel.state() == ChannelState::Open {
                let budget = self.transport.write_budget();
                (budget, self.channel.poll_transmit(budget))
            }
            else {
                (0, 0)
            };

            if self.execute_actions().await {
                return true;
            }
            if num_sent == 0 || num_sent < budget {
                return false;
            }
        }
    }

    /// returns `true` once the channel is disconnected
    async fn execute_actions(&mut self) -> bool {
        let mut disconnected = false;
        while let Some(action) = self.channel.poll_action() {
            match action {
                ChannelAction::Transmit(pdu) => self.transport.transmit_pdu(pdu).await,
                ChannelAction::DeliverSdu(sdu) => self.upper_layer.deliver_sdu(sdu).await,
                ChannelAction::StartTimer { kind, after, token } => self.start_timer(kind, after, token),
                ChannelAction::CancelTimer { token } => self.cancel_timer(token),
                ChannelAction::SduSent(id) => self.upper_layer.on_sdu_sent(id).await,
                ChannelAction::Disconnected(reason) => {
                    self.transport.on_channel_closed(reason.clone()).await;
                    self.upper_layer.on_disconnected(reason).await;
                    disconnected = true;
                }
            }
        }
        disconnected
    }

    fn start_timer(&mut self, kind: TimerKind, after: Duration, token: TimerToken) {
        if let Some((_, handle)) = self.running_timer.take() {
            handle.abort();
        }

        trace!("starting {:?} timer for {:?}", kind, after);
        let timer_send = self.timer_send.clone();
        let handle = tokio::spawn(async move {
            time::sleep(after).await;
            // NB: the channel may be gone by now
            let _ = timer_send.send((kind, token)).await;
        });
        self.running_timer = Some((token, handle));
    }

    fn cancel_timer(&mut self, token: TimerToken) {
        match self.running_timer.take() {
            Some((running, handle)) if running == token => handle.abort(),
            other => self.running_timer = other,
        }
    }
}
