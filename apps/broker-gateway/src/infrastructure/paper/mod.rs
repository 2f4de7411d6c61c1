//! Paper Broker
//!
//! An in-process simulated broker implementing [`BrokerTransport`]. The
//! binary runs against it; tests use its [`PaperBrokerControl`] to inject
//! failures (refused connects, dropped sessions, silent heartbeats, login
//! rejections, concurrent-session kicks) and to move the book behind the
//! gateway's back.

mod exchange;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

pub use exchange::{CommissionSchedule, FillMode};
use exchange::Exchange;

use crate::application::ports::{
    BrokerRequest, BrokerTransport, Credentials, InboundMessage, OutboundEnvelope, SessionInfo,
    TransportError,
};
use crate::domain::events::BrokerEvent;
use crate::domain::order::{OrderIntent, OrderStatus};
use crate::domain::{AccountId, InstrumentKey, LocalOrderId};

/// How the next login is answered.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoginBehavior {
    /// Accept.
    #[default]
    Accept,
    /// Reject the credentials.
    Reject(String),
    /// Report that another session holds the identity.
    ConcurrentSession,
}

#[derive(Debug)]
struct Inner {
    exchange: Exchange,
    session: Option<mpsc::UnboundedSender<InboundMessage>>,
    login: LoginBehavior,
    refuse_connects: u32,
    ack_heartbeats: bool,
    answer_requests: bool,
    connects: u32,
    logins: u32,
    sent: Vec<OutboundEnvelope>,
}

impl Inner {
    fn deliver(&self, messages: Vec<InboundMessage>) -> usize {
        let Some(session) = &self.session else {
            return 0;
        };
        let mut delivered = 0;
        for message in messages {
            if session.send(message).is_err() {
                break;
            }
            delivered += 1;
        }
        delivered
    }
}

/// The transport half, owned by the connection manager.
#[derive(Debug)]
pub struct PaperBroker {
    inner: Arc<Mutex<Inner>>,
    inbox: Option<mpsc::UnboundedReceiver<InboundMessage>>,
}

/// The control half, kept by whoever drives the simulation.
#[derive(Debug, Clone)]
pub struct PaperBrokerControl {
    inner: Arc<Mutex<Inner>>,
}

impl PaperBroker {
    /// A broker holding one account with `starting_cash`.
    #[must_use]
    pub fn new(account_id: AccountId, starting_cash: Decimal) -> (Self, PaperBrokerControl) {
        let inner = Arc::new(Mutex::new(Inner {
            exchange: Exchange::new(account_id, starting_cash),
            session: None,
            login: LoginBehavior::default(),
            refuse_connects: 0,
            ack_heartbeats: true,
            answer_requests: true,
            connects: 0,
            logins: 0,
            sent: Vec::new(),
        }));
        let control = PaperBrokerControl {
            inner: Arc::clone(&inner),
        };
        (Self { inner, inbox: None }, control)
    }
}

#[async_trait]
impl BrokerTransport for PaperBroker {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        inner.connects += 1;
        if inner.refuse_connects > 0 {
            inner.refuse_connects -= 1;
            return Err(TransportError::ConnectFailed(
                "paper broker refused connection".to_string(),
            ));
        }
        inner.exchange.drop_subscriptions();
        let (tx, rx) = mpsc::unbounded_channel();
        inner.session = Some(tx);
        self.inbox = Some(rx);
        Ok(())
    }

    async fn authenticate(
        &mut self,
        credentials: &Credentials,
    ) -> Result<SessionInfo, TransportError> {
        let mut inner = self.inner.lock();
        inner.logins += 1;
        match inner.login.clone() {
            LoginBehavior::Accept => Ok(SessionInfo {
                accounts: vec![inner.exchange.account_id().clone()],
                server_time: Utc::now(),
            }),
            LoginBehavior::Reject(reason) => Err(TransportError::AuthenticationRejected(format!(
                "{}: {reason}",
                credentials.username()
            ))),
            LoginBehavior::ConcurrentSession => Err(TransportError::ConcurrentSession(
                "client id already in use".to_string(),
            )),
        }
    }

    async fn send(&mut self, envelope: OutboundEnvelope) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if inner.session.is_none() {
            return Err(TransportError::Closed);
        }
        inner.sent.push(envelope.clone());

        let OutboundEnvelope {
            request_id,
            request,
        } = envelope;
        let heartbeat = matches!(request, BrokerRequest::Heartbeat);
        let mut messages = inner.exchange.handle(request_id, request);

        if heartbeat {
            messages.clear();
            if inner.ack_heartbeats {
                messages.push(InboundMessage::HeartbeatAck);
            }
        } else if !inner.answer_requests {
            messages.retain(|m| !matches!(m, InboundMessage::Response { .. }));
        }
        inner.deliver(messages);
        Ok(())
    }

    async fn recv(&mut self) -> Result<InboundMessage, TransportError> {
        match self.inbox.as_mut() {
            Some(inbox) => inbox.recv().await.ok_or(TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn close(&mut self) {
        self.inner.lock().session = None;
        self.inbox = None;
    }
}

impl PaperBrokerControl {
    /// Refuse the next `count` connection attempts.
    pub fn refuse_connects(&self, count: u32) {
        self.inner.lock().refuse_connects = count;
    }

    /// Answer future logins this way.
    pub fn set_login(&self, behavior: LoginBehavior) {
        self.inner.lock().login = behavior;
    }

    /// Stop or resume acknowledging heartbeats.
    pub fn ack_heartbeats(&self, ack: bool) {
        self.inner.lock().ack_heartbeats = ack;
    }

    /// Stop or resume answering correlated requests.
    pub fn answer_requests(&self, answer: bool) {
        self.inner.lock().answer_requests = answer;
    }

    /// Execution style for new orders.
    pub fn set_fill_mode(&self, mode: FillMode) {
        self.inner.lock().exchange.fill_mode = mode;
    }

    /// Price for fills and quotes.
    pub fn set_fill_price(&self, price: Decimal) {
        self.inner.lock().exchange.fill_price = price;
    }

    /// Charge commissions on future fills, reported as separate events.
    pub fn set_commission(&self, schedule: Option<CommissionSchedule>) {
        self.inner.lock().exchange.commission = schedule;
    }

    /// Fill `quantity` of a working order right after answering the next
    /// snapshot request, before anything else reaches the session.
    pub fn fill_after_snapshot(&self, local_order_id: &LocalOrderId, quantity: Decimal) {
        self.inner.lock().exchange.fill_after_snapshot =
            Some((local_order_id.clone(), quantity));
    }

    /// Drop the live session as if the network failed.
    pub fn drop_connection(&self) {
        self.inner.lock().session = None;
    }

    /// Terminate the live session with a protocol-level rejection.
    pub fn reject_session(&self, reason: &str, concurrent_session: bool) {
        self.inner
            .lock()
            .deliver(vec![InboundMessage::SessionRejected {
                reason: reason.to_string(),
                concurrent_session,
            }]);
    }

    /// Push a raw event on the live session. Returns whether it was sent.
    pub fn inject(&self, event: BrokerEvent) -> bool {
        self.inner.lock().deliver(vec![InboundMessage::Event(event)]) == 1
    }

    /// Fill part of a working order.
    pub fn fill(&self, local_order_id: &LocalOrderId, quantity: Decimal) {
        let mut inner = self.inner.lock();
        let messages = inner.exchange.fill(local_order_id, quantity);
        inner.deliver(messages);
    }

    /// Publish one quote per subscribed instrument. Returns how many.
    pub fn publish_quotes(&self) -> usize {
        let inner = self.inner.lock();
        let quotes = inner.exchange.quotes();
        inner.deliver(quotes)
    }

    /// Place an order as another client of the account would. Nothing
    /// reaches the gateway's session.
    pub fn place_silently(&self, intent: OrderIntent) {
        let _ = self
            .inner
            .lock()
            .exchange
            .handle(None, BrokerRequest::PlaceOrder(intent));
    }

    /// Overwrite a position without telling the gateway.
    pub fn set_position(&self, instrument: InstrumentKey, quantity: Decimal, avg_cost: Decimal) {
        self.inner
            .lock()
            .exchange
            .set_position(instrument, quantity, avg_cost);
    }

    /// Finish an order without telling the gateway.
    pub fn settle_silently(&self, local_order_id: &LocalOrderId, status: OrderStatus) -> bool {
        self.inner
            .lock()
            .exchange
            .settle_silently(local_order_id, status)
    }

    /// Lose an order entirely.
    pub fn forget_order(&self, local_order_id: &LocalOrderId) -> bool {
        self.inner.lock().exchange.forget(local_order_id)
    }

    /// Whether a session is live.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.lock().session.is_some()
    }

    /// Connection attempts so far.
    #[must_use]
    pub fn connects(&self) -> u32 {
        self.inner.lock().connects
    }

    /// Login attempts so far.
    #[must_use]
    pub fn logins(&self) -> u32 {
        self.inner.lock().logins
    }

    /// Instruments the broker streams.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<InstrumentKey> {
        self.inner.lock().exchange.subscriptions()
    }

    /// Every request written so far, heartbeats included.
    #[must_use]
    pub fn sent(&self) -> Vec<OutboundEnvelope> {
        self.inner.lock().sent.clone()
    }

    /// How many requests of `kind` were written.
    #[must_use]
    pub fn sent_count(&self, kind: &str) -> usize {
        self.inner
            .lock()
            .sent
            .iter()
            .filter(|e| e.request.kind() == kind)
            .count()
    }
}
