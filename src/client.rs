//! The public client handle. This is the one type applications construct
//! and hold onto; everything else in this crate is reached through it
//! or through the collaborator traits it is configured with.
//!
//! A thin handle wrapping the one thing callers need: an mpsc command
//! channel to a background task that owns the connection and reacts to
//! unsolicited inbound traffic (PUBLISH, PINGRESP, server DISCONNECT)
//! while an application call may be in flight, which a synchronous
//! request/response dance cannot do.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::callbacks::{ConnectionObserver, NoopObserver, PublishHandler};
use crate::config::{ClientConfig, SessionExpiry};
use crate::connection::{run_reconnect_loop, Command};
use crate::delivery::{PublishRequest, SubscribeOutcome, SubscribeRequest};
use crate::error::{MqttError, ValidationError};
use crate::token::Token;
use crate::transport::{BrokerUrl, Dialer};

/// An empty client identifier with `clean_start=false` is rejected
/// locally unless the protocol is v5 and a nonzero session-expiry
/// interval is set (in which case the server assigns an identifier and
/// owns the session).
fn validate_pre_connect(config: &ClientConfig) -> Result<(), ValidationError> {
    if config.client_id.is_empty() && !config.clean_start {
        let server_will_assign_session =
            config.protocol_version.is_v5() && !matches!(config.session_expiry_interval, SessionExpiry::EndOnDisconnect);
        if !server_will_assign_session {
            return Err(ValidationError::EmptyClientIdRequiresCleanSession);
        }
    }
    Ok(())
}

/// Forwards every [`ConnectionObserver`] call through to the
/// application-supplied observer, and additionally resolves a one-shot
/// the first time the connection either comes up or fails — whichever
/// happens first — so [`MqttClient::connect`] can report the outcome of
/// its first handshake attempt synchronously, while the reconnect loop
/// underneath keeps running regardless of how that first attempt went.
struct FirstAttemptObserver {
    inner: Arc<dyn ConnectionObserver>,
    signal: Mutex<Option<oneshot::Sender<Result<(), MqttError>>>>,
    settled: AtomicBool,
}

impl FirstAttemptObserver {
    fn new(inner: Arc<dyn ConnectionObserver>, signal: oneshot::Sender<Result<(), MqttError>>) -> Self {
        Self {
            inner,
            signal: Mutex::new(Some(signal)),
            settled: AtomicBool::new(false),
        }
    }

    fn fire(&self, result: Result<(), MqttError>) {
        if self.settled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.signal.lock().unwrap().take() {
            let _ = tx.send(result);
        }
    }
}

#[async_trait]
impl ConnectionObserver for FirstAttemptObserver {
    async fn on_connect(&self, session_present: bool) {
        self.fire(Ok(()));
        self.inner.on_connect(session_present).await;
    }

    async fn on_connection_lost(&self, error: &MqttError) {
        self.fire(Err(error.clone()));
        self.inner.on_connection_lost(error).await;
    }

    async fn on_server_redirect(&self, server_reference: &str) {
        self.inner.on_server_redirect(server_reference).await;
    }
}

/// A live (or reconnecting) client session. Dropping this handle stops
/// the background reconnect loop and fails every completion handle
/// still in flight with [`MqttError::ClientDisconnected`], the same
/// sentinel [`MqttClient::disconnect`] produces deliberately.
pub struct MqttClient {
    commands: mpsc::Sender<Command>,
    task: Option<JoinHandle<()>>,
}

impl MqttClient {
    /// Connects with no lifecycle observer and no default publish
    /// handler — useful when every subscription registers its own
    /// handler through [`MqttClient::subscribe`] and nobody needs
    /// connect/disconnect notifications.
    pub async fn connect<D>(url: &str, config: ClientConfig, dialer: D) -> Result<Self, MqttError>
    where
        D: Dialer + 'static,
        D::Transport: 'static,
    {
        Self::connect_with(url, config, dialer, None, Arc::new(NoopObserver)).await
    }

    /// Connects with the full collaborator set. Blocks until the first CONNECT/CONNACK
    /// handshake attempt settles and surfaces that outcome; on success
    /// the background reconnect loop is left running, on failure it is
    /// torn down and this call returns the error that caused it.
    pub async fn connect_with<D>(
        url: &str,
        config: ClientConfig,
        dialer: D,
        handler: Option<Arc<dyn PublishHandler>>,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Result<Self, MqttError>
    where
        D: Dialer + 'static,
        D::Transport: 'static,
    {
        validate_pre_connect(&config)?;
        let broker_url = BrokerUrl::parse(url)?;

        let (commands_tx, commands_rx) = mpsc::channel(config.outbound_queue_capacity);
        let (first_attempt_tx, first_attempt_rx) = oneshot::channel();
        let wrapped_observer: Arc<dyn ConnectionObserver> = Arc::new(FirstAttemptObserver::new(observer, first_attempt_tx));

        let task = tokio::spawn(run_reconnect_loop(
            Arc::new(dialer),
            broker_url,
            config,
            handler,
            wrapped_observer,
            commands_rx,
        ));

        match first_attempt_rx.await {
            Ok(Ok(())) => Ok(Self { commands: commands_tx, task: Some(task) }),
            Ok(Err(err)) => {
                let _ = commands_tx.send(Command::Shutdown).await;
                let _ = task.await;
                Err(err)
            }
            Err(_) => {
                // The reconnect loop task ended (panicked or was dropped)
                // before ever settling the first attempt.
                let _ = task.await;
                Err(MqttError::ClientDisconnected)
            }
        }
    }

    /// The returned [`Token`] completes once the publish reaches its
    /// terminal state: accepted into the outbound queue for QoS 0,
    /// PUBACK for QoS 1, PUBCOMP for QoS 2.
    pub async fn publish(&self, request: PublishRequest) -> Result<Token<()>, MqttError> {
        let (respond, rx) = oneshot::channel();
        self.send(Command::Publish { request, respond }).await?;
        rx.await.map_err(|_| MqttError::ClientDisconnected)?
    }

    /// Subscriptions are registered locally (so a racing PUBLISH is
    /// still matched) before this call returns; the token completes on
    /// SUBACK.
    pub async fn subscribe(&self, requests: Vec<SubscribeRequest>) -> Result<Token<Vec<SubscribeOutcome>>, MqttError> {
        let (respond, rx) = oneshot::channel();
        self.send(Command::Subscribe { requests, respond }).await?;
        rx.await.map_err(|_| MqttError::ClientDisconnected)
    }

    /// Filters are removed from the local registry immediately; the
    /// token completes on UNSUBACK.
    pub async fn unsubscribe(&self, filters: Vec<String>) -> Result<Token<()>, MqttError> {
        let (respond, rx) = oneshot::channel();
        self.send(Command::Unsubscribe { filters, respond }).await?;
        rx.await.map_err(|_| MqttError::ClientDisconnected)
    }

    /// Initiates v5 re-authentication: sends AUTH with reason
    /// `ReAuthenticate` using the configured [`crate::callbacks::Authenticator`].
    /// Resolves once that packet has left the writer; the rest of the
    /// exchange (server AUTH challenges, and its final `Success`) plays
    /// out through ordinary inbound packet handling alongside normal
    /// publish/subscribe traffic.
    pub async fn reauthenticate(&self) -> Result<(), MqttError> {
        let (respond, rx) = oneshot::channel();
        self.send(Command::Reauthenticate { respond }).await?;
        rx.await.map_err(|_| MqttError::ClientDisconnected)?
    }

    /// Sends DISCONNECT, waits briefly for it to leave the writer, then tears the
    /// connection and the reconnect loop down for good. Bounded by a
    /// hard 5s ceiling so a wedged transport can't hang shutdown.
    pub async fn disconnect(mut self) -> Result<(), MqttError> {
        let (respond, rx) = oneshot::channel();
        let _ = self.commands.send(Command::Disconnect { respond }).await;
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), rx).await;
        if let Some(task) = self.task.take() {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), task).await;
        }
        Ok(())
    }

    /// An abrupt teardown: no DISCONNECT is sent, the reconnect loop is
    /// aborted immediately, and every completion handle still in flight
    /// fails with [`MqttError::ClientDisconnected`]. Distinct from
    /// [`MqttClient::disconnect`]'s graceful wire handshake — this is
    /// what the reconnect loop itself falls back to when a transport
    /// error, not a user request, ends the connection.
    pub fn shutdown(self) {
        // `Drop` performs exactly this teardown.
    }

    async fn send(&self, command: Command) -> Result<(), MqttError> {
        self.commands.send(command).await.map_err(|_| MqttError::ClientDisconnected)
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        let _ = self.commands.try_send(Command::Shutdown);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeepAlive;
    use crate::types::ProtocolVersion;

    #[test]
    fn empty_client_id_with_clean_start_false_is_rejected_on_v3() {
        let config = ClientConfig::new("")
            .protocol_version(ProtocolVersion::V4)
            .clean_start(false)
            .keep_alive(KeepAlive::Disabled);
        assert!(matches!(
            validate_pre_connect(&config),
            Err(ValidationError::EmptyClientIdRequiresCleanSession)
        ));
    }

    #[test]
    fn empty_client_id_is_exempt_on_v5_with_session_expiry() {
        let config = ClientConfig::new("")
            .protocol_version(ProtocolVersion::V5)
            .clean_start(false)
            .session_expiry_interval(SessionExpiry::Seconds(3600));
        assert!(validate_pre_connect(&config).is_ok());
    }

    #[test]
    fn empty_client_id_with_clean_start_true_is_fine() {
        let config = ClientConfig::new("").clean_start(true);
        assert!(validate_pre_connect(&config).is_ok());
    }

    #[tokio::test]
    async fn first_attempt_observer_fires_once_on_connect() {
        let (tx, rx) = oneshot::channel();
        let observer = FirstAttemptObserver::new(Arc::new(NoopObserver), tx);
        observer.on_connect(true).await;
        observer.on_connect(true).await;
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn first_attempt_observer_fires_once_on_connection_lost() {
        let (tx, rx) = oneshot::channel();
        let observer = FirstAttemptObserver::new(Arc::new(NoopObserver), tx);
        observer.on_connection_lost(&MqttError::ClientDisconnected).await;
        observer.on_connect(true).await;
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(MqttError::ClientDisconnected)));
    }
}
