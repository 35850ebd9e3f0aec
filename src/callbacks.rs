//! The external collaborators an application plugs in: v5 enhanced
//! authentication and the client-visible event callbacks. Transport
//! dialing lives in [`crate::transport`]; session persistence in
//! [`crate::store`].

use async_trait::async_trait;

use crate::error::MqttError;

/// Drives a v5 enhanced authentication exchange.
/// `initial` is called once to produce the CONNECT's Authentication
/// Data; `challenge` is called for each AUTH packet the server sends
/// back with `ContinueAuthentication`, until the handshake concludes.
#[async_trait]
pub trait Authenticator: Send + Sync {
    fn method(&self) -> &str;

    async fn initial_data(&self) -> Result<Vec<u8>, MqttError>;

    async fn challenge(&self, server_data: &[u8]) -> Result<Vec<u8>, MqttError>;

    /// Called once the server reports success: on the initial handshake
    /// after CONNACK, and again at the end of any later client-initiated
    /// re-authentication exchange. The default is a no-op; an
    /// authenticator that needs to know the exchange concluded (e.g. to
    /// rotate a nonce) overrides it.
    async fn complete(&self) -> Result<(), MqttError> {
        Ok(())
    }
}

/// Inbound PUBLISH dispatch, off the hot path. A handler that panics or
/// blocks only delays its own delivery — the reader/writer tasks
/// continue regardless, since dispatch happens on a spawned task rather
/// than inline.
#[async_trait]
pub trait PublishHandler: Send + Sync {
    async fn handle(&self, message: crate::delivery::IncomingMessage);
}

#[async_trait]
impl<F> PublishHandler for F
where
    F: Fn(crate::delivery::IncomingMessage) + Send + Sync,
{
    async fn handle(&self, message: crate::delivery::IncomingMessage) {
        (self)(message)
    }
}

/// Lifecycle notifications a client can subscribe to. All methods have
/// a no-op default so callers only implement what they care about.
#[async_trait]
pub trait ConnectionObserver: Send + Sync {
    async fn on_connect(&self, _session_present: bool) {}

    async fn on_connection_lost(&self, _error: &MqttError) {}

    /// v5 CONNACK/DISCONNECT `server_reference`: the engine never dials
    /// this address itself, only reports it.
    async fn on_server_redirect(&self, _server_reference: &str) {}
}

pub struct NoopObserver;

#[async_trait]
impl ConnectionObserver for NoopObserver {}
