use tracing::{debug, trace, warn};

use super::*;
use crate::transport::{Connection, Readiness};

/// Result of one receive attempt that did not fail.
#[derive(Clone, Debug, PartialEq, Eq)]
#[must_use]
pub enum Received<T> {
    Ready(T),
    /// Nothing arrived within the response timeout; call receive again.
    NoAnswerYet,
}

impl<T> Received<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Received<U> {
        match self {
            Received::Ready(value) => Received::Ready(f(value)),
            Received::NoAnswerYet => Received::NoAnswerYet,
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Received::Ready(_) => Status::Ok,
            Received::NoAnswerYet => Status::NoAnswerYet,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EngineState {
    Disconnected,
    Connected,
    /// A request went out and its response has not been resolved yet.
    RequestSent,
}

#[derive(Debug)]
struct Pending {
    request: Request,
    transaction_id: u16,
}

/// Sends one request at a time over a single owned connection and resolves
/// its response with one bounded poll per receive call.
#[derive(Debug)]
pub struct ProtocolEngine {
    config: ClientConfig,
    connection: Option<Connection>,
    pending: Option<Pending>,
    last_transaction_id: u16,
}

impl ProtocolEngine {
    pub fn new(config: ClientConfig) -> Self {
        ProtocolEngine {
            config,
            connection: None,
            pending: None,
            last_transaction_id: 0,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        match (&self.connection, &self.pending) {
            (None, _) => EngineState::Disconnected,
            (Some(_), None) => EngineState::Connected,
            (Some(_), Some(_)) => EngineState::RequestSent,
        }
    }

    pub fn pending_function(&self) -> Option<FunctionCode> {
        self.pending.as_ref().map(|pending| pending.request.function())
    }

    /// Opens the connection, replacing any existing one.
    pub fn connect(&mut self) -> Result<(), TransportError> {
        if self.connection.is_some() {
            debug!("dropping existing connection before reconnecting");
            self.close();
        }
        let connection = Connection::connect(
            self.config.host(),
            self.config.port(),
            self.config.connect_timeout(),
        )?;
        self.connection = Some(connection);
        Ok(())
    }

    /// Checks the peer without consuming buffered bytes; a dead connection is
    /// closed.
    pub fn is_alive(&mut self) -> bool {
        let alive = self
            .connection
            .as_ref()
            .is_some_and(Connection::check_alive);
        if !alive && self.connection.is_some() {
            warn!("modbus server closed the connection");
            self.close();
        }
        alive
    }

    /// Releases the connection and forgets any pending request. Safe to call
    /// repeatedly.
    pub fn close(&mut self) {
        self.pending = None;
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
    }

    /// Validates, encodes and sends `request`. Invalid requests are rejected
    /// before any I/O; a transport failure closes the connection.
    pub fn send(&mut self, request: Request) -> Result<(), RequestError> {
        request.validate()?;
        if let Some(function) = self.pending_function() {
            return Err(RequestError::ResponsePending(function));
        }
        if self.connection.is_none() {
            return Err(TransportError::NotConnected.into());
        }

        let transaction_id = self.next_transaction_id();
        let frame = modbus_tcp::encode_request(transaction_id, self.config.unit_id(), &request)?;
        trace!(frame = %hex::encode(&frame), "sending request");

        let sent = match self.connection.as_mut() {
            Some(connection) => connection.send(&frame),
            None => Err(TransportError::NotConnected),
        };
        if let Err(e) = sent {
            warn!("failed to send {:?} request: {e}", request.function());
            self.close();
            return Err(e.into());
        }

        self.pending = Some(Pending {
            request,
            transaction_id,
        });
        Ok(())
    }

    /// One poll, then at most one read. `NoAnswerYet` leaves the request
    /// pending; any other outcome resolves it.
    pub fn receive(&mut self) -> Result<Received<Response>, ResponseError> {
        if self.pending.is_none() {
            return Err(ResponseError::NoRequestPending);
        }
        let timeout = self.config.response_timeout();
        let Some(connection) = self.connection.as_mut() else {
            return Err(self.fault(TransportError::NotConnected));
        };

        match connection.poll_readable(timeout) {
            Ok(Readiness::NotReady) => {
                trace!("no answer within {timeout:?}");
                return Ok(Received::NoAnswerYet);
            }
            Ok(Readiness::Ready) => {}
            Err(e) => return Err(self.fault(e)),
        }

        let frame = match connection.recv() {
            Ok(frame) => frame,
            Err(e) => return Err(self.fault(e)),
        };
        trace!(frame = %hex::encode(&frame), "received response");

        let Some(pending) = self.pending.take() else {
            return Err(ResponseError::NoRequestPending);
        };
        let expected_transaction_id = match self.config.transaction_ids() {
            TransactionIds::Fixed(_) => None,
            TransactionIds::Incrementing => Some(pending.transaction_id),
        };

        match modbus_tcp::decode_response(
            &frame,
            self.config.unit_id(),
            expected_transaction_id,
            &pending.request,
        ) {
            Ok(response) => Ok(Received::Ready(response)),
            Err(DecodeError::Exception { function, code }) => {
                warn!("server answered {function:#04x} with exception {code:?}");
                Err(ResponseError::Exception { function, code })
            }
            Err(DecodeError::Malformed(e)) => {
                warn!("malformed {:?} response: {e}", pending.request.function());
                Err(ResponseError::WrongDataReturned(e))
            }
        }
    }

    fn fault(&mut self, error: TransportError) -> ResponseError {
        warn!("communication failure, closing connection: {error}");
        self.close();
        ResponseError::Communication(error)
    }

    fn next_transaction_id(&mut self) -> u16 {
        match self.config.transaction_ids() {
            TransactionIds::Fixed(id) => id,
            TransactionIds::Incrementing => {
                self.last_transaction_id = self.last_transaction_id.wrapping_add(1);
                self.last_transaction_id
            }
        }
    }
}
