use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use super::*;

pub const DEFAULT_PORT: u16 = 502;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Host is empty")]
    HostIsEmpty,

    #[error("{0} timeout must be greater than zero")]
    ZeroTimeout(&'static str),
}

pub struct ClientConfigBuilder {
    host: Option<String>,
    port: Option<u16>,
    unit_id: Option<u8>,
    connect_timeout: Option<Duration>,
    response_timeout: Option<Duration>,
    transaction_ids: Option<TransactionIds>,
}

impl ClientConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn unit_id(mut self, unit_id: u8) -> Self {
        self.unit_id = Some(unit_id);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    pub fn transaction_ids(mut self, transaction_ids: TransactionIds) -> Self {
        self.transaction_ids = Some(transaction_ids);
        self
    }

    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        let host = match self.host {
            Some(host) if !host.trim().is_empty() => host,
            _ => return Err(ConfigError::HostIsEmpty),
        };
        let connect_timeout = self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        if connect_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("Connect"));
        }
        let response_timeout = self.response_timeout.unwrap_or(DEFAULT_RESPONSE_TIMEOUT);
        if response_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("Response"));
        }

        Ok(ClientConfig {
            host,
            port: self.port.unwrap_or(DEFAULT_PORT),
            unit_id: self.unit_id.unwrap_or(DEFAULT_UNIT_ID),
            connect_timeout,
            response_timeout,
            transaction_ids: self.transaction_ids.unwrap_or_default(),
        })
    }
}

/// Where and how to talk to one Modbus TCP server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    host: String,
    port: u16,
    unit_id: u8,
    connect_timeout: Duration,
    response_timeout: Duration,
    transaction_ids: TransactionIds,
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder {
            host: None,
            port: None,
            unit_id: None,
            connect_timeout: None,
            response_timeout: None,
            transaction_ids: None,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    pub fn transaction_ids(&self) -> TransactionIds {
        self.transaction_ids
    }
}

/// Entry points for driving a Modbus TCP server: send one request, then call
/// the matching `receive_*` until it stops answering `NoAnswerYet`.
///
/// Any communication failure leaves the client disconnected; call
/// [`ModbusClient::connect`] again before the next request.
#[derive(Debug)]
pub struct ModbusClient {
    engine: ProtocolEngine,
}

impl ModbusClient {
    pub fn new(config: ClientConfig) -> Self {
        ModbusClient {
            engine: ProtocolEngine::new(config),
        }
    }

    pub fn connect(&mut self) -> Result<(), TransportError> {
        self.engine.connect()
    }

    pub fn is_alive(&mut self) -> bool {
        self.engine.is_alive()
    }

    pub fn state(&self) -> EngineState {
        self.engine.state()
    }

    pub fn config(&self) -> &ClientConfig {
        self.engine.config()
    }

    pub fn close(&mut self) {
        self.engine.close();
    }

    pub fn send(&mut self, request: Request) -> Result<(), RequestError> {
        let result = self.engine.send(request);
        if let Err(RequestError::Communication(e)) = &result {
            debug!("closing after send failure: {e}");
            self.engine.close();
        }
        result
    }

    /// Sends one of the four read requests.
    pub fn send_read(
        &mut self,
        function: FunctionCode,
        address: u16,
        quantity: u16,
    ) -> Result<(), RequestError> {
        let request = Request::read(function, address, quantity)?;
        self.send(request)
    }

    pub fn send_write_single_coil(
        &mut self,
        address: u16,
        value: CoilValue,
    ) -> Result<(), RequestError> {
        self.send(Request::write_single_coil(address, value))
    }

    pub fn send_write_single_register(
        &mut self,
        address: u16,
        value: u16,
    ) -> Result<(), RequestError> {
        self.send(Request::WriteSingleRegister { address, value })
    }

    pub fn send_write_multiple_coils(
        &mut self,
        address: u16,
        coils: &[bool],
    ) -> Result<(), RequestError> {
        self.send(Request::WriteMultipleCoils {
            address,
            coils: coils.to_vec(),
        })
    }

    pub fn send_write_multiple_registers(
        &mut self,
        address: u16,
        values: &[u16],
    ) -> Result<(), RequestError> {
        self.send(Request::WriteMultipleRegisters {
            address,
            values: values.to_vec(),
        })
    }

    /// Packed bits answering Read Coils or Read Discrete Inputs.
    pub fn receive_bits(&mut self) -> Result<Received<Vec<u8>>, ResponseError> {
        self.receive_as(FunctionCode::is_bit_read, |response| match response {
            Response::Bits(bytes) => Some(bytes),
            _ => None,
        })
    }

    /// Registers answering Read Holding Registers or Read Input Registers.
    pub fn receive_registers(&mut self) -> Result<Received<Vec<u16>>, ResponseError> {
        self.receive_as(FunctionCode::is_register_read, |response| match response {
            Response::Registers(registers) => Some(registers),
            _ => None,
        })
    }

    pub fn receive_write_single_coil(&mut self) -> Result<Received<WrittenCoil>, ResponseError> {
        self.receive_as(
            |function| function == FunctionCode::WriteSingleCoil,
            |response| match response {
                Response::SingleCoil(echo) => Some(echo),
                _ => None,
            },
        )
    }

    pub fn receive_write_single_register(
        &mut self,
    ) -> Result<Received<WrittenRegister>, ResponseError> {
        self.receive_as(
            |function| function == FunctionCode::WriteSingleRegister,
            |response| match response {
                Response::SingleRegister(echo) => Some(echo),
                _ => None,
            },
        )
    }

    /// Echo of Write Multiple Coils or Write Multiple Registers.
    pub fn receive_write_multiple(&mut self) -> Result<Received<WrittenRange>, ResponseError> {
        self.receive_as(FunctionCode::is_write_multiple, |response| match response {
            Response::Multiple(echo) => Some(echo),
            _ => None,
        })
    }

    fn receive_as<T>(
        &mut self,
        accepts: fn(FunctionCode) -> bool,
        extract: fn(Response) -> Option<T>,
    ) -> Result<Received<T>, ResponseError> {
        let pending = self
            .engine
            .pending_function()
            .ok_or(ResponseError::NoRequestPending)?;
        if !accepts(pending) {
            return Err(ResponseError::UnexpectedResponseKind { pending });
        }

        match self.engine.receive() {
            Ok(received) => match received.map(extract) {
                Received::Ready(Some(value)) => Ok(Received::Ready(value)),
                Received::Ready(None) => Err(ResponseError::UnexpectedResponseKind { pending }),
                Received::NoAnswerYet => Ok(Received::NoAnswerYet),
            },
            Err(ResponseError::Communication(e)) => {
                debug!("closing after receive failure: {e}");
                self.engine.close();
                Err(ResponseError::Communication(e))
            }
            Err(e) => Err(e),
        }
    }
}
