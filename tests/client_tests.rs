use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use modbus_tcp_client::{
    ClientConfig, CoilValue, ConfigError, EngineState, FunctionCode, ModbusClient, Received,
    Request, RequestError, ResponseError, Status, TransactionIds, TransportError, WrittenCoil,
    WrittenRange, WrittenRegister, DEFAULT_PORT, DEFAULT_UNIT_ID,
};
use tracing_test::traced_test;

/// Runs `script` against the first connection accepted on a loopback port.
fn spawn_peer<R, F>(script: F) -> (u16, JoinHandle<R>)
where
    R: Send + 'static,
    F: FnOnce(TcpStream) -> R + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        script(stream)
    });
    (port, handle)
}

fn read_request(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame).unwrap();
    frame
}

fn reply(stream: &mut TcpStream, transaction_id: u16, pdu: &[u8]) {
    let length = (pdu.len() + 1) as u16;
    let mut frame = transaction_id.to_be_bytes().to_vec();
    frame.extend_from_slice(&[0x00, 0x00]);
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(DEFAULT_UNIT_ID);
    frame.extend_from_slice(pdu);
    stream.write_all(&frame).unwrap();
}

fn connected_client(port: u16) -> ModbusClient {
    let config = ClientConfig::builder()
        .host("127.0.0.1")
        .port(port)
        .response_timeout(Duration::from_millis(200))
        .build()
        .unwrap();
    let mut client = ModbusClient::new(config);
    client.connect().unwrap();
    client
}

/// Caller-side retry policy: give the server ten polls to answer.
fn retry<T>(
    mut attempt: impl FnMut() -> Result<Received<T>, ResponseError>,
) -> Result<T, ResponseError> {
    for _ in 0..10 {
        if let Received::Ready(value) = attempt()? {
            return Ok(value);
        }
    }
    panic!("no answer after 10 attempts");
}

#[test]
fn test_config_defaults() {
    let config = ClientConfig::builder().host("localhost").build().unwrap();
    assert_eq!(config.port(), DEFAULT_PORT);
    assert_eq!(config.unit_id(), 0x01);
    assert_eq!(config.connect_timeout(), Duration::from_millis(500));
    assert_eq!(config.response_timeout(), Duration::from_millis(1000));
    assert_eq!(config.transaction_ids(), TransactionIds::Fixed(0x0102));
}

#[test]
fn test_config_validation() {
    assert_eq!(
        ClientConfig::builder().build().unwrap_err(),
        ConfigError::HostIsEmpty
    );
    assert_eq!(
        ClientConfig::builder()
            .host("localhost")
            .response_timeout(Duration::ZERO)
            .build()
            .unwrap_err(),
        ConfigError::ZeroTimeout("Response")
    );
}

#[test]
fn test_read_coils() {
    let (port, peer) = spawn_peer(|mut stream| {
        let request = read_request(&mut stream, 12);
        assert_eq!(
            request,
            vec![0x01, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x01, 0x00, 0x00, 0x00, 0x0A]
        );
        reply(&mut stream, 0x0102, &[0x01, 0x02, 0x0D, 0x03]);
    });

    let mut client = connected_client(port);
    assert!(client.is_alive());
    client.send_read(FunctionCode::ReadCoils, 0x0000, 10).unwrap();
    assert_eq!(client.state(), EngineState::RequestSent);

    let data = retry(|| client.receive_bits()).unwrap();
    assert_eq!(data, vec![0x0D, 0x03]);
    assert_eq!(client.state(), EngineState::Connected);

    client.close();
    peer.join().unwrap();
}

#[test]
fn test_read_registers_and_single_writes() {
    let (port, peer) = spawn_peer(|mut stream| {
        read_request(&mut stream, 12);
        reply(&mut stream, 0x0102, &[0x03, 0x04, 0x00, 0x2A, 0x01, 0x00]);

        let coil = read_request(&mut stream, 12);
        reply(&mut stream, 0x0102, &coil[7..]);

        let register = read_request(&mut stream, 12);
        reply(&mut stream, 0x0102, &register[7..]);
    });

    let mut client = connected_client(port);

    client
        .send_read(FunctionCode::ReadHoldingRegisters, 0, 2)
        .unwrap();
    assert_eq!(retry(|| client.receive_registers()).unwrap(), vec![42, 256]);

    client.send_write_single_coil(3, CoilValue::On).unwrap();
    assert_eq!(
        retry(|| client.receive_write_single_coil()).unwrap(),
        WrittenCoil {
            address: 3,
            value: CoilValue::On
        }
    );

    client.send_write_single_register(4, 0x1234).unwrap();
    assert_eq!(
        retry(|| client.receive_write_single_register()).unwrap(),
        WrittenRegister {
            address: 4,
            value: 0x1234
        }
    );

    peer.join().unwrap();
}

#[test]
fn test_write_multiple_coils() {
    let (port, peer) = spawn_peer(|mut stream| {
        let request = read_request(&mut stream, 15);
        assert_eq!(
            &request[4..],
            &[0x00, 0x09, 0x01, 0x0F, 0x00, 0x00, 0x00, 0x0A, 0x02, 0x0C, 0x03]
        );
        reply(&mut stream, 0x0102, &request[7..12]);
    });

    let mut client = connected_client(port);
    let mut coils = [false; 10];
    for i in [2, 3, 8, 9] {
        coils[i] = true;
    }
    client.send_write_multiple_coils(0, &coils).unwrap();
    assert_eq!(
        retry(|| client.receive_write_multiple()).unwrap(),
        WrittenRange {
            address: 0,
            quantity: 10
        }
    );

    peer.join().unwrap();
}

#[test]
fn test_no_answer_yet_is_repeatable() {
    let (release, released) = mpsc::channel::<()>();
    let (port, peer) = spawn_peer(move |mut stream| {
        read_request(&mut stream, 12);
        released.recv().unwrap();
        reply(&mut stream, 0x0102, &[0x04, 0x02, 0x00, 0x07]);
    });

    let config = ClientConfig::builder()
        .host("127.0.0.1")
        .port(port)
        .response_timeout(Duration::from_millis(20))
        .build()
        .unwrap();
    let mut client = ModbusClient::new(config);
    client.connect().unwrap();
    client
        .send_read(FunctionCode::ReadInputRegisters, 0, 1)
        .unwrap();

    for _ in 0..5 {
        let received = client.receive_registers().unwrap();
        assert_eq!(received, Received::NoAnswerYet);
        assert_eq!(received.status(), Status::NoAnswerYet);
        assert_eq!(client.state(), EngineState::RequestSent);
    }

    release.send(()).unwrap();
    assert_eq!(retry(|| client.receive_registers()).unwrap(), vec![7]);
    peer.join().unwrap();
}

#[test]
#[traced_test]
fn test_peer_close_is_a_communication_problem() {
    let (port, peer) = spawn_peer(|mut stream| {
        read_request(&mut stream, 12);
    });

    let mut client = connected_client(port);
    client.send_read(FunctionCode::ReadCoils, 0, 8).unwrap();
    peer.join().unwrap();

    let error = retry(|| client.receive_bits()).unwrap_err();
    assert!(matches!(
        error,
        ResponseError::Communication(TransportError::PeerClosed)
    ));
    assert_eq!(error.status(), Status::CommunicationProblem);
    assert!(error.is_fatal());
    assert_eq!(client.state(), EngineState::Disconnected);
    assert!(logs_contain("communication failure"));

    // already closed: later calls fail cleanly
    let error = client
        .send_read(FunctionCode::ReadCoils, 0, 8)
        .unwrap_err();
    assert_eq!(error.status(), Status::CommunicationProblem);
    assert!(matches!(client.receive_bits(), Err(ResponseError::NoRequestPending)));
    assert!(!client.is_alive());
    client.close();
    client.close();
}

#[test]
fn test_invalid_coil_value_sends_nothing() {
    let (port, peer) = spawn_peer(|mut stream| {
        let mut received = Vec::new();
        stream.read_to_end(&mut received).unwrap();
        received.len()
    });

    let mut client = connected_client(port);
    let error = client
        .send(Request::WriteSingleCoil {
            address: 1,
            value: 0x1234,
        })
        .unwrap_err();
    assert_eq!(error.status(), Status::WrongValue);
    assert_eq!(client.state(), EngineState::Connected);

    let error = client
        .send_read(FunctionCode::WriteSingleRegister, 0, 1)
        .unwrap_err();
    assert_eq!(error.status(), Status::InvalidFunction);

    client.close();
    assert_eq!(peer.join().unwrap(), 0);
}

#[test]
fn test_exception_keeps_connection() {
    let (port, peer) = spawn_peer(|mut stream| {
        read_request(&mut stream, 12);
        reply(&mut stream, 0x0102, &[0x81, 0x02]);

        read_request(&mut stream, 12);
        reply(&mut stream, 0x0102, &[0x81, 0x01]);

        read_request(&mut stream, 12);
        reply(&mut stream, 0x0102, &[0x01, 0x01, 0x05]);
    });

    let mut client = connected_client(port);

    client.send_read(FunctionCode::ReadCoils, 0xFF, 10).unwrap();
    let error = retry(|| client.receive_bits()).unwrap_err();
    assert_eq!(error.status(), Status::IllegalAddress);
    assert_eq!(client.state(), EngineState::Connected);

    client.send_read(FunctionCode::ReadCoils, 0, 3).unwrap();
    let error = retry(|| client.receive_bits()).unwrap_err();
    assert_eq!(error.status(), Status::IllegalFunction);

    client.send_read(FunctionCode::ReadCoils, 0, 3).unwrap();
    assert_eq!(retry(|| client.receive_bits()).unwrap(), vec![0x05]);

    peer.join().unwrap();
}

#[test]
fn test_corrupt_coil_echo_is_wrong_data() {
    let (port, peer) = spawn_peer(|mut stream| {
        read_request(&mut stream, 12);
        reply(&mut stream, 0x0102, &[0x05, 0x00, 0x01, 0x12, 0x34]);
    });

    let mut client = connected_client(port);
    client.send_write_single_coil(1, CoilValue::Off).unwrap();
    let error = retry(|| client.receive_write_single_coil()).unwrap_err();
    assert_eq!(error.status(), Status::WrongDataReturned);
    assert!(!error.is_fatal());
    assert_eq!(client.state(), EngineState::Connected);

    peer.join().unwrap();
}

#[test]
fn test_one_request_in_flight() {
    let (port, peer) = spawn_peer(|mut stream| {
        read_request(&mut stream, 12);
        reply(&mut stream, 0x0102, &[0x02, 0x01, 0x01]);
    });

    let mut client = connected_client(port);
    client
        .send_read(FunctionCode::ReadDiscreteInputs, 0, 1)
        .unwrap();

    let error = client
        .send_write_single_register(0, 1)
        .unwrap_err();
    assert!(matches!(
        error,
        RequestError::ResponsePending(FunctionCode::ReadDiscreteInputs)
    ));
    assert_eq!(error.status(), Status::GeneralError);

    // wrong receive variant is refused without touching the socket
    assert!(matches!(
        client.receive_registers(),
        Err(ResponseError::UnexpectedResponseKind {
            pending: FunctionCode::ReadDiscreteInputs
        })
    ));
    assert_eq!(retry(|| client.receive_bits()).unwrap(), vec![0x01]);

    peer.join().unwrap();
}

#[test]
fn test_incrementing_transaction_ids() {
    let (port, peer) = spawn_peer(|mut stream| {
        let first = read_request(&mut stream, 12);
        assert_eq!(&first[..2], &[0x00, 0x01]);
        reply(&mut stream, 0x0001, &first[7..]);

        let second = read_request(&mut stream, 12);
        assert_eq!(&second[..2], &[0x00, 0x02]);
        // stale id
        reply(&mut stream, 0x0001, &second[7..]);
    });

    let config = ClientConfig::builder()
        .host("127.0.0.1")
        .port(port)
        .response_timeout(Duration::from_millis(200))
        .transaction_ids(TransactionIds::Incrementing)
        .build()
        .unwrap();
    let mut client = ModbusClient::new(config);
    client.connect().unwrap();

    client.send_write_single_register(9, 99).unwrap();
    assert!(retry(|| client.receive_write_single_register()).is_ok());

    client.send_write_single_register(9, 100).unwrap();
    let error = retry(|| client.receive_write_single_register()).unwrap_err();
    assert_eq!(error.status(), Status::WrongDataReturned);

    peer.join().unwrap();
}

#[test]
fn test_closed_peer_detected_by_is_alive() {
    let (port, peer) = spawn_peer(|stream| drop(stream));

    let mut client = connected_client(port);
    peer.join().unwrap();

    let mut alive = true;
    for _ in 0..50 {
        alive = client.is_alive();
        if !alive {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    assert!(!alive);
    assert_eq!(client.state(), EngineState::Disconnected);
}

#[test]
fn test_connect_refused() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let config = ClientConfig::builder()
        .host("127.0.0.1")
        .port(port)
        .build()
        .unwrap();
    let mut client = ModbusClient::new(config);
    let error = client.connect().unwrap_err();
    assert!(matches!(error, TransportError::Connect { .. }));
    assert_eq!(error.status(), Status::CommunicationProblem);
    assert_eq!(client.state(), EngineState::Disconnected);
}

#[test]
fn test_send_without_connection() {
    let config = ClientConfig::builder().host("127.0.0.1").build().unwrap();
    let mut client = ModbusClient::new(config);
    let error = client
        .send_write_single_coil(0, CoilValue::On)
        .unwrap_err();
    assert!(matches!(
        error,
        RequestError::Communication(TransportError::NotConnected)
    ));
}
