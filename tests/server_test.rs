use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use rstest::{fixture, rstest};
use wirenet::network::{Address, Message, MessageClientSocket, SocketKind};
use wirenet::reactor::TimerSource;
use wirenet::service::{echo_connection_callback, run_ping_loop, ConnectionOptions, PK_PING};
use wirenet::{setup_local_tracing, AppResult, EventLoop, Server, ServerContainer};

#[fixture]
fn tracing() {
    setup_local_tracing().expect("failed to setup tracing");
}

fn start_echo_server(name: &str) -> AppResult<(ServerContainer, Address)> {
    ServerContainer::start(name, |event_loop| {
        let loopback =
            Address::from_socket_addr("127.0.0.1:0".parse().unwrap(), SocketKind::Stream);
        let server = Server::bind_to_addresses(
            event_loop,
            &[loopback],
            128,
            echo_connection_callback(ConnectionOptions::default()),
        )?;
        Ok(server.bound_addresses()[0].clone())
    })
}

/// Sends one message and returns the first reply as (packet type, body).
fn exchange(
    address: &Address,
    packet_type: u32,
    body: &[u8],
) -> AppResult<Option<(u32, Vec<u8>)>> {
    let reply = Rc::new(RefCell::new(None));
    let mut request = Message::with_packet_type(packet_type);
    request.insert(body);
    request.update_size()?;
    let request = request.to_buffers()?;

    let sink = reply.clone();
    let connection = MessageClientSocket::connect(std::slice::from_ref(address))?
        .on_connected(Rc::new(
            move |_: &mut EventLoop, connection: &mut MessageClientSocket| -> AppResult<()> {
                connection.send_encoded(request.clone())
            },
        ))
        .on_message(Rc::new(
            move |event_loop: &mut EventLoop, socket: &mut MessageClientSocket| -> AppResult<()> {
                if let Some(message) = socket.pop_message() {
                    *sink.borrow_mut() = Some((message.packet_type(), message.data().to_vec()));
                    event_loop.stop();
                }
                Ok(())
            },
        ));

    let mut event_loop = EventLoop::new()?;
    event_loop.monitor(Box::new(connection))?;
    // give up after a while instead of hanging the test run
    event_loop.schedule_timer(TimerSource::once(Duration::from_secs(5), |event_loop| {
        event_loop.stop();
        Ok(())
    }));
    event_loop.run_forever()?;

    let result = reply.borrow_mut().take();
    Ok(result)
}

#[rstest]
fn test_empty_ping_is_echoed(_tracing: ()) -> AppResult<()> {
    let (mut container, address) = start_echo_server("echo-empty")?;

    let reply = exchange(&address, PK_PING, b"")?;
    assert_eq!(reply, Some((0xAF, Vec::new())));

    container.stop()?;
    Ok(())
}

#[rstest]
fn test_large_body_is_echoed_verbatim(_tracing: ()) -> AppResult<()> {
    let (mut container, address) = start_echo_server("echo-large")?;

    // larger than the input ring buffer, so it arrives over several reads
    let body: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let reply = exchange(&address, 7, &body)?;
    assert_eq!(reply, Some((7, body)));

    container.stop()?;
    Ok(())
}

#[rstest]
fn test_ping_loop_reports_every_round_trip(_tracing: ()) -> AppResult<()> {
    let (mut container, address) = start_echo_server("echo-ping")?;

    let report = run_ping_loop(&[address], 4, 5, ConnectionOptions::default())?;
    assert_eq!(report.failed_connections, 0);
    assert_eq!(report.round_trips, 20);
    assert!(report.average_latency().is_some());

    container.stop()?;
    Ok(())
}

#[rstest]
fn test_ping_loop_counts_refused_connections(_tracing: ()) -> AppResult<()> {
    let (mut container, address) = start_echo_server("echo-refused")?;
    container.stop()?;
    drop(container);

    let report = run_ping_loop(&[address], 3, 2, ConnectionOptions::default())?;
    assert_eq!(report.round_trips, 0);
    assert_eq!(report.failed_connections, 3);
    assert_eq!(report.average_latency(), None);
    Ok(())
}
