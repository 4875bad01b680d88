// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Ping-pong: an echo server and a latency-measuring client.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::network::{
    Address, AsSocket, ConnectionCallback, Message, MessageCallback, MessageClientSocket,
    ServerSocket, SocketHandle,
};
use crate::reactor::{EventLoop, TimerSource};
use crate::AppResult;

pub const PK_PING: u32 = 0xAF;

const COMPLETION_CHECK_INTERVAL: Duration = Duration::from_millis(5);

/// Per-connection tuning shared by both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub input_buffer_size: usize,
    pub max_data_length: usize,
    pub no_delay: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            input_buffer_size: crate::network::DEFAULT_INPUT_BUFFER_SIZE,
            max_data_length: crate::network::DEFAULT_MAX_DATA_LENGTH,
            no_delay: true,
        }
    }
}

impl ConnectionOptions {
    fn apply(&self, connection: MessageClientSocket) -> AppResult<MessageClientSocket> {
        if self.no_delay {
            connection.socket().socket().set_no_delay(true)?;
        }
        Ok(connection
            .with_input_buffer_size(self.input_buffer_size)
            .with_max_data_length(self.max_data_length))
    }
}

/// Sends every received message straight back, packet type and body unchanged.
pub fn echo_messages(_: &mut EventLoop, connection: &mut MessageClientSocket) -> AppResult<()> {
    while let Some(mut message) = connection.pop_message() {
        trace!(packet_type = message.packet_type(), "echo");
        connection.send_message(&mut message)?;
    }
    Ok(())
}

/// Accepted connections become echoing message connections on the same loop.
pub fn echo_connection_callback(options: ConnectionOptions) -> ConnectionCallback {
    Rc::new(
        move |event_loop: &mut EventLoop,
              _: &ServerSocket,
              handle: SocketHandle,
              address: Address| {
            let connection = options
                .apply(MessageClientSocket::from_handle(handle, address)?)?
                .on_message(Rc::new(echo_messages));
            event_loop.monitor(Box::new(connection))
        },
    )
}

/// Outcome of a ping run, summed over its connections.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PingReport {
    pub round_trips: u64,
    pub total_latency: Duration,
    pub failed_connections: usize,
}

impl PingReport {
    pub fn average_latency(&self) -> Option<Duration> {
        if self.round_trips == 0 {
            return None;
        }
        let nanos = self.total_latency.as_nanos() / u128::from(self.round_trips);
        Some(Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)))
    }

    pub fn merge(&mut self, other: &PingReport) {
        self.round_trips += other.round_trips;
        self.total_latency += other.total_latency;
        self.failed_connections += other.failed_connections;
    }
}

/// Lives as long as the connection's callbacks; a connection torn down
/// before its last round trip counts as failed.
struct PingSession {
    sent_at: Instant,
    remaining: u32,
    finished: bool,
    active: Rc<Cell<usize>>,
    report: Rc<RefCell<PingReport>>,
}

impl PingSession {
    fn send_ping(&mut self, connection: &mut MessageClientSocket) -> AppResult<()> {
        self.sent_at = Instant::now();
        connection.send_message(&mut Message::with_packet_type(PK_PING))
    }

    fn finish(
        &mut self,
        event_loop: &mut EventLoop,
        connection: &mut MessageClientSocket,
    ) -> AppResult<()> {
        self.finished = true;
        connection.close(event_loop)
    }
}

impl Drop for PingSession {
    fn drop(&mut self) {
        self.active.set(self.active.get().saturating_sub(1));
        if !self.finished {
            self.report.borrow_mut().failed_connections += 1;
        }
    }
}

fn ping_callbacks(session: Rc<RefCell<PingSession>>) -> (MessageCallback, MessageCallback) {
    let on_connected: MessageCallback = {
        let session = session.clone();
        Rc::new(
            move |event_loop: &mut EventLoop, connection: &mut MessageClientSocket| {
                let mut session = session.borrow_mut();
                if session.remaining == 0 {
                    return session.finish(event_loop, connection);
                }
                session.send_ping(connection)
            },
        )
    };
    let on_message: MessageCallback = Rc::new(
        move |event_loop: &mut EventLoop, connection: &mut MessageClientSocket| {
            let mut session = session.borrow_mut();
            while let Some(message) = connection.pop_message() {
                if message.packet_type() != PK_PING {
                    debug!(packet_type = message.packet_type(), "unexpected reply ignored");
                    continue;
                }
                let latency = session.sent_at.elapsed();
                {
                    let mut report = session.report.borrow_mut();
                    report.round_trips += 1;
                    report.total_latency += latency;
                }
                session.remaining = session.remaining.saturating_sub(1);
                if session.remaining == 0 {
                    return session.finish(event_loop, connection);
                }
                session.send_ping(connection)?;
            }
            Ok(())
        },
    );
    (on_connected, on_message)
}

/// Opens `connections` clients to `addresses` on a fresh loop, runs `ttl`
/// round trips on each and returns once every connection is done or gone.
pub fn run_ping_loop(
    addresses: &[Address],
    connections: usize,
    ttl: u32,
    options: ConnectionOptions,
) -> AppResult<PingReport> {
    let mut event_loop = EventLoop::new()?;
    let report = Rc::new(RefCell::new(PingReport::default()));
    let active = Rc::new(Cell::new(0usize));

    for _ in 0..connections {
        let connection = match MessageClientSocket::connect(addresses) {
            Ok(connection) => options.apply(connection)?,
            Err(err) => {
                debug!("ping connection failed: {}", err);
                report.borrow_mut().failed_connections += 1;
                continue;
            }
        };
        active.set(active.get() + 1);
        let session = Rc::new(RefCell::new(PingSession {
            sent_at: Instant::now(),
            remaining: ttl,
            finished: false,
            active: active.clone(),
            report: report.clone(),
        }));
        let (on_connected, on_message) = ping_callbacks(session);
        let connection = connection
            .on_connected(on_connected)
            .on_message(on_message);
        event_loop.monitor(Box::new(connection))?;
    }

    let remaining = active.clone();
    event_loop.schedule_timer(TimerSource::repeating(
        COMPLETION_CHECK_INTERVAL,
        move |event_loop| {
            if remaining.get() == 0 {
                event_loop.stop();
            }
            Ok(())
        },
    ));
    event_loop.run_forever()?;

    let report = *report.borrow();
    debug!(?report, "ping loop finished");
    Ok(report)
}
