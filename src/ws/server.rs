// src/ws/server.rs
//! WebSocket service: clients, command dispatch and push management
//!
//! One instance serves one plane (monitor or admin). Clients move through
//! `Handshaking` into `Open`; open clients get their inbound messages
//! dispatched against the command registry and their push subscriptions
//! ticked. Shutdown is two-phase: stop accepting, ask every client to
//! close, then tear down whoever ignored us for five seconds.

use crate::network::poll::ReadinessSet;
use crate::utils::error::MinerError;
use crate::ws::WsError;
use crate::ws::commands::{CommandContext, CommandRegistry, Pusher};
use crate::ws::connection::WsConnection;
use crate::ws::frame::{CloseReason, Role, SocketStatus};
use crate::ws::handshake::HandShaker;
use serde_json::{Value, json};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

/// Browser clients served at most, per plane
pub const MAX_CLIENTS: usize = 5;

/// How long closing clients get to confirm before the transport dies
const CLOSE_GRACE: Duration = Duration::from_secs(5);

enum ClientState {
    Handshaking(HandShaker),
    Open(WsConnection),
}

/// One active push subscription of one client
struct ActivePush {
    command: String,
    /// Present only for multi-stream commands
    stream_id: Option<String>,
    pusher: Box<dyn Pusher>,
}

struct ClientSlot {
    sock: TcpStream,
    state: ClientState,
    pushes: Vec<ActivePush>,
}

/// One WebSocket server plane
pub struct WsServer {
    name: &'static str,
    port: u16,
    resource: String,
    protocol: String,
    listener: Option<TcpListener>,
    clients: Vec<ClientSlot>,
    registry: CommandRegistry,
    /// Monotonically increasing stream-id source, never reused while up
    numbered_pushers: u64,
    shutdown_started: Option<Instant>,
}

impl WsServer {
    /// # Arguments
    /// * `name` - Short plane name for the logs ("monitor" / "admin")
    /// * `port` - Local TCP port to serve
    /// * `resource` - Upgrade request path suffix
    /// * `protocol` - Required WebSocket sub-protocol
    /// * `registry` - Commands this plane dispatches
    pub fn new(
        name: &'static str,
        port: u16,
        resource: &str,
        protocol: &str,
        registry: CommandRegistry,
    ) -> Self {
        WsServer {
            name,
            port,
            resource: resource.to_string(),
            protocol: protocol.to_string(),
            listener: None,
            clients: Vec::new(),
            registry,
            numbered_pushers: 0,
            shutdown_started: None,
        }
    }

    /// Opens the listening socket; local-only by convention
    pub fn listen(&mut self) -> Result<(), MinerError> {
        if self.listener.is_some() {
            return Ok(());
        }
        let listener = TcpListener::bind(("127.0.0.1", self.port))?;
        listener.set_nonblocking(true)?;
        log::info!(
            "web {} serving on {}",
            self.name,
            listener.local_addr()?
        );
        self.listener = Some(listener);
        self.shutdown_started = None;
        Ok(())
    }

    /// The port actually bound, once listening
    pub fn local_port(&self) -> Option<u16> {
        self.listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
            .map(|addr| addr.port())
    }

    /// Starts the two-phase shutdown
    pub fn begin_close(&mut self) {
        if self.shutdown_started.is_none() {
            self.shutdown_started = Some(Instant::now());
        }
    }

    pub fn is_closing(&self) -> bool {
        self.shutdown_started.is_some()
    }

    /// Listener gone, every client drained
    pub fn fully_closed(&self) -> bool {
        self.listener.is_none()
    }

    pub fn num_clients(&self) -> usize {
        self.clients.len()
    }

    /// Registers the listener and every client for the readiness wait
    pub fn fill_readiness(&self, read: &mut ReadinessSet, write: &mut ReadinessSet) {
        let listener = match &self.listener {
            Some(listener) => listener,
            None => return,
        };
        if self.shutdown_started.is_none() {
            read.push(listener.as_raw_fd());
        }
        for client in &self.clients {
            let fd = client.sock.as_raw_fd();
            let wants_write = match &client.state {
                ClientState::Handshaking(shaker) => shaker.needs_to_send(),
                ClientState::Open(conn) => conn.needs_to_send(),
            };
            if wants_write {
                write.push(fd);
            } else {
                read.push(fd);
            }
        }
    }

    /// Advances every signalled client and the listener
    pub fn refresh(
        &mut self,
        read: &ReadinessSet,
        write: &ReadinessSet,
        ctx: &mut CommandContext,
    ) {
        if self.listener.is_none() {
            return;
        }
        self.purge_closed();
        if self.shutdown_started.is_none() {
            self.read_write(read, write, ctx, true);
            self.upgrade_clients();
            self.accept_new(read);
            self.enqueue_push_data(ctx);
            return;
        }

        // Closing: pushes die first, then everyone gets a close frame.
        for client in &mut self.clients {
            client.pushes.clear();
        }
        self.clients.retain_mut(|client| match &mut client.state {
            ClientState::Handshaking(_) => false,
            ClientState::Open(conn) => match conn.status() {
                SocketStatus::Operational => {
                    conn.enqueue_close(CloseReason::Away);
                    true
                }
                SocketStatus::Closed => false,
                _ => true,
            },
        });
        self.read_write(read, write, ctx, false);
        let patience_over = self
            .shutdown_started
            .is_some_and(|started| started.elapsed() > CLOSE_GRACE);
        if patience_over {
            // We played nice; whoever is left loses their TCP connection.
            self.clients.clear();
        }
        if self.clients.is_empty() {
            self.listener = None;
            self.numbered_pushers = 0;
            log::info!("web {} shut down", self.name);
        }
    }

    fn purge_closed(&mut self) {
        let before = self.clients.len();
        self.clients.retain(|client| match &client.state {
            ClientState::Open(conn) => conn.status() != SocketStatus::Closed,
            ClientState::Handshaking(_) => true,
        });
        for _ in self.clients.len()..before {
            log::info!("--WS: a {} client has just been destroyed", self.name);
        }
    }

    fn read_write(
        &mut self,
        read: &ReadinessSet,
        write: &ReadinessSet,
        ctx: &mut CommandContext,
        dispatch: bool,
    ) {
        let Self {
            clients,
            registry,
            numbered_pushers,
            name,
            ..
        } = self;
        let mut garbage = Vec::new();
        for (index, client) in clients.iter_mut().enumerate() {
            let fd = client.sock.as_raw_fd();
            let readable = read.is_ready(fd);
            let writable = write.is_ready(fd);
            if !readable && !writable {
                continue;
            }
            let served = serve_client(
                client,
                readable,
                writable,
                dispatch,
                registry,
                numbered_pushers,
                ctx,
            );
            if let Err(e) = served {
                log::info!("dropping a {} client: {}", name, e);
                garbage.push(index);
            }
        }
        for index in garbage.into_iter().rev() {
            clients.remove(index);
        }
    }

    fn upgrade_clients(&mut self) {
        for client in &mut self.clients {
            if let ClientState::Handshaking(shaker) = &mut client.state {
                if shaker.upgraded() {
                    let excess = shaker.take_excess();
                    client.state =
                        ClientState::Open(WsConnection::with_buffered(Role::Server, &excess));
                }
            }
        }
    }

    fn accept_new(&mut self, read: &ReadinessSet) {
        let accepted = match &self.listener {
            Some(listener) if read.is_ready(listener.as_raw_fd()) => listener.accept(),
            _ => return,
        };
        match accepted {
            Ok((sock, peer)) => {
                if self.clients.len() >= MAX_CLIENTS || self.shutdown_started.is_some() {
                    drop(sock);
                    return;
                }
                if sock.set_nonblocking(true).is_err() {
                    return;
                }
                self.clients.push(ClientSlot {
                    sock,
                    state: ClientState::Handshaking(HandShaker::new(
                        &self.resource,
                        &self.protocol,
                    )),
                    pushes: Vec::new(),
                });
                log::info!("--WS: new {} client from {}", self.name, peer);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => log::warn!("accept on {} failed: {}", self.name, e),
        }
    }

    fn enqueue_push_data(&mut self, ctx: &mut CommandContext) {
        for client in &mut self.clients {
            let conn = match &mut client.state {
                ClientState::Open(conn) => conn,
                ClientState::Handshaking(_) => continue,
            };
            for push in &mut client.pushes {
                let payload = match push.pusher.refresh(ctx) {
                    Some(payload) => payload,
                    None => continue,
                };
                let mut wrapped = serde_json::Map::new();
                wrapped.insert("pushing".into(), json!(push.command));
                if let Some(id) = &push.stream_id {
                    wrapped.insert("stream".into(), json!(id));
                }
                wrapped.insert("payload".into(), payload);
                let _ = conn.enqueue_text(&Value::Object(wrapped).to_string());
            }
        }
    }
}

/// Runs one tick of I/O for a single client
///
/// Inbound messages are dispatched only while the server is not closing;
/// during shutdown the reads merely drive the close handshake forward.
fn serve_client(
    client: &mut ClientSlot,
    readable: bool,
    writable: bool,
    dispatch: bool,
    registry: &CommandRegistry,
    numbered_pushers: &mut u64,
    ctx: &mut CommandContext,
) -> Result<(), WsError> {
    match &mut client.state {
        ClientState::Open(conn) => {
            if readable {
                for raw in conn.read(&mut client.sock)? {
                    if !dispatch {
                        continue;
                    }
                    let reply =
                        dispatch_message(&raw, registry, &mut client.pushes, numbered_pushers, ctx)?;
                    conn.enqueue_text(&reply)?;
                }
            }
            if writable && conn.needs_to_send() {
                conn.send(&mut client.sock)?;
            }
        }
        ClientState::Handshaking(shaker) => {
            if readable {
                shaker.receive(&mut client.sock)?;
            }
            if writable {
                shaker.send(&mut client.sock)?;
            }
        }
    }
    Ok(())
}

/// Matches one inbound message to its handler and produces the reply text
///
/// Command-level problems come back as `!!ERROR: …!!` strings on the same
/// reply slot; only unparseable JSON fails the connection.
fn dispatch_message(
    raw: &[u8],
    registry: &CommandRegistry,
    pushes: &mut Vec<ActivePush>,
    numbered_pushers: &mut u64,
    ctx: &mut CommandContext,
) -> Result<String, WsError> {
    let object: Value = serde_json::from_slice(raw).map_err(|_| WsError::BadJson)?;
    let name = match object.get("command").and_then(Value::as_str) {
        Some(name) => name.to_string(),
        None => return Ok("!!ERROR: Not a command object.".into()),
    };

    if name == "unsubscribe" {
        return Ok(match unsubscribe(&object, pushes) {
            Ok(reply) => reply,
            Err(what) => format!("!!ERROR: {}!!", what),
        });
    }

    let command = match registry.find(&name) {
        Some(command) => command,
        None => return Ok(format!("!!ERROR: no such command \"{}\"", name)),
    };
    let (reply, pusher) = match command.call(&object, ctx) {
        Ok(produced) => produced,
        Err(what) => return Ok(format!("!!ERROR: {}!!", what)),
    };

    let push_requested = match object.get("push") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(_) => return Ok("!!ERROR: .push subfield must be a boolean.!!".into()),
    };
    if push_requested {
        let pusher = match pusher {
            Some(pusher) => pusher,
            None => return Ok("!!ERROR: push requested but command produced no pusher!!".into()),
        };
        let active = pushes.iter().filter(|push| push.command == name).count();
        if active >= command.max_pushing() {
            return Ok("!!ERROR: max amount of pushers reached!!".into());
        }
        let stream_id = if command.max_pushing() > 1 {
            let id = numbered_pushers.to_string();
            *numbered_pushers += 1;
            Some(id)
        } else {
            None
        };
        pushes.push(ActivePush {
            command: name,
            stream_id,
            pusher,
        });
    }
    serde_json::to_string(&reply).map_err(|_| WsError::BadJson)
}

/// The built-in `unsubscribe`, scoped to the client being processed
fn unsubscribe(object: &Value, pushes: &mut Vec<ActivePush>) -> Result<String, String> {
    let params = object
        .get("params")
        .and_then(Value::as_object)
        .ok_or_else(|| "\"unsubscribe\", .parameters must be object.".to_string())?;
    let originator = params
        .get("originator")
        .and_then(Value::as_str)
        .ok_or_else(|| "\"unsubscribe\", .parameters.originator missing or not a string.".to_string())?;
    let stream = match params.get("stream") {
        None => None,
        Some(Value::String(stream)) => Some(stream.clone()),
        Some(_) => {
            return Err(
                "\"unsubscribe\", .parameters.stream must be convertible to a string if specified."
                    .to_string(),
            );
        }
    };
    // Removing something non-existing is silently a NOP.
    pushes.retain(|push| {
        if push.command != originator {
            return true;
        }
        match &stream {
            None => false,
            Some(id) => push.stream_id.as_ref() != Some(id),
        }
    });
    Ok("true".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigTracker;
    use crate::miner::{Miner, MinerSettings, NonceBatch, WorkAssignment};
    use crate::network::poll::{self, ReadinessSet};
    use crate::network::pool::PoolSet;
    use crate::stats::Tracking;
    use crate::types::AlgorithmKind;
    use crate::ws::commands::{self, ExtensionRegistry, RuntimeFlags};
    use std::io::{Read, Write};
    use std::time::Duration;

    struct StubMiner;

    impl Miner for StubMiner {
        fn algo(&self) -> AlgorithmKind {
            AlgorithmKind::Sha256d
        }
        fn implementation(&self) -> (&'static str, &'static str) {
            ("cpu-rayon", "1")
        }
        fn device_count(&self) -> usize {
            2
        }
        fn settings(&self) -> MinerSettings {
            MinerSettings {
                worker_threads: 2,
                batch_size: 1000,
            }
        }
        fn dispatch(&self, _work: WorkAssignment) {}
        fn halt(&self) {}
        fn collect(&self) -> Vec<NonceBatch> {
            Vec::new()
        }
        fn failure(&self) -> Option<String> {
            None
        }
        fn shutdown(&mut self) {}
    }

    struct Fixture {
        pools: PoolSet,
        miner: StubMiner,
        tracking: Tracking,
        config: ConfigTracker,
        extensions: ExtensionRegistry,
        runtime: RuntimeFlags,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                pools: PoolSet::new(Vec::new(), Duration::from_secs(30)),
                miner: StubMiner,
                tracking: Tracking::new(2, 0),
                config: ConfigTracker::default(),
                extensions: ExtensionRegistry::new(),
                runtime: RuntimeFlags::default(),
            }
        }

        fn ctx(&mut self) -> CommandContext<'_> {
            CommandContext {
                pools: &self.pools,
                miner: &self.miner,
                tracking: &self.tracking,
                config: &self.config,
                extensions: &mut self.extensions,
                runtime: &mut self.runtime,
            }
        }
    }

    fn dispatch(
        fixture: &mut Fixture,
        pushes: &mut Vec<ActivePush>,
        numbered: &mut u64,
        text: &str,
    ) -> String {
        let registry = commands::monitor_registry();
        let mut ctx = fixture.ctx();
        dispatch_message(text.as_bytes(), &registry, pushes, numbered, &mut ctx).unwrap()
    }

    #[test]
    fn messages_without_a_command_string_get_the_canned_error() {
        let mut fixture = Fixture::new();
        let mut pushes = Vec::new();
        let mut numbered = 0;
        for bad in [r#"{}"#, r#"{"command": 42}"#, r#"[1,2,3]"#] {
            let reply = dispatch(&mut fixture, &mut pushes, &mut numbered, bad);
            assert_eq!(reply, "!!ERROR: Not a command object.");
        }
    }

    #[test]
    fn unknown_commands_name_the_culprit() {
        let mut fixture = Fixture::new();
        let reply = dispatch(
            &mut fixture,
            &mut Vec::new(),
            &mut 0,
            r#"{"command":"bogus"}"#,
        );
        assert_eq!(reply, "!!ERROR: no such command \"bogus\"");
    }

    #[test]
    fn unparseable_json_fails_the_connection() {
        let mut fixture = Fixture::new();
        let registry = commands::monitor_registry();
        let mut ctx = fixture.ctx();
        let got = dispatch_message(b"{nope", &registry, &mut Vec::new(), &mut 0, &mut ctx);
        assert!(matches!(got, Err(WsError::BadJson)));
    }

    #[test]
    fn version_replies_with_a_serialized_object() {
        let mut fixture = Fixture::new();
        let reply = dispatch(
            &mut fixture,
            &mut Vec::new(),
            &mut 0,
            r#"{"command":"version"}"#,
        );
        let parsed: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(parsed["protocol"], 4);
    }

    #[test]
    fn singleton_push_commands_cap_at_one_subscription() {
        let mut fixture = Fixture::new();
        let mut pushes = Vec::new();
        let mut numbered = 0;
        let request = r#"{"command":"scanTime","push":true}"#;
        let first = dispatch(&mut fixture, &mut pushes, &mut numbered, request);
        assert!(first.starts_with('{'));
        assert_eq!(pushes.len(), 1);
        assert!(pushes[0].stream_id.is_none());

        let second = dispatch(&mut fixture, &mut pushes, &mut numbered, request);
        assert_eq!(second, "!!ERROR: max amount of pushers reached!!");
        assert_eq!(pushes.len(), 1);
    }

    #[test]
    fn push_without_a_pusher_is_reported() {
        let mut fixture = Fixture::new();
        let reply = dispatch(
            &mut fixture,
            &mut Vec::new(),
            &mut 0,
            r#"{"command":"uptime","push":true}"#,
        );
        assert_eq!(
            reply,
            "!!ERROR: push requested but command produced no pusher!!"
        );
    }

    #[test]
    fn non_boolean_push_is_reported() {
        let mut fixture = Fixture::new();
        let reply = dispatch(
            &mut fixture,
            &mut Vec::new(),
            &mut 0,
            r#"{"command":"uptime","push":"yes"}"#,
        );
        assert_eq!(reply, "!!ERROR: .push subfield must be a boolean.!!");
    }

    #[test]
    fn unsubscribe_is_idempotent_and_replies_true() {
        let mut fixture = Fixture::new();
        let mut pushes = Vec::new();
        let mut numbered = 0;
        dispatch(
            &mut fixture,
            &mut pushes,
            &mut numbered,
            r#"{"command":"scanTime","push":true}"#,
        );
        assert_eq!(pushes.len(), 1);
        let request = r#"{"command":"unsubscribe","params":{"originator":"scanTime"}}"#;
        let first = dispatch(&mut fixture, &mut pushes, &mut numbered, request);
        assert_eq!(first, "true");
        assert!(pushes.is_empty());
        let second = dispatch(&mut fixture, &mut pushes, &mut numbered, request);
        assert_eq!(second, "true");
    }

    #[test]
    fn pushers_suppress_unchanged_payloads() {
        let mut fixture = Fixture::new();
        let mut pushes = Vec::new();
        let mut numbered = 0;
        dispatch(
            &mut fixture,
            &mut pushes,
            &mut numbered,
            r#"{"command":"scanTime","push":true}"#,
        );
        // Nothing changed since the forced first payload in the reply.
        let mut ctx = fixture.ctx();
        assert!(pushes[0].pusher.refresh(&mut ctx).is_none());
        drop(ctx);

        fixture
            .tracking
            .scan_sample(0, Duration::from_millis(250));
        let mut ctx = fixture.ctx();
        let pushed = pushes[0].pusher.refresh(&mut ctx).unwrap();
        assert_eq!(pushed["measurements"][0]["last"], 250);
        // And again: no change, no payload.
        assert!(pushes[0].pusher.refresh(&mut ctx).is_none());
    }

    fn drive(server: &mut WsServer, fixture: &mut Fixture) {
        let mut read = ReadinessSet::new();
        let mut write = ReadinessSet::new();
        server.fill_readiness(&mut read, &mut write);
        poll::wait(&mut read, &mut write, 50).unwrap();
        let mut ctx = fixture.ctx();
        server.refresh(&read, &write, &mut ctx);
    }

    fn masked_text(payload: &[u8]) -> Vec<u8> {
        let mask = [0x21u8, 0x43, 0x65, 0x87];
        let mut frame = vec![0x81];
        assert!(payload.len() <= 125);
        frame.push(0x80 | payload.len() as u8);
        frame.extend_from_slice(&mask);
        frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
        frame
    }

    #[test]
    fn a_browser_can_handshake_and_run_a_command() {
        let mut fixture = Fixture::new();
        let mut server = WsServer::new(
            "monitor",
            0,
            "monitor",
            "M8M-monitor",
            commands::monitor_registry(),
        );
        server.listen().unwrap();
        let port = server.local_port().unwrap();

        let mut browser = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        browser
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        browser
            .write_all(
                b"GET /monitor HTTP/1.1\r\n\
                  Host: localhost\r\n\
                  Upgrade: websocket\r\n\
                  Connection: Upgrade\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 13\r\n\
                  Sec-WebSocket-Protocol: M8M-monitor\r\n\
                  \r\n",
            )
            .unwrap();

        let mut response = Vec::new();
        let mut chunk = [0u8; 1024];
        for _ in 0..50 {
            drive(&mut server, &mut fixture);
            match browser.read(&mut chunk) {
                Ok(got) => response.extend_from_slice(&chunk[..got]),
                Err(_) => {}
            }
            if response.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert_eq!(server.num_clients(), 1);

        browser
            .write_all(&masked_text(br#"{"command":"uptime"}"#))
            .unwrap();
        let mut reply = Vec::new();
        for _ in 0..50 {
            drive(&mut server, &mut fixture);
            match browser.read(&mut chunk) {
                Ok(got) => reply.extend_from_slice(&chunk[..got]),
                Err(_) => {}
            }
            if reply.len() > 2 && reply.len() >= 2 + reply[1] as usize {
                break;
            }
        }
        assert_eq!(reply[0], 0x81);
        let payload: Value = serde_json::from_slice(&reply[2..]).unwrap();
        assert!(payload["program"].as_u64().unwrap() > 0);
    }

    #[test]
    fn shutdown_closes_clients_and_then_the_listener() {
        let mut fixture = Fixture::new();
        let mut server = WsServer::new(
            "monitor",
            0,
            "monitor",
            "M8M-monitor",
            commands::monitor_registry(),
        );
        server.listen().unwrap();
        server.begin_close();
        assert!(server.is_closing());
        drive(&mut server, &mut fixture);
        assert!(server.fully_closed());
    }
}
