//! Stream-socket client for the external ICMP pinger daemon.
//!
//! Commands are line-oriented text (`A <id> <hostname>`, `R <id>`,
//! `D <id>`), submitted FIFO: one command goes out, the client waits for the
//! pinger's reply line, then proceeds. `failed` replies retry the same
//! command after ten seconds; an unexpected disconnect reconnects on the
//! same cadence and re-sends the head of the queue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::monitoring::host_scheme::HostScheme;
use crate::monitoring::types::{CustomerId, HostSchemeId};
use crate::worker::HttpWorker;

const PINGER_RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
enum CommandEntry {
    Add { host_scheme_id: HostSchemeId, hostname: String },
    Remove { host_scheme_id: HostSchemeId },
    Defunct { host_scheme_id: HostSchemeId },
}

impl CommandEntry {
    fn line(&self) -> String {
        match self {
            CommandEntry::Add { host_scheme_id, hostname } => {
                format!("A {host_scheme_id} {hostname}")
            }
            CommandEntry::Remove { host_scheme_id } => format!("R {host_scheme_id}"),
            CommandEntry::Defunct { host_scheme_id } => format!("D {host_scheme_id}"),
        }
    }
}

enum ClientMessage {
    Connect(String),
    Enqueue(CommandEntry),
}

#[derive(Clone)]
struct HostEntry {
    hostname: String,
    host_scheme: Weak<HostScheme>,
    worker: Weak<HttpWorker>,
}

#[derive(Default)]
struct HostIndex {
    by_host_scheme: HashMap<HostSchemeId, HostEntry>,
    by_customer: HashMap<CustomerId, HashSet<HostSchemeId>>,
}

/// Client side of the pinger socket. Registrations survive reconnects and
/// active/inactive cycles; the registered worker handles let an unsolicited
/// `NOPING` trigger a fast re-probe of the affected host/scheme.
pub struct PingClient {
    messages: mpsc::UnboundedSender<ClientMessage>,
    hosts: Arc<Mutex<HostIndex>>,
}

impl PingClient {
    pub fn new() -> Arc<Self> {
        Self::with_retry_delay(PINGER_RETRY_DELAY)
    }

    pub(crate) fn with_retry_delay(retry_delay: Duration) -> Arc<Self> {
        let (messages, receiver) = mpsc::unbounded_channel();
        let hosts = Arc::new(Mutex::new(HostIndex::default()));

        tokio::spawn(run_ping_client(Arc::clone(&hosts), receiver, retry_delay));

        Arc::new(Self { messages, hosts })
    }

    pub fn connect(&self, socket_path: &str) {
        let _ = self.messages.send(ClientMessage::Connect(socket_path.to_string()));
    }

    pub fn number_hosts(&self) -> usize {
        self.hosts.lock().expect("ping host index mutex poisoned").by_host_scheme.len()
    }

    /// Register a host for ping testing and queue the `A` command. Repeat
    /// registrations of the same host/scheme are ignored.
    pub fn add_host(
        &self,
        customer_id: CustomerId,
        host_scheme_id: HostSchemeId,
        hostname: String,
        host_scheme: Weak<HostScheme>,
        worker: Weak<HttpWorker>,
    ) {
        {
            let mut hosts = self.hosts.lock().expect("ping host index mutex poisoned");
            if hosts.by_host_scheme.contains_key(&host_scheme_id) {
                return;
            }
            hosts.by_host_scheme.insert(
                host_scheme_id,
                HostEntry { hostname: hostname.clone(), host_scheme, worker },
            );
            hosts.by_customer.entry(customer_id).or_default().insert(host_scheme_id);
        }

        let _ = self
            .messages
            .send(ClientMessage::Enqueue(CommandEntry::Add { host_scheme_id, hostname }));
    }

    /// Drop every registration the customer holds, queueing `R` commands.
    pub fn remove_customer(&self, customer_id: CustomerId) {
        let removed: Vec<HostSchemeId> = {
            let mut hosts = self.hosts.lock().expect("ping host index mutex poisoned");
            let Some(ids) = hosts.by_customer.remove(&customer_id) else {
                return;
            };
            for id in &ids {
                hosts.by_host_scheme.remove(id);
            }
            ids.into_iter().collect()
        };

        for host_scheme_id in removed {
            let _ =
                self.messages.send(ClientMessage::Enqueue(CommandEntry::Remove { host_scheme_id }));
        }
    }

    /// Tell the pinger a host is defunct; the registration is kept.
    #[allow(dead_code)]
    pub fn mark_defunct(&self, host_scheme_id: HostSchemeId) {
        let _ =
            self.messages.send(ClientMessage::Enqueue(CommandEntry::Defunct { host_scheme_id }));
    }

    /// Re-issue `A` commands for every registered host.
    pub fn go_active(&self) {
        let entries: Vec<(HostSchemeId, String)> = {
            let hosts = self.hosts.lock().expect("ping host index mutex poisoned");
            hosts
                .by_host_scheme
                .iter()
                .map(|(id, entry)| (*id, entry.hostname.clone()))
                .collect()
        };

        for (host_scheme_id, hostname) in entries {
            let _ = self
                .messages
                .send(ClientMessage::Enqueue(CommandEntry::Add { host_scheme_id, hostname }));
        }
    }

    /// Issue `R` commands for every registered host, keeping registrations
    /// so a later activation can replay them.
    pub fn go_inactive(&self) {
        let ids: Vec<HostSchemeId> = {
            let hosts = self.hosts.lock().expect("ping host index mutex poisoned");
            hosts.by_host_scheme.keys().copied().collect()
        };

        for host_scheme_id in ids {
            let _ =
                self.messages.send(ClientMessage::Enqueue(CommandEntry::Remove { host_scheme_id }));
        }
    }
}

struct PingDriver {
    hosts: Arc<Mutex<HostIndex>>,
    queue: VecDeque<CommandEntry>,
    socket_path: Option<String>,
    writer: Option<OwnedWriteHalf>,
    awaiting_reply: bool,
    retry_at: Option<Instant>,
    retry_delay: Duration,
}

type LineReader = Lines<BufReader<OwnedReadHalf>>;

async fn run_ping_client(
    hosts: Arc<Mutex<HostIndex>>,
    mut messages: mpsc::UnboundedReceiver<ClientMessage>,
    retry_delay: Duration,
) {
    let mut driver = PingDriver {
        hosts,
        queue: VecDeque::new(),
        socket_path: None,
        writer: None,
        awaiting_reply: false,
        retry_at: None,
        retry_delay,
    };
    let mut reader: Option<LineReader> = None;

    loop {
        let retry_armed = driver.retry_at.is_some();
        let retry_deadline = driver.retry_at.unwrap_or_else(Instant::now);

        tokio::select! {
            message = messages.recv() => match message {
                None => break,
                Some(ClientMessage::Connect(path)) => {
                    driver.socket_path = Some(path);
                    driver.writer = None;
                    reader = None;
                    driver.awaiting_reply = false;
                    driver.reconnect(&mut reader).await;
                    if !driver.awaiting_reply {
                        driver.issue_next(&mut reader).await;
                    }
                }
                Some(ClientMessage::Enqueue(command)) => {
                    let idle = driver.queue.is_empty() && !driver.awaiting_reply;
                    driver.queue.push_back(command);
                    if idle {
                        driver.issue_next(&mut reader).await;
                    }
                }
            },
            line = async {
                match reader.as_mut() {
                    Some(lines) => lines.next_line().await,
                    None => std::future::pending().await,
                }
            }, if reader.is_some() => {
                driver.handle_line(line, &mut reader).await;
            },
            _ = sleep_until(retry_deadline), if retry_armed => {
                driver.retry_at = None;
                driver.issue_next(&mut reader).await;
            }
        }
    }
}

impl PingDriver {
    async fn reconnect(&mut self, reader: &mut Option<LineReader>) {
        if self.writer.is_some() {
            return;
        }
        let Some(path) = self.socket_path.clone() else {
            return;
        };

        match UnixStream::connect(&path).await {
            Ok(stream) => {
                info!("Connected to pinger at {}", path);
                let (read_half, write_half) = stream.into_split();
                *reader = Some(BufReader::new(read_half).lines());
                self.writer = Some(write_half);
            }
            Err(error) => {
                warn!("Failed to connect to pinger at {}: {}", path, error);
            }
        }
    }

    /// Send the head of the queue, reconnecting first when the socket is
    /// down. Leaves a retry armed when the pinger is unreachable.
    async fn issue_next(&mut self, reader: &mut Option<LineReader>) {
        if self.writer.is_none() {
            self.reconnect(reader).await;
            if self.writer.is_none() {
                if self.socket_path.is_some() {
                    self.retry_at = Some(Instant::now() + self.retry_delay);
                }
                return;
            }
        }

        let Some(command) = self.queue.front() else {
            self.awaiting_reply = false;
            return;
        };

        let command_line = command.line();
        info!("Issuing pinger command \"{}\"", command_line);

        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        match writer.write_all(format!("{command_line}\n").as_bytes()).await {
            Ok(()) => self.awaiting_reply = true,
            Err(error) => {
                warn!("Pinger write failed: {}", error);
                self.disconnect(reader);
                self.retry_at = Some(Instant::now() + self.retry_delay);
            }
        }
    }

    fn disconnect(&mut self, reader: &mut Option<LineReader>) {
        self.writer = None;
        *reader = None;
        self.awaiting_reply = false;
    }

    async fn handle_line(
        &mut self,
        line: std::io::Result<Option<String>>,
        reader: &mut Option<LineReader>,
    ) {
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => {
                warn!("Pinger disconnected unexpectedly");
                self.disconnect(reader);
                self.retry_at = Some(Instant::now() + self.retry_delay);
                return;
            }
        };

        let received = line.trim();
        let head = self.queue.front().map(CommandEntry::line).unwrap_or_default();

        if received == "OK" {
            self.queue.pop_front();
            self.awaiting_reply = false;
            self.issue_next(reader).await;
        } else if let Some(rest) = received.strip_prefix("NOPING ") {
            self.handle_noping(rest);
        } else if received.starts_with("ERROR") {
            warn!(
                "Pinger reported error, command \"{}\", response \"{}\", ignoring",
                head, received
            );
            self.queue.pop_front();
            self.awaiting_reply = false;
            self.issue_next(reader).await;
        } else if received.starts_with("failed") {
            warn!(
                "Pinger reported error, command \"{}\", response \"{}\", will retry",
                head, received
            );
            self.retry_at = Some(Instant::now() + self.retry_delay);
        } else {
            debug!("Unexpected pinger response \"{}\"", received);
        }
    }

    /// Unsolicited loss-of-liveness notification: ask the owning worker to
    /// fast-probe the host/scheme. Losing this signal is not fatal.
    fn handle_noping(&self, rest: &str) {
        let Ok(host_scheme_id) = rest.trim().parse::<HostSchemeId>() else {
            warn!("Malformed NOPING notification \"{}\"", rest.trim());
            return;
        };

        warn!("Pinger lost liveness for host/scheme {}", host_scheme_id);

        let entry = {
            let hosts = self.hosts.lock().expect("ping host index mutex poisoned");
            hosts.by_host_scheme.get(&host_scheme_id).cloned()
        };

        if let Some(entry) = entry {
            if let Some(worker) = entry.worker.upgrade() {
                worker.check_now(entry.host_scheme);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    async fn expect_line(lines: &mut Lines<BufReader<tokio::net::unix::OwnedReadHalf>>) -> String {
        tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .expect("pinger read timed out")
            .expect("pinger read failed")
            .expect("pinger socket closed")
    }

    #[tokio::test]
    async fn commands_flow_fifo_with_failed_retry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket_path = dir.path().join("pinger.sock");
        let listener = UnixListener::bind(&socket_path).expect("bind pinger socket");

        let client = PingClient::with_retry_delay(Duration::from_millis(50));
        client.connect(socket_path.to_str().expect("utf-8 path"));
        client.add_host(1, 7, "one.example.com".to_string(), Weak::new(), Weak::new());
        client.add_host(1, 8, "two.example.com".to_string(), Weak::new(), Weak::new());

        let (stream, _) = listener.accept().await.expect("pinger accept");
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        assert_eq!(expect_line(&mut lines).await, "A 7 one.example.com");
        // `failed` retries the same command after the delay.
        write_half.write_all(b"failed busy\n").await.expect("reply");
        assert_eq!(expect_line(&mut lines).await, "A 7 one.example.com");
        write_half.write_all(b"OK\n").await.expect("reply");

        // `OK` pops and moves on.
        assert_eq!(expect_line(&mut lines).await, "A 8 two.example.com");
        write_half.write_all(b"OK\n").await.expect("reply");

        // Removal queues one `R` per registered host of the customer.
        client.remove_customer(1);
        let mut removals = vec![expect_line(&mut lines).await];
        write_half.write_all(b"OK\n").await.expect("reply");
        removals.push(expect_line(&mut lines).await);
        write_half.write_all(b"OK\n").await.expect("reply");
        removals.sort();
        assert_eq!(removals, vec!["R 7", "R 8"]);
        assert_eq!(client.number_hosts(), 0);
    }

    #[tokio::test]
    async fn error_replies_drop_the_command() {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket_path = dir.path().join("pinger.sock");
        let listener = UnixListener::bind(&socket_path).expect("bind pinger socket");

        let client = PingClient::with_retry_delay(Duration::from_millis(50));
        client.connect(socket_path.to_str().expect("utf-8 path"));
        client.add_host(4, 21, "bad.example.com".to_string(), Weak::new(), Weak::new());
        client.mark_defunct(21);

        let (stream, _) = listener.accept().await.expect("pinger accept");
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        assert_eq!(expect_line(&mut lines).await, "A 21 bad.example.com");
        write_half.write_all(b"ERROR no such host\n").await.expect("reply");

        // The errored command is dropped, the next one goes out.
        assert_eq!(expect_line(&mut lines).await, "D 21");
        write_half.write_all(b"OK\n").await.expect("reply");
    }

    #[tokio::test]
    async fn reconnects_and_resends_after_disconnect() {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket_path = dir.path().join("pinger.sock");
        let listener = UnixListener::bind(&socket_path).expect("bind pinger socket");

        let client = PingClient::with_retry_delay(Duration::from_millis(50));
        client.connect(socket_path.to_str().expect("utf-8 path"));
        client.add_host(2, 5, "drop.example.com".to_string(), Weak::new(), Weak::new());

        {
            let (stream, _) = listener.accept().await.expect("pinger accept");
            let (read_half, _write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            assert_eq!(expect_line(&mut lines).await, "A 5 drop.example.com");
            // Connection drops here without a reply.
        }

        // The client reconnects and re-sends the head of the queue.
        let (stream, _) = listener.accept().await.expect("pinger re-accept");
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        assert_eq!(expect_line(&mut lines).await, "A 5 drop.example.com");
        write_half.write_all(b"OK\n").await.expect("reply");
    }
}
