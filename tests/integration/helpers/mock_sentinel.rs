//! Mock Sentinel for integration testing
//!
//! Answers `SENTINEL get-master-addr-by-name` from a table of monitored
//! masters and publishes `+switch-master` events to every subscriber when
//! a test triggers a failover.

use super::wire::{array, bulk, error, integer, null, read_command, simple};
use heimdall::HostAndPort;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

type Masters = Arc<Mutex<HashMap<String, HostAndPort>>>;

pub struct MockSentinel {
    addr: HostAndPort,
    masters: Masters,
    events: broadcast::Sender<String>,
    kicks: broadcast::Sender<()>,
    subscribers: Arc<AtomicUsize>,
    queries: Arc<AtomicUsize>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockSentinel {
    /// A Sentinel monitoring `master_name` at `master`
    pub async fn monitoring(master_name: &str, master: HostAndPort) -> std::io::Result<Self> {
        MockSentinelBuilder::new()
            .monitor(master_name, master)
            .build()
            .await
    }

    pub fn addr(&self) -> HostAndPort {
        self.addr.clone()
    }

    /// Connections currently subscribed to `+switch-master`
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::SeqCst)
    }

    /// `get-master-addr-by-name` queries answered so far
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Move `master_name` to `new_master` and tell every subscriber
    pub fn switch_master(&self, master_name: &str, new_master: HostAndPort) {
        let old = self
            .masters
            .lock()
            .unwrap()
            .insert(master_name.to_string(), new_master.clone())
            .unwrap_or_else(|| new_master.clone());
        self.publish(&format!(
            "{} {} {} {} {}",
            master_name, old.host, old.port, new_master.host, new_master.port
        ));
    }

    /// Move `master_name` without telling anyone, like a failover the pool missed
    pub fn set_master(&self, master_name: &str, new_master: HostAndPort) {
        self.masters
            .lock()
            .unwrap()
            .insert(master_name.to_string(), new_master);
    }

    /// Close every subscribed connection from the server side
    pub fn disconnect_subscribers(&self) {
        let _ = self.kicks.send(());
    }

    /// Publish a raw `+switch-master` payload without touching the master table
    pub fn publish(&self, payload: &str) {
        let _ = self.events.send(payload.to_string());
    }

    /// Stop accepting connections
    pub fn shutdown(self) {
        if let Some(tx) = self.shutdown_tx {
            let _ = tx.send(());
        }
    }
}

pub struct MockSentinelBuilder {
    bind_addr: String,
    masters: HashMap<String, HostAndPort>,
    password: Option<String>,
}

impl MockSentinelBuilder {
    pub fn new() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            masters: HashMap::new(),
            password: None,
        }
    }

    pub fn monitor(mut self, master_name: &str, master: HostAndPort) -> Self {
        self.masters.insert(master_name.to_string(), master);
        self
    }

    /// Require AUTH before any other command
    pub fn password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    pub async fn build(self) -> std::io::Result<MockSentinel> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        let local = listener.local_addr()?;
        let addr = HostAndPort::new(local.ip().to_string(), local.port());

        let masters: Masters = Arc::new(Mutex::new(self.masters));
        let (events, _) = broadcast::channel(16);
        let (kicks, _) = broadcast::channel(4);
        let subscribers = Arc::new(AtomicUsize::new(0));
        let queries = Arc::new(AtomicUsize::new(0));
        let password = Arc::new(self.password);

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();

        let context = ConnectionContext {
            masters: Arc::clone(&masters),
            events: events.clone(),
            kicks: kicks.clone(),
            subscribers: Arc::clone(&subscribers),
            queries: Arc::clone(&queries),
            password,
        };

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _)) => {
                                let context = context.clone();
                                tokio::spawn(handle_connection(stream, context));
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }
        });

        Ok(MockSentinel {
            addr,
            masters,
            events,
            kicks,
            subscribers,
            queries,
            shutdown_tx: Some(shutdown_tx),
        })
    }
}

impl Default for MockSentinelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
struct ConnectionContext {
    masters: Masters,
    events: broadcast::Sender<String>,
    kicks: broadcast::Sender<()>,
    subscribers: Arc<AtomicUsize>,
    queries: Arc<AtomicUsize>,
    password: Arc<Option<String>>,
}

async fn handle_connection(stream: TcpStream, context: ConnectionContext) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    // Replies and pushed messages share one writer task
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            if write.write_all(out.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut authenticated = context.password.is_none();
    let mut forwarder: Option<tokio::task::JoinHandle<()>> = None;
    // Only subscribed connections can be kicked
    let mut kicked: Option<broadcast::Receiver<()>> = None;

    loop {
        let kick = async {
            match kicked.as_mut() {
                Some(rx) => {
                    let _ = rx.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        let read = tokio::select! {
            read = read_command(&mut reader) => read,
            _ = kick => break,
        };
        let args = match read {
            Ok(Some(args)) if !args.is_empty() => args,
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => break,
        };
        let cmd = args[0].to_ascii_uppercase();

        let reply = match cmd.as_str() {
            "AUTH" => {
                let pass = args.last().cloned().unwrap_or_default();
                if context.password.as_deref() == Some(pass.as_str()) {
                    authenticated = true;
                    simple("OK")
                } else {
                    error("WRONGPASS invalid username-password pair or user is disabled.")
                }
            }
            "QUIT" => {
                let _ = tx.send(simple("OK"));
                break;
            }
            _ if !authenticated => error("NOAUTH Authentication required."),
            "PING" => simple("PONG"),
            "CLIENT" => simple("OK"),
            "SENTINEL"
                if args.len() == 3 && args[1].eq_ignore_ascii_case("get-master-addr-by-name") =>
            {
                context.queries.fetch_add(1, Ordering::SeqCst);
                let master = context.masters.lock().unwrap().get(&args[2]).cloned();
                match master {
                    Some(master) => array(&[bulk(&master.host), bulk(&master.port.to_string())]),
                    None => null(),
                }
            }
            "SUBSCRIBE" if args.len() == 2 && forwarder.is_none() => {
                let channel = args[1].clone();
                let mut events = context.events.subscribe();
                kicked = Some(context.kicks.subscribe());
                // Confirm before any message can be pushed
                if tx
                    .send(array(&[bulk("subscribe"), bulk(&channel), integer(1)]))
                    .is_err()
                {
                    break;
                }
                let push = tx.clone();
                let push_channel = channel.clone();
                forwarder = Some(tokio::spawn(async move {
                    while let Ok(payload) = events.recv().await {
                        let message =
                            array(&[bulk("message"), bulk(&push_channel), bulk(&payload)]);
                        if push.send(message).is_err() {
                            break;
                        }
                    }
                }));
                context.subscribers.fetch_add(1, Ordering::SeqCst);
                continue;
            }
            _ => error(&format!("ERR unknown command '{}'", args[0])),
        };

        if tx.send(reply).is_err() {
            break;
        }
    }

    if let Some(forwarder) = forwarder {
        forwarder.abort();
        context.subscribers.fetch_sub(1, Ordering::SeqCst);
    }
    drop(tx);
    let _ = writer.await;
}
