//! The manager's control endpoint.
//!
//! One request per accepted connection: the worker sends JSON and
//! half-closes, the manager reads to EOF, dispatches on `q` under the
//! registry lock, writes a single JSON object back and closes. `FLOW:`
//! lines are the only machine-readable output and go to stdout.

use crate::config::ManagerConfig;
use crate::flow::FlowRecord;
use crate::manager::registry::Registry;
use crate::protocol::{Registered, Request, Response, Unknown, COMMANDS};
use color_eyre::eyre::WrapErr;
use color_eyre::Report;
use parking_lot::Mutex;
use serde_json::Value;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, warn};

pub(crate) struct State {
    config: ManagerConfig,
    started: Instant,
    registry: Mutex<Registry>,
}

impl State {
    pub(crate) fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            started: Instant::now(),
            registry: Mutex::new(Registry::new()),
        }
    }

    /// Parses and executes one request. Returns the response to write (if
    /// any) and the flow records to print.
    pub(crate) fn dispatch(
        &self,
        raw: &[u8],
        peer_ip: IpAddr,
    ) -> (Option<Response>, Vec<FlowRecord>) {
        let value: Value = match serde_json::from_slice(raw) {
            Ok(value) => value,
            Err(e) => {
                warn!("dropping unparseable request from {}: {}", peer_ip, e);
                return (None, Vec::new());
            }
        };
        let q = value.get("q").and_then(Value::as_str).map(str::to_string);
        let request: Request = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(e) => {
                return match q {
                    Some(q) if !COMMANDS.contains(&q.as_str()) => {
                        warn!("unknown command from {}: {:?}", peer_ip, q);
                        let unknown = Unknown {
                            success: false,
                            message: format!("Unknown command '{}'", q),
                        };
                        (Some(Response::Unknown(unknown)), Vec::new())
                    }
                    _ => {
                        warn!(
                            "dropping malformed request from {}: {}",
                            peer_ip, e
                        );
                        (None, Vec::new())
                    }
                };
            }
        };

        let now = Instant::now();
        let elapsed = self.started.elapsed().as_secs_f64();
        let mut registry = self.registry.lock();

        let response = match request {
            Request::RegisterWorker { blast_port, ip } => {
                let ip = ip.unwrap_or(peer_ip);
                let blast_port = blast_port.unwrap_or(0);
                let worker_id =
                    registry.register(ip, blast_port, &self.config, now);
                debug!(
                    "registered worker {} at {} blast_port {}",
                    worker_id, ip, blast_port
                );
                Response::Registered(Registered {
                    success: true,
                    worker_id,
                })
            }
            Request::KeepAlive { worker_id, .. } => {
                if registry.touch(&worker_id, now) {
                    Response::empty()
                } else {
                    Response::reregister(&worker_id)
                }
            }
            Request::GetWork { worker_id, ip } => {
                if registry.touch(&worker_id, now) {
                    registry.assign(
                        &worker_id,
                        ip.unwrap_or(peer_ip),
                        &self.config,
                        now,
                        elapsed,
                    )
                } else {
                    Response::reregister(&worker_id)
                }
            }
            Request::ReportFlow {
                worker_id,
                blast_ip,
                blast_port,
                start,
                duration,
                bytes_sent,
                bytes_received,
                bytes,
                ip,
                ..
            } => {
                if registry.touch(&worker_id, now) {
                    let src_ip = ip.unwrap_or(peer_ip);
                    let mut flows = Vec::new();
                    // the legacy single-counter form stands in for sent bytes
                    let sent = bytes_sent.or(bytes);
                    if let Some(bytes) = sent.filter(|b| *b > 0) {
                        flows.push(FlowRecord {
                            src_ip,
                            dest_ip: blast_ip,
                            dest_port: blast_port,
                            start,
                            elapsed: duration,
                            bytes,
                        });
                    }
                    // received bytes flow the other way
                    if let Some(bytes) = bytes_received.filter(|b| *b > 0) {
                        flows.push(FlowRecord {
                            src_ip: blast_ip,
                            dest_ip: src_ip,
                            dest_port: blast_port,
                            start,
                            elapsed: duration,
                            bytes,
                        });
                    }
                    return (Some(Response::empty()), flows);
                } else {
                    Response::reregister(&worker_id)
                }
            }
            Request::ConnectFailed {
                worker_id,
                blast_id,
                error,
                ..
            } => {
                if registry.touch(&worker_id, now) {
                    match registry.record_connect_failure(&blast_id) {
                        Some(failure) if failure.disabled_now => {
                            warn!(
                                "Will no longer use failing server at {}:{}: {}",
                                failure.ip, failure.blast_port, error
                            );
                        }
                        Some(_) => {}
                        None => warn!(
                            "connect_failed for unknown blast_id {:?}",
                            blast_id
                        ),
                    }
                    Response::empty()
                } else {
                    Response::reregister(&worker_id)
                }
            }
        };
        (Some(response), Vec::new())
    }
}

/// The manager's TCP control endpoint.
pub struct Server {
    state: Arc<State>,
    listener: TcpListener,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    pub async fn bind(config: ManagerConfig) -> Result<Self, Report> {
        let listener = TcpListener::bind((config.bind_host(), config.port))
            .await
            .wrap_err_with(|| {
                format!(
                    "binding manager to {}:{}",
                    config.bind_host(),
                    config.port
                )
            })?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            state: Arc::new(State::new(config)),
            listener,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Report> {
        self.listener.local_addr().wrap_err("manager local addr")
    }

    /// Handle that stops the accept loop when sent `true`.
    pub fn shutdown_handle(&self) -> Arc<watch::Sender<bool>> {
        self.shutdown_tx.clone()
    }

    /// Serves requests until the test duration elapses or a signal
    /// arrives. In-flight request tasks finish on their own.
    pub async fn run(self) -> Result<(), Report> {
        let Server {
            state,
            listener,
            shutdown_tx,
            mut shutdown_rx,
        } = self;

        let addr = listener.local_addr().wrap_err("manager local addr")?;
        println!("Manager network address: {}:{}", addr.ip(), addr.port());

        tokio::spawn(supervise(
            state.clone(),
            shutdown_tx.clone(),
            shutdown_rx.clone(),
        ));
        tokio::spawn(crate::signal::shutdown_on_signal(shutdown_tx));

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            let peer_ip = peer.ip();
                            if let Err(e) =
                                handle_connection(state, stream, peer_ip).await
                            {
                                warn!(
                                    "error handling request from {}: {:?}",
                                    peer_ip, e
                                );
                            }
                        });
                    }
                    Err(e) => warn!("accept failed: {:?}", e),
                },
                _ = shutdown_rx.changed() => break,
            }
        }
        Ok(())
    }
}

async fn handle_connection(
    state: Arc<State>,
    stream: TcpStream,
    peer_ip: IpAddr,
) -> Result<(), Report> {
    let (mut reader, mut writer) = stream.into_split();
    let mut request = Vec::new();
    reader
        .read_to_end(&mut request)
        .await
        .wrap_err("reading request")?;
    debug!(
        "received from {}: {}",
        peer_ip,
        String::from_utf8_lossy(&request)
    );

    let (response, flows) = state.dispatch(&request, peer_ip);
    for flow in flows {
        println!("{}", flow);
    }
    if let Some(response) = response {
        let payload =
            serde_json::to_vec(&response).wrap_err("encoding response")?;
        debug!(
            "response to {}: {}",
            peer_ip,
            String::from_utf8_lossy(&payload)
        );
        writer
            .write_all(&payload)
            .await
            .wrap_err("writing response")?;
    }
    Ok(())
}

/// Wakes at most every five seconds; stops the listener once the test has
/// run for its duration (plus slack for in-flight blasts to report) or a
/// shutdown was requested. A duration of 0 means run until signalled.
async fn supervise(
    state: Arc<State>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let duration = state.config.duration;
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        let elapsed = state.started.elapsed().as_secs_f64();
        if duration != 0 && elapsed >= duration as f64 + 5.0 {
            break;
        }
        let mut nap = if duration == 0 {
            5.0
        } else {
            duration as f64 - elapsed
        };
        if nap < 1.0 {
            nap = 5.0;
        }
        if nap > 5.0 {
            nap = 5.0;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs_f64(nap)) => {}
            _ = shutdown_rx.changed() => break,
        }
    }
    println!(
        "Test ended after {} seconds.",
        state.started.elapsed().as_secs_f64().round() as u64
    );
    let _ = shutdown_tx.send(true);
}
