//! The worker: a blast server accepting inbound saturation connections and
//! a control loop that registers with the manager, polls for work and dials
//! assigned peers as blast initiator.

// This module contains the blast server accept loop.
pub mod server;

use crate::blast;
use crate::config::{WorkerConfig, KEEPALIVE_TIMEOUT};
use crate::id::WorkerId;
use crate::protocol::{AckReply, Direction, RegisterReply, Request, WorkReply};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Report;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Runs the worker until its lifetime expires, the manager tells it to
/// stop, or a signal arrives. The blast server is signalled and joined
/// before returning.
pub async fn run(config: WorkerConfig) -> Result<(), Report> {
    let started = Instant::now();
    if config.daemonize {
        warn!("--daemonize is not supported; running in the foreground");
    }

    let listener = TcpListener::bind((config.bind_host(), config.worker_port))
        .await
        .wrap_err_with(|| {
            format!(
                "binding blast server to {}:{}",
                config.bind_host(),
                config.worker_port
            )
        })?;
    let blast_port = listener
        .local_addr()
        .wrap_err("blast server local addr")?
        .port();
    info!(
        "blast server listening on {}:{}",
        config.bind_host(),
        blast_port
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let blast_server = tokio::spawn(server::serve(listener, shutdown_rx.clone()));
    tokio::spawn(crate::signal::shutdown_on_signal(shutdown_tx.clone()));

    let result = control_loop(&config, blast_port, started, shutdown_rx).await;

    // stop the blast server and join it before returning
    let _ = shutdown_tx.send(true);
    let _ = blast_server.await;
    info!("worker ran for {:.1} seconds", started.elapsed().as_secs_f64());
    result
}

async fn control_loop(
    config: &WorkerConfig,
    blast_port: u16,
    started: Instant,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Report> {
    let deadline = config
        .duration
        .map(|secs| started + Duration::from_secs(secs));
    let mut worker_id = register(&config.manager, blast_port).await?;
    info!("registered with manager {} as {}", config.manager, worker_id);

    loop {
        if *shutdown.borrow() {
            break;
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                info!("worker lifetime reached");
                break;
            }
        }

        let work = Request::GetWork {
            worker_id: worker_id.clone(),
            ip: None,
        };
        let reply: WorkReply = request(&config.manager, &work).await?;

        if !reply.success {
            if reply.reregister == Some(true) {
                worker_id = register(&config.manager, blast_port).await?;
                info!("re-registered as {}", worker_id);
                continue;
            }
            match reply.retry_after {
                Some(secs) => {
                    if let Some(msg) = &reply.error_msg {
                        debug!("no work: {}", msg);
                    }
                    if !sleep_or_shutdown(secs, deadline, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
                // no retry hint means do not retry
                None => {
                    info!(
                        "manager says: {}",
                        reply.error_msg.as_deref().unwrap_or("done")
                    );
                    break;
                }
            }
        }

        let blast_ip = reply
            .blast_ip
            .ok_or_else(|| eyre!("work assignment missing blast_ip"))?;
        let peer_port = reply
            .blast_port
            .ok_or_else(|| eyre!("work assignment missing blast_port"))?;
        let blast_id = reply
            .blast_id
            .ok_or_else(|| eyre!("work assignment missing blast_id"))?;
        let direction = reply
            .direction
            .ok_or_else(|| eyre!("work assignment missing direction"))?;
        let duration = Duration::from_secs(
            reply
                .duration
                .ok_or_else(|| eyre!("work assignment missing duration"))?,
        );

        let stream = match TcpStream::connect((blast_ip, peer_port)).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("connect to {}:{} failed: {}", blast_ip, peer_port, e);
                let failed = Request::ConnectFailed {
                    worker_id: worker_id.clone(),
                    blast_id,
                    blast_ip: Some(blast_ip),
                    blast_port: Some(peer_port),
                    error: e.to_string(),
                    ip: None,
                };
                if let Err(e) =
                    request::<AckReply>(&config.manager, &failed).await
                {
                    warn!("reporting connect failure failed: {:?}", e);
                }
                continue;
            }
        };

        info!(
            "blasting {} to {}:{} for {} seconds",
            direction,
            blast_ip,
            peer_port,
            duration.as_secs()
        );
        let outcome = match blast_with_keepalive(
            &config.manager,
            &worker_id,
            stream,
            direction,
            duration,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("blast to {}:{} failed: {:?}", blast_ip, peer_port, e);
                continue;
            }
        };
        info!(
            "blast done: sent {} received {} bytes in {:.2} seconds",
            outcome.bytes_sent, outcome.bytes_received, outcome.elapsed
        );

        let report = Request::ReportFlow {
            worker_id: worker_id.clone(),
            blast_ip,
            blast_port: peer_port,
            start: outcome.start,
            duration: (outcome.elapsed * 100.0).round() / 100.0,
            bytes_sent: Some(outcome.bytes_sent),
            bytes_received: Some(outcome.bytes_received),
            bytes: None,
            direction: Some(direction),
            ip: None,
        };
        let ack: AckReply = request(&config.manager, &report).await?;
        if ack.reregister == Some(true) {
            worker_id = register(&config.manager, blast_port).await?;
            info!("re-registered as {}", worker_id);
        }
    }
    Ok(())
}

/// Sleeps for `secs`, bounded by the worker lifetime. False means stop the
/// loop instead of retrying.
async fn sleep_or_shutdown(
    secs: f64,
    deadline: Option<Instant>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let mut nap = Duration::from_secs_f64(secs.max(0.0));
    if let Some(deadline) = deadline {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return false;
        }
        nap = nap.min(left);
    }
    tokio::select! {
        _ = tokio::time::sleep(nap) => true,
        _ = shutdown.changed() => false,
    }
}

/// Drives one blast as initiator while keeping the registration alive; a
/// transfer can outlast a good part of the keepalive window.
async fn blast_with_keepalive(
    manager: &str,
    worker_id: &str,
    stream: TcpStream,
    direction: Direction,
    duration: Duration,
) -> Result<blast::Outcome, Report> {
    let blast = blast::run_initiator(stream, direction, duration);
    tokio::pin!(blast);
    let mut keepalive = tokio::time::interval(KEEPALIVE_TIMEOUT / 3);
    // the first tick fires immediately; the registration is fresh
    keepalive.tick().await;
    loop {
        tokio::select! {
            outcome = &mut blast => return outcome,
            _ = keepalive.tick() => {
                let keep = Request::KeepAlive {
                    worker_id: worker_id.to_string(),
                    ip: None,
                };
                if let Err(e) = request::<AckReply>(manager, &keep).await {
                    debug!("keepalive failed: {:?}", e);
                }
            }
        }
    }
}

/// Sends one JSON request: write, half-close the write side, read the
/// response to EOF.
async fn exchange(manager: &str, request: &Request) -> Result<Vec<u8>, Report> {
    let stream = TcpStream::connect(manager)
        .await
        .wrap_err_with(|| format!("connecting to manager at {}", manager))?;
    let (mut reader, mut writer) = stream.into_split();
    let payload = serde_json::to_vec(request).wrap_err("encoding request")?;
    debug!("sending to manager: {}", String::from_utf8_lossy(&payload));
    writer.write_all(&payload).await.wrap_err("sending request")?;
    writer.shutdown().await.wrap_err("half-closing request")?;
    let mut response = Vec::new();
    reader
        .read_to_end(&mut response)
        .await
        .wrap_err("reading response")?;
    debug!("manager answered: {}", String::from_utf8_lossy(&response));
    Ok(response)
}

async fn request<T>(manager: &str, request: &Request) -> Result<T, Report>
where
    T: DeserializeOwned,
{
    let response = exchange(manager, request).await?;
    serde_json::from_slice(&response).wrap_err("parsing manager response")
}

async fn register(manager: &str, blast_port: u16) -> Result<WorkerId, Report> {
    let reply: RegisterReply = request(
        manager,
        &Request::RegisterWorker {
            blast_port: Some(blast_port),
            ip: None,
        },
    )
    .await?;
    if !reply.success {
        return Err(eyre!(
            "registration refused: {}",
            reply.error_msg.unwrap_or_default()
        ));
    }
    reply
        .worker_id
        .ok_or_else(|| eyre!("registration reply missing worker_id"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::manager::Server;

    fn manager_config() -> ManagerConfig {
        ManagerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            debug: false,
            duration: 120,
            src_networks: vec![],
            dest_networks: vec![],
            direction: Direction::Send,
        }
    }

    #[tokio::test]
    async fn registers_and_polls_a_real_manager() {
        let server = Server::bind(manager_config()).await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let shutdown = server.shutdown_handle();
        let serving = tokio::spawn(server.run());

        let worker_id = register(&addr, 9001).await.unwrap();
        assert_eq!(worker_id.len(), 16);

        // a lone worker cannot be paired with itself
        let reply: WorkReply = request(
            &addr,
            &Request::GetWork {
                worker_id: worker_id.clone(),
                ip: None,
            },
        )
        .await
        .unwrap();
        assert!(!reply.success);
        assert_eq!(reply.retry_after, Some(10.0));
        assert!(reply
            .error_msg
            .unwrap()
            .starts_with("No servers found."));

        // keepalives ack with an empty object
        let ack: AckReply = request(
            &addr,
            &Request::KeepAlive {
                worker_id,
                ip: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(ack.reregister, None);

        let _ = shutdown.send(true);
        serving.await.unwrap().unwrap();
    }
}
