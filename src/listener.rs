//! TLS Listener & Scheduler
//!
//! Owns the accept loop for both daemons: a poll(2) loop on a listening
//! socket, a TLS handshake per accepted connection, and one worker thread
//! per session. SIGINT/SIGQUIT/SIGTERM flip a process-wide flag that breaks
//! the loop; in-flight workers run to completion and are never cancelled,
//! so bounded shutdown relies on the per-socket read timeout.
//!
//! TLS peer verification is disabled on purpose: phones authenticate inside
//! the application protocol, not at the transport layer.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsFd, AsRawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::socket::{self, sockopt, AddressFamily, Backlog, SockFlag, SockType, SockaddrIn};
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod, SslStream, SslVerifyMode};
use tracing::{error, info, warn};

const LISTEN_BACKLOG: i32 = 5;

/// Accept-loop poll granularity; also bounds shutdown latency.
const POLL_INTERVAL_MS: u16 = 1000;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_signal: nix::libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Route SIGINT, SIGQUIT and SIGTERM into the shutdown flag. SA_RESTART is
/// deliberately absent so a pending poll(2) returns EINTR.
pub fn install_signal_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(request_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGQUIT, Signal::SIGTERM] {
        unsafe {
            sigaction(signal, &action)
                .with_context(|| format!("failed to install {} handler", signal))?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn reset_shutdown_flag() {
    SHUTDOWN.store(false, Ordering::SeqCst);
}

/// Everything the accept loop needs besides the session handler.
pub struct ListenerSettings {
    pub port: u16,
    pub timeout: Duration,
    pub server_certificate: PathBuf,
    /// 0 means unlimited.
    pub concurrent_clients: u32,
}

/// TLS server context from one PEM file carrying certificate chain and key.
fn build_acceptor(server_certificate: &Path) -> Result<SslAcceptor> {
    let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls())
        .context("failed to create TLS acceptor")?;
    builder
        .set_certificate_chain_file(server_certificate)
        .with_context(|| {
            format!(
                "failed to load server certificate {}",
                server_certificate.display()
            )
        })?;
    builder
        .set_private_key_file(server_certificate, SslFiletype::PEM)
        .with_context(|| {
            format!(
                "failed to load server key {}",
                server_certificate.display()
            )
        })?;
    builder.check_private_key().context("server key does not match certificate")?;
    builder.set_verify(SslVerifyMode::NONE);
    Ok(builder.build())
}

/// Bind `0.0.0.0:port` with SO_REUSEADDR and the protocol's backlog.
fn bind_listener(port: u16) -> Result<TcpListener> {
    let sock = socket::socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .context("failed to create listener socket")?;
    socket::setsockopt(&sock, sockopt::ReuseAddr, &true).context("failed to set SO_REUSEADDR")?;
    let addr = SockaddrIn::new(0, 0, 0, 0, port);
    socket::bind(sock.as_raw_fd(), &addr)
        .with_context(|| format!("failed to bind port {}", port))?;
    socket::listen(&sock, Backlog::new(LISTEN_BACKLOG).context("invalid backlog")?)
        .context("failed to listen")?;
    Ok(TcpListener::from(sock))
}

/// Decrements the live-connection counter on session teardown, including
/// worker panics.
struct ConnectionGuard(Arc<AtomicU32>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bind and serve until a shutdown signal arrives.
pub fn serve<F>(settings: &ListenerSettings, handler: F) -> Result<()>
where
    F: Fn(SslStream<TcpStream>, SocketAddr) + Send + Sync + 'static,
{
    let listener = bind_listener(settings.port)?;
    info!(port = settings.port, "listening");
    serve_on(listener, settings, handler)
}

/// Accept loop over an already-bound listener.
pub fn serve_on<F>(listener: TcpListener, settings: &ListenerSettings, handler: F) -> Result<()>
where
    F: Fn(SslStream<TcpStream>, SocketAddr) + Send + Sync + 'static,
{
    let acceptor = Arc::new(build_acceptor(&settings.server_certificate)?);
    let handler = Arc::new(handler);
    let live_connections = Arc::new(AtomicU32::new(0));

    loop {
        if SHUTDOWN.load(Ordering::SeqCst) {
            info!("shutdown requested, closing listener");
            break;
        }

        let mut fds = [PollFd::new(listener.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err).context("poll on listener failed"),
        }

        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) => {
                error!("accept failed: {}", err);
                continue;
            }
        };

        let live_now = live_connections.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = ConnectionGuard(live_connections.clone());
        if settings.concurrent_clients != 0 && live_now > settings.concurrent_clients {
            warn!(%peer, limit = settings.concurrent_clients, "connection limit reached, closing");
            continue; // guard drops here, stream closes
        }

        if let Err(err) = stream.set_read_timeout(Some(settings.timeout)) {
            warn!(%peer, "failed to set read timeout: {}", err);
            continue;
        }

        let acceptor = acceptor.clone();
        let handler = handler.clone();
        std::thread::spawn(move || {
            let _guard = guard;
            match acceptor.accept(stream) {
                Ok(tls_stream) => {
                    // A panicking worker must not take the process down.
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        handler(tls_stream, peer)
                    }));
                    if result.is_err() {
                        error!(%peer, "session worker panicked");
                    }
                }
                Err(err) => warn!(%peer, "TLS handshake failed: {}", err),
            }
        });
    }

    drop(listener);
    Ok(())
}
