use crate::{
    error::{Error, Result},
    rendezvous::{SocketPath, send_fd, stream_socket},
    utils,
};
use nix::{
    errno::Errno,
    libc,
    poll::{PollFd, PollFlags, ppoll},
    sys::{
        prctl,
        signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction},
        socket::{Backlog, accept, bind, listen},
    },
    unistd::{Pid, getppid},
};
use std::{
    os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
};
use tracing::{debug, info, warn};

/// Single-word flag shared between a signal handler and the accept loop.
#[derive(Debug)]
pub struct StopFlag(AtomicBool);

impl StopFlag {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Async-signal-safe.
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn should_stop(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Set by `SIGTERM`, explicit or delivered on parent death.
pub static TERMINATION: StopFlag = StopFlag::new();

extern "C" fn on_terminate(_: libc::c_int) {
    TERMINATION.request_stop();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Created,
    Listening,
    Serving,
    Terminating,
    Exited,
}

/// Listening socket plus the flag that ends the accept loop.
#[derive(Debug)]
pub struct BrokerSession<'a> {
    listener: OwnedFd,
    socket: PathBuf,
    stop: &'a StopFlag,
    state: BrokerState,
}

impl<'a> BrokerSession<'a> {
    /// Creates, binds and starts listening on the socket at `path`.
    pub fn bind(path: &SocketPath, stop: &'a StopFlag) -> Result<Self> {
        let listener = stream_socket()?;
        let socket = path.socket();

        let mut session = Self {
            listener,
            socket,
            stop,
            state: BrokerState::Created,
        };

        bind(session.listener.as_raw_fd(), &path.address()?)
            .map_err(|errno| Error::sys("bind", &session.socket, errno))?;

        // Rendezvous is rare; one pending connection is plenty.
        listen(&session.listener, Backlog::new(1)?)
            .map_err(|errno| Error::sys("listen", &session.socket, errno))?;

        session.transition(BrokerState::Listening);
        Ok(session)
    }

    pub fn state(&self) -> BrokerState {
        self.state
    }

    fn transition(&mut self, state: BrokerState) {
        debug!("broker: {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Hands a duplicate of `namespace` to every client until stopped.
    ///
    /// Returns the number of descriptors served. The wait happens in
    /// `ppoll(2)` with `SIGTERM` unblocked, so when the caller keeps `SIGTERM`
    /// blocked otherwise, a stop request cannot land between the flag check
    /// and the wait.
    pub fn serve(&mut self, namespace: BorrowedFd<'_>) -> Result<usize> {
        self.transition(BrokerState::Serving);
        let mut served = 0;

        let mut wait_mask = SigSet::thread_get_mask()?;
        wait_mask.remove(Signal::SIGTERM);

        while !self.stop.should_stop() {
            let mut fds = [PollFd::new(self.listener.as_fd(), PollFlags::POLLIN)];
            match ppoll(&mut fds, None, Some(wait_mask)) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(Error::sys("ppoll", &self.socket, errno)),
            }

            let conn = match accept(self.listener.as_raw_fd()) {
                // SAFETY: accept(2) returned a new descriptor owned by nobody else.
                Ok(raw) => unsafe { OwnedFd::from_raw_fd(raw) },
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    warn!("accept: {errno}");
                    continue;
                }
            };

            match send_fd(&conn, namespace) {
                Ok(()) => served += 1,
                Err(error) => warn!("failed to send namespace descriptor: {error}"),
            }
        }

        self.transition(BrokerState::Terminating);
        Ok(served)
    }

    /// Closes the listener and removes the socket file.
    pub fn close(mut self) {
        if let Err(error) = utils::remove_file(&self.socket) {
            warn!("{error}");
        }
        self.transition(BrokerState::Exited);
    }
}

/// Child-side role after fork: keeps the original namespace handle and serves
/// it over the private socket.
pub struct NamespaceBroker {
    namespace: OwnedFd,
    socket: SocketPath,
    parent_before_fork: Pid,
}

impl NamespaceBroker {
    pub fn new(namespace: OwnedFd, socket: SocketPath, parent_before_fork: Pid) -> Self {
        Self {
            namespace,
            socket,
            parent_before_fork,
        }
    }

    /// Runs until `SIGTERM` or parent death. Rollback is left to the caller.
    pub fn run(self) -> Result<usize> {
        let mut blocked = SigSet::empty();
        blocked.add(Signal::SIGTERM);
        blocked.thread_block()?;
        install_signal_handlers()?;

        // Armed before the check below, so a parent dying in between is still caught.
        prctl::set_pdeathsig(Signal::SIGTERM)?;
        if getppid() != self.parent_before_fork {
            return Err(Error::ParentGone);
        }

        let mut session = BrokerSession::bind(&self.socket, &TERMINATION)?;
        info!("serving namespace at {}", self.socket.socket().display());

        let served = session.serve(self.namespace.as_fd())?;
        debug!("served {served} namespace descriptor(s)");

        session.close();
        Ok(served)
    }
}

/// `SIGTERM` only raises the flag; `SIGINT` is ignored so a Ctrl-C aimed at
/// the foreground program leaves the broker alone.
fn install_signal_handlers() -> Result<()> {
    // No SA_RESTART: the wait must end with EINTR.
    let term = SigAction::new(
        SigHandler::Handler(on_terminate),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());

    // SAFETY: the handler only stores to an atomic.
    unsafe {
        sigaction(Signal::SIGTERM, &term)?;
        sigaction(Signal::SIGINT, &ignore)?;
    }
    Ok(())
}
