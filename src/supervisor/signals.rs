use std::{
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
};

use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use signal_hook::{
    consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2},
    flag,
    iterator::{Handle, Signals},
    low_level,
    SigId,
};

/// Signals intercepted while exposures exist and relayed to the child.
pub const FORWARDED_SIGNALS: [i32; 6] = [SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2];

#[derive(Debug, Default)]
struct ForwardTarget {
    child: Option<Pid>,
}

/// Intercepts termination signals so teardown always runs.
///
/// Before a child is attached the last signal is remembered; afterwards each
/// signal is relayed to the child. The pending signal is recorded inside the
/// handler itself, so it is visible as soon as the signal has been delivered.
pub struct SignalForwarder {
    handle: Handle,
    target: Arc<Mutex<ForwardTarget>>,
    pending: Arc<AtomicUsize>,
    flag_ids: Vec<SigId>,
    thread: Option<JoinHandle<()>>,
}

impl SignalForwarder {
    /// Installs handlers for [`FORWARDED_SIGNALS`].
    pub fn install() -> io::Result<Self> {
        let pending = Arc::new(AtomicUsize::new(0));
        let mut flag_ids = Vec::with_capacity(FORWARDED_SIGNALS.len());
        for signal in FORWARDED_SIGNALS {
            match flag::register_usize(signal, Arc::clone(&pending), signal as usize) {
                Ok(id) => flag_ids.push(id),
                Err(error) => {
                    unregister_all(&flag_ids);
                    return Err(error);
                }
            }
        }

        let installed = Signals::new(FORWARDED_SIGNALS).and_then(|mut signals| {
            let handle = signals.handle();
            let target = Arc::new(Mutex::new(ForwardTarget::default()));
            let thread_target = Arc::clone(&target);
            let thread_pending = Arc::clone(&pending);
            let thread = thread::Builder::new()
                .name("credible-signals".to_owned())
                .spawn(move || {
                    for signal in signals.forever() {
                        deliver(&thread_target, &thread_pending, signal);
                    }
                })?;
            Ok((handle, target, thread))
        });
        let (handle, target, thread) = match installed {
            Ok(parts) => parts,
            Err(error) => {
                unregister_all(&flag_ids);
                return Err(error);
            }
        };

        Ok(Self {
            handle,
            target,
            pending,
            flag_ids,
            thread: Some(thread),
        })
    }

    /// Signal received while no child was attached.
    pub fn pending_signal(&self) -> Option<i32> {
        match self.pending.load(Ordering::SeqCst) {
            0 => None,
            signal => i32::try_from(signal).ok(),
        }
    }

    /// Starts relaying signals to `pid`, first delivering any pending one.
    pub fn attach(&self, pid: u32) {
        let mut target = self.lock();
        let pid = Pid::from_raw(pid as i32);
        target.child = Some(pid);
        if let Some(signal) = self.take_pending() {
            relay(pid, signal);
        }
    }

    /// Stops relaying; later signals are remembered as pending again.
    pub fn detach(&self) {
        self.lock().child = None;
    }

    fn take_pending(&self) -> Option<i32> {
        match self.pending.swap(0, Ordering::SeqCst) {
            0 => None,
            signal => i32::try_from(signal).ok(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ForwardTarget> {
        self.target.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SignalForwarder {
    fn drop(&mut self) {
        unregister_all(&self.flag_ids);
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn unregister_all(ids: &[SigId]) {
    for id in ids {
        low_level::unregister(*id);
    }
}

fn deliver(target: &Mutex<ForwardTarget>, pending: &AtomicUsize, signal: i32) {
    let target = target.lock().unwrap_or_else(PoisonError::into_inner);
    match target.child {
        Some(pid) => {
            pending.store(0, Ordering::SeqCst);
            relay(pid, signal);
        }
        None => tracing::warn!(signal, "signal received before command start"),
    }
}

fn relay(pid: Pid, signal: i32) {
    let Ok(signal) = Signal::try_from(signal) else {
        return;
    };
    tracing::debug!(%pid, ?signal, "forwarding signal to command");
    if let Err(error) = kill(pid, signal) {
        tracing::warn!(%pid, ?signal, %error, "failed to forward signal");
    }
}

#[cfg(test)]
mod tests {
    use nix::sys::signal::{raise, Signal};

    use super::SignalForwarder;

    #[test]
    fn signal_before_attach_is_pending() {
        let forwarder = SignalForwarder::install().unwrap();
        assert_eq!(forwarder.pending_signal(), None);

        raise(Signal::SIGUSR2).unwrap();

        assert_eq!(forwarder.pending_signal(), Some(Signal::SIGUSR2 as i32));
    }
}
