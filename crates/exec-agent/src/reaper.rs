use std::sync::atomic::{AtomicBool, Ordering};

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install a SIGCHLD handler that reaps terminated children, so a
/// child that outlives its supervisor's bounded wait never lingers as
/// a zombie. Installed once per process.
pub(crate) fn install() {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_sigchld as *const () as usize;
        action.sa_flags = libc::SA_RESTART | libc::SA_NOCLDSTOP;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(libc::SIGCHLD, &action, std::ptr::null_mut()) != 0 {
            INSTALLED.store(false, Ordering::SeqCst);
            tracing::warn!("failed to install SIGCHLD reaper");
        }
    }
}

/// Only calls waitpid, which is async-signal-safe.
extern "C" fn handle_sigchld(_sig: libc::c_int) {
    loop {
        let reaped = unsafe { libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) };
        if reaped <= 0 {
            break;
        }
    }
}
