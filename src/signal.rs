//! Signal shim (C8): arms the fatal signals on an alternate stack, captures
//! the `ucontext_t` a crash interrupted, and drives the handler — once. A
//! second fault while the handler itself is running re-raises with the
//! default disposition instead of recursing into a second unwind.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::handler::Handler;

/// Set the first time a fatal handler runs; never cleared (§5 — re-entrancy
/// is terminal, not retried).
static REENTERED: AtomicBool = AtomicBool::new(false);

const SIGNALS: [libc::c_int; 4] = [libc::SIGSEGV, libc::SIGABRT, libc::SIGBUS, libc::SIGFPE];

const ALTSTACK_SIZE: usize = 1 << 20;

/// Installs the fatal-signal handlers on a dedicated alternate signal stack,
/// so a stack-overflow fault can still be serviced.
///
/// # Safety
/// Must be called once, early, before any other thread can fault; installs
/// process-wide signal dispositions and an alternate stack for this thread.
pub unsafe fn install_handlers() {
    install_altstack();
    for &sig in &SIGNALS {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_signal as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(sig, &action, std::ptr::null_mut());
    }
}

/// Restores the default disposition for every signal [`install_handlers`] armed.
///
/// # Safety
/// Process-wide; same caveats as [`install_handlers`].
pub unsafe fn restore_handlers() {
    for &sig in &SIGNALS {
        libc::signal(sig, libc::SIG_DFL);
    }
}

unsafe fn install_altstack() {
    let stack = vec![0u8; ALTSTACK_SIZE].into_boxed_slice();
    let ptr = Box::leak(stack).as_mut_ptr();
    let ss = libc::stack_t { ss_sp: ptr.cast(), ss_flags: 0, ss_size: ALTSTACK_SIZE };
    libc::sigaltstack(&ss, std::ptr::null_mut());
}

extern "C" fn handle_signal(sig: libc::c_int, _info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    if REENTERED.swap(true, Ordering::SeqCst) {
        reraise_default(sig);
        return;
    }

    // SAFETY: `ctx` is the `ucontext_t*` an `SA_SIGINFO` handler receives.
    let handler = unsafe { Handler::new(ctx as *const libc::ucontext_t) };
    if handler.unwind_pretty().is_err() {
        crate::render::write_no_trace_obtained();
    }

    reraise_default(sig);
}

fn reraise_default(sig: libc::c_int) {
    // SAFETY: resets the disposition to default then re-raises; the process
    // terminates (or a debugger catches it) from here, never returning.
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}
