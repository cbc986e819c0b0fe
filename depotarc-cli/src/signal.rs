use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

static CANCEL: OnceLock<Arc<AtomicBool>> = OnceLock::new();

/// Route the first SIGINT/SIGTERM into the returned flag; a second one kills
/// the process with the default handler.
pub fn install() -> Arc<AtomicBool> {
    let flag = Arc::clone(CANCEL.get_or_init(|| Arc::new(AtomicBool::new(false))));
    #[cfg(unix)]
    {
        // Safety: the handler only stores to an atomic and resets the disposition.
        unsafe {
            libc::signal(libc::SIGINT, on_signal as *const () as libc::sighandler_t);
            libc::signal(libc::SIGTERM, on_signal as *const () as libc::sighandler_t);
        }
    }
    flag
}

pub fn interrupted() -> bool {
    CANCEL.get().is_some_and(|f| f.load(Ordering::SeqCst))
}

#[cfg(unix)]
extern "C" fn on_signal(sig: libc::c_int) {
    if let Some(f) = CANCEL.get() {
        f.store(true, Ordering::SeqCst);
    }
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
    }
}
