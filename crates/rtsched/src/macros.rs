//! Internal logging helpers.

/// Emit a `tracing::warn!` event only the first time this call site is reached.
///
/// Repeats are tracked by the invariant counters instead.
macro_rules! warn_once {
    ($($arg:tt)+) => {{
        static WARNED: ::std::sync::atomic::AtomicBool = ::std::sync::atomic::AtomicBool::new(false);
        if !WARNED.swap(true, ::std::sync::atomic::Ordering::Relaxed) {
            ::tracing::warn!($($arg)+);
        }
    }};
}

pub(crate) use warn_once;
