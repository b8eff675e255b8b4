//! Logging macros.

/// Evaluates the expression bracketed by trace messages, the closing one
/// carrying the elapsed wall time.
#[macro_export]
macro_rules! with_trace_logging {
    ($message:expr $(,$arg:expr)*; $expression:expr) => {{
        $crate::trace!(concat!("Begin: ", $message)$(,$arg)*);
        let _start = ::std::time::Instant::now();
        let _result = $expression;
        $crate::trace!(
            concat!("({:.2} ms) Done: ", $message),
            _start.elapsed().as_secs_f64() * 1e3
            $(,$arg)*
        );
        _result
    }};
}
