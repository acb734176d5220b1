//! `error!`..`trace!` for crate-internal use.
//!
//! With the `tracing` feature each level forwards to the matching `tracing` macro under the
//! `eth_tail` target. Without it, calls expand to blocks that only borrow their field values.

#[cfg(feature = "tracing")]
#[allow(unused_macros)]
macro_rules! __emit {
    ($level:ident, $($arg:tt)*) => {
        tracing::$level!(target: "eth_tail", $($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
#[allow(unused_macros)]
macro_rules! __emit {
    ($level:ident, $($arg:tt)*) => {
        __discard!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
#[allow(unused_macros)]
macro_rules! __discard {
    () => {};
    ($message:literal $(, $arg:expr)* $(,)?) => {{
        $(let _ = &$arg;)*
    }};
    ($field:ident = % $value:expr $(, $($rest:tt)*)?) => {{
        let _ = &$value;
        $(__discard!($($rest)*);)?
    }};
    ($field:ident = ? $value:expr $(, $($rest:tt)*)?) => {{
        let _ = &$value;
        $(__discard!($($rest)*);)?
    }};
    ($field:ident = $value:expr $(, $($rest:tt)*)?) => {{
        let _ = &$value;
        $(__discard!($($rest)*);)?
    }};
}

#[allow(unused_macros)]
macro_rules! error {
    ($($arg:tt)*) => { __emit!(error, $($arg)*) };
}

#[allow(unused_macros)]
macro_rules! warn {
    ($($arg:tt)*) => { __emit!(warn, $($arg)*) };
}

#[allow(unused_macros)]
macro_rules! info {
    ($($arg:tt)*) => { __emit!(info, $($arg)*) };
}

#[allow(unused_macros)]
macro_rules! debug {
    ($($arg:tt)*) => { __emit!(debug, $($arg)*) };
}

#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => { __emit!(trace, $($arg)*) };
}
