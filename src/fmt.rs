#![macro_use]
#![allow(unused_macros)]

//! Logging shims. Messages go to `defmt` with `defmt-03`, to `log` with `log`, and nowhere otherwise.

macro_rules! log_impl {
    ($level:ident, $s:literal $(, $x:expr)* $(,)?) => {
        {
            #[cfg(feature = "defmt-03")]
            ::defmt::$level!($s $(, $x)*);
            #[cfg(all(feature = "log", not(feature = "defmt-03")))]
            ::log::$level!($s $(, $x)*);
            #[cfg(not(any(feature = "log", feature = "defmt-03")))]
            let _ = ($( & $x ),*);
        }
    };
}

macro_rules! trace {
    ($($arg:tt)*) => { log_impl!(trace, $($arg)*) };
}

macro_rules! debug {
    ($($arg:tt)*) => { log_impl!(debug, $($arg)*) };
}

macro_rules! info {
    ($($arg:tt)*) => { log_impl!(info, $($arg)*) };
}

macro_rules! warn {
    ($($arg:tt)*) => { log_impl!(warn, $($arg)*) };
}

macro_rules! error {
    ($($arg:tt)*) => { log_impl!(error, $($arg)*) };
}
