pub mod admin;
pub mod audit;
pub mod config;
pub mod error;
pub mod gate;
pub mod identity;
pub mod permissions;
pub mod reconcile;
pub mod server;
pub mod storage;

// Test-only printing helper: expands to eprintln! during tests/debug builds
// and is absent otherwise. Usage: tprintln!("debug: {}", value);
#[cfg(any(test, debug_assertions))]
#[macro_export]
macro_rules! tprintln {
    ($($arg:tt)*) => ( eprintln!($($arg)*) );
}

// In non-test builds, provide a no-op tprintln! so calls compile without effect.
#[cfg(not(any(test, debug_assertions)))]
#[macro_export]
macro_rules! tprintln {
    ($($arg:tt)*) => ({
        // Preserve formatting checks in release without producing code
        if false { let _ = format!($($arg)*); }
    });
}
