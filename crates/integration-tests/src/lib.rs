//! Integration test framework for strata.
//!
//! Tests run against an isolated store per test: a tempdir-backed
//! [`FsMetadataStore`](strata::FsMetadataStore) plus an in-memory tar
//! backend without the exact-diff capability, so the tar-split reassembly
//! path is the one under test. Tests register themselves through the
//! `integration_test!` macro using linkme distributed slices.

#![allow(unsafe_code)] // Required for linkme

use libtest_mimic::{Arguments, Trial};
use linkme::distributed_slice;

pub mod fixture;
mod tests;

/// A distributed slice of integration tests, populated by the
/// `integration_test!` macro.
#[distributed_slice]
pub static INTEGRATION_TESTS: [fn() -> Trial];

/// Run all registered integration tests.
pub fn run_tests() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Arguments::from_args();
    let tests: Vec<Trial> = INTEGRATION_TESTS.iter().map(|f| f()).collect();

    let conclusion = libtest_mimic::run(&args, tests);
    conclusion.exit();
}

/// Register an integration test function.
///
/// # Example
///
/// ```ignore
/// use integration_tests::{integration_test, fixture::TestStore};
///
/// integration_test!(test_register_layer, || {
///     let fix = TestStore::new()?;
///     // ... test code
///     Ok(())
/// });
/// ```
#[macro_export]
macro_rules! integration_test {
    ($name:ident, $body:expr) => {
        $crate::paste::paste! {
            #[$crate::linkme::distributed_slice($crate::INTEGRATION_TESTS)]
            #[linkme(crate = $crate::linkme)]
            fn [<__register_ $name>]() -> $crate::libtest_mimic::Trial {
                $crate::libtest_mimic::Trial::test(
                    stringify!($name),
                    move || {
                        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = $body();
                        result.map_err(|e| $crate::libtest_mimic::Failed::from(e.to_string()))
                    },
                )
            }
        }
    };
}

// Re-export for use in macro
pub use libtest_mimic;
pub use linkme;
pub use paste;
