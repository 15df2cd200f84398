//! A single application-defined gauge, surfaced over plain HTTP routes and a Prometheus scrape
//! endpoint served by the same process.
//!
//! - [`gauge::Gauge`]: the gauge itself, a wrapper around the Prometheus `f64` gauge.
//! - [`router`]: maps the HTTP routes (`/`, `/get`, `/add`, `/remove`, `/set/{value}`) to gauge
//!   operations.
//! - [`server::ServerBuilder`]: a [hyper] server that mounts the router next to the scrape
//!   endpoint.
//!
//! # Example
//! ```rust,no_run
//! use custom_metrics::server::ServerBuilder;
//!
//! # async fn run() -> Result<(), custom_metrics::ServerError> {
//! let server = ServerBuilder::new().with_address("127.0.0.1:8080").bind().await?;
//! server.gauge().set(10);
//! server.serve().await
//! # }
//! ```

pub mod error;
pub use error::*;

pub mod gauge;
pub use gauge::*;

pub mod router;

pub mod server;

#[cfg(feature = "process")]
pub mod process;

/// Sealed trait to prevent outside code from implementing the value conversions.
mod private {
    pub trait Sealed {}

    impl Sealed for f64 {}
    impl Sealed for f32 {}
    impl Sealed for i64 {}
    impl Sealed for i32 {}
    impl Sealed for u32 {}
    impl Sealed for usize {}
}

/// Internal conversion trait to allow ergonomic value passing (e.g., `i64`, `usize`).
/// This enables callers to write `.set(queue.len())` or `.set(5)` without manual casts.
pub trait IntoGaugeValue: private::Sealed {
    fn into_gauge_value(self) -> f64;
}

/// Macro to implement [`IntoGaugeValue`] for a numeric type `In`.
macro_rules! impl_into_gauge_value {
    ($($in_ty:ty),* $(,)?) => {
        $(
            impl $crate::IntoGaugeValue for $in_ty {
                #[inline]
                fn into_gauge_value(self) -> f64 {
                    self as f64
                }
            }
        )*
    };
}

impl_into_gauge_value!(f64, f32, i64, i32, u32, usize);
