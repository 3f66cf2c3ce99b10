mod error;
mod metric;
mod retry;
mod state;

pub use error::{ListenerError, ListenerResult};
pub use metric::{Accumulator, FieldValue, Metric};
pub use retry::{build_exponential_backoff, RetryPolicy};
pub use state::ConnectionState;
