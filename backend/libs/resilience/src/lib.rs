/// Resilience patterns for the projection pipeline
///
/// - **Retry**: bounded exponential backoff with jitter for transient failures
/// - **Timeout**: time limits on every external call, so a hung dependency
///   surfaces as a failure instead of blocking forever
/// - **Presets**: tuned settings for the index store, the notification sink,
///   the enrichment provider and the change-event source
///
/// # Example: index write with timeout and retry
///
/// ```rust,no_run
/// use resilience::{presets, with_retry, with_timeout};
///
/// #[tokio::main]
/// async fn main() {
///     let config = presets::index_store_config();
///     let timeout = config.timeout.duration;
///
///     let result = with_retry(config.retry, || async move {
///         match with_timeout(timeout, async {
///             // bulk request here
///             Ok::<_, String>(())
///         })
///         .await
///         {
///             Ok(written) => written,
///             Err(elapsed) => Err(elapsed.to_string()),
///         }
///     })
///     .await;
/// }
/// ```

pub mod presets;
pub mod retry;
pub mod timeout;

pub use presets::{
    enrichment_config, index_store_config, notification_sink_config, source_config,
    ServiceConfig,
};
pub use retry::{with_retry, with_retry_if, RetryConfig, RetryError};
pub use timeout::{with_timeout, TimeoutConfig, TimeoutError};
