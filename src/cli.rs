use std::{path::PathBuf, time::Duration};

use adaptive_import::{ExponentialBackoff, ImportSettings, RetryPolicy};
use clap::Parser;
use cosmos_client::CosmosClientConfig;

/// Longest single wait between two attempts of the same document.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Bulk upsert of a JSON-lines file into a document collection, as fast as the
/// collection's provisioned throughput allows.
///
/// The input starts with a line holding the number of documents, followed by one JSON
/// document per line.
#[derive(Parser, Debug)]
#[command(name = "cosmos-bulk-import", version)]
pub struct Cli {
    /// Account endpoint, e.g. https://myaccount.documents.azure.com:443/
    #[arg(long, env = "COSMOS_ENDPOINT")]
    pub endpoint: String,

    /// Base64 master key of the account.
    #[arg(long, env = "COSMOS_AUTH_KEY", hide_env_values = true)]
    pub auth_key: String,

    #[arg(long, env = "COSMOS_DATABASE")]
    pub database: String,

    #[arg(long, env = "COSMOS_COLLECTION")]
    pub collection: String,

    /// Input file: document count header, then one JSON document per line.
    #[arg(long, env = "COSMOS_FILE")]
    pub file: PathBuf,

    /// Partition key path of the collection, e.g. /tenant.
    #[arg(long, env = "COSMOS_PARTITION_KEY_PATH")]
    pub partition_key_path: Option<String>,

    /// Trailing window, in seconds, of the throttle ratio that gates new writes.
    #[arg(long, default_value_t = 1)]
    pub gate_window_secs: u64,

    /// Trailing window, in seconds, that must be free of throttling to add concurrency.
    #[arg(long, default_value_t = 1)]
    pub boost_window_secs: u64,

    /// Stop replacing completed writes while at least this share (percent) is throttled.
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u32).range(0..=100))]
    pub throttle_gate_percent: u32,

    /// Give up on a document after this many failed attempts. Unbounded when unset.
    #[arg(long)]
    pub max_attempts: Option<usize>,

    /// Wait before the first retry of a document, doubled on every further retry.
    #[arg(long)]
    pub retry_backoff_ms: Option<u64>,

    #[arg(long, default_value_t = 60)]
    pub request_timeout_secs: u64,

    /// Also write logs to this file.
    #[arg(long, env = "COSMOS_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Write the final summary as JSON to this file.
    #[arg(long)]
    pub summary_file: Option<PathBuf>,
}

impl Cli {
    pub fn import_settings(&self) -> ImportSettings {
        let retry = RetryPolicy::builder()
            .maybe_max_attempts(self.max_attempts)
            .maybe_backoff(
                self.retry_backoff_ms
                    .map(|ms| ExponentialBackoff::doubling(ms).max_delay(MAX_RETRY_DELAY)),
            )
            .build();

        ImportSettings::builder()
            .gate_window_secs(self.gate_window_secs)
            .boost_window_secs(self.boost_window_secs)
            .throttle_gate_percent(self.throttle_gate_percent)
            .retry(retry)
            .build()
    }

    pub fn client_config(&self) -> CosmosClientConfig {
        CosmosClientConfig::builder()
            .endpoint(self.endpoint.as_str())
            .master_key(self.auth_key.as_str())
            .database(self.database.as_str())
            .collection(self.collection.as_str())
            .maybe_partition_key_path(self.partition_key_path.clone())
            .request_timeout(Duration::from_secs(self.request_timeout_secs))
            .build()
    }
}
