//! Controller configuration and the command line of the `kubermatic-sync` binary.

use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use clap::ValueEnum;

use crate::error::Error;

pub const DEFAULT_NAMESPACE: &str = "kubermatic";

/// Per-item retry delays for failed reconciles.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay before the `failures`-th retry: `initial * multiplier^(failures - 1)`, capped at
    /// `max_delay`.
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = i32::try_from(failures.saturating_sub(1)).unwrap_or(i32::MAX);
        let seconds = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !seconds.is_finite() || seconds >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(seconds)
        }
    }
}

/// Immutable settings shared by every controller of one process.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerOptions {
    /// Only objects labeled `worker-name=<worker_name>` are reconciled; an empty name selects
    /// objects without the label.
    pub worker_name: String,
    pub max_concurrent_reconciles: usize,
    /// Poll interval while a dependency (a namespace, a datacenter) does not exist yet.
    pub dependency_requeue: Duration,
    pub backoff: BackoffConfig,
    /// Namespace of the KKP installation on master and seeds.
    pub namespace: String,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            worker_name: String::new(),
            max_concurrent_reconciles: 1,
            dependency_requeue: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
            namespace: DEFAULT_NAMESPACE.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// A seed name and the kubeconfig context that reaches it, given as `name=context`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedContext {
    pub name: String,
    pub context: String,
}

impl FromStr for SeedContext {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((name, context)) if !name.is_empty() && !context.is_empty() => Ok(Self {
                name: name.to_owned(),
                context: context.to_owned(),
            }),
            _ => Err(Error::UserInput(format!("Expected seed as 'name=context', got '{s}'"))),
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "kubermatic-sync", about = "Synchronizes KKP resources between master, seeds and user clusters")]
pub struct Options {
    /// Only reconcile objects carrying this worker-name label
    #[arg(long, env = "WORKER_NAME", default_value = "")]
    pub worker_name: String,

    /// Concurrent reconciles per controller
    #[arg(long, env = "WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Namespace of the KKP installation
    #[arg(long, env = "KUBERMATIC_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Kubeconfig context of the master cluster; the current context when omitted
    #[arg(long, env = "MASTER_CONTEXT")]
    pub master_context: Option<String>,

    /// Seed to synchronize as `name=context`, may be repeated
    #[arg(long = "seed-context", value_parser = clap::value_parser!(SeedContext))]
    pub seed_contexts: Vec<SeedContext>,

    #[arg(long, value_enum, env = "LOG_FORMAT", default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Options {
    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            worker_name: self.worker_name.clone(),
            max_concurrent_reconciles: self.workers.max(1),
            namespace: self.namespace.clone(),
            ..ControllerOptions::default()
        }
    }
}
