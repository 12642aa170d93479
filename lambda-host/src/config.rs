//! Process configuration: function metadata read from the environment, and
//! the tunable [`HostOptions`] that govern timeouts and buffers.

use std::{env, time::Duration};

use crate::error::HostError;

/// Function metadata exposed by the Lambda execution environment, mirroring
/// the variables documented for the Custom Runtime API.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// The name of the function.
    pub function_name: String,
    /// The amount of memory available to the function in MB.
    pub memory: i32,
    /// The version of the function being executed.
    pub version: String,
    /// The name of the Amazon CloudWatch Logs stream for the function.
    pub log_stream: String,
    /// The name of the Amazon CloudWatch Logs group for the function.
    pub log_group: String,
    /// The AWS region the function is running in, if available.
    pub region: Option<String>,
    /// The path to the function's deployment package, if available.
    pub task_root: Option<String>,
}

impl Config {
    /// Attempts to read configuration from environment variables.
    pub fn from_env() -> Result<Self, HostError> {
        let conf = Config {
            function_name: env::var("AWS_LAMBDA_FUNCTION_NAME")
                .map_err(|_| HostError::Config("missing AWS_LAMBDA_FUNCTION_NAME".into()))?,
            memory: env::var("AWS_LAMBDA_FUNCTION_MEMORY_SIZE")
                .map_err(|_| HostError::Config("missing AWS_LAMBDA_FUNCTION_MEMORY_SIZE".into()))?
                .parse::<i32>()
                .map_err(|e| HostError::Config(format!("invalid AWS_LAMBDA_FUNCTION_MEMORY_SIZE: {e}")))?,
            version: env::var("AWS_LAMBDA_FUNCTION_VERSION")
                .map_err(|_| HostError::Config("missing AWS_LAMBDA_FUNCTION_VERSION".into()))?,
            log_stream: env::var("AWS_LAMBDA_LOG_STREAM_NAME").unwrap_or_default(),
            log_group: env::var("AWS_LAMBDA_LOG_GROUP_NAME").unwrap_or_default(),
            region: env::var("AWS_REGION").or_else(|_| env::var("AWS_DEFAULT_REGION")).ok(),
            task_root: env::var("LAMBDA_TASK_ROOT").ok(),
        };
        Ok(conf)
    }
}

/// Tunable timeouts and buffers governing the lifecycle orchestrator.
///
/// Defaults match the values this implementation settles on for the open
/// questions in its design notes: a five second init timeout, and small
/// buffers that keep internal deadlines strictly ahead of the orchestrator's
/// own deadlines.
#[derive(Debug)]
pub struct HostOptions {
    /// Upper bound on the whole init phase.
    pub init_timeout: Duration,
    /// Subtracted from an invocation's remaining time to derive the point at
    /// which its cancellation handle fires.
    pub invocation_cancellation_buffer: Duration,
    /// The orchestrator-granted SIGTERM-to-SIGKILL window.
    pub shutdown_duration: Duration,
    /// Subtracted from `shutdown_duration` to leave headroom for posting
    /// results and releasing resources.
    pub shutdown_duration_buffer: Duration,
    /// Base URI of the orchestrator's Runtime API. `None` falls back to the
    /// `AWS_LAMBDA_RUNTIME_API` environment variable at client construction.
    pub runtime_api_endpoint: Option<String>,
    /// Strips ANSI escape sequences from diagnostic messages before they are
    /// posted to `/error` or `/init/error`, for orchestrators that render
    /// `errorMessage` somewhere that does not interpret terminal formatting.
    pub clear_output_formatting: bool,
    /// A pre-built transport client to use instead of the one
    /// [`crate::run_with_options`] would otherwise construct from
    /// [`HostOptions::runtime_api_endpoint`]. Consumed at construction time;
    /// cloning a `HostOptions` drops this field rather than duplicating the
    /// connection.
    pub transport_client_override: Option<lambda_host_api_client::Client>,
    /// Whether [`crate::run_with_options`] installs a default `tracing`
    /// subscriber (via [`lambda_host_api_client::tracing::init_default_subscriber`])
    /// before starting the orchestrator. Disable this when the embedding
    /// process already installs its own subscriber.
    pub install_default_subscriber: bool,
}

impl Clone for HostOptions {
    fn clone(&self) -> Self {
        Self {
            init_timeout: self.init_timeout,
            invocation_cancellation_buffer: self.invocation_cancellation_buffer,
            shutdown_duration: self.shutdown_duration,
            shutdown_duration_buffer: self.shutdown_duration_buffer,
            runtime_api_endpoint: self.runtime_api_endpoint.clone(),
            clear_output_formatting: self.clear_output_formatting,
            transport_client_override: None,
            install_default_subscriber: self.install_default_subscriber,
        }
    }
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(5),
            invocation_cancellation_buffer: Duration::from_secs(3),
            shutdown_duration: Duration::from_millis(500),
            shutdown_duration_buffer: Duration::from_millis(50),
            runtime_api_endpoint: None,
            clear_output_formatting: false,
            transport_client_override: None,
            install_default_subscriber: true,
        }
    }
}

impl HostOptions {
    /// Validates option combinations that would otherwise surface as
    /// confusing failures much later (a negative or zero effective shutdown
    /// budget, for instance).
    pub fn validate(&self) -> Result<(), HostError> {
        if self.shutdown_duration_buffer >= self.shutdown_duration {
            return Err(HostError::Config(
                "shutdown_duration_buffer must be smaller than shutdown_duration".into(),
            ));
        }
        Ok(())
    }

    /// The effective time budget available to shutdown delegates.
    pub fn shutdown_budget(&self) -> Duration {
        self.shutdown_duration.saturating_sub(self.shutdown_duration_buffer)
    }
}

/// Removes `ESC [ ... letter` CSI sequences (the common case for color and
/// style codes) from `input`, leaving other text untouched.
pub(crate) fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' && chars.peek() == Some(&'[') {
            chars.next();
            for next in chars.by_ref() {
                if next.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_ansi_removes_color_codes() {
        assert_eq!(strip_ansi("\u{1b}[31mred\u{1b}[0m"), "red");
    }

    #[test]
    fn strip_ansi_is_a_no_op_on_plain_text() {
        assert_eq!(strip_ansi("plain text"), "plain text");
    }
}
