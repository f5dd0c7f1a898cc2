//! Provider subprocess bridge.
//!
//! Talks to an external provider binary (e.g. `calsync-provider-google`) using one
//! line of JSON over stdin/stdout per call. The binary owns the actual API client;
//! this side only forwards credentials and decodes typed results and errors.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::AsyncWriteExt;
use tokio::process::Command as TokioCommand;
use tokio::time::timeout;
use tracing::debug;

use crate::remote::protocol::{Command, FetchEvents, ListCalendars, ProviderCommand, Request, Response};
use crate::remote::{
    CalendarProvider, Credential, FetchedEvents, ProviderCalendar, ProviderError, ProviderErrorKind,
};

const BINARY_PREFIX: &str = "calsync-provider-";

#[derive(Clone, Debug)]
pub struct SubprocessProvider {
    name: String,
    timeout: Duration,
}

impl SubprocessProvider {
    pub fn new(name: &str, timeout: Duration) -> Self {
        SubprocessProvider {
            name: name.to_string(),
            timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn binary_path(&self) -> Result<PathBuf, ProviderError> {
        let binary_name = format!("{BINARY_PREFIX}{}", self.name);
        which::which(&binary_name).map_err(|_| {
            ProviderError::new(
                ProviderErrorKind::ClientError,
                format!("Provider '{}' not found in PATH (expected `{}`)", self.name, binary_name),
            )
        })
    }

    /// Call a typed provider command, bounded by the configured timeout.
    pub async fn call<C: ProviderCommand>(&self, cmd: C) -> Result<C::Response, ProviderError> {
        timeout(self.timeout, self.call_raw(C::command(), cmd))
            .await
            .map_err(|_| {
                ProviderError::new(
                    ProviderErrorKind::Network,
                    format!("Provider request timed out after {}s", self.timeout.as_secs()),
                )
            })?
    }

    async fn call_raw<P: Serialize, R: DeserializeOwned>(
        &self,
        command: Command,
        params: P,
    ) -> Result<R, ProviderError> {
        let params = serde_json::to_value(params).map_err(protocol_error)?;
        let request = Request { command, params };
        let request_json = serde_json::to_string(&request).map_err(protocol_error)?;

        let binary_path = self.binary_path()?;
        debug!(provider = %self.name, ?command, "calling provider");

        let mut child = TokioCommand::new(&binary_path)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProviderError::new(
                    ProviderErrorKind::ClientError,
                    format!("Failed to spawn {}: {}", binary_path.display(), e),
                )
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| io_error("provider stdin was not captured"))?;
        stdin
            .write_all(format!("{request_json}\n").as_bytes())
            .await
            .map_err(|e| io_error(&e.to_string()))?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| io_error(&e.to_string()))?;

        let response_str = String::from_utf8_lossy(&output.stdout);
        let line = response_str.lines().find(|l| !l.trim().is_empty());

        let Some(line) = line else {
            return Err(io_error(&format!(
                "Provider returned no response (exit status {})",
                output.status.code().unwrap_or(-1)
            )));
        };

        let response: Response<R> = serde_json::from_str(line).map_err(protocol_error)?;

        match response {
            Response::Success { data } => Ok(data),
            Response::Error { error } => Err(error),
        }
    }
}

fn protocol_error(e: serde_json::Error) -> ProviderError {
    ProviderError::new(
        ProviderErrorKind::ClientError,
        format!("Invalid provider protocol message: {e}"),
    )
}

fn io_error(message: &str) -> ProviderError {
    ProviderError::new(ProviderErrorKind::Network, message)
}

#[async_trait]
impl CalendarProvider for SubprocessProvider {
    async fn fetch_events(
        &self,
        credential: &Credential,
        calendar_id: &str,
        sync_token: Option<&str>,
    ) -> Result<FetchedEvents, ProviderError> {
        self.call(FetchEvents {
            credential: credential.expose().to_string(),
            calendar_id: calendar_id.to_string(),
            sync_token: sync_token.map(str::to_string),
        })
        .await
    }

    async fn list_calendars(
        &self,
        credential: &Credential,
    ) -> Result<Vec<ProviderCalendar>, ProviderError> {
        self.call(ListCalendars {
            credential: credential.expose().to_string(),
        })
        .await
    }
}
