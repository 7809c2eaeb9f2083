//! LTE/PBB HTTP engine (spec.md §4.8): session-scoped REST upload and
//! download with background-job polling.

use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;

use crate::engines::{Engine, ProgressCallback, RadioIdentification};
use crate::model::ParsedCodeplug;

const JOB_POLL_INTERVAL: Duration = Duration::from_millis(500);
const JOB_POLL_TIMEOUT: Duration = Duration::from_secs(120);

/// Fixed path set the radio's REST surface exposes (spec.md §4.8). Only
/// a subset drives read/write/auth here; the rest are named for
/// completeness since the engine's `base_url` + path scheme covers them
/// identically if a future operation needs one.
pub mod paths {
    pub const PASSWORD: &str = "/password";
    pub const DEVICE_INVENTORY: &str = "/deviceInventory";
    pub const APP_INVENTORY: &str = "/appInventory";
    pub const LICENSE_INVENTORY: &str = "/licenseInventory";
    pub const FILE_COLLECTION: &str = "/fileCollection";
    pub const TERMINATE_SESSION: &str = "/terminateSession";
    pub const FACTORY_RESET: &str = "/factoryReset";
    pub const JOB: &str = "/job";
    pub const LMR_CODEPLUG: &str = "/lmrCodeplug";
}

#[derive(Error, Debug)]
pub enum LteError {
    #[error("connection error: {0}")]
    ConnectionFailed(String),
    #[error("operation timed out")]
    Timeout,
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("unauthorized")]
    Unauthorized,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("service unavailable")]
    ServiceUnavailable,
    #[error("server error: {0}")]
    ServerError(String),
    #[error("background job failed: {0}")]
    JobFailed(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for LteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return LteError::Timeout;
        }
        match e.status().map(|s| s.as_u16()) {
            Some(401) => LteError::AuthenticationFailed,
            Some(403) => LteError::Unauthorized,
            Some(404) => LteError::NotFound(e.to_string()),
            Some(400) => LteError::BadRequest(e.to_string()),
            Some(503) => LteError::ServiceUnavailable,
            Some(code) if code >= 500 => LteError::ServerError(e.to_string()),
            _ => LteError::ConnectionFailed(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct PasswordRequest<'a> {
    password: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceInventory {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default)]
    pub firmware: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct TerminateSessionRequest {
    #[serde(rename = "sessionID")]
    session_id: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobStatus {
    #[serde(default, rename = "jobID")]
    pub job_id: Option<u64>,
    pub status: String,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Terminal verdict a poll reaches, or `None` to keep polling (a pure
/// decision function so it's testable without a live job endpoint).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JobPollOutcome {
    Continue,
    Success,
    Failed,
    TimedOut,
}

pub fn decide_job_poll(status: &JobStatus, elapsed: Duration) -> JobPollOutcome {
    match status.status.as_str() {
        "complete" | "completed" => JobPollOutcome::Success,
        "failed" | "error" => JobPollOutcome::Failed,
        _ if elapsed >= JOB_POLL_TIMEOUT => JobPollOutcome::TimedOut,
        _ => JobPollOutcome::Continue,
    }
}

/// Operation kind scoping a session (spec.md §3 "LTE session").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LteOperation {
    Read,
    Write,
    Update,
}

pub struct LteEngine {
    client: reqwest::Client,
    base_url: String,
    session_id: Option<u16>,
}

impl LteEngine {
    pub fn new(base_url: impl Into<String>) -> Self {
        LteEngine {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            session_id: None,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn fresh_session_id() -> u16 {
        loop {
            let id: u16 = rand::random();
            if id != 0 && id != 0xFFFF {
                return id;
            }
        }
    }

    pub async fn authenticate(&mut self, password: &str) -> Result<DeviceInventory, LteError> {
        let response = self
            .client
            .post(self.url(paths::PASSWORD))
            .json(&PasswordRequest { password })
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<DeviceInventory>().await?)
    }

    async fn open_session(&mut self, _operation: LteOperation) -> u16 {
        let session_id = Self::fresh_session_id();
        self.session_id = Some(session_id);
        session_id
    }

    /// Always POSTs `/terminateSession`, on both success and failure paths
    /// (spec.md §4.8 "Session termination").
    async fn terminate_session(&mut self) {
        if let Some(session_id) = self.session_id.take() {
            let result = self
                .client
                .post(self.url(paths::TERMINATE_SESSION))
                .json(&TerminateSessionRequest { session_id })
                .send()
                .await;
            if let Err(e) = result {
                warn!("terminateSession request failed: {e}");
            }
        }
    }

    async fn read_codeplug_bytes(&mut self) -> Result<Vec<u8>, LteError> {
        self.open_session(LteOperation::Read).await;
        let result = self.fetch_codeplug_bytes().await;
        self.terminate_session().await;
        result
    }

    async fn fetch_codeplug_bytes(&mut self) -> Result<Vec<u8>, LteError> {
        let primary = self.client.get(self.url(paths::LMR_CODEPLUG)).send().await?;
        if primary.status() == reqwest::StatusCode::NOT_FOUND {
            info!("/lmrCodeplug absent, falling back to /fileCollection");
            let fallback = self
                .client
                .get(self.url(&format!("{}?fileName=codeplug.manifest", paths::FILE_COLLECTION)))
                .send()
                .await?
                .error_for_status()?;
            return Ok(fallback.bytes().await?.to_vec());
        }
        Ok(primary.error_for_status()?.bytes().await?.to_vec())
    }

    async fn write_codeplug_bytes(
        &mut self,
        bytes: &[u8],
        progress: &mut ProgressCallback<'_>,
    ) -> Result<(), LteError> {
        self.open_session(LteOperation::Write).await;
        let result = self.upload_and_poll(bytes, progress).await;
        self.terminate_session().await;
        result
    }

    async fn upload_and_poll(
        &mut self,
        bytes: &[u8],
        progress: &mut ProgressCallback<'_>,
    ) -> Result<(), LteError> {
        let response = self
            .client
            .post(self.url(paths::LMR_CODEPLUG))
            .header("Content-Type", "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await?
            .error_for_status()?;

        let Ok(job) = response.json::<JobStatus>().await else {
            progress(1.0);
            return Ok(());
        };

        let Some(job_id) = job.job_id else {
            // No background job was created; the upload completed inline.
            progress(1.0);
            return Ok(());
        };

        let mut status = job;
        let mut elapsed = Duration::ZERO;
        loop {
            match decide_job_poll(&status, elapsed) {
                JobPollOutcome::Success => {
                    progress(1.0);
                    return Ok(());
                }
                JobPollOutcome::Failed => {
                    return Err(LteError::JobFailed(
                        status.message.unwrap_or_else(|| "job reported failure".into()),
                    ));
                }
                JobPollOutcome::TimedOut => return Err(LteError::Timeout),
                JobPollOutcome::Continue => {
                    progress(status.progress.unwrap_or(0.0).clamp(0.0, 0.99));
                    sleep(JOB_POLL_INTERVAL).await;
                    elapsed += JOB_POLL_INTERVAL;
                    status = self
                        .client
                        .get(self.url(&format!("{}?jobID={job_id}", paths::JOB)))
                        .send()
                        .await?
                        .error_for_status()?
                        .json::<JobStatus>()
                        .await?;
                }
            }
        }
    }
}

impl Engine for LteEngine {
    /// Probes `/deviceInventory` (spec.md §4.8) so a host that isn't an
    /// LTE/PBB device fails here instead of being misidentified; the
    /// dispatcher relies on this to fall through to TETRA.
    async fn identify(&mut self) -> Result<RadioIdentification, crate::error::CoreError> {
        let response = self
            .client
            .get(self.url(paths::DEVICE_INVENTORY))
            .send()
            .await
            .map_err(LteError::from)?
            .error_for_status()
            .map_err(LteError::from)?;
        let inventory: DeviceInventory = response.json().await.map_err(|e| {
            LteError::InvalidResponse(format!("/deviceInventory did not return a device inventory: {e}"))
        })?;
        Ok(RadioIdentification {
            family: "lte".to_string(),
            model: inventory.model,
            serial: inventory.serial,
            firmware: inventory.firmware,
            codeplug_version: None,
        })
    }

    async fn read_codeplug(
        &mut self,
        progress: &mut ProgressCallback<'_>,
    ) -> Result<ParsedCodeplug, crate::error::CoreError> {
        let bytes = self.read_codeplug_bytes().await?;
        progress(1.0);
        let mut codeplug = ParsedCodeplug::default();
        codeplug.unparsed_records.push((0, bytes));
        Ok(codeplug)
    }

    async fn write_codeplug(
        &mut self,
        codeplug: &ParsedCodeplug,
        progress: &mut ProgressCallback<'_>,
    ) -> Result<(), crate::error::CoreError> {
        let bytes: Vec<u8> = codeplug
            .unparsed_records
            .iter()
            .flat_map(|(_, data)| data.clone())
            .collect();
        self.write_codeplug_bytes(&bytes, progress).await?;
        Ok(())
    }

    async fn verify(
        &mut self,
        expected: &ParsedCodeplug,
        progress: &mut ProgressCallback<'_>,
    ) -> Result<bool, crate::error::CoreError> {
        let actual = self.read_codeplug(progress).await?;
        Ok(actual.unparsed_records == expected.unparsed_records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_then_running_then_complete_produces_monotonic_progress() {
        let statuses = [
            JobStatus { job_id: Some(7), status: "running".into(), progress: Some(0.5), message: None },
            JobStatus { job_id: Some(7), status: "running".into(), progress: Some(0.5), message: None },
            JobStatus { job_id: Some(7), status: "complete".into(), progress: None, message: None },
        ];
        let outcomes: Vec<JobPollOutcome> = statuses
            .iter()
            .map(|s| decide_job_poll(s, Duration::from_secs(1)))
            .collect();
        assert_eq!(
            outcomes,
            vec![JobPollOutcome::Continue, JobPollOutcome::Continue, JobPollOutcome::Success]
        );
    }

    #[test]
    fn failed_and_error_statuses_are_terminal_failures() {
        let failed = JobStatus { job_id: Some(1), status: "failed".into(), progress: None, message: Some("x".into()) };
        let error = JobStatus { job_id: Some(1), status: "error".into(), progress: None, message: None };
        assert_eq!(decide_job_poll(&failed, Duration::ZERO), JobPollOutcome::Failed);
        assert_eq!(decide_job_poll(&error, Duration::ZERO), JobPollOutcome::Failed);
    }

    #[test]
    fn exceeding_the_time_budget_times_out_even_while_running() {
        let running = JobStatus { job_id: Some(1), status: "running".into(), progress: Some(0.1), message: None };
        assert_eq!(
            decide_job_poll(&running, JOB_POLL_TIMEOUT + Duration::from_secs(1)),
            JobPollOutcome::TimedOut
        );
    }
}
