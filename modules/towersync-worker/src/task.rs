// Client for the status callback: each job PATCHes its progress and final
// outcome back to the task endpoint named in the job descriptor.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde_json::json;
use tracing::{debug, error};

use towersync_models::RepoStats;

const X_RH_IDENTITY: &str = "x-rh-identity";
const X_RH_INSIGHTS_REQUEST_ID: &str = "x-rh-insights-request-id";

/// Headers propagated from the inbound bus message.
#[derive(Debug, Clone, Default)]
pub struct MessageHeaders {
    pub identity: Option<String>,
    pub request_id: Option<String>,
    pub event_type: Option<String>,
}

/// The `output` half of a completed-job payload.
#[derive(Debug)]
pub enum TaskOutput {
    Stats(BTreeMap<&'static str, RepoStats>),
    Errors(Vec<String>),
}

pub struct TaskUpdater {
    client: reqwest::Client,
    url: String,
    headers: MessageHeaders,
}

impl TaskUpdater {
    pub fn new(client: reqwest::Client, url: String, headers: MessageHeaders) -> Self {
        Self {
            client,
            url,
            headers,
        }
    }

    /// Send one status update. The identity header is mandatory; without it
    /// the callback is not legal to make.
    pub async fn update(
        &self,
        state: &str,
        status: &str,
        message: &str,
        output: Option<TaskOutput>,
    ) -> Result<()> {
        let Some(identity) = &self.headers.identity else {
            bail!("{X_RH_IDENTITY} is not set in the message headers");
        };

        let mut payload = json!({
            "state": state,
            "status": status,
            "message": message,
        });
        match output {
            Some(TaskOutput::Stats(stats)) => {
                payload["output"] = json!({ "stats": stats });
            }
            Some(TaskOutput::Errors(errors)) => {
                payload["output"] = json!({ "errors": errors });
            }
            None => {}
        }

        let mut request = self
            .client
            .patch(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(X_RH_IDENTITY, identity);
        if let Some(request_id) = &self.headers.request_id {
            request = request.header(X_RH_INSIGHTS_REQUEST_ID, request_id);
        }

        let response = request
            .body(payload.to_string())
            .send()
            .await
            .context("Error sending task update")?;

        if response.status() != StatusCode::NO_CONTENT {
            bail!(
                "Invalid HTTP status code from task update {}",
                response.status().as_u16()
            );
        }
        debug!(state, status, "Task updated");
        Ok(())
    }

    /// Like `update`, but a failed callback only logs: by the time we report,
    /// the job outcome is already decided.
    pub async fn report(&self, state: &str, status: &str, message: &str, output: Option<TaskOutput>) {
        if let Err(e) = self.update(state, status, message, output).await {
            error!(error = %e, "Error updating task");
        }
    }
}
