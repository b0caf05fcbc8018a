pub mod dingtalk;
pub mod email;
pub mod slack;
pub mod sms;
pub mod webhook;

use crate::error::{NotifyError, Result};
use crate::utils::{truncate_string, MAX_BODY_LENGTH};

/// Maps a non-success HTTP response to [`NotifyError::ApiError`].
pub(crate) async fn check_response(service: &str, resp: reqwest::Response) -> Result<String> {
    let status = resp.status();
    let body = match resp.text().await {
        Ok(text) => truncate_string(&text, MAX_BODY_LENGTH),
        Err(e) => format!("[failed to read response body: {e}]"),
    };
    if status.is_success() {
        Ok(body)
    } else {
        Err(NotifyError::ApiError {
            service: service.to_string(),
            status: status.as_u16(),
            body,
        })
    }
}
