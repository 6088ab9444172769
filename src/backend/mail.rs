//! Mail client used when no system mail integration is available.

use super::{DomainResult, MailClient};
use crate::error::DomainError;
use crate::types::{EmailMessage, MailResult};

#[derive(Debug, Clone, Copy, Default)]
pub struct NoMailClient;

impl MailClient for NoMailClient {
    fn can_load(&self, _client_name: Option<&str>) -> bool {
        false
    }

    fn send(&self, message: &EmailMessage) -> DomainResult<MailResult> {
        Err(DomainError::MailUnavailable(format!(
            "no mail client is configured to send '{}'",
            message.subject
        )))
    }
}
