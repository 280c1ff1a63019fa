//! Notification service fanning a check-in out to SMS and email.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use rollcall_common::{Error, Result};

use crate::email::{EmailConfig, EmailSender, DEFAULT_FROM_EMAIL};
use crate::message;
use crate::notifier::{CheckInNotice, CheckInNotifier};
use crate::retry::{RetryConfig, RetryExecutor};
use crate::sms::{SmsConfig, SmsSender};

/// Channel configuration. A channel without credentials is disabled.
#[derive(Debug, Clone, Default)]
pub struct NotifyConfig {
    pub sms: Option<SmsConfig>,
    pub email: Option<EmailConfig>,
    pub retry: RetryConfig,
}

impl NotifyConfig {
    /// Assemble channel configuration from optional credential values.
    ///
    /// SMS needs both the username and the API key; email needs the API
    /// key and falls back to [`DEFAULT_FROM_EMAIL`] for the sender.
    pub fn from_credentials(
        sms_username: Option<String>,
        sms_api_key: Option<String>,
        email_api_key: Option<String>,
        from_email: Option<String>,
    ) -> Self {
        let present = |value: Option<String>| value.filter(|v| !v.trim().is_empty());

        let sms = match (present(sms_username), present(sms_api_key)) {
            (Some(username), Some(api_key)) => Some(SmsConfig { username, api_key }),
            _ => None,
        };
        let email = present(email_api_key).map(|api_key| EmailConfig {
            api_key,
            from: present(from_email).unwrap_or_else(|| DEFAULT_FROM_EMAIL.to_string()),
        });

        Self {
            sms,
            email,
            retry: RetryConfig::default(),
        }
    }
}

/// Delivers check-in confirmations over every configured channel.
pub struct NotificationService {
    sms: Option<SmsSender>,
    email: Option<EmailSender>,
    retry: RetryExecutor,
}

impl NotificationService {
    /// Create the service.
    ///
    /// # Errors
    /// - `Config` if an HTTP client cannot be built
    pub fn new(config: NotifyConfig) -> Result<Self> {
        let sms = match config.sms {
            Some(sms) => {
                info!("SMS channel enabled for account {}", sms.username);
                Some(SmsSender::new(sms)?)
            }
            None => {
                warn!("SMS credentials not fully set; SMS channel disabled");
                None
            }
        };
        let email = match config.email {
            Some(email) => {
                info!("Email channel enabled, sending as {}", email.from);
                Some(EmailSender::new(email)?)
            }
            None => {
                warn!("Email API key not set; email channel disabled");
                None
            }
        };

        Ok(Self {
            sms,
            email,
            retry: RetryExecutor::new(config.retry),
        })
    }

    /// Whether the SMS channel is enabled.
    pub fn sms_enabled(&self) -> bool {
        self.sms.is_some()
    }

    /// Whether the email channel is enabled.
    pub fn email_enabled(&self) -> bool {
        self.email.is_some()
    }

    async fn send_sms(&self, notice: &CheckInNotice) -> Result<()> {
        let Some(sender) = &self.sms else {
            return Ok(());
        };
        let Some(phone) = notice.user.phone.as_deref() else {
            debug!("No phone number for user {}; skipping SMS", notice.user.id);
            return Ok(());
        };
        let text = message::sms_text(notice);
        self.retry.execute(|| sender.send(phone, &text)).await?;
        info!("Check-in SMS sent to user {}", notice.user.id);
        Ok(())
    }

    async fn send_email(&self, notice: &CheckInNotice) -> Result<()> {
        let Some(sender) = &self.email else {
            return Ok(());
        };
        let Some(email) = notice.user.email.as_deref() else {
            debug!("No email address for user {}; skipping email", notice.user.id);
            return Ok(());
        };
        let subject = message::email_subject(notice);
        let html = message::email_html(notice);
        self.retry
            .execute(|| sender.send(email, &subject, &html))
            .await?;
        info!("Check-in email sent to user {}", notice.user.id);
        Ok(())
    }
}

#[async_trait]
impl CheckInNotifier for NotificationService {
    async fn notify_checkin(&self, notice: &CheckInNotice) -> Result<()> {
        debug!(
            "Sending check-in notifications for user {}, session {}",
            notice.user.id, notice.session.id
        );
        let (sms, email) = futures::join!(self.send_sms(notice), self.send_email(notice));

        let failures: Vec<String> = [("sms", sms), ("email", email)]
            .into_iter()
            .filter_map(|(channel, result)| result.err().map(|e| format!("{channel}: {e}")))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Network(failures.join("; ")))
        }
    }
}
