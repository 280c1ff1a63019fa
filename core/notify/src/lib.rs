//! Check-in notifications for Rollcall.
//!
//! This module provides:
//! - The `CheckInNotifier` collaborator trait and a no-op implementation
//! - SMS delivery through Africa's Talking
//! - Email delivery through Resend
//! - Retry with exponential backoff for transient delivery failures

mod http;
pub mod email;
pub mod message;
pub mod notifier;
pub mod retry;
pub mod service;
pub mod sms;

pub use email::{EmailConfig, EmailSender, DEFAULT_FROM_EMAIL};
pub use notifier::{CheckInNotice, CheckInNotifier, NoopNotifier};
pub use retry::{RetryConfig, RetryExecutor};
pub use service::{NotificationService, NotifyConfig};
pub use sms::{SmsConfig, SmsSender};
