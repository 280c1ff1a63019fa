//! Confirmation message texts.

use crate::notifier::CheckInNotice;

/// Text of the confirmation SMS.
pub fn sms_text(notice: &CheckInNotice) -> String {
    format!(
        "Hello {}, your check-in for {} - {} is confirmed. Thank you!",
        notice.user.name, notice.event.name, notice.session.name
    )
}

/// Subject line of the confirmation email.
pub fn email_subject(notice: &CheckInNotice) -> String {
    format!("Your Check-in Confirmation for {}", notice.event.name)
}

/// HTML body of the confirmation email.
pub fn email_html(notice: &CheckInNotice) -> String {
    format!(
        "<h1>Check-in Confirmed!</h1>\
         <p>Hello {},</p>\
         <p>Your check-in to <strong>{}</strong> (Session: {}) at {} has been confirmed.</p>\
         <p>Thank you for attending!</p>",
        escape_html(&notice.user.name),
        escape_html(&notice.event.name),
        escape_html(&notice.session.name),
        notice.check_in_time.format("%Y-%m-%d %H:%M UTC"),
    )
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rollcall_common::{Event, EventId, FallbackId, Session, SessionId, User, UserId};

    pub(crate) fn notice(name: &str, phone: Option<&str>, email: Option<&str>) -> CheckInNotice {
        let at = Utc.with_ymd_and_hms(2025, 3, 14, 9, 30, 0).unwrap();
        CheckInNotice {
            user: User {
                id: UserId(1),
                external_auth_id: None,
                name: name.to_string(),
                phone: phone.map(str::to_string),
                email: email.map(str::to_string),
                fallback_id: FallbackId::generate(),
                fingerprint_template_1: None,
                fingerprint_template_2: None,
                created_at: at,
                updated_at: at,
            },
            session: Session {
                id: SessionId(2),
                event_id: EventId(3),
                name: "Keynote".to_string(),
                start_time: at,
                end_time: at,
            },
            event: Event {
                id: EventId(3),
                name: "DevFest Nairobi".to_string(),
                start_date: at,
                end_date: at,
            },
            check_in_time: at,
        }
    }

    #[test]
    fn test_sms_text() {
        assert_eq!(
            sms_text(&notice("Wanjiru", Some("+254700000001"), None)),
            "Hello Wanjiru, your check-in for DevFest Nairobi - Keynote is confirmed. Thank you!"
        );
    }

    #[test]
    fn test_email_subject_and_body() {
        let notice = notice("Wanjiru", None, Some("w@example.com"));
        assert_eq!(
            email_subject(&notice),
            "Your Check-in Confirmation for DevFest Nairobi"
        );
        let html = email_html(&notice);
        assert!(html.contains("<strong>DevFest Nairobi</strong>"));
        assert!(html.contains("(Session: Keynote)"));
        assert!(html.contains("2025-03-14 09:30 UTC"));
    }

    #[test]
    fn test_email_body_escapes_names() {
        let html = email_html(&notice("<script>", None, Some("x@example.com")));
        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;"));
    }
}
