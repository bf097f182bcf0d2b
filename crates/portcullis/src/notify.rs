//! Lockout notifications.
//!
//! Delivery is fire-and-forget: [`dispatch`] spawns the send on its own task
//! with a timeout, and any failure ends in a log line. A broken transport can
//! never hold up or fail a login request.

use async_trait::async_trait;
use portcullis_common::{PortcullisError, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Out-of-band message transport
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn notify(&self, address: &str, subject: &str, body: &str) -> Result<()>;
}

/// Writes notices to the log instead of sending them
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, address: &str, subject: &str, body: &str) -> Result<()> {
        tracing::info!(to = %address, subject = %subject, body = %body, "Lockout notice");
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    address: &'a str,
    subject: &'a str,
    body: &'a str,
}

/// POSTs notices as JSON to a mail relay
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PortcullisError::Config(format!("webhook client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, address: &str, subject: &str, body: &str) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&WebhookPayload {
                address,
                subject,
                body,
            })
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| PortcullisError::Notify(e.to_string()))?;
        Ok(())
    }
}

/// A lockout event ready to be sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockoutNotice {
    pub address: String,
    pub subject: String,
    pub body: String,
}

impl LockoutNotice {
    pub fn new(address: &str, site_name: &str, attempts: u32, lockout_minutes: u64) -> Self {
        Self {
            address: address.to_string(),
            subject: format!("[{}] Portcullis: IP Locked Out", site_name),
            body: format!(
                "An IP address has been locked out after {} failed login attempts. Lockout duration: {} minutes.",
                attempts, lockout_minutes
            ),
        }
    }
}

/// Send a notice in the background; errors and timeouts are logged only
pub fn dispatch(notifier: Arc<dyn Notifier>, notice: LockoutNotice, timeout: Duration) {
    tokio::spawn(async move {
        let send = notifier.notify(&notice.address, &notice.subject, &notice.body);
        match tokio::time::timeout(timeout, send).await {
            Ok(Ok(())) => {
                tracing::debug!(subject = %notice.subject, "Lockout notice delivered");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Lockout notice failed");
            }
            Err(_) => {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "Lockout notice timed out");
            }
        }
    });
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::sync::mpsc;

    /// Forwards every notice to a channel
    pub struct ChannelNotifier(pub mpsc::UnboundedSender<LockoutNotice>);

    #[async_trait]
    impl Notifier for ChannelNotifier {
        async fn notify(&self, address: &str, subject: &str, body: &str) -> Result<()> {
            let _ = self.0.send(LockoutNotice {
                address: address.to_string(),
                subject: subject.to_string(),
                body: body.to_string(),
            });
            Ok(())
        }
    }

    /// Always fails
    pub struct BrokenNotifier;

    #[async_trait]
    impl Notifier for BrokenNotifier {
        async fn notify(&self, _: &str, _: &str, _: &str) -> Result<()> {
            Err(PortcullisError::Notify("smtp relay down".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_notice_text() {
        let notice = LockoutNotice::new("admin@example.com", "My Blog", 5, 10);
        assert_eq!(notice.subject, "[My Blog] Portcullis: IP Locked Out");
        assert_eq!(
            notice.body,
            "An IP address has been locked out after 5 failed login attempts. Lockout duration: 10 minutes."
        );
    }

    #[tokio::test]
    async fn test_dispatch_delivers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notice = LockoutNotice::new("admin@example.com", "Site", 3, 1);

        dispatch(Arc::new(ChannelNotifier(tx)), notice.clone(), Duration::from_secs(1));

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, notice);
    }

    #[tokio::test]
    async fn test_dispatch_swallows_failure() {
        dispatch(
            Arc::new(BrokenNotifier),
            LockoutNotice::new("admin@example.com", "Site", 3, 1),
            Duration::from_millis(100),
        );
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        tokio_test::assert_ok!(LogNotifier.notify("a@example.com", "s", "b").await);
    }
}
