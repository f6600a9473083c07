use tracing::info;

/// Outbound mail. Registration and email changes send an activation code
/// through this.
pub trait Mailer: Send + Sync {
    fn send_activation(&self, email: &str, code: &str) -> anyhow::Result<()>;
}

/// Writes activation mails to the log instead of delivering them.
#[derive(Debug, Default)]
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send_activation(&self, email: &str, code: &str) -> anyhow::Result<()> {
        info!("Activation code for {}: {}", email, code);
        Ok(())
    }
}
