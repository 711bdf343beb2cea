//! Operator notification by mail

use crate::config::MailConfig;
use crate::error::{Result, TapeBackupError};
use crate::shell::CommandRunner;
use async_trait::async_trait;
use tracing::{debug, info};

const SUBJECT_PREFIX: &str = "Tape Backup";

#[async_trait]
pub trait Notifier: Send + Sync {
    /// `subject` is the status part; implementations add their own prefix
    async fn notify(&self, subject: &str, body: &str) -> Result<()>;
}

/// Pipes a plaintext message into `sendmail -t`
pub struct SendmailNotifier {
    runner: CommandRunner,
    config: MailConfig,
}

impl SendmailNotifier {
    pub fn new(runner: CommandRunner, config: MailConfig) -> Self {
        Self { runner, config }
    }

    pub fn message(&self, subject: &str, body: &str) -> String {
        format!(
            "From: {from}\nTo: {to}\nSubject: {prefix} {subject}\nContent-Type: text/plain; charset=utf-8\n\n{body}\n",
            from = self.config.from,
            to = self.config.to,
            prefix = SUBJECT_PREFIX,
            subject = subject,
            body = body
        )
    }
}

#[async_trait]
impl Notifier for SendmailNotifier {
    async fn notify(&self, subject: &str, body: &str) -> Result<()> {
        if !self.config.enabled {
            info!("Mail disabled, not sending '{} {}'", SUBJECT_PREFIX, subject);
            return Ok(());
        }

        let program = self.config.sendmail.to_string_lossy().to_string();
        let from = self.config.from.as_str();
        let output = self
            .runner
            .run_with_input(
                &program,
                &["-F", from, "-f", from, "-t"],
                &self.message(subject, body),
            )
            .await?;
        debug!("Mail result: {:?}", output);

        if !output.success() {
            return Err(TapeBackupError::notification(format!(
                "{} failed: {}",
                output.command,
                output.diagnostic()
            )));
        }
        info!("Sent notification '{} {}' to {}", SUBJECT_PREFIX, subject, self.config.to);
        Ok(())
    }
}
