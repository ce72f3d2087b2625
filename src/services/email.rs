use lettre::{
    Message, SmtpTransport, Transport,
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
};
use log::{info, error, warn};

pub struct EmailService;

impl EmailService {
    /// First contact with an employer: delivers the application for a job to
    /// the posting's contact address.
    pub async fn send_application_email(
        to: &str,
        applicant_name: &str,
        applicant_email: Option<&str>,
        job_title: &str,
        company: &str,
        message: Option<&str>,
    ) -> bool {
        match Self::try_send_application(to, applicant_name, applicant_email, job_title, company, message).await {
            Ok(_) => {
                info!("Application email for '{}' sent to {}", job_title, to);
                true
            }
            Err(e) => {
                error!("Failed to send application email to {}: {}", to, e);
                false
            }
        }
    }

    async fn try_send_application(
        to: &str,
        applicant_name: &str,
        applicant_email: Option<&str>,
        job_title: &str,
        company: &str,
        message: Option<&str>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let mail_user = crate::config::Config::mail_user();
        let mail_password = crate::config::Config::mail_password();

        if mail_user.is_empty() || mail_password.is_empty() {
            warn!("Email credentials not configured. Skipping email send.");
            return Err("Email not configured".into());
        }

        let from_mailbox: Mailbox = crate::config::Config::mail_from().parse()?;
        let to_mailbox: Mailbox = to.parse()?;

        let display_name = if applicant_name.is_empty() { "A JobWave candidate" } else { applicant_name };
        let note = message
            .filter(|m| !m.trim().is_empty())
            .map(|m| format!(r#"<div class="note"><p>{}</p></div>"#, m))
            .unwrap_or_default();

        let email_body = format!(
            r#"
            <!DOCTYPE html>
            <html>
            <head>
                <style>
                    body {{ font-family: Arial, sans-serif; line-height: 1.6; color: #333; }}
                    .container {{ max-width: 600px; margin: 0 auto; padding: 20px; }}
                    .header {{ background: linear-gradient(135deg, #2563eb 0%, #7c3aed 100%);
                              color: white; padding: 30px; text-align: center; border-radius: 10px 10px 0 0; }}
                    .content {{ background: #f9f9f9; padding: 30px; border-radius: 0 0 10px 10px; }}
                    .job-box {{ background: white; border: 2px dashed #2563eb; border-radius: 8px;
                               padding: 20px; text-align: center; margin: 20px 0; }}
                    .job-title {{ font-size: 24px; font-weight: bold; color: #2563eb; }}
                    .note {{ background: #eef2ff; border-left: 4px solid #2563eb; padding: 10px; margin: 20px 0; }}
                    .footer {{ text-align: center; margin-top: 20px; color: #666; font-size: 12px; }}
                </style>
            </head>
            <body>
                <div class="container">
                    <div class="header">
                        <h1>JobWave</h1>
                        <p>New Application Received</p>
                    </div>
                    <div class="content">
                        <p>Hello {} team,</p>
                        <p><strong>{}</strong> has applied through JobWave for the position:</p>

                        <div class="job-box">
                            <div class="job-title">{}</div>
                            <p style="margin: 10px 0 0 0; color: #666; font-size: 14px;">{}</p>
                        </div>

                        {}

                        <p>Reply to this email to reach the candidate directly.</p>

                        <p>Best regards,<br><strong>The JobWave Team</strong></p>
                    </div>
                    <div class="footer">
                        <p>© 2026 JobWave. All rights reserved.</p>
                    </div>
                </div>
            </body>
            </html>
            "#,
            company, display_name, job_title, company, note
        );

        let mut builder = Message::builder()
            .from(from_mailbox)
            .to(to_mailbox)
            .subject(format!("Application for {} at {}", job_title, company))
            .header(ContentType::TEXT_HTML);

        // Employer replies should land in the candidate's inbox, not ours.
        if let Some(reply_to) = applicant_email.filter(|e| !e.is_empty()) {
            builder = builder.reply_to(reply_to.parse()?);
        }

        let email_message = builder.body(email_body)?;

        let creds = Credentials::new(mail_user, mail_password);
        let mailer = SmtpTransport::relay(&crate::config::Config::mail_host())?
            .credentials(creds)
            .build();

        mailer.send(&email_message)?;
        Ok(())
    }

    /// Follow-up message to an employer the candidate has already applied to.
    pub async fn send_followup_email(
        to: &str,
        applicant_name: &str,
        applicant_email: Option<&str>,
        job_title: &str,
        company: &str,
        message: &str,
    ) -> bool {
        match Self::try_send_followup(to, applicant_name, applicant_email, job_title, company, message).await {
            Ok(_) => {
                info!("Follow-up email for '{}' sent to {}", job_title, to);
                true
            }
            Err(e) => {
                error!("Failed to send follow-up email: {}", e);
                false
            }
        }
    }

    async fn try_send_followup(
        to: &str,
        applicant_name: &str,
        applicant_email: Option<&str>,
        job_title: &str,
        company: &str,
        message: &str,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let mail_user = crate::config::Config::mail_user();
        let mail_password = crate::config::Config::mail_password();

        if mail_user.is_empty() || mail_password.is_empty() {
            return Err("Email not configured".into());
        }

        let display_name = if applicant_name.is_empty() { "A JobWave candidate" } else { applicant_name };

        let from_mailbox: Mailbox = crate::config::Config::mail_from().parse()?;
        let to_mailbox: Mailbox = to.parse()?;

        let email_body = format!(
            r#"
            <!DOCTYPE html>
            <html>
            <body>
                <h1>Follow-up on {}</h1>
                <p>Hello {} team,</p>
                <p><strong>{}</strong> has a message regarding their application:</p>
                <blockquote>{}</blockquote>
                <p>Reply to this email to reach the candidate directly.</p>
                <p>Best regards,<br><strong>The JobWave Team</strong></p>
            </body>
            </html>
            "#,
            job_title, company, display_name, message
        );

        let mut builder = Message::builder()
            .from(from_mailbox)
            .to(to_mailbox)
            .subject(format!("Following up on {} at {}", job_title, company))
            .header(ContentType::TEXT_HTML);

        if let Some(reply_to) = applicant_email.filter(|e| !e.is_empty()) {
            builder = builder.reply_to(reply_to.parse()?);
        }

        let email_message = builder.body(email_body)?;

        let creds = Credentials::new(mail_user, mail_password);
        let mailer = SmtpTransport::relay(&crate::config::Config::mail_host())?
            .credentials(creds)
            .build();

        mailer.send(&email_message)?;
        Ok(())
    }
}
