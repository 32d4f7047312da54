use crate::domain::SubscriberEmail;
use reqwest::{Client, Error};
use secrecy::{ExposeSecret, Secret};
use serde::Serialize;
use std::{collections::BTreeMap, time::Duration};
use uuid::Uuid;

/// HTTP client for the transactional email provider.
#[derive(Clone)]
pub struct EmailClient {
    http_client: Client,
    base_url: String,
    sender: SubscriberEmail,
    authorization_token: Secret<String>,
}

/// One message for one recipient.
#[derive(Debug)]
pub struct OutgoingEmail<'a> {
    pub recipient: &'a SubscriberEmail,
    pub subject: &'a str,
    pub html_content: &'a str,
    pub unsubscribe_url: &'a str,
    pub campaign_id: Option<Uuid>,
}

impl EmailClient {
    pub fn new(
        base_url: String,
        sender: SubscriberEmail,
        authorization_token: Secret<String>,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let http_client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http_client,
            base_url,
            sender,
            authorization_token,
        })
    }

    pub async fn send_email(&self, email: &OutgoingEmail<'_>) -> Result<(), Error> {
        let url = format!("{}/email", &self.base_url);
        let list_unsubscribe = format!("<{}>", email.unsubscribe_url);
        let request_body = SendEmailRequest {
            from: self.sender.as_ref(),
            to: email.recipient.as_ref(),
            subject: email.subject,
            html_body: email.html_content,
            headers: vec![
                Header {
                    name: "List-Unsubscribe",
                    value: &list_unsubscribe,
                },
                Header {
                    name: "List-Unsubscribe-Post",
                    value: "List-Unsubscribe=One-Click",
                },
            ],
            metadata: email
                .campaign_id
                .map(|id| BTreeMap::from([("campaign_id", id.to_string())]))
                .unwrap_or_default(),
        };

        self.http_client
            .post(&url)
            .header(
                "X-Postmark-Server-Token",
                self.authorization_token.expose_secret(),
            )
            .json(&request_body)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SendEmailRequest<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    html_body: &'a str,
    headers: Vec<Header<'a>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<&'static str, String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Header<'a> {
    name: &'static str,
    value: &'a str,
}
