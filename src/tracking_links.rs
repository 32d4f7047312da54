use anyhow::Context;
use reqwest::Url;
use uuid::Uuid;

/// Builds the public URLs the engine embeds in outgoing mail.
#[derive(Clone, Debug)]
pub struct TrackingLinks {
    base_url: Url,
}

impl TrackingLinks {
    pub fn new(base_url: &str) -> Result<Self, anyhow::Error> {
        let base_url = Url::parse(base_url).context("Failed to parse application base url")?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("`{base_url}` cannot be used as a base url");
        }
        Ok(Self { base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn open(&self, campaign_id: Uuid, email: &str) -> Url {
        let mut url = self.endpoint(&["track", "open", &campaign_id.to_string()]);
        url.query_pairs_mut().append_pair("email", email);
        url
    }

    pub fn click(&self, campaign_id: Uuid, link_index: usize, destination: &str, email: &str) -> Url {
        let mut url = self.endpoint(&[
            "track",
            "click",
            &campaign_id.to_string(),
            &link_index.to_string(),
        ]);
        url.query_pairs_mut()
            .append_pair("url", destination)
            .append_pair("email", email);
        url
    }

    pub fn unsubscribe(&self, email: &str, campaign_id: Option<Uuid>) -> Url {
        let mut url = self.endpoint(&["unsubscribe"]);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("email", email);
            if let Some(campaign_id) = campaign_id {
                query.append_pair("campaign", &campaign_id.to_string());
            }
        }
        url
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        url.set_query(None);
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}
