use linkify::{LinkFinder, LinkKind};
use mailcast::{
    configuration::{get_configuration, DatabaseSettings, Settings, StoreBackend},
    domain::{Subscriber, SubscriberEmail},
    startup::{get_connection_pool, Application},
    store::{MemoryStore, PgStore, Store},
    telemetry::{get_subscriber, init_subscriber},
};
use once_cell::sync::Lazy;
use reqwest::{redirect::Policy, Client, Response, Url};
use serde_json::Value;
use sqlx::{Connection, Executor, PgConnection, PgPool};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use uuid::Uuid;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

static TRACING: Lazy<()> = Lazy::new(|| {
    let name = "test";
    let default_env_filter = "info";
    if std::env::var("TEST_LOG").is_ok() {
        let subscriber = get_subscriber(name.into(), default_env_filter.into(), std::io::stdout);
        init_subscriber(subscriber);
    } else {
        let subscriber = get_subscriber(name.into(), default_env_filter.into(), std::io::sink);
        init_subscriber(subscriber);
    }
});

static FAILED_TO_EXECUTE_REQUEST: &str = "Failed to execute request";

pub const BASE_URL: &str = "https://shop.example.com";

pub struct TestApp {
    pub address: SocketAddr,
    pub store: Arc<dyn Store>,
    pub email_server: MockServer,
    client: Client,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    pub async fn spawn_with(customize: impl FnOnce(&mut Settings)) -> Self {
        Self::spawn_on(StoreBackend::Memory, customize).await
    }

    /// Same as `spawn`, backed by a fresh, migrated Postgres database.
    pub async fn spawn_on_postgres() -> Self {
        Self::spawn_on(StoreBackend::Postgres, |_| {}).await
    }

    async fn spawn_on(backend: StoreBackend, customize: impl FnOnce(&mut Settings)) -> Self {
        Lazy::force(&TRACING);

        let email_server = MockServer::start().await;
        let mut config = get_configuration().expect("Failed to read configuration");
        config.application.port = 0;
        config.application.base_url = BASE_URL.into();
        config.database.backend = backend;
        config.database.database_name = Uuid::new_v4().to_string();
        config.email_client.base_url = email_server.uri();
        config.email_client.timeout_milliseconds = 500;
        config.delivery.concurrency = 4;
        customize(&mut config);

        let store: Arc<dyn Store> = match backend {
            StoreBackend::Postgres => Arc::new(PgStore::new(configure_database(&config.database).await)),
            StoreBackend::Memory => Arc::new(MemoryStore::default()),
        };
        let app = Application::build_with_store(config, Arc::clone(&store))
            .await
            .expect("Failed to build application");
        let address = app.local_addr();

        tokio::spawn(app.run_until_stopped());

        Self {
            address,
            store,
            email_server,
            client: Client::builder()
                .redirect(Policy::none())
                .build()
                .expect("Failed to build http client"),
        }
    }

    pub async fn add_subscriber(&self, email: &str) -> Uuid {
        self.add_subscriber_with(email, None, &[]).await
    }

    pub async fn add_subscriber_with(&self, email: &str, source: Option<&str>, tags: &[&str]) -> Uuid {
        let subscriber = Subscriber::new(
            SubscriberEmail::parse(email.into()).expect("Invalid test email"),
            source.map(Into::into),
            tags.iter().map(|t| t.to_string()).collect(),
        );
        self.store
            .insert_subscriber(&subscriber)
            .await
            .expect("Failed to insert subscriber");
        subscriber.id
    }

    pub async fn accept_all_email(&self) {
        Mock::given(path("/email"))
            .and(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&self.email_server)
            .await;
    }

    /// Creates a campaign and returns its id.
    pub async fn create_campaign(&self, body: &Value) -> Uuid {
        let response = self.post_json("/admin/campaigns", body).await;
        assert_eq!(response.status().as_u16(), 201);
        let campaign: Value = response.json().await.expect("Invalid campaign json");
        campaign["id"]
            .as_str()
            .and_then(|id| Uuid::parse_str(id).ok())
            .expect("Campaign has no id")
    }

    pub async fn get_campaign(&self, id: Uuid) -> Value {
        self.get(&format!("/admin/campaigns/{id}"))
            .await
            .json()
            .await
            .expect("Invalid campaign json")
    }

    /// Polls until background delivery has written a terminal status.
    pub async fn wait_for_delivery(&self, id: Uuid) -> Value {
        for _ in 0..200 {
            let campaign = self.get_campaign(id).await;
            if campaign["status"] != "sending" {
                return campaign;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("Campaign {id} is still sending");
    }

    pub async fn send_campaign(&self, id: Uuid) -> Response {
        self.post_empty(&format!("/admin/campaigns/{id}/send")).await
    }

    pub async fn get_health_check(&self) -> Response {
        self.get("/health_check").await
    }

    pub async fn get(&self, endpoint: &str) -> Response {
        self.client
            .get(self.url(endpoint))
            .send()
            .await
            .expect(FAILED_TO_EXECUTE_REQUEST)
    }

    pub async fn get_url(&self, url: &str) -> Response {
        self.client
            .get(url)
            .send()
            .await
            .expect(FAILED_TO_EXECUTE_REQUEST)
    }

    pub async fn post_json(&self, endpoint: &str, body: &Value) -> Response {
        self.client
            .post(self.url(endpoint))
            .json(body)
            .send()
            .await
            .expect(FAILED_TO_EXECUTE_REQUEST)
    }

    pub async fn post_empty(&self, endpoint: &str) -> Response {
        self.client
            .post(self.url(endpoint))
            .send()
            .await
            .expect(FAILED_TO_EXECUTE_REQUEST)
    }

    pub async fn post_webhook(&self, body: &str, secret: Option<&str>) -> Response {
        let mut request = self
            .client
            .post(self.url("/webhooks/email"))
            .header("Content-Type", "application/json")
            .body(body.to_owned());
        if let Some(secret) = secret {
            request = request.header("X-Webhook-Secret", secret);
        }
        request.send().await.expect(FAILED_TO_EXECUTE_REQUEST)
    }

    pub async fn put_json(&self, endpoint: &str, body: &Value) -> Response {
        self.client
            .put(self.url(endpoint))
            .json(body)
            .send()
            .await
            .expect(FAILED_TO_EXECUTE_REQUEST)
    }

    pub async fn delete(&self, endpoint: &str) -> Response {
        self.client
            .delete(self.url(endpoint))
            .send()
            .await
            .expect(FAILED_TO_EXECUTE_REQUEST)
    }

    /// HTML bodies of every email the gateway received, in arrival order.
    pub async fn sent_emails(&self) -> Vec<SentEmail> {
        self.email_server
            .received_requests()
            .await
            .expect("Request recording is disabled")
            .iter()
            .map(|request| {
                let body: Value = serde_json::from_slice(&request.body).expect("Invalid email json");
                SentEmail {
                    to: body["To"].as_str().unwrap_or_default().to_owned(),
                    subject: body["Subject"].as_str().unwrap_or_default().to_owned(),
                    html: body["HtmlBody"].as_str().unwrap_or_default().to_owned(),
                }
            })
            .collect()
    }

    /// Tracking links point at the public base URL; this rewrites them onto
    /// the running test server.
    pub fn local_link(&self, link: &Url) -> String {
        let mut url = link.clone();
        url.set_scheme("http").expect("Failed to set scheme");
        url.set_host(Some(&self.address.ip().to_string()))
            .expect("Failed to set host");
        url.set_port(Some(self.address.port()))
            .expect("Failed to set port");
        url.to_string()
    }

    fn url(&self, endpoint: &str) -> String {
        format!("http://{}{endpoint}", self.address)
    }
}

pub async fn configure_database(configuration: &DatabaseSettings) -> PgPool {
    let mut conn = PgConnection::connect_with(&configuration.without_db())
        .await
        .expect("Failed to connect to Postgres");

    conn.execute(format!(r#"CREATE DATABASE "{}";"#, configuration.database_name).as_str())
        .await
        .expect("Failed to create database");

    let pool = get_connection_pool(configuration);

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to migrate database");

    pool
}

pub struct SentEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
}

impl SentEmail {
    pub fn links(&self) -> Vec<Url> {
        let mut finder = LinkFinder::new();
        finder.kinds(&[LinkKind::Url]);
        finder
            .links(&self.html)
            .filter_map(|l| Url::parse(l.as_str()).ok())
            .collect()
    }

    pub fn link_with_path_prefix(&self, prefix: &str) -> Url {
        self.links()
            .into_iter()
            .find(|l| l.path().starts_with(prefix))
            .unwrap_or_else(|| panic!("No link under {prefix} in {}", self.html))
    }
}

pub fn campaign_body() -> Value {
    serde_json::json!({
        "subject": "Spring sale",
        "preheader": "Everything 20% off",
        "content": { "blocks": [] },
        "html_content": "<html><body><p>Hi!</p><a href=\"https://shop.example.com/sale\">Shop now</a><a href=\"{{unsubscribe_url}}\">Unsubscribe</a></body></html>",
    })
}
